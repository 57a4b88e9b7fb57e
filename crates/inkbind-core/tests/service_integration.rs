//! End-to-end tests for the control task: session sharing, deploy cycles,
//! and notification marshaling, driven through the public handle against
//! the fake engine.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use inkbind_config::AppConfig;
use inkbind_core::{
    AdapterService, ContextId, DeployPhase, KeyEvent, ProgramId, SchemaId, ServiceHandle,
    SessionId, Update,
};
use inkbind_test_utils::config::{TestConfigBuilder, TestConfigFile};
use inkbind_test_utils::engine::FakeEngine;
use inkbind_test_utils::tracing_setup::init_test_tracing;

fn start(
    config: AppConfig,
    engine: FakeEngine,
) -> (
    ServiceHandle,
    broadcast::Receiver<Update>,
    JoinHandle<()>,
) {
    init_test_tracing();
    let (service, handle) = AdapterService::new(config, Box::new(engine));
    let updates = handle.subscribe_updates();
    let task = tokio::spawn(service.run());
    (handle, updates, task)
}

async fn next_update(updates: &mut broadcast::Receiver<Update>) -> Update {
    timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("timed out waiting for update")
        .expect("update bus closed")
}

/// Wait for a deploy notice whose body contains `needle`, skipping other
/// updates (the auto-deploy thread races the command stream).
async fn await_deploy_notice(updates: &mut broadcast::Receiver<Update>, needle: &str) {
    loop {
        if let Update::Notice { kind, body } = next_update(updates).await {
            if kind == "deploy" && body.contains(needle) {
                return;
            }
        }
    }
}

async fn shutdown(handle: ServiceHandle, task: JoinHandle<()>) {
    handle.shutdown().await.expect("shutdown");
    task.await.expect("service task panicked");
}

#[tokio::test]
async fn test_key_events_reach_a_lazily_created_session() {
    let engine = FakeEngine::new();
    let probe = engine.probe();
    let (handle, _updates, task) = start(TestConfigBuilder::new().build(), engine);

    handle
        .context_created(ContextId(1), ProgramId::from("editor"))
        .await
        .unwrap();
    let consumed = handle
        .key_event(ContextId(1), KeyEvent::press(30))
        .await
        .unwrap();

    assert!(consumed);
    assert_eq!(probe.created(), 1);
    assert_eq!(probe.keys(SessionId(1)), vec![30]);

    shutdown(handle, task).await;
}

#[tokio::test]
async fn test_deploy_round_trip_restores_options_and_replays_keys() {
    let engine = FakeEngine::new();
    let probe = engine.probe();
    probe.manual_deploy();
    let config = TestConfigBuilder::new().policy("program").build();
    let (handle, mut updates, task) = start(config, engine);

    handle
        .context_created(ContextId(1), ProgramId::from("editor"))
        .await
        .unwrap();
    handle.activate(ContextId(1)).await.unwrap();
    handle
        .set_option(ContextId(1), "ascii_mode", true)
        .await
        .unwrap();
    match next_update(&mut updates).await {
        Update::OptionChanged {
            context,
            name,
            value,
        } => {
            assert_eq!(context, ContextId(1));
            assert_eq!(name, "ascii_mode");
            assert!(value);
        }
        other => panic!("expected option update, got {other:?}"),
    }

    handle.deploy(false).await.unwrap();
    await_deploy_notice(&mut updates, "maintenance").await;
    assert_eq!(probe.live_sessions(), 0);

    // Typed mid-rebuild: buffered, reported as consumed.
    assert!(handle
        .key_event(ContextId(1), KeyEvent::press(42))
        .await
        .unwrap());

    probe.complete_deploy(true);
    await_deploy_notice(&mut updates, "ready").await;

    // The session came back under a fresh engine id, with the user's
    // toggle intact and the buffered key replayed into it.
    assert_eq!(probe.live_sessions(), 1);
    assert_eq!(probe.option(SessionId(2), "ascii_mode"), Some(true));
    assert_eq!(probe.keys(SessionId(2)), vec![42]);

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.deploy_phase, DeployPhase::Idle);
    assert_eq!(stats.live_sessions, 1);

    shutdown(handle, task).await;
}

#[tokio::test]
async fn test_failed_deploy_empties_pool_and_drops_buffered_keys() {
    let engine = FakeEngine::new();
    let probe = engine.probe();
    probe.manual_deploy();
    let (handle, mut updates, task) = start(TestConfigBuilder::new().build(), engine);

    handle
        .context_created(ContextId(1), ProgramId::from("editor"))
        .await
        .unwrap();
    handle.activate(ContextId(1)).await.unwrap();
    handle
        .set_option(ContextId(1), "ascii_mode", true)
        .await
        .unwrap();
    let _ = next_update(&mut updates).await;

    handle.deploy(true).await.unwrap();
    await_deploy_notice(&mut updates, "maintenance").await;
    assert!(handle
        .key_event(ContextId(1), KeyEvent::press(42))
        .await
        .unwrap());

    probe.complete_deploy(false);
    await_deploy_notice(&mut updates, "failed").await;

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.deploy_phase, DeployPhase::Idle);
    assert_eq!(stats.live_sessions, 0);

    // The next key starts over: fresh session, default options, and the
    // buffered key from the failed cycle is gone.
    assert!(handle
        .key_event(ContextId(1), KeyEvent::press(50))
        .await
        .unwrap());
    assert_eq!(probe.option(SessionId(2), "ascii_mode"), None);
    assert_eq!(probe.keys(SessionId(2)), vec![50]);

    shutdown(handle, task).await;
}

#[tokio::test]
async fn test_deploy_requests_coalesce_into_one_cycle() {
    let engine = FakeEngine::new();
    let probe = engine.probe();
    probe.manual_deploy();
    let (handle, mut updates, task) = start(TestConfigBuilder::new().build(), engine);

    handle.deploy(false).await.unwrap();
    handle.deploy(false).await.unwrap();
    handle.deploy(true).await.unwrap();

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.deploy_phase, DeployPhase::Redeploying);
    assert_eq!(probe.deploys(), 1);

    probe.complete_deploy(true);
    await_deploy_notice(&mut updates, "ready").await;
    assert_eq!(handle.stats().await.unwrap().deploy_phase, DeployPhase::Idle);
    assert_eq!(probe.deploys(), 1);

    shutdown(handle, task).await;
}

#[tokio::test]
async fn test_notifications_from_engine_thread_arrive_in_order() {
    let engine = FakeEngine::new();
    let probe = engine.probe();
    let (handle, mut updates, task) = start(TestConfigBuilder::new().build(), engine);

    handle
        .context_created(ContextId(1), ProgramId::from("editor"))
        .await
        .unwrap();
    handle.activate(ContextId(1)).await.unwrap();
    // Barrier: the activate above has been processed.
    handle.stats().await.unwrap();

    let raiser = probe.clone();
    std::thread::spawn(move || {
        raiser.raise(SessionId(1), "option", "ascii_mode");
        raiser.raise(SessionId(1), "schema", "pinyin");
        raiser.raise(SessionId(1), "error", "backend hiccup");
    })
    .join()
    .unwrap();

    assert!(matches!(
        next_update(&mut updates).await,
        Update::OptionChanged { name, value: true, .. } if name == "ascii_mode"
    ));
    assert!(matches!(
        next_update(&mut updates).await,
        Update::SchemaChanged { schema, .. } if schema == SchemaId::from("pinyin")
    ));
    assert!(matches!(
        next_update(&mut updates).await,
        Update::Notice { kind, .. } if kind == "error"
    ));

    shutdown(handle, task).await;
}

#[tokio::test]
async fn test_stale_notifications_are_dropped() {
    let engine = FakeEngine::new();
    let probe = engine.probe();
    let (handle, mut updates, task) = start(TestConfigBuilder::new().build(), engine);

    handle
        .context_created(ContextId(1), ProgramId::from("editor"))
        .await
        .unwrap();
    handle.activate(ContextId(1)).await.unwrap();
    handle.stats().await.unwrap();

    // A notification for a session that no longer exists must vanish
    // without reaching the host.
    probe.raise(SessionId(99), "option", "ascii_mode");
    probe.raise(SessionId(1), "schema", "pinyin");

    assert!(matches!(
        next_update(&mut updates).await,
        Update::SchemaChanged { .. }
    ));

    shutdown(handle, task).await;
}

#[tokio::test]
async fn test_post_deploy_silence_suppresses_noise_but_not_schema_selection() {
    let engine = FakeEngine::new();
    let probe = engine.probe();
    let (handle, mut updates, task) = start(TestConfigBuilder::new().build(), engine);

    handle
        .context_created(ContextId(1), ProgramId::from("editor"))
        .await
        .unwrap();
    handle.activate(ContextId(1)).await.unwrap();

    // Auto deploy succeeds on its own and arms the silence window.
    handle.deploy(false).await.unwrap();
    await_deploy_notice(&mut updates, "ready").await;

    // This burst is exactly what the silence window exists for.
    probe.raise(SessionId(2), "option", "ascii_mode");

    // A manual schema switch must still get feedback through.
    handle
        .select_schema(ContextId(1), SchemaId::from("pinyin"))
        .await
        .unwrap();

    match next_update(&mut updates).await {
        Update::SchemaChanged { context, schema } => {
            assert_eq!(context, ContextId(1));
            assert_eq!(schema, SchemaId::from("pinyin"));
        }
        other => panic!("expected schema update, got {other:?}"),
    }
    assert_eq!(probe.schema(SessionId(2)), Some(SchemaId::from("pinyin")));

    shutdown(handle, task).await;
}

#[tokio::test]
async fn test_engine_reported_option_survives_sync() {
    let engine = FakeEngine::new();
    let probe = engine.probe();
    let (handle, mut updates, task) = start(TestConfigBuilder::new().build(), engine);

    handle
        .context_created(ContextId(1), ProgramId::from("editor"))
        .await
        .unwrap();
    handle.activate(ContextId(1)).await.unwrap();
    handle.stats().await.unwrap();

    // The engine toggled an option by itself (e.g. a key binding handled
    // inside the engine); the pool must have recorded it.
    probe.raise(SessionId(1), "option", "ascii_mode");
    assert!(matches!(
        next_update(&mut updates).await,
        Update::OptionChanged { value: true, .. }
    ));

    handle.sync(false).await.unwrap();
    assert_eq!(handle.stats().await.unwrap().live_sessions, 0);
    assert_eq!(probe.syncs(), 1);

    // Recreated lazily with the recorded toggle reapplied.
    assert!(handle
        .key_event(ContextId(1), KeyEvent::press(30))
        .await
        .unwrap());
    assert_eq!(probe.option(SessionId(2), "ascii_mode"), Some(true));

    shutdown(handle, task).await;
}

#[tokio::test]
async fn test_shared_session_fans_updates_to_all_members() {
    let engine = FakeEngine::new();
    let probe = engine.probe();
    let config = TestConfigBuilder::new().policy("program").build();
    let (handle, mut updates, task) = start(config, engine);

    for id in [1, 2] {
        handle
            .context_created(ContextId(id), ProgramId::from("editor"))
            .await
            .unwrap();
        handle.activate(ContextId(id)).await.unwrap();
    }
    handle.stats().await.unwrap();
    assert_eq!(probe.created(), 1);

    // Leading '!' encodes the off state.
    probe.raise(SessionId(1), "option", "!ascii_mode");

    let mut seen = Vec::new();
    for _ in 0..2 {
        match next_update(&mut updates).await {
            Update::OptionChanged {
                context,
                name,
                value,
            } => {
                assert_eq!(name, "ascii_mode");
                assert!(!value);
                seen.push(context);
            }
            other => panic!("expected option update, got {other:?}"),
        }
    }
    seen.sort();
    assert_eq!(seen, vec![ContextId(1), ContextId(2)]);

    shutdown(handle, task).await;
}

#[tokio::test]
async fn test_failed_session_creation_latches_context() {
    let engine = FakeEngine::new();
    let probe = engine.probe();
    probe.fail_next_creates(1);
    let (handle, _updates, task) = start(TestConfigBuilder::new().build(), engine);

    handle
        .context_created(ContextId(1), ProgramId::from("editor"))
        .await
        .unwrap();

    // First key fails to create a session; later keys are dropped without
    // hammering the engine again.
    assert!(!handle
        .key_event(ContextId(1), KeyEvent::press(30))
        .await
        .unwrap());
    assert!(!handle
        .key_event(ContextId(1), KeyEvent::press(31))
        .await
        .unwrap());
    assert_eq!(probe.created(), 0);
    assert_eq!(handle.stats().await.unwrap().sessionless_contexts, 1);

    // A different context is unaffected.
    handle
        .context_created(ContextId(2), ProgramId::from("editor"))
        .await
        .unwrap();
    assert!(handle
        .key_event(ContextId(2), KeyEvent::press(30))
        .await
        .unwrap());

    shutdown(handle, task).await;
}

#[tokio::test]
async fn test_config_reload_from_file_applies_new_policy() {
    let engine = FakeEngine::new();
    let probe = engine.probe();
    let config = TestConfigBuilder::new().policy("no").build();
    let (handle, _updates, task) = start(config, engine);

    for id in [1, 2] {
        handle
            .context_created(ContextId(id), ProgramId::from("editor"))
            .await
            .unwrap();
        handle.activate(ContextId(id)).await.unwrap();
    }
    assert_eq!(handle.stats().await.unwrap().live_sessions, 2);

    // The host watches the file; on change it reloads and pushes the
    // result into the running service.
    let file = TestConfigFile::with_toml("[session]\npolicy = \"all\"\n").await;
    handle.config_changed(file.load().await).await.unwrap();
    assert_eq!(handle.stats().await.unwrap().live_sessions, 1);

    file.write("[session]\npolicy = \"no\"\n").await;
    handle.config_changed(file.load().await).await.unwrap();
    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.live_sessions, 2);
    assert_eq!(stats.attached_contexts, 2);
    assert_eq!(probe.live_sessions(), 2);

    shutdown(handle, task).await;
}

#[tokio::test]
async fn test_config_change_regroups_live_sessions() {
    let engine = FakeEngine::new();
    let probe = engine.probe();
    let config = TestConfigBuilder::new().policy("no").build();
    let (handle, _updates, task) = start(config, engine);

    for id in [1, 2] {
        handle
            .context_created(ContextId(id), ProgramId::from("editor"))
            .await
            .unwrap();
        handle.activate(ContextId(id)).await.unwrap();
    }
    assert_eq!(handle.stats().await.unwrap().live_sessions, 2);

    let shared = TestConfigBuilder::new().policy("all").build();
    handle.config_changed(shared).await.unwrap();

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.live_sessions, 1);
    assert_eq!(stats.attached_contexts, 2);
    assert!(probe.live_sessions() == 1);

    shutdown(handle, task).await;
}
