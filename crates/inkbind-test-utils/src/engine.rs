//! A scriptable in-memory engine for tests.
//!
//! [`FakeEngine`] implements the full engine capability against hash maps.
//! Tests hand the engine to the code under test and keep a
//! [`FakeEngineProbe`] to script failures, complete deploys, inject
//! notifications, and inspect what the engine was told to do. Probe and
//! engine share state behind a mutex, so the probe works while the engine
//! lives inside a running service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use inkbind_core::engine::{
    EngineError, EngineFacade, EngineNotification, KeyEvent, NotificationSink, SchemaId, SessionId,
};

/// How the fake reacts to `start_deploy`.
#[derive(Debug, Clone, Copy)]
enum DeployBehavior {
    /// Raise `"start"` and then the terminal result from a worker thread,
    /// the way a real engine rebuild reports back.
    Auto { success: bool },
    /// Raise only `"start"`; the test finishes the cycle with
    /// [`FakeEngineProbe::complete_deploy`].
    Manual,
}

#[derive(Debug)]
struct FakeSession {
    options: HashMap<String, bool>,
    schema: SchemaId,
    keys: Vec<KeyEvent>,
}

impl Default for FakeSession {
    fn default() -> Self {
        Self {
            options: HashMap::new(),
            schema: SchemaId("default".to_string()),
            keys: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct State {
    next_id: u64,
    sessions: HashMap<SessionId, FakeSession>,
    created: usize,
    destroyed: usize,
    fail_creates: usize,
    consume_keys: bool,
    deploy_behavior: DeployBehavior,
    deploys: usize,
    syncs: usize,
    sink: Option<NotificationSink>,
}

impl State {
    fn raise(&self, session: SessionId, kind: &str, value: &str) {
        if let Some(sink) = &self.sink {
            sink.raise(session, kind, value);
        }
    }
}

/// In-memory [`EngineFacade`] implementation.
#[derive(Debug)]
pub struct FakeEngine {
    state: Arc<Mutex<State>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                // Id 0 is the whole-engine placeholder; never allocate it.
                next_id: 1,
                sessions: HashMap::new(),
                created: 0,
                destroyed: 0,
                fail_creates: 0,
                consume_keys: true,
                deploy_behavior: DeployBehavior::Auto { success: true },
                deploys: 0,
                syncs: 0,
                sink: None,
            })),
        }
    }

    /// A handle for scripting and inspecting this engine from the test.
    pub fn probe(&self) -> FakeEngineProbe {
        FakeEngineProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake engine state poisoned")
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineFacade for FakeEngine {
    fn create_session(&mut self) -> Result<SessionId, EngineError> {
        let mut state = self.lock();
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(EngineError::SessionUnavailable);
        }
        let id = SessionId(state.next_id);
        state.next_id += 1;
        state.sessions.insert(id, FakeSession::default());
        state.created += 1;
        Ok(id)
    }

    fn destroy_session(&mut self, session: SessionId) {
        let mut state = self.lock();
        if state.sessions.remove(&session).is_some() {
            state.destroyed += 1;
        }
    }

    fn process_key(&mut self, session: SessionId, key: KeyEvent) -> Result<bool, EngineError> {
        let mut state = self.lock();
        let consume = state.consume_keys;
        let entry = state
            .sessions
            .get_mut(&session)
            .ok_or(EngineError::UnknownSession(session))?;
        entry.keys.push(key);
        Ok(consume)
    }

    fn get_option(&mut self, session: SessionId, name: &str) -> Result<bool, EngineError> {
        let state = self.lock();
        let entry = state
            .sessions
            .get(&session)
            .ok_or(EngineError::UnknownSession(session))?;
        Ok(entry.options.get(name).copied().unwrap_or(false))
    }

    fn set_option(
        &mut self,
        session: SessionId,
        name: &str,
        value: bool,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        let entry = state
            .sessions
            .get_mut(&session)
            .ok_or(EngineError::UnknownSession(session))?;
        entry.options.insert(name.to_string(), value);
        Ok(())
    }

    fn get_schema(&mut self, session: SessionId) -> Result<SchemaId, EngineError> {
        let state = self.lock();
        let entry = state
            .sessions
            .get(&session)
            .ok_or(EngineError::UnknownSession(session))?;
        Ok(entry.schema.clone())
    }

    fn set_schema(&mut self, session: SessionId, schema: &SchemaId) -> Result<(), EngineError> {
        let mut state = self.lock();
        let entry = state
            .sessions
            .get_mut(&session)
            .ok_or(EngineError::UnknownSession(session))?;
        entry.schema = schema.clone();
        Ok(())
    }

    fn commit(&mut self, _session: SessionId) -> Result<(), EngineError> {
        Ok(())
    }

    fn clear(&mut self, _session: SessionId) -> Result<(), EngineError> {
        Ok(())
    }

    fn start_deploy(&mut self, _fullcheck: bool) {
        let mut state = self.lock();
        state.deploys += 1;
        match state.deploy_behavior {
            DeployBehavior::Auto { success } => {
                if let Some(sink) = state.sink.clone() {
                    // Report from another thread like a real rebuild would.
                    std::thread::spawn(move || {
                        sink.raise(EngineNotification::NO_SESSION, "deploy", "start");
                        let result = if success { "success" } else { "failure" };
                        sink.raise(EngineNotification::NO_SESSION, "deploy", result);
                    });
                }
            }
            DeployBehavior::Manual => {
                state.raise(EngineNotification::NO_SESSION, "deploy", "start");
            }
        }
    }

    fn sync_user_data(&mut self) {
        self.lock().syncs += 1;
    }

    fn bind_notifications(&mut self, sink: NotificationSink) {
        self.lock().sink = Some(sink);
    }
}

/// Scripting and inspection handle for a [`FakeEngine`].
#[derive(Debug, Clone)]
pub struct FakeEngineProbe {
    state: Arc<Mutex<State>>,
}

impl FakeEngineProbe {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake engine state poisoned")
    }

    /// Number of sessions currently alive inside the engine.
    pub fn live_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Total sessions created so far.
    pub fn created(&self) -> usize {
        self.lock().created
    }

    /// Total sessions destroyed so far.
    pub fn destroyed(&self) -> usize {
        self.lock().destroyed
    }

    /// Total deploys started so far.
    pub fn deploys(&self) -> usize {
        self.lock().deploys
    }

    /// Total user-data syncs so far.
    pub fn syncs(&self) -> usize {
        self.lock().syncs
    }

    /// The engine-side value of an option, or `None` if the session is
    /// gone or never saw the option.
    pub fn option(&self, session: SessionId, name: &str) -> Option<bool> {
        self.lock().sessions.get(&session)?.options.get(name).copied()
    }

    /// The active schema of a session.
    pub fn schema(&self, session: SessionId) -> Option<SchemaId> {
        self.lock().sessions.get(&session).map(|s| s.schema.clone())
    }

    /// Key codes fed into a session, in order.
    pub fn keys(&self, session: SessionId) -> Vec<u32> {
        self.lock()
            .sessions
            .get(&session)
            .map(|s| s.keys.iter().map(|k| k.code).collect())
            .unwrap_or_default()
    }

    /// Make the next `n` `create_session` calls fail.
    pub fn fail_next_creates(&self, n: usize) {
        self.lock().fail_creates = n;
    }

    /// Whether `process_key` reports events as consumed (default `true`).
    pub fn consume_keys(&self, consume: bool) {
        self.lock().consume_keys = consume;
    }

    /// Let deploys finish on their own with the given result.
    pub fn auto_deploy(&self, success: bool) {
        self.lock().deploy_behavior = DeployBehavior::Auto { success };
    }

    /// Hold deploys open until [`FakeEngineProbe::complete_deploy`].
    pub fn manual_deploy(&self) {
        self.lock().deploy_behavior = DeployBehavior::Manual;
    }

    /// Finish a manually held deploy with the given result.
    pub fn complete_deploy(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.lock()
            .raise(EngineNotification::NO_SESSION, "deploy", result);
    }

    /// Inject a notification as if the engine raised it spontaneously.
    pub fn raise(&self, session: SessionId, kind: &str, value: &str) {
        self.lock().raise(session, kind, value);
    }
}
