//! The control task binding host input contexts to engine sessions.
//!
//! [`AdapterService`] owns every piece of mutable state — pool, resolver,
//! gate, coordinator, registry, and the engine capability — and consumes
//! host commands and engine notifications from channels in one loop.
//! Nothing outside this task can touch session state: thread affinity is a
//! property of the structure, not a runtime assertion. The host talks to a
//! running service through [`ServiceHandle`] and observes it through the
//! broadcast [`Update`] bus.

use std::collections::HashSet;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use inkbind_config::AppConfig;

use crate::context::{ContextId, ContextRegistry, ProgramId};
use crate::deploy::{DeployCoordinator, DeployOutcome, DeployPhase};
use crate::engine::{
    EngineFacade, EngineNotification, KeyEvent, NotificationSink, SchemaId, SessionId,
};
use crate::gate::NotificationGate;
use crate::policy::PolicyResolver;
use crate::pool::{DeploySnapshot, SessionPool};

/// Commands sent from the host framework to the control task.
#[derive(Debug)]
pub enum Command {
    ContextCreated {
        context: ContextId,
        program: ProgramId,
    },
    ContextFocused {
        context: ContextId,
    },
    ContextUnfocused {
        context: ContextId,
    },
    ContextDestroyed {
        context: ContextId,
    },
    KeyEvent {
        context: ContextId,
        key: KeyEvent,
        reply: oneshot::Sender<bool>,
    },
    Activate {
        context: ContextId,
    },
    Deactivate {
        context: ContextId,
    },
    Reset {
        context: ContextId,
    },
    SetOption {
        context: ContextId,
        name: String,
        value: bool,
    },
    GetOption {
        context: ContextId,
        name: String,
        reply: oneshot::Sender<Option<bool>>,
    },
    SelectSchema {
        context: ContextId,
        schema: SchemaId,
    },
    GetSchema {
        context: ContextId,
        reply: oneshot::Sender<Option<SchemaId>>,
    },
    Deploy {
        fullcheck: bool,
    },
    Sync {
        user_triggered: bool,
    },
    ConfigChanged(AppConfig),
    Stats {
        reply: oneshot::Sender<ServiceStats>,
    },
    Shutdown,
}

/// Events published to the host on the update bus.
#[derive(Debug, Clone)]
pub enum Update {
    /// A user-visible notice (deploy progress, failures).
    Notice { kind: String, body: String },
    /// An option changed on the session serving `context`.
    OptionChanged {
        context: ContextId,
        name: String,
        value: bool,
    },
    /// The schema serving `context` changed.
    SchemaChanged { context: ContextId, schema: SchemaId },
}

/// Diagnostic snapshot of the service's state.
#[derive(Debug, Clone)]
pub struct ServiceStats {
    pub live_sessions: usize,
    pub attached_contexts: usize,
    pub known_contexts: usize,
    pub sessionless_contexts: usize,
    pub deploy_phase: DeployPhase,
}

/// Errors from interacting with a service that has stopped.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service is not running")]
    Stopped,
}

/// Handle for interacting with a running [`AdapterService`].
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    command_tx: mpsc::Sender<Command>,
    update_tx: broadcast::Sender<Update>,
}

impl ServiceHandle {
    /// Subscribe to host-facing updates.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<Update> {
        self.update_tx.subscribe()
    }

    async fn send(&self, command: Command) -> Result<(), ServiceError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ServiceError::Stopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    pub async fn context_created(
        &self,
        context: ContextId,
        program: ProgramId,
    ) -> Result<(), ServiceError> {
        self.send(Command::ContextCreated { context, program }).await
    }

    pub async fn context_focused(&self, context: ContextId) -> Result<(), ServiceError> {
        self.send(Command::ContextFocused { context }).await
    }

    pub async fn context_unfocused(&self, context: ContextId) -> Result<(), ServiceError> {
        self.send(Command::ContextUnfocused { context }).await
    }

    pub async fn context_destroyed(&self, context: ContextId) -> Result<(), ServiceError> {
        self.send(Command::ContextDestroyed { context }).await
    }

    /// Feed a key event; resolves to whether the engine consumed it.
    pub async fn key_event(&self, context: ContextId, key: KeyEvent) -> Result<bool, ServiceError> {
        self.request(|reply| Command::KeyEvent { context, key, reply })
            .await
    }

    pub async fn activate(&self, context: ContextId) -> Result<(), ServiceError> {
        self.send(Command::Activate { context }).await
    }

    pub async fn deactivate(&self, context: ContextId) -> Result<(), ServiceError> {
        self.send(Command::Deactivate { context }).await
    }

    pub async fn reset(&self, context: ContextId) -> Result<(), ServiceError> {
        self.send(Command::Reset { context }).await
    }

    pub async fn set_option(
        &self,
        context: ContextId,
        name: &str,
        value: bool,
    ) -> Result<(), ServiceError> {
        self.send(Command::SetOption {
            context,
            name: name.to_string(),
            value,
        })
        .await
    }

    pub async fn get_option(
        &self,
        context: ContextId,
        name: &str,
    ) -> Result<Option<bool>, ServiceError> {
        let name = name.to_string();
        self.request(|reply| Command::GetOption {
            context,
            name,
            reply,
        })
        .await
    }

    pub async fn select_schema(
        &self,
        context: ContextId,
        schema: SchemaId,
    ) -> Result<(), ServiceError> {
        self.send(Command::SelectSchema { context, schema }).await
    }

    pub async fn get_schema(&self, context: ContextId) -> Result<Option<SchemaId>, ServiceError> {
        self.request(|reply| Command::GetSchema { context, reply })
            .await
    }

    /// Request an engine data rebuild. Coalesced if one is in flight.
    pub async fn deploy(&self, fullcheck: bool) -> Result<(), ServiceError> {
        self.send(Command::Deploy { fullcheck }).await
    }

    /// Synchronize engine user data. `user_triggered` opens the feedback
    /// allow window so completion is never suppressed.
    pub async fn sync(&self, user_triggered: bool) -> Result<(), ServiceError> {
        self.send(Command::Sync { user_triggered }).await
    }

    /// Push a changed configuration into the service.
    pub async fn config_changed(&self, config: AppConfig) -> Result<(), ServiceError> {
        self.send(Command::ConfigChanged(config)).await
    }

    pub async fn stats(&self) -> Result<ServiceStats, ServiceError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.send(Command::Shutdown).await
    }
}

/// The control task. Construct with [`AdapterService::new`], then drive it
/// with `tokio::spawn(service.run())`.
pub struct AdapterService {
    engine: Box<dyn EngineFacade>,
    resolver: PolicyResolver,
    pool: SessionPool,
    gate: NotificationGate,
    coordinator: DeployCoordinator,
    registry: ContextRegistry,
    /// Contexts whose session creation failed; their key events are
    /// dropped instead of retried against a broken engine. Cleared when
    /// the engine is rebuilt or the context goes away.
    sessionless: HashSet<ContextId>,
    command_rx: mpsc::Receiver<Command>,
    notification_rx: mpsc::UnboundedReceiver<EngineNotification>,
    update_tx: broadcast::Sender<Update>,
}

impl AdapterService {
    /// Create a service around an engine capability and return it with a
    /// handle for the host.
    pub fn new(config: AppConfig, mut engine: Box<dyn EngineFacade>) -> (Self, ServiceHandle) {
        let (sink, notification_rx) = NotificationSink::channel();
        engine.bind_notifications(sink);

        let (command_tx, command_rx) = mpsc::channel(256);
        let (update_tx, _) = broadcast::channel(256);

        let resolver = PolicyResolver::from_config(&config);
        let mut gate = NotificationGate::new(&config.notifications);
        // Engine startup maintenance may fail before any deploy was
        // requested; let that first report through.
        gate.open_allow(Some("deploy"));
        let coordinator = DeployCoordinator::new(config.deploy.max_buffered_keys);

        let handle = ServiceHandle {
            command_tx,
            update_tx: update_tx.clone(),
        };
        let service = Self {
            engine,
            resolver,
            pool: SessionPool::new(),
            gate,
            coordinator,
            registry: ContextRegistry::new(),
            sessionless: HashSet::new(),
            command_rx,
            notification_rx,
            update_tx,
        };
        (service, handle)
    }

    /// Run the control loop until shutdown.
    pub async fn run(mut self) {
        info!("session service started");
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                Some(notification) = self.notification_rx.recv() => {
                    self.handle_notification(notification);
                }
            }
        }
        // Sessions are gone for good; nothing to snapshot.
        self.pool.drain_all(false, self.engine.as_mut());
        info!("session service stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ContextCreated { context, program } => {
                debug!(%context, %program, "context created");
                self.registry.insert(context, program);
            }
            Command::ContextFocused { context } => {
                self.registry.set_focused(context, true);
            }
            Command::ContextUnfocused { context } => {
                self.registry.set_focused(context, false);
            }
            Command::ContextDestroyed { context } => {
                debug!(%context, "context destroyed");
                self.registry.remove(context);
                self.sessionless.remove(&context);
                self.pool.release(context, self.engine.as_mut());
            }
            Command::KeyEvent { context, key, reply } => {
                let consumed = self.handle_key(context, key);
                let _ = reply.send(consumed);
            }
            Command::Activate { context } => {
                self.ensure_session(context);
            }
            Command::Deactivate { context } => {
                if let Some(session) = self.pool.session_id_for(context) {
                    if let Err(err) = self.engine.commit(session) {
                        warn!(%session, error = %err, "commit on deactivate failed");
                    }
                    let _ = self.engine.clear(session);
                }
            }
            Command::Reset { context } => {
                if let Some(session) = self.pool.session_id_for(context) {
                    let _ = self.engine.clear(session);
                }
            }
            Command::SetOption {
                context,
                name,
                value,
            } => {
                if self.ensure_session(context).is_none() {
                    warn!(%context, option = %name, "set_option for sessionless context");
                    return;
                }
                if let Some(session) =
                    self.pool
                        .set_option(context, &name, value, self.engine.as_mut())
                {
                    // User action: feedback bypasses the gate.
                    let value_str = if value {
                        name.clone()
                    } else {
                        format!("!{name}")
                    };
                    self.notify_immediately(session, "option", &value_str);
                }
            }
            Command::GetOption {
                context,
                name,
                reply,
            } => {
                let value = self
                    .pool
                    .session_id_for(context)
                    .and_then(|session| self.engine.get_option(session, &name).ok());
                let _ = reply.send(value);
            }
            Command::SelectSchema { context, schema } => {
                let Some(session) = self.ensure_session(context) else {
                    warn!(%context, %schema, "schema selection for sessionless context");
                    return;
                };
                if let Err(err) = self.engine.set_schema(session, &schema) {
                    warn!(%session, %schema, error = %err, "schema selection failed");
                    return;
                }
                // Manual switch: feedback must never be suppressed.
                self.gate.open_allow(Some("schema"));
                self.notify_immediately(session, "schema", &schema.0);
            }
            Command::GetSchema { context, reply } => {
                let schema = self
                    .pool
                    .session_id_for(context)
                    .and_then(|session| self.engine.get_schema(session).ok());
                let _ = reply.send(schema);
            }
            Command::Deploy { fullcheck } => self.handle_deploy_request(fullcheck),
            Command::Sync { user_triggered } => self.handle_sync_request(user_triggered),
            Command::ConfigChanged(config) => self.handle_config_changed(config),
            Command::Stats { reply } => {
                let _ = reply.send(ServiceStats {
                    live_sessions: self.pool.len(),
                    attached_contexts: self.pool.attached_contexts(),
                    known_contexts: self.registry.len(),
                    sessionless_contexts: self.sessionless.len(),
                    deploy_phase: self.coordinator.phase(),
                });
            }
            // Handled in `run`.
            Command::Shutdown => {}
        }
    }

    /// Process one key event; returns whether it was consumed.
    fn handle_key(&mut self, context: ContextId, key: KeyEvent) -> bool {
        if self.coordinator.is_active() {
            // No sessions while the engine rebuilds; buffered events are
            // replayed after a successful restore.
            return self.coordinator.buffer_key(context, key);
        }
        if self.sessionless.contains(&context) {
            debug!(%context, "dropping key event for sessionless context");
            return false;
        }
        let Some(session) = self.ensure_session(context) else {
            return false;
        };
        self.pool.note_activity(context);
        match self.engine.process_key(session, key) {
            Ok(consumed) => consumed,
            Err(err) => {
                warn!(%session, error = %err, "process_key failed");
                false
            }
        }
    }

    /// Attach `context` to its session, creating one if needed. `None` if
    /// a deploy is in flight, the context is unknown, or creation failed
    /// (in which case the context is latched sessionless).
    fn ensure_session(&mut self, context: ContextId) -> Option<SessionId> {
        if self.coordinator.is_active() || self.sessionless.contains(&context) {
            return None;
        }
        let Some(program) = self.registry.program_of(context).cloned() else {
            warn!(%context, "event for unknown context");
            return None;
        };
        match self
            .pool
            .acquire(context, &program, &mut self.resolver, self.engine.as_mut())
        {
            Ok(session) => Some(session),
            Err(err) => {
                error!(
                    %context,
                    %program,
                    error = %err,
                    "session creation failed; dropping further key events for this context"
                );
                self.sessionless.insert(context);
                None
            }
        }
    }

    fn handle_deploy_request(&mut self, fullcheck: bool) {
        if self.coordinator.is_active() {
            self.coordinator.coalesce();
            return;
        }
        info!(fullcheck, "deploy requested");
        let snapshot = self.pool.drain_all(true, self.engine.as_mut());
        self.coordinator.begin(snapshot);
        // Completion feedback must get out even if a previous cycle set a
        // silence window.
        self.gate.open_allow(Some("deploy"));
        self.engine.start_deploy(fullcheck);
    }

    fn handle_sync_request(&mut self, user_triggered: bool) {
        if self.coordinator.is_active() {
            warn!("sync skipped, deploy in flight");
            return;
        }
        info!(user_triggered, "syncing engine user data");
        let snapshot = self.pool.drain_all(true, self.engine.as_mut());
        // Sessions recreate lazily with their saved toggles.
        self.pool.stage_restore(snapshot);
        if user_triggered {
            self.gate.open_allow(Some("sync"));
        }
        self.engine.sync_user_data();
    }

    fn handle_config_changed(&mut self, config: AppConfig) {
        if let Err(err) = config.validate() {
            warn!(error = %err, "ignoring invalid configuration update");
            return;
        }
        info!("configuration changed");
        self.resolver.refresh(&config);
        self.pool
            .refresh_policy(&mut self.resolver, self.engine.as_mut());
        self.gate.reconfigure(&config.notifications);
        self.coordinator
            .set_max_buffered(config.deploy.max_buffered_keys);
    }

    fn handle_notification(&mut self, notification: EngineNotification) {
        debug!(
            session = %notification.session,
            kind = %notification.kind,
            value = %notification.value,
            "engine notification"
        );
        if notification.kind == "deploy" {
            // Deploy progress concerns the whole engine, not one session.
            self.handle_deploy_notification(&notification.value);
            return;
        }
        let Some(members) = self.pool.members_of(notification.session) else {
            // Session destroyed mid-flight, e.g. racing a release. Drop.
            debug!(
                session = %notification.session,
                kind = %notification.kind,
                "stale notification, dropping"
            );
            return;
        };
        let members: Vec<ContextId> = members.iter().copied().collect();

        // Pool bookkeeping happens whether or not the host gets told.
        if notification.kind == "option" {
            let (name, value) = parse_option_value(&notification.value);
            self.pool
                .record_option(notification.session, name, value);
        }

        if !self.gate.should_deliver(&notification.kind) {
            debug!(kind = %notification.kind, "notification suppressed");
            return;
        }
        self.route(&members, &notification.kind, &notification.value);
    }

    fn handle_deploy_notification(&mut self, value: &str) {
        match value {
            "start" => {
                if self.gate.should_deliver("deploy") {
                    self.emit(Update::Notice {
                        kind: "deploy".to_string(),
                        body: "Engine maintenance in progress, please wait...".to_string(),
                    });
                }
            }
            "success" => {
                match self.coordinator.finish(true) {
                    Some(DeployOutcome::Restore { snapshot, buffered }) => {
                        // Settle first so restore and replay see an idle
                        // coordinator instead of buffering again.
                        self.coordinator.settle();
                        self.restore_sessions(snapshot);
                        for (context, key) in buffered {
                            let consumed = self.handle_key(context, key);
                            debug!(%context, consumed, "replayed buffered key");
                        }
                        if self.gate.should_deliver("deploy") {
                            self.emit(Update::Notice {
                                kind: "deploy".to_string(),
                                body: "Engine is ready.".to_string(),
                            });
                        }
                        // The engine re-announces option and schema state
                        // after a rebuild; spare the user that burst.
                        self.gate.silence();
                    }
                    Some(DeployOutcome::Failed) | None => {
                        // Startup maintenance finishing, no cycle to settle.
                        debug!("engine maintenance finished outside a deploy cycle");
                    }
                }
            }
            "failure" => {
                let had_cycle = self.coordinator.finish(false).is_some();
                if had_cycle {
                    // Snapshot is stale; future sessions start from defaults.
                    self.pool.discard_restore();
                    self.sessionless.clear();
                    self.coordinator.settle();
                }
                error!(had_cycle, "engine rebuild failed, session pool left empty");
                if self.gate.should_deliver("deploy") {
                    self.emit(Update::Notice {
                        kind: "deploy".to_string(),
                        body: "Engine rebuild failed. See log for details.".to_string(),
                    });
                }
                self.gate.silence();
            }
            other => {
                debug!(value = other, "unrecognized deploy notification value");
            }
        }
    }

    /// Recreate sessions for every live context, applying snapshot option
    /// maps, then drop whatever remains of the snapshot.
    fn restore_sessions(&mut self, snapshot: DeploySnapshot) {
        self.pool.stage_restore(snapshot);
        self.sessionless.clear();
        let contexts: Vec<ContextId> = self.registry.iter().map(|(id, _)| id).collect();
        for context in contexts {
            self.ensure_session(context);
        }
        // Keys with no surviving context are stale.
        self.pool.discard_restore();
    }

    /// Deliver a notification to a session's members bypassing the gate.
    /// Used for feedback the user just asked for.
    fn notify_immediately(&mut self, session: SessionId, kind: &str, value: &str) {
        let Some(members) = self.pool.members_of(session) else {
            debug!(%session, kind, "immediate notification for unknown session, dropping");
            return;
        };
        let members: Vec<ContextId> = members.iter().copied().collect();
        if kind == "option" {
            let (name, parsed) = parse_option_value(value);
            self.pool.record_option(session, name, parsed);
        }
        self.route(&members, kind, value);
    }

    /// Fan a session-scoped notification out to its member contexts.
    fn route(&self, members: &[ContextId], kind: &str, value: &str) {
        match kind {
            "option" => {
                let (name, parsed) = parse_option_value(value);
                for context in members {
                    self.emit(Update::OptionChanged {
                        context: *context,
                        name: name.to_string(),
                        value: parsed,
                    });
                }
            }
            "schema" => {
                for context in members {
                    self.emit(Update::SchemaChanged {
                        context: *context,
                        schema: SchemaId(value.to_string()),
                    });
                }
            }
            other => {
                self.emit(Update::Notice {
                    kind: other.to_string(),
                    body: value.to_string(),
                });
            }
        }
    }

    fn emit(&self, update: Update) {
        // No subscribers is fine; the host may not care.
        let _ = self.update_tx.send(update);
    }
}

/// Engine option values encode off-state with a leading `!`.
fn parse_option_value(value: &str) -> (&str, bool) {
    match value.strip_prefix('!') {
        Some(name) => (name, false),
        None => (value, true),
    }
}
