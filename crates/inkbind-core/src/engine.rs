//! The boundary to the embedded linguistic engine.
//!
//! The core never talks to the engine runtime directly; it is handed a
//! [`EngineFacade`] capability at construction time and every engine call
//! goes through it. Asynchronous engine events come back through a
//! [`NotificationSink`], a clonable handle the engine may fire from any
//! thread — it only enqueues immutable [`EngineNotification`] messages that
//! the control task consumes in arrival order.

use std::fmt;

use tokio::sync::mpsc;

/// Opaque identifier of one live engine session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Identifier of a linguistic schema known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaId(pub String);

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SchemaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A key event as delivered by the host framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    /// Key symbol / code.
    pub code: u32,
    /// Modifier bitmask.
    pub modifiers: u32,
    /// Whether this is a release event.
    pub release: bool,
}

impl KeyEvent {
    /// A plain key press with no modifiers.
    pub fn press(code: u32) -> Self {
        Self {
            code,
            modifiers: 0,
            release: false,
        }
    }
}

/// Errors reported by the engine boundary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine refused to allocate a session")]
    SessionUnavailable,

    #[error("unknown engine session: {0}")]
    UnknownSession(SessionId),

    #[error("engine call failed: {0}")]
    Backend(String),
}

/// An asynchronous notification raised by the engine.
///
/// Consumed immediately by the control task; never persisted.
#[derive(Debug, Clone)]
pub struct EngineNotification {
    /// Session the notification refers to. Deploy progress notifications
    /// are not session-scoped and carry [`EngineNotification::NO_SESSION`].
    pub session: SessionId,
    /// Notification kind, e.g. "deploy", "option", "schema".
    pub kind: String,
    /// Kind-specific value, e.g. "success" or an option name.
    pub value: String,
}

impl EngineNotification {
    /// Placeholder id for notifications that concern the whole engine
    /// rather than one session.
    pub const NO_SESSION: SessionId = SessionId(0);
}

/// Clonable, thread-safe handle the engine uses to raise notifications.
///
/// Sending never blocks; the channel is unbounded because the engine may
/// fire from threads that must not stall. Per-sink FIFO order is preserved,
/// which gives the per-session ordering guarantee downstream.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: mpsc::UnboundedSender<EngineNotification>,
}

impl NotificationSink {
    /// Create a sink and the receiver end consumed by the control task.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Raise a notification. Silently dropped if the control task is gone,
    /// which only happens during shutdown.
    pub fn raise(&self, session: SessionId, kind: &str, value: &str) {
        let _ = self.tx.send(EngineNotification {
            session,
            kind: kind.to_string(),
            value: value.to_string(),
        });
    }
}

/// Capability interface to the embedded engine runtime.
///
/// All methods are called from the control task and must not block for a
/// non-trivial duration. The one long-running operation, rebuilding the
/// engine's linguistic data, is started with [`EngineFacade::start_deploy`]
/// and runs on the engine's own thread; completion comes back through the
/// bound [`NotificationSink`] as a `"deploy"` notification with value
/// `"success"` or `"failure"`.
pub trait EngineFacade: Send {
    /// Allocate a fresh engine session.
    fn create_session(&mut self) -> Result<SessionId, EngineError>;

    /// Destroy an engine session. Destroying an unknown id is a no-op.
    fn destroy_session(&mut self, session: SessionId);

    /// Feed one key event to a session. Returns whether the engine
    /// consumed it.
    fn process_key(&mut self, session: SessionId, key: KeyEvent) -> Result<bool, EngineError>;

    /// Read a boolean option from a session.
    fn get_option(&mut self, session: SessionId, name: &str) -> Result<bool, EngineError>;

    /// Set a boolean option on a session.
    fn set_option(&mut self, session: SessionId, name: &str, value: bool)
    -> Result<(), EngineError>;

    /// Read the active schema of a session.
    fn get_schema(&mut self, session: SessionId) -> Result<SchemaId, EngineError>;

    /// Switch a session to the given schema.
    fn set_schema(&mut self, session: SessionId, schema: &SchemaId) -> Result<(), EngineError>;

    /// Commit the session's pending input to the client.
    fn commit(&mut self, session: SessionId) -> Result<(), EngineError>;

    /// Discard the session's pending input.
    fn clear(&mut self, session: SessionId) -> Result<(), EngineError>;

    /// Begin rebuilding the engine's linguistic data. Returns immediately.
    fn start_deploy(&mut self, fullcheck: bool);

    /// Synchronize user data (dictionaries, learned input) to storage.
    fn sync_user_data(&mut self);

    /// Install the sink through which the engine raises notifications.
    fn bind_notifications(&mut self, sink: NotificationSink);
}
