//! Suppression and allow windows for engine notifications.
//!
//! After a deploy finishes, the engine tends to emit a burst of option and
//! schema notifications that would spam the user; the gate silences them
//! for a bounded window. A narrower allow window punches through the
//! silence for exactly one notification kind, so feedback the user asked
//! for (deploy/sync completion) always gets out. Both windows are
//! monotonic deadlines that get reset, never stacked.

use std::time::{Duration, Instant};

use tracing::debug;

use inkbind_config::NotificationConfig;

/// Decides whether a rate-limited notification may reach the host.
#[derive(Debug)]
pub struct NotificationGate {
    allow_window: Duration,
    silence_window: Duration,
    silence_until: Option<Instant>,
    allow_until: Option<Instant>,
    /// Kind let through during the allow window; `None` allows any kind.
    allow_kind: Option<String>,
}

impl NotificationGate {
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            allow_window: Duration::from_secs(config.allow_window_secs),
            silence_window: Duration::from_secs(config.silence_window_secs),
            silence_until: None,
            allow_until: None,
            allow_kind: None,
        }
    }

    /// Adopt new window durations on a configuration change. Open windows
    /// keep their current deadlines.
    pub fn reconfigure(&mut self, config: &NotificationConfig) {
        self.allow_window = Duration::from_secs(config.allow_window_secs);
        self.silence_window = Duration::from_secs(config.silence_window_secs);
    }

    /// Open the allow window for `kind` (or for any kind when `None`),
    /// replacing any previous allow window.
    pub fn open_allow(&mut self, kind: Option<&str>) {
        self.open_allow_at(kind, Instant::now());
    }

    pub(crate) fn open_allow_at(&mut self, kind: Option<&str>, now: Instant) {
        self.allow_until = Some(now + self.allow_window);
        self.allow_kind = kind.map(str::to_string);
    }

    /// Start (or restart) the silence window.
    pub fn silence(&mut self) {
        self.silence_at(Instant::now());
    }

    pub(crate) fn silence_at(&mut self, now: Instant) {
        self.silence_until = Some(now + self.silence_window);
        debug!(secs = self.silence_window.as_secs(), "silencing notifications");
    }

    /// Whether a notification of `kind` may be delivered right now.
    pub fn should_deliver(&self, kind: &str) -> bool {
        self.should_deliver_at(kind, Instant::now())
    }

    pub(crate) fn should_deliver_at(&self, kind: &str, now: Instant) -> bool {
        if let Some(allow_until) = self.allow_until {
            if now < allow_until
                && self
                    .allow_kind
                    .as_deref()
                    .map(|allowed| allowed == kind)
                    .unwrap_or(true)
            {
                return true;
            }
        }
        match self.silence_until {
            Some(silence_until) => now >= silence_until,
            None => true,
        }
    }
}
