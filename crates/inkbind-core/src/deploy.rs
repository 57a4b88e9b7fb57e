//! Deploy/sync coordination.
//!
//! Tracks the phase of an engine data rebuild and holds everything that
//! must survive it: the option snapshot taken at drain time and a bounded
//! buffer of key events that arrived while no sessions existed. The rebuild
//! itself runs inside the engine, off the control task; its completion
//! arrives as a `"deploy"` notification.

use std::collections::VecDeque;

use tracing::{info, warn};

use crate::context::ContextId;
use crate::engine::KeyEvent;
use crate::pool::DeploySnapshot;

/// Phase of the deploy state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPhase {
    Idle,
    Draining,
    Redeploying,
    Restoring,
    Failed,
}

/// Outcome of a finished cycle, as seen by the caller of
/// [`DeployCoordinator::finish`].
#[derive(Debug)]
pub enum DeployOutcome {
    /// Rebuild succeeded; restore sessions from this snapshot and replay
    /// the buffered keys.
    Restore {
        snapshot: DeploySnapshot,
        buffered: VecDeque<(ContextId, KeyEvent)>,
    },
    /// Rebuild failed; the snapshot is stale and was discarded, buffered
    /// keys were dropped.
    Failed,
}

/// Orchestrates drain → rebuild → restore across one deploy cycle.
#[derive(Debug)]
pub struct DeployCoordinator {
    phase: DeployPhase,
    snapshot: Option<DeploySnapshot>,
    buffered: VecDeque<(ContextId, KeyEvent)>,
    max_buffered: usize,
    dropped: u64,
    coalesced: u32,
}

impl DeployCoordinator {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            phase: DeployPhase::Idle,
            snapshot: None,
            buffered: VecDeque::new(),
            max_buffered,
            dropped: 0,
            coalesced: 0,
        }
    }

    pub fn phase(&self) -> DeployPhase {
        self.phase
    }

    /// Whether a cycle is in flight (acquires must be deferred).
    pub fn is_active(&self) -> bool {
        self.phase != DeployPhase::Idle
    }

    /// Adopt a new buffer bound on configuration change.
    pub fn set_max_buffered(&mut self, max_buffered: usize) {
        self.max_buffered = max_buffered;
    }

    /// Enter a cycle with the snapshot taken at drain time.
    /// `Idle → Draining → Redeploying`; the drain itself already happened
    /// synchronously in the caller.
    pub fn begin(&mut self, snapshot: DeploySnapshot) {
        self.phase = DeployPhase::Draining;
        self.snapshot = Some(snapshot);
        self.buffered.clear();
        self.dropped = 0;
        self.coalesced = 0;
        self.phase = DeployPhase::Redeploying;
        info!("deploy cycle started");
    }

    /// Note a deploy request that arrived while a cycle is in flight.
    /// The in-flight rebuild is atomic and cannot be cancelled; the new
    /// request is merged into it.
    pub fn coalesce(&mut self) {
        self.coalesced += 1;
        info!(pending = self.coalesced, "deploy already in flight, request coalesced");
    }

    /// Buffer a key event that arrived while no sessions exist. Returns
    /// whether the event was kept; over the bound it is dropped with a
    /// warning instead of growing without limit.
    pub fn buffer_key(&mut self, context: ContextId, key: KeyEvent) -> bool {
        if self.buffered.len() >= self.max_buffered {
            self.dropped += 1;
            warn!(
                %context,
                dropped = self.dropped,
                bound = self.max_buffered,
                "key buffer full during deploy, dropping event"
            );
            return false;
        }
        self.buffered.push_back((context, key));
        true
    }

    /// Complete the cycle with the engine's reported result.
    ///
    /// Returns `None` when no cycle was in flight (a stray terminal
    /// notification, e.g. from engine startup maintenance).
    pub fn finish(&mut self, success: bool) -> Option<DeployOutcome> {
        if self.phase != DeployPhase::Redeploying {
            return None;
        }
        if success {
            self.phase = DeployPhase::Restoring;
            let snapshot = self.snapshot.take().unwrap_or_default();
            let buffered = std::mem::take(&mut self.buffered);
            info!(
                sessions = snapshot.len(),
                buffered = buffered.len(),
                "deploy succeeded, restoring sessions"
            );
            Some(DeployOutcome::Restore { snapshot, buffered })
        } else {
            self.phase = DeployPhase::Failed;
            self.snapshot = None;
            if !self.buffered.is_empty() {
                warn!(
                    dropped = self.buffered.len(),
                    "deploy failed, dropping buffered key events"
                );
                self.buffered.clear();
            }
            Some(DeployOutcome::Failed)
        }
    }

    /// Leave the terminal `Restoring`/`Failed` phase and return to `Idle`.
    pub fn settle(&mut self) {
        self.phase = DeployPhase::Idle;
    }
}
