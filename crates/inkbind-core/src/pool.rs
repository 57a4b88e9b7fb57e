//! The session pool: maps grouping keys to live engine sessions.
//!
//! Sessions are created lazily on first acquire, shared by reference
//! counting over their member contexts, and destroyed when the last member
//! detaches. The pool is owned exclusively by the control task; cross-thread
//! mutation is unrepresentable rather than asserted against.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::context::{ContextId, ProgramId};
use crate::engine::{EngineError, EngineFacade, SessionId};
use crate::policy::{GroupingKey, PolicyResolver};

/// Per-session boolean option values, keyed by option name.
pub type OptionMap = HashMap<String, bool>;

/// Option state captured from drained sessions, keyed by grouping key.
///
/// Lives for one deploy or sync cycle; discarded after restore.
#[derive(Debug, Default, Clone)]
pub struct DeploySnapshot {
    options: HashMap<GroupingKey, OptionMap>,
}

impl DeploySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: GroupingKey, options: OptionMap) {
        self.options.insert(key, options);
    }

    pub fn get(&self, key: &GroupingKey) -> Option<&OptionMap> {
        self.options.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GroupingKey, &OptionMap)> {
        self.options.iter()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    fn into_inner(self) -> HashMap<GroupingKey, OptionMap> {
        self.options
    }
}

/// Errors from session pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("engine failed to create a session: {0}")]
    SessionCreateFailed(#[source] EngineError),
}

/// One live engine session and its attachment state.
#[derive(Debug)]
pub struct SessionRecord {
    engine_id: SessionId,
    key: GroupingKey,
    members: HashSet<ContextId>,
    options: OptionMap,
    dirty: bool,
    last_activity: Instant,
}

impl SessionRecord {
    pub fn engine_id(&self) -> SessionId {
        self.engine_id
    }

    pub fn key(&self) -> &GroupingKey {
        &self.key
    }

    pub fn members(&self) -> &HashSet<ContextId> {
        &self.members
    }

    pub fn options(&self) -> &OptionMap {
        &self.options
    }

    /// Whether option state changed since creation or the last drain.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }
}

#[derive(Debug, Clone)]
struct Attachment {
    program: ProgramId,
    key: GroupingKey,
}

/// Maps grouping keys to live sessions and contexts to their sessions.
///
/// Invariants: an engine session id belongs to exactly one record (enforced
/// by the reverse map), and a record's member set is never empty while the
/// record is alive.
#[derive(Debug, Default)]
pub struct SessionPool {
    sessions: HashMap<GroupingKey, SessionRecord>,
    by_engine_id: HashMap<SessionId, GroupingKey>,
    attachments: HashMap<ContextId, Attachment>,
    /// Option maps staged for reapplication when a session for the key is
    /// next created (deploy restore, sync).
    pending_restore: HashMap<GroupingKey, OptionMap>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a context to the session for its grouping key, creating the
    /// session if none is live. Idempotent while the key is unchanged.
    ///
    /// On [`PoolError::SessionCreateFailed`] the context is left without a
    /// session; the caller is expected to drop its key events rather than
    /// retry against a broken engine.
    pub fn acquire(
        &mut self,
        context: ContextId,
        program: &ProgramId,
        resolver: &mut PolicyResolver,
        engine: &mut dyn EngineFacade,
    ) -> Result<SessionId, PoolError> {
        let key = resolver.resolve(context, program);
        if let Some(stored) = self.attachments.get(&context).map(|a| a.key.clone()) {
            if stored == key {
                if let Some(record) = self.sessions.get(&key) {
                    return Ok(record.engine_id);
                }
            } else {
                // Policy moved under us; drop the attachment entry first so
                // a failed re-attach cannot leave it pointing at a session
                // the context is no longer a member of.
                self.attachments.remove(&context);
                self.detach(context, engine);
            }
        }
        self.ensure_session(&key, program, resolver, engine)?;
        self.attach(context, program.clone(), key.clone());
        self.sessions
            .get(&key)
            .map(|record| record.engine_id)
            .ok_or(PoolError::SessionCreateFailed(
                EngineError::SessionUnavailable,
            ))
    }

    /// Detach a context; the session is destroyed when its member set
    /// becomes empty. Returns the dying session's key and option map so an
    /// active deploy/sync cycle can capture it.
    pub fn release(
        &mut self,
        context: ContextId,
        engine: &mut dyn EngineFacade,
    ) -> Option<(GroupingKey, OptionMap)> {
        self.attachments.remove(&context)?;
        self.detach(context, engine)
    }

    /// Recompute grouping keys for all attached contexts and move the ones
    /// whose key changed, carrying their session's option map so no user
    /// toggle is lost across regrouping.
    pub fn refresh_policy(
        &mut self,
        resolver: &mut PolicyResolver,
        engine: &mut dyn EngineFacade,
    ) {
        let mut moves: Vec<(ContextId, ProgramId, GroupingKey)> = Vec::new();
        for (context, attachment) in &self.attachments {
            let new_key = resolver.resolve(*context, &attachment.program);
            if new_key != attachment.key {
                moves.push((*context, attachment.program.clone(), new_key));
            }
        }
        if moves.is_empty() {
            return;
        }
        // Deterministic move order keeps regrouping reproducible.
        moves.sort_by_key(|(context, _, _)| *context);
        info!(moved = moves.len(), "sharing policy changed, regrouping sessions");

        for (context, program, new_key) in moves {
            let carried = self
                .attachments
                .get(&context)
                .and_then(|attachment| self.sessions.get(&attachment.key))
                .map(|record| record.options.clone());
            self.attachments.remove(&context);
            self.detach(context, engine);

            if self.ensure_session(&new_key, &program, resolver, engine).is_err() {
                warn!(%context, "session creation failed during regrouping");
                continue;
            }
            self.attach(context, program, new_key.clone());
            if let Some(saved) = carried {
                self.apply_options(&new_key, &saved, engine);
            }
        }
    }

    /// Detach every context and destroy every session. With `snapshot`,
    /// each session's option map is recorded under its grouping key first.
    pub fn drain_all(&mut self, snapshot: bool, engine: &mut dyn EngineFacade) -> DeploySnapshot {
        let mut captured = DeploySnapshot::new();
        for (key, record) in self.sessions.drain() {
            if snapshot {
                captured.insert(key, record.options.clone());
            }
            engine.destroy_session(record.engine_id);
        }
        let drained = self.attachments.len();
        self.by_engine_id.clear();
        self.attachments.clear();
        info!(
            sessions = captured.len(),
            contexts = drained,
            snapshot,
            "drained session pool"
        );
        captured
    }

    /// Stage option maps to be reapplied when sessions for their keys are
    /// next created. Replaces any previously staged maps.
    pub fn stage_restore(&mut self, snapshot: DeploySnapshot) {
        self.pending_restore = snapshot.into_inner();
    }

    /// Drop staged restore state (a failed deploy makes it stale).
    pub fn discard_restore(&mut self) {
        self.pending_restore.clear();
    }

    /// Set an option on the session a context is attached to, updating the
    /// engine and the pool's record. Returns the session id, or `None` if
    /// the context has no session.
    pub fn set_option(
        &mut self,
        context: ContextId,
        name: &str,
        value: bool,
        engine: &mut dyn EngineFacade,
    ) -> Option<SessionId> {
        let key = self.attachments.get(&context)?.key.clone();
        let record = self.sessions.get_mut(&key)?;
        if let Err(err) = engine.set_option(record.engine_id, name, value) {
            warn!(session = %record.engine_id, option = name, error = %err, "set_option failed");
        }
        record.options.insert(name.to_string(), value);
        record.dirty = true;
        Some(record.engine_id)
    }

    /// Record an option change the engine reported on its own (e.g. a
    /// toggle triggered by a key binding inside the engine). Returns
    /// whether the session is known.
    pub fn record_option(&mut self, session: SessionId, name: &str, value: bool) -> bool {
        let Some(key) = self.by_engine_id.get(&session) else {
            return false;
        };
        if let Some(record) = self.sessions.get_mut(key) {
            record.options.insert(name.to_string(), value);
            record.dirty = true;
            true
        } else {
            false
        }
    }

    /// Mark activity on the session a context is attached to.
    pub fn note_activity(&mut self, context: ContextId) {
        if let Some(attachment) = self.attachments.get(&context) {
            if let Some(record) = self.sessions.get_mut(&attachment.key) {
                record.last_activity = Instant::now();
            }
        }
    }

    pub fn session_for(&self, context: ContextId) -> Option<&SessionRecord> {
        let attachment = self.attachments.get(&context)?;
        self.sessions.get(&attachment.key)
    }

    pub fn session_id_for(&self, context: ContextId) -> Option<SessionId> {
        self.session_for(context).map(|record| record.engine_id)
    }

    /// Reverse lookup: the member contexts of an engine session.
    pub fn members_of(&self, session: SessionId) -> Option<&HashSet<ContextId>> {
        let key = self.by_engine_id.get(&session)?;
        self.sessions.get(key).map(|record| &record.members)
    }

    pub fn record_for_key(&self, key: &GroupingKey) -> Option<&SessionRecord> {
        self.sessions.get(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn attached_contexts(&self) -> usize {
        self.attachments.len()
    }

    fn ensure_session(
        &mut self,
        key: &GroupingKey,
        program: &ProgramId,
        resolver: &mut PolicyResolver,
        engine: &mut dyn EngineFacade,
    ) -> Result<(), PoolError> {
        if self.sessions.contains_key(key) {
            return Ok(());
        }
        let engine_id = engine
            .create_session()
            .map_err(PoolError::SessionCreateFailed)?;
        debug!(session = %engine_id, ?key, "created engine session");

        let mut options = resolver.initial_options(program);
        if let Some(saved) = self.pending_restore.remove(key) {
            // Saved user toggles win over configured defaults.
            options.extend(saved);
        }
        for (name, value) in &options {
            if let Err(err) = engine.set_option(engine_id, name, *value) {
                warn!(session = %engine_id, option = name, error = %err, "initial set_option failed");
            }
        }
        self.by_engine_id.insert(engine_id, key.clone());
        self.sessions.insert(
            key.clone(),
            SessionRecord {
                engine_id,
                key: key.clone(),
                members: HashSet::new(),
                options,
                dirty: false,
                last_activity: Instant::now(),
            },
        );
        Ok(())
    }

    fn attach(&mut self, context: ContextId, program: ProgramId, key: GroupingKey) {
        if let Some(record) = self.sessions.get_mut(&key) {
            record.members.insert(context);
        }
        self.attachments.insert(context, Attachment { program, key });
    }

    /// Remove a context from its session's member set, destroying the
    /// session if it became empty. The context's attachment entry must
    /// already have been removed by the caller.
    fn detach(
        &mut self,
        context: ContextId,
        engine: &mut dyn EngineFacade,
    ) -> Option<(GroupingKey, OptionMap)> {
        let key = self
            .sessions
            .iter()
            .find(|(_, record)| record.members.contains(&context))
            .map(|(key, _)| key.clone())?;
        let record = self.sessions.get_mut(&key)?;
        record.members.remove(&context);
        if record.members.is_empty() {
            let record = self.sessions.remove(&key)?;
            self.by_engine_id.remove(&record.engine_id);
            engine.destroy_session(record.engine_id);
            debug!(session = %record.engine_id, "destroyed empty session");
            return Some((key, record.options));
        }
        None
    }

    fn apply_options(&mut self, key: &GroupingKey, options: &OptionMap, engine: &mut dyn EngineFacade) {
        if let Some(record) = self.sessions.get_mut(key) {
            for (name, value) in options {
                if let Err(err) = engine.set_option(record.engine_id, name, *value) {
                    warn!(session = %record.engine_id, option = name, error = %err, "set_option failed");
                }
                record.options.insert(name.clone(), *value);
            }
            record.dirty = true;
        }
    }
}
