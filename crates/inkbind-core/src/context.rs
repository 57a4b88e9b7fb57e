//! Host-side input context identities.
//!
//! An input context is one text-entry target managed entirely by the host
//! framework; the core only ever sees its opaque identity and the program
//! it belongs to. The [`ContextRegistry`] mirrors the host's lifecycle
//! events so the service can re-resolve sessions after a policy change or
//! a deploy cycle.

use std::collections::HashMap;
use std::fmt;

/// Opaque, stable identity of one input context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ic-{}", self.0)
    }
}

/// Identity of the client program an input context belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub String);

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProgramId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-context record kept while the host context is alive.
#[derive(Debug, Clone)]
pub struct ContextInfo {
    /// Owning client program.
    pub program: ProgramId,
    /// Whether the context currently has focus.
    pub focused: bool,
}

/// Live input contexts, mirroring host lifecycle events.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    contexts: HashMap<ContextId, ContextInfo>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly created context. Re-creating an existing id replaces
    /// its record.
    pub fn insert(&mut self, context: ContextId, program: ProgramId) {
        self.contexts.insert(
            context,
            ContextInfo {
                program,
                focused: false,
            },
        );
    }

    /// Remove a destroyed context. Returns its record if it was known.
    pub fn remove(&mut self, context: ContextId) -> Option<ContextInfo> {
        self.contexts.remove(&context)
    }

    pub fn set_focused(&mut self, context: ContextId, focused: bool) {
        if let Some(info) = self.contexts.get_mut(&context) {
            info.focused = focused;
        }
    }

    pub fn get(&self, context: ContextId) -> Option<&ContextInfo> {
        self.contexts.get(&context)
    }

    pub fn program_of(&self, context: ContextId) -> Option<&ProgramId> {
        self.contexts.get(&context).map(|info| &info.program)
    }

    /// Iterate over all live contexts.
    pub fn iter(&self) -> impl Iterator<Item = (ContextId, &ContextInfo)> {
        self.contexts.iter().map(|(id, info)| (*id, info))
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
