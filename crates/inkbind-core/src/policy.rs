//! Sharing-policy resolution.
//!
//! Decides which input contexts share an engine session. The resolver is a
//! pure function of the loaded configuration plus its inputs; the only
//! extra state is a warn-once latch for invalid global defaults.

use std::collections::HashMap;
use std::str::FromStr;

use tracing::warn;

use inkbind_config::AppConfig;

use crate::context::{ContextId, ProgramId};

/// How session state is shared between input contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingPolicy {
    /// Defer to the host framework's global sharing default.
    FollowGlobal,
    /// One session for the whole process.
    All,
    /// One session per client program.
    Program,
    /// One session per input context.
    No,
}

/// Error returned when a policy string is not one of the known values.
#[derive(Debug, thiserror::Error)]
#[error("unknown sharing policy: {0:?}")]
pub struct ParsePolicyError(String);

impl FromStr for SharingPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "follow-global" => Ok(Self::FollowGlobal),
            "all" => Ok(Self::All),
            "program" => Ok(Self::Program),
            "no" => Ok(Self::No),
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

/// The value deciding which contexts share a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupingKey {
    /// Single process-wide session.
    Global,
    /// One session per client program.
    Program(ProgramId),
    /// Private session for one context.
    Context(ContextId),
}

/// Resolves grouping keys and initial option maps from configuration.
#[derive(Debug)]
pub struct PolicyResolver {
    policy: SharingPolicy,
    global_default: Option<SharingPolicy>,
    default_options: HashMap<String, bool>,
    program_options: HashMap<String, HashMap<String, bool>>,
    warned_bad_default: bool,
}

impl PolicyResolver {
    /// Build a resolver from validated configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        // Config validation already rejected unknown strings; an unparsable
        // value can only appear if the host hands over an unvalidated
        // config, so fall back to the least-sharing policy.
        let policy = config.session.policy.parse().unwrap_or_else(|err| {
            warn!(error = %err, "invalid sharing policy, using per-context sessions");
            SharingPolicy::No
        });
        let global_default = config
            .session
            .global_policy
            .as_deref()
            .and_then(|s| s.parse().ok());
        Self {
            policy,
            global_default,
            default_options: config.session.default_options.clone(),
            program_options: config.session.program_options.clone(),
            warned_bad_default: false,
        }
    }

    /// Re-read configuration after a change notification. Resets the
    /// warn-once latch so a still-broken global default is reported again
    /// for the new config.
    pub fn refresh(&mut self, config: &AppConfig) {
        *self = Self::from_config(config);
    }

    /// The policy actually in effect, never [`SharingPolicy::FollowGlobal`].
    ///
    /// `FollowGlobal` re-enters resolution through the configured global
    /// default; an unset default, or a default that is itself
    /// `FollowGlobal`, fails closed to `No` (least state sharing) with a
    /// single warning per configuration load.
    pub fn effective_policy(&mut self) -> SharingPolicy {
        match self.policy {
            SharingPolicy::FollowGlobal => match self.global_default {
                Some(SharingPolicy::FollowGlobal) | None => {
                    if !self.warned_bad_default {
                        warn!(
                            "global sharing default is unset or recursive, \
                             falling back to per-context sessions"
                        );
                        self.warned_bad_default = true;
                    }
                    SharingPolicy::No
                }
                Some(resolved) => resolved,
            },
            direct => direct,
        }
    }

    /// Compute the grouping key for an input context.
    pub fn resolve(&mut self, context: ContextId, program: &ProgramId) -> GroupingKey {
        match self.effective_policy() {
            SharingPolicy::All => GroupingKey::Global,
            SharingPolicy::Program => GroupingKey::Program(program.clone()),
            SharingPolicy::No => GroupingKey::Context(context),
            // effective_policy never returns FollowGlobal.
            SharingPolicy::FollowGlobal => GroupingKey::Context(context),
        }
    }

    /// Option values a fresh session for `program` starts with: the global
    /// default map with the per-program override table applied on top.
    /// Per-program entries strictly win.
    pub fn initial_options(&self, program: &ProgramId) -> HashMap<String, bool> {
        let mut options = self.default_options.clone();
        if let Some(overrides) = self.program_options.get(&program.0) {
            for (name, value) in overrides {
                options.insert(name.clone(), *value);
            }
        }
        options
    }
}
