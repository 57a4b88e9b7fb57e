#![deny(unsafe_code)]

//! Inkbind core: session management between a host input framework and an
//! embedded linguistic engine.
//!
//! The host owns input contexts (one per text-entry target); the engine owns
//! sessions (conversion state, options, active schema). This crate decides
//! which contexts share which sessions, keeps that mapping stable across
//! policy changes and engine data rebuilds, and marshals the engine's
//! asynchronous notifications back to the host. All mutable state lives on
//! one control task ([`AdapterService`]); the host drives it through a
//! [`ServiceHandle`] and observes it on a broadcast [`Update`] bus.

/// Host input context identities and their registry.
pub mod context;
/// Deploy/sync cycle state machine and key buffering.
pub mod deploy;
/// The engine capability boundary and notification sink.
pub mod engine;
/// Suppression and allow windows for engine notifications.
pub mod gate;
/// Sharing-policy resolution to grouping keys.
pub mod policy;
/// The refcounted session pool.
pub mod pool;
/// The control task, its command handle, and the update bus.
pub mod service;

pub use context::{ContextId, ContextInfo, ContextRegistry, ProgramId};
pub use deploy::{DeployCoordinator, DeployOutcome, DeployPhase};
pub use engine::{
    EngineError, EngineFacade, EngineNotification, KeyEvent, NotificationSink, SchemaId, SessionId,
};
pub use gate::NotificationGate;
pub use policy::{GroupingKey, PolicyResolver, SharingPolicy};
pub use pool::{DeploySnapshot, OptionMap, PoolError, SessionPool, SessionRecord};
pub use service::{AdapterService, Command, ServiceError, ServiceHandle, ServiceStats, Update};
