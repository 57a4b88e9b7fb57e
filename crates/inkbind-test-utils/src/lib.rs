#![deny(unsafe_code)]

//! Shared test utilities for the inkbind workspace.
//!
//! Provides a scriptable fake engine, config builders, and tracing helpers
//! so that individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! inkbind-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod engine;
pub mod tracing_setup;
