//! Tracing setup for tests.
//!
//! The control task, pool, and gate all log through `tracing`; a test that
//! wants those events on the harness writer calls [`init_test_tracing`]
//! before driving the code under test. Installation happens at most once
//! per process, so every test can call it unconditionally.

use tracing_subscriber::EnvFilter;

/// Install a subscriber that writes to the test-harness writer, filtered
/// by `RUST_LOG` (falling back to `info`).
///
/// Later calls are silently ignored.
///
/// # Example
///
/// ```ignore
/// #[tokio::test]
/// async fn traces_a_deploy_cycle() {
///     inkbind_test_utils::tracing_setup::init_test_tracing();
///     // run with RUST_LOG=debug to see gate and pool decisions
/// }
/// ```
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}
