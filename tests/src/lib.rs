//! LocalLab testing utilities
//!
//! Deterministic doubles for the inference core's collaborators, so the
//! core can be exercised without model weights or real hardware:
//!
//! - [`MockRuntime`]: scripted execution runtime
//! - [`ScriptedProbe`]: settable resource readings
//! - [`fixtures`]: model table, configuration and core construction

pub mod fixtures;
pub mod probe;
pub mod runtime;

pub use probe::ScriptedProbe;
pub use runtime::MockRuntime;

/// Yield to other tasks until `condition` holds.
///
/// Panics if it never does, so a broken invariant fails the test instead of
/// hanging it.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
