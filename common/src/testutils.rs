//! Helpers shared by this crate's tests.

/// Tests that spawn child processes must hold this guard: the dispatcher
/// reaps with wait-any, which would otherwise steal children belonging to a
/// concurrently running test.
#[cfg(test)]
static CHILD_TESTS: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub fn child_test_guard() -> std::sync::MutexGuard<'static, ()> {
    CHILD_TESTS
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
