//! Mock construction helpers

use mockall::mock;
use nodexec::task::{ChildJob, ChildProcess, InProcessSpawner, ProcessSpawner};
use nodexec::ExecError;
use std::sync::Arc;

mock! {
    pub Spawner {}

    impl ProcessSpawner for Spawner {
        fn spawn(&self, job: ChildJob) -> nodexec::Result<Box<dyn ChildProcess>>;
        fn name(&self) -> &'static str;
    }
}

/// Spawner whose every spawn fails
pub fn failing_spawner() -> Arc<dyn ProcessSpawner> {
    let mut spawner = MockSpawner::new();
    spawner
        .expect_spawn()
        .returning(|_| Err(ExecError::Spawn("resource temporarily unavailable".to_string())));
    spawner.expect_name().return_const("failing");
    Arc::new(spawner)
}

/// Spawner whose children exit at once without running their job, like a
/// child killed before it could report
pub fn vanishing_spawner() -> Arc<dyn ProcessSpawner> {
    let mut spawner = MockSpawner::new();
    spawner.expect_spawn().returning(|_job| {
        let inner = InProcessSpawner::new();
        inner.spawn(Box::new(|| {}))
    });
    spawner.expect_name().return_const("vanishing");
    Arc::new(spawner)
}

/// Thread-backed stand-in for a child process
pub fn in_process_spawner() -> Arc<dyn ProcessSpawner> {
    Arc::new(InProcessSpawner::new())
}
