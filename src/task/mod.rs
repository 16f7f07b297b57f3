//! Execution tasks: one computation invocation under one isolation mode.
//!
//! Every variant has the same contract: `start`, `wait`, `terminate`,
//! `is_running`, and exactly one [`TaskEvent`] on the channel it was given
//! when the computation reaches a terminal state. A task that was terminated
//! through [`ExecutionTask::terminate`] sends nothing; the caller already
//! knows.
//!
//! - [`InlineTask`] runs the computation inside `start`
//! - [`ThreadTask`] runs it on a named thread
//! - [`ProcessTask`] runs it in a child from a [`ProcessSpawner`] and polls for
//!   the child's exit
//!
//! Failures inside the user callable (an `Err` or a panic) never escape the
//! task: they are logged and recorded as return code -1 in the output queue.

mod inline;
mod process;
pub mod spawner;
mod thread;

pub use inline::InlineTask;
pub use process::ProcessTask;
pub use spawner::{default_spawner, ChildExit, ChildJob, ChildProcess, ProcessSpawner};
pub use thread::ThreadTask;

#[cfg(unix)]
pub use spawner::ForkSpawner;
pub use spawner::InProcessSpawner;

use crate::context::ComputeContext;
use crate::error::Result;
use crate::node::ComputeFn;
use crate::queue::{OutputEvent, OutputQueue};
use crate::types::{IsolationMode, RETURN_COMPUTE_ERROR};
use crossbeam_channel::Sender;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Terminal notification of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// The computation ran to completion and reported a return code
    Finished,
    /// The computation stopped without reporting a return code
    Terminated,
}

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    #[default]
    Idle,
    Running,
    Finished,
    Terminated,
}

/// A compute callable bound to its context
pub struct ComputeJob {
    pub compute: ComputeFn,
    pub context: ComputeContext,
}

impl ComputeJob {
    pub fn new(compute: ComputeFn, context: ComputeContext) -> Self {
        Self { compute, context }
    }

    /// Run the callable and record its return code in the queue
    pub fn run(mut self) -> i32 {
        run_compute(&self.compute, &mut self.context)
    }
}

/// Text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a compute callable at the task boundary.
///
/// Always appends exactly one return code to the context's queue.
pub fn run_compute(compute: &ComputeFn, ctx: &mut ComputeContext) -> i32 {
    let start = Instant::now();
    let code = match catch_unwind(AssertUnwindSafe(|| compute(ctx))) {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            tracing::error!("{}:{} compute() failed: {:#}", ctx.title(), ctx.label(), e);
            RETURN_COMPUTE_ERROR
        }
        Err(payload) => {
            tracing::error!(
                "{}:{} compute() panicked: {}",
                ctx.title(),
                ctx.label(),
                panic_message(payload.as_ref())
            );
            RETURN_COMPUTE_ERROR
        }
    };
    tracing::info!(
        "{}:{} compute time: {:.3} s",
        ctx.title(),
        ctx.label(),
        start.elapsed().as_secs_f64()
    );

    if let Err(e) = ctx.queue().append(OutputEvent::ReturnCode(code)) {
        tracing::error!(
            "{}:{} failed to record return code {}: {}",
            ctx.title(),
            ctx.label(),
            code,
            e
        );
    }
    code
}

/// One invocation under one of the three isolation modes
pub enum ExecutionTask {
    Inline(InlineTask),
    Thread(ThreadTask),
    Process(ProcessTask),
}

impl ExecutionTask {
    /// Build the task variant for `mode`
    pub fn new(
        mode: IsolationMode,
        job: ComputeJob,
        events: Sender<TaskEvent>,
        spawner: Arc<dyn ProcessSpawner>,
        poll_interval: Duration,
    ) -> Self {
        match mode {
            IsolationMode::Inline => ExecutionTask::Inline(InlineTask::new(job, events)),
            IsolationMode::Thread => ExecutionTask::Thread(ThreadTask::new(job, events)),
            IsolationMode::Process => {
                ExecutionTask::Process(ProcessTask::new(job, events, spawner, poll_interval))
            }
        }
    }

    pub fn mode(&self) -> IsolationMode {
        match self {
            ExecutionTask::Inline(_) => IsolationMode::Inline,
            ExecutionTask::Thread(_) => IsolationMode::Thread,
            ExecutionTask::Process(_) => IsolationMode::Process,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        match self {
            ExecutionTask::Inline(t) => t.start(),
            ExecutionTask::Thread(t) => t.start(),
            ExecutionTask::Process(t) => t.start(),
        }
    }

    /// Block until the task reaches a terminal state
    pub fn wait(&mut self) {
        match self {
            ExecutionTask::Inline(t) => t.wait(),
            ExecutionTask::Thread(t) => t.wait(),
            ExecutionTask::Process(t) => t.wait(),
        }
    }

    pub fn terminate(&mut self) {
        match self {
            ExecutionTask::Inline(t) => t.terminate(),
            ExecutionTask::Thread(t) => t.terminate(),
            ExecutionTask::Process(t) => t.terminate(),
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            ExecutionTask::Inline(t) => t.is_running(),
            ExecutionTask::Thread(t) => t.is_running(),
            ExecutionTask::Process(t) => t.is_running(),
        }
    }

    pub fn state(&self) -> TaskState {
        match self {
            ExecutionTask::Inline(t) => t.state(),
            ExecutionTask::Thread(t) => t.state(),
            ExecutionTask::Process(t) => t.state(),
        }
    }

    /// Queue the computation writes into
    pub fn queue(&self) -> &OutputQueue {
        match self {
            ExecutionTask::Inline(t) => t.queue(),
            ExecutionTask::Thread(t) => t.queue(),
            ExecutionTask::Process(t) => t.queue(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::job;
    use super::*;

    #[test]
    fn test_run_compute_records_code() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OutputQueue::in_memory();
        let code = job(IsolationMode::Inline, queue.clone(), dir.path(), |_| Ok(3)).run();
        assert_eq!(code, 3);
        assert_eq!(queue.drain().unwrap(), vec![OutputEvent::ReturnCode(3)]);
    }

    #[test]
    fn test_run_compute_converts_error() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OutputQueue::in_memory();
        let code = job(IsolationMode::Inline, queue.clone(), dir.path(), |_| {
            anyhow::bail!("bad input")
        })
        .run();
        assert_eq!(code, RETURN_COMPUTE_ERROR);
        assert!(queue.has_return_code());
    }

    #[test]
    fn test_run_compute_converts_panic() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OutputQueue::in_memory();
        let code = job(IsolationMode::Inline, queue.clone(), dir.path(), |_| {
            panic!("index out of range")
        })
        .run();
        assert_eq!(code, RETURN_COMPUTE_ERROR);
        assert_eq!(queue.drain().unwrap(), vec![OutputEvent::ReturnCode(-1)]);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(5u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_variant_matches_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = crossbeam_channel::unbounded();
        for mode in [IsolationMode::Inline, IsolationMode::Thread, IsolationMode::Process] {
            let task = ExecutionTask::new(
                mode,
                job(mode, OutputQueue::in_memory(), dir.path(), |_| Ok(0)),
                tx.clone(),
                Arc::new(InProcessSpawner::new()),
                Duration::from_millis(5),
            );
            assert_eq!(task.mode(), mode);
            assert_eq!(task.state(), TaskState::Idle);
            assert!(!task.is_running());
        }
    }
}
