use super::{ComputeJob, TaskEvent, TaskState};
use crate::error::{ExecError, Result};
use crate::queue::OutputQueue;
use crossbeam_channel::Sender;

/// Runs the computation synchronously inside `start`.
///
/// By the time `start` returns the task is finished and its event has been
/// sent, so `wait` and `terminate` have nothing to do.
pub struct InlineTask {
    job: Option<ComputeJob>,
    queue: OutputQueue,
    state: TaskState,
    events: Sender<TaskEvent>,
}

impl InlineTask {
    pub fn new(job: ComputeJob, events: Sender<TaskEvent>) -> Self {
        Self {
            queue: job.context.queue().clone(),
            job: Some(job),
            state: TaskState::Idle,
            events,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        let job = self
            .job
            .take()
            .ok_or_else(|| ExecError::Spawn("inline task already started".to_string()))?;

        self.state = TaskState::Running;
        job.run();
        self.state = TaskState::Finished;

        self.events
            .send(TaskEvent::Finished)
            .map_err(|e| ExecError::Channel(e.to_string()))
    }

    pub fn wait(&mut self) {}

    pub fn terminate(&mut self) {}

    pub fn is_running(&self) -> bool {
        false
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn queue(&self) -> &OutputQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::job;
    use super::*;
    use crate::queue::OutputEvent;
    use crate::types::IsolationMode;

    #[test]
    fn test_finishes_inside_start() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut task = InlineTask::new(
            job(IsolationMode::Inline, OutputQueue::in_memory(), dir.path(), |ctx| {
                ctx.set_data("out", 1)?;
                Ok(0)
            }),
            tx,
        );

        task.start().unwrap();
        assert_eq!(rx.try_recv().unwrap(), TaskEvent::Finished);
        assert_eq!(task.state(), TaskState::Finished);
        assert!(!task.is_running());
        assert_eq!(task.queue().len(), 2);
        assert!(matches!(task.queue().drain().unwrap()[1], OutputEvent::ReturnCode(0)));
    }

    #[test]
    fn test_second_start_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut task = InlineTask::new(
            job(IsolationMode::Inline, OutputQueue::in_memory(), dir.path(), |_| Ok(0)),
            tx,
        );
        task.start().unwrap();
        assert!(task.start().is_err());
    }
}
