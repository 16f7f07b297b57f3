use super::{ComputeJob, TaskEvent, TaskState};
use crate::error::{ExecError, Result};
use crate::queue::OutputQueue;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Runs the computation on its own thread.
///
/// A thread cannot be stopped from outside. `terminate` marks the task
/// terminated and detaches the thread; it keeps running until the callable
/// returns, and whatever it emits is never replayed.
pub struct ThreadTask {
    job: Option<ComputeJob>,
    queue: OutputQueue,
    state: Arc<Mutex<TaskState>>,
    handle: Option<JoinHandle<()>>,
    events: Sender<TaskEvent>,
    name: String,
}

impl ThreadTask {
    pub fn new(job: ComputeJob, events: Sender<TaskEvent>) -> Self {
        let name = format!("{}:{}", job.context.title(), job.context.label());
        Self {
            queue: job.context.queue().clone(),
            job: Some(job),
            state: Arc::new(Mutex::new(TaskState::Idle)),
            handle: None,
            events,
            name,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        let job = self
            .job
            .take()
            .ok_or_else(|| ExecError::Spawn("thread task already started".to_string()))?;

        let state = self.state.clone();
        let events = self.events.clone();
        *state.lock() = TaskState::Running;

        let handle = std::thread::Builder::new()
            .name(format!("nodexec-{}", job.context.node_id()))
            .spawn(move || {
                job.run();
                let mut state = state.lock();
                if *state == TaskState::Running {
                    *state = TaskState::Finished;
                    let _ = events.send(TaskEvent::Finished);
                }
            })
            .map_err(|e| {
                *self.state.lock() = TaskState::Idle;
                ExecError::Spawn(format!("Failed to start compute thread: {}", e))
            })?;

        self.handle = Some(handle);
        Ok(())
    }

    pub fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("{} compute thread panicked outside compute()", self.name);
            }
        }
    }

    pub fn terminate(&mut self) {
        let mut state = self.state.lock();
        if *state != TaskState::Running {
            return;
        }
        *state = TaskState::Terminated;
        drop(state);

        if self.handle.take().is_some() {
            tracing::warn!(
                "{} compute thread cannot be stopped, backgrounded as a zombie",
                self.name
            );
        }
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == TaskState::Running
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub fn queue(&self) -> &OutputQueue {
        &self.queue
    }
}
