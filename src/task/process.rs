use super::spawner::{ChildExit, ChildProcess, ProcessSpawner};
use super::{ComputeJob, TaskEvent, TaskState};
use crate::error::{ExecError, Result};
use crate::queue::OutputQueue;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

type SharedChild = Arc<Mutex<Option<Box<dyn ChildProcess>>>>;

/// Runs the computation in a child process.
///
/// The child cannot signal the parent, so a watcher thread polls for its exit
/// every `poll_interval`. On exit the task is `Finished` when the child left a
/// return code in the queue and `Terminated` otherwise (crash, OOM kill,
/// external kill).
pub struct ProcessTask {
    job: Option<ComputeJob>,
    queue: OutputQueue,
    spawner: Arc<dyn ProcessSpawner>,
    poll_interval: Duration,
    events: Sender<TaskEvent>,
    state: Arc<Mutex<TaskState>>,
    child: SharedChild,
    stop_tx: Option<Sender<()>>,
    watcher: Option<JoinHandle<()>>,
    name: String,
}

impl ProcessTask {
    pub fn new(
        job: ComputeJob,
        events: Sender<TaskEvent>,
        spawner: Arc<dyn ProcessSpawner>,
        poll_interval: Duration,
    ) -> Self {
        let name = format!("{}:{}", job.context.title(), job.context.label());
        Self {
            queue: job.context.queue().clone(),
            job: Some(job),
            spawner,
            poll_interval,
            events,
            state: Arc::new(Mutex::new(TaskState::Idle)),
            child: Arc::new(Mutex::new(None)),
            stop_tx: None,
            watcher: None,
            name,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        let job = self
            .job
            .take()
            .ok_or_else(|| ExecError::Spawn("process task already started".to_string()))?;

        let child = self.spawner.spawn(Box::new(move || {
            job.run();
        }))?;
        tracing::debug!(
            "{} running in child {} ({} spawner)",
            self.name,
            child.id(),
            self.spawner.name()
        );

        *self.child.lock() = Some(child);
        *self.state.lock() = TaskState::Running;

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let watcher = Watcher {
            child: self.child.clone(),
            state: self.state.clone(),
            queue: self.queue.clone(),
            events: self.events.clone(),
            name: self.name.clone(),
        };
        let poll_interval = self.poll_interval;

        let handle = std::thread::Builder::new()
            .name("nodexec-watcher".to_string())
            .spawn(move || watcher.run(poll_interval, stop_rx))
            .map_err(|e| {
                ExecError::Spawn(format!("Failed to start watcher thread: {}", e))
            });

        match handle {
            Ok(handle) => {
                self.stop_tx = Some(stop_tx);
                self.watcher = Some(handle);
                Ok(())
            }
            Err(e) => {
                // no one would ever reap the child
                self.kill_child();
                *self.state.lock() = TaskState::Idle;
                Err(e)
            }
        }
    }

    /// Block until the watcher has seen the child exit
    pub fn wait(&mut self) {
        if let Some(handle) = self.watcher.take() {
            if handle.join().is_err() {
                tracing::error!("{} watcher thread panicked", self.name);
            }
        }
    }

    /// Stop polling and kill the child
    pub fn terminate(&mut self) {
        {
            let mut state = self.state.lock();
            if *state != TaskState::Running {
                return;
            }
            *state = TaskState::Terminated;
        }

        self.stop_tx.take();
        if let Some(handle) = self.watcher.take() {
            let _ = handle.join();
        }
        self.kill_child();
    }

    fn kill_child(&mut self) {
        let mut guard = self.child.lock();
        if let Some(child) = guard.as_mut() {
            let id = child.id();
            if let Err(e) = child.kill() {
                tracing::error!("{} failed to kill child {}: {}", self.name, id, e);
                return;
            }
            match child.wait() {
                Ok(exit) => tracing::info!("{} child {} killed ({})", self.name, id, exit),
                Err(e) => tracing::warn!("{} failed to reap child {}: {}", self.name, id, e),
            }
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

impl Drop for ProcessTask {
    fn drop(&mut self) {
        self.terminate();
    }
}

struct Watcher {
    child: SharedChild,
    state: Arc<Mutex<TaskState>>,
    queue: OutputQueue,
    events: Sender<TaskEvent>,
    name: String,
}

impl Watcher {
    fn run(self, poll_interval: Duration, stop_rx: Receiver<()>) {
        let ticker = tick(poll_interval);
        loop {
            select! {
                recv(stop_rx) -> _ => return,
                recv(ticker) -> _ => {
                    let status = match self.child.lock().as_mut() {
                        Some(child) => child.try_wait(),
                        None => return,
                    };
                    match status {
                        Ok(None) => continue,
                        Ok(Some(exit)) => return self.finish(Some(exit)),
                        Err(e) => {
                            tracing::error!("{} lost track of child: {}", self.name, e);
                            return self.finish(None);
                        }
                    }
                }
            }
        }
    }

    fn finish(&self, exit: Option<ChildExit>) {
        let event = if self.queue.has_return_code() {
            TaskEvent::Finished
        } else {
            match exit {
                Some(exit) => tracing::warn!(
                    "{} child exited with {} before reporting a return code",
                    self.name,
                    exit
                ),
                None => tracing::warn!("{} child vanished without a return code", self.name),
            }
            TaskEvent::Terminated
        };

        let mut state = self.state.lock();
        if *state != TaskState::Running {
            return;
        }
        *state = match event {
            TaskEvent::Finished => TaskState::Finished,
            TaskEvent::Terminated => TaskState::Terminated,
        };
        let _ = self.events.send(event);
    }
}
