//! Execution coordinator: the façade a graph node holds.
//!
//! The coordinator drives one node through
//! `Idle -> Validating -> Computing -> Publishing -> Done`, with `Terminated`
//! reachable from `Computing` and `Publishing` through [`ExecutionCoordinator::terminate`].
//!
//! # Owner Loop
//!
//! All node mutation happens inside the owner's calls. A GUI owner calls
//! [`ExecutionCoordinator::poll`] from its event loop; a headless owner can
//! block in [`ExecutionCoordinator::wait`].
//!
//! ```ignore
//! let mut coord = ExecutionCoordinator::with_default_spawner(&node, config);
//! coord.start(&mut node)?;
//! loop {
//!     if let Some(n) = coord.poll(&mut node) {
//!         println!("{:?}", n.kind);
//!         break;
//!     }
//!     // draw a frame, handle input...
//! }
//! ```
//!
//! # Return Codes
//!
//! - validation `< 0`: no computation, the validation code is the result
//! - compute `!= 0`: normalised to -1
//! - compute `0` or missing: the validation code (0, or a positive warning)
//! - any replay operation failing: -1

mod janitor;
mod notify;
pub mod replay;

pub use janitor::RegionJanitor;
pub use notify::{Notification, NotificationHub, NotificationKind};

use crate::config::EngineConfig;
use crate::context::ComputeContext;
use crate::error::{ExecError, Result};
use crate::node::{NodeHandle, NodeId};
use crate::proxy::region::remove_region;
use crate::queue::OutputQueue;
use crate::task::{default_spawner, panic_message, ComputeJob, ExecutionTask, ProcessSpawner, TaskEvent};
use crate::types::{IsolationMode, RETURN_COMPUTE_ERROR, RETURN_SUCCESS};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, SendError, TryRecvError};
use replay::ReplayPlan;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where the current invocation is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Validating,
    Computing,
    Publishing,
    Done,
    Terminated,
}

impl Phase {
    /// An invocation is in flight
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Validating | Phase::Computing | Phase::Publishing)
    }
}

/// Result of `validate()` for the current invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Ok,
    Warned(i32),
    Failed(i32),
}

impl ValidationOutcome {
    pub fn from_code(code: i32) -> Self {
        match code {
            c if c < 0 => ValidationOutcome::Failed(c),
            0 => ValidationOutcome::Ok,
            c => ValidationOutcome::Warned(c),
        }
    }

    pub fn code(&self) -> i32 {
        match *self {
            ValidationOutcome::Ok => RETURN_SUCCESS,
            ValidationOutcome::Warned(c) | ValidationOutcome::Failed(c) => c,
        }
    }
}

/// Combine the compute code, validation code and replay result
pub fn final_return_code(compute: Option<i32>, validation: i32, replay_failures: usize) -> i32 {
    if replay_failures > 0 {
        return RETURN_COMPUTE_ERROR;
    }
    match compute {
        Some(code) if code != RETURN_SUCCESS => RETURN_COMPUTE_ERROR,
        _ => validation,
    }
}

/// Runs one node's validate/compute/publish cycle under its isolation mode
pub struct ExecutionCoordinator {
    node: NodeId,
    title: String,
    label: String,
    mode: IsolationMode,
    config: Arc<EngineConfig>,
    spawner: Arc<dyn ProcessSpawner>,

    phase: Phase,
    invocation: u64,
    started_at: Option<Instant>,
    validation: Option<ValidationOutcome>,
    return_code: Option<i32>,
    terminate_requested: bool,

    task: Option<ExecutionTask>,
    task_rx: Option<Receiver<TaskEvent>>,
    replay_rx: Option<Receiver<ReplayPlan>>,

    janitor: RegionJanitor,
    hub: NotificationHub,
}

impl ExecutionCoordinator {
    /// Coordinator for `node`. The isolation mode is read once, here.
    pub fn new(node: &dyn NodeHandle, config: Arc<EngineConfig>, spawner: Arc<dyn ProcessSpawner>) -> Self {
        let mode = config.resolve_isolation(node.isolation_preference());
        tracing::debug!(
            "{}:{} coordinator created ({} mode, {} spawner)",
            node.title(),
            node.label(),
            mode,
            spawner.name()
        );
        Self {
            node: node.id(),
            title: node.title().to_string(),
            label: node.label().to_string(),
            mode,
            config,
            spawner,
            phase: Phase::Idle,
            invocation: 0,
            started_at: None,
            validation: None,
            return_code: None,
            terminate_requested: false,
            task: None,
            task_rx: None,
            replay_rx: None,
            janitor: RegionJanitor::new(),
            hub: NotificationHub::new(),
        }
    }

    /// Coordinator using the platform's default spawner
    pub fn with_default_spawner(node: &dyn NodeHandle, config: Arc<EngineConfig>) -> Self {
        Self::new(node, config, default_spawner())
    }

    // ── Accessors ──

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of invocations started so far
    pub fn invocation(&self) -> u64 {
        self.invocation
    }

    /// Code of the last completed invocation
    pub fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    pub fn validation(&self) -> Option<ValidationOutcome> {
        self.validation
    }

    pub fn terminate_requested(&self) -> bool {
        self.terminate_requested
    }

    /// Computation or publishing in progress
    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Computing | Phase::Publishing)
    }

    /// Wall time of the current (or last) invocation
    pub fn elapsed(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn subscribe(&mut self) -> Receiver<Notification> {
        self.hub.subscribe()
    }

    // ── Lifecycle ──

    /// Start an invocation.
    ///
    /// Validation runs synchronously here whatever the isolation mode. In
    /// inline mode the whole invocation completes before this returns.
    /// Fails only when an invocation is already in flight.
    pub fn start(&mut self, node: &mut dyn NodeHandle) -> Result<()> {
        if self.phase.is_active() {
            return Err(ExecError::AlreadyRunning { node: self.node });
        }

        self.invocation += 1;
        self.started_at = Some(Instant::now());
        self.return_code = None;
        self.terminate_requested = false;
        self.phase = Phase::Validating;

        let validation = ValidationOutcome::from_code(self.run_validate(node));
        self.validation = Some(validation);

        match validation {
            ValidationOutcome::Failed(code) => {
                tracing::error!("{}:{} validate() failed with {}", self.title, self.label, code);
                node.append_elapsed_time(self.elapsed());
                self.finish(code);
                return Ok(());
            }
            ValidationOutcome::Warned(code) => {
                tracing::warn!("{}:{} validate() warned with {}", self.title, self.label, code);
            }
            ValidationOutcome::Ok => {}
        }

        self.phase = Phase::Computing;
        if let Err(e) = self.spawn_task(node) {
            tracing::error!("{}:{} failed to start computation: {}", self.title, self.label, e);
            node.append_elapsed_time(self.elapsed());
            self.finish(RETURN_COMPUTE_ERROR);
            return Ok(());
        }

        if self.mode == IsolationMode::Inline {
            self.poll(node);
        }
        Ok(())
    }

    fn run_validate(&self, node: &mut dyn NodeHandle) -> i32 {
        let validate = node.validate_callable();
        match catch_unwind(AssertUnwindSafe(|| validate(node))) {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                tracing::error!("{}:{} validate() failed: {:#}", self.title, self.label, e);
                RETURN_COMPUTE_ERROR
            }
            Err(payload) => {
                tracing::error!(
                    "{}:{} validate() panicked: {}",
                    self.title,
                    self.label,
                    panic_message(payload.as_ref())
                );
                RETURN_COMPUTE_ERROR
            }
        }
    }

    fn spawn_task(&mut self, node: &mut dyn NodeHandle) -> Result<()> {
        let queue = match self.mode {
            IsolationMode::Process => {
                self.janitor.collect();
                OutputQueue::create_shared(&self.config.shm_root, self.node, self.invocation)?
            }
            _ => OutputQueue::in_memory(),
        };

        let context = ComputeContext::new(
            self.node,
            self.title.clone(),
            self.label.clone(),
            self.mode,
            node.input_snapshot(),
            node.param_snapshot(),
            queue.clone(),
            self.config.transfer(),
        );
        let job = ComputeJob::new(node.compute_callable(), context);

        let (tx, rx) = unbounded();
        let mut task = ExecutionTask::new(
            self.mode,
            job,
            tx,
            self.spawner.clone(),
            self.config.poll_interval(),
        );
        self.task_rx = Some(rx);

        if let Err(e) = task.start() {
            queue.discard();
            self.task_rx = None;
            return Err(e);
        }
        self.task = Some(task);
        Ok(())
    }

    /// Advance the invocation without blocking.
    ///
    /// Returns the notification when the invocation reached a terminal state
    /// during this call.
    pub fn poll(&mut self, node: &mut dyn NodeHandle) -> Option<Notification> {
        match self.phase {
            Phase::Computing => {
                let event = match self.task_rx.as_ref()?.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty) => return None,
                    Err(TryRecvError::Disconnected) => TaskEvent::Terminated,
                };
                self.on_task_event(event, node)
            }
            Phase::Publishing => {
                let plan = match self.replay_rx.as_ref()?.try_recv() {
                    Ok(plan) => plan,
                    Err(TryRecvError::Empty) => return None,
                    Err(TryRecvError::Disconnected) => return self.replay_lost(node),
                };
                Some(self.publish(plan, node))
            }
            _ => None,
        }
    }

    /// Block until the invocation reaches a terminal state.
    ///
    /// Not for use on a GUI thread.
    pub fn wait(&mut self, node: &mut dyn NodeHandle) -> Option<Notification> {
        let mut notification = None;

        if self.phase == Phase::Computing {
            let event = match self.task_rx.as_ref() {
                Some(rx) => rx.recv().unwrap_or(TaskEvent::Terminated),
                None => TaskEvent::Terminated,
            };
            notification = self.on_task_event(event, node);
        }

        if self.phase == Phase::Publishing {
            let plan = self.replay_rx.as_ref().map(|rx| rx.recv());
            notification = match plan {
                Some(Ok(plan)) => Some(self.publish(plan, node)),
                _ => self.replay_lost(node),
            };
        }
        notification
    }

    /// Like [`ExecutionCoordinator::wait`] but gives up after `timeout`.
    pub fn wait_timeout(&mut self, node: &mut dyn NodeHandle, timeout: Duration) -> Option<Notification> {
        let deadline = Instant::now() + timeout;
        while self.phase.is_active() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            let received = match self.phase {
                Phase::Computing => match self.task_rx.as_ref() {
                    Some(rx) => match rx.recv_timeout(remaining) {
                        Ok(event) => self.on_task_event(event, node),
                        Err(RecvTimeoutError::Timeout) => return None,
                        Err(RecvTimeoutError::Disconnected) => {
                            self.on_task_event(TaskEvent::Terminated, node)
                        }
                    },
                    None => return None,
                },
                Phase::Publishing => match self.replay_rx.as_ref() {
                    Some(rx) => match rx.recv_timeout(remaining) {
                        Ok(plan) => Some(self.publish(plan, node)),
                        Err(RecvTimeoutError::Timeout) => return None,
                        Err(RecvTimeoutError::Disconnected) => self.replay_lost(node),
                    },
                    None => return None,
                },
                _ => None,
            };
            if received.is_some() {
                return received;
            }
        }
        None
    }

    fn on_task_event(&mut self, event: TaskEvent, node: &mut dyn NodeHandle) -> Option<Notification> {
        self.task_rx = None;
        let Some(mut task) = self.task.take() else {
            return None;
        };
        task.wait();

        match event {
            TaskEvent::Terminated => {
                tracing::warn!(
                    "{}:{} computation ended without a return code",
                    self.title,
                    self.label
                );
                task.queue().discard();
                Some(self.terminated())
            }
            TaskEvent::Finished => {
                self.phase = Phase::Publishing;
                let queue = task.queue().clone();

                if self.mode == IsolationMode::Process {
                    // map and assemble large buffers off the owner's thread.
                    // Rendezvous: a plan is either taken by the owner or comes
                    // back to the helper when the owner terminated.
                    let (tx, rx) = bounded(0);
                    let spawned = std::thread::Builder::new()
                        .name(format!("nodexec-replay-{}", self.node))
                        .spawn(move || {
                            if let Err(SendError(plan)) = tx.send(prepare_from(&queue)) {
                                discard_plan(plan);
                            }
                        });
                    match spawned {
                        Ok(_) => {
                            self.replay_rx = Some(rx);
                            None
                        }
                        Err(e) => {
                            tracing::warn!("Replay helper unavailable, replaying inline: {}", e);
                            let plan = prepare_from(task.queue());
                            Some(self.publish(plan, node))
                        }
                    }
                } else {
                    let plan = prepare_from(&queue);
                    Some(self.publish(plan, node))
                }
            }
        }
    }

    fn publish(&mut self, mut plan: ReplayPlan, node: &mut dyn NodeHandle) -> Notification {
        self.replay_rx = None;
        let consumed = std::mem::take(&mut plan.consumed);
        let skipped = plan.skipped_outputs;
        let outcome = replay::apply(plan, node);
        self.janitor.release(consumed);

        let validation = self.validation.map(|v| v.code()).unwrap_or(RETURN_SUCCESS);
        let code = final_return_code(outcome.return_code, validation, outcome.failures);
        if skipped > 0 {
            tracing::warn!(
                "{}:{} {} segmented outputs could not be assembled",
                self.title,
                self.label,
                skipped
            );
        }

        node.append_elapsed_time(self.elapsed());
        tracing::info!(
            "{}:{} finished with {} in {:.3} s",
            self.title,
            self.label,
            code,
            self.elapsed().as_secs_f64()
        );
        self.finish(code)
    }

    fn replay_lost(&mut self, node: &mut dyn NodeHandle) -> Option<Notification> {
        tracing::error!("{}:{} replay helper exited without a result", self.title, self.label);
        self.replay_rx = None;
        node.append_elapsed_time(self.elapsed());
        Some(self.finish(RETURN_COMPUTE_ERROR))
    }

    fn finish(&mut self, code: i32) -> Notification {
        self.return_code = Some(code);
        self.phase = Phase::Done;
        self.notify(NotificationKind::Finished { return_code: code })
    }

    fn terminated(&mut self) -> Notification {
        self.phase = Phase::Terminated;
        self.notify(NotificationKind::Terminated)
    }

    fn notify(&mut self, kind: NotificationKind) -> Notification {
        let notification = Notification {
            node: self.node,
            invocation: self.invocation,
            kind,
            elapsed: self.elapsed(),
        };
        self.hub.publish(&notification);
        notification
    }

    /// Cancel the invocation.
    ///
    /// Process mode kills the child. Thread mode cannot stop its thread; it
    /// is left to finish in the background and its output is discarded. The
    /// termination notification is raised immediately.
    pub fn terminate(&mut self) -> Option<Notification> {
        if !self.is_running() {
            return None;
        }
        tracing::info!("{}:{} terminating ({} mode)", self.title, self.label, self.mode);
        self.terminate_requested = true;

        if let Some(mut task) = self.task.take() {
            task.terminate();
            task.queue().discard();
        }
        self.task_rx = None;
        self.replay_rx = None;
        Some(self.terminated())
    }

    /// Terminate anything in flight and remove every file this node left in
    /// the shm root.
    pub fn cleanup(&mut self) {
        self.terminate();
        let removed = self.janitor.purge_node(&self.config.shm_root, self.node);
        if removed > 0 {
            tracing::debug!("{}:{} removed {} stale files", self.title, self.label, removed);
        }
    }
}

impl Drop for ExecutionCoordinator {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Delete the regions of a plan nobody will apply
fn discard_plan(plan: ReplayPlan) {
    tracing::debug!("Discarding replay plan with {} regions", plan.consumed.len());
    for handle in plan.consumed {
        if let Err(e) = remove_region(&handle) {
            tracing::warn!("Failed to remove region {}: {}", handle.display(), e);
        }
    }
}

fn prepare_from(queue: &OutputQueue) -> ReplayPlan {
    match queue.drain() {
        Ok(events) => replay::prepare(events),
        Err(e) => {
            tracing::error!("Failed to drain output queue: {}", e);
            ReplayPlan::default()
        }
    }
}
