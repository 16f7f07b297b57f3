//! Process spawning service.
//!
//! Out-of-process tasks do not fork on their own. They ask an injected
//! [`ProcessSpawner`] for a child running a job, so the coordinator owns the
//! spawning policy and tests can swap in a fake.
//!
//! - [`ForkSpawner`] (unix): `fork()`s the current process; the child runs the
//!   job and leaves with `_exit`
//! - [`InProcessSpawner`]: runs the job on a thread that stands in for a child
//!   process; the fallback on platforms without `fork` and the default fake

use crate::error::{ExecError, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Work executed inside the child
pub type ChildJob = Box<dyn FnOnce() + Send + 'static>;

/// Exit status reported for a child that panicked inside its job
pub const CHILD_PANIC_STATUS: i32 = 101;

/// How a child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// Exit status for a normal exit
    pub code: Option<i32>,
    /// Signal number when killed
    pub signal: Option<i32>,
}

impl ChildExit {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn killed(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ChildExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit status {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// A running child
pub trait ChildProcess: Send {
    /// OS process id, or a synthetic id for fake children
    fn id(&self) -> u32;

    /// Non-blocking exit check
    fn try_wait(&mut self) -> Result<Option<ChildExit>>;

    /// Forcibly stop the child
    fn kill(&mut self) -> Result<()>;

    /// Block until the child exits
    fn wait(&mut self) -> Result<ChildExit>;
}

/// Creates children for out-of-process tasks
#[cfg_attr(test, mockall::automock)]
pub trait ProcessSpawner: Send + Sync {
    /// Start a child running `job`
    fn spawn(&self, job: ChildJob) -> Result<Box<dyn ChildProcess>>;

    /// Name used in logs
    fn name(&self) -> &'static str;
}

/// The spawner for the current platform
pub fn default_spawner() -> Arc<dyn ProcessSpawner> {
    #[cfg(unix)]
    {
        Arc::new(ForkSpawner)
    }
    #[cfg(not(unix))]
    {
        Arc::new(InProcessSpawner::new())
    }
}

// ==================== Fork ====================

/// Forks the current process for every child
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkSpawner;

#[cfg(unix)]
impl ProcessSpawner for ForkSpawner {
    fn spawn(&self, job: ChildJob) -> Result<Box<dyn ChildProcess>> {
        // Safety: the child only runs `job` and then `_exit`s without
        // returning into the parent's stack or running its destructors.
        //
        // Only the forking thread survives in the child. A lock some other
        // parent thread held at fork time (stdout behind `tracing`, an
        // allocator arena) stays locked forever there, so a child can hang
        // inside its first log line. Such a child never reports a return
        // code; `ExecutionCoordinator::terminate` kills it.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(ExecError::Spawn(format!(
                "fork failed: {}",
                std::io::Error::last_os_error()
            ))),
            0 => {
                let status = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                    Ok(()) => 0,
                    Err(_) => CHILD_PANIC_STATUS,
                };
                // Safety: terminates the child immediately.
                unsafe { libc::_exit(status) }
            }
            pid => {
                tracing::debug!("Forked child {}", pid);
                Ok(Box::new(ForkedChild { pid, exit: None }))
            }
        }
    }

    fn name(&self) -> &'static str {
        "fork"
    }
}

#[cfg(unix)]
struct ForkedChild {
    pid: libc::pid_t,
    exit: Option<ChildExit>,
}

#[cfg(unix)]
impl ForkedChild {
    fn decode(status: libc::c_int) -> ChildExit {
        if libc::WIFEXITED(status) {
            ChildExit::exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            ChildExit::killed(libc::WTERMSIG(status))
        } else {
            ChildExit {
                code: None,
                signal: None,
            }
        }
    }

    fn wait_with(&mut self, flags: libc::c_int) -> Result<Option<ChildExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        let mut status: libc::c_int = 0;
        // Safety: plain syscall on our own child pid.
        let ret = unsafe { libc::waitpid(self.pid, &mut status, flags) };
        match ret {
            0 => Ok(None),
            -1 => Err(ExecError::Spawn(format!(
                "waitpid({}) failed: {}",
                self.pid,
                std::io::Error::last_os_error()
            ))),
            _ => {
                let exit = Self::decode(status);
                self.exit = Some(exit);
                Ok(Some(exit))
            }
        }
    }
}

#[cfg(unix)]
impl ChildProcess for ForkedChild {
    fn id(&self) -> u32 {
        self.pid as u32
    }

    fn try_wait(&mut self) -> Result<Option<ChildExit>> {
        self.wait_with(libc::WNOHANG)
    }

    fn kill(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        // Safety: signals our own, not yet reaped, child.
        let ret = unsafe { libc::kill(self.pid, libc::SIGKILL) };
        if ret == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(ExecError::Spawn(format!("kill({}) failed: {}", self.pid, err)));
            }
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<ChildExit> {
        loop {
            if let Some(exit) = self.wait_with(0)? {
                return Ok(exit);
            }
        }
    }
}

#[cfg(unix)]
impl Drop for ForkedChild {
    fn drop(&mut self) {
        // reap if already gone so no zombie is left behind
        let _ = self.try_wait();
    }
}

// ==================== In-process ====================

/// Signal number reported for a killed in-process child
const IN_PROCESS_KILL_SIGNAL: i32 = 9;

/// Runs each child job on a thread.
///
/// `kill` cannot stop the thread; the child is reported as killed and the
/// thread is detached.
#[derive(Debug, Default)]
pub struct InProcessSpawner {
    next_id: AtomicU32,
}

impl InProcessSpawner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessSpawner for InProcessSpawner {
    fn spawn(&self, job: ChildJob) -> Result<Box<dyn ChildProcess>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = std::thread::Builder::new()
            .name(format!("nodexec-child-{}", id))
            .spawn(job)
            .map_err(|e| ExecError::Spawn(format!("Failed to start child thread: {}", e)))?;
        Ok(Box::new(ThreadChild {
            id,
            handle: Some(handle),
            exit: None,
        }))
    }

    fn name(&self) -> &'static str {
        "in-process"
    }
}

struct ThreadChild {
    id: u32,
    handle: Option<JoinHandle<()>>,
    exit: Option<ChildExit>,
}

impl ThreadChild {
    fn join(&mut self) -> ChildExit {
        let exit = match self.handle.take().map(JoinHandle::join) {
            Some(Ok(())) | None => ChildExit::exited(0),
            Some(Err(_)) => ChildExit::exited(CHILD_PANIC_STATUS),
        };
        self.exit = Some(exit);
        exit
    }
}

impl ChildProcess for ThreadChild {
    fn id(&self) -> u32 {
        self.id
    }

    fn try_wait(&mut self) -> Result<Option<ChildExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        match &self.handle {
            Some(handle) if !handle.is_finished() => Ok(None),
            _ => Ok(Some(self.join())),
        }
    }

    fn kill(&mut self) -> Result<()> {
        if self.exit.is_none() {
            tracing::warn!("In-process child {} cannot be killed, detaching it", self.id);
            self.handle = None;
            self.exit = Some(ChildExit::killed(IN_PROCESS_KILL_SIGNAL));
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<ChildExit> {
        match self.exit {
            Some(exit) => Ok(exit),
            None => Ok(self.join()),
        }
    }
}
