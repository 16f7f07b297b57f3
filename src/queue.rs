//! Output queue: the ordered log of side effects a computation emits.
//!
//! A compute callable never touches node or widget state directly. Every
//! effect is appended here as an [`OutputEvent`] and replayed by the owner
//! after the task finishes, in emission order.
//!
//! Two backings exist:
//! - **Memory**: a shared vector, used by thread and inline tasks
//! - **File**: an append-only log under the shm root, used by process tasks so
//!   the child's appends are visible to the parent after a fork
//!
//! Each file record is a little-endian `u32` length followed by the bincode
//! encoding of one event, written with a single `write_all` on a handle opened
//! in append mode.

use crate::error::{ExecError, Result, ResultExt};
use crate::node::NodeId;
use crate::proxy::region::{queue_handle, remove_region};
use crate::proxy::BufferProxy;
use crate::types::{Value, WidgetKwargs};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Size of the length prefix of a file record
const RECORD_HEADER_BYTES: usize = 4;

/// Data published on a port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataPayload {
    /// Plain value, applied as is
    Value(Value),
    /// Array that must be reconstructed from its proxy
    Proxy(BufferProxy),
}

/// One side effect emitted by a computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputEvent {
    DataSet { port: String, payload: DataPayload },
    ReturnCode(i32),
    WidgetModify { widget: String, kwargs: WidgetKwargs },
    Requeue(bool),
}

impl OutputEvent {
    /// Short tag used in logs
    pub fn tag(&self) -> &'static str {
        match self {
            OutputEvent::DataSet { .. } => "data-set",
            OutputEvent::ReturnCode(_) => "return-code",
            OutputEvent::WidgetModify { .. } => "widget-modify",
            OutputEvent::Requeue(_) => "requeue",
        }
    }
}

#[derive(Clone)]
enum Backing {
    Memory(Arc<Mutex<Vec<OutputEvent>>>),
    File(Arc<PathBuf>),
}

/// Per-invocation event log. Clones share the same log.
#[derive(Clone)]
pub struct OutputQueue {
    backing: Backing,
}

impl OutputQueue {
    /// Queue for computations sharing this address space
    pub fn in_memory() -> Self {
        Self {
            backing: Backing::Memory(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// File-backed queue visible to a forked child.
    ///
    /// Any log left over from an earlier invocation with the same number is
    /// truncated.
    pub fn create_shared(root: &Path, node: NodeId, invocation: u64) -> Result<Self> {
        let path = queue_handle(root, node, invocation);
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create shm root {}", root.display()))?;
        std::fs::File::create(&path)
            .with_context(|| format!("Failed to create queue log {}", path.display()))?;
        tracing::trace!("Created queue log {}", path.display());
        Ok(Self {
            backing: Backing::File(Arc::new(path)),
        })
    }

    /// Log file, for file-backed queues
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File(path) => Some(path),
            Backing::Memory(_) => None,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::File(_))
    }

    /// Add an event at the end of the log
    pub fn append(&self, event: OutputEvent) -> Result<()> {
        match &self.backing {
            Backing::Memory(events) => {
                events.lock().push(event);
                Ok(())
            }
            Backing::File(path) => {
                let body = bincode::serialize(&event)?;
                let len = u32::try_from(body.len()).map_err(|_| {
                    ExecError::Queue(format!("{} event of {} bytes too large", event.tag(), body.len()))
                })?;
                let mut record = Vec::with_capacity(RECORD_HEADER_BYTES + body.len());
                record.extend_from_slice(&len.to_le_bytes());
                record.extend_from_slice(&body);

                let mut file = OpenOptions::new()
                    .append(true)
                    .open(path.as_path())
                    .with_context(|| format!("Failed to open queue log {}", path.display()))?;
                file.write_all(&record)
                    .context("Failed to append to queue log")?;
                file.flush().context("Failed to flush queue log")
            }
        }
    }

    /// Current events without consuming them
    pub fn snapshot(&self) -> Result<Vec<OutputEvent>> {
        match &self.backing {
            Backing::Memory(events) => Ok(events.lock().clone()),
            Backing::File(path) => read_log(path),
        }
    }

    /// Take every event in emission order. A second drain returns nothing.
    pub fn drain(&self) -> Result<Vec<OutputEvent>> {
        match &self.backing {
            Backing::Memory(events) => Ok(std::mem::take(&mut *events.lock())),
            Backing::File(path) => {
                let events = read_log(path)?;
                remove_region(path).context("Failed to remove drained queue log")?;
                Ok(events)
            }
        }
    }

    /// Whether the computation reported a return code
    pub fn has_return_code(&self) -> bool {
        match &self.backing {
            Backing::Memory(events) => events
                .lock()
                .iter()
                .any(|e| matches!(e, OutputEvent::ReturnCode(_))),
            Backing::File(path) => match read_log(path) {
                Ok(events) => events.iter().any(|e| matches!(e, OutputEvent::ReturnCode(_))),
                Err(e) => {
                    tracing::warn!("Failed to inspect queue log: {}", e);
                    false
                }
            },
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all events and release the log file
    pub fn discard(&self) {
        match &self.backing {
            Backing::Memory(events) => events.lock().clear(),
            Backing::File(path) => {
                if let Err(e) = remove_region(path) {
                    tracing::warn!("Failed to remove queue log {}: {}", path.display(), e);
                }
            }
        }
    }
}

impl std::fmt::Debug for OutputQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.backing {
            Backing::Memory(events) => write!(f, "OutputQueue::Memory({} events)", events.lock().len()),
            Backing::File(path) => write!(f, "OutputQueue::File({})", path.display()),
        }
    }
}

/// Parse a log file. A missing file is an empty log; a truncated trailing
/// record (writer killed mid-append) is dropped.
fn read_log(path: &Path) -> Result<Vec<OutputEvent>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(ExecError::Io(e).with_context(format!("Failed to read queue log {}", path.display())))
        }
    };

    let mut events = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let Some(header) = data.get(offset..offset + RECORD_HEADER_BYTES) else {
            tracing::warn!("Queue log {} ends in a partial header", path.display());
            break;
        };
        let mut len_bytes = [0u8; RECORD_HEADER_BYTES];
        len_bytes.copy_from_slice(header);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let start = offset + RECORD_HEADER_BYTES;

        let Some(body) = data.get(start..start + len) else {
            tracing::warn!("Queue log {} ends in a truncated record", path.display());
            break;
        };
        match bincode::deserialize::<OutputEvent>(body) {
            Ok(event) => events.push(event),
            Err(e) => tracing::error!("Skipping corrupt queue record at {}: {}", offset, e),
        }
        offset = start + len;
    }
    Ok(events)
}
