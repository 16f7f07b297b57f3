//! # nodexec: Node Execution Engine
//!
//! Runs the user computation of a dataflow graph node under one of three
//! isolation modes and replays everything it produced back onto the node on
//! the owner's thread. The graph itself (canvas, persistence, widgets) lives
//! elsewhere and talks to the engine through [`node::NodeHandle`].
//!
//! ## Architecture
//!
//! - **Coordinator**: per-node façade driving validate, compute and publish
//! - **Tasks**: inline, threaded and out-of-process execution behind one contract
//! - **Output Queue**: ordered log of data sets, widget changes, requeue requests
//!   and return codes emitted by a computation
//! - **Buffer Proxies**: move large arrays out of a child process through named
//!   memory-mapped regions instead of serializing them
//! - **Communication**: Crossbeam channels for task events and notifications
//!
//! ## Shm Root
//!
//! Backing regions and queue logs live under a configurable directory,
//! by default under the platform runtime directory:
//!
//! - **Linux**: `$XDG_RUNTIME_DIR/nodexec.shm/`
//! - **macOS / Windows**: `<temp dir>/nodexec.shm/`
//!
//! ## Example
//!
//! ```ignore
//! use nodexec::{EngineConfig, ExecutionCoordinator, GraphNode, IsolationMode, NodeId};
//! use std::sync::Arc;
//!
//! let mut node = GraphNode::new(NodeId(1), "Scale")
//!     .with_isolation(IsolationMode::Process)
//!     .with_output("out")
//!     .with_compute(|ctx| {
//!         ctx.set_data("out", 42)?;
//!         Ok(0)
//!     });
//!
//! let config = Arc::new(EngineConfig::default());
//! let mut coordinator = ExecutionCoordinator::with_default_spawner(&node, config);
//! coordinator.start(&mut node)?;
//! let notification = coordinator.wait(&mut node);
//! assert_eq!(coordinator.return_code(), Some(0));
//! ```

pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod node;
pub mod proxy;
pub mod queue;
pub mod task;
pub mod types;

// Re-export commonly used types
pub use config::{EngineConfig, TransferConfig};
pub use context::ComputeContext;
pub use coordinator::{ExecutionCoordinator, Notification, NotificationKind, Phase, ValidationOutcome};
pub use error::{ExecError, Result};
pub use node::{GraphNode, NodeHandle, NodeId};
pub use proxy::{assemble_segments, BufferProxy, SharedArray};
pub use queue::{DataPayload, OutputEvent, OutputQueue};
pub use task::{ExecutionTask, InProcessSpawner, ProcessSpawner, TaskEvent, TaskState};
pub use types::{ElementType, IsolationMode, NdArray, Value};
