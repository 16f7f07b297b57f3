//! Error handling for the node execution engine
//!
//! This module defines the crate error type and a Result alias. Failures that
//! happen inside a node's computation never surface through these types to the
//! owner: they are converted into return codes at the task boundary. The
//! variants here cover API misuse, data transfer and replay problems.

use crate::node::NodeId;
use crate::types::ElementType;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum ExecError {
    /// A second invocation was requested while one is still in flight
    #[error("Node {node} already has an invocation in flight")]
    AlreadyRunning { node: NodeId },

    /// The shared storage behind a proxy cannot be opened or has the wrong size
    #[error("Backing region {} unavailable: {reason}", handle.display())]
    BackingRegionUnavailable { handle: PathBuf, reason: String },

    /// A single element is larger than one transfer region can hold
    #[error("Element of {element_bytes} bytes does not fit a {limit} byte transfer region")]
    BufferTooLargeForSingleRegion { element_bytes: usize, limit: u64 },

    /// Segments of a split array could not be put back together
    #[error("Segment assembly failed: {0}")]
    SegmentAssembly(String),

    /// Array data does not match its declared shape
    #[error("Shape mismatch: expected {expected} elements, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Typed access with the wrong element type
    #[error("Element type mismatch: array is {actual}, requested {requested}")]
    ElementTypeMismatch {
        actual: ElementType,
        requested: ElementType,
    },

    /// Output port does not exist on the node
    #[error("Unknown output port '{0}'")]
    UnknownPort(String),

    /// Widget does not exist on the node
    #[error("Unknown widget '{0}'")]
    UnknownWidget(String),

    /// Errors related to the output queue log
    #[error("Output queue error: {0}")]
    Queue(String),

    /// Errors related to spawning an isolated computation
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ExecError>,
    },
}

impl ExecError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ExecError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context wrappers and return the innermost error
    pub fn root(&self) -> &ExecError {
        match self {
            ExecError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<bincode::Error> for ExecError {
    fn from(err: bincode::Error) -> Self {
        ExecError::Serialization(err.to_string())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, ExecError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| ExecError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ExecError::Io(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ExecError::UnknownPort("out".to_string());
        assert_eq!(err.to_string(), "Unknown output port 'out'");
    }

    #[test]
    fn test_error_with_context() {
        let err = ExecError::Queue("truncated record".to_string());
        let with_ctx = err.with_context("Failed to drain queue");
        assert!(with_ctx.to_string().contains("Failed to drain queue"));
        assert!(matches!(with_ctx.root(), ExecError::Queue(_)));
    }

    #[test]
    fn test_region_error_mentions_handle() {
        let err = ExecError::BackingRegionUnavailable {
            handle: PathBuf::from("/tmp/abc_3"),
            reason: "No such file".to_string(),
        };
        assert!(err.to_string().contains("/tmp/abc_3"));
        assert!(err.to_string().contains("No such file"));
    }

    #[test]
    fn test_io_result_context() {
        let res: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "gone",
        ));
        let err = res.context("opening region").unwrap_err();
        assert!(err.to_string().starts_with("opening region"));
        assert!(matches!(err.root(), ExecError::Io(_)));
    }
}
