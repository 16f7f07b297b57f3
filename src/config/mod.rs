//! Configuration module for the execution engine
//!
//! This module handles engine configuration including:
//! - Where transient backing regions and queue logs live (the shm root)
//! - Transfer limits for large numeric buffers
//! - Liveness polling of out-of-process tasks
//! - Per-platform isolation mode overrides
//! - Logging setup
//!
//! # Shm Root Location
//!
//! Backing regions are created under the platform runtime directory when one
//! exists, otherwise the temp directory:
//! - **Linux**: `$XDG_RUNTIME_DIR/nodexec.shm/`
//! - **macOS / Windows**: `<temp dir>/nodexec.shm/`
//!
//! When that directory is not writable a per-process fallback
//! `<temp dir>/nodexec.shm_<pid>/` is used.
//!
//! # Files
//!
//! Configuration can be read from TOML (`.toml`) or JSON (`.json`).
//!
//! # Example
//!
//! ```ignore
//! use nodexec::config::EngineConfig;
//!
//! let config = EngineConfig::load_or_default(Some("nodexec.toml".as_ref()));
//! let mode = config.resolve_isolation(Some(IsolationMode::Process));
//! ```

use crate::error::{ExecError, Result};
use crate::logging::LoggingConfig;
use crate::types::IsolationMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name for backing regions and queue logs
pub const SHM_DIR_NAME: &str = "nodexec.shm";

/// Default liveness poll interval for out-of-process tasks
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Default size limit of a single transfer region (2 GiB)
pub const DEFAULT_SINGLE_REGION_LIMIT: u64 = 2 * 1024 * 1024 * 1024;

/// Default target size of one segment when splitting (1 GiB)
pub const DEFAULT_SEGMENT_BYTES: u64 = 1024 * 1024 * 1024;

/// Arrays below this size travel inline instead of through a region (32 MiB)
pub const DEFAULT_DIRECT_TRANSFER_THRESHOLD: u64 = 32 * 1024 * 1024;

// ==================== Platform Overrides ====================

/// Replaces one isolation mode with another on a named platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformOverride {
    /// Value of `std::env::consts::OS` this applies to
    pub os: String,
    /// Mode the node asked for
    pub from: IsolationMode,
    /// Mode it runs under instead
    pub to: IsolationMode,
}

fn default_platform_overrides() -> Vec<PlatformOverride> {
    vec![PlatformOverride {
        os: "windows".to_string(),
        from: IsolationMode::Process,
        to: IsolationMode::Thread,
    }]
}

// ==================== Transfer Config ====================

/// Limits used when moving arrays out of an isolated computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Directory holding backing regions
    pub shm_root: PathBuf,
    /// Largest byte count a single region may hold
    pub single_region_limit: u64,
    /// Target byte count of each segment when an array is split
    pub segment_bytes: u64,
    /// Arrays smaller than this are carried inline
    pub direct_transfer_threshold: u64,
}

impl TransferConfig {
    /// Transfer limits rooted at `shm_root`, everything else default
    pub fn with_root(shm_root: impl Into<PathBuf>) -> Self {
        Self {
            shm_root: shm_root.into(),
            single_region_limit: DEFAULT_SINGLE_REGION_LIMIT,
            segment_bytes: DEFAULT_SEGMENT_BYTES,
            direct_transfer_threshold: DEFAULT_DIRECT_TRANSFER_THRESHOLD,
        }
    }
}

// ==================== Engine Config ====================

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for backing regions and queue logs
    #[serde(default = "default_shm_root")]
    pub shm_root: PathBuf,

    /// Liveness poll interval for out-of-process tasks, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Largest byte count a single transfer region may hold
    #[serde(default = "default_single_region_limit")]
    pub single_region_limit: u64,

    /// Target byte count per segment when splitting
    #[serde(default = "default_segment_bytes")]
    pub segment_bytes: u64,

    /// Arrays smaller than this are sent inline
    #[serde(default = "default_direct_transfer_threshold")]
    pub direct_transfer_threshold: u64,

    /// Mode used when a node does not declare a preference
    #[serde(default)]
    pub default_isolation: IsolationMode,

    /// Platform-specific mode replacements
    #[serde(default = "default_platform_overrides")]
    pub platform_overrides: Vec<PlatformOverride>,

    /// Logging setup
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_shm_root() -> PathBuf {
    dirs_next::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(SHM_DIR_NAME)
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_single_region_limit() -> u64 {
    DEFAULT_SINGLE_REGION_LIMIT
}

fn default_segment_bytes() -> u64 {
    DEFAULT_SEGMENT_BYTES
}

fn default_direct_transfer_threshold() -> u64 {
    DEFAULT_DIRECT_TRANSFER_THRESHOLD
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shm_root: default_shm_root(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            single_region_limit: DEFAULT_SINGLE_REGION_LIMIT,
            segment_bytes: DEFAULT_SEGMENT_BYTES,
            direct_transfer_threshold: DEFAULT_DIRECT_TRANSFER_THRESHOLD,
            default_isolation: IsolationMode::Process,
            platform_overrides: default_platform_overrides(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration file, picking the format from the extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExecError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| ExecError::Config(format!("Failed to parse config: {}", e))),
            _ => toml::from_str(&content)
                .map_err(|e| ExecError::Config(format!("Failed to parse config: {}", e))),
        }
    }

    /// Load a configuration file, returning defaults on any error
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load engine config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ExecError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| ExecError::Config(format!("Failed to write config: {}", e)))
    }

    /// Liveness poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Pick the mode for a node on the current platform
    pub fn resolve_isolation(&self, preferred: Option<IsolationMode>) -> IsolationMode {
        self.resolve_isolation_for(std::env::consts::OS, preferred)
    }

    /// Pick the mode for a node on a named platform.
    ///
    /// Nodes without a preference get `default_isolation`; the override table
    /// applies afterwards either way.
    pub fn resolve_isolation_for(&self, os: &str, preferred: Option<IsolationMode>) -> IsolationMode {
        let preferred = preferred.unwrap_or(self.default_isolation);
        match self
            .platform_overrides
            .iter()
            .find(|o| o.os == os && o.from == preferred)
        {
            Some(o) => {
                tracing::info!(
                    "Isolation override on {}: forcing {} -> {}",
                    os,
                    o.from,
                    o.to
                );
                o.to
            }
            None => preferred,
        }
    }

    /// Transfer limits derived from this config
    pub fn transfer(&self) -> TransferConfig {
        TransferConfig {
            shm_root: self.shm_root.clone(),
            single_region_limit: self.single_region_limit,
            segment_bytes: self.segment_bytes,
            direct_transfer_threshold: self.direct_transfer_threshold,
        }
    }

    /// Ensure the shm root exists and is writable
    ///
    /// Falls back to a per-process directory under the temp dir and updates
    /// `shm_root` accordingly.
    pub fn ensure_shm_root(&mut self) -> Result<PathBuf> {
        match prepare_dir(&self.shm_root) {
            Ok(()) => {
                tracing::debug!("Using shm root {}", self.shm_root.display());
            }
            Err(e) => {
                let fallback = std::env::temp_dir()
                    .join(format!("{}_{}", SHM_DIR_NAME, std::process::id()));
                tracing::warn!(
                    "Shm root {} unusable ({}), falling back to {}",
                    self.shm_root.display(),
                    e,
                    fallback.display()
                );
                prepare_dir(&fallback).map_err(|e| {
                    ExecError::Config(format!("Failed to create shm root: {}", e))
                })?;
                self.shm_root = fallback;
            }
        }
        Ok(self.shm_root.clone())
    }
}

/// Create `dir` and verify a file can be written into it
fn prepare_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(format!(".probe_{}", std::process::id()));
    std::fs::write(&probe, b"")?;
    std::fs::remove_file(&probe)
}
