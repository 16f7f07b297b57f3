//! Deletion of consumed backing regions.
//!
//! Regions are removed as soon as replay has mapped them. A removal that fails
//! (a platform refusing to unlink a mapped file, say) is remembered and
//! retried on the next collection pass.

use crate::node::NodeId;
use crate::proxy::region::{belongs_to, remove_region};
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct RegionJanitor {
    pending: Vec<PathBuf>,
}

impl RegionJanitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete regions now, deferring the ones that cannot be removed yet
    pub fn release(&mut self, handles: impl IntoIterator<Item = PathBuf>) {
        for handle in handles {
            if let Err(e) = remove_region(&handle) {
                tracing::debug!("Deferring removal of {}: {}", handle.display(), e);
                self.pending.push(handle);
            }
        }
    }

    /// Retry deferred removals. Returns how many are still pending.
    pub fn collect(&mut self) -> usize {
        if !self.pending.is_empty() {
            let before = self.pending.len();
            self.pending.retain(|handle| remove_region(handle).is_err());
            tracing::debug!(
                "Region collection removed {} of {} deferred files",
                before - self.pending.len(),
                before
            );
        }
        self.pending.len()
    }

    /// Remove every file of `node` under `root`. Returns how many went away.
    pub fn purge_node(&mut self, root: &Path, node: NodeId) -> usize {
        self.collect();

        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Cannot list shm root {}: {}", root.display(), e);
                }
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !belongs_to(name, node) {
                continue;
            }
            match remove_region(&entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!("Failed to remove stale region {}: {}", name, e);
                    self.pending.push(entry.path());
                }
            }
        }
        if removed > 0 {
            tracing::debug!("Purged {} stale files of node {}", removed, node);
        }
        removed
    }

    pub fn pending(&self) -> &[PathBuf] {
        &self.pending
    }
}
