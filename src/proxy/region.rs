//! Named backing regions under the shm root.
//!
//! A region is a plain file sized to exactly the bytes it carries and mapped
//! into memory on both sides. Names are derived from the consuming node and the
//! port so repeated invocations overwrite the same file instead of leaking new
//! ones:
//!
//! ```text
//! <shm_root>/<sha256(port)[..16] hex>_<node>          whole array
//! <shm_root>/<sha256(port)[..16] hex>_<node>_s<index> one segment
//! <shm_root>/queue_<node>_<invocation>.log            output queue log
//! ```

use crate::error::{ExecError, Result};
use crate::node::NodeId;
use memmap2::{Mmap, MmapMut, MmapOptions};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Number of digest bytes used in a region name
const NAME_DIGEST_BYTES: usize = 16;

fn hex_digest(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    digest[..NAME_DIGEST_BYTES]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Region handle for a (consumer, port) pair.
pub fn region_handle(root: &Path, consumer: NodeId, port: &str) -> PathBuf {
    root.join(format!("{}_{}", hex_digest(port), consumer.raw()))
}

/// Handle of one segment derived from the whole-array handle.
pub fn segment_handle(base: &Path, index: usize) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!("_s{}", index));
    PathBuf::from(name)
}

/// Handle of the output queue log of one invocation.
pub fn queue_handle(root: &Path, consumer: NodeId, invocation: u64) -> PathBuf {
    root.join(format!("queue_{}_{}.log", consumer.raw(), invocation))
}

/// Whether a file name in the shm root belongs to `node`.
pub fn belongs_to(file_name: &str, node: NodeId) -> bool {
    file_name
        .split('_')
        .nth(1)
        .map(|part| part.trim_end_matches(".log") == node.raw().to_string())
        .unwrap_or(false)
}

/// Create (or replace) a region of `len` bytes and map it writable.
pub fn create_region(handle: &Path, len: usize) -> Result<MmapMut> {
    let unavailable = |reason: String| ExecError::BackingRegionUnavailable {
        handle: handle.to_path_buf(),
        reason,
    };

    if let Some(parent) = handle.parent() {
        std::fs::create_dir_all(parent).map_err(|e| unavailable(e.to_string()))?;
    }

    // Unlink first so an array still mapped from the previous invocation
    // keeps its own inode.
    remove_region(handle).map_err(|e| unavailable(e.to_string()))?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(handle)
        .map_err(|e| unavailable(e.to_string()))?;

    file.set_len(len as u64)
        .map_err(|e| unavailable(e.to_string()))?;

    // Safety: the file was just created; nothing else maps it until the proxy
    // naming it is published.
    unsafe { MmapOptions::new().len(len).map_mut(&file) }
        .map_err(|e| unavailable(format!("mmap failed: {}", e)))
}

/// Open a region read-only, checking it holds exactly `expected_len` bytes.
pub fn open_region(handle: &Path, expected_len: usize) -> Result<Mmap> {
    let unavailable = |reason: String| ExecError::BackingRegionUnavailable {
        handle: handle.to_path_buf(),
        reason,
    };

    let file = File::open(handle).map_err(|e| unavailable(e.to_string()))?;
    let actual = file
        .metadata()
        .map_err(|e| unavailable(e.to_string()))?
        .len();
    if actual != expected_len as u64 {
        return Err(unavailable(format!(
            "holds {} bytes, expected {}",
            actual, expected_len
        )));
    }

    // Safety: producers finish writing a region before publishing its proxy
    // and never touch it afterwards.
    unsafe { Mmap::map(&file) }.map_err(|e| unavailable(format!("mmap failed: {}", e)))
}

/// Delete a region, treating an already-missing file as success.
pub fn remove_region(handle: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(handle) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
