//! Arrays written in place by a computation.
//!
//! In process mode a compute callable can ask for an output array that already
//! lives in a named region, fill it, and publish it without a second copy.
//! Other modes get a heap buffer with the same interface.

use super::region::{create_region, region_handle};
use crate::config::TransferConfig;
use crate::error::{ExecError, Result};
use crate::node::NodeId;
use crate::types::{element_count, encode_elements, Element, ElementType, NdArray};
use memmap2::MmapMut;
use std::path::{Path, PathBuf};

enum SharedStorage {
    Region { handle: PathBuf, map: MmapMut },
    Heap(Vec<u8>),
}

/// Where a finished shared array ended up
pub enum SharedBacking {
    Region(PathBuf),
    Heap(NdArray),
}

/// Writable array, optionally backed by a named region
pub struct SharedArray {
    shape: Vec<usize>,
    element_type: ElementType,
    storage: SharedStorage,
}

impl SharedArray {
    /// Allocate a region-backed array for `consumer`.
    ///
    /// Arrays that are empty or too big for one region fall back to the heap
    /// and are proxied normally when published.
    pub fn allocate(
        shape: Vec<usize>,
        element_type: ElementType,
        consumer: NodeId,
        name: &str,
        transfer: &TransferConfig,
    ) -> Result<Self> {
        let nbytes = element_count(&shape) * element_type.size_bytes();
        if nbytes == 0 || nbytes as u64 > transfer.single_region_limit {
            return Ok(Self::heap(shape, element_type));
        }

        let handle = region_handle(&transfer.shm_root, consumer, name);
        let map = create_region(&handle, nbytes)?;
        tracing::debug!("Allocated {} byte shared array at {}", nbytes, handle.display());
        Ok(Self {
            shape,
            element_type,
            storage: SharedStorage::Region { handle, map },
        })
    }

    /// Zero-filled heap array
    pub fn heap(shape: Vec<usize>, element_type: ElementType) -> Self {
        let nbytes = element_count(&shape) * element_type.size_bytes();
        Self {
            shape,
            element_type,
            storage: SharedStorage::Heap(vec![0u8; nbytes]),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn len(&self) -> usize {
        element_count(&self.shape)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Region file, when region-backed
    pub fn handle(&self) -> Option<&Path> {
        match &self.storage {
            SharedStorage::Region { handle, .. } => Some(handle),
            SharedStorage::Heap(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            SharedStorage::Region { map, .. } => &map[..],
            SharedStorage::Heap(bytes) => bytes,
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            SharedStorage::Region { map, .. } => &mut map[..],
            SharedStorage::Heap(bytes) => bytes,
        }
    }

    fn check_type<T: Element>(&self) -> Result<()> {
        if T::ELEMENT_TYPE != self.element_type {
            return Err(ExecError::ElementTypeMismatch {
                actual: self.element_type,
                requested: T::ELEMENT_TYPE,
            });
        }
        Ok(())
    }

    /// Overwrite every element
    pub fn copy_from_slice<T: Element>(&mut self, data: &[T]) -> Result<()> {
        self.check_type::<T>()?;
        if data.len() != self.len() {
            return Err(ExecError::ShapeMismatch {
                expected: self.len(),
                actual: data.len(),
            });
        }
        encode_elements(data, self.bytes_mut());
        Ok(())
    }

    /// Write one element at a flat C-order index
    pub fn set<T: Element>(&mut self, index: usize, value: T) -> Result<()> {
        self.check_type::<T>()?;
        if index >= self.len() {
            return Err(ExecError::ShapeMismatch {
                expected: self.len(),
                actual: index + 1,
            });
        }
        let size = self.element_type.size_bytes();
        value.write_bytes(&mut self.bytes_mut()[index * size..(index + 1) * size]);
        Ok(())
    }

    /// Finish writing. Region contents are flushed before the handle is
    /// returned.
    pub fn into_backing(self) -> Result<SharedBacking> {
        match self.storage {
            SharedStorage::Region { handle, map } => {
                map.flush().map_err(|e| ExecError::BackingRegionUnavailable {
                    handle: handle.clone(),
                    reason: format!("flush failed: {}", e),
                })?;
                Ok(SharedBacking::Region(handle))
            }
            SharedStorage::Heap(bytes) => Ok(SharedBacking::Heap(NdArray::from_bytes(
                self.shape,
                self.element_type,
                bytes,
            )?)),
        }
    }

    /// Freeze into an array usable in this process
    pub fn into_array(self) -> Result<NdArray> {
        match self.storage {
            SharedStorage::Region { handle, map } => {
                let map = map
                    .make_read_only()
                    .map_err(|e| ExecError::BackingRegionUnavailable {
                        handle,
                        reason: e.to_string(),
                    })?;
                NdArray::mapped(self.shape, self.element_type, std::sync::Arc::new(map))
            }
            SharedStorage::Heap(bytes) => NdArray::from_bytes(self.shape, self.element_type, bytes),
        }
    }
}

impl std::fmt::Debug for SharedArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedArray")
            .field("shape", &self.shape)
            .field("element_type", &self.element_type)
            .field("handle", &self.handle())
            .finish()
    }
}
