use super::region::{create_region, open_region, region_handle, segment_handle};
use super::shared::{SharedArray, SharedBacking};
use crate::config::TransferConfig;
use crate::error::{ExecError, Result};
use crate::node::NodeId;
use crate::types::{element_count, ElementType, NdArray};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

static NEXT_ARRAY_ID: AtomicU32 = AtomicU32::new(1);

/// Identifier tying the segments of one split array together. Unique across
/// processes sharing an shm root.
fn next_array_id() -> u64 {
    ((std::process::id() as u64) << 32) | NEXT_ARRAY_ID.fetch_add(1, Ordering::Relaxed) as u64
}

/// How the bytes of a proxied array travel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// Whole array in one backing region
    MappedArray,
    /// Bytes carried inside the proxy
    RawArray,
    /// One piece of an array split across several regions
    Segment,
}

/// Position of one segment inside its array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub index: usize,
    pub count: usize,
    /// Shared by every segment of the same array
    pub array_id: u64,
    /// First element (in C order) covered by this segment
    pub element_offset: usize,
    /// Number of elements in this segment
    pub element_len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum ProxyStorage {
    Mapped { handle: PathBuf },
    Raw { bytes: Vec<u8> },
    Segment { handle: PathBuf, info: SegmentInfo },
}

/// Lightweight description of a numeric array that another process can turn
/// back into the array.
///
/// The proxy does not own its backing region. Regions are reclaimed by the
/// coordinator's janitor after replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferProxy {
    shape: Vec<usize>,
    element_type: ElementType,
    storage: ProxyStorage,
}

impl BufferProxy {
    /// Describe `array` for transfer to `consumer`'s owner.
    ///
    /// Small arrays are carried inline. Anything else is copied into a region
    /// named after `(consumer, port)`, or into `preallocated` when given.
    /// Arrays above the single-region limit are split into one region per
    /// segment; the caller must send every returned proxy.
    pub fn from_array(
        array: &NdArray,
        consumer: NodeId,
        port: &str,
        preallocated: Option<&Path>,
        transfer: &TransferConfig,
    ) -> Result<Vec<BufferProxy>> {
        let nbytes = array.nbytes() as u64;

        if nbytes > transfer.single_region_limit {
            let base = region_handle(&transfer.shm_root, consumer, port);
            return split_into_segments(array, &base, transfer);
        }

        if nbytes == 0 || (preallocated.is_none() && nbytes < transfer.direct_transfer_threshold) {
            return Ok(vec![BufferProxy {
                shape: array.shape().to_vec(),
                element_type: array.element_type(),
                storage: ProxyStorage::Raw {
                    bytes: array.as_bytes().to_vec(),
                },
            }]);
        }

        let handle = match preallocated {
            Some(path) => path.to_path_buf(),
            None => region_handle(&transfer.shm_root, consumer, port),
        };
        write_region(&handle, array.as_bytes())?;

        Ok(vec![BufferProxy {
            shape: array.shape().to_vec(),
            element_type: array.element_type(),
            storage: ProxyStorage::Mapped { handle },
        }])
    }

    /// Describe an array the computation built in place.
    ///
    /// Region-backed arrays are flushed and referenced without copying;
    /// heap-backed ones go through [`BufferProxy::from_array`].
    pub fn from_shared(
        shared: SharedArray,
        consumer: NodeId,
        port: &str,
        transfer: &TransferConfig,
    ) -> Result<Vec<BufferProxy>> {
        let shape = shared.shape().to_vec();
        let element_type = shared.element_type();
        match shared.into_backing()? {
            SharedBacking::Region(handle) => Ok(vec![BufferProxy {
                shape,
                element_type,
                storage: ProxyStorage::Mapped { handle },
            }]),
            SharedBacking::Heap(array) => Self::from_array(&array, consumer, port, None, transfer),
        }
    }

    pub fn kind(&self) -> ProxyKind {
        match self.storage {
            ProxyStorage::Mapped { .. } => ProxyKind::MappedArray,
            ProxyStorage::Raw { .. } => ProxyKind::RawArray,
            ProxyStorage::Segment { .. } => ProxyKind::Segment,
        }
    }

    /// Shape of the whole array (for a segment, of the array it belongs to)
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Region holding the bytes, if any
    pub fn backing_handle(&self) -> Option<&Path> {
        match &self.storage {
            ProxyStorage::Mapped { handle } | ProxyStorage::Segment { handle, .. } => Some(handle),
            ProxyStorage::Raw { .. } => None,
        }
    }

    pub fn segment(&self) -> Option<&SegmentInfo> {
        match &self.storage {
            ProxyStorage::Segment { info, .. } => Some(info),
            _ => None,
        }
    }

    pub fn is_segment(&self) -> bool {
        self.segment().is_some()
    }

    /// Bytes this proxy's storage must hold
    pub fn expected_bytes(&self) -> usize {
        let elements = match &self.storage {
            ProxyStorage::Segment { info, .. } => info.element_len,
            _ => element_count(&self.shape),
        };
        elements * self.element_type.size_bytes()
    }

    /// Rebuild the array.
    ///
    /// Mapped proxies yield a read-only view over the region. Segments must go
    /// through [`assemble_segments`](super::assemble_segments).
    pub fn to_array(&self) -> Result<NdArray> {
        match &self.storage {
            ProxyStorage::Raw { bytes } => {
                NdArray::from_bytes(self.shape.clone(), self.element_type, bytes.clone())
            }
            ProxyStorage::Mapped { handle } => {
                let map = open_region(handle, self.expected_bytes())?;
                NdArray::mapped(self.shape.clone(), self.element_type, Arc::new(map))
            }
            ProxyStorage::Segment { info, .. } => Err(ExecError::SegmentAssembly(format!(
                "segment {} of {} cannot be reconstructed on its own",
                info.index, info.count
            ))),
        }
    }

    /// Read the raw bytes of one segment
    pub(crate) fn read_segment(&self) -> Result<Vec<u8>> {
        match &self.storage {
            ProxyStorage::Segment { handle, .. } => {
                let map = open_region(handle, self.expected_bytes())?;
                Ok(map.to_vec())
            }
            _ => Err(ExecError::SegmentAssembly(
                "proxy is not a segment".to_string(),
            )),
        }
    }
}

fn write_region(handle: &Path, bytes: &[u8]) -> Result<()> {
    let mut map = create_region(handle, bytes.len())?;
    map.copy_from_slice(bytes);
    map.flush().map_err(|e| ExecError::BackingRegionUnavailable {
        handle: handle.to_path_buf(),
        reason: format!("flush failed: {}", e),
    })
}

fn split_into_segments(
    array: &NdArray,
    base: &Path,
    transfer: &TransferConfig,
) -> Result<Vec<BufferProxy>> {
    let element_bytes = array.element_type().size_bytes();
    if element_bytes as u64 > transfer.single_region_limit {
        return Err(ExecError::BufferTooLargeForSingleRegion {
            element_bytes,
            limit: transfer.single_region_limit,
        });
    }

    let target = transfer.segment_bytes.min(transfer.single_region_limit);
    let per_segment = ((target / element_bytes as u64) as usize).max(1);
    let total = array.len();
    let count = total.div_ceil(per_segment);
    let array_id = next_array_id();
    let bytes = array.as_bytes();

    tracing::debug!(
        "Splitting {} byte array into {} segments of up to {} elements",
        bytes.len(),
        count,
        per_segment
    );

    let mut proxies = Vec::with_capacity(count);
    for index in 0..count {
        let element_offset = index * per_segment;
        let element_len = per_segment.min(total - element_offset);
        let start = element_offset * element_bytes;
        let end = start + element_len * element_bytes;

        let handle = segment_handle(base, index);
        write_region(&handle, &bytes[start..end])?;

        proxies.push(BufferProxy {
            shape: array.shape().to_vec(),
            element_type: array.element_type(),
            storage: ProxyStorage::Segment {
                handle,
                info: SegmentInfo {
                    index,
                    count,
                    array_id,
                    element_offset,
                    element_len,
                },
            },
        });
    }
    Ok(proxies)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(root: &Path) -> TransferConfig {
        let mut t = TransferConfig::with_root(root);
        t.direct_transfer_threshold = 64;
        t
    }

    #[test]
    fn test_small_array_travels_inline() {
        let dir = tempfile::tempdir().unwrap();
        let a = NdArray::from_vec(vec![4], vec![1u8, 2, 3, 4]).unwrap();
        let proxies = BufferProxy::from_array(&a, NodeId(1), "out", None, &transfer(dir.path())).unwrap();

        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].kind(), ProxyKind::RawArray);
        assert!(proxies[0].backing_handle().is_none());
        assert_eq!(proxies[0].to_array().unwrap(), a);
        assert_eq!(std::fs::read_dir(dir.path()).map(|d| d.count()).unwrap_or(0), 0);
    }

    #[test]
    fn test_mapped_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<f64> = (0..100).map(|i| i as f64 * 0.5).collect();
        let a = NdArray::from_vec(vec![10, 10], data).unwrap();
        let proxies = BufferProxy::from_array(&a, NodeId(7), "image", None, &transfer(dir.path())).unwrap();

        assert_eq!(proxies.len(), 1);
        let proxy = &proxies[0];
        assert_eq!(proxy.kind(), ProxyKind::MappedArray);
        assert!(proxy.backing_handle().unwrap().exists());

        let back = proxy.to_array().unwrap();
        assert!(back.is_mapped());
        assert_eq!(back, a);
    }

    #[test]
    fn test_preallocated_handle_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let handle = dir.path().join("custom_3");
        let a = NdArray::from_vec(vec![2], vec![5u16, 6]).unwrap();
        let proxies =
            BufferProxy::from_array(&a, NodeId(3), "out", Some(&handle), &transfer(dir.path())).unwrap();
        assert_eq!(proxies[0].backing_handle(), Some(handle.as_path()));
        assert_eq!(proxies[0].to_array().unwrap(), a);
    }

    #[test]
    fn test_missing_region_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let a = NdArray::zeros(vec![32], ElementType::F32);
        let proxies = BufferProxy::from_array(&a, NodeId(1), "out", None, &transfer(dir.path())).unwrap();
        std::fs::remove_file(proxies[0].backing_handle().unwrap()).unwrap();

        assert!(matches!(
            proxies[0].to_array(),
            Err(ExecError::BackingRegionUnavailable { .. })
        ));
    }

    #[test]
    fn test_split_when_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = transfer(dir.path());
        t.single_region_limit = 32;
        t.segment_bytes = 16;

        let a = NdArray::from_vec(vec![5, 2], (0..10).collect::<Vec<i32>>()).unwrap();
        let proxies = BufferProxy::from_array(&a, NodeId(2), "out", None, &t).unwrap();

        // 4 elements per segment: 4 + 4 + 2
        assert_eq!(proxies.len(), 3);
        for (i, p) in proxies.iter().enumerate() {
            let info = p.segment().unwrap();
            assert_eq!(info.index, i);
            assert_eq!(info.count, 3);
            assert_eq!(info.array_id, proxies[0].segment().unwrap().array_id);
            assert!(p.to_array().is_err());
        }
        assert_eq!(proxies[2].segment().unwrap().element_len, 2);
    }

    #[test]
    fn test_element_larger_than_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = transfer(dir.path());
        t.single_region_limit = 4;
        let a = NdArray::from_vec(vec![2], vec![1.0f64, 2.0]).unwrap();

        assert!(matches!(
            BufferProxy::from_array(&a, NodeId(1), "out", None, &t),
            Err(ExecError::BufferTooLargeForSingleRegion { element_bytes: 8, limit: 4 })
        ));
    }

    #[test]
    fn test_proxy_serializes_with_bincode() {
        let dir = tempfile::tempdir().unwrap();
        let a = NdArray::zeros(vec![64], ElementType::U8);
        let proxies = BufferProxy::from_array(&a, NodeId(1), "out", None, &transfer(dir.path())).unwrap();
        let bytes = bincode::serialize(&proxies[0]).unwrap();
        let back: BufferProxy = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, proxies[0]);
        assert_eq!(back.kind(), ProxyKind::MappedArray);
    }
}
