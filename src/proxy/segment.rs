//! Reassembly of arrays split across several regions.

use super::buffer::BufferProxy;
use crate::error::{ExecError, Result};
use crate::types::{element_count, NdArray};

/// Put a split array back together.
///
/// Segments may arrive in any order. All of them must describe the same array
/// and indices `0..count` must each be present exactly once; anything else is
/// a [`ExecError::SegmentAssembly`] the caller is expected to recover from.
pub fn assemble_segments(segments: &[BufferProxy]) -> Result<NdArray> {
    let fail = |msg: String| Err(ExecError::SegmentAssembly(msg));

    let Some(first) = segments.first() else {
        return fail("no segments".to_string());
    };
    let Some(head) = first.segment() else {
        return fail("proxy is not a segment".to_string());
    };

    let count = head.count;
    let mut ordered: Vec<Option<&BufferProxy>> = vec![None; count];

    for proxy in segments {
        let Some(info) = proxy.segment() else {
            return fail("proxy is not a segment".to_string());
        };
        if info.count != count || info.array_id != head.array_id {
            return fail(format!(
                "segment {} belongs to a different array ({} of {}, id {:#x})",
                info.index, info.index, info.count, info.array_id
            ));
        }
        if proxy.shape() != first.shape() || proxy.element_type() != first.element_type() {
            return fail(format!("segment {} has a different shape or type", info.index));
        }
        match ordered.get_mut(info.index) {
            None => return fail(format!("segment index {} out of range 0..{}", info.index, count)),
            Some(slot) if slot.is_some() => {
                return fail(format!("segment {} present twice", info.index))
            }
            Some(slot) => *slot = Some(proxy),
        }
    }

    if let Some(missing) = ordered.iter().position(Option::is_none) {
        return fail(format!(
            "missing segment {} of {} ({} received)",
            missing,
            count,
            segments.len()
        ));
    }

    let element_bytes = first.element_type().size_bytes();
    let total = element_count(first.shape());
    let mut bytes = Vec::with_capacity(total * element_bytes);
    let mut next_offset = 0;

    for proxy in ordered.into_iter().flatten() {
        let info = proxy.segment().ok_or_else(|| {
            ExecError::SegmentAssembly("proxy is not a segment".to_string())
        })?;
        if info.element_offset != next_offset {
            return fail(format!(
                "segment {} starts at element {}, expected {}",
                info.index, info.element_offset, next_offset
            ));
        }
        bytes.extend_from_slice(&proxy.read_segment()?);
        next_offset += info.element_len;
    }

    if next_offset != total {
        return fail(format!("segments cover {} of {} elements", next_offset, total));
    }

    NdArray::from_bytes(first.shape().to_vec(), first.element_type(), bytes)
}
