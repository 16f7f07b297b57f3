//! Buffer proxies: moving numeric arrays out of an isolated computation.
//!
//! A computation running in a child process cannot hand its output arrays to
//! the owner directly. Instead it writes the bytes into a named backing region
//! under the shm root and sends a [`BufferProxy`] through the output queue.
//! The owner maps the region and gets the array back without a serializer pass
//! over the data.
//!
//! # Transfer Paths
//!
//! | Array size                    | Proxy kind      | Storage                     |
//! |-------------------------------|-----------------|-----------------------------|
//! | below the direct threshold    | `RawArray`      | bytes inside the proxy      |
//! | up to the single-region limit | `MappedArray`   | one region                  |
//! | above the single-region limit | `Segment` x n   | one region per segment      |
//!
//! Segments are reassembled with [`assemble_segments`] once all of them have
//! been received.

mod buffer;
pub mod region;
mod segment;
mod shared;

pub use buffer::{BufferProxy, ProxyKind, SegmentInfo};
pub use segment::assemble_segments;
pub use shared::{SharedArray, SharedBacking};
