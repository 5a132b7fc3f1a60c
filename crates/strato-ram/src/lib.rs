//! Host backing store for guest physical RAM.
//!
//! This crate is the leaf of the memory subsystem: it knows how to obtain
//! host memory (anonymous or file-backed, optionally aligned or huge-page
//! backed), how to hand it out as named, resizeable [`RamBlock`]s, and how to
//! track which guest pages have been written through per-client
//! [`DirtyBitmap`]s. It knows nothing about guest address-space topology;
//! that lives in `strato-memory`.

mod block;
mod dirty;
mod host;

pub use block::{RamBlock, RamError, RamFlags, RamResult};
pub use dirty::{DirtyBitmap, DirtyClients, DirtySnapshot, DIRTY_CLIENT_COUNT};
pub use host::{host_page_size, HostMapping, Prot};

/// Log2 of the guest page granularity used for dispatch and dirty tracking.
pub const PAGE_BITS: u32 = 12;
/// Guest page granularity in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;
/// Mask of the in-page address bits.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;
