//! Guest physical address-space topology and access.
//!
//! This crate gives every vCPU and device model one coherent view of guest
//! physical memory, composed from a tree of heterogeneous regions:
//!
//! - Bus and device setup code declares [`region`]s (RAM, ROM, device MMIO
//!   windows, IOMMU windows, aliases, containers) in a [`MemoryTopology`]
//!   and attaches them with priorities.
//! - Each commit [`flatten`]s the tree into a sorted, disjoint view and
//!   builds a fresh [`DispatchMap`], a radix trie resolving any address to
//!   its backing section in a handful of hops.
//! - The map is published with a single atomic store; vCPU threads read it
//!   lock-free through per-thread [`MemAccessor`]s, and superseded maps are
//!   reclaimed only after an [`epoch`] grace period.
//! - Writes to RAM feed per-client dirty bitmaps for migration and display
//!   refresh.
//!
//! Address spaces are explicit context objects: independent spaces (per-CPU,
//! DMA behind an IOMMU) coexist without shared mutable state.

mod access;
mod dirty;
mod dispatch;
mod epoch;
mod flatten;
mod ops;
mod range;
mod region;
mod topology;

pub use access::{GuestMapping, MemAccessor, BOUNCE_SIZE};
pub use dispatch::{DispatchMap, Section, ADDR_BITS, UNASSIGNED_SECTION};
pub use epoch::{EpochDomain, EpochGuard, ReaderHandle};
pub use flatten::{flatten, FlatRange, FlatView, SectionBacking};
pub use ops::{
    AccessAttrs, AccessConstraints, AccessError, AccessResult, DeviceOps, Endianness,
    IommuInvalidate, IommuOps, IommuPerm, IommuTranslation,
};
pub use range::AddrRange;
pub use region::{Region, RegionBacking, RegionError, RegionId, RegionRegistry, RegionResult};
pub use topology::{AddressSpace, MemoryListener, MemoryTopology};

pub use strato_ram::{
    DirtyBitmap, DirtyClients, DirtySnapshot, RamBlock, RamError, RamFlags, PAGE_BITS, PAGE_MASK,
    PAGE_SIZE,
};
