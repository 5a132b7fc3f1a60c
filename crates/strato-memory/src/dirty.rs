//! Dirty-tracking client protocol.
//!
//! Marking lives on the write path and is handled by the access engine (a
//! relaxed atomic bit set per touched page, see [`strato_ram::DirtyBitmap`]).
//! The consuming side (migration draining pages, display scanning the
//! framebuffer) goes through the address space so that clearing runs under
//! the same quiescence guarantee as map publication: after the clear, no
//! access that began against the pre-clear state is still in flight, so a
//! mark racing the clear either landed before it (and was captured) or
//! lands after it (and survives for the next round).

use strato_ram::{DirtyClients, DirtySnapshot, RamBlock};

use crate::topology::AddressSpace;

impl AddressSpace {
    /// Whether any page of `[offset, offset + len)` in `block` was written
    /// since `client` last cleared it; clears the range.
    ///
    /// Returns true at most once per client per marked range until the range
    /// is written again.
    pub fn test_and_clear_dirty(
        &self,
        block: &RamBlock,
        offset: u64,
        len: u64,
        client: DirtyClients,
    ) -> bool {
        let any = block.dirty().test_and_clear(client, offset, len);
        if any {
            self.synchronize();
        }
        any
    }

    /// Capture and clear the dirty state of a range for incremental export.
    ///
    /// The grace period between the clear and the return means the caller
    /// may copy the snapshot's pages without racing writes that predate the
    /// snapshot.
    pub fn snapshot_and_clear_dirty(
        &self,
        block: &RamBlock,
        offset: u64,
        len: u64,
        client: DirtyClients,
    ) -> DirtySnapshot {
        let snap = block.dirty().snapshot_and_clear(client, offset, len);
        self.synchronize();
        snap
    }
}
