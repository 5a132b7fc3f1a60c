//! Rendering a region tree into a flat, disjoint view.
//!
//! The flattener walks the tree in priority order and paints each terminal
//! region into whatever gaps the higher-priority regions left, so overlap
//! behaves like unconditional z-ordering without an explicit blend step.
//! The result is an immutable [`FlatView`]: ranges sorted by base address,
//! pairwise disjoint, with compatible neighbors merged.
//!
//! Rendering is a pure function of the registry; it cannot fail. Malformed
//! geometry (unsanctioned overlap) is diagnosed at attach time, not here.

use std::sync::Arc;

use tracing::warn;

use strato_ram::{DirtyClients, RamBlock};

use crate::ops::{DeviceOps, IommuOps};
use crate::range::AddrRange;
use crate::region::{Region, RegionBacking, RegionId, RegionRegistry};

/// Resolved backing of a flat range.
///
/// Handles are cloned out of the registry at flatten time so the access path
/// never touches the registry (which only the control-plane thread may
/// read).
#[derive(Clone)]
pub enum SectionBacking {
    /// Sentinel for addresses no region covers.
    Unassigned,
    Ram { block: Arc<RamBlock> },
    Mmio { ops: Arc<dyn DeviceOps> },
    Iommu { ops: Arc<dyn IommuOps> },
    Reservation,
}

impl std::fmt::Debug for SectionBacking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SectionBacking::Unassigned => "unassigned",
            SectionBacking::Ram { .. } => "ram",
            SectionBacking::Mmio { .. } => "io",
            SectionBacking::Iommu { .. } => "iommu",
            SectionBacking::Reservation => "reservation",
        })
    }
}

/// One entry of a flat view.
#[derive(Clone)]
pub struct FlatRange {
    pub range: AddrRange,
    pub region: RegionId,
    /// Offset of `range.base` within the region's own coordinate space.
    pub offset_in_region: u64,
    pub backing: SectionBacking,
    pub dirty_log_mask: DirtyClients,
    pub read_only: bool,
}

impl FlatRange {
    /// Identity comparison used by the commit diff: two ranges are the same
    /// section if they cover the same addresses with the same region at the
    /// same internal offset. Dirty-log state is deliberately excluded; mask
    /// changes surface as log transitions, not remaps.
    pub fn same_section(&self, other: &FlatRange) -> bool {
        self.range == other.range
            && self.region == other.region
            && self.offset_in_region == other.offset_in_region
            && self.read_only == other.read_only
    }

    fn can_merge(&self, next: &FlatRange) -> bool {
        self.range.end() == next.range.base as u128
            && self.region == next.region
            && self.offset_in_region + self.range.len == next.offset_in_region
            && self.dirty_log_mask == next.dirty_log_mask
            && self.read_only == next.read_only
    }
}

/// An immutable snapshot of the fully-resolved address space layout.
#[derive(Clone, Default)]
pub struct FlatView {
    ranges: Vec<FlatRange>,
}

impl FlatView {
    pub fn ranges(&self) -> &[FlatRange] {
        &self.ranges
    }

    /// Linear-structure lookup: the range covering `addr`, if any.
    ///
    /// The dispatch map answers the same question in bounded time; this is
    /// the reference the map is tested against, and what the committer uses.
    pub fn lookup(&self, addr: u64) -> Option<&FlatRange> {
        let i = self
            .ranges
            .partition_point(|fr| fr.range.end() <= addr as u128);
        self.ranges.get(i).filter(|fr| fr.range.contains(addr))
    }
}

/// Render the tree under `root`, clipped to `clip`.
pub fn flatten(reg: &RegionRegistry, root: RegionId, clip: AddrRange) -> FlatView {
    let mut ranges = Vec::new();
    render(reg, &mut ranges, root, 0, clip);
    simplify(&mut ranges);
    FlatView { ranges }
}

/// Recursively paint `id` and its subtree into `ranges`.
///
/// `base` is the absolute address of the region's parent coordinate origin;
/// it is signed because alias rebasing can pass through negative
/// intermediate values before the clip brings the result back in range.
fn render(
    reg: &RegionRegistry,
    ranges: &mut Vec<FlatRange>,
    id: RegionId,
    base: i128,
    clip: AddrRange,
) {
    let Some(r) = reg.get(id) else {
        warn!("flatten: skipping dead region handle");
        return;
    };
    if !r.enabled() || r.size() == 0 {
        return;
    }

    let base = base + r.addr() as i128;
    let start = base.max(clip.base as i128);
    let end = (base + r.size() as i128).min(clip.end() as i128);
    if start >= end {
        return;
    }
    let clip = AddrRange::new(start as u64, (end - start) as u64);

    if let RegionBacking::Alias { target, offset } = r.backing() {
        match reg.get(*target) {
            Some(t) => {
                // The recursive call re-adds the target's own offset within
                // its parent, so rebase past both it and the alias offset.
                let rebased = base - t.addr() as i128 - *offset as i128;
                render(reg, ranges, *target, rebased, clip);
            }
            None => warn!(alias = r.name(), "alias target is dead; rendering nothing"),
        }
        return;
    }

    // Children shadow the region's own content and each other in priority
    // order (the child list is kept priority-sorted, so first-come wins).
    for &child in r.children() {
        render(reg, ranges, child, base, clip);
    }

    if !r.is_terminal() {
        return;
    }

    paint_into_gaps(ranges, r, id, base, clip);
}

/// Insert the clipped content of a terminal region into every uncovered gap.
fn paint_into_gaps(
    ranges: &mut Vec<FlatRange>,
    r: &Region,
    id: RegionId,
    base: i128,
    clip: AddrRange,
) {
    let backing = resolve_backing(r);
    let read_only = matches!(r.backing(), RegionBacking::Ram { read_only: true, .. });
    let mask = r.log_clients();
    let mk = |cur: u128, len: u128, offset_in_region: u64| FlatRange {
        range: AddrRange::new(cur as u64, len as u64),
        region: id,
        offset_in_region,
        backing: backing.clone(),
        dirty_log_mask: mask,
        read_only,
    };

    let mut offset_in_region = (clip.base as i128 - base) as u64;
    let mut cur = clip.base as u128;
    let mut remain = clip.len as u128;
    let mut i = 0usize;

    while i < ranges.len() && remain > 0 {
        let existing = ranges[i].range;
        if cur >= existing.end() {
            i += 1;
            continue;
        }
        if cur < existing.base as u128 {
            let now = remain.min(existing.base as u128 - cur);
            ranges.insert(i, mk(cur, now, offset_in_region));
            i += 1;
            cur += now;
            offset_in_region += now as u64;
            remain -= now;
        }
        // Skip the covered stretch.
        let now = (cur + remain).min(existing.end()) - cur;
        cur += now;
        offset_in_region += now as u64;
        remain -= now;
        i += 1;
    }
    if remain > 0 {
        ranges.insert(i, mk(cur, remain, offset_in_region));
    }
}

fn resolve_backing(r: &Region) -> SectionBacking {
    match r.backing() {
        RegionBacking::Ram { block, .. } => SectionBacking::Ram {
            block: Arc::clone(block),
        },
        RegionBacking::Mmio { ops } => SectionBacking::Mmio {
            ops: Arc::clone(ops),
        },
        RegionBacking::Iommu { ops } => SectionBacking::Iommu {
            ops: Arc::clone(ops),
        },
        RegionBacking::Reservation => SectionBacking::Reservation,
        RegionBacking::Container | RegionBacking::Alias { .. } => {
            unreachable!("only terminal regions are painted")
        }
    }
}

/// Merge adjacent ranges that continue the same region contiguously.
fn simplify(ranges: &mut Vec<FlatRange>) {
    let mut i = 0;
    while i + 1 < ranges.len() {
        if ranges[i].can_merge(&ranges[i + 1]) {
            let extra = ranges[i + 1].range.len;
            ranges[i].range.len += extra;
            ranges.remove(i + 1);
        } else {
            i += 1;
        }
    }
}
