//! Page-granular address dispatch.
//!
//! A [`DispatchMap`] turns the flat view into a fixed-radix trie from page
//! number to section index so the access path resolves any address in at
//! most [`LEVELS`] node hops. Ranges that do not fill a whole page dispatch
//! through a per-page byte index ([`SubPage`]). After construction a
//! bottom-up pass collapses single-child interior nodes into skip-extended
//! pointers, so lookup depth tracks the number of distinct regions rather
//! than the full modeled address width.
//!
//! Maps are immutable once built (the only mutable cell is the
//! most-recently-used hint, which is advisory and revalidated on every use),
//! so a published map may be read from any number of threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use strato_ram::{PAGE_BITS, PAGE_MASK, PAGE_SIZE};

use crate::flatten::{FlatRange, FlatView, SectionBacking};
use crate::range::AddrRange;
use crate::region::RegionId;

/// A section is a flat range plus the stable index it occupies in the map's
/// section table. Indices stay valid for the lifetime of the map that issued
/// them, so they may be embedded in per-vCPU translation caches.
pub type Section = FlatRange;

/// Modeled physical address width. Addresses at or above `1 << ADDR_BITS`
/// resolve to the unassigned section.
pub const ADDR_BITS: u32 = 48;

/// Index of the sentinel section returned for uncovered addresses.
pub const UNASSIGNED_SECTION: u32 = 0;

const LEVEL_BITS: u32 = 9;
const LEVEL_SIZE: usize = 1 << LEVEL_BITS;
const LEVELS: u32 = (ADDR_BITS - PAGE_BITS).div_ceil(LEVEL_BITS);
const SKIP_BITS: u32 = 6;

/// Null pointer value for trie entries.
const NIL: u32 = u32::MAX;
/// Leaf pointers with this bit set index the subpage table instead of the
/// section table.
const SUBPAGE_BIT: u32 = 1 << 31;

#[derive(Debug, Clone, Copy)]
struct Entry {
    /// Levels this entry spans: 0 marks a leaf, n > 1 a compacted path.
    skip: u8,
    ptr: u32,
}

struct Node([Entry; LEVEL_SIZE]);

/// Byte-granular dispatch for one page shared by several sections.
struct SubPage {
    /// Page number this table covers.
    page: u64,
    /// One section index per byte offset.
    entries: Box<[u32]>,
}

impl SubPage {
    fn new(page: u64) -> Self {
        Self {
            page,
            entries: vec![UNASSIGNED_SECTION; PAGE_SIZE as usize].into_boxed_slice(),
        }
    }
}

/// Immutable page-number → section dispatch structure.
pub struct DispatchMap {
    root: Entry,
    nodes: Vec<Node>,
    sections: Vec<Section>,
    subpages: Vec<SubPage>,
    /// Index of the last section a lookup resolved; advisory only.
    mru: AtomicU32,
}

impl DispatchMap {
    /// A map covering nothing: every lookup is unassigned.
    pub fn empty() -> Self {
        Self {
            root: Entry { skip: 1, ptr: NIL },
            nodes: Vec::new(),
            sections: vec![unassigned_section()],
            subpages: Vec::new(),
            mru: AtomicU32::new(UNASSIGNED_SECTION),
        }
    }

    /// Build the dispatch structure for `view`.
    pub fn build(view: &FlatView) -> Self {
        let mut map = Self::empty();
        let mut subpage_for_page: HashMap<u64, u32> = HashMap::new();
        for fr in view.ranges() {
            map.register(fr, &mut subpage_for_page);
        }
        map.compact();
        map
    }

    /// Number of sections, including the unassigned sentinel at index 0.
    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }

    #[inline]
    pub fn section(&self, idx: u32) -> &Section {
        &self.sections[idx as usize]
    }

    /// Resolve `addr` to its section index with a full trie walk.
    pub fn lookup(&self, addr: u64) -> u32 {
        if addr >> ADDR_BITS != 0 {
            return UNASSIGNED_SECTION;
        }
        let index = addr >> PAGE_BITS;

        let mut lp = self.root;
        let mut level = LEVELS as i32;
        while lp.skip != 0 {
            level -= i32::from(lp.skip);
            if level < 0 || lp.ptr == NIL {
                return UNASSIGNED_SECTION;
            }
            let node = &self.nodes[lp.ptr as usize];
            lp = node.0[(index >> (level as u32 * LEVEL_BITS)) as usize & (LEVEL_SIZE - 1)];
        }

        if lp.ptr == NIL {
            return UNASSIGNED_SECTION;
        }
        if lp.ptr & SUBPAGE_BIT != 0 {
            let sp = &self.subpages[(lp.ptr & !SUBPAGE_BIT) as usize];
            if sp.page != index {
                return UNASSIGNED_SECTION;
            }
            return sp.entries[(addr & PAGE_MASK) as usize];
        }

        // Skip-compacted paths drop address bits unchecked, so the landing
        // section must prove it actually covers the address.
        if self.sections[lp.ptr as usize].range.contains(addr) {
            lp.ptr
        } else {
            UNASSIGNED_SECTION
        }
    }

    /// Resolve `addr`, consulting the most-recently-used hint first.
    ///
    /// The hint carries no invalidation signal of its own, so it is trusted
    /// only after passing the same covers-address test the trie applies.
    pub fn lookup_section(&self, addr: u64) -> (u32, &Section) {
        let cached = self.mru.load(Ordering::Relaxed);
        if cached != UNASSIGNED_SECTION {
            if let Some(sec) = self.sections.get(cached as usize) {
                if sec.range.contains(addr) {
                    return (cached, sec);
                }
            }
        }
        let idx = self.lookup(addr);
        self.mru.store(idx, Ordering::Relaxed);
        (idx, &self.sections[idx as usize])
    }

    // ---- construction -------------------------------------------------

    fn register(&mut self, fr: &FlatRange, subpage_for_page: &mut HashMap<u64, u32>) {
        let idx = u32::try_from(self.sections.len()).expect("section count fits u32");
        assert!(idx & SUBPAGE_BIT == 0, "section table overflow");
        self.sections.push(fr.clone());

        // Clamp to the modeled width; anything above is unreachable through
        // the trie anyway.
        let Some(clipped) = fr
            .range
            .intersection(&AddrRange::new(0, 1u64 << ADDR_BITS))
        else {
            return;
        };
        let start = clipped.base;
        let end = clipped.end() as u64;
        let mut cur = start;

        // Leading partial page.
        if cur & PAGE_MASK != 0 {
            let stop = end.min((cur | PAGE_MASK) + 1);
            self.subpage_set(cur >> PAGE_BITS, cur & PAGE_MASK, stop - cur, idx, subpage_for_page);
            cur = stop;
        }
        if cur >= end {
            return;
        }
        // Whole-page run.
        let full_end = end & !PAGE_MASK;
        if full_end > cur {
            self.page_set(cur >> PAGE_BITS, (full_end - cur) >> PAGE_BITS, idx);
            cur = full_end;
        }
        // Trailing partial page.
        if end > cur {
            self.subpage_set(cur >> PAGE_BITS, 0, end - cur, idx, subpage_for_page);
        }
    }

    fn subpage_set(
        &mut self,
        page: u64,
        offset: u64,
        len: u64,
        section: u32,
        subpage_for_page: &mut HashMap<u64, u32>,
    ) {
        let sp_idx = *subpage_for_page.entry(page).or_insert_with(|| {
            let i = u32::try_from(self.subpages.len()).expect("subpage count fits u32");
            self.subpages.push(SubPage::new(page));
            self.page_set(page, 1, SUBPAGE_BIT | i);
            i
        });
        let sp = &mut self.subpages[sp_idx as usize];
        sp.entries[offset as usize..(offset + len) as usize].fill(section);
    }

    fn alloc_node(&mut self, leaf: bool) -> u32 {
        let idx = u32::try_from(self.nodes.len()).expect("node pool fits u32");
        let fill = Entry {
            skip: if leaf { 0 } else { 1 },
            ptr: NIL,
        };
        self.nodes.push(Node([fill; LEVEL_SIZE]));
        idx
    }

    /// Point `count` pages starting at page `index` at `leaf_ptr`.
    fn page_set(&mut self, index: u64, count: u64, leaf_ptr: u32) {
        let mut index = index;
        let mut count = count;
        let mut root = self.root;
        self.page_set_level(&mut root, &mut index, &mut count, leaf_ptr, LEVELS - 1);
        self.root = root;
    }

    fn page_set_level(
        &mut self,
        lp: &mut Entry,
        index: &mut u64,
        count: &mut u64,
        leaf_ptr: u32,
        level: u32,
    ) {
        debug_assert!(lp.skip != 0 || lp.ptr == NIL, "descending into a leaf");
        if lp.skip != 0 && lp.ptr == NIL {
            lp.ptr = self.alloc_node(level == 0);
            lp.skip = 1;
        }
        let node = lp.ptr as usize;
        let step = 1u64 << (level * LEVEL_BITS);
        let mut slot = (*index >> (level * LEVEL_BITS)) as usize & (LEVEL_SIZE - 1);

        while *count > 0 && slot < LEVEL_SIZE {
            if *index & (step - 1) == 0 && *count >= step {
                self.nodes[node].0[slot] = Entry {
                    skip: 0,
                    ptr: leaf_ptr,
                };
                *index += step;
                *count -= step;
            } else {
                let mut child = self.nodes[node].0[slot];
                self.page_set_level(&mut child, index, count, leaf_ptr, level - 1);
                self.nodes[node].0[slot] = child;
            }
            slot += 1;
        }
    }

    /// Collapse interior nodes with exactly one live child into their
    /// parent's entry, bounded by the skip-field width. Purely an
    /// optimization: the covers-address test in `lookup` keeps compacted
    /// paths honest.
    fn compact(&mut self) {
        let mut root = self.root;
        self.compact_entry(&mut root);
        self.root = root;
    }

    fn compact_entry(&mut self, lp: &mut Entry) {
        if lp.skip == 0 || lp.ptr == NIL {
            return;
        }
        let node = lp.ptr as usize;
        let mut live = 0usize;
        let mut live_slot = 0usize;
        for slot in 0..LEVEL_SIZE {
            let e = self.nodes[node].0[slot];
            if e.ptr == NIL {
                continue;
            }
            live += 1;
            live_slot = slot;
            if e.skip != 0 {
                let mut child = e;
                self.compact_entry(&mut child);
                self.nodes[node].0[slot] = child;
            }
        }
        if live != 1 {
            return;
        }
        let child = self.nodes[node].0[live_slot];
        if u32::from(lp.skip) + u32::from(child.skip) >= 1 << SKIP_BITS {
            return;
        }
        lp.ptr = child.ptr;
        lp.skip = if child.skip == 0 {
            0
        } else {
            lp.skip + child.skip
        };
    }
}

fn unassigned_section() -> Section {
    Section {
        range: AddrRange::new(0, 0),
        region: RegionId::invalid(),
        offset_in_region: 0,
        backing: SectionBacking::Unassigned,
        dirty_log_mask: strato_ram::DirtyClients::empty(),
        read_only: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::flatten;
    use crate::region::RegionRegistry;

    fn build_view(layout: &[(u64, u64)]) -> FlatView {
        let mut reg = RegionRegistry::new();
        let root = reg.new_container("root", 1 << ADDR_BITS);
        for (i, &(base, size)) in layout.iter().enumerate() {
            let r = reg.new_reservation(format!("r{i}"), size);
            reg.add_subregion(root, base, r).unwrap();
        }
        flatten(&reg, root, AddrRange::MAX)
    }

    fn assert_matches_view(map: &DispatchMap, view: &FlatView, probes: &[u64]) {
        for &addr in probes {
            let via_map = map.lookup(addr);
            match view.lookup(addr) {
                Some(fr) => {
                    assert_ne!(via_map, UNASSIGNED_SECTION, "addr {addr:#x}");
                    assert_eq!(map.section(via_map).region, fr.region, "addr {addr:#x}");
                }
                None => assert_eq!(via_map, UNASSIGNED_SECTION, "addr {addr:#x}"),
            }
        }
    }

    #[test]
    fn empty_map_is_all_unassigned() {
        let map = DispatchMap::empty();
        assert_eq!(map.lookup(0), UNASSIGNED_SECTION);
        assert_eq!(map.lookup(u64::MAX), UNASSIGNED_SECTION);
    }

    #[test]
    fn page_aligned_ranges_dispatch_exactly() {
        let view = build_view(&[(0, 0x10_0000), (0x20_0000, 0x1000)]);
        let map = DispatchMap::build(&view);

        let probes = [
            0,
            0x1000,
            0xF_F000,
            0xF_FFFF,
            0x10_0000,
            0x1F_FFFF,
            0x20_0000,
            0x20_0FFF,
            0x20_1000,
            1 << 40,
        ];
        assert_matches_view(&map, &view, &probes);
    }

    #[test]
    fn addresses_beyond_modeled_width_are_unassigned() {
        let view = build_view(&[(0, 0x1000)]);
        let map = DispatchMap::build(&view);
        assert_eq!(map.lookup(1 << ADDR_BITS), UNASSIGNED_SECTION);
        assert_eq!(map.lookup(u64::MAX), UNASSIGNED_SECTION);
        // The equally-indexed page below the limit still resolves.
        assert_ne!(map.lookup(0), UNASSIGNED_SECTION);
    }

    #[test]
    fn subpage_ranges_resolve_per_byte() {
        // Two regions split one page at byte granularity.
        let view = build_view(&[(0x1000, 0x800), (0x1800, 0x800)]);
        let map = DispatchMap::build(&view);

        let a = map.lookup(0x1000);
        let b = map.lookup(0x1FFF);
        assert_ne!(a, UNASSIGNED_SECTION);
        assert_ne!(b, UNASSIGNED_SECTION);
        assert_ne!(a, b);
        assert_eq!(map.lookup(0x17FF), a);
        assert_eq!(map.lookup(0x1800), b);
        assert_eq!(map.lookup(0x0FFF), UNASSIGNED_SECTION);
        assert_eq!(map.lookup(0x2000), UNASSIGNED_SECTION);
    }

    #[test]
    fn unaligned_range_splits_into_head_body_tail() {
        let view = build_view(&[(0x1800, 0x2000)]);
        let map = DispatchMap::build(&view);

        let idx = map.lookup(0x1800);
        assert_ne!(idx, UNASSIGNED_SECTION);
        // Head partial page, whole page, tail partial page all agree.
        assert_eq!(map.lookup(0x1FFF), idx);
        assert_eq!(map.lookup(0x2000), idx);
        assert_eq!(map.lookup(0x2FFF), idx);
        assert_eq!(map.lookup(0x3000), idx);
        assert_eq!(map.lookup(0x37FF), idx);
        assert_eq!(map.lookup(0x17FF), UNASSIGNED_SECTION);
        assert_eq!(map.lookup(0x3800), UNASSIGNED_SECTION);
    }

    #[test]
    fn compaction_preserves_lookups() {
        // A lone high region forces a deep single-child path that compaction
        // collapses.
        let base = 0x7F00_0000_0000;
        let view = build_view(&[(base, 0x1000)]);
        let map = DispatchMap::build(&view);

        assert_ne!(map.lookup(base), UNASSIGNED_SECTION);
        assert_eq!(map.lookup(base + 0xFFF), map.lookup(base));
        // Sibling addresses sharing trie slots with the compacted path must
        // still fail the covers test.
        assert_eq!(map.lookup(base - 0x1000), UNASSIGNED_SECTION);
        assert_eq!(map.lookup(base + 0x1000), UNASSIGNED_SECTION);
        assert_eq!(map.lookup(0), UNASSIGNED_SECTION);
    }

    #[test]
    fn mru_hint_is_validated_before_use() {
        let view = build_view(&[(0, 0x1000), (0x1000, 0x1000)]);
        let map = DispatchMap::build(&view);

        let (first, _) = map.lookup_section(0x10);
        // A lookup in the other region must not be served by the stale hint.
        let (second, sec) = map.lookup_section(0x1010);
        assert_ne!(first, second);
        assert!(sec.range.contains(0x1010));
        // And the hint now tracks the new section.
        let (again, _) = map.lookup_section(0x1020);
        assert_eq!(again, second);
    }

    #[test]
    fn section_indices_are_stable_and_dense() {
        let view = build_view(&[(0, 0x1000), (0x2000, 0x1000), (0x4000, 0x1000)]);
        let map = DispatchMap::build(&view);
        assert_eq!(map.num_sections(), 1 + view.ranges().len());
        for (i, fr) in view.ranges().iter().enumerate() {
            assert_eq!(map.section(i as u32 + 1).region, fr.region);
        }
    }

    #[test]
    fn giant_range_uses_interior_leaves() {
        // 4 GiB of RAM-like space: spans many level-2 subtrees.
        let view = build_view(&[(0, 1 << 32)]);
        let map = DispatchMap::build(&view);
        let idx = map.lookup(0);
        for addr in [0u64, 0xFFF, 1 << 21, (1 << 30) + 0x123, (1 << 32) - 1] {
            assert_eq!(map.lookup(addr), idx, "addr {addr:#x}");
        }
        assert_eq!(map.lookup(1 << 32), UNASSIGNED_SECTION);
        // The node pool stays tiny because whole subtrees collapse into
        // multi-level leaves.
        assert!(map.nodes.len() < 16, "node pool: {}", map.nodes.len());
    }
}
