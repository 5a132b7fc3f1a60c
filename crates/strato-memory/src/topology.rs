//! Topology commit: from region-tree edits to a published dispatch map.
//!
//! [`MemoryTopology`] is the control-plane object: it owns the region
//! registry and the list of address spaces rendered from it. Mutations can
//! be batched in a begin/commit transaction so N edits produce exactly one
//! flatten/publish cycle per address space.
//!
//! Each commit flattens the tree, walks the old and new views in address
//! order to tell listeners exactly what changed, builds a fresh
//! [`DispatchMap`], publishes it with a single atomic pointer store, and
//! frees the superseded map only after the epoch domain proves no reader
//! can still observe it.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use strato_ram::DirtyClients;

use crate::access::BounceBuffer;
use crate::dispatch::{DispatchMap, Section};
use crate::epoch::{EpochDomain, EpochGuard, ReaderHandle};
use crate::flatten::{flatten, FlatView};
use crate::range::AddrRange;
use crate::region::{RegionId, RegionRegistry, RegionResult};

/// Observer of topology changes, consumed by the virtualization backend and
/// other host-mapping-aware components.
///
/// `region_add`/`region_del` describe sections entering and leaving the flat
/// view; `log_start`/`log_stop` report dirty-logging transitions on sections
/// that stayed put; `log_sync` asks the backend to fold its write tracking
/// into the dirty bitmaps. `commit` fires after every publish and is the
/// hook for invalidating fast-path translation caches that hold pointers
/// derived from the previous map.
pub trait MemoryListener: Send + Sync {
    fn begin(&self) {}
    fn commit(&self) {}
    fn region_add(&self, _section: &Section) {}
    fn region_del(&self, _section: &Section) {}
    fn log_start(&self, _section: &Section, _old: DirtyClients, _new: DirtyClients) {}
    fn log_stop(&self, _section: &Section, _old: DirtyClients, _new: DirtyClients) {}
    fn log_sync(&self, _section: &Section) {}
}

/// One guest physical address space: a root region plus the published
/// dispatch map rendered from it.
///
/// Multiple independent spaces (per-CPU, DMA) are expected; nothing here is
/// process-global.
pub struct AddressSpace {
    name: String,
    root: RegionId,
    /// The published map. Never null; superseded maps are retired through
    /// the epoch domain.
    current: AtomicPtr<DispatchMap>,
    /// Control-plane copy of the view the current map was built from.
    view: Mutex<Arc<FlatView>>,
    epoch: EpochDomain,
    listeners: Mutex<Vec<Arc<dyn MemoryListener>>>,
    pub(crate) bounce: BounceBuffer,
}

impl AddressSpace {
    fn new(name: String, root: RegionId) -> Self {
        let map = Box::new(DispatchMap::empty());
        Self {
            name,
            root,
            current: AtomicPtr::new(Box::into_raw(map)),
            view: Mutex::new(Arc::new(FlatView::default())),
            epoch: EpochDomain::new(),
            listeners: Mutex::new(Vec::new()),
            bounce: BounceBuffer::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn root(&self) -> RegionId {
        self.root
    }

    /// Register the calling thread as a reader of this space.
    pub fn register_reader(&self) -> ReaderHandle {
        self.epoch.register_reader()
    }

    /// The dispatch map as of now, borrowed for the guard's critical
    /// section.
    pub(crate) fn current_map<'g>(&self, _guard: &'g EpochGuard<'_>) -> &'g DispatchMap {
        // Safety: `current` always holds a live map published by
        // `commit_space`; a superseded map is freed only after
        // `EpochDomain::synchronize`, which cannot complete while `_guard`
        // keeps its reader slot pinned. The load is SeqCst to sit in the
        // same total order as the pin that precedes it: a writer that saw
        // this reader quiescent after its swap is thereby guaranteed this
        // load returns the new map, never the one being freed.
        unsafe { &*self.current.load(Ordering::SeqCst) }
    }

    /// Snapshot of the current flat view (control-plane observers; e.g.
    /// save/restore enumerating RAM sections).
    pub fn flat_ranges(&self) -> Arc<FlatView> {
        Arc::clone(&self.view.lock().expect("view lock poisoned"))
    }

    /// Attach a listener, replaying the current layout into it so it starts
    /// with a complete picture.
    pub fn add_listener(&self, listener: Arc<dyn MemoryListener>) {
        let view = self.flat_ranges();
        listener.begin();
        for fr in view.ranges() {
            listener.region_add(fr);
            if !fr.dirty_log_mask.is_empty() {
                listener.log_start(fr, DirtyClients::empty(), fr.dirty_log_mask);
            }
        }
        listener.commit();
        self.listeners
            .lock()
            .expect("listener list poisoned")
            .push(listener);
    }

    /// Ask listeners to fold outstanding write tracking into the dirty
    /// bitmaps for every section with logging enabled.
    pub fn log_sync(&self) {
        let view = self.flat_ranges();
        let listeners = self.snapshot_listeners();
        for fr in view.ranges() {
            if !fr.dirty_log_mask.is_empty() {
                for l in &listeners {
                    l.log_sync(fr);
                }
            }
        }
    }

    pub(crate) fn synchronize(&self) {
        self.epoch.synchronize();
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn MemoryListener>> {
        self.listeners
            .lock()
            .expect("listener list poisoned")
            .clone()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Safety: `current` holds the one live published map; readers are
        // gone once the space itself is being dropped.
        unsafe {
            drop(Box::from_raw(self.current.load(Ordering::Acquire)));
        }
    }
}

/// The control-plane owner of the region registry and its address spaces.
pub struct MemoryTopology {
    registry: RegionRegistry,
    spaces: Vec<Arc<AddressSpace>>,
    depth: u32,
    changed: bool,
}

impl MemoryTopology {
    pub fn new() -> Self {
        Self {
            registry: RegionRegistry::new(),
            spaces: Vec::new(),
            depth: 0,
            changed: false,
        }
    }

    /// Read access to the regions.
    pub fn registry(&self) -> &RegionRegistry {
        &self.registry
    }

    /// Open a transaction: mutations inside it are batched into one
    /// flatten/publish cycle at the matching [`commit`].
    ///
    /// [`commit`]: MemoryTopology::commit
    pub fn begin(&mut self) {
        self.depth += 1;
    }

    /// Close a transaction, re-rendering every address space if anything
    /// changed since [`begin`].
    ///
    /// [`begin`]: MemoryTopology::begin
    pub fn commit(&mut self) {
        debug_assert!(self.depth > 0, "commit without begin");
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 && self.changed {
            self.changed = false;
            for space in &self.spaces {
                commit_space(&self.registry, space);
            }
        }
    }

    fn mutate<R>(&mut self, f: impl FnOnce(&mut RegionRegistry) -> RegionResult<R>) -> RegionResult<R> {
        self.begin();
        let result = f(&mut self.registry);
        if result.is_ok() {
            self.changed = true;
        }
        self.commit();
        result
    }

    /// Create an address space rooted at `root` and render it immediately.
    pub fn create_address_space(
        &mut self,
        name: impl Into<String>,
        root: RegionId,
    ) -> Arc<AddressSpace> {
        let space = Arc::new(AddressSpace::new(name.into(), root));
        commit_space(&self.registry, &space);
        self.spaces.push(Arc::clone(&space));
        space
    }

    // ---- region constructors (no topology change until attached) -------

    pub fn new_container(&mut self, name: impl Into<String>, size: u64) -> RegionId {
        self.registry.new_container(name, size)
    }

    pub fn new_ram(
        &mut self,
        name: impl Into<String>,
        block: Arc<strato_ram::RamBlock>,
    ) -> RegionId {
        self.registry.new_ram(name, block)
    }

    pub fn new_rom(
        &mut self,
        name: impl Into<String>,
        block: Arc<strato_ram::RamBlock>,
    ) -> RegionId {
        self.registry.new_rom(name, block)
    }

    pub fn new_mmio(
        &mut self,
        name: impl Into<String>,
        size: u64,
        ops: Arc<dyn crate::ops::DeviceOps>,
    ) -> RegionId {
        self.registry.new_mmio(name, size, ops)
    }

    pub fn new_alias(
        &mut self,
        name: impl Into<String>,
        target: RegionId,
        offset: u64,
        size: u64,
    ) -> RegionId {
        self.registry.new_alias(name, target, offset, size)
    }

    pub fn new_reservation(&mut self, name: impl Into<String>, size: u64) -> RegionId {
        self.registry.new_reservation(name, size)
    }

    pub fn new_iommu(
        &mut self,
        name: impl Into<String>,
        size: u64,
        ops: Arc<dyn crate::ops::IommuOps>,
    ) -> RegionId {
        self.registry.new_iommu(name, size, ops)
    }

    // ---- tree mutations (each is its own transaction unless batched) ---

    pub fn add_subregion(
        &mut self,
        parent: RegionId,
        addr: u64,
        child: RegionId,
    ) -> RegionResult<()> {
        self.mutate(|reg| reg.add_subregion(parent, addr, child))
    }

    pub fn add_subregion_overlap(
        &mut self,
        parent: RegionId,
        addr: u64,
        child: RegionId,
        priority: i32,
    ) -> RegionResult<()> {
        self.mutate(|reg| reg.add_subregion_overlap(parent, addr, child, priority))
    }

    pub fn del_subregion(&mut self, parent: RegionId, child: RegionId) -> RegionResult<()> {
        self.mutate(|reg| reg.del_subregion(parent, child))
    }

    pub fn set_enabled(&mut self, region: RegionId, enabled: bool) -> RegionResult<()> {
        self.begin();
        let result = self.registry.set_enabled(region, enabled);
        if matches!(&result, Ok(true)) {
            self.changed = true;
        }
        self.commit();
        result.map(|_| ())
    }

    /// Enable or disable dirty logging for `clients` on a region.
    pub fn set_log_clients(
        &mut self,
        region: RegionId,
        clients: DirtyClients,
    ) -> RegionResult<()> {
        self.begin();
        let result = self.registry.set_log_clients(region, clients);
        if matches!(&result, Ok(old) if *old != clients) {
            self.changed = true;
        }
        self.commit();
        result.map(|_| ())
    }

    /// Resize a RAM region's backing block and re-render so listeners
    /// observe the size change.
    pub fn resize_ram(&mut self, region: RegionId, new_size: u64) -> RegionResult<()> {
        use crate::region::{RegionBacking, RegionError};

        self.begin();
        let result = (|| {
            let r = self.registry.get(region).ok_or(RegionError::Dead)?;
            let RegionBacking::Ram { block, .. } = r.backing() else {
                return Err(RegionError::NotRam(r.name().to_owned()));
            };
            block.resize(new_size).map_err(|source| RegionError::Resize {
                name: r.name().to_owned(),
                source,
            })?;
            self.registry.set_size(region, new_size)
        })();
        if result.is_ok() {
            self.changed = true;
        }
        self.commit();
        result
    }

    pub fn destroy_region(&mut self, region: RegionId) -> RegionResult<()> {
        self.registry.destroy(region)
    }

    pub fn register_iommu_notifier(
        &mut self,
        region: RegionId,
        notifier: Arc<dyn crate::ops::IommuInvalidate>,
    ) -> RegionResult<()> {
        self.registry.register_iommu_notifier(region, notifier)
    }

    pub fn iommu_notify(&self, region: RegionId, addr: u64, len: u64) -> RegionResult<()> {
        self.registry.iommu_notify(region, addr, len)
    }

    pub fn hierarchy_dump(&self, root: RegionId) -> String {
        self.registry.hierarchy_dump(root)
    }
}

impl Default for MemoryTopology {
    fn default() -> Self {
        Self::new()
    }
}

/// Flatten, diff, publish, reclaim: one address space's commit cycle.
fn commit_space(registry: &RegionRegistry, space: &AddressSpace) {
    let new_view = Arc::new(flatten(registry, space.root, AddrRange::MAX));
    let old_view = space.flat_ranges();
    let listeners = space.snapshot_listeners();

    debug!(
        space = space.name(),
        ranges = new_view.ranges().len(),
        "committing topology"
    );

    for l in &listeners {
        l.begin();
    }
    update_topology_pass(&listeners, &old_view, &new_view, false);

    let map = Box::new(DispatchMap::build(&new_view));
    // SeqCst pairs with the reader-side load; see `current_map`.
    let old_map = space
        .current
        .swap(Box::into_raw(map), Ordering::SeqCst);
    *space.view.lock().expect("view lock poisoned") = Arc::clone(&new_view);

    update_topology_pass(&listeners, &old_view, &new_view, true);

    // Safety: `old_map` was the published pointer until the swap above;
    // ownership reverts to the box, which sits on the retire queue until the
    // grace period proves no reader still holds it.
    space.epoch.retire(unsafe { Box::from_raw(old_map) });
    space.epoch.synchronize();

    for l in &listeners {
        l.commit();
    }
}

/// Merge-diff two sorted, disjoint views. The `adding` pass emits
/// `region_add` and log transitions; the removal pass emits `region_del`.
/// Sections present and identical in both views emit nothing, which is what
/// makes a no-op commit silent.
fn update_topology_pass(
    listeners: &[Arc<dyn MemoryListener>],
    old: &FlatView,
    new: &FlatView,
    adding: bool,
) {
    let old = old.ranges();
    let new = new.ranges();
    let (mut iold, mut inew) = (0usize, 0usize);

    while iold < old.len() || inew < new.len() {
        let frold = old.get(iold);
        let frnew = new.get(inew);

        let old_goes_first = match (frold, frnew) {
            (Some(fo), Some(fnew)) => {
                fo.range.base < fnew.range.base
                    || (fo.range.base == fnew.range.base && !fo.same_section(fnew))
            }
            (Some(_), None) => true,
            _ => false,
        };

        if old_goes_first {
            // In old only (or replaced in place): gone from the view.
            let fo = frold.expect("old_goes_first implies an old range");
            if !adding {
                for l in listeners {
                    l.region_del(fo);
                }
            }
            iold += 1;
        } else if let (Some(fo), Some(fnew)) = (frold, frnew) {
            if fo.same_section(fnew) {
                // Unchanged; only dirty logging may have moved.
                if adding {
                    let started = fnew.dirty_log_mask - fo.dirty_log_mask;
                    let stopped = fo.dirty_log_mask - fnew.dirty_log_mask;
                    if !started.is_empty() {
                        for l in listeners {
                            l.log_start(fnew, fo.dirty_log_mask, fnew.dirty_log_mask);
                        }
                    }
                    if !stopped.is_empty() {
                        for l in listeners {
                            l.log_stop(fnew, fo.dirty_log_mask, fnew.dirty_log_mask);
                        }
                    }
                }
                iold += 1;
                inew += 1;
            } else {
                if adding {
                    for l in listeners {
                        l.region_add(fnew);
                    }
                }
                inew += 1;
            }
        } else {
            // In new only.
            let fnew = frnew.expect("remaining ranges are new");
            if adding {
                for l in listeners {
                    l.region_add(fnew);
                }
            }
            inew += 1;
        }
    }
}
