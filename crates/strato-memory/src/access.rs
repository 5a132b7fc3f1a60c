//! The guest memory access engine.
//!
//! [`MemAccessor`] is a per-thread handle on an address space. Every access
//! pins the epoch, resolves the published dispatch map section by section,
//! and performs the transfer: direct copies (plus dirty marking) for RAM,
//! size-clamped endian-aware callback dispatch for device regions, and
//! re-translation for IOMMU regions. Accesses that span several sections are
//! split and each piece handled by its own backing; the first error is
//! reported while the remaining bytes still transfer, so a fault in the
//! middle of a DMA burst behaves like real open bus instead of truncating
//! the transfer.
//!
//! [`MemAccessor::map`] hands out zero-copy mappings for directly accessible
//! memory and falls back to the single shared bounce buffer otherwise; at
//! most one bounce mapping exists at a time, and callers finding it busy can
//! register a retry callback.

use std::sync::{Arc, Mutex};

use tracing::trace;

use strato_ram::{DirtyClients, RamBlock, PAGE_MASK, PAGE_SIZE};

use crate::dispatch::Section;
use crate::epoch::ReaderHandle;
use crate::flatten::SectionBacking;
use crate::ops::{AccessAttrs, AccessError, AccessResult, DeviceOps, Endianness};
use crate::topology::AddressSpace;

/// Size of the shared bounce buffer backing indirect mappings.
pub const BOUNCE_SIZE: u64 = PAGE_SIZE;

/// Longest IOMMU chain the engine follows before declaring the topology
/// cyclic and failing the access.
const MAX_IOMMU_HOPS: u32 = 8;

/// The single staging buffer used to map regions that cannot be accessed by
/// direct pointer. `slot` holds the buffer while it is free; taking it is
/// the arbitration.
pub(crate) struct BounceBuffer {
    slot: Mutex<Option<Box<[u8]>>>,
    retry: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl BounceBuffer {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Some(vec![0u8; BOUNCE_SIZE as usize].into_boxed_slice())),
            retry: Mutex::new(Vec::new()),
        }
    }

    fn acquire(&self) -> Option<Box<[u8]>> {
        self.slot.lock().expect("bounce slot poisoned").take()
    }

    /// Return the buffer and collect the retry callbacks to run.
    fn release(&self, buf: Box<[u8]>) -> Vec<Box<dyn FnOnce() + Send>> {
        *self.slot.lock().expect("bounce slot poisoned") = Some(buf);
        std::mem::take(&mut *self.retry.lock().expect("bounce retry poisoned"))
    }
}

impl AddressSpace {
    /// Run `notify` once the bounce buffer can be acquired again.
    ///
    /// Fires immediately when the buffer is already free.
    pub fn register_map_client(&self, notify: Box<dyn FnOnce() + Send>) {
        let mut retry = self.bounce.retry.lock().expect("bounce retry poisoned");
        let free = self
            .bounce
            .slot
            .lock()
            .expect("bounce slot poisoned")
            .is_some();
        if free {
            drop(retry);
            notify();
        } else {
            retry.push(notify);
        }
    }

    /// Create a per-thread accessor for this space.
    pub fn accessor(self: &Arc<Self>) -> MemAccessor {
        MemAccessor {
            space: Arc::clone(self),
            reader: self.register_reader(),
        }
    }
}

/// Per-thread access handle: an address space plus the thread's epoch
/// registration.
pub struct MemAccessor {
    space: Arc<AddressSpace>,
    reader: ReaderHandle,
}

impl MemAccessor {
    #[inline]
    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    /// Read guest memory into `dst`.
    pub fn read(&self, addr: u64, dst: &mut [u8], attrs: AccessAttrs) -> AccessResult {
        read_impl(&self.space, &self.reader, addr, dst, attrs, 0)
    }

    /// Write `src` to guest memory.
    pub fn write(&self, addr: u64, src: &[u8], attrs: AccessAttrs) -> AccessResult {
        write_impl(&self.space, &self.reader, addr, src, attrs, 0)
    }

    /// Introspection read: like [`read`](Self::read) with debug attributes.
    pub fn read_debug(&self, addr: u64, dst: &mut [u8]) -> AccessResult {
        let attrs = AccessAttrs {
            debug: true,
            ..AccessAttrs::UNSPECIFIED
        };
        self.read(addr, dst, attrs)
    }

    /// Introspection write: may write ROM contents, bypassing guest-visible
    /// write protection.
    pub fn write_debug(&self, addr: u64, src: &[u8]) -> AccessResult {
        let attrs = AccessAttrs {
            debug: true,
            ..AccessAttrs::UNSPECIFIED
        };
        self.write(addr, src, attrs)
    }

    /// Map `[addr, addr + len)` for direct access.
    ///
    /// The returned mapping covers at most one flat range (callers iterate
    /// for longer spans) and stays valid until dropped. Regions without
    /// direct host backing go through the shared bounce buffer; if it is
    /// busy, `Ok(None)` is returned and the caller may register a retry
    /// callback with [`AddressSpace::register_map_client`].
    pub fn map(
        &self,
        addr: u64,
        len: u64,
        is_write: bool,
        attrs: AccessAttrs,
    ) -> AccessResult<Option<GuestMapping>> {
        // Resolve under one pin; the pin must end before the bounce path
        // reads through the engine (which pins again).
        let resolved = {
            let guard = self.reader.pin();
            let map = self.space.current_map(&guard);
            let (_, sec) = map.lookup_section(addr);
            match &sec.backing {
                SectionBacking::Ram { block } => {
                    if is_write && sec.read_only && !attrs.debug {
                        Err(AccessError::Denied { addr })
                    } else {
                        Ok(Some(GuestMapping {
                            inner: MappingInner::Direct {
                                block: Arc::clone(block),
                                offset: sec.offset_in_region + (addr - sec.range.base),
                                len: chunk_len(sec, addr, len),
                                dirty: sec.dirty_log_mask,
                                is_write,
                            },
                        }))
                    }
                }
                SectionBacking::Unassigned | SectionBacking::Reservation => {
                    Err(AccessError::Unassigned { addr })
                }
                SectionBacking::Mmio { .. } | SectionBacking::Iommu { .. } => Ok(None),
            }
        };

        match resolved {
            Ok(Some(mapping)) => Ok(Some(mapping)),
            Err(e) => Err(e),
            Ok(None) => {
                let Some(mut buf) = self.space.bounce.acquire() else {
                    return Ok(None);
                };
                let len = len.min(BOUNCE_SIZE);
                if !is_write {
                    // Read-direction mappings observe current contents.
                    let _ = self.read(addr, &mut buf[..len as usize], attrs);
                }
                Ok(Some(GuestMapping {
                    inner: MappingInner::Bounce {
                        space: Arc::clone(&self.space),
                        addr,
                        len,
                        buf: Some(buf),
                        is_write,
                    },
                }))
            }
        }
    }

    // Little-endian typed helpers, as every bus on the platform provides.

    pub fn read_u8(&self, addr: u64) -> AccessResult<u8> {
        let mut b = [0u8; 1];
        self.read(addr, &mut b, AccessAttrs::UNSPECIFIED)?;
        Ok(b[0])
    }

    pub fn read_u16(&self, addr: u64) -> AccessResult<u16> {
        let mut b = [0u8; 2];
        self.read(addr, &mut b, AccessAttrs::UNSPECIFIED)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_u32(&self, addr: u64) -> AccessResult<u32> {
        let mut b = [0u8; 4];
        self.read(addr, &mut b, AccessAttrs::UNSPECIFIED)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_u64(&self, addr: u64) -> AccessResult<u64> {
        let mut b = [0u8; 8];
        self.read(addr, &mut b, AccessAttrs::UNSPECIFIED)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn write_u8(&self, addr: u64, v: u8) -> AccessResult {
        self.write(addr, &[v], AccessAttrs::UNSPECIFIED)
    }

    pub fn write_u16(&self, addr: u64, v: u16) -> AccessResult {
        self.write(addr, &v.to_le_bytes(), AccessAttrs::UNSPECIFIED)
    }

    pub fn write_u32(&self, addr: u64, v: u32) -> AccessResult {
        self.write(addr, &v.to_le_bytes(), AccessAttrs::UNSPECIFIED)
    }

    pub fn write_u64(&self, addr: u64, v: u64) -> AccessResult {
        self.write(addr, &v.to_le_bytes(), AccessAttrs::UNSPECIFIED)
    }
}

/// Bytes of `sec` available starting at `addr`, at most `remaining`.
///
/// The unassigned sentinel has no extent; it is advanced at page
/// granularity, matching the dispatch granularity that produced it.
fn chunk_len(sec: &Section, addr: u64, remaining: u64) -> u64 {
    if sec.range.is_empty() {
        remaining.min(PAGE_SIZE - (addr & PAGE_MASK))
    } else {
        remaining.min((sec.range.end() - addr as u128) as u64)
    }
}

fn record(result: &mut AccessResult, err: AccessError) {
    if result.is_ok() {
        *result = Err(err);
    }
}

fn read_impl(
    space: &AddressSpace,
    reader: &ReaderHandle,
    mut addr: u64,
    dst: &mut [u8],
    attrs: AccessAttrs,
    hops: u32,
) -> AccessResult {
    let mut result = Ok(());
    let guard = reader.pin();
    let map = space.current_map(&guard);

    let mut pos = 0usize;
    while pos < dst.len() {
        let remaining = (dst.len() - pos) as u64;
        let (_, sec) = map.lookup_section(addr);
        let chunk = chunk_len(sec, addr, remaining);
        let out = &mut dst[pos..pos + chunk as usize];

        match &sec.backing {
            SectionBacking::Unassigned | SectionBacking::Reservation => {
                out.fill(0xFF);
                record(&mut result, AccessError::Unassigned { addr });
            }
            SectionBacking::Ram { block } => {
                let offset = sec.offset_in_region + (addr - sec.range.base);
                if block.read(offset, out).is_err() {
                    // Block shrank under a stale section; open-bus it.
                    out.fill(0xFF);
                    record(&mut result, AccessError::Unassigned { addr });
                }
            }
            SectionBacking::Mmio { ops } => {
                if attrs.mem_only {
                    out.fill(0xFF);
                    record(&mut result, AccessError::Denied { addr });
                } else {
                    let offset = sec.offset_in_region + (addr - sec.range.base);
                    if let Err(e) = mmio_read(ops.as_ref(), offset, out, attrs) {
                        out.fill(0xFF);
                        record(&mut result, e);
                    }
                }
            }
            SectionBacking::Iommu { ops } => {
                let rel = sec.offset_in_region + (addr - sec.range.base);
                match translate_step(ops.as_ref(), rel, false, attrs, hops) {
                    Ok((target, taddr, within)) => {
                        let take = chunk.min(within);
                        let sub = &mut out[..take as usize];
                        let tmp = target.register_reader();
                        let r = read_impl(&target, &tmp, taddr, sub, attrs, hops + 1);
                        if let Err(e) = r {
                            record(&mut result, e);
                        }
                        addr += take;
                        pos += take as usize;
                        continue;
                    }
                    Err(e) => {
                        out.fill(0xFF);
                        record(&mut result, e);
                    }
                }
            }
        }

        addr += chunk;
        pos += chunk as usize;
    }
    result
}

fn write_impl(
    space: &AddressSpace,
    reader: &ReaderHandle,
    mut addr: u64,
    src: &[u8],
    attrs: AccessAttrs,
    hops: u32,
) -> AccessResult {
    let mut result = Ok(());
    let guard = reader.pin();
    let map = space.current_map(&guard);

    let mut pos = 0usize;
    while pos < src.len() {
        let remaining = (src.len() - pos) as u64;
        let (_, sec) = map.lookup_section(addr);
        let chunk = chunk_len(sec, addr, remaining);
        let data = &src[pos..pos + chunk as usize];

        match &sec.backing {
            SectionBacking::Unassigned | SectionBacking::Reservation => {
                record(&mut result, AccessError::Unassigned { addr });
            }
            SectionBacking::Ram { block } => {
                if sec.read_only && !attrs.debug {
                    // Guest stores to ROM are discarded.
                    trace!(addr = format_args!("{addr:#x}"), "dropping write to rom");
                } else {
                    let offset = sec.offset_in_region + (addr - sec.range.base);
                    match block.write(offset, data) {
                        Ok(()) => {
                            if !sec.dirty_log_mask.is_empty() {
                                block.dirty().mark(sec.dirty_log_mask, offset, chunk);
                            }
                        }
                        Err(_) => record(&mut result, AccessError::Unassigned { addr }),
                    }
                }
            }
            SectionBacking::Mmio { ops } => {
                if attrs.mem_only {
                    record(&mut result, AccessError::Denied { addr });
                } else {
                    let offset = sec.offset_in_region + (addr - sec.range.base);
                    if let Err(e) = mmio_write(ops.as_ref(), offset, data, attrs) {
                        record(&mut result, e);
                    }
                }
            }
            SectionBacking::Iommu { ops } => {
                let rel = sec.offset_in_region + (addr - sec.range.base);
                match translate_step(ops.as_ref(), rel, true, attrs, hops) {
                    Ok((target, taddr, within)) => {
                        let take = chunk.min(within);
                        let data = &src[pos..pos + take as usize];
                        let tmp = target.register_reader();
                        let r = write_impl(&target, &tmp, taddr, data, attrs, hops + 1);
                        if let Err(e) = r {
                            record(&mut result, e);
                        }
                        addr += take;
                        pos += take as usize;
                        continue;
                    }
                    Err(e) => record(&mut result, e),
                }
            }
        }

        addr += chunk;
        pos += chunk as usize;
    }
    result
}

/// One IOMMU hop: translate `rel` and return the target space, translated
/// address, and bytes remaining inside the translated page.
///
/// Chained IOMMUs loop naturally: the target space's own dispatch may
/// resolve to another IOMMU region and recurse. The hop count caps the
/// chain so a cyclic topology fails the access instead of recursing forever.
fn translate_step(
    ops: &dyn crate::ops::IommuOps,
    rel: u64,
    is_write: bool,
    _attrs: AccessAttrs,
    hops: u32,
) -> AccessResult<(Arc<AddressSpace>, u64, u64)> {
    if hops >= MAX_IOMMU_HOPS {
        return Err(AccessError::Denied { addr: rel });
    }
    let t = ops.translate(rel, is_write)?;
    if !t.perm.allows(is_write) {
        return Err(AccessError::Denied { addr: rel });
    }
    let taddr = (t.translated_addr & !t.addr_mask) | (rel & t.addr_mask);
    let within = t.addr_mask - (rel & t.addr_mask) + 1;
    Ok((t.target, taddr, within))
}

fn pow2_floor(v: u64) -> u64 {
    debug_assert!(v > 0);
    1 << (63 - v.leading_zeros())
}

/// Chunk size for one device callback, honoring the declared envelope.
/// The engine assembles values through 8-byte buffers, so the envelope is
/// clamped to that regardless of what the device declares.
fn device_access_size(c: &crate::ops::AccessConstraints, remaining: u64) -> u64 {
    let max = c.max_size.clamp(1, 8);
    let min = c.min_size.clamp(1, 8);
    let mut size = pow2_floor(remaining.min(max));
    if size < min {
        size = min;
    }
    size
}

fn mmio_read(
    ops: &dyn DeviceOps,
    mut offset: u64,
    out: &mut [u8],
    attrs: AccessAttrs,
) -> AccessResult {
    let c = ops.access();
    let endian = ops.endianness();

    let mut pos = 0usize;
    while pos < out.len() {
        let remaining = (out.len() - pos) as u64;
        let size = device_access_size(&c, remaining);
        if !c.unaligned && offset % size != 0 {
            return Err(AccessError::Denied { addr: offset });
        }
        if !ops.accepts(offset, size, false, attrs) {
            return Err(AccessError::Denied { addr: offset });
        }

        let v = ops.read(offset, size, attrs)?;
        let bytes = match endian {
            Endianness::Little => v.to_le_bytes(),
            Endianness::Big => (v << (64 - 8 * size)).to_be_bytes(),
        };
        let take = size.min(remaining) as usize;
        out[pos..pos + take].copy_from_slice(&bytes[..take]);

        pos += take;
        offset += take as u64;
    }
    Ok(())
}

fn mmio_write(
    ops: &dyn DeviceOps,
    mut offset: u64,
    src: &[u8],
    attrs: AccessAttrs,
) -> AccessResult {
    let c = ops.access();
    let endian = ops.endianness();

    let mut pos = 0usize;
    while pos < src.len() {
        let remaining = (src.len() - pos) as u64;
        let size = device_access_size(&c, remaining);
        if !c.unaligned && offset % size != 0 {
            return Err(AccessError::Denied { addr: offset });
        }
        if !ops.accepts(offset, size, true, attrs) {
            return Err(AccessError::Denied { addr: offset });
        }

        let take = size.min(remaining) as usize;
        let mut bytes = [0u8; 8];
        bytes[..take].copy_from_slice(&src[pos..pos + take]);
        let v = match endian {
            Endianness::Little => u64::from_le_bytes(bytes),
            Endianness::Big => {
                // Register byte 0 is the most significant.
                let mut be = [0u8; 8];
                be[8 - size as usize..8 - size as usize + take]
                    .copy_from_slice(&src[pos..pos + take]);
                u64::from_be_bytes(be)
            }
        };
        ops.write(offset, size, v, attrs)?;

        pos += take;
        offset += take as u64;
    }
    Ok(())
}

enum MappingInner {
    Direct {
        block: Arc<RamBlock>,
        offset: u64,
        len: u64,
        dirty: DirtyClients,
        is_write: bool,
    },
    Bounce {
        space: Arc<AddressSpace>,
        addr: u64,
        len: u64,
        buf: Option<Box<[u8]>>,
        is_write: bool,
    },
}

/// A zero-copy (or bounce-staged) window into guest memory.
///
/// Write-direction mappings mark dirty state (direct) or flush the staged
/// bytes back through the access engine (bounce) when dropped.
pub struct GuestMapping {
    inner: MappingInner,
}

impl GuestMapping {
    /// Usable length; may be shorter than requested when the request crossed
    /// a flat-range boundary or exceeded the bounce buffer.
    pub fn len(&self) -> u64 {
        match &self.inner {
            MappingInner::Direct { len, .. } => *len,
            MappingInner::Bounce { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the mapping went through the bounce buffer.
    pub fn is_bounce(&self) -> bool {
        matches!(self.inner, MappingInner::Bounce { .. })
    }

    /// Copy bytes out of the mapped window.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> AccessResult {
        self.check(offset, dst.len() as u64)?;
        match &self.inner {
            MappingInner::Direct { block, offset: base, .. } => block
                .read(base + offset, dst)
                .map_err(|_| AccessError::Unassigned { addr: offset }),
            MappingInner::Bounce { buf, .. } => {
                let buf = buf.as_ref().expect("buffer held until drop");
                dst.copy_from_slice(&buf[offset as usize..offset as usize + dst.len()]);
                Ok(())
            }
        }
    }

    /// Copy bytes into the mapped window.
    pub fn write(&mut self, offset: u64, src: &[u8]) -> AccessResult {
        self.check(offset, src.len() as u64)?;
        match &mut self.inner {
            MappingInner::Direct {
                block,
                offset: base,
                is_write,
                ..
            } => {
                if !*is_write {
                    return Err(AccessError::Denied { addr: offset });
                }
                block
                    .write(*base + offset, src)
                    .map_err(|_| AccessError::Unassigned { addr: offset })
            }
            MappingInner::Bounce { buf, is_write, .. } => {
                if !*is_write {
                    return Err(AccessError::Denied { addr: offset });
                }
                let buf = buf.as_mut().expect("buffer held until drop");
                buf[offset as usize..offset as usize + src.len()].copy_from_slice(src);
                Ok(())
            }
        }
    }

    /// Raw host pointer to the mapped bytes.
    ///
    /// Callers must stay within [`len`](Self::len) bytes and must not create
    /// references into the region.
    pub fn host_ptr(&mut self) -> *mut u8 {
        match &mut self.inner {
            MappingInner::Direct { block, offset, .. } => block
                .host_ptr(*offset)
                .expect("mapping offsets were validated at creation"),
            MappingInner::Bounce { buf, .. } => {
                buf.as_mut().expect("buffer held until drop").as_mut_ptr()
            }
        }
    }

    fn check(&self, offset: u64, len: u64) -> AccessResult {
        let end = offset.checked_add(len);
        if end.is_none() || end.expect("checked") > self.len() {
            return Err(AccessError::Denied { addr: offset });
        }
        Ok(())
    }
}

impl Drop for GuestMapping {
    fn drop(&mut self) {
        match &mut self.inner {
            MappingInner::Direct {
                block,
                offset,
                len,
                dirty,
                is_write,
            } => {
                if *is_write && !dirty.is_empty() {
                    block.dirty().mark(*dirty, *offset, *len);
                }
            }
            MappingInner::Bounce {
                space,
                addr,
                len,
                buf,
                is_write,
            } => {
                let buf = buf.take().expect("buffer held until drop");
                if *is_write {
                    let reader = space.register_reader();
                    let r = write_impl(
                        space,
                        &reader,
                        *addr,
                        &buf[..*len as usize],
                        AccessAttrs::UNSPECIFIED,
                        0,
                    );
                    if let Err(e) = r {
                        trace!(error = %e, "bounce flush faulted");
                    }
                }
                for notify in space.bounce.release(buf) {
                    notify();
                }
            }
        }
    }
}
