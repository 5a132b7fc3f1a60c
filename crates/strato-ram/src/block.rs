//! RAM blocks: named, contiguous host allocations backing guest RAM and ROM.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use thiserror::Error;
use tracing::debug;

use crate::dirty::DirtyBitmap;
use crate::host::{host_page_size, HostMapping};

bitflags! {
    /// Allocation behavior for a [`RamBlock`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RamFlags: u32 {
        /// Map `MAP_SHARED` so other processes (or a backing file) observe
        /// guest stores.
        const SHARED = 1 << 0;
        /// Allow [`RamBlock::resize`] up to the declared maximum size.
        const RESIZEABLE = 1 << 1;
        /// Do not reserve swap for the mapping (`MAP_NORESERVE`).
        const NORESERVE = 1 << 2;
        /// Hint the kernel to back the block with huge pages.
        const HUGEPAGE = 1 << 3;
    }
}

/// Errors from RAM backing allocation and access.
#[derive(Debug, Error)]
pub enum RamError {
    #[error("ram block {name:?} must have a non-zero size")]
    ZeroSize { name: String },
    #[error("ram block {name:?}: host mapping failed")]
    Mmap {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("ram block {name:?}: backing file error")]
    Backing {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("ram block {name:?} is not resizeable")]
    NotResizeable { name: String },
    #[error("ram block {name:?}: size {size:#x} exceeds maximum {max:#x}")]
    BeyondMax { name: String, size: u64, max: u64 },
    #[error("ram block {name:?}: access out of range: offset={offset:#x} len={len:#x} size={size:#x}")]
    OutOfRange {
        name: String,
        offset: u64,
        len: u64,
        size: u64,
    },
}

pub type RamResult<T> = Result<T, RamError>;

/// A contiguous host allocation backing one or more guest RAM regions.
///
/// The host mapping is created at `max_size` up front so that resizing only
/// moves the logical length: host pointers handed out for the block stay
/// valid across [`RamBlock::resize`].
///
/// Guest bytes are accessed exclusively through the copy APIs ([`read`],
/// [`write`], [`fill`]) or through the raw [`host_ptr`]; no method returns a
/// reference into the backing store, because vCPU threads and device DMA
/// mutate it concurrently.
///
/// [`read`]: RamBlock::read
/// [`write`]: RamBlock::write
/// [`fill`]: RamBlock::fill
/// [`host_ptr`]: RamBlock::host_ptr
#[derive(Debug)]
pub struct RamBlock {
    name: String,
    mapping: HostMapping,
    len: AtomicU64,
    max_len: u64,
    flags: RamFlags,
    file: Option<std::fs::File>,
    page_size: u64,
    dirty: DirtyBitmap,
}

impl RamBlock {
    /// Allocate an anonymous block of `size` bytes.
    pub fn anonymous(name: impl Into<String>, size: u64, flags: RamFlags) -> RamResult<Self> {
        Self::anonymous_resizeable(name, size, size, flags)
    }

    /// Allocate an anonymous block with room to grow to `max_size`.
    ///
    /// `flags` must contain [`RamFlags::RESIZEABLE`] if `max_size > size`.
    pub fn anonymous_resizeable(
        name: impl Into<String>,
        size: u64,
        max_size: u64,
        flags: RamFlags,
    ) -> RamResult<Self> {
        let name = name.into();
        let max_size = max_size.max(size);
        let map_len = Self::check_size(&name, max_size)?;

        let mapping = HostMapping::anonymous(
            map_len,
            flags.contains(RamFlags::SHARED),
            flags.contains(RamFlags::NORESERVE),
        )
        .map_err(|source| RamError::Mmap {
            name: name.clone(),
            source,
        })?;

        Ok(Self::finish(name, mapping, size, max_size, flags, None))
    }

    /// Allocate an anonymous block whose host base address is aligned to
    /// `align` bytes (a power of two).
    pub fn anonymous_aligned(
        name: impl Into<String>,
        size: u64,
        align: usize,
        flags: RamFlags,
    ) -> RamResult<Self> {
        let name = name.into();
        let map_len = Self::check_size(&name, size)?;

        let mapping = HostMapping::anonymous_aligned(
            map_len,
            align,
            flags.contains(RamFlags::SHARED),
            flags.contains(RamFlags::NORESERVE),
        )
        .map_err(|source| RamError::Mmap {
            name: name.clone(),
            source,
        })?;

        Ok(Self::finish(name, mapping, size, size, flags, None))
    }

    /// Map `size` bytes of `path` starting at `offset` as the block's
    /// backing store.
    ///
    /// With `truncate`, the file is created if absent and grown to cover the
    /// mapped range.
    pub fn from_file(
        name: impl Into<String>,
        path: &Path,
        offset: u64,
        size: u64,
        truncate: bool,
        flags: RamFlags,
    ) -> RamResult<Self> {
        let name = name.into();
        let map_len = Self::check_size(&name, size)?;

        let backing = |source| RamError::Backing {
            name: name.clone(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(truncate)
            .open(path)
            .map_err(backing)?;
        if truncate {
            file.set_len(offset + size).map_err(backing)?;
        }

        let mapping =
            HostMapping::file_backed(&file, offset, map_len, flags.contains(RamFlags::SHARED))
                .map_err(|source| RamError::Mmap {
                    name: name.clone(),
                    source,
                })?;

        Ok(Self::finish(name, mapping, size, size, flags, Some(file)))
    }

    fn check_size(name: &str, size: u64) -> RamResult<usize> {
        if size == 0 {
            return Err(RamError::ZeroSize {
                name: name.to_owned(),
            });
        }
        usize::try_from(size).map_err(|_| RamError::Mmap {
            name: name.to_owned(),
            source: io::Error::from(io::ErrorKind::InvalidInput),
        })
    }

    fn finish(
        name: String,
        mapping: HostMapping,
        size: u64,
        max_size: u64,
        flags: RamFlags,
        file: Option<std::fs::File>,
    ) -> Self {
        if flags.contains(RamFlags::HUGEPAGE) {
            mapping.advise_hugepages();
        }
        debug!(
            name = %name,
            size = format_args!("{size:#x}"),
            max = format_args!("{max_size:#x}"),
            ?flags,
            "allocated ram block"
        );
        Self {
            name,
            mapping,
            len: AtomicU64::new(size),
            max_len: max_size,
            flags,
            file,
            page_size: host_page_size() as u64,
            dirty: DirtyBitmap::new(max_size),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current logical size in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resize ceiling fixed at allocation time.
    #[inline]
    pub fn max_len(&self) -> u64 {
        self.max_len
    }

    #[inline]
    pub fn flags(&self) -> RamFlags {
        self.flags
    }

    /// Effective host page size of the backing mapping.
    #[inline]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// The block's dirty-page bitmaps.
    #[inline]
    pub fn dirty(&self) -> &DirtyBitmap {
        &self.dirty
    }

    /// Host pointer to byte `offset` of the block.
    ///
    /// The pointer stays valid for the lifetime of the block (resizes do not
    /// move the mapping). Callers must respect the current logical length.
    pub fn host_ptr(&self, offset: u64) -> RamResult<*mut u8> {
        self.check_range(offset, 0)?;
        // Safety: `check_range` bounds `offset` within the mapping.
        Ok(unsafe { self.mapping.as_ptr().add(offset as usize) })
    }

    /// Grow or shrink the block's logical size.
    ///
    /// Requires [`RamFlags::RESIZEABLE`]; `new_size` may not exceed the
    /// maximum declared at allocation. File-backed blocks extend the backing
    /// file to match.
    pub fn resize(&self, new_size: u64) -> RamResult<()> {
        if !self.flags.contains(RamFlags::RESIZEABLE) {
            return Err(RamError::NotResizeable {
                name: self.name.clone(),
            });
        }
        if new_size == 0 || new_size > self.max_len {
            return Err(RamError::BeyondMax {
                name: self.name.clone(),
                size: new_size,
                max: self.max_len,
            });
        }
        if let Some(file) = &self.file {
            file.set_len(new_size).map_err(|source| RamError::Backing {
                name: self.name.clone(),
                source,
            })?;
        }
        self.len.store(new_size, Ordering::Release);
        debug!(
            name = %self.name,
            size = format_args!("{new_size:#x}"),
            "resized ram block"
        );
        Ok(())
    }

    fn check_range(&self, offset: u64, len: u64) -> RamResult<()> {
        let size = self.len();
        let oob = || RamError::OutOfRange {
            name: self.name.clone(),
            offset,
            len,
            size,
        };
        let end = offset.checked_add(len).ok_or_else(oob)?;
        if end > size {
            return Err(oob());
        }
        Ok(())
    }

    /// Copy bytes out of the block.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> RamResult<()> {
        self.check_range(offset, dst.len() as u64)?;
        if dst.is_empty() {
            return Ok(());
        }
        // Safety: bounds checked above; source and destination cannot overlap
        // because `dst` is a live Rust allocation, not guest memory.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.mapping.as_ptr().add(offset as usize),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes into the block.
    ///
    /// Takes `&self`: guest RAM is shared mutable state and the mapping is
    /// only ever accessed through raw pointers.
    pub fn write(&self, offset: u64, src: &[u8]) -> RamResult<()> {
        self.check_range(offset, src.len() as u64)?;
        if src.is_empty() {
            return Ok(());
        }
        // Safety: bounds checked above; `src` is a live Rust allocation
        // disjoint from guest memory.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.mapping.as_ptr().add(offset as usize),
                src.len(),
            );
        }
        Ok(())
    }

    /// Fill a range of the block with `val`.
    pub fn fill(&self, offset: u64, len: u64, val: u8) -> RamResult<()> {
        self.check_range(offset, len)?;
        // Safety: bounds checked above.
        unsafe {
            self.mapping
                .as_ptr()
                .add(offset as usize)
                .write_bytes(val, len as usize);
        }
        Ok(())
    }
}
