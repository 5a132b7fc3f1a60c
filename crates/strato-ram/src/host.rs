//! Raw host mappings used as guest RAM backing store.
//!
//! A [`HostMapping`] owns one `mmap` allocation for the lifetime of the block
//! it backs. The mapping never exposes references into the backing bytes:
//! guest memory is concurrently mutated by vCPU threads and by DMA-capable
//! device models, so all access goes through raw-pointer copy APIs on the
//! owning block.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

use bitflags::bitflags;

bitflags! {
    /// Memory protections applied to a host mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: i32 {
        const NONE = 0;
        const READ = libc::PROT_READ;
        const WRITE = libc::PROT_WRITE;
        const RW = libc::PROT_READ | libc::PROT_WRITE;
    }
}

/// Returns the host page size in bytes.
pub fn host_page_size() -> usize {
    // Safety: sysconf(_SC_PAGESIZE) has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

/// An owned anonymous or file-backed host mapping.
#[derive(Debug)]
pub struct HostMapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl HostMapping {
    /// Map `len` bytes of zeroed anonymous memory.
    pub fn anonymous(len: usize, shared: bool, noreserve: bool) -> io::Result<Self> {
        let mut flags = libc::MAP_ANONYMOUS;
        flags |= if shared { libc::MAP_SHARED } else { libc::MAP_PRIVATE };
        if noreserve {
            flags |= libc::MAP_NORESERVE;
        }
        Self::mmap(len, Prot::RW, flags, -1, 0)
    }

    /// Map `len` bytes of anonymous memory whose base address is a multiple
    /// of `align`.
    ///
    /// `align` must be a power of two. Alignments up to the host page size
    /// are free; larger ones over-map and trim the head and tail back to the
    /// kernel.
    pub fn anonymous_aligned(
        len: usize,
        align: usize,
        shared: bool,
        noreserve: bool,
    ) -> io::Result<Self> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        if align <= host_page_size() {
            return Self::anonymous(len, shared, noreserve);
        }

        let padded = len
            .checked_add(align)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        let raw = Self::anonymous(padded, shared, noreserve)?;

        let base = raw.ptr.as_ptr() as usize;
        let aligned = (base + align - 1) & !(align - 1);
        let head = aligned - base;
        let tail = padded - head - len;

        // Hand the mapping over to manual cleanup: the head/tail trims below
        // leave a region `Drop` must not unmap twice.
        let _raw = std::mem::ManuallyDrop::new(raw);

        // Safety: both trims stay inside the freshly created mapping and the
        // surviving middle region [aligned, aligned + len) is never touched.
        unsafe {
            if head != 0 {
                libc::munmap(base as *mut libc::c_void, head);
            }
            if tail != 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, tail);
            }
        }

        Ok(Self {
            ptr: NonNull::new(aligned as *mut u8).expect("aligned base is non-null"),
            len,
        })
    }

    /// Map `len` bytes of `file` starting at byte `offset`.
    pub fn file_backed(file: &File, offset: u64, len: usize, shared: bool) -> io::Result<Self> {
        let flags = if shared {
            libc::MAP_SHARED
        } else {
            libc::MAP_PRIVATE
        };
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        Self::mmap(len, Prot::RW, flags, file.as_raw_fd(), offset)
    }

    fn mmap(
        len: usize,
        prot: Prot,
        flags: libc::c_int,
        fd: libc::c_int,
        offset: libc::off_t,
    ) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        // Safety: a NULL hint lets the kernel choose a free range; `fd` is
        // either -1 (anonymous) or a live descriptor owned by the caller,
        // which must keep the underlying object alive while the mapping is.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot.bits(),
                flags,
                fd,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: NonNull::new(ptr as *mut u8).expect("mmap result is non-null"),
            len,
        })
    }

    /// Advise the kernel that this mapping would benefit from huge pages.
    ///
    /// Purely a hint; failure is ignored.
    pub fn advise_hugepages(&self) {
        #[cfg(target_os = "linux")]
        // Safety: the advised range is exactly the owned mapping.
        unsafe {
            libc::madvise(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.len,
                libc::MADV_HUGEPAGE,
            );
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base pointer of the mapping.
    ///
    /// Callers must stay within `len()` bytes and must not create references
    /// into the region; see the module docs.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for HostMapping {
    fn drop(&mut self) {
        // Safety: the pointer/length pair describes the mapping created in
        // `mmap` (or the trimmed middle of `anonymous_aligned`), unmapped
        // exactly once.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

// Safety: `HostMapping`'s API hands out only raw pointers, never references
// into the mapped bytes, so moving or sharing the owner across threads cannot
// introduce aliasing the type system is unaware of.
unsafe impl Send for HostMapping {}
unsafe impl Sync for HostMapping {}
