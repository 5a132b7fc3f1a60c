//! Access attributes, results, and the traits device models implement.

use std::sync::Arc;

use thiserror::Error;

use crate::topology::AddressSpace;

/// Attributes carried by every guest memory transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessAttrs {
    /// Secure-world access (e.g. TrustZone-style buses).
    pub secure: bool,
    /// The transaction may only touch RAM-like memory; device regions reject
    /// it without side effects.
    pub mem_only: bool,
    /// Issued by introspection tooling; bypasses guest-visible write
    /// protection.
    pub debug: bool,
}

impl AccessAttrs {
    /// Attributes of an ordinary, unannotated CPU access.
    pub const UNSPECIFIED: Self = Self {
        secure: false,
        mem_only: false,
        debug: false,
    };
}

/// Failure of a guest memory transaction.
///
/// These are guest-visible conditions (typically folded into a bus fault by
/// the caller), never emulator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessError {
    /// No region backs the address; reads observe open-bus data.
    #[error("no region backs guest address {addr:#x}")]
    Unassigned { addr: u64 },
    /// A region is present but rejected this transaction's size, alignment,
    /// attributes, or permissions.
    #[error("access to guest address {addr:#x} rejected")]
    Denied { addr: u64 },
}

pub type AccessResult<T = ()> = Result<T, AccessError>;

/// Byte order a device declares for multi-byte register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Device registers are little-endian (the common case on PC-like
    /// platforms).
    #[default]
    Little,
    Big,
}

/// Access-size envelope a device declares for its register window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessConstraints {
    /// Smallest access the device implements, in bytes (power of two).
    pub min_size: u64,
    /// Largest access the device implements, in bytes (power of two).
    pub max_size: u64,
    /// Whether accesses not naturally aligned to their size are allowed.
    pub unaligned: bool,
}

impl Default for AccessConstraints {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 8,
            unaligned: true,
        }
    }
}

/// Register-access callbacks implemented by device models.
///
/// `offset` is relative to the start of the owning region. `size` is always
/// within the envelope declared by [`DeviceOps::access`], and `value` uses
/// host integer representation; the engine performs the byte-order
/// conversion declared by [`DeviceOps::endianness`].
pub trait DeviceOps: Send + Sync {
    fn read(&self, offset: u64, size: u64, attrs: AccessAttrs) -> AccessResult<u64>;
    fn write(&self, offset: u64, size: u64, value: u64, attrs: AccessAttrs) -> AccessResult<()>;

    fn access(&self) -> AccessConstraints {
        AccessConstraints::default()
    }

    fn endianness(&self) -> Endianness {
        Endianness::default()
    }

    /// Gate individual transactions beyond the size envelope.
    fn accepts(&self, _offset: u64, _size: u64, _is_write: bool, _attrs: AccessAttrs) -> bool {
        true
    }
}

/// Permissions granted by an IOMMU translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IommuPerm {
    pub read: bool,
    pub write: bool,
}

impl IommuPerm {
    pub const RW: Self = Self {
        read: true,
        write: true,
    };
    pub const READ: Self = Self {
        read: true,
        write: false,
    };
    pub const NONE: Self = Self {
        read: false,
        write: false,
    };

    #[inline]
    pub fn allows(&self, is_write: bool) -> bool {
        if is_write {
            self.write
        } else {
            self.read
        }
    }
}

/// Result of one IOMMU translation step.
#[derive(Clone)]
pub struct IommuTranslation {
    /// Address space the translated access continues in. Chained IOMMUs are
    /// expressed by this space resolving to another IOMMU region.
    pub target: Arc<AddressSpace>,
    /// Translated address of the page containing the input address.
    pub translated_addr: u64,
    /// Mask of the in-page bits preserved from the input address. Also the
    /// effective page mask for fast-path caching (huge mappings widen it).
    pub addr_mask: u64,
    pub perm: IommuPerm,
}

/// Translation callbacks implemented by IOMMU region models.
pub trait IommuOps: Send + Sync {
    /// Translate `addr` (relative to the IOMMU region) for the given
    /// direction.
    ///
    /// Returning a translation with insufficient permissions, or
    /// `Err(AccessError)`, makes the access fail without side effects.
    fn translate(&self, addr: u64, is_write: bool) -> AccessResult<IommuTranslation>;
}

/// Observer of IOMMU mapping revocations.
///
/// Fast-path translation caches register one of these and flush the named
/// range when it fires.
pub trait IommuInvalidate: Send + Sync {
    fn invalidate(&self, addr: u64, len: u64);
}
