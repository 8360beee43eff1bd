//! Address and byte-order translation
//!
//! Every CPU maps the shared region at its own virtual address, and the CPUs
//! don't necessarily agree on the byte order. Shared objects therefore never
//! store a CPU's native pointer or native multi-byte value:
//!
//!  - A pointer is stored as a [`GlobalAddr`], the byte offset from the start
//!    of the region. A CPU converts between global and local addresses with
//!    its [`AddrMap`], which is just one additive constant.
//!
//!  - Every 32-bit word is stored in the canonical (big-endian) byte order.
//!    [`encode`] and [`decode`] convert between the native and canonical
//!    representations.
//!
//! The region's first bytes are occupied by the region header, so no shared
//! object can have the offset zero. The link word `0` is therefore used as the
//! canonical representation of "no object", and Rust code sees it as `None`.
//! Translating a link never produces a native null pointer that would have to
//! be compared against a translated zero.
use core::{fmt, num::NonZeroU32};

/// The size of a shared-memory word in bytes.
pub const WORD_SIZE: u32 = 4;

/// The global address of a shared object: the byte offset from the start of
/// the shared region. Identical in meaning on every CPU.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct GlobalAddr(NonZeroU32);

impl GlobalAddr {
    /// Construct a `GlobalAddr` from a byte offset. Returns `None` for zero.
    #[inline]
    pub const fn new(offset: u32) -> Option<Self> {
        match NonZeroU32::new(offset) {
            Some(x) => Some(Self(x)),
            None => None,
        }
    }

    /// Get the byte offset.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// Get the address of the field located `offset` bytes after `self`.
    #[inline]
    pub const fn field(self, offset: u32) -> Self {
        // `self.0 + offset` can't be zero unless it overflows, which we check
        // when validating object handles
        match NonZeroU32::new(self.0.get().wrapping_add(offset)) {
            Some(x) => Self(x),
            None => panic!("address overflow"),
        }
    }

    /// Check if `self` is aligned to [`WORD_SIZE`].
    #[inline]
    pub const fn is_word_aligned(self) -> bool {
        self.0.get() % WORD_SIZE == 0
    }

    /// Encode a link into its canonical word representation.
    #[inline]
    pub fn encode_link(x: Option<Self>) -> u32 {
        encode(x.map_or(0, Self::get))
    }

    /// Decode a link from its canonical word representation.
    #[inline]
    pub fn decode_link(raw: u32) -> Option<Self> {
        Self::new(decode(raw))
    }
}

impl fmt::Debug for GlobalAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "G:{:#x}", self.0)
    }
}

/// A CPU-local address, i.e., an address in the shared region as seen by one
/// particular CPU. Meaningless on any other CPU.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalAddr(pub usize);

impl fmt::Debug for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "L:{:#x}", self.0)
    }
}

/// The translation between global and local addresses for one CPU.
///
/// Established once when the CPU attaches the shared region.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AddrMap {
    base: usize,
    len: u32,
}

impl AddrMap {
    /// Construct an `AddrMap` for a region of `len` bytes mapped at `base`.
    pub const fn new(base: LocalAddr, len: u32) -> Self {
        Self { base: base.0, len }
    }

    /// Get the local address where the region starts.
    #[inline]
    pub const fn base(&self) -> LocalAddr {
        LocalAddr(self.base)
    }

    /// Get the size of the region in bytes.
    #[inline]
    pub const fn len(&self) -> u32 {
        self.len
    }

    /// Translate a global address into a local one.
    #[inline]
    pub fn to_local(&self, addr: GlobalAddr) -> LocalAddr {
        debug_assert!(addr.get() < self.len, "{addr:?} is outside the region");
        LocalAddr(self.base + addr.get() as usize)
    }

    /// Translate a raw offset, including the region header's offset zero,
    /// into a local address.
    #[inline]
    pub(crate) fn offset_to_local(&self, offset: u32) -> LocalAddr {
        debug_assert!(offset < self.len);
        LocalAddr(self.base + offset as usize)
    }

    /// Translate a local address into a global one. Returns `None` if `addr`
    /// is outside the region or is the region's first byte.
    #[inline]
    pub fn to_global(&self, addr: LocalAddr) -> Option<GlobalAddr> {
        let offset = addr.0.checked_sub(self.base)?;
        if offset >= self.len as usize {
            return None;
        }
        GlobalAddr::new(offset as u32)
    }

    /// Check if an object of `size` bytes at `addr` lies entirely within the
    /// region and is word-aligned.
    pub fn contains_object(&self, addr: GlobalAddr, size: u32) -> bool {
        addr.is_word_aligned()
            && addr
                .get()
                .checked_add(size)
                .map_or(false, |end| end <= self.len)
    }
}

impl fmt::Debug for AddrMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AddrMap")
            .field("base", &self.base())
            .field("len", &self.len)
            .finish()
    }
}

/// Convert a native value into its canonical word representation.
#[inline]
pub const fn encode(x: u32) -> u32 {
    x.to_be()
}

/// Convert a canonical word into a native value.
#[inline]
pub const fn decode(raw: u32) -> u32 {
    u32::from_be(raw)
}
