//! Typed access to the shared region through one CPU's mapping
use crate::{
    addr::{decode, encode, AddrMap, GlobalAddr, LocalAddr},
    port::{PortBus, PortVisibility},
};

/// An accessor for the shared region as seen by one CPU.
///
/// All values pass through [`encode`]/[`decode`] and all addresses pass
/// through the CPU's [`AddrMap`]. Nothing here orders memory accesses by
/// itself; callers bracket accesses with [`Self::publish`] and
/// [`Self::observe`] where cross-CPU visibility matters.
pub struct Shm<'a, P: ?Sized> {
    port: &'a P,
    map: AddrMap,
}

impl<P: ?Sized> Clone for Shm<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: ?Sized> Copy for Shm<'_, P> {}

impl<'a, P: PortBus + PortVisibility + ?Sized> Shm<'a, P> {
    #[inline]
    pub fn new(port: &'a P, map: AddrMap) -> Self {
        Self { port, map }
    }

    #[inline]
    pub fn port(&self) -> &'a P {
        self.port
    }

    #[inline]
    pub fn map(&self) -> &AddrMap {
        &self.map
    }

    /// Translate a global address into this CPU's local address.
    #[inline]
    pub fn to_local(&self, addr: GlobalAddr) -> LocalAddr {
        self.map.to_local(addr)
    }

    /// Read a word in the native representation.
    #[inline]
    pub fn load(&self, addr: GlobalAddr) -> u32 {
        decode(self.port.load(self.map.to_local(addr)))
    }

    /// Write a word in the native representation.
    #[inline]
    pub fn store(&self, addr: GlobalAddr, value: u32) {
        self.port.store(self.map.to_local(addr), encode(value));
    }

    /// Read a link word.
    #[inline]
    pub fn load_link(&self, addr: GlobalAddr) -> Option<GlobalAddr> {
        GlobalAddr::decode_link(self.port.load(self.map.to_local(addr)))
    }

    /// Write a link word.
    #[inline]
    pub fn store_link(&self, addr: GlobalAddr, link: Option<GlobalAddr>) {
        self.port
            .store(self.map.to_local(addr), GlobalAddr::encode_link(link));
    }

    #[inline]
    pub(crate) fn load_bool(&self, addr: GlobalAddr) -> bool {
        self.load(addr) != 0
    }

    #[inline]
    pub(crate) fn store_bool(&self, addr: GlobalAddr, value: bool) {
        self.store(addr, value as u32);
    }

    /// Read a word at a raw offset. Only used for the region header, which
    /// lives at offset zero.
    #[inline]
    pub(crate) fn load_at(&self, offset: u32) -> u32 {
        decode(self.port.load(self.map.offset_to_local(offset)))
    }

    /// Write a word at a raw offset. See [`Self::load_at`].
    #[inline]
    pub(crate) fn store_at(&self, offset: u32, value: u32) {
        self.port
            .store(self.map.offset_to_local(offset), encode(value));
    }

    /// Force this CPU's pending writes onto the bus.
    #[inline]
    pub fn publish(&self) {
        self.port.publish();
    }

    /// Discard stale cached values before reading.
    #[inline]
    pub fn observe(&self) {
        self.port.observe();
    }
}
