#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
pub mod addr;
pub mod cfg;
pub mod error;
pub mod klock;
pub mod list;
pub mod port;
mod proxy;
mod region;
mod semaphore;
pub mod smem;
pub mod spinlock;
mod state;
#[cfg(test)]
mod test_port;

pub use self::{
    addr::{AddrMap, GlobalAddr, LocalAddr},
    cfg::SmConfig,
    error::*,
    port::{BlockOutcome, CpuId, LocalTask, Pool, Port, Timeout, MAX_NUM_CPUS},
    proxy::PROXY_SIZE,
    region::{CpuSet, HEADER_SIZE},
    semaphore::{SemaphoreInfo, SemaphoreKind, SmSemId, Waiter, SEMAPHORE_SIZE},
};

use self::{error::BadParamError, smem::Shm};

/// The shared-memory object layer as seen by one CPU.
///
/// Each CPU owns one `SmSystem`, created by [`Self::init_region`] on exactly
/// one CPU and by [`Self::attach`] on the others. Objects are named by
/// [`GlobalAddr`]-based handles, which can be passed between CPUs as they are.
#[derive(Debug, Clone)]
pub struct SmSystem<P> {
    port: P,
    map: AddrMap,
    cfg: SmConfig,
}

impl<P: Port> SmSystem<P> {
    fn new(port: P, cfg: SmConfig) -> Result<Self, BadParamError> {
        let cpu = port.cpu_id();
        let base = port.region_base();
        let len = port.region_len();
        if !cfg.is_valid()
            || cpu.get() >= cfg.num_cpus()
            || base.0 % addr::WORD_SIZE as usize != 0
        {
            return Err(BadParamError::BadParam);
        }
        region::check_region_len(len)?;

        Ok(Self {
            port,
            map: AddrMap::new(base, len),
            cfg,
        })
    }

    /// Get the port.
    #[inline]
    pub fn port(&self) -> &P {
        &self.port
    }

    #[inline]
    pub fn cfg(&self) -> &SmConfig {
        &self.cfg
    }

    #[inline]
    pub fn cpu_id(&self) -> CpuId {
        self.port.cpu_id()
    }

    /// Get the translation between this CPU's addresses and global addresses.
    #[inline]
    pub fn addr_map(&self) -> &AddrMap {
        &self.map
    }

    /// Get an accessor for the shared region.
    #[inline]
    pub fn shm(&self) -> Shm<'_, P> {
        Shm::new(&self.port, self.map)
    }

    /// Translate a global address into this CPU's local address.
    #[inline]
    pub fn to_local(&self, addr: GlobalAddr) -> LocalAddr {
        self.map.to_local(addr)
    }

    /// Translate this CPU's local address into a global address. Returns
    /// `None` if `addr` is outside the region.
    #[inline]
    pub fn to_global(&self, addr: LocalAddr) -> Option<GlobalAddr> {
        self.map.to_global(addr)
    }
}
