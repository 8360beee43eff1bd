//! The region header and CPU attachment
//!
//! The first eight words of the region hold a header describing the region's
//! format. Since nothing else may live at offset zero, a zero link word can
//! serve as the canonical null.
use core::fmt;

use crate::{
    addr::GlobalAddr,
    cfg::SmConfig,
    error::{AttachError, BadParamError},
    port::{CpuId, Port, MAX_NUM_CPUS},
    spinlock::SpinLock,
    SmSystem,
};

const HDR_MAGIC: u32 = 0;
const HDR_VERSION: u32 = 4;
const HDR_PROBE: u32 = 8;
const HDR_NUM_CPUS: u32 = 12;
const HDR_LEN: u32 = 16;
const HDR_ATTACHED: u32 = 20;
const HDR_LOCK: u32 = 24;
const HDR_RESERVED: u32 = 28;

/// The size of the region header. No object may start below this offset.
pub const HEADER_SIZE: u32 = 32;

const MAGIC: u32 = 0x534d_4f42;
const FORMAT_VERSION: u32 = 1;
/// Reads back as this value only if every CPU agrees on the canonical byte
/// order.
const BYTE_ORDER_PROBE: u32 = 0x0102_0304;

const HEADER_LOCK: SpinLock = SpinLock::new(match GlobalAddr::new(HDR_LOCK) {
    Some(x) => x,
    None => panic!(),
});

/// A set of [`CpuId`]s.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet(u32);

impl CpuSet {
    #[inline]
    pub const fn contains(&self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu.get()) != 0
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        (0..MAX_NUM_CPUS)
            .filter_map(CpuId::new)
            .filter(|&cpu| self.contains(cpu))
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<P: Port> SmSystem<P> {
    /// Format the shared region and attach the current CPU to it. Must be
    /// called by exactly one CPU before any other CPU calls [`Self::attach`].
    pub fn init_region(port: P, cfg: SmConfig) -> Result<Self, AttachError> {
        let this = Self::new(port, cfg)?;
        let shm = this.shm();
        let cpu = this.cpu_id();

        shm.store_at(HDR_VERSION, FORMAT_VERSION);
        shm.store_at(HDR_PROBE, BYTE_ORDER_PROBE);
        shm.store_at(HDR_NUM_CPUS, cfg.num_cpus() as u32);
        shm.store_at(HDR_LEN, this.map.len());
        shm.store_at(HDR_ATTACHED, 1 << cpu.get());
        shm.store_at(HDR_RESERVED, 0);
        HEADER_LOCK.init(shm);
        shm.publish();

        // The magic number goes last so that a CPU attaching concurrently
        // doesn't accept a half-written header
        shm.store_at(HDR_MAGIC, MAGIC);
        shm.publish();

        log::debug!("{}: initialized the shared region {:?}", cpu, this.map);
        Ok(this)
    }

    /// Attach the current CPU to a shared region previously formatted by
    /// [`Self::init_region`].
    pub fn attach(port: P, cfg: SmConfig) -> Result<Self, AttachError> {
        let this = Self::new(port, cfg)?;
        let shm = this.shm();
        let cpu = this.cpu_id();

        shm.observe();
        let magic = shm.load_at(HDR_MAGIC);
        let version = shm.load_at(HDR_VERSION);
        let probe = shm.load_at(HDR_PROBE);
        if magic != MAGIC || version != FORMAT_VERSION || probe != BYTE_ORDER_PROBE {
            log::debug!(
                "{}: the region header is invalid (magic = {:#x}, version = {}, probe = {:#x})",
                cpu,
                magic,
                version,
                probe
            );
            return Err(AttachError::BadObjectState);
        }

        let num_cpus = shm.load_at(HDR_NUM_CPUS);
        let len = shm.load_at(HDR_LEN);
        if num_cpus as usize != cfg.num_cpus() || len != this.map.len() {
            log::debug!(
                "{}: the region was formatted for {} CPUs and {} bytes, but \
                 this CPU expected {} CPUs and {} bytes",
                cpu,
                num_cpus,
                len,
                cfg.num_cpus(),
                this.map.len()
            );
            return Err(AttachError::BadObjectState);
        }

        {
            let _lock = HEADER_LOCK.lock(shm, cfg.spin_tries())?;
            let attached = shm.load_at(HDR_ATTACHED);
            shm.store_at(HDR_ATTACHED, attached | (1 << cpu.get()));
        }

        log::debug!("{}: attached to the shared region {:?}", cpu, this.map);
        Ok(this)
    }

    /// Get the set of CPUs that have attached to the region.
    pub fn attached_cpus(&self) -> CpuSet {
        let shm = self.shm();
        shm.observe();
        CpuSet(shm.load_at(HDR_ATTACHED))
    }
}

pub(crate) fn check_region_len(len: u32) -> Result<(), BadParamError> {
    if len < HEADER_SIZE || len % crate::addr::WORD_SIZE != 0 {
        Err(BadParamError::BadParam)
    } else {
        Ok(())
    }
}
