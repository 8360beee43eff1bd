//! The shared region and the CPUs' views of it
//!
//! Each CPU reaches the region through a [`CpuView`], which models the two
//! hazards of a real backplane:
//!
//!  - Writes are held in a posted-write buffer until the CPU publishes them.
//!    Until then, other CPUs keep reading the old value.
//!
//!  - Reads are served from a read cache, which is only refilled after the CPU
//!    observes. Until then, the CPU keeps reading the value it first saw.
//!
//! Test-and-set and clear bypass both, as the hardware primitive does.
use r3_smobj::{
    addr::WORD_SIZE,
    port::{CpuId, PortBus, PortTestAndSet, PortVisibility},
    LocalAddr,
};
use spin::Mutex as SpinMutex;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
};

use crate::SimOptions;

/// The backing store of the shared region. Every word holds its canonical
/// (big-endian) representation.
pub struct SharedMemory {
    words: Box<[AtomicU32]>,
}

impl SharedMemory {
    pub(crate) fn new(len: u32) -> Self {
        Self {
            words: (0..len / WORD_SIZE).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Get the size of the region in bytes.
    pub fn len(&self) -> u32 {
        self.words.len() as u32 * WORD_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Read the raw bytes of the word at `offset` as they are on the bus.
    pub fn bus_bytes(&self, offset: u32) -> [u8; 4] {
        self.words[(offset / WORD_SIZE) as usize]
            .load(Ordering::Acquire)
            .to_ne_bytes()
    }
}

/// Counters of a [`CpuView`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ViewStats {
    pub publishes: usize,
    pub observes: usize,
    pub test_and_sets: usize,
}

#[derive(Default)]
struct ViewState {
    /// `(word index, raw value)` in program order
    posted: Vec<(usize, u32)>,
    cache: HashMap<usize, u32>,
}

/// One CPU's window onto the shared region.
pub(crate) struct CpuView {
    cpu: CpuId,
    mem: Arc<SharedMemory>,
    base: usize,
    options: SimOptions,
    state: SpinMutex<ViewState>,
    publishes: AtomicUsize,
    observes: AtomicUsize,
    test_and_sets: AtomicUsize,
}

impl CpuView {
    pub(crate) fn new(cpu: CpuId, mem: Arc<SharedMemory>, base: usize, options: SimOptions) -> Self {
        Self {
            cpu,
            mem,
            base,
            options,
            state: SpinMutex::new(ViewState::default()),
            publishes: AtomicUsize::new(0),
            observes: AtomicUsize::new(0),
            test_and_sets: AtomicUsize::new(0),
        }
    }

    pub(crate) fn stats(&self) -> ViewStats {
        ViewStats {
            publishes: self.publishes.load(Ordering::Relaxed),
            observes: self.observes.load(Ordering::Relaxed),
            test_and_sets: self.test_and_sets.load(Ordering::Relaxed),
        }
    }

    fn index(&self, addr: LocalAddr) -> usize {
        let offset = addr
            .0
            .checked_sub(self.base)
            .unwrap_or_else(|| panic!("{}: {addr:?} is below the region", self.cpu));
        assert_eq!(offset % WORD_SIZE as usize, 0, "{}: misaligned access", self.cpu);
        let i = offset / WORD_SIZE as usize;
        assert!(i < self.mem.words.len(), "{}: {addr:?} is past the region", self.cpu);
        i
    }
}

impl PortBus for CpuView {
    fn region_base(&self) -> LocalAddr {
        LocalAddr(self.base)
    }

    fn region_len(&self) -> u32 {
        self.mem.len()
    }

    fn load(&self, addr: LocalAddr) -> u32 {
        let i = self.index(addr);
        let mut state = self.state.lock();

        // Our own posted writes are always visible to us
        if let Some(&(_, raw)) = state.posted.iter().rev().find(|&&(j, _)| j == i) {
            return raw;
        }

        let mem = &self.mem;
        *state
            .cache
            .entry(i)
            .or_insert_with(|| mem.words[i].load(Ordering::Acquire))
    }

    fn store(&self, addr: LocalAddr, raw: u32) {
        let i = self.index(addr);
        self.state.lock().posted.push((i, raw));
    }
}

impl PortVisibility for CpuView {
    fn publish(&self) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        let posted = std::mem::take(&mut state.posted);

        for &(i, raw) in &posted {
            state.cache.insert(i, raw);
        }

        if self.options.contains(SimOptions::REORDER_POSTED_WRITES) {
            // Drain the buffer backwards, keeping only the last write to each
            // word
            let mut seen = HashSet::new();
            for &(i, raw) in posted.iter().rev() {
                if seen.insert(i) {
                    self.mem.words[i].store(raw, Ordering::Release);
                }
            }
        } else {
            for &(i, raw) in &posted {
                self.mem.words[i].store(raw, Ordering::Release);
            }
        }
    }

    fn observe(&self) {
        self.observes.fetch_add(1, Ordering::Relaxed);
        self.state.lock().cache.clear();
    }
}

impl PortTestAndSet for CpuView {
    fn test_and_set(&self, addr: LocalAddr) -> bool {
        self.test_and_sets.fetch_add(1, Ordering::Relaxed);
        let i = self.index(addr);
        let acquired = self.mem.words[i].swap(u32::MAX, Ordering::AcqRel) == 0;
        if !acquired {
            // Let the holder run; the host may have fewer cores than we have
            // threads
            std::thread::yield_now();
        }
        acquired
    }

    fn clear(&self, addr: LocalAddr) {
        let i = self.index(addr);
        self.mem.words[i].store(0, Ordering::Release);
    }
}
