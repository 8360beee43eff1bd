//! Per-CPU configuration
use crate::{port::MAX_NUM_CPUS, spinlock::DEFAULT_SPIN_TRIES};

/// The configuration supplied to [`SmSystem::init_region`] and
/// [`SmSystem::attach`].
///
/// Every CPU attached to a region must specify the same `num_cpus`.
///
/// [`SmSystem::init_region`]: crate::SmSystem::init_region
/// [`SmSystem::attach`]: crate::SmSystem::attach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmConfig {
    num_cpus: usize,
    spin_tries: u32,
}

impl SmConfig {
    /// Construct an `SmConfig` for a system of `num_cpus` CPUs with the
    /// default settings.
    pub const fn new(num_cpus: usize) -> Self {
        Self {
            num_cpus,
            spin_tries: DEFAULT_SPIN_TRIES,
        }
    }

    /// Specify how many times a shared-memory spin lock is tried before the
    /// operation fails with `LockTimeout`.
    pub const fn with_spin_tries(self, spin_tries: u32) -> Self {
        Self { spin_tries, ..self }
    }

    #[inline]
    pub const fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    #[inline]
    pub const fn spin_tries(&self) -> u32 {
        self.spin_tries
    }

    pub(crate) const fn is_valid(&self) -> bool {
        self.num_cpus >= 1 && self.num_cpus <= MAX_NUM_CPUS && self.spin_tries > 0
    }
}
