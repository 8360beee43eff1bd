//! Bounded spin lock built on the hardware test-and-set word
//!
//! This is the only cross-CPU mutual exclusion mechanism. Every CPU spinning
//! on a lock adds the spinning time to its own interrupt latency, so the lock
//! gives up after a configured number of attempts instead of spinning forever,
//! and it's never held across anything that may take long (blocking, the
//! notification transport, the pool allocator).
use core::fmt;

use crate::{
    addr::GlobalAddr,
    error::LockTimeoutError,
    port::{PortBus, PortTestAndSet, PortVisibility},
    smem::Shm,
};

/// The default number of test-and-set attempts.
pub const DEFAULT_SPIN_TRIES: u32 = 5000;

/// A spin lock occupying one word of the shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinLock {
    word: GlobalAddr,
}

impl SpinLock {
    #[inline]
    pub const fn new(word: GlobalAddr) -> Self {
        Self { word }
    }

    /// Get the address of the lock word.
    #[inline]
    pub const fn word(&self) -> GlobalAddr {
        self.word
    }

    /// Put the lock word in the released state. The caller is responsible for
    /// publishing the write.
    pub fn init<P: PortBus + PortVisibility + ?Sized>(&self, shm: Shm<'_, P>) {
        shm.store(self.word, 0);
    }

    /// Try to acquire the lock at most `tries` times. At least one attempt is
    /// made even if `tries` is zero.
    ///
    /// On success, this CPU's stale cached values are discarded so that the
    /// values published by the previous owner are observed. The guard publishes
    /// this CPU's writes before releasing the lock.
    pub fn lock<'a, P: PortBus + PortVisibility + PortTestAndSet + ?Sized>(
        &self,
        shm: Shm<'a, P>,
        tries: u32,
    ) -> Result<SpinLockGuard<'a, P>, LockTimeoutError> {
        let local = shm.to_local(self.word);
        let tries = tries.max(1);
        for _ in 0..tries {
            if shm.port().test_and_set(local) {
                shm.observe();
                return Ok(SpinLockGuard {
                    shm,
                    word: self.word,
                });
            }
            core::hint::spin_loop();
        }

        log::warn!(
            "spin lock {:?} ({:?}) was not acquired after {} tries",
            self.word,
            local,
            tries
        );
        Err(LockTimeoutError::LockTimeout)
    }
}

/// RAII guard for a [`SpinLock`].
pub struct SpinLockGuard<'a, P: PortBus + PortVisibility + PortTestAndSet + ?Sized> {
    shm: Shm<'a, P>,
    word: GlobalAddr,
}

impl<'a, P: PortBus + PortVisibility + PortTestAndSet + ?Sized> SpinLockGuard<'a, P> {
    /// Get the accessor the lock was acquired with.
    #[inline]
    pub fn shm(&self) -> Shm<'a, P> {
        self.shm
    }
}

impl<P: PortBus + PortVisibility + PortTestAndSet + ?Sized> Drop for SpinLockGuard<'_, P> {
    fn drop(&mut self) {
        // Everything written inside the critical section must reach the bus
        // before the next owner can get in
        self.shm.publish();
        self.shm.port().clear(self.shm.to_local(self.word));
    }
}

impl<P: PortBus + PortVisibility + PortTestAndSet + ?Sized> fmt::Debug for SpinLockGuard<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("SpinLockGuard").field(&self.word).finish()
    }
}
