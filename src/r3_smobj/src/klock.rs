//! Local kernel locking mechanism
//!
//! The local kernel's mutual exclusion protects the local scheduling state
//! (ready queue, tick queue). It's strictly local and is never used to protect
//! anything in the shared region. It's entered only while no shared-memory
//! spin lock is held by the current CPU, which rules out a lock-ordering cycle
//! between the two mechanisms.
use core::fmt;

use crate::port::PortKernel;

/// Enter the local kernel's mutual exclusion and get an RAII guard.
pub fn lock_kernel<P: PortKernel + ?Sized>(port: &P) -> KernelLockGuard<'_, P> {
    // Safety: We are the only caller of `enter_kernel`, and the returned guard
    //         is responsible for leaving the mutual exclusion
    unsafe { port.enter_kernel() };
    KernelLockGuard { port }
}

/// RAII guard for the local kernel's mutual exclusion.
///
/// Port methods that require the mutual exclusion take `&mut KernelLockGuard`
/// to prove that the caller is inside it.
pub struct KernelLockGuard<'a, P: PortKernel + ?Sized> {
    port: &'a P,
}

impl<P: PortKernel + ?Sized> KernelLockGuard<'_, P> {
    /// Get the port this guard belongs to.
    #[inline]
    pub fn port(&self) -> &P {
        self.port
    }
}

impl<P: PortKernel + ?Sized> Drop for KernelLockGuard<'_, P> {
    fn drop(&mut self) {
        // Safety: The mutual exclusion is currently active, and it's us who
        //         are controlling it
        unsafe { self.port.leave_kernel() };
    }
}

impl<P: PortKernel + ?Sized> fmt::Debug for KernelLockGuard<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KernelLockGuard")
            .field("cpu", &self.port.cpu_id())
            .finish()
    }
}
