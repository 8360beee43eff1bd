//! The interface between the shared-memory object layer and its environment
//!
//! The layer doesn't own anything but the contents of the shared region. The
//! bus access, the local kernel, the notification transport, and the pool
//! allocator are supplied by a *port*, i.e., a type implementing [`Port`].
use core::fmt;

use crate::{
    addr::{GlobalAddr, LocalAddr},
    error::NotifyError,
    klock::KernelLockGuard,
};

/// The maximum number of CPUs sharing one region.
pub const MAX_NUM_CPUS: usize = 16;

/// Identifies a CPU attached to the shared region. The valid range is
/// `0..MAX_NUM_CPUS`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(u8);

impl CpuId {
    /// Construct a `CpuId`. Returns `None` if `x` is out of range.
    #[inline]
    pub const fn new(x: usize) -> Option<Self> {
        if x < MAX_NUM_CPUS {
            Some(Self(x as u8))
        } else {
            None
        }
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An opaque word identifying a task of the local kernel. Only meaningful on
/// the CPU that owns the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalTask(pub u32);

/// Specifies how long [`SmSystem::semaphore_take`] may wait.
///
/// [`SmSystem::semaphore_take`]: crate::SmSystem::semaphore_take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Don't wait at all.
    NoWait,
    /// Wait for the specified number of ticks of the local kernel.
    /// `Ticks(0)` is equivalent to `NoWait`.
    Ticks(u32),
    /// Wait indefinitely.
    Forever,
}

impl Timeout {
    #[inline]
    pub(crate) fn is_no_wait(self) -> bool {
        matches!(self, Self::NoWait | Self::Ticks(0))
    }
}

/// The way [`PortKernel::block_with_timeout`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The task was resumed by [`PortKernel::place_on_ready_queue`].
    Granted,
    /// The timeout elapsed.
    TimedOut,
    /// The wait was cut short by a restart request.
    Restarted,
}

/// Identifies a dedicated shared-memory pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pool {
    /// Semaphore control blocks
    Semaphore,
    /// Shared task proxies
    Proxy,
}

/// Raw access to the shared region through this CPU's mapping.
///
/// Every word handled here is in the canonical representation. The port must
/// not perform any byte swapping.
pub trait PortBus {
    /// The local address where this CPU maps the region.
    fn region_base(&self) -> LocalAddr;

    /// The size of the region in bytes.
    fn region_len(&self) -> u32;

    /// Read a word. `addr` is word-aligned and inside the region.
    ///
    /// The value may be stale unless [`PortVisibility::observe`] was called
    /// after the last time another CPU published a new value.
    fn load(&self, addr: LocalAddr) -> u32;

    /// Write a word. `addr` is word-aligned and inside the region.
    ///
    /// The write may not be visible to other CPUs until
    /// [`PortVisibility::publish`] is called.
    fn store(&self, addr: LocalAddr, raw: u32);
}

/// The two operations used to order accesses to the shared region.
///
/// These are the only ordering mechanism the layer relies on. A port backed by
/// coherent memory may implement them as fences.
pub trait PortVisibility {
    /// Force this CPU's pending writes onto the bus.
    fn publish(&self);

    /// Discard any value cached by this CPU or by the bus bridge so that
    /// subsequent loads observe the values most recently published by other
    /// CPUs.
    fn observe(&self);
}

/// The hardware test-and-set primitive, the only cross-CPU atomic operation.
pub trait PortTestAndSet {
    /// Atomically set the word at `addr` and return `true` if it was clear.
    /// Must bypass this CPU's caches and posted writes.
    fn test_and_set(&self, addr: LocalAddr) -> bool;

    /// Clear the word at `addr`. Must bypass this CPU's caches.
    fn clear(&self, addr: LocalAddr);
}

/// The local kernel of this CPU.
///
/// # Safety
///
/// [`enter_kernel`] and [`leave_kernel`] must implement a mutual exclusion
/// that covers the local kernel's scheduling state, including the effect of
/// [`place_on_ready_queue`] and the tick timeout of
/// [`block_with_timeout`]. [`block_with_timeout`] must release this mutual
/// exclusion while the task is suspended and reacquire it before returning.
///
/// [`enter_kernel`]: Self::enter_kernel
/// [`leave_kernel`]: Self::leave_kernel
/// [`place_on_ready_queue`]: Self::place_on_ready_queue
/// [`block_with_timeout`]: Self::block_with_timeout
pub unsafe trait PortKernel {
    /// The ID of this CPU.
    fn cpu_id(&self) -> CpuId;

    /// Return `true` if the caller is an interrupt handler.
    fn is_interrupt_context(&self) -> bool;

    /// Get the calling task. Returns `None` outside a task context.
    fn current_task(&self) -> Option<LocalTask>;

    /// Get the proxy cached on `task`.
    fn task_proxy(&self, task: LocalTask) -> Option<GlobalAddr>;

    /// Replace the proxy cached on `task`.
    fn set_task_proxy(&self, task: LocalTask, proxy: Option<GlobalAddr>);

    /// Enter the local kernel's mutual exclusion.
    ///
    /// # Safety
    ///
    /// Only meant to be called by [`klock::lock_kernel`].
    ///
    /// [`klock::lock_kernel`]: crate::klock::lock_kernel
    unsafe fn enter_kernel(&self);

    /// Leave the local kernel's mutual exclusion.
    ///
    /// # Safety
    ///
    /// Only meant to be called by [`KernelLockGuard`]'s destructor.
    unsafe fn leave_kernel(&self);

    /// Suspend the calling task until [`place_on_ready_queue`] resumes it, the
    /// timeout elapses, or the task is restarted.
    ///
    /// `timeout` is never [`Timeout::NoWait`].
    ///
    /// [`place_on_ready_queue`]: Self::place_on_ready_queue
    fn block_with_timeout(
        &self,
        lock: &mut KernelLockGuard<'_, Self>,
        timeout: Timeout,
    ) -> BlockOutcome;

    /// Resume `task` with [`BlockOutcome::Granted`] if it's suspended in
    /// [`block_with_timeout`]. Has no effect otherwise.
    ///
    /// [`block_with_timeout`]: Self::block_with_timeout
    fn place_on_ready_queue(&self, lock: &mut KernelLockGuard<'_, Self>, task: LocalTask);
}

/// The inter-CPU notification transport.
pub trait PortTransport {
    /// Ask `cpu` to wake up the owners of a chain of proxies linked by their
    /// `next` fields.
    ///
    /// On success, the remote CPU must eventually call
    /// [`SmSystem::process_notification`] with `chain`.
    ///
    /// [`SmSystem::process_notification`]: crate::SmSystem::process_notification
    fn send_to_cpu(&self, cpu: CpuId, chain: GlobalAddr) -> Result<(), NotifyError>;
}

/// The shared-memory pool allocator.
pub trait PortAlloc {
    /// Allocate `size` bytes from `pool`. The returned block is word-aligned.
    fn allocate(&self, pool: Pool, size: u32) -> Option<GlobalAddr>;

    /// Return a block to `pool`.
    fn free(&self, pool: Pool, block: GlobalAddr);
}

/// Everything the layer needs from a port.
pub trait Port: PortBus + PortVisibility + PortTestAndSet + PortKernel + PortTransport + PortAlloc {}

impl<T: PortBus + PortVisibility + PortTestAndSet + PortKernel + PortTransport + PortAlloc> Port
    for T
{
}
