//! Shared semaphores
//!
//! A semaphore's control block lives in the shared region, so tasks on any
//! attached CPU can use it through the same [`SmSemId`]. Waiters are
//! represented by their [proxies](crate::proxy) on the semaphore's pend list
//! and are granted strictly in FIFO order.
//!
//! Every decision about a waiter is made either under the semaphore's spin
//! lock (the proxy is detached by exactly one of give, flush, or the waiter
//! itself) or under the owning CPU's kernel lock (the wake-up is either
//! delivered to the task or the task has abandoned the proxy). The two locks
//! are never held at the same time.
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    addr::GlobalAddr,
    error::{
        BadParamError, CreateSemaphoreError, DeleteSemaphoreError, FlushSemaphoreError,
        GetSemaphoreError, GiveSemaphoreError, InitSemaphoreError, LockTimeoutError,
        NoAccessError, NoMemoryError, NotifyError, TakeSemaphoreError,
    },
    klock,
    list::{SharedList, NODE_NEXT},
    port::{BlockOutcome, CpuId, LocalTask, Pool, Port, Timeout, MAX_NUM_CPUS},
    proxy::{Orphan, PROXY_DELIVERED, PROXY_EPOCH, PROXY_GRANTED, PROXY_SEM, PROXY_TASK},
    region::HEADER_SIZE,
    spinlock::{SpinLock, SpinLockGuard},
    state, SmSystem,
};

/// Holds the semaphore's own address while the control block is valid.
const SEM_TAG: u32 = 0;
const SEM_KIND: u32 = 4;
const SEM_LOCK: u32 = 8;
const SEM_PEND: u32 = 12;
/// `0` or `1` for a binary semaphore, the count for a counting semaphore
const SEM_STATE: u32 = 20;
/// Incremented by every flush that detaches a non-empty pend list
const SEM_EPOCH: u32 = 24;

/// The size of a shared semaphore control block.
pub const SEMAPHORE_SIZE: u32 = 28;

/// The type of a shared semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemaphoreKind {
    /// The state is either available or unavailable. Giving an available
    /// binary semaphore has no effect.
    Binary,
    /// The state is a count of available units.
    Counting,
}

impl SemaphoreKind {
    // Zero-filled memory never holds a valid kind
    const fn to_word(self) -> u32 {
        match self {
            Self::Binary => 1,
            Self::Counting => 2,
        }
    }

    const fn from_word(x: u32) -> Option<Self> {
        match x {
            1 => Some(Self::Binary),
            2 => Some(Self::Counting),
            _ => None,
        }
    }
}

/// Identifies a shared semaphore. The same handle is valid on every CPU
/// attached to the region.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmSemId(GlobalAddr);

impl SmSemId {
    #[inline]
    pub const fn new(addr: GlobalAddr) -> Self {
        Self(addr)
    }

    /// Construct an `SmSemId` from the value returned by [`Self::as_raw`].
    #[inline]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match GlobalAddr::new(raw) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Get a word suitable for passing the handle to another CPU.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0.get()
    }

    /// Get the address of the control block.
    #[inline]
    pub const fn addr(self) -> GlobalAddr {
        self.0
    }
}

impl fmt::Debug for SmSemId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("SmSemId").field(&self.0).finish()
    }
}

/// A task waiting on a shared semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub cpu: CpuId,
    pub task: LocalTask,
}

/// A snapshot of a shared semaphore's state returned by
/// [`SmSystem::semaphore_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreInfo<const N: usize> {
    pub kind: SemaphoreKind,
    /// `0` or `1` for a binary semaphore, the count for a counting semaphore
    pub value: u32,
    /// The number of waiting tasks, which may exceed `waiters.len()`
    pub num_waiters: usize,
    /// The first `N` waiting tasks in the order they will be granted
    pub waiters: ArrayVec<Waiter, N>,
}

/// A validated semaphore control block.
#[derive(Debug, Clone, Copy)]
struct SemaphoreCb {
    addr: GlobalAddr,
    kind: SemaphoreKind,
}

impl SemaphoreCb {
    #[inline]
    fn lock(&self) -> SpinLock {
        SpinLock::new(self.addr.field(SEM_LOCK))
    }

    #[inline]
    fn pend_list(&self) -> SharedList {
        SharedList::new(self.addr.field(SEM_PEND))
    }

    #[inline]
    fn state(&self) -> GlobalAddr {
        self.addr.field(SEM_STATE)
    }

    #[inline]
    fn epoch(&self) -> GlobalAddr {
        self.addr.field(SEM_EPOCH)
    }
}

fn check_initial(kind: SemaphoreKind, initial: u32) -> Result<(), BadParamError> {
    match kind {
        SemaphoreKind::Binary if initial > 1 => Err(BadParamError::BadParam),
        _ => Ok(()),
    }
}

impl<P: Port> SmSystem<P> {
    fn semaphore_cb(&self, id: SmSemId) -> Result<SemaphoreCb, NoAccessError> {
        let addr = id.addr();
        if addr.get() < HEADER_SIZE || !self.map.contains_object(addr, SEMAPHORE_SIZE) {
            return Err(NoAccessError::NoAccess);
        }

        let shm = self.shm();
        shm.observe();
        if shm.load(addr.field(SEM_TAG)) != addr.get() {
            return Err(NoAccessError::NoAccess);
        }
        let kind =
            SemaphoreKind::from_word(shm.load(addr.field(SEM_KIND))).ok_or(NoAccessError::NoAccess)?;

        Ok(SemaphoreCb { addr, kind })
    }

    #[inline]
    fn lock_semaphore(&self, cb: &SemaphoreCb) -> Result<SpinLockGuard<'_, P>, LockTimeoutError> {
        cb.lock().lock(self.shm(), self.cfg.spin_tries())
    }

    /// Write a fresh control block at `addr`, which must be a valid location
    /// for one.
    fn init_semaphore_unchecked(&self, addr: GlobalAddr, kind: SemaphoreKind, initial: u32) -> SmSemId {
        let shm = self.shm();
        let cb = SemaphoreCb { addr, kind };
        // Invalidate any stale control block before touching the body
        shm.store(addr.field(SEM_TAG), 0);
        shm.store(addr.field(SEM_KIND), kind.to_word());
        cb.lock().init(shm);
        cb.pend_list().init(shm);
        shm.store(cb.state(), initial);
        shm.store(cb.epoch(), 0);
        shm.publish();

        shm.store(addr.field(SEM_TAG), addr.get());
        shm.publish();
        SmSemId(addr)
    }

    /// Allocate a shared semaphore from the semaphore pool.
    pub fn semaphore_create(
        &self,
        kind: SemaphoreKind,
        initial: u32,
    ) -> Result<SmSemId, CreateSemaphoreError> {
        log::trace!("{}: semaphore_create({:?}, {})", self.cpu_id(), kind, initial);
        state::expect_non_interrupt_context(&self.port)?;
        check_initial(kind, initial)?;

        let Some(addr) = self.port.allocate(Pool::Semaphore, SEMAPHORE_SIZE) else {
            log::error!("{}: failed to allocate a shared semaphore", self.cpu_id());
            return Err(NoMemoryError::NoMemory.into());
        };
        if !self.map.contains_object(addr, SEMAPHORE_SIZE) || addr.get() < HEADER_SIZE {
            log::error!("{}: the allocator returned a bad block {:?}", self.cpu_id(), addr);
            return Err(NoMemoryError::NoMemory.into());
        }

        Ok(self.init_semaphore_unchecked(addr, kind, initial))
    }

    /// Construct a shared semaphore in caller-supplied storage of at least
    /// [`SEMAPHORE_SIZE`] bytes.
    pub fn semaphore_init(
        &self,
        storage: GlobalAddr,
        kind: SemaphoreKind,
        initial: u32,
    ) -> Result<SmSemId, InitSemaphoreError> {
        log::trace!(
            "{}: semaphore_init({:?}, {:?}, {})",
            self.cpu_id(),
            storage,
            kind,
            initial
        );
        check_initial(kind, initial)?;
        if storage.get() < HEADER_SIZE || !self.map.contains_object(storage, SEMAPHORE_SIZE) {
            return Err(InitSemaphoreError::BadParam);
        }

        Ok(self.init_semaphore_unchecked(storage, kind, initial))
    }

    /// Shared semaphores can't be deleted. Always returns `NotSupported`.
    pub fn semaphore_delete(&self, id: SmSemId) -> Result<(), DeleteSemaphoreError> {
        log::trace!("{}: semaphore_delete({:?})", self.cpu_id(), id);
        Err(DeleteSemaphoreError::NotSupported)
    }

    /// Release one unit. If a task is waiting, the first waiter is granted the
    /// unit and woken up instead.
    ///
    /// Everything this CPU wrote before calling this method is published and
    /// will be observed by the task taking the unit.
    pub fn semaphore_give(&self, id: SmSemId) -> Result<(), GiveSemaphoreError> {
        log::trace!("{}: semaphore_give({:?})", self.cpu_id(), id);
        state::expect_non_interrupt_context(&self.port)?;

        self.shm().publish();
        let cb = self.semaphore_cb(id)?;
        self.give_core(&cb)
    }

    /// Give back a unit that a give granted to a task which had already
    /// abandoned its wait. May be called from an interrupt context.
    pub(crate) fn regive(&self, id: SmSemId) {
        log::debug!(
            "{}: passing on a unit of {:?} declined by its waiter",
            self.cpu_id(),
            id
        );
        let result = match self.semaphore_cb(id) {
            Ok(cb) => self.give_core(&cb),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            log::error!(
                "{}: failed to pass on a unit of {:?}: {:?}",
                self.cpu_id(),
                id,
                e
            );
        }
    }

    fn give_core(&self, cb: &SemaphoreCb) -> Result<(), GiveSemaphoreError> {
        let shm = self.shm();
        let lock = self.lock_semaphore(cb)?;
        let Some(proxy) = cb.pend_list().pop_front(shm) else {
            let state = shm.load(cb.state());
            let new_state = match cb.kind {
                SemaphoreKind::Binary => 1,
                SemaphoreKind::Counting => state
                    .checked_add(1)
                    .ok_or(GiveSemaphoreError::QueueOverflow)?,
            };
            shm.store(cb.state(), new_state);
            return Ok(());
        };

        shm.store_bool(proxy.field(PROXY_GRANTED), true);
        drop(lock);

        // The proxy is ours now. Terminate the chain we're about to send.
        shm.store_link(proxy.field(NODE_NEXT), None);
        shm.publish();

        let Some(owner) = self.proxy_owner(proxy) else {
            log::error!("{}: {:?} has a corrupt owner", self.cpu_id(), proxy);
            return Err(GiveSemaphoreError::NotifyFailed);
        };
        self.notify(owner, proxy)?;
        Ok(())
    }

    /// Acquire one unit, waiting up to `timeout` if none is available.
    pub fn semaphore_take(&self, id: SmSemId, timeout: Timeout) -> Result<(), TakeSemaphoreError> {
        log::trace!("{}: semaphore_take({:?}, {:?})", self.cpu_id(), id, timeout);
        let task = state::expect_task_context(&self.port)?;
        let cb = self.semaphore_cb(id)?;
        let proxy = self.proxy_for(task)?;
        let shm = self.shm();

        {
            let lock = self.lock_semaphore(&cb)?;
            if poll_core(&lock, &cb) {
                return Ok(());
            }

            if timeout.is_no_wait() {
                return Err(TakeSemaphoreError::Unavailable);
            }

            // The current state does not satisfy the wait condition. Enqueue
            // the proxy. The waker is responsible for detaching it.
            shm.store_bool(proxy.field(PROXY_GRANTED), false);
            shm.store_bool(proxy.field(PROXY_DELIVERED), false);
            shm.store(proxy.field(PROXY_EPOCH), shm.load(cb.epoch()));
            shm.store(proxy.field(PROXY_SEM), cb.addr.get());
            cb.pend_list().append(shm, proxy);
        }

        let outcome = {
            let mut lock = klock::lock_kernel(&self.port);
            // The wake-up might have been delivered before we got here
            if shm.load_bool(proxy.field(PROXY_DELIVERED)) {
                BlockOutcome::Granted
            } else {
                self.port.block_with_timeout(&mut lock, timeout)
            }
        };

        match outcome {
            BlockOutcome::Granted => {
                shm.observe();
                Ok(())
            }
            BlockOutcome::TimedOut => self.take_timed_out(&cb, task, proxy),
            BlockOutcome::Restarted => {
                self.take_interrupted(&cb, task, proxy);
                Err(TakeSemaphoreError::Interrupted)
            }
        }
    }

    /// Resolve the race between a timeout and a grant. Exactly one of them
    /// wins under the semaphore's lock.
    fn take_timed_out(
        &self,
        cb: &SemaphoreCb,
        task: LocalTask,
        proxy: GlobalAddr,
    ) -> Result<(), TakeSemaphoreError> {
        let shm = self.shm();

        let lock = match self.lock_semaphore(cb) {
            Ok(lock) => lock,
            Err(e) => {
                // We can't tell if the proxy is still queued. Abandon it. If a
                // give reaches it later, the unit goes back to the semaphore.
                if self.settle_detached_proxy(proxy, Orphan::Declined) {
                    // It was granted and delivered after all
                    shm.observe();
                    return Ok(());
                }
                self.port.set_task_proxy(task, None);
                return Err(e.into());
            }
        };

        if !is_detached(&lock, cb, proxy) {
            cb.pend_list().remove(shm, proxy);
            return Err(TakeSemaphoreError::Timeout);
        }
        drop(lock);

        // The grant won. The wake-up is in flight or has just been delivered.
        if !self.settle_detached_proxy(proxy, Orphan::Consumed) {
            self.port.set_task_proxy(task, None);
        }
        shm.observe();
        Ok(())
    }

    /// Withdraw from the wait after a restart request.
    fn take_interrupted(&self, cb: &SemaphoreCb, task: LocalTask, proxy: GlobalAddr) {
        let shm = self.shm();
        self.port.set_task_proxy(task, None);

        if let Ok(lock) = self.lock_semaphore(cb) {
            if !is_detached(&lock, cb, proxy) {
                cb.pend_list().remove(shm, proxy);
                drop(lock);
                self.port.free(Pool::Proxy, proxy);
                return;
            }
        }

        // Detached by a waker, or we couldn't find out. If the wake-up is still
        // in flight, its delivery frees the proxy and passes on any unit
        // granted to us.
        if self.settle_detached_proxy(proxy, Orphan::Declined) {
            shm.observe();
            let granted = shm.load_bool(proxy.field(PROXY_GRANTED));
            self.port.free(Pool::Proxy, proxy);
            if granted {
                self.regive(SmSemId(cb.addr));
            }
        }
    }

    /// Wake up every waiting task without changing the semaphore's state.
    ///
    /// The woken tasks' takes succeed. One notification is sent per CPU that
    /// has waiters.
    pub fn semaphore_flush(&self, id: SmSemId) -> Result<(), FlushSemaphoreError> {
        log::trace!("{}: semaphore_flush({:?})", self.cpu_id(), id);
        state::expect_non_interrupt_context(&self.port)?;

        let shm = self.shm();
        shm.publish();
        let cb = self.semaphore_cb(id)?;

        let chain = {
            let _lock = self.lock_semaphore(&cb)?;
            let chain = cb.pend_list().take_all(shm);
            if chain.is_some() {
                shm.store(cb.epoch(), shm.load(cb.epoch()).wrapping_add(1));
            }
            chain
        };

        // Sort the detached proxies into one chain per owning CPU, preserving
        // the FIFO order
        let mut buckets: [Option<(GlobalAddr, GlobalAddr)>; MAX_NUM_CPUS] = [None; MAX_NUM_CPUS];
        let mut cursor = chain;
        while let Some(proxy) = cursor {
            cursor = shm.load_link(proxy.field(NODE_NEXT));
            shm.store_link(proxy.field(NODE_NEXT), None);

            let Some(owner) = self.proxy_owner(proxy) else {
                log::error!("{}: {:?} has a corrupt owner", self.cpu_id(), proxy);
                continue;
            };
            let bucket = &mut buckets[owner.get()];
            *bucket = match *bucket {
                Some((head, tail)) => {
                    shm.store_link(tail.field(NODE_NEXT), Some(proxy));
                    Some((head, proxy))
                }
                None => Some((proxy, proxy)),
            };
        }
        shm.publish();

        let mut result = Ok(());
        let mut local_chain = None;
        for (owner, bucket) in (0..MAX_NUM_CPUS).filter_map(CpuId::new).zip(buckets) {
            let Some((head, _)) = bucket else { continue };
            if owner == self.cpu_id() {
                local_chain = Some(head);
            } else if let Err(e) = self.notify(owner, head) {
                result = Err(e.into());
            }
        }

        if let Some(head) = local_chain {
            self.process_notification(head);
        }

        result
    }

    /// Get a snapshot of a shared semaphore's state.
    pub fn semaphore_info<const N: usize>(
        &self,
        id: SmSemId,
    ) -> Result<SemaphoreInfo<N>, GetSemaphoreError> {
        let cb = self.semaphore_cb(id)?;
        let shm = self.shm();
        let lock = self.lock_semaphore(&cb)?;

        let mut info = SemaphoreInfo {
            kind: cb.kind,
            value: shm.load(cb.state()),
            num_waiters: 0,
            waiters: ArrayVec::new(),
        };
        cb.pend_list().for_each(shm, |proxy| {
            info.num_waiters += 1;
            if info.waiters.is_full() {
                return true;
            }
            if let Some(cpu) = self.proxy_owner(proxy) {
                info.waiters.push(Waiter {
                    cpu,
                    task: LocalTask(shm.load(proxy.field(PROXY_TASK))),
                });
            }
            true
        });
        drop(lock);

        Ok(info)
    }

    /// Hand a chain of detached proxies owned by `owner` to `owner`.
    fn notify(&self, owner: CpuId, chain: GlobalAddr) -> Result<(), NotifyError> {
        if owner == self.cpu_id() {
            self.process_notification(chain);
            return Ok(());
        }

        self.port.send_to_cpu(owner, chain).map_err(|e| {
            log::error!(
                "{}: failed to notify {} of the wake-up of {:?}",
                self.cpu_id(),
                owner,
                chain
            );
            e
        })
    }
}

/// Check if the current state of a semaphore satisfies the wait condition.
///
/// If it does, this function consumes one unit and returns `true`. Otherwise,
/// it returns `false`.
#[inline]
fn poll_core<P: Port>(lock: &SpinLockGuard<'_, P>, cb: &SemaphoreCb) -> bool {
    let shm = lock.shm();
    let value = shm.load(cb.state());
    if value > 0 {
        shm.store(cb.state(), value - 1);
        true
    } else {
        false
    }
}

/// Check if `proxy` has been detached from `cb`'s pend list by a give or a
/// flush.
#[inline]
fn is_detached<P: Port>(lock: &SpinLockGuard<'_, P>, cb: &SemaphoreCb, proxy: GlobalAddr) -> bool {
    let shm = lock.shm();
    shm.load_bool(proxy.field(PROXY_GRANTED))
        || shm.load(proxy.field(PROXY_EPOCH)) != shm.load(cb.epoch())
}
