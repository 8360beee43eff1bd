//! Shared task proxies
//!
//! A task can't be placed on a shared wait queue directly because it lives in
//! its CPU's private memory. Instead, it's represented by a *proxy* allocated
//! from the shared pool, which records the owning CPU and the task.
//!
//! A proxy is created on the first blocking take and is cached on the task for
//! reuse. Once a waker has detached the proxy from a wait queue, the proxy is
//! owned by the wake-up in flight until the owning CPU has processed it. If the
//! task gives up on the wait in that window, it marks the proxy as *orphaned*
//! and forgets it, and the owning CPU's notification processing frees it when
//! the wake-up arrives. If the task returned without the unit a give granted
//! to it, the notification processing gives the unit to the semaphore again.
use crate::{
    addr::GlobalAddr,
    error::NoMemoryError,
    klock,
    list::{NODE_NEXT, NODE_PREV},
    port::{CpuId, LocalTask, Pool, Port},
    semaphore::SmSemId,
    SmSystem,
};

pub(crate) const PROXY_CPU: u32 = 8;
pub(crate) const PROXY_TASK: u32 = 12;
/// Set by the waker under the semaphore's lock when it detaches the proxy.
pub(crate) const PROXY_GRANTED: u32 = 16;
/// The semaphore's flush epoch when the proxy was enqueued.
pub(crate) const PROXY_EPOCH: u32 = 20;
/// Set by the owning CPU in the kernel lock when the wake-up has been handed
/// to the scheduler.
pub(crate) const PROXY_DELIVERED: u32 = 24;
/// Set by the owning CPU in the kernel lock when the task stops caring about
/// the proxy. Holds an [`Orphan`].
pub(crate) const PROXY_ORPHANED: u32 = 28;
/// The semaphore the proxy was last enqueued on
pub(crate) const PROXY_SEM: u32 = 32;

/// The size of a shared task proxy.
pub const PROXY_SIZE: u32 = 36;

/// How an abandoned proxy's wake-up is disposed of when it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Orphan {
    /// The task has already returned with the unit.
    Consumed = 1,
    /// The task returned without the unit. A unit granted by a give goes back
    /// to the semaphore.
    Declined = 2,
}

impl<P: Port> SmSystem<P> {
    /// Get the proxy of `task`, allocating one if it doesn't have one yet.
    pub(crate) fn proxy_for(&self, task: LocalTask) -> Result<GlobalAddr, NoMemoryError> {
        if let Some(proxy) = self.port.task_proxy(task) {
            return Ok(proxy);
        }

        let Some(proxy) = self.port.allocate(Pool::Proxy, PROXY_SIZE) else {
            log::error!(
                "{}: failed to allocate a shared proxy for {:?}",
                self.cpu_id(),
                task
            );
            return Err(NoMemoryError::NoMemory);
        };
        debug_assert!(self.map.contains_object(proxy, PROXY_SIZE));

        let shm = self.shm();
        shm.store_link(proxy.field(NODE_NEXT), None);
        shm.store_link(proxy.field(NODE_PREV), None);
        shm.store(proxy.field(PROXY_CPU), self.cpu_id().get() as u32);
        shm.store(proxy.field(PROXY_TASK), task.0);
        shm.store_bool(proxy.field(PROXY_GRANTED), false);
        shm.store(proxy.field(PROXY_EPOCH), 0);
        shm.store_bool(proxy.field(PROXY_DELIVERED), false);
        shm.store(proxy.field(PROXY_ORPHANED), 0);
        shm.store(proxy.field(PROXY_SEM), 0);
        shm.publish();

        self.port.set_task_proxy(task, Some(proxy));
        Ok(proxy)
    }

    /// Wake up the owners of a chain of proxies linked by their `next` fields.
    /// Every proxy in the chain must belong to this CPU.
    ///
    /// The port's notification handler calls this when a chain sent by
    /// [`PortTransport::send_to_cpu`] arrives. It may be called from an
    /// interrupt context.
    ///
    /// [`PortTransport::send_to_cpu`]: crate::port::PortTransport::send_to_cpu
    pub fn process_notification(&self, chain: GlobalAddr) {
        let shm = self.shm();
        let cpu = self.cpu_id();
        log::trace!("{}: process_notification({:?})", cpu, chain);

        shm.observe();

        let mut orphans = None;
        {
            let mut lock = klock::lock_kernel(&self.port);
            let mut cursor = Some(chain);
            while let Some(proxy) = cursor {
                // Read the successor first; the proxy may be reused as soon as
                // its task runs
                cursor = shm.load_link(proxy.field(NODE_NEXT));

                let owner = shm.load(proxy.field(PROXY_CPU));
                if owner as usize != cpu.get() {
                    log::error!(
                        "{}: ignoring {:?}, which belongs to CPU {}",
                        cpu,
                        proxy,
                        owner
                    );
                    continue;
                }

                if shm.load(proxy.field(PROXY_ORPHANED)) != 0 {
                    shm.store_link(proxy.field(NODE_NEXT), orphans);
                    orphans = Some(proxy);
                    continue;
                }

                let task = LocalTask(shm.load(proxy.field(PROXY_TASK)));
                shm.store_bool(proxy.field(PROXY_DELIVERED), true);
                self.port.place_on_ready_queue(&mut lock, task);
            }
            shm.publish();
        }

        // Free the orphaned proxies outside the kernel lock
        while let Some(proxy) = orphans {
            orphans = shm.load_link(proxy.field(NODE_NEXT));
            let declined_unit = self.declined_unit(proxy);
            log::debug!("{}: freeing the orphaned proxy {:?}", cpu, proxy);
            self.port.free(Pool::Proxy, proxy);
            if let Some(id) = declined_unit {
                self.regive(id);
            }
        }
    }

    /// Find out whether the wake-up of a detached proxy has been delivered. If
    /// it hasn't, mark the proxy as orphaned so that the delivery disposes of
    /// it as specified by `orphan` instead.
    ///
    /// Returns `true` if the wake-up has been delivered, in which case the
    /// proxy is idle and the caller still owns it.
    pub(crate) fn settle_detached_proxy(&self, proxy: GlobalAddr, orphan: Orphan) -> bool {
        let shm = self.shm();
        let _lock = klock::lock_kernel(&self.port);
        if shm.load_bool(proxy.field(PROXY_DELIVERED)) {
            true
        } else {
            shm.store(proxy.field(PROXY_ORPHANED), orphan as u32);
            shm.publish();
            log::debug!(
                "{}: orphaning {:?} ({:?}) while its wake-up is in flight",
                self.cpu_id(),
                proxy,
                orphan
            );
            false
        }
    }

    /// Get the semaphore that a give detaching `proxy` took a unit from, if
    /// the proxy's task declined the unit.
    fn declined_unit(&self, proxy: GlobalAddr) -> Option<SmSemId> {
        let shm = self.shm();
        if shm.load(proxy.field(PROXY_ORPHANED)) == Orphan::Declined as u32
            && shm.load_bool(proxy.field(PROXY_GRANTED))
        {
            SmSemId::from_raw(shm.load(proxy.field(PROXY_SEM)))
        } else {
            None
        }
    }

    /// Get the CPU that owns `proxy`.
    pub(crate) fn proxy_owner(&self, proxy: GlobalAddr) -> Option<CpuId> {
        CpuId::new(self.shm().load(proxy.field(PROXY_CPU)) as usize)
    }

    /// Free the proxy cached on `task`, if any. The port calls this when a
    /// task exits.
    ///
    /// The task must not be waiting on a shared object.
    pub fn release_task_proxy(&self, task: LocalTask) {
        if let Some(proxy) = self.port.task_proxy(task) {
            self.port.set_task_proxy(task, None);
            self.port.free(Pool::Proxy, proxy);
        }
    }
}
