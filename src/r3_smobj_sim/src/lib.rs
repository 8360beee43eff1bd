#![doc = include_str!("./lib.md")]
use r3_smobj::{
    klock::KernelLockGuard,
    port::{PortAlloc, PortBus, PortKernel, PortTestAndSet, PortTransport, PortVisibility},
    smem::Shm,
    spinlock::DEFAULT_SPIN_TRIES,
    AddrMap, AttachError, BlockOutcome, CpuId, GlobalAddr, LocalAddr, LocalTask, NotifyError,
    Pool, SmConfig, SmSystem, Timeout, MAX_NUM_CPUS,
};
use spin::Mutex as SpinMutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

mod alloc;
mod kernel;
mod memory;
mod transport;

pub use self::memory::{SharedMemory, ViewStats};
use self::{alloc::PoolAllocator, kernel::LocalKernel, memory::CpuView, transport::Mailbox};

bitflags::bitflags! {
    /// Options controlling how faithfully the backplane is simulated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SimOptions: u32 {
        /// Drain posted-write buffers in reverse order, so that the bus sees
        /// a CPU's writes out of program order.
        const REORDER_POSTED_WRITES = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Faults injected into a CPU's port.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Faults: u8 {
        /// [`PortTransport::send_to_cpu`] fails.
        const DROP_NOTIFICATIONS = 1 << 0;
        /// [`PortAlloc::allocate`] fails.
        const FAIL_ALLOCATIONS = 1 << 1;
    }
}

/// The configuration of a simulated [`Machine`].
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    num_cpus: usize,
    region_len: u32,
    num_semaphores: u32,
    num_proxies: u32,
    map_base: usize,
    map_stride: usize,
    options: SimOptions,
    spin_tries: u32,
    tick: Duration,
}

impl SimConfig {
    pub const fn new(num_cpus: usize) -> Self {
        Self {
            num_cpus,
            region_len: 0x1_0000,
            num_semaphores: 64,
            num_proxies: 64,
            map_base: 0x4000_0000,
            map_stride: 0x0100_0000,
            options: SimOptions::empty(),
            spin_tries: DEFAULT_SPIN_TRIES,
            tick: Duration::from_millis(1),
        }
    }

    /// Set the size of the shared region in bytes.
    pub const fn with_region_len(self, region_len: u32) -> Self {
        Self { region_len, ..self }
    }

    /// Set the number of blocks in the semaphore and proxy pools.
    pub const fn with_pools(self, num_semaphores: u32, num_proxies: u32) -> Self {
        Self {
            num_semaphores,
            num_proxies,
            ..self
        }
    }

    /// Map the region at `base + i * stride` on the CPU `i`.
    pub const fn with_mapping(self, base: usize, stride: usize) -> Self {
        Self {
            map_base: base,
            map_stride: stride,
            ..self
        }
    }

    pub const fn with_options(self, options: SimOptions) -> Self {
        Self { options, ..self }
    }

    pub const fn with_spin_tries(self, spin_tries: u32) -> Self {
        Self { spin_tries, ..self }
    }

    /// Set the length of a tick of the local kernels.
    pub const fn with_tick(self, tick: Duration) -> Self {
        Self { tick, ..self }
    }

    pub const fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    fn map_base_of(&self, cpu: usize) -> usize {
        self.map_base + cpu * self.map_stride
    }
}

struct Backplane {
    mem: Arc<SharedMemory>,
    mailboxes: Vec<Mailbox>,
    allocator: PoolAllocator,
}

struct SimCpu {
    id: CpuId,
    map: AddrMap,
    view: CpuView,
    kernel: LocalKernel,
    faults: AtomicU8,
    backplane: Arc<Backplane>,
}

/// The port of one simulated CPU.
#[derive(Clone)]
pub struct SimPort(Arc<SimCpu>);

impl fmt::Debug for SimPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("SimPort").field(&self.0.id).finish()
    }
}

impl SimPort {
    fn shm(&self) -> Shm<'_, CpuView> {
        Shm::new(&self.0.view, self.0.map)
    }

    fn faults(&self) -> Faults {
        Faults::from_bits_truncate(self.0.faults.load(Ordering::Relaxed))
    }
}

impl PortBus for SimPort {
    fn region_base(&self) -> LocalAddr {
        self.0.view.region_base()
    }

    fn region_len(&self) -> u32 {
        self.0.view.region_len()
    }

    fn load(&self, addr: LocalAddr) -> u32 {
        self.0.view.load(addr)
    }

    fn store(&self, addr: LocalAddr, raw: u32) {
        self.0.view.store(addr, raw)
    }
}

impl PortVisibility for SimPort {
    fn publish(&self) {
        self.0.view.publish()
    }

    fn observe(&self) {
        self.0.view.observe()
    }
}

impl PortTestAndSet for SimPort {
    fn test_and_set(&self, addr: LocalAddr) -> bool {
        self.0.view.test_and_set(addr)
    }

    fn clear(&self, addr: LocalAddr) {
        self.0.view.clear(addr)
    }
}

// Safety: `LocalKernel::enter` and `LocalKernel::leave` implement a mutual
//         exclusion covering the task records, and `LocalKernel::block`
//         releases it while the task is parked
unsafe impl PortKernel for SimPort {
    fn cpu_id(&self) -> CpuId {
        self.0.id
    }

    fn is_interrupt_context(&self) -> bool {
        self.0.kernel.is_interrupt_context()
    }

    fn current_task(&self) -> Option<LocalTask> {
        self.0.kernel.current_task()
    }

    fn task_proxy(&self, task: LocalTask) -> Option<GlobalAddr> {
        self.0.kernel.task_proxy(task)
    }

    fn set_task_proxy(&self, task: LocalTask, proxy: Option<GlobalAddr>) {
        self.0.kernel.set_task_proxy(task, proxy)
    }

    unsafe fn enter_kernel(&self) {
        self.0.kernel.enter()
    }

    unsafe fn leave_kernel(&self) {
        self.0.kernel.leave()
    }

    fn block_with_timeout(
        &self,
        _lock: &mut KernelLockGuard<'_, Self>,
        timeout: Timeout,
    ) -> BlockOutcome {
        self.0.kernel.block(timeout)
    }

    fn place_on_ready_queue(
        &self,
        _lock: &mut KernelLockGuard<'_, Self>,
        task: LocalTask,
    ) {
        self.0.kernel.wake(task)
    }
}

impl PortTransport for SimPort {
    fn send_to_cpu(&self, cpu: CpuId, chain: GlobalAddr) -> Result<(), NotifyError> {
        log::trace!("{}: send_to_cpu({}, {:?})", self.0.id, cpu, chain);
        if self.faults().contains(Faults::DROP_NOTIFICATIONS) {
            return Err(NotifyError::NotifyFailed);
        }
        match self.0.backplane.mailboxes.get(cpu.get()) {
            Some(mailbox) => mailbox.post(chain),
            None => Err(NotifyError::NotifyFailed),
        }
    }
}

impl PortAlloc for SimPort {
    fn allocate(&self, pool: Pool, size: u32) -> Option<GlobalAddr> {
        if self.faults().contains(Faults::FAIL_ALLOCATIONS) {
            return None;
        }
        self.0.backplane.allocator.allocate(self.shm(), pool, size)
    }

    fn free(&self, pool: Pool, block: GlobalAddr) {
        self.0.backplane.allocator.free(self.shm(), pool, block)
    }
}

/// A simulated multi-CPU machine sharing one memory region.
///
/// The notification handlers keep running until [`Self::shutdown`] is called
/// or the `Machine` is dropped.
pub struct Machine {
    cfg: SimConfig,
    backplane: Arc<Backplane>,
    systems: Vec<Arc<SmSystem<SimPort>>>,
    handlers: SpinMutex<Vec<JoinHandle<()>>>,
}

impl Machine {
    /// Power on the machine. The CPU 0 formats the region, and the others
    /// attach to it.
    pub fn new(cfg: SimConfig) -> Result<Self, AttachError> {
        if cfg.num_cpus == 0
            || cfg.num_cpus > MAX_NUM_CPUS
            || cfg.region_len < alloc::required_len(cfg.num_semaphores, cfg.num_proxies)
            || cfg.region_len as usize > cfg.map_stride
        {
            return Err(AttachError::BadParam);
        }

        let mem = Arc::new(SharedMemory::new(cfg.region_len));
        let ids: Vec<CpuId> = (0..cfg.num_cpus).filter_map(CpuId::new).collect();
        let backplane = Arc::new(Backplane {
            mem: Arc::clone(&mem),
            mailboxes: ids.iter().map(|&id| Mailbox::new(id)).collect(),
            allocator: PoolAllocator::new(cfg.spin_tries),
        });

        let ports: Vec<SimPort> = ids
            .iter()
            .map(|&id| {
                let base = cfg.map_base_of(id.get());
                SimPort(Arc::new(SimCpu {
                    id,
                    map: AddrMap::new(LocalAddr(base), cfg.region_len),
                    view: CpuView::new(id, Arc::clone(&mem), base, cfg.options),
                    kernel: LocalKernel::new(id, cfg.tick),
                    faults: AtomicU8::new(0),
                    backplane: Arc::clone(&backplane),
                }))
            })
            .collect();

        backplane
            .allocator
            .format(ports[0].shm(), [cfg.num_semaphores, cfg.num_proxies]);

        let sm_cfg = SmConfig::new(cfg.num_cpus).with_spin_tries(cfg.spin_tries);
        let mut systems = Vec::with_capacity(cfg.num_cpus);
        for port in ports {
            let system = if systems.is_empty() {
                SmSystem::init_region(port, sm_cfg)?
            } else {
                SmSystem::attach(port, sm_cfg)?
            };
            systems.push(Arc::new(system));
        }

        let handlers = systems
            .iter()
            .zip(&backplane.mailboxes)
            .map(|(system, mailbox)| mailbox.start(Arc::clone(system)))
            .collect();

        log::debug!("powered on {:?}", cfg);

        Ok(Self {
            cfg,
            backplane,
            systems,
            handlers: SpinMutex::new(handlers),
        })
    }

    pub fn cfg(&self) -> &SimConfig {
        &self.cfg
    }

    pub fn num_cpus(&self) -> usize {
        self.systems.len()
    }

    /// Get the shared-memory layer as seen by `cpu`.
    pub fn system(&self, cpu: usize) -> &Arc<SmSystem<SimPort>> {
        &self.systems[cpu]
    }

    /// Get the backing store of the shared region.
    pub fn memory(&self) -> &SharedMemory {
        &self.backplane.mem
    }

    /// Start a task on `cpu`. The task's proxy is released when `f` returns.
    pub fn spawn<F, R>(&self, cpu: usize, f: F) -> TaskHandle<R>
    where
        F: FnOnce(&TaskCtx) -> R + Send + 'static,
        R: Send + 'static,
    {
        let system = Arc::clone(&self.systems[cpu]);
        let id = system.cpu_id();
        let task = system.port().0.kernel.create_task();

        let join_handle = thread::Builder::new()
            .name(format!("{id}-task{}", task.0))
            .spawn(move || {
                let kernel = &system.port().0.kernel;
                kernel.start_task(task);

                let ctx = TaskCtx {
                    system: Arc::clone(&system),
                    task,
                };
                let result = f(&ctx);

                system.release_task_proxy(task);
                kernel.exit_task(task);
                result
            })
            .unwrap();

        TaskHandle {
            cpu: id,
            task,
            join_handle,
        }
    }

    /// Interrupt the current or the next wait of `task` on `cpu`.
    pub fn restart_task(&self, cpu: usize, task: LocalTask) {
        log::trace!("restart_task({}, {:?})", cpu, task);
        self.systems[cpu].port().0.kernel.restart(task);
    }

    /// Replace the faults injected into `cpu`'s port.
    pub fn set_faults(&self, cpu: usize, faults: Faults) {
        self.systems[cpu]
            .port()
            .0
            .faults
            .store(faults.bits(), Ordering::Relaxed);
    }

    pub fn view_stats(&self, cpu: usize) -> ViewStats {
        self.systems[cpu].port().0.view.stats()
    }

    /// Get the number of free blocks in `pool`. Returns `None` if the pool's
    /// lock could not be acquired.
    pub fn pool_free_blocks(&self, pool: Pool) -> Option<u32> {
        let port = self.systems[0].port();
        self.backplane.allocator.num_free(port.shm(), pool)
    }

    /// Get the number of tasks on `cpu` that haven't exited yet.
    pub fn num_live_tasks(&self, cpu: usize) -> usize {
        self.systems[cpu].port().0.kernel.num_tasks()
    }

    /// Stop the notification handlers after they have processed every
    /// request already sent. Further notifications fail with `NotifyFailed`.
    pub fn shutdown(&self) {
        for mailbox in &self.backplane.mailboxes {
            mailbox.close();
        }

        let handlers = std::mem::take(&mut *self.handlers.lock());
        for handler in handlers {
            // Propagate any panic that occured in a handler
            if let Err(e) = handler.join() {
                if !thread::panicking() {
                    std::panic::resume_unwind(e);
                }
            }
        }
        log::trace!("shut down");
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The environment of a task started by [`Machine::spawn`].
pub struct TaskCtx {
    system: Arc<SmSystem<SimPort>>,
    task: LocalTask,
}

impl TaskCtx {
    pub fn system(&self) -> &SmSystem<SimPort> {
        &self.system
    }

    pub fn task(&self) -> LocalTask {
        self.task
    }

    pub fn cpu_id(&self) -> CpuId {
        self.system.cpu_id()
    }
}

/// Owned permission to join a task started by [`Machine::spawn`].
pub struct TaskHandle<R> {
    cpu: CpuId,
    task: LocalTask,
    join_handle: JoinHandle<R>,
}

impl<R> TaskHandle<R> {
    pub fn cpu_id(&self) -> CpuId {
        self.cpu
    }

    pub fn task(&self) -> LocalTask {
        self.task
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Wait for the task to exit and get its result. Panics if the task
    /// panicked.
    pub fn join(self) -> R {
        match self.join_handle.join() {
            Ok(x) => x,
            Err(e) => std::panic::resume_unwind(e),
        }
    }
}
