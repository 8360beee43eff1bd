//! A deterministic, single-threaded port for unit tests
//!
//! Every CPU shares one word array but maps it at a different local address.
//! The fake kernel never switches threads: a task that blocks runs the next
//! closure queued by [`FakeMachine::push_block`] and uses its return value as
//! the outcome, unless the closure caused the task to be woken up. A closure
//! may block other tasks in turn, so several tasks can be blocked at once.
//!
//! The fake also checks the lock discipline: the kernel lock can't be entered
//! while holding a spin lock, and the transport and the allocator can't be
//! called while holding either.
use std::{
    cell::{Cell, RefCell},
    collections::{HashSet, VecDeque},
    rc::Rc,
};

use crate::{
    addr::{encode, AddrMap, GlobalAddr, LocalAddr, WORD_SIZE},
    cfg::SmConfig,
    error::NotifyError,
    klock::KernelLockGuard,
    port::{
        BlockOutcome, CpuId, LocalTask, Pool, PortAlloc, PortBus, PortKernel, PortTestAndSet,
        PortTransport, PortVisibility, Timeout,
    },
    smem::Shm,
    SmSystem,
};

pub(crate) const REGION_LEN: u32 = 0x1_0000;
const SCRATCH_START: u32 = 0x40;
const SCRATCH_LEN: u32 = 0x40;
const HEAP_START: u32 = SCRATCH_START + SCRATCH_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Store(usize, LocalAddr),
    TestAndSet(usize),
    Clear(usize),
    Publish(usize),
    Observe(usize),
    EnterKernel(usize),
    LeaveKernel(usize),
    Ready(usize, LocalTask),
    Send { from: usize, to: usize },
}

type BlockScript = Box<dyn FnOnce() -> BlockOutcome>;

#[derive(Default)]
struct FakeCpu {
    current: Option<LocalTask>,
    in_interrupt: bool,
    kernel_locked: bool,
    /// The lock words this CPU currently holds
    spin_locks: HashSet<usize>,
    proxies: Vec<(LocalTask, GlobalAddr)>,
    blocked: Vec<LocalTask>,
    woken: Vec<LocalTask>,
    last_timeout: Option<Timeout>,
    readied: Vec<LocalTask>,
    inbox: VecDeque<GlobalAddr>,
    tas_attempts: usize,
}

pub(crate) struct FakeMachine {
    mem: RefCell<Vec<u32>>,
    cpus: Vec<RefCell<FakeCpu>>,
    events: RefCell<Vec<Event>>,
    scripts: RefCell<VecDeque<BlockScript>>,
    heap_top: Cell<u32>,
    free_blocks: RefCell<Vec<(Pool, u32, GlobalAddr)>>,
    live_blocks: RefCell<Vec<(Pool, GlobalAddr)>>,
    fail_sends: Cell<bool>,
    fail_allocs: Cell<bool>,
}

#[derive(Clone)]
pub(crate) struct FakePort {
    machine: Rc<FakeMachine>,
    cpu: usize,
}

impl core::fmt::Debug for FakePort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FakePort").field("cpu", &self.cpu).finish_non_exhaustive()
    }
}

impl FakeMachine {
    pub(crate) fn new(num_cpus: usize) -> Rc<Self> {
        Rc::new(Self {
            mem: RefCell::new(vec![0; (REGION_LEN / WORD_SIZE) as usize]),
            cpus: (0..num_cpus).map(|_| RefCell::default()).collect(),
            events: RefCell::default(),
            scripts: RefCell::default(),
            heap_top: Cell::new(HEAP_START),
            free_blocks: RefCell::default(),
            live_blocks: RefCell::default(),
            fail_sends: Cell::new(false),
            fail_allocs: Cell::new(false),
        })
    }

    /// Create the region on CPU 0 and attach every other CPU to it.
    pub(crate) fn boot(num_cpus: usize) -> (Rc<Self>, Vec<SmSystem<FakePort>>) {
        let machine = Self::new(num_cpus);
        let cfg = SmConfig::new(num_cpus).with_spin_tries(4);
        let systems = (0..num_cpus)
            .map(|i| {
                if i == 0 {
                    SmSystem::init_region(machine.port(0), cfg).unwrap()
                } else {
                    SmSystem::attach(machine.port(i), cfg).unwrap()
                }
            })
            .collect();
        machine.clear_events();
        (machine, systems)
    }

    pub(crate) fn port(self: &Rc<Self>, cpu: usize) -> FakePort {
        assert!(cpu < self.cpus.len());
        FakePort {
            machine: Rc::clone(self),
            cpu,
        }
    }

    /// Get the address of a scratch word outside the region header and the
    /// heap.
    pub(crate) fn scratch(&self, i: usize) -> GlobalAddr {
        let offset = SCRATCH_START + i as u32 * WORD_SIZE;
        assert!(offset < HEAP_START);
        GlobalAddr::new(offset).unwrap()
    }

    /// Carve a block out of the heap, bypassing the pools.
    pub(crate) fn alloc_raw(&self, size: u32) -> GlobalAddr {
        let addr = self.heap_top.get();
        let next = addr + (size + WORD_SIZE - 1) / WORD_SIZE * WORD_SIZE;
        assert!(next <= REGION_LEN, "heap exhausted");
        self.heap_top.set(next);
        GlobalAddr::new(addr).unwrap()
    }

    /// Read a raw word from the region, bypassing every CPU's mapping.
    pub(crate) fn raw_word(&self, addr: GlobalAddr) -> u32 {
        self.mem.borrow()[(addr.get() / WORD_SIZE) as usize]
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub(crate) fn clear_events(&self) {
        self.events.borrow_mut().clear();
    }

    fn push_event(&self, e: Event) {
        self.events.borrow_mut().push(e);
    }

    pub(crate) fn tas_attempts(&self, cpu: usize) -> usize {
        self.cpus[cpu].borrow().tas_attempts
    }

    pub(crate) fn set_current(&self, cpu: usize, task: Option<LocalTask>) {
        self.cpus[cpu].borrow_mut().current = task;
    }

    pub(crate) fn set_interrupt(&self, cpu: usize, x: bool) {
        self.cpus[cpu].borrow_mut().in_interrupt = x;
    }

    /// Run `f` as `task` on `cpu`, then switch back to the previous task.
    pub(crate) fn as_task<R>(&self, cpu: usize, task: LocalTask, f: impl FnOnce() -> R) -> R {
        let saved = self.cpus[cpu].borrow_mut().current.replace(task);
        let ret = f();
        self.cpus[cpu].borrow_mut().current = saved;
        ret
    }

    /// Queue the closure to run when a task blocks next.
    pub(crate) fn push_block(&self, f: impl FnOnce() -> BlockOutcome + 'static) {
        self.scripts.borrow_mut().push_back(Box::new(f));
    }

    /// Make `task` on `cpu` time out. A wake-up requested after this has no
    /// effect.
    pub(crate) fn fire_timeout(&self, cpu: usize, task: LocalTask) {
        let mut cpu = self.cpus[cpu].borrow_mut();
        let i = cpu
            .blocked
            .iter()
            .position(|&t| t == task)
            .unwrap_or_else(|| panic!("{task:?} is not blocked"));
        cpu.blocked.remove(i);
    }

    pub(crate) fn last_timeout(&self, cpu: usize) -> Option<Timeout> {
        self.cpus[cpu].borrow().last_timeout
    }

    pub(crate) fn readied(&self, cpu: usize) -> Vec<LocalTask> {
        self.cpus[cpu].borrow().readied.clone()
    }

    pub(crate) fn fail_sends(&self, x: bool) {
        self.fail_sends.set(x);
    }

    pub(crate) fn fail_allocs(&self, x: bool) {
        self.fail_allocs.set(x);
    }

    /// Remove and return the chains sent to `cpu`.
    pub(crate) fn take_inbox(&self, cpu: usize) -> Vec<GlobalAddr> {
        self.cpus[cpu].borrow_mut().inbox.drain(..).collect()
    }

    /// Process every pending notification in the same way an interrupt
    /// handler would.
    pub(crate) fn deliver_all(&self, systems: &[SmSystem<FakePort>]) {
        for (cpu, system) in systems.iter().enumerate() {
            for chain in self.take_inbox(cpu) {
                let saved = std::mem::replace(&mut self.cpus[cpu].borrow_mut().in_interrupt, true);
                system.process_notification(chain);
                self.cpus[cpu].borrow_mut().in_interrupt = saved;
            }
        }
    }

    pub(crate) fn live_blocks(&self, pool: Pool) -> usize {
        self.live_blocks
            .borrow()
            .iter()
            .filter(|(p, _)| *p == pool)
            .count()
    }

    fn assert_unlocked(&self, cpu: usize, what: &str) {
        let cpu_state = self.cpus[cpu].borrow();
        assert!(
            cpu_state.spin_locks.is_empty(),
            "cpu{cpu}: {what} while holding a spin lock"
        );
        assert!(
            !cpu_state.kernel_locked,
            "cpu{cpu}: {what} inside the kernel lock"
        );
    }
}

impl FakePort {
    pub(crate) fn machine(&self) -> &Rc<FakeMachine> {
        &self.machine
    }

    pub(crate) fn shm(&self) -> Shm<'_, Self> {
        Shm::new(self, AddrMap::new(self.region_base(), self.region_len()))
    }

    fn cpu(&self) -> std::cell::RefMut<'_, FakeCpu> {
        self.machine.cpus[self.cpu].borrow_mut()
    }

    fn index(&self, addr: LocalAddr) -> usize {
        let offset = addr.0 - self.region_base().0;
        assert_eq!(offset % WORD_SIZE as usize, 0, "misaligned access");
        offset / WORD_SIZE as usize
    }
}

impl PortBus for FakePort {
    fn region_base(&self) -> LocalAddr {
        LocalAddr(0x1000_0000 + self.cpu * 0x10_0000)
    }

    fn region_len(&self) -> u32 {
        REGION_LEN
    }

    fn load(&self, addr: LocalAddr) -> u32 {
        self.machine.mem.borrow()[self.index(addr)]
    }

    fn store(&self, addr: LocalAddr, raw: u32) {
        self.machine.push_event(Event::Store(self.cpu, addr));
        self.machine.mem.borrow_mut()[self.index(addr)] = raw;
    }
}

impl PortVisibility for FakePort {
    fn publish(&self) {
        self.machine.push_event(Event::Publish(self.cpu));
    }

    fn observe(&self) {
        self.machine.push_event(Event::Observe(self.cpu));
    }
}

impl PortTestAndSet for FakePort {
    fn test_and_set(&self, addr: LocalAddr) -> bool {
        self.machine.push_event(Event::TestAndSet(self.cpu));
        self.cpu().tas_attempts += 1;
        let i = self.index(addr);
        let mut mem = self.machine.mem.borrow_mut();
        if mem[i] == 0 {
            mem[i] = encode(1);
            self.cpu().spin_locks.insert(i);
            true
        } else {
            false
        }
    }

    fn clear(&self, addr: LocalAddr) {
        self.machine.push_event(Event::Clear(self.cpu));
        let i = self.index(addr);
        self.machine.mem.borrow_mut()[i] = 0;
        assert!(self.cpu().spin_locks.remove(&i), "releasing a lock not held");
    }
}

unsafe impl PortKernel for FakePort {
    fn cpu_id(&self) -> CpuId {
        CpuId::new(self.cpu).unwrap()
    }

    fn is_interrupt_context(&self) -> bool {
        self.cpu().in_interrupt
    }

    fn current_task(&self) -> Option<LocalTask> {
        let cpu = self.cpu();
        if cpu.in_interrupt {
            None
        } else {
            cpu.current
        }
    }

    fn task_proxy(&self, task: LocalTask) -> Option<GlobalAddr> {
        self.cpu()
            .proxies
            .iter()
            .find(|(t, _)| *t == task)
            .map(|&(_, p)| p)
    }

    fn set_task_proxy(&self, task: LocalTask, proxy: Option<GlobalAddr>) {
        let mut cpu = self.cpu();
        cpu.proxies.retain(|(t, _)| *t != task);
        if let Some(proxy) = proxy {
            cpu.proxies.push((task, proxy));
        }
    }

    unsafe fn enter_kernel(&self) {
        self.machine.push_event(Event::EnterKernel(self.cpu));
        let mut cpu = self.cpu();
        assert!(!cpu.kernel_locked, "kernel lock is not reentrant");
        assert!(
            cpu.spin_locks.is_empty(),
            "entering the kernel lock while holding a spin lock"
        );
        cpu.kernel_locked = true;
    }

    unsafe fn leave_kernel(&self) {
        self.machine.push_event(Event::LeaveKernel(self.cpu));
        let mut cpu = self.cpu();
        assert!(cpu.kernel_locked);
        cpu.kernel_locked = false;
    }

    fn block_with_timeout(
        &self,
        _lock: &mut KernelLockGuard<'_, Self>,
        timeout: Timeout,
    ) -> BlockOutcome {
        assert!(!timeout.is_no_wait());
        let task = {
            let mut cpu = self.cpu();
            assert!(cpu.kernel_locked);
            assert!(cpu.spin_locks.is_empty());
            let task = cpu.current.expect("blocking outside a task");
            cpu.blocked.push(task);
            cpu.last_timeout = Some(timeout);
            cpu.kernel_locked = false;
            task
        };

        let script = self
            .machine
            .scripts
            .borrow_mut()
            .pop_front()
            .expect("a task blocked unexpectedly");
        let outcome = script();

        let mut cpu = self.cpu();
        assert!(!cpu.kernel_locked, "the block script leaked the kernel lock");
        cpu.kernel_locked = true;
        cpu.blocked.retain(|&t| t != task);
        if let Some(i) = cpu.woken.iter().position(|&t| t == task) {
            cpu.woken.remove(i);
            BlockOutcome::Granted
        } else {
            assert_ne!(outcome, BlockOutcome::Granted, "nobody woke the task");
            outcome
        }
    }

    fn place_on_ready_queue(&self, _lock: &mut KernelLockGuard<'_, Self>, task: LocalTask) {
        self.machine.push_event(Event::Ready(self.cpu, task));
        let mut cpu = self.cpu();
        assert!(cpu.kernel_locked);
        cpu.readied.push(task);
        if let Some(i) = cpu.blocked.iter().position(|&t| t == task) {
            cpu.blocked.remove(i);
            cpu.woken.push(task);
        }
    }
}

impl PortTransport for FakePort {
    fn send_to_cpu(&self, cpu: CpuId, chain: GlobalAddr) -> Result<(), NotifyError> {
        self.machine.assert_unlocked(self.cpu, "sending a notification");
        if self.machine.fail_sends.get() {
            return Err(NotifyError::NotifyFailed);
        }
        self.machine.push_event(Event::Send {
            from: self.cpu,
            to: cpu.get(),
        });
        self.machine.cpus[cpu.get()]
            .borrow_mut()
            .inbox
            .push_back(chain);
        Ok(())
    }
}

impl PortAlloc for FakePort {
    fn allocate(&self, pool: Pool, size: u32) -> Option<GlobalAddr> {
        self.machine.assert_unlocked(self.cpu, "allocating");
        if self.machine.fail_allocs.get() {
            return None;
        }
        let mut free_blocks = self.machine.free_blocks.borrow_mut();
        let block = if let Some(i) = free_blocks
            .iter()
            .position(|&(p, s, _)| p == pool && s == size)
        {
            free_blocks.swap_remove(i).2
        } else {
            self.machine.alloc_raw(size)
        };
        self.machine.live_blocks.borrow_mut().push((pool, block));
        Some(block)
    }

    fn free(&self, pool: Pool, block: GlobalAddr) {
        self.machine.assert_unlocked(self.cpu, "freeing");
        let mut live_blocks = self.machine.live_blocks.borrow_mut();
        let i = live_blocks
            .iter()
            .position(|&x| x == (pool, block))
            .unwrap_or_else(|| panic!("{block:?} is not allocated from {pool:?}"));
        live_blocks.swap_remove(i);

        let size = match pool {
            Pool::Semaphore => crate::semaphore::SEMAPHORE_SIZE,
            Pool::Proxy => crate::proxy::PROXY_SIZE,
        };
        self.machine
            .free_blocks
            .borrow_mut()
            .push((pool, size, block));
    }
}
