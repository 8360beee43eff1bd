//! A minimal local kernel whose tasks are host threads
//!
//! The kernel only knows what the shared-memory layer asks of it: which task
//! is running, whether a task is blocked, and how to resume it. Blocking parks
//! the host thread, and waking a task unparks it.
use r3_smobj::{BlockOutcome, CpuId, GlobalAddr, LocalTask, Timeout};
use slab::Slab;
use spin::Mutex as SpinMutex;
use std::{
    cell::Cell,
    sync::atomic::{AtomicBool, Ordering},
    thread::{self, Thread},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadRole {
    Unknown,
    /// The notification handler of a CPU.
    Interrupt(CpuId),
    /// A task of a CPU.
    Task(CpuId, LocalTask),
}

thread_local! {
    /// The current thread's role. It's assigned when a thread managed by the
    /// simulator starts.
    static THREAD_ROLE: Cell<ThreadRole> = const { Cell::new(ThreadRole::Unknown) };
}

pub(crate) fn thread_role() -> ThreadRole {
    THREAD_ROLE.with(|role| role.get())
}

pub(crate) fn set_thread_role(new_role: ThreadRole) {
    THREAD_ROLE.with(|role| role.set(new_role));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Running,
    Blocked,
    /// Resumed by `place_on_ready_queue` but hasn't noticed yet
    Woken,
}

#[derive(Debug)]
struct TaskRecord {
    /// `None` until the task's thread starts
    thread: Option<Thread>,
    proxy: Option<GlobalAddr>,
    wait: WaitState,
    restart_requested: bool,
}

pub(crate) struct LocalKernel {
    cpu: CpuId,
    tick: Duration,
    /// The kernel's mutual exclusion
    kernel_lock: AtomicBool,
    tasks: SpinMutex<Slab<TaskRecord>>,
}

impl LocalKernel {
    pub(crate) fn new(cpu: CpuId, tick: Duration) -> Self {
        Self {
            cpu,
            tick,
            kernel_lock: AtomicBool::new(false),
            tasks: SpinMutex::new(Slab::new()),
        }
    }

    pub(crate) fn create_task(&self) -> LocalTask {
        let key = self.tasks.lock().insert(TaskRecord {
            thread: None,
            proxy: None,
            wait: WaitState::Running,
            restart_requested: false,
        });
        log::trace!("{}: created task {}", self.cpu, key);
        LocalTask(key as u32)
    }

    /// Associate `task` with the calling thread.
    pub(crate) fn start_task(&self, task: LocalTask) {
        self.tasks.lock()[task.0 as usize].thread = Some(thread::current());
        set_thread_role(ThreadRole::Task(self.cpu, task));
    }

    pub(crate) fn exit_task(&self, task: LocalTask) {
        let record = self.tasks.lock().remove(task.0 as usize);
        debug_assert!(record.proxy.is_none(), "the proxy wasn't released");
        set_thread_role(ThreadRole::Unknown);
        log::trace!("{}: task {} exited", self.cpu, task.0);
    }

    pub(crate) fn num_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    pub(crate) fn current_task(&self) -> Option<LocalTask> {
        match thread_role() {
            ThreadRole::Task(cpu, task) if cpu == self.cpu => Some(task),
            _ => None,
        }
    }

    pub(crate) fn is_interrupt_context(&self) -> bool {
        thread_role() == ThreadRole::Interrupt(self.cpu)
    }

    pub(crate) fn task_proxy(&self, task: LocalTask) -> Option<GlobalAddr> {
        self.tasks
            .lock()
            .get(task.0 as usize)
            .and_then(|record| record.proxy)
    }

    pub(crate) fn set_task_proxy(&self, task: LocalTask, proxy: Option<GlobalAddr>) {
        if let Some(record) = self.tasks.lock().get_mut(task.0 as usize) {
            record.proxy = proxy;
        }
    }

    pub(crate) fn enter(&self) {
        while self
            .kernel_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            thread::yield_now();
        }
    }

    pub(crate) fn leave(&self) {
        let was_locked = self.kernel_lock.swap(false, Ordering::Release);
        debug_assert!(was_locked);
    }

    /// Suspend the calling task. Must be called inside the kernel's mutual
    /// exclusion, which is released while the task is suspended.
    pub(crate) fn block(&self, timeout: Timeout) -> BlockOutcome {
        let Some(task) = self.current_task() else {
            panic!("{}: block called outside a task", self.cpu);
        };
        let key = task.0 as usize;

        let deadline = match timeout {
            Timeout::Forever => None,
            Timeout::Ticks(n) => Some(Instant::now() + self.tick * n),
            Timeout::NoWait => Some(Instant::now()),
        };

        self.tasks.lock()[key].wait = WaitState::Blocked;
        log::trace!("{}: task {} blocked ({:?})", self.cpu, key, timeout);
        self.leave();

        loop {
            {
                let tasks = self.tasks.lock();
                let record = &tasks[key];
                if record.wait == WaitState::Woken || record.restart_requested {
                    break;
                }
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }

        self.enter();

        // Decide the outcome inside the mutual exclusion. A wake-up arriving
        // after this point finds the task running and is ignored.
        let mut tasks = self.tasks.lock();
        let record = &mut tasks[key];
        let outcome = if record.wait == WaitState::Woken {
            BlockOutcome::Granted
        } else if record.restart_requested {
            BlockOutcome::Restarted
        } else {
            BlockOutcome::TimedOut
        };
        record.wait = WaitState::Running;
        record.restart_requested = false;

        log::trace!("{}: task {} resumed ({:?})", self.cpu, key, outcome);
        outcome
    }

    /// Must be called inside the kernel's mutual exclusion.
    pub(crate) fn wake(&self, task: LocalTask) {
        let mut tasks = self.tasks.lock();
        let Some(record) = tasks.get_mut(task.0 as usize) else {
            log::warn!("{}: ignoring a wake-up for the unknown task {}", self.cpu, task.0);
            return;
        };
        if record.wait == WaitState::Blocked {
            record.wait = WaitState::Woken;
            if let Some(thread) = &record.thread {
                thread.unpark();
            }
        }
    }

    /// Cut short the current or the next wait of `task`.
    pub(crate) fn restart(&self, task: LocalTask) {
        self.enter();
        if let Some(record) = self.tasks.lock().get_mut(task.0 as usize) {
            record.restart_requested = true;
            if let Some(thread) = &record.thread {
                thread.unpark();
            }
        }
        self.leave();
    }
}
