//! Inter-CPU notifications
//!
//! Each CPU has a mailbox and a handler thread playing the part of its
//! notification interrupt. A wake-up request is a chain of proxies, delivered
//! in the order it was sent.
use r3_smobj::{CpuId, GlobalAddr, NotifyError, SmSystem};
use spin::Mutex as SpinMutex;
use std::{
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
};

use crate::{
    kernel::{set_thread_role, ThreadRole},
    SimPort,
};

pub(crate) struct Mailbox {
    cpu: CpuId,
    /// `None` before the handler starts and after shutdown
    send: SpinMutex<Option<mpsc::Sender<GlobalAddr>>>,
}

impl Mailbox {
    pub(crate) const fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            send: SpinMutex::new(None),
        }
    }

    pub(crate) fn post(&self, chain: GlobalAddr) -> Result<(), NotifyError> {
        let send = self.send.lock();
        let Some(send) = &*send else {
            log::error!("{}: the mailbox is closed", self.cpu);
            return Err(NotifyError::NotifyFailed);
        };
        send.send(chain).map_err(|_| {
            log::error!("{}: the notification handler has exited", self.cpu);
            NotifyError::NotifyFailed
        })
    }

    /// Start the handler thread, which forwards every chain to
    /// [`SmSystem::process_notification`].
    pub(crate) fn start(&self, system: Arc<SmSystem<SimPort>>) -> JoinHandle<()> {
        let (send, recv) = mpsc::channel();
        let cpu = self.cpu;
        let join_handle = thread::Builder::new()
            .name(format!("{cpu}-notify"))
            .spawn(move || {
                set_thread_role(ThreadRole::Interrupt(cpu));
                log::trace!("{}: notification handler started", cpu);
                // `recv` fails when the mailbox is closed
                for chain in recv {
                    system.process_notification(chain);
                }
                log::trace!("{}: notification handler exiting", cpu);
            })
            .unwrap();
        *self.send.lock() = Some(send);
        join_handle
    }

    /// Close the mailbox. The handler thread exits after processing the
    /// requests already posted.
    pub(crate) fn close(&self) {
        *self.send.lock() = None;
    }
}
