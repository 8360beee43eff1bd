//! Utilities shared by the integration tests
#![allow(dead_code)]
use r3_smobj::SmSemId;
use r3_smobj_sim::{Machine, SimConfig};
use std::{
    thread,
    time::{Duration, Instant},
};

/// The configuration used by the tests. The host may preempt a thread holding
/// a spin lock, so the lock is allowed to spin for much longer than on real
/// hardware.
pub fn config(num_cpus: usize) -> SimConfig {
    SimConfig::new(num_cpus).with_spin_tries(1_000_000)
}

/// Power on a machine with `num_cpus` CPUs.
pub fn boot(num_cpus: usize) -> Machine {
    boot_with(config(num_cpus))
}

pub fn boot_with(cfg: SimConfig) -> Machine {
    let _ = env_logger::try_init();
    match Machine::new(cfg) {
        Ok(machine) => machine,
        Err(e) => panic!("failed to power on the machine: {e:?}"),
    }
}

/// Poll `cond` until it returns `true`. Panics after ten seconds.
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for a condition");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Wait until `n` tasks are waiting on `sem`.
pub fn wait_for_waiters(machine: &Machine, sem: SmSemId, n: usize) {
    wait_until(|| {
        let info = machine.system(0).semaphore_info::<0>(sem).unwrap();
        info.num_waiters == n
    });
}
