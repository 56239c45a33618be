// Shared helpers for the unit tests.
//
// Tests touching kernel-global state (the process table, scheduler, device
// registry, clocks) serialise on one lock and start from a reset kernel.
// Tests of purely local structures do not need the lock.

use std::sync::{Mutex, MutexGuard};

use crate::process::pcb::{Pcb, ProcessState};
use crate::process::Pid;

static KERNEL_LOCK: Mutex<()> = Mutex::new(());

/// Serialise a test against every other global-state test and reset the
/// kernel singletons.
pub fn kernel_lock() -> MutexGuard<'static, ()> {
    let guard = KERNEL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    reset_kernel();
    guard
}

fn reset_kernel() {
    crate::process::table::reset();
    crate::process::scheduler::reset();
    crate::process::timer::reset();
    crate::interrupts::reset();
    crate::vfs::reset_registry();
    crate::fs::reset();
    crate::net::socket::reset();
    crate::drivers::terminal::reset();
    crate::drivers::rtc::reset();
    crate::drivers::mouse::reset();
    crate::drivers::taux::reset();
    crate::drivers::sound::reset();
    crate::time::reset();
    crate::mm::reset_frames();
}

/// Install a runnable process with a user frame and make it current.
pub fn install_process() -> Pid {
    let pid = crate::process::table::alloc_pid();
    let mut pcb = Box::new(Pcb::new(pid, -1, 0, -1));
    pcb.state = ProcessState::Running;
    pcb.user_paddr = crate::mm::alloc_user_frame().expect("frame pool exhausted in test");
    crate::process::table::with_table(|t| t.insert(pcb)).expect("process table full in test");
    crate::process::table::set_current(pid);
    pid
}
