// Cooperative round-robin scheduler.
//
// The run queue holds RUNNING pids; the executing process is not in it.
// Kernel code is never preempted: switches happen only in `sleep`, `yield`
// and `exit`, all called with the kernel in a consistent state.

use spin::Mutex;

use crate::process::pcb::ProcessState;
use crate::process::table::{self, IDLE_PID, MAX_PROCESSES};
use crate::process::Pid;

static RUN_QUEUE: Mutex<heapless::Deque<Pid, MAX_PROCESSES>> = Mutex::new(heapless::Deque::new());

/// A pid whose PCB must be freed once the scheduler has switched off its
/// kernel stack (an orphan that exited with no parent to reap it).
static REAP_AFTER_SWITCH: Mutex<Option<Pid>> = Mutex::new(None);

fn queue_push(pid: Pid) {
    crate::arch::without_interrupts(|| {
        let mut queue = RUN_QUEUE.lock();
        if !queue.iter().any(|&p| p == pid) {
            let _ = queue.push_back(pid);
        }
    });
}

fn queue_remove(pid: Pid) {
    crate::arch::without_interrupts(|| {
        let mut queue = RUN_QUEUE.lock();
        let mut kept = heapless::Deque::new();
        while let Some(p) = queue.pop_front() {
            if p != pid {
                let _ = kept.push_back(p);
            }
        }
        *queue = kept;
    });
}

fn queue_pop() -> Option<Pid> {
    crate::arch::without_interrupts(|| RUN_QUEUE.lock().pop_front())
}

/// Register a process with the scheduler: state becomes RUNNING and the pid
/// goes to the run-queue tail.
pub fn add(pid: Pid) {
    table::with_pcb(pid, |pcb| pcb.state = ProcessState::Running);
    queue_push(pid);
}

/// Unlink a process from the run queue. The caller assigns the new state.
pub fn remove(pid: Pid) {
    queue_remove(pid);
}

/// Wake a sleeping process. Idempotent; safe from interrupt context.
pub fn wake(pid: Pid) {
    let woke = table::with_pcb(pid, |pcb| {
        if pcb.state == ProcessState::Sleeping {
            pcb.state = ProcessState::Running;
            true
        } else {
            false
        }
    })
    .unwrap_or(false);
    if woke {
        queue_push(pid);
    }
}

/// Move the executing process to SLEEPING and run someone else. The caller
/// has already linked itself into a wait queue or armed a timer, so a
/// wakeup between those steps and this one is not lost: `wake` re-queues
/// the pid and the state check below sees RUNNING again.
pub fn sleep() {
    let pid = table::current_pid();
    let still_runnable = table::with_pcb(pid, |pcb| {
        if pcb.state == ProcessState::Running {
            pcb.state = ProcessState::Sleeping;
            false
        } else {
            true
        }
    })
    .unwrap_or(true);
    if !still_runnable {
        schedule();
    }
}

/// Sleep until the given absolute monotonic deadline (or an earlier wake).
pub fn sleep_until(deadline_ns: u64) {
    let pid = table::current_pid();
    crate::process::timer::arm(pid, crate::process::timer::TimerKind::Sleep, deadline_ns);
    sleep();
    crate::process::timer::disarm(pid, crate::process::timer::TimerKind::Sleep);
}

/// Cede the rest of the timeslice: requeue at the tail and reschedule.
pub fn yield_now() {
    let pid = table::current_pid();
    if pid != IDLE_PID {
        queue_push(pid);
    }
    schedule();
}

/// Permanently cede the CPU. The executing process never runs again.
pub fn exit() -> ! {
    #[cfg(target_arch = "x86")]
    {
        schedule();
        unreachable!("dead process was rescheduled");
    }
    #[cfg(not(target_arch = "x86"))]
    panic!("scheduler exit requires an x86 target");
}

/// Queue an exited orphan for deallocation after the next switch.
pub fn reap_after_switch(pid: Pid) {
    crate::arch::without_interrupts(|| {
        *REAP_AFTER_SWITCH.lock() = Some(pid);
    });
}

fn finish_switch() {
    let stale = crate::arch::without_interrupts(|| REAP_AFTER_SWITCH.lock().take());
    if let Some(pid) = stale {
        table::with_table(|t| t.remove(pid));
    }
}

/// Pick the next runnable process and switch to it.
#[cfg(target_arch = "x86")]
fn schedule() {
    use crate::process::pcb::KERNEL_STACK_SIZE;

    let prev = table::current_pid();
    let next = loop {
        match queue_pop() {
            Some(pid) => {
                // A wake may race with an exit; skip stale entries
                match table::with_pcb(pid, |pcb| pcb.state) {
                    Some(ProcessState::Running) => break pid,
                    _ => continue,
                }
            }
            None => break IDLE_PID,
        }
    };
    if next == prev {
        return;
    }

    // Gather the switch parameters, then drop all locks before the switch.
    let mut prev_sp_ptr: *mut usize = core::ptr::null_mut();
    let mut prev_bp_ptr: *mut usize = core::ptr::null_mut();
    table::with_pcb(prev, |pcb| {
        prev_sp_ptr = &mut pcb.kernel_sp as *mut usize;
        prev_bp_ptr = &mut pcb.kernel_bp as *mut usize;
    });

    let next_sp = table::with_pcb(next, |pcb| {
        if pcb.kstack.is_none() && pcb.pid != IDLE_PID {
            // First run: seed the kernel stack with an entry frame
            // (the idle process runs on the boot stack)
            let stack = pcb
                .kstack
                .get_or_insert_with(|| alloc::vec![0u8; KERNEL_STACK_SIZE]);
            let top = stack.as_ptr() as usize + KERNEL_STACK_SIZE;
            let (sp, bp) = crate::arch::x86::context::prepare_kernel_stack(top, process_entry);
            pcb.kernel_sp = sp;
            pcb.kernel_bp = bp;
        }
        if let Some(stack) = pcb.kstack.as_ref() {
            crate::arch::x86::gdt::set_kernel_stack(stack.as_ptr() as u32 + KERNEL_STACK_SIZE as u32);
        }
        crate::mm::switch_user_page(pcb.user_paddr);
        pcb.kernel_sp
    });

    let Some(next_sp) = next_sp else {
        return;
    };

    table::set_current(next);
    unsafe {
        crate::arch::x86::context::context_switch(prev_sp_ptr, prev_bp_ptr, next_sp);
    }
    finish_switch();
}

#[cfg(not(target_arch = "x86"))]
fn schedule() {
    // Host builds never block; reaching a real switch is a test bug.
    finish_switch();
    panic!("context switch requires an x86 target");
}

/// Entry point for a freshly created process: drop into ring 3 with the
/// frame its creator prepared.
#[cfg(target_arch = "x86")]
extern "C" fn process_entry() -> ! {
    finish_switch();
    let regs = table::with_current(|pcb| pcb.regs).expect("new process has no PCB");
    unsafe { crate::arch::x86::context::enter_user(&regs) }
}

#[cfg(test)]
pub fn reset() {
    let mut queue = RUN_QUEUE.lock();
    while queue.pop_front().is_some() {}
    *REAP_AFTER_SWITCH.lock() = None;
}

#[cfg(test)]
pub fn run_queue_snapshot() -> alloc::vec::Vec<Pid> {
    RUN_QUEUE.lock().iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pcb::Pcb;
    use alloc::boxed::Box;

    fn spawn_running(state: ProcessState) -> Pid {
        let pid = table::alloc_pid();
        let mut pcb = Box::new(Pcb::new(pid, -1, 0, -1));
        pcb.state = state;
        table::with_table(|t| t.insert(pcb)).unwrap();
        pid
    }

    #[test]
    fn round_robin_order_is_fifo() {
        let _guard = crate::test_utils::kernel_lock();
        let a = spawn_running(ProcessState::New);
        let b = spawn_running(ProcessState::New);
        add(a);
        add(b);
        assert_eq!(run_queue_snapshot(), alloc::vec![a, b]);
        // add() is idempotent for an already-queued pid
        add(a);
        assert_eq!(run_queue_snapshot(), alloc::vec![a, b]);
        remove(a);
        assert_eq!(run_queue_snapshot(), alloc::vec![b]);
    }

    #[test]
    fn wake_only_affects_sleepers_and_is_idempotent() {
        let _guard = crate::test_utils::kernel_lock();
        let a = spawn_running(ProcessState::Sleeping);

        wake(a);
        wake(a);
        assert_eq!(run_queue_snapshot(), alloc::vec![a]);
        assert_eq!(
            table::with_pcb(a, |p| p.state),
            Some(ProcessState::Running)
        );

        // Waking a RUNNING process must not duplicate it
        wake(a);
        assert_eq!(run_queue_snapshot(), alloc::vec![a]);

        // Waking a zombie does nothing
        let z = spawn_running(ProcessState::Zombie);
        wake(z);
        assert_eq!(run_queue_snapshot(), alloc::vec![a]);
    }
}
