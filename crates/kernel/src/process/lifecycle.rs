// Process exit and reaping.

use crate::error::{Errno, Result};
use crate::process::table;
use crate::process::Pid;
use crate::syscall::uaccess;

/// Tear down the executing process and permanently cede the CPU.
///
/// Descriptors are closed (their hooks run outside the table lock), timers
/// disarmed, the user frame returned to the pool, zombie children reaped
/// and living ones reparented. The PCB itself stays behind as a ZOMBIE for
/// the parent's wait(); with no live parent the scheduler frees it right
/// after switching away.
pub fn halt_impl(exit_code: i32) -> ! {
    let pid = table::current_pid();

    let torn_down = table::with_table(|t| {
        let mut dead_children = alloc::vec::Vec::new();
        for child_pid in t.children_of(pid) {
            let is_zombie = t.get(child_pid).is_some_and(|c| c.is_zombie());
            if is_zombie {
                if let Some(dead) = t.remove(child_pid) {
                    dead_children.push(dead);
                }
            } else if let Some(child) = t.get_mut(child_pid) {
                child.parent_pid = -1;
            }
        }

        let pcb = t.get_mut(pid)?;
        pcb.exit(exit_code);
        let files = core::mem::take(&mut pcb.files);
        let user_paddr = pcb.user_paddr;
        pcb.user_paddr = 0;
        Some((files, user_paddr, pcb.parent_pid, dead_children))
    });

    if let Some((files, user_paddr, parent_pid, dead_children)) = torn_down {
        // Close hooks (pipe half-close, device release) wake other
        // processes and must not hold the table lock
        drop(files);
        drop(dead_children);

        crate::process::timer::disarm_all(pid);
        crate::process::scheduler::remove(pid);
        if user_paddr != 0 {
            crate::mm::free_user_frame(user_paddr);
        }

        let parent_queue = table::with_pcb(parent_pid, |parent| parent.child_wait.clone());
        match parent_queue {
            Some(queue) => queue.wake(),
            // Orphan: nobody will wait() for this PCB
            None => crate::process::scheduler::reap_after_switch(pid),
        }
    }

    crate::debug!("process {} exited with status {}", pid, exit_code);
    crate::process::scheduler::exit()
}

/// halt() syscall. User code can only report 0..255; the larger exception
/// and interrupt statuses are produced inside the kernel.
pub fn sys_halt(status: u32) -> ! {
    halt_impl((status & 0xFF) as i32)
}

/// wait() syscall: block until any child is a ZOMBIE, free its PCB, write
/// its pid through `pid_out_addr` and return its exit status.
pub fn sys_wait(pid_out_addr: u32) -> Result<i32> {
    let me = table::current_pid();
    let queue = crate::process::with_current(|pcb| pcb.child_wait.clone()).ok_or(Errno::EFAIL)?;

    let mut reaped_pid: Pid = -1;
    let exit_code = crate::process::wait::wait_interruptible(Some(&queue), false, || {
        table::with_table(|t| {
            let children = t.children_of(me);
            if children.is_empty() {
                return Err(Errno::EFAIL);
            }
            for child_pid in children {
                let is_zombie = t.get(child_pid).is_some_and(|c| c.is_zombie());
                if is_zombie {
                    // Files were already released in halt; dropping the
                    // PCB here runs no wake hooks
                    let dead = t.remove(child_pid).ok_or(Errno::EFAIL)?;
                    reaped_pid = child_pid;
                    return Ok(dead.exit_code);
                }
            }
            Err(Errno::EAGAIN)
        })
    })?;

    if !uaccess::write_user(pid_out_addr, &reaped_pid) {
        return Err(Errno::EFAIL);
    }
    Ok(exit_code)
}
