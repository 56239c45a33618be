// fork(): duplicate the executing process.
//
// The child gets a copy of the parent's user page and register frame (with
// EAX forced to 0), shares the parent's file objects through its own
// descriptor table, and inherits signals, args, terminal and group. The
// parent gets the child pid.

use alloc::boxed::Box;

use crate::arch::IntRegs;
use crate::error::{Errno, Result};
use crate::process::pcb::Pcb;
use crate::process::table;

pub fn sys_fork(regs: &IntRegs) -> Result<i32> {
    struct ParentSnapshot {
        pid: i32,
        terminal: usize,
        pgrp: i32,
        user_paddr: u32,
        files: crate::vfs::file::FdTable,
        signals: crate::process::signal::SignalTable,
        heap: crate::process::pcb::HeapRange,
        flags: crate::process::pcb::PcbFlags,
        args: heapless::String<{ crate::process::pcb::MAX_ARGS_LEN }>,
    }

    let parent = crate::process::with_current(|pcb| ParentSnapshot {
        pid: pcb.pid,
        terminal: pcb.terminal,
        pgrp: pcb.pgrp,
        user_paddr: pcb.user_paddr,
        files: pcb.files.clone(),
        signals: pcb.signals.clone(),
        heap: pcb.heap,
        flags: pcb.flags,
        args: pcb.args.clone(),
    })
    .ok_or(Errno::EFAIL)?;

    let child_paddr = crate::mm::alloc_user_frame()?;
    crate::mm::copy_user_page(child_paddr, parent.user_paddr);
    // The copy leaves the child's page mapped; map the parent back in
    crate::mm::switch_user_page(parent.user_paddr);

    let child_pid = table::alloc_pid();
    let mut child = Box::new(Pcb::new(child_pid, parent.pid, parent.terminal, parent.pgrp));
    child.user_paddr = child_paddr;
    child.files = parent.files;
    child.signals = parent.signals;
    child.heap = parent.heap;
    child.flags = parent.flags;
    child.args = parent.args;
    child.regs = *regs;
    // The child observes fork() returning 0
    child.regs.eax = 0;

    if let Err(e) = table::with_table(|t| t.insert(child)) {
        crate::mm::free_user_frame(child_paddr);
        return Err(e);
    }

    crate::process::timer::arm(
        child_pid,
        crate::process::timer::TimerKind::Alarm,
        crate::time::monotime_now() + crate::process::timer::ALARM_PERIOD_NS,
    );
    crate::process::scheduler::add(child_pid);
    Ok(child_pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::signal::SIG_USER1;
    use crate::test_utils;
    use alloc::sync::Arc;

    #[test]
    fn child_shares_files_and_copies_state() {
        let _guard = test_utils::kernel_lock();
        let parent = test_utils::install_process();

        let (r, w) = crate::vfs::pipe::create();
        table::with_pcb(parent, |pcb| {
            pcb.files.bind(-1, r.clone()).unwrap();
            pcb.files.bind(-1, w).unwrap();
            pcb.signals.set_handler(SIG_USER1, 0x0804_9000);
            pcb.args.push_str("some args").unwrap();
            pcb.pgrp = parent;
        })
        .unwrap();

        let mut regs = IntRegs::default();
        regs.eax = crate::syscall::SYS_FORK as u32;
        regs.eip = 0x0804_8123;
        let child = sys_fork(&regs).unwrap();
        assert_ne!(child, parent);

        // Shared file objects: the pipe read end now has three references
        // (local, parent slot, child slot)
        assert_eq!(Arc::strong_count(&r), 3);

        table::with_pcb(child, |pcb| {
            assert_eq!(pcb.parent_pid, parent);
            assert_eq!(pcb.pgrp, parent);
            assert_eq!(pcb.args.as_str(), "some args");
            assert_eq!(pcb.signals.get(SIG_USER1).handler_addr, 0x0804_9000);
            // The child re-enters user mode as if fork returned 0
            assert_eq!(pcb.regs.eax, 0);
            assert_eq!(pcb.regs.eip, regs.eip);
            assert_eq!(pcb.state, crate::process::pcb::ProcessState::Running);
        })
        .unwrap();

        // The child is queued to run and its alarm is armed
        assert!(crate::process::scheduler::run_queue_snapshot().contains(&child));
        assert!(crate::process::timer::armed(child, crate::process::timer::TimerKind::Alarm)
            .is_some());
    }

    #[test]
    fn fork_without_frames_rolls_back() {
        let _guard = test_utils::kernel_lock();
        let _parent = test_utils::install_process();

        // Exhaust the frame pool
        let mut frames = alloc::vec::Vec::new();
        while let Ok(frame) = crate::mm::alloc_user_frame() {
            frames.push(frame);
        }

        let regs = IntRegs::default();
        assert_eq!(sys_fork(&regs), Err(Errno::EFAIL));

        for frame in frames {
            crate::mm::free_user_frame(frame);
        }
    }
}
