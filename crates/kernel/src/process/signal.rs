// Signal delivery.
//
// Delivery happens on the return path to ring 3 by rewriting the saved
// interrupt frame: the handler's address goes into EIP and a frame holding a
// sigreturn trampoline, the saved registers and the signal number is pushed
// onto the user stack. The handler's `ret` lands in the trampoline, which
// re-enters the kernel through the sigreturn syscall to restore the saved
// frame.

use crate::arch::{IntRegs, EFLAGS_DF, EFLAGS_USER, USER_CS, USER_DS};
use crate::error::{Errno, Result};
use crate::process::Pid;
use crate::syscall::uaccess;

/// Number of supported signals.
pub const NUM_SIGNALS: usize = 6;

/// Signal numbers.
pub const SIG_DIV_ZERO: usize = 0;
pub const SIG_SEGFAULT: usize = 1;
pub const SIG_INTERRUPT: usize = 2;
pub const SIG_ALARM: usize = 3;
pub const SIG_USER1: usize = 4;
pub const SIG_PIPE: usize = 5;

/// sigmask() actions and return values.
pub const SIGMASK_NONE: i32 = 0;
pub const SIGMASK_BLOCK: i32 = 1;
pub const SIGMASK_UNBLOCK: i32 = 2;

/// Exit codes used by the default actions.
pub const EXIT_EXCEPTION: i32 = 256;
pub const EXIT_INTERRUPT: i32 = 130;

#[derive(Debug, Clone, Copy)]
pub struct SignalInfo {
    pub signum: u8,
    /// Userspace handler address; 0 means no handler is registered.
    pub handler_addr: u32,
    pub masked: bool,
    pub pending: bool,
}

/// Per-process signal state.
#[derive(Debug, Clone)]
pub struct SignalTable([SignalInfo; NUM_SIGNALS]);

impl SignalTable {
    pub fn new() -> Self {
        let mut table = [SignalInfo {
            signum: 0,
            handler_addr: 0,
            masked: false,
            pending: false,
        }; NUM_SIGNALS];
        for (i, sig) in table.iter_mut().enumerate() {
            sig.signum = i as u8;
        }
        Self(table)
    }

    pub fn get(&self, signum: usize) -> &SignalInfo {
        &self.0[signum]
    }

    pub fn raise(&mut self, signum: usize) {
        self.0[signum].pending = true;
    }

    pub fn set_handler(&mut self, signum: usize, handler_addr: u32) {
        self.0[signum].handler_addr = handler_addr;
    }

    pub fn set_masked(&mut self, signum: usize, masked: bool) {
        self.0[signum].masked = masked;
    }

    /// Whether a pending signal exists whose delivery would do something:
    /// either a registered, unmasked handler, or a killing default action
    /// (the default actions ignore the mask).
    pub fn has_deliverable(&self) -> bool {
        self.0.iter().any(|sig| {
            sig.pending
                && ((sig.handler_addr != 0 && !sig.masked)
                    || matches!(
                        sig.signum as usize,
                        SIG_DIV_ZERO | SIG_SEGFAULT | SIG_INTERRUPT
                    ))
        })
    }
}

// Trampoline pushed onto the user stack:
//   mov eax, SYS_SIGRETURN
//   mov ebx, signum
//   mov ecx, <saved frame address>
//   int 0x80
// padded with NOPs to keep the stack 4-byte aligned.
const TRAMPOLINE_LEN: usize = 20;
const REGS_LEN: usize = core::mem::size_of::<IntRegs>();
const SIGFRAME_LEN: usize = TRAMPOLINE_LEN + REGS_LEN + 8;

/// Push the signal context onto the user stack and redirect the saved frame
/// into the handler. Returns false if the frame does not fit.
fn deliver(signum: usize, handler_addr: u32, regs: &mut IntRegs) -> bool {
    let esp = regs.esp;
    let Some(new_esp) = esp.checked_sub(SIGFRAME_LEN as u32) else {
        return false;
    };

    let trampoline_addr = esp - TRAMPOLINE_LEN as u32;
    let regs_addr = trampoline_addr - REGS_LEN as u32;
    let signum_addr = regs_addr - 4;

    // Stage the whole frame, then push it with a single user copy.
    let mut frame = [0u8; SIGFRAME_LEN];
    frame[0..4].copy_from_slice(&trampoline_addr.to_le_bytes());
    frame[4..8].copy_from_slice(&(signum as u32).to_le_bytes());
    let regs_bytes = unsafe {
        core::slice::from_raw_parts(regs as *const IntRegs as *const u8, REGS_LEN)
    };
    frame[8..8 + REGS_LEN].copy_from_slice(regs_bytes);

    let code = &mut frame[8 + REGS_LEN..];
    code.copy_from_slice(&[
        0xB8, 0, 0, 0, 0, // movl $SYS_SIGRETURN, %eax
        0xBB, 0, 0, 0, 0, // movl $signum, %ebx
        0xB9, 0, 0, 0, 0, // movl $regs, %ecx
        0xCD, 0x80, // int 0x80
        0x90, 0x90, 0x90, // nop padding
    ]);
    code[1..5].copy_from_slice(&(crate::syscall::SYS_SIGRETURN as u32).to_le_bytes());
    code[6..10].copy_from_slice(&(signum as u32).to_le_bytes());
    code[11..15].copy_from_slice(&regs_addr.to_le_bytes());

    debug_assert_eq!(signum_addr - 4, new_esp);
    if !uaccess::copy_to_user(new_esp, &frame) {
        return false;
    }

    // Detour execution into the handler on the new stack bottom
    regs.eip = handler_addr;
    regs.esp = new_esp;

    // Reset segments in case a bad selector caused the signal
    regs.cs = USER_CS;
    regs.ds = USER_DS;
    regs.es = USER_DS;
    regs.fs = USER_DS;
    regs.gs = USER_DS;
    regs.ss = USER_DS;

    regs.eflags &= !EFLAGS_DF;
    true
}

/// One delivery pass over a signal table. At most one signal is acted on:
/// the first pending one with a handler is delivered (and auto-masked), a
/// killing default action returns the exit code for the caller to halt
/// with, and ignored signals are cleared while the scan continues.
pub fn handle_table(signals: &mut SignalTable, regs: &mut IntRegs) -> Option<i32> {
    for i in 0..NUM_SIGNALS {
        let sig = signals.0[i];
        if !sig.pending {
            continue;
        }

        if sig.handler_addr != 0 && !sig.masked {
            if deliver(i, sig.handler_addr, regs) {
                // Mask until sigreturn so the handler cannot re-enter
                signals.0[i].masked = true;
                signals.0[i].pending = false;
            } else {
                crate::debug!("no room for signal context, killing process");
                return Some(EXIT_EXCEPTION);
            }
            // Remaining pending signals are delivered on a later pass
            return None;
        }

        match i {
            SIG_DIV_ZERO | SIG_SEGFAULT => return Some(EXIT_EXCEPTION),
            SIG_INTERRUPT => return Some(EXIT_INTERRUPT),
            _ => signals.0[i].pending = false,
        }
    }
    None
}

/// Deliver pending signals for the executing process. Runs on the
/// interrupt-return path, only when the interrupted context was ring 3.
pub fn handle_all(regs: &mut IntRegs) {
    let verdict = crate::process::with_current(|pcb| handle_table(&mut pcb.signals, regs));
    if let Some(Some(exit_code)) = verdict {
        crate::process::lifecycle::halt_impl(exit_code);
    }
}

/// Restore the pre-signal frame saved on the user stack. Privileged EFLAGS
/// bits and the segment selectors are forced back to their kernel-canonical
/// values no matter what the user frame claims.
pub fn sigreturn_frame(
    signals: &mut SignalTable,
    signum: i32,
    user_regs_addr: u32,
    kernel_regs: &mut IntRegs,
) -> Result<i32> {
    if signum < 0 || signum as usize >= NUM_SIGNALS {
        crate::debug!("sigreturn with invalid signal number {}", signum);
        return Err(Errno::EFAIL);
    }

    let mut restored: IntRegs = uaccess::read_user(user_regs_addr).ok_or(Errno::EFAIL)?;

    signals.set_masked(signum as usize, false);

    // Emulate POPFL: user code only controls the unprivileged bits
    let kernel_eflags = kernel_regs.eflags & !EFLAGS_USER;
    let user_eflags = restored.eflags & EFLAGS_USER;
    restored.eflags = kernel_eflags | user_eflags;

    restored.cs = USER_CS;
    restored.ds = USER_DS;
    restored.es = USER_DS;
    restored.fs = USER_DS;
    restored.gs = USER_DS;
    restored.ss = USER_DS;

    *kernel_regs = restored;

    // The dispatcher writes the return value into the frame's EAX slot;
    // returning the restored EAX keeps the register file unperturbed.
    Ok(kernel_regs.eax as i32)
}

/// Mark a signal pending for a process, waking it if it sleeps so an
/// interruptible wait can observe the signal.
pub fn raise(pid: Pid, signum: usize) {
    let exists = crate::process::table::with_pcb(pid, |pcb| pcb.signals.raise(signum));
    if exists.is_some() {
        crate::process::scheduler::wake(pid);
    }
}

/// Raise a signal on the executing process.
pub fn raise_executing(signum: usize) {
    let pid = crate::process::current_pid();
    let _ = crate::process::table::with_pcb(pid, |pcb| pcb.signals.raise(signum));
}

/// Raise a signal on every process in a process group.
pub fn raise_group(pgrp: Pid, signum: usize) {
    let pids = crate::process::table::with_table(|table| {
        let mut pids = heapless::Vec::<Pid, { crate::process::MAX_PROCESSES }>::new();
        for pcb in table.iter() {
            if pcb.pgrp == pgrp {
                let _ = pids.push(pcb.pid);
            }
        }
        pids
    });
    for pid in pids {
        raise(pid, signum);
    }
}

/// Whether the executing process has a deliverable pending signal. Used by
/// the interruptible wait loops.
pub fn has_pending_current() -> bool {
    crate::process::with_current(|pcb| pcb.signals.has_deliverable()).unwrap_or(false)
}

// --- syscall handlers ---

pub fn sys_sigaction(signum: i32, handler_addr: u32) -> Result<i32> {
    if signum < 0 || signum as usize >= NUM_SIGNALS {
        return Err(Errno::EFAIL);
    }
    crate::process::with_current(|pcb| pcb.signals.set_handler(signum as usize, handler_addr))
        .ok_or(Errno::EFAIL)?;
    Ok(0)
}

pub fn sys_sigmask(signum: i32, action: i32) -> Result<i32> {
    if signum < 0 || signum as usize >= NUM_SIGNALS {
        return Err(Errno::EFAIL);
    }
    crate::process::with_current(|pcb| {
        let sig = signum as usize;
        let orig = if pcb.signals.get(sig).masked {
            SIGMASK_BLOCK
        } else {
            SIGMASK_UNBLOCK
        };
        match action {
            SIGMASK_NONE => {}
            SIGMASK_BLOCK => pcb.signals.set_masked(sig, true),
            SIGMASK_UNBLOCK => pcb.signals.set_masked(sig, false),
            _ => return Err(Errno::EFAIL),
        }
        Ok(orig)
    })
    .ok_or(Errno::EFAIL)?
}

pub fn sys_kill(pid: i32, signum: i32) -> Result<i32> {
    if signum < 0 || signum as usize >= NUM_SIGNALS {
        return Err(Errno::EFAIL);
    }
    crate::process::table::with_pcb(pid, |pcb| pcb.signals.raise(signum as usize))
        .ok_or(Errno::EFAIL)?;
    crate::process::scheduler::wake(pid);
    Ok(0)
}

pub fn sys_sigreturn(signum: i32, user_regs_addr: u32, regs: &mut IntRegs) -> Result<i32> {
    crate::process::with_current(|pcb| sigreturn_frame(&mut pcb.signals, signum, user_regs_addr, regs))
        .ok_or(Errno::EFAIL)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{EFLAGS_BASE, EFLAGS_IF};
    use crate::mm::USER_BASE;
    use pretty_assertions::assert_eq;

    fn user_frame(eip: u32, esp: u32, eax: u32) -> IntRegs {
        let mut regs = IntRegs::default();
        regs.eip = eip;
        regs.esp = esp;
        regs.eax = eax;
        regs.cs = USER_CS;
        regs.ds = USER_DS;
        regs.es = USER_DS;
        regs.fs = USER_DS;
        regs.gs = USER_DS;
        regs.ss = USER_DS;
        regs.eflags = EFLAGS_IF | EFLAGS_BASE;
        regs
    }

    #[test]
    fn delivery_detours_into_handler_and_sigreturn_restores() {
        let mut signals = SignalTable::new();
        let handler = USER_BASE + 0x9000;
        signals.set_handler(SIG_INTERRUPT, handler);
        signals.raise(SIG_INTERRUPT);

        let esp0 = USER_BASE + 0x10_0000;
        let mut regs = user_frame(USER_BASE + 0x8000, esp0, 0x55AA);
        let original = regs;

        assert_eq!(handle_table(&mut signals, &mut regs), None);

        // Frame rewritten to enter the handler
        assert_eq!(regs.eip, handler);
        assert_eq!(regs.esp, esp0 - SIGFRAME_LEN as u32);
        assert!(signals.get(SIG_INTERRUPT).masked);
        assert!(!signals.get(SIG_INTERRUPT).pending);

        // The handler finds the signal number as its first argument
        let arg: u32 = uaccess::read_user(regs.esp + 4).unwrap();
        assert_eq!(arg, SIG_INTERRUPT as u32);

        // The return address points at the trampoline, whose code invokes
        // int 0x80 with the sigreturn number and the saved frame address
        let ret_addr: u32 = uaccess::read_user(regs.esp).unwrap();
        assert_eq!(ret_addr, esp0 - TRAMPOLINE_LEN as u32);
        let mut code = [0u8; TRAMPOLINE_LEN];
        assert!(uaccess::copy_from_user(&mut code, ret_addr));
        assert_eq!(code[0], 0xB8);
        assert_eq!(
            u32::from_le_bytes(code[1..5].try_into().unwrap()),
            crate::syscall::SYS_SIGRETURN as u32
        );
        assert_eq!(code[5], 0xBB);
        assert_eq!(
            u32::from_le_bytes(code[6..10].try_into().unwrap()),
            SIG_INTERRUPT as u32
        );
        assert_eq!(&code[15..17], &[0xCD, 0x80]);
        let regs_addr = u32::from_le_bytes(code[11..15].try_into().unwrap());

        // sigreturn: restores the original context and clears the mask
        let mut kregs = regs;
        kregs.eax = crate::syscall::SYS_SIGRETURN as u32;
        let ret = sigreturn_frame(&mut signals, SIG_INTERRUPT as i32, regs_addr, &mut kregs);
        assert_eq!(ret, Ok(original.eax as i32));
        assert_eq!(kregs.eip, original.eip);
        assert_eq!(kregs.esp, original.esp);
        assert_eq!(kregs.eax, original.eax);
        assert!(!signals.get(SIG_INTERRUPT).masked);
    }

    #[test]
    fn sigreturn_cannot_elevate_privilege() {
        let mut signals = SignalTable::new();
        let addr = USER_BASE + 0x4000;
        let mut forged = user_frame(USER_BASE + 0x8000, USER_BASE + 0x20000, 1);
        forged.cs = crate::arch::KERNEL_CS;
        forged.ss = crate::arch::KERNEL_DS;
        forged.eflags = 0xFFFF_FFFF;
        assert!(uaccess::write_user(addr, &forged));

        let mut kregs = user_frame(USER_BASE + 0x8000, USER_BASE + 0x20000, 2);
        let kernel_eflags = kregs.eflags;
        sigreturn_frame(&mut signals, SIG_USER1 as i32, addr, &mut kregs).unwrap();

        assert_eq!(kregs.cs, USER_CS);
        assert_eq!(kregs.ss, USER_DS);
        // Privileged bits stay at their kernel values, user bits obeyed
        assert_eq!(kregs.eflags & !EFLAGS_USER, kernel_eflags & !EFLAGS_USER);
        assert_eq!(kregs.eflags & EFLAGS_USER, EFLAGS_USER);
    }

    #[test]
    fn masked_handler_falls_back_to_default_action() {
        let mut signals = SignalTable::new();
        signals.set_handler(SIG_INTERRUPT, USER_BASE + 0x9000);
        signals.set_masked(SIG_INTERRUPT, true);
        signals.raise(SIG_INTERRUPT);

        let mut regs = user_frame(USER_BASE + 0x8000, USER_BASE + 0x10000, 0);
        assert_eq!(handle_table(&mut signals, &mut regs), Some(EXIT_INTERRUPT));
    }

    #[test]
    fn ignored_signals_are_cleared_and_scan_continues() {
        let mut signals = SignalTable::new();
        signals.raise(SIG_ALARM);
        signals.raise(SIG_USER1);
        let handler = USER_BASE + 0x9000;
        signals.set_handler(SIG_PIPE, handler);
        signals.raise(SIG_PIPE);

        let mut regs = user_frame(USER_BASE + 0x8000, USER_BASE + 0x10000, 0);
        assert_eq!(handle_table(&mut signals, &mut regs), None);

        // ALARM and USER1 had no handler and a no-op default: cleared
        assert!(!signals.get(SIG_ALARM).pending);
        assert!(!signals.get(SIG_USER1).pending);
        // PIPE was delivered
        assert_eq!(regs.eip, handler);
    }

    #[test]
    fn exceptions_kill_with_exit_code_256() {
        let mut signals = SignalTable::new();
        signals.raise(SIG_SEGFAULT);
        let mut regs = user_frame(USER_BASE + 0x8000, USER_BASE + 0x10000, 0);
        assert_eq!(handle_table(&mut signals, &mut regs), Some(EXIT_EXCEPTION));
    }

    #[test]
    fn no_stack_room_kills_the_process() {
        let mut signals = SignalTable::new();
        signals.set_handler(SIG_USER1, USER_BASE + 0x9000);
        signals.raise(SIG_USER1);

        // ESP below the user page: the frame cannot be pushed
        let mut regs = user_frame(USER_BASE + 0x8000, 0x40, 0);
        assert_eq!(handle_table(&mut signals, &mut regs), Some(EXIT_EXCEPTION));
    }

    #[test]
    fn deliverability_honours_masks_and_defaults() {
        let mut signals = SignalTable::new();
        assert!(!signals.has_deliverable());

        // Killing default action counts even without a handler
        signals.raise(SIG_INTERRUPT);
        assert!(signals.has_deliverable());

        let mut signals = SignalTable::new();
        signals.raise(SIG_USER1);
        // Ignored default, no handler: nothing to deliver
        assert!(!signals.has_deliverable());
        signals.set_handler(SIG_USER1, USER_BASE);
        assert!(signals.has_deliverable());
        signals.set_masked(SIG_USER1, true);
        assert!(!signals.has_deliverable());
    }
}
