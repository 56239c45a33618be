// Process management.

pub mod exec;
pub mod fork;
pub mod lifecycle;
pub mod pcb;
pub mod scheduler;
pub mod signal;
pub mod table;
pub mod timer;
pub mod wait;

pub use pcb::{Pcb, Pid, ProcessState};
pub use table::{current_pid, init, with_current, MAX_PROCESSES};

use crate::error::{Errno, Result};
use crate::syscall::uaccess;

pub fn sys_getpid() -> Result<i32> {
    with_current(|pcb| pcb.pid).ok_or(Errno::EFAIL)
}

pub fn sys_getpgrp() -> Result<i32> {
    with_current(|pcb| pcb.pgrp).ok_or(Errno::EFAIL)
}

/// setpgrp(pid, pgrp): move a process into a group. A pid of 0 means the
/// caller; a pgrp of 0 creates a group named after the target pid.
pub fn sys_setpgrp(pid: i32, pgrp: i32) -> Result<i32> {
    if pgrp < 0 {
        return Err(Errno::EFAIL);
    }
    let target = if pid == 0 { current_pid() } else { pid };
    let pgrp = if pgrp == 0 { target } else { pgrp };
    table::with_pcb(target, |pcb| pcb.pgrp = pgrp).ok_or(Errno::EFAIL)?;
    Ok(0)
}

/// tcgetpgrp(): foreground group of the caller's terminal.
pub fn sys_tcgetpgrp() -> Result<i32> {
    let terminal = with_current(|pcb| pcb.terminal).ok_or(Errno::EFAIL)?;
    Ok(crate::drivers::terminal::fg_pgrp(terminal))
}

/// tcsetpgrp(pgrp): hand the caller's terminal to a process group.
pub fn sys_tcsetpgrp(pgrp: i32) -> Result<i32> {
    if pgrp < 0 {
        return Err(Errno::EFAIL);
    }
    let terminal = with_current(|pcb| pcb.terminal).ok_or(Errno::EFAIL)?;
    crate::drivers::terminal::set_fg_pgrp(terminal, pgrp);
    Ok(0)
}

/// getargs(buf, nbytes): copy the NUL-terminated argument string. Fails
/// when the process has no arguments or they do not fit.
pub fn sys_getargs(buf_addr: u32, nbytes: i32) -> Result<i32> {
    if nbytes < 0 {
        return Err(Errno::EFAIL);
    }
    let args =
        with_current(|pcb| pcb.args.clone()).ok_or(Errno::EFAIL)?;
    if args.is_empty() {
        return Err(Errno::EFAIL);
    }
    if args.len() + 1 > nbytes as usize {
        return Err(Errno::EFAIL);
    }
    if !uaccess::copy_to_user(buf_addr, args.as_bytes())
        || !uaccess::copy_to_user(buf_addr + args.len() as u32, &[0])
    {
        return Err(Errno::EFAIL);
    }
    Ok(0)
}

/// vidmap(screen_start): map the vidmap page and write its address through
/// the out pointer.
pub fn sys_vidmap(out_addr: u32) -> Result<i32> {
    let terminal = with_current(|pcb| pcb.terminal).ok_or(Errno::EFAIL)?;
    if !uaccess::write_user(out_addr, &crate::mm::VIDMAP_BASE) {
        return Err(Errno::EFAIL);
    }
    crate::mm::map_vidmap(terminal);
    with_current(|pcb| pcb.flags |= pcb::PcbFlags::VIDMAP).ok_or(Errno::EFAIL)?;
    Ok(0)
}

/// sbrk(delta, orig_brk): move the program break inside the user page and
/// report the previous break through the out pointer.
pub fn sys_sbrk(delta: i32, out_addr: u32) -> Result<i32> {
    let old = with_current(|pcb| {
        let old = pcb.heap.brk_current;
        let new = old as i64 + delta as i64;
        if new < pcb.heap.brk_base as i64 || new > crate::mm::BRK_CEILING as i64 {
            return Err(Errno::EFAIL);
        }
        pcb.heap.brk_current = new as u32;
        Ok(old)
    })
    .ok_or(Errno::EFAIL)??;

    if !uaccess::write_user(out_addr, &old) {
        // Undo the move so a bad pointer has no side effects
        let _ = with_current(|pcb| pcb.heap.brk_current = old);
        return Err(Errno::EFAIL);
    }
    Ok(0)
}
