// System call dispatch.
//
// Software interrupt 0x80: number in EAX, arguments in EBX, ECX, EDX, ESI,
// EDI, result back in the frame's EAX slot as a non-negative value or a
// negated errno. Calls that manipulate the frame itself (fork, exec,
// sigreturn) receive it as an extra argument.

pub mod uaccess;

use crate::arch::IntRegs;
use crate::error::{Errno, Result};

pub const SYS_HALT: i32 = 1;
pub const SYS_EXECUTE: i32 = 2;
pub const SYS_READ: i32 = 3;
pub const SYS_WRITE: i32 = 4;
pub const SYS_OPEN: i32 = 5;
pub const SYS_CLOSE: i32 = 6;
pub const SYS_GETARGS: i32 = 7;
pub const SYS_VIDMAP: i32 = 8;
pub const SYS_SIGACTION: i32 = 9;
pub const SYS_SIGRETURN: i32 = 10;
pub const SYS_SIGMASK: i32 = 11;
pub const SYS_KILL: i32 = 12;
pub const SYS_IOCTL: i32 = 13;
pub const SYS_TIME: i32 = 14;
pub const SYS_SBRK: i32 = 15;
pub const SYS_SOCKET: i32 = 16;
pub const SYS_BIND: i32 = 17;
pub const SYS_CONNECT: i32 = 18;
pub const SYS_LISTEN: i32 = 19;
pub const SYS_ACCEPT: i32 = 20;
pub const SYS_RECVFROM: i32 = 21;
pub const SYS_SENDTO: i32 = 22;
pub const SYS_GETSOCKNAME: i32 = 23;
pub const SYS_GETPEERNAME: i32 = 24;
pub const SYS_DUP: i32 = 25;
pub const SYS_FORK: i32 = 26;
pub const SYS_EXEC: i32 = 27;
pub const SYS_WAIT: i32 = 28;
pub const SYS_GETPID: i32 = 29;
pub const SYS_GETPGRP: i32 = 30;
pub const SYS_SETPGRP: i32 = 31;
pub const SYS_TCGETPGRP: i32 = 32;
pub const SYS_TCSETPGRP: i32 = 33;
pub const SYS_PIPE: i32 = 34;
pub const SYS_CREATE: i32 = 35;
pub const SYS_MONOTIME: i32 = 36;
pub const SYS_MONOSLEEP: i32 = 37;
pub const SYS_POLL: i32 = 38;
pub const NUM_SYSCALL: i32 = 38;

/// Trap handler body: dispatch and write the result into the frame.
pub fn handle(regs: &mut IntRegs) {
    let num = regs.eax as i32;
    let (a, b, c, d, _e) = (regs.ebx, regs.ecx, regs.edx, regs.esi, regs.edi);

    #[cfg(feature = "syscall-verbose")]
    crate::debug!(
        "syscall {} ({:#x}, {:#x}, {:#x}, {:#x}, {:#x})",
        num,
        a,
        b,
        c,
        d,
        _e
    );

    let result = dispatch(num, a, b, c, d, _e, regs);
    regs.eax = match result {
        Ok(value) => value as u32,
        Err(e) => e.as_i32() as u32,
    };
}

fn dispatch(num: i32, a: u32, b: u32, c: u32, d: u32, _e: u32, regs: &mut IntRegs) -> Result<i32> {
    match num {
        SYS_HALT => crate::process::lifecycle::sys_halt(a),
        SYS_EXECUTE => crate::process::exec::sys_execute(a),
        SYS_READ => crate::vfs::sys_read(a as i32, b, c as i32),
        SYS_WRITE => crate::vfs::sys_write(a as i32, b, c as i32),
        SYS_OPEN => crate::vfs::sys_open(a),
        SYS_CLOSE => crate::vfs::sys_close(a as i32),
        SYS_GETARGS => crate::process::sys_getargs(a, b as i32),
        SYS_VIDMAP => crate::process::sys_vidmap(a),
        SYS_SIGACTION => crate::process::signal::sys_sigaction(a as i32, b),
        SYS_SIGRETURN => crate::process::signal::sys_sigreturn(a as i32, b, regs),
        SYS_SIGMASK => crate::process::signal::sys_sigmask(a as i32, b as i32),
        SYS_KILL => crate::process::signal::sys_kill(a as i32, b as i32),
        SYS_IOCTL => crate::vfs::sys_ioctl(a as i32, b as i32, c),
        SYS_TIME => crate::time::sys_time(),
        SYS_SBRK => crate::process::sys_sbrk(a as i32, b),
        SYS_SOCKET => crate::net::socket::sys_socket(a as i32),
        SYS_BIND => crate::net::socket::sys_bind(a as i32, b),
        SYS_CONNECT | SYS_LISTEN | SYS_ACCEPT | SYS_GETPEERNAME => {
            crate::net::socket::sys_unsupported_stream_op(a as i32)
        }
        SYS_RECVFROM => crate::net::socket::sys_recvfrom(a as i32, b, c as i32, d),
        SYS_SENDTO => crate::net::socket::sys_sendto(a as i32, b, c as i32, d),
        SYS_GETSOCKNAME => crate::net::socket::sys_getsockname(a as i32, b),
        SYS_DUP => crate::vfs::sys_dup(a as i32, b as i32),
        SYS_FORK => crate::process::fork::sys_fork(regs),
        SYS_EXEC => crate::process::exec::sys_exec(a, regs),
        SYS_WAIT => crate::process::lifecycle::sys_wait(a),
        SYS_GETPID => crate::process::sys_getpid(),
        SYS_GETPGRP => crate::process::sys_getpgrp(),
        SYS_SETPGRP => crate::process::sys_setpgrp(a as i32, b as i32),
        SYS_TCGETPGRP => crate::process::sys_tcgetpgrp(),
        SYS_TCSETPGRP => crate::process::sys_tcsetpgrp(a as i32),
        SYS_PIPE => crate::vfs::pipe::sys_pipe(a, b),
        SYS_CREATE => crate::vfs::sys_create(a, b),
        SYS_MONOTIME => crate::time::sys_monotime(a),
        SYS_MONOSLEEP => crate::time::sys_monosleep(a),
        SYS_POLL => crate::vfs::poll::sys_poll(a, b as i32, c),
        _ => {
            crate::debug!("unknown syscall number {}", num);
            Err(Errno::EFAIL)
        }
    }
}
