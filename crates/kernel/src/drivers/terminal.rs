// Virtual terminals.
//
// Keyboard input (fed by the PS/2 collaborator) is line-disciplined: a line
// under edit can be erased with backspace and becomes readable only once
// committed with Enter. Reads drain at most one line. Ctrl-C raises
// INTERRUPT on the foreground process group of the active terminal.

use alloc::sync::Arc;
use spin::Mutex;

use crate::error::{Errno, Result};
use crate::process::wait::{wait_interruptible, WaitNode, WaitQueue};
use crate::process::Pid;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

pub const NUM_TERMINALS: usize = 3;

/// Size of the line currently being edited.
const LINE_LEN: usize = 128;

/// Committed input not yet consumed by readers.
const COOKED_LEN: usize = 512;

struct TermInput {
    pending: heapless::Vec<u8, LINE_LEN>,
    cooked: heapless::Deque<u8, COOKED_LEN>,
    /// Number of complete (newline-terminated) lines inside `cooked`.
    lines: usize,
}

pub struct Terminal {
    input: Mutex<TermInput>,
    read_queue: Arc<WaitQueue>,
    fg_pgrp: AtomicI32,
}

impl Terminal {
    fn new() -> Self {
        Self {
            input: Mutex::new(TermInput {
                pending: heapless::Vec::new(),
                cooked: heapless::Deque::new(),
                lines: 0,
            }),
            read_queue: WaitQueue::new(),
            fg_pgrp: AtomicI32::new(-1),
        }
    }
}

lazy_static::lazy_static! {
    static ref TERMINALS: [Terminal; NUM_TERMINALS] =
        [Terminal::new(), Terminal::new(), Terminal::new()];
}

static ACTIVE: AtomicUsize = AtomicUsize::new(0);

/// The terminal currently shown on screen (and receiving keyboard input).
pub fn active() -> usize {
    ACTIVE.load(Ordering::Relaxed)
}

/// Switch the visible terminal. Called by the keyboard collaborator.
pub fn set_active(terminal: usize) {
    if terminal < NUM_TERMINALS {
        ACTIVE.store(terminal, Ordering::Relaxed);
        #[cfg(target_arch = "x86")]
        crate::arch::x86::vga::console_show(terminal);
    }
}

fn current_terminal() -> usize {
    crate::process::with_current(|pcb| pcb.terminal).unwrap_or(0)
}

/// Feed one input character from the keyboard ISR into a terminal.
pub fn input_char(terminal: usize, ch: u8) {
    if terminal >= NUM_TERMINALS {
        return;
    }
    let term = &TERMINALS[terminal];

    // Ctrl-C interrupts the foreground group instead of entering the line
    if ch == 0x03 {
        let pgrp = term.fg_pgrp.load(Ordering::Relaxed);
        if pgrp >= 0 {
            crate::process::signal::raise_group(pgrp, crate::process::signal::SIG_INTERRUPT);
        }
        return;
    }

    let committed = crate::arch::without_interrupts(|| {
        let mut input = term.input.lock();
        match ch {
            0x08 => {
                let _ = input.pending.pop();
                false
            }
            b'\n' => {
                if input.cooked.len() + input.pending.len() + 1 > COOKED_LEN {
                    // Input overrun; drop the whole line
                    input.pending.clear();
                    return false;
                }
                let line: heapless::Vec<u8, LINE_LEN> = core::mem::take(&mut input.pending);
                for b in line {
                    let _ = input.cooked.push_back(b);
                }
                let _ = input.cooked.push_back(b'\n');
                input.lines += 1;
                true
            }
            _ => {
                let _ = input.pending.push(ch);
                false
            }
        }
    });

    crate::arch::console_write(terminal, &[ch]);
    if committed {
        term.read_queue.wake();
    }
}

fn readable_line(input: &mut TermInput, buf: &mut [u8]) -> Result<i32> {
    if buf.is_empty() {
        return Ok(0);
    }
    if input.lines == 0 {
        return Err(Errno::EAGAIN);
    }
    let mut n = 0usize;
    while n < buf.len() {
        let Some(b) = input.cooked.pop_front() else {
            break;
        };
        buf[n] = b;
        n += 1;
        if b == b'\n' {
            input.lines -= 1;
            break;
        }
    }
    Ok(n as i32)
}

/// Read one line (or up to `buf.len()` bytes of it) from the process's
/// terminal.
pub fn read(nonblocking: bool, buf: &mut [u8]) -> Result<i32> {
    let term = &TERMINALS[current_terminal()];
    wait_interruptible(Some(&term.read_queue), nonblocking, || {
        crate::arch::without_interrupts(|| readable_line(&mut term.input.lock(), buf))
    })
}

/// Render bytes on the process's terminal.
pub fn write(buf: &[u8]) -> Result<i32> {
    crate::arch::console_write(current_terminal(), buf);
    Ok(buf.len() as i32)
}

pub fn poll(read_node: Option<&mut WaitNode>, write_node: Option<&mut WaitNode>) -> Result<u8> {
    let term = &TERMINALS[current_terminal()];
    let readable = crate::arch::without_interrupts(|| {
        if term.input.lock().lines > 0 {
            Ok(1)
        } else {
            Err(Errno::EAGAIN)
        }
    });

    let mut revents =
        crate::vfs::poll::poll_register(readable, &term.read_queue, read_node, crate::vfs::file::OpenMode::READ);
    if write_node.is_some() {
        // Terminal output never blocks
        revents |= crate::vfs::file::OpenMode::WRITE.bits();
    }
    Ok(revents)
}

/// Foreground process group of the given terminal.
pub fn fg_pgrp(terminal: usize) -> Pid {
    TERMINALS[terminal].fg_pgrp.load(Ordering::Relaxed)
}

pub fn set_fg_pgrp(terminal: usize, pgrp: Pid) {
    TERMINALS[terminal].fg_pgrp.store(pgrp, Ordering::Relaxed);
}

#[cfg(test)]
pub fn reset() {
    for term in TERMINALS.iter() {
        let mut input = term.input.lock();
        input.pending.clear();
        input.cooked.clear();
        input.lines = 0;
        term.fg_pgrp.store(-1, Ordering::Relaxed);
    }
    ACTIVE.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn reads_wait_for_a_complete_line() {
        let _guard = test_utils::kernel_lock();
        let _pid = test_utils::install_process();

        let mut buf = [0u8; 32];
        for &b in b"ca" {
            input_char(0, b);
        }
        // Line not committed yet
        assert_eq!(read(true, &mut buf), Err(Errno::EAGAIN));

        input_char(0, 0x08); // erase the 'a'
        for &b in b"at\n" {
            input_char(0, b);
        }
        let n = read(true, &mut buf).unwrap();
        assert_eq!(&buf[..n as usize], b"cat\n");
        assert_eq!(read(true, &mut buf), Err(Errno::EAGAIN));
    }

    #[test]
    fn lines_queue_up_and_drain_one_per_read() {
        let _guard = test_utils::kernel_lock();
        let _pid = test_utils::install_process();

        for &b in b"one\ntwo\n" {
            input_char(0, b);
        }
        let mut buf = [0u8; 32];
        let n = read(true, &mut buf).unwrap();
        assert_eq!(&buf[..n as usize], b"one\n");
        let n = read(true, &mut buf).unwrap();
        assert_eq!(&buf[..n as usize], b"two\n");
    }

    #[test]
    fn ctrl_c_raises_interrupt_on_foreground_group() {
        let _guard = test_utils::kernel_lock();
        let pid = test_utils::install_process();
        crate::process::table::with_pcb(pid, |pcb| pcb.pgrp = pid).unwrap();
        set_fg_pgrp(0, pid);

        input_char(0, 0x03);
        let pending = crate::process::table::with_pcb(pid, |pcb| {
            pcb.signals
                .get(crate::process::signal::SIG_INTERRUPT)
                .pending
        })
        .unwrap();
        assert!(pending);
    }
}
