// The poll() syscall.
//
// Two wait nodes per file (read and write) are handed to each file's poll
// handler, which registers them in its internal queues and reports the
// directions that would not block. If nothing is ready the caller sleeps
// until a device wake, the absolute deadline, or a signal. Wakeups may be
// spurious; the loop re-checks every file each round.

use crate::error::{Errno, Result};
use crate::process::wait::{WaitNode, WaitQueue};
use crate::syscall::uaccess;
use crate::vfs::file::{OpenMode, MAX_FILES};
use alloc::sync::Arc;

/// Entry layout shared with userspace.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PollFd {
    pub fd: i32,
    pub events: u16,
    pub revents: u16,
}

/// Shared helper for device poll handlers: register `node` in `queue` (if
/// supplied and not already linked) and translate a readiness probe into
/// the event bit.
pub(crate) fn poll_register(
    ready: Result<i32>,
    queue: &Arc<WaitQueue>,
    node: Option<&mut WaitNode>,
    bit: OpenMode,
) -> u8 {
    let Some(node) = node else {
        return 0;
    };
    if !node.is_linked() {
        node.link(queue);
    }
    if matches!(ready, Err(Errno::EAGAIN)) {
        0
    } else {
        bit.bits()
    }
}

/// Poll handler for files that are always readable.
pub(crate) fn generic_rdonly(_read_node: Option<&mut WaitNode>, _write_node: Option<&mut WaitNode>) -> u8 {
    OpenMode::READ.bits()
}

/// Poll handler for files that are always readable and writable.
pub(crate) fn generic_rdwr(_read_node: Option<&mut WaitNode>, _write_node: Option<&mut WaitNode>) -> u8 {
    (OpenMode::READ | OpenMode::WRITE).bits()
}

fn poll_impl(pfds: &mut [PollFd], timeout: Option<u64>) -> Result<i32> {
    let pid = crate::process::current_pid();
    let mut nodes: [(WaitNode, WaitNode); MAX_FILES] =
        core::array::from_fn(|_| (WaitNode::new(pid), WaitNode::new(pid)));

    loop {
        let mut ready = 0;
        for (pfd, (read_node, write_node)) in pfds.iter_mut().zip(nodes.iter_mut()) {
            let file = crate::process::with_current(|pcb| pcb.files.get(pfd.fd))
                .flatten()
                .ok_or_else(|| {
                    crate::debug!("attempting to poll invalid fd {}", pfd.fd);
                    Errno::EFAIL
                })?;

            let rdwr = (OpenMode::READ | OpenMode::WRITE).bits() as u16;
            if pfd.events & !rdwr != 0 {
                crate::debug!("invalid poll event bits {:#x}", pfd.events);
                return Err(Errno::EFAIL);
            }

            // Operations the open mode does not permit are not observed
            let events = pfd.events as u8 & file.mode.bits();
            let read_node = (events & OpenMode::READ.bits() != 0).then_some(&mut *read_node);
            let write_node = (events & OpenMode::WRITE.bits() != 0).then_some(&mut *write_node);

            let revents = file.poll(read_node, write_node)? & file.mode.bits();
            pfd.revents = revents as u16;
            if revents != 0 {
                ready += 1;
            }
        }

        if ready > 0 {
            return Ok(ready);
        }
        if let Some(deadline) = timeout {
            if crate::time::monotime_now() >= deadline {
                return Ok(0);
            }
        }
        if crate::process::signal::has_pending_current() {
            return Err(Errno::EINTR);
        }

        match timeout {
            Some(deadline) => crate::process::scheduler::sleep_until(deadline),
            None => crate::process::scheduler::sleep(),
        }
    }
    // All wait nodes are unlinked by their Drop, on every exit path
}

/// poll() syscall handler. `timeout_addr` points at an absolute monotonic
/// nanosecond deadline, or is null for no timeout.
pub fn sys_poll(pfds_addr: u32, nfds: i32, timeout_addr: u32) -> Result<i32> {
    if nfds <= 0 || nfds as usize > MAX_FILES {
        crate::debug!("invalid value for nfds: {}", nfds);
        return Err(Errno::EFAIL);
    }
    let nfds = nfds as usize;

    let mut kpfds = [PollFd::default(); MAX_FILES];
    for (i, pfd) in kpfds.iter_mut().take(nfds).enumerate() {
        let addr = pfds_addr.wrapping_add((i * core::mem::size_of::<PollFd>()) as u32);
        *pfd = uaccess::read_user(addr).ok_or(Errno::EFAIL)?;
    }

    let timeout = if timeout_addr != 0 {
        let deadline: i64 = uaccess::read_user(timeout_addr).ok_or(Errno::EFAIL)?;
        Some(deadline.max(0) as u64)
    } else {
        None
    };

    let ret = poll_impl(&mut kpfds[..nfds], timeout)?;

    for (i, pfd) in kpfds.iter().take(nfds).enumerate() {
        let addr = pfds_addr.wrapping_add((i * core::mem::size_of::<PollFd>()) as u32);
        if !uaccess::write_user(addr, pfd) {
            return Err(Errno::EFAIL);
        }
    }
    Ok(ret)
}
