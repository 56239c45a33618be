// Anonymous pipes.
//
// A fixed 8 KiB ring with one sentinel slot sits between two file objects,
// one opened for reading and one for writing. Readers drain from the tail,
// writers fill at the head; each side wakes the other's wait queue after
// making progress. Closing one end half-closes the pipe so the survivor
// observes EOF or EPIPE; the state is freed when both ends are gone.

use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Mutex;

use crate::error::{Errno, Result};
use crate::process::wait::{wait_interruptible, WaitNode, WaitQueue};
use crate::vfs::file::{FileKind, FileObj, OpenMode, PipeEnd};

/// Usable capacity in bytes.
pub const PIPE_CAPACITY: usize = 8192;

/// Ring storage; one slot stays empty to distinguish full from empty.
const PIPE_SIZE: usize = PIPE_CAPACITY + 1;

struct PipeInner {
    head: usize,
    tail: usize,
    half_closed: bool,
    buf: Box<[u8; PIPE_SIZE]>,
}

pub struct PipeState {
    inner: Mutex<PipeInner>,
    read_queue: Arc<WaitQueue>,
    write_queue: Arc<WaitQueue>,
}

impl PipeState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PipeInner {
                head: 0,
                tail: 0,
                half_closed: false,
                buf: Box::new([0; PIPE_SIZE]),
            }),
            read_queue: WaitQueue::new(),
            write_queue: WaitQueue::new(),
        })
    }
}

impl PipeInner {
    /// Bytes that a read of `nbytes` could drain right now. 0 means EOF
    /// (empty with the write end closed), EAGAIN means empty but open.
    fn readable_bytes(&self, nbytes: usize) -> Result<i32> {
        if nbytes == 0 {
            return Ok(0);
        }
        let mut head = self.head;
        if head < self.tail {
            head += PIPE_SIZE;
        }
        let live = head - self.tail;
        if live > 0 {
            return Ok(live.min(nbytes) as i32);
        }
        if self.half_closed {
            return Ok(0);
        }
        Err(Errno::EAGAIN)
    }

    /// Bytes that a write of `nbytes` could append right now. EPIPE when
    /// the read end is closed, EAGAIN when full.
    fn writable_bytes(&self, nbytes: usize) -> Result<i32> {
        if nbytes == 0 {
            return Ok(0);
        }
        if self.half_closed {
            return Err(Errno::EPIPE);
        }
        let mut tail = self.tail;
        if tail <= self.head {
            tail += PIPE_SIZE;
        }
        let free = tail - 1 - self.head;
        if free > 0 {
            return Ok(free.min(nbytes) as i32);
        }
        Err(Errno::EAGAIN)
    }
}

/// Drain data from the pipe into `buf`.
pub fn read(state: &Arc<PipeState>, nonblocking: bool, buf: &mut [u8]) -> Result<i32> {
    let nbytes = wait_interruptible(Some(&state.read_queue), nonblocking, || {
        crate::arch::without_interrupts(|| state.inner.lock().readable_bytes(buf.len()))
    })?;
    if nbytes == 0 {
        return Ok(0);
    }

    crate::arch::without_interrupts(|| {
        let mut inner = state.inner.lock();
        // At most two chunks: tail to end of storage, then start to head
        let mut total = 0usize;
        let mut remaining = nbytes as usize;
        while remaining > 0 {
            let chunk = remaining.min(PIPE_SIZE - inner.tail);
            let tail = inner.tail;
            buf[total..total + chunk].copy_from_slice(&inner.buf[tail..tail + chunk]);
            total += chunk;
            remaining -= chunk;
            inner.tail = (inner.tail + chunk) % PIPE_SIZE;
        }
    });

    // Space opened up; let writers retry
    state.write_queue.wake();
    Ok(nbytes)
}

/// Append data from `buf` into the pipe.
pub fn write(state: &Arc<PipeState>, nonblocking: bool, buf: &[u8]) -> Result<i32> {
    let nbytes = wait_interruptible(Some(&state.write_queue), nonblocking, || {
        crate::arch::without_interrupts(|| state.inner.lock().writable_bytes(buf.len()))
    })
    .map_err(|e| {
        if e == Errno::EPIPE {
            crate::process::signal::raise_executing(crate::process::signal::SIG_PIPE);
        }
        e
    })?;
    if nbytes == 0 {
        return Ok(0);
    }

    crate::arch::without_interrupts(|| {
        let mut inner = state.inner.lock();
        let mut total = 0usize;
        let mut remaining = nbytes as usize;
        while remaining > 0 {
            let chunk = remaining.min(PIPE_SIZE - inner.head);
            let head = inner.head;
            inner.buf[head..head + chunk].copy_from_slice(&buf[total..total + chunk]);
            total += chunk;
            remaining -= chunk;
            inner.head = (inner.head + chunk) % PIPE_SIZE;
        }
    });

    // Data arrived; let readers retry
    state.read_queue.wake();
    Ok(nbytes)
}

/// Close one end. The first close half-closes and wakes both sides so the
/// survivor observes EOF/EPIPE; dropping the second file object releases
/// the shared state itself.
pub fn close_end(state: &Arc<PipeState>, _end: PipeEnd) {
    let already_half = crate::arch::without_interrupts(|| {
        let mut inner = state.inner.lock();
        if inner.half_closed {
            true
        } else {
            inner.half_closed = true;
            false
        }
    });
    if !already_half {
        state.read_queue.wake();
        state.write_queue.wake();
    }
}

/// poll() handler: report and register both directions.
pub fn poll(
    state: &Arc<PipeState>,
    read_node: Option<&mut WaitNode>,
    write_node: Option<&mut WaitNode>,
) -> Result<u8> {
    let (readable, writable) = crate::arch::without_interrupts(|| {
        let inner = state.inner.lock();
        (
            inner.readable_bytes(usize::MAX),
            inner.writable_bytes(usize::MAX),
        )
    });

    let mut revents = 0u8;
    revents |= crate::vfs::poll::poll_register(readable, &state.read_queue, read_node, OpenMode::READ);
    revents |=
        crate::vfs::poll::poll_register(writable, &state.write_queue, write_node, OpenMode::WRITE);
    Ok(revents)
}

/// Create the two endpoint file objects of a fresh pipe.
pub fn create() -> (Arc<FileObj>, Arc<FileObj>) {
    let state = PipeState::new();
    let read_file = FileObj::new(
        FileKind::Pipe {
            end: PipeEnd::Read,
            state: state.clone(),
        },
        OpenMode::READ,
    );
    let write_file = FileObj::new(
        FileKind::Pipe {
            end: PipeEnd::Write,
            state,
        },
        OpenMode::WRITE,
    );
    (read_file, write_file)
}

/// pipe() syscall: bind both ends and hand the descriptors to the caller.
pub fn sys_pipe(readfd_addr: u32, writefd_addr: u32) -> Result<i32> {
    let (read_file, write_file) = create();

    let bound = crate::process::with_current(|pcb| {
        let readfd = pcb.files.bind(-1, read_file.clone())?;
        let writefd = match pcb.files.bind(-1, write_file.clone()) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = pcb.files.unbind(readfd);
                return Err(e);
            }
        };
        Ok((readfd, writefd))
    })
    .ok_or(Errno::EFAIL)?;
    let (readfd, writefd) = bound?;

    if !crate::syscall::uaccess::write_user(readfd_addr, &readfd)
        || !crate::syscall::uaccess::write_user(writefd_addr, &writefd)
    {
        let _ = crate::process::with_current(|pcb| {
            let _ = pcb.files.unbind(readfd);
            let _ = pcb.files.unbind(writefd);
        });
        return Err(Errno::EFAIL);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn nonblocking_pipe() -> (Arc<FileObj>, Arc<FileObj>) {
        let (r, w) = create();
        r.set_nonblocking(true);
        w.set_nonblocking(true);
        (r, w)
    }

    #[test]
    fn round_trip_then_eof() {
        let (r, w) = nonblocking_pipe();
        let message = b"Hello, pipe!\n";
        assert_eq!(w.write(message), Ok(13));

        drop(w); // close the write end

        let mut buf = [0u8; 64];
        assert_eq!(r.read(&mut buf), Ok(13));
        assert_eq!(&buf[..13], message);
        // Drained and half-closed: EOF
        assert_eq!(r.read(&mut buf), Ok(0));
    }

    #[test]
    fn backpressure_at_capacity() {
        let (r, w) = nonblocking_pipe();
        let block = [0x42u8; PIPE_CAPACITY];
        assert_eq!(w.write(&block), Ok(PIPE_CAPACITY as i32));
        // Full: a nonblocking write reports EAGAIN
        assert_eq!(w.write(&[0x42]), Err(Errno::EAGAIN));

        let mut buf = [0u8; 4096];
        assert_eq!(r.read(&mut buf), Ok(4096));
        assert!(buf.iter().all(|&b| b == 0x42));

        // Space for exactly 4096 more
        assert_eq!(w.write(&block[..4096]), Ok(4096));
        assert_eq!(w.write(&[0x42]), Err(Errno::EAGAIN));
    }

    #[test]
    fn ring_wraparound_preserves_bytes() {
        let (r, w) = nonblocking_pipe();
        let mut pattern = [0u8; PIPE_CAPACITY + 1];
        for (i, b) in pattern.iter_mut().enumerate() {
            *b = i as u8;
        }

        assert_eq!(
            w.write(&pattern[..PIPE_CAPACITY / 2]),
            Ok((PIPE_CAPACITY / 2) as i32)
        );
        let mut buf = [0u8; PIPE_CAPACITY + 1];
        assert_eq!(r.read(&mut buf), Ok((PIPE_CAPACITY / 2) as i32));
        assert_eq!(&buf[..PIPE_CAPACITY / 2], &pattern[..PIPE_CAPACITY / 2]);

        // Head and tail are now mid-ring; a full-capacity write wraps
        assert_eq!(w.write(&pattern), Ok(PIPE_CAPACITY as i32));
        assert_eq!(r.read(&mut buf), Ok(PIPE_CAPACITY as i32));
        assert_eq!(&buf[..PIPE_CAPACITY], &pattern[..PIPE_CAPACITY]);
    }

    #[test]
    fn byte_conservation_over_interleaved_io() {
        let (r, w) = nonblocking_pipe();
        let mut written = 0usize;
        let mut read_back = 0usize;
        let chunk = [7u8; 1000];
        let mut buf = [0u8; 600];
        for _ in 0..50 {
            if let Ok(n) = w.write(&chunk) {
                written += n as usize;
            }
            if let Ok(n) = r.read(&mut buf) {
                read_back += n as usize;
            }
        }
        drop(w);
        loop {
            match r.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => read_back += n as usize,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
        assert_eq!(written, read_back);
    }

    #[test]
    fn write_after_reader_close_is_epipe() {
        let (r, w) = nonblocking_pipe();
        drop(r);
        assert_eq!(w.write(b"x"), Err(Errno::EPIPE));
    }

    #[test]
    fn empty_open_pipe_read_would_block() {
        let (r, _w) = nonblocking_pipe();
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf), Err(Errno::EAGAIN));
        // Zero-length read succeeds without data
        assert_eq!(r.read(&mut []), Ok(0));
    }

    #[test]
    fn poll_reflects_ring_state_and_registers_nodes() {
        let (r, w) = nonblocking_pipe();
        let (FileKind::Pipe { state, .. }, FileKind::Pipe { state: wstate, .. }) =
            (&r.kind, &w.kind)
        else {
            unreachable!();
        };
        assert!(Arc::ptr_eq(state, wstate));

        // A pid far outside the table, so queue wakes are no-ops
        let mut rnode = WaitNode::new(0x40_0000);
        let mut wnode = WaitNode::new(0x40_0000);
        // Empty pipe: only write-ready
        let revents = poll(state, Some(&mut rnode), Some(&mut wnode)).unwrap();
        assert_eq!(revents, OpenMode::WRITE.bits());
        assert!(rnode.is_linked() && wnode.is_linked());

        // One byte makes it read-ready too; nodes stay registered
        w.write(&[1]).unwrap();
        let revents = poll(state, Some(&mut rnode), Some(&mut wnode)).unwrap();
        assert_eq!(revents, (OpenMode::READ | OpenMode::WRITE).bits());

        // Closing the write end keeps read-ready set (EOF is observable)
        drop(w);
        let revents = poll(state, Some(&mut rnode), None).unwrap();
        assert_eq!(revents & OpenMode::READ.bits(), OpenMode::READ.bits());
    }
}
