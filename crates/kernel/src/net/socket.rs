// Datagram sockets over the in-kernel loopback.
//
// Sockets are ordinary file objects: read/write map onto recv/send and
// poll observes the receive queue. Delivery matches the destination port
// against bound sockets; with no NIC collaborator every reachable address
// is loopback.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{Errno, Result};
use crate::process::wait::{wait_interruptible, WaitNode, WaitQueue};
use crate::syscall::uaccess;
use crate::vfs::file::{FileKind, FileObj, OpenMode};

/// Socket types of the socket() syscall.
pub const SOCK_TCP: i32 = 1;
pub const SOCK_UDP: i32 = 2;

/// Address structure shared with userspace.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SockAddr {
    pub ip: [u8; 4],
    pub port: u16,
}

const LOOPBACK: [u8; 4] = [127, 0, 0, 1];
const ANY: [u8; 4] = [0, 0, 0, 0];

/// Bound on queued datagrams per socket; senders beyond it see EAGAIN.
const RX_QUEUE_LEN: usize = 16;

struct Datagram {
    from: SockAddr,
    data: Vec<u8>,
}

pub struct SocketState {
    bound: Mutex<Option<SockAddr>>,
    rx: Mutex<VecDeque<Datagram>>,
    read_queue: Arc<WaitQueue>,
}

lazy_static::lazy_static! {
    static ref SOCKETS: Mutex<Vec<Weak<SocketState>>> = Mutex::new(Vec::new());
}

static NEXT_EPHEMERAL: Mutex<u16> = Mutex::new(49152);

fn new_socket() -> Arc<SocketState> {
    let sock = Arc::new(SocketState {
        bound: Mutex::new(None),
        rx: Mutex::new(VecDeque::new()),
        read_queue: WaitQueue::new(),
    });
    crate::arch::without_interrupts(|| {
        let mut sockets = SOCKETS.lock();
        sockets.retain(|w| w.strong_count() > 0);
        sockets.push(Arc::downgrade(&sock));
    });
    sock
}

/// Close hook: forget the registry entry.
pub fn close(sock: &Arc<SocketState>) {
    crate::arch::without_interrupts(|| {
        SOCKETS
            .lock()
            .retain(|w| w.upgrade().map_or(false, |s| !Arc::ptr_eq(&s, sock)));
    });
}

fn port_in_use(port: u16) -> bool {
    crate::arch::without_interrupts(|| {
        SOCKETS.lock().iter().any(|w| {
            w.upgrade()
                .and_then(|s| *s.bound.lock())
                .is_some_and(|a| a.port == port)
        })
    })
}

fn alloc_ephemeral_port() -> Result<u16> {
    for _ in 0..u16::MAX {
        let port = crate::arch::without_interrupts(|| {
            let mut next = NEXT_EPHEMERAL.lock();
            let port = *next;
            *next = next.checked_add(1).unwrap_or(49152);
            port
        });
        if !port_in_use(port) {
            return Ok(port);
        }
    }
    Err(Errno::EFAIL)
}

fn lookup_by_port(port: u16) -> Option<Arc<SocketState>> {
    crate::arch::without_interrupts(|| {
        SOCKETS.lock().iter().find_map(|w| {
            let sock = w.upgrade()?;
            let bound = *sock.bound.lock();
            if bound.is_some_and(|a| a.port == port) {
                Some(sock)
            } else {
                None
            }
        })
    })
}

fn bind_addr(sock: &Arc<SocketState>, mut addr: SockAddr) -> Result<()> {
    if addr.ip != LOOPBACK && addr.ip != ANY {
        crate::debug!("bind to non-loopback address with no NIC");
        return Err(Errno::EFAIL);
    }
    if addr.port == 0 {
        addr.port = alloc_ephemeral_port()?;
    } else if port_in_use(addr.port) {
        return Err(Errno::EFAIL);
    }
    let mut bound = sock.bound.lock();
    if bound.is_some() {
        return Err(Errno::EFAIL);
    }
    *bound = Some(addr);
    Ok(())
}

/// Deliver a datagram to whichever socket owns the destination port.
pub fn send(sock: &Arc<SocketState>, buf: &[u8], dest: Option<SockAddr>) -> Result<i32> {
    let Some(dest) = dest else {
        // Unconnected write with no destination
        return Err(Errno::EFAIL);
    };
    if dest.ip != LOOPBACK && dest.ip != ANY {
        return Err(Errno::EFAIL);
    }

    // Senders get a source address on first use
    let from = {
        let bound = *sock.bound.lock();
        match bound {
            Some(addr) => addr,
            None => {
                let addr = SockAddr {
                    ip: LOOPBACK,
                    port: alloc_ephemeral_port()?,
                };
                *sock.bound.lock() = Some(addr);
                addr
            }
        }
    };

    let target = lookup_by_port(dest.port).ok_or(Errno::EFAIL)?;
    let queued = crate::arch::without_interrupts(|| {
        let mut rx = target.rx.lock();
        if rx.len() >= RX_QUEUE_LEN {
            return Err(Errno::EAGAIN);
        }
        rx.push_back(Datagram {
            from,
            data: buf.to_vec(),
        });
        Ok(buf.len() as i32)
    })?;
    target.read_queue.wake();
    Ok(queued)
}

/// Receive one datagram, blocking while the queue is empty. The source
/// address is reported through `from_out` when requested.
pub fn recv(
    sock: &Arc<SocketState>,
    nonblocking: bool,
    buf: &mut [u8],
    mut from_out: Option<&mut SockAddr>,
) -> Result<i32> {
    wait_interruptible(Some(&sock.read_queue), nonblocking, || {
        crate::arch::without_interrupts(|| {
            let mut rx = sock.rx.lock();
            let Some(datagram) = rx.pop_front() else {
                return Err(Errno::EAGAIN);
            };
            let n = datagram.data.len().min(buf.len());
            buf[..n].copy_from_slice(&datagram.data[..n]);
            if let Some(out) = from_out.as_deref_mut() {
                *out = datagram.from;
            }
            Ok(n as i32)
        })
    })
}

pub fn poll(
    sock: &Arc<SocketState>,
    read_node: Option<&mut WaitNode>,
    write_node: Option<&mut WaitNode>,
) -> Result<u8> {
    let readable = crate::arch::without_interrupts(|| {
        if sock.rx.lock().is_empty() {
            Err(Errno::EAGAIN)
        } else {
            Ok(1)
        }
    });
    let mut revents =
        crate::vfs::poll::poll_register(readable, &sock.read_queue, read_node, OpenMode::READ);
    if write_node.is_some() {
        // Loopback delivery never blocks the sender for long
        revents |= OpenMode::WRITE.bits();
    }
    Ok(revents)
}

fn current_socket(fd: i32) -> Result<Arc<SocketState>> {
    let file = crate::process::with_current(|pcb| pcb.files.get(fd))
        .flatten()
        .ok_or(Errno::EFAIL)?;
    match &file.kind {
        FileKind::Socket(sock) => Ok(sock.clone()),
        _ => Err(Errno::EFAIL),
    }
}

// --- syscall handlers ---

pub fn sys_socket(sock_type: i32) -> Result<i32> {
    match sock_type {
        SOCK_UDP => {}
        SOCK_TCP => {
            crate::debug!("stream sockets need a NIC collaborator");
            return Err(Errno::EFAIL);
        }
        _ => return Err(Errno::EFAIL),
    }
    let file = FileObj::new(
        FileKind::Socket(new_socket()),
        OpenMode::READ | OpenMode::WRITE,
    );
    crate::process::with_current(|pcb| pcb.files.bind(-1, file)).ok_or(Errno::EFAIL)?
}

pub fn sys_bind(fd: i32, addr_addr: u32) -> Result<i32> {
    let sock = current_socket(fd)?;
    let addr: SockAddr = uaccess::read_user(addr_addr).ok_or(Errno::EFAIL)?;
    bind_addr(&sock, addr)?;
    Ok(0)
}

pub fn sys_sendto(fd: i32, buf_addr: u32, nbytes: i32, addr_addr: u32) -> Result<i32> {
    if nbytes < 0 {
        return Err(Errno::EFAIL);
    }
    let sock = current_socket(fd)?;
    let dest: SockAddr = uaccess::read_user(addr_addr).ok_or(Errno::EFAIL)?;
    uaccess::with_user_slice(buf_addr, nbytes as usize, |buf| send(&sock, buf, Some(dest)))
        .ok_or(Errno::EFAIL)?
}

pub fn sys_recvfrom(fd: i32, buf_addr: u32, nbytes: i32, addr_addr: u32) -> Result<i32> {
    if nbytes < 0 {
        return Err(Errno::EFAIL);
    }
    let sock = current_socket(fd)?;
    let nonblocking = crate::process::with_current(|pcb| pcb.files.get(fd))
        .flatten()
        .map(|f| f.nonblocking())
        .unwrap_or(false);

    let mut from = SockAddr::default();
    let n = uaccess::with_user_slice_mut(buf_addr, nbytes as usize, |buf| {
        recv(&sock, nonblocking, buf, Some(&mut from))
    })
    .ok_or(Errno::EFAIL)??;

    if addr_addr != 0 && !uaccess::write_user(addr_addr, &from) {
        return Err(Errno::EFAIL);
    }
    Ok(n)
}

pub fn sys_getsockname(fd: i32, addr_addr: u32) -> Result<i32> {
    let sock = current_socket(fd)?;
    let addr = (*sock.bound.lock()).unwrap_or_default();
    if !uaccess::write_user(addr_addr, &addr) {
        return Err(Errno::EFAIL);
    }
    Ok(0)
}

/// Stream-socket calls; all fail while no NIC collaborator is registered.
pub fn sys_unsupported_stream_op(fd: i32) -> Result<i32> {
    let _ = current_socket(fd)?;
    Err(Errno::EFAIL)
}

#[cfg(test)]
pub fn reset() {
    SOCKETS.lock().clear();
    *NEXT_EPHEMERAL.lock() = 49152;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_datagram_round_trip() {
        let _guard = crate::test_utils::kernel_lock();
        let server = new_socket();
        let client = new_socket();
        bind_addr(
            &server,
            SockAddr {
                ip: LOOPBACK,
                port: 5000,
            },
        )
        .unwrap();

        let dest = SockAddr {
            ip: LOOPBACK,
            port: 5000,
        };
        assert_eq!(send(&client, b"ping", Some(dest)), Ok(4));

        let mut buf = [0u8; 16];
        let mut from = SockAddr::default();
        assert_eq!(recv(&server, true, &mut buf, Some(&mut from)), Ok(4));
        assert_eq!(&buf[..4], b"ping");
        // The client picked up an ephemeral source address
        assert!(from.port >= 49152);

        // Reply to the reported source
        assert_eq!(send(&server, b"pong", Some(from)), Ok(4));
        assert_eq!(recv(&client, true, &mut buf, None), Ok(4));
        assert_eq!(&buf[..4], b"pong");

        assert_eq!(recv(&client, true, &mut buf, None), Err(Errno::EAGAIN));
    }

    #[test]
    fn binding_rules() {
        let _guard = crate::test_utils::kernel_lock();
        let a = new_socket();
        let b = new_socket();
        bind_addr(
            &a,
            SockAddr {
                ip: ANY,
                port: 7000,
            },
        )
        .unwrap();
        // Duplicate port refused
        assert!(bind_addr(
            &b,
            SockAddr {
                ip: LOOPBACK,
                port: 7000
            }
        )
        .is_err());
        // Non-loopback refused without a NIC
        assert!(bind_addr(
            &b,
            SockAddr {
                ip: [10, 0, 0, 1],
                port: 7001
            }
        )
        .is_err());
        // Port 0 auto-assigns
        bind_addr(
            &b,
            SockAddr {
                ip: LOOPBACK,
                port: 0,
            }
        )
        .unwrap();
        assert!((*b.bound.lock()).unwrap().port >= 49152);
    }

    #[test]
    fn send_to_unbound_port_fails() {
        let _guard = crate::test_utils::kernel_lock();
        let sock = new_socket();
        let dest = SockAddr {
            ip: LOOPBACK,
            port: 9999,
        };
        assert_eq!(send(&sock, b"x", Some(dest)), Err(Errno::EFAIL));
    }
}
