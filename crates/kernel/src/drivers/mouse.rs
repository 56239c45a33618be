// PS/2 mouse device.
//
// The PS/2 ISR collaborator pushes 3-byte movement packets; reads drain
// whole packets only, blocking while the queue is empty.

use alloc::sync::Arc;
use spin::Mutex;

use crate::error::{Errno, Result};
use crate::process::wait::{wait_interruptible, WaitNode, WaitQueue};
use crate::vfs::file::FileKind;

/// Bytes per movement packet: flags, dx, dy.
pub const PACKET_LEN: usize = 3;

const QUEUE_PACKETS: usize = 64;

static PACKETS: Mutex<heapless::Deque<[u8; PACKET_LEN], QUEUE_PACKETS>> =
    Mutex::new(heapless::Deque::new());

lazy_static::lazy_static! {
    static ref MOUSE_QUEUE: Arc<WaitQueue> = WaitQueue::new();
}

pub fn open_device() -> Result<FileKind> {
    Ok(FileKind::Mouse)
}

/// Queue one packet from the interrupt handler, dropping the oldest on
/// overrun.
pub fn push_packet(packet: [u8; PACKET_LEN]) {
    crate::arch::without_interrupts(|| {
        let mut packets = PACKETS.lock();
        if packets.is_full() {
            let _ = packets.pop_front();
        }
        let _ = packets.push_back(packet);
    });
    MOUSE_QUEUE.wake();
}

fn drain(buf: &mut [u8]) -> Result<i32> {
    if buf.len() < PACKET_LEN {
        return Err(Errno::EFAIL);
    }
    crate::arch::without_interrupts(|| {
        let mut packets = PACKETS.lock();
        if packets.is_empty() {
            return Err(Errno::EAGAIN);
        }
        let mut n = 0usize;
        while n + PACKET_LEN <= buf.len() {
            let Some(packet) = packets.pop_front() else {
                break;
            };
            buf[n..n + PACKET_LEN].copy_from_slice(&packet);
            n += PACKET_LEN;
        }
        Ok(n as i32)
    })
}

pub fn read(nonblocking: bool, buf: &mut [u8]) -> Result<i32> {
    wait_interruptible(Some(&MOUSE_QUEUE), nonblocking, || drain(buf))
}

pub fn poll(read_node: Option<&mut WaitNode>, _write_node: Option<&mut WaitNode>) -> Result<u8> {
    let readable = crate::arch::without_interrupts(|| {
        if PACKETS.lock().is_empty() {
            Err(Errno::EAGAIN)
        } else {
            Ok(1)
        }
    });
    Ok(crate::vfs::poll::poll_register(
        readable,
        &MOUSE_QUEUE,
        read_node,
        crate::vfs::file::OpenMode::READ,
    ))
}

#[cfg(test)]
pub fn reset() {
    PACKETS.lock().clear();
}
