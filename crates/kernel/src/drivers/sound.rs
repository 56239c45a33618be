// Sound Blaster 16 PCM sink.
//
// Writes stage samples into a bounded buffer that the DMA collaborator
// drains from interrupt context; a full buffer applies backpressure through
// EAGAIN. Sample format is configured over ioctl. Exclusive open, like the
// real card's single DMA channel.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::error::{Errno, Result};
use crate::process::wait::{wait_interruptible, WaitNode, WaitQueue};
use crate::vfs::file::FileKind;

/// ioctl requests.
pub const SOUND_SET_RATE: i32 = 0x20;
pub const SOUND_SET_CHANNELS: i32 = 0x21;

/// Staging buffer size in bytes.
pub const STAGING_CAPACITY: usize = 32 * 1024;

static IN_USE: AtomicBool = AtomicBool::new(false);

struct SoundState {
    staging: VecDeque<u8>,
    sample_rate: u32,
    channels: u8,
}

lazy_static::lazy_static! {
    static ref STATE: Mutex<SoundState> = Mutex::new(SoundState {
        staging: VecDeque::new(),
        sample_rate: 22050,
        channels: 1,
    });
    static ref SOUND_QUEUE: Arc<WaitQueue> = WaitQueue::new();
}

pub fn open_device() -> Result<FileKind> {
    if IN_USE.swap(true, Ordering::AcqRel) {
        crate::debug!("sound device is busy");
        return Err(Errno::EFAIL);
    }
    Ok(FileKind::Sound)
}

/// Close hook: drop pending samples and release the device.
pub fn release() {
    crate::arch::without_interrupts(|| STATE.lock().staging.clear());
    IN_USE.store(false, Ordering::Release);
}

fn stage(buf: &[u8]) -> Result<i32> {
    crate::arch::without_interrupts(|| {
        let mut state = STATE.lock();
        let free = STAGING_CAPACITY - state.staging.len();
        if free == 0 {
            return Err(Errno::EAGAIN);
        }
        let n = free.min(buf.len());
        state.staging.extend(buf[..n].iter().copied());
        Ok(n as i32)
    })
}

pub fn write(nonblocking: bool, buf: &[u8]) -> Result<i32> {
    if buf.is_empty() {
        return Ok(0);
    }
    wait_interruptible(Some(&SOUND_QUEUE), nonblocking, || stage(buf))
}

pub fn ioctl(req: i32, arg: u32) -> Result<i32> {
    match req {
        SOUND_SET_RATE => {
            if !(8000..=44100).contains(&arg) {
                return Err(Errno::EFAIL);
            }
            crate::arch::without_interrupts(|| STATE.lock().sample_rate = arg);
            Ok(0)
        }
        SOUND_SET_CHANNELS => {
            if arg != 1 && arg != 2 {
                return Err(Errno::EFAIL);
            }
            crate::arch::without_interrupts(|| STATE.lock().channels = arg as u8);
            Ok(0)
        }
        _ => Err(Errno::EFAIL),
    }
}

pub fn poll(_read_node: Option<&mut WaitNode>, write_node: Option<&mut WaitNode>) -> Result<u8> {
    let writable = crate::arch::without_interrupts(|| {
        if STATE.lock().staging.len() < STAGING_CAPACITY {
            Ok(1)
        } else {
            Err(Errno::EAGAIN)
        }
    });
    Ok(crate::vfs::poll::poll_register(
        writable,
        &SOUND_QUEUE,
        write_node,
        crate::vfs::file::OpenMode::WRITE,
    ))
}

/// DMA completion: the collaborator consumed `nbytes` of staged samples.
/// Runs in interrupt context; only dequeues and wakes.
pub fn isr_drain(nbytes: usize) {
    crate::arch::without_interrupts(|| {
        let mut state = STATE.lock();
        let n = nbytes.min(state.staging.len());
        state.staging.drain(..n);
    });
    SOUND_QUEUE.wake();
}

#[cfg(test)]
pub fn reset() {
    IN_USE.store(false, Ordering::Relaxed);
    let mut state = STATE.lock();
    state.staging.clear();
    state.sample_rate = 22050;
    state.channels = 1;
}
