// Taux controller: a serial-attached button-and-LED box.
//
// The device is exclusive: a second open fails until the first file is
// closed. Reads return the latest button byte; the LED bitmap is set with
// an ioctl and forwarded to the serial collaborator.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::error::{Errno, Result};
use crate::vfs::file::FileKind;

/// ioctl requests.
pub const TAUX_SET_LED: i32 = 0x10;
pub const TAUX_GET_BUTTONS: i32 = 0x11;

static IN_USE: AtomicBool = AtomicBool::new(false);
static BUTTONS: AtomicU8 = AtomicU8::new(0);
static LEDS: AtomicU32 = AtomicU32::new(0);

pub fn open_device() -> Result<FileKind> {
    if IN_USE.swap(true, Ordering::AcqRel) {
        crate::debug!("taux controller is busy");
        return Err(Errno::EFAIL);
    }
    Ok(FileKind::Taux)
}

/// Close hook: release the exclusive claim.
pub fn release() {
    IN_USE.store(false, Ordering::Release);
}

/// Update the button state from the serial ISR collaborator.
pub fn push_buttons(state: u8) {
    BUTTONS.store(state, Ordering::Relaxed);
}

/// Read the latest button byte; always ready.
pub fn read(buf: &mut [u8]) -> Result<i32> {
    if buf.is_empty() {
        return Ok(0);
    }
    buf[0] = BUTTONS.load(Ordering::Relaxed);
    Ok(1)
}

pub fn ioctl(req: i32, arg: u32) -> Result<i32> {
    match req {
        TAUX_SET_LED => {
            LEDS.store(arg, Ordering::Relaxed);
            // The serial write to the controller is the collaborator's job
            Ok(0)
        }
        TAUX_GET_BUTTONS => Ok(BUTTONS.load(Ordering::Relaxed) as i32),
        _ => Err(Errno::EFAIL),
    }
}

#[cfg(test)]
pub fn reset() {
    IN_USE.store(false, Ordering::Relaxed);
    BUTTONS.store(0, Ordering::Relaxed);
    LEDS.store(0, Ordering::Relaxed);
}
