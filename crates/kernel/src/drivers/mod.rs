// Virtualised devices behind the file layer.

pub mod mouse;
pub mod random;
pub mod rtc;
pub mod sound;
pub mod taux;
pub mod terminal;

use crate::error::Result;
use crate::vfs::file::FileKind;

fn open_null() -> Result<FileKind> {
    Ok(FileKind::NullDev)
}

fn open_zero() -> Result<FileKind> {
    Ok(FileKind::ZeroDev)
}

/// Register every available device file name. A device whose hardware
/// probe failed simply stays unregistered.
pub fn init() {
    crate::vfs::register_device("rtc", rtc::open_device);
    crate::vfs::register_device("mouse", mouse::open_device);
    crate::vfs::register_device("taux", taux::open_device);
    crate::vfs::register_device("sound", sound::open_device);
    crate::vfs::register_device("null", open_null);
    crate::vfs::register_device("zero", open_zero);
    crate::vfs::register_device("random", random::open_device);
}
