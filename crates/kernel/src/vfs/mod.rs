// File layer front end: the device name registry, path resolution, and the
// descriptor syscalls.
//
// Device names are claimed by drivers at boot; any other path goes to the
// filesystem. A driver that failed to initialise simply never registers,
// so its capability is absent rather than broken.

pub mod file;
pub mod pipe;
pub mod poll;

use alloc::sync::Arc;
use spin::Mutex;

use crate::error::{Errno, Result};
use crate::syscall::uaccess;
use file::{FileKind, FileObj, OpenFlags, OpenMode};

/// Constructor invoked when a registered device name is opened.
pub type DeviceCtor = fn() -> Result<FileKind>;

struct DeviceDef {
    name: &'static str,
    ctor: DeviceCtor,
}

static DEVICES: Mutex<heapless::Vec<DeviceDef, 16>> = Mutex::new(heapless::Vec::new());

/// Claim a device file name. Re-registration is ignored so driver init is
/// idempotent.
pub fn register_device(name: &'static str, ctor: DeviceCtor) {
    crate::arch::without_interrupts(|| {
        let mut devices = DEVICES.lock();
        if devices.iter().any(|d| d.name == name) {
            return;
        }
        if devices.push(DeviceDef { name, ctor }).is_err() {
            crate::error!("device registry full, dropping {}", name);
        }
    });
}

fn device_ctor(name: &str) -> Option<DeviceCtor> {
    crate::arch::without_interrupts(|| {
        DEVICES
            .lock()
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.ctor)
    })
}

/// Resolve a path into a fresh file object: registered devices first, then
/// the filesystem.
pub fn open_path(path: &str, flags: OpenFlags) -> Result<Arc<FileObj>> {
    let mode = if flags.mode().is_empty() {
        OpenMode::READ | OpenMode::WRITE
    } else {
        flags.mode()
    };

    if let Some(ctor) = device_ctor(path) {
        let kind = ctor()?;
        return Ok(FileObj::new(kind, mode));
    }

    if flags.contains(OpenFlags::CREATE) {
        let inode = crate::fs::create(path, flags)?;
        return Ok(FileObj::new(
            FileKind::FsFile {
                inode,
                offset: core::sync::atomic::AtomicU32::new(0),
                append: flags.contains(OpenFlags::APPEND),
            },
            mode,
        ));
    }

    let node = crate::fs::lookup(path).ok_or(Errno::EFAIL)?;
    let kind = if node.is_dir {
        FileKind::FsDir {
            index: core::sync::atomic::AtomicU32::new(0),
        }
    } else {
        FileKind::FsFile {
            inode: node.inode,
            offset: core::sync::atomic::AtomicU32::new(0),
            append: flags.contains(OpenFlags::APPEND),
        }
    };
    Ok(FileObj::new(kind, mode))
}

fn current_file(fd: i32) -> Result<Arc<FileObj>> {
    crate::process::with_current(|pcb| pcb.files.get(fd))
        .flatten()
        .ok_or(Errno::EFAIL)
}

fn bind_lowest(file: Arc<FileObj>) -> Result<i32> {
    crate::process::with_current(|pcb| pcb.files.bind(-1, file)).ok_or(Errno::EFAIL)?
}

// --- syscall handlers ---

const PATH_MAX: usize = 64;

fn read_path(path_addr: u32) -> Result<heapless::String<PATH_MAX>> {
    let mut buf = [0u8; PATH_MAX];
    let len = uaccess::read_user_cstr(path_addr, &mut buf).ok_or(Errno::EFAIL)?;
    let s = core::str::from_utf8(&buf[..len]).map_err(|_| Errno::EFAIL)?;
    let mut path = heapless::String::new();
    path.push_str(s).map_err(|_| Errno::EFAIL)?;
    Ok(path)
}

pub fn sys_open(path_addr: u32) -> Result<i32> {
    let path = read_path(path_addr)?;
    let file = open_path(&path, OpenFlags::READ | OpenFlags::WRITE)?;
    bind_lowest(file)
}

pub fn sys_create(path_addr: u32, flags: u32) -> Result<i32> {
    let path = read_path(path_addr)?;
    let flags = OpenFlags::from_bits(flags).ok_or(Errno::EFAIL)?;
    let file = open_path(&path, flags)?;
    bind_lowest(file)
}

pub fn sys_close(fd: i32) -> Result<i32> {
    crate::process::with_current(|pcb| {
        // Compat processes cannot close their pinned stdin/stdout
        if pcb.flags.contains(crate::process::pcb::PcbFlags::COMPAT) && (fd == 0 || fd == 1) {
            return Err(Errno::EFAIL);
        }
        pcb.files.unbind(fd).map(|_| 0)
    })
    .ok_or(Errno::EFAIL)?
}

pub fn sys_read(fd: i32, buf_addr: u32, nbytes: i32) -> Result<i32> {
    if nbytes < 0 {
        return Err(Errno::EFAIL);
    }
    let file = current_file(fd)?;
    uaccess::with_user_slice_mut(buf_addr, nbytes as usize, |buf| file.read(buf))
        .ok_or(Errno::EFAIL)?
}

pub fn sys_write(fd: i32, buf_addr: u32, nbytes: i32) -> Result<i32> {
    if nbytes < 0 {
        return Err(Errno::EFAIL);
    }
    let file = current_file(fd)?;
    uaccess::with_user_slice(buf_addr, nbytes as usize, |buf| file.write(buf))
        .ok_or(Errno::EFAIL)?
}

pub fn sys_ioctl(fd: i32, req: i32, arg: u32) -> Result<i32> {
    let file = current_file(fd)?;
    file.ioctl(req, arg)
}

/// dup() syscall: bind the same file object to a second descriptor. A
/// negative `newfd` picks the lowest free slot; binding onto an occupied
/// slot fails.
pub fn sys_dup(fd: i32, newfd: i32) -> Result<i32> {
    let file = current_file(fd)?;
    crate::process::with_current(|pcb| pcb.files.bind(newfd, file)).ok_or(Errno::EFAIL)?
}

#[cfg(test)]
pub fn reset_registry() {
    DEVICES.lock().clear();
}

pub use file::MAX_FILES;
