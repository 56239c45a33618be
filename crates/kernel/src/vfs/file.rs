// File objects and per-process descriptor tables.
//
// A file object is a shared, reference-counted instance of one device kind;
// the kind variant carries the type-specific per-open state. Descriptor
// slots hold `Arc` references, so the reference count is the number of
// slots (plus transient retains inside syscalls), and the close hook runs
// exactly once, when the last reference drops.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::{Errno, Result};
use crate::process::wait::WaitNode;

/// Maximum number of open files per process.
pub const MAX_FILES: usize = 8;

bitflags::bitflags! {
    /// Access mode bits. Poll events use the same bits, so
    /// `revents & mode` is well-defined.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Flags accepted by the create() syscall. The upper three are consumed
    /// by the filesystem.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CREATE = 1 << 2;
        const TRUNC = 1 << 3;
        const APPEND = 1 << 4;
    }
}

impl OpenFlags {
    pub fn mode(self) -> OpenMode {
        OpenMode::from_bits_truncate((self.bits() & 0x3) as u8)
    }
}

/// Generic ioctl understood by every file: set/clear nonblocking mode.
pub const IOCTL_NONBLOCK: i32 = 1;

/// Which end of a pipe a file object refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

/// The closed set of file kinds, each carrying its per-open state.
pub enum FileKind {
    Terminal,
    Rtc {
        /// Virtual interrupt frequency for this open file.
        freq: AtomicU32,
    },
    Pipe {
        end: PipeEnd,
        state: Arc<crate::vfs::pipe::PipeState>,
    },
    Mouse,
    Taux,
    Sound,
    NullDev,
    ZeroDev,
    Random,
    FsFile {
        inode: usize,
        offset: AtomicU32,
        append: bool,
    },
    FsDir {
        /// Index of the next entry when enumerating.
        index: AtomicU32,
    },
    Socket(Arc<crate::net::socket::SocketState>),
}

pub struct FileObj {
    pub kind: FileKind,
    pub mode: OpenMode,
    nonblocking: AtomicBool,
}

impl FileObj {
    pub fn new(kind: FileKind, mode: OpenMode) -> Arc<Self> {
        Arc::new(Self {
            kind,
            mode,
            nonblocking: AtomicBool::new(false),
        })
    }

    pub fn nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Relaxed)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Relaxed);
    }

    /// Read into a kernel-visible buffer. Returns bytes transferred, 0 at
    /// EOF, EAGAIN when blocking would be needed on a nonblocking file.
    pub fn read(&self, buf: &mut [u8]) -> Result<i32> {
        if !self.mode.contains(OpenMode::READ) {
            return Err(Errno::EFAIL);
        }
        match &self.kind {
            FileKind::Terminal => crate::drivers::terminal::read(self.nonblocking(), buf),
            FileKind::Rtc { freq } => crate::drivers::rtc::read(freq, self.nonblocking()),
            FileKind::Pipe { end, state } => match end {
                PipeEnd::Read => crate::vfs::pipe::read(state, self.nonblocking(), buf),
                PipeEnd::Write => Err(Errno::EFAIL),
            },
            FileKind::Mouse => crate::drivers::mouse::read(self.nonblocking(), buf),
            FileKind::Taux => crate::drivers::taux::read(buf),
            FileKind::Sound => Err(Errno::EFAIL),
            FileKind::NullDev => Ok(0),
            FileKind::ZeroDev => {
                buf.fill(0);
                Ok(buf.len() as i32)
            }
            FileKind::Random => crate::drivers::random::read(buf),
            FileKind::FsFile { inode, offset, .. } => {
                let pos = offset.load(Ordering::Relaxed);
                let n = crate::fs::read(*inode, pos, buf)?;
                offset.fetch_add(n as u32, Ordering::Relaxed);
                Ok(n)
            }
            FileKind::FsDir { index } => {
                let i = index.load(Ordering::Relaxed);
                let n = crate::fs::read_dir_entry(i as usize, buf)?;
                if n > 0 {
                    index.fetch_add(1, Ordering::Relaxed);
                }
                Ok(n)
            }
            FileKind::Socket(sock) => {
                crate::net::socket::recv(sock, self.nonblocking(), buf, None)
            }
        }
    }

    /// Write from a kernel-visible buffer; symmetric with [`read`].
    pub fn write(&self, buf: &[u8]) -> Result<i32> {
        if !self.mode.contains(OpenMode::WRITE) {
            return Err(Errno::EFAIL);
        }
        match &self.kind {
            FileKind::Terminal => crate::drivers::terminal::write(buf),
            FileKind::Rtc { freq } => crate::drivers::rtc::write(freq, buf),
            FileKind::Pipe { end, state } => match end {
                PipeEnd::Write => crate::vfs::pipe::write(state, self.nonblocking(), buf),
                PipeEnd::Read => Err(Errno::EFAIL),
            },
            FileKind::Mouse => Err(Errno::EFAIL),
            FileKind::Taux => Err(Errno::EFAIL),
            FileKind::Sound => crate::drivers::sound::write(self.nonblocking(), buf),
            FileKind::NullDev | FileKind::ZeroDev => Ok(buf.len() as i32),
            FileKind::Random => Err(Errno::EFAIL),
            FileKind::FsFile {
                inode,
                offset,
                append,
            } => {
                let pos = offset.load(Ordering::Relaxed);
                let n = crate::fs::write(*inode, pos, buf, *append)?;
                offset.fetch_add(n as u32, Ordering::Relaxed);
                Ok(n)
            }
            FileKind::FsDir { .. } => Err(Errno::EFAIL),
            FileKind::Socket(sock) => crate::net::socket::send(sock, buf, None),
        }
    }

    pub fn ioctl(&self, req: i32, arg: u32) -> Result<i32> {
        // File-layer generic requests come first
        if req == IOCTL_NONBLOCK {
            self.set_nonblocking(arg != 0);
            return Ok(0);
        }
        match &self.kind {
            FileKind::Taux => crate::drivers::taux::ioctl(req, arg),
            FileKind::Sound => crate::drivers::sound::ioctl(req, arg),
            _ => Err(Errno::EFAIL),
        }
    }

    /// Register the supplied wait nodes and report which operations would
    /// not block right now. Files without poll support are a hard error so
    /// a caller can never wait forever on an unobservable resource.
    pub fn poll(
        &self,
        read_node: Option<&mut WaitNode>,
        write_node: Option<&mut WaitNode>,
    ) -> Result<u8> {
        match &self.kind {
            FileKind::Terminal => crate::drivers::terminal::poll(read_node, write_node),
            FileKind::Pipe { state, .. } => crate::vfs::pipe::poll(state, read_node, write_node),
            FileKind::Mouse => crate::drivers::mouse::poll(read_node, write_node),
            FileKind::Sound => crate::drivers::sound::poll(read_node, write_node),
            FileKind::Socket(sock) => crate::net::socket::poll(sock, read_node, write_node),
            // Always ready, no wakeups to register
            FileKind::NullDev | FileKind::ZeroDev | FileKind::FsFile { .. } | FileKind::FsDir { .. } => {
                Ok(crate::vfs::poll::generic_rdwr(read_node, write_node))
            }
            FileKind::Taux | FileKind::Random => {
                Ok(crate::vfs::poll::generic_rdonly(read_node, write_node))
            }
            FileKind::Rtc { .. } => Err(Errno::EFAIL),
        }
    }
}

impl Drop for FileObj {
    fn drop(&mut self) {
        match &self.kind {
            FileKind::Pipe { end, state } => crate::vfs::pipe::close_end(state, *end),
            FileKind::Taux => crate::drivers::taux::release(),
            FileKind::Sound => crate::drivers::sound::release(),
            FileKind::Socket(sock) => crate::net::socket::close(sock),
            _ => {}
        }
    }
}

/// Per-process descriptor table.
pub struct FdTable {
    slots: [Option<Arc<FileObj>>; MAX_FILES],
}

const EMPTY_SLOT: Option<Arc<FileObj>> = None;

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: [EMPTY_SLOT; MAX_FILES],
        }
    }

    /// Descriptor table with the terminal bound as stdin/stdout.
    pub fn new_stdio() -> Self {
        let mut table = Self::new();
        let _ = table.bind(0, FileObj::new(FileKind::Terminal, OpenMode::READ));
        let _ = table.bind(1, FileObj::new(FileKind::Terminal, OpenMode::WRITE));
        table
    }

    /// Bind a file object to a descriptor. A non-negative `slot_hint` picks
    /// that slot (failing when occupied); otherwise the lowest free slot is
    /// used. Returns the descriptor.
    pub fn bind(&mut self, slot_hint: i32, file: Arc<FileObj>) -> Result<i32> {
        if slot_hint >= 0 {
            let index = slot_hint as usize;
            if index >= MAX_FILES || self.slots[index].is_some() {
                return Err(Errno::EFAIL);
            }
            self.slots[index] = Some(file);
            return Ok(slot_hint);
        }
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(index as i32);
            }
        }
        Err(Errno::EFAIL)
    }

    pub fn get(&self, fd: i32) -> Option<Arc<FileObj>> {
        if fd < 0 || fd as usize >= MAX_FILES {
            return None;
        }
        self.slots[fd as usize].clone()
    }

    /// Clear a slot, dropping its reference. The close hook runs when this
    /// was the last one.
    pub fn unbind(&mut self, fd: i32) -> Result<()> {
        if fd < 0 || fd as usize >= MAX_FILES {
            return Err(Errno::EFAIL);
        }
        if self.slots[fd as usize].take().is_none() {
            return Err(Errno::EFAIL);
        }
        Ok(())
    }

    /// Drop every reference (process teardown).
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    /// Remove every descriptor above stdin/stdout (compat-mode exec),
    /// returning the removed references so close hooks can run outside
    /// the process-table lock.
    pub fn take_above_stdio(&mut self) -> FdTable {
        let mut taken = FdTable::new();
        for (i, slot) in self.slots.iter_mut().enumerate().skip(2) {
            taken.slots[i] = slot.take();
        }
        taken
    }
}

impl Clone for FdTable {
    /// Sharing clone used by fork: every slot's refcount is bumped.
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn null_file() -> Arc<FileObj> {
        FileObj::new(FileKind::NullDev, OpenMode::READ | OpenMode::WRITE)
    }

    #[test]
    fn bind_picks_lowest_free_slot() {
        let mut table = FdTable::new();
        assert_eq!(table.bind(-1, null_file()), Ok(0));
        assert_eq!(table.bind(-1, null_file()), Ok(1));
        table.unbind(0).unwrap();
        assert_eq!(table.bind(-1, null_file()), Ok(0));
    }

    #[test]
    fn bind_honours_hint_and_rejects_occupied() {
        let mut table = FdTable::new();
        assert_eq!(table.bind(5, null_file()), Ok(5));
        assert_eq!(table.bind(5, null_file()), Err(Errno::EFAIL));
        assert_eq!(table.bind(MAX_FILES as i32, null_file()), Err(Errno::EFAIL));
    }

    #[test]
    fn table_is_bounded() {
        let mut table = FdTable::new();
        for i in 0..MAX_FILES {
            assert_eq!(table.bind(-1, null_file()), Ok(i as i32));
        }
        assert_eq!(table.bind(-1, null_file()), Err(Errno::EFAIL));
    }

    #[test]
    fn refcount_tracks_descriptor_slots() {
        let mut table = FdTable::new();
        let file = null_file();
        table.bind(-1, file.clone()).unwrap();
        table.bind(-1, file.clone()).unwrap();
        // Two slots plus our local handle
        assert_eq!(Arc::strong_count(&file), 3);

        let forked = table.clone();
        assert_eq!(Arc::strong_count(&file), 5);
        drop(forked);

        table.unbind(0).unwrap();
        table.unbind(1).unwrap();
        assert_eq!(Arc::strong_count(&file), 1);
        assert_eq!(table.unbind(0), Err(Errno::EFAIL));
    }

    #[test]
    fn mode_gates_read_and_write() {
        let file = FileObj::new(FileKind::NullDev, OpenMode::READ);
        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf), Ok(0));
        assert_eq!(file.write(&buf), Err(Errno::EFAIL));
    }

    #[test]
    fn generic_nonblock_ioctl_applies_to_any_file() {
        let file = null_file();
        assert!(!file.nonblocking());
        assert_eq!(file.ioctl(IOCTL_NONBLOCK, 1), Ok(0));
        assert!(file.nonblocking());
        assert_eq!(file.ioctl(IOCTL_NONBLOCK, 0), Ok(0));
        assert!(!file.nonblocking());
    }

    #[test]
    fn zero_and_null_semantics() {
        let zero = FileObj::new(FileKind::ZeroDev, OpenMode::READ | OpenMode::WRITE);
        let mut buf = [0xFFu8; 8];
        assert_eq!(zero.read(&mut buf), Ok(8));
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(zero.write(&buf), Ok(8));

        let null = null_file();
        assert_eq!(null.read(&mut buf), Ok(0));
        assert_eq!(null.write(&buf), Ok(8));
    }
}
