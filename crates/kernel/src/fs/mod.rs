// Boot filesystem.
//
// The Multiboot module is a cpio "newc" archive unpacked at boot into a
// flat in-memory table; directories are dropped and entry names keep their
// final path component. Files from the archive are read-only; create() adds
// writable in-memory nodes. Inodes are plain table indices.

use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{Errno, Result};
use crate::vfs::file::OpenFlags;

const NEWC_MAGIC: &[u8; 6] = b"070701";
const HEADER_SIZE: usize = 110;
const TRAILER_NAME: &str = "TRAILER!!!";

/// Regular-file bit of the cpio mode field.
const S_IFMT: u32 = 0xF000;
const S_IFREG: u32 = 0x8000;

struct FsNode {
    name: String,
    data: Vec<u8>,
    writable: bool,
}

pub struct NodeRef {
    pub inode: usize,
    pub is_dir: bool,
}

lazy_static::lazy_static! {
    static ref FILESYSTEM: Mutex<Vec<FsNode>> = Mutex::new(Vec::new());
}

fn parse_hex(s: &[u8]) -> Result<u32> {
    if s.len() != 8 {
        return Err(Errno::EFAIL);
    }
    let mut result = 0u32;
    for &b in s {
        result <<= 4;
        result |= match b {
            b'0'..=b'9' => (b - b'0') as u32,
            b'a'..=b'f' => (b - b'a' + 10) as u32,
            b'A'..=b'F' => (b - b'A' + 10) as u32,
            _ => return Err(Errno::EFAIL),
        };
    }
    Ok(result)
}

fn align_4(offset: usize) -> usize {
    (offset + 3) & !3
}

/// Unpack a newc archive into the filesystem table. Returns the number of
/// file entries.
pub fn init_from_archive(archive: &[u8]) -> Result<usize> {
    let mut nodes = Vec::new();
    let mut offset = 0usize;
    let mut saw_trailer = false;

    while !saw_trailer {
        if offset + HEADER_SIZE > archive.len() {
            // Ran off the end without a trailer
            return Err(Errno::EFAIL);
        }
        let header = &archive[offset..offset + HEADER_SIZE];
        if &header[0..6] != NEWC_MAGIC {
            return Err(Errno::EFAIL);
        }
        let mode = parse_hex(&header[14..22])?;
        let filesize = parse_hex(&header[54..62])? as usize;
        let namesize = parse_hex(&header[94..102])? as usize;

        let name_start = offset + HEADER_SIZE;
        if name_start + namesize > archive.len() || namesize == 0 {
            return Err(Errno::EFAIL);
        }
        // namesize includes the NUL terminator
        let raw_name = &archive[name_start..name_start + namesize - 1];
        let name = core::str::from_utf8(raw_name).map_err(|_| Errno::EFAIL)?;
        if name == TRAILER_NAME {
            saw_trailer = true;
            continue;
        }

        let data_start = align_4(name_start + namesize);
        if data_start + filesize > archive.len() {
            return Err(Errno::EFAIL);
        }

        if mode & S_IFMT == S_IFREG {
            // Flatten paths: keep the final component only
            let base = name.rsplit('/').next().unwrap_or(name);
            nodes.push(FsNode {
                name: String::from(base),
                data: archive[data_start..data_start + filesize].to_vec(),
                writable: false,
            });
        }

        offset = align_4(data_start + filesize);
    }

    let count = nodes.len();
    crate::arch::without_interrupts(|| {
        *FILESYSTEM.lock() = nodes;
    });
    Ok(count)
}

/// Resolve a path. `.` names the single flat directory.
pub fn lookup(path: &str) -> Option<NodeRef> {
    if path == "." {
        return Some(NodeRef {
            inode: 0,
            is_dir: true,
        });
    }
    crate::arch::without_interrupts(|| {
        FILESYSTEM
            .lock()
            .iter()
            .position(|n| n.name == path)
            .map(|inode| NodeRef {
                inode,
                is_dir: false,
            })
    })
}

/// Read from a file at a byte offset; 0 past the end.
pub fn read(inode: usize, offset: u32, buf: &mut [u8]) -> Result<i32> {
    crate::arch::without_interrupts(|| {
        let fs = FILESYSTEM.lock();
        let node = fs.get(inode).ok_or(Errno::EFAIL)?;
        let offset = offset as usize;
        if offset >= node.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(node.data.len() - offset);
        buf[..n].copy_from_slice(&node.data[offset..offset + n]);
        Ok(n as i32)
    })
}

/// Write to a node created in memory; archive files are immutable.
pub fn write(inode: usize, offset: u32, buf: &[u8], append: bool) -> Result<i32> {
    crate::arch::without_interrupts(|| {
        let mut fs = FILESYSTEM.lock();
        let node = fs.get_mut(inode).ok_or(Errno::EFAIL)?;
        if !node.writable {
            return Err(Errno::EFAIL);
        }
        let offset = if append {
            node.data.len()
        } else {
            offset as usize
        };
        if offset > node.data.len() {
            return Err(Errno::EFAIL);
        }
        let overlap = (node.data.len() - offset).min(buf.len());
        node.data[offset..offset + overlap].copy_from_slice(&buf[..overlap]);
        node.data.extend_from_slice(&buf[overlap..]);
        Ok(buf.len() as i32)
    })
}

/// Total size of a file in bytes.
pub fn size(inode: usize) -> Option<usize> {
    crate::arch::without_interrupts(|| FILESYSTEM.lock().get(inode).map(|n| n.data.len()))
}

/// Copy a file's full contents out (program loading).
pub fn read_all(inode: usize) -> Option<Vec<u8>> {
    crate::arch::without_interrupts(|| FILESYSTEM.lock().get(inode).map(|n| n.data.clone()))
}

/// Directory enumeration: copy the name of entry `index` into `buf`.
/// Returns 0 when the enumeration is done.
pub fn read_dir_entry(index: usize, buf: &mut [u8]) -> Result<i32> {
    crate::arch::without_interrupts(|| {
        let fs = FILESYSTEM.lock();
        let Some(node) = fs.get(index) else {
            return Ok(0);
        };
        let name = node.name.as_bytes();
        let n = name.len().min(buf.len());
        buf[..n].copy_from_slice(&name[..n]);
        Ok(n as i32)
    })
}

/// create() support: make (or reopen) a writable node.
pub fn create(path: &str, flags: OpenFlags) -> Result<usize> {
    if path.is_empty() || path == "." {
        return Err(Errno::EFAIL);
    }
    crate::arch::without_interrupts(|| {
        let mut fs = FILESYSTEM.lock();
        if let Some(inode) = fs.iter().position(|n| n.name == path) {
            if flags.contains(OpenFlags::TRUNC) {
                let node = &mut fs[inode];
                if !node.writable {
                    return Err(Errno::EFAIL);
                }
                node.data.clear();
            }
            return Ok(inode);
        }
        fs.push(FsNode {
            name: String::from(path),
            data: Vec::new(),
            writable: true,
        });
        Ok(fs.len() - 1)
    })
}

#[cfg(test)]
pub fn reset() {
    FILESYSTEM.lock().clear();
}

/// Test fixture: install a file as if it came from the boot archive.
#[cfg(test)]
pub fn install(name: &str, data: Vec<u8>) {
    FILESYSTEM.lock().push(FsNode {
        name: String::from(name),
        data,
        writable: false,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn newc_entry(name: &str, data: &[u8], mode: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(NEWC_MAGIC);
        let fields = [
            1,                      // ino
            mode,                   // mode
            0,                      // uid
            0,                      // gid
            1,                      // nlink
            0,                      // mtime
            data.len() as u32,      // filesize
            0,                      // devmajor
            0,                      // devminor
            0,                      // rdevmajor
            0,                      // rdevminor
            (name.len() + 1) as u32, // namesize
            0,                      // check
        ];
        for field in fields {
            out.extend_from_slice(alloc::format!("{:08X}", field).as_bytes());
        }
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    fn sample_archive() -> Vec<u8> {
        let mut archive = Vec::new();
        archive.extend(newc_entry("bin", &[], 0x4000 | 0o755));
        archive.extend(newc_entry("bin/hello", b"hello world", S_IFREG | 0o755));
        archive.extend(newc_entry("notes.txt", b"a few notes", S_IFREG | 0o644));
        archive.extend(newc_entry(TRAILER_NAME, &[], 0));
        archive
    }

    #[test]
    fn unpacks_regular_files_and_flattens_names() {
        let _guard = crate::test_utils::kernel_lock();
        assert_eq!(init_from_archive(&sample_archive()), Ok(2));

        let hello = lookup("hello").unwrap();
        assert!(!hello.is_dir);
        let mut buf = [0u8; 32];
        assert_eq!(read(hello.inode, 0, &mut buf), Ok(11));
        assert_eq!(&buf[..11], b"hello world");

        // Offsets past the end read as EOF
        assert_eq!(read(hello.inode, 100, &mut buf), Ok(0));
        assert!(lookup("bin").is_none());
        assert!(lookup("bogus").is_none());
    }

    #[test]
    fn rejects_corrupt_archives() {
        let _guard = crate::test_utils::kernel_lock();
        assert!(init_from_archive(b"junk data that is not cpio").is_err());

        let mut truncated = sample_archive();
        truncated.truncate(HEADER_SIZE + 2);
        assert!(init_from_archive(&truncated).is_err());
    }

    #[test]
    fn created_nodes_are_writable_but_archive_files_are_not() {
        let _guard = crate::test_utils::kernel_lock();
        install("fixed", b"fixed".to_vec());
        let fixed = lookup("fixed").unwrap();
        assert_eq!(write(fixed.inode, 0, b"xx", false), Err(Errno::EFAIL));

        let inode = create("scratch", OpenFlags::CREATE).unwrap();
        assert_eq!(write(inode, 0, b"abc", false), Ok(3));
        assert_eq!(write(inode, 0, b"xyzw", false), Ok(4));
        let mut buf = [0u8; 8];
        assert_eq!(read(inode, 0, &mut buf), Ok(4));
        assert_eq!(&buf[..4], b"xyzw");

        // Reopen with TRUNC empties it
        assert_eq!(create("scratch", OpenFlags::CREATE | OpenFlags::TRUNC), Ok(inode));
        assert_eq!(size(inode), Some(0));

        // Append ignores the offset
        assert_eq!(write(inode, 0, b"one", true), Ok(3));
        assert_eq!(write(inode, 0, b"two", true), Ok(3));
        assert_eq!(read(inode, 0, &mut buf), Ok(6));
        assert_eq!(&buf[..6], b"onetwo");
    }
}
