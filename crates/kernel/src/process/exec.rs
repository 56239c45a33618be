// Program loading: exec(), the legacy execute(), and process spawning.
//
// Commands have the shape "<prog> <args...>". ELF32 executables are loaded
// segment by segment at their linked addresses inside the user page; images
// without an ELF magic are compat-mode programs, copied verbatim to the
// conventional offset with their entry point read from image bytes 24..28.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::arch::{IntRegs, EFLAGS_BASE, EFLAGS_IF, USER_CS, USER_DS};
use crate::error::{Errno, Result};
use crate::mm::{PROGRAM_OFFSET, USER_BASE, USER_SIZE, USER_STACK_TOP};
use crate::process::pcb::{HeapRange, MAX_ARGS_LEN, Pcb, PcbFlags};
use crate::process::table;
use crate::process::Pid;
use crate::syscall::uaccess;

/// Maximum program name length.
const NAME_LEN: usize = 32;

/// Command buffer: name, separator, args, NUL.
const COMMAND_LEN: usize = NAME_LEN + 1 + MAX_ARGS_LEN;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;

struct LoadedImage {
    entry: u32,
    brk_base: u32,
    compat: bool,
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    let bytes = data.get(offset..offset + 2).ok_or(Errno::EFAIL)?;
    Ok(u16::from_le_bytes(bytes.try_into().map_err(|_| Errno::EFAIL)?))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = data.get(offset..offset + 4).ok_or(Errno::EFAIL)?;
    Ok(u32::from_le_bytes(bytes.try_into().map_err(|_| Errno::EFAIL)?))
}

fn user_range_ok(vaddr: u32, len: u32) -> bool {
    let end = vaddr as u64 + len as u64;
    vaddr >= USER_BASE && end <= USER_BASE as u64 + USER_SIZE as u64
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Zero `len` bytes of user memory in bounded chunks.
fn zero_user(addr: u32, len: u32) -> bool {
    let zeros = [0u8; 256];
    let mut written = 0u32;
    while written < len {
        let chunk = (len - written).min(zeros.len() as u32);
        if !uaccess::copy_to_user(addr + written, &zeros[..chunk as usize]) {
            return false;
        }
        written += chunk;
    }
    true
}

/// Copy an ELF32 executable's PT_LOAD segments into the (already mapped)
/// user page.
fn load_elf(data: &[u8]) -> Result<LoadedImage> {
    if data.get(4).copied() != Some(ELFCLASS32) || data.get(5).copied() != Some(ELFDATA2LSB) {
        crate::debug!("ELF image has the wrong class or byte order");
        return Err(Errno::EFAIL);
    }
    if read_u16(data, 16)? != ET_EXEC || read_u16(data, 18)? != EM_386 {
        crate::debug!("ELF image is not an x86 executable");
        return Err(Errno::EFAIL);
    }

    let entry = read_u32(data, 24)?;
    let phoff = read_u32(data, 28)? as usize;
    let phentsize = read_u16(data, 42)? as usize;
    let phnum = read_u16(data, 44)? as usize;
    if phentsize < 32 {
        return Err(Errno::EFAIL);
    }

    let mut image_end = USER_BASE + PROGRAM_OFFSET;
    for i in 0..phnum {
        let ph = phoff + i * phentsize;
        if read_u32(data, ph)? != PT_LOAD {
            continue;
        }
        let p_offset = read_u32(data, ph + 4)? as usize;
        let p_vaddr = read_u32(data, ph + 8)?;
        let p_filesz = read_u32(data, ph + 16)? as usize;
        let p_memsz = read_u32(data, ph + 20)?;

        if (p_memsz as usize) < p_filesz || !user_range_ok(p_vaddr, p_memsz) {
            return Err(Errno::EFAIL);
        }
        let bytes = data.get(p_offset..p_offset + p_filesz).ok_or(Errno::EFAIL)?;
        if !uaccess::copy_to_user(p_vaddr, bytes)
            || !zero_user(p_vaddr + p_filesz as u32, p_memsz - p_filesz as u32)
        {
            return Err(Errno::EFAIL);
        }
        image_end = image_end.max(p_vaddr + p_memsz);
    }

    if !user_range_ok(entry, 0) {
        return Err(Errno::EFAIL);
    }
    Ok(LoadedImage {
        entry,
        brk_base: align_up(image_end, 4096),
        compat: false,
    })
}

/// Copy a raw image to the conventional base; the entry point lives at
/// image bytes 24..28.
fn load_compat(data: &[u8]) -> Result<LoadedImage> {
    if data.len() < 28 {
        return Err(Errno::EFAIL);
    }
    let base = USER_BASE + PROGRAM_OFFSET;
    if !user_range_ok(base, data.len() as u32) {
        return Err(Errno::EFAIL);
    }
    if !uaccess::copy_to_user(base, data) {
        return Err(Errno::EFAIL);
    }
    let entry = read_u32(data, 24)?;
    if !user_range_ok(entry, 0) {
        crate::debug!("compat image has a bad entry point {:#x}", entry);
        return Err(Errno::EFAIL);
    }
    Ok(LoadedImage {
        entry,
        brk_base: align_up(base + data.len() as u32, 4096),
        compat: true,
    })
}

fn load_image(data: &[u8]) -> Result<LoadedImage> {
    if data.len() >= 4 && data[..4] == ELF_MAGIC {
        load_elf(data)
    } else {
        load_compat(data)
    }
}

/// Split "<prog> <args...>". The program name is length-limited; leading
/// spaces before either part are skipped.
fn parse_command(command: &str) -> Result<(&str, &str)> {
    let command = command.trim_start_matches(' ');
    let (name, args) = match command.split_once(' ') {
        Some((name, rest)) => (name, rest.trim_start_matches(' ')),
        None => (command, ""),
    };
    if name.is_empty() || name.len() >= NAME_LEN || args.len() >= MAX_ARGS_LEN {
        return Err(Errno::EFAIL);
    }
    Ok((name, args))
}

fn program_bytes(name: &str) -> Result<Vec<u8>> {
    let node = crate::fs::lookup(name).ok_or(Errno::EFAIL)?;
    if node.is_dir {
        return Err(Errno::EFAIL);
    }
    crate::fs::read_all(node.inode).ok_or(Errno::EFAIL)
}

/// A pristine ring 3 register frame entering at `entry`.
fn fresh_user_regs(entry: u32) -> IntRegs {
    let mut regs = IntRegs::default();
    regs.eip = entry;
    regs.esp = USER_STACK_TOP;
    regs.cs = USER_CS;
    regs.ds = USER_DS;
    regs.es = USER_DS;
    regs.fs = USER_DS;
    regs.gs = USER_DS;
    regs.ss = USER_DS;
    regs.eflags = EFLAGS_IF | EFLAGS_BASE;
    regs
}

fn set_args(pcb: &mut Pcb, args: &str) {
    pcb.args.clear();
    let _ = pcb.args.push_str(args);
}

/// exec() syscall: replace the executing process's image.
pub fn sys_exec(command_addr: u32, regs: &mut IntRegs) -> Result<i32> {
    let mut buf = [0u8; COMMAND_LEN];
    let len = uaccess::read_user_cstr(command_addr, &mut buf).ok_or(Errno::EFAIL)?;
    let command = core::str::from_utf8(&buf[..len]).map_err(|_| Errno::EFAIL)?;
    let (name, args) = parse_command(command)?;
    let data = program_bytes(name)?;

    let old_paddr = crate::process::with_current(|pcb| pcb.user_paddr).ok_or(Errno::EFAIL)?;
    let new_paddr = crate::mm::alloc_user_frame()?;

    crate::mm::switch_user_page(new_paddr);
    let image = match load_image(&data) {
        Ok(image) => image,
        Err(e) => {
            crate::mm::switch_user_page(old_paddr);
            crate::mm::free_user_frame(new_paddr);
            return Err(e);
        }
    };

    // Point of no return: the old image is gone
    let stale_files = crate::process::with_current(|pcb| {
        pcb.user_paddr = new_paddr;
        pcb.heap = HeapRange {
            brk_base: image.brk_base,
            brk_current: image.brk_base,
        };
        set_args(pcb, args);
        pcb.signals = crate::process::signal::SignalTable::new();
        pcb.flags = if image.compat {
            PcbFlags::COMPAT
        } else {
            PcbFlags::empty()
        };

        // Reset descriptors; a compat image keeps its pinned stdin/stdout
        if image.compat {
            let stale = pcb.files.take_above_stdio();
            if pcb.files.get(0).is_none() {
                let _ = pcb.files.bind(
                    0,
                    crate::vfs::file::FileObj::new(
                        crate::vfs::file::FileKind::Terminal,
                        crate::vfs::file::OpenMode::READ,
                    ),
                );
            }
            if pcb.files.get(1).is_none() {
                let _ = pcb.files.bind(
                    1,
                    crate::vfs::file::FileObj::new(
                        crate::vfs::file::FileKind::Terminal,
                        crate::vfs::file::OpenMode::WRITE,
                    ),
                );
            }
            stale
        } else {
            core::mem::replace(&mut pcb.files, crate::vfs::file::FdTable::new_stdio())
        }
    })
    .ok_or(Errno::EFAIL)?;
    // Close hooks may wake other processes; run them outside the table lock
    drop(stale_files);

    crate::mm::free_user_frame(old_paddr);
    *regs = fresh_user_regs(image.entry);
    Ok(0)
}

/// Create a new process running `command`. Used by execute() and the boot
/// shell bootstrap. Returns the child pid; the child is left queued.
pub fn spawn(command: &str, terminal: usize, parent_pid: Pid) -> Result<Pid> {
    let (name, args) = parse_command(command)?;
    let data = program_bytes(name)?;

    let parent_info = crate::process::with_current(|pcb| (pcb.user_paddr, pcb.pgrp));
    let child_paddr = crate::mm::alloc_user_frame()?;

    crate::mm::switch_user_page(child_paddr);
    let load_result = load_image(&data);
    // Re-map the caller's page whether or not the load worked
    if let Some((paddr, _)) = parent_info {
        if paddr != 0 {
            crate::mm::switch_user_page(paddr);
        }
    }
    let image = match load_result {
        Ok(image) => image,
        Err(e) => {
            crate::mm::free_user_frame(child_paddr);
            return Err(e);
        }
    };

    let child_pid = table::alloc_pid();
    let pgrp = match parent_info {
        Some((_, pgrp)) if pgrp >= 0 => pgrp,
        _ => child_pid,
    };
    let mut child = Box::new(Pcb::new(child_pid, parent_pid, terminal, pgrp));
    child.user_paddr = child_paddr;
    child.heap = HeapRange {
        brk_base: image.brk_base,
        brk_current: image.brk_base,
    };
    set_args(&mut *child, args);
    if image.compat {
        child.flags |= PcbFlags::COMPAT;
    }
    child.files = crate::vfs::file::FdTable::new_stdio();
    child.regs = fresh_user_regs(image.entry);

    if let Err(e) = table::with_table(|t| t.insert(child)) {
        crate::mm::free_user_frame(child_paddr);
        return Err(e);
    }

    // A group leader with no parent group claims its terminal's foreground
    if pgrp == child_pid {
        crate::drivers::terminal::set_fg_pgrp(terminal, pgrp);
    }

    crate::process::timer::arm(
        child_pid,
        crate::process::timer::TimerKind::Alarm,
        crate::time::monotime_now() + crate::process::timer::ALARM_PERIOD_NS,
    );
    crate::process::scheduler::add(child_pid);
    Ok(child_pid)
}

/// execute() syscall: spawn a child running `command` and block until it
/// halts; returns its exit status. The legacy contract is uninterruptible.
pub fn sys_execute(command_addr: u32) -> Result<i32> {
    let mut buf = [0u8; COMMAND_LEN];
    let len = uaccess::read_user_cstr(command_addr, &mut buf).ok_or(Errno::EFAIL)?;
    let command = core::str::from_utf8(&buf[..len]).map_err(|_| Errno::EFAIL)?;

    let (me, terminal) =
        crate::process::with_current(|pcb| (pcb.pid, pcb.terminal)).ok_or(Errno::EFAIL)?;
    let child = spawn(command, terminal, me)?;

    let queue = crate::process::with_current(|pcb| pcb.child_wait.clone()).ok_or(Errno::EFAIL)?;
    crate::process::wait::wait_uninterruptible(Some(&queue), false, || {
        table::with_table(|t| {
            let status = match t.get(child) {
                Some(pcb) if pcb.is_zombie() => Some(pcb.exit_code),
                Some(_) => None,
                // Should not happen; nobody else reaps our child
                None => return Err(Errno::EFAIL),
            };
            match status {
                Some(code) => {
                    t.remove(child);
                    Ok(code)
                }
                None => Err(Errno::EAGAIN),
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;
    use pretty_assertions::assert_eq;

    /// A minimal valid ELF32 executable: one PT_LOAD segment of four bytes
    /// at USER_BASE + PROGRAM_OFFSET, entered at its start.
    fn tiny_elf() -> Vec<u8> {
        let base = USER_BASE + PROGRAM_OFFSET;
        let mut image = alloc::vec![0u8; 96];
        image[..4].copy_from_slice(&ELF_MAGIC);
        image[4] = ELFCLASS32;
        image[5] = ELFDATA2LSB;
        image[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        image[18..20].copy_from_slice(&EM_386.to_le_bytes());
        image[24..28].copy_from_slice(&base.to_le_bytes()); // e_entry
        image[28..32].copy_from_slice(&52u32.to_le_bytes()); // e_phoff
        image[42..44].copy_from_slice(&32u16.to_le_bytes()); // e_phentsize
        image[44..46].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

        // Program header at offset 52
        image[52..56].copy_from_slice(&PT_LOAD.to_le_bytes());
        image[56..60].copy_from_slice(&88u32.to_le_bytes()); // p_offset
        image[60..64].copy_from_slice(&base.to_le_bytes()); // p_vaddr
        image[68..72].copy_from_slice(&4u32.to_le_bytes()); // p_filesz
        image[72..76].copy_from_slice(&8u32.to_le_bytes()); // p_memsz
        image[88..92].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        image
    }

    #[test]
    fn command_parsing() {
        assert_eq!(parse_command("cat frame0.txt").unwrap(), ("cat", "frame0.txt"));
        assert_eq!(parse_command("shell").unwrap(), ("shell", ""));
        assert_eq!(parse_command("  grep  a b  ").unwrap(), ("grep", "a b  "));
        assert!(parse_command("").is_err());
        let long = "x".repeat(NAME_LEN);
        assert!(parse_command(&long).is_err());
    }

    #[test]
    fn elf_segments_land_in_the_user_page() {
        let _guard = test_utils::kernel_lock();
        let image = load_image(&tiny_elf()).unwrap();
        assert!(!image.compat);
        assert_eq!(image.entry, USER_BASE + PROGRAM_OFFSET);

        let mut loaded = [0u8; 8];
        assert!(uaccess::copy_from_user(&mut loaded, USER_BASE + PROGRAM_OFFSET));
        // File bytes followed by zeroed bss
        assert_eq!(&loaded, &[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0]);
        assert!(image.brk_base > USER_BASE + PROGRAM_OFFSET);
        assert_eq!(image.brk_base % 4096, 0);
    }

    #[test]
    fn compat_images_enter_at_the_stored_address() {
        let _guard = test_utils::kernel_lock();
        let base = USER_BASE + PROGRAM_OFFSET;
        let mut raw = alloc::vec![0u8; 64];
        raw[24..28].copy_from_slice(&(base + 32).to_le_bytes());
        raw[32] = 0xC3;

        let image = load_image(&raw).unwrap();
        assert!(image.compat);
        assert_eq!(image.entry, base + 32);

        let mut byte = [0u8; 1];
        assert!(uaccess::copy_from_user(&mut byte, base + 32));
        assert_eq!(byte[0], 0xC3);
    }

    #[test]
    fn malformed_images_are_rejected() {
        let _guard = test_utils::kernel_lock();
        // Too short for even a compat entry point
        assert!(load_image(&[0u8; 8]).is_err());

        // ELF magic but wrong machine
        let mut bad = tiny_elf();
        bad[18] = 0xB7;
        assert!(load_image(&bad).is_err());

        // Segment reaching outside the user page
        let mut bad = tiny_elf();
        bad[60..64].copy_from_slice(&(USER_BASE + USER_SIZE as u32 - 2).to_le_bytes());
        assert!(load_image(&bad).is_err());
    }

    #[test]
    fn exec_replaces_image_files_and_signals() {
        let _guard = test_utils::kernel_lock();
        let pid = test_utils::install_process();
        crate::fs::install("prog", tiny_elf());

        crate::process::table::with_pcb(pid, |pcb| {
            pcb.signals.set_handler(crate::process::signal::SIG_USER1, 0x1234);
            let (r, w) = crate::vfs::pipe::create();
            pcb.files.bind(-1, r).unwrap();
            pcb.files.bind(-1, w).unwrap();
        })
        .unwrap();

        let command = USER_BASE + 0x1000;
        assert!(uaccess::copy_to_user(command, b"prog one two\0"));
        let mut regs = IntRegs::default();
        assert_eq!(sys_exec(command, &mut regs), Ok(0));

        // Fresh user frame
        assert_eq!(regs.eip, USER_BASE + PROGRAM_OFFSET);
        assert_eq!(regs.esp, USER_STACK_TOP);
        assert_eq!(regs.cs, USER_CS);

        crate::process::table::with_pcb(pid, |pcb| {
            assert_eq!(pcb.args.as_str(), "one two");
            // Signals reset
            assert_eq!(
                pcb.signals
                    .get(crate::process::signal::SIG_USER1)
                    .handler_addr,
                0
            );
            // Descriptors reset to fresh stdin/stdout
            assert!(pcb.files.get(0).is_some());
            assert!(pcb.files.get(1).is_some());
            assert!(pcb.files.get(2).is_none());
            assert!(pcb.files.get(3).is_none());
        })
        .unwrap();
    }

    #[test]
    fn exec_missing_program_leaves_process_intact() {
        let _guard = test_utils::kernel_lock();
        let pid = test_utils::install_process();
        let before = crate::process::table::with_pcb(pid, |pcb| pcb.user_paddr).unwrap();

        let command = USER_BASE + 0x1000;
        assert!(uaccess::copy_to_user(command, b"nonexistent\0"));
        let mut regs = IntRegs::default();
        assert!(sys_exec(command, &mut regs).is_err());

        let after = crate::process::table::with_pcb(pid, |pcb| pcb.user_paddr).unwrap();
        assert_eq!(before, after);
    }
}
