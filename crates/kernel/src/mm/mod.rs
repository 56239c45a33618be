// User memory layout and the physical frame pool.
//
// Each process owns one 4 MiB physical frame, mapped at the fixed user
// virtual base while the process executes. The frame pool starts right
// above the kernel page.

use spin::Mutex;

use crate::error::{Errno, Result};

/// Virtual base of the user region (128 MiB).
pub const USER_BASE: u32 = 0x0800_0000;

/// Size of the user region: one 4 MiB page.
pub const USER_SIZE: usize = 4 << 20;

/// Initial user stack pointer, at the top of the user page.
pub const USER_STACK_TOP: u32 = USER_BASE + USER_SIZE as u32 - 4;

/// Conventional program image offset inside the user page.
pub const PROGRAM_OFFSET: u32 = 0x48000;

/// Virtual address of the vidmap page, just above the user page.
pub const VIDMAP_BASE: u32 = USER_BASE + USER_SIZE as u32;

/// The program break may not grow into the stack region at the top of the
/// user page.
pub const BRK_CEILING: u32 = USER_BASE + (USER_SIZE - 0x20000) as u32;

/// First physical frame handed to user processes (just above the kernel
/// page at 4-8 MiB).
const FRAME_BASE_PADDR: u32 = 0x0080_0000;

const NUM_FRAMES: usize = crate::process::MAX_PROCESSES;

static FRAMES: Mutex<[bool; NUM_FRAMES]> = Mutex::new([false; NUM_FRAMES]);

/// Allocate a 4 MiB user frame, returning its physical base.
pub fn alloc_user_frame() -> Result<u32> {
    crate::arch::without_interrupts(|| {
        let mut frames = FRAMES.lock();
        for (i, used) in frames.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Ok(FRAME_BASE_PADDR + (i as u32) * USER_SIZE as u32);
            }
        }
        Err(Errno::EFAIL)
    })
}

pub fn free_user_frame(paddr: u32) {
    if paddr < FRAME_BASE_PADDR {
        return;
    }
    let index = ((paddr - FRAME_BASE_PADDR) as usize) / USER_SIZE;
    crate::arch::without_interrupts(|| {
        let mut frames = FRAMES.lock();
        if index < NUM_FRAMES {
            frames[index] = false;
        }
    });
}

/// Repoint the user virtual region at the given frame. Part of the context
/// switch; also used transiently while loading a new image.
#[cfg(target_arch = "x86")]
pub fn switch_user_page(paddr: u32) {
    crate::arch::x86::paging::map_user(paddr);
}

#[cfg(not(target_arch = "x86"))]
pub fn switch_user_page(_paddr: u32) {}

/// Copy a parent's entire user page into a child's frame (fork). There is
/// only one user window, so the copy is staged through a kernel buffer,
/// remapping between source and destination for each chunk. The caller
/// re-maps its own page afterwards.
#[cfg(target_arch = "x86")]
pub fn copy_user_page(dst_paddr: u32, src_paddr: u32) {
    const CHUNK: usize = 64 * 1024;
    let mut buf = alloc::vec![0u8; CHUNK];
    let mut offset = 0usize;
    while offset < USER_SIZE {
        switch_user_page(src_paddr);
        let src = (USER_BASE as usize + offset) as *const u8;
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), CHUNK) };
        switch_user_page(dst_paddr);
        let dst = (USER_BASE as usize + offset) as *mut u8;
        unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), dst, CHUNK) };
        offset += CHUNK;
    }
}

#[cfg(not(target_arch = "x86"))]
pub fn copy_user_page(_dst_paddr: u32, _src_paddr: u32) {}

/// Map the vidmap page for the given terminal.
#[cfg(target_arch = "x86")]
pub fn map_vidmap(_terminal: usize) {
    const VGA_PADDR: u32 = 0x000B_8000;
    crate::arch::x86::paging::map_vidmap(VGA_PADDR);
}

#[cfg(not(target_arch = "x86"))]
pub fn map_vidmap(_terminal: usize) {}

#[cfg(test)]
pub fn reset_frames() {
    let mut frames = FRAMES.lock();
    *frames = [false; NUM_FRAMES];
}
