// Multiboot entry and the boot sequence.
//
// The loader enters `kernel_main` with the Multiboot magic and a pointer to
// the info record. Flags bit 3 carries the single boot module holding the
// filesystem archive, which must lie inside the kernel page.

use crate::process::Pid;

pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

const FLAG_MEM: u32 = 1 << 0;
const FLAG_CMDLINE: u32 = 1 << 2;
const FLAG_MODS: u32 = 1 << 3;

/// The filesystem module must fit in the first 4 MiB of physical memory,
/// which stays identity mapped.
const MODULE_LIMIT: u32 = 0x0040_0000;

#[repr(C)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
}

#[repr(C)]
pub struct MultibootModule {
    pub mod_start: u32,
    pub mod_end: u32,
    pub string: u32,
    pub reserved: u32,
}

/// Kernel entry, called from the loader shim with paging still off for the
/// identity-mapped low memory.
#[no_mangle]
pub extern "C" fn kernel_main(magic: u32, info_addr: u32) -> ! {
    if magic != MULTIBOOT_BOOTLOADER_MAGIC {
        super::vga::console_log("BOOT", format_args!("bad multiboot magic {:#x}", magic));
        super::halt_forever();
    }

    let info = unsafe { &*(info_addr as *const MultibootInfo) };

    super::gdt::init();
    super::idt::init();
    super::paging::init();
    crate::heap::init();

    if info.flags & FLAG_MEM != 0 {
        crate::info!(
            "mem_lower = {}KB, mem_upper = {}KB",
            info.mem_lower,
            info.mem_upper
        );
    }
    if info.flags & FLAG_CMDLINE != 0 {
        crate::debug!("cmdline at {:#x}", info.cmdline);
    }

    // Unpack the filesystem module
    if info.flags & FLAG_MODS != 0 && info.mods_count >= 1 {
        let module = unsafe { &*(info.mods_addr as *const MultibootModule) };
        if module.mod_end > MODULE_LIMIT {
            panic!("filesystem module does not fit in low memory");
        }
        let bytes = unsafe {
            core::slice::from_raw_parts(
                module.mod_start as *const u8,
                (module.mod_end - module.mod_start) as usize,
            )
        };
        match crate::fs::init_from_archive(bytes) {
            Ok(count) => crate::info!("filesystem: {} entries", count),
            Err(_) => panic!("filesystem module is not a valid archive"),
        }
    } else {
        crate::warn!("no filesystem module loaded");
    }

    super::pic::init();
    super::pit::init();
    crate::drivers::rtc::init_hw();
    crate::process::init();
    crate::drivers::init();
    crate::drivers::random::seed(crate::drivers::rtc::realtime_now() as u64);

    crate::info!("boot successful");
    start_shells()
}

static SHELL_PIDS: spin::Mutex<[Pid; crate::drivers::terminal::NUM_TERMINALS]> =
    spin::Mutex::new([-1; crate::drivers::terminal::NUM_TERMINALS]);

/// Spawn one shell per virtual terminal, then become the idle process.
fn start_shells() -> ! {
    for terminal in 0..crate::drivers::terminal::NUM_TERMINALS {
        spawn_shell(terminal);
    }
    idle_loop()
}

fn spawn_shell(terminal: usize) {
    match crate::process::exec::spawn("shell", terminal, -1) {
        Ok(pid) => SHELL_PIDS.lock()[terminal] = pid,
        Err(_) => crate::error!("failed to spawn shell on terminal {}", terminal),
    }
}

/// The idle process: run whoever is runnable, keep a shell alive on every
/// terminal, halt until the next interrupt.
fn idle_loop() -> ! {
    loop {
        crate::process::scheduler::yield_now();
        for terminal in 0..crate::drivers::terminal::NUM_TERMINALS {
            let pid = SHELL_PIDS.lock()[terminal];
            let alive = pid >= 0 && crate::process::table::with_pcb(pid, |_| ()).is_some();
            if !alive {
                spawn_shell(terminal);
            }
        }
        super::sti_hlt();
    }
}
