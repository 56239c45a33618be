// Flat-model GDT and the single TSS.
//
// Selector layout is fixed (see `arch::KERNEL_CS` and friends): null, spare,
// kernel code, kernel data, user code, user data, TSS. The TSS exists only
// so the CPU can find the kernel stack (esp0) on a ring 3 -> ring 0
// transition; there is no hardware task switching.

use core::arch::asm;
use core::mem::size_of;
use spin::Mutex;

#[repr(C, packed)]
struct TaskStateSegment {
    link: u32,
    esp0: u32,
    ss0: u32,
    unused: [u32; 23],
}

static TSS: Mutex<TaskStateSegment> = Mutex::new(TaskStateSegment {
    link: 0,
    esp0: 0,
    ss0: crate::arch::KERNEL_DS as u32,
    unused: [0; 23],
});

const GDT_ENTRIES: usize = 7;
static GDT: Mutex<[u64; GDT_ENTRIES]> = Mutex::new([0; GDT_ENTRIES]);

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u32,
}

/// Build a 32-bit segment descriptor.
fn segment(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let mut desc = 0u64;
    desc |= (limit & 0xFFFF) as u64;
    desc |= ((base & 0xFFFF) as u64) << 16;
    desc |= (((base >> 16) & 0xFF) as u64) << 32;
    desc |= (access as u64) << 40;
    desc |= (((limit >> 16) & 0xF) as u64) << 48;
    desc |= ((flags & 0xF) as u64) << 52;
    desc |= (((base >> 24) & 0xFF) as u64) << 56;
    desc
}

pub fn init() {
    let tss_base = {
        let tss = TSS.lock();
        &*tss as *const TaskStateSegment as u32
    };
    let tss_limit = size_of::<TaskStateSegment>() as u32 - 1;

    {
        let mut gdt = GDT.lock();
        gdt[0] = 0;
        gdt[1] = 0;
        // 4 GiB flat segments, 4 KiB granularity, 32-bit
        gdt[2] = segment(0, 0xFFFFF, 0x9A, 0xC); // kernel code
        gdt[3] = segment(0, 0xFFFFF, 0x92, 0xC); // kernel data
        gdt[4] = segment(0, 0xFFFFF, 0xFA, 0xC); // user code
        gdt[5] = segment(0, 0xFFFFF, 0xF2, 0xC); // user data
        // Available 32-bit TSS, byte granularity
        gdt[6] = segment(tss_base, tss_limit, 0x89, 0x0);

        let ptr = DescriptorPointer {
            limit: (GDT_ENTRIES * 8 - 1) as u16,
            base: gdt.as_ptr() as u32,
        };
        unsafe {
            asm!("lgdt [{}]", in(reg) &ptr as *const DescriptorPointer, options(nostack, preserves_flags));
        }
    }

    unsafe {
        // Reload segments against the new table
        asm!(
            "push {kcs}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            "mov ds, {kds:x}",
            "mov es, {kds:x}",
            "mov fs, {kds:x}",
            "mov gs, {kds:x}",
            "mov ss, {kds:x}",
            kcs = in(reg) crate::arch::KERNEL_CS as u32,
            kds = in(reg) crate::arch::KERNEL_DS as u32,
            tmp = out(reg) _,
        );
        // Load the task register (selector index 6)
        asm!("ltr {0:x}", in(reg) 0x30u16, options(nostack, preserves_flags));
    }
}

/// Point esp0 at the top of the next process's kernel stack before
/// resuming it.
pub fn set_kernel_stack(esp0: u32) {
    TSS.lock().esp0 = esp0;
}
