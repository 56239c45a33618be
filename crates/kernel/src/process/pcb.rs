// Process control block.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::IntRegs;
use crate::process::signal::SignalTable;
use crate::process::wait::WaitQueue;
use crate::vfs::file::FdTable;

pub type Pid = i32;

/// Maximum argument length, including the NUL terminator.
pub const MAX_ARGS_LEN: usize = 128;

/// Kernel stack size per process.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Execution state of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created but never run; it has no scheduler call frame yet.
    New,
    /// On the scheduler run queue, or currently executing.
    Running,
    /// Linked into a wait queue or the timer table, waiting to be woken.
    Sleeping,
    /// Dead, waiting for the parent to call wait(). In no queues.
    Zombie,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PcbFlags: u8 {
        /// Virtual video memory mapped after the vidmap syscall.
        const VIDMAP = 1 << 0;
        /// VBE framebuffer mapped.
        const FBMAP = 1 << 1;
        /// Loaded as a raw image: stdin/stdout pinned, no ELF loader.
        const COMPAT = 1 << 2;
    }
}

/// Program break bounds inside the user page.
#[derive(Debug, Clone, Copy)]
pub struct HeapRange {
    pub brk_base: u32,
    pub brk_current: u32,
}

pub struct Pcb {
    pub pid: Pid,
    pub state: ProcessState,
    /// PID of the creating process, or negative when there is none.
    pub parent_pid: Pid,
    /// Process group; -1 means none.
    pub pgrp: Pid,
    /// Which virtual terminal the process reads/writes by default.
    pub terminal: usize,
    /// Physical base of the 4 MiB page backing the user region.
    pub user_paddr: u32,
    /// Saved frame used to (re-)enter user mode.
    pub regs: IntRegs,
    /// Saved kernel stack/base pointers; valid only while RUNNING.
    pub kernel_sp: usize,
    pub kernel_bp: usize,
    pub files: FdTable,
    pub signals: SignalTable,
    pub heap: HeapRange,
    pub args: heapless::String<MAX_ARGS_LEN>,
    pub exit_code: i32,
    pub flags: PcbFlags,
    /// Woken by exiting children; wait() blocks here.
    pub child_wait: Arc<WaitQueue>,
    /// Backing storage for the kernel stack; allocated when the process is
    /// first scheduled on a real CPU.
    pub kstack: Option<Vec<u8>>,
}

impl Pcb {
    pub fn new(pid: Pid, parent_pid: Pid, terminal: usize, pgrp: Pid) -> Self {
        Self {
            pid,
            state: ProcessState::New,
            parent_pid,
            pgrp,
            terminal,
            user_paddr: 0,
            regs: IntRegs::default(),
            kernel_sp: 0,
            kernel_bp: 0,
            files: FdTable::new(),
            signals: SignalTable::new(),
            heap: HeapRange {
                brk_base: 0,
                brk_current: 0,
            },
            args: heapless::String::new(),
            exit_code: 0,
            flags: PcbFlags::empty(),
            child_wait: WaitQueue::new(),
            kstack: None,
        }
    }

    pub fn is_zombie(&self) -> bool {
        self.state == ProcessState::Zombie
    }

    /// Mark dead with the given status. The caller tears down resources.
    pub fn exit(&mut self, exit_code: i32) {
        self.state = ProcessState::Zombie;
        self.exit_code = exit_code;
    }
}

impl core::fmt::Debug for Pcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pcb")
            .field("pid", &self.pid)
            .field("parent_pid", &self.parent_pid)
            .field("state", &self.state)
            .field("terminal", &self.terminal)
            .field("args", &self.args.as_str())
            .finish()
    }
}
