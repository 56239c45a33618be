// The process table: a fixed arena of PCB slots.
//
// All cross-process references are pids resolved through this table, so a
// freed PCB can never be reached through a stale pointer. Slot 0 is the
// idle process, which always exists.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicI32, Ordering};
use spin::Mutex;

use crate::error::{Errno, Result};
use crate::process::pcb::{Pcb, Pid, ProcessState};

/// Size of the PCB arena, including the idle slot.
pub const MAX_PROCESSES: usize = 16;

pub const IDLE_PID: Pid = 0;

const NO_SLOT: Option<Box<Pcb>> = None;

pub struct ProcessTable {
    slots: [Option<Box<Pcb>>; MAX_PROCESSES],
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            slots: [NO_SLOT; MAX_PROCESSES],
        }
    }

    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.slots
            .iter()
            .flatten()
            .map(|b| b.as_ref())
            .find(|p| p.pid == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.slots
            .iter_mut()
            .flatten()
            .map(|b| b.as_mut())
            .find(|p| p.pid == pid)
    }

    /// Insert a PCB into a free slot.
    pub fn insert(&mut self, pcb: Box<Pcb>) -> Result<()> {
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(pcb);
                return Ok(());
            }
        }
        Err(Errno::EFAIL)
    }

    /// Remove and return a PCB, freeing its slot.
    pub fn remove(&mut self, pid: Pid) -> Option<Box<Pcb>> {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|p| p.pid == pid) {
                return slot.take();
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.slots.iter().flatten().map(|b| b.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pcb> {
        self.slots.iter_mut().flatten().map(|b| b.as_mut())
    }

    /// Pids of all live children of `parent`.
    pub fn children_of(&self, parent: Pid) -> heapless::Vec<Pid, MAX_PROCESSES> {
        let mut pids = heapless::Vec::new();
        for pcb in self.iter() {
            if pcb.parent_pid == parent {
                let _ = pids.push(pcb.pid);
            }
        }
        pids
    }
}

lazy_static::lazy_static! {
    static ref PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());
}

static NEXT_PID: AtomicI32 = AtomicI32::new(1);
static CURRENT: AtomicI32 = AtomicI32::new(IDLE_PID);

/// Allocate a pid, unique for the lifetime of the process.
pub fn alloc_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Run `f` with the process table locked and interrupts disabled.
pub fn with_table<R>(f: impl FnOnce(&mut ProcessTable) -> R) -> R {
    crate::arch::without_interrupts(|| f(&mut PROCESS_TABLE.lock()))
}

/// Run `f` against one PCB; None if the pid is not live.
pub fn with_pcb<R>(pid: Pid, f: impl FnOnce(&mut Pcb) -> R) -> Option<R> {
    with_table(|table| table.get_mut(pid).map(f))
}

/// Pid of the currently executing process.
pub fn current_pid() -> Pid {
    CURRENT.load(Ordering::Relaxed)
}

pub fn set_current(pid: Pid) {
    CURRENT.store(pid, Ordering::Relaxed);
}

/// Run `f` against the executing process's PCB. Returns None for the idle
/// process, which has no user context.
pub fn with_current<R>(f: impl FnOnce(&mut Pcb) -> R) -> Option<R> {
    let pid = current_pid();
    if pid == IDLE_PID {
        return None;
    }
    with_pcb(pid, f)
}

/// Create the idle PCB and reset the execution context. Called once at boot.
pub fn init() {
    with_table(|table| {
        if table.get(IDLE_PID).is_none() {
            let mut idle = Box::new(Pcb::new(IDLE_PID, -1, 0, -1));
            idle.state = ProcessState::Running;
            table
                .insert(idle)
                .expect("process table cannot be full at boot");
        }
    });
    set_current(IDLE_PID);
}

#[cfg(test)]
pub fn reset() {
    with_table(|table| {
        for slot in table.slots.iter_mut() {
            *slot = None;
        }
    });
    set_current(IDLE_PID);
    init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_stay_unique_across_reuse() {
        let _guard = crate::test_utils::kernel_lock();
        let a = alloc_pid();
        let mut pcb = Box::new(Pcb::new(a, -1, 0, -1));
        pcb.state = ProcessState::Running;
        with_table(|t| t.insert(pcb)).unwrap();
        assert!(with_pcb(a, |p| p.pid).is_some());

        with_table(|t| t.remove(a)).unwrap();
        assert!(with_pcb(a, |p| p.pid).is_none());

        let b = alloc_pid();
        assert_ne!(a, b);
    }

    #[test]
    fn table_capacity_is_bounded() {
        let _guard = crate::test_utils::kernel_lock();
        let mut inserted = alloc::vec::Vec::new();
        loop {
            let pid = alloc_pid();
            let pcb = Box::new(Pcb::new(pid, -1, 0, -1));
            match with_table(|t| t.insert(pcb)) {
                Ok(()) => inserted.push(pid),
                Err(e) => {
                    assert_eq!(e, crate::error::Errno::EFAIL);
                    break;
                }
            }
        }
        // Idle occupies one slot
        assert_eq!(inserted.len(), MAX_PROCESSES - 1);
        for pid in inserted {
            with_table(|t| t.remove(pid));
        }
    }

    #[test]
    fn children_enumeration() {
        let _guard = crate::test_utils::kernel_lock();
        let parent = alloc_pid();
        with_table(|t| t.insert(Box::new(Pcb::new(parent, -1, 0, -1)))).unwrap();
        let c1 = alloc_pid();
        with_table(|t| t.insert(Box::new(Pcb::new(c1, parent, 0, -1)))).unwrap();
        let c2 = alloc_pid();
        with_table(|t| t.insert(Box::new(Pcb::new(c2, parent, 0, -1)))).unwrap();

        let kids = with_table(|t| t.children_of(parent));
        assert_eq!(kids.len(), 2);
        assert!(kids.contains(&c1) && kids.contains(&c2));

        for pid in [c1, c2, parent] {
            with_table(|t| t.remove(pid));
        }
    }
}
