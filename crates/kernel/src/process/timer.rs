// Monotonic deadline timers.
//
// Each process owns at most one timer of each kind: the ALARM period timer
// and the sleep timer behind monosleep/poll timeouts. Entries live in one
// global table; callbacks run from the PIT interrupt and only wake or
// raise, never sleep.

use spin::Mutex;

use crate::process::table::MAX_PROCESSES;
use crate::process::Pid;

/// Period of the alarm signal.
pub const ALARM_PERIOD_NS: u64 = 10_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Raises SIG_ALARM and re-arms.
    Alarm,
    /// Wakes the process (monosleep, poll timeout).
    Sleep,
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    deadline_ns: u64,
    pid: Pid,
    kind: TimerKind,
}

static TIMERS: Mutex<heapless::Vec<TimerEntry, { 2 * MAX_PROCESSES }>> =
    Mutex::new(heapless::Vec::new());

/// Arm (or re-arm) a process timer for an absolute deadline.
pub fn arm(pid: Pid, kind: TimerKind, deadline_ns: u64) {
    crate::arch::without_interrupts(|| {
        let mut timers = TIMERS.lock();
        timers.retain(|t| !(t.pid == pid && t.kind == kind));
        let _ = timers.push(TimerEntry {
            deadline_ns,
            pid,
            kind,
        });
    });
}

pub fn disarm(pid: Pid, kind: TimerKind) {
    crate::arch::without_interrupts(|| {
        TIMERS.lock().retain(|t| !(t.pid == pid && t.kind == kind));
    });
}

pub fn disarm_all(pid: Pid) {
    crate::arch::without_interrupts(|| {
        TIMERS.lock().retain(|t| t.pid != pid);
    });
}

/// Fire every timer whose deadline has passed. Called from the PIT tick.
pub fn fire_due(now_ns: u64) {
    let due = crate::arch::without_interrupts(|| {
        let mut timers = TIMERS.lock();
        let mut due = heapless::Vec::<TimerEntry, { 2 * MAX_PROCESSES }>::new();
        timers.retain(|t| {
            if t.deadline_ns <= now_ns {
                let _ = due.push(*t);
                false
            } else {
                true
            }
        });
        due
    });

    for entry in due {
        match entry.kind {
            TimerKind::Alarm => {
                crate::process::signal::raise(entry.pid, crate::process::signal::SIG_ALARM);
                arm(entry.pid, TimerKind::Alarm, now_ns + ALARM_PERIOD_NS);
            }
            TimerKind::Sleep => crate::process::scheduler::wake(entry.pid),
        }
    }
}

#[cfg(test)]
pub fn reset() {
    TIMERS.lock().clear();
}

#[cfg(test)]
pub fn armed(pid: Pid, kind: TimerKind) -> Option<u64> {
    TIMERS
        .lock()
        .iter()
        .find(|t| t.pid == pid && t.kind == kind)
        .map(|t| t.deadline_ns)
}
