// Clocks and the time syscalls.
//
// The monotonic clock is a 64-bit nanosecond counter advanced by the PIT
// tick; it never decreases. The realtime clock comes from the CMOS RTC
// collaborator. 64-bit state sits behind a spinlock because the 32-bit
// target has no 64-bit atomics; accessors disable interrupts so the tick
// cannot deadlock against a reader.

use spin::Mutex;

use crate::error::{Errno, Result};
use crate::syscall::uaccess;

/// PIT tick period: 100 Hz.
pub const PIT_PERIOD_NS: u64 = 10_000_000;

static MONO_NS: Mutex<u64> = Mutex::new(0);

/// Current monotonic time in nanoseconds.
pub fn monotime_now() -> u64 {
    crate::arch::without_interrupts(|| *MONO_NS.lock())
}

/// PIT interrupt handler: advance the clock and fire due timers. The
/// scheduler tick's user-mode preemption happens in the dispatcher.
pub fn pit_tick() {
    let now = crate::arch::without_interrupts(|| {
        let mut mono = MONO_NS.lock();
        *mono += PIT_PERIOD_NS;
        *mono
    });
    crate::process::timer::fire_due(now);
}

/// time() syscall: realtime seconds since the Unix epoch.
pub fn sys_time() -> Result<i32> {
    Ok(crate::drivers::rtc::realtime_now() as i32)
}

/// monotime() syscall: write the monotonic nanosecond counter through a
/// user pointer.
pub fn sys_monotime(out_addr: u32) -> Result<i32> {
    let now = monotime_now() as i64;
    if !uaccess::write_user(out_addr, &now) {
        crate::debug!("invalid pointer passed to monotime()");
        return Err(Errno::EFAIL);
    }
    Ok(0)
}

/// monosleep() syscall: sleep until an absolute monotonic deadline read
/// through a user pointer. Interruptible; a deadline in the past succeeds
/// immediately.
pub fn sys_monosleep(deadline_addr: u32) -> Result<i32> {
    let deadline: i64 = uaccess::read_user(deadline_addr).ok_or_else(|| {
        crate::debug!("invalid pointer passed to monosleep()");
        Errno::EFAIL
    })?;
    let deadline = deadline.max(0) as u64;

    let pid = crate::process::current_pid();
    crate::process::timer::arm(pid, crate::process::timer::TimerKind::Sleep, deadline);
    let ret = crate::process::wait::wait_interruptible(None, false, || {
        if monotime_now() >= deadline {
            Ok(0)
        } else {
            Err(Errno::EAGAIN)
        }
    });
    crate::process::timer::disarm(pid, crate::process::timer::TimerKind::Sleep);
    ret
}

#[cfg(test)]
pub fn reset() {
    *MONO_NS.lock() = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::USER_BASE;

    #[test]
    fn ticks_advance_monotonically() {
        let _guard = crate::test_utils::kernel_lock();
        let start = monotime_now();
        pit_tick();
        pit_tick();
        assert_eq!(monotime_now(), start + 2 * PIT_PERIOD_NS);
    }

    #[test]
    fn monotime_writes_through_user_pointer() {
        let _guard = crate::test_utils::kernel_lock();
        pit_tick();
        let addr = USER_BASE + 0x100;
        assert_eq!(sys_monotime(addr), Ok(0));
        let read_back: i64 = uaccess::read_user(addr).unwrap();
        assert_eq!(read_back as u64, monotime_now());

        assert_eq!(sys_monotime(0x10), Err(Errno::EFAIL));
    }

    #[test]
    fn monosleep_past_deadline_returns_immediately() {
        let _guard = crate::test_utils::kernel_lock();
        pit_tick();
        let addr = USER_BASE + 0x200;
        let past: i64 = 0;
        assert!(uaccess::write_user(addr, &past));
        assert_eq!(sys_monosleep(addr), Ok(0));
    }

    #[test]
    fn monosleep_interrupted_by_pending_signal() {
        let _guard = crate::test_utils::kernel_lock();
        let pid = crate::test_utils::install_process();
        crate::process::signal::raise(pid, crate::process::signal::SIG_INTERRUPT);

        let addr = USER_BASE + 0x300;
        let future: i64 = (monotime_now() + 1_000_000_000) as i64;
        assert!(uaccess::write_user(addr, &future));
        assert_eq!(sys_monosleep(addr), Err(Errno::EINTR));
        // The sleep timer is disarmed on the way out
        assert_eq!(
            crate::process::timer::armed(pid, crate::process::timer::TimerKind::Sleep),
            None
        );
    }
}
