// Virtualised real-time clock.
//
// One hardware periodic interrupt at MAX_RTC_FREQ drives a global tick
// counter. Every open RTC file carries its own virtual frequency; a read
// blocks until the counter reaches the next multiple of the file's period,
// so slow and fast readers coexist on the one device. This is the worked
// example of per-open state living in the file object.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Errno, Result};
use crate::process::wait::{wait_interruptible, WaitQueue};
use crate::vfs::file::FileKind;

/// Highest virtual frequency; also the real interrupt rate.
pub const MAX_RTC_FREQ: u32 = 1024;

/// Default virtual frequency of a freshly opened file.
const DEFAULT_FREQ: u32 = 2;

static RTC_TICKS: AtomicU32 = AtomicU32::new(0);

lazy_static::lazy_static! {
    static ref RTC_QUEUE: Arc<WaitQueue> = WaitQueue::new();
}

/// Whether `freq` is a legal virtual frequency: a power of two in
/// [2, MAX_RTC_FREQ].
pub fn valid_freq(freq: u32) -> bool {
    freq.is_power_of_two() && (2..=MAX_RTC_FREQ).contains(&freq)
}

/// The tick count at which a read started now becomes ready: the next
/// multiple of the file's period.
pub fn next_target(counter: u32, freq: u32) -> u32 {
    let period = MAX_RTC_FREQ / freq;
    (counter + period) & period.wrapping_neg()
}

pub fn ticks() -> u32 {
    RTC_TICKS.load(Ordering::Relaxed)
}

/// Hardware interrupt: bump the counter and let blocked readers re-check.
pub fn handle_irq() {
    #[cfg(target_arch = "x86")]
    hw::ack_irq();
    RTC_TICKS.fetch_add(1, Ordering::Relaxed);
    RTC_QUEUE.wake();
}

/// Device constructor for `open("rtc")`.
pub fn open_device() -> Result<FileKind> {
    Ok(FileKind::Rtc {
        freq: AtomicU32::new(DEFAULT_FREQ),
    })
}

/// Block until the next virtual tick for this file's frequency. Returns 0;
/// the buffer is untouched.
pub fn read(freq: &AtomicU32, nonblocking: bool) -> Result<i32> {
    let target = next_target(ticks(), freq.load(Ordering::Relaxed));
    wait_interruptible(Some(&RTC_QUEUE), nonblocking, || {
        if ticks() >= target {
            Ok(0)
        } else {
            Err(Errno::EAGAIN)
        }
    })
}

/// Set the file's virtual frequency from a 4-byte integer write.
pub fn write(freq: &AtomicU32, buf: &[u8]) -> Result<i32> {
    if buf.len() != core::mem::size_of::<u32>() {
        return Err(Errno::EFAIL);
    }
    let requested = u32::from_le_bytes(buf.try_into().map_err(|_| Errno::EFAIL)?);
    if !valid_freq(requested) {
        return Err(Errno::EFAIL);
    }
    freq.store(requested, Ordering::Relaxed);
    Ok(0)
}

/// Seconds since the Unix epoch from separate clock components. The
/// algorithm follows the classical mktime reduction.
pub fn mktime(year: i32, month: i32, day: i32, hour: i32, min: i32, sec: i32) -> i64 {
    let mut year = year as i64;
    let mut month = month as i64 - 2;
    if month <= 0 {
        month += 12;
        year -= 1;
    }
    let leap_days = year / 4 - year / 100 + year / 400;
    let days = leap_days + 367 * month / 12 + day as i64 + year * 365 - 719_499;
    let hours = days * 24 + hour as i64;
    let mins = hours * 60 + min as i64;
    mins * 60 + sec as i64
}

/// Current realtime clock reading in seconds since the epoch; 0 when no
/// CMOS clock is reachable.
pub fn realtime_now() -> i64 {
    #[cfg(target_arch = "x86")]
    {
        hw::read_clock()
    }
    #[cfg(not(target_arch = "x86"))]
    {
        0
    }
}

#[cfg(target_arch = "x86")]
pub fn init_hw() {
    hw::init();
}

#[cfg(not(target_arch = "x86"))]
pub fn init_hw() {}

#[cfg(target_arch = "x86")]
mod hw {
    //! CMOS register access and the periodic interrupt setup.

    use crate::arch::x86::portio::{inb, outb};

    const RTC_PORT_INDEX: u16 = 0x70;
    const RTC_PORT_DATA: u16 = 0x71;

    const RTC_SECOND: u8 = 0;
    const RTC_MINUTE: u8 = 2;
    const RTC_HOUR: u8 = 4;
    const RTC_DAY: u8 = 7;
    const RTC_MONTH: u8 = 8;
    const RTC_YEAR: u8 = 9;
    const RTC_CENTURY: u8 = 50;
    const RTC_REG_A: u8 = 10;
    const RTC_REG_B: u8 = 11;
    const RTC_REG_C: u8 = 12;

    const RTC_A_RS: u8 = 0x0F;
    const RTC_A_UIP: u8 = 0x80;
    const RTC_B_24H: u8 = 1 << 1;
    const RTC_B_DM: u8 = 1 << 2;
    const RTC_B_PIE: u8 = 1 << 6;

    /// Rate selector for the 1024 Hz periodic interrupt.
    const RTC_A_RS_1024: u8 = 0x6;

    fn read_reg(reg: u8) -> u8 {
        unsafe {
            outb(RTC_PORT_INDEX, reg);
            inb(RTC_PORT_DATA)
        }
    }

    fn write_reg(reg: u8, value: u8) {
        unsafe {
            outb(RTC_PORT_INDEX, reg);
            outb(RTC_PORT_DATA, value);
        }
    }

    /// Reading register C re-arms the periodic interrupt.
    pub fn ack_irq() {
        read_reg(RTC_REG_C);
    }

    pub fn read_clock() -> i64 {
        while read_reg(RTC_REG_A) & RTC_A_UIP != 0 {}
        let sec = read_reg(RTC_SECOND) as i32;
        let min = read_reg(RTC_MINUTE) as i32;
        let hour = read_reg(RTC_HOUR) as i32;
        let day = read_reg(RTC_DAY) as i32;
        let month = read_reg(RTC_MONTH) as i32;
        let year = read_reg(RTC_YEAR) as i32 + 100 * read_reg(RTC_CENTURY) as i32;
        super::mktime(year, month, day, hour, min, sec)
    }

    pub fn init() {
        while read_reg(RTC_REG_A) & RTC_A_UIP != 0 {}

        // Periodic interrupts, binary values, 24 hour format
        let reg_b = read_reg(RTC_REG_B) | RTC_B_PIE | RTC_B_DM | RTC_B_24H;
        write_reg(RTC_REG_B, reg_b);

        // Real rate stays at the maximum; the per-file frequency is virtual
        let reg_a = (read_reg(RTC_REG_A) & !RTC_A_RS) | RTC_A_RS_1024;
        write_reg(RTC_REG_A, reg_a);

        crate::interrupts::register_irq_handler(crate::interrupts::IRQ_RTC, super::handle_irq);
        crate::arch::x86::pic::unmask(crate::interrupts::IRQ_RTC);
    }
}

#[cfg(test)]
pub fn reset() {
    RTC_TICKS.store(0, Ordering::Relaxed);
}
