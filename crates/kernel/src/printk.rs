// Kernel logging (printk) with ring buffer.
//
// Log lines are formatted into a fixed in-kernel ring buffer and mirrored to
// the console sink of the architecture layer. The sink never blocks and
// never allocates, so the macros are safe to use from interrupt context.

use crate::ringbuf::RingBuffer;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

const LOG_RING_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static LOG_RING: Mutex<RingBuffer<LOG_RING_SIZE>> = Mutex::new(RingBuffer::new());

pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn log_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

struct RingWriter<'a, const N: usize>(&'a mut RingBuffer<N>);

impl<const N: usize> fmt::Write for RingWriter<'_, N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            self.0.push(b);
        }
        Ok(())
    }
}

/// Format one log line into the ring and mirror it to the console.
pub fn printk(level: LogLevel, args: fmt::Arguments) {
    if level > log_level() {
        return;
    }
    crate::arch::without_interrupts(|| {
        let mut ring = LOG_RING.lock();
        let mut w = RingWriter(&mut ring);
        let _ = write!(w, "[{:5}] {}\n", level.as_str(), args);
    });
    crate::arch::console_log(level.as_str(), args);
}

/// Drain the buffered log. Used by the shell's log command and by tests.
pub fn drain() -> alloc::vec::Vec<u8> {
    crate::arch::without_interrupts(|| {
        let mut ring = LOG_RING.lock();
        let mut out = alloc::vec::Vec::with_capacity(ring.len());
        while let Some(b) = ring.pop() {
            out.push(b);
        }
        out
    })
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::printk::printk($crate::printk::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::printk::printk($crate::printk::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::printk::printk($crate::printk::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::printk::printk($crate::printk::LogLevel::Debug, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_level_filter() {
        set_log_level(LogLevel::Warn);
        drain();
        crate::info!("not recorded");
        crate::warn!("recorded {}", 1);
        let out = alloc::string::String::from_utf8(drain()).unwrap();
        assert!(!out.contains("not recorded"));
        assert!(out.contains("recorded 1"));
        set_log_level(LogLevel::Info);
    }
}
