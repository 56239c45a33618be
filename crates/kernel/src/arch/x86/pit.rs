// 8253/8254 programmable interval timer, channel 0.
//
// Programmed for a 100 Hz square wave; each interrupt advances the
// monotonic clock by the fixed tick period (`time::PIT_PERIOD_NS`).

use super::portio::outb;

const PIT_CH0_DATA: u16 = 0x40;
const PIT_CMD: u16 = 0x43;

// Channel 0, lobyte/hibyte access, mode 3 (square wave), binary counting
const PIT_CMD_CH0_SQUARE: u8 = 0x36;

/// Base oscillator frequency in Hz.
const PIT_BASE_HZ: u32 = 1_193_182;

/// Scheduler tick rate in Hz; must agree with `time::PIT_PERIOD_NS`.
pub const PIT_HZ: u32 = 100;

pub fn init() {
    let divisor = (PIT_BASE_HZ / PIT_HZ) as u16;
    unsafe {
        outb(PIT_CMD, PIT_CMD_CH0_SQUARE);
        outb(PIT_CH0_DATA, (divisor & 0xFF) as u8);
        outb(PIT_CH0_DATA, (divisor >> 8) as u8);
    }
    crate::interrupts::register_irq_handler(crate::interrupts::IRQ_PIT, crate::time::pit_tick);
    super::pic::unmask(crate::interrupts::IRQ_PIT);
}
