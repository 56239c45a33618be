// Interrupt dispatch.
//
// Every vector funnels into `dispatch` with the saved frame. CPU
// exceptions from ring 3 become signals (divide error and page fault) or
// kill the kernel; IRQs are acknowledged and routed through the handler
// table; vector 0x80 is the syscall trap. On the way back to ring 3 the
// pending-signal pass runs, so handlers never execute on a kernel context.

use spin::Mutex;

use crate::arch::IntRegs;

// Exception vectors
pub const EXC_DE: i32 = 0;
pub const EXC_PF: i32 = 14;
const NUM_EXCEPTIONS: i32 = 20;

// IRQ vectors
pub const INT_IRQ0: i32 = 0x20;
pub const INT_IRQ15: i32 = 0x2F;
pub const INT_SYSCALL: i32 = 0x80;

pub const NUM_IRQS: usize = 16;

// IRQ lines with fixed roles
pub const IRQ_PIT: u8 = 0;
pub const IRQ_KEYBOARD: u8 = 1;
pub const IRQ_RTC: u8 = 8;
pub const IRQ_MOUSE: u8 = 12;

pub type IrqHandler = fn();

static IRQ_HANDLERS: Mutex<[Option<IrqHandler>; NUM_IRQS]> = Mutex::new([None; NUM_IRQS]);

/// Install a handler for an IRQ line. Replacing a live handler is a bug.
pub fn register_irq_handler(irq: u8, handler: IrqHandler) {
    crate::arch::without_interrupts(|| {
        let mut handlers = IRQ_HANDLERS.lock();
        assert!(
            handlers[irq as usize].is_none(),
            "IRQ {} registered twice",
            irq
        );
        handlers[irq as usize] = Some(handler);
    });
}

fn irq_handler(irq: u8) -> Option<IrqHandler> {
    crate::arch::without_interrupts(|| IRQ_HANDLERS.lock()[irq as usize])
}

fn handle_exception(regs: &mut IntRegs) {
    if !regs.from_user() {
        panic!(
            "exception {} in kernel mode at {:#010x} (error code {:#x})",
            regs.int_num, regs.eip, regs.error_code
        );
    }
    match regs.int_num {
        EXC_DE => crate::process::signal::raise_executing(crate::process::signal::SIG_DIV_ZERO),
        EXC_PF => crate::process::signal::raise_executing(crate::process::signal::SIG_SEGFAULT),
        vector => panic!(
            "unhandled exception {} at {:#010x} (error code {:#x})",
            vector, regs.eip, regs.error_code
        ),
    }
}

fn handle_irq(regs: &mut IntRegs) {
    let irq = (regs.int_num - INT_IRQ0) as u8;

    // Acknowledge before running the handler so the next interrupt can
    // queue behind this one
    #[cfg(target_arch = "x86")]
    crate::arch::x86::pic::send_eoi(irq);

    match irq_handler(irq) {
        Some(handler) => handler(),
        None => crate::debug!("ignoring unexpected IRQ {}", irq),
    }

    // The PIT tick is the scheduler tick: preempt user mode
    if irq == IRQ_PIT && regs.from_user() {
        crate::process::scheduler::yield_now();
    }
}

/// Common dispatcher, entered from the assembly thunk with the saved frame.
pub fn dispatch(regs: &mut IntRegs) {
    match regs.int_num {
        vector if (0..NUM_EXCEPTIONS).contains(&vector) => handle_exception(regs),
        vector if (INT_IRQ0..=INT_IRQ15).contains(&vector) => handle_irq(regs),
        INT_SYSCALL => crate::syscall::handle(regs),
        vector => panic!("interrupt from unknown vector {}", vector),
    }

    // Deliver signals only when resuming ring 3; kernel contexts are never
    // detoured
    if regs.from_user() {
        crate::process::signal::handle_all(regs);
    }
}

#[cfg(test)]
pub fn reset() {
    *IRQ_HANDLERS.lock() = [None; NUM_IRQS];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{KERNEL_CS, USER_CS};
    use core::sync::atomic::{AtomicU32, Ordering};

    static FIRED: AtomicU32 = AtomicU32::new(0);

    fn counting_handler() {
        FIRED.fetch_add(1, Ordering::Relaxed);
    }

    fn frame(int_num: i32, cs: u16) -> IntRegs {
        let mut regs = IntRegs::default();
        regs.int_num = int_num;
        regs.cs = cs;
        regs.esp = crate::mm::USER_BASE + 0x10000;
        regs
    }

    #[test]
    fn registered_irqs_fire_and_unknown_irqs_are_ignored() {
        let _guard = crate::test_utils::kernel_lock();
        FIRED.store(0, Ordering::Relaxed);
        register_irq_handler(IRQ_KEYBOARD, counting_handler);

        let mut regs = frame(INT_IRQ0 + IRQ_KEYBOARD as i32, KERNEL_CS);
        dispatch(&mut regs);
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);

        // No handler installed: acknowledged and dropped
        let mut regs = frame(INT_IRQ0 + 5, KERNEL_CS);
        dispatch(&mut regs);
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn user_divide_error_raises_the_signal() {
        let _guard = crate::test_utils::kernel_lock();
        let pid = crate::test_utils::install_process();
        crate::process::table::set_current(pid);

        // A handler keeps the process alive through the delivery pass
        crate::process::table::with_pcb(pid, |pcb| {
            pcb.signals
                .set_handler(crate::process::signal::SIG_DIV_ZERO, crate::mm::USER_BASE + 0x9000)
        })
        .unwrap();

        let mut regs = frame(EXC_DE, USER_CS);
        regs.ss = crate::arch::USER_DS;
        dispatch(&mut regs);

        // The delivery pass already rewired the frame into the handler
        assert_eq!(regs.eip, crate::mm::USER_BASE + 0x9000);
    }

    #[test]
    #[should_panic(expected = "kernel mode")]
    fn kernel_mode_exception_panics() {
        let mut regs = frame(EXC_PF, KERNEL_CS);
        dispatch(&mut regs);
    }

    #[test]
    #[should_panic(expected = "unknown vector")]
    fn unknown_vector_panics() {
        let mut regs = frame(0x70, KERNEL_CS);
        dispatch(&mut regs);
    }

    #[test]
    fn syscall_results_are_written_back_before_signal_pass() {
        let _guard = crate::test_utils::kernel_lock();
        let pid = crate::test_utils::install_process();

        let mut regs = frame(INT_SYSCALL, USER_CS);
        regs.eax = crate::syscall::SYS_GETPID as u32;
        dispatch(&mut regs);
        assert_eq!(regs.eax as i32, pid);
    }
}
