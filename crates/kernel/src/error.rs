// Kernel error handling and errno definitions.
//
// The syscall ABI surfaces errors as small negative integers; everything the
// core distinguishes fits in four codes. Kernel-internal code works in
// `Result` and the dispatcher folds `Err` into the saved frame's EAX slot.

/// Kernel error codes. Values match the userspace ABI (negated on return).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// Generic failure, the classical -1.
    EFAIL = 1,
    /// Interrupted by a pending signal.
    EINTR = 2,
    /// Operation would block.
    EAGAIN = 3,
    /// Pipe write with no reader.
    EPIPE = 4,
}

impl Errno {
    /// The negative value written into the syscall return slot.
    pub fn as_i32(self) -> i32 {
        -(self as i32)
    }

    pub fn description(self) -> &'static str {
        match self {
            Errno::EFAIL => "Operation failed",
            Errno::EINTR => "Interrupted system call",
            Errno::EAGAIN => "Try again",
            Errno::EPIPE => "Broken pipe",
        }
    }
}

pub type Result<T> = core::result::Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_abi() {
        assert_eq!(Errno::EFAIL.as_i32(), -1);
        assert_eq!(Errno::EINTR.as_i32(), -2);
        assert_eq!(Errno::EAGAIN.as_i32(), -3);
        assert_eq!(Errno::EPIPE.as_i32(), -4);
    }
}
