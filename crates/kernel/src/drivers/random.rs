// Random byte device, backed by a xorshift64 generator seeded from the
// realtime clock at boot.

use spin::Mutex;

use crate::error::Result;
use crate::vfs::file::FileKind;

static STATE: Mutex<u64> = Mutex::new(0);

pub fn seed(seed: u64) {
    crate::arch::without_interrupts(|| {
        *STATE.lock() = seed;
    });
}

fn next_u64() -> u64 {
    crate::arch::without_interrupts(|| {
        let mut state = STATE.lock();
        let mut x = *state;
        if x == 0 {
            x = 0x1234_5678_9ABC_DEF0;
        }
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *state = x;
        x
    })
}

pub fn open_device() -> Result<FileKind> {
    Ok(FileKind::Random)
}

/// Fill the buffer with random bytes. Never blocks.
pub fn read(buf: &mut [u8]) -> Result<i32> {
    for chunk in buf.chunks_mut(8) {
        let word = next_u64().to_le_bytes();
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
    Ok(buf.len() as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_whole_buffer_with_varied_bytes() {
        let _guard = crate::test_utils::kernel_lock();
        seed(42);
        let mut buf = [0u8; 100];
        assert_eq!(read(&mut buf), Ok(100));
        // A constant output would mean the generator is not advancing
        assert!(buf.windows(8).any(|w| w != &buf[..8]));

        let mut again = [0u8; 100];
        read(&mut again).unwrap();
        assert_ne!(buf, again);
    }

    #[test]
    fn sequence_is_deterministic_for_a_seed() {
        let _guard = crate::test_utils::kernel_lock();
        seed(7);
        let mut a = [0u8; 16];
        read(&mut a).unwrap();
        seed(7);
        let mut b = [0u8; 16];
        read(&mut b).unwrap();
        assert_eq!(a, b);
    }
}
