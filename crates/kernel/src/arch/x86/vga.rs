// VGA text console.
//
// One 80x25 text page per virtual terminal; the active terminal's page is
// mirrored into the hardware buffer at 0xB8000. Writes from background
// terminals only touch their backing page.

use core::fmt;
use spin::Mutex;

const VGA_BUFFER: usize = 0xB8000;
const COLS: usize = 80;
const ROWS: usize = 25;
const ATTR: u8 = 0x07; // Grey on black

use crate::drivers::terminal::NUM_TERMINALS;

struct Page {
    chars: [u8; COLS * ROWS],
    row: usize,
    col: usize,
}

impl Page {
    const fn new() -> Self {
        Self {
            chars: [b' '; COLS * ROWS],
            row: 0,
            col: 0,
        }
    }

    fn put(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                self.col = 0;
                self.row += 1;
            }
            b'\r' => self.col = 0,
            0x08 => {
                // Backspace: erase the previous cell
                if self.col > 0 {
                    self.col -= 1;
                    self.chars[self.row * COLS + self.col] = b' ';
                }
            }
            _ => {
                self.chars[self.row * COLS + self.col] = byte;
                self.col += 1;
                if self.col == COLS {
                    self.col = 0;
                    self.row += 1;
                }
            }
        }
        if self.row == ROWS {
            self.scroll();
        }
    }

    fn scroll(&mut self) {
        self.chars.copy_within(COLS.., 0);
        for cell in &mut self.chars[COLS * (ROWS - 1)..] {
            *cell = b' ';
        }
        self.row = ROWS - 1;
    }

    fn clear(&mut self) {
        self.chars.fill(b' ');
        self.row = 0;
        self.col = 0;
    }
}

struct Console {
    pages: [Page; NUM_TERMINALS],
}

static CONSOLE: Mutex<Console> = Mutex::new(Console {
    pages: [Page::new(), Page::new(), Page::new()],
});

fn flush(page: &Page) {
    let vram = VGA_BUFFER as *mut u8;
    for (i, &ch) in page.chars.iter().enumerate() {
        unsafe {
            vram.add(i * 2).write_volatile(ch);
            vram.add(i * 2 + 1).write_volatile(ATTR);
        }
    }
}

fn with_page<R>(terminal: usize, f: impl FnOnce(&mut Page) -> R) -> R {
    crate::arch::without_interrupts(|| {
        let mut console = CONSOLE.lock();
        let ret = f(&mut console.pages[terminal]);
        if terminal == crate::drivers::terminal::active() {
            flush(&console.pages[terminal]);
        }
        ret
    })
}

pub fn console_write(terminal: usize, bytes: &[u8]) {
    if terminal >= NUM_TERMINALS {
        return;
    }
    with_page(terminal, |page| {
        for &b in bytes {
            page.put(b);
        }
    });
}

pub fn console_clear(terminal: usize) {
    if terminal >= NUM_TERMINALS {
        return;
    }
    with_page(terminal, |page| page.clear());
}

/// Re-mirror a terminal's page after a terminal switch.
pub fn console_show(terminal: usize) {
    if terminal >= NUM_TERMINALS {
        return;
    }
    crate::arch::without_interrupts(|| {
        let console = CONSOLE.lock();
        flush(&console.pages[terminal]);
    });
}

/// Log sink: renders one formatted line on the active terminal.
pub fn console_log(level: &str, args: fmt::Arguments) {
    use fmt::Write;

    struct Sink(usize);
    impl fmt::Write for Sink {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            console_write(self.0, s.as_bytes());
            Ok(())
        }
    }

    let mut sink = Sink(crate::drivers::terminal::active());
    let _ = write!(sink, "[{}] {}\n", level, args);
}
