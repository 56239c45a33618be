// Kernel heap.
//
// A fixed region above the kernel image backs the `alloc` crate on x86. On
// the host (tests) the system allocator is used instead.

#[cfg(all(target_arch = "x86", not(test)))]
mod imp {
    use linked_list_allocator::LockedHeap;

    /// Heap region: 2-2.5 MiB inside the kernel page.
    const HEAP_START: usize = 0x0060_0000;
    const HEAP_SIZE: usize = 0x0008_0000;

    #[global_allocator]
    static ALLOCATOR: LockedHeap = LockedHeap::empty();

    pub fn init() {
        unsafe {
            ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE);
        }
    }
}

#[cfg(all(target_arch = "x86", not(test)))]
pub use imp::init;

#[cfg(not(all(target_arch = "x86", not(test))))]
pub fn init() {}
