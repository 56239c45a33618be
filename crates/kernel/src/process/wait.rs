// Wait queues and the blocking primitive.
//
// A wait queue is a list of (node id, pid) entries. The node itself lives on
// the blocking caller's kernel stack and holds a handle to the queue it is
// linked into, so removal needs no search for the queue and unlinking is
// guaranteed on every exit path by the node's Drop.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::error::{Errno, Result};
use crate::process::Pid;

static NEXT_NODE_ID: AtomicU32 = AtomicU32::new(1);

pub struct WaitQueue {
    waiters: Mutex<Vec<(u32, Pid)>>,
}

impl WaitQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            waiters: Mutex::new(Vec::new()),
        })
    }

    fn add(&self, id: u32, pid: Pid) {
        crate::arch::without_interrupts(|| self.waiters.lock().push((id, pid)));
    }

    fn remove(&self, id: u32) {
        crate::arch::without_interrupts(|| self.waiters.lock().retain(|&(n, _)| n != id));
    }

    /// Mark every waiter runnable. Waiters are not unlinked; each blocker
    /// removes its own node when its wait completes.
    pub fn wake(&self) {
        let pids: Vec<Pid> =
            crate::arch::without_interrupts(|| self.waiters.lock().iter().map(|&(_, p)| p).collect());
        for pid in pids {
            crate::process::scheduler::wake(pid);
        }
    }

    pub fn is_empty(&self) -> bool {
        crate::arch::without_interrupts(|| self.waiters.lock().is_empty())
    }
}

/// Stack-allocated handle representing one blocked (or polling) process in
/// at most one wait queue.
pub struct WaitNode {
    id: u32,
    pid: Pid,
    queue: Option<Arc<WaitQueue>>,
}

impl WaitNode {
    pub fn new(pid: Pid) -> Self {
        Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            pid,
            queue: None,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.queue.is_some()
    }

    /// Link into `queue`. The node must not currently be in any queue.
    pub fn link(&mut self, queue: &Arc<WaitQueue>) {
        debug_assert!(!self.is_linked());
        queue.add(self.id, self.pid);
        self.queue = Some(queue.clone());
    }

    /// Unlink from the current queue; no-op when not linked.
    pub fn unlink(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.remove(self.id);
        }
    }
}

impl Drop for WaitNode {
    fn drop(&mut self) {
        self.unlink();
    }
}

fn wait_impl<F>(
    queue: Option<&Arc<WaitQueue>>,
    nonblocking: bool,
    interruptible: bool,
    mut cond: F,
) -> Result<i32>
where
    F: FnMut() -> Result<i32>,
{
    let mut node = WaitNode::new(crate::process::current_pid());
    if let Some(queue) = queue {
        node.link(queue);
    }
    loop {
        let ret = cond();
        if !matches!(ret, Err(Errno::EAGAIN)) || nonblocking {
            return ret;
        }
        if interruptible && crate::process::signal::has_pending_current() {
            return Err(Errno::EINTR);
        }
        crate::process::scheduler::sleep();
    }
}

/// Evaluate `cond` until it returns something other than `EAGAIN`, sleeping
/// on `queue` in between. A pending deliverable signal aborts the wait with
/// `EINTR`. With `nonblocking` the first result is returned as-is.
pub fn wait_interruptible<F>(
    queue: Option<&Arc<WaitQueue>>,
    nonblocking: bool,
    cond: F,
) -> Result<i32>
where
    F: FnMut() -> Result<i32>,
{
    wait_impl(queue, nonblocking, true, cond)
}

/// Like [`wait_interruptible`], but pending signals do not end the wait.
pub fn wait_uninterruptible<F>(
    queue: Option<&Arc<WaitQueue>>,
    nonblocking: bool,
    cond: F,
) -> Result<i32>
where
    F: FnMut() -> Result<i32>,
{
    wait_impl(queue, nonblocking, false, cond)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test nodes use pids far outside the table so wakes are no-ops.
    const FAKE_PID: Pid = 0x40_0000;

    #[test]
    fn node_links_into_one_queue_and_unlinks_on_drop() {
        let queue = WaitQueue::new();
        {
            let mut node = WaitNode::new(FAKE_PID);
            assert!(!node.is_linked());
            node.link(&queue);
            assert!(node.is_linked());
            assert!(!queue.is_empty());
            node.unlink();
            node.unlink(); // idempotent
            assert!(queue.is_empty());
            node.link(&queue);
        }
        // Dropped while linked: removed from the queue
        assert!(queue.is_empty());
    }

    #[test]
    fn wake_does_not_unlink() {
        let queue = WaitQueue::new();
        let mut node = WaitNode::new(FAKE_PID + 1);
        node.link(&queue);
        queue.wake();
        assert!(!queue.is_empty());
    }

    #[test]
    fn nonblocking_wait_returns_first_result() {
        let queue = WaitQueue::new();
        let ret = wait_interruptible(Some(&queue), true, || Err(Errno::EAGAIN));
        assert_eq!(ret, Err(Errno::EAGAIN));
        assert!(queue.is_empty());

        let ret = wait_interruptible(Some(&queue), true, || Ok(42));
        assert_eq!(ret, Ok(42));
    }
}
