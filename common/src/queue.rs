//! The shared work queue behind the multi-threaded crawl.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
    producing: usize,
    done: bool,
}

/// A blocking FIFO with a "last worker out turns off the lights" protocol.
///
/// Every worker decrements the producing counter before trying to pop. If the
/// counter reaches zero while the queue is empty, no worker can ever push
/// again, so the queue is marked done and all blocked poppers wake up and
/// return `None`. A successful pop re-increments the counter, because the
/// popped directory may expand into new work. This keeps workers alive while
/// siblings are mid-expansion and avoids the deadlock of naively blocking on
/// an empty queue.
pub struct ConcurrentQueue<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
}

impl<T> ConcurrentQueue<T> {
    /// `workers` is the number of threads that will pop from this queue; the
    /// producing counter starts there since every worker begins with a pop.
    #[must_use]
    pub fn new(workers: usize) -> ConcurrentQueue<T> {
        ConcurrentQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                producing: workers,
                done: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn push(&self, value: T) {
        let mut inner = self.inner.lock().expect("crawl queue lock poisoned");
        inner.items.push_back(value);
        self.ready.notify_all();
    }

    /// Block until an item is available or all workers have gone idle.
    /// Returns `None` once the crawl is complete.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().expect("crawl queue lock poisoned");
        inner.producing -= 1;
        if inner.producing == 0 && inner.items.is_empty() {
            inner.done = true;
            self.ready.notify_all();
        }
        while inner.items.is_empty() && !inner.done {
            inner = self
                .ready
                .wait(inner)
                .expect("crawl queue lock poisoned");
        }
        if inner.done && inner.items.is_empty() {
            return None;
        }
        let value = inner.items.pop_front();
        inner.producing += 1;
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_worker_drains_and_terminates() {
        let queue = ConcurrentQueue::new(1);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn workers_do_not_exit_while_siblings_expand() {
        // worker A holds the only item and expands it into more work after a
        // delay; worker B must block rather than see an empty queue and quit
        let queue = std::sync::Arc::new(ConcurrentQueue::new(2));
        queue.push(0u32);
        let total = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let queue = queue.clone();
            let total = total.clone();
            handles.push(std::thread::spawn(move || {
                while let Some(item) = queue.pop() {
                    total.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if item < 4 {
                        std::thread::sleep(std::time::Duration::from_millis(10));
                        queue.push(item + 1);
                        queue.push(item + 1);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // node 0 expands into a binary tree of depth 4: 1 + 2 + 4 + 8 + 16
        assert_eq!(total.load(std::sync::atomic::Ordering::SeqCst), 31);
    }

    #[test]
    fn all_blocked_workers_wake_on_completion() {
        let queue: std::sync::Arc<ConcurrentQueue<u32>> =
            std::sync::Arc::new(ConcurrentQueue::new(3));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            handles.push(std::thread::spawn(move || queue.pop()));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), None);
        }
    }
}
