use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::waker::Waker;

/// A deferred invocation: arguments already bound, nothing left to pass.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The process-wide FIFO of deferred calls.
///
/// Producers on any thread push bound closures; the single loop thread
/// drains them in order. One mutex guards the deque; the condition
/// variable and the waker fd announce the empty→non-empty transition to
/// a consumer blocked on either the condvar or the kernel.
#[derive(Clone)]
pub struct SignalQueue {
    inner: Arc<Inner>,
}

struct Inner {
    tasks: Mutex<VecDeque<Task>>,
    condvar: Condvar,
    waker: Waker,
}

impl SignalQueue {
    pub(crate) fn new() -> io::Result<SignalQueue> {
        Ok(SignalQueue {
            inner: Arc::new(Inner {
                tasks: Mutex::new(VecDeque::new()),
                condvar: Condvar::new(),
                waker: Waker::new()?,
            }),
        })
    }

    /// Enqueue one bound closure.
    pub fn push(&self, task: Task) {
        let was_empty = {
            let mut tasks = self.inner.tasks.lock().unwrap();
            let was_empty = tasks.is_empty();
            tasks.push_back(task);
            was_empty
        };

        if was_empty {
            self.announce();
        }
    }

    /// Enqueue a batch under one lock acquisition with one announcement;
    /// this is the emission path of a signal with several bindings.
    pub fn push_batch(&self, batch: Vec<Task>) {
        if batch.is_empty() {
            return;
        }

        let was_empty = {
            let mut tasks = self.inner.tasks.lock().unwrap();
            let was_empty = tasks.is_empty();
            tasks.extend(batch);
            was_empty
        };

        if was_empty {
            self.announce();
        }
    }

    pub(crate) fn pop(&self) -> Option<Task> {
        self.inner.tasks.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tasks.lock().unwrap().is_empty()
    }

    /// Block until the queue is non-empty or `run` clears.
    pub(crate) fn wait_ready(&self, run: &AtomicBool) {
        let mut tasks = self.inner.tasks.lock().unwrap();
        while tasks.is_empty() && run.load(Ordering::Acquire) {
            tasks = self.inner.condvar.wait(tasks).unwrap();
        }
    }

    /// Wake a blocked consumer without enqueuing anything (quit path).
    pub(crate) fn kick(&self) {
        self.announce();
    }

    pub(crate) fn waker(&self) -> &Waker {
        &self.inner.waker
    }

    fn announce(&self) {
        self.inner.condvar.notify_all();
        let _ = self.inner.waker.wakeup();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fifo_order() {
        let queue = SignalQueue::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let seen = seen.clone();
            queue.push(Box::new(move || seen.lock().unwrap().push(i)));
        }

        while let Some(task) = queue.pop() {
            task();
        }

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn cross_thread_handoff() {
        let queue = SignalQueue::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let producer = {
            let queue = queue.clone();
            let hits = hits.clone();
            std::thread::spawn(move || {
                queue.push(Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }));
            })
        };

        let run = AtomicBool::new(true);
        queue.wait_ready(&run);
        producer.join().unwrap();

        queue.pop().unwrap()();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }
}
