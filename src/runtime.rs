use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::backend::Backend;
use crate::process::ChildTable;
use crate::queue::SignalQueue;
use crate::signal::Signal;
use crate::sys;

/// The per-process runtime: the signal queue, the event backend, the run
/// flag and the exit code, behind one cloneable handle.
///
/// Create one in `main` and hand clones to everything that needs to
/// construct wrappers or enqueue work. Exactly one thread runs
/// [`Runtime::exec`]; it is the sole consumer of the queue and the sole
/// caller of the backend's wait. Any thread may emit, enqueue or
/// [`Runtime::quit`].
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    queue: SignalQueue,
    backend: Backend,
    run: AtomicBool,
    quit_latched: AtomicBool,
    exit_code: AtomicI32,
    children: ChildTable,
}

impl Runtime {
    /// Build the runtime. Failure here (no selector handle) is fatal to
    /// the caller; there is nothing to fall back to.
    pub fn new() -> io::Result<Runtime> {
        let queue = SignalQueue::new()?;
        let backend = Backend::new()?;

        // The waker is what makes cross-thread enqueues visible to a
        // loop blocked in the kernel.
        {
            use std::os::unix::io::AsRawFd;
            let waker = queue.waker().clone();
            backend.add(
                waker.as_raw_fd(),
                sys::READ_FLAGS,
                Arc::new(move |_, _| {
                    let _ = waker.finish();
                }),
            )?;
        }

        Ok(Runtime {
            inner: Arc::new(Inner {
                queue,
                backend,
                run: AtomicBool::new(true),
                quit_latched: AtomicBool::new(false),
                exit_code: AtomicI32::new(0),
                children: ChildTable::new(),
            }),
        })
    }

    pub fn queue(&self) -> &SignalQueue {
        &self.inner.queue
    }

    pub fn backend(&self) -> &Backend {
        &self.inner.backend
    }

    pub(crate) fn children(&self) -> &ChildTable {
        &self.inner.children
    }

    /// Emit `sig` with `args`: bind and enqueue one call per live slot.
    pub fn enqueue<T: Clone + Send + 'static>(&self, sig: &Signal<T>, args: T) -> bool {
        sig.emit(&self.inner.queue, args)
    }

    /// Enqueue one closure directly, skipping the signal layer.
    pub fn single_shot<F: FnOnce() + Send + 'static>(&self, slot: F) {
        self.inner.queue.push(Box::new(slot));
    }

    pub fn running(&self) -> bool {
        self.inner.run.load(Ordering::Acquire)
    }

    /// Stop the loop after the current drain. The first call wins; later
    /// calls (and later codes) are ignored.
    pub fn quit(&self, code: i32) {
        if self.inner.quit_latched.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.exit_code.store(code, Ordering::Release);
        self.inner.run.store(false, Ordering::Release);
        debug!("quit({})", code);
        self.inner.queue.kick();
    }

    /// Run the loop until [`Runtime::quit`]: drain the queue, then block
    /// for the next stimulus — in the backend's wait when descriptors
    /// are watched, on the queue's condition variable otherwise.
    /// Returns the exit code.
    pub fn exec(&self) -> i32 {
        while self.running() {
            self.drain();

            if !self.running() {
                break;
            }

            // the waker registration is always present
            if self.inner.backend.watch_count() > 1 {
                let _ = self.poll(None);
            } else {
                self.inner.queue.wait_ready(&self.inner.run);
            }
        }

        self.drain();
        self.inner.exit_code.load(Ordering::Acquire)
    }

    /// One turn: wait up to `timeout` for descriptor readiness, then
    /// drain the queue. Returns how many calls ran.
    pub fn step(&self, timeout: Option<Duration>) -> usize {
        let _ = self.poll(timeout);
        self.drain()
    }

    /// Dispatch pending descriptor readiness without draining.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<bool> {
        self.inner.backend.poll(timeout)
    }

    /// Pop and invoke until the queue is empty. The queue lock is not
    /// held across an invocation, so slots are free to enqueue.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.inner.queue.pop() {
            task();
            ran += 1;
        }
        ran
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn signal_dispatch_end_to_end() {
        let rt = Runtime::new().unwrap();
        let sig: Signal<(i32, i32)> = Signal::new();

        struct Adder {
            sums: Mutex<Vec<i32>>,
        }

        let adder = Arc::new(Adder {
            sums: Mutex::new(Vec::new()),
        });
        sig.connect(&adder, |a, &(x, y)| {
            a.sums.lock().unwrap().push(x + y);
        });

        assert!(rt.enqueue(&sig, (7, 99)));
        rt.drain();

        assert_eq!(*adder.sums.lock().unwrap(), vec![106]);
    }

    #[test]
    fn late_deletion_elides_the_call() {
        let rt = Runtime::new().unwrap();
        let sig: Signal<i32> = Signal::new();

        struct Receiver {
            hits: AtomicUsize,
        }

        let receiver = Arc::new(Receiver {
            hits: AtomicUsize::new(0),
        });
        let observer = Arc::downgrade(&receiver);

        sig.connect(&receiver, |r, _| {
            r.hits.fetch_add(1, Ordering::SeqCst);
        });

        assert!(rt.enqueue(&sig, 1));
        drop(receiver);
        rt.drain();

        assert!(observer.upgrade().is_none());
    }

    #[test]
    fn quit_latches_the_first_code() {
        let rt = Runtime::new().unwrap();
        rt.quit(3);
        rt.quit(5);
        assert_eq!(rt.exec(), 3);
    }

    #[test]
    fn quit_from_a_slot_stops_exec() {
        let rt = Runtime::new().unwrap();

        let handle = rt.clone();
        rt.single_shot(move || handle.quit(42));

        assert_eq!(rt.exec(), 42);
    }

    #[test]
    fn quit_from_another_thread_interrupts_the_wait() {
        let rt = Runtime::new().unwrap();

        let handle = rt.clone();
        let quitter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.quit(9);
        });

        assert_eq!(rt.exec(), 9);
        quitter.join().unwrap();
    }

    #[test]
    fn single_shot_runs_once_per_drain() {
        let rt = Runtime::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        rt.single_shot(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(rt.drain(), 1);
        assert_eq!(rt.drain(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
