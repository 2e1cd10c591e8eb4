use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

use crate::queue::{SignalQueue, Task};

type Slot<T> = Arc<dyn Fn(&SignalQueue, &T) + Send + Sync>;

struct Binding<T> {
    // `None` for free functions and signal-to-signal links; otherwise a
    // weak handle whose liveness gates both emission and dispatch.
    receiver: Option<Weak<dyn Any + Send + Sync>>,
    slot: Slot<T>,
}

/// A typed emission point.
///
/// A signal owns an ordered list of bindings. Emitting does not call
/// anything directly: it binds the arguments to each live slot and
/// pushes the resulting closures onto the signal queue, so slots always
/// run on the loop thread, after the emitter has returned.
///
/// Receivers are `Arc`-owned objects. A binding holds only a weak
/// handle: dropping the receiver's last `Arc` unbinds it, and a slot
/// already sitting in the queue when its receiver dies is silently
/// elided at dispatch. A dispatched slot therefore always sees a live
/// receiver.
///
/// Multi-argument signals use tuples: `Signal<(RawFd, Ready)>`.
pub struct Signal<T> {
    bindings: Arc<Mutex<Vec<Binding<T>>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Signal<T> {
        Signal {
            bindings: self.bindings.clone(),
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Signal<T> {
        Signal {
            bindings: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone + Send + 'static> Signal<T> {
    pub fn new() -> Signal<T> {
        Signal::default()
    }

    /// Connect a receiver method. The slot is invoked with the receiver
    /// borrowed for the duration of the call, on the loop thread, only
    /// while the receiver is alive.
    pub fn connect<R, F>(&self, receiver: &Arc<R>, slot: F)
    where
        R: Send + Sync + 'static,
        F: Fn(&R, &T) + Send + Sync + 'static,
    {
        let target = Arc::downgrade(receiver);
        let anchor: Arc<dyn Any + Send + Sync> = receiver.clone();
        let anchor = Arc::downgrade(&anchor);

        let wrapped: Slot<T> = Arc::new(move |_queue, args| {
            if let Some(target) = target.upgrade() {
                slot(&target, args);
            }
        });

        self.bindings.lock().unwrap().push(Binding {
            receiver: Some(anchor),
            slot: wrapped,
        });
    }

    /// Connect a free function; no receiver, no liveness test.
    pub fn connect_fn<F>(&self, slot: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let wrapped: Slot<T> = Arc::new(move |_queue, args| slot(args));

        self.bindings.lock().unwrap().push(Binding {
            receiver: None,
            slot: wrapped,
        });
    }

    /// Connect this signal to another signal: emissions re-raise through
    /// the downstream signal's own enqueue path. Each hop costs one
    /// drain turn, so a cyclic graph cannot recurse; it merely circulates
    /// one hop per turn.
    pub fn connect_signal(&self, downstream: &Signal<T>) {
        let downstream = downstream.clone();
        let wrapped: Slot<T> = Arc::new(move |queue, args| {
            downstream.emit(queue, args.clone());
        });

        self.bindings.lock().unwrap().push(Binding {
            receiver: None,
            slot: wrapped,
        });
    }

    /// Bind the arguments to every live slot and enqueue the calls, in
    /// connection order. Bindings whose receiver died are removed on the
    /// way. Returns `false` when nothing was enqueued.
    pub fn emit(&self, queue: &SignalQueue, args: T) -> bool {
        let mut bindings = self.bindings.lock().unwrap();
        if bindings.is_empty() {
            return false;
        }

        let mut batch: Vec<Task> = Vec::with_capacity(bindings.len());

        bindings.retain(|binding| {
            if let Some(receiver) = &binding.receiver {
                if receiver.strong_count() == 0 {
                    return false;
                }
            }

            let slot = binding.slot.clone();
            let queue = queue.clone();
            let args = args.clone();
            batch.push(Box::new(move || slot(&queue, &args)));
            true
        });

        drop(bindings);

        if batch.is_empty() {
            return false;
        }

        queue.push_batch(batch);
        true
    }

    /// Remove every binding.
    pub fn disconnect_all(&self) {
        self.bindings.lock().unwrap().clear();
    }

    /// Remove every binding whose receiver is `receiver`.
    pub fn disconnect<R>(&self, receiver: &Arc<R>)
    where
        R: Send + Sync + 'static,
    {
        let key = Arc::as_ptr(receiver) as *const () as usize;

        self.bindings.lock().unwrap().retain(|binding| {
            binding
                .receiver
                .as_ref()
                .map_or(true, |weak| weak.as_ptr() as *const () as usize != key)
        });
    }

    pub fn connection_count(&self) -> usize {
        self.bindings.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn drain(queue: &SignalQueue) {
        while let Some(task) = queue.pop() {
            task();
        }
    }

    struct Counter {
        hits: AtomicUsize,
    }

    #[test]
    fn dispatch_in_connection_order() {
        let queue = SignalQueue::new().unwrap();
        let signal: Signal<i32> = Signal::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            signal.connect_fn(move |v| seen.lock().unwrap().push(format!("{}{}", tag, v)));
        }

        assert!(signal.emit(&queue, 7));
        drain(&queue);

        assert_eq!(*seen.lock().unwrap(), vec!["a7", "b7", "c7"]);
    }

    #[test]
    fn zero_bindings_is_a_noop() {
        let queue = SignalQueue::new().unwrap();
        let signal: Signal<i32> = Signal::new();

        assert!(!signal.emit(&queue, 1));
        assert!(queue.is_empty());
    }

    #[test]
    fn dead_receiver_is_elided_and_pruned() {
        let queue = SignalQueue::new().unwrap();
        let signal: Signal<i32> = Signal::new();

        let receiver = Arc::new(Counter {
            hits: AtomicUsize::new(0),
        });
        signal.connect(&receiver, |r, _| {
            r.hits.fetch_add(1, Ordering::SeqCst);
        });

        // enqueued while alive, receiver dies before the drain
        assert!(signal.emit(&queue, 1));
        drop(receiver);
        drain(&queue);

        // the next emission prunes the binding entirely
        assert!(!signal.emit(&queue, 2));
        assert_eq!(signal.connection_count(), 0);
    }

    #[test]
    fn disconnect_by_receiver() {
        let queue = SignalQueue::new().unwrap();
        let signal: Signal<i32> = Signal::new();

        let keep = Arc::new(Counter {
            hits: AtomicUsize::new(0),
        });
        let drop_me = Arc::new(Counter {
            hits: AtomicUsize::new(0),
        });

        signal.connect(&keep, |r, _| {
            r.hits.fetch_add(1, Ordering::SeqCst);
        });
        signal.connect(&drop_me, |r, _| {
            r.hits.fetch_add(1, Ordering::SeqCst);
        });

        signal.disconnect(&drop_me);
        assert_eq!(signal.connection_count(), 1);

        signal.emit(&queue, 1);
        drain(&queue);

        assert_eq!(keep.hits.load(Ordering::SeqCst), 1);
        assert_eq!(drop_me.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn signal_to_signal_costs_one_drain_turn() {
        let queue = SignalQueue::new().unwrap();
        let upstream: Signal<i32> = Signal::new();
        let downstream: Signal<i32> = Signal::new();

        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = hits.clone();
            downstream.connect_fn(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        upstream.connect_signal(&downstream);

        upstream.emit(&queue, 5);

        // first turn runs the forwarding hop only
        queue.pop().unwrap()();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // second turn runs the downstream slot
        drain(&queue);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arguments_are_copied_per_binding() {
        let queue = SignalQueue::new().unwrap();
        let signal: Signal<Vec<i32>> = Signal::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let seen = seen.clone();
            signal.connect_fn(move |v| seen.lock().unwrap().push(v.clone()));
        }

        signal.emit(&queue, vec![1, 2, 3]);
        drain(&queue);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
    }
}
