use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use log::trace;
use slab::Slab;

use crate::sys;

/// Callback invoked with `(fd, observed native flags)` when a watched
/// descriptor fires. Runs on the thread that called [`Backend::poll`];
/// typed wrappers use it only to enqueue signal emissions.
pub type Callback = Arc<dyn Fn(RawFd, u64) + Send + Sync>;

struct Registration {
    mask: u64,
    callback: Callback,
}

#[derive(Default)]
struct Table {
    registrations: Slab<Registration>,
    // fd -> registration keys, in registration order
    by_fd: IndexMap<RawFd, Vec<usize>>,
}

impl Table {
    fn aggregate_mask(&self, fd: RawFd) -> u64 {
        self.by_fd
            .get(&fd)
            .map(|keys| {
                keys.iter()
                    .fold(0u64, |acc, &key| acc | self.registrations[key].mask)
            })
            .unwrap_or(0)
    }
}

/// The process readiness demultiplexer: a registration table mirrored
/// into one kernel watch per descriptor.
///
/// Multiple registrations may coexist on the same descriptor with
/// different masks; the kernel learns the OR of them all, and a poll
/// wakeup dispatches to every registration whose mask intersects the
/// observed flags. The table is meant to be mutated from the loop
/// thread; other threads must enqueue a closure that registers on their
/// behalf.
pub struct Backend {
    selector: sys::Selector,
    table: Mutex<Table>,
    events: Mutex<sys::Events>,
}

impl Backend {
    pub fn new() -> io::Result<Backend> {
        Ok(Backend {
            selector: sys::Selector::new()?,
            table: Mutex::new(Table::default()),
            events: Mutex::new(sys::Events::new()),
        })
    }

    /// Register interest in `mask` (a native flag word) on `fd`. The
    /// kernel watch for `fd` becomes the OR of every registered mask.
    pub fn add(&self, fd: RawFd, mask: u64, callback: Callback) -> io::Result<()> {
        if mask == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty interest mask",
            ));
        }

        let mut table = self.table.lock().unwrap();
        let existing = table.aggregate_mask(fd);

        let key = table.registrations.insert(Registration { mask, callback });
        table.by_fd.entry(fd).or_default().push(key);

        let result = if existing == 0 {
            self.selector.add(fd, mask)
        } else if existing | mask != existing {
            self.selector.modify(fd, existing | mask)
        } else {
            Ok(())
        };

        if let Err(e) = result {
            // roll the table back so it keeps mirroring the kernel
            table.registrations.remove(key);
            let keys = table.by_fd.get_mut(&fd).unwrap();
            keys.retain(|&k| k != key);
            if keys.is_empty() {
                table.by_fd.shift_remove(&fd);
            }
            return Err(e);
        }

        trace!("watch fd {} mask {:#x}", fd, mask);
        Ok(())
    }

    /// Clear `mask` bits from every registration of `fd`. Registrations
    /// whose mask empties are dropped; the kernel watch is updated to
    /// the residual OR, or removed when nothing is left.
    pub fn remove(&self, fd: RawFd, mask: u64) -> bool {
        let mut table = self.table.lock().unwrap();

        let keys = match table.by_fd.get(&fd) {
            Some(keys) => keys.clone(),
            None => return false,
        };

        let mut residual = 0u64;
        for &key in &keys {
            let reg = &mut table.registrations[key];
            reg.mask &= !mask;
            residual |= reg.mask;
        }

        for &key in &keys {
            if table.registrations[key].mask == 0 {
                table.registrations.remove(key);
                let bucket = table.by_fd.get_mut(&fd).unwrap();
                bucket.retain(|&k| k != key);
            }
        }
        if table.by_fd.get(&fd).map_or(false, |b| b.is_empty()) {
            table.by_fd.shift_remove(&fd);
        }

        trace!("unwatch fd {} mask {:#x} residual {:#x}", fd, mask, residual);

        if residual == 0 {
            self.selector.delete(fd).is_ok()
        } else {
            self.selector.modify(fd, residual).is_ok()
        }
    }

    /// Number of live registrations.
    pub fn watch_count(&self) -> usize {
        self.table.lock().unwrap().registrations.len()
    }

    /// Block up to `timeout` (`None` = forever, zero = probe) and
    /// dispatch every observation to the matching callbacks. `Ok(false)`
    /// means nothing fired.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let timeout_ms = match timeout {
            None => -1,
            Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
        };

        let mut ready: Vec<(RawFd, u64)> = Vec::new();
        {
            let mut events = self.events.lock().unwrap();
            let count = self.selector.wait(&mut events, timeout_ms)?;
            ready.reserve(count);
            for idx in 0..count {
                if let Some(pair) = events.get(idx) {
                    ready.push(pair);
                }
            }
        }

        if ready.is_empty() {
            return Ok(false);
        }

        for (fd, observed) in ready {
            // snapshot matching callbacks, then run them unlocked so a
            // callback may re-enter add/remove
            let matching: Vec<Callback> = {
                let table = self.table.lock().unwrap();
                table
                    .by_fd
                    .get(&fd)
                    .map(|keys| {
                        keys.iter()
                            .map(|&key| &table.registrations[key])
                            .filter(|reg| observed & (reg.mask | sys::ERROR_FLAGS) != 0)
                            .map(|reg| reg.callback.clone())
                            .collect()
                    })
                    .unwrap_or_default()
            };

            for callback in matching {
                callback(fd, observed);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::sys::pipe;

    fn counter_callback(hits: &Arc<AtomicUsize>) -> Callback {
        let hits = hits.clone();
        Arc::new(move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn probe_with_nothing_ready_reports_false() {
        let backend = Backend::new().unwrap();
        let (reader, _writer) = pipe::pair().unwrap();

        backend
            .add(
                reader.as_raw_fd(),
                sys::READ_FLAGS,
                Arc::new(|_, _| panic!("no data was written")),
            )
            .unwrap();

        assert!(!backend.poll(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn dispatches_on_readable() {
        let backend = Backend::new().unwrap();
        let (reader, mut writer) = pipe::pair().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        backend
            .add(reader.as_raw_fd(), sys::READ_FLAGS, counter_callback(&hits))
            .unwrap();

        writer.write_all(b"x").unwrap();

        assert!(backend.poll(Some(Duration::from_millis(500))).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn residual_mask_after_partial_remove() {
        let backend = Backend::new().unwrap();
        let (reader, mut writer) = pipe::pair().unwrap();
        let fd = reader.as_raw_fd();

        let read_hits = Arc::new(AtomicUsize::new(0));
        let write_hits = Arc::new(AtomicUsize::new(0));

        backend
            .add(fd, sys::READ_FLAGS, counter_callback(&read_hits))
            .unwrap();
        backend
            .add(fd, sys::WRITE_FLAGS, counter_callback(&write_hits))
            .unwrap();
        assert_eq!(backend.watch_count(), 2);

        // drop the write interest; the read registration must survive
        assert!(backend.remove(fd, sys::WRITE_FLAGS));
        assert_eq!(backend.watch_count(), 1);

        writer.write_all(b"x").unwrap();
        assert!(backend.poll(Some(Duration::from_millis(500))).unwrap());

        assert_eq!(read_hits.load(Ordering::SeqCst), 1);
        assert_eq!(write_hits.load(Ordering::SeqCst), 0);

        // removing the rest tears the kernel watch down
        assert!(backend.remove(fd, sys::READ_FLAGS));
        assert_eq!(backend.watch_count(), 0);
        assert!(!backend.remove(fd, sys::READ_FLAGS));
    }

    #[test]
    fn empty_mask_is_rejected() {
        let backend = Backend::new().unwrap();
        assert!(backend.add(0, 0, Arc::new(|_, _| {})).is_err());
    }
}
