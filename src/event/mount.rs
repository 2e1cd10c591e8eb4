use std::io;
use std::sync::{Arc, Mutex};

use crate::info::fstable::FsEntry;
use crate::info::mounts;
use crate::queue::SignalQueue;
use crate::runtime::Runtime;
use crate::signal::Signal;

/// Raises `(device, mount point)` signals as filesystems come and go.
///
/// The kernel marks the mount table file priority-readable on change
/// where it can; elsewhere a ten-second timer re-reads the table. Either
/// way the wrapper diffs the table against its last snapshot, so an
/// unchanged table emits nothing.
pub struct MountEvent {
    #[allow(dead_code)]
    runtime: Runtime,
    inner: Inner,

    pub mounted: Signal<(String, String)>,
    pub unmounted: Signal<(String, String)>,
}

struct MountState {
    queue: SignalQueue,
    mounted: Signal<(String, String)>,
    unmounted: Signal<(String, String)>,
    table: Mutex<Vec<FsEntry>>,
}

impl MountState {
    fn compare(&self) {
        let fresh = match mounts::mounts() {
            Ok(fresh) => fresh,
            Err(_) => return,
        };

        let mut table = self.table.lock().unwrap();
        let (mounted, unmounted) = diff(&table, &fresh);
        *table = fresh;
        drop(table);

        for pair in mounted {
            self.mounted.emit(&self.queue, pair);
        }
        for pair in unmounted {
            self.unmounted.emit(&self.queue, pair);
        }
    }
}

type MountPair = (String, String);

/// Entries present in `new` but not `old`, and vice versa, keyed by
/// `(device, path)`.
fn diff(old: &[FsEntry], new: &[FsEntry]) -> (Vec<MountPair>, Vec<MountPair>) {
    let key = |e: &FsEntry| (e.device.clone(), e.path.clone());

    let mounted = new
        .iter()
        .filter(|e| !old.iter().any(|o| o.device == e.device && o.path == e.path))
        .map(key)
        .collect();

    let unmounted = old
        .iter()
        .filter(|e| !new.iter().any(|n| n.device == e.device && n.path == e.path))
        .map(key)
        .collect();

    (mounted, unmounted)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
struct Inner {
    file: crate::sys::fd::FileDesc,
    _state: Arc<MountState>,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl MountEvent {
    pub fn new(runtime: &Runtime) -> io::Result<MountEvent> {
        use std::ffi::CString;
        use std::os::unix::io::AsRawFd;

        use crate::sys::{fd::FileDesc, syscall};

        let mounted: Signal<(String, String)> = Signal::new();
        let unmounted: Signal<(String, String)> = Signal::new();

        let state = Arc::new(MountState {
            queue: runtime.queue().clone(),
            mounted: mounted.clone(),
            unmounted: unmounted.clone(),
            table: Mutex::new(mounts::mounts().unwrap_or_default()),
        });

        let c_path = CString::new(mounts::MOUNT_TABLE_FILE).unwrap();
        let fd = syscall!(open(
            c_path.as_ptr(),
            libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC
        ))?;
        let file = unsafe { FileDesc::new(fd) };

        let watcher = state.clone();
        runtime.backend().add(
            file.as_raw_fd(),
            crate::sys::PRIORITY_FLAGS,
            Arc::new(move |_, _| watcher.compare()),
        )?;

        Ok(MountEvent {
            runtime: runtime.clone(),
            inner: Inner {
                file,
                _state: state,
            },
            mounted,
            unmounted,
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Drop for MountEvent {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;

        self.runtime
            .backend()
            .remove(self.inner.file.as_raw_fd(), crate::sys::PRIORITY_FLAGS);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
struct Inner {
    _timer: Arc<super::TimerEvent>,
    _state: Arc<MountState>,
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl MountEvent {
    const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

    pub fn new(runtime: &Runtime) -> io::Result<MountEvent> {
        let mounted: Signal<(String, String)> = Signal::new();
        let unmounted: Signal<(String, String)> = Signal::new();

        let state = Arc::new(MountState {
            queue: runtime.queue().clone(),
            mounted: mounted.clone(),
            unmounted: unmounted.clone(),
            table: Mutex::new(mounts::mounts().unwrap_or_default()),
        });

        let timer = Arc::new(super::TimerEvent::new(runtime)?);
        timer
            .expired
            .connect(&state, |watch, _| watch.compare());
        timer.start(Self::POLL_INTERVAL, Some(Self::POLL_INTERVAL))?;

        Ok(MountEvent {
            runtime: runtime.clone(),
            inner: Inner {
                _timer: timer,
                _state: state,
            },
            mounted,
            unmounted,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(device: &str, path: &str) -> FsEntry {
        FsEntry {
            device: device.to_string(),
            path: path.to_string(),
            filesystems: "ext4".to_string(),
            options: "rw".to_string(),
            dump_frequency: 0,
            pass: 0,
        }
    }

    #[test]
    fn unchanged_table_diffs_to_nothing() {
        let table = vec![entry("/dev/sda1", "/"), entry("tmpfs", "/tmp")];
        let (mounted, unmounted) = diff(&table, &table.clone());
        assert!(mounted.is_empty());
        assert!(unmounted.is_empty());
    }

    #[test]
    fn additions_and_removals_split() {
        let old = vec![entry("/dev/sda1", "/"), entry("tmpfs", "/tmp")];
        let new = vec![entry("/dev/sda1", "/"), entry("/dev/sdb1", "/mnt")];

        let (mounted, unmounted) = diff(&old, &new);
        assert_eq!(mounted, vec![("/dev/sdb1".to_string(), "/mnt".to_string())]);
        assert_eq!(unmounted, vec![("tmpfs".to_string(), "/tmp".to_string())]);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn construction_registers_the_table_watch() {
        let rt = Runtime::new().unwrap();
        let before = rt.backend().watch_count();

        let watch = MountEvent::new(&rt).unwrap();
        assert_eq!(rt.backend().watch_count(), before + 1);

        drop(watch);
        assert_eq!(rt.backend().watch_count(), before);
    }
}
