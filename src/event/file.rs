use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fmt, ops};

use crate::runtime::Runtime;
use crate::signal::Signal;

/// What happened to a watched file.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct FileFlags(u8);

const READ_EVENT: u8 = 0x01;
const WRITE_EVENT: u8 = 0x02;
const ATTRIBUTE_MOD: u8 = 0x04;
const MOVED: u8 = 0x08;
const DELETED: u8 = 0x10;

impl FileFlags {
    pub fn empty() -> FileFlags {
        FileFlags(0)
    }

    /// File was read from.
    pub fn read_event() -> FileFlags {
        FileFlags(READ_EVENT)
    }

    /// File contents were modified.
    pub fn write_event() -> FileFlags {
        FileFlags(WRITE_EVENT)
    }

    /// Metadata changed: permissions, timestamps, ownership, link count.
    pub fn attribute_mod() -> FileFlags {
        FileFlags(ATTRIBUTE_MOD)
    }

    /// The watched file itself was moved.
    pub fn moved() -> FileFlags {
        FileFlags(MOVED)
    }

    /// The watched file itself was deleted.
    pub fn deleted() -> FileFlags {
        FileFlags(DELETED)
    }

    pub fn any() -> FileFlags {
        FileFlags(READ_EVENT | WRITE_EVENT | ATTRIBUTE_MOD | MOVED | DELETED)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_read_event(&self) -> bool {
        self.0 & READ_EVENT != 0
    }

    pub fn is_write_event(&self) -> bool {
        self.0 & WRITE_EVENT != 0
    }

    pub fn is_attribute_mod(&self) -> bool {
        self.0 & ATTRIBUTE_MOD != 0
    }

    pub fn is_moved(&self) -> bool {
        self.0 & MOVED != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.0 & DELETED != 0
    }

    pub fn contains(&self, other: FileFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: FileFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl ops::BitOr for FileFlags {
    type Output = FileFlags;

    fn bitor(self, other: FileFlags) -> FileFlags {
        FileFlags(self.0 | other.0)
    }
}

impl ops::BitOrAssign for FileFlags {
    fn bitor_assign(&mut self, other: FileFlags) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for FileFlags {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (FileFlags::read_event(), "ReadEvent"),
            (FileFlags::write_event(), "WriteEvent"),
            (FileFlags::attribute_mod(), "AttributeMod"),
            (FileFlags::moved(), "Moved"),
            (FileFlags::deleted(), "Deleted"),
        ];

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;
                one = true
            }
        }

        if !one {
            fmt.write_str("(empty)")?;
        }

        Ok(())
    }
}

/// Watches one file for the requested [`FileFlags`], re-raising each
/// observed change through [`FileEvent::activated`] exactly once.
pub struct FileEvent {
    runtime: Runtime,
    inner: Inner,
    path: PathBuf,
    flags: FileFlags,

    /// `(path, observed flags)` per change.
    pub activated: Signal<(PathBuf, FileFlags)>,
}

impl FileEvent {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> FileFlags {
        self.flags
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn to_native(flags: FileFlags) -> u32 {
    let mut mask = 0;

    if flags.is_read_event() {
        mask |= libc::IN_ACCESS;
    }
    if flags.is_write_event() {
        mask |= libc::IN_MODIFY;
    }
    if flags.is_attribute_mod() {
        mask |= libc::IN_ATTRIB;
    }
    if flags.is_moved() {
        mask |= libc::IN_MOVE_SELF;
    }
    if flags.is_deleted() {
        mask |= libc::IN_DELETE_SELF;
    }

    mask
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn from_native(mask: u32) -> FileFlags {
    let mut flags = FileFlags::empty();

    if mask & libc::IN_ACCESS != 0 {
        flags |= FileFlags::read_event();
    }
    if mask & libc::IN_MODIFY != 0 {
        flags |= FileFlags::write_event();
    }
    if mask & libc::IN_ATTRIB != 0 {
        flags |= FileFlags::attribute_mod();
    }
    if mask & libc::IN_MOVE_SELF != 0 {
        flags |= FileFlags::moved();
    }
    if mask & libc::IN_DELETE_SELF != 0 {
        flags |= FileFlags::deleted();
    }

    flags
}

#[cfg(any(target_os = "linux", target_os = "android"))]
struct Inner {
    inotify: Arc<crate::sys::fd::FileDesc>,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl FileEvent {
    pub fn new<P: AsRef<Path>>(
        runtime: &Runtime,
        path: P,
        flags: FileFlags,
    ) -> io::Result<FileEvent> {
        use std::ffi::CString;
        use std::mem;
        use std::os::unix::ffi::OsStrExt;
        use std::os::unix::io::AsRawFd;

        use crate::sys::{fd::FileDesc, syscall};

        let path = path.as_ref().to_path_buf();

        let fd = syscall!(inotify_init1(libc::IN_CLOEXEC | libc::IN_NONBLOCK))?;
        let inotify = Arc::new(unsafe { FileDesc::new(fd) });

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains nul"))?;
        syscall!(inotify_add_watch(
            inotify.as_raw_fd(),
            c_path.as_ptr(),
            to_native(flags)
        ))?;

        let activated: Signal<(PathBuf, FileFlags)> = Signal::new();

        let queue = runtime.queue().clone();
        let signal = activated.clone();
        let reader = inotify.clone();
        let watched = path.clone();
        runtime.backend().add(
            inotify.as_raw_fd(),
            crate::sys::READ_FLAGS,
            Arc::new(move |_, _| {
                // events are i32-aligned variable-length records
                let mut buf = [0u64; 512];

                loop {
                    let n = unsafe {
                        libc::read(
                            reader.as_raw_fd(),
                            buf.as_mut_ptr() as *mut libc::c_void,
                            mem::size_of_val(&buf),
                        )
                    };
                    if n <= 0 {
                        break;
                    }

                    let mut offset = 0usize;
                    while offset + mem::size_of::<libc::inotify_event>() <= n as usize {
                        let event = unsafe {
                            &*((buf.as_ptr() as *const u8).add(offset)
                                as *const libc::inotify_event)
                        };

                        let observed = from_native(event.mask);
                        if !observed.is_empty() {
                            signal.emit(&queue, (watched.clone(), observed));
                        }

                        offset += mem::size_of::<libc::inotify_event>() + event.len as usize;
                    }
                }
            }),
        )?;

        Ok(FileEvent {
            runtime: runtime.clone(),
            inner: Inner { inotify },
            path,
            flags,
            activated,
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Drop for FileEvent {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;

        // closing the inotify fd drops the watch with it
        self.runtime
            .backend()
            .remove(self.inner.inotify.as_raw_fd(), crate::sys::READ_FLAGS);
    }
}

#[cfg(all(
    any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ),
    not(feature = "force-poll")
))]
struct Inner {
    file: crate::sys::fd::FileDesc,
    mask: u64,
}

#[cfg(all(
    any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ),
    not(feature = "force-poll")
))]
impl FileEvent {
    pub fn new<P: AsRef<Path>>(
        runtime: &Runtime,
        path: P,
        flags: FileFlags,
    ) -> io::Result<FileEvent> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;
        use std::os::unix::io::AsRawFd;

        use crate::sys::kqueue;
        use crate::sys::{fd::FileDesc, syscall};

        let path = path.as_ref().to_path_buf();

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains nul"))?;

        #[cfg(target_os = "macos")]
        let open_flags = libc::O_EVTONLY | libc::O_CLOEXEC;
        #[cfg(not(target_os = "macos"))]
        let open_flags = libc::O_RDONLY | libc::O_CLOEXEC;

        let fd = syscall!(open(c_path.as_ptr(), open_flags))?;
        let file = unsafe { FileDesc::new(fd) };

        let mut fflags = 0u32;
        if flags.is_write_event() {
            fflags |= libc::NOTE_WRITE | libc::NOTE_EXTEND;
        }
        if flags.is_attribute_mod() {
            fflags |= libc::NOTE_ATTRIB;
        }
        if flags.is_moved() {
            fflags |= libc::NOTE_RENAME;
        }
        if flags.is_deleted() {
            fflags |= libc::NOTE_DELETE;
        }

        let mask = kqueue::vnode_flags(fflags);

        let activated: Signal<(PathBuf, FileFlags)> = Signal::new();

        let queue = runtime.queue().clone();
        let signal = activated.clone();
        let watched = path.clone();
        runtime.backend().add(
            file.as_raw_fd(),
            mask,
            Arc::new(move |_, native| {
                let fflags = (native >> 32) as u32;
                let mut observed = FileFlags::empty();

                if fflags & (libc::NOTE_WRITE | libc::NOTE_EXTEND) != 0 {
                    observed |= FileFlags::write_event();
                }
                if fflags & libc::NOTE_ATTRIB != 0 {
                    observed |= FileFlags::attribute_mod();
                }
                if fflags & libc::NOTE_RENAME != 0 {
                    observed |= FileFlags::moved();
                }
                if fflags & libc::NOTE_DELETE != 0 {
                    observed |= FileFlags::deleted();
                }

                if !observed.is_empty() {
                    signal.emit(&queue, (watched.clone(), observed));
                }
            }),
        )?;

        Ok(FileEvent {
            runtime: runtime.clone(),
            inner: Inner { file, mask },
            path,
            flags,
            activated,
        })
    }
}

#[cfg(all(
    any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ),
    not(feature = "force-poll")
))]
impl Drop for FileEvent {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;

        self.runtime
            .backend()
            .remove(self.inner.file.as_raw_fd(), self.inner.mask);
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    all(
        any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd",
            target_os = "netbsd"
        ),
        not(feature = "force-poll")
    )
)))]
struct Inner {
    _timer: Arc<super::TimerEvent>,
    _state: Arc<StatWatch>,
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    all(
        any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd",
            target_os = "netbsd"
        ),
        not(feature = "force-poll")
    )
)))]
struct StatWatch {
    path: PathBuf,
    interest: FileFlags,
    queue: crate::queue::SignalQueue,
    activated: Signal<(PathBuf, FileFlags)>,
    snapshot: std::sync::Mutex<Option<std::fs::Metadata>>,
    quiet_ticks: std::sync::atomic::AtomicU32,
    tier: std::sync::atomic::AtomicU32,
}

// Stat-diff poller for hosts without a native file watch. The interval
// decays 1s -> 10s -> 100s while the file stays quiet and snaps back to
// 1s on any observed change.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    all(
        any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd",
            target_os = "netbsd"
        ),
        not(feature = "force-poll")
    )
)))]
impl FileEvent {
    const TIERS: [std::time::Duration; 3] = [
        std::time::Duration::from_secs(1),
        std::time::Duration::from_secs(10),
        std::time::Duration::from_secs(100),
    ];
    const QUIET_TICKS_PER_TIER: u32 = 10;

    pub fn new<P: AsRef<Path>>(
        runtime: &Runtime,
        path: P,
        flags: FileFlags,
    ) -> io::Result<FileEvent> {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::{Mutex, Weak};

        let path = path.as_ref().to_path_buf();
        let activated: Signal<(PathBuf, FileFlags)> = Signal::new();

        let timer = Arc::new(super::TimerEvent::new(runtime)?);
        let state = Arc::new(StatWatch {
            path: path.clone(),
            interest: flags,
            queue: runtime.queue().clone(),
            activated: activated.clone(),
            snapshot: Mutex::new(std::fs::metadata(&path).ok()),
            quiet_ticks: AtomicU32::new(0),
            tier: AtomicU32::new(0),
        });

        let weak_timer: Weak<super::TimerEvent> = Arc::downgrade(&timer);
        timer.expired.connect(&state, move |watch, _| {
            let changed = watch.tick();

            let tier = watch.tier.load(Ordering::Relaxed);
            let next_tier = if changed {
                watch.quiet_ticks.store(0, Ordering::Relaxed);
                0
            } else {
                let quiet = watch.quiet_ticks.fetch_add(1, Ordering::Relaxed) + 1;
                if quiet >= Self::QUIET_TICKS_PER_TIER && (tier as usize) < Self::TIERS.len() - 1
                {
                    watch.quiet_ticks.store(0, Ordering::Relaxed);
                    tier + 1
                } else {
                    tier
                }
            };

            if next_tier != tier {
                watch.tier.store(next_tier, Ordering::Relaxed);
                if let Some(timer) = weak_timer.upgrade() {
                    let interval = Self::TIERS[next_tier as usize];
                    let _ = timer.start(interval, Some(interval));
                }
            }
        });

        timer.start(Self::TIERS[0], Some(Self::TIERS[0]))?;

        Ok(FileEvent {
            runtime: runtime.clone(),
            inner: Inner {
                _timer: timer,
                _state: state,
            },
            path,
            flags,
            activated,
        })
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    all(
        any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd",
            target_os = "netbsd"
        ),
        not(feature = "force-poll")
    )
)))]
impl StatWatch {
    /// Compare a fresh stat against the snapshot; emit at most once per
    /// observed transition. Returns whether anything changed.
    fn tick(&self) -> bool {
        use std::os::unix::fs::MetadataExt;

        let fresh = std::fs::metadata(&self.path).ok();
        let mut snapshot = self.snapshot.lock().unwrap();

        let mut observed = FileFlags::empty();
        match (&*snapshot, &fresh) {
            (Some(old), Some(new)) => {
                if old.mtime() != new.mtime()
                    || old.mtime_nsec() != new.mtime_nsec()
                    || old.size() != new.size()
                {
                    observed |= FileFlags::write_event();
                }
                if old.atime() != new.atime() || old.atime_nsec() != new.atime_nsec() {
                    observed |= FileFlags::read_event();
                }
                if old.mode() != new.mode() || old.uid() != new.uid() || old.gid() != new.gid() {
                    observed |= FileFlags::attribute_mod();
                }
                if old.ino() != new.ino() {
                    observed |= FileFlags::moved();
                }
            }
            (Some(_), None) => observed |= FileFlags::deleted(),
            _ => {}
        }

        *snapshot = fresh;
        drop(snapshot);

        let mut relevant = FileFlags::empty();
        let masks = [
            FileFlags::read_event(),
            FileFlags::write_event(),
            FileFlags::attribute_mod(),
            FileFlags::moved(),
            FileFlags::deleted(),
        ];
        for mask in masks {
            if observed.contains(mask) && self.interest.contains(mask) {
                relevant |= mask;
            }
        }

        if !relevant.is_empty() {
            self.activated.emit(&self.queue, (self.path.clone(), relevant));
        }

        !observed.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flag_set_operations() {
        let flags = FileFlags::write_event() | FileFlags::deleted();
        assert!(flags.is_write_event());
        assert!(flags.is_deleted());
        assert!(!flags.is_moved());
        assert!(flags.intersects(FileFlags::any()));
        assert!(FileFlags::any().contains(flags));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn write_raises_write_event_only() {
        use std::io::Write;
        use std::sync::Mutex;
        use std::time::Duration;

        let rt = Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched");
        std::fs::write(&path, b"seed").unwrap();

        let watch = FileEvent::new(&rt, &path, FileFlags::write_event()).unwrap();

        let seen: Arc<Mutex<Vec<(PathBuf, FileFlags)>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            watch
                .activated
                .connect_fn(move |ev| seen.lock().unwrap().push(ev.clone()));
        }

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"x").unwrap();
        file.flush().unwrap();

        rt.step(Some(Duration::from_millis(500)));

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert_eq!(seen[0].0, path);
        assert_eq!(seen[0].1, FileFlags::write_event());
    }
}
