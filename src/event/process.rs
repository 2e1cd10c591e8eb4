use std::io;
use std::sync::{Arc, Mutex};
use std::{fmt, ops};

use crate::queue::SignalQueue;
use crate::runtime::Runtime;
use crate::signal::Signal;

/// Which lifecycle transitions of the watched process to report.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct ProcFlags(u8);

const EXEC: u8 = 0x01;
const EXIT: u8 = 0x02;
const FORK: u8 = 0x04;

impl ProcFlags {
    pub fn exec() -> ProcFlags {
        ProcFlags(EXEC)
    }

    pub fn exit() -> ProcFlags {
        ProcFlags(EXIT)
    }

    pub fn fork() -> ProcFlags {
        ProcFlags(FORK)
    }

    pub fn any() -> ProcFlags {
        ProcFlags(EXEC | EXIT | FORK)
    }

    pub fn is_exec(&self) -> bool {
        self.0 & EXEC != 0
    }

    pub fn is_exit(&self) -> bool {
        self.0 & EXIT != 0
    }

    pub fn is_fork(&self) -> bool {
        self.0 & FORK != 0
    }
}

impl ops::BitOr for ProcFlags {
    type Output = ProcFlags;

    fn bitor(self, other: ProcFlags) -> ProcFlags {
        ProcFlags(self.0 | other.0)
    }
}

impl fmt::Debug for ProcFlags {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        for (set, name) in [
            (self.is_exec(), "Exec"),
            (self.is_exit(), "Exit"),
            (self.is_fork(), "Fork"),
        ] {
            if set {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        if !one {
            fmt.write_str("(empty)")?;
        }
        Ok(())
    }
}

/// Watches one pid for exec/exit/fork transitions.
///
/// On Linux the kernel's process-events connector delivers them; binding
/// that netlink socket needs `CAP_NET_ADMIN`, and when it is denied the
/// wrapper logs one warning and falls back to diffing the process table
/// on a timer. Construction succeeds either way.
pub struct ProcessEvent {
    #[allow(dead_code)]
    runtime: Runtime,
    _inner: Inner,
    pid: libc::pid_t,
    flags: ProcFlags,

    /// The watched process called `exec`.
    pub execed: Signal<libc::pid_t>,
    /// The watched process exited normally: `(pid, exit code)`.
    pub exited: Signal<(libc::pid_t, i32)>,
    /// The watched process was terminated by a signal: `(pid, signo)`.
    pub killed: Signal<(libc::pid_t, i32)>,
    /// The watched process forked: `(parent, child)`.
    pub forked: Signal<(libc::pid_t, libc::pid_t)>,
}

impl ProcessEvent {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn flags(&self) -> ProcFlags {
        self.flags
    }
}

struct Fanout {
    queue: SignalQueue,
    watched: libc::pid_t,
    flags: ProcFlags,
    execed: Signal<libc::pid_t>,
    exited: Signal<(libc::pid_t, i32)>,
    killed: Signal<(libc::pid_t, i32)>,
    forked: Signal<(libc::pid_t, libc::pid_t)>,
}

impl Fanout {
    fn report_exec(&self, pid: libc::pid_t) {
        if self.flags.is_exec() && pid == self.watched {
            self.execed.emit(&self.queue, pid);
        }
    }

    fn report_exit(&self, pid: libc::pid_t, status: i32) {
        if self.flags.is_exit() && pid == self.watched {
            if libc::WIFSIGNALED(status) {
                self.killed.emit(&self.queue, (pid, libc::WTERMSIG(status)));
            } else {
                self.exited
                    .emit(&self.queue, (pid, libc::WEXITSTATUS(status)));
            }
        }
    }

    fn report_fork(&self, parent: libc::pid_t, child: libc::pid_t) {
        if self.flags.is_fork() && parent == self.watched {
            self.forked.emit(&self.queue, (parent, child));
        }
    }
}

// ---------------------------------------------------------------------
// Linux: process-events connector, with the polling fallback below.
// ---------------------------------------------------------------------

#[cfg(any(target_os = "linux", target_os = "android"))]
enum Inner {
    Connector {
        socket: Arc<crate::sys::fd::FileDesc>,
    },
    Polling(PollingWatch),
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod connector {
    use std::io;
    use std::mem;
    use std::os::unix::io::AsRawFd;

    use crate::sys::{fd::FileDesc, syscall};

    pub const CN_IDX_PROC: u32 = 1;
    pub const CN_VAL_PROC: u32 = 1;
    pub const PROC_CN_MCAST_LISTEN: u32 = 1;

    pub const PROC_EVENT_FORK: u32 = 0x0000_0001;
    pub const PROC_EVENT_EXEC: u32 = 0x0000_0002;
    pub const PROC_EVENT_EXIT: u32 = 0x8000_0000;

    const NLMSG_HDRLEN: usize = 16;
    const CN_MSG_LEN: usize = 20;

    /// Open, bind and subscribe a connector socket. Fails with `EPERM`
    /// without `CAP_NET_ADMIN`.
    pub fn subscribe() -> io::Result<FileDesc> {
        let fd = syscall!(socket(
            libc::AF_NETLINK,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            libc::NETLINK_CONNECTOR
        ))?;
        let socket = unsafe { FileDesc::new(fd) };

        // nl_pid zero lets the kernel pick a unique port per socket, so
        // several watchers can subscribe from one process
        let mut sa: libc::sockaddr_nl = unsafe { mem::zeroed() };
        sa.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        sa.nl_groups = CN_IDX_PROC;
        sa.nl_pid = 0;

        syscall!(bind(
            socket.as_raw_fd(),
            &sa as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t
        ))?;

        let packet = listen_packet();
        syscall!(send(
            socket.as_raw_fd(),
            packet.as_ptr() as *const libc::c_void,
            packet.len(),
            0
        ))?;

        Ok(socket)
    }

    // nlmsghdr + cn_msg + PROC_CN_MCAST_LISTEN, all native-endian
    fn listen_packet() -> Vec<u8> {
        let total = NLMSG_HDRLEN + CN_MSG_LEN + 4;
        let mut buf = Vec::with_capacity(total);

        buf.extend((total as u32).to_ne_bytes()); // nlmsg_len
        buf.extend((libc::NLMSG_DONE as u16).to_ne_bytes()); // nlmsg_type
        buf.extend(0u16.to_ne_bytes()); // nlmsg_flags
        buf.extend(0u32.to_ne_bytes()); // nlmsg_seq
        buf.extend(0u32.to_ne_bytes()); // nlmsg_pid (kernel-assigned port)

        buf.extend(CN_IDX_PROC.to_ne_bytes());
        buf.extend(CN_VAL_PROC.to_ne_bytes());
        buf.extend(0u32.to_ne_bytes()); // seq
        buf.extend(0u32.to_ne_bytes()); // ack
        buf.extend(4u16.to_ne_bytes()); // payload len
        buf.extend(0u16.to_ne_bytes()); // flags

        buf.extend(PROC_CN_MCAST_LISTEN.to_ne_bytes());
        buf
    }

    /// A decoded proc_event from one connector datagram.
    pub enum Event {
        Fork {
            parent: libc::pid_t,
            child: libc::pid_t,
        },
        Exec {
            pid: libc::pid_t,
        },
        Exit {
            pid: libc::pid_t,
            status: i32,
        },
    }

    /// Walk the netlink messages in one datagram.
    pub fn parse_datagram(buf: &[u8], mut found: impl FnMut(Event)) {
        let mut offset = 0usize;

        while offset + NLMSG_HDRLEN <= buf.len() {
            let nlmsg_len = read_u32(buf, offset) as usize;
            if nlmsg_len < NLMSG_HDRLEN || offset + nlmsg_len > buf.len() {
                break;
            }

            let nlmsg_type = read_u16(buf, offset + 4);
            if nlmsg_type == libc::NLMSG_DONE as u16 {
                let payload = &buf[offset + NLMSG_HDRLEN..offset + nlmsg_len];
                if payload.len() >= CN_MSG_LEN {
                    parse_proc_event(&payload[CN_MSG_LEN..], &mut found);
                }
            }

            // netlink messages are 4-byte aligned
            offset += (nlmsg_len + 3) & !3;
        }
    }

    // proc_event: what(4) cpu(4) timestamp(8) event-data
    fn parse_proc_event(ev: &[u8], found: &mut impl FnMut(Event)) {
        if ev.len() < 16 + 8 {
            return;
        }

        // pid fields come in (tid, tgid) pairs; report whole processes
        let what = read_u32(ev, 0);
        match what {
            PROC_EVENT_FORK if ev.len() >= 16 + 16 => found(Event::Fork {
                parent: read_u32(ev, 20) as libc::pid_t,
                child: read_u32(ev, 28) as libc::pid_t,
            }),
            PROC_EVENT_EXEC => found(Event::Exec {
                pid: read_u32(ev, 20) as libc::pid_t,
            }),
            PROC_EVENT_EXIT if ev.len() >= 16 + 16 => found(Event::Exit {
                pid: read_u32(ev, 20) as libc::pid_t,
                status: read_u32(ev, 24) as i32,
            }),
            _ => {}
        }
    }

    fn read_u16(buf: &[u8], offset: usize) -> u16 {
        u16::from_ne_bytes([buf[offset], buf[offset + 1]])
    }

    fn read_u32(buf: &[u8], offset: usize) -> u32 {
        u32::from_ne_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ])
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl ProcessEvent {
    pub fn new(runtime: &Runtime, pid: libc::pid_t, flags: ProcFlags) -> io::Result<ProcessEvent> {
        use std::os::unix::io::AsRawFd;

        let execed: Signal<libc::pid_t> = Signal::new();
        let exited: Signal<(libc::pid_t, i32)> = Signal::new();
        let killed: Signal<(libc::pid_t, i32)> = Signal::new();
        let forked: Signal<(libc::pid_t, libc::pid_t)> = Signal::new();

        let fanout = Arc::new(Fanout {
            queue: runtime.queue().clone(),
            watched: pid,
            flags,
            execed: execed.clone(),
            exited: exited.clone(),
            killed: killed.clone(),
            forked: forked.clone(),
        });

        let inner = match connector::subscribe() {
            Ok(socket) => {
                let socket = Arc::new(socket);

                let reader = socket.clone();
                let sink = fanout.clone();
                runtime.backend().add(
                    socket.as_raw_fd(),
                    crate::sys::READ_FLAGS,
                    Arc::new(move |_, _| {
                        let mut buf = [0u64; 512];
                        loop {
                            let n = unsafe {
                                libc::recv(
                                    reader.as_raw_fd(),
                                    buf.as_mut_ptr() as *mut libc::c_void,
                                    std::mem::size_of_val(&buf),
                                    0,
                                )
                            };
                            if n <= 0 {
                                break;
                            }

                            let bytes = unsafe {
                                std::slice::from_raw_parts(buf.as_ptr() as *const u8, n as usize)
                            };
                            connector::parse_datagram(bytes, |event| match event {
                                connector::Event::Fork { parent, child } => {
                                    sink.report_fork(parent, child)
                                }
                                connector::Event::Exec { pid } => sink.report_exec(pid),
                                connector::Event::Exit { pid, status } => {
                                    sink.report_exit(pid, status)
                                }
                            });
                        }
                    }),
                )?;

                Inner::Connector { socket }
            }
            Err(e) => {
                static FALLBACK_ONCE: std::sync::Once = std::sync::Once::new();
                FALLBACK_ONCE.call_once(|| {
                    log::warn!(
                        "process events connector unavailable ({}); polling the process table",
                        e
                    );
                });

                Inner::Polling(PollingWatch::new(runtime, fanout)?)
            }
        };

        Ok(ProcessEvent {
            runtime: runtime.clone(),
            _inner: inner,
            pid,
            flags,
            execed,
            exited,
            killed,
            forked,
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Drop for ProcessEvent {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;

        if let Inner::Connector { socket } = &self._inner {
            self.runtime
                .backend()
                .remove(socket.as_raw_fd(), crate::sys::READ_FLAGS);
        }
    }
}

// ---------------------------------------------------------------------
// BSD: the proc filter reports transitions directly.
// ---------------------------------------------------------------------

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
impl ProcessEvent {
    pub fn new(runtime: &Runtime, pid: libc::pid_t, flags: ProcFlags) -> io::Result<ProcessEvent> {
        use crate::sys::kqueue;

        let execed: Signal<libc::pid_t> = Signal::new();
        let exited: Signal<(libc::pid_t, i32)> = Signal::new();
        let killed: Signal<(libc::pid_t, i32)> = Signal::new();
        let forked: Signal<(libc::pid_t, libc::pid_t)> = Signal::new();

        let fanout = Arc::new(Fanout {
            queue: runtime.queue().clone(),
            watched: pid,
            flags,
            execed: execed.clone(),
            exited: exited.clone(),
            killed: killed.clone(),
            forked: forked.clone(),
        });

        let mut fflags = 0u32;
        if flags.is_exec() {
            fflags |= libc::NOTE_EXEC;
        }
        if flags.is_exit() {
            fflags |= libc::NOTE_EXIT;
        }
        if flags.is_fork() {
            fflags |= libc::NOTE_FORK;
        }

        let mask = kqueue::proc_flags(fflags);

        let sink = fanout;
        runtime.backend().add(
            pid,
            mask,
            Arc::new(move |ident, native| {
                let observed = (native >> 32) as u32;
                if observed & libc::NOTE_EXEC != 0 {
                    sink.report_exec(ident);
                }
                if observed & libc::NOTE_FORK != 0 {
                    // the proc filter does not identify the child
                    sink.report_fork(ident, 0);
                }
                if observed & libc::NOTE_EXIT != 0 {
                    sink.report_exit(ident, 0);
                }
            }),
        )?;

        Ok(ProcessEvent {
            runtime: runtime.clone(),
            _inner: Inner { mask },
            pid,
            flags,
            execed,
            exited,
            killed,
            forked,
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
impl Drop for ProcessEvent {
    fn drop(&mut self) {
        self.runtime.backend().remove(self.pid, self._inner.mask);
    }
}

// ---------------------------------------------------------------------
// Generic UNIX: nothing to subscribe to; always poll.
// ---------------------------------------------------------------------

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
    _polling: PollingWatch,
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
impl ProcessEvent {
    pub fn new(runtime: &Runtime, pid: libc::pid_t, flags: ProcFlags) -> io::Result<ProcessEvent> {
        let execed: Signal<libc::pid_t> = Signal::new();
        let exited: Signal<(libc::pid_t, i32)> = Signal::new();
        let killed: Signal<(libc::pid_t, i32)> = Signal::new();
        let forked: Signal<(libc::pid_t, libc::pid_t)> = Signal::new();

        let fanout = Arc::new(Fanout {
            queue: runtime.queue().clone(),
            watched: pid,
            flags,
            execed: execed.clone(),
            exited: exited.clone(),
            killed: killed.clone(),
            forked: forked.clone(),
        });

        Ok(ProcessEvent {
            runtime: runtime.clone(),
            _inner: Inner {
                _polling: PollingWatch::new(runtime, fanout)?,
            },
            pid,
            flags,
            execed,
            exited,
            killed,
            forked,
        })
    }
}

// ---------------------------------------------------------------------
// Process-table diff poller, shared by the fallback paths.
// ---------------------------------------------------------------------

struct PollingWatch {
    _timer: Arc<super::TimerEvent>,
    _state: Arc<PollState>,
}

struct PollState {
    fanout: Arc<Fanout>,
    snapshot: Mutex<PollSnapshot>,
}

struct PollSnapshot {
    alive: bool,
    name: String,
    children: Vec<libc::pid_t>,
}

impl PollingWatch {
    const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

    fn new(runtime: &Runtime, fanout: Arc<Fanout>) -> io::Result<PollingWatch> {
        let state = Arc::new(PollState {
            snapshot: Mutex::new(PollState::observe(fanout.watched)),
            fanout,
        });

        let timer = Arc::new(super::TimerEvent::new(runtime)?);
        timer.expired.connect(&state, |watch, _| watch.tick());
        timer.start(Self::POLL_INTERVAL, Some(Self::POLL_INTERVAL))?;

        Ok(PollingWatch {
            _timer: timer,
            _state: state,
        })
    }
}

impl PollState {
    fn observe(pid: libc::pid_t) -> PollSnapshot {
        use crate::info::{proclist, procstat};

        match procstat::procstat(pid) {
            Ok(state) => {
                let children = proclist::proclist()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|&candidate| {
                        procstat::procstat(candidate)
                            .map(|st| st.parent_process_id == pid)
                            .unwrap_or(false)
                    })
                    .collect();

                PollSnapshot {
                    alive: true,
                    name: state.name,
                    children,
                }
            }
            Err(_) => PollSnapshot {
                alive: false,
                name: String::new(),
                children: Vec::new(),
            },
        }
    }

    fn tick(&self) {
        let watched = self.fanout.watched;
        let fresh = PollState::observe(watched);
        let mut snapshot = self.snapshot.lock().unwrap();

        if snapshot.alive && !fresh.alive {
            // exit status is unobservable from the outside
            self.fanout.report_exit(watched, 0);
        }

        if snapshot.alive && fresh.alive && snapshot.name != fresh.name {
            self.fanout.report_exec(watched);
        }

        for &child in &fresh.children {
            if !snapshot.children.contains(&child) {
                self.fanout.report_fork(watched, child);
            }
        }

        *snapshot = fresh;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flag_queries() {
        let flags = ProcFlags::exec() | ProcFlags::fork();
        assert!(flags.is_exec());
        assert!(flags.is_fork());
        assert!(!flags.is_exit());
        assert!(ProcFlags::any().is_exit());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn connector_datagram_decoding() {
        // one NLMSG_DONE message carrying a fork event for pid 41 -> 42
        let mut datagram = Vec::new();
        let proc_event_len = 16 + 16;
        let total = 16 + 20 + proc_event_len;

        datagram.extend((total as u32).to_ne_bytes());
        datagram.extend((libc::NLMSG_DONE as u16).to_ne_bytes());
        datagram.extend(0u16.to_ne_bytes());
        datagram.extend(0u32.to_ne_bytes());
        datagram.extend(0u32.to_ne_bytes());

        datagram.extend(connector::CN_IDX_PROC.to_ne_bytes());
        datagram.extend(connector::CN_VAL_PROC.to_ne_bytes());
        datagram.extend(0u32.to_ne_bytes());
        datagram.extend(0u32.to_ne_bytes());
        datagram.extend((proc_event_len as u16).to_ne_bytes());
        datagram.extend(0u16.to_ne_bytes());

        datagram.extend(connector::PROC_EVENT_FORK.to_ne_bytes()); // what
        datagram.extend(0u32.to_ne_bytes()); // cpu
        datagram.extend(0u64.to_ne_bytes()); // timestamp
        datagram.extend(41u32.to_ne_bytes()); // parent pid
        datagram.extend(41u32.to_ne_bytes()); // parent tgid
        datagram.extend(42u32.to_ne_bytes()); // child pid
        datagram.extend(42u32.to_ne_bytes()); // child tgid

        let mut seen = Vec::new();
        connector::parse_datagram(&datagram, |event| {
            if let connector::Event::Fork { parent, child } = event {
                seen.push((parent, child));
            }
        });

        assert_eq!(seen, vec![(41, 42)]);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn polling_fallback_sees_a_fork() {
        use std::sync::atomic::Ordering;
        use std::time::Duration;

        let rt = Runtime::new().unwrap();
        let watch = ProcessEvent::new(&rt, unsafe { libc::getpid() }, ProcFlags::any()).unwrap();

        let forked_child = Arc::new(std::sync::atomic::AtomicI32::new(0));
        {
            let forked_child = forked_child.clone();
            watch.forked.connect_fn(move |&(_, child)| {
                forked_child.store(child, Ordering::SeqCst);
            });
        }

        let mut spawned = std::process::Command::new("/bin/sleep")
            .arg("5")
            .spawn()
            .unwrap();
        let expected = spawned.id() as libc::pid_t;

        // give either sourcing mode a few polling intervals
        for _ in 0..8 {
            rt.step(Some(Duration::from_millis(250)));
            if forked_child.load(Ordering::SeqCst) != 0 {
                break;
            }
        }

        spawned.kill().ok();
        spawned.wait().ok();

        assert_eq!(forked_child.load(Ordering::SeqCst), expected);
    }
}
