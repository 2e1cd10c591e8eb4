//! Piped child processes driven through the `executor` helper, reaped
//! by one process-wide `SIGCHLD` hook.
//!
//! The signal handler itself only pokes a self-pipe; the loop thread
//! owns the `waitpid` sweep and the resulting signal emissions.

pub mod proto;

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::process::{Command as StdCommand, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, warn};

use crate::runtime::Runtime;
use crate::signal::Signal;
use crate::sys::fd::FileDesc;
use crate::sys::{pipe, syscall};

use proto::Command;

/// Observable lifecycle of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The process does not exist (spawn or query failure).
    Invalid,
    /// The helper is up but the target has not been invoked yet.
    Initializing,
    /// Running.
    Running,
    /// Asleep in the kernel.
    Waiting,
    /// Execution stopped (job control or tracer).
    Stopped,
    /// Exited, not yet reaped.
    Zombie,
    /// Exited and reaped. Sticky.
    Finished,
}

const DEFAULT_HELPER: &str = "executor";
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// A child process with piped stdio.
///
/// Construction spawns the helper; the target executable, arguments,
/// environment, ids and limits are staged through typed commands, and
/// [`ChildProcess::invoke`] makes the helper exec. Lifecycle transitions
/// arrive via the `started` / `stopped` / `finished` / `killed` signals;
/// stdio readability via `stdout_message` / `stderr_message`.
pub struct ChildProcess {
    runtime: Runtime,
    shared: Arc<ChildShared>,

    /// Re-raised when the child (re)enters execution.
    pub started: Signal<libc::pid_t>,
    /// The child was stopped by job control.
    pub stopped: Signal<libc::pid_t>,
    /// `(pid, exit code)`; terminal, emitted at most once.
    pub finished: Signal<(libc::pid_t, i32)>,
    /// `(pid, terminating signal)`; terminal, emitted at most once.
    pub killed: Signal<(libc::pid_t, i32)>,
    /// The child's stdout has data; carries the readable fd.
    pub stdout_message: Signal<RawFd>,
    /// The child's stderr has data; carries the readable fd.
    pub stderr_message: Signal<RawFd>,
}

pub(crate) struct ChildShared {
    pid: libc::pid_t,
    runtime: Runtime,
    state: Mutex<State>,
    stdin: Mutex<Option<FileDesc>>,
    stdout: Mutex<Option<FileDesc>>,
    stderr: Mutex<Option<FileDesc>>,
    watched: Mutex<Vec<RawFd>>,

    started: Signal<libc::pid_t>,
    stopped: Signal<libc::pid_t>,
    finished: Signal<(libc::pid_t, i32)>,
    killed: Signal<(libc::pid_t, i32)>,
}

impl ChildProcess {
    /// Spawn the helper found as `executor` on `PATH`.
    pub fn new(runtime: &Runtime) -> io::Result<ChildProcess> {
        ChildProcess::with_helper(runtime, DEFAULT_HELPER)
    }

    /// Spawn a specific helper binary.
    pub fn with_helper(runtime: &Runtime, helper: &str) -> io::Result<ChildProcess> {
        runtime.children().install(runtime)?;

        let mut child = StdCommand::new(helper)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child.id() as libc::pid_t;
        let stdin = child.stdin.take().map(into_filedesc);
        let stdout = child.stdout.take().map(into_filedesc);
        let stderr = child.stderr.take().map(into_filedesc);
        // the global waitpid sweep reaps it; the std handle is not used
        drop(child);

        // the loop thread must never block in a pipe read
        if let Some(fd) = &stdout {
            fd.set_nonblocking(true)?;
        }
        if let Some(fd) = &stderr {
            fd.set_nonblocking(true)?;
        }

        let shared = Arc::new(ChildShared {
            pid,
            runtime: runtime.clone(),
            state: Mutex::new(State::Initializing),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
            watched: Mutex::new(Vec::new()),
            started: Signal::new(),
            stopped: Signal::new(),
            finished: Signal::new(),
            killed: Signal::new(),
        });

        runtime.children().insert(pid, shared.clone());
        debug!("spawned helper {} as pid {}", helper, pid);

        Ok(ChildProcess {
            runtime: runtime.clone(),
            started: shared.started.clone(),
            stopped: shared.stopped.clone(),
            finished: shared.finished.clone(),
            killed: shared.killed.clone(),
            stdout_message: Signal::new(),
            stderr_message: Signal::new(),
            shared,
        })
    }

    pub fn pid(&self) -> libc::pid_t {
        self.shared.pid
    }

    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.shared.stdin.lock().unwrap().as_ref().map(|f| f.as_raw_fd())
    }

    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.shared.stdout.lock().unwrap().as_ref().map(|f| f.as_raw_fd())
    }

    pub fn stderr_fd(&self) -> Option<RawFd> {
        self.shared.stderr.lock().unwrap().as_ref().map(|f| f.as_raw_fd())
    }

    /// Stage the target executable path.
    pub fn set_executable(&self, path: &str) -> io::Result<()> {
        let mut buf = Vec::new();
        proto::put_command(&mut buf, Command::Executable);
        proto::put_str(&mut buf, path);
        self.request(&buf)
    }

    /// Stage the argument vector (`argv[0]` included).
    pub fn set_arguments(&self, arguments: &[&str]) -> io::Result<()> {
        let mut buf = Vec::new();
        proto::put_command(&mut buf, Command::Arguments);
        for argument in arguments {
            proto::put_str(&mut buf, argument);
        }
        self.request(&buf)
    }

    /// Replace the environment with the given pairs.
    pub fn set_environment(&self, pairs: &[(&str, &str)]) -> io::Result<()> {
        let mut buf = Vec::new();
        proto::put_command(&mut buf, Command::Environment);
        for (key, value) in pairs {
            proto::put_str(&mut buf, key);
            proto::put_str(&mut buf, value);
        }
        self.request(&buf)
    }

    /// Stage one environment variable.
    pub fn set_env_var(&self, key: &str, value: &str) -> io::Result<()> {
        let mut buf = Vec::new();
        proto::put_command(&mut buf, Command::EnvironmentVar);
        proto::put_str(&mut buf, key);
        proto::put_str(&mut buf, value);
        self.request(&buf)
    }

    pub fn set_working_dir(&self, path: &str) -> io::Result<()> {
        let mut buf = Vec::new();
        proto::put_command(&mut buf, Command::WorkingDir);
        proto::put_str(&mut buf, path);
        self.request(&buf)
    }

    pub fn set_priority(&self, priority: i32) -> io::Result<()> {
        let mut buf = Vec::new();
        proto::put_command(&mut buf, Command::Priority);
        proto::put_i32(&mut buf, priority);
        self.request(&buf)
    }

    pub fn set_uid(&self, uid: libc::uid_t) -> io::Result<()> {
        self.id_request(Command::Uid, uid)
    }

    pub fn set_gid(&self, gid: libc::gid_t) -> io::Result<()> {
        self.id_request(Command::Gid, gid)
    }

    pub fn set_euid(&self, uid: libc::uid_t) -> io::Result<()> {
        self.id_request(Command::Euid, uid)
    }

    pub fn set_egid(&self, gid: libc::gid_t) -> io::Result<()> {
        self.id_request(Command::Egid, gid)
    }

    /// Stage one resource limit: `(which, soft, hard)`.
    pub fn set_resource(&self, resource: i32, soft: u64, hard: u64) -> io::Result<()> {
        let mut buf = Vec::new();
        proto::put_command(&mut buf, Command::Resource);
        proto::put_i32(&mut buf, resource);
        proto::put_u64(&mut buf, soft);
        proto::put_u64(&mut buf, hard);
        self.request(&buf)
    }

    fn id_request(&self, command: Command, id: u32) -> io::Result<()> {
        let mut buf = Vec::new();
        proto::put_command(&mut buf, command);
        proto::put_u32(&mut buf, id);
        self.request(&buf)
    }

    /// Make the helper exec the staged target. Watches the stdio pipes
    /// and emits `started` once the child is observed running.
    pub fn invoke(&self) -> io::Result<()> {
        {
            let state = self.shared.state.lock().unwrap();
            if *state != State::Initializing {
                error!("invoke() on an active process (pid {})", self.shared.pid);
                return Err(io::Error::from_raw_os_error(libc::EBUSY));
            }
        }

        for (fd, signal) in [
            (self.stdout_fd(), &self.stdout_message),
            (self.stderr_fd(), &self.stderr_message),
        ] {
            let fd = match fd {
                Some(fd) => fd,
                None => continue,
            };

            let queue = self.runtime.queue().clone();
            let signal = signal.clone();
            self.runtime.backend().add(
                fd,
                crate::sys::READ_FLAGS,
                Arc::new(move |fd, _| {
                    signal.emit(&queue, fd);
                }),
            )?;
            self.shared.watched.lock().unwrap().push(fd);
        }

        let mut buf = Vec::new();
        proto::put_command(&mut buf, Command::Invoke);
        self.send(&buf)?;

        {
            // the reaper may already have marked a short-lived child
            let mut state = self.shared.state.lock().unwrap();
            if *state == State::Initializing {
                *state = State::Running;
            }
        }
        self.shared
            .started
            .emit(self.runtime.queue(), self.shared.pid);
        Ok(())
    }

    /// Current state; consults the process table except for the sticky
    /// `Finished` and pre-invoke `Initializing` states.
    pub fn state(&self) -> State {
        let mut state = self.shared.state.lock().unwrap();

        match *state {
            State::Finished | State::Initializing | State::Invalid => *state,
            _ => {
                use crate::info::procstat::{self, ExecState};

                *state = match procstat::procstat(self.shared.pid) {
                    Err(_) => State::Invalid,
                    Ok(data) => match data.state {
                        ExecState::Running => State::Running,
                        ExecState::WaitingInterruptible | ExecState::WaitingUninterruptible => {
                            State::Waiting
                        }
                        ExecState::Zombie => State::Zombie,
                        ExecState::Stopped => State::Stopped,
                    },
                };
                *state
            }
        }
    }

    /// Queue a signal with an accompanying value where the platform
    /// supports it, falling back to plain `kill`.
    pub fn send_signal(&self, signo: i32, value: i32) -> io::Result<()> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let payload = libc::sigval {
                sival_ptr: value as usize as *mut libc::c_void,
            };
            syscall!(sigqueue(self.shared.pid, signo, payload))?;
            Ok(())
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            let _ = value;
            syscall!(kill(self.shared.pid, signo))?;
            Ok(())
        }
    }

    pub fn stop(&self) -> io::Result<()> {
        self.send_signal(libc::SIGSTOP, 0)
    }

    pub fn resume(&self) -> io::Result<()> {
        self.send_signal(libc::SIGCONT, 0)
    }

    pub fn quit(&self) -> io::Result<()> {
        self.send_signal(libc::SIGQUIT, 0)
    }

    pub fn terminate(&self) -> io::Result<()> {
        self.send_signal(libc::SIGTERM, 0)
    }

    pub fn kill(&self) -> io::Result<()> {
        self.send_signal(libc::SIGKILL, 0)
    }

    /// Drain the child's stdout into `buf`.
    pub fn read_stdout(&self, buf: &mut [u8]) -> io::Result<usize> {
        read_locked(&self.shared.stdout, buf)
    }

    /// Drain the child's stderr into `buf`.
    pub fn read_stderr(&self, buf: &mut [u8]) -> io::Result<usize> {
        read_locked(&self.shared.stderr, buf)
    }

    fn send(&self, payload: &[u8]) -> io::Result<()> {
        let stdin = self.shared.stdin.lock().unwrap();
        match stdin.as_ref() {
            Some(mut fd) => fd.write_all(payload),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "helper stdin is closed",
            )),
        }
    }

    /// Send a command and wait for the helper's errno reply.
    fn request(&self, payload: &[u8]) -> io::Result<()> {
        self.send(payload)?;

        let stdout = self.shared.stdout.lock().unwrap();
        let fd = stdout.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "helper stdout is closed")
        })?;

        if !wait_readable(fd.as_raw_fd(), REPLY_TIMEOUT)? {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "helper did not answer",
            ));
        }

        let mut reply = [0u8; 8];
        (&*fd).read_exact(&mut reply)?;
        drop(stdout);

        match proto::FieldReader::new(&reply).i32() {
            Some(0) => Ok(()),
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed helper reply",
            )),
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.shared.drop_watches();
    }
}

impl ChildShared {
    fn drop_watches(&self) {
        let mut watched = self.watched.lock().unwrap();
        for fd in watched.drain(..) {
            self.runtime.backend().remove(fd, crate::sys::READ_FLAGS);
        }
    }

    // Stdout/stderr stay open so queued readability slots can still
    // drain buffered output; they close when the entry itself goes.
    fn close_stdin(&self) {
        self.stdin.lock().unwrap().take();
    }
}

fn into_filedesc<T: IntoRawFd>(handle: T) -> FileDesc {
    unsafe { FileDesc::new(handle.into_raw_fd()) }
}

fn read_locked(slot: &Mutex<Option<FileDesc>>, buf: &mut [u8]) -> io::Result<usize> {
    let guard = slot.lock().unwrap();
    match guard.as_ref() {
        Some(mut fd) => fd.read(buf),
        None => Ok(0),
    }
}

fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let ready = crate::sys::retry_on_intr(|| {
        syscall!(poll(&mut pollfd, 1, timeout.as_millis() as libc::c_int))
    })?;
    Ok(ready > 0)
}

// ---------------------------------------------------------------------
// Reaping.
// ---------------------------------------------------------------------

// One slot per runtime that has children. The handler must stay
// async-signal-safe, so this is a fixed array of atomics rather than a
// locked collection.
const MAX_REAPER_PIPES: usize = 32;
static REAPER_PIPES: [AtomicI32; MAX_REAPER_PIPES] =
    [const { AtomicI32::new(-1) }; MAX_REAPER_PIPES];

extern "C" fn sigchld_handler(_: libc::c_int) {
    let byte = 1u8;
    for slot in &REAPER_PIPES {
        let fd = slot.load(Ordering::Relaxed);
        if fd >= 0 {
            unsafe {
                libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
            }
        }
    }
}

// Every live child table, so one waitpid sweep can resolve any pid no
// matter which runtime spawned it.
static TABLES: Mutex<Vec<std::sync::Weak<TableInner>>> = Mutex::new(Vec::new());

/// The pid-indexed table of live children, one per runtime.
#[derive(Clone)]
pub(crate) struct ChildTable {
    inner: Arc<TableInner>,
}

struct TableInner {
    entries: Mutex<HashMap<libc::pid_t, Arc<ChildShared>>>,
    installed: Mutex<Option<FileDesc>>, // self-pipe read end, once installed
}

impl ChildTable {
    pub(crate) fn new() -> ChildTable {
        ChildTable {
            inner: Arc::new(TableInner {
                entries: Mutex::new(HashMap::new()),
                installed: Mutex::new(None),
            }),
        }
    }

    fn insert(&self, pid: libc::pid_t, shared: Arc<ChildShared>) {
        self.inner.entries.lock().unwrap().insert(pid, shared);
    }

    /// Install the `SIGCHLD` hook, register this table for the global
    /// sweep, and watch a fresh self-pipe. Idempotent per runtime.
    fn install(&self, runtime: &Runtime) -> io::Result<()> {
        let mut installed = self.inner.installed.lock().unwrap();
        if installed.is_some() {
            return Ok(());
        }

        let (reader, writer) = pipe::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;

        let drain = reader.try_clone()?;
        runtime.backend().add(
            reader.as_raw_fd(),
            crate::sys::READ_FLAGS,
            Arc::new(move |_, _| {
                let mut sink = [0u8; 64];
                while (&drain).read(&mut sink).is_ok() {}
                reap_all();
            }),
        )?;

        {
            let mut tables = TABLES.lock().unwrap();
            tables.retain(|table| table.upgrade().is_some());
            tables.push(Arc::downgrade(&self.inner));
        }

        let write_fd = writer.into_raw_fd();
        let slot = REAPER_PIPES
            .iter()
            .find(|slot| slot.compare_exchange(-1, write_fd, Ordering::AcqRel, Ordering::Relaxed).is_ok());
        if slot.is_none() {
            unsafe { libc::close(write_fd) };
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "too many child reapers in one process",
            ));
        }

        let handler: extern "C" fn(libc::c_int) = sigchld_handler;
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_RESTART;
        unsafe { libc::sigemptyset(&mut action.sa_mask) };

        syscall!(sigaction(libc::SIGCHLD, &action, std::ptr::null_mut()))?;

        *installed = Some(reader);
        debug!("child reaper installed");
        Ok(())
    }
}

fn lookup(pid: libc::pid_t) -> Option<Arc<ChildShared>> {
    let tables = TABLES.lock().unwrap();
    for table in tables.iter() {
        if let Some(table) = table.upgrade() {
            if let Some(shared) = table.entries.lock().unwrap().get(&pid) {
                return Some(shared.clone());
            }
        }
    }
    None
}

fn forget(pid: libc::pid_t) {
    let tables = TABLES.lock().unwrap();
    for table in tables.iter() {
        if let Some(table) = table.upgrade() {
            table.entries.lock().unwrap().remove(&pid);
        }
    }
}

/// The non-blocking `waitpid` sweep, run in normal context whenever the
/// handler pokes a pipe.
fn reap_all() {
    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe {
            libc::waitpid(
                -1,
                &mut status,
                libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED,
            )
        };

        if pid <= 0 {
            break;
        }

        let shared = match lookup(pid) {
            Some(shared) => shared,
            None => {
                warn!("reaped unknown child {}", pid);
                continue;
            }
        };

        if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
            shared.drop_watches();
            shared.close_stdin();
            *shared.state.lock().unwrap() = State::Finished;

            if libc::WIFSIGNALED(status) {
                shared
                    .killed
                    .emit(shared.runtime.queue(), (pid, libc::WTERMSIG(status)));
            } else {
                shared
                    .finished
                    .emit(shared.runtime.queue(), (pid, libc::WEXITSTATUS(status)));
            }

            forget(pid);
        } else if libc::WIFSTOPPED(status) {
            *shared.state.lock().unwrap() = State::Stopped;
            shared.stopped.emit(shared.runtime.queue(), pid);
        } else if libc::WIFCONTINUED(status) {
            *shared.state.lock().unwrap() = State::Running;
            shared.started.emit(shared.runtime.queue(), pid);
        }
    }
}
