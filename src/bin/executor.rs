//! Stdio-driven exec helper.
//!
//! Reads typed commands on stdin (see `relay_io::process::proto`),
//! stages an executable, argument vector, environment, ids and limits,
//! answers each command with an errno word on stdout, and replaces
//! itself with the target on `invoke`. Exits when no command arrives
//! within one second.

use std::ffi::CString;
use std::io::{self, Write};

use relay_io::process::proto::Command;

#[cfg(any(target_os = "linux", target_os = "android"))]
const BAD_REQUEST: i32 = libc::EBADRQC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const BAD_REQUEST: i32 = libc::EINVAL;

const COMMAND_TIMEOUT_MS: i32 = 1000;

fn main() {
    let mut staged = Staged::default();

    while can_read(COMMAND_TIMEOUT_MS) {
        let command = match read_command() {
            Some(command) => command,
            None => break,
        };

        match command {
            Command::Invoke => staged.invoke(),
            Command::Executable => {
                let reply_code = match read_string() {
                    Some(path) => {
                        let code = check_executable(&path);
                        if code == 0 {
                            staged.executable = Some(path);
                        }
                        code
                    }
                    None => libc::EINVAL,
                };
                reply(reply_code);
            }
            Command::Arguments => {
                staged.arguments.clear();
                while can_read(0) {
                    match read_string() {
                        Some(argument) => staged.arguments.push(argument),
                        None => break,
                    }
                }
                reply(if staged.arguments.is_empty() {
                    libc::EINVAL
                } else {
                    0
                });
            }
            Command::Environment | Command::EnvironmentVar => {
                let mut code = 0;
                let mut any = false;

                loop {
                    if any && command == Command::EnvironmentVar {
                        break;
                    }
                    if !can_read(0) {
                        break;
                    }
                    let (key, value) = match (read_string(), read_string()) {
                        (Some(key), Some(value)) => (key, value),
                        _ => {
                            code = libc::EINVAL;
                            break;
                        }
                    };
                    std::env::set_var(key, value);
                    any = true;
                }

                if !any && code == 0 {
                    code = libc::EINVAL;
                }
                reply(code);
            }
            Command::WorkingDir => {
                let code = match read_string() {
                    Some(path) => match std::env::set_current_dir(&path) {
                        Ok(()) => 0,
                        Err(e) => e.raw_os_error().unwrap_or(libc::EACCES),
                    },
                    None => libc::EINVAL,
                };
                reply(code);
            }
            Command::Priority => {
                let code = match read_i32() {
                    Some(priority) => errno_of(unsafe {
                        libc::setpriority(libc::PRIO_PROCESS as _, 0, priority)
                    }),
                    None => libc::EINVAL,
                };
                reply(code);
            }
            Command::Uid => reply(id_call(read_u32(), |id| unsafe { libc::setuid(id) })),
            Command::Gid => reply(id_call(read_u32(), |id| unsafe { libc::setgid(id) })),
            Command::Euid => reply(id_call(read_u32(), |id| unsafe { libc::seteuid(id) })),
            Command::Egid => reply(id_call(read_u32(), |id| unsafe { libc::setegid(id) })),
            Command::Resource => {
                let code = match (read_i32(), read_u64(), read_u64()) {
                    (Some(resource), Some(soft), Some(hard)) => {
                        let limit = libc::rlimit {
                            rlim_cur: soft as libc::rlim_t,
                            rlim_max: hard as libc::rlim_t,
                        };
                        errno_of(unsafe { libc::setrlimit(resource as _, &limit) })
                    }
                    _ => libc::EINVAL,
                };
                reply(code);
            }
            Command::Invalid => reply(BAD_REQUEST),
        }
    }

    // timed out without an invoke
    std::process::exit(0);
}

#[derive(Default)]
struct Staged {
    executable: Option<String>,
    arguments: Vec<String>,
}

impl Staged {
    /// Exec the staged target; only returns on failure.
    fn invoke(&self) -> ! {
        let path = self
            .executable
            .clone()
            .or_else(|| self.arguments.first().cloned());

        let path = match path.and_then(|p| CString::new(p).ok()) {
            Some(path) => path,
            None => std::process::exit(libc::ENOENT),
        };

        let mut argv: Vec<CString> = self
            .arguments
            .iter()
            .filter_map(|a| CString::new(a.as_str()).ok())
            .collect();
        if argv.is_empty() {
            argv.push(path.clone());
        }

        let mut argv_ptrs: Vec<*const libc::c_char> =
            argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());

        unsafe {
            libc::execv(path.as_ptr(), argv_ptrs.as_ptr());
        }
        std::process::exit(io::Error::last_os_error().raw_os_error().unwrap_or(libc::ENOENT));
    }
}

fn check_executable(path: &str) -> i32 {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) => return e.raw_os_error().unwrap_or(libc::ENOENT),
    };

    use std::os::unix::fs::PermissionsExt;
    if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
        return libc::EACCES;
    }
    0
}

fn id_call<F: FnOnce(u32) -> libc::c_int>(id: Option<u32>, call: F) -> i32 {
    match id {
        Some(id) => errno_of(call(id)),
        None => libc::EINVAL,
    }
}

fn errno_of(result: libc::c_int) -> i32 {
    if result == 0 {
        0
    } else {
        io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
    }
}

fn can_read(timeout_ms: i32) -> bool {
    let mut pollfd = libc::pollfd {
        fd: libc::STDIN_FILENO,
        events: libc::POLLIN,
        revents: 0,
    };

    loop {
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ready >= 0 {
            return ready > 0 && pollfd.revents & libc::POLLIN != 0;
        }
        if io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            return false;
        }
    }
}

// Unbuffered: `can_read(0)` probes the descriptor directly, so nothing
// may sit in a user-space buffer between fields.
fn read_exact(buf: &mut [u8]) -> bool {
    let mut done = 0;
    while done < buf.len() {
        let n = unsafe {
            libc::read(
                libc::STDIN_FILENO,
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
            )
        };

        if n > 0 {
            done += n as usize;
        } else if n == -1 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        } else {
            return false;
        }
    }
    true
}

fn read_header() -> Option<(u16, u16)> {
    let mut header = [0u8; 4];
    if !read_exact(&mut header) {
        return None;
    }
    Some((
        u16::from_ne_bytes([header[0], header[1]]),
        u16::from_ne_bytes([header[2], header[3]]),
    ))
}

fn read_command() -> Option<Command> {
    let (bytewidth, count) = read_header()?;
    if bytewidth != 1 || count != 1 {
        return None;
    }
    let mut byte = [0u8; 1];
    if !read_exact(&mut byte) {
        return None;
    }
    Some(Command::from_byte(byte[0]))
}

fn read_string() -> Option<String> {
    let (bytewidth, count) = read_header()?;
    if bytewidth != 1 {
        return None;
    }
    let mut bytes = vec![0u8; count as usize];
    if !read_exact(&mut bytes) {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn read_i32() -> Option<i32> {
    let (bytewidth, count) = read_header()?;
    if bytewidth != 4 || count != 1 {
        return None;
    }
    let mut bytes = [0u8; 4];
    if !read_exact(&mut bytes) {
        return None;
    }
    Some(i32::from_ne_bytes(bytes))
}

fn read_u32() -> Option<u32> {
    read_i32().map(|v| v as u32)
}

fn read_u64() -> Option<u64> {
    let (bytewidth, count) = read_header()?;
    if bytewidth != 8 || count != 1 {
        return None;
    }
    let mut bytes = [0u8; 8];
    if !read_exact(&mut bytes) {
        return None;
    }
    Some(u64::from_ne_bytes(bytes))
}

fn reply(code: i32) {
    let mut buf = Vec::with_capacity(8);
    buf.extend(4u16.to_ne_bytes());
    buf.extend(1u16.to_ne_bytes());
    buf.extend(code.to_ne_bytes());

    let mut stdout = io::stdout().lock();
    let _ = stdout.write_all(&buf);
    let _ = stdout.flush();
}
