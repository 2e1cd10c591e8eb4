use std::fs;
use std::io;
use std::path::PathBuf;

/// Scheduler state of a process, as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    /// Actively executing.
    Running,
    /// Sleeping in an interruptible wait.
    WaitingInterruptible,
    /// Sleeping in an uninterruptible wait.
    WaitingUninterruptible,
    /// Exited but not yet reaped.
    Zombie,
    /// Stopped by a signal or a tracer.
    Stopped,
}

impl ExecState {
    fn from_char(c: char) -> Option<ExecState> {
        match c {
            'R' => Some(ExecState::Running),
            'S' => Some(ExecState::WaitingInterruptible),
            'D' => Some(ExecState::WaitingUninterruptible),
            'Z' => Some(ExecState::Zombie),
            'T' | 't' => Some(ExecState::Stopped),
            _ => None,
        }
    }
}

/// One decoded process-table entry.
#[derive(Debug, Clone)]
pub struct ProcessState {
    pub name: String,
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub state: ExecState,
    pub user_id: libc::uid_t,
    pub group_id: libc::gid_t,
    pub process_id: libc::pid_t,
    pub parent_process_id: libc::pid_t,
    pub process_group_id: libc::pid_t,
    pub session_id: libc::pid_t,
    pub tty_device: libc::dev_t,
    pub nice: i32,
}

/// Decode `/proc/<pid>`. Fails with `NotFound` once the process is gone.
pub fn procstat(pid: libc::pid_t) -> io::Result<ProcessState> {
    let root = PathBuf::from(format!("/proc/{}", pid));

    let stat = fs::read_to_string(root.join("stat"))?;

    // the comm field is parenthesised and may itself contain spaces or
    // parentheses; split around the outermost pair
    let open = stat
        .find('(')
        .ok_or_else(|| malformed("malformed stat line"))?;
    let close = stat
        .rfind(')')
        .ok_or_else(|| malformed("malformed stat line"))?;

    let name = stat[open + 1..close].to_string();
    let rest: Vec<&str> = stat[close + 1..].split_whitespace().collect();

    // field numbering as in proc(5); `rest[0]` is field 3 (state)
    let state_char = rest
        .first()
        .and_then(|s| s.chars().next())
        .ok_or_else(|| malformed("truncated stat line"))?;
    let state = ExecState::from_char(state_char)
        .ok_or_else(|| malformed("unknown process state"))?;

    let field = |idx: usize| -> io::Result<i64> {
        rest.get(idx)
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| malformed("truncated stat line"))
    };

    let parent_process_id = field(1)? as libc::pid_t;
    let process_group_id = field(2)? as libc::pid_t;
    let session_id = field(3)? as libc::pid_t;
    let tty_device = field(4)? as libc::dev_t;
    let nice = field(16)? as i32;

    let (user_id, group_id) = owner_ids(&root)?;

    let arguments = fs::read(root.join("cmdline"))
        .map(|bytes| {
            bytes
                .split(|&b| b == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect()
        })
        .unwrap_or_default();

    let executable = fs::read_link(root.join("exe")).unwrap_or_default();

    Ok(ProcessState {
        name,
        executable,
        arguments,
        state,
        user_id,
        group_id,
        process_id: pid,
        parent_process_id,
        process_group_id,
        session_id,
        tty_device,
        nice,
    })
}

fn owner_ids(root: &std::path::Path) -> io::Result<(libc::uid_t, libc::gid_t)> {
    let status = fs::read_to_string(root.join("status"))?;
    let mut uid = 0;
    let mut gid = 0;

    for line in status.lines() {
        if let Some(value) = line.strip_prefix("Uid:") {
            // real uid is the first column
            uid = value
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("Gid:") {
            gid = value
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        }
    }

    Ok((uid, gid))
}

fn malformed(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_self() {
        let me = unsafe { libc::getpid() };
        let state = procstat(me).unwrap();

        assert_eq!(state.process_id, me);
        assert_eq!(state.user_id, unsafe { libc::getuid() });
        assert_eq!(state.state, ExecState::Running);
        assert!(!state.name.is_empty());
        assert!(!state.arguments.is_empty());
    }

    #[test]
    fn missing_pid_reports_not_found() {
        // pid 0 has no /proc entry
        assert!(procstat(0).is_err());
    }
}
