use std::fs;
use std::io;

/// Every live pid, from the numeric entries of `/proc`.
pub fn proclist() -> io::Result<Vec<libc::pid_t>> {
    let mut pids = Vec::new();

    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        if let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<libc::pid_t>().ok())
        {
            pids.push(pid);
        }
    }

    pids.sort_unstable();
    Ok(pids)
}

#[cfg(test)]
mod test {
    use super::proclist;

    #[test]
    fn lists_init_and_self() {
        let pids = proclist().unwrap();
        assert!(pids.contains(&1));
        assert!(pids.contains(&unsafe { libc::getpid() }));
    }
}
