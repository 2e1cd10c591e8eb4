use std::io;

use super::fstable::{parse_table, FsEntry};

#[cfg(any(target_os = "linux", target_os = "android"))]
pub const MOUNT_TABLE_FILE: &str = "/proc/self/mounts";
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const MOUNT_TABLE_FILE: &str = "/etc/mtab";

/// Snapshot of the currently mounted filesystems.
pub fn mounts() -> io::Result<Vec<FsEntry>> {
    parse_table(MOUNT_TABLE_FILE)
}

#[cfg(test)]
#[cfg(any(target_os = "linux", target_os = "android"))]
mod test {
    use super::mounts;

    #[test]
    fn root_is_mounted() {
        let table = mounts().unwrap();
        assert!(table.iter().any(|entry| entry.path == "/"));
    }
}
