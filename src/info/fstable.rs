use std::fs;
use std::io;
use std::path::Path;

/// One row of an fstab-dialect table (`/etc/fstab`, `/etc/mtab`,
/// `/proc/self/mounts`): six whitespace-separated fields with octal
/// escapes in the first four.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FsEntry {
    pub device: String,
    pub path: String,
    pub filesystems: String,
    pub options: String,
    pub dump_frequency: i32,
    pub pass: i32,
}

/// Parse a whole table file.
pub fn parse_table<P: AsRef<Path>>(filename: P) -> io::Result<Vec<FsEntry>> {
    Ok(parse_table_str(&fs::read_to_string(filename)?))
}

pub fn parse_table_str(data: &str) -> Vec<FsEntry> {
    data.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<FsEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut fields = line.split_whitespace();

    let device = unescape(fields.next()?);
    let path = unescape(fields.next()?);
    let filesystems = unescape(fields.next()?);
    let options = unescape(fields.next().unwrap_or("defaults"));
    let dump_frequency = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
    let pass = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);

    Some(FsEntry {
        device,
        path,
        filesystems,
        options,
        dump_frequency,
        pass,
    })
}

/// Decode the `\040`-style octal escapes the kernel uses for embedded
/// whitespace in mount paths.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &bytes[i + 1..i + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = octal.iter().fold(0u32, |acc, &b| acc * 8 + (b - b'0') as u32);
                out.push(value as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn six_field_lines() {
        let table = parse_table_str(
            "# root volume\n\
             /dev/sda1 / ext4 rw,relatime 0 1\n\
             \n\
             tmpfs /tmp tmpfs rw,nosuid 0 0\n",
        );

        assert_eq!(table.len(), 2);
        assert_eq!(table[0].device, "/dev/sda1");
        assert_eq!(table[0].path, "/");
        assert_eq!(table[0].filesystems, "ext4");
        assert_eq!(table[0].pass, 1);
        assert_eq!(table[1].options, "rw,nosuid");
    }

    #[test]
    fn short_lines_get_defaults() {
        let table = parse_table_str("proc /proc proc\n");
        assert_eq!(table[0].options, "defaults");
        assert_eq!(table[0].dump_frequency, 0);
        assert_eq!(table[0].pass, 0);
    }

    #[test]
    fn octal_escapes_decode() {
        let table = parse_table_str("/dev/sdb1 /mnt/usb\\040drive vfat rw 0 0\n");
        assert_eq!(table[0].path, "/mnt/usb drive");
    }
}
