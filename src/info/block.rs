use std::io::{self, Read, Seek, SeekFrom};

/// The ext superblock lives one block-size unit into the device.
const SUPERBLOCK_OFFSET: u64 = 1024;
const SUPERBLOCK_LEN: usize = 1024;

const MAGIC_OFFSET: usize = 0x38;
const FEATURE_COMPAT_OFFSET: usize = 0x5C;
const FEATURE_INCOMPAT_OFFSET: usize = 0x60;
const FEATURE_RO_COMPAT_OFFSET: usize = 0x64;
const UUID_OFFSET: usize = 0x68;
const LABEL_OFFSET: usize = 0x78;
const FLAGS_OFFSET: usize = 0x160;

const EXT_MAGIC: u16 = 0xEF53;

// feature bits the kernel uses to tell the family members apart
const COMPAT_HAS_JOURNAL: u32 = 0x0004;
const INCOMPAT_JOURNAL_DEV: u32 = 0x0008;
const INCOMPAT_EXT4_MASK: u32 = 0x0040 | 0x0080 | 0x0100 | 0x0200; // extents, 64bit, mmp, flex_bg
const RO_COMPAT_EXT4_MASK: u32 = 0x0008 | 0x0010 | 0x0020 | 0x0040; // huge_file, gdt_csum, dir_nlink, extra_isize
const FLAG_TEST_FILESYS: u32 = 0x0004;

/// Which member of the ext family a superblock belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtKind {
    Ext2,
    Ext3,
    Ext4,
    /// An ext4 filesystem marked as a development build.
    Ext4Dev,
    /// An external journal device.
    Jbd,
}

/// Decoded identification data for an ext2/3/4/jbd superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtProbe {
    pub kind: ExtKind,
    pub uuid: [u8; 16],
    pub label: String,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub flags: u32,
}

/// Read one superblock from `source` and classify it. `Ok(None)` means
/// the magic did not match: not an ext filesystem.
pub fn probe_ext<R: Read + Seek>(source: &mut R) -> io::Result<Option<ExtProbe>> {
    let mut superblock = [0u8; SUPERBLOCK_LEN];
    source.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
    source.read_exact(&mut superblock)?;

    Ok(probe_superblock(&superblock))
}

pub(crate) fn probe_superblock(superblock: &[u8; SUPERBLOCK_LEN]) -> Option<ExtProbe> {
    if read_u16(superblock, MAGIC_OFFSET) != EXT_MAGIC {
        return None;
    }

    let feature_compat = read_u32(superblock, FEATURE_COMPAT_OFFSET);
    let feature_incompat = read_u32(superblock, FEATURE_INCOMPAT_OFFSET);
    let feature_ro_compat = read_u32(superblock, FEATURE_RO_COMPAT_OFFSET);
    let flags = read_u32(superblock, FLAGS_OFFSET);

    let kind = if feature_incompat & INCOMPAT_JOURNAL_DEV != 0 {
        ExtKind::Jbd
    } else if feature_incompat & INCOMPAT_EXT4_MASK != 0
        || feature_ro_compat & RO_COMPAT_EXT4_MASK != 0
    {
        if flags & FLAG_TEST_FILESYS != 0 {
            ExtKind::Ext4Dev
        } else {
            ExtKind::Ext4
        }
    } else if feature_compat & COMPAT_HAS_JOURNAL != 0 {
        ExtKind::Ext3
    } else {
        ExtKind::Ext2
    };

    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&superblock[UUID_OFFSET..UUID_OFFSET + 16]);

    let label_bytes = &superblock[LABEL_OFFSET..LABEL_OFFSET + 16];
    let label_end = label_bytes.iter().position(|&b| b == 0).unwrap_or(16);
    let label = String::from_utf8_lossy(&label_bytes[..label_end]).into_owned();

    Some(ExtProbe {
        kind,
        uuid,
        label,
        feature_compat,
        feature_incompat,
        feature_ro_compat,
        flags,
    })
}

fn read_u16(block: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([block[offset], block[offset + 1]])
}

fn read_u32(block: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        block[offset],
        block[offset + 1],
        block[offset + 2],
        block[offset + 3],
    ])
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn synthetic(compat: u32, incompat: u32, ro_compat: u32, flags: u32) -> [u8; SUPERBLOCK_LEN] {
        let mut block = [0u8; SUPERBLOCK_LEN];
        block[MAGIC_OFFSET..MAGIC_OFFSET + 2].copy_from_slice(&EXT_MAGIC.to_le_bytes());
        block[FEATURE_COMPAT_OFFSET..FEATURE_COMPAT_OFFSET + 4]
            .copy_from_slice(&compat.to_le_bytes());
        block[FEATURE_INCOMPAT_OFFSET..FEATURE_INCOMPAT_OFFSET + 4]
            .copy_from_slice(&incompat.to_le_bytes());
        block[FEATURE_RO_COMPAT_OFFSET..FEATURE_RO_COMPAT_OFFSET + 4]
            .copy_from_slice(&ro_compat.to_le_bytes());
        block[FLAGS_OFFSET..FLAGS_OFFSET + 4].copy_from_slice(&flags.to_le_bytes());
        block[UUID_OFFSET..UUID_OFFSET + 16].copy_from_slice(&[0xAB; 16]);
        block[LABEL_OFFSET..LABEL_OFFSET + 5].copy_from_slice(b"disk0");
        block
    }

    #[test]
    fn classification_matrix() {
        let ext2 = probe_superblock(&synthetic(0, 0, 0, 0)).unwrap();
        assert_eq!(ext2.kind, ExtKind::Ext2);

        let ext3 = probe_superblock(&synthetic(COMPAT_HAS_JOURNAL, 0, 0, 0)).unwrap();
        assert_eq!(ext3.kind, ExtKind::Ext3);

        let ext4 =
            probe_superblock(&synthetic(COMPAT_HAS_JOURNAL, 0x0040, 0x0040, 0)).unwrap();
        assert_eq!(ext4.kind, ExtKind::Ext4);

        let ext4dev = probe_superblock(&synthetic(
            COMPAT_HAS_JOURNAL,
            0x0040,
            0,
            FLAG_TEST_FILESYS,
        ))
        .unwrap();
        assert_eq!(ext4dev.kind, ExtKind::Ext4Dev);

        let jbd =
            probe_superblock(&synthetic(0, INCOMPAT_JOURNAL_DEV | 0x0040, 0, 0)).unwrap();
        assert_eq!(jbd.kind, ExtKind::Jbd);
    }

    #[test]
    fn uuid_and_label_extracted() {
        let probe = probe_superblock(&synthetic(0, 0, 0, 0)).unwrap();
        assert_eq!(probe.uuid, [0xAB; 16]);
        assert_eq!(probe.label, "disk0");
    }

    #[test]
    fn wrong_magic_is_not_ext() {
        let mut block = synthetic(0, 0, 0, 0);
        block[MAGIC_OFFSET] = 0x00;
        assert!(probe_superblock(&block).is_none());
    }

    #[test]
    fn probe_reads_past_the_boot_block() {
        let mut device = vec![0u8; 4096];
        device[SUPERBLOCK_OFFSET as usize..SUPERBLOCK_OFFSET as usize + SUPERBLOCK_LEN]
            .copy_from_slice(&synthetic(0, 0, 0, 0));

        let probe = probe_ext(&mut Cursor::new(device)).unwrap().unwrap();
        assert_eq!(probe.kind, ExtKind::Ext2);
    }
}
