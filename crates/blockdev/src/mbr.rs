//! Master boot record synthesis.

use crate::layout::{Extent, Layout, PartUuid};

/// Size of the boot code area, which is what gets streamed to a running
/// appliance as its `mbr` update.
pub const BOOTCODE_LEN: usize = 446;
/// Offset of the LBA of `/vmlinuz` within the boot code.
pub const VMLINUZ_LBA_OFFSET: usize = 218;
/// Offset of the LBA of `/cmdline.txt` within the boot code.
pub const CMDLINE_LBA_OFFSET: usize = 222;
/// Offset of the 32 bit disk signature.
pub const DISK_SIGNATURE_OFFSET: usize = 440;

const PARTITION_TABLE_OFFSET: usize = 446;
const PARTITION_ENTRY_LEN: usize = 16;
/// CHS addresses are unused; this is the "beyond 8 GiB" marker.
const CHS_INVALID: [u8; 3] = [0xfe, 0xff, 0xff];

const TYPE_FAT32_LBA: u8 = 0x0c;
const TYPE_GPT_PROTECTIVE: u8 = 0xee;
const TYPE_LINUX: u8 = 0x83;

static_assertions::const_assert!(DISK_SIGNATURE_OFFSET + 4 <= BOOTCODE_LEN);
static_assertions::const_assert_eq!(
    PARTITION_TABLE_OFFSET + 4 * PARTITION_ENTRY_LEN + 2,
    crate::layout::SECTOR_SIZE as usize
);

/// Which partitions the MBR describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbrMode {
    /// The FAT partition plus a protective entry covering the GPT; the GPT
    /// describes everything.
    Hybrid,
    /// All four partitions, no GPT. Used for device types whose bootloader
    /// overwrites the GPT sectors.
    MbrOnly,
}

impl MbrMode {
    /// Whether a GPT is written alongside the MBR.
    pub fn has_gpt(&self) -> bool {
        matches!(self, MbrMode::Hybrid)
    }
}

fn entry(active: bool, ptype: u8, start_lba: u64, sectors: u64) -> [u8; PARTITION_ENTRY_LEN] {
    let mut e = [0u8; PARTITION_ENTRY_LEN];
    e[0] = if active { 0x80 } else { 0x00 };
    e[1..4].copy_from_slice(&CHS_INVALID);
    e[4] = ptype;
    e[5..8].copy_from_slice(&CHS_INVALID);
    // MBR fields are 32 bit; the minimum and maximum sizes we lay out
    // stay well within that for any disk MBR can address at all.
    let clamp = |v: u64| u32::try_from(v).unwrap_or(u32::MAX);
    e[8..12].copy_from_slice(&clamp(start_lba).to_le_bytes());
    e[12..16].copy_from_slice(&clamp(sectors).to_le_bytes());
    e
}

fn linux(extent: Extent) -> [u8; PARTITION_ENTRY_LEN] {
    entry(false, TYPE_LINUX, extent.start_lba, extent.sectors)
}

/// Render the first sector of the disk. The boot code area is zero; it is
/// filled in later by [`write_mbr_bootcode`] once the boot partition exists.
pub fn mbr_sector(layout: &Layout, mode: MbrMode, partuuid: PartUuid) -> [u8; 512] {
    let mut buf = [0u8; 512];
    buf[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4].copy_from_slice(&partuuid.0.to_le_bytes());
    let boot = layout.boot();
    let mut entries = [[0u8; PARTITION_ENTRY_LEN]; 4];
    entries[0] = entry(true, TYPE_FAT32_LBA, boot.start_lba, boot.sectors);
    match mode {
        MbrMode::Hybrid => {
            let gpt_sectors = layout.first_partition_offset() - 1;
            entries[1] = entry(false, TYPE_GPT_PROTECTIVE, 1, gpt_sectors);
        }
        MbrMode::MbrOnly => {
            entries[1] = linux(layout.root_a());
            entries[2] = linux(layout.root_b());
            entries[3] = linux(layout.perm());
        }
    }
    for (i, e) in entries.iter().enumerate() {
        let off = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_LEN;
        buf[off..off + PARTITION_ENTRY_LEN].copy_from_slice(e);
    }
    buf[510] = 0x55;
    buf[511] = 0xaa;
    buf
}

/// Render the boot code area, which holds the sector addresses of the
/// kernel and its command line (relative to the start of the disk) and the
/// disk signature.
pub fn write_mbr_bootcode(vmlinuz_lba: u32, cmdline_lba: u32, partuuid: PartUuid) -> [u8; BOOTCODE_LEN] {
    let mut buf = [0u8; BOOTCODE_LEN];
    buf[VMLINUZ_LBA_OFFSET..VMLINUZ_LBA_OFFSET + 4].copy_from_slice(&vmlinuz_lba.to_le_bytes());
    buf[CMDLINE_LBA_OFFSET..CMDLINE_LBA_OFFSET + 4].copy_from_slice(&cmdline_lba.to_le_bytes());
    buf[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4].copy_from_slice(&partuuid.0.to_le_bytes());
    buf
}

/// Read back one of the 32 bit little-endian fields of a boot code area.
pub fn read_u32(bootcode: &[u8], offset: usize) -> Option<u32> {
    let b = bootcode.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::DEFAULT_FIRST_PARTITION_OFFSET;

    fn layout() -> Layout {
        Layout::new(1610612736, DEFAULT_FIRST_PARTITION_OFFSET).unwrap()
    }

    fn entry_at(buf: &[u8], i: usize) -> &[u8] {
        let off = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_LEN;
        &buf[off..off + PARTITION_ENTRY_LEN]
    }

    #[test]
    fn test_hybrid() {
        let p = PartUuid::from_hostname("gokrazy");
        let buf = mbr_sector(&layout(), MbrMode::Hybrid, p);
        assert!(buf[..DISK_SIGNATURE_OFFSET].iter().all(|&b| b == 0));
        assert_eq!(&buf[510..], &[0x55, 0xaa]);
        assert_eq!(read_u32(&buf, DISK_SIGNATURE_OFFSET), Some(p.0));

        let e = entry_at(&buf, 0);
        assert_eq!(e[0], 0x80);
        assert_eq!(&e[1..4], &CHS_INVALID);
        assert_eq!(e[4], TYPE_FAT32_LBA);
        assert_eq!(read_u32(e, 8), Some(8192));
        assert_eq!(read_u32(e, 12), Some(204800));

        let e = entry_at(&buf, 1);
        assert_eq!(e[0], 0);
        assert_eq!(e[4], TYPE_GPT_PROTECTIVE);
        assert_eq!(read_u32(e, 8), Some(1));
        assert_eq!(read_u32(e, 12), Some(8191));

        assert!(entry_at(&buf, 2).iter().all(|&b| b == 0));
        assert!(entry_at(&buf, 3).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_mbr_only() {
        let l = layout();
        let buf = mbr_sector(&l, MbrMode::MbrOnly, PartUuid(1));
        let types: Vec<u8> = (0..4).map(|i| entry_at(&buf, i)[4]).collect();
        assert_eq!(types, [0x0c, 0x83, 0x83, 0x83]);
        for (i, ext) in l.partitions().iter().enumerate() {
            let e = entry_at(&buf, i);
            assert_eq!(read_u32(e, 8), Some(ext.start_lba as u32));
            assert_eq!(read_u32(e, 12), Some(ext.sectors as u32));
            assert_eq!(e[0] == 0x80, i == 0);
        }
    }

    #[test]
    fn test_bootcode() {
        let p = PartUuid(0xdeadbeef);
        let buf = write_mbr_bootcode(8192 + 17, 8192 + 3, p);
        assert_eq!(read_u32(&buf, VMLINUZ_LBA_OFFSET), Some(8209));
        assert_eq!(read_u32(&buf, CMDLINE_LBA_OFFSET), Some(8195));
        assert_eq!(read_u32(&buf, DISK_SIGNATURE_OFFSET), Some(0xdeadbeef));
        assert_eq!(read_u32(&buf, BOOTCODE_LEN - 2), None);
    }
}
