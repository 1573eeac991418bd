//! GUID partition table synthesis, and a minimal parser used to verify it.

use std::io::{Seek, SeekFrom, Write};

use anyhow::{Context, Result};
use fn_error_context::context;
use uuid::{uuid, Uuid};

use crate::layout::{Layout, PartUuid, SECTOR_SIZE};
use crate::mbr::{mbr_sector, MbrMode};

const SIGNATURE: &[u8; 8] = b"EFI PART";
const REVISION: u32 = 0x0001_0000;
const HEADER_SIZE: u32 = 92;
/// Number of partition entries in the array.
pub const ENTRIES_COUNT: u32 = 128;
/// Size of each partition entry.
pub const ENTRY_SIZE: u32 = 128;
const ENTRIES_BYTES: usize = (ENTRIES_COUNT * ENTRY_SIZE) as usize;
/// Sectors occupied by the entry array.
pub const ENTRIES_SECTORS: u64 = ENTRIES_BYTES as u64 / SECTOR_SIZE;
/// The first LBA after the protective MBR, header and entry array.
pub const FIRST_USABLE_LBA: u64 = 2 + ENTRIES_SECTORS;

static_assertions::const_assert_eq!(FIRST_USABLE_LBA, 34);
static_assertions::const_assert_eq!(
    ENTRIES_SECTORS + 1,
    crate::layout::GPT_BACKUP_SECTORS
);

/// EFI system partition
pub const ESP_TYPE: Uuid = uuid!("C12A7328-F81F-11D2-BA4B-00A0C93EC93B");
/// Linux root (x86-64)
pub const ROOT_AMD64_TYPE: Uuid = uuid!("4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709");
/// Linux root (ARM 64-bit)
pub const ROOT_ARM64_TYPE: Uuid = uuid!("B921B045-1DF0-41C3-AF44-4C6F280D3FAE");
/// Linux filesystem data
pub const LINUX_DATA_TYPE: Uuid = uuid!("0FC63DAF-8483-4772-8E79-3D69D8477DE4");

/// The target architecture, which selects the root partition type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Arch {
    /// x86-64
    Amd64,
    /// aarch64
    #[default]
    Arm64,
}

impl Arch {
    /// Map a `GOARCH` style name; anything unknown is treated as arm64.
    pub fn from_goarch(goarch: &str) -> Self {
        match goarch {
            "amd64" => Arch::Amd64,
            _ => Arch::Arm64,
        }
    }

    /// The discoverable partition type of a root filesystem.
    pub fn root_type(&self) -> Uuid {
        match self {
            Arch::Amd64 => ROOT_AMD64_TYPE,
            Arch::Arm64 => ROOT_ARM64_TYPE,
        }
    }
}

/// IEEE 802.3 CRC32, as used by the GPT header and entry checksums.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &b in data {
        crc ^= u32::from(b);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}

fn entries(layout: &Layout, partuuid: PartUuid, arch: Arch) -> Vec<u8> {
    let types = [ESP_TYPE, arch.root_type(), LINUX_DATA_TYPE, LINUX_DATA_TYPE];
    let mut buf = vec![0u8; ENTRIES_BYTES];
    for (i, (ext, ptype)) in layout.partitions().iter().zip(types).enumerate() {
        let e = &mut buf[i * ENTRY_SIZE as usize..(i + 1) * ENTRY_SIZE as usize];
        e[0..16].copy_from_slice(&ptype.to_bytes_le());
        e[16..32].copy_from_slice(&partuuid.guid(i as u8 + 1).to_bytes_le());
        e[32..40].copy_from_slice(&ext.start_lba.to_le_bytes());
        e[40..48].copy_from_slice(&ext.last_lba().to_le_bytes());
        // attributes and name stay zero
    }
    buf
}

fn header(
    layout: &Layout,
    partuuid: PartUuid,
    my_lba: u64,
    alternate_lba: u64,
    entries_lba: u64,
    entries_crc: u32,
) -> [u8; SECTOR_SIZE as usize] {
    let mut h = [0u8; SECTOR_SIZE as usize];
    h[0..8].copy_from_slice(SIGNATURE);
    h[8..12].copy_from_slice(&REVISION.to_le_bytes());
    h[12..16].copy_from_slice(&HEADER_SIZE.to_le_bytes());
    h[24..32].copy_from_slice(&my_lba.to_le_bytes());
    h[32..40].copy_from_slice(&alternate_lba.to_le_bytes());
    h[40..48].copy_from_slice(&FIRST_USABLE_LBA.to_le_bytes());
    let last_usable = layout.total_sectors() - FIRST_USABLE_LBA;
    h[48..56].copy_from_slice(&last_usable.to_le_bytes());
    h[56..72].copy_from_slice(&partuuid.disk_guid().to_bytes_le());
    h[72..80].copy_from_slice(&entries_lba.to_le_bytes());
    h[80..84].copy_from_slice(&ENTRIES_COUNT.to_le_bytes());
    h[84..88].copy_from_slice(&ENTRY_SIZE.to_le_bytes());
    h[88..92].copy_from_slice(&entries_crc.to_le_bytes());
    let crc = crc32(&h[..HEADER_SIZE as usize]);
    h[16..20].copy_from_slice(&crc.to_le_bytes());
    h
}

/// Write the MBR and, in hybrid mode, the primary and backup GPT. The sink
/// must already be sized to the full storage.
#[context("Writing partition table")]
pub fn write_partition_table<W: Write + Seek>(
    w: &mut W,
    layout: &Layout,
    mode: MbrMode,
    partuuid: PartUuid,
    arch: Arch,
) -> Result<()> {
    w.seek(SeekFrom::Start(0))?;
    w.write_all(&mbr_sector(layout, mode, partuuid))?;
    if !mode.has_gpt() {
        return Ok(());
    }

    let entries = entries(layout, partuuid, arch);
    let entries_crc = crc32(&entries);
    let last_lba = layout.total_sectors() - 1;
    let backup_entries_lba = last_lba - ENTRIES_SECTORS;

    let primary = header(layout, partuuid, 1, last_lba, 2, entries_crc);
    w.write_all(&primary)?;
    w.write_all(&entries)?;

    let backup = header(layout, partuuid, last_lba, 1, backup_entries_lba, entries_crc);
    w.seek(SeekFrom::Start(backup_entries_lba * SECTOR_SIZE))
        .context("Seeking to backup GPT")?;
    w.write_all(&entries)?;
    w.write_all(&backup)?;
    tracing::debug!("Wrote GPT for disk {}", partuuid.disk_guid());
    Ok(())
}

/// A parsed GPT header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    /// LBA of this header
    pub my_lba: u64,
    /// LBA of the other copy
    pub alternate_lba: u64,
    /// First usable LBA
    pub first_usable_lba: u64,
    /// Last usable LBA
    pub last_usable_lba: u64,
    /// Disk GUID
    pub disk_guid: Uuid,
    /// Where the entry array lives
    pub entries_lba: u64,
    /// CRC32 of the entry array
    pub entries_crc: u32,
}

/// A parsed GPT partition entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEntry {
    /// Partition type
    pub type_guid: Uuid,
    /// Unique partition GUID
    pub partition_guid: Uuid,
    /// First sector
    pub first_lba: u64,
    /// Last sector (inclusive)
    pub last_lba: u64,
}

fn le64(b: &[u8], off: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(a)
}

fn le32(b: &[u8], off: usize) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[off..off + 4]);
    u32::from_le_bytes(a)
}

fn guid(b: &[u8], off: usize) -> Uuid {
    let mut a = [0u8; 16];
    a.copy_from_slice(&b[off..off + 16]);
    Uuid::from_bytes_le(a)
}

/// Parse and verify a GPT header sector.
pub fn parse_header(sector: &[u8]) -> Result<GptHeader> {
    anyhow::ensure!(sector.len() >= HEADER_SIZE as usize, "Short GPT header");
    anyhow::ensure!(&sector[0..8] == SIGNATURE, "Missing GPT signature");
    let mut h = sector[..HEADER_SIZE as usize].to_vec();
    let expected = le32(&h, 16);
    h[16..20].fill(0);
    let actual = crc32(&h);
    anyhow::ensure!(
        expected == actual,
        "GPT header checksum mismatch: {expected:#x} != {actual:#x}"
    );
    Ok(GptHeader {
        my_lba: le64(sector, 24),
        alternate_lba: le64(sector, 32),
        first_usable_lba: le64(sector, 40),
        last_usable_lba: le64(sector, 48),
        disk_guid: guid(sector, 56),
        entries_lba: le64(sector, 72),
        entries_crc: le32(sector, 88),
    })
}

/// Parse the non-empty entries of an entry array.
pub fn parse_entries(buf: &[u8]) -> Vec<GptEntry> {
    buf.chunks_exact(ENTRY_SIZE as usize)
        .map(|e| GptEntry {
            type_guid: guid(e, 0),
            partition_guid: guid(e, 16),
            first_lba: le64(e, 32),
            last_lba: le64(e, 40),
        })
        .filter(|e| !e.type_guid.is_nil())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::layout::DEFAULT_FIRST_PARTITION_OFFSET;

    #[test]
    fn test_crc32() {
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32(b"123456789"), 0xcbf43926);
        assert_eq!(crc32(b"The quick brown fox jumps over the lazy dog"), 0x414fa339);
    }

    fn read_at(f: &mut std::fs::File, lba: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        f.seek(SeekFrom::Start(lba * SECTOR_SIZE)).unwrap();
        f.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_hybrid_gpt() -> Result<()> {
        let size = 1610612736u64;
        let layout = Layout::new(size, DEFAULT_FIRST_PARTITION_OFFSET)?;
        let partuuid = PartUuid::from_hostname("gokrazy");
        let mut f = tempfile::tempfile()?;
        f.set_len(size)?;
        write_partition_table(&mut f, &layout, MbrMode::Hybrid, partuuid, Arch::Arm64)?;
        assert_eq!(f.metadata()?.len(), size);

        let mbr = read_at(&mut f, 0, 512);
        assert_eq!(&mbr[510..], &[0x55, 0xaa]);

        let primary = parse_header(&read_at(&mut f, 1, 512))?;
        let total = size / SECTOR_SIZE;
        assert_eq!(primary.my_lba, 1);
        assert_eq!(primary.alternate_lba, total - 1);
        assert_eq!(primary.first_usable_lba, 34);
        assert_eq!(primary.last_usable_lba, total - 34);
        assert_eq!(primary.entries_lba, 2);
        assert_eq!(primary.disk_guid, partuuid.disk_guid());

        let raw = read_at(&mut f, 2, ENTRIES_BYTES);
        assert_eq!(crc32(&raw), primary.entries_crc);
        let parts = parse_entries(&raw);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].type_guid, ESP_TYPE);
        assert_eq!(parts[0].first_lba, 8192);
        assert_eq!(parts[1].type_guid, ROOT_ARM64_TYPE);
        assert_eq!(parts[2].type_guid, LINUX_DATA_TYPE);
        assert_eq!(parts[3].type_guid, LINUX_DATA_TYPE);
        assert_eq!(parts[3].last_lba, total - 34);
        for (i, p) in parts.iter().enumerate() {
            assert_eq!(p.partition_guid, partuuid.guid(i as u8 + 1));
        }

        let backup = parse_header(&read_at(&mut f, total - 1, 512))?;
        assert_eq!(backup.my_lba, total - 1);
        assert_eq!(backup.alternate_lba, 1);
        assert_eq!(backup.entries_lba, total - 33);
        let backup_raw = read_at(&mut f, total - 33, ENTRIES_BYTES);
        assert_eq!(backup_raw, raw);
        Ok(())
    }

    #[test]
    fn test_amd64_root_type() -> Result<()> {
        let layout = Layout::new(1610612736, 2048)?;
        let raw = entries(&layout, PartUuid(7), Arch::from_goarch("amd64"));
        assert_eq!(parse_entries(&raw)[1].type_guid, ROOT_AMD64_TYPE);
        assert_eq!(Arch::from_goarch("riscv64"), Arch::Arm64);
        Ok(())
    }

    #[test]
    fn test_mbr_only_has_no_gpt() -> Result<()> {
        let size = 1610612736u64;
        let layout = Layout::new(size, DEFAULT_FIRST_PARTITION_OFFSET)?;
        let mut f = tempfile::tempfile()?;
        f.set_len(size)?;
        write_partition_table(&mut f, &layout, MbrMode::MbrOnly, PartUuid(1), Arch::Arm64)?;
        assert!(parse_header(&read_at(&mut f, 1, 512)).is_err());
        Ok(())
    }

    #[test]
    fn test_corrupt_header() -> Result<()> {
        let layout = Layout::new(1610612736, 2048)?;
        let mut h = header(&layout, PartUuid(3), 1, 100, 2, 0);
        assert!(parse_header(&h).is_ok());
        h[40] ^= 1;
        assert!(parse_header(&h).is_err());
        Ok(())
    }
}
