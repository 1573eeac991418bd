//! The fixed partition layout of a gokrazy disk and the identifiers
//! derived from the hostname.

use std::fmt;

use anyhow::Result;
use uuid::Uuid;

/// All LBA arithmetic is in units of 512 byte sectors.
pub const SECTOR_SIZE: u64 = 512;
const MIB: u64 = 1024 * 1024;

/// Default LBA of the first (boot) partition.
pub const DEFAULT_FIRST_PARTITION_OFFSET: u64 = 8192;
/// Size of the FAT32 boot partition.
pub const BOOT_PARTITION_BYTES: u64 = 100 * MIB;
/// Size of each of the two SquashFS root partitions.
pub const ROOT_PARTITION_BYTES: u64 = 500 * MIB;
/// Sectors at the end of the disk reserved for the backup GPT
/// (32 sectors of partition entries plus the header).
pub const GPT_BACKUP_SECTORS: u64 = 33;
/// Images smaller than this (plus the first partition offset) cannot hold
/// a usable perm partition.
pub const MINIMUM_STORAGE_BYTES: u64 = 1200 * MIB;

/// Prefix shared by the disk GUID and all partition GUIDs.
const GUID_PREFIX: &str = "60c24cc1-f3f9-427a-8199";

/// A contiguous range of sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First sector
    pub start_lba: u64,
    /// Number of sectors
    pub sectors: u64,
}

impl Extent {
    /// The last sector which is part of this extent (inclusive).
    pub fn last_lba(&self) -> u64 {
        self.start_lba + self.sectors - 1
    }

    /// One past the last sector.
    pub fn end_lba(&self) -> u64 {
        self.start_lba + self.sectors
    }

    /// Byte offset of the first sector.
    pub fn offset_bytes(&self) -> u64 {
        self.start_lba * SECTOR_SIZE
    }

    /// Size in bytes.
    pub fn len_bytes(&self) -> u64 {
        self.sectors * SECTOR_SIZE
    }
}

/// Errors in the requested disk geometry.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LayoutError {
    /// The storage size is not sector aligned.
    #[error("target storage size {0} is not a multiple of {SECTOR_SIZE} bytes")]
    Unaligned(u64),
    /// The storage is too small for boot, two roots and a perm partition.
    #[error("target storage size {size} is too small: need at least {minimum} bytes")]
    TooSmall {
        /// The requested size
        size: u64,
        /// The minimum acceptable size
        minimum: u64,
    },
}

/// The partition layout: boot, root A, root B, perm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    first_partition_offset: u64,
    total_sectors: u64,
}

impl Layout {
    /// The smallest storage size accepted for a given first partition offset.
    pub fn minimum_bytes(first_partition_offset: u64) -> u64 {
        MINIMUM_STORAGE_BYTES + first_partition_offset * SECTOR_SIZE
    }

    /// Validate the storage size and compute the layout.
    pub fn new(total_bytes: u64, first_partition_offset: u64) -> Result<Self, LayoutError> {
        if total_bytes % SECTOR_SIZE != 0 {
            return Err(LayoutError::Unaligned(total_bytes));
        }
        let minimum = Self::minimum_bytes(first_partition_offset);
        if total_bytes < minimum {
            return Err(LayoutError::TooSmall {
                size: total_bytes,
                minimum,
            });
        }
        Ok(Self::unchecked(total_bytes / SECTOR_SIZE, first_partition_offset))
    }

    /// Compute the layout without enforcing the minimum size. The caller must
    /// guarantee there is room for the perm partition.
    pub(crate) fn unchecked(total_sectors: u64, first_partition_offset: u64) -> Self {
        Self {
            first_partition_offset,
            total_sectors,
        }
    }

    /// Total sectors of the underlying storage.
    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    /// The LBA of the boot partition.
    pub fn first_partition_offset(&self) -> u64 {
        self.first_partition_offset
    }

    /// Partition 1: FAT32 boot.
    pub fn boot(&self) -> Extent {
        Extent {
            start_lba: self.first_partition_offset,
            sectors: BOOT_PARTITION_BYTES / SECTOR_SIZE,
        }
    }

    /// Partition 2: SquashFS root A.
    pub fn root_a(&self) -> Extent {
        Extent {
            start_lba: self.boot().end_lba(),
            sectors: ROOT_PARTITION_BYTES / SECTOR_SIZE,
        }
    }

    /// Partition 3: SquashFS root B.
    pub fn root_b(&self) -> Extent {
        Extent {
            start_lba: self.root_a().end_lba(),
            sectors: ROOT_PARTITION_BYTES / SECTOR_SIZE,
        }
    }

    /// Partition 4: the writable perm partition, extending to the end of
    /// the disk minus the backup GPT.
    pub fn perm(&self) -> Extent {
        let start_lba = self.root_b().end_lba();
        Extent {
            start_lba,
            sectors: self.total_sectors - GPT_BACKUP_SECTORS - start_lba,
        }
    }

    /// All four partitions in table order.
    pub fn partitions(&self) -> [Extent; 4] {
        [self.boot(), self.root_a(), self.root_b(), self.perm()]
    }
}

/// Compute the 32 bit FNV-1a hash of the input.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    data.iter().fold(OFFSET_BASIS, |h, &b| (h ^ u32::from(b)).wrapping_mul(PRIME))
}

/// The PARTUUID derived from the hostname. It is the MBR disk signature and
/// the variable part of the GPT GUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartUuid(pub u32);

impl PartUuid {
    /// Derive the identifier from a hostname.
    pub fn from_hostname(hostname: &str) -> Self {
        Self(fnv1a_32(hostname.as_bytes()))
    }

    /// The hash in little-endian hex form, as it appears in GUIDs.
    fn le_hex(&self) -> String {
        self.0
            .to_le_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// The disk GUID (`partition == 0`) or the GUID of partition 1-4.
    pub fn guid(&self, partition: u8) -> Uuid {
        let s = format!("{GUID_PREFIX}-{}00{partition:02x}", self.le_hex());
        // The input is always 36 characters of valid hex and dashes
        Uuid::parse_str(&s).unwrap_or(Uuid::nil())
    }

    /// The disk GUID.
    pub fn disk_guid(&self) -> Uuid {
        self.guid(0)
    }
}

impl fmt::Display for PartUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// How the kernel should locate its root filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootSpec {
    /// Leave whatever `root=` the kernel package ships.
    Untouched,
    /// `root=PARTUUID=<signature>-02`, MBR based.
    LegacyPartuuid(PartUuid),
    /// Locate the root relative to the booted partition via its GPT GUID.
    GptPartuuid(PartUuid),
}

impl RootSpec {
    /// The `root=` kernel argument, if any.
    pub fn kernel_arg(&self) -> Option<String> {
        match self {
            RootSpec::Untouched => None,
            RootSpec::LegacyPartuuid(p) => Some(format!("root=PARTUUID={p}-02")),
            RootSpec::GptPartuuid(p) => {
                Some(format!("root=PARTUUID={}/PARTNROFF=1", p.guid(1)))
            }
        }
    }
}

/// Parse a size with an optional binary suffix (`K`, `M`, `G`, `T`,
/// optionally followed by `iB`) into bytes.
pub fn parse_size_bytes(s: &str) -> Result<u64> {
    let s = s.trim();
    let suffixes = [
        ("KiB", 1u64 << 10),
        ("K", 1 << 10),
        ("MiB", 1 << 20),
        ("M", 1 << 20),
        ("GiB", 1 << 30),
        ("G", 1 << 30),
        ("TiB", 1 << 40),
        ("T", 1 << 40),
    ];
    let (digits, mul) = suffixes
        .iter()
        .find_map(|(suffix, mul)| s.strip_suffix(suffix).map(|d| (d, *mul)))
        .unwrap_or((s, 1));
    let v = digits.parse::<u64>()?;
    v.checked_mul(mul)
        .ok_or_else(|| anyhow::anyhow!("Size too large: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_default() {
        let layout = Layout::new(1610612736, DEFAULT_FIRST_PARTITION_OFFSET).unwrap();
        assert_eq!(layout.boot().start_lba, 8192);
        assert_eq!(layout.boot().sectors, 204800);
        assert_eq!(layout.root_a().start_lba, 8192 + 204800);
        assert_eq!(layout.root_b().start_lba, 8192 + 204800 + 1024000);
        assert_eq!(layout.perm().start_lba, 8192 + 204800 + 2 * 1024000);
        assert_eq!(layout.perm().last_lba(), 1610612736 / 512 - 34);
    }

    #[test]
    fn test_layout_perm_never_overlaps_backup_gpt() {
        let offset = DEFAULT_FIRST_PARTITION_OFFSET;
        let start = Layout::minimum_bytes(offset);
        for extra_sectors in [0u64, 1, 33, 34, 4095, 1 << 20, 1 << 30] {
            let size = start + extra_sectors * SECTOR_SIZE;
            let layout = Layout::new(size, offset).unwrap();
            assert!(layout.perm().last_lba() <= size / SECTOR_SIZE - 34);
            let parts = layout.partitions();
            for w in parts.windows(2) {
                assert_eq!(w[0].end_lba(), w[1].start_lba);
            }
        }
    }

    #[test]
    fn test_layout_rejects() {
        assert_eq!(
            Layout::new(1610612737, 8192),
            Err(LayoutError::Unaligned(1610612737))
        );
        assert!(matches!(
            Layout::new(1024 * 1024 * 1024, 8192),
            Err(LayoutError::TooSmall { .. })
        ));
        // The minimum is inclusive
        assert!(Layout::new(Layout::minimum_bytes(2048), 2048).is_ok());
    }

    #[test]
    fn test_fnv() {
        // Reference values of the 32 bit FNV-1a function
        assert_eq!(fnv1a_32(b""), 0x811c9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_guids_share_prefix() {
        for host in ["gokrazy", "pi", "scan2drive", "router7"] {
            let p = PartUuid::from_hostname(host);
            let guids: Vec<String> = (1..=4).map(|i| p.guid(i).to_string()).collect();
            // "60c24cc1-f3f9-427a-8199-" plus the hash and the 00 byte
            let prefix = &guids[0][..guids[0].len() - 2];
            for (i, g) in guids.iter().enumerate() {
                assert_eq!(&g[..prefix.len()], prefix);
                assert_eq!(&g[prefix.len()..], format!("{:02x}", i + 1));
            }
            assert!(p.disk_guid().to_string().ends_with("0000"));
        }
    }

    #[test]
    fn test_root_spec() {
        let p = PartUuid(0x2e18c40c);
        assert_eq!(RootSpec::Untouched.kernel_arg(), None);
        assert_eq!(
            RootSpec::LegacyPartuuid(p).kernel_arg().unwrap(),
            "root=PARTUUID=2e18c40c-02"
        );
        assert_eq!(
            RootSpec::GptPartuuid(p).kernel_arg().unwrap(),
            "root=PARTUUID=60c24cc1-f3f9-427a-8199-0cc4182e0001/PARTNROFF=1"
        );
    }

    #[test]
    fn test_parse_size_bytes() {
        let cases = [
            ("0", 0),
            ("512", 512),
            ("1536M", 1536 << 20),
            ("1536MiB", 1536 << 20),
            ("2G", 2 << 30),
            ("1T", 1 << 40),
        ];
        for (s, v) in cases {
            assert_eq!(parse_size_bytes(s).unwrap(), v, "Parsing {s}");
        }
        assert!(parse_size_bytes("12X").is_err());
    }
}
