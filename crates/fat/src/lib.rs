//! # Writing FAT32 volumes
//!
//! This crate writes FAT32 filesystems deterministically and in a single
//! sequential pass, so the output may be a pipe. It also contains a small
//! reader used to locate files within a written volume.
//!
//! Clusters are one sector (512 bytes) each. Files and directories are
//! allocated contiguously in depth-first order.

mod names;
mod reader;
mod writer;

pub use reader::{DirEntry, Reader};
pub use writer::Writer;

const SECTOR_SIZE: usize = 512;
const CLUSTER_SIZE: usize = SECTOR_SIZE;
const RESERVED_SECTORS: u16 = 32;
const NUM_FATS: u8 = 2;
const ROOT_CLUSTER: u32 = 2;
const FSINFO_SECTOR: u16 = 1;
const BACKUP_BOOT_SECTOR: u16 = 6;
const END_OF_CHAIN: u32 = 0x0fff_ffff;
/// FAT32 volumes must have at least this many clusters.
const MIN_CLUSTERS: u32 = 65525;

const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_ARCHIVE: u8 = 0x20;
const ATTR_VOLUME_ID: u8 = 0x08;

/// Errors from reading or writing a volume.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A path was added twice.
    #[error("duplicate path: {0}")]
    Duplicate(String),
    /// Empty paths and `.`/`..` components are rejected.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    /// A path component exists but is a file.
    #[error("not a directory: {0}")]
    NotADirectory(String),
    /// A directory where a file was expected.
    #[error("is a directory: {0}")]
    IsADirectory(String),
    /// A file exceeds 4 GiB.
    #[error("file too large: {0}")]
    TooLarge(String),
    /// The contents do not fit.
    #[error("volume full: need {needed} clusters, have {available}")]
    Full {
        /// Clusters required
        needed: u32,
        /// Clusters in the volume
        available: u32,
    },
    /// Too few sectors for a FAT32 volume.
    #[error("{0} sectors is too small for FAT32")]
    TooSmall(u32),
    /// Lookup of a missing path.
    #[error("not found: {0}")]
    NotFound(String),
    /// The volume being read is not one we understand.
    #[error("invalid volume: {0}")]
    Corrupt(String),
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The computed shape of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    total_sectors: u32,
    sectors_per_fat: u32,
    cluster_count: u32,
}

impl Geometry {
    fn new(total_sectors: u32) -> Result<Self, Error> {
        let sectors_per_fat = calc_sectors_per_fat(total_sectors);
        let overhead = RESERVED_SECTORS as u32 + NUM_FATS as u32 * sectors_per_fat;
        let cluster_count = total_sectors.saturating_sub(overhead);
        if cluster_count < MIN_CLUSTERS {
            return Err(Error::TooSmall(total_sectors));
        }
        Ok(Self {
            total_sectors,
            sectors_per_fat,
            cluster_count,
        })
    }

    fn reserved_bytes(&self) -> usize {
        RESERVED_SECTORS as usize * SECTOR_SIZE
    }

    fn fat_bytes(&self) -> usize {
        self.sectors_per_fat as usize * SECTOR_SIZE
    }

    fn boot_sector(&self, volume_id: u32) -> [u8; SECTOR_SIZE] {
        let mut bs = [0u8; SECTOR_SIZE];
        bs[0..3].copy_from_slice(&[0xeb, 0x58, 0x90]);
        bs[3..11].copy_from_slice(b"gokrazy ");
        bs[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
        bs[13] = (CLUSTER_SIZE / SECTOR_SIZE) as u8;
        bs[14..16].copy_from_slice(&RESERVED_SECTORS.to_le_bytes());
        bs[16] = NUM_FATS;
        // root entries, 16 bit total sectors: zero on FAT32
        bs[21] = 0xf8;
        // fixed disk geometry placeholders
        bs[24..26].copy_from_slice(&63u16.to_le_bytes());
        bs[26..28].copy_from_slice(&255u16.to_le_bytes());
        bs[32..36].copy_from_slice(&self.total_sectors.to_le_bytes());
        bs[36..40].copy_from_slice(&self.sectors_per_fat.to_le_bytes());
        bs[44..48].copy_from_slice(&ROOT_CLUSTER.to_le_bytes());
        bs[48..50].copy_from_slice(&FSINFO_SECTOR.to_le_bytes());
        bs[50..52].copy_from_slice(&BACKUP_BOOT_SECTOR.to_le_bytes());
        bs[64] = 0x80;
        bs[66] = 0x29;
        bs[67..71].copy_from_slice(&volume_id.to_le_bytes());
        bs[71..82].copy_from_slice(b"GOKRAZY    ");
        bs[82..90].copy_from_slice(b"FAT32   ");
        bs[510] = 0x55;
        bs[511] = 0xaa;
        bs
    }

    fn fsinfo(&self, free_clusters: u32, next_free: u32) -> [u8; SECTOR_SIZE] {
        let mut fsinfo = [0u8; SECTOR_SIZE];
        fsinfo[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
        fsinfo[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
        fsinfo[488..492].copy_from_slice(&free_clusters.to_le_bytes());
        fsinfo[492..496].copy_from_slice(&next_free.to_le_bytes());
        fsinfo[510] = 0x55;
        fsinfo[511] = 0xaa;
        fsinfo
    }
}

/// Find the FAT size at which the FAT can address every data cluster.
/// The iteration can oscillate between two values; the larger one is
/// always sufficient.
fn calc_sectors_per_fat(total_sectors: u32) -> u32 {
    let entries_per_sector = (SECTOR_SIZE / 4) as u32;
    let mut spf = 1u32;
    let mut prev = 0u32;
    for _ in 0..1024 {
        let overhead = RESERVED_SECTORS as u32 + NUM_FATS as u32 * spf;
        let clusters = total_sectors.saturating_sub(overhead);
        let next = (clusters + 2).div_ceil(entries_per_sector);
        if next == spf {
            return spf.max(1);
        }
        if next == prev {
            return spf.max(next).max(1);
        }
        prev = spf;
        spf = next.max(1);
    }
    spf.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        let g = Geometry::new(204800).unwrap();
        // Every data cluster plus the two reserved entries must be addressable
        assert!(g.sectors_per_fat * 128 >= g.cluster_count + 2);
        assert_eq!(
            g.cluster_count,
            204800 - RESERVED_SECTORS as u32 - 2 * g.sectors_per_fat
        );
        assert!(matches!(Geometry::new(60000), Err(Error::TooSmall(60000))));
    }

    #[test]
    fn test_boot_sector() {
        let g = Geometry::new(204800).unwrap();
        let bs = g.boot_sector(42);
        assert_eq!(&bs[82..90], b"FAT32   ");
        assert_eq!(u32::from_le_bytes(bs[32..36].try_into().unwrap()), 204800);
        assert_eq!(&bs[510..], &[0x55, 0xaa]);
    }
}
