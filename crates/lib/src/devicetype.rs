//! Per-board properties which influence the disk layout.

use anyhow::Result;
use gokr_blockdev::{MbrMode, DEFAULT_FIRST_PARTITION_OFFSET};

/// A file from the kernel package written to a fixed device offset,
/// outside of any partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootDeviceFile {
    /// File name within the kernel package
    pub name: &'static str,
    /// Offset from the start of the device
    pub offset_bytes: u64,
    /// The file must not be larger than this
    pub max_length: u64,
}

/// A supported board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceType {
    /// The `DeviceType` value selecting this entry
    pub slug: &'static str,
    /// LBA of the boot partition
    pub first_partition_offset_sectors: u64,
    /// The bootloader lives where the GPT would be
    pub mbr_only_without_gpt: bool,
    /// Bootloader blobs
    pub root_device_files: &'static [RootDeviceFile],
}

impl DeviceType {
    /// The partition table flavor for this board.
    pub fn mbr_mode(&self) -> MbrMode {
        if self.mbr_only_without_gpt {
            MbrMode::MbrOnly
        } else {
            MbrMode::Hybrid
        }
    }
}

const RPI: DeviceType = DeviceType {
    slug: "rpi",
    first_partition_offset_sectors: DEFAULT_FIRST_PARTITION_OFFSET,
    mbr_only_without_gpt: false,
    root_device_files: &[],
};

const SECTOR: u64 = 512;

static DEVICE_TYPES: &[DeviceType] = &[
    RPI,
    DeviceType {
        slug: "odroidhc1",
        first_partition_offset_sectors: DEFAULT_FIRST_PARTITION_OFFSET,
        mbr_only_without_gpt: true,
        root_device_files: &[
            RootDeviceFile {
                name: "bl1.bin",
                offset_bytes: SECTOR,
                max_length: 30 * SECTOR,
            },
            RootDeviceFile {
                name: "bl2.bin",
                offset_bytes: 31 * SECTOR,
                max_length: 32 * SECTOR,
            },
            RootDeviceFile {
                name: "u-boot.bin",
                offset_bytes: 63 * SECTOR,
                max_length: 1440 * SECTOR,
            },
            RootDeviceFile {
                name: "tzsw.bin",
                offset_bytes: 1503 * SECTOR,
                max_length: 512 * SECTOR,
            },
        ],
    },
];

/// Find the entry for `slug`; the empty slug means Raspberry Pi.
pub fn lookup(slug: &str) -> Result<&'static DeviceType> {
    if slug.is_empty() {
        return Ok(&DEVICE_TYPES[0]);
    }
    DEVICE_TYPES.iter().find(|d| d.slug == slug).ok_or_else(|| {
        let known: Vec<_> = DEVICE_TYPES.iter().map(|d| d.slug).collect();
        anyhow::anyhow!(
            "Unknown DeviceType {slug:?}; known device types: {}",
            known.join(", ")
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() -> Result<()> {
        assert_eq!(lookup("")?.slug, "rpi");
        assert_eq!(lookup("rpi")?.mbr_mode(), MbrMode::Hybrid);
        let hc1 = lookup("odroidhc1")?;
        assert_eq!(hc1.mbr_mode(), MbrMode::MbrOnly);
        // Blobs must not overlap each other or the boot partition
        let mut end = SECTOR;
        for f in hc1.root_device_files {
            assert!(f.offset_bytes >= end, "{}", f.name);
            end = f.offset_bytes + f.max_length;
        }
        assert!(end <= hc1.first_partition_offset_sectors * SECTOR);
        let e = lookup("pc").unwrap_err().to_string();
        assert!(e.contains("odroidhc1"), "{e}");
        Ok(())
    }
}
