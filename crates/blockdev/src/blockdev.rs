//! Partition layout and raw block device handling for gokrazy disks.
//!
//! The disk always carries four partitions: a FAT32 boot partition, two
//! SquashFS root partitions used in A/B fashion, and a writable perm
//! partition spanning the rest of the disk.

mod device;
pub mod gpt;
mod layout;
pub mod mbr;
mod mount;

pub use device::{
    open_device, reread_partitions, serve_device_fd, SudoPolicy, FD_ENV, HELPER_ARGS,
};
pub use gpt::{write_partition_table, Arch};
pub use layout::{
    fnv1a_32, parse_size_bytes, Extent, Layout, LayoutError, PartUuid, RootSpec,
    BOOT_PARTITION_BYTES, DEFAULT_FIRST_PARTITION_OFFSET, GPT_BACKUP_SECTORS,
    MINIMUM_STORAGE_BYTES, ROOT_PARTITION_BYTES, SECTOR_SIZE,
};
pub use mbr::{write_mbr_bootcode, MbrMode, BOOTCODE_LEN};
pub use mount::{ensure_not_mounted, mounted_partitions};
