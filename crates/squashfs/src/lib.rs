//! # Writing SquashFS images
//!
//! A writer for SquashFS 4.0 images with every block stored uncompressed,
//! and a reader sufficient to inspect what it produced.
//!
//! The writer is driven bottom-up: file contents are streamed to the
//! output as they are added, and each directory is added once all of its
//! children exist. This numbers inodes in post-order, with the root last.

mod metadata;
mod reader;
mod writer;

pub use reader::{Entry, Reader};
pub use writer::{Inode, Writer};

const MAGIC: u32 = 0x7371_7368;
const SUPERBLOCK_LEN: u64 = 96;
/// Size of a data block.
pub const BLOCK_SIZE: usize = 128 * 1024;
const BLOCK_LOG: u16 = 17;
const COMPRESSION_GZIP: u16 = 1;
const METADATA_BLOCK: usize = 8192;
const METADATA_UNCOMPRESSED: u16 = 0x8000;
const DATA_UNCOMPRESSED: u32 = 1 << 24;
const INVALID_TABLE: u64 = u64::MAX;
const NO_FRAGMENT: u32 = u32::MAX;
/// The image is padded to a multiple of this.
const PAD_TO: u64 = 4096;
/// At most this many entries share one directory header.
const DIR_HEADER_MAX: usize = 256;

/// Superblock flags.
mod flags {
    pub(crate) const UNCOMPRESSED_INODES: u16 = 0x0001;
    pub(crate) const UNCOMPRESSED_DATA: u16 = 0x0002;
    pub(crate) const UNCOMPRESSED_FRAGMENTS: u16 = 0x0008;
    pub(crate) const NO_FRAGMENTS: u16 = 0x0010;
    pub(crate) const NO_XATTRS: u16 = 0x0200;
    pub(crate) const UNCOMPRESSED_IDS: u16 = 0x0800;

    pub(crate) const ALL: u16 = UNCOMPRESSED_INODES
        | UNCOMPRESSED_DATA
        | UNCOMPRESSED_FRAGMENTS
        | NO_FRAGMENTS
        | NO_XATTRS
        | UNCOMPRESSED_IDS;
}

/// Inode types.
mod inode_type {
    pub(crate) const DIR: u16 = 1;
    pub(crate) const FILE: u16 = 2;
    pub(crate) const SYMLINK: u16 = 3;
    pub(crate) const EXT_DIR: u16 = 8;
}

/// Errors from writing or reading an image.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two entries of one directory share a name.
    #[error("duplicate directory entry: {0}")]
    Duplicate(String),
    /// Empty names, names containing `/`, or longer than 256 bytes.
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    /// Offsets beyond what basic inodes can describe.
    #[error("image too large")]
    TooLarge,
    /// The image being read is not one we understand.
    #[error("invalid image: {0}")]
    Corrupt(String),
    /// Lookup of a missing path.
    #[error("not found: {0}")]
    NotFound(String),
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
