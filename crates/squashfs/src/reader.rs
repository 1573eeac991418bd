use std::io::{Read, Seek, SeekFrom};

use crate::metadata::MetadataTable;
use crate::{inode_type, Error, BLOCK_SIZE, DATA_UNCOMPRESSED, MAGIC, SUPERBLOCK_LEN};

/// An inode as seen by the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// A directory
    Dir {
        /// Inode number
        number: u32,
        /// Permission bits
        mode: u16,
        /// Link count (two plus the number of subdirectories)
        links: u32,
        /// Inode number of the parent directory
        parent: u32,
        /// Resolved listing position
        listing: (usize, usize),
    },
    /// A regular file
    File {
        /// Inode number
        number: u32,
        /// Permission bits
        mode: u16,
        /// Offset of the first data block
        start: u64,
        /// Size in bytes
        size: u64,
        /// On-disk size of each block
        blocks: Vec<u32>,
    },
    /// A symbolic link
    Symlink {
        /// Inode number
        number: u32,
        /// Permission bits
        mode: u16,
        /// Link target
        target: String,
    },
}

impl Entry {
    /// The inode number.
    pub fn number(&self) -> u32 {
        match self {
            Entry::Dir { number, .. } | Entry::File { number, .. } | Entry::Symlink { number, .. } => *number,
        }
    }

    /// The permission bits.
    pub fn mode(&self) -> u16 {
        match self {
            Entry::Dir { mode, .. } | Entry::File { mode, .. } | Entry::Symlink { mode, .. } => *mode,
        }
    }
}

/// Parsed superblock fields.
#[derive(Debug, Clone)]
struct Superblock {
    inode_count: u32,
    mtime: u32,
    root: u64,
    bytes_used: u64,
    id_table_start: u64,
    inode_table_start: u64,
    directory_table_start: u64,
}

/// Reads an uncompressed SquashFS image.
#[derive(Debug)]
pub struct Reader<R> {
    r: R,
    sb: Superblock,
    inodes: MetadataTable,
    dirs: MetadataTable,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], Error> {
        let s = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| Error::Corrupt("truncated table".into()))?;
        self.pos += n;
        Ok(s)
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

fn le64(b: &[u8], off: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(a)
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

impl<R: Read + Seek> Reader<R> {
    fn read_at(r: &mut R, off: u64, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len];
        r.seek(SeekFrom::Start(off))?;
        r.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Parse the superblock and load the metadata tables.
    pub fn new(mut r: R) -> Result<Self, Error> {
        let b = Self::read_at(&mut r, 0, SUPERBLOCK_LEN as usize)?;
        if le32(&b, 0) != MAGIC {
            return Err(Error::Corrupt("bad magic".into()));
        }
        let sb = Superblock {
            inode_count: le32(&b, 4),
            mtime: le32(&b, 8),
            root: le64(&b, 32),
            bytes_used: le64(&b, 40),
            id_table_start: le64(&b, 48),
            inode_table_start: le64(&b, 64),
            directory_table_start: le64(&b, 72),
        };
        let id_block = le64(&Self::read_at(&mut r, sb.id_table_start, 8)?, 0);
        let inode_len = sb.directory_table_start - sb.inode_table_start;
        let dir_len = id_block - sb.directory_table_start;
        let inodes = MetadataTable::parse(&Self::read_at(&mut r, sb.inode_table_start, inode_len as usize)?)?;
        let dirs = MetadataTable::parse(&Self::read_at(&mut r, sb.directory_table_start, dir_len as usize)?)?;
        Ok(Self { r, sb, inodes, dirs })
    }

    /// Number of inodes in the image.
    pub fn inode_count(&self) -> u32 {
        self.sb.inode_count
    }

    /// Modification time of the image.
    pub fn mtime(&self) -> u32 {
        self.sb.mtime
    }

    /// Bytes used by the image, excluding padding.
    pub fn bytes_used(&self) -> u64 {
        self.sb.bytes_used
    }

    fn inode(&self, reference: u64) -> Result<Entry, Error> {
        let pos = self
            .inodes
            .resolve((reference >> 16) as u32, (reference & 0xffff) as u16)?;
        let mut c = Cursor {
            data: &self.inodes.data,
            pos,
        };
        let kind = c.u16()?;
        let mode = c.u16()?;
        let _uid = c.u16()?;
        let _gid = c.u16()?;
        let _mtime = c.u32()?;
        let number = c.u32()?;
        match kind {
            inode_type::DIR => {
                let block = c.u32()?;
                let links = c.u32()?;
                let size = c.u16()? as usize;
                let offset = c.u16()?;
                let parent = c.u32()?;
                let start = self.dirs.resolve(block, offset)?;
                Ok(Entry::Dir {
                    number,
                    mode,
                    links,
                    parent,
                    listing: (start, size.saturating_sub(3)),
                })
            }
            inode_type::EXT_DIR => {
                let links = c.u32()?;
                let size = c.u32()? as usize;
                let block = c.u32()?;
                let parent = c.u32()?;
                let _index_count = c.u16()?;
                let offset = c.u16()?;
                let start = self.dirs.resolve(block, offset)?;
                Ok(Entry::Dir {
                    number,
                    mode,
                    links,
                    parent,
                    listing: (start, size.saturating_sub(3)),
                })
            }
            inode_type::FILE => {
                let start = u64::from(c.u32()?);
                let _fragment = c.u32()?;
                let _offset = c.u32()?;
                let size = u64::from(c.u32()?);
                let count = size.div_ceil(BLOCK_SIZE as u64) as usize;
                let blocks = (0..count).map(|_| c.u32()).collect::<Result<_, _>>()?;
                Ok(Entry::File {
                    number,
                    mode,
                    start,
                    size,
                    blocks,
                })
            }
            inode_type::SYMLINK => {
                let _links = c.u32()?;
                let len = c.u32()? as usize;
                let target = String::from_utf8_lossy(c.take(len)?).into_owned();
                Ok(Entry::Symlink {
                    number,
                    mode,
                    target,
                })
            }
            o => Err(Error::Corrupt(format!("unsupported inode type {o}"))),
        }
    }

    /// The root directory.
    pub fn root(&self) -> Result<Entry, Error> {
        self.inode(self.sb.root)
    }

    /// List a directory, in on-disk order.
    pub fn list(&self, dir: &Entry) -> Result<Vec<(String, Entry)>, Error> {
        let Entry::Dir {
            listing: (start, len),
            ..
        } = dir
        else {
            return Err(Error::Corrupt("not a directory".into()));
        };
        let mut c = Cursor {
            data: &self.dirs.data,
            pos: *start,
        };
        let end = start + len;
        let mut out = Vec::new();
        while c.pos < end {
            let count = c.u32()? + 1;
            let block = c.u32()?;
            let base = c.u32()?;
            for _ in 0..count {
                let offset = c.u16()?;
                let delta = c.u16()? as i16;
                let _kind = c.u16()?;
                let name_len = c.u16()? as usize + 1;
                let name = String::from_utf8_lossy(c.take(name_len)?).into_owned();
                let entry = self.inode((u64::from(block) << 16) | u64::from(offset))?;
                if i64::from(entry.number()) != i64::from(base) + i64::from(delta) {
                    return Err(Error::Corrupt(format!("inode number mismatch for {name}")));
                }
                out.push((name, entry));
            }
        }
        Ok(out)
    }

    /// Resolve an absolute path, without following symlinks.
    pub fn lookup(&self, path: &str) -> Result<Entry, Error> {
        let mut cur = self.root()?;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            cur = self
                .list(&cur)?
                .into_iter()
                .find(|(n, _)| n == part)
                .map(|(_, e)| e)
                .ok_or_else(|| Error::NotFound(path.to_owned()))?;
        }
        Ok(cur)
    }

    /// Read the contents of a regular file.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, Error> {
        let Entry::File {
            start, size, blocks, ..
        } = self.lookup(path)?
        else {
            return Err(Error::NotFound(format!("{path}: not a regular file")));
        };
        let mut out = Vec::with_capacity(size as usize);
        let mut off = start;
        for b in blocks {
            if b & DATA_UNCOMPRESSED == 0 {
                return Err(Error::Corrupt("compressed data block".into()));
            }
            let len = (b & !DATA_UNCOMPRESSED) as usize;
            out.extend(Self::read_at(&mut self.r, off, len)?);
            off += len as u64;
        }
        if out.len() as u64 != size {
            return Err(Error::Corrupt(format!("{path}: size mismatch")));
        }
        Ok(out)
    }
}
