use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::metadata::MetadataWriter;
use crate::{
    flags, inode_type, Error, BLOCK_LOG, BLOCK_SIZE, COMPRESSION_GZIP, DATA_UNCOMPRESSED,
    DIR_HEADER_MAX, INVALID_TABLE, MAGIC, NO_FRAGMENT, PAD_TO, SUPERBLOCK_LEN,
};

/// A written inode, to be referenced from a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    number: u32,
    /// `(block << 16) | offset` within the inode table
    reference: u64,
    kind: u16,
    /// Position of the parent inode number field, for directories
    parent_field: Option<usize>,
}

impl Inode {
    /// The inode number.
    pub fn number(&self) -> u32 {
        self.number
    }

    fn is_dir(&self) -> bool {
        self.kind == inode_type::DIR
    }
}

/// Streams a SquashFS image into `W`.
///
/// Offsets in the image are relative to the position of `W` when the
/// writer was created, so the image may be written straight into a
/// partition of a larger file.
#[derive(Debug)]
pub struct Writer<W> {
    w: W,
    base: u64,
    /// Bytes written after the superblock, relative to `base`
    pos: u64,
    mtime: u32,
    next_inode: u32,
    inodes: MetadataWriter,
    dirs: MetadataWriter,
}

fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > 256 || name.contains('/') || name == "." || name == ".." {
        return Err(Error::InvalidName(name.to_owned()));
    }
    Ok(())
}

/// Fill `buf` from `r`, returning how many bytes were read; fewer than
/// `buf.len()` only at end of input.
fn read_full(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

impl<W: Write + Seek> Writer<W> {
    /// Start an image at the current position of `w`. All inodes carry
    /// `mtime` (seconds since the epoch).
    pub fn new(mut w: W, mtime: u32) -> Result<Self, Error> {
        let base = w.stream_position()?;
        w.write_all(&[0u8; SUPERBLOCK_LEN as usize])?;
        Ok(Self {
            w,
            base,
            pos: SUPERBLOCK_LEN,
            mtime,
            next_inode: 1,
            inodes: MetadataWriter::default(),
            dirs: MetadataWriter::default(),
        })
    }

    /// Append the common inode header, returning the new inode's number
    /// and reference.
    fn inode_header(&mut self, kind: u16, mode: u16) -> (u32, u64) {
        let number = self.next_inode;
        self.next_inode += 1;
        let (block, offset) = MetadataWriter::locate(self.inodes.pos());
        let reference = (u64::from(block) << 16) | u64::from(offset);
        self.inodes.put_u16(kind);
        self.inodes.put_u16(mode & 0o7777);
        // uid and gid index into the id table, which holds only 0
        self.inodes.put_u16(0);
        self.inodes.put_u16(0);
        self.inodes.put_u32(self.mtime);
        self.inodes.put_u32(number);
        (number, reference)
    }

    /// Stream a regular file's contents into the image.
    pub fn add_file(&mut self, mut contents: impl Read, mode: u16) -> Result<Inode, Error> {
        let start = self.pos;
        let mut sizes = Vec::new();
        let mut file_size = 0u64;
        let mut buf = vec![0u8; BLOCK_SIZE];
        loop {
            let n = read_full(&mut contents, &mut buf)?;
            if n == 0 {
                break;
            }
            self.w.write_all(&buf[..n])?;
            self.pos += n as u64;
            file_size += n as u64;
            sizes.push(n as u32 | DATA_UNCOMPRESSED);
            if n < BLOCK_SIZE {
                break;
            }
        }
        let start = u32::try_from(start).map_err(|_| Error::TooLarge)?;
        let file_size = u32::try_from(file_size).map_err(|_| Error::TooLarge)?;

        let (number, reference) = self.inode_header(inode_type::FILE, mode);
        self.inodes.put_u32(start);
        self.inodes.put_u32(NO_FRAGMENT);
        self.inodes.put_u32(0);
        self.inodes.put_u32(file_size);
        for s in sizes {
            self.inodes.put_u32(s);
        }
        Ok(Inode {
            number,
            reference,
            kind: inode_type::FILE,
            parent_field: None,
        })
    }

    /// Add a symbolic link.
    pub fn add_symlink(&mut self, target: &str, mode: u16) -> Result<Inode, Error> {
        let (number, reference) = self.inode_header(inode_type::SYMLINK, mode);
        self.inodes.put_u32(1);
        self.inodes.put_u32(target.len() as u32);
        self.inodes.put(target.as_bytes());
        Ok(Inode {
            number,
            reference,
            kind: inode_type::SYMLINK,
            parent_field: None,
        })
    }

    /// Add a directory whose children have all been added already.
    /// Entries are stored sorted by name regardless of the input order.
    pub fn add_dir(&mut self, entries: Vec<(String, Inode)>, mode: u16) -> Result<Inode, Error> {
        let mut sorted = BTreeMap::new();
        for (name, inode) in entries {
            validate_name(&name)?;
            if sorted.insert(name.clone(), inode).is_some() {
                return Err(Error::Duplicate(name));
            }
        }
        let subdirs = sorted.values().filter(|i| i.is_dir()).count() as u32;

        let listing_start = self.dirs.pos();
        let entries: Vec<(&String, &Inode)> = sorted.iter().collect();
        let mut i = 0;
        while i < entries.len() {
            let block = entries[i].1.reference >> 16;
            let base = entries[i].1.number;
            let run_len = entries[i..]
                .iter()
                .take(DIR_HEADER_MAX)
                .take_while(|(_, e)| {
                    let delta = i64::from(e.number) - i64::from(base);
                    e.reference >> 16 == block && i16::try_from(delta).is_ok()
                })
                .count();
            self.dirs.put_u32(run_len as u32 - 1);
            self.dirs.put_u32(block as u32);
            self.dirs.put_u32(base);
            for (name, e) in &entries[i..i + run_len] {
                self.dirs.put_u16((e.reference & 0xffff) as u16);
                self.dirs.put(&((i64::from(e.number) - i64::from(base)) as i16).to_le_bytes());
                self.dirs.put_u16(e.kind);
                self.dirs.put_u16(name.len() as u16 - 1);
                self.dirs.put(name.as_bytes());
            }
            i += run_len;
        }
        let file_size = (self.dirs.pos() - listing_start + 3) as u32;
        let (dir_block, dir_offset) = MetadataWriter::locate(listing_start);

        let (number, reference) = if let Ok(file_size) = u16::try_from(file_size) {
            let (number, reference) = self.inode_header(inode_type::DIR, mode);
            self.inodes.put_u32(dir_block);
            self.inodes.put_u32(2 + subdirs);
            self.inodes.put_u16(file_size);
            self.inodes.put_u16(dir_offset);
            (number, reference)
        } else {
            let (number, reference) = self.inode_header(inode_type::EXT_DIR, mode);
            self.inodes.put_u32(2 + subdirs);
            self.inodes.put_u32(file_size);
            self.inodes.put_u32(dir_block);
            (number, reference)
        };
        // Children learn their parent's number now that it exists
        let parent_field = self.inodes.pos();
        self.inodes.put_u32(0);
        for child in sorted.values() {
            if let Some(field) = child.parent_field {
                self.inodes.patch_u32(field, number);
            }
        }
        if u16::try_from(file_size).is_err() {
            // index count, block offset, xattr index
            self.inodes.put_u16(0);
            self.inodes.put_u16(dir_offset);
            self.inodes.put_u32(u32::MAX);
        }
        Ok(Inode {
            number,
            reference,
            kind: inode_type::DIR,
            parent_field: Some(parent_field),
        })
    }

    /// Write the tables and superblock with `root` as the root directory,
    /// returning the number of bytes the image occupies including padding.
    pub fn finish(mut self, root: Inode) -> Result<u64, Error> {
        if !root.is_dir() {
            return Err(Error::Corrupt("root must be a directory".into()));
        }
        let inode_count = self.next_inode - 1;
        if let Some(field) = root.parent_field {
            self.inodes.patch_u32(field, inode_count + 1);
        }

        let inode_table_start = self.pos;
        let inodes = self.inodes.to_blocks();
        self.w.write_all(&inodes)?;
        self.pos += inodes.len() as u64;

        let directory_table_start = self.pos;
        let dirs = self.dirs.to_blocks();
        self.w.write_all(&dirs)?;
        self.pos += dirs.len() as u64;

        // The id table: one metadata block holding uid/gid 0, then the
        // array of metadata block positions.
        let id_block = self.pos;
        let mut ids = MetadataWriter::default();
        ids.put_u32(0);
        let ids = ids.to_blocks();
        self.w.write_all(&ids)?;
        self.pos += ids.len() as u64;
        let id_table_start = self.pos;
        self.w.write_all(&id_block.to_le_bytes())?;
        self.pos += 8;

        let bytes_used = self.pos;
        let padded = bytes_used.div_ceil(PAD_TO) * PAD_TO;
        self.w.write_all(&vec![0u8; (padded - bytes_used) as usize])?;

        let mut sb = Vec::with_capacity(SUPERBLOCK_LEN as usize);
        sb.extend_from_slice(&MAGIC.to_le_bytes());
        sb.extend_from_slice(&inode_count.to_le_bytes());
        sb.extend_from_slice(&self.mtime.to_le_bytes());
        sb.extend_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
        sb.extend_from_slice(&0u32.to_le_bytes()); // fragment entries
        sb.extend_from_slice(&COMPRESSION_GZIP.to_le_bytes());
        sb.extend_from_slice(&BLOCK_LOG.to_le_bytes());
        sb.extend_from_slice(&flags::ALL.to_le_bytes());
        sb.extend_from_slice(&1u16.to_le_bytes()); // id count
        sb.extend_from_slice(&4u16.to_le_bytes());
        sb.extend_from_slice(&0u16.to_le_bytes());
        sb.extend_from_slice(&root.reference.to_le_bytes());
        sb.extend_from_slice(&bytes_used.to_le_bytes());
        sb.extend_from_slice(&id_table_start.to_le_bytes());
        sb.extend_from_slice(&INVALID_TABLE.to_le_bytes()); // xattr ids
        sb.extend_from_slice(&inode_table_start.to_le_bytes());
        sb.extend_from_slice(&directory_table_start.to_le_bytes());
        sb.extend_from_slice(&INVALID_TABLE.to_le_bytes()); // fragments
        sb.extend_from_slice(&INVALID_TABLE.to_le_bytes()); // export
        debug_assert_eq!(sb.len() as u64, SUPERBLOCK_LEN);

        self.w.seek(SeekFrom::Start(self.base))?;
        self.w.write_all(&sb)?;
        self.w.seek(SeekFrom::Start(self.base + padded))?;
        self.w.flush()?;
        tracing::debug!("Wrote SquashFS image: {inode_count} inodes, {padded} bytes");
        Ok(padded)
    }
}
