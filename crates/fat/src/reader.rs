use std::io::{Read, Seek, SeekFrom};

use crate::names::{self, ATTR_LFN, DIR_ENTRY_LEN};
use crate::{Error, ATTR_DIRECTORY, ATTR_VOLUME_ID, SECTOR_SIZE};

/// One entry of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// The long name if present, the short name otherwise
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
    /// First data cluster, zero for empty files
    pub first_cluster: u32,
    /// File size in bytes
    pub size: u32,
}

/// Reads back a FAT32 volume.
#[derive(Debug)]
pub struct Reader<R> {
    inner: R,
    cluster_bytes: u64,
    fat_offset: u64,
    data_offset: u64,
    root_cluster: u32,
    max_clusters: usize,
}

fn le16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

impl<R: Read + Seek> Reader<R> {
    /// Parse the boot sector of the volume starting at the current
    /// beginning of `inner`.
    pub fn new(mut inner: R) -> Result<Self, Error> {
        let mut bs = [0u8; SECTOR_SIZE];
        inner.seek(SeekFrom::Start(0))?;
        inner.read_exact(&mut bs)?;
        if bs[510..] != [0x55, 0xaa] {
            return Err(Error::Corrupt("missing boot sector signature".into()));
        }
        let bytes_per_sector = le16(&bs, 11) as u64;
        let sectors_per_cluster = bs[13] as u64;
        let reserved = le16(&bs, 14) as u64;
        let num_fats = bs[16] as u64;
        let sectors_per_fat = le32(&bs, 36) as u64;
        if bytes_per_sector == 0 || sectors_per_cluster == 0 || sectors_per_fat == 0 {
            return Err(Error::Corrupt("not a FAT32 boot sector".into()));
        }
        Ok(Self {
            inner,
            cluster_bytes: bytes_per_sector * sectors_per_cluster,
            fat_offset: reserved * bytes_per_sector,
            data_offset: (reserved + num_fats * sectors_per_fat) * bytes_per_sector,
            root_cluster: le32(&bs, 44),
            max_clusters: le32(&bs, 32) as usize / sectors_per_cluster as usize,
        })
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_offset + u64::from(cluster.saturating_sub(2)) * self.cluster_bytes
    }

    fn next_cluster(&mut self, cluster: u32) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.inner
            .seek(SeekFrom::Start(self.fat_offset + u64::from(cluster) * 4))?;
        self.inner.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf) & 0x0fff_ffff)
    }

    fn chain(&mut self, first: u32) -> Result<Vec<u32>, Error> {
        let mut out = Vec::new();
        let mut c = first;
        while (2..0x0fff_fff8).contains(&c) {
            if out.len() >= self.max_clusters {
                return Err(Error::Corrupt(format!("cluster loop at {c}")));
            }
            out.push(c);
            c = self.next_cluster(c)?;
        }
        Ok(out)
    }

    fn read_chain(&mut self, first: u32) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        for c in self.chain(first)? {
            let mut buf = vec![0u8; self.cluster_bytes as usize];
            self.inner.seek(SeekFrom::Start(self.cluster_offset(c)))?;
            self.inner.read_exact(&mut buf)?;
            out.extend_from_slice(&buf);
        }
        Ok(out)
    }

    fn read_dir_cluster(&mut self, cluster: u32) -> Result<Vec<DirEntry>, Error> {
        let raw = self.read_chain(cluster)?;
        let mut entries = Vec::new();
        let mut lfn: Vec<Vec<u16>> = Vec::new();
        for e in raw.chunks_exact(DIR_ENTRY_LEN) {
            match e[0] {
                0x00 => break,
                0xe5 => {
                    lfn.clear();
                    continue;
                }
                _ => {}
            }
            let attr = e[11];
            if attr == ATTR_LFN {
                lfn.push(names::lfn_units(e).collect());
                continue;
            }
            if attr & ATTR_VOLUME_ID != 0 || e[0] == b'.' {
                lfn.clear();
                continue;
            }
            let name = if lfn.is_empty() {
                names::short_name_display(&e[0..11])
            } else {
                let units: Vec<u16> = lfn.drain(..).rev().flatten().collect();
                String::from_utf16_lossy(&units)
            };
            let first_cluster = (u32::from(le16(e, 20)) << 16) | u32::from(le16(e, 26));
            entries.push(DirEntry {
                name,
                is_dir: attr & ATTR_DIRECTORY != 0,
                first_cluster,
                size: le32(e, 28),
            });
        }
        Ok(entries)
    }

    /// List the directory at `path` (`/` is the root).
    pub fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntry>, Error> {
        let cluster = if path.trim_matches('/').is_empty() {
            self.root_cluster
        } else {
            let e = self.lookup(path)?;
            if !e.is_dir {
                return Err(Error::NotADirectory(path.to_owned()));
            }
            e.first_cluster
        };
        self.read_dir_cluster(cluster)
    }

    /// Find the entry for `path`. Names compare case-insensitively.
    pub fn lookup(&mut self, path: &str) -> Result<DirEntry, Error> {
        let mut cluster = self.root_cluster;
        let mut found = None;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if let Some(DirEntry { is_dir: false, .. }) = found {
                return Err(Error::NotADirectory(path.to_owned()));
            }
            let entry = self
                .read_dir_cluster(cluster)?
                .into_iter()
                .find(|e| e.name.eq_ignore_ascii_case(part))
                .ok_or_else(|| Error::NotFound(path.to_owned()))?;
            cluster = entry.first_cluster;
            found = Some(entry);
        }
        found.ok_or_else(|| Error::InvalidPath(path.to_owned()))
    }

    /// The byte offset, relative to the start of the volume, at which the
    /// data of `path` begins.
    pub fn extents(&mut self, path: &str) -> Result<u64, Error> {
        let e = self.lookup(path)?;
        if e.first_cluster == 0 {
            return Err(Error::NotFound(format!("{path}: no data clusters")));
        }
        Ok(self.cluster_offset(e.first_cluster))
    }

    /// Read the contents of a file.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, Error> {
        let e = self.lookup(path)?;
        if e.is_dir {
            return Err(Error::IsADirectory(path.to_owned()));
        }
        if e.first_cluster == 0 {
            return Ok(Vec::new());
        }
        let mut data = self.read_chain(e.first_cluster)?;
        data.truncate(e.size as usize);
        Ok(data)
    }
}
