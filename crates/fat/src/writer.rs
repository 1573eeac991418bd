use std::collections::HashSet;
use std::io::Write;

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::names::{self, ShortName, DIR_ENTRY_LEN};
use crate::{
    Error, Geometry, ATTR_ARCHIVE, ATTR_DIRECTORY, BACKUP_BOOT_SECTOR, CLUSTER_SIZE, END_OF_CHAIN,
    NUM_FATS, ROOT_CLUSTER,
};

type Entries = Vec<(String, Node)>;

#[derive(Debug)]
enum Node {
    Dir(Entries),
    File(Vec<u8>),
}

/// Collects files and directories in memory, then writes a complete
/// FAT32 volume in one sequential pass.
///
/// Directory entries keep insertion order. Every timestamp on the volume is
/// the one given to [`Writer::new`], so identical inputs produce identical
/// bytes.
#[derive(Debug)]
pub struct Writer {
    root: Entries,
    timestamp: DateTime<Utc>,
    geometry: Geometry,
}

fn split(path: &str) -> Result<Vec<&str>, Error> {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() || parts.iter().any(|p| *p == "." || *p == "..") {
        return Err(Error::InvalidPath(path.to_owned()));
    }
    Ok(parts)
}

fn find<'a>(entries: &'a mut Entries, name: &str) -> Option<&'a mut Node> {
    entries
        .iter_mut()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, node)| node)
}

/// Pick the short name of every entry of a directory, and whether it needs
/// long name entries. Names which are valid 8.3 already are reserved first
/// so that generated `~N` names never collide with them.
fn short_names(children: &Entries) -> Vec<(ShortName, bool)> {
    let exact: Vec<Option<ShortName>> = children
        .iter()
        .map(|(name, _)| names::exact_short_name(name))
        .collect();
    let mut used: HashSet<ShortName> = exact.iter().flatten().copied().collect();
    children
        .iter()
        .zip(exact)
        .map(|((name, _), exact)| match exact {
            Some(s) => (s, false),
            None => {
                let s = names::generated_short_name(name, &used);
                used.insert(s);
                (s, true)
            }
        })
        .collect()
}

fn dir_clusters(children: &Entries, is_root: bool) -> u32 {
    let mut n = if is_root { 0 } else { 2 };
    for ((name, _), (_, lfn)) in children.iter().zip(short_names(children)) {
        n += 1;
        if lfn {
            n += names::lfn_entries_needed(name);
        }
    }
    (n * DIR_ENTRY_LEN).div_ceil(CLUSTER_SIZE).max(1) as u32
}

/// A node with its clusters assigned.
#[derive(Debug)]
struct Placed<'a> {
    node: &'a Node,
    first: u32,
    clusters: u32,
    parent: u32,
    children_first: Vec<u32>,
}

/// Assign clusters depth-first, in the order the data region is written.
fn place<'a>(
    node: &'a Node,
    is_root: bool,
    parent: u32,
    next: &mut u32,
    out: &mut Vec<Placed<'a>>,
) -> u32 {
    let clusters = match node {
        Node::Dir(children) => dir_clusters(children, is_root),
        Node::File(d) => d.len().div_ceil(CLUSTER_SIZE) as u32,
    };
    let first = if clusters == 0 { 0 } else { *next };
    *next += clusters;
    let idx = out.len();
    out.push(Placed {
        node,
        first,
        clusters,
        parent,
        children_first: Vec::new(),
    });
    if let Node::Dir(children) = node {
        let firsts = children
            .iter()
            .map(|(_, child)| place(child, false, first, next, out))
            .collect();
        out[idx].children_first = firsts;
    }
    first
}

/// Counts what passes through.
struct Counter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Counter<W> {
    fn emit(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }
}

impl Writer {
    /// Create an empty volume spanning `total_sectors` sectors of 512 bytes.
    pub fn new(total_sectors: u32, timestamp: DateTime<Utc>) -> Result<Self, Error> {
        Ok(Self {
            root: Vec::new(),
            timestamp,
            geometry: Geometry::new(total_sectors)?,
        })
    }

    /// Walk to the directory holding the last component of `parts`,
    /// creating intermediate directories.
    fn parent_of(&mut self, path: &str, parts: &[&str]) -> Result<&mut Entries, Error> {
        let mut cur = &mut self.root;
        for part in &parts[..parts.len() - 1] {
            if find(cur, part).is_none() {
                cur.push((part.to_string(), Node::Dir(Vec::new())));
            }
            cur = match find(cur, part) {
                Some(Node::Dir(c)) => c,
                _ => return Err(Error::NotADirectory(path.to_owned())),
            };
        }
        Ok(cur)
    }

    /// Create a directory and its parents. Creating an existing directory
    /// is not an error.
    pub fn mkdir(&mut self, path: &str) -> Result<(), Error> {
        let parts = split(path)?;
        let name = parts[parts.len() - 1];
        let parent = self.parent_of(path, &parts)?;
        match find(parent, name) {
            Some(Node::Dir(_)) => Ok(()),
            Some(Node::File(_)) => Err(Error::Duplicate(path.to_owned())),
            None => {
                parent.push((name.to_owned(), Node::Dir(Vec::new())));
                Ok(())
            }
        }
    }

    /// Add a regular file, creating parent directories as needed.
    pub fn add_file(&mut self, path: &str, contents: Vec<u8>) -> Result<(), Error> {
        if u32::try_from(contents.len()).is_err() {
            return Err(Error::TooLarge(path.to_owned()));
        }
        let parts = split(path)?;
        let name = parts[parts.len() - 1];
        let parent = self.parent_of(path, &parts)?;
        if find(parent, name).is_some() {
            return Err(Error::Duplicate(path.to_owned()));
        }
        parent.push((name.to_owned(), Node::File(contents)));
        Ok(())
    }

    /// Write the volume, returning the number of bytes written. Nothing past
    /// the last allocated cluster is written.
    pub fn finish<W: Write>(self, w: W) -> Result<u64, Error> {
        let Writer {
            root,
            timestamp,
            geometry: g,
        } = self;
        let stamp = Stamp::new(&timestamp);
        let root = Node::Dir(root);
        let mut placed = Vec::new();
        let mut next = ROOT_CLUSTER;
        place(&root, true, 0, &mut next, &mut placed);

        let used = next - ROOT_CLUSTER;
        if used > g.cluster_count {
            return Err(Error::Full {
                needed: used,
                available: g.cluster_count,
            });
        }
        let mut out = Counter {
            inner: w,
            written: 0,
        };

        let boot = g.boot_sector(timestamp.timestamp() as u32);
        let fsinfo = g.fsinfo(g.cluster_count - used, next);
        let mut reserved = vec![0u8; g.reserved_bytes()];
        let backup = BACKUP_BOOT_SECTOR as usize * 512;
        reserved[..512].copy_from_slice(&boot);
        reserved[512..1024].copy_from_slice(&fsinfo);
        reserved[backup..backup + 512].copy_from_slice(&boot);
        reserved[backup + 512..backup + 1024].copy_from_slice(&fsinfo);
        out.emit(&reserved)?;

        let mut fat = vec![0u8; g.fat_bytes()];
        fat[0..4].copy_from_slice(&0x0fff_fff8u32.to_le_bytes());
        fat[4..8].copy_from_slice(&END_OF_CHAIN.to_le_bytes());
        for p in placed.iter().filter(|p| p.clusters > 0) {
            for i in 0..p.clusters {
                let c = p.first + i;
                let next = if i + 1 == p.clusters { END_OF_CHAIN } else { c + 1 };
                let off = c as usize * 4;
                fat[off..off + 4].copy_from_slice(&next.to_le_bytes());
            }
        }
        for _ in 0..NUM_FATS {
            out.emit(&fat)?;
        }

        for (i, p) in placed.iter().enumerate() {
            match p.node {
                Node::Dir(children) => out.emit(&render_dir(&stamp, children, p, i == 0))?,
                Node::File(data) => {
                    out.emit(data)?;
                    let tail = data.len() % CLUSTER_SIZE;
                    if tail != 0 {
                        out.emit(&vec![0u8; CLUSTER_SIZE - tail])?;
                    }
                }
            }
        }
        out.inner.flush()?;
        tracing::debug!("Wrote FAT volume: {used} clusters, {} bytes", out.written);
        Ok(out.written)
    }
}

/// A FAT date and time pair.
#[derive(Debug, Clone, Copy)]
struct Stamp {
    date: u16,
    time: u16,
}

impl Stamp {
    fn new(ts: &DateTime<Utc>) -> Self {
        if ts.year() < 1980 {
            // 1980-01-01 00:00:00
            return Self {
                date: (1 << 5) | 1,
                time: 0,
            };
        }
        let year = (ts.year() - 1980).min(127) as u16;
        Self {
            date: (year << 9) | ((ts.month() as u16) << 5) | ts.day() as u16,
            time: ((ts.hour() as u16) << 11)
                | ((ts.minute() as u16) << 5)
                | (ts.second() as u16 / 2),
        }
    }

    fn entry(&self, short: &ShortName, attr: u8, cluster: u32, size: u32) -> [u8; DIR_ENTRY_LEN] {
        let mut e = [0u8; DIR_ENTRY_LEN];
        e[0..11].copy_from_slice(short);
        e[11] = attr;
        e[14..16].copy_from_slice(&self.time.to_le_bytes());
        e[16..18].copy_from_slice(&self.date.to_le_bytes());
        e[18..20].copy_from_slice(&self.date.to_le_bytes());
        e[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        e[22..24].copy_from_slice(&self.time.to_le_bytes());
        e[24..26].copy_from_slice(&self.date.to_le_bytes());
        e[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
        e[28..32].copy_from_slice(&size.to_le_bytes());
        e
    }
}

fn render_dir(stamp: &Stamp, children: &Entries, placed: &Placed<'_>, is_root: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(placed.clusters as usize * CLUSTER_SIZE);
    if !is_root {
        let parent = if placed.parent == ROOT_CLUSTER {
            0
        } else {
            placed.parent
        };
        buf.extend_from_slice(&stamp.entry(b".          ", ATTR_DIRECTORY, placed.first, 0));
        buf.extend_from_slice(&stamp.entry(b"..         ", ATTR_DIRECTORY, parent, 0));
    }
    let shorts = short_names(children);
    for (((name, child), (short, lfn)), first) in
        children.iter().zip(shorts).zip(&placed.children_first)
    {
        if lfn {
            for e in names::lfn_entries(name, &short) {
                buf.extend_from_slice(&e);
            }
        }
        let (attr, size) = match child {
            Node::Dir(_) => (ATTR_DIRECTORY, 0),
            Node::File(d) => (ATTR_ARCHIVE, d.len() as u32),
        };
        buf.extend_from_slice(&stamp.entry(&short, attr, *first, size));
    }
    buf.resize(placed.clusters as usize * CLUSTER_SIZE, 0);
    buf
}
