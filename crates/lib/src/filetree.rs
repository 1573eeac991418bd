//! # The root filesystem tree
//!
//! The root filesystem is assembled in memory from several sources (built
//! binaries, generated `/etc` files, per-package extra files) before it is
//! serialized once. Each directory keeps its children in insertion order;
//! serialization sorts them.

use camino::Utf8PathBuf;

/// What an entry of the tree holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// A directory with its children in insertion order
    Dir(Vec<FileInfo>),
    /// A regular file read from the host at serialization time
    HostFile(Utf8PathBuf),
    /// A regular file with literal contents
    Bytes(Vec<u8>),
    /// A symbolic link to the given target
    Symlink(String),
}

/// One entry of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Name within the parent directory
    pub name: String,
    /// Permission bits
    pub mode: u16,
    #[allow(missing_docs)]
    pub content: Content,
}

/// Errors constructing the tree.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TreeError {
    /// A path was inserted twice.
    #[error("duplicate file: {0}")]
    Duplicate(String),
    /// A path traverses a non-directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),
    /// Empty names, `.` or `..`.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    /// Merging two trees found files present in both.
    #[error("duplicate files: {}", .0.join(", "))]
    DuplicateFiles(Vec<String>),
}

fn components(path: &str) -> Result<Vec<&str>, TreeError> {
    let parts: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if parts.iter().any(|c| *c == "." || *c == "..") {
        return Err(TreeError::InvalidPath(path.to_owned()));
    }
    Ok(parts)
}

impl FileInfo {
    /// An empty root directory.
    pub fn root() -> Self {
        Self::dir("")
    }

    /// An empty directory with mode 0755.
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: 0o755,
            content: Content::Dir(Vec::new()),
        }
    }

    /// A read-only file with literal contents.
    pub fn bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            mode: 0o444,
            content: Content::Bytes(data.into()),
        }
    }

    /// A file copied from the host.
    pub fn host(name: impl Into<String>, path: impl Into<Utf8PathBuf>, mode: u16) -> Self {
        Self {
            name: name.into(),
            mode,
            content: Content::HostFile(path.into()),
        }
    }

    #[allow(missing_docs)]
    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: 0o777,
            content: Content::Symlink(target.into()),
        }
    }

    /// Replace the permission bits.
    pub fn with_mode(mut self, mode: u16) -> Self {
        self.mode = mode;
        self
    }

    #[allow(missing_docs)]
    pub fn is_dir(&self) -> bool {
        matches!(self.content, Content::Dir(_))
    }

    /// Children of a directory; empty for anything else.
    pub fn children(&self) -> &[FileInfo] {
        match &self.content {
            Content::Dir(c) => c,
            _ => &[],
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<FileInfo>> {
        match &mut self.content {
            Content::Dir(c) => Some(c),
            _ => None,
        }
    }

    /// Add `child` to this directory.
    pub fn attach(&mut self, child: FileInfo) -> Result<(), TreeError> {
        let name = self.name.clone();
        let children = self
            .children_mut()
            .ok_or(TreeError::NotADirectory(name))?;
        if children.iter().any(|c| c.name == child.name) {
            return Err(TreeError::Duplicate(child.name));
        }
        children.push(child);
        Ok(())
    }

    /// Return the directory at `path`, creating it and any missing parents.
    pub fn mkdir_p(&mut self, path: &str) -> Result<&mut FileInfo, TreeError> {
        let mut cur = self;
        for component in components(path)? {
            let children = cur
                .children_mut()
                .ok_or_else(|| TreeError::NotADirectory(path.to_owned()))?;
            let idx = match children.iter().position(|c| c.name == component) {
                Some(i) => i,
                None => {
                    children.push(FileInfo::dir(component));
                    children.len() - 1
                }
            };
            cur = &mut children[idx];
        }
        if !cur.is_dir() {
            return Err(TreeError::NotADirectory(path.to_owned()));
        }
        Ok(cur)
    }

    /// Insert `entry` at `path`, creating missing parent directories. The
    /// entry is renamed to the last component of `path`.
    pub fn insert(&mut self, path: &str, mut entry: FileInfo) -> Result<(), TreeError> {
        let mut parts = components(path)?;
        let name = parts
            .pop()
            .ok_or_else(|| TreeError::InvalidPath(path.to_owned()))?;
        entry.name = name.to_owned();
        self.mkdir_p(&parts.join("/"))?
            .attach(entry)
            .map_err(|e| match e {
                TreeError::Duplicate(_) => TreeError::Duplicate(path.to_owned()),
                o => o,
            })
    }

    /// Find the entry at `path`.
    pub fn lookup(&self, path: &str) -> Option<&FileInfo> {
        let mut cur = self;
        for component in components(path).ok()? {
            cur = cur.children().iter().find(|c| c.name == component)?;
        }
        Some(cur)
    }

    /// Replace the existing entry at `path`, keeping its name.
    pub fn replace(&mut self, path: &str, mut entry: FileInfo) -> Result<(), TreeError> {
        let mut parts = components(path)?;
        let name = parts
            .pop()
            .ok_or_else(|| TreeError::InvalidPath(path.to_owned()))?;
        let parent = self.mkdir_p(&parts.join("/"))?;
        let slot = parent
            .children_mut()
            .and_then(|c| c.iter_mut().find(|c| c.name == name))
            .ok_or_else(|| TreeError::InvalidPath(path.to_owned()))?;
        entry.name = name.to_owned();
        *slot = entry;
        Ok(())
    }

    /// Merge `other` into this tree. Directories present in both are merged
    /// recursively; any other entry present in both is an error listing
    /// every such path.
    pub fn merge(&mut self, other: FileInfo) -> Result<(), TreeError> {
        let mut dups = Vec::new();
        self.merge_into("", other, &mut dups);
        if dups.is_empty() {
            Ok(())
        } else {
            Err(TreeError::DuplicateFiles(dups))
        }
    }

    fn merge_into(&mut self, prefix: &str, other: FileInfo, dups: &mut Vec<String>) {
        let (Some(ours), Content::Dir(theirs)) = (self.children_mut(), other.content) else {
            dups.push(prefix.to_owned());
            return;
        };
        for child in theirs {
            let path = format!("{prefix}/{}", child.name);
            match ours.iter_mut().find(|c| c.name == child.name) {
                Some(existing) if existing.is_dir() && child.is_dir() => {
                    existing.merge_into(&path, child, dups)
                }
                Some(_) => dups.push(path),
                None => ours.push(child),
            }
        }
    }

    /// All entries below this one with their absolute paths, depth-first
    /// with siblings sorted by name.
    pub fn walk(&self) -> Vec<(String, &FileInfo)> {
        let mut out = Vec::new();
        self.walk_into("", &mut out);
        out
    }

    fn walk_into<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a FileInfo)>) {
        for child in self.sorted_children() {
            let path = format!("{prefix}/{}", child.name);
            out.push((path.clone(), child));
            child.walk_into(&path, out);
        }
    }

    /// Children sorted by name.
    pub fn sorted_children(&self) -> Vec<&FileInfo> {
        let mut children: Vec<_> = self.children().iter().collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        children
    }

    /// Paths of all non-directory entries.
    pub fn file_paths(&self) -> Vec<String> {
        self.walk()
            .into_iter()
            .filter(|(_, e)| !e.is_dir())
            .map(|(p, _)| p)
            .collect()
    }
}
