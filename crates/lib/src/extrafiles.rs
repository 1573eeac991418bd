//! # Per-package extra files
//!
//! Packages may ship additional files into the root filesystem, either as
//! literal contents from the configuration or from the host: a tarball
//! (architecture specific or not), a directory, or a single file.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::config::PackageConfig;
use crate::filetree::FileInfo;

/// The extra files of one package.
#[derive(Debug)]
pub(crate) struct ExtraFiles {
    /// Import path of the package
    pub(crate) package: String,
    /// A root directory holding the files
    pub(crate) tree: FileInfo,
    /// Image paths with the host file they came from
    pub(crate) host_files: Vec<(String, Utf8PathBuf)>,
}

fn host_mode(meta: &std::fs::Metadata) -> u16 {
    (meta.permissions().mode() & 0o7777) as u16
}

fn is_under_perm(path: &str) -> bool {
    let p = path.trim_start_matches('/');
    p == "perm" || p.starts_with("perm/")
}

fn ensure_not_under_perm(path: &str) -> Result<()> {
    if is_under_perm(path) {
        anyhow::bail!(
            "extra file {path} is below /perm, which is the writable partition; \
             have the program create it at runtime instead"
        );
    }
    Ok(())
}

/// Copy the directory `src` into `tree` at `dest`, returning the files with
/// their host paths.
#[context("Importing {src}")]
pub(crate) fn import_host_dir(
    tree: &mut FileInfo,
    dest: &str,
    src: &Utf8Path,
) -> Result<Vec<(String, Utf8PathBuf)>> {
    let mut files = Vec::new();
    tree.mkdir_p(dest)?;
    for entry in walkdir::WalkDir::new(src)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
    {
        let entry = entry?;
        let path = Utf8Path::from_path(entry.path())
            .ok_or_else(|| anyhow::anyhow!("Non-UTF-8 path {}", entry.path().display()))?;
        let rel = path.strip_prefix(src)?;
        let target = format!("{}/{rel}", dest.trim_end_matches('/'));
        ensure_not_under_perm(&target)?;
        let ft = entry.file_type();
        if ft.is_dir() {
            let mode = host_mode(&entry.metadata()?);
            tree.mkdir_p(&target)?.mode = mode;
        } else if ft.is_symlink() {
            let link = std::fs::read_link(path)?;
            let link = link
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Non-UTF-8 link target in {path}"))?;
            tree.insert(&target, FileInfo::symlink("", link))?;
        } else if ft.is_file() {
            let mode = host_mode(&entry.metadata()?);
            tree.insert(&target, FileInfo::host("", path, mode))?;
            files.push((target, path.to_owned()));
        } else {
            tracing::debug!("Skipping special file {path}");
        }
    }
    Ok(files)
}

/// Extract the tarball at `src` into `tree` at `dest`.
#[context("Extracting {src}")]
fn import_tar(tree: &mut FileInfo, dest: &str, src: &Utf8Path) -> Result<()> {
    let f = std::fs::File::open(src)?;
    let mut archive = tar::Archive::new(std::io::BufReader::new(f));
    tree.mkdir_p(dest)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let path = Utf8PathBuf::try_from(path)?;
        let rel = path.as_str().trim_start_matches("./").trim_end_matches('/');
        if rel.is_empty() || rel == "." {
            continue;
        }
        let target = format!("{}/{rel}", dest.trim_end_matches('/'));
        ensure_not_under_perm(&target)?;
        let mode = (entry.header().mode()? & 0o7777) as u16;
        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                // Archives may list directories after their contents
                tree.mkdir_p(&target)?.mode = mode;
            }
            tar::EntryType::Symlink => {
                let link = entry
                    .link_name()?
                    .ok_or_else(|| anyhow::anyhow!("Symlink {rel} without target"))?;
                let link = link
                    .to_str()
                    .ok_or_else(|| anyhow::anyhow!("Non-UTF-8 link target in {rel}"))?
                    .to_owned();
                tree.insert(&target, FileInfo::symlink("", link))?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mut buf = Vec::new();
                std::io::Read::read_to_end(&mut entry, &mut buf)?;
                tree.insert(&target, FileInfo::bytes("", buf).with_mode(mode))?;
            }
            other => tracing::debug!("Skipping {rel} of type {other:?}"),
        }
    }
    Ok(())
}

/// Resolve the extra files configured for `package`. Relative host paths
/// are relative to `config_dir`.
#[context("Resolving extra files of {package}")]
pub(crate) fn resolve(
    package: &str,
    pc: &PackageConfig,
    config_dir: &Utf8Path,
    goarch: &str,
) -> Result<ExtraFiles> {
    let mut tree = FileInfo::root();
    let mut host_files = Vec::new();

    for dest in pc.extra_file_contents.keys().chain(pc.extra_file_paths.keys()) {
        ensure_not_under_perm(dest)?;
    }

    for (dest, contents) in &pc.extra_file_contents {
        tree.insert(dest, FileInfo::bytes("", contents.as_bytes()).with_mode(0o644))?;
    }

    for (dest, src) in &pc.extra_file_paths {
        let src = config_dir.join(src);
        let arch_tar = Utf8PathBuf::from(format!("{src}_{goarch}.tar"));
        let tar = Utf8PathBuf::from(format!("{src}.tar"));
        if arch_tar.is_file() {
            import_tar(&mut tree, dest, &arch_tar)?;
            host_files.push((dest.clone(), arch_tar));
        } else if tar.is_file() {
            import_tar(&mut tree, dest, &tar)?;
            host_files.push((dest.clone(), tar));
        } else if src.is_dir() {
            host_files.extend(import_host_dir(&mut tree, dest, &src)?);
        } else {
            let meta = std::fs::metadata(&src).with_context(|| {
                format!("Looking for {arch_tar}, {tar} or {src} for {dest}")
            })?;
            tree.insert(dest, FileInfo::host("", src.clone(), host_mode(&meta)))?;
            host_files.push((dest.clone(), src));
        }
    }

    Ok(ExtraFiles {
        package: package.to_owned(),
        tree,
        host_files,
    })
}

/// Fail if two packages provide the same file.
pub(crate) fn check_collisions(all: &[ExtraFiles]) -> Result<()> {
    let mut owners: BTreeMap<String, &str> = BTreeMap::new();
    for ef in all {
        for path in ef.tree.file_paths() {
            if let Some(prev) = owners.insert(path.clone(), &ef.package) {
                anyhow::bail!(
                    "Extra files of packages {prev} and {} both contain {path}",
                    ef.package
                );
            }
        }
    }
    Ok(())
}
