//! # Assembling the root filesystem
//!
//! Fixed skeleton, kernel modules and generated `/etc` files are added to
//! the [`FileInfo`] tree, which is then serialized as SquashFS.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Take, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use gokr_squashfs::Inode;

use crate::cert::TlsFiles;
use crate::config::MountDevice;
use crate::extrafiles::import_host_dir;
use crate::filetree::{Content, FileInfo};

const SKELETON: &[&str] = &["bin", "dev", "etc", "proc", "sys", "tmp", "perm", "lib", "run", "mnt"];

/// Add the directories every instance has, `/var` and mount points.
pub(crate) fn add_skeleton(root: &mut FileInfo, mount_devices: &[MountDevice]) -> Result<()> {
    for dir in SKELETON {
        root.mkdir_p(dir)?;
    }
    if root.lookup("/var").is_none() {
        root.insert("/var", FileInfo::symlink("", "/perm/var"))?;
    }
    for md in mount_devices {
        // Only direct children of /mnt live on the read-only root
        let Some(name) = md.target.strip_prefix("/mnt/") else {
            continue;
        };
        if name.is_empty() || name.contains('/') {
            continue;
        }
        root.mkdir_p(&format!("/mnt/{name}"))?;
    }
    Ok(())
}

/// Import `lib/modules` of the kernel package, if it has any.
#[context("Adding kernel modules")]
pub(crate) fn add_kernel_modules(root: &mut FileInfo, kernel_dir: &Utf8Path) -> Result<()> {
    let modules = kernel_dir.join("lib/modules");
    if !modules.is_dir() {
        tracing::debug!("No kernel modules in {kernel_dir}");
        return Ok(());
    }
    import_host_dir(root, "/lib/modules", &modules)?;
    Ok(())
}

/// Contents of the generated `/etc` files.
#[derive(Debug)]
pub(crate) struct EtcFiles<'a> {
    pub(crate) hostname: &'a str,
    pub(crate) localtime: Vec<u8>,
    pub(crate) ca_bundle: Utf8PathBuf,
    /// `None` disables authentication of the web interface
    pub(crate) password: Option<&'a str>,
    pub(crate) http_port: &'a str,
    /// Set when the web interface uses TLS
    pub(crate) https_port: Option<&'a str>,
    pub(crate) tls: Option<&'a TlsFiles>,
    pub(crate) sbom: Vec<u8>,
    pub(crate) mount_devices: &'a [MountDevice],
}

fn hosts(hostname: &str) -> String {
    format!("127.0.0.1 localhost\n::1 localhost\n127.0.0.1 {hostname}\n::1 {hostname}\n")
}

/// Populate `/etc`.
#[context("Adding /etc files")]
pub(crate) fn add_etc(root: &mut FileInfo, etc: EtcFiles<'_>) -> Result<()> {
    root.insert("/etc/localtime", FileInfo::bytes("", etc.localtime))?;
    root.insert("/etc/resolv.conf", FileInfo::symlink("", "/tmp/resolv.conf"))?;
    root.insert("/etc/hosts", FileInfo::bytes("", hosts(etc.hostname)).with_mode(0o644))?;
    root.insert("/etc/hostname", FileInfo::bytes("", etc.hostname).with_mode(0o644))?;
    root.insert("/etc/ssl/ca-bundle.pem", FileInfo::host("", etc.ca_bundle, 0o644))?;
    if let Some(pw) = etc.password {
        root.insert("/etc/gokr-pw.txt", FileInfo::bytes("", pw).with_mode(0o400))?;
    }
    root.insert("/etc/http-port.txt", FileInfo::bytes("", etc.http_port).with_mode(0o644))?;
    if let Some(port) = etc.https_port {
        root.insert("/etc/https-port.txt", FileInfo::bytes("", port).with_mode(0o644))?;
    }
    if let Some(tls) = etc.tls {
        root.insert("/etc/ssl/gokrazy-web.pem", FileInfo::host("", tls.cert.clone(), 0o644))?;
        root.insert("/etc/ssl/gokrazy-web.key.pem", FileInfo::host("", tls.key.clone(), 0o400))?;
    }
    root.insert("/etc/gokrazy/sbom.json", FileInfo::bytes("", etc.sbom).with_mode(0o644))?;
    let mut mounts = serde_json::to_vec(etc.mount_devices)?;
    mounts.push(b'\n');
    root.insert("/etc/gokrazy/mountdevices.json", FileInfo::bytes("", mounts).with_mode(0o644))?;
    Ok(())
}

fn write_entry<W: Write + Seek>(
    w: &mut gokr_squashfs::Writer<W>,
    path: &str,
    entry: &FileInfo,
) -> Result<Inode> {
    let inode = match &entry.content {
        Content::Dir(_) => {
            let mut children = Vec::new();
            for child in entry.sorted_children() {
                let child_path = format!("{}/{}", path.trim_end_matches('/'), child.name);
                children.push((child.name.clone(), write_entry(w, &child_path, child)?));
            }
            w.add_dir(children, entry.mode)?
        }
        Content::HostFile(host) => {
            let f = std::fs::File::open(host).with_context(|| format!("Opening {host} for {path}"))?;
            w.add_file(BufReader::new(f), entry.mode)
                .with_context(|| format!("Writing {path}"))?
        }
        Content::Bytes(b) => w.add_file(b.as_slice(), entry.mode)?,
        Content::Symlink(target) => w.add_symlink(target, entry.mode)?,
    };
    Ok(inode)
}

/// Serialize the tree at the current position of `w`, returning the size of
/// the image.
#[context("Writing root file system")]
pub(crate) fn write_squashfs<W: Write + Seek>(root: &FileInfo, w: W, mtime: u32) -> Result<u64> {
    anyhow::ensure!(root.is_dir(), "root must be a directory");
    let mut sq = gokr_squashfs::Writer::new(w, mtime)?;
    let root_inode = write_entry(&mut sq, "/", root)?;
    let n = sq.finish(root_inode)?;
    tracing::debug!("Root file system occupies {n} bytes");
    Ok(n)
}

/// A root filesystem image in a temporary file.
#[derive(Debug)]
pub(crate) struct RootImage {
    file: File,
    len: u64,
}

impl RootImage {
    /// Serialize `root`.
    pub(crate) fn create(root: &FileInfo, mtime: u32) -> Result<Self> {
        let mut file = tempfile::tempfile().context("Creating temporary file")?;
        let len = {
            let mut w = BufWriter::new(&mut file);
            let n = write_squashfs(root, &mut w, mtime)?;
            w.flush()?;
            n
        };
        Ok(Self { file, len })
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    /// A reader over the image, starting at its first byte.
    pub(crate) fn reader(&self) -> Result<Take<File>> {
        let mut f = self.file.try_clone()?;
        f.seek(SeekFrom::Start(0))?;
        Ok(f.take(self.len))
    }

    /// Copy the image to the current position of `w`.
    pub(crate) fn copy_to(&self, w: &mut impl Write) -> Result<u64> {
        Ok(std::io::copy(&mut self.reader()?, w)?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use gokr_squashfs::{Entry, Reader};

    use super::*;

    fn etc_files<'a>(ca: &Utf8Path, mounts: &'a [MountDevice]) -> EtcFiles<'a> {
        EtcFiles {
            hostname: "pi",
            localtime: crate::localtime::factory_zone(),
            ca_bundle: ca.to_owned(),
            password: Some("secret"),
            http_port: "80",
            https_port: None,
            tls: None,
            sbom: b"{}\n".to_vec(),
            mount_devices: mounts,
        }
    }

    #[test]
    fn test_rootfs() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let ca = dir.join("ca.pem");
        std::fs::write(&ca, "CA")?;
        let kernel = dir.join("kernel");
        std::fs::create_dir_all(kernel.join("lib/modules/6.6.0/kernel"))?;
        std::fs::write(kernel.join("lib/modules/6.6.0/kernel/fs.ko"), "ko")?;
        std::fs::write(kernel.join("lib/modules/6.6.0/modules.dep"), "")?;

        let mounts = vec![
            MountDevice {
                source: "/dev/sda1".into(),
                fs_type: "ext4".into(),
                target: "/mnt/usb".into(),
                options: String::new(),
            },
            MountDevice {
                source: "/dev/sda2".into(),
                fs_type: "ext4".into(),
                target: "/perm/data".into(),
                options: String::new(),
            },
        ];

        let mut root = FileInfo::root();
        root.insert("/gokrazy/init", FileInfo::bytes("", "init").with_mode(0o755))?;
        add_skeleton(&mut root, &mounts)?;
        add_kernel_modules(&mut root, &kernel)?;
        add_etc(&mut root, etc_files(&ca, &mounts))?;

        let mut img = Cursor::new(Vec::new());
        let n = write_squashfs(&root, &mut img, 1_700_000_000)?;
        let buf = img.into_inner();
        assert_eq!(&buf[..4], b"hsqs");
        assert_eq!(n, buf.len() as u64);

        let mut r = Reader::new(Cursor::new(buf))?;
        assert_eq!(r.mtime(), 1_700_000_000);
        assert_eq!(r.read_file("/etc/hostname")?, b"pi");
        assert_eq!(
            r.read_file("/etc/hosts")?,
            b"127.0.0.1 localhost\n::1 localhost\n127.0.0.1 pi\n::1 pi\n"
        );
        assert_eq!(r.read_file("/etc/ssl/ca-bundle.pem")?, b"CA");
        assert_eq!(r.read_file("/etc/gokr-pw.txt")?, b"secret");
        assert_eq!(r.read_file("/lib/modules/6.6.0/kernel/fs.ko")?, b"ko");
        assert!(r.lookup("/etc/https-port.txt").is_err());
        assert!(matches!(r.lookup("/mnt/usb")?, Entry::Dir { .. }));
        assert!(r.lookup("/mnt/data").is_err());
        match r.lookup("/var")? {
            Entry::Symlink { target, .. } => assert_eq!(target, "/perm/var"),
            o => panic!("unexpected {o:?}"),
        }
        match r.lookup("/etc/resolv.conf")? {
            Entry::Symlink { target, .. } => assert_eq!(target, "/tmp/resolv.conf"),
            o => panic!("unexpected {o:?}"),
        }
        let mounts: Vec<MountDevice> =
            serde_json::from_slice(&r.read_file("/etc/gokrazy/mountdevices.json")?)?;
        assert_eq!(mounts.len(), 2);
        let names: Vec<_> = r.list(&r.root()?)?.into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            ["bin", "dev", "etc", "gokrazy", "lib", "mnt", "perm", "proc", "run", "sys", "tmp", "var"]
        );
        Ok(())
    }

    #[test]
    fn test_deterministic() -> Result<()> {
        let build = || -> Result<Vec<u8>> {
            let mut root = FileInfo::root();
            add_skeleton(&mut root, &[])?;
            root.insert("/user/b", FileInfo::bytes("", vec![1u8; 200_000]))?;
            root.insert("/user/a", FileInfo::bytes("", "a"))?;
            let mut img = Cursor::new(Vec::new());
            write_squashfs(&root, &mut img, 0)?;
            Ok(img.into_inner())
        };
        assert_eq!(build()?, build()?);

        let mut root = FileInfo::root();
        add_skeleton(&mut root, &[])?;
        let img = RootImage::create(&root, 0)?;
        let mut buf = Vec::new();
        assert_eq!(img.copy_to(&mut buf)?, img.len());
        // Readable repeatedly
        assert_eq!(img.copy_to(&mut Vec::new())?, img.len());
        assert_eq!(&buf[..4], b"hsqs");
        Ok(())
    }
}
