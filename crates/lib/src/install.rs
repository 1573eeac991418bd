//! # Writing images to their destination
//!
//! A build produces a boot and a root image. This module lays them out on
//! a whole device or image file (partition table, boot, root A, MBR boot
//! code and any bootloader blobs of the device type), writes them to
//! individual files, or bundles them as a gaf archive.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::os::fd::AsFd;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use fn_error_context::context;
use gokr_blockdev::{Arch, Layout, PartUuid, SudoPolicy, BOOTCODE_LEN, SECTOR_SIZE};

use crate::bootfs::BootImage;
use crate::devicetype::DeviceType;
use crate::gaf;
use crate::rootfs::RootImage;

const WRITE_BUFFER: usize = 1024 * 1024;

/// The output of a build.
#[derive(Debug)]
pub(crate) struct Images {
    pub(crate) boot: BootImage,
    pub(crate) root: RootImage,
    pub(crate) sbom: Vec<u8>,
    pub(crate) partuuid: PartUuid,
    pub(crate) device: &'static DeviceType,
    pub(crate) arch: Arch,
    /// Source of the device type's bootloader blobs
    pub(crate) kernel_dir: Utf8PathBuf,
    pub(crate) timestamp: DateTime<Utc>,
}

impl Images {
    /// The MBR boot code for the default layout of the device type.
    pub(crate) fn mbr_bootcode(&self) -> Result<[u8; BOOTCODE_LEN]> {
        self.boot
            .mbr_bootcode(self.device.first_partition_offset_sectors, self.partuuid)
    }

    /// The device type's bootloader blobs, checked against their maximum
    /// size.
    pub(crate) fn root_device_files(&self) -> Result<Vec<(&'static str, u64, Vec<u8>)>> {
        self.device
            .root_device_files
            .iter()
            .map(|f| {
                let path = self.kernel_dir.join(f.name);
                let buf = std::fs::read(&path).with_context(|| format!("Reading {path}"))?;
                anyhow::ensure!(
                    buf.len() as u64 <= f.max_length,
                    "{path} is {} bytes, larger than the {} bytes reserved for it",
                    buf.len(),
                    f.max_length
                );
                Ok((f.name, f.offset_bytes, buf))
            })
            .collect()
    }
}

/// Lay out `images` on `w`, which must already have its final size.
#[context("Writing disk image")]
pub(crate) fn write_disk<W: Write + Seek>(w: &mut W, layout: &Layout, images: &Images) -> Result<()> {
    gokr_blockdev::write_partition_table(
        w,
        layout,
        images.device.mbr_mode(),
        images.partuuid,
        images.arch,
    )?;

    let boot = layout.boot();
    anyhow::ensure!(
        images.boot.len() <= boot.len_bytes(),
        "Boot image of {} bytes exceeds the boot partition",
        images.boot.len()
    );
    tracing::info!("Writing boot partition");
    w.seek(SeekFrom::Start(boot.offset_bytes()))?;
    images.boot.copy_to(w)?;

    // The boot code shares sector 0 with the partition table
    let bootcode = images
        .boot
        .mbr_bootcode(layout.first_partition_offset(), images.partuuid)?;
    w.seek(SeekFrom::Start(0))?;
    w.write_all(&bootcode)?;

    let root = layout.root_a();
    anyhow::ensure!(
        images.root.len() <= root.len_bytes(),
        "Root image of {} bytes exceeds the {} byte root partition",
        images.root.len(),
        root.len_bytes()
    );
    tracing::info!("Writing root partition");
    w.seek(SeekFrom::Start(root.offset_bytes()))?;
    images.root.copy_to(w)?;

    for (name, offset, buf) in images.root_device_files()? {
        tracing::debug!("Writing {name} at byte {offset}");
        w.seek(SeekFrom::Start(offset))?;
        w.write_all(&buf)?;
    }
    w.flush()?;
    Ok(())
}

/// Partition and write a block device.
#[context("Overwriting device {dev}")]
pub(crate) fn overwrite_device(dev: &Utf8Path, images: &Images, sudo: SudoPolicy) -> Result<()> {
    gokr_blockdev::ensure_not_mounted(dev)?;
    let mut f = gokr_blockdev::open_device(dev, sudo)?;
    let size = f.seek(SeekFrom::End(0)).context("Determining device size")?;
    let layout = Layout::new(size, images.device.first_partition_offset_sectors)?;
    {
        let mut w = BufWriter::with_capacity(WRITE_BUFFER, &mut f);
        write_disk(&mut w, &layout, images)?;
    }
    f.sync_all().context("Syncing device")?;
    if let Err(e) = gokr_blockdev::reread_partitions(f.as_fd()) {
        tracing::warn!("Re-reading partition table: {e:#}");
    }
    Ok(())
}

/// Create a disk image file of `size` bytes.
#[context("Writing image file {path}")]
pub(crate) fn overwrite_file(path: &Utf8Path, size: u64, images: &Images) -> Result<()> {
    let layout = Layout::new(size, images.device.first_partition_offset_sectors)
        .context("Invalid --target-storage-bytes")?;
    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    f.set_len(size)?;
    {
        let mut w = BufWriter::with_capacity(WRITE_BUFFER, &mut f);
        write_disk(&mut w, &layout, images)?;
    }
    f.sync_all()?;
    Ok(())
}

fn create(path: &Utf8Path) -> Result<BufWriter<File>> {
    let f = File::create(path).with_context(|| format!("Creating {path}"))?;
    Ok(BufWriter::with_capacity(WRITE_BUFFER, f))
}

/// Write individual partition images.
#[context("Writing partition images")]
pub(crate) fn overwrite_partitions(
    boot: Option<&Utf8Path>,
    root: Option<&Utf8Path>,
    mbr: Option<&Utf8Path>,
    images: &Images,
) -> Result<()> {
    if let Some(path) = boot {
        let mut w = create(path)?;
        images.boot.copy_to(&mut w)?;
        w.flush()?;
        tracing::info!("Wrote boot partition to {path}");
    }
    if let Some(path) = root {
        let mut w = create(path)?;
        images.root.copy_to(&mut w)?;
        w.flush()?;
        tracing::info!("Wrote root partition to {path}");
    }
    if let Some(path) = mbr {
        std::fs::write(path, images.mbr_bootcode()?).with_context(|| format!("Writing {path}"))?;
        tracing::info!("Wrote MBR boot code to {path}");
    }
    Ok(())
}

/// Bundle the images as a gaf archive.
#[context("Writing gaf archive {path}")]
pub(crate) fn write_gaf(path: &Utf8Path, images: &Images) -> Result<()> {
    let mut boot = images.boot.reader()?;
    let mut root = images.root.reader()?;
    let mbr = images.mbr_bootcode()?;
    let mut mbr = &mbr[..];
    let mut sbom = images.sbom.as_slice();
    let w = gaf::write(
        create(path)?,
        images.timestamp,
        &mut [
            (gaf::BOOT, &mut boot),
            (gaf::ROOT, &mut root),
            (gaf::MBR, &mut mbr),
            (gaf::SBOM, &mut sbom),
        ],
    )?;
    w.into_inner()
        .map_err(|e| e.into_error())
        .context("Flushing archive")?
        .sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use chrono::TimeZone;
    use gokr_blockdev::gpt::{parse_entries, parse_header, ESP_TYPE};
    use gokr_blockdev::mbr::{read_u32, VMLINUZ_LBA_OFFSET};
    use gokr_blockdev::{RootSpec, DEFAULT_FIRST_PARTITION_OFFSET};

    use super::*;
    use crate::bootfs::{write_boot, BootOptions, BootSources};
    use crate::devicetype;
    use crate::filetree::FileInfo;

    const SIZE: u64 = 1536 * 1024 * 1024;

    fn images(slug: &str) -> Result<(tempfile::TempDir, Images)> {
        let td = tempfile::tempdir()?;
        let kernel = Utf8PathBuf::try_from(td.path().join("kernel"))?;
        std::fs::create_dir_all(&kernel)?;
        std::fs::write(kernel.join("vmlinuz"), vec![0x11; 5000])?;
        for name in ["bl1.bin", "bl2.bin", "u-boot.bin", "tzsw.bin"] {
            std::fs::write(kernel.join(name), name)?;
        }
        let device = devicetype::lookup(slug)?;
        let partuuid = PartUuid::from_hostname("gokrazy");
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let boot = write_boot(
            &BootSources {
                kernel_dir: &kernel,
                firmware_dir: None,
                eeprom_dir: None,
            },
            &BootOptions {
                serial_console: "off",
                kernel_extra_args: &[],
                bootloader_extra_lines: &[],
                root: RootSpec::GptPartuuid(partuuid),
                gpt: device.mbr_mode().has_gpt(),
                installed_eeprom: None,
                timestamp,
            },
        )?;
        let mut tree = FileInfo::root();
        tree.insert("/etc/hostname", FileInfo::bytes("", "gokrazy"))?;
        let root = RootImage::create(&tree, 0)?;
        let images = Images {
            boot,
            root,
            sbom: b"{}\n".to_vec(),
            partuuid,
            device,
            arch: Arch::Arm64,
            kernel_dir: kernel,
            timestamp,
        };
        Ok((td, images))
    }

    fn read_at(f: &mut File, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(&mut buf)?;
        Ok(buf)
    }

    #[test]
    fn test_overwrite_file_hybrid() -> Result<()> {
        let (td, images) = images("")?;
        let path = Utf8PathBuf::try_from(td.path().join("disk.img"))?;
        overwrite_file(&path, SIZE, &images)?;

        let mut f = File::open(&path)?;
        assert_eq!(f.metadata()?.len(), SIZE);
        let mbr = read_at(&mut f, 0, 512)?;
        assert_eq!(&mbr[510..], [0x55, 0xaa]);
        let hdr = read_at(&mut f, 512, 512)?;
        assert_eq!(&hdr[..8], b"EFI PART");
        let header = parse_header(&hdr)?;
        let entries = read_at(&mut f, 1024, 128 * 128)?;
        assert_eq!(gokr_blockdev::gpt::crc32(&entries), header.entries_crc);
        let parsed = parse_entries(&entries);
        assert_eq!(parsed[0].type_guid, ESP_TYPE);
        assert_eq!(parsed[0].first_lba, DEFAULT_FIRST_PARTITION_OFFSET);

        let boot = read_at(&mut f, DEFAULT_FIRST_PARTITION_OFFSET * SECTOR_SIZE, images.boot.len() as usize)?;
        let mut r = gokr_fat::Reader::new(Cursor::new(boot))?;
        let vmlinuz = r.extents("/vmlinuz")?;
        assert_eq!(
            read_u32(&mbr, VMLINUZ_LBA_OFFSET),
            Some((vmlinuz / SECTOR_SIZE + DEFAULT_FIRST_PARTITION_OFFSET) as u32)
        );

        let layout = Layout::new(SIZE, DEFAULT_FIRST_PARTITION_OFFSET)?;
        let root = read_at(&mut f, layout.root_a().offset_bytes(), 4)?;
        assert_eq!(root, b"hsqs");
        Ok(())
    }

    #[test]
    fn test_overwrite_file_mbr_only_blobs() -> Result<()> {
        let (td, images) = images("odroidhc1")?;
        let path = Utf8PathBuf::try_from(td.path().join("disk.img"))?;
        overwrite_file(&path, SIZE, &images)?;
        let mut f = File::open(&path)?;
        assert_ne!(read_at(&mut f, 512, 8)?, b"EFI PART");
        assert_eq!(read_at(&mut f, 512, 7)?, b"bl1.bin");
        assert_eq!(read_at(&mut f, 63 * 512, 10)?, b"u-boot.bin");
        Ok(())
    }

    #[test]
    fn test_oversized_blob_rejected() -> Result<()> {
        let (_td, images) = images("odroidhc1")?;
        std::fs::write(images.kernel_dir.join("bl1.bin"), vec![0u8; 31 * 512])?;
        let err = images.root_device_files().unwrap_err();
        assert!(format!("{err:#}").contains("larger than"));
        Ok(())
    }

    #[test]
    fn test_invalid_size() -> Result<()> {
        let (td, images) = images("")?;
        let path = Utf8PathBuf::try_from(td.path().join("disk.img"))?;
        assert!(overwrite_file(&path, SIZE + 1, &images).is_err());
        assert!(overwrite_file(&path, 1024 * 1024 * 1024, &images).is_err());
        Ok(())
    }

    #[test]
    fn test_partitions_and_gaf() -> Result<()> {
        let (td, images) = images("")?;
        let dir = Utf8PathBuf::try_from(td.path().to_path_buf())?;
        overwrite_partitions(
            Some(&dir.join("boot.img")),
            Some(&dir.join("root.img")),
            Some(&dir.join("mbr.img")),
            &images,
        )?;
        assert_eq!(std::fs::metadata(dir.join("boot.img"))?.len(), images.boot.len());
        assert_eq!(&std::fs::read(dir.join("root.img"))?[..4], b"hsqs");
        assert_eq!(std::fs::read(dir.join("mbr.img"))?.len(), BOOTCODE_LEN);

        let gaf_path = dir.join("out.gaf");
        write_gaf(&gaf_path, &images)?;
        let mut z = zip::ZipArchive::new(File::open(&gaf_path)?)?;
        let mut root = Vec::new();
        z.by_name(gaf::ROOT)?.read_to_end(&mut root)?;
        assert_eq!(root.len() as u64, images.root.len());
        let mut sbom = String::new();
        z.by_name(gaf::SBOM)?.read_to_string(&mut sbom)?;
        assert_eq!(sbom, "{}\n");
        Ok(())
    }
}
