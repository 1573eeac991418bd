//! # Composing the boot partition
//!
//! The boot partition is a FAT32 volume holding the firmware, the kernel
//! and its device trees, the kernel command line and bootloader
//! configuration, EEPROM updates and (with GPT) systemd-boot.
//!
//! The volume is materialized in a temporary file first. Its layout is then
//! read back to locate `/vmlinuz` and `/cmdline.txt`, whose sector addresses
//! the MBR boot code needs.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Take, Write};

use anyhow::{Context, Result};
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use fn_error_context::context;
use gokr_blockdev::{write_mbr_bootcode, PartUuid, RootSpec, BOOTCODE_LEN, BOOT_PARTITION_BYTES, SECTOR_SIZE};

use crate::bls_config::{self, LoaderEntry};
use crate::eeprom::{self, EepromSignatures};
use crate::kernel_cmdline;

const FIRMWARE_PATTERNS: &[&str] = &["*.bin", "*.dat", "*.elf", "*.upd", "*.sig", "overlays/*.dtbo"];
const KERNEL_PATTERNS: &[&str] = &[
    "boot.scr",
    "vmlinuz",
    "*.dtb",
    "overlays/*.dtbo",
    "overlays/overlay_map.dtb",
];
const EFI_LOADERS: &[&str] = &["EFI/BOOT/BOOTX64.EFI", "EFI/BOOT/BOOTAA64.EFI"];

/// Where the boot files come from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BootSources<'a> {
    pub(crate) kernel_dir: &'a Utf8Path,
    pub(crate) firmware_dir: Option<&'a Utf8Path>,
    pub(crate) eeprom_dir: Option<&'a Utf8Path>,
}

/// How to configure the boot files.
#[derive(Debug, Clone)]
pub(crate) struct BootOptions<'a> {
    pub(crate) serial_console: &'a str,
    pub(crate) kernel_extra_args: &'a [String],
    pub(crate) bootloader_extra_lines: &'a [String],
    pub(crate) root: RootSpec,
    /// Install systemd-boot and its loader entry
    pub(crate) gpt: bool,
    pub(crate) installed_eeprom: Option<&'a EepromSignatures>,
    pub(crate) timestamp: DateTime<Utc>,
}

/// A written boot partition.
#[derive(Debug)]
pub(crate) struct BootImage {
    file: File,
    len: u64,
    /// The kernel command line without padding
    pub(crate) cmdline: String,
    vmlinuz_offset: u64,
    cmdline_offset: u64,
}

/// Add a file to the boot partition. Later sources take precedence: the
/// kernel package over the firmware package, the EEPROM package over both.
fn add_file(files: &mut BTreeMap<String, Vec<u8>>, path: String, buf: Vec<u8>, origin: &Utf8Path) {
    if files.contains_key(&path) {
        tracing::debug!("{path} from {origin} replaces an earlier copy");
    }
    files.insert(path, buf);
}

/// Copy every file of `dir` matching `patterns` into `files`, keyed by its
/// path relative to `dir`.
fn glob_copy(
    files: &mut BTreeMap<String, Vec<u8>>,
    dir: &Utf8Path,
    patterns: &[&str],
) -> Result<()> {
    let escaped = glob::Pattern::escape(dir.as_str());
    for pattern in patterns {
        let full = format!("{escaped}/{pattern}");
        for path in glob::glob(&full).with_context(|| format!("Invalid pattern {full}"))? {
            let path = path?;
            let path = camino::Utf8PathBuf::try_from(path)?;
            if !path.is_file() {
                continue;
            }
            let rel = path.strip_prefix(dir)?;
            let buf = std::fs::read(&path).with_context(|| format!("Reading {path}"))?;
            tracing::trace!("Boot file {rel} from {dir}");
            add_file(files, format!("/{rel}"), buf, dir);
        }
    }
    Ok(())
}

/// Rewrite the firmware configuration.
pub(crate) fn transform_config_txt(config: &str, serial_console: &str, extra: &[String]) -> String {
    let mut out = if serial_console == "off" {
        config.to_owned()
    } else {
        config.replace("enable_uart=0", "enable_uart=1")
    };
    for line in extra {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn read_optional(path: &Utf8Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context(format!("Reading {path}"))),
    }
}

/// Compose the boot partition.
#[context("Writing boot partition")]
pub(crate) fn write_boot(src: &BootSources<'_>, opts: &BootOptions<'_>) -> Result<BootImage> {
    let mut files = BTreeMap::new();
    if let Some(fw) = src.firmware_dir {
        glob_copy(&mut files, fw, FIRMWARE_PATTERNS)?;
        if opts.gpt {
            for loader in EFI_LOADERS {
                let p = fw.join(loader);
                match std::fs::read(&p) {
                    Ok(buf) => {
                        files.insert(format!("/{loader}"), buf);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tracing::warn!("{p} not found; the image will not boot via UEFI");
                    }
                    Err(e) => return Err(anyhow::Error::new(e).context(format!("Reading {p}"))),
                }
            }
        }
    }
    glob_copy(&mut files, src.kernel_dir, KERNEL_PATTERNS)?;
    anyhow::ensure!(
        files.contains_key("/vmlinuz"),
        "Kernel package {} contains no vmlinuz",
        src.kernel_dir
    );

    if let Some(dir) = src.eeprom_dir {
        let update = eeprom::prepare(dir, opts.installed_eeprom, opts.timestamp)?;
        for (path, buf) in update.files {
            add_file(&mut files, path, buf, dir);
        }
    }

    let base = read_optional(&src.kernel_dir.join("cmdline.txt"))?;
    let cmdline = kernel_cmdline::compose(
        base.as_deref().unwrap_or(kernel_cmdline::DEFAULT_CMDLINE),
        opts.serial_console,
        opts.kernel_extra_args,
        &opts.root,
    );
    let padded = kernel_cmdline::pad(&cmdline);
    files.insert("/cmdline.txt".into(), padded.clone().into_bytes());

    let config = match read_optional(&src.kernel_dir.join("config.txt"))? {
        Some(c) => Some(c),
        None => match src.firmware_dir {
            Some(fw) => read_optional(&fw.join("config.txt"))?,
            None => None,
        },
    };
    if let Some(config) = config {
        let config = transform_config_txt(&config, opts.serial_console, opts.bootloader_extra_lines);
        files.insert("/config.txt".into(), config.into_bytes());
    } else if !opts.bootloader_extra_lines.is_empty() {
        let config = transform_config_txt("", opts.serial_console, opts.bootloader_extra_lines);
        files.insert("/config.txt".into(), config.into_bytes());
    }

    if opts.gpt {
        let entry = LoaderEntry::new(&padded);
        files.insert(bls_config::ENTRY_PATH.into(), entry.to_string().into_bytes());
    }

    let total_sectors = u32::try_from(BOOT_PARTITION_BYTES / SECTOR_SIZE)?;
    let mut fat = gokr_fat::Writer::new(total_sectors, opts.timestamp)?;
    for (path, buf) in files {
        fat.add_file(&path, buf)?;
    }

    let mut file = tempfile::tempfile().context("Creating temporary file")?;
    let len = {
        let mut w = BufWriter::new(&mut file);
        let n = fat.finish(&mut w)?;
        w.flush()?;
        n
    };
    tracing::debug!("Boot partition occupies {len} bytes");

    let mut r = gokr_fat::Reader::new(&mut file).context("Reading back boot partition")?;
    let vmlinuz_offset = r.extents("/vmlinuz")?;
    let cmdline_offset = r.extents("/cmdline.txt")?;
    Ok(BootImage {
        file,
        len,
        cmdline,
        vmlinuz_offset,
        cmdline_offset,
    })
}

impl BootImage {
    /// Size of the written volume.
    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    /// A reader over the volume, starting at its first byte.
    pub(crate) fn reader(&self) -> Result<Take<File>> {
        let mut f = self.file.try_clone()?;
        f.seek(SeekFrom::Start(0))?;
        Ok(f.take(self.len))
    }

    /// Copy the volume to the current position of `w`.
    pub(crate) fn copy_to(&self, w: &mut impl Write) -> Result<u64> {
        let n = std::io::copy(&mut self.reader()?, w)?;
        Ok(n)
    }

    /// The MBR boot code pointing at the kernel and command line, for a
    /// boot partition starting at sector `first_partition_offset`.
    pub(crate) fn mbr_bootcode(
        &self,
        first_partition_offset: u64,
        partuuid: PartUuid,
    ) -> Result<[u8; BOOTCODE_LEN]> {
        let lba = |offset: u64| -> Result<u32> {
            u32::try_from(offset / SECTOR_SIZE + first_partition_offset)
                .context("Sector address does not fit the boot code")
        };
        let vmlinuz = lba(self.vmlinuz_offset)?;
        let cmdline = lba(self.cmdline_offset)?;
        tracing::debug!("vmlinuz at LBA {vmlinuz}, cmdline.txt at LBA {cmdline}");
        Ok(write_mbr_bootcode(vmlinuz, cmdline, partuuid))
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use gokr_blockdev::mbr::{read_u32, CMDLINE_LBA_OFFSET, VMLINUZ_LBA_OFFSET};

    use super::*;

    struct Fixture {
        _td: tempfile::TempDir,
        kernel: Utf8PathBuf,
        firmware: Utf8PathBuf,
    }

    fn fixture() -> Result<Fixture> {
        let td = tempfile::tempdir()?;
        let base = Utf8PathBuf::try_from(td.path().to_path_buf())?;
        let kernel = base.join("kernel");
        let firmware = base.join("firmware");
        std::fs::create_dir_all(kernel.join("overlays"))?;
        std::fs::create_dir_all(firmware.join("EFI/BOOT"))?;
        std::fs::write(kernel.join("vmlinuz"), vec![0xaa; 3000])?;
        std::fs::write(kernel.join("bcm2711-rpi-4-b.dtb"), "dtb")?;
        std::fs::write(kernel.join("overlays/vc4.dtbo"), "dtbo")?;
        std::fs::write(kernel.join("config.txt"), "enable_uart=0\narm_64bit=1\n")?;
        std::fs::write(kernel.join("README.md"), "not copied")?;
        std::fs::write(firmware.join("start4.elf"), "elf")?;
        std::fs::write(firmware.join("fixup4.dat"), "dat")?;
        std::fs::write(firmware.join("EFI/BOOT/BOOTAA64.EFI"), "efi")?;
        Ok(Fixture {
            _td: td,
            kernel,
            firmware,
        })
    }

    fn options(gpt: bool, root: RootSpec) -> BootOptions<'static> {
        BootOptions {
            serial_console: "serial0,115200",
            kernel_extra_args: &[],
            bootloader_extra_lines: &[],
            root,
            gpt,
            installed_eeprom: None,
            timestamp: Utc::now(),
        }
    }

    fn read(img: &BootImage, path: &str) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        img.copy_to(&mut buf)?;
        let mut r = gokr_fat::Reader::new(std::io::Cursor::new(buf))?;
        Ok(r.read_file(path)?)
    }

    #[test]
    fn test_write_boot() -> Result<()> {
        let f = fixture()?;
        let src = BootSources {
            kernel_dir: &f.kernel,
            firmware_dir: Some(&f.firmware),
            eeprom_dir: None,
        };
        let partuuid = PartUuid::from_hostname("gokrazy");
        let img = write_boot(&src, &options(true, RootSpec::GptPartuuid(partuuid)))?;

        let cmdline = read(&img, "/cmdline.txt")?;
        assert_eq!(cmdline.len(), img.cmdline.len() + kernel_cmdline::CMDLINE_PADDING);
        assert!(img.cmdline.contains("/PARTNROFF=1"), "{}", img.cmdline);
        assert_eq!(read(&img, "/config.txt")?, b"enable_uart=1\narm_64bit=1\n");
        assert_eq!(read(&img, "/vmlinuz")?, vec![0xaa; 3000]);
        assert_eq!(read(&img, "/overlays/vc4.dtbo")?, b"dtbo");
        assert_eq!(read(&img, "/EFI/BOOT/BOOTAA64.EFI")?, b"efi");
        assert_eq!(read(&img, "/start4.elf")?, b"elf");
        assert!(read(&img, "/README.md").is_err());

        let entry = String::from_utf8(read(&img, bls_config::ENTRY_PATH)?)?;
        let entry = bls_config::parse(&entry)?;
        assert_eq!(entry.linux, "/vmlinuz");
        assert_eq!(entry.options.as_bytes(), cmdline.as_slice());

        let bootcode = img.mbr_bootcode(8192, partuuid)?;
        let mut buf = Vec::new();
        img.copy_to(&mut buf)?;
        let mut r = gokr_fat::Reader::new(std::io::Cursor::new(buf))?;
        let expect = |off: u64| (off / 512 + 8192) as u32;
        assert_eq!(
            read_u32(&bootcode, VMLINUZ_LBA_OFFSET),
            Some(expect(r.extents("/vmlinuz")?))
        );
        assert_eq!(
            read_u32(&bootcode, CMDLINE_LBA_OFFSET),
            Some(expect(r.extents("/cmdline.txt")?))
        );
        Ok(())
    }

    #[test]
    fn test_kernel_files_take_precedence() -> Result<()> {
        let f = fixture()?;
        std::fs::create_dir_all(f.firmware.join("overlays"))?;
        std::fs::write(f.firmware.join("overlays/vc4.dtbo"), "firmware dtbo")?;
        std::fs::write(f.firmware.join("overlays/disable-bt.dtbo"), "bt")?;
        let src = BootSources {
            kernel_dir: &f.kernel,
            firmware_dir: Some(&f.firmware),
            eeprom_dir: None,
        };
        let partuuid = PartUuid::from_hostname("gokrazy");
        let img = write_boot(&src, &options(false, RootSpec::LegacyPartuuid(partuuid)))?;
        assert_eq!(read(&img, "/overlays/vc4.dtbo")?, b"dtbo");
        assert_eq!(read(&img, "/overlays/disable-bt.dtbo")?, b"bt");
        Ok(())
    }

    #[test]
    fn test_write_boot_mbr_only() -> Result<()> {
        let f = fixture()?;
        std::fs::write(f.kernel.join("cmdline.txt"), "root=/dev/mmcblk0p2 rootwait\n")?;
        let src = BootSources {
            kernel_dir: &f.kernel,
            firmware_dir: Some(&f.firmware),
            eeprom_dir: None,
        };
        let mut opts = options(false, RootSpec::LegacyPartuuid(PartUuid(0x2e18a6ab)));
        opts.serial_console = "off";
        let extra = vec!["dtoverlay=disable-bt".to_owned()];
        opts.bootloader_extra_lines = &extra;
        let img = write_boot(&src, &opts)?;
        assert_eq!(img.cmdline, "console=tty1 root=PARTUUID=2e18a6ab-02 rootwait");
        assert!(read(&img, bls_config::ENTRY_PATH).is_err());
        assert!(read(&img, "/EFI/BOOT/BOOTAA64.EFI").is_err());
        assert_eq!(
            read(&img, "/config.txt")?,
            b"enable_uart=0\narm_64bit=1\ndtoverlay=disable-bt\n"
        );
        Ok(())
    }

    #[test]
    fn test_eeprom_up_to_date() -> Result<()> {
        let f = fixture()?;
        let eeprom = f.kernel.parent().unwrap().join("eeprom");
        std::fs::create_dir(&eeprom)?;
        std::fs::write(eeprom.join("pieeprom-2024-04-15.bin"), "pieeprom")?;
        std::fs::write(eeprom.join("vl805-000138c0.bin"), "vl805")?;
        std::fs::write(eeprom.join("recovery.bin"), "recovery")?;
        let src = BootSources {
            kernel_dir: &f.kernel,
            firmware_dir: Some(&f.firmware),
            eeprom_dir: Some(&eeprom),
        };
        let installed = EepromSignatures {
            pieeprom_sha256: crate::digest::sha256_hex(b"pieeprom")?,
            vl805_sha256: crate::digest::sha256_hex(b"vl805")?,
        };
        let mut opts = options(true, RootSpec::Untouched);
        opts.installed_eeprom = Some(&installed);
        let img = write_boot(&src, &opts)?;
        assert_eq!(read(&img, "/RECOVERY.000")?, b"recovery");
        assert!(read(&img, "/recovery.bin").is_err());
        assert_eq!(read(&img, "/pieeprom.upd")?, b"pieeprom");
        assert_eq!(read(&img, "/vl805.bin")?, b"vl805");

        opts.installed_eeprom = None;
        let img = write_boot(&src, &opts)?;
        assert_eq!(read(&img, "/recovery.bin")?, b"recovery");
        assert!(read(&img, "/RECOVERY.000").is_err());
        Ok(())
    }

    #[test]
    fn test_missing_vmlinuz() -> Result<()> {
        let f = fixture()?;
        std::fs::remove_file(f.kernel.join("vmlinuz"))?;
        let src = BootSources {
            kernel_dir: &f.kernel,
            firmware_dir: None,
            eeprom_dir: None,
        };
        let e = write_boot(&src, &options(false, RootSpec::Untouched)).unwrap_err();
        assert!(format!("{e:#}").contains("no vmlinuz"));
        Ok(())
    }

    #[test]
    fn test_transform_config_txt() {
        let extra = vec!["gpu_mem=16".to_owned()];
        assert_eq!(
            transform_config_txt("enable_uart=0", "serial0,115200", &extra),
            "enable_uart=1\ngpu_mem=16\n"
        );
        assert_eq!(transform_config_txt("enable_uart=0\n", "off", &[]), "enable_uart=0\n");
    }
}
