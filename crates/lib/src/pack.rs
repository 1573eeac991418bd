//! # Building and delivering an instance
//!
//! [`Packer::run`] turns a [`Config`] into a boot and a root image and hands
//! them to the destination selected by [`Config::operation`]: a device, an
//! image file, individual partition files, a gaf archive or a running
//! instance.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use fn_error_context::context;
use gokr_blockdev::{Arch, MbrMode, PartUuid, RootSpec, SudoPolicy};
use gokr_utils::{build_timestamp, format_timestamp};
use owo_colors::OwoColorize;

use crate::bootfs::{self, BootOptions, BootSources};
use crate::cert::{self, TlsFiles};
use crate::config::{Config, Operation};
use crate::devicetype::{self, DeviceType};
use crate::dnscheck::DnsCheck;
use crate::extrafiles::{self, ExtraFiles};
use crate::filetree::FileInfo;
use crate::initgen::{self, Service, INIT_PATH};
use crate::install::{self, Images};
use crate::rootfs::{self, EtcFiles, RootImage};
use crate::toolchain::{BuildRequest, MainPackage, Toolchain};
use crate::updater::{self, Capabilities, HttpTarget, HttpTargetOptions, InstanceStatus, Payload};
use crate::{cabundle, credentials, elf, localtime, sbom};

/// A compiled program and where it lives on the root filesystem.
#[derive(Debug)]
struct Binary {
    import_path: String,
    path: String,
    host: Utf8PathBuf,
}

/// Builds the images of one instance.
#[derive(Clone)]
pub struct Packer {
    config: Arc<Config>,
    config_dir: Utf8PathBuf,
    instance_dir: Utf8PathBuf,
    toolchain: Arc<dyn Toolchain>,
    timestamp: DateTime<Utc>,
}

impl std::fmt::Debug for Packer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packer")
            .field("hostname", &self.config.hostname)
            .field("config_dir", &self.config_dir)
            .field("instance_dir", &self.instance_dir)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

impl Packer {
    /// A packer for `config`. Credentials are kept below `config_dir`,
    /// which is also where relative extra file paths are resolved unless
    /// [`Self::with_instance_dir`] says otherwise.
    pub fn new(
        config: Config,
        config_dir: impl Into<Utf8PathBuf>,
        toolchain: Arc<dyn Toolchain>,
    ) -> Result<Self> {
        let config_dir = config_dir.into();
        Ok(Self {
            config: Arc::new(config),
            instance_dir: config_dir.clone(),
            config_dir,
            toolchain,
            timestamp: build_timestamp()?,
        })
    }

    /// Resolve relative extra file paths in `dir`.
    pub fn with_instance_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.instance_dir = dir.into();
        self
    }

    /// Use `timestamp` as the build timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Build the images and deliver them.
    pub async fn run(&self) -> Result<()> {
        let op = self.config.operation()?;
        let device = devicetype::lookup(&self.config.device_type)?;
        if let Operation::DumpInit(dest) = &op {
            return self.dump_init(dest);
        }

        let dns = DnsCheck::spawn(self.config.update_hostname());
        let password = self.password()?;

        let target = match op {
            Operation::NetworkUpdate => Some(self.connect(password.as_deref()).await?),
            _ => None,
        };
        // Compiling and writing the images is all blocking
        let images = {
            let this = self.clone();
            let status = target.as_ref().map(|(_, s)| s.clone());
            let password = password.clone();
            tokio::task::spawn_blocking(move || {
                this.build(device, status.as_ref(), password.as_deref())
            })
            .await??
        };
        self.deliver(&op, &images, target.map(|(t, _)| t)).await?;

        dns.report().await;
        self.banner(&op, password.as_deref());
        Ok(())
    }

    fn password(&self) -> Result<Option<String>> {
        let update = self.config.update.as_ref();
        if update.is_some_and(|u| u.no_password) {
            return Ok(None);
        }
        let configured = update.and_then(|u| u.http_password.as_deref());
        credentials::ensure_password(&self.config_dir, &self.config.hostname, configured).map(Some)
    }

    fn tls(&self) -> Result<Option<TlsFiles>> {
        let configured = self
            .config
            .update
            .as_ref()
            .and_then(|u| Some((u.cert_pem.as_deref()?, u.key_pem.as_deref()?)));
        cert::ensure_certificate(
            &self.config_dir,
            &self.config.hostname,
            self.config.use_tls(),
            configured,
        )
    }

    async fn connect(&self, password: Option<&str>) -> Result<(HttpTarget, InstanceStatus)> {
        let trusted = cert::trusted_certificate(&self.config_dir, &self.config.hostname)?;
        let flags = &self.config.internal_compatibility_flags;
        let opts = HttpTargetOptions {
            update: flags.update.as_deref().unwrap_or("yes"),
            hostname: self.config.update_hostname(),
            http_port: self.config.http_port(),
            https_port: self.config.https_port(),
            password,
            trusted_cert: trusted.as_deref(),
            insecure: flags.insecure,
        };
        let (target, status) = HttpTarget::connect(&opts).await?;
        tracing::info!(
            "{} runs build {} (features: {})",
            opts.hostname,
            status.build_timestamp,
            status.features.join(",")
        );
        Ok((target, status))
    }

    /// Every package to build, system packages first. A configured init
    /// package replaces the generated init.
    fn all_packages(&self) -> Vec<String> {
        let mut all = self.config.gokrazy_packages();
        all.extend(self.config.packages.iter().cloned());
        all.extend(self.config.init_pkg.iter().cloned());
        all
    }

    /// Map the main packages to their installed paths.
    fn binaries(&self, bindir: &Utf8Path, mains: &[MainPackage]) -> Vec<Binary> {
        let system = self.config.gokrazy_packages();
        let mut out = Vec::with_capacity(mains.len());
        for mp in mains {
            let path = if self.config.init_pkg.as_deref() == Some(mp.import_path.as_str()) {
                INIT_PATH.to_owned()
            } else {
                let name = self.config.basename(&mp.import_path);
                let dir = if system.contains(&mp.import_path) { "gokrazy" } else { "user" };
                format!("/{dir}/{name}")
            };
            out.push(Binary {
                host: bindir.join(&mp.target),
                import_path: mp.import_path.clone(),
                path,
            });
        }
        out
    }

    fn init_source(&self, binaries: &[Binary]) -> String {
        let services: Vec<_> = binaries
            .iter()
            .filter(|b| b.path != INIT_PATH)
            .map(|b| Service::from_config(&self.config, &b.import_path, &b.path))
            .collect();
        initgen::render(&services, &format_timestamp(&self.timestamp))
    }

    #[context("Writing init source to {dest}")]
    fn dump_init(&self, dest: &Utf8Path) -> Result<()> {
        let mains = self.toolchain.main_packages(&self.all_packages())?;
        let binaries = self.binaries(Utf8Path::new(""), &mains);
        let src = self.init_source(&binaries);
        if dest.as_str() == "-" {
            std::io::stdout().lock().write_all(src.as_bytes())?;
        } else {
            std::fs::write(dest, src)?;
        }
        Ok(())
    }

    #[context("Building packages")]
    fn build_packages(&self, bindir: &Utf8Path) -> Result<Vec<Binary>> {
        let all = self.all_packages();
        let packages = self.toolchain.main_packages(&all)?;
        let binaries = self.binaries(bindir, &packages);
        let no_build: Vec<_> = all
            .into_iter()
            .filter(|p| !packages.iter().any(|m| &m.import_path == p))
            .collect();
        for p in &no_build {
            tracing::debug!("{p} has no main package, installing only its extra files");
        }
        self.toolchain.build(&BuildRequest {
            bindir,
            packages: &packages,
            package_config: &self.config.package_config,
            env: &self.config.build_environment(),
            no_build: &no_build,
        })?;
        for b in &binaries {
            elf::validate(&b.host)?;
        }
        Ok(binaries)
    }

    #[context("Building init")]
    fn build_init(&self, tmpdir: &Utf8Path, binaries: &[Binary]) -> Result<Utf8PathBuf> {
        let src_dir = tmpdir.join("init");
        std::fs::create_dir(&src_dir)?;
        initgen::write_module(&src_dir, &self.init_source(binaries))?;
        let out = tmpdir.join("init.bin");
        self.toolchain
            .build_init(&src_dir, &out, &format_timestamp(&self.timestamp))?;
        elf::validate(&out)?;
        Ok(out)
    }

    fn extra_files(&self) -> Result<Vec<ExtraFiles>> {
        let goarch = self.config.goarch();
        let all = self
            .all_packages()
            .iter()
            .filter_map(|p| Some((p, self.config.package_config.get(p)?)))
            .map(|(p, pc)| extrafiles::resolve(p, pc, &self.instance_dir, goarch))
            .collect::<Result<Vec<_>>>()?;
        extrafiles::check_collisions(&all)?;
        Ok(all)
    }

    /// The root filesystem tree.
    fn root_tree(
        &self,
        tmpdir: &Utf8Path,
        kernel_dir: &Utf8Path,
        password: Option<&str>,
    ) -> Result<(FileInfo, Vec<u8>)> {
        let bindir = tmpdir.join("bin");
        std::fs::create_dir(&bindir)?;
        let mut binaries = self.build_packages(&bindir)?;
        if !binaries.iter().any(|b| b.path == INIT_PATH) {
            let host = self.build_init(tmpdir, &binaries)?;
            binaries.push(Binary {
                import_path: self.config.init_package().to_owned(),
                path: INIT_PATH.to_owned(),
                host,
            });
        }

        let mut root = FileInfo::root();
        for b in &binaries {
            root.insert(&b.path, FileInfo::host("", b.host.clone(), 0o755))?;
        }
        rootfs::add_skeleton(&mut root, &self.config.mount_devices)?;
        rootfs::add_kernel_modules(&mut root, kernel_dir)?;

        let extras = self.extra_files()?;
        let host_files: Vec<_> = extras
            .iter()
            .flat_map(|e| e.host_files.iter().cloned())
            .collect();
        let bins: Vec<_> = binaries
            .iter()
            .map(|b| (b.path.clone(), b.host.clone()))
            .collect();
        let (sbom, with_hash) =
            sbom::generate(&self.config.format()?, &bins, &host_files, self.toolchain.as_ref())?;
        tracing::debug!("SBOM hash {}", with_hash.sbom_hash);

        let tls = self.tls()?;
        rootfs::add_etc(
            &mut root,
            EtcFiles {
                hostname: &self.config.hostname,
                localtime: localtime::contents()?,
                ca_bundle: cabundle::find()?,
                password,
                http_port: self.config.http_port(),
                https_port: tls.as_ref().map(|_| self.config.https_port()),
                tls: tls.as_ref(),
                sbom: sbom.clone(),
                mount_devices: &self.config.mount_devices,
            },
        )?;
        for e in extras {
            root.merge(e.tree)
                .with_context(|| format!("Adding extra files of {}", e.package))?;
        }
        Ok((root, sbom))
    }

    #[context("Building images")]
    fn build(
        &self,
        device: &'static DeviceType,
        status: Option<&InstanceStatus>,
        password: Option<&str>,
    ) -> Result<Images> {
        let tmp = tempfile::tempdir()?;
        let tmpdir = Utf8Path::from_path(tmp.path()).context("Temporary directory is not UTF-8")?;

        let kernel_dir = self.toolchain.package_dir(self.config.kernel_package())?;
        let firmware_dir = self
            .config
            .firmware_package()
            .map(|p| self.toolchain.package_dir(p))
            .transpose()?;
        let eeprom_dir = self
            .config
            .eeprom_package()
            .map(|p| self.toolchain.package_dir(p))
            .transpose()?;

        let (tree, sbom) = self.root_tree(tmpdir, &kernel_dir, password)?;
        let mtime = u32::try_from(self.timestamp.timestamp())
            .context("Build timestamp does not fit SquashFS")?;
        tracing::info!("Writing root file system");
        let root = RootImage::create(&tree, mtime)?;

        let partuuid = PartUuid::from_hostname(&self.config.hostname);
        let caps = status.map(Capabilities::from_status);
        let (root_spec, gpt) = match &caps {
            Some(caps) => (caps.root_spec(partuuid), caps.use_gpt),
            None => match device.mbr_mode() {
                MbrMode::Hybrid => (RootSpec::GptPartuuid(partuuid), true),
                MbrMode::MbrOnly => (RootSpec::LegacyPartuuid(partuuid), false),
            },
        };
        tracing::info!("Writing boot file system");
        let boot = bootfs::write_boot(
            &BootSources {
                kernel_dir: &kernel_dir,
                firmware_dir: firmware_dir.as_deref(),
                eeprom_dir: eeprom_dir.as_deref(),
            },
            &BootOptions {
                serial_console: self.config.serial_console(),
                kernel_extra_args: &self.config.kernel_extra_args,
                bootloader_extra_lines: &self.config.bootloader_extra_lines,
                root: root_spec,
                gpt,
                installed_eeprom: caps.as_ref().and_then(|c| c.existing_eeprom.as_ref()),
                timestamp: self.timestamp,
            },
        )?;

        Ok(Images {
            boot,
            root,
            sbom,
            partuuid,
            device,
            arch: Arch::from_goarch(self.config.goarch()),
            kernel_dir,
            timestamp: self.timestamp,
        })
    }

    async fn deliver(&self, op: &Operation, images: &Images, target: Option<HttpTarget>) -> Result<()> {
        let flags = &self.config.internal_compatibility_flags;
        match op {
            Operation::OverwriteDevice(dev) => {
                let sudo: SudoPolicy = flags.sudo.as_deref().unwrap_or("auto").parse()?;
                install::overwrite_device(dev, images, sudo)
            }
            Operation::OverwriteFile {
                path,
                target_storage_bytes,
            } => install::overwrite_file(path, *target_storage_bytes, images),
            Operation::OverwritePartitions { boot, root, mbr } => install::overwrite_partitions(
                boot.as_deref(),
                root.as_deref(),
                mbr.as_deref(),
                images,
            ),
            Operation::Gaf(path) => install::write_gaf(path, images),
            Operation::NetworkUpdate => {
                let target = target.context("No connection to the instance")?;
                let payloads = updater::UpdatePayloads {
                    root: images.root.reader()?.into(),
                    boot: images.boot.reader()?.into(),
                    mbr: Some(Payload::Bytes(images.mbr_bootcode()?.to_vec())),
                    device_specific: images
                        .root_device_files()?
                        .into_iter()
                        .map(|(name, _, buf)| (name.to_owned(), Payload::Bytes(buf)))
                        .collect(),
                };
                updater::apply(&target, payloads, flags.testboot).await?;
                updater::wait_for_build_timestamp(
                    &target,
                    &format_timestamp(&self.timestamp),
                    Default::default(),
                )
                .await
            }
            Operation::DumpInit(_) => Ok(()),
        }
    }

    fn banner(&self, op: &Operation, password: Option<&str>) {
        let host = self.config.update_hostname();
        let scheme = if self.config.use_tls().is_empty() || self.config.use_tls() == "off" {
            "http"
        } else {
            "https"
        };
        let port = match scheme {
            "http" if self.config.http_port() != "80" => format!(":{}", self.config.http_port()),
            "https" if self.config.https_port() != "443" => format!(":{}", self.config.https_port()),
            _ => String::new(),
        };
        let auth = password.map(|p| format!("{}:{p}@", updater::USER)).unwrap_or_default();
        let url = format!("{scheme}://{auth}{host}{port}/");
        let ts = format_timestamp(&self.timestamp);
        let mut out = anstream::stdout();
        let r = match op {
            Operation::NetworkUpdate => writeln!(
                out,
                "{} {host}, now running build {ts}\nWeb interface: {}",
                "Updated".green().bold(),
                url.bold()
            ),
            _ => writeln!(
                out,
                "{} ({ts}).\n\nTo update this instance in the future, run:\n\n    {}\n\n\
                 Once booted, the web interface is at {}",
                "Build complete".green().bold(),
                "gokr-packer --update yes".bold(),
                url.bold()
            ),
        };
        if let Err(e) = r {
            tracing::debug!("Printing summary: {e}");
        }
    }
}
