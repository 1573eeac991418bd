//! # The instance configuration
//!
//! An instance is described by a `config.json` with PascalCase keys. The
//! command line may override the `InternalCompatibilityFlags` section.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the configuration directory.
pub(crate) const CONFIG_DIR_ENV: &str = "GOKRAZY_CONFIG_DIR";

const DEFAULT_SERIAL_CONSOLE: &str = "serial0,115200";
const DEFAULT_KERNEL_PACKAGE: &str = "github.com/gokrazy/kernel";
const DEFAULT_FIRMWARE_PACKAGE: &str = "github.com/gokrazy/firmware";
const DEFAULT_EEPROM_PACKAGE: &str = "github.com/gokrazy/rpi-eeprom";
const DEFAULT_INIT_PACKAGE: &str = "github.com/gokrazy/gokrazy/cmd/init";
const DEFAULT_GOKRAZY_PACKAGES: &[&str] = &[
    "github.com/gokrazy/gokrazy/cmd/dhcp",
    "github.com/gokrazy/gokrazy/cmd/ntp",
    "github.com/gokrazy/gokrazy/cmd/randomd",
];
const DEFAULT_HTTP_PORT: &str = "80";
const DEFAULT_HTTPS_PORT: &str = "443";

/// Per-package settings, keyed by import path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct PackageConfig {
    /// Extra arguments to `go build`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub go_build_flags: Vec<String>,
    /// Build tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub go_build_tags: Vec<String>,
    /// `KEY=value` entries for the build environment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub go_build_environment: Vec<String>,
    /// `KEY=value` entries for the service at runtime
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<String>,
    /// Arguments passed to the service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_line_flags: Vec<String>,
    /// Destination on the root filesystem to host path
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_file_paths: BTreeMap<String, String>,
    /// Destination on the root filesystem to literal contents
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_file_contents: BTreeMap<String, String>,
    /// Overrides the name of the installed binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basename: Option<String>,
    /// Install, but do not start at boot
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dont_start: bool,
    /// Start only once the clock has been set
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub wait_for_clock: bool,
}

/// How to reach the running instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateConfig {
    /// Overrides the instance hostname for updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// `""`, `"self-signed"` or `"off"`
    #[serde(rename = "UseTLS", default, skip_serializing_if = "String::is_empty")]
    pub use_tls: String,
    #[allow(missing_docs)]
    #[serde(rename = "HTTPPort", default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<String>,
    #[allow(missing_docs)]
    #[serde(rename = "HTTPSPort", default, skip_serializing_if = "Option::is_none")]
    pub https_port: Option<String>,
    /// Password of the web interface
    #[serde(rename = "HTTPPassword", default, skip_serializing_if = "Option::is_none")]
    pub http_password: Option<String>,
    /// Path of a PEM certificate to install
    #[serde(rename = "CertPEM", default, skip_serializing_if = "Option::is_none")]
    pub cert_pem: Option<String>,
    /// Path of the matching PEM key
    #[serde(rename = "KeyPEM", default, skip_serializing_if = "Option::is_none")]
    pub key_pem: Option<String>,
    /// Run the web interface without authentication
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_password: bool,
}

/// A filesystem to mount at boot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct MountDevice {
    #[allow(missing_docs)]
    pub source: String,
    #[allow(missing_docs)]
    #[serde(rename = "Type")]
    pub fs_type: String,
    #[allow(missing_docs)]
    pub target: String,
    #[allow(missing_docs)]
    #[serde(default)]
    pub options: String,
}

/// Settings that historically were command line flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct InternalCompatibilityFlags {
    /// Device or image file to overwrite entirely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<Utf8PathBuf>,
    /// Where to write the boot partition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite_boot: Option<Utf8PathBuf>,
    /// Where to write the root partition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite_root: Option<Utf8PathBuf>,
    /// Where to write the MBR boot code
    #[serde(rename = "OverwriteMBR", default, skip_serializing_if = "Option::is_none")]
    pub overwrite_mbr: Option<Utf8PathBuf>,
    /// Where to write the generated init source (`-` for stdout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite_init: Option<Utf8PathBuf>,
    /// Size of the image file written with `Overwrite`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_storage_bytes: Option<u64>,
    /// `yes`, or the URL of the instance to update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,
    /// Permit plain HTTP even when a certificate exists
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure: bool,
    /// Boot the new root once, falling back if it fails
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub testboot: bool,
    /// `auto`, `always` or `never`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudo: Option<String>,
    /// Output path of a gaf archive
    #[serde(rename = "GaF", default, skip_serializing_if = "Option::is_none")]
    pub gaf: Option<Utf8PathBuf>,
}

/// The configuration of one instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Config {
    #[allow(missing_docs)]
    pub hostname: String,
    /// Device type slug, see [`crate::devicetype`]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_type: String,
    /// User packages, installed to `/user`
    #[serde(default)]
    pub packages: Vec<String>,
    /// System packages, installed to `/gokrazy`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gokrazy_packages: Option<Vec<String>>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub package_config: BTreeMap<String, PackageConfig>,
    /// `serial0,115200` by default; `disabled` or `off` turn it off
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_console: Option<String>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_package: Option<String>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_package: Option<String>,
    /// The empty string disables EEPROM updates
    #[serde(rename = "EEPROMPackage", default, skip_serializing_if = "Option::is_none")]
    pub eeprom_package: Option<String>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_pkg: Option<String>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateConfig>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_devices: Vec<MountDevice>,
    /// Appended to `config.txt`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bootloader_extra_lines: Vec<String>,
    /// Appended to the kernel command line
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kernel_extra_args: Vec<String>,
    /// `KEY=value` build environment, e.g. `GOARCH=amd64`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub internal_compatibility_flags: InternalCompatibilityFlags,
}

/// What a run of the packer produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Partition and write an entire block device
    OverwriteDevice(Utf8PathBuf),
    /// Create a disk image file of the given size
    OverwriteFile {
        /// Image file
        path: Utf8PathBuf,
        /// Size of the image
        target_storage_bytes: u64,
    },
    /// Write individual partition images
    OverwritePartitions {
        /// Boot partition image
        boot: Option<Utf8PathBuf>,
        /// Root partition image
        root: Option<Utf8PathBuf>,
        /// MBR boot code
        mbr: Option<Utf8PathBuf>,
    },
    /// Only write the generated init source
    DumpInit(Utf8PathBuf),
    /// Update a running instance over the network
    NetworkUpdate,
    /// Write a gaf archive
    Gaf(Utf8PathBuf),
}

fn env_lookup<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    // Later entries win, as in a process environment
    env.iter()
        .rev()
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

impl Config {
    /// Parse a configuration file.
    #[context("Loading configuration {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        Self::from_json(&buf)
    }

    /// Parse a configuration from its JSON text.
    pub fn from_json(buf: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(buf).context("Parsing JSON")?;
        anyhow::ensure!(
            !config.hostname.is_empty(),
            "Hostname must be set; add \"Hostname\": \"<name>\" to the configuration"
        );
        Ok(config)
    }

    /// The configuration as hashed into the SBOM.
    pub fn format(&self) -> Result<String> {
        let mut s = serde_json::to_string_pretty(self)?;
        s.push('\n');
        Ok(s)
    }

    /// System packages, with the defaults applied.
    pub fn gokrazy_packages(&self) -> Vec<String> {
        match &self.gokrazy_packages {
            Some(p) => p.clone(),
            None => DEFAULT_GOKRAZY_PACKAGES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// The package providing `/gokrazy/init`'s runtime.
    pub fn init_package(&self) -> &str {
        self.init_pkg.as_deref().unwrap_or(DEFAULT_INIT_PACKAGE)
    }

    #[allow(missing_docs)]
    pub fn serial_console(&self) -> &str {
        self.serial_console
            .as_deref()
            .unwrap_or(DEFAULT_SERIAL_CONSOLE)
    }

    #[allow(missing_docs)]
    pub fn kernel_package(&self) -> &str {
        self.kernel_package
            .as_deref()
            .unwrap_or(DEFAULT_KERNEL_PACKAGE)
    }

    /// The firmware package, unless disabled with an empty string.
    pub fn firmware_package(&self) -> Option<&str> {
        match self.firmware_package.as_deref() {
            None => Some(DEFAULT_FIRMWARE_PACKAGE),
            Some("") => None,
            Some(p) => Some(p),
        }
    }

    /// The EEPROM package, unless disabled with an empty string.
    pub fn eeprom_package(&self) -> Option<&str> {
        match self.eeprom_package.as_deref() {
            None => Some(DEFAULT_EEPROM_PACKAGE),
            Some("") => None,
            Some(p) => Some(p),
        }
    }

    /// Settings for `pkg`, or the defaults.
    pub fn package_config(&self, pkg: &str) -> PackageConfig {
        self.package_config.get(pkg).cloned().unwrap_or_default()
    }

    /// Name of the installed binary of `pkg`.
    pub fn basename(&self, pkg: &str) -> String {
        self.package_config
            .get(pkg)
            .and_then(|c| c.basename.clone())
            .unwrap_or_else(|| pkg.rsplit('/').next().unwrap_or(pkg).to_owned())
    }

    /// Target operating system.
    pub fn goos(&self) -> &str {
        env_lookup(&self.environment, "GOOS").unwrap_or("linux")
    }

    /// Target architecture.
    pub fn goarch(&self) -> &str {
        env_lookup(&self.environment, "GOARCH").unwrap_or("arm64")
    }

    /// The build environment with `GOOS`/`GOARCH` always present.
    pub fn build_environment(&self) -> Vec<String> {
        let mut env = vec![
            format!("GOOS={}", self.goos()),
            format!("GOARCH={}", self.goarch()),
        ];
        env.extend(
            self.environment
                .iter()
                .filter(|kv| !kv.starts_with("GOOS=") && !kv.starts_with("GOARCH="))
                .cloned(),
        );
        env
    }

    /// The hostname used to reach the instance.
    pub fn update_hostname(&self) -> &str {
        self.update
            .as_ref()
            .and_then(|u| u.hostname.as_deref())
            .unwrap_or(&self.hostname)
    }

    #[allow(missing_docs)]
    pub fn http_port(&self) -> &str {
        self.update
            .as_ref()
            .and_then(|u| u.http_port.as_deref())
            .unwrap_or(DEFAULT_HTTP_PORT)
    }

    #[allow(missing_docs)]
    pub fn https_port(&self) -> &str {
        self.update
            .as_ref()
            .and_then(|u| u.https_port.as_deref())
            .unwrap_or(DEFAULT_HTTPS_PORT)
    }

    /// The `UseTLS` setting.
    pub fn use_tls(&self) -> &str {
        self.update.as_ref().map(|u| u.use_tls.as_str()).unwrap_or("")
    }

    /// Decide what to produce, rejecting contradictory selections.
    pub fn operation(&self) -> Result<Operation> {
        let f = &self.internal_compatibility_flags;
        let partitions =
            f.overwrite_boot.is_some() || f.overwrite_root.is_some() || f.overwrite_mbr.is_some();
        let mut selected = Vec::new();
        if f.overwrite.is_some() {
            selected.push("--overwrite");
        }
        if partitions {
            selected.push("--overwrite-boot/--overwrite-root/--overwrite-mbr");
        }
        if f.gaf.is_some() {
            selected.push("--gaf");
        }
        if f.update.is_some() {
            selected.push("--update");
        }
        if selected.len() > 1 {
            anyhow::bail!(
                "{} are mutually exclusive; pass only one of them",
                selected.join(", ")
            );
        }
        if let Some(init) = &f.overwrite_init {
            anyhow::ensure!(
                selected.is_empty(),
                "--dump-init writes only the init source and cannot be combined with {}",
                selected.join(", ")
            );
            return Ok(Operation::DumpInit(init.clone()));
        }
        if f.target_storage_bytes.is_some() && f.overwrite.is_none() {
            anyhow::bail!("--target-storage-bytes is only meaningful with --overwrite");
        }

        if let Some(path) = &f.overwrite {
            return Ok(match f.target_storage_bytes {
                Some(target_storage_bytes) => Operation::OverwriteFile {
                    path: path.clone(),
                    target_storage_bytes,
                },
                None => Operation::OverwriteDevice(path.clone()),
            });
        }
        if partitions {
            return Ok(Operation::OverwritePartitions {
                boot: f.overwrite_boot.clone(),
                root: f.overwrite_root.clone(),
                mbr: f.overwrite_mbr.clone(),
            });
        }
        if let Some(gaf) = &f.gaf {
            return Ok(Operation::Gaf(gaf.clone()));
        }
        if f.update.is_some() {
            return Ok(Operation::NetworkUpdate);
        }
        anyhow::bail!(
            "No output selected: pass --overwrite <device>, --overwrite-root <file>, \
             --gaf <file> or --update yes"
        )
    }
}

/// The directory holding per-instance configuration and credentials.
pub fn config_dir() -> Result<Utf8PathBuf> {
    if let Some(d) = std::env::var_os(CONFIG_DIR_ENV) {
        return Utf8PathBuf::from_path_buf(d.into())
            .map_err(|p| anyhow::anyhow!("{CONFIG_DIR_ENV} is not UTF-8: {}", p.display()));
    }
    let base = dirs::config_dir().context("Determining the user configuration directory")?;
    let base = Utf8PathBuf::from_path_buf(base)
        .map_err(|p| anyhow::anyhow!("Configuration directory is not UTF-8: {}", p.display()))?;
    Ok(base.join("gokrazy"))
}

/// Path of the configuration of `instance`.
pub fn instance_config_path(config_dir: &Utf8Path, instance: &str) -> Utf8PathBuf {
    config_dir.join(instance).join("config.json")
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn parse(s: &str) -> Config {
        Config::from_json(s).unwrap()
    }

    #[test]
    fn test_parse_full() -> Result<()> {
        let c = Config::from_json(indoc! {r#"
            {
                "Hostname": "hello",
                "DeviceType": "odroidhc1",
                "Packages": ["github.com/gokrazy/hello"],
                "PackageConfig": {
                    "github.com/gokrazy/hello": {
                        "CommandLineFlags": ["-v"],
                        "ExtraFileContents": {"/etc/hello.conf": "x"},
                        "DontStart": true
                    }
                },
                "EEPROMPackage": "",
                "Update": {"HTTPPort": "8080", "UseTLS": "self-signed"},
                "MountDevices": [{"Source": "/dev/sda4", "Type": "ext4", "Target": "/mnt/data"}],
                "Environment": ["GOARCH=amd64"],
                "InternalCompatibilityFlags": {"OverwriteMBR": "/tmp/mbr", "GaF": null}
            }
        "#})?;
        assert_eq!(c.device_type, "odroidhc1");
        assert!(c.package_config("github.com/gokrazy/hello").dont_start);
        assert_eq!(c.eeprom_package(), None);
        assert_eq!(c.http_port(), "8080");
        assert_eq!(c.https_port(), "443");
        assert_eq!(c.use_tls(), "self-signed");
        assert_eq!(c.goarch(), "amd64");
        assert_eq!(c.goos(), "linux");
        assert_eq!(c.mount_devices[0].fs_type, "ext4");
        assert_eq!(
            c.operation()?,
            Operation::OverwritePartitions {
                boot: None,
                root: None,
                mbr: Some("/tmp/mbr".into())
            }
        );
        Ok(())
    }

    #[test]
    fn test_defaults() {
        let c = parse(r#"{"Hostname": "h"}"#);
        assert_eq!(c.gokrazy_packages().len(), 3);
        assert_eq!(c.serial_console(), "serial0,115200");
        assert_eq!(c.kernel_package(), "github.com/gokrazy/kernel");
        assert_eq!(c.eeprom_package(), Some("github.com/gokrazy/rpi-eeprom"));
        assert_eq!(c.update_hostname(), "h");
        assert_eq!(c.basename("github.com/gokrazy/hello"), "hello");
        assert_eq!(c.build_environment(), ["GOOS=linux", "GOARCH=arm64"]);
    }

    #[test]
    fn test_rejects() {
        assert!(Config::from_json(r#"{"Hostname": "h", "Bogus": 1}"#).is_err());
        assert!(Config::from_json(r#"{"Packages": []}"#).is_err());
    }

    #[test]
    fn test_operation() {
        let mut c = parse(r#"{"Hostname": "h"}"#);
        assert!(c.operation().is_err());

        let f = &mut c.internal_compatibility_flags;
        f.overwrite = Some("/dev/sdx".into());
        assert_eq!(c.operation().unwrap(), Operation::OverwriteDevice("/dev/sdx".into()));

        c.internal_compatibility_flags.target_storage_bytes = Some(1 << 31);
        assert_eq!(
            c.operation().unwrap(),
            Operation::OverwriteFile {
                path: "/dev/sdx".into(),
                target_storage_bytes: 1 << 31
            }
        );

        c.internal_compatibility_flags.gaf = Some("out.gaf".into());
        let e = c.operation().unwrap_err().to_string();
        assert!(e.contains("mutually exclusive"), "{e}");

        let mut c = parse(r#"{"Hostname": "h"}"#);
        c.internal_compatibility_flags.update = Some("yes".into());
        assert_eq!(c.operation().unwrap(), Operation::NetworkUpdate);
        c.internal_compatibility_flags.overwrite_init = Some("-".into());
        assert!(c.operation().is_err());
        c.internal_compatibility_flags.update = None;
        assert_eq!(c.operation().unwrap(), Operation::DumpInit("-".into()));

        let mut c = parse(r#"{"Hostname": "h"}"#);
        c.internal_compatibility_flags.target_storage_bytes = Some(1 << 31);
        assert!(c.operation().is_err());
    }

    #[test]
    fn test_format_is_stable() -> Result<()> {
        let c = parse(r#"{"Hostname": "h", "Packages": ["a"]}"#);
        let s = c.format()?;
        assert!(s.ends_with("}\n"));
        assert_eq!(Config::from_json(&s)?, c);
        Ok(())
    }
}
