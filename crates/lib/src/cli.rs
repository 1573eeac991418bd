//! # gokr-packer command line
//!
//! Command line tool to build and deploy gokrazy instances.

use std::ffi::OsString;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;

use crate::config::{self, Config, InternalCompatibilityFlags};
use crate::pack::Packer;
use crate::toolchain::GoToolchain;

/// Options selecting the output of a build. Each one overrides the
/// corresponding `InternalCompatibilityFlags` entry of the configuration.
#[derive(Debug, clap::Args, PartialEq, Eq, Default)]
pub(crate) struct OutputOpts {
    /// Allow updates over plain HTTP even if the instance offers HTTPS.
    #[clap(long)]
    pub(crate) insecure: bool,

    /// Boot the new root only once; the next reboot returns to the current one.
    #[clap(long)]
    pub(crate) testboot: bool,

    /// Write a full disk image to this device or file.
    #[clap(long, value_name = "PATH")]
    pub(crate) overwrite: Option<Utf8PathBuf>,

    /// Write the boot file system image to this path.
    #[clap(long, value_name = "PATH")]
    pub(crate) overwrite_boot: Option<Utf8PathBuf>,

    /// Write the root file system image to this path.
    #[clap(long, value_name = "PATH")]
    pub(crate) overwrite_root: Option<Utf8PathBuf>,

    /// Write the MBR boot code to this path.
    #[clap(long, value_name = "PATH")]
    pub(crate) overwrite_mbr: Option<Utf8PathBuf>,

    /// Size of the image file written by --overwrite (e.g. 2G, 1610612736).
    #[clap(long, value_name = "BYTES", value_parser = gokr_blockdev::parse_size_bytes)]
    pub(crate) target_storage_bytes: Option<u64>,

    /// Write a gaf archive holding all images to this path.
    #[clap(long, value_name = "PATH")]
    pub(crate) gaf: Option<Utf8PathBuf>,

    /// Update the running instance: `yes` for the configured hostname, or
    /// a URL.
    #[clap(long, value_name = "yes|URL")]
    pub(crate) update: Option<String>,

    /// Only write the generated init source to this path (`-` for stdout).
    #[clap(long, value_name = "PATH")]
    pub(crate) dump_init: Option<Utf8PathBuf>,

    /// When to use sudo for raw device access.
    #[clap(long, value_parser = ["auto", "always", "never"])]
    pub(crate) sudo: Option<String>,
}

impl OutputOpts {
    fn apply(self, flags: &mut InternalCompatibilityFlags) {
        flags.insecure |= self.insecure;
        flags.testboot |= self.testboot;
        let set = |dst: &mut Option<Utf8PathBuf>, v: Option<Utf8PathBuf>| {
            if v.is_some() {
                *dst = v;
            }
        };
        set(&mut flags.overwrite, self.overwrite);
        set(&mut flags.overwrite_boot, self.overwrite_boot);
        set(&mut flags.overwrite_root, self.overwrite_root);
        set(&mut flags.overwrite_mbr, self.overwrite_mbr);
        set(&mut flags.overwrite_init, self.dump_init);
        set(&mut flags.gaf, self.gaf);
        if self.target_storage_bytes.is_some() {
            flags.target_storage_bytes = self.target_storage_bytes;
        }
        if self.update.is_some() {
            flags.update = self.update;
        }
        if self.sudo.is_some() {
            flags.sudo = self.sudo;
        }
    }
}

/// Hidden helpers invoked by gokr-packer itself.
#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum InternalsOpts {
    /// Open a device with elevated privileges and pass the descriptor back
    /// to the parent process.
    OpenDevice {
        #[clap(long)]
        device: Utf8PathBuf,
    },
}

#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum Command {
    #[clap(subcommand, hide = true)]
    Internals(InternalsOpts),
}

/// Build gokrazy instances and deploy them to a device, an image file or
/// over the network.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "gokr-packer")]
#[clap(rename_all = "kebab-case")]
#[clap(version, long_version = clap::crate_version!())]
pub(crate) struct Opt {
    /// Path of the instance configuration; defaults to
    /// `<config dir>/<instance>/config.json`.
    #[clap(long, value_name = "PATH")]
    pub(crate) config: Option<Utf8PathBuf>,

    /// Name of the instance.
    #[clap(long, short = 'i', default_value = "hello")]
    pub(crate) instance: String,

    #[clap(flatten)]
    pub(crate) output: OutputOpts,

    #[clap(subcommand)]
    pub(crate) cmd: Option<Command>,
}

async fn run_from_opt(opt: Opt) -> Result<()> {
    if let Some(Command::Internals(InternalsOpts::OpenDevice { device })) = opt.cmd {
        return gokr_blockdev::serve_device_fd(&device);
    }

    let config_dir = config::config_dir()?;
    let path = opt
        .config
        .unwrap_or_else(|| config::instance_config_path(&config_dir, &opt.instance));
    let mut config = Config::load(&path)?;
    opt.output.apply(&mut config.internal_compatibility_flags);
    let instance_dir = path
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| ".".into());

    let toolchain = Arc::new(GoToolchain::new(config.build_environment()));
    let hostname = config.hostname.clone();
    Packer::new(config, config_dir, toolchain)?
        .with_instance_dir(instance_dir)
        .run()
        .await
        .with_context(|| format!("Packing {hostname}"))
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and
/// aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}
