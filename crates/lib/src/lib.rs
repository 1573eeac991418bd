//! # gokrazy appliance builder
//!
//! This crate builds bootable images for gokrazy instances: a FAT32 boot
//! partition, a SquashFS root file system holding the compiled programs
//! and a generated init, laid out on an A/B partition table. The images
//! are written to a device or file, bundled as a gaf archive, or streamed
//! to a running instance.

mod bls_config;
mod bootfs;
mod cabundle;
mod cert;
pub mod cli;
pub mod config;
mod credentials;
pub mod devicetype;
mod digest;
mod dnscheck;
pub mod eeprom;
pub mod elf;
mod extrafiles;
pub mod filetree;
mod gaf;
pub mod initgen;
mod install;
mod kernel_cmdline;
mod localtime;
pub mod pack;
mod progress;
mod rootfs;
pub mod sbom;
pub mod toolchain;
mod updater;
