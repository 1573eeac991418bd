//! # Software bill of materials
//!
//! The SBOM records what went into an image: the configuration, every
//! executable with its build ID and embedded build metadata, and a hash of
//! every extra file taken from the host. It is installed as
//! `/etc/gokrazy/sbom.json` and included in gaf archives.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::digest::{sha256_file_hex, sha256_hex};
use crate::elf;
use crate::toolchain::Toolchain;

/// Where the SBOM is installed on the root filesystem.
pub const SBOM_PATH: &str = "/etc/gokrazy/sbom.json";

/// One executable of the image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinaryEntry {
    /// Path on the root filesystem
    pub path: String,
    /// The Go or GNU build ID, empty if there is none
    pub build_id: String,
    /// Build metadata as reported by the toolchain
    pub build_info: String,
}

/// The hash of one extra file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileHash {
    /// Path on the root filesystem
    pub path: String,
    /// Hex encoded SHA-256
    pub hash: String,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sbom {
    /// SHA-256 of the formatted configuration
    pub config_hash: String,
    pub binaries: Vec<BinaryEntry>,
    pub extra_file_hashes: Vec<FileHash>,
}

/// The SBOM with the hash of its serialization.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SbomWithHash {
    pub sbom_hash: String,
    pub sbom: Sbom,
}

fn to_json(v: &impl Serialize) -> Result<Vec<u8>> {
    let mut buf = serde_json::to_vec_pretty(v)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Bring `go version -m` output into the form of Go's `BuildInfo.String`:
/// the leading `<binary>: <go version>` line becomes `go\t<go version>` and
/// the indentation of the remaining lines is dropped. The binary lives in a
/// temporary directory, so its path must not end up in the SBOM.
fn normalize_build_info(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, line) in raw.lines().enumerate() {
        let line = match line.rsplit_once(": ") {
            Some((_, version)) if i == 0 && !line.starts_with('\t') => {
                out.push_str("go\t");
                version
            }
            _ => line.strip_prefix('\t').unwrap_or(line),
        };
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn describe(tc: &dyn Toolchain, path: &str, host: &Utf8Path) -> Result<BinaryEntry> {
    Ok(BinaryEntry {
        path: path.to_owned(),
        build_id: elf::build_id(host)?.unwrap_or_default(),
        build_info: normalize_build_info(&tc.build_info(host)?),
    })
}

/// Compute the SBOM. `binaries` and `extra_files` map paths on the root
/// filesystem to host files.
#[context("Generating SBOM")]
pub(crate) fn generate(
    config_text: &str,
    binaries: &[(String, Utf8PathBuf)],
    extra_files: &[(String, Utf8PathBuf)],
    tc: &dyn Toolchain,
) -> Result<(Vec<u8>, SbomWithHash)> {
    let results: Vec<Result<BinaryEntry>> = std::thread::scope(|s| {
        let handles: Vec<_> = binaries
            .iter()
            .map(|(path, host)| s.spawn(move || describe(tc, path, host)))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("build ID extraction panicked")))
            })
            .collect()
    });
    let mut entries = results.into_iter().collect::<Result<Vec<_>>>()?;
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hashes = extra_files
        .iter()
        .map(|(path, host)| {
            Ok(FileHash {
                path: path.clone(),
                hash: sha256_file_hex(host)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    hashes.sort_by(|a, b| a.path.cmp(&b.path));

    let sbom = Sbom {
        config_hash: sha256_hex(config_text.as_bytes())?,
        binaries: entries,
        extra_file_hashes: hashes,
    };
    let sbom_hash = sha256_hex(&to_json(&sbom)?)?;
    let with_hash = SbomWithHash { sbom_hash, sbom };
    let buf = to_json(&with_hash).context("Serializing SBOM")?;
    Ok((buf, with_hash))
}
