//! # Raspberry Pi EEPROM updates
//!
//! The Pi 4 and later boot ROM applies `pieeprom.upd` and `vl805.bin` from
//! the boot partition when `recovery.bin` is present, verifying each against
//! the SHA-256 in its `.sig` file. Once the EEPROM is current the recovery
//! program is stored under a name the ROM ignores, so it is not flashed
//! again on every boot.

use anyhow::{Context, Result};
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::digest::sha256_hex;

/// The recovery program under a name the boot ROM does not act on.
pub(crate) const RECOVERY_INERT: &str = "/RECOVERY.000";
pub(crate) const RECOVERY_ACTIVE: &str = "/recovery.bin";

/// Signatures of the EEPROM images installed on a running instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EepromSignatures {
    #[allow(missing_docs)]
    #[serde(rename = "PieepromSHA256", default)]
    pub pieeprom_sha256: String,
    #[allow(missing_docs)]
    #[serde(rename = "VL805SHA256", default)]
    pub vl805_sha256: String,
}

/// Files to place on the boot partition.
#[derive(Debug, Default)]
pub(crate) struct EepromUpdate {
    pub(crate) files: Vec<(String, Vec<u8>)>,
    pub(crate) signatures: EepromSignatures,
}

/// The lexicographically last file in `dir` named `<prefix>*.bin`. Images
/// are named by release date, so this is the most recent.
fn latest(dir: &Utf8Path, prefix: &str) -> Result<Option<String>> {
    let mut names = Vec::new();
    for entry in dir.read_dir_utf8()? {
        let entry = entry?;
        let name = entry.file_name();
        if name.starts_with(prefix) && name.ends_with(".bin") {
            names.push(name.to_owned());
        }
    }
    names.sort();
    Ok(names.pop())
}

fn signature(hash: &str, ts: DateTime<Utc>) -> Vec<u8> {
    format!("{hash}\nts: {}\n", ts.timestamp()).into_bytes()
}

/// Read the newest images from the EEPROM package in `dir`. `installed`
/// are the signatures reported by the instance being updated, if any.
#[context("Preparing EEPROM update from {dir}")]
pub(crate) fn prepare(
    dir: &Utf8Path,
    installed: Option<&EepromSignatures>,
    ts: DateTime<Utc>,
) -> Result<EepromUpdate> {
    let mut update = EepromUpdate::default();

    let Some(pieeprom) = latest(dir, "pieeprom-")? else {
        tracing::warn!("No pieeprom-*.bin in {dir}; skipping EEPROM update");
        return Ok(update);
    };
    tracing::debug!("Using EEPROM image {pieeprom}");
    let buf = std::fs::read(dir.join(&pieeprom)).with_context(|| format!("Reading {pieeprom}"))?;
    let hash = sha256_hex(&buf)?;
    update.files.push(("/pieeprom.upd".into(), buf));
    update.files.push(("/pieeprom.sig".into(), signature(&hash, ts)));
    update.signatures.pieeprom_sha256 = hash;

    if let Some(vl805) = latest(dir, "vl805-")? {
        tracing::debug!("Using VL805 image {vl805}");
        let buf = std::fs::read(dir.join(&vl805)).with_context(|| format!("Reading {vl805}"))?;
        let hash = sha256_hex(&buf)?;
        update.files.push(("/vl805.bin".into(), buf));
        update.files.push(("/vl805.sig".into(), signature(&hash, ts)));
        update.signatures.vl805_sha256 = hash;
    }

    let recovery = dir.join("recovery.bin");
    if recovery.try_exists()? {
        let up_to_date = installed == Some(&update.signatures);
        let name = if up_to_date {
            tracing::info!("EEPROM is up to date; installing recovery program as {RECOVERY_INERT}");
            RECOVERY_INERT
        } else {
            RECOVERY_ACTIVE
        };
        update
            .files
            .push((name.into(), std::fs::read(&recovery).context("Reading recovery.bin")?));
    }
    Ok(update)
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use chrono::TimeZone;

    use super::*;

    fn pkg() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
        let td = tempfile::tempdir()?;
        let dir = Utf8PathBuf::try_from(td.path().to_path_buf())?;
        std::fs::write(dir.join("pieeprom-2023-01-11.bin"), "old")?;
        std::fs::write(dir.join("pieeprom-2024-04-15.bin"), "new")?;
        std::fs::write(dir.join("vl805-000138c0.bin"), "usb")?;
        std::fs::write(dir.join("recovery.bin"), "recovery")?;
        Ok((td, dir))
    }

    fn names(u: &EepromUpdate) -> Vec<&str> {
        u.files.iter().map(|(n, _)| n.as_str()).collect()
    }

    #[test]
    fn test_prepare_fresh() -> Result<()> {
        let (_td, dir) = pkg()?;
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let u = prepare(&dir, None, ts)?;
        assert_eq!(
            names(&u),
            [
                "/pieeprom.upd",
                "/pieeprom.sig",
                "/vl805.bin",
                "/vl805.sig",
                "/recovery.bin"
            ]
        );
        assert_eq!(u.files[0].1, b"new");
        let sig = String::from_utf8(u.files[1].1.clone())?;
        assert_eq!(sig, format!("{}\nts: 1714521600\n", sha256_hex(b"new")?));
        Ok(())
    }

    #[test]
    fn test_prepare_up_to_date() -> Result<()> {
        let (_td, dir) = pkg()?;
        let installed = EepromSignatures {
            pieeprom_sha256: sha256_hex(b"new")?,
            vl805_sha256: sha256_hex(b"usb")?,
        };
        let u = prepare(&dir, Some(&installed), Utc::now())?;
        assert!(names(&u).contains(&RECOVERY_INERT));
        assert!(!names(&u).contains(&RECOVERY_ACTIVE));
        assert!(names(&u).contains(&"/pieeprom.upd"));

        let stale = EepromSignatures {
            pieeprom_sha256: sha256_hex(b"old")?,
            ..installed
        };
        let u = prepare(&dir, Some(&stale), Utc::now())?;
        assert!(names(&u).contains(&RECOVERY_ACTIVE));
        Ok(())
    }

    #[test]
    fn test_prepare_empty() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap();
        assert!(prepare(dir, None, Utc::now())?.files.is_empty());
        Ok(())
    }
}
