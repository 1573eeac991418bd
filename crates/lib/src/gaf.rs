//! The gokrazy archive format: an uncompressed zip of the partition images
//! and the SBOM.

use std::io::{Read, Seek, Write};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use fn_error_context::context;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub(crate) const BOOT: &str = "boot.img";
pub(crate) const ROOT: &str = "root.img";
pub(crate) const MBR: &str = "mbr.img";
pub(crate) const SBOM: &str = "sbom.json";

/// The zip timestamp for `ts`. Zip cannot represent dates before 1980.
fn zip_time(ts: DateTime<Utc>) -> zip::DateTime {
    let year = u16::try_from(ts.year()).unwrap_or_default();
    zip::DateTime::from_date_and_time(
        year,
        ts.month() as u8,
        ts.day() as u8,
        ts.hour() as u8,
        ts.minute() as u8,
        ts.second() as u8,
    )
    .unwrap_or_default()
}

/// Write an archive holding `members` in order.
#[context("Writing gaf archive")]
pub(crate) fn write<W: Write + Seek>(
    w: W,
    ts: DateTime<Utc>,
    members: &mut [(&str, &mut dyn Read)],
) -> Result<W> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(zip_time(ts))
        .unix_permissions(0o644)
        .large_file(true);
    let mut zw = ZipWriter::new(w);
    for (name, r) in members.iter_mut() {
        zw.start_file(*name, options)?;
        let n = std::io::copy(r, &mut zw).with_context(|| format!("Writing {name}"))?;
        tracing::debug!("Added {name} ({n} bytes)");
    }
    Ok(zw.finish()?)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_write() -> Result<()> {
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 12, 30, 10).unwrap();
        let mut boot: &[u8] = b"boot";
        let mut root: &[u8] = b"root";
        let mut mbr: &[u8] = &[0u8; 446];
        let mut sbom: &[u8] = b"{}\n";
        let out = write(
            Cursor::new(Vec::new()),
            ts,
            &mut [
                (BOOT, &mut boot),
                (ROOT, &mut root),
                (MBR, &mut mbr),
                (SBOM, &mut sbom),
            ],
        )?;

        let mut z = zip::ZipArchive::new(Cursor::new(out.into_inner()))?;
        let names: Vec<_> = z.file_names().map(str::to_owned).collect();
        assert_eq!(names.len(), 4);
        for name in [BOOT, ROOT, MBR, SBOM] {
            assert!(names.iter().any(|n| n == name), "{name}");
        }
        let mut f = z.by_name(MBR)?;
        assert_eq!(f.compression(), CompressionMethod::Stored);
        assert_eq!(f.size(), 446);
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        assert_eq!(buf, [0u8; 446]);
        Ok(())
    }

    #[test]
    fn test_zip_time() {
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 12, 30, 10).unwrap();
        let z = zip_time(ts);
        assert_eq!((z.year(), z.month(), z.day()), (2024, 2, 29));
        assert_eq!((z.hour(), z.minute()), (12, 30));
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        assert_eq!(zip_time(epoch), zip::DateTime::default());
    }
}
