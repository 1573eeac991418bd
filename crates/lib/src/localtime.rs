//! `/etc/localtime` for the instance.

use anyhow::Result;
use camino::Utf8Path;

const HOST_LOCALTIME: &str = "/etc/localtime";

/// A TZif v2 file for the "Factory" zone: UTC with the abbreviation `-00`
/// and no transitions.
pub(crate) fn factory_zone() -> Vec<u8> {
    let mut block = Vec::new();
    block.extend_from_slice(b"TZif2");
    block.extend_from_slice(&[0u8; 15]);
    // isutcnt, isstdcnt, leapcnt, timecnt, typecnt, charcnt
    for count in [0u32, 0, 0, 0, 1, 4] {
        block.extend_from_slice(&count.to_be_bytes());
    }
    // ttinfo: utoff, isdst, desigidx
    block.extend_from_slice(&0i32.to_be_bytes());
    block.extend_from_slice(&[0, 0]);
    block.extend_from_slice(b"-00\0");

    // The v2 data block is identical as there are no transition times
    let mut out = block.clone();
    out.extend_from_slice(&block);
    out.extend_from_slice(b"\n<-00>0\n");
    out
}

/// The host's zone if it has one.
pub(crate) fn contents() -> Result<Vec<u8>> {
    contents_from(Utf8Path::new(HOST_LOCALTIME))
}

fn contents_from(path: &Utf8Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(b) => Ok(b),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("{path} not found; using the Factory zone");
            Ok(factory_zone())
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("Reading {path}"))),
    }
}
