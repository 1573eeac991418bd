//! SHA-256 helpers.

use std::io::Read;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use openssl::hash::{Hasher, MessageDigest};

/// Hex encoded SHA-256 of `data`.
pub(crate) fn sha256_hex(data: &[u8]) -> Result<String> {
    let mut hasher = Hasher::new(MessageDigest::sha256()).context("Creating hasher")?;
    hasher.update(data)?;
    let digest: &[u8] = &hasher.finish().context("Finishing digest")?;
    Ok(hex::encode(digest))
}

/// Hex encoded SHA-256 of everything read from `r`.
pub(crate) fn sha256_reader_hex(mut r: impl Read) -> Result<String> {
    let mut hasher = Hasher::new(MessageDigest::sha256()).context("Creating hasher")?;
    let mut buf = vec![0u8; 128 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n])?;
    }
    let digest: &[u8] = &hasher.finish().context("Finishing digest")?;
    Ok(hex::encode(digest))
}

/// Hex encoded SHA-256 of the file at `path`.
#[context("Hashing {path}")]
pub(crate) fn sha256_file_hex(path: &Utf8Path) -> Result<String> {
    let f = std::fs::File::open(path)?;
    sha256_reader_hex(std::io::BufReader::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_sha256() -> Result<()> {
        assert_eq!(sha256_hex(b"")?, EMPTY);
        assert_eq!(
            sha256_hex(b"abc")?,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_reader_hex(&b"abc"[..])?, sha256_hex(b"abc")?);
        Ok(())
    }
}
