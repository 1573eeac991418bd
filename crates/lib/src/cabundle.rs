//! Locating the host's CA certificate bundle for `/etc/ssl/ca-bundle.pem`.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

/// Where distributions keep their bundle, in order of preference.
const CANDIDATES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/pki/tls/cacert.pem",
    "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem",
    "/etc/ssl/cert.pem",
];

/// Overrides the search, as it does for OpenSSL.
const CERT_FILE_ENV: &str = "SSL_CERT_FILE";

pub(crate) fn find() -> Result<Utf8PathBuf> {
    if let Some(p) = std::env::var_os(CERT_FILE_ENV).filter(|v| !v.is_empty()) {
        let p = Utf8PathBuf::try_from(std::path::PathBuf::from(p))?;
        anyhow::ensure!(p.try_exists()?, "{CERT_FILE_ENV}={p} does not exist");
        return Ok(p);
    }
    find_in(CANDIDATES.iter().map(Utf8Path::new))
}

fn find_in<'a>(candidates: impl Iterator<Item = &'a Utf8Path> + Clone) -> Result<Utf8PathBuf> {
    for p in candidates.clone() {
        if p.try_exists()? {
            tracing::debug!("Using CA bundle {p}");
            return Ok(p.to_owned());
        }
    }
    let tried: Vec<_> = candidates.map(|p| p.as_str()).collect();
    anyhow::bail!(
        "No CA certificate bundle found; install your distribution's ca-certificates \
         package. Looked in: {}",
        tried.join(", ")
    )
}
