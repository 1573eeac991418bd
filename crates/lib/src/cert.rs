//! TLS certificates for the instance's web interface.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509NameBuilder, X509};

use crate::credentials::{host_dir, write_private};

pub(crate) const CERT_FILE: &str = "cert.pem";
pub(crate) const KEY_FILE: &str = "key.pem";
/// An optional additional trust anchor for reaching the instance.
pub(crate) const CA_CERT_FILE: &str = "cacert.pem";
const RSA_BITS: u32 = 4096;
const VALIDITY_DAYS: u32 = 2 * 365;

/// A certificate and its key on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TlsFiles {
    pub(crate) cert: Utf8PathBuf,
    pub(crate) key: Utf8PathBuf,
}

/// A self-signed server certificate for `hostname`, PEM encoded, with its
/// PKCS#8 key.
fn generate(hostname: &str, bits: u32) -> Result<(Vec<u8>, Vec<u8>)> {
    let key = PKey::from_rsa(Rsa::generate(bits)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "gokrazy")?;
    let name = name.build();

    let mut b = X509::builder()?;
    b.set_version(2)?;
    let serial = {
        let mut bn = BigNum::new()?;
        bn.rand(127, MsbOption::MAYBE_ZERO, false)?;
        bn.to_asn1_integer()?
    };
    b.set_serial_number(&serial)?;
    b.set_subject_name(&name)?;
    b.set_issuer_name(&name)?;
    b.set_pubkey(&key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    b.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(VALIDITY_DAYS)?;
    b.set_not_after(&not_after)?;
    b.append_extension(BasicConstraints::new().build()?)?;
    b.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    b.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;
    let san = SubjectAlternativeName::new()
        .dns(hostname)
        .build(&b.x509v3_context(None, None))?;
    b.append_extension(san)?;
    b.sign(&key, MessageDigest::sha256())?;

    let cert = b.build();
    Ok((cert.to_pem()?, key.private_key_to_pem_pkcs8()?))
}

/// The certificate to install on the instance, if TLS is in use.
///
/// Explicitly configured files win. With `UseTLS` set to `self-signed` a
/// certificate is generated on first use and kept in the per-host
/// directory.
#[context("Preparing TLS certificate for {hostname}")]
pub(crate) fn ensure_certificate(
    config_dir: &Utf8Path,
    hostname: &str,
    use_tls: &str,
    configured: Option<(&str, &str)>,
) -> Result<Option<TlsFiles>> {
    if use_tls == "off" {
        return Ok(None);
    }
    if let Some((cert, key)) = configured {
        return Ok(Some(TlsFiles {
            cert: config_dir.join(cert),
            key: config_dir.join(key),
        }));
    }
    if use_tls != "self-signed" {
        return Ok(None);
    }
    ensure_self_signed(config_dir, hostname, RSA_BITS).map(Some)
}

fn ensure_self_signed(config_dir: &Utf8Path, hostname: &str, bits: u32) -> Result<TlsFiles> {
    let dir = host_dir(config_dir, hostname);
    let files = TlsFiles {
        cert: dir.join(CERT_FILE),
        key: dir.join(KEY_FILE),
    };
    if files.cert.try_exists()? && files.key.try_exists()? {
        tracing::debug!("Using existing certificate {}", files.cert);
        return Ok(files);
    }
    tracing::info!("Generating self-signed certificate for {hostname}");
    let (cert, key) = generate(hostname, bits).context("Generating certificate")?;
    write_private(&dir, KEY_FILE, &key)?;
    write_private(&dir, CERT_FILE, &cert)?;
    Ok(files)
}

/// The certificate to trust when connecting to `hostname`, if one is kept
/// in the configuration directory.
pub(crate) fn trusted_certificate(config_dir: &Utf8Path, hostname: &str) -> Result<Option<Utf8PathBuf>> {
    let dir = host_dir(config_dir, hostname);
    for name in [CERT_FILE, CA_CERT_FILE] {
        let p = dir.join(name);
        if p.try_exists()? {
            return Ok(Some(p));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use openssl::x509::X509VerifyResult;

    use super::*;

    #[test]
    fn test_self_signed() -> Result<()> {
        let td = tempfile::tempdir()?;
        let cfg = Utf8Path::from_path(td.path()).unwrap();
        let files = ensure_self_signed(cfg, "gokrazy", 2048)?;
        assert_eq!(files.cert, cfg.join("hosts/gokrazy/cert.pem"));

        let cert = X509::from_pem(&std::fs::read(&files.cert)?)?;
        let key = PKey::private_key_from_pem(&std::fs::read(&files.key)?)?;
        assert!(cert.verify(&key)?);
        assert_eq!(cert.issued(&cert), X509VerifyResult::OK);
        let org = cert
            .subject_name()
            .entries_by_nid(Nid::ORGANIZATIONNAME)
            .next()
            .unwrap();
        assert_eq!(org.data().as_utf8()?.to_string(), "gokrazy");
        let sans: Vec<String> = cert
            .subject_alt_names()
            .unwrap()
            .iter()
            .filter_map(|n| n.dnsname().map(str::to_owned))
            .collect();
        assert_eq!(sans, ["gokrazy"]);

        // Kept on the second call
        let pem = std::fs::read(&files.cert)?;
        ensure_self_signed(cfg, "gokrazy", 2048)?;
        assert_eq!(std::fs::read(&files.cert)?, pem);
        assert_eq!(trusted_certificate(cfg, "gokrazy")?, Some(files.cert));
        assert_eq!(trusted_certificate(cfg, "other")?, None);
        Ok(())
    }

    #[test]
    fn test_ensure_certificate_modes() -> Result<()> {
        let td = tempfile::tempdir()?;
        let cfg = Utf8Path::from_path(td.path()).unwrap();
        assert_eq!(ensure_certificate(cfg, "h", "", None)?, None);
        assert_eq!(ensure_certificate(cfg, "h", "off", Some(("c", "k")))?, None);
        let f = ensure_certificate(cfg, "h", "", Some(("c.pem", "/abs/k.pem")))?.unwrap();
        assert_eq!(f.cert, cfg.join("c.pem"));
        assert_eq!(f.key.as_str(), "/abs/k.pem");
        Ok(())
    }
}
