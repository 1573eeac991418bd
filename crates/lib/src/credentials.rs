//! Per-instance credentials kept in the configuration directory.
//!
//! ```text
//! <config-dir>/http-password.txt          shared by all instances
//! <config-dir>/hosts/<hostname>/http-password.txt
//! <config-dir>/hosts/<hostname>/cert.pem  see crate::cert
//! <config-dir>/hosts/<hostname>/key.pem
//! ```

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::{Dir, Permissions, PermissionsExt};
use cap_std_ext::prelude::CapStdExtDirExt;
use fn_error_context::context;
use rand::distr::Alphanumeric;
use rand::Rng;

pub(crate) const PASSWORD_FILE: &str = "http-password.txt";
const PASSWORD_LEN: usize = 20;

/// The directory holding the credentials of `hostname`.
pub(crate) fn host_dir(config_dir: &Utf8Path, hostname: &str) -> Utf8PathBuf {
    config_dir.join("hosts").join(hostname)
}

/// Atomically write a file only the current user may read.
#[context("Writing {dir}/{name}")]
pub(crate) fn write_private(dir: &Utf8Path, name: &str, contents: &[u8]) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let d = Dir::open_ambient_dir(dir, cap_std::ambient_authority())?;
    d.atomic_write_with_perms(name, contents, Permissions::from_mode(0o600))?;
    Ok(())
}

fn read_password(path: &Utf8Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim_end().to_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context(format!("Reading {path}"))),
    }
}

fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// The web interface password of `hostname`: the configured one, else the
/// per-host file, else the shared file, else a new random password which
/// is persisted to the per-host file.
#[context("Determining password for {hostname}")]
pub(crate) fn ensure_password(
    config_dir: &Utf8Path,
    hostname: &str,
    configured: Option<&str>,
) -> Result<String> {
    if let Some(pw) = configured.filter(|p| !p.is_empty()) {
        return Ok(pw.to_owned());
    }
    let dir = host_dir(config_dir, hostname);
    for path in [dir.join(PASSWORD_FILE), config_dir.join(PASSWORD_FILE)] {
        if let Some(pw) = read_password(&path)?.filter(|p| !p.is_empty()) {
            tracing::debug!("Using password from {path}");
            return Ok(pw);
        }
    }
    let pw = generate_password();
    // No trailing newline, so the file can be piped to a clipboard
    write_private(&dir, PASSWORD_FILE, pw.as_bytes())
        .context("Storing generated password")?;
    tracing::info!("Generated password for {hostname}, stored in {dir}/{PASSWORD_FILE}");
    Ok(pw)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt as _;

    use super::*;

    #[test]
    fn test_password_lookup_order() -> Result<()> {
        let td = tempfile::tempdir()?;
        let cfg = Utf8Path::from_path(td.path()).unwrap();

        assert_eq!(ensure_password(cfg, "pi", Some("configured"))?, "configured");

        let generated = ensure_password(cfg, "pi", None)?;
        assert_eq!(generated.len(), PASSWORD_LEN);
        assert!(generated.chars().all(|c| c.is_ascii_alphanumeric()));
        let stored = host_dir(cfg, "pi").join(PASSWORD_FILE);
        assert_eq!(std::fs::read_to_string(&stored)?, generated);
        let mode = std::fs::metadata(&stored)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(ensure_password(cfg, "pi", None)?, generated);

        std::fs::write(cfg.join(PASSWORD_FILE), "shared\n")?;
        assert_eq!(ensure_password(cfg, "other", None)?, "shared");
        assert_eq!(ensure_password(cfg, "pi", None)?, generated);
        Ok(())
    }
}
