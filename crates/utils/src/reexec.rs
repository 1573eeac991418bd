use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Command;

use anyhow::Result;

/// Environment variable holding a reference to our original binary
pub const ORIG: &str = "_GOKR_PACKER_ORIG_EXE";

/// Return the path to our own executable. If we were re-executed from a
/// temporary copy, this environment variable will hold the path to the
/// original binary.
pub fn executable_path() -> Result<PathBuf> {
    if let Some(p) = std::env::var_os(ORIG) {
        Ok(p.into())
    } else {
        std::env::current_exe().map_err(Into::into)
    }
}

/// Construct (but do not spawn) a command which runs this executable again,
/// optionally behind a prefix such as `sudo --preserve-env`, with the guard
/// environment variable `k` set to `v` and the given arguments.
pub fn self_command<S: AsRef<OsStr>>(
    prefix_args: &[&str],
    k: &str,
    v: &str,
    args: impl IntoIterator<Item = S>,
) -> Result<Command> {
    let self_exe = executable_path()?;
    let mut prefix_args = prefix_args.iter();
    let mut cmd = if let Some(p) = prefix_args.next() {
        let mut c = Command::new(p);
        c.args(prefix_args);
        c.arg(self_exe);
        c
    } else {
        Command::new(self_exe)
    };
    cmd.env(k, v);
    cmd.args(args);
    tracing::debug!("Re-executing current process for {k}");
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_command_prefix() -> Result<()> {
        let cmd = self_command(&["sudo", "--preserve-env"], "GUARD", "1", ["a", "b"])?;
        assert_eq!(cmd.get_program(), "sudo");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args[0], "--preserve-env");
        assert_eq!(&args[2..], ["a", "b"]);
        let envs: Vec<_> = cmd.get_envs().collect();
        assert_eq!(envs, [(OsStr::new("GUARD"), Some(OsStr::new("1")))]);
        Ok(())
    }
}
