//! Helpers intended for [`std::process::Command`] and related structures.

use std::ffi::OsStr;
use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result};

/// How many bytes of stderr to include in an error message.
const MAX_STDERR_BYTES: usize = 4096;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, inheriting stdout and capturing stderr.
    /// On failure the error contains the command line, the exit status and
    /// the tail of stderr.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process and return its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T>;

    /// Render the command line (including environment overrides) in a form
    /// that can be pasted into a POSIX shell.
    fn to_string_pretty(&self) -> String;
}

fn quote(s: &OsStr) -> String {
    let s = s.to_string_lossy();
    match shlex::try_quote(&s) {
        Ok(q) => q.into_owned(),
        Err(_) => s.into_owned(),
    }
}

fn check_output(cmd: &Command, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    let start = stderr.len().saturating_sub(MAX_STDERR_BYTES);
    // Keep the cut on a character boundary
    let start = (start..stderr.len())
        .find(|&i| stderr.is_char_boundary(i))
        .unwrap_or(stderr.len());
    anyhow::bail!(
        "{} failed: {}: {}",
        cmd.to_string_pretty(),
        output.status,
        &stderr[start..]
    )
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        tracing::trace!("exec: {}", self.to_string_pretty());
        let output = self
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {}", self.to_string_pretty()))?;
        check_output(self, &output)
    }

    fn run_get_string(&mut self) -> Result<String> {
        tracing::trace!("exec: {}", self.to_string_pretty());
        let output = self
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {}", self.to_string_pretty()))?;
        check_output(self, &output)?;
        String::from_utf8(output.stdout)
            .with_context(|| format!("Parsing output of {}", self.to_string_pretty()))
    }

    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let s = self.run_get_string()?;
        serde_json::from_str(&s)
            .with_context(|| format!("Parsing JSON from {}", self.to_string_pretty()))
    }

    fn to_string_pretty(&self) -> String {
        let envs = self.get_envs().filter_map(|(k, v)| {
            v.map(|v| format!("{}={}", k.to_string_lossy(), quote(v)))
        });
        let program = std::iter::once(quote(self.get_program()));
        let args = self.get_args().map(quote);
        envs.chain(program)
            .chain(args)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ok() -> Result<()> {
        Command::new("true").run_capture_stderr()?;
        let s = Command::new("echo").arg("hello").run_get_string()?;
        assert_eq!(s, "hello\n");
        Ok(())
    }

    #[test]
    fn test_run_failure_includes_stderr() {
        let e = Command::new("/bin/sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .run_capture_stderr()
            .unwrap_err();
        let msg = format!("{e:#}");
        assert!(msg.contains("oops"), "{msg}");
        assert!(msg.contains("/bin/sh -c"), "{msg}");
    }

    #[test]
    fn test_parse_json() -> Result<()> {
        let v: Vec<u32> = Command::new("echo")
            .arg("[1, 2, 3]")
            .run_and_parse_json()?;
        assert_eq!(v, [1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_to_string_pretty() {
        let mut cmd = Command::new("go");
        cmd.env("GOARCH", "arm64")
            .args(["build", "-ldflags", "-X main.buildTimestamp=now"]);
        similar_asserts::assert_eq!(
            cmd.to_string_pretty(),
            "GOARCH=arm64 go build -ldflags '-X main.buildTimestamp=now'"
        );
    }
}
