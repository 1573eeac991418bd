//! Boot Loader Specification entries for systemd-boot.

use std::fmt;

use serde::Deserialize;

/// Where the entry lives on the boot partition.
pub(crate) const ENTRY_PATH: &str = "/loader/entries/gokrazy.conf";

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub(crate) struct LoaderEntry {
    pub(crate) title: String,
    pub(crate) linux: String,
    pub(crate) options: String,
}

impl LoaderEntry {
    /// The entry booting `/vmlinuz` with the given (padded) command line.
    pub(crate) fn new(options: &str) -> Self {
        Self {
            title: "gokrazy".into(),
            linux: "/vmlinuz".into(),
            options: options.into(),
        }
    }
}

impl fmt::Display for LoaderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "title {}", self.title)?;
        writeln!(f, "linux {}", self.linux)?;
        writeln!(f, "options {}", self.options)
    }
}

#[cfg(test)]
pub(crate) fn parse(input: &str) -> anyhow::Result<LoaderEntry> {
    let mut map = std::collections::HashMap::new();
    for line in input.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = trimmed.split_once(' ') {
            // Values keep trailing whitespace; options are padded
            map.insert(key.to_string(), value.trim_start().to_string());
        }
    }
    let value = serde_json::to_value(map)?;
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_parse() -> anyhow::Result<()> {
        let e = LoaderEntry::new("console=tty1 root=/dev/sda2  ");
        let s = e.to_string();
        assert_eq!(
            s,
            "title gokrazy\nlinux /vmlinuz\noptions console=tty1 root=/dev/sda2  \n"
        );
        assert_eq!(parse(&s)?, e);
        assert!(parse("# comment\ntitle x\n").is_err());
        Ok(())
    }
}
