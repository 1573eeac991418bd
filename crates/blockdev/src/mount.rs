use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Whether `source` names `dev` itself or one of its partitions, i.e.
/// `/dev/sdb`, `/dev/sdb1` or `/dev/mmcblk0p1` for `/dev/mmcblk0`.
fn is_partition_of(source: &str, dev: &str) -> bool {
    let Some(rest) = source.strip_prefix(dev) else {
        return false;
    };
    let rest = rest.strip_prefix('p').unwrap_or(rest);
    rest.chars().all(|c| c.is_ascii_digit())
}

/// Return the `(source, target)` pairs of a mount table which refer to
/// `dev` or its partitions.
pub fn mounted_partitions(mounts: &str, dev: &str) -> Vec<(String, String)> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_ascii_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            is_partition_of(source, dev).then(|| (source.to_owned(), target.to_owned()))
        })
        .collect()
}

/// Fail if any partition of `dev` is currently mounted.
#[context("Checking mounts of {dev}")]
pub fn ensure_not_mounted(dev: &Utf8Path) -> Result<()> {
    let mounts = std::fs::read_to_string(PROC_MOUNTS).with_context(|| format!("Reading {PROC_MOUNTS}"))?;
    let mounted = mounted_partitions(&mounts, dev.as_str());
    if mounted.is_empty() {
        return Ok(());
    }
    let list = mounted
        .iter()
        .map(|(s, t)| format!("{s} on {t}"))
        .collect::<Vec<_>>()
        .join(", ");
    anyhow::bail!("Device {dev} is currently mounted ({list}); unmount it first")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = indoc::indoc! {r#"
        proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
        /dev/nvme0n1p2 / ext4 rw,relatime 0 0
        /dev/sdb1 /media/boot vfat rw,relatime 0 0
        /dev/sdb10 /media/x ext4 rw 0 0
        /dev/sdbb1 /media/y ext4 rw 0 0
        /dev/mmcblk0p4 /media/perm ext4 rw 0 0
    "#};

    #[test]
    fn test_mounted_partitions() {
        let m = mounted_partitions(MOUNTS, "/dev/sdb");
        assert_eq!(
            m,
            [
                ("/dev/sdb1".to_string(), "/media/boot".to_string()),
                ("/dev/sdb10".to_string(), "/media/x".to_string())
            ]
        );
        let m = mounted_partitions(MOUNTS, "/dev/mmcblk0");
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].1, "/media/perm");
        assert!(mounted_partitions(MOUNTS, "/dev/sdc").is_empty());
        assert!(mounted_partitions(MOUNTS, "/dev/nvme0n1").len() == 1);
    }

    #[test]
    fn test_ensure_not_mounted_unknown_device() {
        ensure_not_mounted(Utf8Path::new("/dev/gokr-does-not-exist")).unwrap();
    }
}
