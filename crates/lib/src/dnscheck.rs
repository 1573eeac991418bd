//! Check that the instance's hostname resolves, concurrently with the build.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(10);

async fn resolve(hostname: &str) -> Result<usize> {
    let addrs = tokio::time::timeout(TIMEOUT, tokio::net::lookup_host((hostname, 0)))
        .await
        .context("Timed out")??;
    let n = addrs.count();
    anyhow::ensure!(n > 0, "No addresses");
    Ok(n)
}

/// A running lookup of `hostname`.
#[derive(Debug)]
pub(crate) struct DnsCheck {
    hostname: String,
    task: JoinHandle<Result<usize>>,
}

impl DnsCheck {
    /// Start resolving `hostname` in the background.
    pub(crate) fn spawn(hostname: &str) -> Self {
        let owned = hostname.to_owned();
        let task = tokio::spawn(async move { resolve(&owned).await });
        Self {
            hostname: hostname.to_owned(),
            task,
        }
    }

    /// Collect the result, warning if the hostname does not resolve.
    /// Returns whether it did.
    pub(crate) async fn report(self) -> bool {
        let r = match self.task.await {
            Ok(r) => r,
            Err(e) => Err(e.into()),
        };
        match r {
            Ok(n) => {
                tracing::debug!("{} resolves to {n} address(es)", self.hostname);
                true
            }
            Err(e) => {
                tracing::warn!(
                    "Looking up {}: {e:#}. Updates via --update yes will not reach the instance; \
                     make sure your DNS resolves its hostname (e.g. via mDNS or your router's \
                     DHCP leases), or set Update.Hostname to an address",
                    self.hostname
                );
                false
            }
        }
    }
}
