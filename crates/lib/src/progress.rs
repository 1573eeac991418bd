//! Terminal progress for long running writes.

use std::borrow::Cow;
use std::time::Duration;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};

const BYTES_TEMPLATE: &str =
    "{msg:>12} [{elapsed_precise}] {bar:40.cyan/blue} {bytes:>10}/{total_bytes:10} {bytes_per_sec}";

/// A bar counting `len` bytes. The bar is hidden when stderr is not a
/// terminal.
pub(crate) fn bytes_bar(len: u64, msg: impl Into<Cow<'static, str>>) -> Result<ProgressBar> {
    let style = ProgressStyle::with_template(BYTES_TEMPLATE)?.progress_chars("#>.");
    let pb = ProgressBar::new(len).with_style(style).with_message(msg);
    pb.enable_steady_tick(Duration::from_millis(200));
    Ok(pb)
}

/// A spinner for waits of unknown length.
pub(crate) fn spinner(msg: impl Into<Cow<'static, str>>) -> ProgressBar {
    let pb = ProgressBar::new_spinner().with_message(msg);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
