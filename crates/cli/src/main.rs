//! The main entrypoint for gokr-packer, which just performs global
//! initialization, and then calls out into the library.

use std::io::Write;

use anyhow::Result;
use owo_colors::OwoColorize;

/// The code called after we've done process global init and created
/// an async runtime.
async fn async_main() -> Result<()> {
    gokr_utils::initialize_tracing();
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    gokr_packer_lib::cli::run_from_iter(std::env::args()).await
}

/// Create an async runtime and do the rest of the work there.
fn run() -> Result<()> {
    // Update streaming and the DNS check are the only concurrent work
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .build()?;
    runtime.block_on(async_main())
}

fn main() {
    // In order to print the error in a custom format (with :#) our
    // main simply invokes a run() where all the work is done.
    // This code just captures any errors.
    if let Err(e) = run() {
        let mut stderr = anstream::stderr();
        // Don't make this fatal
        let _ = writeln!(stderr, "{}{:#}", "error: ".red(), e);
        std::process::exit(1);
    }
}
