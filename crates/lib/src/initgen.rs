//! # Generating the init program
//!
//! `/gokrazy/init` is a small Go program, generated per build, which
//! supervises every installed binary. It is rendered here and compiled
//! with the [`crate::toolchain::Toolchain`].

use std::fmt::Write as _;

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;
use indoc::formatdoc;

use crate::config::Config;

/// Where the init program lives on the root filesystem.
pub const INIT_PATH: &str = "/gokrazy/init";

/// How a service is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPolicy {
    /// Started at boot
    Normal,
    /// Installed, but started only on request
    Stopped,
    /// Started once the clock is synchronized
    WaitForClock,
}

impl StartPolicy {
    fn constructor(&self) -> &'static str {
        match self {
            StartPolicy::Normal => "NewService",
            StartPolicy::Stopped => "NewStoppedService",
            StartPolicy::WaitForClock => "NewWaitForClockService",
        }
    }
}

/// One supervised binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Absolute path on the root filesystem
    pub path: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// `KEY=value` entries added to the inherited environment
    pub env: Vec<String>,
    #[allow(missing_docs)]
    pub policy: StartPolicy,
}

impl Service {
    /// The service for `import_path`, installed at `path`.
    pub fn from_config(config: &Config, import_path: &str, path: &str) -> Self {
        let pc = config.package_config(import_path);
        let policy = if pc.dont_start {
            StartPolicy::Stopped
        } else if pc.wait_for_clock {
            StartPolicy::WaitForClock
        } else {
            StartPolicy::Normal
        };
        Self {
            path: path.to_owned(),
            args: pc.command_line_flags,
            env: pc.environment,
            policy,
        }
    }
}

/// Quote `s` as a Go interpreted string literal.
fn go_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn render_service(svc: &Service) -> String {
    let mut argv = vec![go_quote(&svc.path)];
    argv.extend(svc.args.iter().map(|a| go_quote(a)));
    let mut env = vec!["os.Environ()".to_owned()];
    env.extend(svc.env.iter().map(|e| go_quote(e)));
    format!(
        "\t{{\n\t\tcmd := exec.Command({argv})\n\t\tcmd.Env = append({env})\n\t\tservices = append(services, gokrazy.{ctor}(cmd))\n\t}}\n",
        argv = argv.join(", "),
        env = env.join(", "),
        ctor = svc.policy.constructor(),
    )
}

/// Render the source of the init program. `build_timestamp` is the default
/// of a variable the linker overrides.
pub fn render(services: &[Service], build_timestamp: &str) -> String {
    let body: String = services.iter().map(render_service).collect();
    formatdoc! {r#"
        // Code generated by gokr-packer. DO NOT EDIT.

        package main

        import (
        	"log"
        	"os"
        	"os/exec"

        	"github.com/gokrazy/gokrazy"
        )

        var buildTimestamp = {ts}

        // Referenced so that an instance without services still compiles.
        var (
        	_ = os.Environ
        	_ = exec.Command
        )

        func main() {{
        	var services []*gokrazy.Service
        {body}	if err := gokrazy.Boot(buildTimestamp); err != nil {{
        		log.Fatal(err)
        	}}
        	if err := gokrazy.SuperviseServices(services); err != nil {{
        		log.Fatal(err)
        	}}
        	gokrazy.WaitForever()
        }}
    "#,
        ts = go_quote(build_timestamp),
    }
}

/// Write a buildable Go module containing the init program to `dir`.
#[context("Writing init source to {dir}")]
pub fn write_module(dir: &Utf8Path, source: &str) -> Result<()> {
    std::fs::write(dir.join("go.mod"), "module gokrazy/init\n\ngo 1.21\n")?;
    std::fs::write(dir.join("init.go"), source)?;
    Ok(())
}
