//! # Compiling packages
//!
//! The [`Toolchain`] trait is the seam between the packer and the Go
//! toolchain; tests substitute an implementation which writes canned
//! executables.

use std::collections::BTreeMap;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use gokr_utils::CommandRunExt;

use crate::config::PackageConfig;

/// Build tags of the init program.
pub const INIT_TAGS: &str = "gokrazy,netgo,osusergo";

/// A package which builds an executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainPackage {
    /// Import path of the package
    pub import_path: String,
    /// File name of the executable
    pub target: String,
}

/// Build all `packages` into `bindir`.
#[derive(Debug)]
pub struct BuildRequest<'a> {
    /// Output directory; each binary is named after its [`MainPackage::target`]
    pub bindir: &'a Utf8Path,
    /// Packages to build
    pub packages: &'a [MainPackage],
    /// Per-package flags, tags and environment
    pub package_config: &'a BTreeMap<String, PackageConfig>,
    /// `KEY=value` build environment
    pub env: &'a [String],
    /// Packages which are listed but must not be built
    pub no_build: &'a [String],
}

/// Builds executables for the target.
pub trait Toolchain: Send + Sync {
    /// Build every package of the request.
    fn build(&self, req: &BuildRequest<'_>) -> Result<()>;
    /// Filter `packages` down to those which build an executable.
    fn main_packages(&self, packages: &[String]) -> Result<Vec<MainPackage>>;
    /// The source directory of a (non-main) package, e.g. the kernel.
    fn package_dir(&self, package: &str) -> Result<Utf8PathBuf>;
    /// Compile the generated init program in `source_dir` to `output`.
    fn build_init(
        &self,
        source_dir: &Utf8Path,
        output: &Utf8Path,
        build_timestamp: &str,
    ) -> Result<()>;
    /// Build metadata embedded in `binary`, as printed by `go version -m`.
    fn build_info(&self, binary: &Utf8Path) -> Result<String>;
}

/// The `go` command.
#[derive(Debug, Clone)]
pub struct GoToolchain {
    go: String,
    env: Vec<String>,
}

impl GoToolchain {
    /// A toolchain targeting the `GOOS`/`GOARCH` in `env`.
    pub fn new(env: Vec<String>) -> Self {
        let go = std::env::var("GO").unwrap_or_else(|_| "go".into());
        Self { go, env }
    }

    fn command(&self) -> Command {
        let mut c = Command::new(&self.go);
        c.env("CGO_ENABLED", "0");
        for kv in &self.env {
            if let Some((k, v)) = kv.split_once('=') {
                c.env(k, v);
            }
        }
        c
    }

    fn build_one(&self, req: &BuildRequest<'_>, pkg: &MainPackage) -> Result<()> {
        let cfg = req
            .package_config
            .get(&pkg.import_path)
            .cloned()
            .unwrap_or_default();
        let mut c = self.command();
        for kv in &cfg.go_build_environment {
            if let Some((k, v)) = kv.split_once('=') {
                c.env(k, v);
            }
        }
        c.args(["build", "-trimpath", "-o"]).arg(req.bindir.join(&pkg.target));
        c.args(&cfg.go_build_flags);
        if !cfg.go_build_tags.is_empty() {
            c.arg(format!("-tags={}", cfg.go_build_tags.join(",")));
        }
        c.arg(&pkg.import_path);
        c.log_debug()
            .run_capture_stderr()
            .with_context(|| format!("Building {}", pkg.import_path))
    }
}

impl Toolchain for GoToolchain {
    #[context("Building packages")]
    fn build(&self, req: &BuildRequest<'_>) -> Result<()> {
        let todo: Vec<&MainPackage> = req
            .packages
            .iter()
            .filter(|p| !req.no_build.contains(&p.import_path))
            .collect();
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(todo.len().max(1));
        let next = AtomicUsize::new(0);
        let errors = Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(pkg) = todo.get(i) else {
                        break;
                    };
                    if let Err(e) = self.build_one(req, pkg) {
                        if let Ok(mut errors) = errors.lock() {
                            errors.push(e);
                        }
                    }
                });
            }
        });
        let errors = errors.into_inner().unwrap_or_default();
        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    #[context("Listing main packages")]
    fn main_packages(&self, packages: &[String]) -> Result<Vec<MainPackage>> {
        if packages.is_empty() {
            return Ok(Vec::new());
        }
        let out = self
            .command()
            .args(["list", "-f", "{{.Name}} {{.ImportPath}}"])
            .args(packages)
            .run_get_string()?;
        Ok(out
            .lines()
            .filter_map(|l| l.strip_prefix("main "))
            .map(|import_path| MainPackage {
                import_path: import_path.to_owned(),
                target: import_path
                    .rsplit('/')
                    .next()
                    .unwrap_or(import_path)
                    .to_owned(),
            })
            .collect())
    }

    #[context("Locating package {package}")]
    fn package_dir(&self, package: &str) -> Result<Utf8PathBuf> {
        let out = self
            .command()
            .args(["list", "-f", "{{.Dir}}", package])
            .run_get_string()?;
        let dir = out.trim();
        anyhow::ensure!(!dir.is_empty(), "go list returned no directory");
        Ok(dir.into())
    }

    #[context("Building init")]
    fn build_init(
        &self,
        source_dir: &Utf8Path,
        output: &Utf8Path,
        build_timestamp: &str,
    ) -> Result<()> {
        self.command()
            .args(["mod", "tidy"])
            .current_dir(source_dir)
            .log_debug()
            .run_capture_stderr()?;
        self.command()
            .args(["build", "-trimpath", "-o"])
            .arg(output)
            .arg(format!("-tags={INIT_TAGS}"))
            .arg("-ldflags")
            .arg(format!("-X main.buildTimestamp={build_timestamp}"))
            .arg(".")
            .current_dir(source_dir)
            .log_debug()
            .run_capture_stderr()
    }

    #[context("Reading build info of {binary}")]
    fn build_info(&self, binary: &Utf8Path) -> Result<String> {
        self.command()
            .args(["version", "-m"])
            .arg(binary)
            .run_get_string()
    }
}
