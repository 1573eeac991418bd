//! Kernel command line handling.
//!
//! The kernel package ships a `cmdline.txt` which is rewritten for each
//! instance: consoles are prepended, extra arguments appended, and the
//! `root=` argument replaced so the kernel finds the root partition by
//! PARTUUID instead of by device enumeration order.

use std::borrow::Cow;

use gokr_blockdev::RootSpec;

/// Spaces appended to `cmdline.txt`. The instance rewrites the command line
/// in place when switching root partitions and needs the room; this must
/// match what it expects.
pub(crate) const CMDLINE_PADDING: usize = 64;

/// Used when the kernel package has no `cmdline.txt`.
pub(crate) const DEFAULT_CMDLINE: &str =
    "root=/dev/mmcblk0p2 init=/gokrazy/init rootwait panic=10 oops=panic";

/// `root=` values which refer to the second partition by device name.
const ENUMERATED_ROOTS: &[&str] = &["/dev/mmcblk0p2", "/dev/sda2"];

/// A parsed kernel command line.
#[derive(Debug)]
pub(crate) struct Cmdline<'a>(Cow<'a, str>);

impl<'a, T: AsRef<str> + ?Sized> From<&'a T> for Cmdline<'a> {
    fn from(input: &'a T) -> Self {
        Self(Cow::Borrowed(input.as_ref()))
    }
}

impl<'a> Cmdline<'a> {
    /// Iterate the parameters, splitting on whitespace outside of double
    /// quotes.
    pub(crate) fn iter(&'a self) -> impl Iterator<Item = Parameter<'a>> + 'a {
        let mut in_quotes = false;
        self.0
            .split(move |c: char| {
                if c == '"' {
                    in_quotes = !in_quotes;
                }
                !in_quotes && c.is_ascii_whitespace()
            })
            .filter(|p| !p.is_empty())
            .map(Parameter::from)
    }

    /// The first parameter named `key`; dashes and underscores in keys are
    /// equivalent.
    pub(crate) fn find(&'a self, key: &str) -> Option<Parameter<'a>> {
        let key = ParameterKey(key);
        self.iter().find(|p| p.key == key)
    }
}

/// A parameter key; dashes and underscores compare equal.
#[derive(Debug, Eq)]
pub(crate) struct ParameterKey<'a>(&'a str);

impl PartialEq for ParameterKey<'_> {
    fn eq(&self, other: &Self) -> bool {
        let dedashed = |c: u8| if c == b'-' { b'_' } else { c };
        // Not zip(): a prefix must not compare equal
        self.0
            .bytes()
            .map(dedashed)
            .eq(other.0.bytes().map(dedashed))
    }
}

/// A single `key` or `key=value` parameter.
#[derive(Debug, Eq)]
pub(crate) struct Parameter<'a> {
    /// The parameter as written
    pub(crate) parameter: &'a str,
    pub(crate) key: ParameterKey<'a>,
    /// The value with one pair of surrounding quotes removed
    pub(crate) value: Option<&'a str>,
}

impl<'a> From<&'a str> for Parameter<'a> {
    fn from(parameter: &'a str) -> Self {
        let (key, value) = match parameter.split_once('=') {
            Some((key, value)) => {
                // Only the outermost quotes are stripped
                let value = value.strip_prefix('"').unwrap_or(value);
                let value = value.strip_suffix('"').unwrap_or(value);
                (key, Some(value))
            }
            None => (parameter, None),
        };
        Self {
            parameter,
            key: ParameterKey(key),
            value,
        }
    }
}

impl PartialEq for Parameter<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.value == other.value
    }
}

/// The `console=` argument for the configured serial console, if enabled.
fn serial_console_arg(serial_console: &str) -> Option<String> {
    match serial_console {
        "disabled" | "off" => None,
        // Historical spelling
        "UART0" => Some("console=serial0,115200".into()),
        c => Some(format!("console={c}")),
    }
}

/// Build the instance's kernel command line from the kernel package's
/// `base` command line.
pub(crate) fn compose(
    base: &str,
    serial_console: &str,
    extra_args: &[String],
    root: &RootSpec,
) -> String {
    let mut parts = vec![Cow::Borrowed("console=tty1")];
    if let Some(console) = serial_console_arg(serial_console) {
        parts.push(Cow::Owned(console));
    }
    let root_arg = root.kernel_arg();
    let base = Cmdline::from(base.trim());
    for p in base.iter() {
        let enumerated = p.key == ParameterKey("root")
            && p.value.is_some_and(|v| ENUMERATED_ROOTS.contains(&v));
        match (&root_arg, enumerated) {
            (Some(r), true) => parts.push(Cow::Owned(r.clone())),
            _ => parts.push(Cow::Borrowed(p.parameter)),
        }
    }
    parts.extend(extra_args.iter().map(|a| Cow::Borrowed(a.as_str())));
    parts.join(" ")
}

/// `cmdline` followed by [`CMDLINE_PADDING`] spaces.
pub(crate) fn pad(cmdline: &str) -> String {
    format!("{cmdline}{}", " ".repeat(CMDLINE_PADDING))
}
