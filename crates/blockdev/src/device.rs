//! Opening raw block devices for writing, elevating via `sudo` when the
//! current user lacks permission.

use std::fs::{File, OpenOptions};
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::process::Stdio;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use rustix::net::{
    AddressFamily, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, SocketFlags, SocketType,
};

/// Set in the environment of the privileged helper; names the file
/// descriptor on which the opened device is sent back.
pub const FD_ENV: &str = "GOKR_PACKER_FD";

/// Arguments which make our own binary act as the privileged helper.
pub const HELPER_ARGS: &[&str] = &["internals", "open-device", "--device"];

/// When to escalate privileges to open a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SudoPolicy {
    /// Only when opening fails with a permission error
    #[default]
    Auto,
    /// Always open through `sudo`
    Always,
    /// Never; permission errors are fatal
    Never,
}

impl FromStr for SudoPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            o => Err(anyhow!("Invalid sudo policy {o:?}: expected auto, always or never")),
        }
    }
}

fn open_rw(dev: &Utf8Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).open(dev)
}

fn is_permission_error(e: &std::io::Error) -> bool {
    matches!(
        rustix::io::Errno::from_io_error(e),
        Some(rustix::io::Errno::ACCESS | rustix::io::Errno::PERM)
    )
}

fn setfacl_hint(dev: &Utf8Path) -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "$USER".into());
    format!("to grant access to your user, run: sudo setfacl -m u:{user}:rw {dev}")
}

/// Open `dev` for reading and writing.
#[context("Opening {dev}")]
pub fn open_device(dev: &Utf8Path, sudo: SudoPolicy) -> Result<File> {
    if sudo == SudoPolicy::Always {
        return open_device_elevated(dev);
    }
    match open_rw(dev) {
        Ok(f) => Ok(f),
        Err(e) if is_permission_error(&e) => {
            if sudo == SudoPolicy::Never {
                return Err(e).context(setfacl_hint(dev));
            }
            tracing::warn!("Permission denied; {}", setfacl_hint(dev));
            tracing::info!("Escalating privileges via sudo to open {dev}");
            open_device_elevated(dev)
        }
        Err(e) => Err(e.into()),
    }
}

/// Ask the kernel to re-read the partition table of a block device.
/// Non-block files are left alone.
pub fn reread_partitions(fd: BorrowedFd<'_>) -> Result<()> {
    let st = rustix::fs::fstat(fd)?;
    if rustix::fs::FileType::from_raw_mode(st.st_mode) != rustix::fs::FileType::BlockDevice {
        tracing::trace!("Not a block device; skipping partition re-read");
        return Ok(());
    }
    const BLKRRPART: libc::c_ulong = 0x125f;
    use std::os::fd::AsRawFd;
    // SAFETY: BLKRRPART takes no argument and the descriptor is valid for
    // the duration of the borrow.
    #[allow(unsafe_code)]
    let r = unsafe { libc::ioctl(fd.as_raw_fd(), BLKRRPART as _) };
    if r != 0 {
        return Err(std::io::Error::last_os_error()).context("BLKRRPART");
    }
    Ok(())
}

/// Spawn ourselves under `sudo` and receive the opened device over a
/// socket.
#[context("Opening {dev} via sudo")]
fn open_device_elevated(dev: &Utf8Path) -> Result<File> {
    let (ours, theirs) = rustix::net::socketpair(
        AddressFamily::UNIX,
        SocketType::STREAM,
        SocketFlags::CLOEXEC,
        None,
    )?;
    let mut args: Vec<&str> = HELPER_ARGS.to_vec();
    args.push(dev.as_str());
    let mut cmd =
        gokr_utils::reexec::self_command(&["sudo", "--preserve-env"], FD_ENV, "1", args)?;
    cmd.stdout(Stdio::from(theirs));
    let mut child = cmd.spawn().context("Spawning privileged helper")?;
    // Only the child may hold the other end, so that its exit is an EOF here
    drop(cmd);

    let received = receive_fd(ours.as_fd());
    let status = child.wait()?;
    if !status.success() {
        anyhow::bail!("Privileged helper failed: {status}");
    }
    Ok(File::from(received?))
}

fn receive_fd(sock: BorrowedFd<'_>) -> Result<OwnedFd> {
    let mut payload = [0u8; 1];
    let mut space = [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut cmsg = RecvAncillaryBuffer::new(&mut space);
    rustix::net::recvmsg(
        sock,
        &mut [IoSliceMut::new(&mut payload)],
        &mut cmsg,
        RecvFlags::CMSG_CLOEXEC,
    )
    .context("Receiving device descriptor")?;
    let mut fds = Vec::new();
    for msg in cmsg.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = msg {
            fds.extend(rights);
        }
    }
    fds.into_iter()
        .next()
        .ok_or_else(|| anyhow!("Privileged helper did not send a file descriptor"))
}

fn send_fd(sock: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<()> {
    let fds = [fd];
    let mut space = [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut cmsg = SendAncillaryBuffer::new(&mut space);
    anyhow::ensure!(
        cmsg.push(SendAncillaryMessage::ScmRights(&fds)),
        "Ancillary buffer too small"
    );
    rustix::net::sendmsg(sock, &[IoSlice::new(&[0u8])], &mut cmsg, SendFlags::empty())
        .context("Sending device descriptor")?;
    Ok(())
}

/// Entrypoint of the privileged helper: open the device, re-read its
/// partition table and pass the descriptor to the parent over stdout.
#[context("Serving descriptor for {dev}")]
pub fn serve_device_fd(dev: &Utf8Path) -> Result<()> {
    if std::env::var_os(FD_ENV).is_none() {
        anyhow::bail!("This command should only be invoked as a privileged helper");
    }
    let f = open_rw(dev)?;
    if let Err(e) = reread_partitions(f.as_fd()) {
        tracing::warn!("Re-reading partition table of {dev}: {e:#}");
    }
    let stdout = std::io::stdout();
    send_fd(stdout.as_fd(), f.as_fd())
}
