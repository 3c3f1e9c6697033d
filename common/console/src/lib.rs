// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The pseudo-terminal bridge between the host terminal and the container.
//!
//! The supervisor owns the pty master and proxies bytes between it and the
//! host stdin/stdout; the worker turns the slave into its controlling
//! terminal and standard streams. All supervisor-side I/O is non-blocking,
//! driven by the caller's event loop.

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{posix_openpt, ptsname_r, unlockpt, PtyMaster};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use nix::unistd::{chown, dup2, fchown, read, write, Gid, Uid};

/// Upper bound for the two proxy buffers: LINE_MAX, one line's worth of
/// bytes.
const BUFFER_SIZE: usize = 2048;

/// Outcome of a single [`Buffer::pump`] call, as seen by the event loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpStatus {
    /// The source is still usable.
    Open,
    /// The source reported EOF or a hard error and should be removed from
    /// the poller.
    Closed,
}

struct Buffer {
    len: usize,
    data: [u8; BUFFER_SIZE],
}

impl Buffer {
    fn new() -> Self {
        Self {
            len: 0,
            data: [0; BUFFER_SIZE],
        }
    }

    /// Moves bytes from `source` towards `target`.
    ///
    /// One read, then at most one write. A partial write leaves the residual
    /// bytes at the front of the buffer for the next call. The buffer never
    /// grows beyond its fixed capacity; when it is full the read returns
    /// zero, which counts as a closed source.
    fn pump(&mut self, source: RawFd, target: RawFd) -> PumpStatus {
        let mut status = PumpStatus::Open;

        match read(source, &mut self.data[self.len..]) {
            Ok(0) => status = PumpStatus::Closed,
            Ok(count) => self.len += count,
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
            Err(_) => status = PumpStatus::Closed,
        }

        if self.len > 0 {
            if let Ok(count) = write(target, &self.data[..self.len]) {
                if count > 0 {
                    self.data.copy_within(count..self.len, 0);
                    self.len -= count;
                }
            }
        }

        status
    }
}

fn set_blocking(fd: RawFd, blocking: bool) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).context("fcntl F_GETFL")?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.set(OFlag::O_NONBLOCK, !blocking);
    fcntl(fd, FcntlArg::F_SETFL(flags)).context("fcntl F_SETFL")?;
    Ok(())
}

/// Copies the window size of the terminal under `source` onto the terminal
/// under `target`. Both ioctls are best-effort.
fn forward_size(source: RawFd, target: RawFd) {
    let mut size: libc::winsize = unsafe { std::mem::zeroed() };
    // SAFETY: TIOCGWINSZ/TIOCSWINSZ only read/write the winsize struct.
    unsafe {
        if libc::ioctl(source, libc::TIOCGWINSZ, &mut size) >= 0 {
            libc::ioctl(target, libc::TIOCSWINSZ, &size);
        }
    }
}

/// Puts the terminal under `fd` into raw mode and returns the previous
/// attributes.
///
/// Raw mode is asymmetric between the two host fds: stdin keeps its original
/// output flags, stdout keeps its original input and local flags.
fn make_raw(fd: RawFd) -> Result<Termios> {
    let saved = tcgetattr(fd).context("tcgetattr")?;
    let mut raw = saved.clone();
    cfmakeraw(&mut raw);
    match fd {
        libc::STDIN_FILENO => {
            raw.output_flags = saved.output_flags;
        }
        libc::STDOUT_FILENO => {
            raw.input_flags = saved.input_flags;
            raw.local_flags = saved.local_flags;
        }
        _ => {}
    }
    tcsetattr(fd, SetArg::TCSANOW, &raw).context("tcsetattr")?;
    Ok(saved)
}

/// The console bridge. Created before `fork`; each side then completes its
/// half with [`Console::setup_master`] or [`Console::setup_slave`].
///
/// Dropping the console restores the host terminal, so every supervisor exit
/// path leaves the terminal usable.
pub struct Console {
    master: Option<PtyMaster>,
    slave_path: PathBuf,
    stdin: RawFd,
    stdout: RawFd,
    inp: Buffer,
    out: Buffer,
    saved_stdin: Option<Termios>,
    saved_stdout: Option<Termios>,
}

impl Console {
    /// Allocates the pty master and resolves its slave path.
    ///
    /// The slave is locked down to root until the worker hands it to the
    /// container user.
    pub fn open() -> Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
            .context("posix_openpt")?;
        let slave_path = PathBuf::from(ptsname_r(&master).context("ptsname")?);
        std::fs::set_permissions(&slave_path, Permissions::from_mode(0o600))
            .with_context(|| format!("chmod {}", slave_path.display()))?;
        chown(&slave_path, Some(Uid::from_raw(0)), Some(Gid::from_raw(0)))
            .with_context(|| format!("chown {}", slave_path.display()))?;
        unlockpt(&master).context("unlockpt")?;

        Ok(Self {
            master: Some(master),
            slave_path,
            stdin: libc::STDIN_FILENO,
            stdout: libc::STDOUT_FILENO,
            inp: Buffer::new(),
            out: Buffer::new(),
            saved_stdin: None,
            saved_stdout: None,
        })
    }

    /// The path of the pty slave, to be bind-mounted onto `/dev/console`.
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    pub fn stdin_fd(&self) -> RawFd {
        self.stdin
    }

    pub fn master_fd(&self) -> RawFd {
        self.master
            .as_ref()
            .expect("pty master is owned by the supervisor")
            .as_raw_fd()
    }

    /// Worker half: closes the master, makes the slave the controlling
    /// terminal and the three standard streams, owned by the container user.
    pub fn setup_slave(&mut self, uid: Uid, gid: Gid) -> Result<()> {
        drop(self.master.take());

        let slave = nix::fcntl::open(
            &self.slave_path,
            OFlag::O_RDWR,
            nix::sys::stat::Mode::empty(),
        )
        .with_context(|| format!("open {}", self.slave_path.display()))?;

        // SAFETY: TIOCSCTTY takes an integer argument and no pointers.
        let result = unsafe { libc::ioctl(slave, libc::TIOCSCTTY, 0) };
        Errno::result(result).context("ioctl TIOCSCTTY")?;

        for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            dup2(slave, fd).with_context(|| format!("dup2 console slave onto {fd}"))?;
            fchown(fd, Some(uid), Some(gid)).with_context(|| format!("fchown {fd}"))?;
        }
        Ok(())
    }

    /// Supervisor half: switches the host terminal and the master to
    /// non-blocking raw operation and records the attributes to restore.
    pub fn setup_master(&mut self) -> Result<()> {
        set_blocking(self.stdin, false)?;
        set_blocking(self.stdout, false)?;
        set_blocking(self.master_fd(), false)?;

        forward_size(self.stdout, self.master_fd());

        self.saved_stdin = Some(make_raw(self.stdin)?);
        self.saved_stdout = Some(make_raw(self.stdout)?);
        Ok(())
    }

    /// Re-forwards the host window size to the container terminal.
    pub fn forward_size(&self) {
        forward_size(self.stdout, self.master_fd());
    }

    /// Pumps host stdin towards the pty master.
    pub fn pump_input(&mut self) -> PumpStatus {
        let (source, target) = (self.stdin, self.master_fd());
        self.inp.pump(source, target)
    }

    /// Pumps the pty master towards host stdout.
    pub fn pump_output(&mut self) -> PumpStatus {
        let (source, target) = (self.master_fd(), self.stdout);
        self.out.pump(source, target)
    }

    /// Drains pending container output and puts the host terminal back into
    /// its original state. Safe to call more than once.
    pub fn restore(&mut self) {
        if let Some(master) = &self.master {
            let fd = master.as_raw_fd();
            self.out.pump(fd, self.stdout);
        }
        if let Some(attr) = self.saved_stdout.take() {
            let _ = tcsetattr(self.stdout, SetArg::TCSANOW, &attr);
        }
        if let Some(attr) = self.saved_stdin.take() {
            let _ = tcsetattr(self.stdin, SetArg::TCSANOW, &attr);
        }
        let _ = set_blocking(self.stdout, true);
        let _ = set_blocking(self.stdin, true);
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use nix::unistd::pipe;

    #[test]
    fn pump_moves_bytes() -> Result<()> {
        let (source_rd, source_wr) = pipe()?;
        let (target_rd, target_wr) = pipe()?;
        set_blocking(source_rd, false)?;

        write(source_wr, b"hello")?;

        let mut buffer = Buffer::new();
        assert_eq!(buffer.pump(source_rd, target_wr), PumpStatus::Open);
        assert_eq!(buffer.len, 0);

        let mut received = [0u8; 16];
        let count = read(target_rd, &mut received)?;
        assert_eq!(&received[..count], b"hello");
        Ok(())
    }

    #[test]
    fn pump_keeps_residual_on_failed_write() -> Result<()> {
        let (source_rd, source_wr) = pipe()?;
        write(source_wr, b"stash")?;
        set_blocking(source_rd, false)?;

        let mut buffer = Buffer::new();
        // Target fd -1 makes the write fail; bytes must stay buffered.
        assert_eq!(buffer.pump(source_rd, -1), PumpStatus::Open);
        assert_eq!(&buffer.data[..buffer.len], b"stash");

        // The next pump retries the write without losing the head.
        let (target_rd, target_wr) = pipe()?;
        assert_eq!(buffer.pump(source_rd, target_wr), PumpStatus::Open);
        let mut received = [0u8; 16];
        let count = read(target_rd, &mut received)?;
        assert_eq!(&received[..count], b"stash");
        Ok(())
    }

    #[test]
    fn pump_reports_eof() -> Result<()> {
        let (source_rd, source_wr) = pipe()?;
        nix::unistd::close(source_wr)?;
        let (_, target_wr) = pipe()?;

        let mut buffer = Buffer::new();
        assert_eq!(buffer.pump(source_rd, target_wr), PumpStatus::Closed);
        Ok(())
    }

    #[test]
    fn pump_survives_empty_nonblocking_source() -> Result<()> {
        let (source_rd, _source_wr) = pipe()?;
        set_blocking(source_rd, false)?;
        let (_, target_wr) = pipe()?;

        let mut buffer = Buffer::new();
        assert_eq!(buffer.pump(source_rd, target_wr), PumpStatus::Open);
        assert_eq!(buffer.len, 0);
        Ok(())
    }
}
