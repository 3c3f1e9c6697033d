// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The supervisor event loop.
//!
//! After the fork the parent sits in `epoll_wait` on exactly three file
//! descriptors: a signalfd carrying the blocked lifecycle signals, host
//! stdin, and the pty master. Signals are consumed as ordinary reads inside
//! the loop rather than through async handlers, which keeps the whole
//! lifecycle in one place.

use std::convert::Infallible;
use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::{bail, Context, Result};
use console::{Console, PumpStatus};
use container::Tracker;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::sys::signal::{sigprocmask, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SigSet, SignalFd};

fn poll_add(epoll: RawFd, fd: RawFd) -> Result<()> {
    let mut event = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, fd as u64);
    epoll_ctl(epoll, EpollOp::EpollCtlAdd, fd, Some(&mut event)).context("epoll_ctl EPOLL_CTL_ADD")
}

fn poll_del(epoll: RawFd, fd: RawFd) -> Result<()> {
    epoll_ctl(epoll, EpollOp::EpollCtlDel, fd, None).context("epoll_ctl EPOLL_CTL_DEL")
}

/// Runs the supervisor until the worker exits or a termination signal
/// arrives, then tears down and exits the process.
///
/// Teardown kills everything in the tracking cgroup first and restores the
/// host terminal last, so the final drain sees all buffered output.
pub fn run(mut console: Console, tracker: Tracker) -> Result<Infallible> {
    let mut mask = SigSet::empty();
    for signal in [Signal::SIGCHLD, Signal::SIGINT, Signal::SIGTERM, Signal::SIGWINCH] {
        mask.add(signal);
    }
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None).context("sigprocmask")?;

    let mut signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .context("signalfd")?;

    let epoll = epoll_create1(EpollCreateFlags::empty()).context("epoll_create1")?;
    let signal_fd = signals.as_raw_fd();
    let stdin_fd = console.stdin_fd();
    let master_fd = console.master_fd();
    for fd in [signal_fd, stdin_fd, master_fd] {
        poll_add(epoll, fd)?;
    }

    loop {
        let mut events = [EpollEvent::empty(); 16];
        let count = epoll_wait(epoll, &mut events, -1).context("epoll_wait")?;
        let ready = &events[..count];

        // Signals first: a SIGCHLD-driven teardown must run before any more
        // data is pumped, so the restore drain is the last transfer.
        for event in ready {
            if event.data() == signal_fd as u64 {
                handle_signal(&mut signals, &mut console, &tracker)?;
            }
        }
        for event in ready {
            if event.data() == stdin_fd as u64 && console.pump_input() == PumpStatus::Closed {
                poll_del(epoll, stdin_fd)?;
            }
            if event.data() == master_fd as u64 && console.pump_output() == PumpStatus::Closed {
                poll_del(epoll, master_fd)?;
            }
        }
    }
}

/// Consumes one pending signal and reacts to it. Termination signals do not
/// return.
fn handle_signal(signals: &mut SignalFd, console: &mut Console, tracker: &Tracker) -> Result<()> {
    let Some(info) = signals.read_signal().context("read signalfd")? else {
        bail!("read signalfd: no signal pending");
    };

    match info.ssi_signo as libc::c_int {
        libc::SIGWINCH => console.forward_size(),
        signo @ (libc::SIGCHLD | libc::SIGINT | libc::SIGTERM) => {
            let status = if signo == libc::SIGCHLD {
                info.ssi_status
            } else {
                libc::EXIT_FAILURE
            };
            tracker.kill_all()?;
            console.restore();
            std::process::exit(status);
        }
        _ => {}
    }
    Ok(())
}
