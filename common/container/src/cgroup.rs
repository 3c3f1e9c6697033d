// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cgroup plumbing: the named tracking cgroup used to find and kill every
//! container process, and the per-run controller hierarchies backing
//! `--cgroup.*` rules.

use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::mount::MsFlags;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{getpid, Pid};
use tracing::warn;

use crate::config::CgroupRule;
use crate::mounts::{self, MountSpec};

const TRACKER_ROOT: &str = "/sys/fs/cgroup/boxer";

/// Process bookkeeping through a private named cgroup.
///
/// The supervisor enrols itself once; every process it forks, including the
/// whole container, inherits membership. The cgroup carries no resource
/// controllers, it exists purely so the `tasks` file enumerates all
/// descendants.
pub struct Tracker {
    tasks: PathBuf,
}

impl Tracker {
    /// Mounts the shared `name=boxer` cgroup if needed, creates the per-run
    /// hierarchy and enrols the calling process.
    pub fn new(run_id: &str) -> Result<Self> {
        let base = Path::new(TRACKER_ROOT);
        if !base.exists() {
            mounts::apply(
                &MountSpec::filesystem(
                    "cgroup",
                    "cgroup",
                    Some("none,name=boxer,xattr"),
                    MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
                )
                .at(base),
                Path::new("/"),
                None,
            )?;
        }

        let hierarchy = base.join(run_id);
        fileutil::create_all(&hierarchy)?;

        let tasks = hierarchy.join("tasks");
        fileutil::write_existing(&tasks, format!("{}\n", getpid()))?;
        Ok(Self { tasks })
    }

    /// Kills every process in the tracking cgroup except the caller.
    ///
    /// Loops until a full pass over the `tasks` file kills nothing, with a
    /// 100 ms pause between passes. A process may fork between the read and
    /// the kill; its child shows up in the next pass. Afterwards all
    /// reapable children are drained so no zombies outlive the supervisor.
    pub fn kill_all(&self) -> Result<()> {
        let myself = getpid();
        loop {
            let tasks = std::fs::read_to_string(&self.tasks)
                .with_context(|| format!("read {}", self.tasks.display()))?;

            let mut killed = 0;
            for line in tasks.lines() {
                let pid: i32 = line
                    .trim()
                    .parse()
                    .with_context(|| format!("failed to read all pids: {line:?}"))?;
                let pid = Pid::from_raw(pid);
                if pid == myself {
                    continue;
                }
                killed += 1;
                if let Err(err) = kill(pid, Signal::SIGKILL) {
                    warn!("kill {}: {}", pid, err);
                }
            }
            if killed == 0 {
                break;
            }
            sleep(Duration::from_millis(100));
        }

        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(status) if status.pid().is_some() => continue,
                _ => break,
            }
        }
        Ok(())
    }
}

/// Applies `--cgroup.SUBSYSTEM.PARAMETER=VALUE` rules for the calling
/// process.
///
/// Runs in the worker after `chroot`, over the fresh tmpfs at
/// `/sys/fs/cgroup`, so the container sees its own controller hierarchies.
pub fn apply_rules(rules: &[CgroupRule], run_id: &str) -> Result<()> {
    let pid = getpid();
    for rule in rules {
        let subsystem = PathBuf::from(format!("/sys/fs/cgroup/{}", rule.subsystem));
        let hierarchy = subsystem.join("boxer").join(run_id);
        let parameter = hierarchy.join(format!("{}.{}", rule.subsystem, rule.parameter));
        let tasks = hierarchy.join("tasks");

        if !subsystem.exists() {
            mounts::apply(
                &MountSpec::filesystem(
                    "cgroup",
                    "cgroup",
                    Some(rule.subsystem.as_str()),
                    MsFlags::empty(),
                )
                .at(&subsystem),
                Path::new("/"),
                None,
            )?;
        }

        fileutil::create_all(&hierarchy)?;
        fileutil::write_existing(&parameter, format!("{}\n", rule.value))?;
        fileutil::write_existing(&tasks, format!("{}\n", pid))?;
    }
    Ok(())
}
