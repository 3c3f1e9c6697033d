// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Root filesystem assembly and the final steps of becoming the container
//! process. Everything here runs in the worker, inside the fresh namespaces
//! and before `execv`.

use std::convert::Infallible;
use std::ffi::CString;
use std::fs::Permissions;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::libc;
use nix::mount::MsFlags;
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, chown, chroot, execv, sethostname, setgid, setuid, Uid};
use tracing::info;

use crate::cgroup;
use crate::config::{rebase, Config};
use crate::mounts::{self, MountSpec, SYSTEM_DEVICES};
use crate::rlimit;

/// Assembles the container root filesystem and enters it.
///
/// The order is load-bearing: the root must be private before anything is
/// mounted, the image copy must precede the system mounts so they can be
/// skipped in its favor, the console bind needs the device nodes, and the
/// cgroup rules must be applied after `chroot` so the container sees its own
/// controller hierarchies under `/sys/fs/cgroup`.
pub fn setup(config: &Config, console: Option<&Path>, run_id: &str) -> Result<()> {
    let root = &config.root;
    fileutil::create_all(root)?;

    // Do not propagate mounts to or from the real root.
    mounts::apply(
        &MountSpec {
            source: None,
            fstype: None,
            target: Some(PathBuf::from("/")),
            data: None,
            flags: MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        },
        root,
        None,
    )?;

    mounts::apply(
        &MountSpec::filesystem("tmpfs", "tmpfs", Some("size=512"), MsFlags::MS_NOSUID).at(root),
        root,
        None,
    )?;

    if let Some(image) = &config.image {
        info!(
            "Creating a copy of {} as root filesystem in {}",
            image.display(),
            root.display()
        );
        fileutil::sync(image, root)?;
    }

    if let Some(host) = &config.host {
        sethostname(host).context("sethostname")?;
    }
    if let Some(domain) = &config.domain {
        // SAFETY: setdomainname reads exactly `len` bytes from the pointer.
        let result =
            unsafe { libc::setdomainname(domain.as_ptr() as *const libc::c_char, domain.len()) };
        Errno::result(result).context("setdomainname")?;
    }

    for spec in mounts::system_mounts() {
        mounts::apply(&spec, root, config.image.as_deref())?;
    }

    {
        let saved = umask(Mode::empty());
        let _restore = scopeguard::guard(saved, |mode| {
            umask(mode);
        });
        for device in SYSTEM_DEVICES {
            mounts::apply_device(device, root)?;
        }
    }

    for bind in &config.binds {
        mounts::apply(bind, root, None)?;
    }

    let ptmx = rebase(root, Path::new("/dev/ptmx"));
    symlink("pts/ptmx", &ptmx).with_context(|| format!("symlink pts/ptmx {}", ptmx.display()))?;
    let pts_ptmx = rebase(root, Path::new("/dev/pts/ptmx"));
    std::fs::set_permissions(&pts_ptmx, Permissions::from_mode(0o666))
        .with_context(|| format!("chmod {}", pts_ptmx.display()))?;

    if let Some(console) = console {
        mounts::apply(
            &MountSpec::bind(console, MsFlags::empty()).at(rebase(root, Path::new("/dev/console"))),
            root,
            None,
        )?;
    }

    info!("Entering container");
    chroot(root).context("chroot")?;
    chdir("/").context("chdir /")?;

    for (target, link) in [
        ("/proc/self/fd", "/dev/fd"),
        ("/proc/self/fd/0", "/dev/stdin"),
        ("/proc/self/fd/1", "/dev/stdout"),
        ("/proc/self/fd/2", "/dev/stderr"),
    ] {
        symlink(target, link).with_context(|| format!("symlink {link}"))?;
    }

    for dir in [&config.home, &config.work] {
        if !dir.exists() {
            fileutil::create_all(dir)?;
            chown(dir.as_path(), Some(config.user.uid), Some(config.user.gid))
                .with_context(|| format!("chown {}", dir.display()))?;
        }
    }

    info!("Changing working directory to {}", config.work.display());
    chdir(&config.work).with_context(|| format!("chdir {}", config.work.display()))?;

    cgroup::apply_rules(&config.cgroups, run_id)?;
    rlimit::apply(&config.rlimits)?;

    umask(Mode::from_bits_truncate(0o022));
    Ok(())
}

/// Drops root privileges and asserts they cannot be regained.
///
/// For a root container user there is nothing to drop, so the regain check
/// is skipped; for everyone else a succeeding `setuid(0)` afterwards means
/// the drop did not take and the worker must not exec.
pub fn drop_privileges(config: &Config) -> Result<()> {
    setgid(config.user.gid).context("setgid")?;
    setuid(config.user.uid).context("setuid")?;
    if !config.user.uid.is_root() && setuid(Uid::from_raw(0)).is_ok() {
        bail!("permissions restorable");
    }
    Ok(())
}

/// Replaces the worker with the configured command.
pub fn exec(command: &[String]) -> Result<Infallible> {
    let argv: Vec<CString> = command
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()
        .context("command contains a NUL byte")?;
    execv(&argv[0], &argv).with_context(|| format!("execv {}", command[0]))
}
