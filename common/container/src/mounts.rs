// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mount and device primitives plus the canonical tables describing the
//! container root filesystem.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::libc;
use nix::mount::{mount, MsFlags};
use nix::sys::stat::{makedev, mknod, stat, Mode, SFlag};
use nix::unistd::{chown, Gid, Uid};
use tracing::{info, warn};

use crate::config::rebase;

/// One mount operation. `target` defaults to the mount source rebased under
/// the container root.
#[derive(Clone, Debug)]
pub struct MountSpec {
    pub source: Option<PathBuf>,
    pub fstype: Option<String>,
    pub target: Option<PathBuf>,
    pub data: Option<String>,
    pub flags: MsFlags,
}

impl MountSpec {
    /// A bind mount of a host path, `MS_BIND` plus `extra`.
    pub fn bind(source: impl Into<PathBuf>, extra: MsFlags) -> Self {
        Self {
            source: Some(source.into()),
            fstype: None,
            target: None,
            data: None,
            flags: MsFlags::MS_BIND | extra,
        }
    }

    /// A kernel filesystem mount (tmpfs, proc, ...). `source` doubles as the
    /// default target path under the container root.
    pub fn filesystem(
        source: impl Into<PathBuf>,
        fstype: &str,
        data: Option<&str>,
        flags: MsFlags,
    ) -> Self {
        Self {
            source: Some(source.into()),
            fstype: Some(fstype.to_string()),
            target: None,
            data: data.map(str::to_string),
            flags,
        }
    }

    /// Overrides the target path.
    pub fn at(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// A device node to create under the container root. A zero mode means
/// "mirror the host node's mode"; ownership always mirrors the host node.
#[derive(Clone, Copy, Debug)]
pub struct DeviceSpec {
    pub name: &'static str,
    pub major: u64,
    pub minor: u64,
    pub mode: libc::mode_t,
}

/// The system directories every container root receives.
pub fn system_mounts() -> Vec<MountSpec> {
    let bind_ro = MsFlags::MS_RDONLY | MsFlags::MS_NOSUID;
    vec![
        MountSpec::bind("/bin", bind_ro),
        MountSpec::filesystem("/dev", "tmpfs", Some("mode=755"), MsFlags::MS_NOSUID),
        MountSpec::filesystem(
            "/dev/pts",
            "devpts",
            Some("newinstance,ptmxmode=0666,mode=0620,gid=5"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
        ),
        MountSpec::filesystem(
            "/dev/shm",
            "tmpfs",
            Some("mode=1777,size=65536k"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        ),
        MountSpec::bind("/etc", bind_ro | MsFlags::MS_NOEXEC),
        MountSpec::bind("/lib", bind_ro),
        MountSpec::bind("/lib64", bind_ro),
        MountSpec::filesystem(
            "/proc",
            "proc",
            None,
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        ),
        MountSpec::filesystem("/run", "tmpfs", Some("mode=755"), MsFlags::MS_NOSUID | MsFlags::MS_NODEV),
        MountSpec::filesystem(
            "/sys",
            "sysfs",
            None,
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RDONLY,
        ),
        MountSpec::filesystem(
            "/sys/fs/cgroup",
            "tmpfs",
            Some("mode=755"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        ),
        MountSpec::filesystem("/tmp", "tmpfs", Some("mode=1777"), MsFlags::MS_NOSUID | MsFlags::MS_NODEV),
        MountSpec::bind("/usr/bin", bind_ro),
        MountSpec::bind("/usr/lib", bind_ro),
        MountSpec::bind("/usr/share", bind_ro),
    ]
}

/// The device nodes every container root receives.
pub const SYSTEM_DEVICES: &[DeviceSpec] = &[
    DeviceSpec { name: "/dev/null", major: 1, minor: 3, mode: 0 },
    DeviceSpec { name: "/dev/console", major: 1, minor: 3, mode: 0o666 },
    DeviceSpec { name: "/dev/zero", major: 1, minor: 5, mode: 0 },
    DeviceSpec { name: "/dev/full", major: 1, minor: 7, mode: 0 },
    DeviceSpec { name: "/dev/tty", major: 5, minor: 0, mode: 0 },
    DeviceSpec { name: "/dev/random", major: 1, minor: 8, mode: 0 },
    DeviceSpec { name: "/dev/urandom", major: 1, minor: 9, mode: 0 },
];

/// Performs one mount.
///
/// A missing host source is a warning, not an error: containers on hosts
/// without e.g. `/lib64` simply go without it. When `image` already provides
/// the path, the mount is skipped so the image contents win. A bind mount
/// that carries flags beyond `MS_BIND` is remounted once more, because the
/// first mount inherits the flags of the source mount point.
pub fn apply(spec: &MountSpec, root: &Path, image: Option<&Path>) -> Result<()> {
    let target = match (&spec.target, &spec.source) {
        (Some(target), _) => target.clone(),
        (None, Some(source)) => rebase(root, source),
        (None, None) => bail!("mount entry has neither source nor target"),
    };

    if let (Some(image), Ok(rel)) = (image, target.strip_prefix(root)) {
        if !rel.as_os_str().is_empty() && image.join(rel).exists() {
            warn!(
                "Skipping {} because it's part of the container image",
                display_source(spec, &target)
            );
            return Ok(());
        }
    }

    info!("Mounting {}", display_source(spec, &target));
    fileutil::create_all(&target)?;
    match mount(
        spec.source.as_deref(),
        &target,
        spec.fstype.as_deref(),
        spec.flags,
        spec.data.as_deref(),
    ) {
        Err(Errno::ENOENT) => {
            warn!(
                "mount {} {}: {}",
                display_source(spec, &target),
                target.display(),
                Errno::ENOENT.desc()
            );
            return Ok(());
        }
        result => result.with_context(|| {
            format!("mount {} {}", display_source(spec, &target), target.display())
        })?,
    }

    // A plain MS_BIND needs no second pass; extra flags such as MS_RDONLY
    // only take effect through a remount.
    if spec.flags.contains(MsFlags::MS_BIND) && spec.flags != MsFlags::MS_BIND {
        mount(
            None::<&Path>,
            &target,
            spec.fstype.as_deref(),
            spec.flags | MsFlags::MS_REMOUNT,
            spec.data.as_deref(),
        )
        .with_context(|| {
            format!("remount {} {}", display_source(spec, &target), target.display())
        })?;
    }
    Ok(())
}

fn display_source<'a>(spec: &'a MountSpec, target: &'a Path) -> std::path::Display<'a> {
    spec.source.as_deref().unwrap_or(target).display()
}

/// Creates one device node under `root`, mirroring the host node.
pub fn apply_device(device: &DeviceSpec, root: &Path) -> Result<()> {
    let host = stat(device.name).with_context(|| format!("stat {}", device.name))?;
    let mode = if device.mode != 0 { device.mode } else { host.st_mode };
    let path = rebase(root, Path::new(device.name));

    info!("Creating {}", device.name);
    mknod(
        &path,
        SFlag::from_bits_truncate(mode & libc::S_IFMT),
        Mode::from_bits_truncate(mode & !libc::S_IFMT),
        makedev(device.major, device.minor),
    )
    .with_context(|| format!("mknod {} in {}", device.name, path.display()))?;
    chown(
        &path,
        Some(Uid::from_raw(host.st_uid)),
        Some(Gid::from_raw(host.st_gid)),
    )
    .with_context(|| {
        format!("chown {} uid={} gid={}", path.display(), host.st_uid, host.st_gid)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_mounts_cover_the_expected_directories() {
        let sources: Vec<PathBuf> = system_mounts()
            .iter()
            .map(|m| m.source.clone().unwrap())
            .collect();
        for expected in [
            "/bin", "/dev", "/dev/pts", "/dev/shm", "/etc", "/lib", "/lib64", "/proc", "/run",
            "/sys", "/sys/fs/cgroup", "/tmp", "/usr/bin", "/usr/lib", "/usr/share",
        ] {
            assert!(
                sources.contains(&PathBuf::from(expected)),
                "missing {expected}"
            );
        }
    }

    #[test]
    fn system_binds_are_read_only() {
        for spec in system_mounts() {
            if spec.flags.contains(MsFlags::MS_BIND) {
                assert!(
                    spec.flags.contains(MsFlags::MS_RDONLY),
                    "{:?} should be read-only",
                    spec.source
                );
            }
        }
    }

    #[test]
    fn console_device_mode_is_pinned() {
        let console = SYSTEM_DEVICES
            .iter()
            .find(|d| d.name == "/dev/console")
            .unwrap();
        assert_eq!(console.mode, 0o666);
        // The remaining nodes mirror the host mode.
        assert!(SYSTEM_DEVICES
            .iter()
            .filter(|d| d.name != "/dev/console")
            .all(|d| d.mode == 0));
    }
}
