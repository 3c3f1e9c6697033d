// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::mount::MsFlags;
use nix::unistd::{getuid, Gid, Uid, User};

use crate::mounts::MountSpec;
use crate::rlimit::RlimitRule;

/// The container user, resolved from the host password database.
#[derive(Clone, Debug)]
pub struct UserSpec {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub home: PathBuf,
    pub shell: PathBuf,
}

impl UserSpec {
    /// Resolves `name` if given, otherwise the effective user.
    pub fn resolve(name: Option<&str>) -> Result<Self> {
        let user = match name {
            Some(name) => {
                User::from_name(name).with_context(|| format!("getpwnam {name}"))?
            }
            None => User::from_uid(getuid()).context("getpwuid")?,
        };
        let Some(user) = user else {
            bail!("user {} not found", name.unwrap_or("<effective uid>"));
        };
        Ok(Self {
            name: user.name,
            uid: user.uid,
            gid: user.gid,
            home: user.dir,
            shell: user.shell,
        })
    }
}

/// A `--bind` / `--bind-ro` request, still relative to the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindSpec {
    pub source: PathBuf,
    pub target: Option<PathBuf>,
    pub read_only: bool,
}

/// A `--cgroup.SUBSYSTEM.PARAMETER=VALUE` rule. The controller paths are
/// derived at apply time, inside the container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CgroupRule {
    pub subsystem: String,
    pub parameter: String,
    pub value: String,
}

/// Everything the user may configure, before defaults are filled in.
#[derive(Debug, Default)]
pub struct Options {
    pub user: Option<String>,
    pub host: Option<String>,
    pub domain: Option<String>,
    pub image: Option<PathBuf>,
    pub root: Option<PathBuf>,
    pub home: Option<PathBuf>,
    pub work: Option<PathBuf>,
    pub binds: Vec<BindSpec>,
    pub cgroups: Vec<CgroupRule>,
    pub rlimits: Vec<RlimitRule>,
    pub command: Vec<String>,
}

/// The frozen runtime configuration. Built once by [`Config::resolve`]
/// before `fork`; nothing mutates it afterwards.
#[derive(Debug)]
pub struct Config {
    pub user: UserSpec,
    pub image: Option<PathBuf>,
    pub root: PathBuf,
    pub home: PathBuf,
    pub work: PathBuf,
    pub host: Option<String>,
    pub domain: Option<String>,
    pub binds: Vec<MountSpec>,
    pub cgroups: Vec<CgroupRule>,
    pub rlimits: Vec<RlimitRule>,
    pub command: Vec<String>,
}

impl Config {
    /// The fill-defaults pass between option parsing and the worker fork.
    ///
    /// Resolves the user, defaults the paths (root from the run id, home
    /// from the user, work from home), rebases bind targets under the root
    /// and defaults the command to the user's shell.
    pub fn resolve(options: Options, run_id: &str) -> Result<Self> {
        let user = UserSpec::resolve(options.user.as_deref())?;

        let root = fileutil::clean(
            options
                .root
                .unwrap_or_else(|| PathBuf::from(format!("/var/boxer/{run_id}/"))),
        );
        let home = fileutil::clean(options.home.unwrap_or_else(|| user.home.clone()));
        let work = fileutil::clean(options.work.unwrap_or_else(|| home.clone()));

        let binds = options
            .binds
            .into_iter()
            .map(|bind| {
                let target = bind.target.as_ref().unwrap_or(&bind.source);
                let mut flags = MsFlags::MS_BIND;
                if bind.read_only {
                    flags |= MsFlags::MS_RDONLY;
                }
                MountSpec {
                    source: Some(bind.source.clone()),
                    target: Some(rebase(&root, target)),
                    fstype: None,
                    data: None,
                    flags,
                }
            })
            .collect();

        let command = if options.command.is_empty() {
            vec![user.shell.to_string_lossy().into_owned()]
        } else {
            options.command
        };

        Ok(Self {
            user,
            image: options.image,
            root,
            home,
            work,
            host: options.host,
            domain: options.domain,
            binds,
            cgroups: options.cgroups,
            rlimits: options.rlimits,
            command,
        })
    }
}

/// Places `path` under `root`, treating `path` as container-absolute.
pub fn rebase(root: &Path, path: &Path) -> PathBuf {
    let rel = path.strip_prefix("/").unwrap_or(path);
    fileutil::clean(root.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options_with_command(command: &[&str]) -> Options {
        Options {
            command: command.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn resolve_defaults_root_from_run_id() -> Result<()> {
        let config = Config::resolve(options_with_command(&["/bin/true"]), "abc123")?;
        assert_eq!(config.root, PathBuf::from("/var/boxer/abc123"));
        Ok(())
    }

    #[test]
    fn resolve_defaults_work_to_home() -> Result<()> {
        let mut options = options_with_command(&["/bin/true"]);
        options.home = Some(PathBuf::from("/data//home/"));
        let config = Config::resolve(options, "abc123")?;
        assert_eq!(config.home, PathBuf::from("/data/home"));
        assert_eq!(config.work, config.home);
        Ok(())
    }

    #[test]
    fn resolve_defaults_command_to_shell() -> Result<()> {
        let config = Config::resolve(Options::default(), "abc123")?;
        assert_eq!(
            config.command,
            vec![config.user.shell.to_string_lossy().into_owned()]
        );
        Ok(())
    }

    #[test]
    fn resolve_rebases_bind_targets() -> Result<()> {
        let mut options = options_with_command(&["/bin/true"]);
        options.binds.push(BindSpec {
            source: PathBuf::from("/host/conf"),
            target: Some(PathBuf::from("/etc/app")),
            read_only: true,
        });
        options.binds.push(BindSpec {
            source: PathBuf::from("/srv/data"),
            target: None,
            read_only: false,
        });
        let config = Config::resolve(options, "abc123")?;

        assert_eq!(
            config.binds[0].target.as_deref(),
            Some(Path::new("/var/boxer/abc123/etc/app"))
        );
        assert_eq!(
            config.binds[0].flags,
            MsFlags::MS_BIND | MsFlags::MS_RDONLY
        );
        assert_eq!(
            config.binds[1].target.as_deref(),
            Some(Path::new("/var/boxer/abc123/srv/data"))
        );
        assert_eq!(config.binds[1].flags, MsFlags::MS_BIND);
        Ok(())
    }

    #[test]
    fn rebase_handles_relative_and_absolute() {
        let root = Path::new("/var/boxer/x");
        assert_eq!(rebase(root, Path::new("/etc/app")), PathBuf::from("/var/boxer/x/etc/app"));
        assert_eq!(rebase(root, Path::new("etc/app")), PathBuf::from("/var/boxer/x/etc/app"));
    }
}
