// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The option grammar.
//!
//! The grammar is irregular in two ways that keep it out of reach of a
//! derive-style parser: option names may carry user-chosen segments
//! (`--cgroup.memory.limit_in_bytes=64M`, `--rlimit.AS=256M`), and unknown
//! options are warnings, not errors. So options are matched against a small
//! table, by exact long/short name or by prefix.

use std::path::PathBuf;

use anyhow::Result;
use container::config::{BindSpec, CgroupRule, Options};
use container::rlimit::{parse_limit, RlimitRule};
use tracing::{debug, warn};

/// What the command line asked for.
#[derive(Debug)]
pub enum Invocation {
    Help,
    Version,
    Run(Options),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Opt {
    Bind,
    BindRo,
    Domain,
    Help,
    Home,
    Host,
    Image,
    Root,
    User,
    Version,
    Work,
    Cgroup,
    Rlimit,
}

struct OptionDef {
    id: Opt,
    long: Option<&'static str>,
    short: Option<&'static str>,
    prefix: Option<&'static str>,
}

const OPTIONS: &[OptionDef] = &[
    OptionDef { id: Opt::Bind, long: Some("bind"), short: Some("b"), prefix: None },
    OptionDef { id: Opt::BindRo, long: Some("bind-ro"), short: Some("B"), prefix: None },
    OptionDef { id: Opt::Domain, long: Some("domain"), short: Some("d"), prefix: None },
    OptionDef { id: Opt::Help, long: Some("help"), short: Some("h"), prefix: None },
    OptionDef { id: Opt::Home, long: Some("home"), short: Some("H"), prefix: None },
    OptionDef { id: Opt::Host, long: Some("host"), short: None, prefix: None },
    OptionDef { id: Opt::Image, long: Some("image"), short: Some("i"), prefix: None },
    OptionDef { id: Opt::Root, long: Some("root"), short: Some("r"), prefix: None },
    OptionDef { id: Opt::User, long: Some("user"), short: Some("u"), prefix: None },
    OptionDef { id: Opt::Version, long: Some("version"), short: Some("v"), prefix: None },
    OptionDef { id: Opt::Work, long: Some("work"), short: Some("w"), prefix: None },
    OptionDef { id: Opt::Rlimit, long: None, short: None, prefix: Some("rlimit.") },
    OptionDef { id: Opt::Cgroup, long: None, short: None, prefix: Some("cgroup.") },
];

fn starts_with_ignore_case(name: &str, prefix: &str) -> bool {
    name.len() >= prefix.len() && name[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Finds the option for `name` (already stripped of its dashes) and returns
/// it together with the name remainder after a prefix match.
fn lookup(name: &str) -> Option<(Opt, &str)> {
    for def in OPTIONS {
        if def.short == Some(name) || def.long == Some(name) {
            return Some((def.id, name));
        }
        if let Some(prefix) = def.prefix {
            if starts_with_ignore_case(name, prefix) {
                return Some((def.id, &name[prefix.len()..]));
            }
        }
    }
    None
}

/// Parses the command line.
///
/// Accepts `--name value` and `--name=value` (also for short names), a lone
/// `--` as a hard stop, and treats the first token not starting with `-` and
/// everything after it as the command. Unknown options produce a warning and
/// are skipped. Malformed rlimit values are the only parse-time error.
pub fn parse(args: &[String]) -> Result<Invocation> {
    let mut options = Options::default();

    let mut index = 1;
    while index < args.len() {
        let arg = &args[index];
        if !arg.starts_with('-') {
            break;
        }

        // Split --name=value; otherwise the next token is the value. Every
        // option is assumed to take a value: --help and --version return
        // before their (possibly consumed) value matters.
        let (mut name, mut value) = match arg.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (arg.as_str(), None),
        };

        name = &name[1..];
        if let Some(rest) = name.strip_prefix('-') {
            name = rest;
            if name.is_empty() {
                index += 1;
                break;
            }
        }

        if value.is_none() {
            index += 1;
            value = args.get(index).cloned();
        }

        match lookup(name) {
            Some((Opt::Help, _)) => return Ok(Invocation::Help),
            Some((Opt::Version, _)) => return Ok(Invocation::Version),
            Some((Opt::User, _)) => options.user = value,
            Some((Opt::Host, _)) => options.host = value,
            Some((Opt::Domain, _)) => options.domain = value,
            Some((Opt::Image, _)) => options.image = value.map(PathBuf::from),
            Some((Opt::Root, _)) => options.root = value.map(PathBuf::from),
            Some((Opt::Home, _)) => options.home = value.map(PathBuf::from),
            Some((Opt::Work, _)) => options.work = value.map(PathBuf::from),
            Some((id @ (Opt::Bind | Opt::BindRo), _)) => match value {
                Some(value) => push_bind(&mut options, &value, id == Opt::BindRo),
                None => warn!("Option {} is missing its argument", name),
            },
            Some((Opt::Cgroup, rule_name)) => match value {
                Some(value) => {
                    debug!("cgroup name='{}' value='{}'", rule_name, value);
                    push_cgroup(&mut options, rule_name, value);
                }
                None => warn!("Option {} is missing its argument", name),
            },
            Some((Opt::Rlimit, rule_name)) => match value {
                Some(value) => {
                    debug!("rlimit name='{}' value='{}'", rule_name, value);
                    push_rlimit(&mut options, rule_name, &value)?;
                }
                None => warn!("Option {} is missing its argument", name),
            },
            None => warn!("Unknown option {}", name),
        }
        index += 1;
    }

    options.command = args[index..].to_vec();
    Ok(Invocation::Run(options))
}

fn push_bind(options: &mut Options, value: &str, read_only: bool) {
    let (source, target) = match value.split_once(':') {
        Some((source, target)) => (source, Some(PathBuf::from(target))),
        None => (value, None),
    };
    options.binds.push(BindSpec {
        source: PathBuf::from(source),
        target,
        read_only,
    });
}

/// Splits `SUBSYSTEM.PARAMETER` and records the rule. A repeated rule for
/// the same subsystem and parameter replaces the earlier one. A name without
/// both parts is a warning.
fn push_cgroup(options: &mut Options, name: &str, value: String) {
    let Some((subsystem, parameter)) = name.split_once('.') else {
        warn!("Malformed cgroup option {}", name);
        return;
    };
    if subsystem.is_empty() || parameter.is_empty() {
        warn!("Malformed cgroup option {}", name);
        return;
    }

    let rule = CgroupRule {
        subsystem: subsystem.to_string(),
        parameter: parameter.to_string(),
        value,
    };
    match options
        .cgroups
        .iter_mut()
        .find(|r| r.subsystem == rule.subsystem && r.parameter == rule.parameter)
    {
        Some(existing) => *existing = rule,
        None => options.cgroups.push(rule),
    }
}

/// Parses `HARD` or `SOFT/HARD` and records the rule. A repeated rule for
/// the same resource name (case-insensitive) replaces the earlier one.
fn push_rlimit(options: &mut Options, name: &str, value: &str) -> Result<()> {
    let (soft, hard) = match value.split_once('/') {
        Some((soft, hard)) => (parse_limit(soft)?, parse_limit(hard)?),
        None => {
            let limit = parse_limit(value)?;
            (limit, limit)
        }
    };

    let rule = RlimitRule {
        name: name.to_string(),
        soft,
        hard,
    };
    match options
        .rlimits
        .iter_mut()
        .find(|r| r.name.eq_ignore_ascii_case(&rule.name))
    {
        Some(existing) => *existing = rule,
        None => options.rlimits.push(rule),
    }
    Ok(())
}

pub fn print_help() {
    let program = program_name();
    println!(
        "Call: {program} [OPTION]... [COMMAND]\n\
         Execute a command or run a shell inside a container.\n\
         \n\
         Options:\n\
         \x20 -h, --help               Print this help and exit\n\
         \x20 -v, --version            Print version information and exit\n\
         \x20 -b, --bind=SRC[:DST]     Bind SRC to a path DST in container\n\
         \x20 -B, --bind-ro=SRC[:DST]  Bind SRC read-only to a path DST in container\n\
         \x20 -d, --domain=NAME        Domainname in container\n\
         \x20 -H, --home=DIR           Home directory in container\n\
         \x20     --host=NAME          Hostname in container\n\
         \x20 -i, --image=DIR          Image of the root filesystem\n\
         \x20 -r, --root=DIR           Root directory\n\
         \x20 -u, --user=NAME          User in container\n\
         \x20 -w, --work=DIR           Working directory in container\n\
         \n\
         Cgroup Options:\n\
         \x20     --cgroup.SUBSYSTEM.PARAMETER=VALUE\n\
         \n\
         Rlimit Options:\n\
         \x20     --rlimit.RESOURCE=HARD\n\
         \x20     --rlimit.RESOURCE=SOFT/HARD"
    );
}

pub fn print_version() {
    println!("{} version {}", program_name(), env!("CARGO_PKG_VERSION"));
}

fn program_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "boxer".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("boxer")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    fn run(list: &[&str]) -> Options {
        match parse(&args(list)).unwrap() {
            Invocation::Run(options) => options,
            other => panic!("expected a run invocation, got {other:?}"),
        }
    }

    #[test]
    fn accepts_equals_and_separate_values() {
        let options = run(&["--user=alice", "--host", "box", "-r", "/srv/root"]);
        assert_eq!(options.user.as_deref(), Some("alice"));
        assert_eq!(options.host.as_deref(), Some("box"));
        assert_eq!(options.root.as_deref(), Some(std::path::Path::new("/srv/root")));
    }

    #[test]
    fn short_options_take_values() {
        let options = run(&["-u", "root", "-i", "/img"]);
        assert_eq!(options.user.as_deref(), Some("root"));
        assert_eq!(options.image.as_deref(), Some(std::path::Path::new("/img")));
    }

    #[test]
    fn double_dash_stops_option_parsing() {
        let options = run(&["-u", "root", "--", "--user", "bob"]);
        assert_eq!(options.user.as_deref(), Some("root"));
        assert_eq!(options.command, vec!["--user", "bob"]);
    }

    #[test]
    fn first_positional_starts_the_command() {
        let options = run(&["/bin/echo", "-n", "hi"]);
        assert_eq!(options.command, vec!["/bin/echo", "-n", "hi"]);
    }

    #[test]
    fn unknown_options_are_skipped() {
        let options = run(&["--frobnicate", "what", "--user", "alice"]);
        assert_eq!(options.user.as_deref(), Some("alice"));
        assert!(options.command.is_empty());
    }

    #[test]
    fn help_and_version_win() {
        assert!(matches!(parse(&args(&["-h"])).unwrap(), Invocation::Help));
        assert!(matches!(
            parse(&args(&["--version"])).unwrap(),
            Invocation::Version
        ));
        assert!(matches!(
            parse(&args(&["-u", "root", "--help"])).unwrap(),
            Invocation::Help
        ));
    }

    #[test]
    fn bind_specs_split_source_and_target() {
        let options = run(&["-b", "/src", "-B", "/host/conf:/etc/app"]);
        assert_eq!(
            options.binds[0],
            BindSpec {
                source: PathBuf::from("/src"),
                target: None,
                read_only: false,
            }
        );
        assert_eq!(
            options.binds[1],
            BindSpec {
                source: PathBuf::from("/host/conf"),
                target: Some(PathBuf::from("/etc/app")),
                read_only: true,
            }
        );
    }

    #[test]
    fn cgroup_options_are_prefix_matched() {
        let options = run(&["--cgroup.memory.limit_in_bytes=64M"]);
        assert_eq!(
            options.cgroups,
            vec![CgroupRule {
                subsystem: "memory".to_string(),
                parameter: "limit_in_bytes".to_string(),
                value: "64M".to_string(),
            }]
        );
    }

    #[test]
    fn repeated_cgroup_rules_replace_earlier_ones() {
        let options = run(&[
            "--cgroup.memory.limit_in_bytes=64M",
            "--cgroup.memory.limit_in_bytes=128M",
            "--cgroup.cpu.shares=512",
        ]);
        assert_eq!(options.cgroups.len(), 2);
        assert_eq!(options.cgroups[0].value, "128M");
    }

    #[test]
    fn malformed_cgroup_names_are_skipped() {
        let options = run(&["--cgroup.memory=64M", "--cgroup..x=1"]);
        assert!(options.cgroups.is_empty());
    }

    #[test]
    fn rlimit_options_parse_soft_and_hard() {
        let options = run(&["--rlimit.AS=256M", "--rlimit.nofile=64/128"]);
        assert_eq!(
            options.rlimits[0],
            RlimitRule {
                name: "AS".to_string(),
                soft: 256 * 1024 * 1024,
                hard: 256 * 1024 * 1024,
            }
        );
        assert_eq!(
            options.rlimits[1],
            RlimitRule {
                name: "nofile".to_string(),
                soft: 64,
                hard: 128,
            }
        );
    }

    #[test]
    fn repeated_rlimit_rules_replace_case_insensitively() {
        let options = run(&["--rlimit.as=1M", "--rlimit.AS=2M"]);
        assert_eq!(options.rlimits.len(), 1);
        assert_eq!(options.rlimits[0].soft, 2 * 1024 * 1024);
    }

    #[test]
    fn malformed_rlimit_values_are_fatal() {
        assert!(parse(&args(&["--rlimit.AS=lots"])).is_err());
    }
}
