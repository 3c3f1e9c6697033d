// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Resource limits configured through `--rlimit.RESOURCE=SOFT/HARD`.

use anyhow::{bail, Context, Result};
use nix::sys::resource::{setrlimit, Resource};

/// One rlimit rule. The resource name is validated against the closed set in
/// [`resource_by_name`] when the rule is applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RlimitRule {
    pub name: String,
    pub soft: u64,
    pub hard: u64,
}

/// Parses a limit value with an optional `K`, `M` or `G` binary suffix,
/// case-insensitive.
pub fn parse_limit(value: &str) -> Result<u64> {
    let digits_end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(digits_end);
    let base: u64 = digits
        .parse()
        .with_context(|| format!("malformed limit value {value:?}"))?;
    let multiplier: u64 = match suffix {
        "" => 1,
        s if s.eq_ignore_ascii_case("k") => 1 << 10,
        s if s.eq_ignore_ascii_case("m") => 1 << 20,
        s if s.eq_ignore_ascii_case("g") => 1 << 30,
        _ => bail!("malformed limit value {value:?}"),
    };
    base.checked_mul(multiplier)
        .with_context(|| format!("limit value {value:?} overflows"))
}

/// Maps a textual resource name, case-insensitively, onto the kernel
/// resource. Unknown names are an error.
pub fn resource_by_name(name: &str) -> Result<Resource> {
    let resource = match name.to_ascii_uppercase().as_str() {
        "CPU" => Resource::RLIMIT_CPU,
        "FSIZE" => Resource::RLIMIT_FSIZE,
        "DATA" => Resource::RLIMIT_DATA,
        "STACK" => Resource::RLIMIT_STACK,
        "CORE" => Resource::RLIMIT_CORE,
        "RSS" => Resource::RLIMIT_RSS,
        "NOFILE" => Resource::RLIMIT_NOFILE,
        "AS" => Resource::RLIMIT_AS,
        "NPROC" => Resource::RLIMIT_NPROC,
        "MEMLOCK" => Resource::RLIMIT_MEMLOCK,
        "LOCKS" => Resource::RLIMIT_LOCKS,
        "SIGPENDING" => Resource::RLIMIT_SIGPENDING,
        "MSGQUEUE" => Resource::RLIMIT_MSGQUEUE,
        "NICE" => Resource::RLIMIT_NICE,
        "RTPRIO" => Resource::RLIMIT_RTPRIO,
        "RTTIME" => Resource::RLIMIT_RTTIME,
        _ => bail!("Unknown rlimit {name}"),
    };
    Ok(resource)
}

/// Applies every rule to the calling process.
pub fn apply(rules: &[RlimitRule]) -> Result<()> {
    for rule in rules {
        let resource = resource_by_name(&rule.name)?;
        setrlimit(resource, rule.soft, rule.hard)
            .with_context(|| format!("setrlimit {}", rule.name))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_limit_accepts_binary_suffixes() -> Result<()> {
        assert_eq!(parse_limit("1k")?, 1024);
        assert_eq!(parse_limit("2M")?, 2097152);
        assert_eq!(parse_limit("3G")?, 3221225472);
        assert_eq!(parse_limit("256m")?, 256 * 1024 * 1024);
        assert_eq!(parse_limit("42")?, 42);
        Ok(())
    }

    #[test]
    fn parse_limit_rejects_garbage() {
        assert!(parse_limit("").is_err());
        assert!(parse_limit("x").is_err());
        assert!(parse_limit("12q").is_err());
        assert!(parse_limit("1kk").is_err());
    }

    #[test]
    fn resource_by_name_is_case_insensitive() -> Result<()> {
        assert_eq!(resource_by_name("as")?, Resource::RLIMIT_AS);
        assert_eq!(resource_by_name("NoFile")?, Resource::RLIMIT_NOFILE);
        assert_eq!(resource_by_name("RTTIME")?, Resource::RLIMIT_RTTIME);
        Ok(())
    }

    #[test]
    fn resource_by_name_rejects_unknown_names() {
        assert!(resource_by_name("frobs").is_err());
        assert!(resource_by_name("").is_err());
    }
}
