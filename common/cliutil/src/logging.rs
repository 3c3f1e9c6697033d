// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;

use anyhow::{Context, Result};
use nix::unistd::isatty;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

/// Formats events as ` <id8> | <lvl> ~ <message>` where `<id8>` is the first
/// eight characters of the run id and `<lvl>` is one of `dbg`, `inf`, `wrn`
/// and `err`. When stderr is a terminal the level tag is wrapped in a bold
/// ANSI color.
struct RunIdFormat {
    id: String,
    tty: bool,
}

impl RunIdFormat {
    fn tag(level: Level) -> (&'static str, &'static str) {
        if level == Level::ERROR {
            ("err", "31")
        } else if level == Level::WARN {
            ("wrn", "33")
        } else if level == Level::INFO {
            ("inf", "32")
        } else {
            ("dbg", "34")
        }
    }
}

impl<S, N> FormatEvent<S, N> for RunIdFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let (tag, color) = Self::tag(*event.metadata().level());
        if self.tty {
            write!(writer, " {:.8} | \x1b[{};1m{}\x1b[0m ~ ", self.id, color, tag)?;
        } else {
            write!(writer, " {:.8} | {} ~ ", self.id, tag)?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global stderr log sink tagged with `run_id`.
///
/// The default level is INFO; `RUST_LOG` overrides it the usual way.
pub fn init_logging(run_id: &str) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let format = RunIdFormat {
        id: run_id.to_string(),
        tty: isatty(nix::libc::STDERR_FILENO).unwrap_or(false),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(format)
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .try_init()
        .context("Failed to start tracing. A subscriber is already running.")?;
    Ok(())
}
