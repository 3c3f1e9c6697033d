// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Provides functions common to the CLI entry point: the stderr log sink
//! and the top-level result handling.

use std::process::{ExitCode, Termination};

use anyhow::Result;
use itertools::Itertools;

mod logging;

pub use crate::logging::*;

/// Handles the top-level [`Result`] and returns the [`ExitCode`] for `main`.
///
/// A fatal error is logged through the normal sink so it carries the run id
/// prefix like every other message. The `{:#}` rendering appends the cause
/// chain, which is where the OS error text ends up.
pub fn handle_top_level_result<T: Termination>(result: Result<T>) -> ExitCode {
    match result {
        Err(error) => {
            tracing::error!("{:#}", error);
            ExitCode::FAILURE
        }
        Ok(value) => value.report(),
    }
}

/// Logs the command line of the current process.
pub fn log_current_command_line() {
    let escaped_command = std::env::args()
        .map(|s| shell_escape::escape(s.into()))
        .join(" ");
    tracing::debug!("COMMAND: {}", escaped_command);
}
