// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! boxer: run a command in a freshly assembled container.
//!
//! The process splits in two. The worker enters the new namespaces, builds
//! the root filesystem and becomes the user command; the parent stays
//! outside as the supervisor, bridging the terminal and guaranteeing that no
//! container process survives it.

use std::convert::Infallible;
use std::process::ExitCode;

use anyhow::{Context, Result};
use console::Console;
use container::{Config, Tracker};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{fork, setsid, ForkResult};
use rand::Rng;
use tracing::{error, info};

mod cli;
mod supervisor;

const RUN_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const RUN_ID_LEN: usize = 20;

/// A random identifier for this run.
///
/// The supervisor PID would not do: boxer instances may run in different PID
/// namespaces, where PIDs clash. The id keys the cgroup hierarchies and tags
/// every log line.
fn generate_run_id() -> String {
    let mut rng = rand::thread_rng();
    (0..RUN_ID_LEN)
        .map(|_| RUN_ID_CHARSET[rng.gen_range(0..RUN_ID_CHARSET.len())] as char)
        .collect()
}

fn main() -> ExitCode {
    let run_id = generate_run_id();
    if let Err(error) = cliutil::init_logging(&run_id) {
        eprintln!("FATAL: {error:#}");
        return ExitCode::FAILURE;
    }
    cliutil::log_current_command_line();

    let args: Vec<String> = std::env::args().collect();
    match cli::parse(&args) {
        Ok(cli::Invocation::Help) => {
            cli::print_help();
            ExitCode::SUCCESS
        }
        Ok(cli::Invocation::Version) => {
            cli::print_version();
            ExitCode::SUCCESS
        }
        Ok(cli::Invocation::Run(options)) => {
            cliutil::handle_top_level_result(run(&run_id, options))
        }
        Err(error) => cliutil::handle_top_level_result::<Infallible>(Err(error)),
    }
}

fn run(run_id: &str, options: container::config::Options) -> Result<Infallible> {
    let config = Config::resolve(options, run_id)?;

    info!("Boxer ID: {}", run_id);
    info!(
        "User: {} (uid={}, gid={})",
        config.user.name, config.user.uid, config.user.gid
    );
    info!("Root: {}", config.root.display());
    info!("Home: {}", config.home.display());

    let tracker = Tracker::new(run_id)?;
    let mut console = Console::open()?;

    // These namespaces take effect in the forked worker.
    unshare(
        CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS,
    )
    .context("unshare")?;

    // SAFETY: the process is single-threaded, so the child may keep
    // allocating and calling into non-async-signal-safe code.
    match unsafe { fork() }.context("fork")? {
        ForkResult::Child => {
            let error = match run_worker(&config, &mut console, run_id) {
                Ok(never) => match never {},
                Err(error) => error,
            };
            error!("{:#}", error);
            std::process::exit(libc::EXIT_FAILURE);
        }
        ForkResult::Parent { .. } => {
            console.setup_master()?;
            supervisor::run(console, tracker)
        }
    }
}

/// The worker: from fresh namespaces to `execv`. Only returns on error.
fn run_worker(config: &Config, console: &mut Console, run_id: &str) -> Result<Infallible> {
    setsid().context("setsid")?;
    console.setup_slave(config.user.uid, config.user.gid)?;
    container::rootfs::setup(config, Some(console.slave_path()), run_id)?;
    container::rootfs::drop_privileges(config)?;
    container::rootfs::exec(&config.command)
}
