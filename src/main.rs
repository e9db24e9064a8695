// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

use base::Error;
use bpaf::Bpaf;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod ai;
mod bus;
mod cache;
mod cmds;
mod config;
mod feeder;
mod filter;
mod frame;
mod fsm;
mod hub;
mod ingest;
mod json;
mod metrics;
mod orchestrator;
mod publisher;
mod store;
mod supervisor;
mod web;

/// Nightjar: edge camera video event agent.
#[derive(Bpaf, Debug)]
#[bpaf(options, version)]
enum Args {
    // See docstrings of `cmds::*::Args` for the respective subcommands.
    Run(#[bpaf(external(cmds::run::args))] cmds::run::Args),
    Supervise(#[bpaf(external(cmds::supervise::args))] cmds::supervise::Args),
    Check(#[bpaf(external(cmds::check::args))] cmds::check::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Run(a) => cmds::run::run(a),
            Args::Supervise(a) => cmds::supervise::run(a),
            Args::Check(a) => cmds::check::run(a),
        }
    }
}

fn main() {
    // If using the clock will fail, find out now *before* trying to log
    // anything (with timestamps...) so we can print a helpful error.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!("clock_gettime failed: {e}\n\nThis indicates a broken environment.");
        std::process::exit(1);
    }

    base::tracing_setup::install();

    // Get the program name from the OS (e.g. if invoked as
    // `target/debug/nightjar`: `nightjar`), falling back to the crate name
    // if conversion to a path/UTF-8 string fails.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("Parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
