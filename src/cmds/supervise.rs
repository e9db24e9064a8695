// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Parent process: child runtime lifecycle plus the HTTP control API.

use crate::config::Config;
use crate::supervisor::{Manager, Supervisor, SupervisorConfig, WaitCond};
use crate::web::{serve_control, ControlService};
use base::{err, Error};
use bpaf::Bpaf;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// Supervises the agent runtime and serves the control API.
#[derive(Bpaf, Debug)]
#[bpaf(command("supervise"))]
pub struct Args {
    /// Path to the agent TOML config.
    #[bpaf(long, argument("PATH"))]
    config: PathBuf,

    /// Port for the control API; overrides the config.
    #[bpaf(long, argument("PORT"))]
    status_port: Option<u16>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    super::tokio_runtime().block_on(async_run(args))
}

async fn async_run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;
    let status_port = args.status_port.unwrap_or(config.control.status_port);
    let supervisor = Supervisor::new(SupervisorConfig {
        config_path: args.config.clone(),
        child_status_port: config.control.child_status_port(),
        autostart: config.control.autostart,
        child_command: None,
    });

    // The runtime is not auto-started unless configured to be.
    if config.control.autostart {
        info!("autostart enabled; starting runtime");
        if let Err(e) = supervisor
            .start_gated(WaitCond::None, Duration::ZERO, 0)
            .await
        {
            warn!(err = %e.chain(), "autostart failed; control API still serves");
        }
    }

    let service = ControlService::new(supervisor.clone(), config.classes_override_path.clone());
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let server = tokio::spawn(serve_control(service, status_port, shutdown_rx));

    let mut int = signal(SignalKind::interrupt()).map_err(|e| err!(e, msg("signal handler")))?;
    let mut term = signal(SignalKind::terminate()).map_err(|e| err!(e, msg("signal handler")))?;
    tokio::select! {
        _ = int.recv() => info!("SIGINT; shutting down"),
        _ = term.recv() => info!("SIGTERM; shutting down"),
    }

    supervisor.stop().await;
    drop(shutdown_tx);
    match tokio::time::timeout(Duration::from_secs(10), server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => return Err(e),
        Ok(Err(e)) => return Err(err!(Internal, msg("control server panicked"), source(e))),
        Err(_) => warn!("control server did not stop within 10s"),
    }
    info!("exiting");
    Ok(0)
}
