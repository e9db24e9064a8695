// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! On-demand recording republish: starts and stops the external pipeline
//! that pushes the shared buffer to the RTSP media server.

use crate::bus::{Bus, Event};
use crate::config::{expand_template, PublishConfig};
use crate::hub::stop_child;
use async_trait::async_trait;
use base::{err, Error};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Controller interface consumed by the orchestrator; a trait so its tests
/// can observe start/stop calls without subprocesses.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Starts the republish. Idempotent; returns once the subprocess is
    /// running (server-side recording readiness is not awaited).
    async fn start(&self) -> Result<(), Error>;

    /// Stops the republish: interrupt, wait `grace` (config default when
    /// `None`), escalate to kill. The RTSP socket is released before this
    /// returns. Idempotent.
    async fn stop(&self, grace: Option<Duration>) -> Result<(), Error>;
}

pub struct PublisherController {
    cfg: PublishConfig,
    transport_path: PathBuf,
    bus: Bus,
    child: Arc<Mutex<Option<Child>>>,
}

impl PublisherController {
    pub fn new(cfg: PublishConfig, transport_path: PathBuf, bus: Bus) -> Arc<Self> {
        Arc::new(PublisherController {
            cfg,
            transport_path,
            bus,
            child: Arc::new(Mutex::new(None)),
        })
    }

    fn grace(&self, grace: Option<Duration>) -> Duration {
        grace.unwrap_or(Duration::from_millis(self.cfg.stop_grace_ms))
    }

    fn spawn_pipeline(&self) -> Result<Child, Error> {
        let cmd = expand_template(
            &self.cfg.pipeline,
            &[
                ("path", self.transport_path.display().to_string()),
                ("rtsp_url", self.cfg.rtsp_url.clone()),
            ],
        );
        debug!(%cmd, "spawning publish pipeline");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| err!(e, msg("spawning publish pipeline {cmd:?}")))?;
        let stderr = child.stderr.take().expect("stderr was piped");
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "nightjar_agent::publisher::child", "{line}");
            }
        });
        Ok(child)
    }

    /// Polls for an unexpected child exit and reports it on the bus.
    fn spawn_monitor(&self) {
        let child = self.child.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let mut poll = tokio::time::interval(Duration::from_millis(500));
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                poll.tick().await;
                let mut l = child.lock().await;
                match &mut *l {
                    None => return, // stopped deliberately
                    Some(c) => match c.try_wait() {
                        Ok(None) => {}
                        Ok(Some(status)) => {
                            warn!(%status, "publish pipeline exited unexpectedly");
                            *l = None;
                            bus.publish(Event::StreamError {
                                message: format!("publish pipeline exited: {status}"),
                            });
                            return;
                        }
                        Err(e) => {
                            warn!(err = %e, "unable to poll publish pipeline");
                            return;
                        }
                    },
                }
            }
        });
    }
}

#[async_trait]
impl Publisher for PublisherController {
    async fn start(&self) -> Result<(), Error> {
        let mut l = self.child.lock().await;
        if let Some(c) = &mut *l {
            if matches!(c.try_wait(), Ok(None)) {
                debug!("publish pipeline already running");
                return Ok(());
            }
        }
        let child = self.spawn_pipeline()?;
        info!(pid = child.id(), rtsp_url = %self.cfg.rtsp_url, "recording republish started");
        *l = Some(child);
        drop(l);
        self.spawn_monitor();
        self.bus.publish(Event::StreamStart);
        Ok(())
    }

    async fn stop(&self, grace: Option<Duration>) -> Result<(), Error> {
        let mut taken = {
            let mut l = self.child.lock().await;
            l.take()
        };
        let Some(child) = &mut taken else {
            debug!("publish pipeline already stopped");
            return Ok(());
        };
        stop_child(child, self.grace(grace)).await;
        info!("recording republish stopped");
        self.bus.publish(Event::StreamStop);
        Ok(())
    }
}
