// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Parent-side child lifecycle: spawns the agent runtime (`nightjar run`),
//! polls its internal status endpoint, and implements the readiness gates
//! of `POST /control/start`.

use crate::json::{AgentSnapshot, ManagerStatus, TopLevelStatus};
use async_trait::async_trait;
use base::{bail, err, Error, Mutex};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How long after SIGTERM before the child is killed outright.
const STOP_ESCALATION: Duration = Duration::from_secs(5);

/// Poll cadence for readiness gates and snapshot fetches.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_millis(500);

/// Readiness condition of `POST /control/start?wait=`.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum WaitCond {
    #[default]
    None,
    Heartbeat,
    Detection,
    Session,
}

impl std::str::FromStr for WaitCond {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "none" => WaitCond::None,
            "heartbeat" => WaitCond::Heartbeat,
            "detection" => WaitCond::Detection,
            "session" => WaitCond::Session,
            _ => bail!(InvalidArgument, msg("unknown wait condition {s:?}")),
        })
    }
}

#[derive(Debug)]
pub enum StartOutcome {
    Ready(TopLevelStatus),

    /// The condition did not hold within the deadline; the last snapshot
    /// is embedded for the 504 response.
    Timeout(TopLevelStatus),
}

/// The operations the control API needs; a trait so its tests can run
/// without real child processes.
#[async_trait]
pub trait Manager: Send + Sync {
    async fn status(&self) -> TopLevelStatus;
    async fn start_gated(
        &self,
        wait: WaitCond,
        timeout: Duration,
        min_frames: u64,
    ) -> Result<StartOutcome, Error>;
    async fn stop(&self);
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub config_path: PathBuf,
    pub child_status_port: u16,
    pub autostart: bool,

    /// Override for the child command line; `None` means
    /// `current_exe() run --config ... --status-port ...`.
    pub child_command: Option<Vec<String>>,
}

struct RunningChild {
    pid: u32,
    started_at: jiff::Timestamp,
}

#[derive(Default)]
struct Inner {
    child: Option<RunningChild>,
    stopping: bool,
    last_exit: Option<String>,
    last_error: Option<String>,
}

pub struct Supervisor {
    cfg: SupervisorConfig,
    http: reqwest::Client,
    inner: Mutex<Inner>,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig) -> Arc<Self> {
        Arc::new(Supervisor {
            cfg,
            http: reqwest::Client::builder()
                .timeout(SNAPSHOT_TIMEOUT)
                .build()
                .expect("default reqwest client builds"),
            inner: Mutex::new(Inner::default()),
        })
    }

    fn child_command(&self) -> Result<Vec<String>, Error> {
        if let Some(cmd) = &self.cfg.child_command {
            return Ok(cmd.clone());
        }
        let exe = std::env::current_exe()
            .map_err(|e| err!(e, msg("unable to locate own executable")))?;
        Ok(vec![
            exe.display().to_string(),
            "run".to_owned(),
            "--config".to_owned(),
            self.cfg.config_path.display().to_string(),
            "--status-port".to_owned(),
            self.cfg.child_status_port.to_string(),
        ])
    }

    /// Spawns the runtime if it isn't already running.
    fn ensure_started(self: &Arc<Self>) -> Result<(), Error> {
        let mut l = self.inner.lock();
        if l.child.is_some() {
            debug!("runtime already running");
            return Ok(());
        }
        let argv = self.child_command()?;
        let mut child = match Command::new(&argv[0]).args(&argv[1..]).spawn() {
            Ok(c) => c,
            Err(e) => {
                let e = err!(e, msg("unable to spawn runtime {argv:?}"));
                l.last_error = Some(e.chain().to_string());
                return Err(e);
            }
        };
        let pid = child
            .id()
            .ok_or_else(|| err!(Internal, msg("spawned child has no pid")))?;
        info!(pid, "runtime started");
        l.child = Some(RunningChild {
            pid,
            started_at: jiff::Timestamp::now(),
        });
        l.stopping = false;
        l.last_error = None;
        drop(l);

        let this = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let mut l = this.inner.lock();
            let stopping = l.stopping;
            l.child = None;
            match status {
                Ok(s) => {
                    let exit = s.to_string();
                    if !stopping && !s.success() {
                        warn!(status = %s, "runtime exited abnormally");
                        l.last_error = Some(format!("runtime exited: {exit}"));
                    } else {
                        info!(status = %s, "runtime exited");
                    }
                    l.last_exit = Some(exit);
                }
                Err(e) => {
                    warn!(err = %e, "unable to wait for runtime");
                    l.last_exit = Some(format!("wait error: {e}"));
                }
            }
        });
        Ok(())
    }

    async fn fetch_agent_snapshot(&self) -> Option<AgentSnapshot> {
        let url = format!("http://127.0.0.1:{}/status", self.cfg.child_status_port);
        let resp = self.http.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json().await.ok()
    }

    fn manager_status(&self) -> ManagerStatus {
        let l = self.inner.lock();
        ManagerStatus {
            state: match (&l.child, l.stopping) {
                (Some(_), true) => "stopping",
                (Some(_), false) => "running",
                (None, _) => "idle",
            }
            .to_owned(),
            pid: l.child.as_ref().map(|c| c.pid),
            autostart: self.cfg.autostart,
            started_at: l.child.as_ref().map(|c| c.started_at.to_string()),
            last_exit: l.last_exit.clone(),
            last_error: l.last_error.clone(),
        }
    }
}

#[async_trait]
impl Manager for Arc<Supervisor> {
    async fn status(&self) -> TopLevelStatus {
        let agent = if self.inner.lock().child.is_some() {
            self.fetch_agent_snapshot().await
        } else {
            None
        };
        TopLevelStatus {
            manager: self.manager_status(),
            agent,
        }
    }

    async fn start_gated(
        &self,
        wait: WaitCond,
        timeout: Duration,
        min_frames: u64,
    ) -> Result<StartOutcome, Error> {
        self.ensure_started()?;
        if wait == WaitCond::None {
            return Ok(StartOutcome::Ready(self.status().await));
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(snap) = self.fetch_agent_snapshot().await {
                let satisfied = match wait {
                    WaitCond::None => true,
                    WaitCond::Heartbeat => snap.frames_processed >= min_frames,
                    WaitCond::Detection => snap.detections_total >= 1,
                    WaitCond::Session => snap.sessions_opened >= 1,
                };
                if satisfied {
                    return Ok(StartOutcome::Ready(TopLevelStatus {
                        manager: self.manager_status(),
                        agent: Some(snap),
                    }));
                }
            }
            if self.inner.lock().child.is_none() {
                bail!(
                    FailedPrecondition,
                    msg("runtime exited while waiting for readiness")
                );
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(StartOutcome::Timeout(self.status().await));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn stop(&self) {
        let pid = {
            let mut l = self.inner.lock();
            let Some(child) = &l.child else {
                debug!("stop requested but runtime not running");
                return;
            };
            let pid = child.pid;
            l.stopping = true;
            pid
        };
        info!(pid, "stopping runtime");
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(err = %e, "SIGTERM failed; child probably gone");
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STOP_ESCALATION).await;
            let still = this
                .inner
                .lock()
                .child
                .as_ref()
                .is_some_and(|c| c.pid == pid);
            if still {
                warn!(pid, "runtime ignored SIGTERM; killing");
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(child_command: Vec<&str>, child_status_port: u16) -> SupervisorConfig {
        SupervisorConfig {
            config_path: PathBuf::from("/tmp/unused.toml"),
            child_status_port,
            autostart: false,
            child_command: Some(child_command.iter().map(|s| s.to_string()).collect()),
        }
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let s = Supervisor::new(config(vec!["sleep", "30"], 1));
        let status = s.status().await;
        assert_eq!(status.manager.state, "idle");

        match s
            .start_gated(WaitCond::None, Duration::from_secs(1), 3)
            .await
            .unwrap()
        {
            StartOutcome::Ready(st) => assert_eq!(st.manager.state, "running"),
            StartOutcome::Timeout(_) => panic!("wait=none never times out"),
        }
        // Idempotent start.
        s.start_gated(WaitCond::None, Duration::from_secs(1), 3)
            .await
            .unwrap();

        s.stop().await;
        // sleep(1) exits on SIGTERM; wait for the monitor to notice.
        for _ in 0..50 {
            if s.status().await.manager.state == "idle" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let status = s.status().await;
        assert_eq!(status.manager.state, "idle");
        assert!(status.manager.last_exit.is_some());
        // Stop is idempotent.
        s.stop().await;
    }

    #[tokio::test]
    async fn spawn_failure_records_last_error() {
        let s = Supervisor::new(config(vec!["/nonexistent/nightjar-binary"], 1));
        let e = s
            .start_gated(WaitCond::None, Duration::from_secs(1), 3)
            .await
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::NotFound);
        let status = s.status().await;
        assert_eq!(status.manager.state, "idle");
        assert!(status.manager.last_error.is_some());
    }

    #[tokio::test]
    async fn heartbeat_gate_times_out_without_child_endpoint() {
        // The child runs but never serves a status endpoint; the gate must
        // report a timeout, not hang.
        let s = Supervisor::new(config(vec!["sleep", "30"], 59998));
        match s
            .start_gated(WaitCond::Heartbeat, Duration::from_millis(600), 3)
            .await
            .unwrap()
        {
            StartOutcome::Timeout(st) => assert_eq!(st.manager.state, "running"),
            StartOutcome::Ready(_) => panic!("no endpoint, cannot be ready"),
        }
        s.stop().await;
    }
}
