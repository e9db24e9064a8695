// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Always-on camera hub: supervises the external capture pipeline that
//! fills the shared-memory transport consumed by the downscaler and the
//! publisher.
//!
//! Readiness is the AND of two observations: the child printed a PLAYING
//! report on stdout, and the transport endpoint exists on the filesystem.
//! A child that dies while not stopped is restarted with exponential
//! backoff; the attempt counter resets after 30 s of sustained readiness.

use crate::config::{expand_template, CameraConfig};
use base::{err, Error, Mutex};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Marker the capture pipeline prints when its pipeline reaches PLAYING.
const PLAYING_MARKER: &str = "PLAYING";

/// How long to wait after SIGINT before escalating to SIGKILL.
const STOP_GRACE: Duration = Duration::from_millis(1500);

/// Known-noisy child stderr fragments, logged at debug instead of warn.
const NOISY_STDERR: [&str; 4] = [
    "Redistribute latency",
    "lost frames detected",
    "timestamping error",
    "deprecated pad template",
];

/// Restart attempts past this threshold are logged at error level.
const ATTEMPT_ERROR_THRESHOLD: u32 = 5;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum HubState {
    Stopped,
    Starting,
    Ready,
    Backoff,
}

#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub cap: Duration,

    /// Sustained readiness after which the attempt counter resets.
    pub reset_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_secs(2),
            factor: 1.5,
            cap: Duration::from_secs(15),
            reset_after: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let d = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(d.min(self.cap.as_secs_f64()))
    }
}

pub struct CameraHub {
    cfg: CameraConfig,
    backoff: BackoffPolicy,
    state_tx: watch::Sender<HubState>,
    stop_requested: AtomicBool,
    stop_notify: Notify,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CameraHub {
    pub fn new(cfg: CameraConfig) -> Arc<Self> {
        Self::with_backoff(cfg, BackoffPolicy::default())
    }

    pub fn with_backoff(cfg: CameraConfig, backoff: BackoffPolicy) -> Arc<Self> {
        let (state_tx, _) = watch::channel(HubState::Stopped);
        Arc::new(CameraHub {
            cfg,
            backoff,
            state_tx,
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
            task: Mutex::new(None),
        })
    }

    pub fn state(&self) -> watch::Receiver<HubState> {
        self.state_tx.subscribe()
    }

    /// Spawns the supervisor task. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        let hub = self.clone();
        *task = Some(tokio::spawn(async move { hub.supervise().await }));
    }

    /// Requests stop and waits for the child to be gone and the transport
    /// endpoint removed.
    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Waits until the hub reports ready, or the timeout elapses.
    pub async fn await_ready(&self, timeout: Duration) -> Result<(), Error> {
        let mut rx = self.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == HubState::Ready))
            .await
            .map_err(|_| err!(DeadlineExceeded, msg("camera hub not ready within {timeout:?}")))?
            .map_err(|_| err!(Internal, msg("camera hub supervisor gone")))?;
        Ok(())
    }

    async fn supervise(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            self.state_tx.send_replace(HubState::Starting);
            let playing = Arc::new(AtomicBool::new(false));
            let mut child = match self.spawn_pipeline(&playing) {
                Ok(c) => c,
                Err(e) => {
                    error!(err = %e.chain(), "unable to spawn capture pipeline");
                    self.backoff_sleep(&mut attempt, None).await;
                    continue;
                }
            };
            info!(pid = child.id(), "capture pipeline started");

            let ready_at = self.watch_until_exit(&mut child, &playing).await;
            if self.stop_requested.load(Ordering::SeqCst) {
                stop_child(&mut child, STOP_GRACE).await;
                self.remove_endpoint();
                break;
            }
            self.remove_endpoint();
            warn!("capture pipeline exited unexpectedly");
            self.backoff_sleep(&mut attempt, ready_at).await;
        }
        self.state_tx.send_replace(HubState::Stopped);
        debug!("camera hub stopped");
    }

    /// Runs one child until it exits or stop is requested; reports
    /// readiness transitions on the way. Returns when readiness was first
    /// reached, if it was.
    async fn watch_until_exit(
        &self,
        child: &mut Child,
        playing: &Arc<AtomicBool>,
    ) -> Option<tokio::time::Instant> {
        let mut poll = tokio::time::interval(Duration::from_millis(100));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ready_at = None;
        loop {
            // Register for the stop notification *before* re-checking the
            // flag, so a stop between iterations cannot be missed.
            let stop = self.stop_notify.notified();
            tokio::pin!(stop);
            stop.as_mut().enable();
            if self.stop_requested.load(Ordering::SeqCst) {
                return ready_at;
            }
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(s) => debug!(status = %s, "capture pipeline exit status"),
                        Err(e) => warn!(err = %e, "error waiting for capture pipeline"),
                    }
                    return ready_at;
                }
                _ = &mut stop => return ready_at,
                _ = poll.tick() => {
                    let is_ready = playing.load(Ordering::SeqCst)
                        && self.cfg.transport_path.exists();
                    let was_ready = *self.state_tx.borrow() == HubState::Ready;
                    if is_ready && !was_ready {
                        info!(path = %self.cfg.transport_path.display(), "camera hub ready");
                        ready_at.get_or_insert_with(tokio::time::Instant::now);
                        self.state_tx.send_replace(HubState::Ready);
                    } else if !is_ready && was_ready {
                        warn!("camera hub lost readiness");
                        self.state_tx.send_replace(HubState::Starting);
                    }
                }
            }
        }
    }

    fn spawn_pipeline(&self, playing: &Arc<AtomicBool>) -> Result<Child, Error> {
        let cmd = expand_template(
            &self.cfg.pipeline,
            &[(
                "path",
                self.cfg.transport_path.display().to_string(),
            )],
        );
        debug!(%cmd, "spawning capture pipeline");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| err!(e, msg("spawning capture pipeline {cmd:?}")))?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let playing = playing.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.contains(PLAYING_MARKER) {
                    playing.store(true, Ordering::SeqCst);
                }
                debug!(target: "nightjar_agent::hub::child", "{line}");
            }
        });

        let stderr = child.stderr.take().expect("stderr was piped");
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if NOISY_STDERR.iter().any(|n| line.contains(n)) {
                    debug!(target: "nightjar_agent::hub::child", "{line}");
                } else {
                    warn!(target: "nightjar_agent::hub::child", "{line}");
                }
            }
        });
        Ok(child)
    }

    async fn backoff_sleep(&self, attempt: &mut u32, ready_at: Option<tokio::time::Instant>) {
        if let Some(at) = ready_at {
            if at.elapsed() >= self.backoff.reset_after {
                *attempt = 0;
            }
        }
        let delay = self.backoff.delay(*attempt);
        *attempt += 1;
        if *attempt > ATTEMPT_ERROR_THRESHOLD {
            error!(attempt, ?delay, "capture pipeline keeps crashing");
        } else {
            info!(attempt, ?delay, "restarting capture pipeline after backoff");
        }
        self.state_tx.send_replace(HubState::Backoff);
        let stop = self.stop_notify.notified();
        tokio::pin!(stop);
        stop.as_mut().enable();
        if self.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut stop => {}
        }
    }

    fn remove_endpoint(&self) {
        match std::fs::remove_file(&self.cfg.transport_path) {
            Ok(()) => debug!(path = %self.cfg.transport_path.display(), "removed transport endpoint"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(err = %e, "unable to remove transport endpoint"),
        }
    }
}

/// Interrupts a child, escalating to SIGKILL after `grace`.
pub(crate) async fn stop_child(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return; // already reaped
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        debug!(err = %e, pid, "SIGINT failed; child probably gone");
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(pid, "child ignored SIGINT; killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn camera_cfg(pipeline: &str, transport: PathBuf) -> CameraConfig {
        CameraConfig {
            width: 640,
            height: 360,
            fps: 10,
            pipeline: pipeline.to_owned(),
            transport_path: transport,
            shm_bytes: None,
            ready_timeout_ms: 5000,
        }
    }

    #[test]
    fn backoff_ladder() {
        let b = BackoffPolicy::default();
        assert_eq!(b.delay(0), Duration::from_secs(2));
        assert_eq!(b.delay(1), Duration::from_secs(3));
        assert_eq!(b.delay(2), Duration::from_millis(4500));
        // Capped at 15s.
        assert_eq!(b.delay(10), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn ready_requires_playing_and_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let transport = dir.path().join("shm.sock");
        // The pipeline reports PLAYING, then creates the endpoint, then
        // stays alive.
        let pipeline = format!(
            "echo PLAYING && sleep 0.2 && touch {} && sleep 30",
            transport.display()
        );
        let hub = CameraHub::new(camera_cfg(&pipeline, transport.clone()));
        hub.start();
        hub.await_ready(Duration::from_secs(5)).await.unwrap();
        assert!(transport.exists());
        hub.stop().await;
        // Endpoint removed after exit.
        assert!(!transport.exists());
        assert_eq!(*hub.state().borrow(), HubState::Stopped);
    }

    #[tokio::test]
    async fn no_playing_marker_never_ready() {
        let dir = tempfile::tempdir().unwrap();
        let transport = dir.path().join("shm.sock");
        let pipeline = format!("touch {} && sleep 30", transport.display());
        let hub = CameraHub::new(camera_cfg(&pipeline, transport));
        hub.start();
        let e = hub.await_ready(Duration::from_millis(500)).await.unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::DeadlineExceeded);
        hub.stop().await;
    }

    #[tokio::test]
    async fn crash_restarts_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let transport = dir.path().join("shm.sock");
        let counter = dir.path().join("count");
        // Exits immediately, appending to a counter file each run.
        let pipeline = format!("echo run >> {}", counter.display());
        let hub = CameraHub::with_backoff(
            camera_cfg(&pipeline, transport),
            BackoffPolicy {
                initial: Duration::from_millis(20),
                factor: 1.5,
                cap: Duration::from_millis(50),
                reset_after: Duration::from_secs(30),
            },
        );
        hub.start();
        tokio::time::sleep(Duration::from_millis(400)).await;
        hub.stop().await;
        let runs = std::fs::read_to_string(&counter).unwrap_or_default();
        assert!(runs.lines().count() >= 2, "expected restarts, got {runs:?}");
    }
}
