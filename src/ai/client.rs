// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Client side of AI Protocol v1.
//!
//! One long-lived task owns the TCP connection:
//! `DISCONNECTED → CONNECTING → CONNECTED → READY` with `DRAINING` during
//! shutdown. Flow control is credit-only — `Result` and `WindowUpdate` both
//! credit back, saturating at the negotiated window — and the feeder is
//! admitted through [`AiClient::can_send`] / [`AiClient::send_frame`]
//! snapshots without ever touching the connection directly.
//!
//! On connection loss the client reconnects on a fixed delay ladder and
//! replays `Init` (the worker tolerates re-init). Frames in flight at the
//! time of the loss are abandoned; their results are dropped silently.

use crate::ai::proto::{self, Envelope, Init, InitOk};
use crate::frame::{Frame, InferenceResult, PixelFormat};
use crate::metrics::Metrics;
use base::clock::Clocks;
use base::{bail, err, Error, FastHashMap, Mutex};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before each reconnect attempt; the last entry repeats.
pub const RECONNECT_DELAYS: [Duration; 5] = [
    Duration::from_millis(500),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

const SHUTDOWN_LINGER: Duration = Duration::from_millis(100);

/// Worker `Error.code` values at or above this indicate unrecoverable model
/// state; the client drops the connection and re-inits.
const FATAL_WORKER_CODE: u32 = 100;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Draining,
}

/// Snapshot of the negotiated connection, watched by the feeder. `epoch`
/// increments at every successful handshake; the feeder resets its frame id
/// counter to 1 when it changes.
#[derive(Clone, Debug)]
pub struct ConnInfo {
    pub epoch: u64,
    pub ready: bool,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl Default for ConnInfo {
    fn default() -> Self {
        ConnInfo {
            epoch: 0,
            ready: false,
            format: PixelFormat::Nv12,
            width: 0,
            height: 0,
        }
    }
}

/// Why [`AiClient::send_frame`] refused a frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SendError {
    /// Not in READY state.
    NotReady,

    /// No credit available or a frame is already in flight.
    NoCredit,

    /// Larger than the negotiated `max_frame_bytes`; rejected locally.
    Oversize,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SendError::NotReady => "client not ready",
            SendError::NoCredit => "no credit available",
            SendError::Oversize => "frame exceeds negotiated max_frame_bytes",
        })
    }
}

impl std::error::Error for SendError {}

struct Pending {
    sent_mono_ns: u64,
}

struct Shared {
    state: ClientState,
    credits: u32,
    initial_credits: u32,
    inflight: u32,
    max_frame_bytes: u64,
    writer_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Correlation map for in-flight frames on the current connection.
    pending: FastHashMap<u64, Pending>,
}

pub struct AiClientConfig {
    pub addr: String,
    pub init: Init,
    pub heartbeat_interval: Duration,
    pub liveness_timeout: Duration,
}

impl AiClientConfig {
    pub fn new(addr: String, init: Init) -> Self {
        AiClientConfig {
            addr,
            init,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            liveness_timeout: LIVENESS_TIMEOUT,
        }
    }
}

pub struct AiClient {
    cfg: AiClientConfig,
    clocks: Arc<dyn Clocks>,
    metrics: Arc<Metrics>,
    shared: Mutex<Shared>,
    can_send_notify: Notify,
    conn_tx: watch::Sender<ConnInfo>,
}

enum Closed {
    /// Graceful shutdown; do not reconnect.
    Shutdown,
}

impl AiClient {
    pub fn new(cfg: AiClientConfig, clocks: Arc<dyn Clocks>, metrics: Arc<Metrics>) -> Arc<Self> {
        let (conn_tx, _) = watch::channel(ConnInfo::default());
        Arc::new(AiClient {
            cfg,
            clocks,
            metrics,
            shared: Mutex::new(Shared {
                state: ClientState::Disconnected,
                credits: 0,
                initial_credits: 0,
                inflight: 0,
                max_frame_bytes: 0,
                writer_tx: None,
                pending: FastHashMap::default(),
            }),
            can_send_notify: Notify::new(),
            conn_tx,
        })
    }

    pub fn state(&self) -> ClientState {
        self.shared.lock().state
    }

    /// Watch handle over the negotiated connection info.
    pub fn conn_info(&self) -> watch::Receiver<ConnInfo> {
        self.conn_tx.subscribe()
    }

    /// Non-blocking admission snapshot: READY, credit available, and no
    /// frame in flight.
    pub fn can_send(&self) -> bool {
        let l = self.shared.lock();
        l.state == ClientState::Ready
            && l.credits > 0
            && l.inflight == 0
            && l.writer_tx.is_some()
    }

    /// Waits until [`Self::can_send`] is true.
    pub async fn wait_can_send(&self) {
        loop {
            if self.can_send() {
                return;
            }
            self.can_send_notify.notified().await;
        }
    }

    /// Reserves a credit and queues the frame for the writer. The caller
    /// must have cached the frame already; the bytes are copied into the
    /// wire buffer here.
    pub fn send_frame(&self, frame: &Frame) -> Result<(), SendError> {
        let tx = {
            let mut l = self.shared.lock();
            if l.state != ClientState::Ready {
                return Err(SendError::NotReady);
            }
            if l.credits == 0 || l.inflight > 0 {
                return Err(SendError::NoCredit);
            }
            if l.max_frame_bytes > 0 && frame.data.len() as u64 > l.max_frame_bytes {
                return Err(SendError::Oversize);
            }
            let Some(tx) = l.writer_tx.clone() else {
                return Err(SendError::NotReady);
            };
            l.credits -= 1;
            l.inflight += 1;
            l.pending.insert(
                frame.frame_id,
                Pending {
                    sent_mono_ns: self.clocks.monotonic_ns(),
                },
            );
            self.metrics.ai_inflight.set(l.inflight as i64);
            self.metrics.ai_window_size.set(l.credits as i64);
            tx
        };
        let framed = proto::frame_framed(frame);
        if tx.try_send(framed).is_err() {
            // The connection died between the check and the enqueue; undo
            // the reservation. The frame is treated like any other refused
            // admission by the feeder.
            let mut l = self.shared.lock();
            l.pending.remove(&frame.frame_id);
            l.credits += 1;
            l.inflight = l.inflight.saturating_sub(1);
            self.metrics.ai_inflight.set(l.inflight as i64);
            self.metrics.ai_window_size.set(l.credits as i64);
            return Err(SendError::NotReady);
        }
        self.metrics.ai_frames_sent_total.inc();
        Ok(())
    }

    /// Runs the connection loop until shutdown. Received results are
    /// delivered to `results_tx`; when that queue is full the result is
    /// dropped with a warning (the bus downstream is lossy anyway).
    pub async fn run(
        self: Arc<Self>,
        results_tx: mpsc::Sender<InferenceResult>,
        shutdown_rx: base::shutdown::Receiver,
    ) {
        let mut attempt = 0usize;
        loop {
            if shutdown_rx.check().is_err() {
                break;
            }
            self.set_state(ClientState::Connecting);
            match self.connect_and_serve(&results_tx, &shutdown_rx).await {
                Ok(Closed::Shutdown) => {
                    self.teardown(false);
                    break;
                }
                Err(e) => {
                    let was_ready = self.teardown(true);
                    if was_ready {
                        attempt = 0;
                    }
                    warn!(err = %e.chain(), attempt, "worker connection lost");
                }
            }
            let delay = RECONNECT_DELAYS[attempt.min(RECONNECT_DELAYS.len() - 1)];
            attempt += 1;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.wait() => break,
            }
        }
        self.set_state(ClientState::Disconnected);
        debug!("ai client stopped");
    }

    fn set_state(&self, state: ClientState) {
        self.shared.lock().state = state;
    }

    /// Clears per-connection state. Returns whether the connection had
    /// completed its handshake (used to reset the backoff ladder and to
    /// count reconnects).
    fn teardown(&self, count_reconnect: bool) -> bool {
        let mut l = self.shared.lock();
        let was_ready = matches!(l.state, ClientState::Ready | ClientState::Draining);
        let abandoned = l.pending.len();
        l.pending.clear();
        l.writer_tx = None;
        l.credits = 0;
        l.inflight = 0;
        l.state = ClientState::Disconnected;
        drop(l);
        if abandoned > 0 {
            debug!(abandoned, "abandoning in-flight frames");
        }
        if was_ready && count_reconnect {
            self.metrics.ai_reconnects_total.inc();
        }
        self.metrics.ai_inflight.set(0);
        self.metrics.ai_window_size.set(0);
        self.conn_tx.send_modify(|c| c.ready = false);
        was_ready
    }

    async fn connect_and_serve(
        &self,
        results_tx: &mpsc::Sender<InferenceResult>,
        shutdown_rx: &base::shutdown::Receiver,
    ) -> Result<Closed, Error> {
        let stream = TcpStream::connect(&self.cfg.addr)
            .await
            .map_err(|e| err!(e, msg("unable to connect to worker {}", self.cfg.addr)))?;
        stream.set_nodelay(true)?;
        set_keepalive(&stream)?;
        self.set_state(ClientState::Connected);

        let (mut rd, mut wr) = stream.into_split();

        // Handshake: Init, then InitOk before anything else may flow.
        wr.write_all(&Envelope::Init(self.cfg.init.clone()).encode_framed())
            .await?;
        let ok = match tokio::time::timeout(self.cfg.liveness_timeout, read_envelope(&mut rd))
            .await
            .map_err(|_| err!(DeadlineExceeded, msg("no InitOk within liveness timeout")))??
        {
            Envelope::InitOk(ok) => ok,
            Envelope::Error { code, message } => {
                bail!(FailedPrecondition, msg("worker refused init: {code} {message}"))
            }
            other => bail!(DataLoss, msg("expected InitOk, got {other:?}")),
        };
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(2);
        self.install_connection(&ok, writer_tx);
        info!(
            format = ok.chosen_format.as_str(),
            width = ok.width,
            height = ok.height,
            credits = ok.initial_credits,
            max_frame_bytes = ok.max_frame_bytes,
            "worker handshake complete"
        );

        // The read half moves to its own task so a partial read is never
        // cancelled mid-message by the select below.
        let (in_tx, mut in_rx) = mpsc::channel::<Result<Envelope, Error>>(8);
        let reader = tokio::spawn(async move {
            loop {
                let r = read_envelope(&mut rd).await;
                let failed = r.is_err();
                if in_tx.send(r).await.is_err() || failed {
                    break;
                }
            }
        });
        let served = self
            .serve_ready(&mut wr, &mut writer_rx, &mut in_rx, results_tx, shutdown_rx)
            .await;
        reader.abort();
        served
    }

    fn install_connection(&self, ok: &InitOk, writer_tx: mpsc::Sender<Vec<u8>>) {
        {
            let mut l = self.shared.lock();
            l.state = ClientState::Ready;
            l.credits = ok.initial_credits;
            l.initial_credits = ok.initial_credits;
            l.inflight = 0;
            l.max_frame_bytes = ok.max_frame_bytes;
            l.pending.clear();
            l.writer_tx = Some(writer_tx);
            self.metrics.ai_window_size.set(l.credits as i64);
            self.metrics.ai_inflight.set(0);
        }
        self.conn_tx.send_modify(|c| {
            c.epoch += 1;
            c.ready = true;
            c.format = ok.chosen_format;
            c.width = ok.width;
            c.height = ok.height;
        });
        self.can_send_notify.notify_one();
    }

    async fn serve_ready(
        &self,
        wr: &mut OwnedWriteHalf,
        writer_rx: &mut mpsc::Receiver<Vec<u8>>,
        in_rx: &mut mpsc::Receiver<Result<Envelope, Error>>,
        results_tx: &mpsc::Sender<InferenceResult>,
        shutdown_rx: &base::shutdown::Receiver,
    ) -> Result<Closed, Error> {
        let mut heartbeat = tokio::time::interval(self.cfg.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_rx = tokio::time::Instant::now();
        loop {
            let liveness = tokio::time::sleep_until(last_rx + self.cfg.liveness_timeout);
            tokio::select! {
                _ = shutdown_rx.wait() => {
                    self.set_state(ClientState::Draining);
                    let _ = wr.write_all(&Envelope::Shutdown.encode_framed()).await;
                    tokio::time::sleep(SHUTDOWN_LINGER).await;
                    return Ok(Closed::Shutdown);
                }
                incoming = in_rx.recv() => match incoming {
                    None => bail!(Unavailable, msg("worker closed the connection")),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(envelope)) => {
                        last_rx = tokio::time::Instant::now();
                        self.handle_envelope(envelope, results_tx)?;
                    }
                },
                outgoing = writer_rx.recv() => {
                    // The sender half lives in `shared`; it is never dropped
                    // while this connection serves.
                    let framed = outgoing.expect("writer_tx outlives serve_ready");
                    wr.write_all(&framed).await?;
                }
                _ = heartbeat.tick() => {
                    let hb = Envelope::Heartbeat { ts_mono_ns: self.clocks.monotonic_ns() };
                    wr.write_all(&hb.encode_framed()).await?;
                }
                _ = liveness => {
                    bail!(
                        DeadlineExceeded,
                        msg("no traffic from worker for {:?}", self.cfg.liveness_timeout)
                    );
                }
            }
        }
    }

    fn handle_envelope(
        &self,
        envelope: Envelope,
        results_tx: &mpsc::Sender<InferenceResult>,
    ) -> Result<(), Error> {
        match envelope {
            Envelope::Result(result) => {
                self.metrics.ai_results_total.inc();
                let known = {
                    let mut l = self.shared.lock();
                    l.credits = (l.credits + 1).min(l.initial_credits);
                    l.inflight = l.inflight.saturating_sub(1);
                    self.metrics.ai_inflight.set(l.inflight as i64);
                    self.metrics.ai_window_size.set(l.credits as i64);
                    l.pending.remove(&result.frame_id)
                };
                self.can_send_notify.notify_one();
                match known {
                    Some(pending) => {
                        let latency_ns =
                            self.clocks.monotonic_ns().saturating_sub(pending.sent_mono_ns);
                        self.metrics
                            .ai_result_latency_ms
                            .observe(latency_ns as f64 / 1e6);
                        if results_tx.try_send(result).is_err() {
                            warn!("result queue full; dropping result");
                        }
                    }
                    None => {
                        debug!(
                            frame_id = result.frame_id,
                            "result for unknown or duplicate frame id; dropping"
                        );
                    }
                }
            }
            Envelope::WindowUpdate { credits } => {
                let mut l = self.shared.lock();
                l.credits = (l.credits + credits).min(l.initial_credits);
                l.inflight = l.inflight.saturating_sub(credits);
                self.metrics.ai_inflight.set(l.inflight as i64);
                self.metrics.ai_window_size.set(l.credits as i64);
                drop(l);
                self.can_send_notify.notify_one();
            }
            Envelope::Error { code, message } => {
                warn!(code, message = %message, "worker reported error");
                if code >= FATAL_WORKER_CODE {
                    bail!(
                        FailedPrecondition,
                        msg("worker reported fatal state ({code}); reconnecting")
                    );
                }
            }
            Envelope::Heartbeat { .. } => {}
            Envelope::Shutdown => bail!(Unavailable, msg("worker requested shutdown")),
            other @ (Envelope::Init(_) | Envelope::InitOk(_) | Envelope::Frame(_)) => {
                bail!(DataLoss, msg("unexpected envelope from worker: {other:?}"))
            }
        }
        Ok(())
    }
}

async fn read_envelope(rd: &mut OwnedReadHalf) -> Result<Envelope, Error> {
    let mut prefix = [0u8; 4];
    rd.read_exact(&mut prefix)
        .await
        .map_err(|e| err!(e, msg("reading length prefix")))?;
    let len = proto::payload_len(prefix)?;
    let mut buf = vec![0u8; len];
    rd.read_exact(&mut buf)
        .await
        .map_err(|e| err!(e, msg("reading {len}-byte payload")))?;
    Envelope::decode(&buf)
}

/// Enables TCP keepalive on the connection's socket.
fn set_keepalive(stream: &TcpStream) -> Result<(), Error> {
    let fd = stream.as_raw_fd();
    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(err!(
            std::io::Error::last_os_error(),
            msg("unable to enable TCP keepalive")
        ));
    }
    Ok(())
}
