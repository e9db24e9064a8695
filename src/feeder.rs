// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! AI feeder: owns the downscaler subprocess, assigns frame ids, and
//! admits frames to the worker under credit-based flow control.
//!
//! Frame ids start at 1 per worker connection and reset when the client's
//! connection epoch changes. A mode switch (idle/active target rate)
//! restarts the downscaler; ids keep incrementing across such restarts so
//! no id is ever delivered twice within a connection.
//!
//! Admission is **latest-wins**: when the client refuses a frame, a single
//! deferred slot holds the most recent candidate and every displaced frame
//! increments `ai_drops_latestwins_total`.

use crate::ai::client::{AiClient, SendError};
use crate::ai::ConnInfo;
use crate::cache::FrameCache;
use crate::config::{expand_template, AiConfig};
use crate::frame::{
    i420_planes, nv12_frame_bytes, nv12_planes, Frame, PixelFormat,
};
use crate::fsm::FpsMode;
use crate::hub::stop_child;
use crate::metrics::Metrics;
use async_trait::async_trait;
use base::clock::Clocks;
use bytes::Bytes;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Grace for downscaler restarts; it holds no external resources worth a
/// long goodbye.
const SCALER_STOP_GRACE: Duration = Duration::from_millis(300);

/// Admission interface to the AI client, mockable in tests.
#[async_trait]
pub trait FrameSink: Send + Sync {
    fn can_send(&self) -> bool;
    fn send(&self, frame: &Frame) -> Result<(), SendError>;
    async fn wait_can_send(&self);
}

#[async_trait]
impl FrameSink for AiClient {
    fn can_send(&self) -> bool {
        AiClient::can_send(self)
    }

    fn send(&self, frame: &Frame) -> Result<(), SendError> {
        self.send_frame(frame)
    }

    async fn wait_can_send(&self) {
        AiClient::wait_can_send(self).await
    }
}

pub struct Feeder {
    cfg: AiConfig,
    transport_path: PathBuf,
    sink: Arc<dyn FrameSink>,
    cache: Arc<FrameCache>,
    clocks: Arc<dyn Clocks>,
    metrics: Arc<Metrics>,
    conn_rx: watch::Receiver<ConnInfo>,
    mode_rx: watch::Receiver<FpsMode>,
}

/// Creates the mode channel; the orchestrator's AI adapter holds the
/// sender.
pub fn mode_channel() -> (watch::Sender<FpsMode>, watch::Receiver<FpsMode>) {
    watch::channel(FpsMode::Idle)
}

impl Feeder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: AiConfig,
        transport_path: PathBuf,
        sink: Arc<dyn FrameSink>,
        cache: Arc<FrameCache>,
        clocks: Arc<dyn Clocks>,
        metrics: Arc<Metrics>,
        conn_rx: watch::Receiver<ConnInfo>,
        mode_rx: watch::Receiver<FpsMode>,
    ) -> Self {
        Feeder {
            cfg,
            transport_path,
            sink,
            cache,
            clocks,
            metrics,
            conn_rx,
            mode_rx,
        }
    }

    fn fps_for(&self, mode: FpsMode) -> u32 {
        match mode {
            FpsMode::Idle => self.cfg.idle_fps,
            FpsMode::Active => self.cfg.active_fps,
        }
    }

    pub async fn run(mut self, shutdown_rx: base::shutdown::Receiver) {
        loop {
            // Wait for a ready connection with a raw negotiated format.
            let conn = tokio::select! {
                _ = shutdown_rx.wait() => break,
                r = self.conn_rx.wait_for(|c| c.ready) => match r {
                    Ok(c) => c.clone(),
                    Err(_) => break,
                },
            };
            if !conn.format.is_raw() {
                warn!(
                    format = conn.format.as_str(),
                    "negotiated format is not raw; feeder requires NV12 or I420"
                );
                if self.conn_rx.changed().await.is_err() {
                    break;
                }
                continue;
            }
            info!(epoch = conn.epoch, "feeding worker connection");
            if self.serve_connection(&conn, &shutdown_rx).await.is_none() {
                break; // shutdown
            }
        }
        debug!("feeder stopped");
    }

    /// Feeds one worker connection. Returns `None` on shutdown, `Some(())`
    /// when the connection epoch changed.
    async fn serve_connection(
        &mut self,
        conn: &ConnInfo,
        shutdown_rx: &base::shutdown::Receiver,
    ) -> Option<()> {
        // The mono/wall pairing is taken once per connection and reused for
        // every frame's ts_utc_ns.
        let mono_base = self.clocks.monotonic_ns();
        let utc_base = {
            let ts = self.clocks.realtime();
            ts.as_nanosecond() as u64
        };
        let mut next_id: u64 = 1;
        let mut deferred: Option<Arc<Frame>> = None;
        let frame_bytes = nv12_frame_bytes(conn.width, conn.height);

        loop {
            let mode = *self.mode_rx.borrow_and_update();
            let fps = self.fps_for(mode);
            let (mut child, mut frames_rx) = match self.spawn_scaler(conn, fps, frame_bytes) {
                Ok(v) => v,
                Err(e) => {
                    warn!(err = %e.chain(), "unable to spawn downscaler; retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(2)) => continue,
                        _ = shutdown_rx.wait() => return None,
                    }
                }
            };
            debug!(?mode, fps, "downscaler running");

            let outcome = loop {
                tokio::select! {
                    _ = shutdown_rx.wait() => break ScalerOutcome::Shutdown,
                    r = self.conn_rx.changed() => {
                        if r.is_err() || self.conn_rx.borrow().epoch != conn.epoch
                            || !self.conn_rx.borrow().ready
                        {
                            break ScalerOutcome::ConnectionChanged;
                        }
                    }
                    r = self.mode_rx.changed() => {
                        if r.is_err() {
                            break ScalerOutcome::Shutdown;
                        }
                        if *self.mode_rx.borrow() != mode {
                            debug!("fps mode changed; restarting downscaler");
                            break ScalerOutcome::Restart;
                        }
                    }
                    data = frames_rx.recv() => match data {
                        None => {
                            warn!("downscaler stream ended; restarting");
                            break ScalerOutcome::Restart;
                        }
                        Some(data) => {
                            let frame = self.build_frame(conn, &mut next_id, mono_base, utc_base, data);
                            self.admit(frame, &mut deferred);
                        }
                    },
                    _ = self.sink.wait_can_send(), if deferred.is_some() => {
                        if let Some(f) = deferred.take() {
                            if let Err(e) = self.sink.send(&f) {
                                debug!(frame_id = f.frame_id, %e, "deferred send refused");
                                deferred = Some(f);
                            }
                        }
                    }
                }
            };
            stop_child(&mut child, SCALER_STOP_GRACE).await;
            match outcome {
                ScalerOutcome::Restart => continue,
                ScalerOutcome::ConnectionChanged => return Some(()),
                ScalerOutcome::Shutdown => return None,
            }
        }
    }

    fn build_frame(
        &self,
        conn: &ConnInfo,
        next_id: &mut u64,
        mono_base: u64,
        utc_base: u64,
        mut data: Vec<u8>,
    ) -> Arc<Frame> {
        if conn.format == PixelFormat::Nv12 {
            normalize_split_nv12(&mut data, conn.width as usize, conn.height as usize);
        }
        let ts_mono_ns = self.clocks.monotonic_ns();
        let frame_id = *next_id;
        *next_id += 1;
        let planes = match conn.format {
            PixelFormat::Nv12 => nv12_planes(conn.width, conn.height),
            PixelFormat::I420 => i420_planes(conn.width, conn.height),
            PixelFormat::Jpeg => Vec::new(),
        };
        Arc::new(Frame {
            frame_id,
            ts_mono_ns,
            ts_utc_ns: utc_base + (ts_mono_ns - mono_base),
            width: conn.width,
            height: conn.height,
            pixel_format: conn.format,
            planes,
            data: Bytes::from(data),
        })
    }

    /// Latest-wins admission. The frame is cached before any send attempt.
    fn admit(&self, frame: Arc<Frame>, deferred: &mut Option<Arc<Frame>>) {
        self.cache.put(frame.clone());
        if self.sink.can_send() {
            if deferred.take().is_some() {
                // The new frame supersedes the deferred one.
                self.metrics.ai_drops_latestwins_total.inc();
            }
            match self.sink.send(&frame) {
                Ok(()) => return,
                Err(SendError::Oversize) => {
                    warn!(frame_id = frame.frame_id, "frame exceeds negotiated size; dropping");
                    return;
                }
                Err(_) => {} // lost the race; defer below
            }
        }
        if deferred.replace(frame).is_some() {
            self.metrics.ai_drops_latestwins_total.inc();
        }
    }

    fn spawn_scaler(
        &self,
        conn: &ConnInfo,
        fps: u32,
        frame_bytes: usize,
    ) -> Result<(tokio::process::Child, mpsc::Receiver<Vec<u8>>), base::Error> {
        let cmd = expand_template(
            &self.cfg.scaler_pipeline,
            &[
                ("input", self.transport_path.display().to_string()),
                ("width", conn.width.to_string()),
                ("height", conn.height.to_string()),
                ("fps", fps.to_string()),
                ("format", conn.format.as_str().to_owned()),
            ],
        );
        debug!(%cmd, "spawning downscaler");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| base::err!(e, msg("spawning downscaler {cmd:?}")))?;
        let mut stdout = child.stdout.take().expect("stdout was piped");
        let (tx, rx) = mpsc::channel::<Vec<u8>>(1);
        tokio::spawn(async move {
            loop {
                let mut buf = vec![0u8; frame_bytes];
                if stdout.read_exact(&mut buf).await.is_err() {
                    return; // downscaler exited
                }
                if tx.send(buf).await.is_err() {
                    return;
                }
            }
        });
        Ok((child, rx))
    }
}

enum ScalerOutcome {
    Restart,
    ConnectionChanged,
    Shutdown,
}

/// Detects a horizontally shifted NV12 frame coming out of an unframed
/// byte stream and rotates every row back into place.
///
/// The wrap seam of a shifted frame shows up as one column whose summed
/// horizontal gradient towers over the rest of the image. Normalization is
/// skipped unless exactly such a single anomalous column exists: its score
/// must exceed 2.5x the mean column score and 1.5x the second peak.
pub fn normalize_split_nv12(data: &mut [u8], width: usize, height: usize) {
    let luma = &data[..width * height];
    let Some(shift) = detect_split_column(luma, width, height) else {
        return;
    };
    debug!(shift, "split frame detected; rotating rows");
    let (luma, chroma) = data.split_at_mut(width * height);
    for row in luma.chunks_exact_mut(width) {
        row.rotate_left(shift);
    }
    // NV12 chroma rows are byte-interleaved UV at half horizontal
    // resolution: a shift of `shift` luma pixels is `shift & !1` bytes.
    let chroma_shift = shift & !1;
    for row in chroma.chunks_exact_mut(width) {
        row.rotate_left(chroma_shift);
    }
}

/// Returns the column index of the wrap seam, if one stands out.
pub fn detect_split_column(luma: &[u8], width: usize, height: usize) -> Option<usize> {
    if width < 4 || height == 0 {
        return None;
    }
    let mut scores = vec![0u64; width];
    for row in luma.chunks_exact(width) {
        for c in 1..width {
            scores[c] += (row[c] as i64 - row[c - 1] as i64).unsigned_abs();
        }
        // Column 0's left neighbor wraps around to the end of the row.
        scores[0] += (row[0] as i64 - row[width - 1] as i64).unsigned_abs();
    }
    let mean = scores.iter().sum::<u64>() as f64 / width as f64;
    let (peak_col, peak) = scores
        .iter()
        .copied()
        .enumerate()
        .max_by_key(|&(_, s)| s)?;
    let second = scores
        .iter()
        .copied()
        .enumerate()
        .filter(|&(c, _)| c != peak_col)
        .map(|(_, s)| s)
        .max()
        .unwrap_or(0);
    if peak_col == 0 {
        // Seam at column 0 means the frame is already aligned.
        return None;
    }
    if (peak as f64) > 2.5 * mean && peak > second + second / 2 {
        Some(peak_col)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FrameCacheConfig;
    use base::clock::RealClocks;
    use base::Mutex;

    // ---- split-frame heuristic ----

    /// A luma plane with a strong vertical structure, rotated right by
    /// `shift` to simulate a mid-row stream start.
    fn shifted_luma(width: usize, height: usize, shift: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(width * height);
        for _ in 0..height {
            let mut row: Vec<u8> = (0..width).map(|c| (c * 255 / (width - 1)) as u8).collect();
            row.rotate_right(shift);
            out.extend_from_slice(&row);
        }
        out
    }

    #[test]
    fn detects_shift_column() {
        let luma = shifted_luma(64, 16, 20);
        assert_eq!(detect_split_column(&luma, 64, 16), Some(20));
    }

    #[test]
    fn aligned_frame_not_flagged() {
        let luma = shifted_luma(64, 16, 0);
        assert_eq!(detect_split_column(&luma, 64, 16), None);
    }

    #[test]
    fn flat_frame_not_flagged() {
        let luma = vec![128u8; 64 * 16];
        assert_eq!(detect_split_column(&luma, 64, 16), None);
    }

    #[test]
    fn normalize_restores_rows() {
        let (w, h) = (64usize, 16usize);
        let mut aligned = shifted_luma(w, h, 0);
        // NV12: append a chroma plane with its own gradient.
        let chroma: Vec<u8> = (0..w * h / 2).map(|i| (i % w) as u8).collect();
        aligned.extend_from_slice(&chroma);

        let mut shifted = shifted_luma(w, h, 20);
        let mut shifted_chroma = chroma.clone();
        for row in shifted_chroma.chunks_exact_mut(w) {
            row.rotate_right(20);
        }
        shifted.extend_from_slice(&shifted_chroma);

        normalize_split_nv12(&mut shifted, w, h);
        assert_eq!(shifted, aligned);
    }

    /// An odd detected shift rotates luma by the full index but chroma
    /// only down to the U/V pair boundary: 21 luma pixels, 20 chroma
    /// bytes. Rotating chroma by the raw 21 would swap U and V for every
    /// pixel.
    #[test]
    fn odd_shift_rounds_chroma_to_uv_pair() {
        let (w, h) = (64usize, 16usize);
        let mut frame = shifted_luma(w, h, 21);
        let chroma: Vec<u8> = (0..w * h / 2).map(|i| (i % w) as u8).collect();
        let mut shifted_chroma = chroma.clone();
        for row in shifted_chroma.chunks_exact_mut(w) {
            row.rotate_right(20);
        }
        frame.extend_from_slice(&shifted_chroma);

        assert_eq!(detect_split_column(&frame[..w * h], w, h), Some(21));
        normalize_split_nv12(&mut frame, w, h);
        assert_eq!(&frame[..w * h], &shifted_luma(w, h, 0)[..]);
        assert_eq!(&frame[w * h..], &chroma[..]);
    }

    // ---- latest-wins admission ----

    struct MockSink {
        open: std::sync::atomic::AtomicBool,
        sent: Mutex<Vec<u64>>,
        notify: tokio::sync::Notify,
    }

    impl MockSink {
        fn new(open: bool) -> Arc<Self> {
            Arc::new(MockSink {
                open: std::sync::atomic::AtomicBool::new(open),
                sent: Mutex::new(Vec::new()),
                notify: tokio::sync::Notify::new(),
            })
        }

        fn set_open(&self, open: bool) {
            self.open.store(open, std::sync::atomic::Ordering::SeqCst);
            if open {
                self.notify.notify_one();
            }
        }
    }

    #[async_trait]
    impl FrameSink for MockSink {
        fn can_send(&self) -> bool {
            self.open.load(std::sync::atomic::Ordering::SeqCst)
        }

        fn send(&self, frame: &Frame) -> Result<(), SendError> {
            if !self.can_send() {
                return Err(SendError::NoCredit);
            }
            self.sent.lock().push(frame.frame_id);
            Ok(())
        }

        async fn wait_can_send(&self) {
            loop {
                if self.can_send() {
                    return;
                }
                self.notify.notified().await;
            }
        }
    }

    struct FeederFixture {
        _mode_tx: watch::Sender<FpsMode>,
        _conn_tx: watch::Sender<ConnInfo>,
    }

    fn feeder_with_sink(
        sink: Arc<MockSink>,
    ) -> (Feeder, Arc<FrameCache>, Arc<Metrics>, FeederFixture) {
        let metrics = Metrics::new();
        let cache = FrameCache::new(FrameCacheConfig::default(), metrics.clone());
        let (mode_tx, mode_rx) = mode_channel();
        let (conn_tx, conn_rx) = watch::channel(ConnInfo::default());
        let f = Feeder::new(
            AiConfig {
                addr: "127.0.0.1:1".to_owned(),
                model_path: "/m".to_owned(),
                conf_threshold: 0.5,
                scaler_pipeline: "unused".to_owned(),
                idle_fps: 2,
                active_fps: 8,
                max_inflight: 1,
            },
            PathBuf::from("/tmp/unused.sock"),
            sink,
            cache.clone(),
            Arc::new(RealClocks::default()),
            metrics.clone(),
            conn_rx,
            mode_rx,
        );
        (
            f,
            cache,
            metrics,
            FeederFixture {
                _mode_tx: mode_tx,
                _conn_tx: conn_tx,
            },
        )
    }

    fn test_frame(id: u64) -> Arc<Frame> {
        Arc::new(Frame {
            frame_id: id,
            ts_mono_ns: 0,
            ts_utc_ns: 0,
            width: 0,
            height: 0,
            pixel_format: PixelFormat::Jpeg,
            planes: Vec::new(),
            data: Bytes::from_static(b"x"),
        })
    }

    #[tokio::test]
    async fn latest_wins_keeps_only_newest() {
        let sink = MockSink::new(true);
        let (feeder, cache, metrics, _fx) = feeder_with_sink(sink.clone());
        let mut deferred = None;

        // Frame 100 admitted while the window is open.
        feeder.admit(test_frame(100), &mut deferred);
        assert_eq!(*sink.sent.lock(), [100]);

        // Window closes; five more frames arrive.
        sink.set_open(false);
        for id in 101..=105 {
            feeder.admit(test_frame(id), &mut deferred);
        }
        assert_eq!(metrics.ai_drops_latestwins_total.get(), 4);
        assert_eq!(deferred.as_ref().unwrap().frame_id, 105);
        // All were cached regardless of admission.
        assert!(cache.get(101).is_some());

        // Credit returns; the deferred (newest) frame goes out.
        sink.set_open(true);
        let f = deferred.take().unwrap();
        sink.send(&f).unwrap();
        assert_eq!(*sink.sent.lock(), [100, 105]);
    }

    #[tokio::test]
    async fn build_frame_assigns_ids_and_pairs_clocks() {
        use base::clock::SimulatedClocks;

        let sink = MockSink::new(true);
        let (mut feeder, _cache, _metrics, _fx) = feeder_with_sink(sink);
        let clocks = SimulatedClocks::new("2026-07-01T00:00:00Z".parse().unwrap());
        clocks.sleep(Duration::from_secs(100));
        feeder.clocks = Arc::new(clocks.clone());

        let conn = ConnInfo {
            epoch: 1,
            ready: true,
            format: PixelFormat::Nv12,
            width: 64,
            height: 64,
        };
        let mono_base = clocks.monotonic_ns();
        let utc_base = clocks.realtime().as_nanosecond() as u64;
        let mut next_id = 1;
        let data = vec![0u8; nv12_frame_bytes(64, 64)];

        let f1 = feeder.build_frame(&conn, &mut next_id, mono_base, utc_base, data.clone());
        clocks.sleep(Duration::from_millis(125));
        let f2 = feeder.build_frame(&conn, &mut next_id, mono_base, utc_base, data);

        assert_eq!(f1.frame_id, 1);
        assert_eq!(f2.frame_id, 2);
        f1.validate().unwrap();
        // ts_utc is the connection-start pairing plus the mono delta.
        assert_eq!(f1.ts_utc_ns, utc_base);
        assert_eq!(f2.ts_utc_ns, utc_base + 125_000_000);
        assert_eq!(f2.ts_mono_ns - f1.ts_mono_ns, 125_000_000);
    }

    #[tokio::test]
    async fn new_frame_supersedes_deferred_when_window_opens() {
        let sink = MockSink::new(false);
        let (feeder, _cache, metrics, _fx) = feeder_with_sink(sink.clone());
        let mut deferred = None;

        feeder.admit(test_frame(1), &mut deferred);
        assert_eq!(deferred.as_ref().unwrap().frame_id, 1);
        assert_eq!(metrics.ai_drops_latestwins_total.get(), 0);

        // The window opens and a fresh frame arrives before the deferred
        // one was flushed: the fresh frame wins, the stale one is dropped.
        sink.set_open(true);
        feeder.admit(test_frame(2), &mut deferred);
        assert_eq!(*sink.sent.lock(), [2]);
        assert!(deferred.is_none());
        assert_eq!(metrics.ai_drops_latestwins_total.get(), 1);
    }
}
