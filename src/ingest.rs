// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session evidence: batched upload of best-of-track detections with their
//! frame images.
//!
//! For each `track_id` the ingester keeps the highest-confidence detection
//! seen so far in the session. A strict improvement produces a new upload
//! whose stored row and image come from the same result; anything else
//! never overwrites the stored frame. Detections without a track id get a
//! synthetic per-frame key and are uploaded once.
//!
//! Detections arriving between "OpenSession commanded" and "session id
//! issued" are converted to records immediately (so the image is captured
//! before the cache can evict the frame) and flushed once the id arrives.

use crate::bus::{Bus, Event, Subscription, Topic};
use crate::cache::FrameCache;
use crate::frame::{ts_iso, PixelFormat};
use crate::json::IngestMeta;
use crate::metrics::Metrics;
use crate::store::{EvidenceImage, SessionStore};
use base::FastHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Retry schedule for a failing flush; after the last attempt the batch is
/// dropped and counted.
const RETRY_DELAYS: [Duration; 2] = [Duration::from_millis(500), Duration::from_secs(1)];
const LAST_RETRY_DELAY: Duration = Duration::from_secs(2);
const MAX_ATTEMPTS: usize = 3;

/// Total deadline for the final flush at session close or shutdown.
const FINAL_FLUSH_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct IngesterConfig {
    pub batch_max: usize,
    pub flush_interval: Duration,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        IngesterConfig {
            batch_max: 50,
            flush_interval: Duration::from_millis(250),
        }
    }
}

enum Control {
    Opening,
    Opened { session_id: String },
    OpenFailed,
    Closed,
}

/// Orchestrator-facing handle; see [`EvidenceIngester::new`].
#[derive(Clone)]
pub struct IngesterHandle {
    tx: mpsc::Sender<Control>,
}

impl IngesterHandle {
    /// An `OpenSession` command was issued; buffer evidence until the id
    /// arrives.
    pub async fn session_opening(&self) {
        let _ = self.tx.send(Control::Opening).await;
    }

    pub async fn session_opened(&self, session_id: String) {
        let _ = self.tx.send(Control::Opened { session_id }).await;
    }

    /// The store refused to open; buffered evidence is discarded.
    pub async fn session_open_failed(&self) {
        let _ = self.tx.send(Control::OpenFailed).await;
    }

    pub async fn session_closed(&self) {
        let _ = self.tx.send(Control::Closed).await;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Idle,
    Opening,
    Open,
}

struct EvidenceRecord {
    event_id: String,
    frame_id: u64,
    ts_utc_ns: u64,
    detection: crate::frame::Detection,
    image: EvidenceImage,
}

pub struct EvidenceIngester {
    cfg: IngesterConfig,
    store: Arc<dyn SessionStore>,
    cache: Arc<FrameCache>,
    metrics: Arc<Metrics>,
    sub: Subscription,
    ctrl_rx: mpsc::Receiver<Control>,

    phase: Phase,
    session_id: Option<String>,

    /// Best confidence so far per track key, this session.
    bests: FastHashMap<String, f32>,

    pending: VecDeque<EvidenceRecord>,
}

impl EvidenceIngester {
    pub fn new(
        cfg: IngesterConfig,
        store: Arc<dyn SessionStore>,
        cache: Arc<FrameCache>,
        bus: &Bus,
        metrics: Arc<Metrics>,
    ) -> (Self, IngesterHandle) {
        let (tx, ctrl_rx) = mpsc::channel(16);
        let sub = bus.subscribe("ingester", &[Topic::AiDetection]);
        (
            EvidenceIngester {
                cfg,
                store,
                cache,
                metrics,
                sub,
                ctrl_rx,
                phase: Phase::Idle,
                session_id: None,
                bests: FastHashMap::default(),
                pending: VecDeque::new(),
            },
            IngesterHandle { tx },
        )
    }

    pub async fn run(mut self, shutdown_rx: base::shutdown::Receiver) {
        let mut tick = tokio::time::interval(self.cfg.flush_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.wait() => {
                    self.final_flush().await;
                    break;
                }
                ctrl = self.ctrl_rx.recv() => match ctrl {
                    None => break,
                    Some(c) => self.handle_control(c).await,
                },
                event = self.sub.recv() => self.handle_event(event),
                _ = tick.tick() => {
                    if self.phase == Phase::Open && !self.pending.is_empty() {
                        self.flush().await;
                    }
                }
            }
            if self.phase == Phase::Open && self.pending.len() >= self.cfg.batch_max {
                self.flush().await;
            }
        }
        debug!("ingester stopped");
    }

    async fn handle_control(&mut self, c: Control) {
        match c {
            Control::Opening => {
                self.phase = Phase::Opening;
                self.session_id = None;
                self.bests.clear();
                self.pending.clear();
            }
            Control::Opened { session_id } => {
                info!(session_id = %session_id, buffered = self.pending.len(), "session evidence started");
                self.session_id = Some(session_id);
                self.phase = Phase::Open;
            }
            Control::OpenFailed => {
                warn!(discarded = self.pending.len(), "session open failed; discarding evidence");
                self.reset();
            }
            Control::Closed => {
                self.final_flush().await;
                self.reset();
            }
        }
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.session_id = None;
        self.bests.clear();
        self.pending.clear();
    }

    fn handle_event(&mut self, event: Event) {
        let Event::Detection(d) = event else {
            return;
        };
        if self.phase == Phase::Idle || !d.relevant {
            return;
        }
        // The frame image is captured now, from the same result the bbox
        // came from; a later cache eviction cannot tear the pair apart.
        let Some(frame_ref) = self.cache.get(d.frame_id) else {
            debug!(frame_id = d.frame_id, "no cached frame for detection; skipping evidence");
            return;
        };
        let content_type = match frame_ref.frame().pixel_format {
            PixelFormat::Jpeg => "image/jpeg",
            _ => "application/octet-stream",
        };
        for (i, det) in d.detections.iter().enumerate() {
            let track_key = match &det.track_id {
                Some(t) => t.clone(),
                None => format!("frame:{}:{i}", d.frame_id),
            };
            let improved = match self.bests.get(&track_key) {
                None => true,
                Some(&best) => det.conf > best,
            };
            if !improved {
                continue;
            }
            self.bests.insert(track_key, det.conf);
            self.pending.push_back(EvidenceRecord {
                event_id: Uuid::now_v7().to_string(),
                frame_id: d.frame_id,
                ts_utc_ns: d.ts_utc_ns,
                detection: det.clone(),
                image: EvidenceImage {
                    content_type,
                    bytes: frame_ref.frame().data.clone(),
                },
            });
        }
        // Overflow policy: drop the oldest records rather than block the
        // detection path.
        let cap = self.cfg.batch_max * 8;
        while self.pending.len() > cap {
            self.pending.pop_front();
            warn!("evidence queue overflow; dropping oldest record");
        }
    }

    /// Uploads up to `batch_max` pending records as one idempotent batch.
    async fn flush(&mut self) {
        let session_id = match &self.session_id {
            Some(s) => s.clone(),
            None => return,
        };
        let take = self.pending.len().min(self.cfg.batch_max);
        let mut batch: VecDeque<EvidenceRecord> = self.pending.drain(..take).collect();
        let batch_id = Uuid::now_v7().to_string();
        let started = std::time::Instant::now();

        for attempt in 0..MAX_ATTEMPTS {
            while let Some(record) = batch.front() {
                let meta = IngestMeta {
                    session_id: session_id.clone(),
                    frame_id: record.frame_id,
                    ts_utc: ts_iso(record.ts_utc_ns),
                    detections: vec![record.detection.clone()],
                    event_id: record.event_id.clone(),
                    batch_id: batch_id.clone(),
                };
                match self.store.ingest(&meta, &record.image).await {
                    Ok(_) => {
                        batch.pop_front();
                    }
                    Err(e) => {
                        warn!(err = %e.chain(), attempt, batch_id = %batch_id, "evidence upload failed");
                        break;
                    }
                }
            }
            if batch.is_empty() {
                self.metrics.store_flush_ok_total.inc();
                self.metrics
                    .store_flush_latency_ms
                    .observe(started.elapsed().as_secs_f64() * 1e3);
                return;
            }
            if attempt + 1 < MAX_ATTEMPTS {
                let delay = RETRY_DELAYS.get(attempt).copied().unwrap_or(LAST_RETRY_DELAY);
                tokio::time::sleep(delay).await;
            }
        }
        warn!(batch_id = %batch_id, dropped = batch.len(), "flush retries exhausted; dropping batch");
        self.metrics.store_flush_error_total.inc();
    }

    /// Flush at session close / shutdown, bounded by a total deadline.
    async fn final_flush(&mut self) {
        if self.phase != Phase::Open || self.pending.is_empty() {
            return;
        }
        let deadline = tokio::time::Instant::now() + FINAL_FLUSH_DEADLINE;
        while !self.pending.is_empty() {
            match tokio::time::timeout_at(deadline, self.flush()).await {
                Ok(()) => {}
                Err(_) => {
                    warn!(
                        remaining = self.pending.len(),
                        "final flush deadline exceeded; dropping remaining evidence"
                    );
                    self.metrics.store_flush_error_total.inc();
                    self.pending.clear();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DetectionEvent;
    use crate::cache::FrameCacheConfig;
    use crate::frame::{BBox, Detection, Frame};
    use crate::json::IngestResponse;
    use async_trait::async_trait;
    use base::{err, Error, Mutex};
    use bytes::Bytes;

    struct MockStore {
        uploads: Mutex<Vec<(IngestMeta, Vec<u8>)>>,
        fail: Mutex<bool>,
    }

    impl MockStore {
        fn new() -> Arc<Self> {
            Arc::new(MockStore {
                uploads: Mutex::new(Vec::new()),
                fail: Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl SessionStore for MockStore {
        async fn open(&self, _: jiff::Timestamp, _: Option<&str>) -> Result<String, Error> {
            Ok("s-1".to_owned())
        }

        async fn close(&self, _: &str, _: Option<jiff::Timestamp>) -> Result<(), Error> {
            Ok(())
        }

        async fn ingest(
            &self,
            meta: &IngestMeta,
            image: &EvidenceImage,
        ) -> Result<IngestResponse, Error> {
            if *self.fail.lock() {
                return Err(err!(Unavailable, msg("mock store down")));
            }
            self.uploads
                .lock()
                .push((clone_meta(meta), image.bytes.to_vec()));
            Ok(IngestResponse {
                inserted: 1,
                skipped: 0,
            })
        }
    }

    fn clone_meta(m: &IngestMeta) -> IngestMeta {
        serde_json::from_value(serde_json::to_value(m).unwrap()).unwrap()
    }

    struct Fixture {
        bus: Bus,
        cache: Arc<FrameCache>,
        store: Arc<MockStore>,
        metrics: Arc<Metrics>,
        handle: IngesterHandle,
        task: tokio::task::JoinHandle<()>,
        _shutdown_tx: base::shutdown::Sender,
    }

    fn fixture(cfg: IngesterConfig) -> Fixture {
        let metrics = Metrics::new();
        let bus = Bus::new(metrics.clone());
        let cache = FrameCache::new(FrameCacheConfig::default(), metrics.clone());
        let store = MockStore::new();
        let (ingester, handle) = EvidenceIngester::new(
            cfg,
            store.clone(),
            cache.clone(),
            &bus,
            metrics.clone(),
        );
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let task = tokio::spawn(ingester.run(shutdown_rx));
        Fixture {
            bus,
            cache,
            store,
            metrics,
            handle,
            task,
            _shutdown_tx: shutdown_tx,
        }
    }

    fn put_frame(f: &Fixture, frame_id: u64, marker: u8) {
        f.cache.put(Arc::new(Frame {
            frame_id,
            ts_mono_ns: 0,
            ts_utc_ns: 1_700_000_000_000_000_000 + frame_id,
            width: 0,
            height: 0,
            pixel_format: PixelFormat::Jpeg,
            planes: Vec::new(),
            data: Bytes::from(vec![marker; 4]),
        }));
    }

    fn detect(f: &Fixture, frame_id: u64, track: &str, conf: f32) {
        f.bus.publish(Event::Detection(Arc::new(DetectionEvent {
            frame_id,
            ts_utc_ns: 1_700_000_000_000_000_000 + frame_id,
            relevant: true,
            score: conf,
            detections: vec![Detection {
                cls: "person".to_owned(),
                conf,
                bbox: BBox {
                    x: 0.,
                    y: 0.,
                    w: 1.,
                    h: 1.,
                },
                track_id: Some(track.to_owned()),
            }],
        })));
    }

    async fn settle() {
        // Lets the ingester drain its queues.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn best_of_track_overwrites_only_on_improvement() {
        let f = fixture(IngesterConfig {
            batch_max: 50,
            flush_interval: Duration::from_millis(250),
        });
        f.handle.session_opening().await;
        f.handle.session_opened("s-1".to_owned()).await;

        put_frame(&f, 10, 0xAA);
        detect(&f, 10, "t1", 0.60);
        put_frame(&f, 20, 0xBB);
        detect(&f, 20, "t1", 0.90);
        put_frame(&f, 30, 0xCC);
        detect(&f, 30, "t1", 0.55);
        settle().await;
        tokio::time::advance(Duration::from_millis(300)).await;
        settle().await;

        let uploads = f.store.uploads.lock();
        assert_eq!(uploads.len(), 2, "only the improvement is re-uploaded");
        assert_eq!(uploads[0].0.frame_id, 10);
        assert_eq!(uploads[0].1, vec![0xAA; 4]);
        assert_eq!(uploads[1].0.frame_id, 20);
        // Row and image from the same result: conf 0.90 pairs with 0xBB.
        assert_eq!(uploads[1].0.detections[0].conf, 0.90);
        assert_eq!(uploads[1].1, vec![0xBB; 4]);
        drop(uploads);
        f.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_until_session_id_arrives() {
        let f = fixture(IngesterConfig::default());
        f.handle.session_opening().await;
        put_frame(&f, 1, 0x11);
        detect(&f, 1, "t1", 0.8);
        settle().await;
        tokio::time::advance(Duration::from_millis(300)).await;
        settle().await;
        assert!(f.store.uploads.lock().is_empty(), "no upload before the id");

        f.handle.session_opened("s-1".to_owned()).await;
        settle().await;
        tokio::time::advance(Duration::from_millis(300)).await;
        settle().await;
        let uploads = f.store.uploads.lock();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0.session_id, "s-1");
        drop(uploads);
        f.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_discards_buffer() {
        let f = fixture(IngesterConfig::default());
        f.handle.session_opening().await;
        put_frame(&f, 1, 0x11);
        detect(&f, 1, "t1", 0.8);
        settle().await;
        f.handle.session_open_failed().await;
        f.handle.session_opening().await;
        f.handle.session_opened("s-2".to_owned()).await;
        settle().await;
        tokio::time::advance(Duration::from_millis(300)).await;
        settle().await;
        assert!(f.store.uploads.lock().is_empty());
        f.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_drops_batch() {
        let f = fixture(IngesterConfig::default());
        f.handle.session_opening().await;
        f.handle.session_opened("s-1".to_owned()).await;
        *f.store.fail.lock() = true;

        put_frame(&f, 1, 0x11);
        detect(&f, 1, "t1", 0.8);
        settle().await;
        // Flush tick plus the 0.5s and 1s retry delays.
        for _ in 0..40 {
            tokio::time::advance(Duration::from_millis(100)).await;
            settle().await;
        }
        assert_eq!(f.metrics.store_flush_error_total.get(), 1);
        assert!(f.store.uploads.lock().is_empty());

        // A later detection starts a fresh batch once the store recovers.
        *f.store.fail.lock() = false;
        put_frame(&f, 2, 0x22);
        detect(&f, 2, "t2", 0.7);
        settle().await;
        tokio::time::advance(Duration::from_millis(300)).await;
        settle().await;
        assert_eq!(f.store.uploads.lock().len(), 1);
        f.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn untracked_detections_upload_once_per_frame() {
        let f = fixture(IngesterConfig::default());
        f.handle.session_opening().await;
        f.handle.session_opened("s-1".to_owned()).await;

        put_frame(&f, 5, 0x55);
        f.bus.publish(Event::Detection(Arc::new(DetectionEvent {
            frame_id: 5,
            ts_utc_ns: 5,
            relevant: true,
            score: 0.9,
            detections: vec![
                Detection {
                    cls: "person".to_owned(),
                    conf: 0.9,
                    bbox: BBox {
                        x: 0.,
                        y: 0.,
                        w: 1.,
                        h: 1.,
                    },
                    track_id: None,
                },
                Detection {
                    cls: "dog".to_owned(),
                    conf: 0.7,
                    bbox: BBox {
                        x: 1.,
                        y: 1.,
                        w: 1.,
                        h: 1.,
                    },
                    track_id: None,
                },
            ],
        })));
        settle().await;
        tokio::time::advance(Duration::from_millis(300)).await;
        settle().await;
        let uploads = f.store.uploads.lock();
        assert_eq!(uploads.len(), 2);
        drop(uploads);
        f.task.abort();
    }
}
