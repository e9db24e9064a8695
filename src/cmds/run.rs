// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The agent runtime: wires every component together and runs until
//! SIGINT/SIGTERM.

use crate::ai::{AiClient, AiClientConfig, Init};
use crate::bus::{Bus, DetectionEvent, Event};
use crate::cache::{FrameCache, FrameCacheConfig};
use crate::config::Config;
use crate::feeder::{self, Feeder, FrameSink};
use crate::filter::{self, FilterConfig};
use crate::frame::{InferenceResult, PixelFormat};
use crate::ingest::{EvidenceIngester, IngesterConfig};
use crate::json::AgentSnapshot;
use crate::metrics::Metrics;
use crate::orchestrator::{AiRuntimeAdapter, FsmSnapshot, Orchestrator, TimerConfig};
use crate::publisher::{Publisher, PublisherController};
use crate::store::RestSessionStore;
use crate::web::{serve_status, StatusService};
use base::clock::{Clocks, RealClocks};
use base::{err, Error};
use bpaf::Bpaf;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Runs the agent runtime (normally as a child of `supervise`).
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the agent TOML config.
    #[bpaf(long, argument("PATH"))]
    config: PathBuf,

    /// Port of the internal status endpoint; overrides the config.
    #[bpaf(long, argument("PORT"))]
    status_port: Option<u16>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    super::tokio_runtime().block_on(async_run(args))
}

async fn async_run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;
    let allowed_classes = config.effective_classes()?;
    info!(device_id = %config.device_id, "configuration loaded");

    let clocks: Arc<dyn Clocks> = Arc::new(RealClocks::default());
    let metrics = Metrics::new();
    let bus = Bus::new(metrics.clone());
    let cache = FrameCache::new(
        FrameCacheConfig {
            max_entries: config.cache.max_entries,
            max_bytes: config.cache.max_bytes,
        },
        metrics.clone(),
    );
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let last_error: Arc<base::Mutex<Option<String>>> = Arc::new(base::Mutex::new(None));

    // Camera hub first: without frames nothing else matters, and a broken
    // capture config should fail the start visibly.
    let hub = crate::hub::CameraHub::new(config.camera.clone());
    hub.start();
    let ready_timeout = Duration::from_millis(config.camera.ready_timeout_ms);
    if let Err(e) = hub.await_ready(ready_timeout).await {
        error!(err = %e.chain(), "camera hub failed to become ready");
        hub.stop().await;
        return Err(err!(e, msg("startup aborted")));
    }

    // Surface capture trouble in the agent snapshot.
    {
        let mut hub_state = hub.state();
        let last_error = last_error.clone();
        tokio::spawn(async move {
            while hub_state.changed().await.is_ok() {
                let state = *hub_state.borrow();
                let mut l = last_error.lock();
                match state {
                    crate::hub::HubState::Backoff => {
                        *l = Some("capture pipeline crashed; restarting".to_owned());
                    }
                    crate::hub::HubState::Ready => *l = None,
                    _ => {}
                }
            }
        });
    }

    // AI client + feeder.
    let init = Init {
        model_path: config.ai.model_path.clone(),
        width: config.camera.width,
        height: config.camera.height,
        conf_threshold: config.ai.conf_threshold,
        allowed_formats: vec![PixelFormat::Nv12, PixelFormat::I420],
        codec: "raw".to_owned(),
        max_inflight: config.ai.max_inflight,
    };
    let client = AiClient::new(
        AiClientConfig::new(config.ai.addr.clone(), init),
        clocks.clone(),
        metrics.clone(),
    );
    let (results_tx, results_rx) = mpsc::channel::<InferenceResult>(64);
    let client_task = tokio::spawn(client.clone().run(results_tx, shutdown_rx.clone()));

    let (mode_tx, mode_rx) = feeder::mode_channel();
    let feeder = Feeder::new(
        config.ai.clone(),
        config.camera.transport_path.clone(),
        client.clone() as Arc<dyn FrameSink>,
        cache.clone(),
        clocks.clone(),
        metrics.clone(),
        client.conn_info(),
        mode_rx,
    );
    let feeder_task = tokio::spawn(feeder.run(shutdown_rx.clone()));

    // Store, ingester, publisher, orchestrator.
    let store = Arc::new(RestSessionStore::new(
        &config.store.base_url,
        config.device_id.clone(),
    )?);
    let (ingester, ingester_handle) = EvidenceIngester::new(
        IngesterConfig {
            batch_max: config.ingest.batch_max,
            flush_interval: Duration::from_millis(config.ingest.flush_interval_ms),
        },
        store.clone(),
        cache.clone(),
        &bus,
        metrics.clone(),
    );
    let ingester_task = tokio::spawn(ingester.run(shutdown_rx.clone()));

    let publisher = PublisherController::new(
        config.publish.clone(),
        config.camera.transport_path.clone(),
        bus.clone(),
    );
    let ai_adapter = AiRuntimeAdapter::new(mode_tx, ingester_handle.clone());
    let (orchestrator, fsm_rx, sessions_opened) = Orchestrator::new(
        TimerConfig::from(&config.fsm),
        bus.clone(),
        publisher.clone(),
        store.clone(),
        ai_adapter,
        ingester_handle,
        clocks.clone(),
        metrics.clone(),
    );
    let orchestrator_task = tokio::spawn(orchestrator.run(shutdown_rx.clone()));

    // Results pump: worker results -> filter -> bus.
    let pump_task = tokio::spawn(results_pump(
        results_rx,
        FilterConfig {
            threshold: config.ai.conf_threshold,
            allowed_classes,
        },
        bus.clone(),
        metrics.clone(),
        clocks.clone(),
    ));

    // Internal status endpoint for the supervisor.
    let status_port = args.status_port.unwrap_or(config.control.child_status_port());
    let status_service = StatusService::new(snapshot_fn(
        fsm_rx,
        metrics.clone(),
        sessions_opened,
        last_error.clone(),
    ));
    let status_task = tokio::spawn(serve_status(
        status_service,
        status_port,
        shutdown_rx.clone(),
    ));

    info!("runtime is up");
    let mut int = signal(SignalKind::interrupt()).map_err(|e| err!(e, msg("signal handler")))?;
    let mut term = signal(SignalKind::terminate()).map_err(|e| err!(e, msg("signal handler")))?;
    tokio::select! {
        _ = int.recv() => info!("SIGINT; shutting down"),
        _ = term.recv() => info!("SIGTERM; shutting down"),
    }

    // Dropping the sender propagates shutdown to every task; each drains
    // within its own deadline.
    drop(shutdown_tx);
    for (name, task) in [
        ("orchestrator", orchestrator_task),
        ("ingester", ingester_task),
        ("feeder", feeder_task),
        ("ai-client", client_task),
        ("results-pump", pump_task),
    ] {
        if tokio::time::timeout(Duration::from_secs(10), task).await.is_err() {
            warn!(task = name, "did not stop within 10s");
        }
    }
    let _ = tokio::time::timeout(Duration::from_secs(6), status_task).await;
    let _ = publisher.stop(None).await;
    hub.stop().await;
    info!("exiting");
    Ok(0)
}

fn snapshot_fn(
    fsm_rx: watch::Receiver<FsmSnapshot>,
    metrics: Arc<Metrics>,
    sessions_opened: Arc<AtomicU64>,
    last_error: Arc<base::Mutex<Option<String>>>,
) -> Arc<dyn Fn() -> AgentSnapshot + Send + Sync> {
    Arc::new(move || {
        let fsm = fsm_rx.borrow().clone();
        AgentSnapshot {
            state: fsm.state.as_str().to_owned(),
            session_id: fsm.session_id,
            frames_processed: metrics.ai_results_total.get(),
            detections_total: metrics.ai_detections_total.get(),
            sessions_opened: sessions_opened.load(std::sync::atomic::Ordering::Relaxed),
            last_error: last_error.lock().clone(),
            metrics: None,
        }
        .with_metrics(&metrics.snapshot())
    })
}

/// Maps worker results onto bus events: relevant detections, irrelevant
/// detections, or keepalives.
async fn results_pump(
    mut results_rx: mpsc::Receiver<InferenceResult>,
    filter_cfg: FilterConfig,
    bus: Bus,
    metrics: Arc<Metrics>,
    clocks: Arc<dyn Clocks>,
) {
    while let Some(result) = results_rx.recv().await {
        let event = result_to_event(&result, &filter_cfg, &metrics, clocks.as_ref());
        bus.publish(event);
    }
}

fn result_to_event(
    result: &InferenceResult,
    filter_cfg: &FilterConfig,
    metrics: &Metrics,
    clocks: &dyn Clocks,
) -> Event {
    if result.detections.is_empty() {
        return Event::Keepalive {
            frame_id: result.frame_id,
        };
    }
    let filtered = filter::filter(&result.detections, filter_cfg);
    metrics.ai_detections_total.add(filtered.len() as u64);
    let ts_utc_ns = result
        .ts_iso
        .parse::<jiff::Timestamp>()
        .map(|t| t.as_nanosecond() as u64)
        .unwrap_or_else(|_| clocks.realtime().as_nanosecond() as u64);
    let relevant = filter::is_relevant(&filtered);
    let score = filter::score(&filtered);
    Event::Detection(Arc::new(DetectionEvent {
        frame_id: result.frame_id,
        ts_utc_ns,
        relevant,
        score,
        detections: filtered,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BBox, Detection};
    use base::clock::SimulatedClocks;

    fn det(cls: &str, conf: f32) -> Detection {
        Detection {
            cls: cls.to_owned(),
            conf,
            bbox: BBox {
                x: 0.,
                y: 0.,
                w: 1.,
                h: 1.,
            },
            track_id: None,
        }
    }

    fn result(detections: Vec<Detection>) -> InferenceResult {
        InferenceResult {
            frame_id: 9,
            ts_iso: "2026-07-01T00:00:00Z".to_owned(),
            ts_mono_ns: 0,
            detections,
            ..Default::default()
        }
    }

    fn clocks() -> SimulatedClocks {
        SimulatedClocks::new("2026-07-01T00:00:00Z".parse().unwrap())
    }

    #[test]
    fn empty_result_is_keepalive() {
        let metrics = Metrics::new();
        let e = result_to_event(
            &result(Vec::new()),
            &FilterConfig::default(),
            &metrics,
            &clocks(),
        );
        assert!(matches!(e, Event::Keepalive { frame_id: 9 }));
    }

    #[test]
    fn filtered_out_result_is_irrelevant_detection() {
        let metrics = Metrics::new();
        let cfg = FilterConfig {
            threshold: 0.9,
            allowed_classes: Default::default(),
        };
        let e = result_to_event(&result(vec![det("person", 0.4)]), &cfg, &metrics, &clocks());
        match e {
            Event::Detection(d) => {
                assert!(!d.relevant);
                assert!(d.detections.is_empty());
                assert_eq!(d.score, 0.);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(metrics.ai_detections_total.get(), 0);
    }

    #[test]
    fn passing_result_is_relevant() {
        let metrics = Metrics::new();
        let cfg = FilterConfig {
            threshold: 0.5,
            allowed_classes: Default::default(),
        };
        let e = result_to_event(
            &result(vec![det("person", 0.8), det("dog", 0.3)]),
            &cfg,
            &metrics,
            &clocks(),
        );
        match e {
            Event::Detection(d) => {
                assert!(d.relevant);
                assert_eq!(d.detections.len(), 1);
                assert_eq!(d.score, 0.8);
                // ts comes from the result's echoed capture timestamp.
                assert_eq!(d.ts_utc_ns, 1_782_864_000 * 1_000_000_000);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(metrics.ai_detections_total.get(), 1);
    }
}
