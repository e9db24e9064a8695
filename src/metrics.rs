// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory counters, gauges, and histograms, snapshotted into `/status`.
//!
//! There is no scrape endpoint of its own; the supervisor embeds a snapshot
//! in its status JSON and the fleet's collector takes it from there.

use base::{FastHashMap, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A counter family with one value per label, e.g. `bus_dropped_total{topic}`.
#[derive(Default)]
pub struct LabeledCounter(Mutex<FastHashMap<String, u64>>);

impl LabeledCounter {
    pub fn inc(&self, label: &str) {
        let mut l = self.0.lock();
        match l.get_mut(label) {
            Some(v) => *v += 1,
            None => {
                l.insert(label.to_owned(), 1);
            }
        }
    }

    pub fn get(&self, label: &str) -> u64 {
        self.0.lock().get(label).copied().unwrap_or(0)
    }

    fn snapshot(&self) -> std::collections::BTreeMap<String, u64> {
        self.0.lock().iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

/// Fixed-bucket histogram of milliseconds.
pub struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum_ms: Mutex<f64>,
}

/// Bucket upper bounds chosen for network round-trips and inference
/// latencies: sub-ms to tens of seconds.
const LATENCY_BOUNDS_MS: &[f64] = &[
    1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

impl Default for Histogram {
    fn default() -> Self {
        Self::new(LATENCY_BOUNDS_MS)
    }
}

impl Histogram {
    pub fn new(bounds: &'static [f64]) -> Self {
        let mut buckets = Vec::with_capacity(bounds.len() + 1);
        buckets.resize_with(bounds.len() + 1, AtomicU64::default);
        Histogram {
            bounds,
            buckets,
            count: AtomicU64::new(0),
            sum_ms: Mutex::new(0.),
        }
    }

    pub fn observe(&self, ms: f64) {
        let i = self.bounds.partition_point(|&b| ms > b);
        self.buckets[i].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        *self.sum_ms.lock() += ms;
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count(),
            sum_ms: *self.sum_ms.lock(),
            buckets: self
                .bounds
                .iter()
                .copied()
                .chain(std::iter::once(f64::INFINITY))
                .zip(self.buckets.iter().map(|b| b.load(Ordering::Relaxed)))
                .map(|(le, n)| BucketSnapshot { le, n })
                .collect(),
        }
    }
}

#[derive(Serialize, Debug)]
pub struct BucketSnapshot {
    pub le: f64,
    pub n: u64,
}

#[derive(Serialize, Debug)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_ms: f64,
    pub buckets: Vec<BucketSnapshot>,
}

/// All metrics of the agent process. One instance per process, shared by
/// every component via `Arc`.
#[derive(Default)]
pub struct Metrics {
    pub ai_frames_sent_total: Counter,
    pub ai_results_total: Counter,
    pub ai_drops_latestwins_total: Counter,
    pub ai_detections_total: Counter,
    pub ai_reconnects_total: Counter,
    pub store_flush_ok_total: Counter,
    pub store_flush_error_total: Counter,
    pub frame_bytes_max_hit_total: Counter,
    pub bus_dropped_total: LabeledCounter,
    pub fsm_transitions_total: LabeledCounter,

    pub ai_inflight: Gauge,
    pub ai_window_size: Gauge,
    pub fsm_state: Gauge,

    pub ai_result_latency_ms: Histogram,
    pub store_flush_latency_ms: Histogram,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: [
                ("ai_frames_sent_total", &self.ai_frames_sent_total),
                ("ai_results_total", &self.ai_results_total),
                ("ai_drops_latestwins_total", &self.ai_drops_latestwins_total),
                ("ai_detections_total", &self.ai_detections_total),
                ("ai_reconnects_total", &self.ai_reconnects_total),
                ("store_flush_ok_total", &self.store_flush_ok_total),
                ("store_flush_error_total", &self.store_flush_error_total),
                ("frame_bytes_max_hit_total", &self.frame_bytes_max_hit_total),
            ]
            .into_iter()
            .map(|(name, c)| (name.to_owned(), c.get()))
            .collect(),
            bus_dropped_total: self.bus_dropped_total.snapshot(),
            fsm_transitions_total: self.fsm_transitions_total.snapshot(),
            gauges: [
                ("ai_inflight", &self.ai_inflight),
                ("ai_window_size", &self.ai_window_size),
                ("fsm_state", &self.fsm_state),
            ]
            .into_iter()
            .map(|(name, g)| (name.to_owned(), g.get()))
            .collect(),
            ai_result_latency_ms: self.ai_result_latency_ms.snapshot(),
            store_flush_latency_ms: self.store_flush_latency_ms.snapshot(),
        }
    }
}

#[derive(Serialize, Debug)]
pub struct MetricsSnapshot {
    pub counters: std::collections::BTreeMap<String, u64>,
    pub bus_dropped_total: std::collections::BTreeMap<String, u64>,
    pub fsm_transitions_total: std::collections::BTreeMap<String, u64>,
    pub gauges: std::collections::BTreeMap<String, i64>,
    pub ai_result_latency_ms: HistogramSnapshot,
    pub store_flush_latency_ms: HistogramSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_and_gauge() {
        let m = Metrics::new();
        m.ai_frames_sent_total.inc();
        m.ai_frames_sent_total.add(2);
        assert_eq!(m.ai_frames_sent_total.get(), 3);
        m.ai_inflight.set(1);
        assert_eq!(m.ai_inflight.get(), 1);
    }

    #[test]
    fn labeled_counter() {
        let c = LabeledCounter::default();
        c.inc("ai.detection");
        c.inc("ai.detection");
        c.inc("session.open");
        assert_eq!(c.get("ai.detection"), 2);
        assert_eq!(c.get("session.open"), 1);
        assert_eq!(c.get("ai.keepalive"), 0);
    }

    #[test]
    fn histogram_buckets() {
        let h = Histogram::default();
        h.observe(0.5);
        h.observe(30.0);
        h.observe(99_999.0); // beyond the last bound
        let s = h.snapshot();
        assert_eq!(s.count, 3);
        assert_eq!(s.buckets.first().unwrap().n, 1); // <= 1ms
        assert_eq!(s.buckets.last().unwrap().n, 1); // +inf
        assert!((s.sum_ms - 100_029.5).abs() < 1e-9);
    }

    #[test]
    fn snapshot_serializes() {
        let m = Metrics::new();
        m.bus_dropped_total.inc("ai.detection");
        let j = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(j["bus_dropped_total"]["ai.detection"], 1);
        assert_eq!(j["counters"]["ai_frames_sent_total"], 0);
    }
}
