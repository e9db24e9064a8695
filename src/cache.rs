// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Short-lived cache from `frame_id` to the raw frame, so evidence images
//! can be attached to detections whose results arrive later.
//!
//! Capped by entry count and total payload bytes. Eviction is oldest-first
//! by insertion; an entry referenced by an in-flight ingest task is never
//! evicted. Single writer (the feeder), many readers (the ingester).

use crate::frame::Frame;
use crate::metrics::Metrics;
use base::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct FrameCacheConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for FrameCacheConfig {
    fn default() -> Self {
        FrameCacheConfig {
            max_entries: 64,
            max_bytes: 64 << 20,
        }
    }
}

struct Entry {
    frame: Arc<Frame>,
    refs: u32,
}

struct Inner {
    map: base::FastHashMap<u64, Entry>,

    /// Insertion order; ids referenced here may have been removed from
    /// `map` already (stale ids are skipped on eviction scans).
    order: VecDeque<u64>,
    total_bytes: usize,
}

pub struct FrameCache {
    cfg: FrameCacheConfig,
    metrics: Arc<Metrics>,
    inner: Mutex<Inner>,
}

/// Outcome of [`FrameCache::put`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PutOutcome {
    Inserted,

    /// The entry alone exceeds `max_bytes`.
    RejectedOversize,

    /// Too many live references; caps could not be restored by eviction.
    RejectedPinned,
}

/// RAII read reference. The entry stays evictable-never while at least one
/// `FrameRef` is alive.
pub struct FrameRef {
    cache: Arc<FrameCache>,
    frame: Arc<Frame>,
}

impl FrameRef {
    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

impl Drop for FrameRef {
    fn drop(&mut self) {
        self.cache.release(self.frame.frame_id);
    }
}

impl FrameCache {
    pub fn new(cfg: FrameCacheConfig, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(FrameCache {
            cfg,
            metrics,
            inner: Mutex::new(Inner {
                map: base::FastHashMap::default(),
                order: VecDeque::new(),
                total_bytes: 0,
            }),
        })
    }

    /// Inserts a frame keyed by its `frame_id`, evicting the oldest
    /// unreferenced entries as needed to restore both caps.
    pub fn put(&self, frame: Arc<Frame>) -> PutOutcome {
        let bytes = frame.data.len();
        if bytes > self.cfg.max_bytes {
            self.metrics.frame_bytes_max_hit_total.inc();
            warn!(
                frame_id = frame.frame_id,
                bytes,
                max_bytes = self.cfg.max_bytes,
                "frame alone exceeds cache byte cap; rejecting"
            );
            return PutOutcome::RejectedOversize;
        }
        let mut l = self.inner.lock();

        // Replacing an id (feeder restart edge) removes the old entry first.
        if let Some(old) = l.map.remove(&frame.frame_id) {
            l.total_bytes -= old.frame.data.len();
        }

        let mut scan = 0;
        while l.map.len() + 1 > self.cfg.max_entries || l.total_bytes + bytes > self.cfg.max_bytes {
            if scan >= l.order.len() {
                // Everything left is referenced.
                debug!(
                    frame_id = frame.frame_id,
                    "cache full of referenced frames; rejecting put"
                );
                return PutOutcome::RejectedPinned;
            }
            let candidate = l.order[scan];
            match l.map.get(&candidate) {
                None => {
                    // Stale order slot (already removed); drop it.
                    l.order.remove(scan);
                }
                Some(e) if e.refs > 0 => {
                    scan += 1;
                }
                Some(_) => {
                    let e = l.map.remove(&candidate).expect("checked above");
                    l.total_bytes -= e.frame.data.len();
                    l.order.remove(scan);
                }
            }
        }
        l.total_bytes += bytes;
        l.order.push_back(frame.frame_id);
        l.map.insert(frame.frame_id, Entry { frame, refs: 0 });
        PutOutcome::Inserted
    }

    /// Takes a read reference; the entry is pinned until the ref drops.
    pub fn get(self: &Arc<Self>, frame_id: u64) -> Option<FrameRef> {
        let frame = {
            let mut l = self.inner.lock();
            let e = l.map.get_mut(&frame_id)?;
            e.refs += 1;
            e.frame.clone()
        };
        Some(FrameRef {
            cache: self.clone(),
            frame,
        })
    }

    fn release(&self, frame_id: u64) {
        let mut l = self.inner.lock();
        if let Some(e) = l.map.get_mut(&frame_id) {
            e.refs = e.refs.checked_sub(1).expect("release without get");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use bytes::Bytes;

    fn frame(id: u64, bytes: usize) -> Arc<Frame> {
        Arc::new(Frame {
            frame_id: id,
            ts_mono_ns: 0,
            ts_utc_ns: 0,
            width: 0,
            height: 0,
            pixel_format: PixelFormat::Jpeg,
            planes: Vec::new(),
            data: Bytes::from(vec![0u8; bytes]),
        })
    }

    fn cache(max_entries: usize, max_bytes: usize) -> Arc<FrameCache> {
        FrameCache::new(
            FrameCacheConfig {
                max_entries,
                max_bytes,
            },
            Metrics::new(),
        )
    }

    #[test]
    fn entry_cap_evicts_oldest() {
        let c = cache(3, 1 << 20);
        for id in 1..=4 {
            assert_eq!(c.put(frame(id, 10)), PutOutcome::Inserted);
        }
        assert_eq!(c.len(), 3);
        assert!(c.get(1).is_none());
        assert!(c.get(2).is_some());
    }

    #[test]
    fn byte_cap_holds() {
        let c = cache(100, 100);
        for id in 1..=5 {
            assert_eq!(c.put(frame(id, 40)), PutOutcome::Inserted);
            assert!(c.total_bytes() <= 100);
        }
        // 40-byte frames: only two fit under 100 bytes.
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn oversize_put_rejected() {
        let c = cache(10, 100);
        let m = c.metrics.clone();
        assert_eq!(c.put(frame(1, 101)), PutOutcome::RejectedOversize);
        assert_eq!(m.frame_bytes_max_hit_total.get(), 1);
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn referenced_entries_survive_eviction() {
        let c = cache(2, 1 << 20);
        c.put(frame(1, 10));
        c.put(frame(2, 10));
        let pinned = c.get(1).unwrap();
        c.put(frame(3, 10));
        // Frame 2 (oldest unreferenced) was evicted, not frame 1.
        assert!(c.get(1).is_some());
        assert!(c.get(2).is_none());
        assert!(c.get(3).is_some());
        drop(pinned);
        c.put(frame(4, 10));
        // With the pin gone, frame 1 is now evictable.
        assert!(c.get(1).is_none());
    }

    #[test]
    fn all_pinned_rejects_put() {
        let c = cache(2, 1 << 20);
        c.put(frame(1, 10));
        c.put(frame(2, 10));
        let _r1 = c.get(1).unwrap();
        let _r2 = c.get(2).unwrap();
        assert_eq!(c.put(frame(3, 10)), PutOutcome::RejectedPinned);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn ref_drop_releases() {
        let c = cache(2, 1 << 20);
        c.put(frame(1, 10));
        {
            let r = c.get(1).unwrap();
            assert_eq!(r.frame().frame_id, 1);
        }
        // Refcount back to zero; eviction works again.
        c.put(frame(2, 10));
        c.put(frame(3, 10));
        assert!(c.get(1).is_none());
    }
}
