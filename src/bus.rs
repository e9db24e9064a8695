// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Typed publish/subscribe over a closed topic set.
//!
//! Every subscriber owns a bounded ring per its subscription; `publish`
//! never blocks. When a ring is full the oldest event is dropped and
//! `bus_dropped_total{topic}` is incremented. Delivery is FIFO per topic to
//! a given subscriber; there is no cross-topic ordering guarantee.

use crate::frame::Detection;
use crate::metrics::Metrics;
use base::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::debug;

/// Ring capacity per subscriber.
const QUEUE_CAPACITY: usize = 1024;

/// The closed set of topics.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Topic {
    AiDetection,
    AiKeepalive,
    SessionOpen,
    SessionClose,
    TimerDwellOk,
    TimerSilenceOk,
    TimerPostrollOk,

    // Reserved stream lifecycle events, published by the publisher
    // controller.
    StreamStart,
    StreamStop,
    StreamError,
}

impl Topic {
    pub const ALL: [Topic; 10] = [
        Topic::AiDetection,
        Topic::AiKeepalive,
        Topic::SessionOpen,
        Topic::SessionClose,
        Topic::TimerDwellOk,
        Topic::TimerSilenceOk,
        Topic::TimerPostrollOk,
        Topic::StreamStart,
        Topic::StreamStop,
        Topic::StreamError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::AiDetection => "ai.detection",
            Topic::AiKeepalive => "ai.keepalive",
            Topic::SessionOpen => "session.open",
            Topic::SessionClose => "session.close",
            Topic::TimerDwellOk => "fsm.t.dwell.ok",
            Topic::TimerSilenceOk => "fsm.t.silence.ok",
            Topic::TimerPostrollOk => "fsm.t.postroll.ok",
            Topic::StreamStart => "stream.start",
            Topic::StreamStop => "stream.stop",
            Topic::StreamError => "stream.error",
        }
    }
}

/// A filtered, scored detection event as published on `ai.detection`.
#[derive(Debug)]
pub struct DetectionEvent {
    pub frame_id: u64,
    pub ts_utc_ns: u64,
    pub relevant: bool,
    pub score: f32,
    pub detections: Vec<Detection>,
}

#[derive(Clone, Debug)]
pub enum Event {
    Detection(Arc<DetectionEvent>),
    Keepalive { frame_id: u64 },
    SessionOpen { session_id: String },
    SessionClose { session_id: String },

    /// Timer completions carry the generation of the timer that fired so
    /// the orchestrator can discard events from cancelled timers.
    DwellOk { generation: u64 },
    SilenceOk { generation: u64 },
    PostrollOk { generation: u64 },

    StreamStart,
    StreamStop,
    StreamError { message: String },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::Detection(_) => Topic::AiDetection,
            Event::Keepalive { .. } => Topic::AiKeepalive,
            Event::SessionOpen { .. } => Topic::SessionOpen,
            Event::SessionClose { .. } => Topic::SessionClose,
            Event::DwellOk { .. } => Topic::TimerDwellOk,
            Event::SilenceOk { .. } => Topic::TimerSilenceOk,
            Event::PostrollOk { .. } => Topic::TimerPostrollOk,
            Event::StreamStart => Topic::StreamStart,
            Event::StreamStop => Topic::StreamStop,
            Event::StreamError { .. } => Topic::StreamError,
        }
    }
}

struct SubInner {
    name: &'static str,
    topics: Vec<Topic>,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
}

/// A subscriber's receive handle. Dropping it detaches from the bus.
pub struct Subscription(Arc<SubInner>);

impl Subscription {
    /// Receives the next event, waiting if the ring is empty.
    pub async fn recv(&self) -> Event {
        loop {
            if let Some(e) = self.try_recv() {
                return e;
            }
            self.0.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.0.queue.lock().pop_front()
    }
}

/// The process-wide event bus. Cheap to clone.
#[derive(Clone)]
pub struct Bus {
    subs: Arc<Mutex<Vec<Weak<SubInner>>>>,
    metrics: Arc<Metrics>,
}

impl Bus {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Bus {
            subs: Arc::new(Mutex::new(Vec::new())),
            metrics,
        }
    }

    /// Registers a subscriber for the given topics. `name` is for logs only.
    pub fn subscribe(&self, name: &'static str, topics: &[Topic]) -> Subscription {
        let inner = Arc::new(SubInner {
            name,
            topics: topics.to_vec(),
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            notify: Notify::new(),
        });
        self.subs.lock().push(Arc::downgrade(&inner));
        Subscription(inner)
    }

    /// Publishes an event to every matching subscriber. Never blocks; when a
    /// subscriber's ring is full, its oldest event is dropped and counted.
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        let mut subs = self.subs.lock();
        subs.retain(|w| {
            let Some(sub) = w.upgrade() else {
                return false;
            };
            if !sub.topics.contains(&topic) {
                return true;
            }
            {
                let mut q = sub.queue.lock();
                if q.len() >= QUEUE_CAPACITY {
                    let dropped = q.pop_front().expect("full ring is non-empty");
                    self.metrics.bus_dropped_total.inc(dropped.topic().as_str());
                    debug!(
                        subscriber = sub.name,
                        topic = dropped.topic().as_str(),
                        "dropping oldest event for slow subscriber"
                    );
                }
                q.push_back(event.clone());
            }
            sub.notify.notify_one();
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(frame_id: u64) -> Event {
        Event::Detection(Arc::new(DetectionEvent {
            frame_id,
            ts_utc_ns: 0,
            relevant: true,
            score: 0.9,
            detections: Vec::new(),
        }))
    }

    fn frame_id_of(e: &Event) -> u64 {
        match e {
            Event::Detection(d) => d.frame_id,
            Event::Keepalive { frame_id } => *frame_id,
            _ => panic!("unexpected event {e:?}"),
        }
    }

    #[tokio::test]
    async fn fifo_within_topic() {
        let bus = Bus::new(Metrics::new());
        let sub = bus.subscribe("t", &[Topic::AiDetection]);
        for i in 1..=5 {
            bus.publish(detection(i));
        }
        for i in 1..=5 {
            assert_eq!(frame_id_of(&sub.recv().await), i);
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn topic_filtering() {
        let bus = Bus::new(Metrics::new());
        let sub = bus.subscribe("t", &[Topic::AiKeepalive]);
        bus.publish(detection(1));
        bus.publish(Event::Keepalive { frame_id: 2 });
        assert_eq!(frame_id_of(&sub.recv().await), 2);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn drop_oldest_and_count() {
        let metrics = Metrics::new();
        let bus = Bus::new(metrics.clone());
        let sub = bus.subscribe("t", &[Topic::AiDetection]);
        for i in 0..(QUEUE_CAPACITY as u64 + 3) {
            bus.publish(detection(i));
        }
        assert_eq!(metrics.bus_dropped_total.get("ai.detection"), 3);
        // The ring now starts at the fourth event.
        assert_eq!(frame_id_of(&sub.recv().await), 3);
    }

    #[tokio::test]
    async fn dropped_subscription_detaches() {
        let bus = Bus::new(Metrics::new());
        let sub = bus.subscribe("t", &[Topic::AiDetection]);
        drop(sub);
        bus.publish(detection(1));
        assert!(bus.subs.lock().is_empty());
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let bus = Bus::new(Metrics::new());
        let sub = bus.subscribe("t", &[Topic::SessionOpen]);
        let bus2 = bus.clone();
        let h = tokio::spawn(async move { sub.recv().await });
        tokio::task::yield_now().await;
        bus2.publish(Event::SessionOpen {
            session_id: "s1".to_owned(),
        });
        match h.await.unwrap() {
            Event::SessionOpen { session_id } => assert_eq!(session_id, "s1"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
