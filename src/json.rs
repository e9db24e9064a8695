// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! JSON types exchanged on the control API and with the session store.

use crate::frame::Detection;
use crate::metrics::MetricsSnapshot;
use serde::{Deserialize, Serialize};

/// `GET /status` on the supervisor: manager state plus the child's
/// snapshot, when one is running and reachable.
#[derive(Serialize, Debug)]
pub struct TopLevelStatus {
    pub manager: ManagerStatus,
    pub agent: Option<AgentSnapshot>,
}

#[derive(Serialize, Debug)]
pub struct ManagerStatus {
    /// `idle`, `running`, or `stopping`.
    pub state: String,
    pub pid: Option<u32>,
    pub autostart: bool,
    pub started_at: Option<String>,
    pub last_exit: Option<String>,
    pub last_error: Option<String>,
}

/// The runtime's own snapshot, served on the internal status port and
/// embedded in the supervisor's `/status`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AgentSnapshot {
    /// FSM state name: `IDLE`, `DWELL`, `ACTIVE`, `CLOSING`.
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Results received from the worker since runtime start.
    pub frames_processed: u64,
    pub detections_total: u64,
    pub sessions_opened: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
}

impl AgentSnapshot {
    pub fn with_metrics(mut self, metrics: &MetricsSnapshot) -> Self {
        self.metrics = Some(serde_json::to_value(metrics).expect("metrics serialize"));
        self
    }
}

/// `GET /config/classes`.
#[derive(Serialize, Deserialize, Debug)]
pub struct ClassesResponse {
    /// Contents of the override file, if present.
    #[serde(rename = "override")]
    pub override_: Option<Vec<String>>,
    pub catalog: Vec<String>,

    /// The set the runtime will use at next start.
    pub effective: Vec<String>,
}

/// `PUT /config/classes`.
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClassesPut {
    pub classes: Vec<String>,
}

// Session store shapes (§6 of the external contract).

#[derive(Serialize, Debug)]
pub struct SessionOpenRequest<'a> {
    pub device_id: &'a str,
    pub start_ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'a str>,
}

#[derive(Deserialize, Debug)]
pub struct SessionOpenResponse {
    pub session_id: String,
    #[allow(dead_code)] // echoed by the server; not consumed.
    pub start_ts: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct SessionCloseRequest<'a> {
    pub session_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<String>,
}

/// The `meta` part of an `/ingest` multipart request.
#[derive(Serialize, Deserialize, Debug)]
pub struct IngestMeta {
    pub session_id: String,
    pub frame_id: u64,
    pub ts_utc: String,
    pub detections: Vec<Detection>,

    /// Idempotency keys: the server deduplicates per `event_id` per
    /// session; `batch_id` groups one flush for diagnostics.
    pub event_id: String,
    pub batch_id: String,
}

#[derive(Deserialize, Debug, Default)]
pub struct IngestResponse {
    pub inserted: u64,
    pub skipped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_shape() {
        let s = TopLevelStatus {
            manager: ManagerStatus {
                state: "running".to_owned(),
                pid: Some(4242),
                autostart: false,
                started_at: Some("2026-07-01T00:00:00Z".to_owned()),
                last_exit: None,
                last_error: None,
            },
            agent: Some(AgentSnapshot {
                state: "ACTIVE".to_owned(),
                session_id: Some("s-17".to_owned()),
                frames_processed: 120,
                detections_total: 4,
                sessions_opened: 1,
                last_error: None,
                metrics: None,
            }),
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["manager"]["state"], "running");
        assert_eq!(v["agent"]["state"], "ACTIVE");
        assert_eq!(v["agent"]["session_id"], "s-17");
        assert_eq!(v["agent"]["frames_processed"], 120);
    }

    #[test]
    fn classes_override_field_name() {
        let r = ClassesResponse {
            override_: Some(vec!["person".to_owned()]),
            catalog: vec!["person".to_owned(), "dog".to_owned()],
            effective: vec!["person".to_owned()],
        };
        let v = serde_json::to_value(&r).unwrap();
        assert!(v.get("override").is_some());
        assert!(v.get("override_").is_none());
    }
}
