// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Thin REST client for the session store.
//!
//! Session ids are server-issued strings, opaque here. Every call carries a
//! bounded deadline; callers decide about retries.

use crate::json::{
    IngestMeta, IngestResponse, SessionCloseRequest, SessionOpenRequest, SessionOpenResponse,
};
use async_trait::async_trait;
use base::{bail, err, Error};
use bytes::Bytes;
use std::time::Duration;
use url::Url;

/// Total deadline for any single store call.
const REQUEST_DEADLINE: Duration = Duration::from_secs(5);

/// An evidence image as uploaded in the `frame` part. JPEG compression is
/// the adapter's concern; the core hands over whatever bytes were cached.
#[derive(Clone, Debug)]
pub struct EvidenceImage {
    pub content_type: &'static str,
    pub bytes: Bytes,
}

/// Store operations used by the core loop. A trait so orchestrator and
/// ingester tests can substitute a mock.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// `POST /sessions/open`; returns the issued session id.
    async fn open(
        &self,
        start_ts: jiff::Timestamp,
        stream_path: Option<&str>,
    ) -> Result<String, Error>;

    /// `POST /sessions/close`.
    async fn close(&self, session_id: &str, end_ts: Option<jiff::Timestamp>) -> Result<(), Error>;

    /// `POST /ingest`: multipart `meta` + `frame`.
    async fn ingest(&self, meta: &IngestMeta, image: &EvidenceImage)
        -> Result<IngestResponse, Error>;
}

pub struct RestSessionStore {
    base: Url,
    device_id: String,
    http: reqwest::Client,
}

impl RestSessionStore {
    pub fn new(base_url: &str, device_id: String) -> Result<Self, Error> {
        let base = Url::parse(base_url)
            .map_err(|e| err!(InvalidArgument, msg("bad store url {base_url:?}"), source(e)))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_DEADLINE)
            .build()
            .map_err(|e| err!(Internal, source(e)))?;
        Ok(RestSessionStore {
            base,
            device_id,
            http,
        })
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut u = self.base.clone();
        u.set_path(path);
        u
    }

    /// `GET /sessions/range`. Only needed by external observers; not part
    /// of the core loop.
    pub async fn list_range(
        &self,
        from: jiff::Timestamp,
        to: jiff::Timestamp,
        classes: Option<&[String]>,
    ) -> Result<serde_json::Value, Error> {
        let mut url = self.endpoint("/sessions/range");
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("from", &from.to_string());
            q.append_pair("to", &to.to_string());
            if let Some(classes) = classes {
                q.append_pair("classes", &classes.join(","));
            }
        }
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| err!(Unavailable, msg("sessions/range"), source(e)))?;
        let resp = check_status(resp, "sessions/range").await?;
        resp.json()
            .await
            .map_err(|e| err!(DataLoss, msg("bad sessions/range body"), source(e)))
    }
}

async fn check_status(resp: reqwest::Response, what: &str) -> Result<reqwest::Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let kind = if status.is_server_error() {
        base::ErrorKind::Unavailable
    } else {
        base::ErrorKind::FailedPrecondition
    };
    Err(err!(
        kind,
        msg("{what} returned {status}: {}", body.chars().take(200).collect::<String>())
    ))
}

#[async_trait]
impl SessionStore for RestSessionStore {
    async fn open(
        &self,
        start_ts: jiff::Timestamp,
        stream_path: Option<&str>,
    ) -> Result<String, Error> {
        let body = SessionOpenRequest {
            device_id: &self.device_id,
            start_ts: start_ts.to_string(),
            stream_path,
            reason: Some("detection"),
        };
        let resp = self
            .http
            .post(self.endpoint("/sessions/open"))
            .json(&body)
            .send()
            .await
            .map_err(|e| err!(Unavailable, msg("sessions/open"), source(e)))?;
        let resp = check_status(resp, "sessions/open").await?;
        let parsed: SessionOpenResponse = resp
            .json()
            .await
            .map_err(|e| err!(DataLoss, msg("bad sessions/open body"), source(e)))?;
        if parsed.session_id.is_empty() {
            bail!(DataLoss, msg("sessions/open returned an empty session id"));
        }
        Ok(parsed.session_id)
    }

    async fn close(&self, session_id: &str, end_ts: Option<jiff::Timestamp>) -> Result<(), Error> {
        let body = SessionCloseRequest {
            session_id,
            end_ts: end_ts.map(|t| t.to_string()),
        };
        let resp = self
            .http
            .post(self.endpoint("/sessions/close"))
            .json(&body)
            .send()
            .await
            .map_err(|e| err!(Unavailable, msg("sessions/close"), source(e)))?;
        check_status(resp, "sessions/close").await?;
        Ok(())
    }

    async fn ingest(
        &self,
        meta: &IngestMeta,
        image: &EvidenceImage,
    ) -> Result<IngestResponse, Error> {
        let meta_json = serde_json::to_string(meta).expect("meta serializes");
        let meta_part = reqwest::multipart::Part::text(meta_json)
            .file_name("meta.json")
            .mime_str("application/json")
            .expect("static mime parses");
        let frame_part = reqwest::multipart::Part::bytes(image.bytes.to_vec())
            .file_name("frame.jpg")
            .mime_str(image.content_type)
            .map_err(|e| err!(InvalidArgument, msg("bad image content type"), source(e)))?;
        let form = reqwest::multipart::Form::new()
            .part("meta", meta_part)
            .part("frame", frame_part);
        let resp = self
            .http
            .post(self.endpoint("/ingest"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| err!(Unavailable, msg("ingest"), source(e)))?;
        let resp = check_status(resp, "ingest").await?;
        resp.json()
            .await
            .map_err(|e| err!(DataLoss, msg("bad ingest body"), source(e)))
    }
}
