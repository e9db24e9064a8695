// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Frame and detection data model shared by the feeder, the AI client, and
//! the evidence path.

use base::{bail, Error};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Pixel formats accepted on the worker protocol.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PixelFormat {
    Nv12,
    I420,
    Jpeg,
}

impl PixelFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Nv12 => "NV12",
            PixelFormat::I420 => "I420",
            PixelFormat::Jpeg => "JPEG",
        }
    }

    /// Stable code used on the wire; see the protocol module.
    pub fn wire_code(self) -> u32 {
        match self {
            PixelFormat::Nv12 => 1,
            PixelFormat::I420 => 2,
            PixelFormat::Jpeg => 3,
        }
    }

    pub fn from_wire_code(c: u32) -> Result<Self, Error> {
        Ok(match c {
            1 => PixelFormat::Nv12,
            2 => PixelFormat::I420,
            3 => PixelFormat::Jpeg,
            _ => bail!(InvalidArgument, msg("unknown pixel format code {c}")),
        })
    }

    pub fn is_raw(self) -> bool {
        !matches!(self, PixelFormat::Jpeg)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NV12" | "nv12" => PixelFormat::Nv12,
            "I420" | "i420" => PixelFormat::I420,
            "JPEG" | "jpeg" => PixelFormat::Jpeg,
            _ => bail!(InvalidArgument, msg("unknown pixel format {s:?}")),
        })
    }
}

/// One plane of a raw frame, described relative to the payload buffer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Plane {
    pub offset: usize,
    pub stride: usize,
    pub len: usize,
}

/// The number of payload bytes of a raw NV12 frame with even dimensions.
pub fn nv12_frame_bytes(width: u32, height: u32) -> usize {
    (width as usize) * (height as usize) * 3 / 2
}

/// Standard plane layout for a tightly-packed NV12 frame.
pub fn nv12_planes(width: u32, height: u32) -> Vec<Plane> {
    let w = width as usize;
    let h = height as usize;
    vec![
        Plane {
            offset: 0,
            stride: w,
            len: w * h,
        },
        Plane {
            offset: w * h,
            stride: w,
            len: w * h / 2,
        },
    ]
}

/// Standard plane layout for a tightly-packed I420 frame.
pub fn i420_planes(width: u32, height: u32) -> Vec<Plane> {
    let w = width as usize;
    let h = height as usize;
    vec![
        Plane {
            offset: 0,
            stride: w,
            len: w * h,
        },
        Plane {
            offset: w * h,
            stride: w / 2,
            len: w * h / 4,
        },
        Plane {
            offset: w * h + w * h / 4,
            stride: w / 2,
            len: w * h / 4,
        },
    ]
}

/// A frame as sent to the inference worker and cached for evidence.
///
/// `frame_id` is monotonic per worker connection, starting at 1; it resets
/// on reconnect.
#[derive(Clone, PartialEq)]
pub struct Frame {
    pub frame_id: u64,

    /// Monotonic clock at capture, host-local.
    pub ts_mono_ns: u64,

    /// Wall clock at capture, derived from the mono/wall pairing taken at
    /// connection start and reused (never re-paired mid-connection).
    pub ts_utc_ns: u64,

    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,

    /// Empty for `Jpeg`; per-plane layout for raw formats.
    pub planes: Vec<Plane>,

    pub data: Bytes,
}

impl Frame {
    /// Checks the payload-size invariants: for raw planar formats the
    /// payload equals the sum of the plane sizes, and NV12 with even
    /// dimensions is exactly `w*h*3/2`.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.pixel_format.is_raw() {
            return Ok(());
        }
        let plane_sum: usize = self.planes.iter().map(|p| p.len).sum();
        if plane_sum != self.data.len() {
            bail!(
                InvalidArgument,
                msg(
                    "frame {}: payload is {} bytes but planes sum to {}",
                    self.frame_id,
                    self.data.len(),
                    plane_sum
                )
            );
        }
        for p in &self.planes {
            if p.offset + p.len > self.data.len() {
                bail!(
                    InvalidArgument,
                    msg("frame {}: plane {p:?} exceeds payload", self.frame_id)
                );
            }
        }
        if self.pixel_format == PixelFormat::Nv12
            && self.width % 2 == 0
            && self.height % 2 == 0
            && self.data.len() != nv12_frame_bytes(self.width, self.height)
        {
            bail!(
                InvalidArgument,
                msg(
                    "frame {}: NV12 {}x{} must be {} bytes, got {}",
                    self.frame_id,
                    self.width,
                    self.height,
                    nv12_frame_bytes(self.width, self.height),
                    self.data.len()
                )
            );
        }
        Ok(())
    }

    /// RFC 3339 rendering of `ts_utc_ns`, as carried on the wire.
    pub fn ts_iso(&self) -> String {
        ts_iso(self.ts_utc_ns)
    }
}

pub fn ts_iso(ts_utc_ns: u64) -> String {
    jiff::Timestamp::from_nanosecond(ts_utc_ns as i128)
        .expect("capture timestamps are within jiff's range")
        .to_string()
}

/// Custom `Debug` impl that skips the verbose `data` field.
impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("frame_id", &self.frame_id)
            .field("ts_utc", &self.ts_iso())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixel_format", &self.pixel_format)
            .field("bytes", &self.data.len())
            .finish_non_exhaustive()
    }
}

/// Bounding box in source pixels.
#[derive(Copy, Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl From<[f32; 4]> for BBox {
    fn from([x, y, w, h]: [f32; 4]) -> Self {
        BBox { x, y, w, h }
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x, b.y, b.w, b.h]
    }
}

/// One detection within a result. Immutable once produced.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Detection {
    pub cls: String,
    pub conf: f32,
    pub bbox: BBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
}

/// A worker response for one frame.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct InferenceResult {
    pub frame_id: u64,
    pub ts_iso: String,
    pub ts_mono_ns: u64,
    pub detections: Vec<Detection>,
    pub lat_pre_ms: Option<f32>,
    pub lat_infer_ms: Option<f32>,
    pub lat_post_ms: Option<f32>,
}
