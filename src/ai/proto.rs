// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! AI Protocol v1: the framed binary envelope spoken to the inference
//! worker.
//!
//! Each message on the socket is a 4-byte little-endian payload length
//! followed by the payload: one `Envelope` in protocol-buffer wire format
//! (tag/wire-type keys, varints for integers, fixed32 for floats,
//! length-delimited strings/bytes/submessages). Unknown fields are
//! skipped, so either side can extend messages without breaking the other.
//!
//! Both directions are implemented; the agent only sends `Init`, `Frame`,
//! `Heartbeat`, and `Shutdown`, but tests stand in for the worker.

use crate::frame::{Detection, Frame, InferenceResult, PixelFormat, Plane};
use base::{bail, err, Error};
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;

/// Protocol version carried in every envelope.
pub const VERSION: u64 = 1;

/// Upper bound on a single payload; a longer length prefix means the
/// framing is desynchronized.
pub const MAX_PAYLOAD: usize = 64 << 20;

const WIRETYPE_VARINT: u64 = 0;
const WIRETYPE_FIXED32: u64 = 5;
const WIRETYPE_LEN: u64 = 2;

// Envelope field numbers.
const F_VERSION: u64 = 1;
const F_INIT: u64 = 2;
const F_INIT_OK: u64 = 3;
const F_FRAME: u64 = 4;
const F_RESULT: u64 = 5;
const F_WINDOW_UPDATE: u64 = 6;
const F_ERROR: u64 = 7;
const F_HEARTBEAT: u64 = 8;
const F_SHUTDOWN: u64 = 9;

#[derive(Clone, PartialEq, Debug)]
pub struct Init {
    pub model_path: String,
    pub width: u32,
    pub height: u32,
    pub conf_threshold: f32,
    pub allowed_formats: Vec<PixelFormat>,
    pub codec: String,
    pub max_inflight: u32,
}

#[derive(Clone, PartialEq, Debug)]
pub struct InitOk {
    pub chosen_format: PixelFormat,
    pub chosen_codec: String,
    pub width: u32,
    pub height: u32,
    pub initial_credits: u32,
    pub max_frame_bytes: u64,
}

#[derive(Clone, PartialEq, Debug)]
pub enum Envelope {
    Init(Init),
    InitOk(InitOk),
    Frame(Frame),
    Result(InferenceResult),
    WindowUpdate { credits: u32 },
    Error { code: u32, message: String },
    Heartbeat { ts_mono_ns: u64 },
    Shutdown,
}

// ---- low-level wire helpers ----

fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn put_key(buf: &mut Vec<u8>, field: u64, wiretype: u64) {
    put_uvarint(buf, (field << 3) | wiretype);
}

fn put_varint_field(buf: &mut Vec<u8>, field: u64, v: u64) {
    if v == 0 {
        return; // proto3 default
    }
    put_key(buf, field, WIRETYPE_VARINT);
    put_uvarint(buf, v);
}

fn put_f32_field(buf: &mut Vec<u8>, field: u64, v: f32) {
    put_key(buf, field, WIRETYPE_FIXED32);
    let mut b = [0u8; 4];
    LittleEndian::write_f32(&mut b, v);
    buf.extend_from_slice(&b);
}

fn put_bytes_field(buf: &mut Vec<u8>, field: u64, v: &[u8]) {
    if v.is_empty() {
        return;
    }
    put_key(buf, field, WIRETYPE_LEN);
    put_uvarint(buf, v.len() as u64);
    buf.extend_from_slice(v);
}

fn put_str_field(buf: &mut Vec<u8>, field: u64, v: &str) {
    put_bytes_field(buf, field, v.as_bytes());
}

/// Writes a submessage even when empty, so presence is visible (needed for
/// `Shutdown` and zero-valued payload variants).
fn put_msg_field(buf: &mut Vec<u8>, field: u64, inner: &[u8]) {
    put_key(buf, field, WIRETYPE_LEN);
    put_uvarint(buf, inner.len() as u64);
    buf.extend_from_slice(inner);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

enum Value<'a> {
    Varint(u64),
    Fixed32(u32),
    Bytes(&'a [u8]),
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn uvarint(&mut self) -> Result<u64, Error> {
        let mut out = 0u64;
        let mut shift = 0u32;
        loop {
            let Some(&b) = self.data.get(self.pos) else {
                bail!(DataLoss, msg("truncated varint"));
            };
            self.pos += 1;
            if shift >= 63 && b > 1 {
                bail!(DataLoss, msg("varint overflows u64"));
            }
            out |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(out);
            }
            shift += 7;
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.data.len() - self.pos < n {
            bail!(DataLoss, msg("truncated field: wanted {n} bytes"));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// Returns the next `(field, value)`, or `None` at end of message.
    /// Unsupported wire types are an error (groups are never produced).
    fn next_field(&mut self) -> Result<Option<(u64, Value<'a>)>, Error> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        let key = self.uvarint()?;
        let field = key >> 3;
        let value = match key & 0x7 {
            WIRETYPE_VARINT => Value::Varint(self.uvarint()?),
            WIRETYPE_FIXED32 => Value::Fixed32(LittleEndian::read_u32(self.take(4)?)),
            WIRETYPE_LEN => {
                let len = self.uvarint()?;
                let len = usize::try_from(len)
                    .ok()
                    .filter(|&l| l <= MAX_PAYLOAD)
                    .ok_or_else(|| err!(DataLoss, msg("length-delimited field of {len} bytes")))?;
                Value::Bytes(self.take(len)?)
            }
            t => bail!(DataLoss, msg("unsupported wire type {t} for field {field}")),
        };
        Ok(Some((field, value)))
    }
}

impl Value<'_> {
    fn varint(&self) -> Result<u64, Error> {
        match self {
            Value::Varint(v) => Ok(*v),
            _ => bail!(DataLoss, msg("expected varint")),
        }
    }

    fn u32(&self) -> Result<u32, Error> {
        u32::try_from(self.varint()?).map_err(|_| err!(DataLoss, msg("varint exceeds u32")))
    }

    fn f32(&self) -> Result<f32, Error> {
        match self {
            Value::Fixed32(v) => Ok(f32::from_bits(*v)),
            _ => bail!(DataLoss, msg("expected fixed32")),
        }
    }

    fn bytes(&self) -> Result<&[u8], Error> {
        match self {
            Value::Bytes(b) => Ok(b),
            _ => bail!(DataLoss, msg("expected length-delimited field")),
        }
    }

    fn string(&self) -> Result<String, Error> {
        std::str::from_utf8(self.bytes()?)
            .map(str::to_owned)
            .map_err(|e| err!(DataLoss, msg("invalid utf-8 in string field"), source(e)))
    }
}

// ---- message bodies ----

fn encode_init(m: &Init) -> Vec<u8> {
    let mut b = Vec::new();
    put_str_field(&mut b, 1, &m.model_path);
    put_varint_field(&mut b, 2, m.width as u64);
    put_varint_field(&mut b, 3, m.height as u64);
    put_f32_field(&mut b, 4, m.conf_threshold);
    for f in &m.allowed_formats {
        put_key(&mut b, 5, WIRETYPE_VARINT);
        put_uvarint(&mut b, f.wire_code() as u64);
    }
    put_str_field(&mut b, 6, &m.codec);
    put_varint_field(&mut b, 7, m.max_inflight as u64);
    b
}

fn decode_init(data: &[u8]) -> Result<Init, Error> {
    let mut r = Reader::new(data);
    let mut m = Init {
        model_path: String::new(),
        width: 0,
        height: 0,
        conf_threshold: 0.,
        allowed_formats: Vec::new(),
        codec: String::new(),
        max_inflight: 0,
    };
    while let Some((field, v)) = r.next_field()? {
        match field {
            1 => m.model_path = v.string()?,
            2 => m.width = v.u32()?,
            3 => m.height = v.u32()?,
            4 => m.conf_threshold = v.f32()?,
            5 => m.allowed_formats.push(PixelFormat::from_wire_code(v.u32()?)?),
            6 => m.codec = v.string()?,
            7 => m.max_inflight = v.u32()?,
            _ => {}
        }
    }
    Ok(m)
}

fn encode_init_ok(m: &InitOk) -> Vec<u8> {
    let mut b = Vec::new();
    put_varint_field(&mut b, 1, m.chosen_format.wire_code() as u64);
    put_str_field(&mut b, 2, &m.chosen_codec);
    put_varint_field(&mut b, 3, m.width as u64);
    put_varint_field(&mut b, 4, m.height as u64);
    put_varint_field(&mut b, 5, m.initial_credits as u64);
    put_varint_field(&mut b, 6, m.max_frame_bytes);
    b
}

fn decode_init_ok(data: &[u8]) -> Result<InitOk, Error> {
    let mut r = Reader::new(data);
    let mut chosen_format = None;
    let mut m = InitOk {
        chosen_format: PixelFormat::Nv12,
        chosen_codec: String::new(),
        width: 0,
        height: 0,
        initial_credits: 0,
        max_frame_bytes: 0,
    };
    while let Some((field, v)) = r.next_field()? {
        match field {
            1 => chosen_format = Some(PixelFormat::from_wire_code(v.u32()?)?),
            2 => m.chosen_codec = v.string()?,
            3 => m.width = v.u32()?,
            4 => m.height = v.u32()?,
            5 => m.initial_credits = v.u32()?,
            6 => m.max_frame_bytes = v.varint()?,
            _ => {}
        }
    }
    m.chosen_format =
        chosen_format.ok_or_else(|| err!(DataLoss, msg("InitOk without chosen_format")))?;
    Ok(m)
}

fn encode_plane(p: &Plane) -> Vec<u8> {
    let mut b = Vec::new();
    put_varint_field(&mut b, 1, p.offset as u64);
    put_varint_field(&mut b, 2, p.stride as u64);
    put_varint_field(&mut b, 3, p.len as u64);
    b
}

fn decode_plane(data: &[u8]) -> Result<Plane, Error> {
    let mut r = Reader::new(data);
    let mut p = Plane {
        offset: 0,
        stride: 0,
        len: 0,
    };
    while let Some((field, v)) = r.next_field()? {
        match field {
            1 => p.offset = v.varint()? as usize,
            2 => p.stride = v.varint()? as usize,
            3 => p.len = v.varint()? as usize,
            _ => {}
        }
    }
    Ok(p)
}

fn encode_frame(m: &Frame) -> Vec<u8> {
    let mut b = Vec::new();
    put_varint_field(&mut b, 1, m.frame_id);
    put_str_field(&mut b, 2, &m.ts_iso());
    put_varint_field(&mut b, 3, m.ts_mono_ns);
    put_varint_field(&mut b, 4, m.ts_utc_ns);
    put_varint_field(&mut b, 5, m.width as u64);
    put_varint_field(&mut b, 6, m.height as u64);
    put_varint_field(&mut b, 7, m.pixel_format.wire_code() as u64);
    for p in &m.planes {
        put_msg_field(&mut b, 8, &encode_plane(p));
    }
    put_bytes_field(&mut b, 9, &m.data);
    b
}

fn decode_frame(data: &[u8]) -> Result<Frame, Error> {
    let mut r = Reader::new(data);
    let mut format = None;
    let mut m = Frame {
        frame_id: 0,
        ts_mono_ns: 0,
        ts_utc_ns: 0,
        width: 0,
        height: 0,
        pixel_format: PixelFormat::Nv12,
        planes: Vec::new(),
        data: Bytes::new(),
    };
    while let Some((field, v)) = r.next_field()? {
        match field {
            1 => m.frame_id = v.varint()?,
            2 => {} // ts_iso is derived from ts_utc_ns on this side.
            3 => m.ts_mono_ns = v.varint()?,
            4 => m.ts_utc_ns = v.varint()?,
            5 => m.width = v.u32()?,
            6 => m.height = v.u32()?,
            7 => format = Some(PixelFormat::from_wire_code(v.u32()?)?),
            8 => m.planes.push(decode_plane(v.bytes()?)?),
            9 => m.data = Bytes::copy_from_slice(v.bytes()?),
            _ => {}
        }
    }
    m.pixel_format = format.ok_or_else(|| err!(DataLoss, msg("Frame without pixel_format")))?;
    Ok(m)
}

fn encode_detection(d: &Detection) -> Vec<u8> {
    let mut b = Vec::new();
    put_str_field(&mut b, 1, &d.cls);
    put_f32_field(&mut b, 2, d.conf);
    let mut bbox = Vec::new();
    put_f32_field(&mut bbox, 1, d.bbox.x);
    put_f32_field(&mut bbox, 2, d.bbox.y);
    put_f32_field(&mut bbox, 3, d.bbox.w);
    put_f32_field(&mut bbox, 4, d.bbox.h);
    put_msg_field(&mut b, 3, &bbox);
    if let Some(t) = &d.track_id {
        put_str_field(&mut b, 4, t);
    }
    b
}

fn decode_detection(data: &[u8]) -> Result<Detection, Error> {
    let mut r = Reader::new(data);
    let mut d = Detection {
        cls: String::new(),
        conf: 0.,
        bbox: crate::frame::BBox {
            x: 0.,
            y: 0.,
            w: 0.,
            h: 0.,
        },
        track_id: None,
    };
    while let Some((field, v)) = r.next_field()? {
        match field {
            1 => d.cls = v.string()?,
            2 => d.conf = v.f32()?,
            3 => {
                let mut br = Reader::new(v.bytes()?);
                while let Some((bf, bv)) = br.next_field()? {
                    match bf {
                        1 => d.bbox.x = bv.f32()?,
                        2 => d.bbox.y = bv.f32()?,
                        3 => d.bbox.w = bv.f32()?,
                        4 => d.bbox.h = bv.f32()?,
                        _ => {}
                    }
                }
            }
            4 => d.track_id = Some(v.string()?),
            _ => {}
        }
    }
    Ok(d)
}

fn encode_result(m: &InferenceResult) -> Vec<u8> {
    let mut b = Vec::new();
    put_varint_field(&mut b, 1, m.frame_id);
    put_str_field(&mut b, 2, &m.ts_iso);
    put_varint_field(&mut b, 3, m.ts_mono_ns);
    for d in &m.detections {
        put_msg_field(&mut b, 4, &encode_detection(d));
    }
    if let Some(v) = m.lat_pre_ms {
        put_f32_field(&mut b, 5, v);
    }
    if let Some(v) = m.lat_infer_ms {
        put_f32_field(&mut b, 6, v);
    }
    if let Some(v) = m.lat_post_ms {
        put_f32_field(&mut b, 7, v);
    }
    b
}

fn decode_result(data: &[u8]) -> Result<InferenceResult, Error> {
    let mut r = Reader::new(data);
    let mut m = InferenceResult::default();
    while let Some((field, v)) = r.next_field()? {
        match field {
            1 => m.frame_id = v.varint()?,
            2 => m.ts_iso = v.string()?,
            3 => m.ts_mono_ns = v.varint()?,
            4 => m.detections.push(decode_detection(v.bytes()?)?),
            5 => m.lat_pre_ms = Some(v.f32()?),
            6 => m.lat_infer_ms = Some(v.f32()?),
            7 => m.lat_post_ms = Some(v.f32()?),
            _ => {}
        }
    }
    Ok(m)
}

impl Envelope {
    /// Encodes the envelope payload (without the length prefix).
    pub fn encode(&self) -> Vec<u8> {
        let mut b = Vec::new();
        put_varint_field(&mut b, F_VERSION, VERSION);
        match self {
            Envelope::Init(m) => put_msg_field(&mut b, F_INIT, &encode_init(m)),
            Envelope::InitOk(m) => put_msg_field(&mut b, F_INIT_OK, &encode_init_ok(m)),
            Envelope::Frame(m) => put_msg_field(&mut b, F_FRAME, &encode_frame(m)),
            Envelope::Result(m) => put_msg_field(&mut b, F_RESULT, &encode_result(m)),
            Envelope::WindowUpdate { credits } => {
                let mut inner = Vec::new();
                put_varint_field(&mut inner, 1, *credits as u64);
                put_msg_field(&mut b, F_WINDOW_UPDATE, &inner);
            }
            Envelope::Error { code, message } => {
                let mut inner = Vec::new();
                put_varint_field(&mut inner, 1, *code as u64);
                put_str_field(&mut inner, 2, message);
                put_msg_field(&mut b, F_ERROR, &inner);
            }
            Envelope::Heartbeat { ts_mono_ns } => {
                let mut inner = Vec::new();
                put_varint_field(&mut inner, 1, *ts_mono_ns);
                put_msg_field(&mut b, F_HEARTBEAT, &inner);
            }
            Envelope::Shutdown => put_msg_field(&mut b, F_SHUTDOWN, &[]),
        }
        b
    }

    /// Encodes the envelope with its 4-byte little-endian length prefix.
    pub fn encode_framed(&self) -> Vec<u8> {
        let payload = self.encode();
        let mut out = Vec::with_capacity(payload.len() + 4);
        let mut prefix = [0u8; 4];
        LittleEndian::write_u32(&mut prefix, payload.len() as u32);
        out.extend_from_slice(&prefix);
        out.extend_from_slice(&payload);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Envelope, Error> {
        let mut r = Reader::new(payload);
        let mut version = None;
        let mut envelope = None;
        while let Some((field, v)) = r.next_field()? {
            match field {
                F_VERSION => version = Some(v.varint()?),
                F_INIT => envelope = Some(Envelope::Init(decode_init(v.bytes()?)?)),
                F_INIT_OK => envelope = Some(Envelope::InitOk(decode_init_ok(v.bytes()?)?)),
                F_FRAME => envelope = Some(Envelope::Frame(decode_frame(v.bytes()?)?)),
                F_RESULT => envelope = Some(Envelope::Result(decode_result(v.bytes()?)?)),
                F_WINDOW_UPDATE => {
                    let mut ir = Reader::new(v.bytes()?);
                    let mut credits = 0u32;
                    while let Some((f, iv)) = ir.next_field()? {
                        if f == 1 {
                            credits = iv.u32()?;
                        }
                    }
                    envelope = Some(Envelope::WindowUpdate { credits });
                }
                F_ERROR => {
                    let mut ir = Reader::new(v.bytes()?);
                    let mut code = 0u32;
                    let mut message = String::new();
                    while let Some((f, iv)) = ir.next_field()? {
                        match f {
                            1 => code = iv.u32()?,
                            2 => message = iv.string()?,
                            _ => {}
                        }
                    }
                    envelope = Some(Envelope::Error { code, message });
                }
                F_HEARTBEAT => {
                    let mut ir = Reader::new(v.bytes()?);
                    let mut ts_mono_ns = 0u64;
                    while let Some((f, iv)) = ir.next_field()? {
                        if f == 1 {
                            ts_mono_ns = iv.varint()?;
                        }
                    }
                    envelope = Some(Envelope::Heartbeat { ts_mono_ns });
                }
                F_SHUTDOWN => {
                    v.bytes()?;
                    envelope = Some(Envelope::Shutdown);
                }
                _ => {}
            }
        }
        match version {
            Some(VERSION) => {}
            Some(v) => bail!(DataLoss, msg("unsupported protocol version {v}")),
            None => bail!(DataLoss, msg("envelope without version")),
        }
        envelope.ok_or_else(|| err!(DataLoss, msg("envelope without payload")))
    }
}

/// Encodes a `Frame` envelope with its length prefix, borrowing the frame
/// (the payload is copied once, into the output buffer).
pub fn frame_framed(f: &Frame) -> Vec<u8> {
    let body = encode_frame(f);
    let mut payload = Vec::with_capacity(body.len() + 16);
    put_varint_field(&mut payload, F_VERSION, VERSION);
    put_msg_field(&mut payload, F_FRAME, &body);
    let mut out = Vec::with_capacity(payload.len() + 4);
    let mut prefix = [0u8; 4];
    LittleEndian::write_u32(&mut prefix, payload.len() as u32);
    out.extend_from_slice(&prefix);
    out.extend_from_slice(&payload);
    out
}

/// Parses a length prefix, validating it against [`MAX_PAYLOAD`].
pub fn payload_len(prefix: [u8; 4]) -> Result<usize, Error> {
    let len = LittleEndian::read_u32(&prefix) as usize;
    if len > MAX_PAYLOAD {
        bail!(
            DataLoss,
            msg("payload length {len} exceeds {MAX_PAYLOAD}; framing desynchronized")
        );
    }
    Ok(len)
}
