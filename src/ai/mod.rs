// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The inference worker interface: wire protocol and client.

pub mod client;
pub mod proto;

pub use client::{AiClient, AiClientConfig, ClientState, ConnInfo, SendError};
pub use proto::{Envelope, Init, InitOk};
