// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod clock;
mod error;
pub mod shutdown;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorBuilder, ErrorKind};

pub use parking_lot::{Condvar, Mutex, MutexGuard};

pub type FastHashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type FastHashSet<K> = std::collections::HashSet<K, ahash::RandomState>;
