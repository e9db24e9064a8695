// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Clock interface and implementations for testability.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use crate::Mutex;

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall time from `CLOCK_REALTIME`.
    fn realtime(&self) -> jiff::Timestamp;

    /// Gets nanoseconds since an arbitrary origin from a monotonic clock.
    ///
    /// On Linux, this uses `CLOCK_BOOTTIME`, which includes suspended time.
    /// On other systems, it uses `CLOCK_MONOTONIC`.
    fn monotonic_ns(&self) -> u64;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

impl RealClocks {
    fn get(&self, clock: libc::clockid_t) -> libc::timespec {
        unsafe {
            let mut ts = mem::MaybeUninit::uninit();
            assert_eq!(0, libc::clock_gettime(clock, ts.as_mut_ptr()));
            ts.assume_init()
        }
    }
}

impl Clocks for RealClocks {
    fn realtime(&self) -> jiff::Timestamp {
        let ts = self.get(libc::CLOCK_REALTIME);
        // On 32-bit arm builds, `tv_sec` is an `i32` and requires conversion.
        #[allow(clippy::unnecessary_cast)]
        jiff::Timestamp::new(ts.tv_sec as i64, ts.tv_nsec as i32)
            .expect("realtime is within jiff's representable range")
    }

    #[cfg(target_os = "linux")]
    fn monotonic_ns(&self) -> u64 {
        let ts = self.get(libc::CLOCK_BOOTTIME);
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic_ns(&self) -> u64 {
        let ts = self.get(libc::CLOCK_MONOTONIC);
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }

    fn sleep(&self, how_long: Duration) {
        std::thread::sleep(how_long)
    }
}

/// Simulated clock for testing. `sleep` advances time without blocking.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: jiff::Timestamp,
    uptime: Mutex<Duration>,
}

impl SimulatedClocks {
    pub fn new(boot: jiff::Timestamp) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(Duration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> jiff::Timestamp {
        self.0.boot + *self.0.uptime.lock()
    }

    fn monotonic_ns(&self) -> u64 {
        self.0.uptime.lock().as_nanos() as u64
    }

    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.uptime.lock();
        *l += how_long;
    }
}
