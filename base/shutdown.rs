// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! Dropping the [`Sender`] requests shutdown. The [`Receiver`] can be
//! cloned, checked synchronously, and awaited from async code.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::Mutex;
use slab::Slab;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

impl From<ShutdownError> for crate::Error {
    fn from(e: ShutdownError) -> Self {
        crate::err!(Cancelled, source(e))
    }
}

/// `None` iff shutdown has already been requested.
struct Inner(Mutex<Option<Slab<Waker>>>);

pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        let mut wakers = self
            .0
             .0
            .lock()
            .take()
            .expect("only the single Sender takes the slab");
        for w in wakers.drain() {
            w.wake();
        }
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

/// `waker_i` value to indicate no slot has been assigned.
const NO_WAKER: usize = usize::MAX;

impl Receiver {
    /// Returns `Err(ShutdownError)` iff shutdown has been requested.
    pub fn check(&self) -> Result<(), ShutdownError> {
        if self.0 .0.lock().is_none() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Returns a future that resolves when shutdown is requested.
    pub fn wait(&self) -> WaitFuture {
        WaitFuture {
            inner: self.0.clone(),
            waker_i: NO_WAKER,
        }
    }
}

pub struct WaitFuture {
    inner: Arc<Inner>,
    waker_i: usize,
}

impl Future for WaitFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        let mut l = this.inner.0.lock();
        let wakers = match &mut *l {
            None => return Poll::Ready(()),
            Some(w) => w,
        };
        let new_waker = cx.waker();
        if this.waker_i == NO_WAKER {
            this.waker_i = wakers.insert(new_waker.clone());
        } else {
            let existing_waker = &mut wakers[this.waker_i];
            if !new_waker.will_wake(existing_waker) {
                existing_waker.clone_from(new_waker);
            }
        }
        Poll::Pending
    }
}

impl Drop for WaitFuture {
    fn drop(&mut self) {
        if self.waker_i == NO_WAKER {
            return;
        }
        let mut l = self.inner.0.lock();
        if let Some(wakers) = &mut *l {
            wakers.remove(self.waker_i);
        }
    }
}

/// Returns a sender and receiver for graceful shutdown.
///
/// Dropping the sender will request shutdown.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner(Mutex::new(Some(Slab::new()))));
    (Sender(inner.clone()), Receiver(inner))
}

#[cfg(test)]
mod tests {
    use futures::Future;
    use std::task::{Context, Poll};

    #[test]
    fn simple_check() {
        let (tx, rx) = super::channel();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
    }

    #[test]
    fn future_resolves_on_drop() {
        let (tx, rx) = super::channel();
        let waker = futures::task::noop_waker_ref();
        let mut cx = Context::from_waker(waker);
        let mut f = rx.wait();
        assert_eq!(std::pin::Pin::new(&mut f).poll(&mut cx), Poll::Pending);
        drop(tx);
        assert_eq!(std::pin::Pin::new(&mut f).poll(&mut cx), Poll::Ready(()));
    }

    #[test]
    fn dropped_future_releases_slot() {
        let (tx, rx) = super::channel();
        let waker = futures::task::noop_waker_ref();
        let mut cx = Context::from_waker(waker);
        {
            let mut f = rx.wait();
            assert_eq!(std::pin::Pin::new(&mut f).poll(&mut cx), Poll::Pending);
        }
        // Dropping the sender after the future is gone must not panic.
        drop(tx);
        rx.check().unwrap_err();
    }
}
