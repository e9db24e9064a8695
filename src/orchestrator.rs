// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Drives the session state machine: subscribes to the bus, applies the
//! pure reducer, owns the three timers, and executes commands against the
//! publisher / store / AI adapters.
//!
//! Commands are fire-and-forget: adapter errors are logged and counted but
//! never roll back FSM state. Timers carry a generation number; an event
//! from a cancelled timer generation is discarded.

use crate::bus::{Bus, Event, Subscription, Topic};
use crate::fsm::{reduce, Command, Context, FpsMode, Input, State};
use crate::ingest::IngesterHandle;
use crate::metrics::Metrics;
use crate::publisher::Publisher;
use crate::store::SessionStore;
use async_trait::async_trait;
use base::clock::Clocks;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// AI-side controls the orchestrator drives: feeder rate mode and the
/// end-of-session notification.
#[async_trait]
pub trait AiRuntime: Send + Sync {
    async fn set_mode(&self, mode: FpsMode);

    /// Notifies the AI side that the session is over. Idempotent.
    async fn close_session(&self, session_id: &str);
}

/// Production adapter: mode switches go to the feeder's watch channel; the
/// close notification ends the ingester's session.
pub struct AiRuntimeAdapter {
    mode_tx: watch::Sender<FpsMode>,
    ingester: IngesterHandle,
}

impl AiRuntimeAdapter {
    pub fn new(mode_tx: watch::Sender<FpsMode>, ingester: IngesterHandle) -> Arc<Self> {
        Arc::new(AiRuntimeAdapter { mode_tx, ingester })
    }
}

#[async_trait]
impl AiRuntime for AiRuntimeAdapter {
    async fn set_mode(&self, mode: FpsMode) {
        // No-op if unchanged; the feeder only restarts on a real change.
        self.mode_tx.send_if_modified(|m| {
            if *m != mode {
                *m = mode;
                true
            } else {
                false
            }
        });
    }

    async fn close_session(&self, _session_id: &str) {
        self.ingester.session_closed().await;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TimerConfig {
    pub dwell: Duration,
    pub silence: Duration,
    pub postroll: Duration,
}

impl From<&crate::config::FsmConfig> for TimerConfig {
    fn from(c: &crate::config::FsmConfig) -> Self {
        TimerConfig {
            dwell: Duration::from_millis(c.dwell_ms),
            silence: Duration::from_millis(c.silence_ms),
            postroll: Duration::from_millis(c.postroll_ms),
        }
    }
}

/// Observable FSM state for `/status`.
#[derive(Clone, Debug)]
pub struct FsmSnapshot {
    pub state: State,
    pub session_id: Option<String>,
}

#[derive(Clone, Copy, Debug)]
enum TimerKind {
    Dwell,
    Silence,
    Postroll,
}

struct Timer {
    generation: u64,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct Orchestrator {
    ctx: Context,
    timers: TimerConfig,
    bus: Bus,
    sub: Subscription,
    publisher: Arc<dyn Publisher>,
    store: Arc<dyn SessionStore>,
    ai: Arc<dyn AiRuntime>,
    ingester: IngesterHandle,
    clocks: Arc<dyn Clocks>,
    metrics: Arc<Metrics>,
    sessions_opened: Arc<AtomicU64>,
    snapshot_tx: watch::Sender<FsmSnapshot>,

    dwell: Option<Timer>,
    silence: Option<Timer>,
    postroll: Option<Timer>,
    next_generation: u64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timers: TimerConfig,
        bus: Bus,
        publisher: Arc<dyn Publisher>,
        store: Arc<dyn SessionStore>,
        ai: Arc<dyn AiRuntime>,
        ingester: IngesterHandle,
        clocks: Arc<dyn Clocks>,
        metrics: Arc<Metrics>,
    ) -> (Self, watch::Receiver<FsmSnapshot>, Arc<AtomicU64>) {
        let sub = bus.subscribe(
            "orchestrator",
            &[
                Topic::AiDetection,
                Topic::AiKeepalive,
                Topic::SessionOpen,
                Topic::TimerDwellOk,
                Topic::TimerSilenceOk,
                Topic::TimerPostrollOk,
            ],
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(FsmSnapshot {
            state: State::Idle,
            session_id: None,
        });
        let sessions_opened = Arc::new(AtomicU64::new(0));
        (
            Orchestrator {
                ctx: Context::default(),
                timers,
                bus,
                sub,
                publisher,
                store,
                ai,
                ingester,
                clocks,
                metrics,
                sessions_opened: sessions_opened.clone(),
                snapshot_tx,
                dwell: None,
                silence: None,
                postroll: None,
                next_generation: 0,
            },
            snapshot_rx,
            sessions_opened,
        )
    }

    pub async fn run(mut self, shutdown_rx: base::shutdown::Receiver) {
        self.metrics.fsm_state.set(State::Idle.gauge_value());
        loop {
            tokio::select! {
                _ = shutdown_rx.wait() => break,
                event = self.sub.recv() => self.handle_event(event).await,
            }
        }
        self.shutdown_cleanup().await;
        debug!("orchestrator stopped");
    }

    /// A session open at shutdown is closed on the way out, so the store
    /// never sees a session closed twice or left dangling by a clean exit.
    async fn shutdown_cleanup(&mut self) {
        let Some(id) = self.ctx.session_id.take() else {
            return;
        };
        info!(session_id = %id, "closing session on shutdown");
        if let Err(e) = self.publisher.stop(None).await {
            warn!(err = %e.chain(), "publisher stop failed during shutdown");
        }
        self.ai.close_session(&id).await;
        if let Err(e) = self.store.close(&id, Some(self.clocks.realtime())).await {
            warn!(err = %e.chain(), session_id = %id, "session close failed during shutdown");
        }
        self.bus.publish(Event::SessionClose { session_id: id });
    }

    async fn handle_event(&mut self, event: Event) {
        let input = match event {
            Event::Detection(d) => {
                if self.ctx.state == State::Active && d.relevant {
                    // Every relevant detection while active pushes the
                    // silence horizon out.
                    self.start_timer(TimerKind::Silence);
                }
                Input::Detection {
                    relevant: d.relevant,
                }
            }
            Event::Keepalive { .. } => Input::Keepalive,
            Event::SessionOpen { session_id } => {
                if self.ctx.state == State::Idle {
                    // The session raced the post-roll: it was torn down
                    // before the store issued the id. Close it immediately
                    // rather than leaking an open session server-side.
                    warn!(session_id = %session_id, "session id issued after teardown; closing it");
                    let store = self.store.clone();
                    let end = self.clocks.realtime();
                    tokio::spawn(async move {
                        if let Err(e) = store.close(&session_id, Some(end)).await {
                            warn!(err = %e.chain(), "unable to close stray session");
                        }
                    });
                    return;
                }
                self.sessions_opened.fetch_add(1, Ordering::Relaxed);
                self.ingester.session_opened(session_id.clone()).await;
                Input::SessionOpened { session_id }
            }
            Event::DwellOk { generation } => {
                if !timer_fired(&mut self.dwell, generation) {
                    return;
                }
                Input::DwellOk
            }
            Event::SilenceOk { generation } => {
                if !timer_fired(&mut self.silence, generation) {
                    return;
                }
                Input::SilenceOk
            }
            Event::PostrollOk { generation } => {
                if !timer_fired(&mut self.postroll, generation) {
                    return;
                }
                Input::PostrollOk
            }
            Event::SessionClose { .. }
            | Event::StreamStart
            | Event::StreamStop
            | Event::StreamError { .. } => return,
        };

        let (next, commands) = reduce(&self.ctx, &input);
        if next.state != self.ctx.state {
            self.on_transition(self.ctx.state, next.state);
        }
        self.ctx = next;
        self.snapshot_tx.send_replace(FsmSnapshot {
            state: self.ctx.state,
            session_id: self.ctx.session_id.clone(),
        });
        for command in commands {
            self.execute(command).await;
        }
    }

    fn on_transition(&mut self, from: State, to: State) {
        info!(from = from.as_str(), to = to.as_str(), "fsm transition");
        self.metrics
            .fsm_transitions_total
            .inc(&format!("{}->{}", from.as_str(), to.as_str()));
        self.metrics.fsm_state.set(to.gauge_value());
        match (from, to) {
            (State::Idle, State::Dwell) => self.start_timer(TimerKind::Dwell),
            (State::Dwell, State::Active) => {
                self.dwell = None; // just fired
                self.start_timer(TimerKind::Silence);
            }
            (State::Active, State::Closing) => {
                cancel_timer(&mut self.silence);
                self.start_timer(TimerKind::Postroll);
            }
            (State::Closing, State::Active) => {
                cancel_timer(&mut self.postroll);
                self.start_timer(TimerKind::Silence);
            }
            (State::Closing, State::Idle) => {
                self.postroll = None; // just fired
            }
            (from, to) => debug!(from = from.as_str(), to = to.as_str(), "unexpected edge"),
        }
    }

    async fn execute(&mut self, command: Command) {
        debug!(?command, "executing");
        match command {
            Command::StartStream => {
                if let Err(e) = self.publisher.start().await {
                    warn!(err = %e.chain(), "unable to start recording republish");
                }
            }
            Command::OpenSession => {
                self.ingester.session_opening().await;
                let store = self.store.clone();
                let bus = self.bus.clone();
                let ingester = self.ingester.clone();
                let start_ts = self.clocks.realtime();
                // The HTTP round-trip happens off the event loop; the
                // issued id arrives back as a `session.open` event.
                tokio::spawn(async move {
                    match store.open(start_ts, None).await {
                        Ok(session_id) => {
                            info!(session_id = %session_id, "session opened");
                            bus.publish(Event::SessionOpen { session_id });
                        }
                        Err(e) => {
                            warn!(err = %e.chain(), "unable to open session");
                            ingester.session_open_failed().await;
                        }
                    }
                });
            }
            Command::StopStream { session_id } => {
                if let Err(e) = self.publisher.stop(None).await {
                    warn!(err = %e.chain(), "unable to stop recording republish");
                }
                if let Some(id) = session_id {
                    self.ai.close_session(&id).await;
                }
            }
            Command::CloseSession { session_id: None } => {
                // Activation aborted before the store issued an id.
                debug!("close with no session id; nothing to do");
            }
            Command::CloseSession {
                session_id: Some(id),
            } => {
                self.ai.close_session(&id).await;
                if let Err(e) = self.store.close(&id, Some(self.clocks.realtime())).await {
                    warn!(err = %e.chain(), session_id = %id, "unable to close session");
                }
                self.bus.publish(Event::SessionClose { session_id: id });
            }
            Command::SetAiMode(mode) => self.ai.set_mode(mode).await,
        }
    }

    fn start_timer(&mut self, kind: TimerKind) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let bus = self.bus.clone();
        let duration = match kind {
            TimerKind::Dwell => self.timers.dwell,
            TimerKind::Silence => self.timers.silence,
            TimerKind::Postroll => self.timers.postroll,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            bus.publish(match kind {
                TimerKind::Dwell => Event::DwellOk { generation },
                TimerKind::Silence => Event::SilenceOk { generation },
                TimerKind::Postroll => Event::PostrollOk { generation },
            });
        });
        let slot = match kind {
            TimerKind::Dwell => &mut self.dwell,
            TimerKind::Silence => &mut self.silence,
            TimerKind::Postroll => &mut self.postroll,
        };
        *slot = Some(Timer { generation, handle });
    }
}

fn cancel_timer(slot: &mut Option<Timer>) {
    // Dropping aborts the sleep; a fired-but-unprocessed event is filtered
    // by its stale generation.
    *slot = None;
}

/// True iff the event belongs to the currently armed timer; consumes it.
fn timer_fired(slot: &mut Option<Timer>, generation: u64) -> bool {
    match slot {
        Some(t) if t.generation == generation => {
            *slot = None;
            true
        }
        _ => {
            debug!(generation, "ignoring event from cancelled timer");
            false
        }
    }
}
