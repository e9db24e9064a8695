// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Pure session state machine: `reduce(ctx, input) -> (ctx', commands)`.
//!
//! The reducer never does I/O and never touches timers; the orchestrator
//! owns both, diffing states to start/cancel timers and executing the
//! returned commands against its adapters.
//!
//! ```text
//!         relevant                 dwell.ok
//! IDLE ────────────▶ DWELL ───────────────────▶ ACTIVE ◀──┐
//!                                                  │      │ relevant
//!                                       silence.ok │      │ (reactivate)
//!                                                  ▼      │
//!                    IDLE ◀─────────────────── CLOSING ───┘
//!                           postroll.ok
//! ```

/// FSM state. The numeric value is exported as the `fsm_state` gauge.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum State {
    Idle,
    Dwell,
    Active,
    Closing,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Idle => "IDLE",
            State::Dwell => "DWELL",
            State::Active => "ACTIVE",
            State::Closing => "CLOSING",
        }
    }

    pub fn gauge_value(self) -> i64 {
        match self {
            State::Idle => 0,
            State::Dwell => 1,
            State::Active => 2,
            State::Closing => 3,
        }
    }
}

/// Target frame rate mode of the AI feeder.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FpsMode {
    Idle,
    Active,
}

#[derive(Clone, Debug)]
pub struct Context {
    pub state: State,
    pub session_id: Option<String>,
}

impl Default for Context {
    fn default() -> Self {
        Context {
            state: State::Idle,
            session_id: None,
        }
    }
}

/// Inputs relevant to the reducer, already mapped from bus events.
#[derive(Clone, Debug)]
pub enum Input {
    Detection { relevant: bool },
    Keepalive,
    DwellOk,
    SilenceOk,
    PostrollOk,
    SessionOpened { session_id: String },
}

/// Side effects requested by a transition, executed by the orchestrator in
/// order. Fire-and-forget: adapter failures never roll the state back.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Command {
    StartStream,
    OpenSession,
    StopStream { session_id: Option<String> },
    CloseSession { session_id: Option<String> },
    SetAiMode(FpsMode),
}

/// Applies one input. Pure: same `(ctx, input)` always yields the same
/// `(ctx', commands)`.
///
/// A DWELL that sees no further detections still becomes ACTIVE when the
/// dwell timer fires: dwell is a confirmation delay, and the detection that
/// entered DWELL already satisfied the relevance predicate.
pub fn reduce(ctx: &Context, input: &Input) -> (Context, Vec<Command>) {
    let mut next = ctx.clone();
    let mut commands = Vec::new();
    match (ctx.state, input) {
        (State::Idle, Input::Detection { relevant: true }) => {
            next.state = State::Dwell;
        }
        (State::Dwell, Input::DwellOk) => {
            next.state = State::Active;
            commands.push(Command::StartStream);
            commands.push(Command::OpenSession);
            commands.push(Command::SetAiMode(FpsMode::Active));
        }
        (State::Active, Input::SessionOpened { session_id }) => {
            next.session_id = Some(session_id.clone());
        }
        (State::Active, Input::SilenceOk) => {
            next.state = State::Closing;
            commands.push(Command::SetAiMode(FpsMode::Idle));
        }
        (State::Closing, Input::Detection { relevant: true }) => {
            // Reactivation: same session continues.
            next.state = State::Active;
            commands.push(Command::SetAiMode(FpsMode::Active));
        }
        (State::Closing, Input::PostrollOk) => {
            next.state = State::Idle;
            commands.push(Command::StopStream {
                session_id: ctx.session_id.clone(),
            });
            commands.push(Command::CloseSession {
                session_id: ctx.session_id.clone(),
            });
            next.session_id = None;
        }
        // A session id issued after the silence timer already fired still
        // belongs to this session; it is needed to close it.
        (State::Closing, Input::SessionOpened { session_id }) => {
            next.session_id = Some(session_id.clone());
        }
        _ => {}
    }
    (next, commands)
}
