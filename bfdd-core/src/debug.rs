//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use bfdd_util::addr::Addr;
use tracing::{debug, debug_span};

use crate::packet::State;
use crate::session::{PollState, SessionId, TimeoutStatus};

/// Loggable engine events, kept distinct from [`crate::error::Error`] and
/// [`crate::error::DiscardReason`] since none of these represent a
/// failure.
#[derive(Debug)]
pub enum Debug {
    SessionCreate(SessionId, Addr, Addr),
    SessionDestroy(SessionId),
    FsmTransition(SessionId, State, State),
    PollStateTransition(SessionId, PollState, PollState),
    TimeoutEscalation(SessionId, TimeoutStatus),
    SourcePortChanged(SessionId, u16, u16),
}

// ===== impl Debug =====

impl Debug {
    pub fn log(&self) {
        match self {
            Debug::SessionCreate(id, remote, local) => {
                debug_span!("session", id = id.0).in_scope(|| {
                    debug!(%remote, %local, "{}", self);
                });
            }
            Debug::SessionDestroy(id) => {
                debug_span!("session", id = id.0).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::FsmTransition(id, old_state, new_state) => {
                debug_span!("session", id = id.0).in_scope(|| {
                    debug!(%old_state, %new_state, "{}", self);
                });
            }
            Debug::PollStateTransition(id, old, new) => {
                debug_span!("session", id = id.0).in_scope(|| {
                    debug!(?old, ?new, "{}", self);
                });
            }
            Debug::TimeoutEscalation(id, status) => {
                debug_span!("session", id = id.0).in_scope(|| {
                    debug!(?status, "{}", self);
                });
            }
            Debug::SourcePortChanged(id, old_port, new_port) => {
                debug_span!("session", id = id.0).in_scope(|| {
                    debug!(%old_port, %new_port, "{}", self);
                });
            }
        }
    }
}

impl std::fmt::Display for Debug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::SessionCreate(..) => write!(f, "session created"),
            Debug::SessionDestroy(..) => write!(f, "session destroyed"),
            Debug::FsmTransition(..) => write!(f, "state transition"),
            Debug::PollStateTransition(..) => {
                write!(f, "poll sequence transition")
            }
            Debug::TimeoutEscalation(..) => {
                write!(f, "detection timeout escalation")
            }
            Debug::SourcePortChanged(..) => {
                write!(f, "remote source port changed")
            }
        }
    }
}
