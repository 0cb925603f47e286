//! Session identity and the lifecycle state machine.
//!
//! ```text
//! Disconnected → Connecting → Ready ⇄ Recording
//!                    │          │        │
//!                    └──────────┴────────┴──→ Error ──reset──→ Connecting
//! Ready|Recording ──close──→ Disconnected
//! *  ──shutdown──→ Closing → Disconnected
//! *  ──reset──→ Connecting
//! ```

use crate::config::SessionConfig;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

/// Tag identifying one connection attempt. Incremented on every reset or
/// teardown so callbacks from a superseded attempt can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Recording,
    Closing,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Recording => "recording",
            SessionState::Closing => "closing",
            SessionState::Error => "error",
        }
    }

    /// Whether the channel is open and usable.
    pub fn is_open(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Recording)
    }

    /// Transitions driven by the engine. `reset` and teardown are allowed from
    /// every state and are not listed here.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Ready)
                | (Ready, Recording)
                | (Recording, Ready)
                | (Ready, Disconnected)
                | (Recording, Disconnected)
                | (Connecting, Disconnected)
                | (Connecting, Error)
                | (Ready, Error)
                | (Recording, Error)
                | (Error, Connecting)
                | (Closing, Disconnected)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical conversation. Replaced wholesale on reset.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub generation: Generation,
    pub config: SessionConfig,
    pub created_at: DateTime<Utc>,
    state: SessionState,
}

impl Session {
    pub fn new(config: SessionConfig, generation: Generation) -> Self {
        Self {
            id: Uuid::new_v4(),
            generation,
            config,
            created_at: Utc::now(),
            state: SessionState::Disconnected,
        }
    }

    /// Build the session that supersedes this one, with a fresh generation.
    pub fn successor(&self, config: SessionConfig) -> Self {
        Session::new(config, self.generation.next())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply a transition. Returns false (and leaves the state alone) if the
    /// transition is not part of the machine.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    /// Unconditional move used by reset and teardown.
    pub(crate) fn force(&mut self, next: SessionState) {
        self.state = next;
    }

    /// Whether a callback tagged with `generation` belongs to this session.
    pub fn is_current(&self, generation: Generation) -> bool {
        self.generation == generation
    }
}
