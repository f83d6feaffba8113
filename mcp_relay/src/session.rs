//! Upstream session tracking.
//!
//! The relay serves exactly one logical upstream session per process. The
//! session id is learned from the `Mcp-Session-Id` header of an `initialize`
//! response and attached to every later call until the upstream answers
//! `404 Not Found`, which clears it and triggers re-initialization.
//!
//! ## Lifecycle
//!
//! ```text
//!   Empty --initialize response with session header--> Established(id)
//!   Established(id) --initialize response with header--> Established(new id)
//!   Established(id) --404 from any call--> Empty
//! ```
//!
//! Responses to anything other than `initialize` never change the session,
//! even when they carry a session header.

use crate::{
    config::BridgeConfig,
    headers::{self, HeaderSet},
};
use mcp_relay_common::StateMachine;
use tracing::{debug, info};

/// Current upstream session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    session_id: Option<String>,
}

impl SessionState {
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Whether an `initialize` handshake has produced a session.
    pub fn is_initialized(&self) -> bool {
        self.session_id.is_some()
    }

    /// Stores `session_id`, replacing any previous one.
    pub fn establish(&mut self, session_id: String) {
        self.session_id = Some(session_id);
    }

    pub fn clear(&mut self) {
        self.session_id = None;
    }
}

/// Owns the session state and applies the rules for changing it.
#[derive(Debug, Default)]
pub struct SessionManager {
    state: StateMachine<SessionState>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> SessionState {
        self.state.snapshot()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().is_initialized()
    }

    /// True iff this is not an initialize call and a session is held.
    pub fn should_attach_session(&self, is_initialize: bool) -> bool {
        !is_initialize && self.is_initialized()
    }

    /// Composes headers for one attempt from a single consistent read of the
    /// session state.
    pub fn compose_headers(&self, config: &BridgeConfig, is_initialize: bool) -> HeaderSet {
        self.state
            .transition(|state| headers::compose(config, state, is_initialize))
    }

    /// Records the session header of a successful response.
    ///
    /// Only an `initialize` response may set the session. Returns `true` when
    /// the state changed.
    pub fn on_response(&self, is_initialize: bool, session_header: Option<&str>) -> bool {
        let Some(session_id) = session_header.filter(|_| is_initialize) else {
            if let Some(ignored) = session_header {
                debug!(
                    session_id = %ignored,
                    "Ignoring session header on non-initialize response"
                );
            }
            return false;
        };

        let previous = self.state.transition(|state| {
            let previous = state.session_id.clone();
            state.establish(session_id.to_string());
            previous
        });

        match previous {
            Some(old) if old != session_id => {
                info!(old_session = %old, session_id = %session_id, "Session replaced");
            }
            Some(_) => debug!(session_id = %session_id, "Session confirmed"),
            None => info!(session_id = %session_id, "Session established"),
        }
        true
    }

    /// Forgets the current session after the upstream reported it missing.
    pub fn on_not_found(&self) {
        let previous = self.state.transition(|state| {
            let previous = state.session_id.clone();
            state.clear();
            previous
        });
        info!(
            expired_session = ?previous,
            "Upstream reported session not found; session cleared"
        );
    }
}
