//! Request header composition.
//!
//! Headers are composed fresh for every attempt from the immutable
//! [`BridgeConfig`] and a snapshot of the [`SessionState`]. Composition is a
//! pure function: the same inputs always produce the same [`HeaderSet`].

use crate::{config::BridgeConfig, session::SessionState};

/// Content type sent with every request.
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";
/// Bearer authentication header.
pub const AUTHORIZATION_HEADER: &str = "Authorization";
/// MCP Session-Id header name (per MCP spec 2025-03-26).
pub const MCP_SESSION_ID_HEADER: &str = "Mcp-Session-Id";

const JSON_CONTENT_TYPE: &str = "application/json";

/// Ordered header list with case-sensitive keys.
///
/// Setting an existing key replaces its value in place; new keys are appended.
/// Order matters when the set is turned into wire headers: a later entry wins
/// over an earlier one that differs only in case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    entries: Vec<(String, String)>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `name` (exact match).
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Looks up a header by exact name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Builds the headers for one attempt.
///
/// Custom headers override the content type and authorization defaults on an
/// exact key match. The session header is added last and only for
/// non-initialize calls, so an `initialize` always starts a clean handshake.
pub fn compose(config: &BridgeConfig, session: &SessionState, is_initialize: bool) -> HeaderSet {
    let mut headers = HeaderSet::new();
    headers.set(CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE);

    if let Some(token) = &config.bearer_token {
        headers.set(AUTHORIZATION_HEADER, format!("Bearer {}", token));
    }

    for (name, value) in &config.custom_headers {
        headers.set(name.as_str(), value.as_str());
    }

    if !is_initialize && let Some(session_id) = session.session_id() {
        headers.set(MCP_SESSION_ID_HEADER, session_id);
    }

    headers
}
