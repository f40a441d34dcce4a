// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session state and its negotiated-size/request-number invariants (§3).

use crate::cfg::config::{EngineConfig, MIN_USABLE_PAYLOAD};

/// Connection lifecycle state (§4.K).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    InSession,
}

/// Per-association negotiated parameters and counters, owned by the engine
/// for the lifetime of one connection.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub state: ConnectionState,
    /// Sessionless mode: `StartSession`/`EndSession` only toggle `state`
    /// between `Connected` and `InSession`, no Logon/Logoff exchange.
    pub sessionless: bool,
    /// Effective outgoing APDU size, clamped/renegotiated over the
    /// connection's lifetime (§4.G RQTL handling).
    pub max_apdu_out: u32,
    /// Effective incoming APDU size, clamped/renegotiated (§4.G RSTL
    /// handling).
    pub max_apdu_in: u32,
    /// Request Number, incremented on every APDU sent in this session.
    pub request_number: u16,
    /// Negotiated idle-session timeout, seconds.
    pub session_timeout_secs: u16,
    /// Index into `security_key_list` that last verified an incoming MAC,
    /// tried first on the next attempt before falling back to the full
    /// list (§4.F "Security-key list fallback"). Reset on session reset.
    pub successful_security_key_index: Option<usize>,
}

impl SessionState {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            sessionless: cfg.identity.sessionless,
            max_apdu_out: cfg.session.initial_max_apdu_out,
            max_apdu_in: cfg.session.initial_max_apdu_in,
            request_number: 0,
            session_timeout_secs: cfg.session.session_timeout_request_secs,
            successful_security_key_index: None,
        }
    }

    /// Clears the fields scoped to one session's lifetime, run on every
    /// `StartSession` and on session drop after a fatal application-layer
    /// error (§3 "Lifecycle").
    pub fn reset_session_identifiers(&mut self) {
        self.successful_security_key_index = None;
    }

    pub fn next_request_number(&mut self) -> u16 {
        let n = self.request_number;
        self.request_number = self.request_number.wrapping_add(1);
        n
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::InSession
        )
    }

    /// Shrinks `max_apdu_out` to `peer_size` minus the renegotiation margin,
    /// never going below the usable-payload floor (§4.G).
    pub fn renegotiate_out(&mut self, peer_size: u32, margin: u32) {
        let target = peer_size.saturating_sub(margin).max(MIN_USABLE_PAYLOAD);
        self.max_apdu_out = self.max_apdu_out.min(target);
    }

    /// Shrinks `max_apdu_in` to `peer_size` minus the renegotiation margin,
    /// never going below the usable-payload floor (§4.G).
    pub fn renegotiate_in(&mut self, peer_size: u32, margin: u32) {
        let target = peer_size.saturating_sub(margin).max(MIN_USABLE_PAYLOAD);
        self.max_apdu_in = self.max_apdu_in.min(target);
    }

    pub fn drop_to_connected(&mut self) {
        if self.state == ConnectionState::InSession {
            self.state = ConnectionState::Connected;
        }
        self.reset_session_identifiers();
    }
}
