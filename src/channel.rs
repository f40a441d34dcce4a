// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! External interfaces the engine is driven through (§6). Byte transport
//! (serial, TCP, UDP, modem) and C12.18/C12.21 link-layer framing are
//! explicitly out of scope; callers provide an implementation of
//! [`Channel`] that already speaks whatever link layer connects to the
//! meter.

use std::{future::Future, time::Duration};

/// A byte-oriented duplex channel to a single meter. Implementations own
/// framing/retries below the APDU layer (e.g. C12.18 link-layer ACK/NAK);
/// the engine only ever reads and writes complete APDUs. The engine is
/// generic over `Channel` rather than boxing it, so a caller's transport
/// never has to pay for dynamic dispatch it didn't ask for.
pub trait Channel: Send + Sync {
    /// Writes one complete APDU, returning once it has been accepted by the
    /// transport (not necessarily acknowledged by the peer).
    fn write_apdu(
        &self,
        apdu: &[u8],
    ) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Reads one complete APDU, blocking until one is available or
    /// `timeout` elapses.
    fn read_apdu(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = std::io::Result<Vec<u8>>> + Send;
}

/// Protocol-level observation hook (§6), distinct from `tracing`
/// instrumentation: implementations see high-level events (session
/// transitions, retries, negotiated sizes) without needing to configure a
/// subscriber.
pub trait Monitor: Send + Sync {
    fn on_apdu_sent(&self, _len: usize) {}
    fn on_apdu_received(&self, _len: usize) {}
    fn on_retry(&self, _layer: &str, _attempt: u8) {}
    fn on_session_started(&self) {}
    fn on_session_ended(&self, _reason: &str) {}
    /// Called after each chunk of a partial table transfer completes (§4.J).
    fn on_partial_progress(&self, _done: u32, _total: u32) {}
}

/// A [`Monitor`] that observes nothing; the engine's default when the
/// caller does not supply one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitor;

impl Monitor for NullMonitor {}
