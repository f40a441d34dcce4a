// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error taxonomy (§6, §7): one `thiserror` enum per layer, composed into
//! [`ClientError`] via `#[from]`. Call sites above the engine façade use
//! `anyhow::Result`.

use thiserror::Error;

use crate::{
    c12::codes::{C12ServiceResponse, ErrorKind},
    crypto::eax::CryptoError,
    wire::{ber::BerError, buffer::BufferError},
};

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Ber(#[from] BerError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("APDU framing length {declared} does not match body length {actual}")]
    FrameLengthMismatch { declared: usize, actual: usize },
    #[error("data checksum mismatch")]
    ChecksumMismatch,
}

#[derive(Debug, Error)]
pub enum AcseError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("required ACSE element {0:#04x} missing")]
    MissingElement(u8),
    #[error("ACSE elements out of ascending tag order")]
    OutOfOrder,
}

#[derive(Debug, Error)]
pub enum EpsemError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("EPSEM service body shorter than its declared length")]
    TruncatedService,
    #[error("unrecognized EPSEM response code {0:#04x}")]
    UnknownResponseCode(u8),
}

#[derive(Debug, Error)]
pub enum CryptoLayerError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("security mode requires a key but none is configured")]
    NoKeyConfigured,
    #[error("all {0} security keys were rejected by the peer")]
    AllKeysRejected(usize),
}

#[derive(Debug, Error)]
pub enum C12Error {
    #[error("meter returned {response:?} for {operation}")]
    ServiceResponse {
        operation: &'static str,
        response: C12ServiceResponse,
    },
    #[error("procedure call returned result code {0}")]
    BadProcedureResult(u8),
    #[error("procedure sequence number mismatch: sent {sent}, echoed {echoed}")]
    ProcedureSequenceMismatch { sent: u8, echoed: u8 },
}

impl C12Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            C12Error::ServiceResponse { response, .. } => response.kind(),
            C12Error::BadProcedureResult(_) => ErrorKind::Meter,
            C12Error::ProcedureSequenceMismatch { .. } => ErrorKind::Software,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Acse(#[from] AcseError),
    #[error(transparent)]
    Epsem(#[from] EpsemError),
    #[error(transparent)]
    Crypto(#[from] CryptoLayerError),
    #[error(transparent)]
    C12(#[from] C12Error),
    #[error("channel read timed out after {0:?}")]
    ChannelReadTimeout(std::time::Duration),
    #[error("channel write timed out after {0:?}")]
    ChannelWriteTimeout(std::time::Duration),
    #[error("operation attempted while not connected")]
    NotConnected,
    #[error("link-layer retries exhausted ({0} attempts)")]
    LinkLayerRetriesExhausted(u8),
    #[error("application-layer retries exhausted ({0} attempts)")]
    ApplicationLayerRetriesExhausted(u8),
    #[error("procedure retries exhausted ({0} attempts)")]
    ProcedureRetriesExhausted(u8),
    #[error("negotiated APDU size {0} is below the usable-payload floor")]
    ApduSizeBelowFloor(u32),
    #[error("queued command {0} has no matching response")]
    UnmatchedResponse(u32),
    #[error("response invocation id or AP title did not match the outgoing request (possible tampering)")]
    TamperingDetected,
    #[error("batch needs {needed} bytes but the negotiated APDU size only allows {available}")]
    NegotiatedSizeExceeded { needed: usize, available: u32 },
}

impl EngineError {
    /// Broad failure classification, mirroring [`C12Error::kind`] for the
    /// error variants that originate outside a C12 service response.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::C12(e) => e.kind(),
            EngineError::Crypto(_) | EngineError::TamperingDetected => ErrorKind::Security,
            EngineError::ChannelReadTimeout(_)
            | EngineError::ChannelWriteTimeout(_)
            | EngineError::NotConnected => ErrorKind::Communication,
            EngineError::Wire(_)
            | EngineError::Acse(_)
            | EngineError::Epsem(_)
            | EngineError::NegotiatedSizeExceeded { .. } => ErrorKind::Communication,
            _ => ErrorKind::Software,
        }
    }
}

/// Top-level error type returned from public engine APIs.
pub type ClientError = EngineError;
