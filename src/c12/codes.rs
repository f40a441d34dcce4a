// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! C12 application-layer response codes (§6) and their broad classification.

use core::fmt;

use thiserror::Error;

/// Broad classification of a failure, used for logging and for the
/// keep-alive / retry arbitrator's session-drop decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport-level failure: timeout, link down, framing error.
    Communication,
    /// The meter itself rejected or could not complete the request.
    Meter,
    /// A bug or protocol-usage error on the client side.
    Software,
    /// Authentication, key, or permission failure.
    Security,
}

/// The one-byte status octet that terminates every C12 table/procedure
/// response (§6).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum C12ServiceResponse {
    /// 0x00 - Ok
    Ok_ = 0x00,
    /// 0x01 - Err: service not completed, reason unspecified
    Err_ = 0x01,
    /// 0x02 - Sns: service not supported
    Sns = 0x02,
    /// 0x03 - Isc: insufficient security clearance
    Isc = 0x03,
    /// 0x04 - Onp: operation not possible
    Onp = 0x04,
    /// 0x05 - Iar: inappropriate action requested
    Iar = 0x05,
    /// 0x06 - Bsy: device busy, retry later
    Bsy = 0x06,
    /// 0x07 - Dnr: data not ready
    Dnr = 0x07,
    /// 0x08 - Dlk: data locked
    Dlk = 0x08,
    /// 0x09 - Rno: renegotiate - request too large
    Rno = 0x09,
    /// 0x0A - Isss: invalid service sequence state
    Isss = 0x0A,
    /// 0x0B - Sme: security mechanism error
    Sme = 0x0B,
    /// 0x0C - Uat: unknown application title
    Uat = 0x0C,
    /// 0x0D - Nett: network time-out
    Nett = 0x0D,
    /// 0x0E - Netr: network not responding
    Netr = 0x0E,
    /// 0x0F - Rqtl: request too large, reduce size and retry
    Rqtl = 0x0F,
    /// 0x10 - Rstl: response too large, reduce size and retry
    Rstl = 0x10,
    /// 0x11 - Sgnp: segmentation not possible
    Sgnp = 0x11,
    /// 0x12 - Sgerr: segmentation error
    Sgerr = 0x12,
    /// 0x13..0x1F reserved
    Reserved(u8),
    /// 0x20..0x7F: vendor/extension range that §9 treats as non-error
    /// (Open Question, resolved): codes here are surfaced to the caller as
    /// successful responses carrying an extension code rather than as
    /// `C12Error`s, matching the one implementation this engine is modeled
    /// on.
    Extension(u8),
    /// 0x80 - Nry: not ready
    Nry = 0x80,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized C12 service response code: {0:#04x}")]
pub struct UnknownServiceResponse(pub u8);

impl TryFrom<u8> for C12ServiceResponse {
    type Error = UnknownServiceResponse;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        use C12ServiceResponse::*;
        Ok(match b {
            0x00 => Ok_,
            0x01 => Err_,
            0x02 => Sns,
            0x03 => Isc,
            0x04 => Onp,
            0x05 => Iar,
            0x06 => Bsy,
            0x07 => Dnr,
            0x08 => Dlk,
            0x09 => Rno,
            0x0A => Isss,
            0x0B => Sme,
            0x0C => Uat,
            0x0D => Nett,
            0x0E => Netr,
            0x0F => Rqtl,
            0x10 => Rstl,
            0x11 => Sgnp,
            0x12 => Sgerr,
            0x13..=0x1F => Reserved(b),
            0x20..=0x7F => Extension(b),
            0x80 => Nry,
            other => return Err(UnknownServiceResponse(other)),
        })
    }
}

impl From<C12ServiceResponse> for u8 {
    fn from(value: C12ServiceResponse) -> Self {
        use C12ServiceResponse::*;
        match value {
            Ok_ => 0x00,
            Err_ => 0x01,
            Sns => 0x02,
            Isc => 0x03,
            Onp => 0x04,
            Iar => 0x05,
            Bsy => 0x06,
            Dnr => 0x07,
            Dlk => 0x08,
            Rno => 0x09,
            Isss => 0x0A,
            Sme => 0x0B,
            Uat => 0x0C,
            Nett => 0x0D,
            Netr => 0x0E,
            Rqtl => 0x0F,
            Rstl => 0x10,
            Sgnp => 0x11,
            Sgerr => 0x12,
            Reserved(b) | Extension(b) => b,
            Nry => 0x80,
        }
    }
}

impl C12ServiceResponse {
    pub fn is_ok(self) -> bool {
        matches!(self, C12ServiceResponse::Ok_ | C12ServiceResponse::Extension(_))
    }

    /// Codes the retry arbitrator treats as transient and worth an
    /// application-layer retry (§4.G).
    pub fn is_busy_or_not_ready(self) -> bool {
        matches!(self, C12ServiceResponse::Bsy | C12ServiceResponse::Dnr)
    }

    /// Codes excepted from the "drop session on fatal error" rule (§4.G:
    /// "except ISSS, RNO, SME").
    pub fn keeps_session_alive_on_error(self) -> bool {
        matches!(
            self,
            C12ServiceResponse::Isss | C12ServiceResponse::Rno | C12ServiceResponse::Sme
        )
    }

    pub fn kind(self) -> ErrorKind {
        use C12ServiceResponse::*;
        match self {
            Ok_ | Extension(_) => ErrorKind::Meter,
            Isc | Sme | Uat => ErrorKind::Security,
            Nett | Netr => ErrorKind::Communication,
            Rno | Rqtl | Rstl | Sgnp | Sgerr | Isss => ErrorKind::Software,
            _ => ErrorKind::Meter,
        }
    }
}

impl fmt::Display for C12ServiceResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", u8::from(*self))
    }
}
