// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! EPSEM (Extended Protocol Specification for Electric Metering) control
//! byte and service framing (§4.E).
//!
//! An EPSEM body is one control byte followed by a concatenated sequence of
//! PSEM services, each `<command-byte> [<BER length>] <body>`.

use thiserror::Error;

use crate::wire::buffer::{BufferError, ForwardReader};

bitflags::bitflags! {
    /// EPSEM control byte: `reserved | recovery | proxy | ed-class-present |
    /// security-mode(2) | response-control(2)`.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ControlByte: u8 {
        const RESERVED          = 0b1000_0000;
        const RECOVERY_SESSION  = 0b0100_0000;
        const PROXY_SERVICE     = 0b0010_0000;
        const ED_CLASS_PRESENT  = 0b0001_0000;
        const SECURITY_MODE_HI  = 0b0000_1000;
        const SECURITY_MODE_LO  = 0b0000_0100;
        const RESPONSE_CTRL_HI  = 0b0000_0010;
        const RESPONSE_CTRL_LO  = 0b0000_0001;
    }
}

impl ControlByte {
    pub fn new(
        recovery_session: bool,
        proxy_service: bool,
        ed_class_present: bool,
        security_mode_bits: u8,
        response_control_bits: u8,
    ) -> Self {
        let mut b = ControlByte::empty();
        b.set(ControlByte::RECOVERY_SESSION, recovery_session);
        b.set(ControlByte::PROXY_SERVICE, proxy_service);
        b.set(ControlByte::ED_CLASS_PRESENT, ed_class_present);
        b |= ControlByte::from_bits_truncate((security_mode_bits & 0b11) << 2);
        b |= ControlByte::from_bits_truncate(response_control_bits & 0b11);
        b
    }

    pub fn security_mode_bits(self) -> u8 {
        (self.bits() >> 2) & 0b11
    }

    pub fn response_control_bits(self) -> u8 {
        self.bits() & 0b11
    }

    pub fn recovery_session(self) -> bool {
        self.contains(ControlByte::RECOVERY_SESSION)
    }

    pub fn ed_class_present(self) -> bool {
        self.contains(ControlByte::ED_CLASS_PRESENT)
    }
}

#[derive(Debug, Error)]
pub enum EpsemError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("EPSEM body is empty (missing control byte)")]
    EmptyBody,
    #[error("service body shorter than its declared length")]
    TruncatedService,
}

/// One service within an EPSEM body: the one-byte command/response code and
/// its (already length-delimited, for responses carrying one) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub code: u8,
    pub body: Vec<u8>,
}

/// Appends `code` with no payload (e.g. Logoff, Terminate) to `out`.
pub fn send_service(out: &mut Vec<u8>, code: u8) {
    out.push(code);
}

/// Appends `code` followed by the BER length of `data` and `data` itself.
pub fn send_service_with_data(out: &mut Vec<u8>, code: u8, data: &[u8]) {
    out.push(code);
    out.extend_from_slice(&crate::wire::ber::encode_length(data.len()));
    out.extend_from_slice(data);
}

/// Reads one service's declared body length for response codes that carry a
/// length-delimited payload. Response codes in `0x20..0x80` are a
/// non-error extension range (§9 Open Question, resolved: preserved as
/// intentional rather than rejected) whose payload framing matches ordinary
/// data-carrying responses.
pub fn receive_service_length(r: &mut ForwardReader<'_>) -> Result<usize, EpsemError> {
    Ok(r.read_ber_length()?)
}

/// Reads the one-byte response/command code for the next service.
pub fn receive_service_code(r: &mut ForwardReader<'_>) -> Result<u8, EpsemError> {
    Ok(r.read_u8()?)
}

/// Parses the control byte and all services out of a complete EPSEM body.
pub fn parse_services(body: &[u8]) -> Result<(ControlByte, Vec<Service>), EpsemError> {
    parse_response_services(body, |_| false)
}

/// Parses a response EPSEM body, consulting `expects_data_on_ok(i)` to
/// decide whether the i-th service's `Ok` status carries a trailing
/// length-delimited payload. Response framing for a plain `Ok` depends on
/// what was requested (a table read's `Ok` carries `<len><data><checksum>`,
/// a write's does not) rather than on the status code alone, so the caller
/// supplies that per-position knowledge from the batch it sent (§4.F).
pub fn parse_response_services(
    body: &[u8],
    expects_data_on_ok: impl Fn(usize) -> bool,
) -> Result<(ControlByte, Vec<Service>), EpsemError> {
    if body.is_empty() {
        return Err(EpsemError::EmptyBody);
    }
    let mut r = ForwardReader::new(body);
    let control = ControlByte::from_bits_truncate(r.read_u8()?);

    let mut services = Vec::new();
    let mut index = 0usize;
    while r.remaining() > 0 {
        let code = receive_service_code(&mut r)?;
        let carries_data = carries_length_delimited_payload(code)
            || (code == 0x00 && expects_data_on_ok(index));
        let payload = if carries_data {
            let len = receive_service_length(&mut r)?;
            r.read_n(len).map_err(|_| EpsemError::TruncatedService)?.to_vec()
        } else {
            Vec::new()
        };
        services.push(Service { code, body: payload });
        index += 1;
    }
    Ok((control, services))
}

/// Whether a service code's wire form carries a BER length + payload, as
/// opposed to a bare one-byte status. Table/procedure requests, RQTL/RSTL
/// (whose payload is the peer's proposed size, §4.G), and responses that
/// always return data do; simple status responses (e.g. plain `Ok`/`Bsy`)
/// do not.
fn carries_length_delimited_payload(code: u8) -> bool {
    matches!(
        code,
        0x0F | 0x10 | 0x30 | 0x3F | 0x40 | 0x4F | 0x50 | 0x51 | 0x20..=0x7F
    )
}
