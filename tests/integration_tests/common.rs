// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared fixtures for the end-to-end scenario tests (spec.md §8).
//!
//! [`MockChannel`] is an in-memory [`Channel`] whose responses are built
//! from the just-sent request's parsed ACSE header rather than from a
//! static byte queue, because the engine's tampering check (§4.D) requires
//! every response to echo back a freshly generated, non-predictable
//! invocation id.

#![allow(dead_code)]

use std::{collections::VecDeque, sync::Arc, sync::Mutex, time::Duration};

use c1222_client::{
    acse::{self, AcseHeader},
    cfg::{
        config::{
            BehaviorConfig, EngineConfig, Identity, KeepAliveConfig, RetryConfig, RuntimeConfig,
            SecretBytes, SecurityConfig, SessionConfig,
        },
        enums::{ReadFunctionResponsePolicy, ResponseControl, SecurityMode},
    },
    channel::Channel,
    crypto::eax::{self, EaxKey},
    epsem::{self, ControlByte},
    utils::data_checksum,
    wire::ber::encode_uid_body,
};

/// Absolute (not relative) OIDs, so the ACSE layer's always-absolute decode
/// on parse (`acse::mod.rs`'s `is_uid_relative_body`) round-trips them
/// unchanged; a relative title would decode back as a different string and
/// never satisfy the engine's AP-title tampering check.
pub const METER_AP_TITLE: &str = "1.2";
pub const CLIENT_AP_TITLE: &str = "1.3";
pub const APPLICATION_CONTEXT: &str = "2.16.124.113620.1.22";

/// Minimally valid engine configuration, built directly rather than via
/// `EngineConfig::load_from_file` since these tests have no YAML fixture on
/// disk. Mirrors `session::test_support::base_config`, kept private to the
/// crate under test and unreachable from here.
pub fn base_config() -> EngineConfig {
    EngineConfig {
        identity: Identity {
            application_context: APPLICATION_CONTEXT.to_string(),
            called_ap_title: METER_AP_TITLE.to_string(),
            calling_ap_title: CLIENT_AP_TITLE.to_string(),
            calling_ae_qualifier: None,
            sessionless: true,
        },
        security: SecurityConfig {
            security_mode: SecurityMode::Clear,
            response_control: ResponseControl::Always,
            issue_security_on_start_session: false,
            user_id: 0,
            logon_user: String::new(),
            password_list: vec![],
            security_key_list: vec![],
            key_id: 0,
        },
        session: SessionConfig {
            initial_max_apdu_out: 0x400,
            initial_max_apdu_in: 0x400,
            session_timeout_request_secs: 60,
        },
        retry: RetryConfig {
            link_layer_retries: 3,
            turn_around_delay: Duration::from_millis(0),
            application_layer_retries: 3,
            application_layer_retry_delay: Duration::from_millis(0),
            application_layer_procedure_retries: 3,
            application_layer_procedure_retry_delay: Duration::from_millis(0),
            end_session_on_application_layer_error: true,
        },
        keep_alive: KeepAliveConfig {
            keep_session_alive: false,
            use_read_in_keep_session_alive: false,
            margin_secs: 2,
        },
        behavior: BehaviorConfig {
            always_read_function_response: ReadFunctionResponsePolicy::Always,
            meter_is_little_endian: false,
            one_service_per_apdu: false,
            max_partial_read_table_size: 512,
            max_partial_write_table_size: 512,
        },
        runtime: RuntimeConfig {
            receive_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        },
    }
}

pub fn secret(bytes: &[u8]) -> SecretBytes {
    SecretBytes(bytes.to_vec())
}

type Responder = Box<dyn Fn(&AcseHeader) -> Vec<u8> + Send + Sync>;

/// An in-memory [`Channel`]. Each queued responder is invoked with the most
/// recently sent request's parsed ACSE header and produces the complete
/// wire bytes of one response APDU.
pub struct MockChannel {
    responders: Mutex<VecDeque<Responder>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    last_request: Mutex<Option<AcseHeader>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            responders: Mutex::new(VecDeque::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
            last_request: Mutex::new(None),
        }
    }

    pub fn push_response(&self, f: impl Fn(&AcseHeader) -> Vec<u8> + Send + Sync + 'static) {
        self.responders.lock().unwrap().push_back(Box::new(f));
    }

    pub fn sent_apdus(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn pending_responses(&self) -> usize {
        self.responders.lock().unwrap().len()
    }

    /// A handle to the sent-APDU log that survives moving the channel into
    /// an `Engine`, which takes it by value.
    pub fn sent_log(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.sent)
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for MockChannel {
    async fn write_apdu(&self, apdu: &[u8]) -> std::io::Result<()> {
        self.sent.lock().unwrap().push(apdu.to_vec());
        let (header, _body) = AcseHeader::parse(apdu)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        *self.last_request.lock().unwrap() = Some(header);
        Ok(())
    }

    async fn read_apdu(&self, _timeout: Duration) -> std::io::Result<Vec<u8>> {
        let responder = self.responders.lock().unwrap().pop_front().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "mock channel has no queued response")
        })?;
        let header = self.last_request.lock().unwrap().clone().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "no request recorded before read")
        })?;
        Ok(responder(&header))
    }
}

/// Builds the response header with roles swapped relative to `req`, as a
/// genuine peer would (§4.D): the meter becomes the "calling" party, the
/// client becomes the "called" party, and the request's calling-invocation-id
/// is echoed back as called-invocation-id.
pub fn response_header(cfg: &EngineConfig, req: &AcseHeader, meter_invocation_id: Option<u32>) -> AcseHeader {
    AcseHeader {
        application_context: cfg.identity.application_context.clone(),
        called_ap_title: Some(cfg.identity.calling_ap_title.clone()),
        called_ap_invocation_id: req.calling_ap_invocation_id,
        calling_ap_title: Some(cfg.identity.called_ap_title.clone()),
        calling_ae_qualifier: None,
        calling_ap_invocation_id: meter_invocation_id,
        calling_authentication_value: None,
    }
}

/// A header with the called-invocation-id deliberately mismatched, for the
/// tampering scenario (§8 scenario 6).
pub fn tampered_response_header(cfg: &EngineConfig, req: &AcseHeader) -> AcseHeader {
    let mut header = response_header(cfg, req, None);
    header.called_ap_invocation_id = req.calling_ap_invocation_id.map(|v| v ^ 1);
    header
}

/// Encodes one EPSEM service with no payload (a bare status byte).
pub fn ok_status() -> (u8, Vec<u8>) {
    (0x00, Vec::new())
}

/// Encodes a table-read `Ok` response body: 2-byte length, `data`, checksum.
pub fn table_read_ok_body(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + data.len() + 1);
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
    out.push(data_checksum(data));
    out
}

/// Encodes an ST8 (procedure response table) payload: sequence number
/// packed into the top 5 bits, result code, and procedure return data.
pub fn st8_body(sequence_number: u8, result_code: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + data.len());
    out.push(sequence_number << 3);
    out.push(result_code);
    out.extend_from_slice(data);
    out
}

fn build_services_body(control: ControlByte, services: &[(u8, Vec<u8>)]) -> Vec<u8> {
    let mut out = vec![control.bits()];
    for (code, body) in services {
        if body.is_empty() {
            epsem::send_service(&mut out, *code);
        } else {
            epsem::send_service_with_data(&mut out, *code, body);
        }
    }
    out
}

/// Builds a complete unauthenticated response APDU.
pub fn clear_response(
    cfg: &EngineConfig,
    req: &AcseHeader,
    meter_invocation_id: Option<u32>,
    control: ControlByte,
    services: &[(u8, Vec<u8>)],
) -> Vec<u8> {
    let header = response_header(cfg, req, meter_invocation_id);
    let body = build_services_body(control, services);
    header.encode(&body)
}

/// Builds a complete response APDU with a deliberately mismatched
/// called-invocation-id (§8 scenario 6), everything else genuine.
pub fn tampered_clear_response(
    cfg: &EngineConfig,
    req: &AcseHeader,
    control: ControlByte,
    services: &[(u8, Vec<u8>)],
) -> Vec<u8> {
    let header = tampered_response_header(cfg, req);
    let body = build_services_body(control, services);
    header.encode(&body)
}

/// Same AAD construction the engine's `canonified_header` uses: the A1/A2/
/// [A4]/[A7]/A8 ACSE elements as real encoded bytes in ascending tag order,
/// the calling-authentication-value element's raw form, the user-information
/// wrapper through the EPSEM control byte, the A6 calling-AP-title element,
/// the key id, the IV, and - clear+auth only - the plaintext body. Duplicated
/// here because the engine keeps it private; the two must stay in lockstep
/// for the crypto scenarios to exercise real verification rather than a
/// stub.
#[allow(clippy::too_many_arguments)]
fn canonified_header(
    header: &AcseHeader,
    control: &ControlByte,
    total_body_len: usize,
    key_id: u8,
    iv: u32,
    plaintext_services: &[u8],
    security_mode: SecurityMode,
) -> Vec<u8> {
    let mut out = Vec::new();

    if let Ok(el) =
        acse::encode_uid_element(acse::TAG_APPLICATION_CONTEXT, 0x06, &header.application_context)
    {
        out.extend_from_slice(&el);
    }
    if let Some(t) = &header.called_ap_title {
        if let Ok(el) = acse::encode_uid_element(acse::TAG_CALLED_AP_TITLE, 0x80, t) {
            out.extend_from_slice(&el);
        }
    }
    if let Some(id) = header.called_ap_invocation_id {
        out.extend_from_slice(&acse::encode_u32_element(acse::TAG_CALLED_AP_INVOCATION_ID, id));
    }
    if let Some(q) = header.calling_ae_qualifier {
        out.extend_from_slice(&acse::encode_u32_element(acse::TAG_CALLING_AE_QUALIFIER, q));
    }
    out.extend_from_slice(&acse::encode_u32_element(
        acse::TAG_CALLING_AP_INVOCATION_ID,
        header.calling_ap_invocation_id.unwrap_or_default(),
    ));

    if let Some(ac_content) = &header.calling_authentication_value {
        out.push(acse::TAG_CALLING_AUTHENTICATION_VALUE);
        out.extend_from_slice(&c1222_client::wire::ber::encode_length(ac_content.len()));
        out.extend_from_slice(ac_content);
    }

    out.extend_from_slice(&acse::encode_wrapper_through_control(total_body_len, control.bits()));

    if let Some(t) = &header.calling_ap_title {
        if let Ok(el) = acse::encode_uid_element(acse::TAG_CALLING_AP_TITLE, 0x80, t) {
            out.extend_from_slice(&el);
        }
    }

    out.push(key_id);
    out.extend_from_slice(&iv.to_be_bytes());

    if !security_mode.is_ciphered() {
        out.extend_from_slice(plaintext_services);
    }

    out
}

/// Builds a complete authenticated (clear+auth or cipher+auth) response
/// APDU, genuinely encrypted/authenticated with `key` so the engine's own
/// `unprotect` must verify it for real.
#[allow(clippy::too_many_arguments)]
pub fn protected_response(
    cfg: &EngineConfig,
    req: &AcseHeader,
    key: &EaxKey,
    key_id: u8,
    security_mode: SecurityMode,
    iv: u32,
    meter_invocation_id: Option<u32>,
    control: ControlByte,
    services: &[(u8, Vec<u8>)],
) -> Vec<u8> {
    let mut header = response_header(cfg, req, meter_invocation_id);
    let meter_title_octets = encode_uid_body(&cfg.identity.called_ap_title).unwrap_or_default();
    let nonce = eax::build_nonce(iv, &meter_title_octets);

    header.calling_authentication_value = Some(acse::encode_authentication_value(key_id, iv));

    let services_body = build_services_body(control, services);
    let mut body = services_body[1..].to_vec();
    let total_body_len = 1 + body.len() + eax::TAG_SIZE;
    let aad = canonified_header(&header, &control, total_body_len, key_id, iv, &body, security_mode);

    let tag = if security_mode.is_ciphered() {
        eax::encrypt_in_place(key, &nonce, &aad, &mut body)
    } else {
        eax::authenticate(key, &nonce, &aad, &body)
    };

    let mut outgoing_body = vec![control.bits()];
    outgoing_body.extend_from_slice(&body);
    outgoing_body.extend_from_slice(&tag);
    header.encode(&outgoing_body)
}
