// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cfg::enums::{ReadFunctionResponsePolicy, ResponseControl, SecurityMode};

/// Smallest effective APDU size allowed by the invariant in §3.
pub const MIN_MAX_APDU: u32 = 0x200;
/// Largest effective APDU size allowed by the invariant in §3.
pub const MAX_MAX_APDU: u32 = 0x1000000;
/// Usable-payload floor that derived sizes must never drop below.
pub const MIN_USABLE_PAYLOAD: u32 = 16;
/// Safety margin subtracted from a peer-echoed RQTL/RSTL size (§4.G).
pub const RENEGOTIATION_MARGIN: u32 = 16;

/// Second, hidden legacy header-size constant (Open Question, §9): when both
/// the incoming and outgoing effective APDU sizes exceed this threshold the
/// engine falls back to [`LEGACY_HEADER_SIZE`] instead of the full negotiated
/// size. This is a documented workaround for buggy peers; kept intentionally.
pub const LEGACY_APDU_THRESHOLD: u32 = 30_000;
/// See [`LEGACY_APDU_THRESHOLD`].
pub const LEGACY_HEADER_SIZE: u32 = 1024;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EngineConfig {
    /// ACSE / association identity carried on every APDU.
    pub identity: Identity,
    /// Security mode, key material, and password fallback lists.
    pub security: SecurityConfig,
    /// Session negotiation parameters (sizes, timeouts).
    pub session: SessionConfig,
    /// Per-layer retry policy (§4.G).
    pub retry: RetryConfig,
    /// Background keep-alive task configuration (§4.I).
    pub keep_alive: KeepAliveConfig,
    /// Miscellaneous behavioral toggles.
    pub behavior: BehaviorConfig,
    /// Channel-facing timeouts that are not part of the wire protocol.
    pub runtime: RuntimeConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Identity {
    #[serde(rename = "ApplicationContext")]
    /// Absolute OID, e.g. "2.16.124.113620.1.22".
    pub application_context: String,
    #[serde(rename = "CalledApTitle")]
    /// Absolute or relative (leading '.') OID of the peer.
    pub called_ap_title: String,
    #[serde(rename = "CallingApTitle")]
    /// Absolute or relative OID identifying this client.
    pub calling_ap_title: String,
    #[serde(default, rename = "CallingAeQualifier")]
    pub calling_ae_qualifier: Option<u32>,
    #[serde(rename = "Sessionless")]
    pub sessionless: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SecurityConfig {
    #[serde(rename = "SecurityMode")]
    pub security_mode: SecurityMode,
    #[serde(rename = "ResponseControl", default)]
    pub response_control: ResponseControl,
    #[serde(rename = "IssueSecurityOnStartSession", default)]
    pub issue_security_on_start_session: bool,
    #[serde(rename = "UserId", default)]
    pub user_id: u16,
    /// 10-byte user field sent with Logon; shorter strings are zero-padded.
    #[serde(rename = "LogonUser", default)]
    pub logon_user: String,
    /// Ordered fallback list of 20-byte passwords (§4.F "Password list
    /// fallback"). Shorter entries are zero-padded to 20 bytes.
    #[serde(rename = "PasswordList", default)]
    pub password_list: Vec<SecretBytes>,
    /// Ordered fallback list of AES-128 keys (§4.F "Security-key list
    /// fallback", C12.22 only).
    #[serde(rename = "SecurityKeyList", default)]
    pub security_key_list: Vec<SecretBytes>,
    /// Key identifier sent in the calling-authentication-value element.
    #[serde(rename = "KeyId", default)]
    pub key_id: u8,
}

/// Zero-on-drop byte container for passwords and AES keys (§9 design note).
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretBytes(pub Vec<u8>);

impl SecretBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Pads/truncates to exactly `len` bytes (zero-padded), as used for the
    /// 20-byte C12 password field.
    pub fn padded(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let n = self.0.len().min(len);
        out[..n].copy_from_slice(&self.0[..n]);
        out
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SessionConfig {
    #[serde(rename = "InitialMaxApduOut", with = "serde_u32_default", default = "default_initial_apdu")]
    pub initial_max_apdu_out: u32,
    #[serde(rename = "InitialMaxApduIn", with = "serde_u32_default", default = "default_initial_apdu")]
    pub initial_max_apdu_in: u32,
    #[serde(rename = "SessionTimeoutRequestSeconds", default = "default_session_timeout")]
    pub session_timeout_request_secs: u16,
}

fn default_initial_apdu() -> u32 {
    0x400
}

fn default_session_timeout() -> u16 {
    60
}

mod serde_u32_default {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u32, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u32(*v)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        u32::deserialize(d)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RetryConfig {
    #[serde(rename = "LinkLayerRetries", default)]
    pub link_layer_retries: u8,
    #[serde(rename = "TurnAroundDelayMs", with = "serde_millis", default)]
    pub turn_around_delay: Duration,
    #[serde(rename = "ApplicationLayerRetries", default)]
    pub application_layer_retries: u8,
    #[serde(rename = "ApplicationLayerRetryDelayMs", with = "serde_millis", default)]
    pub application_layer_retry_delay: Duration,
    #[serde(rename = "ApplicationLayerProcedureRetries", default)]
    pub application_layer_procedure_retries: u8,
    #[serde(
        rename = "ApplicationLayerProcedureRetryDelayMs",
        with = "serde_millis",
        default
    )]
    pub application_layer_procedure_retry_delay: Duration,
    #[serde(rename = "EndSessionOnApplicationLayerError", default)]
    pub end_session_on_application_layer_error: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct KeepAliveConfig {
    #[serde(rename = "KeepSessionAlive", default)]
    pub keep_session_alive: bool,
    #[serde(rename = "UseReadInKeepSessionAlive", default)]
    pub use_read_in_keep_session_alive: bool,
    /// Margin subtracted from the negotiated idle timeout before the keeper
    /// wakes up and sends a Wait (§4.I: "≥1s before... would expire").
    #[serde(rename = "KeepAliveMarginSecs", default = "default_keepalive_margin")]
    pub margin_secs: u64,
}

fn default_keepalive_margin() -> u64 {
    2
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BehaviorConfig {
    #[serde(rename = "AlwaysReadFunctionResponse", default)]
    pub always_read_function_response: ReadFunctionResponsePolicy,
    #[serde(rename = "MeterIsLittleEndian", default)]
    pub meter_is_little_endian: bool,
    #[serde(rename = "OneServicePerApdu", default)]
    pub one_service_per_apdu: bool,
    #[serde(rename = "MaxPartialReadTableSize", default = "default_partial_size")]
    pub max_partial_read_table_size: u32,
    #[serde(rename = "MaxPartialWriteTableSize", default = "default_partial_size")]
    pub max_partial_write_table_size: u32,
}

fn default_partial_size() -> u32 {
    512
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    #[serde(rename = "ReceiveTimeoutMs", with = "serde_millis", default = "default_io_timeout")]
    pub receive_timeout: Duration,
    #[serde(rename = "WriteTimeoutMs", with = "serde_millis", default = "default_io_timeout")]
    pub write_timeout: Duration,
    #[serde(rename = "ConnectTimeoutMs", with = "serde_millis", default = "default_io_timeout")]
    pub connect_timeout: Duration,
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(5)
}

mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

impl EngineConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: EngineConfig =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            !self.identity.application_context.is_empty(),
            "ApplicationContext must not be empty"
        );
        ensure!(
            !self.identity.called_ap_title.is_empty(),
            "CalledApTitle must not be empty"
        );
        ensure!(
            !self.identity.calling_ap_title.is_empty(),
            "CallingApTitle must not be empty"
        );

        self.session.initial_max_apdu_out =
            self.session.initial_max_apdu_out.clamp(MIN_MAX_APDU, MAX_MAX_APDU);
        self.session.initial_max_apdu_in =
            self.session.initial_max_apdu_in.clamp(MIN_MAX_APDU, MAX_MAX_APDU);

        if self.security.security_mode.is_authenticated() {
            ensure!(
                !self.security.security_key_list.is_empty()
                    || self.security.security_mode != SecurityMode::CipherAuth,
                "CipherAuth mode requires at least one SecurityKeyList entry"
            );
            for key in &self.security.security_key_list {
                ensure!(key.0.len() == 16, "AES keys must be exactly 16 bytes");
            }
        }

        Ok(())
    }
}
