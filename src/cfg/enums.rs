// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// EPSEM security mode (§3 "Security mode"), packed into bits 3-2 of the
/// EPSEM control byte.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    /// Mode has not been configured; treated as an error if used on the wire.
    #[serde(rename = "Undefined")]
    Undefined,
    #[serde(rename = "Clear")]
    #[default]
    Clear,
    #[serde(rename = "ClearAuth", alias = "Clear+Auth")]
    ClearAuth,
    #[serde(rename = "CipherAuth", alias = "Cipher+Auth")]
    CipherAuth,
}

impl SecurityMode {
    /// The 2-bit wire value (EPSEM control byte bits 3-2).
    pub fn wire_bits(self) -> u8 {
        match self {
            SecurityMode::Undefined => 0b11,
            SecurityMode::Clear => 0b00,
            SecurityMode::ClearAuth => 0b01,
            SecurityMode::CipherAuth => 0b10,
        }
    }

    pub fn from_wire_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => SecurityMode::Clear,
            0b01 => SecurityMode::ClearAuth,
            0b10 => SecurityMode::CipherAuth,
            _ => SecurityMode::Undefined,
        }
    }

    /// True for any mode that appends the 4-byte MAC trailer.
    pub fn is_authenticated(self) -> bool {
        !matches!(self, SecurityMode::Clear | SecurityMode::Undefined)
    }

    pub fn is_ciphered(self) -> bool {
        matches!(self, SecurityMode::CipherAuth)
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SecurityMode::Undefined => "Undefined",
            SecurityMode::Clear => "Clear",
            SecurityMode::ClearAuth => "ClearAuth",
            SecurityMode::CipherAuth => "CipherAuth",
        })
    }
}

/// EPSEM response-control (§3), packed into bits 1-0 of the control byte.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseControl {
    #[serde(rename = "Always")]
    #[default]
    Always,
    #[serde(rename = "OnException")]
    OnException,
    #[serde(rename = "Never")]
    Never,
}

impl ResponseControl {
    pub fn wire_bits(self) -> u8 {
        match self {
            ResponseControl::Always => 0b00,
            ResponseControl::OnException => 0b01,
            ResponseControl::Never => 0b10,
        }
    }

    pub fn from_wire_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => ResponseControl::OnException,
            0b10 => ResponseControl::Never,
            _ => ResponseControl::Always,
        }
    }
}

impl fmt::Display for ResponseControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResponseControl::Always => "Always",
            ResponseControl::OnException => "OnException",
            ResponseControl::Never => "Never",
        })
    }
}

/// Policy for reading the ST8 procedure-response table after an ST7
/// invocation (§4.F "Skip-read-ST8 policy").
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadFunctionResponsePolicy {
    #[serde(rename = "Always")]
    #[default]
    Always,
    #[serde(rename = "WhenPresent")]
    WhenPresent,
    #[serde(rename = "WhenDesired")]
    WhenDesired,
}

/// Boolean enumeration with string serialization support, kept for
/// configuration keys that read naturally as Yes/No toggles.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum YesNo {
    #[serde(
        rename = "Yes",
        alias = "yes",
        alias = "YES",
        alias = "true",
        alias = "True",
        alias = "1"
    )]
    Yes,
    #[serde(
        rename = "No",
        alias = "no",
        alias = "NO",
        alias = "false",
        alias = "False",
        alias = "0"
    )]
    No,
}
impl fmt::Display for YesNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            YesNo::Yes => "Yes",
            YesNo::No => "No",
        })
    }
}
impl From<bool> for YesNo {
    fn from(b: bool) -> Self {
        if b { YesNo::Yes } else { YesNo::No }
    }
}
impl YesNo {
    pub fn as_bool(self) -> bool {
        matches!(self, YesNo::Yes)
    }
}
