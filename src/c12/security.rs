// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session-lifecycle EPSEM services (§4.F): Logon, Security, Wait, Logoff,
//! Terminate, and the password/security-key fallback lists.

use crate::cfg::config::SecretBytes;

pub const SVC_LOGON: u8 = 0x50;
pub const SVC_SECURITY: u8 = 0x51;
pub const SVC_WAIT: u8 = 0x70;
pub const SVC_LOGOFF: u8 = 0x52;
pub const SVC_TERMINATE: u8 = 0x21;

const USER_FIELD_LEN: usize = 10;
const PASSWORD_FIELD_LEN: usize = 20;

/// Encodes a `Logon` request body: user id, then a 10-byte zero-padded user
/// name field.
pub fn encode_logon(user_id: u16, logon_user: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + USER_FIELD_LEN);
    out.extend_from_slice(&user_id.to_be_bytes());
    let mut field = [0u8; USER_FIELD_LEN];
    let bytes = logon_user.as_bytes();
    let n = bytes.len().min(USER_FIELD_LEN);
    field[..n].copy_from_slice(&bytes[..n]);
    out.extend_from_slice(&field);
    out
}

/// Encodes a `Security` request body carrying one 20-byte zero-padded
/// password.
pub fn encode_security(password: &SecretBytes) -> Vec<u8> {
    password.padded(PASSWORD_FIELD_LEN)
}

/// Encodes a `Wait` request body: the number of turns to hold the session
/// open for.
pub fn encode_wait(turns: u8) -> Vec<u8> {
    vec![turns]
}

/// Tries each password in `passwords` in order against `attempt`, stopping
/// at the first that `attempt` accepts (§4.F "Password list fallback").
/// Returns the index of the password that succeeded, or `None` if the list
/// is exhausted.
pub fn try_password_fallback<F, E>(
    passwords: &[SecretBytes],
    mut attempt: F,
) -> Result<Option<usize>, E>
where
    F: FnMut(&SecretBytes) -> Result<bool, E>,
{
    for (idx, password) in passwords.iter().enumerate() {
        if attempt(password)? {
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

/// Tries each security key in `keys` in order, stopping at the first that
/// `attempt` accepts (§4.F "Security-key list fallback", C12.22 only).
/// Mirrors [`try_password_fallback`]; kept distinct because the two lists
/// are configured and validated independently (key list entries must be
/// exactly 16 bytes; password list entries are free-form).
pub fn try_security_key_fallback<F, E>(
    keys: &[SecretBytes],
    mut attempt: F,
) -> Result<Option<usize>, E>
where
    F: FnMut(&SecretBytes) -> Result<bool, E>,
{
    for (idx, key) in keys.iter().enumerate() {
        if attempt(key)? {
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logon_pads_user_field() {
        let body = encode_logon(1, "abc");
        assert_eq!(body.len(), 2 + USER_FIELD_LEN);
        assert_eq!(&body[2..5], b"abc");
        assert!(body[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn password_fallback_stops_at_first_match() {
        let passwords = vec![
            SecretBytes(b"wrong1".to_vec()),
            SecretBytes(b"correct".to_vec()),
            SecretBytes(b"wrong2".to_vec()),
        ];
        let result: Result<Option<usize>, ()> =
            try_password_fallback(&passwords, |p| Ok(p.as_slice() == b"correct"));
        assert_eq!(result.unwrap(), Some(1));
    }

    #[test]
    fn password_fallback_exhausted_returns_none() {
        let passwords = vec![SecretBytes(b"a".to_vec())];
        let result: Result<Option<usize>, ()> = try_password_fallback(&passwords, |_| Ok(false));
        assert_eq!(result.unwrap(), None);
    }
}
