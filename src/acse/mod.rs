// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! ACSE (Association Control Service Element) header encode/parse (§4.D).
//!
//! Every APDU opens with an outer `0x60` tag wrapping a fixed sequence of
//! tagged elements in ascending tag order - `A1` application context, `A2`
//! called AP title, `A4` called AP invocation id, `A6` calling AP title,
//! `A7` calling AE qualifier, `A8` calling AP invocation id, `AC` calling
//! authentication value - each omitted entirely when absent. The EPSEM
//! payload follows, wrapped in a `BE 28 81` user-information-external
//! chain.

use thiserror::Error;

use crate::wire::{
    ber::{BerError, decode_uid_body, encode_length, encode_minimal_be, encode_uid_body},
    buffer::{BidiBuffer, BufferError, ForwardReader},
};

pub const TAG_OUTER: u8 = 0x60;
pub const TAG_APPLICATION_CONTEXT: u8 = 0xA1;
pub const TAG_CALLED_AP_TITLE: u8 = 0xA2;
pub const TAG_CALLED_AP_INVOCATION_ID: u8 = 0xA4;
pub const TAG_CALLING_AP_TITLE: u8 = 0xA6;
pub const TAG_CALLING_AE_QUALIFIER: u8 = 0xA7;
pub const TAG_CALLING_AP_INVOCATION_ID: u8 = 0xA8;
pub const TAG_CALLING_AUTHENTICATION_VALUE: u8 = 0xAC;

pub const TAG_USER_INFORMATION: u8 = 0xBE;
pub const TAG_USER_INFORMATION_EXTERNAL: u8 = 0x28;
pub const TAG_USER_INFORMATION_ENCODING: u8 = 0x81;

/// Inner ASN.1 tag carried inside the application-context element (`A1`).
const TAG_INNER_OID: u8 = 0x06;
/// Inner tag carried inside an AP-title element (`A2`/`A6`): the
/// octet-aligned form of the AP-title CHOICE.
const TAG_INNER_AP_TITLE: u8 = 0x80;

#[derive(Debug, Error)]
pub enum AcseError {
    #[error(transparent)]
    Ber(#[from] BerError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("expected outer tag {TAG_OUTER:#04x}, found {0:#04x}")]
    BadOuterTag(u8),
    #[error("ACSE element tag {0:#04x} appeared out of ascending order")]
    OutOfOrder(u8),
    #[error("missing required ACSE element {0:#04x}")]
    MissingElement(u8),
    #[error("user-information wrapper malformed at tag {0:#04x}")]
    BadUserInformationWrapper(u8),
    #[error("expected inner tag {expected:#04x}, found {found:#04x}")]
    BadInnerTag { expected: u8, found: u8 },
}

/// Parsed or to-be-encoded ACSE header. `called_ap_invocation_id` and
/// `calling_ap_invocation_id` are plain unsigned integers; the AP titles are
/// OID strings (absolute, or relative with a leading `.`).
#[derive(Debug, Clone, Default)]
pub struct AcseHeader {
    pub application_context: String,
    pub called_ap_title: Option<String>,
    pub called_ap_invocation_id: Option<u32>,
    pub calling_ap_title: Option<String>,
    pub calling_ae_qualifier: Option<u32>,
    pub calling_ap_invocation_id: Option<u32>,
    /// Raw bytes of the calling-authentication-value element, as received
    /// or to be sent verbatim (its internal structure - key id, IV, MAC -
    /// is owned by the EPSEM/crypto layers).
    pub calling_authentication_value: Option<Vec<u8>>,
}

impl AcseHeader {
    /// Encodes the ACSE elements (ascending tag order) wrapping `epsem_body`
    /// in the user-information chain, producing a complete outer-tagged
    /// APDU.
    pub fn encode(&self, epsem_body: &[u8]) -> Vec<u8> {
        let mut buf = BidiBuffer::with_header_capacity(64);
        buf.append(epsem_body);

        buf.prepend_ber_length(epsem_body.len());
        buf.prepend(&[TAG_USER_INFORMATION_ENCODING]);
        buf.prepend_ber_length(1 + length_of_ber(epsem_body.len()) + epsem_body.len());
        buf.prepend(&[TAG_USER_INFORMATION_EXTERNAL]);
        buf.prepend_ber_length(
            1 + length_of_ber(1 + length_of_ber(epsem_body.len()) + epsem_body.len())
                + 1
                + length_of_ber(epsem_body.len())
                + epsem_body.len(),
        );
        buf.prepend(&[TAG_USER_INFORMATION]);

        if let Some(ac) = &self.calling_authentication_value {
            buf.prepend(ac);
            buf.prepend_ber_length(ac.len());
            buf.prepend(&[TAG_CALLING_AUTHENTICATION_VALUE]);
        }
        if let Some(id) = self.calling_ap_invocation_id {
            buf.prepend_tagged_u32(TAG_CALLING_AP_INVOCATION_ID, id);
        }
        if let Some(q) = self.calling_ae_qualifier {
            buf.prepend_tagged_u32(TAG_CALLING_AE_QUALIFIER, q);
        }
        buf.prepend_uid_if_present(
            TAG_CALLING_AP_TITLE,
            TAG_INNER_AP_TITLE,
            self.calling_ap_title.as_deref(),
        );
        if let Some(id) = self.called_ap_invocation_id {
            buf.prepend_tagged_u32(TAG_CALLED_AP_INVOCATION_ID, id);
        }
        buf.prepend_uid_if_present(
            TAG_CALLED_AP_TITLE,
            TAG_INNER_AP_TITLE,
            self.called_ap_title.as_deref(),
        );
        buf.prepend_uid_if_present(
            TAG_APPLICATION_CONTEXT,
            TAG_INNER_OID,
            Some(self.application_context.as_str()),
        );

        let body = buf.body_bytes();
        let mut outer = BidiBuffer::with_header_capacity(8);
        outer.append(body);
        outer.prepend_ber_length(body.len());
        outer.prepend(&[TAG_OUTER]);
        outer.into_vec()
    }

    /// Parses a complete ACSE-wrapped APDU, returning the header and the
    /// EPSEM body bytes. Elements must appear in ascending tag order;
    /// anything else is rejected.
    pub fn parse(data: &[u8]) -> Result<(Self, Vec<u8>), AcseError> {
        let mut r = ForwardReader::new(data);
        let outer_tag = r.read_u8()?;
        if outer_tag != TAG_OUTER {
            return Err(AcseError::BadOuterTag(outer_tag));
        }
        let outer_len = r.read_ber_length()?;
        r.narrow_to(outer_len)?;

        let mut header = AcseHeader::default();
        let mut last_tag = 0u8;

        loop {
            if r.remaining() == 0 {
                break;
            }
            let tag = r.read_u8()?;
            if tag == TAG_USER_INFORMATION {
                if tag <= last_tag {
                    return Err(AcseError::OutOfOrder(tag));
                }
                let epsem_body = parse_user_information(&mut r)?;
                if header.application_context.is_empty() {
                    return Err(AcseError::MissingElement(TAG_APPLICATION_CONTEXT));
                }
                return Ok((header, epsem_body));
            }

            if tag <= last_tag {
                return Err(AcseError::OutOfOrder(tag));
            }
            last_tag = tag;

            let len = r.read_ber_length()?;
            let body = r.read_n(len)?;

            match tag {
                TAG_APPLICATION_CONTEXT => {
                    let inner = decode_inner_tlv(body, TAG_INNER_OID)?;
                    header.application_context = decode_uid_body(inner, false)?
                },
                TAG_CALLED_AP_TITLE => {
                    let inner = decode_inner_tlv(body, TAG_INNER_AP_TITLE)?;
                    header.called_ap_title =
                        Some(decode_uid_body(inner, is_uid_relative_body(inner))?)
                },
                TAG_CALLED_AP_INVOCATION_ID => {
                    header.called_ap_invocation_id = Some(decode_u32_be(body))
                },
                TAG_CALLING_AP_TITLE => {
                    let inner = decode_inner_tlv(body, TAG_INNER_AP_TITLE)?;
                    header.calling_ap_title =
                        Some(decode_uid_body(inner, is_uid_relative_body(inner))?)
                },
                TAG_CALLING_AE_QUALIFIER => {
                    header.calling_ae_qualifier = Some(decode_u32_be(body))
                },
                TAG_CALLING_AP_INVOCATION_ID => {
                    header.calling_ap_invocation_id = Some(decode_u32_be(body))
                },
                TAG_CALLING_AUTHENTICATION_VALUE => {
                    header.calling_authentication_value = Some(body.to_vec())
                },
                other => return Err(AcseError::OutOfOrder(other)),
            }
        }

        Err(AcseError::MissingElement(TAG_USER_INFORMATION))
    }
}

/// Whether a decoded (already-extracted) UID body should render as relative;
/// ACSE carries absolute AP titles only, but called/calling titles from some
/// peers arrive in relative form. Since the leading-dot convention lives at
/// the string layer and the wire body carries only packed octets, callers
/// that need relative decoding should use [`decode_uid_body`] directly; this
/// helper keeps `parse` conservative and always treats wire bodies as
/// absolute.
fn is_uid_relative_body(_body: &[u8]) -> bool {
    false
}

/// Strips the inner ASN.1 tag and length wrapping an ACSE element's value
/// (`06` for the application context, `80` for an AP title), returning the
/// packed OID bytes underneath.
fn decode_inner_tlv<'a>(body: &'a [u8], expected_tag: u8) -> Result<&'a [u8], AcseError> {
    let mut r = ForwardReader::new(body);
    let inner_tag = r.read_u8()?;
    if inner_tag != expected_tag {
        return Err(AcseError::BadInnerTag {
            expected: expected_tag,
            found: inner_tag,
        });
    }
    let inner_len = r.read_ber_length()?;
    Ok(r.read_n(inner_len)?)
}

/// Context tags nested inside the calling-authentication-value element.
const TAG_AC_OUTER: u8 = 0xA2;
const TAG_AC_MIDDLE: u8 = 0xA0;
const TAG_AC_INNER: u8 = 0xA1;
const TAG_AC_KEY_ID: u8 = 0x80;
const TAG_AC_IV: u8 = 0x81;

/// Builds the content of the calling-authentication-value element: `A2 0D A0
/// 0B A1 09 80 01 <key-id> 81 04 <iv>`. Carries only the key id and IV; the
/// MAC is never nested inside this element - it travels as a trailing
/// suffix on the EPSEM body (§4.D step 4/5).
pub fn encode_authentication_value(key_id: u8, iv: u32) -> Vec<u8> {
    let mut fields = vec![TAG_AC_KEY_ID, 1, key_id, TAG_AC_IV, 4];
    fields.extend_from_slice(&iv.to_be_bytes());
    let mut a1 = vec![TAG_AC_INNER, fields.len() as u8];
    a1.extend_from_slice(&fields);
    let mut a0 = vec![TAG_AC_MIDDLE, a1.len() as u8];
    a0.extend_from_slice(&a1);
    let mut a2 = vec![TAG_AC_OUTER, a0.len() as u8];
    a2.extend_from_slice(&a0);
    a2
}

/// Decodes a calling-authentication-value element built by
/// [`encode_authentication_value`], returning `(key_id, iv)`.
pub fn decode_authentication_value(body: &[u8]) -> Result<(u8, u32), AcseError> {
    let a0 = decode_inner_tlv(body, TAG_AC_OUTER)?;
    let a1 = decode_inner_tlv(a0, TAG_AC_MIDDLE)?;
    let fields = decode_inner_tlv(a1, TAG_AC_INNER)?;

    let mut r = ForwardReader::new(fields);
    let key_tag = r.read_u8()?;
    if key_tag != TAG_AC_KEY_ID {
        return Err(AcseError::BadInnerTag {
            expected: TAG_AC_KEY_ID,
            found: key_tag,
        });
    }
    let key_len = r.read_ber_length()?;
    let key_id = *r
        .read_n(key_len)?
        .first()
        .ok_or(AcseError::MissingElement(TAG_AC_KEY_ID))?;

    let iv_tag = r.read_u8()?;
    if iv_tag != TAG_AC_IV {
        return Err(AcseError::BadInnerTag {
            expected: TAG_AC_IV,
            found: iv_tag,
        });
    }
    let iv_len = r.read_ber_length()?;
    let iv = decode_u32_be(r.read_n(iv_len)?);

    Ok((key_id, iv))
}

/// Encodes one ACSE element's complete wire bytes: `tag, <ber-len>,
/// inner_tag, <ber-len>, <packed OID>`. Used to rebuild the EAX canonified
/// AAD (§4.C) from header fields directly, ahead of the real `encode` pass.
pub fn encode_uid_element(tag: u8, inner_tag: u8, oid: &str) -> Result<Vec<u8>, BerError> {
    let body = encode_uid_body(oid)?;
    let mut inner = vec![inner_tag];
    inner.extend_from_slice(&encode_length(body.len()));
    inner.extend_from_slice(&body);
    let mut out = vec![tag];
    out.extend_from_slice(&encode_length(inner.len()));
    out.extend_from_slice(&inner);
    Ok(out)
}

/// Encodes one `tag, <ber-len>, <big-endian value, minimal length>` element.
pub fn encode_u32_element(tag: u8, value: u32) -> Vec<u8> {
    let val_bytes = encode_minimal_be(value);
    let mut out = vec![tag];
    out.extend_from_slice(&encode_length(val_bytes.len()));
    out.extend_from_slice(&val_bytes);
    out
}

/// Rebuilds the `BE/28/81` user-information wrapper plus the EPSEM control
/// byte exactly as [`AcseHeader::encode`] emits them, for use in the EAX
/// canonified AAD (§4.C): the total body length (including the trailing MAC)
/// is known before the real encode pass runs, so the wrapper can be
/// reconstructed ahead of it.
pub fn encode_wrapper_through_control(total_body_len: usize, control: u8) -> Vec<u8> {
    let mut buf = BidiBuffer::with_header_capacity(16);
    buf.append(&[control]);
    buf.prepend_ber_length(total_body_len);
    buf.prepend(&[TAG_USER_INFORMATION_ENCODING]);
    buf.prepend_ber_length(1 + length_of_ber(total_body_len) + total_body_len);
    buf.prepend(&[TAG_USER_INFORMATION_EXTERNAL]);
    buf.prepend_ber_length(
        1 + length_of_ber(1 + length_of_ber(total_body_len) + total_body_len)
            + 1
            + length_of_ber(total_body_len)
            + total_body_len,
    );
    buf.prepend(&[TAG_USER_INFORMATION]);
    buf.into_vec()
}

fn parse_user_information(r: &mut ForwardReader<'_>) -> Result<Vec<u8>, AcseError> {
    let _outer_len = r.read_ber_length()?;
    let external_tag = r.read_u8()?;
    if external_tag != TAG_USER_INFORMATION_EXTERNAL {
        return Err(AcseError::BadUserInformationWrapper(external_tag));
    }
    let _external_len = r.read_ber_length()?;
    let encoding_tag = r.read_u8()?;
    if encoding_tag != TAG_USER_INFORMATION_ENCODING {
        return Err(AcseError::BadUserInformationWrapper(encoding_tag));
    }
    let encoding_len = r.read_ber_length()?;
    Ok(r.read_n(encoding_len)?.to_vec())
}

fn decode_u32_be(body: &[u8]) -> u32 {
    body.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}

fn length_of_ber(n: usize) -> usize {
    if n < 0x80 {
        1
    } else {
        let bytes = n.to_be_bytes();
        let significant = bytes.iter().skip_while(|&&b| b == 0).count().max(1);
        1 + significant
    }
}
