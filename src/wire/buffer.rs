// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Byte buffers used to assemble and parse APDUs (§4.A).
//!
//! [`ForwardBuffer`] is append-only and is read through a cursor
//! ([`ForwardReader`]) that can narrow its own end position, letting the
//! EPSEM parser (§4.E) restrict a sub-reader to one service's declared
//! length.
//!
//! [`BidiBuffer`] reserves a header region up front and lets the ACSE
//! encoder (§4.D) build an outgoing APDU body-first, then wrap header tags
//! around it in reverse order as the association context is assembled.

use thiserror::Error;

use crate::wire::ber::{encode_length, encode_uid_body};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("expected-size mismatch: wanted {wanted} bytes, {available} available")]
    ExpectedSizeMismatch { wanted: usize, available: usize },
    #[error("prepend region exhausted: wanted {wanted} more bytes, {available} left")]
    HeaderRegionExhausted { wanted: usize, available: usize },
}

/// Append-only byte buffer.
#[derive(Debug, Clone, Default)]
pub struct ForwardBuffer {
    bytes: Vec<u8>,
}

impl ForwardBuffer {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    pub fn reader(&self) -> ForwardReader<'_> {
        ForwardReader::new(&self.bytes)
    }
}

/// Cursor reader over a byte slice, with a narrowable end position so nested
/// length-delimited fields can be decoded without copying.
#[derive(Debug)]
pub struct ForwardReader<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> ForwardReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            end: data.len(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// Narrows the reader's end position to `pos + len`, so subsequent reads
    /// cannot cross past one nested field. Returns an error if that would
    /// extend past the current end.
    pub fn narrow_to(&mut self, len: usize) -> Result<(), BufferError> {
        let new_end = self.pos + len;
        if new_end > self.end {
            return Err(BufferError::ExpectedSizeMismatch {
                wanted: len,
                available: self.remaining(),
            });
        }
        self.end = new_end;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, BufferError> {
        if self.remaining() < 1 {
            return Err(BufferError::ExpectedSizeMismatch {
                wanted: 1,
                available: self.remaining(),
            });
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    pub fn read_n(&mut self, n: usize) -> Result<&'a [u8], BufferError> {
        if self.remaining() < n {
            return Err(BufferError::ExpectedSizeMismatch {
                wanted: n,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_ber_length(&mut self) -> Result<usize, crate::wire::ber::BerError> {
        crate::wire::ber::decode_length(self)
    }

    pub fn read_u16_be(&mut self) -> Result<u16, BufferError> {
        let b = self.read_n(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u24_be(&mut self) -> Result<u32, BufferError> {
        let b = self.read_n(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn read_u32_be(&mut self) -> Result<u32, BufferError> {
        let b = self.read_n(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Bidirectional buffer that reserves a header region up front and lets the
/// caller build an outgoing APDU body-first, then wrap ACSE header elements
/// around it in reverse.
#[derive(Debug, Clone)]
pub struct BidiBuffer {
    /// Full backing storage: `[unused head .. body]`.
    data: Vec<u8>,
    /// Index of the first body byte / one-past-the-last header byte.
    head_start: usize,
}

impl BidiBuffer {
    /// Reserves `header_capacity` bytes up front for later `prepend` calls.
    pub fn with_header_capacity(header_capacity: usize) -> Self {
        Self {
            data: vec![0u8; header_capacity],
            head_start: header_capacity,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Writes `bytes` immediately before the current head, growing the
    /// reserved region backwards if it has been exhausted.
    pub fn prepend(&mut self, bytes: &[u8]) {
        if bytes.len() > self.head_start {
            let grow = bytes.len() - self.head_start;
            self.data.splice(0..0, std::iter::repeat_n(0u8, grow));
            self.head_start += grow;
        }
        self.head_start -= bytes.len();
        self.data[self.head_start..self.head_start + bytes.len()].copy_from_slice(bytes);
    }

    /// Prepends the BER length of `total_size_excluding_trailer`.
    pub fn prepend_ber_length(&mut self, total_size_excluding_trailer: usize) {
        let enc = encode_length(total_size_excluding_trailer);
        self.prepend(&enc);
    }

    /// Prepends `tag, <ber-len>, <big-endian value, minimal length>`.
    pub fn prepend_tagged_u32(&mut self, tag: u8, value: u32) {
        let val_bytes = crate::wire::ber::encode_minimal_be(value);
        self.prepend(&val_bytes);
        self.prepend(&encode_length(val_bytes.len()));
        self.prepend(&[tag]);
    }

    /// Prepends `tag, <ber-len>, inner_tag, <ber-len>, <packed OID>` if `oid`
    /// is `Some`; no-op otherwise. `inner_tag` is the ASN.1 tag carried
    /// inside the ACSE element (`0x06` OBJECT IDENTIFIER for the
    /// application context, `0x80` for the octet-aligned AP-title form).
    pub fn prepend_uid_if_present(&mut self, tag: u8, inner_tag: u8, oid: Option<&str>) {
        if let Some(oid) = oid {
            if let Ok(body) = encode_uid_body(oid) {
                self.prepend(&body);
                let inner_len = encode_length(body.len());
                self.prepend(&inner_len);
                self.prepend(&[inner_tag]);
                self.prepend(&encode_length(1 + inner_len.len() + body.len()));
                self.prepend(&[tag]);
            }
        }
    }

    /// Whole buffer, including the prepended header.
    pub fn whole_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Body bytes only (everything appended, excluding header prepends).
    pub fn body_bytes(&self) -> &[u8] {
        &self.data[self.head_start..]
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_buffer_read_past_end_errors() {
        let mut buf = ForwardBuffer::new();
        buf.append(&[1, 2, 3]);
        let mut r = buf.reader();
        assert!(r.read_n(2).is_ok());
        assert_eq!(
            r.read_n(5),
            Err(BufferError::ExpectedSizeMismatch {
                wanted: 5,
                available: 1
            })
        );
    }

    #[test]
    fn narrow_to_restricts_sub_read() {
        let mut buf = ForwardBuffer::new();
        buf.append(&[1, 2, 3, 4, 5]);
        let mut r = buf.reader();
        r.narrow_to(2).unwrap();
        assert!(r.read_n(3).is_err());
        assert!(r.read_n(2).is_ok());
    }

    #[test]
    fn bidi_buffer_body_first_then_header() {
        let mut buf = BidiBuffer::with_header_capacity(16);
        buf.append(&[0xAA, 0xBB]);
        assert_eq!(buf.body_bytes(), &[0xAA, 0xBB]);
        buf.prepend(&[0x01]);
        buf.prepend(&[0x02, 0x03]);
        assert_eq!(buf.body_bytes(), &[0xAA, 0xBB]);
        assert_eq!(buf.whole_bytes(), &[0x02, 0x03, 0x01, 0xAA, 0xBB]);
    }

    #[test]
    fn bidi_buffer_grows_when_reservation_exhausted() {
        let mut buf = BidiBuffer::with_header_capacity(1);
        buf.append(&[0xFF]);
        buf.prepend(&[1, 2, 3, 4]);
        assert_eq!(buf.whole_bytes(), &[1, 2, 3, 4, 0xFF]);
    }

    #[test]
    fn prepend_tagged_u32_round_trips() {
        let mut buf = BidiBuffer::with_header_capacity(8);
        buf.prepend_tagged_u32(0xA8, 0x1234);
        assert_eq!(buf.whole_bytes(), &[0xA8, 0x02, 0x12, 0x34]);
    }
}
