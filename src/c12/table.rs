// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Table read/write EPSEM services (§4.F): full and partial forms, each
//! carrying the C12 two's-complement data checksum on its response/request
//! body.

use crate::utils::data_checksum;

pub const SVC_READ: u8 = 0x30;
pub const SVC_READ_PARTIAL: u8 = 0x3F;
pub const SVC_WRITE: u8 = 0x40;
pub const SVC_WRITE_PARTIAL: u8 = 0x4F;

/// Encodes a full `TableRead` request body: just the table id.
pub fn encode_read_request(table_id: u16) -> Vec<u8> {
    table_id.to_be_bytes().to_vec()
}

/// Encodes a `TableReadPartial` request body: table id, byte offset, and
/// requested length (§4.J partial-transfer splitter feeds this).
pub fn encode_read_partial_request(table_id: u16, offset: u32, length: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 3 + 2);
    out.extend_from_slice(&table_id.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes()[1..]);
    out.extend_from_slice(&length.to_be_bytes());
    out
}

/// Encodes a full `TableWrite` request body: table id, data length, data,
/// checksum.
pub fn encode_write_request(table_id: u16, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 2 + data.len() + 1);
    out.extend_from_slice(&table_id.to_be_bytes());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
    out.push(data_checksum(data));
    out
}

/// Encodes a `TableWritePartial` request body: table id, byte offset,
/// data length, data, checksum.
pub fn encode_write_partial_request(table_id: u16, offset: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 3 + 2 + data.len() + 1);
    out.extend_from_slice(&table_id.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes()[1..]);
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
    out.push(data_checksum(data));
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReadResponse {
    pub data: Vec<u8>,
}

/// Parses a `TableRead`/`TableReadPartial` response body: a 2-byte length,
/// `data`, and a trailing checksum that must verify.
pub fn parse_read_response(body: &[u8]) -> Result<TableReadResponse, TableError> {
    if body.len() < 3 {
        return Err(TableError::Truncated);
    }
    let len = u16::from_be_bytes([body[0], body[1]]) as usize;
    let data_end = 2 + len;
    if body.len() < data_end + 1 {
        return Err(TableError::Truncated);
    }
    let data = &body[2..data_end];
    let checksum = body[data_end];
    if !crate::utils::verify_checksum(data, checksum) {
        return Err(TableError::ChecksumMismatch);
    }
    Ok(TableReadResponse { data: data.to_vec() })
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TableError {
    #[error("table response body shorter than its declared length")]
    Truncated,
    #[error("table response checksum mismatch")]
    ChecksumMismatch,
}
