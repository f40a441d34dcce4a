// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Procedure call pair: a `TableWrite` to table 7 (ST7, the procedure
//! initiate table) followed by a `TableRead` of table 8 (ST8, the
//! procedure response table).

use crate::c12::table;

pub const PROCEDURE_INITIATE_TABLE: u16 = 7;
pub const PROCEDURE_RESPONSE_TABLE: u16 = 8;

/// Encodes an ST7 body: procedure number (11 bits) + sequence number
/// (top bit of the MSB + low 6 bits of a following byte, per C12.19),
/// followed by the procedure's parameter bytes.
pub fn encode_st7(procedure_number: u16, sequence_number: u8, parameters: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + parameters.len());
    let proc_lo = (procedure_number & 0x00FF) as u8;
    let proc_hi_and_seq = (((procedure_number >> 8) & 0x07) as u8) | ((sequence_number & 0x1F) << 3);
    out.push(proc_lo);
    out.push(proc_hi_and_seq);
    out.extend_from_slice(parameters);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct St8Response {
    pub sequence_number: u8,
    pub result_code: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProcedureError {
    #[error("ST8 response body shorter than its declared length")]
    Truncated,
}

/// Parses an ST8 response body: sequence number, result code, and the
/// procedure's return data.
///
/// The sequence number echoed here is *not* compared against the one sent
/// in ST7 (Open Question, §9, resolved: left unenforced). Some peers
/// increment or reset it independently of what the client sent, and
/// rejecting on mismatch would break otherwise-valid exchanges with those
/// peers; callers that need strict correlation can compare the two
/// themselves using the value returned here.
pub fn parse_st8(body: &[u8]) -> Result<St8Response, ProcedureError> {
    if body.len() < 2 {
        return Err(ProcedureError::Truncated);
    }
    let sequence_number = body[0] >> 3;
    let result_code = body[1];
    Ok(St8Response {
        sequence_number,
        result_code,
        data: body[2..].to_vec(),
    })
}

/// Builds a `TableWrite` request body for table 7 carrying an ST7 service.
pub fn build_st7_table_write(procedure_number: u16, sequence_number: u8, parameters: &[u8]) -> Vec<u8> {
    let st7 = encode_st7(procedure_number, sequence_number, parameters);
    table::encode_write_request(PROCEDURE_INITIATE_TABLE, &st7)
}

/// Builds a `TableRead` request body for table 8.
pub fn build_st8_table_read() -> Vec<u8> {
    table::encode_read_request(PROCEDURE_RESPONSE_TABLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn st7_packs_procedure_and_sequence_numbers() {
        let st7 = encode_st7(0x0123, 0x15, &[0xAA]);
        let decoded_lo = st7[0];
        let decoded_hi = (st7[1] & 0x07) as u16;
        let decoded_proc = (decoded_hi << 8) | decoded_lo as u16;
        assert_eq!(decoded_proc, 0x0123);
        assert_eq!(st7[1] >> 3, 0x15);
        assert_eq!(&st7[2..], &[0xAA]);
    }

    #[test]
    fn st8_sequence_mismatch_is_not_rejected() {
        let body = vec![(0x07u8) << 3, 0x00, 0xDE, 0xAD];
        let parsed = parse_st8(&body).unwrap();
        assert_eq!(parsed.sequence_number, 0x07);
        assert_eq!(parsed.result_code, 0);
        assert_eq!(parsed.data, vec![0xDE, 0xAD]);
    }

    #[test]
    fn st8_truncated_body_errors() {
        assert_eq!(parse_st8(&[0x00]), Err(ProcedureError::Truncated));
    }
}
