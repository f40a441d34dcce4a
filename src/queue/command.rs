// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A single queued command record (§3) and the `q_*` builders that produce
//! one.

/// Distinguishes the family of a queued command so responses can be
/// correlated back to it by `(type_family, number, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandFamily {
    TableRead,
    TableWrite,
    Procedure,
}

/// One queued command awaiting batching into an APDU.
#[derive(Debug, Clone)]
pub struct QueueCommand {
    pub family: CommandFamily,
    /// Table or procedure number.
    pub number: u16,
    /// Caller-assigned correlation id, unique within one batch.
    pub id: u32,
    /// Pre-built EPSEM service code + body (§4.F table/procedure encoders
    /// produce this).
    pub service_code: u8,
    pub service_body: Vec<u8>,
}

impl QueueCommand {
    /// Size this command will occupy once packed into an APDU: one command
    /// byte, the BER length of the body (when the service carries one), and
    /// the body itself.
    pub fn packed_size(&self) -> usize {
        let has_payload = !self.service_body.is_empty();
        1 + if has_payload {
            crate::wire::ber::encode_length(self.service_body.len()).len()
                + self.service_body.len()
        } else {
            0
        }
    }
}

pub fn q_table_read(id: u32, table_id: u16) -> QueueCommand {
    QueueCommand {
        family: CommandFamily::TableRead,
        number: table_id,
        id,
        service_code: crate::c12::table::SVC_READ,
        service_body: crate::c12::table::encode_read_request(table_id),
    }
}

pub fn q_table_read_partial(id: u32, table_id: u16, offset: u32, length: u16) -> QueueCommand {
    QueueCommand {
        family: CommandFamily::TableRead,
        number: table_id,
        id,
        service_code: crate::c12::table::SVC_READ_PARTIAL,
        service_body: crate::c12::table::encode_read_partial_request(
            table_id, offset, length,
        ),
    }
}

pub fn q_table_write(id: u32, table_id: u16, data: &[u8]) -> QueueCommand {
    QueueCommand {
        family: CommandFamily::TableWrite,
        number: table_id,
        id,
        service_code: crate::c12::table::SVC_WRITE,
        service_body: crate::c12::table::encode_write_request(table_id, data),
    }
}

pub fn q_table_write_partial(id: u32, table_id: u16, offset: u32, data: &[u8]) -> QueueCommand {
    QueueCommand {
        family: CommandFamily::TableWrite,
        number: table_id,
        id,
        service_code: crate::c12::table::SVC_WRITE_PARTIAL,
        service_body: crate::c12::table::encode_write_partial_request(
            table_id, offset, data,
        ),
    }
}

pub fn q_procedure_call(
    id: u32,
    procedure_number: u16,
    sequence_number: u8,
    parameters: &[u8],
) -> QueueCommand {
    QueueCommand {
        family: CommandFamily::Procedure,
        number: procedure_number,
        id,
        service_code: crate::c12::table::SVC_WRITE,
        service_body: crate::c12::procedure::build_st7_table_write(
            procedure_number,
            sequence_number,
            parameters,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_size_accounts_for_ber_length_octet() {
        let cmd = q_table_read(1, 42);
        assert_eq!(cmd.packed_size(), 1 + 1 + cmd.service_body.len());
    }
}
