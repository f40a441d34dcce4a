// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Batch planner (§4.H): packs queued commands into APDUs that respect the
//! negotiated outgoing size, and distributes responses back to the
//! commands that produced them.

use crate::{epsem::ControlByte, queue::command::QueueCommand};

/// Fixed framing overhead budgeted per APDU: ACSE header plus the EPSEM
/// control byte. Real ACSE headers vary with AP title length; this is a
/// conservative upper estimate used only to decide batch boundaries, not
/// to build the wire bytes themselves.
pub const ESTIMATED_FRAMING_OVERHEAD: usize = 96;

/// One planned APDU: the commands it carries, in send order.
#[derive(Debug, Clone)]
pub struct PlannedApdu {
    pub commands: Vec<QueueCommand>,
}

impl PlannedApdu {
    /// Concatenates the EPSEM control byte and each command's service code
    /// + body into one EPSEM body ready for ACSE wrapping.
    pub fn build_epsem_body(&self, control: ControlByte) -> Vec<u8> {
        let mut out = vec![control.bits()];
        for cmd in &self.commands {
            out.push(cmd.service_code);
            if !cmd.service_body.is_empty() {
                out.extend_from_slice(&crate::wire::ber::encode_length(cmd.service_body.len()));
                out.extend_from_slice(&cmd.service_body);
            }
        }
        out
    }
}

/// Greedily packs `commands` into APDUs no larger than `max_apdu_payload`
/// bytes of EPSEM content, preserving submission order. A single command
/// larger than the cap still gets its own APDU (oversized commands are the
/// partial-transfer splitter's job, not the planner's).
pub fn plan_batches(commands: Vec<QueueCommand>, max_apdu_payload: u32) -> Vec<PlannedApdu> {
    let budget = (max_apdu_payload as usize).saturating_sub(ESTIMATED_FRAMING_OVERHEAD).max(1);
    let mut batches = Vec::new();
    let mut current: Vec<QueueCommand> = Vec::new();
    let mut current_size = 1usize; // control byte

    for cmd in commands {
        let size = cmd.packed_size();
        if !current.is_empty() && current_size + size > budget {
            batches.push(PlannedApdu { commands: std::mem::take(&mut current) });
            current_size = 1;
        }
        current_size += size;
        current.push(cmd);
    }
    if !current.is_empty() {
        batches.push(PlannedApdu { commands: current });
    }
    batches
}

/// One correlated response: the queued command's id paired with its raw
/// response code and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatedResponse {
    pub id: u32,
    pub response_code: u8,
    pub response_body: Vec<u8>,
}

/// Distributes one APDU's parsed services back to the commands that
/// produced them, by position: responses arrive in the same order the
/// commands were sent within a single APDU (§4.H).
pub fn correlate_responses(
    apdu: &PlannedApdu,
    services: &[crate::epsem::Service],
) -> Result<Vec<CorrelatedResponse>, PlannerError> {
    if services.len() != apdu.commands.len() {
        return Err(PlannerError::ResponseCountMismatch {
            expected: apdu.commands.len(),
            actual: services.len(),
        });
    }
    Ok(apdu
        .commands
        .iter()
        .zip(services)
        .map(|(cmd, svc)| CorrelatedResponse {
            id: cmd.id,
            response_code: svc.code,
            response_body: svc.body.clone(),
        })
        .collect())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlannerError {
    #[error("expected {expected} responses, got {actual}")]
    ResponseCountMismatch { expected: usize, actual: usize },
}

/// Sessionless planner: each APDU is independent, no Logon/Logoff framing,
/// `StartSession`/`EndSession` only toggle connection state (§3, §4.K).
#[derive(Debug, Default)]
pub struct SessionlessPlanner {
    pending: Vec<QueueCommand>,
}

impl SessionlessPlanner {
    pub fn enqueue(&mut self, cmd: QueueCommand) {
        self.pending.push(cmd);
    }

    pub fn flush(&mut self, max_apdu_payload: u32) -> Vec<PlannedApdu> {
        plan_batches(std::mem::take(&mut self.pending), max_apdu_payload)
    }
}

/// Session-bound planner: identical batching, kept as a distinct type
/// because a future session-aware planner may need to interleave keep-alive
/// traffic between batches without the sessionless planner's callers having
/// to account for it.
#[derive(Debug, Default)]
pub struct SessionPlanner {
    pending: Vec<QueueCommand>,
}

impl SessionPlanner {
    pub fn enqueue(&mut self, cmd: QueueCommand) {
        self.pending.push(cmd);
    }

    pub fn flush(&mut self, max_apdu_payload: u32) -> Vec<PlannedApdu> {
        plan_batches(std::mem::take(&mut self.pending), max_apdu_payload)
    }
}
