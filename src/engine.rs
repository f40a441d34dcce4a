// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Protocol façade (§4.K): the single entry point applications drive. Wires
//! together ACSE framing, EPSEM packing, AES-EAX protection, the retry
//! arbitrator, and the batch planner behind a small synchronous-feeling API
//! (commands queue, then `submit_batch` drives them over the wire).

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::{
    acse::{self, AcseHeader},
    c12::{codes::C12ServiceResponse, procedure, security, table},
    cfg::config::{EngineConfig, SecretBytes},
    channel::{Channel, Monitor, NullMonitor},
    crypto::eax::{self, EaxKey},
    epsem::{self, ControlByte, Service},
    error::EngineError,
    keepalive::{self, KeepAliveHandle},
    partial::{self, ReadAssembler},
    queue::{
        command::QueueCommand,
        planner::{self, CorrelatedResponse, PlannedApdu},
    },
    retry::{Disposition, RetryCounters},
    session::{ConnectionState, SessionState},
    utils::IvGenerator,
};

/// Per-request data-budget overhead for a full `TableWrite`: table id,
/// length, and checksum (§4.F table.rs framing).
const WRITE_HEADER_OVERHEAD: usize = 2 + 2 + 1;
/// Per-request data-budget overhead for a `TableWritePartial`: table id,
/// offset, length, and checksum.
const WRITE_PARTIAL_HEADER_OVERHEAD: usize = 2 + 3 + 2 + 1;
/// Per-request data-budget overhead for a `TableReadPartial`: table id,
/// offset, and requested length.
const READ_PARTIAL_HEADER_OVERHEAD: usize = 2 + 3 + 2;

/// Result of a successful procedure call (§4.F ST7/ST8 pair).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureResult {
    pub sequence_number: u8,
    pub data: Vec<u8>,
}

pub struct Engine<C: Channel> {
    cfg: EngineConfig,
    channel: C,
    session: Mutex<SessionState>,
    iv_gen: IvGenerator,
    /// Generator for the calling-AP-invocation-id sent on every outgoing
    /// APDU (§3), distinct from `iv_gen` even though both are monotonic
    /// UTC-seconds counters: one feeds the EAX nonce, the other is compared
    /// against the peer's echoed called-invocation-id for tampering checks.
    invocation_id_gen: IvGenerator,
    monitor: Box<dyn Monitor>,
    retry_counters: Mutex<RetryCounters>,
    keep_alive: Mutex<Option<KeepAliveHandle>>,
}

impl<C: Channel> Engine<C> {
    pub fn new(cfg: EngineConfig, channel: C) -> Self {
        Self::with_monitor(cfg, channel, Box::new(NullMonitor))
    }

    pub fn with_monitor(cfg: EngineConfig, channel: C, monitor: Box<dyn Monitor>) -> Self {
        let session = SessionState::new(&cfg);
        Self {
            cfg,
            channel,
            session: Mutex::new(session),
            iv_gen: IvGenerator::new(),
            invocation_id_gen: IvGenerator::new(),
            monitor,
            retry_counters: Mutex::new(RetryCounters::default()),
            keep_alive: Mutex::new(None),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.session.lock().await.state
    }

    /// Index into `security_key_list` that last verified an incoming MAC
    /// (§4.K state accessors, §4.F key-list fallback), or `None` before any
    /// authenticated response has been received.
    pub async fn successful_security_key_index(&self) -> Option<usize> {
        self.session.lock().await.successful_security_key_index
    }

    /// Marks the association as open. Establishing the underlying channel
    /// itself is the caller's responsibility (§1 Non-goals).
    pub async fn connect(&self) {
        let mut session = self.session.lock().await;
        session.state = ConnectionState::Connected;
        info!("association marked connected");
        self.monitor.on_session_started();
    }

    pub async fn disconnect(&self) {
        if let Some(h) = self.keep_alive.lock().await.take() {
            h.stop();
        }
        let mut session = self.session.lock().await;
        session.state = ConnectionState::Disconnected;
        info!("association marked disconnected");
        self.monitor.on_session_ended("disconnect");
    }

    /// Spawns the background keep-alive task for this session (§4.I), when
    /// `keep_alive.keep_session_alive` is configured. Requires the engine to
    /// be held behind an `Arc`, since the keeper outlives this call and
    /// calls back into [`Engine::submit_batch`] on its own schedule. A
    /// second call replaces the previous handle, stopping its task.
    pub async fn spawn_keep_alive(self: &Arc<Self>)
    where
        C: 'static,
    {
        if !self.cfg.keep_alive.keep_session_alive {
            return;
        }
        let session_timeout_secs = { self.session.lock().await.session_timeout_secs };
        let action = EngineKeepAliveAction { engine: Arc::clone(self) };
        let handle = keepalive::spawn(self.cfg.keep_alive.clone(), session_timeout_secs, action);
        if let Some(old) = self.keep_alive.lock().await.replace(handle) {
            old.stop();
        }
    }

    /// Starts a session: in sessionless mode this only flips state; otherwise
    /// it issues `Logon` and, if configured, `Security`, trying each
    /// password in the fallback list until one is accepted.
    #[instrument(skip(self))]
    pub async fn start_session(&self) -> Result<(), EngineError> {
        let sessionless = { self.session.lock().await.sessionless };
        if sessionless {
            let mut session = self.session.lock().await;
            session.state = ConnectionState::InSession;
            session.reset_session_identifiers();
            return Ok(());
        }

        let logon_body = security::encode_logon(
            self.cfg.security.user_id,
            &self.cfg.security.logon_user,
        );
        let responses = self
            .submit_batch(vec![QueueCommand {
                family: crate::queue::command::CommandFamily::TableWrite,
                number: 0,
                id: 0,
                service_code: security::SVC_LOGON,
                service_body: logon_body,
            }])
            .await?;
        self.expect_ok(&responses, "Logon")?;

        if self.cfg.security.issue_security_on_start_session {
            self.issue_security().await?;
        }

        let mut session = self.session.lock().await;
        session.state = ConnectionState::InSession;
        session.reset_session_identifiers();
        info!("session established");
        self.monitor.on_session_started();
        Ok(())
    }

    async fn issue_security(&self) -> Result<(), EngineError> {
        let passwords = self.cfg.security.password_list.clone();
        for (idx, password) in passwords.iter().enumerate() {
            debug!(attempt = idx, "trying password from fallback list");
            let body = security::encode_security(password);
            let responses = self
                .submit_batch(vec![QueueCommand {
                    family: crate::queue::command::CommandFamily::TableWrite,
                    number: 0,
                    id: 0,
                    service_code: security::SVC_SECURITY,
                    service_body: body,
                }])
                .await?;
            if self.expect_ok(&responses, "Security").is_ok() {
                return Ok(());
            }
        }
        Err(EngineError::Crypto(
            crate::error::CryptoLayerError::AllKeysRejected(passwords.len()),
        ))
    }

    /// Ends a session: in sessionless mode only flips state; otherwise
    /// issues `Logoff`.
    #[instrument(skip(self))]
    pub async fn end_session(&self) -> Result<(), EngineError> {
        if let Some(h) = self.keep_alive.lock().await.take() {
            h.stop();
        }
        let sessionless = { self.session.lock().await.sessionless };
        if !sessionless {
            let _ = self
                .submit_batch(vec![QueueCommand {
                    family: crate::queue::command::CommandFamily::TableWrite,
                    number: 0,
                    id: 0,
                    service_code: security::SVC_LOGOFF,
                    service_body: Vec::new(),
                }])
                .await;
        }
        let mut session = self.session.lock().await;
        session.drop_to_connected();
        self.monitor.on_session_ended("end_session");
        Ok(())
    }

    /// Writes `data` to `table_id`, transparently decomposing into
    /// `TableWritePartial` chunks when it does not fit a single `TableWrite`
    /// at the currently negotiated outgoing size, or when a full-write
    /// attempt comes back RQTL (§4.J). A plain fit is always kept whole.
    #[instrument(skip(self, data))]
    pub async fn write_table(&self, table_id: u16, data: &[u8]) -> Result<(), EngineError> {
        let fits_whole = {
            let session = self.session.lock().await;
            let budget = (session.max_apdu_out as usize)
                .saturating_sub(planner::ESTIMATED_FRAMING_OVERHEAD)
                .saturating_sub(WRITE_HEADER_OVERHEAD);
            data.len() <= budget
        };

        if fits_whole {
            let cmd = QueueCommand {
                family: crate::queue::command::CommandFamily::TableWrite,
                number: table_id,
                id: 0,
                service_code: table::SVC_WRITE,
                service_body: table::encode_write_request(table_id, data),
            };
            match self.submit_batch(vec![cmd]).await {
                Ok(responses) => {
                    self.expect_ok(&responses, "TableWrite")?;
                    return Ok(());
                },
                Err(EngineError::NegotiatedSizeExceeded { .. }) => {
                    debug!("full write no longer fits after renegotiation, falling back to partial writes");
                },
                Err(e) => return Err(e),
            }
        }

        self.write_table_partial_chunks(table_id, data).await
    }

    /// Drives `data` to `table_id` as a sequence of `TableWritePartial`
    /// chunks, sized off the negotiated outgoing APDU at the time each chunk
    /// is sent and re-planned smaller whenever [`EngineError::NegotiatedSizeExceeded`]
    /// comes back from an attempt (§4.J).
    async fn write_table_partial_chunks(&self, table_id: u16, data: &[u8]) -> Result<(), EngineError> {
        let total = data.len() as u32;
        let mut written = 0u32;

        while written < total {
            let chunk_budget = {
                let session = self.session.lock().await;
                let from_apdu = (session.max_apdu_out as usize)
                    .saturating_sub(planner::ESTIMATED_FRAMING_OVERHEAD)
                    .saturating_sub(WRITE_PARTIAL_HEADER_OVERHEAD);
                from_apdu
                    .min(self.cfg.behavior.max_partial_write_table_size as usize)
                    .min(u16::MAX as usize)
                    .max(1)
            };
            let remaining = &data[written as usize..];
            // Only the next chunk is taken; the rest of the plan is
            // discarded and re-derived next iteration, since the budget may
            // shrink again before it is sent.
            let next = partial::plan_write_chunks(remaining.len(), written, chunk_budget)
                .into_iter()
                .next()
                .expect("remaining is non-empty and chunk_budget is at least 1");
            let chunk = &remaining[next.start..next.start + next.len];

            let cmd = QueueCommand {
                family: crate::queue::command::CommandFamily::TableWrite,
                number: table_id,
                id: 0,
                service_code: table::SVC_WRITE_PARTIAL,
                service_body: table::encode_write_partial_request(table_id, next.offset, chunk),
            };

            match self.submit_batch(vec![cmd]).await {
                Ok(responses) => {
                    self.expect_ok(&responses, "TableWritePartial")?;
                    written += next.len as u32;
                    self.monitor.on_partial_progress(written, total);
                },
                Err(EngineError::NegotiatedSizeExceeded { .. }) => {
                    // Session size already shrank; loop again and recompute a
                    // smaller chunk from the new negotiated size.
                    debug!(written, total, "partial write chunk still too large, re-planning smaller");
                    continue;
                },
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Reads a full table in one `TableRead`, with no assumption about its
    /// length. For tables whose length is known up front and may exceed a
    /// single response, use [`Engine::read_table_sized`] instead.
    #[instrument(skip(self))]
    pub async fn read_table(&self, table_id: u16) -> Result<Vec<u8>, EngineError> {
        let cmd = QueueCommand {
            family: crate::queue::command::CommandFamily::TableRead,
            number: table_id,
            id: 0,
            service_code: table::SVC_READ,
            service_body: table::encode_read_request(table_id),
        };
        let responses = self.submit_batch(vec![cmd]).await?;
        let resp = responses.first().ok_or(EngineError::UnmatchedResponse(0))?;
        let parsed = table::parse_read_response(&resp.response_body)
            .map_err(|_| EngineError::Wire(crate::error::WireError::ChecksumMismatch))?;
        Ok(parsed.data)
    }

    /// Reads `expected_len` bytes from `table_id`, transparently decomposing
    /// into `TableReadPartial` chunks when the expected length does not fit
    /// a single response at the negotiated incoming size (§4.J). Reports
    /// progress to the configured monitor after each chunk.
    #[instrument(skip(self))]
    pub async fn read_table_sized(&self, table_id: u16, expected_len: u32) -> Result<Vec<u8>, EngineError> {
        let fits_whole = {
            let session = self.session.lock().await;
            let budget = (session.max_apdu_in as usize)
                .saturating_sub(planner::ESTIMATED_FRAMING_OVERHEAD)
                .saturating_sub(3);
            (expected_len as usize) <= budget
        };
        if fits_whole {
            return self.read_table(table_id).await;
        }

        let mut assembler = ReadAssembler::new(expected_len);
        let mut offset = 0u32;

        while offset < expected_len {
            let chunk_budget = {
                let session = self.session.lock().await;
                let from_apdu = (session.max_apdu_in as usize)
                    .saturating_sub(planner::ESTIMATED_FRAMING_OVERHEAD)
                    .saturating_sub(READ_PARTIAL_HEADER_OVERHEAD);
                from_apdu
                    .min(self.cfg.behavior.max_partial_read_table_size as usize)
                    .min(u16::MAX as usize)
                    .max(1)
            };
            let next = partial::plan_read_chunks(expected_len - offset, chunk_budget as u32)
                .into_iter()
                .next()
                .expect("offset < expected_len and chunk_budget is at least 1");

            let cmd = QueueCommand {
                family: crate::queue::command::CommandFamily::TableRead,
                number: table_id,
                id: 0,
                service_code: table::SVC_READ_PARTIAL,
                service_body: table::encode_read_partial_request(table_id, offset, next.length),
            };

            match self.submit_batch(vec![cmd]).await {
                Ok(responses) => {
                    let resp = responses.first().ok_or(EngineError::UnmatchedResponse(0))?;
                    let parsed = table::parse_read_response(&resp.response_body)
                        .map_err(|_| EngineError::Wire(crate::error::WireError::ChecksumMismatch))?;
                    offset += parsed.data.len() as u32;
                    let progress = assembler.push_chunk(&parsed.data);
                    self.monitor.on_partial_progress(progress.done, progress.total);
                },
                Err(EngineError::NegotiatedSizeExceeded { .. }) => {
                    debug!(offset, expected_len, "partial read chunk still too large, re-planning smaller");
                    continue;
                },
                Err(e) => return Err(e),
            }
        }

        Ok(assembler.into_data())
    }

    /// Issues a single raw `TableReadPartial` (§4.J low-level primitive),
    /// without any chunk planning.
    #[instrument(skip(self))]
    pub async fn table_read_partial(
        &self,
        table_id: u16,
        offset: u32,
        length: u16,
    ) -> Result<Vec<u8>, EngineError> {
        let cmd = QueueCommand {
            family: crate::queue::command::CommandFamily::TableRead,
            number: table_id,
            id: 0,
            service_code: table::SVC_READ_PARTIAL,
            service_body: table::encode_read_partial_request(table_id, offset, length),
        };
        let responses = self.submit_batch(vec![cmd]).await?;
        let resp = responses.first().ok_or(EngineError::UnmatchedResponse(0))?;
        let parsed = table::parse_read_response(&resp.response_body)
            .map_err(|_| EngineError::Wire(crate::error::WireError::ChecksumMismatch))?;
        Ok(parsed.data)
    }

    /// Issues a single raw `TableWritePartial` (§4.J low-level primitive),
    /// without any chunk planning.
    #[instrument(skip(self, data))]
    pub async fn table_write_partial(&self, table_id: u16, data: &[u8], offset: u32) -> Result<(), EngineError> {
        let cmd = QueueCommand {
            family: crate::queue::command::CommandFamily::TableWrite,
            number: table_id,
            id: 0,
            service_code: table::SVC_WRITE_PARTIAL,
            service_body: table::encode_write_partial_request(table_id, offset, data),
        };
        let responses = self.submit_batch(vec![cmd]).await?;
        self.expect_ok(&responses, "TableWritePartial")?;
        Ok(())
    }

    #[instrument(skip(self, parameters))]
    pub async fn call_procedure(
        &self,
        procedure_number: u16,
        sequence_number: u8,
        parameters: &[u8],
    ) -> Result<ProcedureResult, EngineError> {
        let st7 = QueueCommand {
            family: crate::queue::command::CommandFamily::Procedure,
            number: procedure_number,
            id: 0,
            service_code: table::SVC_WRITE,
            service_body: procedure::build_st7_table_write(
                procedure_number,
                sequence_number,
                parameters,
            ),
        };
        let responses = self.submit_batch(vec![st7]).await?;
        self.expect_ok(&responses, "ST7")?;

        loop {
            let st8 = QueueCommand {
                family: crate::queue::command::CommandFamily::Procedure,
                number: procedure::PROCEDURE_RESPONSE_TABLE,
                id: 0,
                service_code: table::SVC_READ,
                service_body: procedure::build_st8_table_read(),
            };
            let responses = self.submit_batch(vec![st8]).await?;
            let resp = responses.first().ok_or(EngineError::UnmatchedResponse(0))?;
            let table_response = table::parse_read_response(&resp.response_body)
                .map_err(|_| EngineError::Wire(crate::error::WireError::ChecksumMismatch))?;
            let st8_parsed = procedure::parse_st8(&table_response.data)
                .map_err(|_| EngineError::Epsem(crate::error::EpsemError::TruncatedService))?;

            let mut counters = self.retry_counters.lock().await;
            let disposition = crate::retry::evaluate_procedure_result(
                &self.cfg,
                &mut counters,
                st8_parsed.result_code,
                self.monitor.as_ref(),
            );
            drop(counters);

            match disposition {
                Disposition::Accept => {
                    return Ok(ProcedureResult {
                        sequence_number: st8_parsed.sequence_number,
                        data: st8_parsed.data,
                    });
                },
                Disposition::RetryProcedure => {
                    tokio::time::sleep(self.cfg.retry.application_layer_procedure_retry_delay)
                        .await;
                    continue;
                },
                _ => {
                    return Err(EngineError::ProcedureRetriesExhausted(
                        self.cfg.retry.application_layer_procedure_retries,
                    ));
                },
            }
        }
    }

    fn expect_ok(&self, responses: &[CorrelatedResponse], op: &'static str) -> Result<(), EngineError> {
        let resp = responses.first().ok_or(EngineError::UnmatchedResponse(0))?;
        let code = C12ServiceResponse::try_from(resp.response_code)
            .unwrap_or(C12ServiceResponse::Err_);
        if code.is_ok() {
            Ok(())
        } else {
            Err(EngineError::C12(crate::error::C12Error::ServiceResponse {
                operation: op,
                response: code,
            }))
        }
    }

    /// Plans `commands` into one or more APDUs and exchanges each in turn,
    /// applying the retry arbitrator's RQTL/RSTL renegotiation and
    /// application-layer retry decisions before moving to the next batch.
    pub async fn submit_batch(
        &self,
        commands: Vec<QueueCommand>,
    ) -> Result<Vec<CorrelatedResponse>, EngineError> {
        let max_out = {
            let session = self.session.lock().await;
            if session.max_apdu_out > crate::cfg::config::LEGACY_APDU_THRESHOLD
                && session.max_apdu_in > crate::cfg::config::LEGACY_APDU_THRESHOLD
            {
                debug!(
                    max_apdu_out = session.max_apdu_out,
                    max_apdu_in = session.max_apdu_in,
                    "both directions exceed the legacy threshold, capping outgoing batches to the legacy header size"
                );
                crate::cfg::config::LEGACY_HEADER_SIZE
            } else {
                session.max_apdu_out
            }
        };
        let batches = planner::plan_batches(commands, max_out);

        // Hold off the keeper for the whole batch, not just the wire
        // exchange, so it never interleaves a beat between two APDUs of the
        // same logical request.
        let keeper = self.keep_alive.lock().await.clone();
        let _suspend = match &keeper {
            Some(h) => Some(h.suspend().await),
            None => None,
        };

        let mut all = Vec::new();
        for batch in batches {
            let responses = self.exchange_with_retry(batch).await?;
            all.extend(responses);
        }
        Ok(all)
    }

    async fn exchange_with_retry(
        &self,
        mut apdu: PlannedApdu,
    ) -> Result<Vec<CorrelatedResponse>, EngineError> {
        loop {
            let (control, services) = self.exchange_apdu(&apdu).await?;
            let _ = control;

            let first_code = services
                .first()
                .and_then(|s| C12ServiceResponse::try_from(s.code).ok());

            if let Some(code) = first_code {
                // RQTL/RSTL carry the peer's proposed size as 1-4 big-endian
                // bytes, not as their own length (§4.G).
                let peer_echoed_size = services.first().and_then(|s| {
                    if s.body.is_empty() {
                        None
                    } else {
                        Some(s.body.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32))
                    }
                });

                let mut session = self.session.lock().await;
                let mut counters = self.retry_counters.lock().await;
                let disposition = crate::retry::evaluate_service_response(
                    &self.cfg,
                    &mut session,
                    &mut counters,
                    code,
                    peer_echoed_size,
                    self.monitor.as_ref(),
                );
                drop(session);
                drop(counters);

                match disposition {
                    Disposition::RenegotiateAndRetry => {
                        let (still_fits, needed, available) = {
                            let session = self.session.lock().await;
                            let needed: usize = apdu
                                .commands
                                .iter()
                                .map(QueueCommand::packed_size)
                                .sum::<usize>()
                                + planner::ESTIMATED_FRAMING_OVERHEAD;
                            (needed as u32 <= session.max_apdu_out, needed, session.max_apdu_out)
                        };
                        if !still_fits {
                            // The renegotiated size is already as small as the
                            // peer will allow; resending this exact batch
                            // again would only repeat the same RQTL. The
                            // caller (§4.J) is expected to re-plan with a
                            // smaller chunk size instead of retrying here.
                            debug!(needed, available, "renegotiated size still too small for this batch");
                            return Err(EngineError::NegotiatedSizeExceeded { needed, available });
                        }
                        debug!(?disposition, code = %code, "retrying batch");
                        tokio::time::sleep(self.cfg.retry.application_layer_retry_delay).await;
                        continue;
                    },
                    Disposition::RetryApplication => {
                        debug!(?disposition, code = %code, "retrying batch");
                        tokio::time::sleep(self.cfg.retry.application_layer_retry_delay).await;
                        continue;
                    },
                    Disposition::Fatal { drop_session } => {
                        warn!(code = %code, drop_session, "fatal application-layer response");
                        if drop_session {
                            self.session.lock().await.drop_to_connected();
                        }
                        return Err(EngineError::C12(crate::error::C12Error::ServiceResponse {
                            operation: "batch",
                            response: code,
                        }));
                    },
                    Disposition::Accept | Disposition::RetryProcedure => {},
                }
            }

            let mut counters = self.retry_counters.lock().await;
            counters.reset();
            drop(counters);

            let commands = std::mem::take(&mut apdu.commands);
            let apdu_for_correlation = PlannedApdu { commands };
            return planner::correlate_responses(&apdu_for_correlation, &services)
                .map_err(|_| EngineError::UnmatchedResponse(0));
        }
    }

    async fn exchange_apdu(
        &self,
        apdu: &PlannedApdu,
    ) -> Result<(ControlByte, Vec<Service>), EngineError> {
        let security_mode = self.cfg.security.security_mode;
        let response_control = self.cfg.security.response_control;
        let control = ControlByte::new(
            false,
            false,
            false,
            security_mode.wire_bits(),
            response_control.wire_bits(),
        );

        let plaintext_body = apdu.build_epsem_body(control);

        // Never reused across APDUs within a session: the peer is required
        // to echo this back as its called-invocation-id, which is the basis
        // of the tampering check below (§4.D).
        let calling_invocation_id = self.invocation_id_gen.next();

        let mut header = AcseHeader {
            application_context: self.cfg.identity.application_context.clone(),
            called_ap_title: Some(self.cfg.identity.called_ap_title.clone()),
            called_ap_invocation_id: None,
            calling_ap_title: Some(self.cfg.identity.calling_ap_title.clone()),
            calling_ae_qualifier: self.cfg.identity.calling_ae_qualifier,
            calling_ap_invocation_id: Some(calling_invocation_id),
            calling_authentication_value: None,
        };

        let outgoing_body = if security_mode.is_authenticated() {
            let (key, key_id) = {
                let session = self.session.lock().await;
                self.active_key(&session)?
            };
            let iv = self.iv_gen.next();
            let calling_title_octets = crate::wire::ber::encode_uid_body(
                &self.cfg.identity.calling_ap_title,
            )
            .unwrap_or_default();
            let nonce = eax::build_nonce(iv, &calling_title_octets);

            header.calling_authentication_value =
                Some(acse::encode_authentication_value(key_id, iv));

            let mut body = plaintext_body[1..].to_vec();
            let total_body_len = 1 + body.len() + eax::TAG_SIZE;
            let aad = canonified_header(
                &header,
                &control,
                total_body_len,
                key_id,
                iv,
                &body,
                security_mode,
            );

            let tag = if security_mode.is_ciphered() {
                eax::encrypt_in_place(&key, &nonce, &aad, &mut body)
            } else {
                eax::authenticate(&key, &nonce, &aad, &body)
            };

            let mut out = vec![control.bits()];
            out.extend_from_slice(&body);
            out.extend_from_slice(&tag);
            out
        } else {
            plaintext_body
        };

        let wire_bytes = header.encode(&outgoing_body);
        self.monitor.on_apdu_sent(wire_bytes.len());
        self.channel
            .write_apdu(&wire_bytes)
            .await
            .map_err(|_| EngineError::ChannelWriteTimeout(self.cfg.runtime.write_timeout))?;

        let response_bytes = self
            .channel
            .read_apdu(self.cfg.runtime.receive_timeout)
            .await
            .map_err(|_| EngineError::ChannelReadTimeout(self.cfg.runtime.receive_timeout))?;
        self.monitor.on_apdu_received(response_bytes.len());

        let (resp_header, resp_body) = AcseHeader::parse(&response_bytes)
            .map_err(|e| EngineError::Acse(crate::error::AcseError::Wire(
                crate::error::WireError::Ber(match e {
                    crate::acse::AcseError::Ber(b) => b,
                    _ => crate::wire::ber::BerError::LengthTooLong,
                }),
            )))?;

        if self.is_tampered(&resp_header, calling_invocation_id, security_mode) {
            warn!("ACSE response failed tampering checks");
            if self.cfg.retry.end_session_on_application_layer_error {
                self.session.lock().await.drop_to_connected();
            }
            return Err(EngineError::TamperingDetected);
        }

        let (control, body) = if security_mode.is_authenticated() {
            let mut session = self.session.lock().await;
            self.unprotect(&mut session, &resp_header, &resp_body, security_mode)?
        } else {
            let control = ControlByte::from_bits_truncate(
                *resp_body.first().ok_or(EngineError::Wire(
                    crate::error::WireError::FrameLengthMismatch { declared: 1, actual: 0 },
                ))?,
            );
            (control, resp_body[1..].to_vec())
        };

        let services = epsem::parse_response_services(
            &{
                let mut full = vec![control.bits()];
                full.extend_from_slice(&body);
                full
            },
            |i| {
                apdu.commands
                    .get(i)
                    .is_some_and(|c| matches!(c.service_code, table::SVC_READ | table::SVC_READ_PARTIAL))
            },
        )
        .map_err(|_| EngineError::Epsem(crate::error::EpsemError::TruncatedService))?
        .1;

        Ok((control, services))
    }

    /// Verifies the response's echoed invocation id and AP titles against
    /// what this request sent (§4.D "Tampering checks"). A C12.22 peer is
    /// required to echo `calling_invocation_id` back as its
    /// called-invocation-id and to swap AP-title roles; anything else means
    /// the response does not belong to this exchange. A response that omits
    /// the calling-authentication-value element entirely when this request
    /// was sent under a non-clear security mode is flagged the same way: an
    /// insecure response to a secure request is tampering, not a key/crypto
    /// failure.
    fn is_tampered(
        &self,
        resp_header: &AcseHeader,
        calling_invocation_id: u32,
        security_mode: crate::cfg::enums::SecurityMode,
    ) -> bool {
        if resp_header.called_ap_invocation_id != Some(calling_invocation_id) {
            return true;
        }
        if resp_header.calling_ap_title.as_deref() != Some(self.cfg.identity.called_ap_title.as_str()) {
            return true;
        }
        if resp_header.called_ap_title.as_deref() != Some(self.cfg.identity.calling_ap_title.as_str()) {
            return true;
        }
        if security_mode.is_authenticated() && resp_header.calling_authentication_value.is_none() {
            return true;
        }
        false
    }

    /// Verifies and, if ciphered, decrypts an incoming APDU body. Tries the
    /// session's remembered working key first, then falls through the rest
    /// of the configured key list, remembering whichever one verifies
    /// (§4.F "Security-key list fallback").
    fn unprotect(
        &self,
        session: &mut SessionState,
        header: &AcseHeader,
        body: &[u8],
        security_mode: crate::cfg::enums::SecurityMode,
    ) -> Result<(ControlByte, Vec<u8>), EngineError> {
        let ac = header
            .calling_authentication_value
            .as_ref()
            .ok_or(EngineError::Crypto(crate::error::CryptoLayerError::NoKeyConfigured))?;
        let (wire_key_id, iv) = acse::decode_authentication_value(ac)
            .map_err(|_| EngineError::Crypto(crate::error::CryptoLayerError::NoKeyConfigured))?;

        if body.len() < 1 + eax::TAG_SIZE {
            return Err(EngineError::Wire(crate::error::WireError::FrameLengthMismatch {
                declared: 1 + eax::TAG_SIZE,
                actual: body.len(),
            }));
        }
        let control = ControlByte::from_bits_truncate(body[0]);
        let tag_start = body.len() - eax::TAG_SIZE;
        let mut ciphertext = body[1..tag_start].to_vec();
        let tag = &body[tag_start..];

        let calling_title_octets = header
            .calling_ap_title
            .as_deref()
            .and_then(|t| crate::wire::ber::encode_uid_body(t).ok())
            .unwrap_or_default();
        let nonce = eax::build_nonce(iv, &calling_title_octets);
        let aad = canonified_header(
            header,
            &control,
            body.len(),
            wire_key_id,
            iv,
            &ciphertext,
            security_mode,
        );

        let keys = &self.cfg.security.security_key_list;
        if keys.is_empty() {
            return Err(EngineError::Crypto(crate::error::CryptoLayerError::NoKeyConfigured));
        }
        let mut order: Vec<usize> = Vec::with_capacity(keys.len());
        if let Some(idx) = session.successful_security_key_index {
            if idx < keys.len() {
                order.push(idx);
            }
        }
        let rest: Vec<usize> = (0..keys.len()).filter(|i| !order.contains(i)).collect();
        order.extend(rest);
        let reordered: Vec<SecretBytes> = order.iter().map(|&i| keys[i].clone()).collect();

        let mut verified_key: Option<EaxKey> = None;
        let matched = security::try_security_key_fallback(&reordered, |candidate| {
            let key = EaxKey::new(candidate.as_slice())
                .map_err(|e| EngineError::Crypto(crate::error::CryptoLayerError::Crypto(e)))?;
            let ok = eax::verify(&key, &nonce, &aad, &ciphertext, tag).is_ok();
            if ok {
                verified_key = Some(key);
            }
            Ok(ok)
        })?;

        let matched = matched.ok_or_else(|| {
            warn!("EAX tag verification failed against every configured security key");
            EngineError::Crypto(crate::error::CryptoLayerError::AllKeysRejected(keys.len()))
        })?;
        let key = verified_key.ok_or(EngineError::Crypto(crate::error::CryptoLayerError::NoKeyConfigured))?;
        session.successful_security_key_index = Some(order[matched]);

        if security_mode.is_ciphered() {
            eax::decrypt_in_place(&key, &nonce, &aad, &mut ciphertext);
        }

        Ok((control, ciphertext))
    }

    /// Picks the outgoing encryption key: the session's remembered working
    /// key once one has verified a response, otherwise the configured
    /// default (§4.F).
    fn active_key(&self, session: &SessionState) -> Result<(EaxKey, u8), EngineError> {
        let key_id = session
            .successful_security_key_index
            .and_then(|idx| u8::try_from(idx).ok())
            .unwrap_or(self.cfg.security.key_id);
        self.key_by_id(key_id)
    }

    fn key_by_id(&self, key_id: u8) -> Result<(EaxKey, u8), EngineError> {
        let entry: &SecretBytes = self
            .cfg
            .security
            .security_key_list
            .get(key_id as usize)
            .or_else(|| self.cfg.security.security_key_list.first())
            .ok_or(EngineError::Crypto(crate::error::CryptoLayerError::NoKeyConfigured))?;
        let key = EaxKey::new(entry.as_slice())
            .map_err(|e| EngineError::Crypto(crate::error::CryptoLayerError::Crypto(e)))?;
        Ok((key, key_id))
    }
}

/// Drives one keep-alive beat by calling back into the engine it belongs
/// to, holding an `Arc` so the background task can outlive the caller that
/// spawned it.
struct EngineKeepAliveAction<C: Channel + 'static> {
    engine: Arc<Engine<C>>,
}

impl<C: Channel + 'static> keepalive::KeepAliveAction for EngineKeepAliveAction<C> {
    async fn beat(&self) -> Result<(), EngineError> {
        if self.engine.cfg.keep_alive.use_read_in_keep_session_alive {
            self.engine.read_table(1).await?;
        } else {
            let responses = self
                .engine
                .submit_batch(vec![QueueCommand {
                    family: crate::queue::command::CommandFamily::TableWrite,
                    number: 0,
                    id: 0,
                    service_code: security::SVC_WAIT,
                    service_body: security::encode_wait(1),
                }])
                .await?;
            self.engine.expect_ok(&responses, "Wait")?;
        }
        Ok(())
    }
}

/// Builds the EAX canonified cleartext / associated data (§4.C): the A1/A2/
/// [A4]/[A7]/A8 ACSE elements as real encoded bytes in ascending tag order,
/// the calling-authentication-value element's raw form (key id and IV only -
/// the MAC is never part of it), the user-information wrapper through the
/// EPSEM control byte, the A6 calling-AP-title element, one key-id byte, the
/// 4-byte IV, and - clear+auth only - the plaintext EPSEM body. Grounded in
/// the canonified-cleartext assembly order traced through the original
/// protocol engine's send/receive paths: the wrapper-through-control range
/// is captured before the A6 element and the authentication value are
/// folded in, so it never includes them.
#[allow(clippy::too_many_arguments)]
fn canonified_header(
    header: &AcseHeader,
    control: &ControlByte,
    total_body_len: usize,
    key_id: u8,
    iv: u32,
    plaintext_services: &[u8],
    security_mode: crate::cfg::enums::SecurityMode,
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
        out.extend_from_slice(&crate::wire::ber::encode_length(ac_content.len()));
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
