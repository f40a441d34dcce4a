// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Retry and failure arbitrator (§4.G): three independent retry counters,
//! size renegotiation on RQTL/RSTL, and the session-drop policy on fatal
//! application-layer errors.

use tracing::{debug, warn};

use crate::{
    c12::codes::C12ServiceResponse,
    cfg::config::{EngineConfig, RENEGOTIATION_MARGIN},
    channel::Monitor,
    error::EngineError,
    session::SessionState,
};

/// Outcome of evaluating one application-layer response against the retry
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Response is final; hand it back to the caller as-is.
    Accept,
    /// Retry the same request at the application layer.
    RetryApplication,
    /// Retry the same procedure call at the application layer.
    RetryProcedure,
    /// Resend with a smaller APDU; session state has already been shrunk.
    RenegotiateAndRetry,
    /// Fatal: surface the error and, per policy, drop the session.
    Fatal { drop_session: bool },
}

/// Tracks retry counters across the attempts for a single logical request.
#[derive(Debug, Default)]
pub struct RetryCounters {
    pub link_layer: u8,
    pub application_layer: u8,
    pub application_layer_procedure: u8,
}

impl RetryCounters {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Evaluates a table/security-service response code and decides what the
/// engine should do next, mutating `session` in place when a size
/// renegotiation is required.
pub fn evaluate_service_response(
    cfg: &EngineConfig,
    session: &mut SessionState,
    counters: &mut RetryCounters,
    response: C12ServiceResponse,
    peer_echoed_size: Option<u32>,
    monitor: &dyn Monitor,
) -> Disposition {
    if response.is_ok() {
        return Disposition::Accept;
    }

    match response {
        C12ServiceResponse::Rqtl => {
            if let Some(size) = peer_echoed_size {
                session.renegotiate_out(size, RENEGOTIATION_MARGIN);
            }
            debug!(new_size = session.max_apdu_out, "RQTL renegotiation");
            return Disposition::RenegotiateAndRetry;
        },
        C12ServiceResponse::Rstl => {
            if let Some(size) = peer_echoed_size {
                session.renegotiate_in(size, RENEGOTIATION_MARGIN);
            }
            debug!(new_size = session.max_apdu_in, "RSTL renegotiation");
            return Disposition::RenegotiateAndRetry;
        },
        _ => {},
    }

    if response.is_busy_or_not_ready() {
        if counters.application_layer < cfg.retry.application_layer_retries {
            counters.application_layer += 1;
            monitor.on_retry("application", counters.application_layer);
            return Disposition::RetryApplication;
        }
        return Disposition::Fatal {
            drop_session: should_drop_session(cfg, response),
        };
    }

    warn!(code = %response, "fatal application-layer response");
    Disposition::Fatal {
        drop_session: should_drop_session(cfg, response),
    }
}

/// Evaluates a procedure-call result code (ST7/ST8, §4.F), distinct from
/// ordinary table responses because it has its own retry counter.
pub fn evaluate_procedure_result(
    cfg: &EngineConfig,
    counters: &mut RetryCounters,
    result_code: u8,
    monitor: &dyn Monitor,
) -> Disposition {
    if result_code == 0 {
        return Disposition::Accept;
    }
    // Result code 1 ("not completed") is the only one the arbitrator
    // considers retryable; other codes are procedure-specific failures the
    // caller must interpret itself.
    if result_code == 1 {
        if counters.application_layer_procedure
            < cfg.retry.application_layer_procedure_retries
        {
            counters.application_layer_procedure += 1;
            monitor.on_retry("procedure", counters.application_layer_procedure);
            return Disposition::RetryProcedure;
        }
        return Disposition::Fatal { drop_session: false };
    }
    Disposition::Fatal { drop_session: false }
}

fn should_drop_session(cfg: &EngineConfig, response: C12ServiceResponse) -> bool {
    cfg.retry.end_session_on_application_layer_error
        && !response.keeps_session_alive_on_error()
}

pub fn disposition_to_error(disposition: Disposition, response: C12ServiceResponse) -> Option<EngineError> {
    match disposition {
        Disposition::Fatal { .. } => Some(EngineError::C12(crate::error::C12Error::ServiceResponse {
            operation: "service",
            response,
        })),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::NullMonitor;

    fn cfg_with_retries(app_retries: u8) -> EngineConfig {
        let mut cfg = crate::session::test_support::base_config_for_tests();
        cfg.retry.application_layer_retries = app_retries;
        cfg
    }

    #[test]
    fn busy_retries_until_exhausted_then_fatal() {
        let cfg = cfg_with_retries(2);
        let mut session = SessionState::new(&cfg);
        let mut counters = RetryCounters::default();
        let monitor = NullMonitor;

        for _ in 0..2 {
            let d = evaluate_service_response(
                &cfg,
                &mut session,
                &mut counters,
                C12ServiceResponse::Bsy,
                None,
                &monitor,
            );
            assert_eq!(d, Disposition::RetryApplication);
        }
        let d = evaluate_service_response(
            &cfg,
            &mut session,
            &mut counters,
            C12ServiceResponse::Bsy,
            None,
            &monitor,
        );
        assert!(matches!(d, Disposition::Fatal { .. }));
    }

    #[test]
    fn rqtl_shrinks_outgoing_size_and_requests_retry() {
        let cfg = cfg_with_retries(3);
        let mut session = SessionState::new(&cfg);
        let mut counters = RetryCounters::default();
        let monitor = NullMonitor;

        let d = evaluate_service_response(
            &cfg,
            &mut session,
            &mut counters,
            C12ServiceResponse::Rqtl,
            Some(100),
            &monitor,
        );
        assert_eq!(d, Disposition::RenegotiateAndRetry);
        assert!(session.max_apdu_out <= 100);
    }

    #[test]
    fn isss_fatal_keeps_session_per_exception_list() {
        let cfg = cfg_with_retries(0);
        let mut session = SessionState::new(&cfg);
        let mut counters = RetryCounters::default();
        let monitor = NullMonitor;

        let d = evaluate_service_response(
            &cfg,
            &mut session,
            &mut counters,
            C12ServiceResponse::Isss,
            None,
            &monitor,
        );
        assert_eq!(d, Disposition::Fatal { drop_session: false });
    }

    #[test]
    fn err_fatal_drops_session_by_default() {
        let cfg = cfg_with_retries(0);
        let mut session = SessionState::new(&cfg);
        let mut counters = RetryCounters::default();
        let monitor = NullMonitor;

        let d = evaluate_service_response(
            &cfg,
            &mut session,
            &mut counters,
            C12ServiceResponse::Err_,
            None,
            &monitor,
        );
        assert_eq!(d, Disposition::Fatal { drop_session: true });
    }
}
