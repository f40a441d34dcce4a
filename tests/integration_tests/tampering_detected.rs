// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scenario 6 (spec.md §8): a response with a mismatched echoed invocation
//! id is rejected as tampering, and with
//! `end_session_on_application_layer_error` set, drops the session back to
//! `Connected`.

use c1222_client::{
    c12::codes::ErrorKind, engine::Engine, epsem::ControlByte, error::EngineError,
    session::ConnectionState,
};

use crate::common::{MockChannel, base_config, ok_status, tampered_clear_response};

#[tokio::test]
async fn mismatched_invocation_id_is_rejected_and_drops_the_session() {
    let mut cfg = base_config();
    cfg.retry.end_session_on_application_layer_error = true;

    let channel = MockChannel::new();
    let cfg_for_response = cfg.clone();
    channel.push_response(move |req| {
        tampered_clear_response(
            &cfg_for_response,
            req,
            ControlByte::new(false, false, false, 0, 0),
            &[ok_status()],
        )
    });

    let engine = Engine::new(cfg, channel);
    engine.connect().await;
    engine.start_session().await.unwrap();

    let err = engine.read_table(1).await.unwrap_err();
    assert!(matches!(err, EngineError::TamperingDetected));
    assert_eq!(err.kind(), ErrorKind::Security);
    assert_eq!(engine.state().await, ConnectionState::Connected);
}
