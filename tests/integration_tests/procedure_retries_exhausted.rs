// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scenario 3 (spec.md §8): a procedure call whose ST8 result code never
//! turns to `0` (complete) is retried exactly
//! `application_layer_procedure_retries` times and then gives up.

use c1222_client::{engine::Engine, epsem::ControlByte, error::EngineError};

use crate::common::{MockChannel, base_config, clear_response, ok_status, st8_body, table_read_ok_body};

#[tokio::test]
async fn gives_up_after_the_configured_number_of_retries() {
    let mut cfg = base_config();
    cfg.retry.application_layer_procedure_retries = 3;

    let channel = MockChannel::new();

    // ST7 (the procedure-initiate write) is accepted once, up front.
    let cfg_for_st7 = cfg.clone();
    channel.push_response(move |req| {
        clear_response(
            &cfg_for_st7,
            req,
            None,
            ControlByte::new(false, false, false, 0, 0),
            &[ok_status()],
        )
    });

    // Every ST8 read reports result code 1 ("not completed"): one initial
    // attempt plus three retries, matching `application_layer_procedure_retries`.
    for _ in 0..4 {
        let cfg_for_st8 = cfg.clone();
        channel.push_response(move |req| {
            clear_response(
                &cfg_for_st8,
                req,
                None,
                ControlByte::new(false, false, false, 0, 0),
                &[(0x00, table_read_ok_body(&st8_body(0x01, 1, &[])))],
            )
        });
    }

    let engine = Engine::new(cfg, channel);
    engine.connect().await;
    engine.start_session().await.unwrap();

    let err = engine.call_procedure(9, 0x01, &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::ProcedureRetriesExhausted(3)));
}
