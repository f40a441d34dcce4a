// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scenario 1 (spec.md §8): sessionless, clear-mode read of a table.

use c1222_client::{engine::Engine, epsem::ControlByte};

use crate::common::{MockChannel, base_config, clear_response, table_read_ok_body};

#[tokio::test]
async fn sessionless_clear_read_returns_table_bytes() {
    let cfg = base_config();
    let channel = MockChannel::new();
    let data = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02];

    let cfg_for_response = cfg.clone();
    let data_for_response = data.clone();
    channel.push_response(move |req| {
        clear_response(
            &cfg_for_response,
            req,
            None,
            ControlByte::new(false, false, false, 0, 0),
            &[(0x00, table_read_ok_body(&data_for_response))],
        )
    });

    let engine = Engine::new(cfg, channel);
    engine.connect().await;
    engine.start_session().await.unwrap();

    let result = engine.read_table(1).await.unwrap();
    assert_eq!(result, data);
}
