// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scenario 5 (spec.md §8): the background keep-alive task sends exactly one
//! `Wait` once the negotiated session timeout minus its margin has elapsed,
//! and the session stays `InSession`.

use std::{sync::Arc, time::Duration};

use c1222_client::{engine::Engine, epsem::ControlByte, session::ConnectionState};

use crate::common::{MockChannel, base_config, clear_response, ok_status};

#[tokio::test(start_paused = true)]
async fn sends_one_wait_at_the_margin_and_stays_in_session() {
    let mut cfg = base_config();
    cfg.keep_alive.keep_session_alive = true;
    cfg.keep_alive.margin_secs = 2;
    cfg.session.session_timeout_request_secs = 6;

    let channel = MockChannel::new();
    let cfg_for_wait = cfg.clone();
    channel.push_response(move |req| {
        clear_response(
            &cfg_for_wait,
            req,
            None,
            ControlByte::new(false, false, false, 0, 0),
            &[ok_status()],
        )
    });
    let sent_log = channel.sent_log();

    let engine = Arc::new(Engine::new(cfg, channel));
    engine.connect().await;
    engine.start_session().await.unwrap();
    engine.spawn_keep_alive().await;

    // Period is session_timeout_request_secs(6) - margin_secs(2) = 4s.
    tokio::time::advance(Duration::from_secs(4)).await;
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }

    assert_eq!(sent_log.lock().unwrap().len(), 1);
    assert_eq!(engine.state().await, ConnectionState::InSession);
}
