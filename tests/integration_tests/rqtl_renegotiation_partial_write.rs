// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scenario 4 (spec.md §8): a `TableWrite` too large for the peer comes back
//! RQTL; the engine renegotiates down and re-plans the rest of the transfer
//! as `TableWritePartial` chunks sized off the new, smaller negotiated APDU.

use c1222_client::{engine::Engine, epsem::ControlByte};

use crate::common::{MockChannel, base_config, clear_response, ok_status};

#[tokio::test]
async fn rqtl_on_full_write_falls_back_to_sized_partial_chunks() {
    let mut cfg = base_config();
    cfg.session.initial_max_apdu_out = 8192;
    cfg.behavior.max_partial_write_table_size = 4096;

    let channel = MockChannel::new();
    let data = vec![0x5Au8; 4096];

    // First attempt: a single full `TableWrite` of 4096 bytes fits the
    // initial 8192-byte budget, so the engine tries it whole. The peer
    // rejects it with RQTL, proposing 1024 bytes.
    let cfg_for_rqtl = cfg.clone();
    channel.push_response(move |req| {
        clear_response(
            &cfg_for_rqtl,
            req,
            None,
            ControlByte::new(false, false, false, 0, 0),
            &[(0x0F, 1024u32.to_be_bytes().to_vec())],
        )
    });

    // Every subsequent `TableWritePartial` chunk, sized off the renegotiated
    // budget, is accepted.
    for _ in 0..5 {
        let cfg_for_chunk = cfg.clone();
        channel.push_response(move |req| {
            clear_response(
                &cfg_for_chunk,
                req,
                None,
                ControlByte::new(false, false, false, 0, 0),
                &[ok_status()],
            )
        });
    }

    let sent_log = channel.sent_log();
    let engine = Engine::new(cfg, channel);
    engine.connect().await;
    engine.start_session().await.unwrap();

    engine.write_table(1, &data).await.unwrap();

    let sent = sent_log.lock().unwrap().clone();
    // One rejected full attempt, then five accepted partial chunks
    // (904 bytes each for the first four, a 480-byte remainder last).
    assert_eq!(sent.len(), 6);
    assert!(sent[1].len() <= 1024, "first accepted chunk must honor the RQTL-proposed size");
    assert!(
        sent[5].len() < sent[2].len(),
        "the final chunk should be the shorter remainder, not a full-size one"
    );
}
