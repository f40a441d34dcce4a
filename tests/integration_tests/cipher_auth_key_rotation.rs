// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scenario 2 (spec.md §8): cipher+auth sessionless read where the peer's
//! responses are only genuinely protected under the *second* entry of the
//! configured security-key list, exercising the §4.F fallback.

use c1222_client::{
    cfg::enums::SecurityMode, crypto::eax::EaxKey, engine::Engine, epsem::ControlByte,
};

use crate::common::{MockChannel, base_config, protected_response, secret, table_read_ok_body};

#[tokio::test]
async fn settles_on_the_matching_key_and_remembers_it() {
    let mut cfg = base_config();
    cfg.security.security_mode = SecurityMode::CipherAuth;
    cfg.security.key_id = 0;
    let wrong_key = [0x11u8; 16];
    let real_key = [0x22u8; 16];
    cfg.security.security_key_list = vec![secret(&wrong_key), secret(&real_key)];

    let channel = MockChannel::new();
    let data = vec![0xAA, 0xBB, 0xCC];
    let key = EaxKey::new(&real_key).unwrap();

    for iv in [1u32, 2u32] {
        let cfg = cfg.clone();
        let key = key.clone();
        let data = data.clone();
        channel.push_response(move |req| {
            protected_response(
                &cfg,
                req,
                &key,
                1,
                SecurityMode::CipherAuth,
                iv,
                Some(iv + 1000),
                ControlByte::new(false, false, false, SecurityMode::CipherAuth.wire_bits(), 0),
                &[(0x00, table_read_ok_body(&data))],
            )
        });
    }

    let engine = Engine::new(cfg, channel);
    engine.connect().await;
    engine.start_session().await.unwrap();

    assert_eq!(engine.successful_security_key_index().await, None);

    let first = engine.read_table(1).await.unwrap();
    assert_eq!(first, data);
    assert_eq!(engine.successful_security_key_index().await, Some(1));

    let second = engine.read_table(1).await.unwrap();
    assert_eq!(second, data);
    assert_eq!(engine.successful_security_key_index().await, Some(1));
}
