// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Demo CLI: connects to a meter over plain TCP (ANSI C12.22 "Mode C"),
//! logs on if the configured identity is session-based, reads one table,
//! and prints its bytes as hex.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use c1222_client::{
    cfg::{cli::resolve_config_path, config::EngineConfig, logger::init_logger},
    channel::Channel,
    engine::Engine,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
};
use tracing::info;

struct TcpChannel {
    stream: Mutex<TcpStream>,
}

impl TcpChannel {
    async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        Ok(Self { stream: Mutex::new(stream) })
    }
}

impl Channel for TcpChannel {
    async fn write_apdu(&self, apdu: &[u8]) -> std::io::Result<()> {
        let mut stream = self.stream.lock().await;
        stream.write_all(apdu).await
    }

    async fn read_apdu(&self, timeout: Duration) -> std::io::Result<Vec<u8>> {
        let mut stream = self.stream.lock().await;
        tokio::time::timeout(timeout, read_one_apdu(&mut stream))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "APDU read timed out"))?
    }
}

/// Reads exactly one outer-tagged ACSE APDU off the stream: the tag byte,
/// the BER length octets, then that many body bytes.
async fn read_one_apdu(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut out = vec![0u8; 1];
    stream.read_exact(&mut out).await?;

    let mut first_len = [0u8; 1];
    stream.read_exact(&mut first_len).await?;
    out.push(first_len[0]);

    let body_len = if first_len[0] & 0x80 == 0 {
        first_len[0] as usize
    } else {
        let count = (first_len[0] & 0x7F) as usize;
        let mut len_bytes = vec![0u8; count];
        stream.read_exact(&mut len_bytes).await?;
        out.extend_from_slice(&len_bytes);
        len_bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize)
    };

    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await?;
    out.extend_from_slice(&body);
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        bail!(
            "usage: {} <engine-config.yaml> <log-config.yaml> <host:port> [table-id]",
            args.first().map(String::as_str).unwrap_or("c1222-cli")
        );
    }
    let engine_cfg_path = resolve_config_path(&args[1])?;
    let log_cfg_path = resolve_config_path(&args[2])?;
    let addr = &args[3];
    let table_id: u16 = args.get(4).map(|s| s.parse()).transpose()?.unwrap_or(1);

    let _guard = init_logger(
        log_cfg_path
            .to_str()
            .context("log config path is not valid UTF-8")?,
    )?;

    let cfg = EngineConfig::load_from_file(&engine_cfg_path)?;
    info!(%addr, table_id, "connecting to meter");

    let channel = TcpChannel::connect(addr).await?;
    let engine = Arc::new(Engine::new(cfg, channel));

    engine.connect().await;
    engine.start_session().await?;
    engine.spawn_keep_alive().await;

    let data = engine.read_table(table_id).await?;
    println!("table {table_id}: {}", hex::encode(&data));

    engine.end_session().await?;
    engine.disconnect().await;
    Ok(())
}
