// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Background session keep-alive task (§4.I).
//!
//! Sends a `Wait` (or, when configured, a partial read of table 1) shortly
//! before the negotiated session timeout would otherwise expire. The
//! engine suspends it cooperatively around any in-flight exchange of its
//! own via a mutex-guarded counter, rather than cancelling it outright:
//! callers on the main path and the keeper never race to write the same
//! APDU slot.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cfg::config::KeepAliveConfig;

/// Shared suspension gate: while `suspended > 0`, the keeper skips its
/// beat instead of racing a foreground exchange for the wire.
#[derive(Debug, Default)]
struct SuspendState {
    suspended: u32,
}

#[derive(Debug, Clone)]
pub struct KeepAliveHandle {
    state: Arc<Mutex<SuspendState>>,
    cancel: CancellationToken,
}

impl KeepAliveHandle {
    /// Raises the suspension count for the duration of `guard`'s lifetime,
    /// so a foreground request never interleaves with a keep-alive beat.
    pub async fn suspend(&self) -> SuspendGuard<'_> {
        let mut state = self.state.lock().await;
        state.suspended += 1;
        SuspendGuard { handle: self }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

pub struct SuspendGuard<'a> {
    handle: &'a KeepAliveHandle,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        let state = Arc::clone(&self.handle.state);
        tokio::spawn(async move {
            let mut state = state.lock().await;
            state.suspended = state.suspended.saturating_sub(1);
        });
    }
}

/// What the keeper should do on each beat, supplied by the engine since the
/// keeper itself has no notion of APDUs or channels.
pub trait KeepAliveAction: Send + Sync + 'static {
    fn beat(&self) -> impl Future<Output = Result<(), crate::error::EngineError>> + Send;
}

/// Spawns the background keep-alive task. Returns a handle used to suspend
/// it around foreground exchanges and to stop it on disconnect.
pub fn spawn<A: KeepAliveAction>(
    cfg: KeepAliveConfig,
    session_timeout_secs: u16,
    action: A,
) -> KeepAliveHandle {
    let cancel = CancellationToken::new();
    let state = Arc::new(Mutex::new(SuspendState::default()));
    let handle = KeepAliveHandle {
        state: Arc::clone(&state),
        cancel: cancel.clone(),
    };

    if !cfg.keep_session_alive {
        return handle;
    }

    let period = Duration::from_secs(
        (session_timeout_secs as u64).saturating_sub(cfg.margin_secs).max(1),
    );

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(period) => {},
            }

            let suspended = {
                let s = state.lock().await;
                s.suspended > 0
            };
            if suspended {
                debug!("keep-alive beat skipped, foreground exchange in flight");
                continue;
            }

            if let Err(e) = action.beat().await {
                warn!("keep-alive beat failed: {e}");
            }
        }
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAction(Arc<AtomicUsize>);

    impl KeepAliveAction for CountingAction {
        async fn beat(&self) -> Result<(), crate::error::EngineError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn disabled_config_never_spawns_a_beat() {
        let count = Arc::new(AtomicUsize::new(0));
        let cfg = KeepAliveConfig {
            keep_session_alive: false,
            use_read_in_keep_session_alive: false,
            margin_secs: 2,
        };
        let handle = spawn(cfg, 60, CountingAction(Arc::clone(&count)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn suspend_guard_increments_and_decrements() {
        let cfg = KeepAliveConfig {
            keep_session_alive: false,
            use_read_in_keep_session_alive: false,
            margin_secs: 2,
        };
        let handle = spawn(cfg, 60, CountingAction(Arc::new(AtomicUsize::new(0))));
        {
            let _guard = handle.suspend().await;
            let s = handle.state.lock().await;
            assert_eq!(s.suspended, 1);
        }
        // Guard's drop spawns the decrement; give it a tick to run.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let s = handle.state.lock().await;
        assert_eq!(s.suspended, 0);
    }
}
