/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Connection liveness.
//!
//! A [`HeartbeatMonitor`] ticks once per negotiated heartbeat interval. On
//! each tick it checks how long the connection has gone without inbound
//! traffic: past two intervals the connection is declared dead, otherwise
//! an empty frame is sent to keep the peer's view of us alive.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What a heartbeat monitor drives.
pub(crate) trait HeartbeatTarget: Send + Sync + 'static {
    /// Send an empty frame.
    fn send_heartbeat(&self);

    /// Nothing has been received for `silence`; the connection is dead.
    fn heartbeat_expired(&self, silence: Duration);
}

/// Time of the most recent inbound traffic. Shared between the reader,
/// which touches it, and the monitor, which reads it.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<Mutex<Instant>>);

impl Default for Liveness {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }
}

impl Liveness {
    /// Record inbound traffic.
    pub fn touch(&self) {
        *self.0.lock().unwrap() = Instant::now();
    }

    /// Time since the last inbound traffic.
    pub fn silence(&self) -> Duration {
        self.0.lock().unwrap().elapsed()
    }
}

/// A running heartbeat task. Dropping the monitor cancels it.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    period: Duration,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Start monitoring `target` every `period`. The task holds only a weak
    /// reference and exits once the target is gone.
    pub(crate) fn start<T: HeartbeatTarget>(
        target: Weak<T>,
        period: Duration,
        liveness: Liveness,
        runtime: &tokio::runtime::Handle,
    ) -> Self {
        let cancel = CancellationToken::new();
        runtime.spawn(run(target, period, liveness, cancel.clone()));
        Self { period, cancel }
    }

    /// The interval between checks.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stop the task. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the task has been told to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<T: HeartbeatTarget>(
    target: Weak<T>,
    period: Duration,
    liveness: Liveness,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => (),
        }
        let Some(target) = target.upgrade() else {
            break;
        };
        let silence = liveness.silence();
        if silence > period * 2 {
            tracing::warn!(
                silence = %humantime::format_duration(silence),
                period = %humantime::format_duration(period),
                "no inbound traffic; heartbeat expired"
            );
            target.heartbeat_expired(silence);
            break;
        }
        target.send_heartbeat();
    }
}
