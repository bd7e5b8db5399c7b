//! Background tasks owned by the governor.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{Governor, Inner};

fn upgrade(inner: &Weak<Inner>) -> Option<Governor> {
    inner.upgrade().map(|inner| Governor { inner })
}

/// Re-evaluate every session each `period` until `lifecycle` is cancelled.
pub(super) fn spawn_ticker(
    inner: Weak<Inner>,
    period: Duration,
    lifecycle: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = lifecycle.cancelled() => break,
                _ = interval.tick() => {}
            }
            let Some(governor) = upgrade(&inner) else {
                break;
            };
            governor.recheck_now().await;
        }
        tracing::debug!("Budget ticker stopped");
    })
}

/// Run an emergency kill for each request on `kill_rx`.
///
/// Requests arriving while a kill is already in effect are dropped.
pub(super) fn spawn_kill_switch(
    inner: Weak<Inner>,
    mut kill_rx: mpsc::UnboundedReceiver<String>,
    lifecycle: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let reason = tokio::select! {
                biased;
                _ = lifecycle.cancelled() => break,
                reason = kill_rx.recv() => match reason {
                    Some(reason) => reason,
                    None => break,
                },
            };
            let Some(governor) = upgrade(&inner) else {
                break;
            };
            if governor.is_shutting_down().await {
                tracing::debug!(reason = %reason, "Kill already in effect");
                continue;
            }
            governor.emergency_kill(&reason).await;
        }
        tracing::debug!("Kill switch stopped");
    })
}
