//! Governor event channel.
//!
//! A typed broadcast stream of tier transitions, run lifecycle changes and
//! kill events. Each listener gets its own consumer task, so delivery order
//! per listener is publish order, and a failing or panicking listener only
//! affects itself.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::runs::RunId;

/// Buffered events per receiver before slow receivers start lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Discriminant of an [`EventPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Warning,
    Critical,
    Exceeded,
    Created,
    Ended,
    Aborted,
    Killed,
    Reset,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventPayload {
    Warning { total_spent: f64, session_cap: f64 },
    Critical { total_spent: f64, session_cap: f64 },
    Exceeded { total_spent: f64, session_cap: f64 },
    Created { run_id: RunId, participants: Vec<String> },
    Ended { run_id: RunId },
    Aborted {
        run_id: RunId,
        reason: String,
        /// Removed by the kill switch after the grace period rather than aborted directly.
        forced: bool,
    },
    Killed { reason: String, active_runs: usize },
    Reset { previous_total: f64 },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Warning { .. } => EventKind::Warning,
            Self::Critical { .. } => EventKind::Critical,
            Self::Exceeded { .. } => EventKind::Exceeded,
            Self::Created { .. } => EventKind::Created,
            Self::Ended { .. } => EventKind::Ended,
            Self::Aborted { .. } => EventKind::Aborted,
            Self::Killed { .. } => EventKind::Killed,
            Self::Reset { .. } => EventKind::Reset,
        }
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernorEvent {
    /// `None` for process-wide events such as the kill switch.
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl GovernorEvent {
    pub fn new(session_id: Option<&str>, payload: EventPayload) -> Self {
        Self {
            session_id: session_id.map(str::to_string),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Receives governor events on a dedicated consumer task.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Name used in logs when this listener fails.
    fn name(&self) -> &str {
        "listener"
    }

    /// Handle one event. Errors are logged and do not stop delivery.
    async fn on_event(&self, event: &GovernorEvent) -> anyhow::Result<()>;
}

/// Listener backed by a closure.
pub struct FnListener<F> {
    name: String,
    f: F,
}

/// Wrap a closure as an [`EventListener`].
pub fn listener_fn<F>(name: impl Into<String>, f: F) -> FnListener<F>
where
    F: Fn(&GovernorEvent) -> anyhow::Result<()> + Send + Sync,
{
    FnListener {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F> EventListener for FnListener<F>
where
    F: Fn(&GovernorEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_event(&self, event: &GovernorEvent) -> anyhow::Result<()> {
        (self.f)(event)
    }
}

/// Writes every event, serialized, to the tracing log at debug.
pub struct LoggingListener;

#[async_trait]
impl EventListener for LoggingListener {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_event(&self, event: &GovernorEvent) -> anyhow::Result<()> {
        let session_id = event.session_id.as_deref().unwrap_or("-");
        let payload = serde_json::to_string(&event.payload)?;
        tracing::debug!(
            session_id = %session_id,
            kind = ?event.kind(),
            event = %payload,
            "Governor event"
        );
        Ok(())
    }
}

/// Handle for a listener registered with [`EventBus::subscribe_listener`].
///
/// Dropping the handle unsubscribes the listener.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stop delivering events. Events not yet handled are discarded.
    pub fn unsubscribe(&self) {
        self.stop.cancel();
    }

    /// Wait for the consumer task to finish.
    ///
    /// Returns once the listener was unsubscribed or the channel was closed
    /// and every buffered event was delivered.
    pub async fn closed(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Multi-subscriber event channel owned and closed by the governor.
pub struct EventBus {
    sender: Mutex<Option<broadcast::Sender<GovernorEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(tx)),
        }
    }

    fn sender(&self) -> Option<broadcast::Sender<GovernorEvent>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: GovernorEvent) {
        match self.sender() {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => {
                tracing::debug!(kind = ?event.kind(), "Event dropped, channel closed");
            }
        }
    }

    /// Raw receiver. `None` once the bus is closed.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<GovernorEvent>> {
        self.sender().map(|tx| tx.subscribe())
    }

    /// Spawn a consumer task that feeds `listener`.
    pub fn subscribe_listener(&self, listener: Arc<dyn EventListener>) -> Subscription {
        let stop = CancellationToken::new();
        let Some(rx) = self.subscribe() else {
            return Subscription { stop, handle: None };
        };
        let handle = tokio::spawn(consume(rx, listener, stop.clone()));
        Subscription {
            stop,
            handle: Some(handle),
        }
    }

    /// Close the channel. Receivers drain what is buffered, then end.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

async fn consume(
    mut rx: broadcast::Receiver<GovernorEvent>,
    listener: Arc<dyn EventListener>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(listener = listener.name(), skipped, "Event listener lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        match AssertUnwindSafe(listener.on_event(&event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    listener = listener.name(),
                    kind = ?event.kind(),
                    error = %e,
                    "Event listener failed"
                );
            }
            Err(_) => {
                tracing::warn!(
                    listener = listener.name(),
                    kind = ?event.kind(),
                    "Event listener panicked"
                );
            }
        }
    }
}
