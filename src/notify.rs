//! Notifier sink (C9) — best-effort fan-out of lifecycle events.
//!
//! An opaque `Notify(event)` interface (spec §4.8); out-of-scope per spec
//! §1 ("SNS/Webhook transport... treated as an opaque `Notify(event)`
//! sink"). Grounded on the teacher's trait-boundary style (`TokenStore`,
//! `PolicySource`): one trait, one in-tree reference implementation.

use async_trait::async_trait;

/// The lifecycle events a [`Notifier`] may be asked to deliver (spec §4.8).
#[derive(Debug, Clone)]
pub enum Event {
    RequestCreated { request_id: String },
    RequestApproved { request_id: String },
    RequestDenied { request_id: String },
    RequestCancelled { request_id: String },
    BreakGlassActivated { event_id: String },
    BreakGlassClosed { event_id: String },
    SessionRevoked { session_id: String },
}

/// A single notification transport. Implementations are independent and
/// substitutable (spec §9 "Dynamic dispatch").
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &Event) -> crate::Result<()>;
}

/// Composes a list of [`Notifier`]s, dispatching to all of them. Every
/// notifier's error is logged and never fails the primary operation (spec
/// §4.8: "All dispatch is best-effort").
pub struct CompositeNotifier {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl CompositeNotifier {
    #[must_use]
    pub fn new(notifiers: Vec<Box<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    /// Fan out `event` to every configured notifier in order. Ordering
    /// between distinct notifiers is unspecified by the spec; this
    /// implementation dispatches them in configured order for determinism
    /// in tests, but callers must not rely on it across notifiers.
    pub async fn notify(&self, event: &Event) {
        for notifier in &self.notifiers {
            if let Err(error) = notifier.notify(event).await {
                tracing::warn!(?error, "notifier delivery failed");
            }
        }
    }
}

/// An in-memory [`Notifier`] recording every event it receives, for tests
/// and local/dev deployments with no external transport configured.
#[derive(Default)]
pub struct RecordingNotifier {
    events: parking_lot::Mutex<Vec<String>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &Event) -> crate::Result<()> {
        self.events.lock().push(format!("{event:?}"));
        Ok(())
    }
}
