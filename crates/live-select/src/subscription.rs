//! Subscriber handles for live selects.

use std::sync::{Arc, Weak};

use sync_core::{Diff, Snapshot};
use tokio::sync::mpsc;

use crate::engine::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Notification delivered to a subscription.
#[derive(Debug, Clone)]
pub enum SelectEvent {
    /// The result changed. `data` is the complete new snapshot.
    Update {
        diff: Arc<Diff>,
        data: Arc<Snapshot>,
    },
    /// An execution failed. The previous snapshot stays current.
    Error(Arc<anyhow::Error>),
}

/// A caller's registration on a live select.
///
/// Dropping the handle stops it.
pub struct Subscription {
    id: SubscriptionId,
    engine: Weak<Engine>,
    events: mpsc::UnboundedReceiver<SelectEvent>,
    data: Arc<Snapshot>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        engine: Weak<Engine>,
        events: mpsc::UnboundedReceiver<SelectEvent>,
    ) -> Self {
        Self {
            id,
            engine,
            events,
            data: Arc::new(Snapshot::new()),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next notification.
    ///
    /// Returns `None` once the subscription has been stopped or the engine
    /// dropped, after everything already queued was delivered.
    pub async fn recv(&mut self) -> Option<SelectEvent> {
        let event = self.events.recv().await?;
        self.observe(&event);
        Some(event)
    }

    /// Next notification if one is already queued.
    pub fn try_recv(&mut self) -> Option<SelectEvent> {
        let event = self.events.try_recv().ok()?;
        self.observe(&event);
        Some(event)
    }

    fn observe(&mut self, event: &SelectEvent) {
        if let SelectEvent::Update { data, .. } = event {
            self.data = data.clone();
        }
    }

    /// Snapshot as of the last update received through this handle.
    pub fn data(&self) -> &Arc<Snapshot> {
        &self.data
    }

    /// Detach from the shared cache entry. The entry is dropped when its
    /// last subscription stops.
    ///
    /// Returns `false` if the subscription was already stopped.
    pub fn stop(&self) -> bool {
        match self.engine.upgrade() {
            Some(engine) => engine.lock().remove_subscription(self.id),
            None => false,
        }
    }

    pub fn active(&self) -> bool {
        self.engine
            .upgrade()
            .is_some_and(|engine| engine.lock().has_subscription(self.id))
    }

    /// Force a refresh of the underlying query, subject to throttling.
    pub fn invalidate(&self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.lock().invalidate_subscription(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("rows", &self.data.len())
            .finish()
    }
}
