use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why a credential was taken out of rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuarantineReason {
    RateLimit,
    Upstream5xx,
    Network,
    Manual,
}

/// Operational events observable by the app shell (logging, admin surfaces).
#[derive(Debug, Clone)]
pub enum Event {
    QuarantineStart {
        auth_id: String,
        provider: String,
        reason: QuarantineReason,
        until: SystemTime,
    },
    QuarantineEnd {
        auth_id: String,
    },
    AuthDisabled {
        auth_id: String,
        cause: String,
    },
    BindingsInvalidated {
        scope: String,
        auth_id: String,
        removed: usize,
    },
}

/// Broadcast fan-out for operational events. Dropping behind a slow
/// subscriber loses events, never blocks the selection path.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<Event>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(64)
    }
}
