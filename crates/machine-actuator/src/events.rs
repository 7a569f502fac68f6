//! Kubernetes events for lifecycle outcomes

use std::fmt;

use crds::Machine;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

/// Controller name reported on emitted events
pub const REPORTING_CONTROLLER: &str = "ssh-machine-controller";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Normal => f.write_str("Normal"),
            EventKind::Warning => f.write_str("Warning"),
        }
    }
}

/// Notifications attached to a Machine.
///
/// Publishing is best effort: failures are logged, never returned.
#[async_trait::async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, machine: &Machine, kind: EventKind, reason: &str, note: &str);
}

/// [`EventRecorder`] writing `events.k8s.io` events
#[derive(Clone)]
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: REPORTING_CONTROLLER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait::async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, machine: &Machine, kind: EventKind, reason: &str, note: &str) {
        let event = Event {
            type_: match kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: reason.to_string(),
            secondary: None,
        };

        if let Err(e) = self.recorder.publish(&event, &machine.object_ref(&())).await {
            warn!("Failed to publish {} event for machine {}: {}", reason, machine.key(), e);
        }
    }
}
