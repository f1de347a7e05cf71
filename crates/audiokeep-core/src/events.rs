//! Context lifecycle events.
//!
//! Every [`ContextSource`](crate::ContextSource) broadcasts what its
//! maintenance loop does. Diagnostics tools and UI shells subscribe to these;
//! the loop never waits on subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::platform::{ContextId, ContextPurpose};
use crate::source::MaintainState;

/// Broadcast channel capacity for source events.
const CHANNEL_CAPACITY: usize = 64;

/// A lifecycle event emitted by a context source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceEvent {
    pub purpose: ContextPurpose,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SourceEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SourceEventKind {
    /// A new platform context was constructed and its modules loaded.
    ContextCreated { context_id: ContextId },

    /// A context was closed and dropped.
    ContextClosed { context_id: ContextId },

    /// The source announced a healthy context.
    Ready { context_id: ContextId },

    /// The source withdrew its readiness.
    NotReady,

    /// The context was suspended while idle in the background.
    Suspended { context_id: ContextId },

    /// A periodic health test failed; repair follows.
    HealthTestFailed {
        context_id: ContextId,
        reason: String,
    },

    /// Resume bounds were exhausted; recreation waits for a gesture.
    Escalated {
        resume_count: u32,
        interactive_resume_count: u32,
    },

    /// A resume is waiting for the next user gesture.
    AwaitingGesture { context_id: ContextId },

    /// The maintenance loop changed state.
    StateChanged { state: MaintainState },
}

/// Fan-out of [`SourceEvent`]s to any number of subscribers.
#[derive(Debug)]
pub struct SourceEventBroadcaster {
    purpose: ContextPurpose,
    sender: broadcast::Sender<SourceEvent>,
}

impl SourceEventBroadcaster {
    pub fn new(purpose: ContextPurpose) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { purpose, sender }
    }

    /// Stamp and broadcast an event. Dropped silently without subscribers.
    pub fn emit(&self, kind: SourceEventKind) {
        if self.sender.receiver_count() > 0 {
            let event = SourceEvent {
                purpose: self.purpose,
                at: Utc::now(),
                kind,
            };
            tracing::trace!(?event, "Broadcasting source event");
            let _ = self.sender.send(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_stamped_with_purpose() {
        let broadcaster = SourceEventBroadcaster::new(ContextPurpose::Recording);
        let mut rx = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        broadcaster.emit(SourceEventKind::NotReady);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.purpose, ContextPurpose::Recording);
        assert_eq!(event.kind, SourceEventKind::NotReady);
    }

    #[test]
    fn emit_without_subscribers_is_a_no_op() {
        let broadcaster = SourceEventBroadcaster::new(ContextPurpose::Playback);
        broadcaster.emit(SourceEventKind::NotReady);
        let mut late = broadcaster.subscribe();
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let event = SourceEvent {
            purpose: ContextPurpose::Playback,
            at: Utc::now(),
            kind: SourceEventKind::Escalated {
                resume_count: 5,
                interactive_resume_count: 3,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "escalated");
        assert_eq!(json["purpose"], "playback");
        assert_eq!(json["interactive_resume_count"], 3);
    }
}
