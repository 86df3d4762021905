// Event system for observing entry lifecycle

//! # Event System
//!
//! This module provides the event bus that lets other parts of an
//! application react to workflow activity without being wired into the
//! engine. It handles:
//! - Event emission from engine operations
//! - Fan-out to any number of subscribers
//!
//! Publishing never fails and never blocks: with no subscribers the event
//! is dropped, and a subscriber that falls more than `event_buffer` events
//! behind receives `RecvError::Lagged` on its next `recv`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::models::{ActionId, CurrentStep, EntryState, HistoryStep, StepId};

/// Something that happened to an entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    EntryCreated {
        entry_id: Uuid,
        definition_id: String,
        timestamp: DateTime<Utc>,
    },
    /// `initialize` placed the root step
    EntryActivated {
        entry_id: Uuid,
        step_id: StepId,
        timestamp: DateTime<Utc>,
    },
    StepRetired {
        entry_id: Uuid,
        history_id: Uuid,
        step_id: StepId,
        action_id: ActionId,
        status: String,
        timestamp: DateTime<Utc>,
    },
    StepCreated {
        entry_id: Uuid,
        current_id: Uuid,
        step_id: StepId,
        previous_id: Option<Uuid>,
        timestamp: DateTime<Utc>,
    },
    /// A hook failed after the step had already moved
    HookFailed {
        entry_id: Uuid,
        action_id: ActionId,
        message: String,
        timestamp: DateTime<Utc>,
    },
    EntryStateChanged {
        entry_id: Uuid,
        from: EntryState,
        to: EntryState,
        timestamp: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    pub fn entry_id(&self) -> Uuid {
        match self {
            WorkflowEvent::EntryCreated { entry_id, .. }
            | WorkflowEvent::EntryActivated { entry_id, .. }
            | WorkflowEvent::StepRetired { entry_id, .. }
            | WorkflowEvent::StepCreated { entry_id, .. }
            | WorkflowEvent::HookFailed { entry_id, .. }
            | WorkflowEvent::EntryStateChanged { entry_id, .. } => *entry_id,
        }
    }

    pub fn step_retired(history: &HistoryStep) -> Self {
        WorkflowEvent::StepRetired {
            entry_id: history.entry_id,
            history_id: history.id,
            step_id: history.step_id.clone(),
            action_id: history.action_id.clone(),
            status: history.status.clone(),
            timestamp: history.finish_time,
        }
    }

    pub fn step_created(step: &CurrentStep) -> Self {
        WorkflowEvent::StepCreated {
            entry_id: step.entry_id,
            current_id: step.id,
            step_id: step.step_id.clone(),
            previous_id: step.previous_id,
            timestamp: step.start_time,
        }
    }
}

/// Event bus for publishing and subscribing to workflow events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a new event bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: WorkflowEvent) {
        trace!(entry_id = %event.entry_id(), ?event, "event published");
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
