//! Typed event bus.
//!
//! Publishing is synchronous and FIFO per subject. Each subscriber call is
//! isolated: a panic in one handler is caught and logged, the remaining
//! handlers still run, and nothing propagates into the orchestrator.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::model::{ExecutionStatus, OutputStream};

/// Envelope carried by every event.
#[derive(Debug, Clone, Serialize)]
pub struct EventMeta {
    pub workflow_name: String,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn now(workflow_name: &str, run_id: Uuid) -> Self {
        Self {
            workflow_name: workflow_name.to_string(),
            run_id,
            timestamp: Utc::now(),
        }
    }
}

/// Per-task payload on task events.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEventInfo {
    pub task_id: String,
    /// 1-based attempt number; 0 for events preceding any attempt.
    pub attempt: u32,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}

/// Everything the engine reports.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    WorkflowStarted {
        meta: EventMeta,
    },
    WorkflowCompleted {
        meta: EventMeta,
    },
    WorkflowFailed {
        meta: EventMeta,
        error: Option<String>,
    },
    WorkflowCancelled {
        meta: EventMeta,
    },
    TaskStarted {
        meta: EventMeta,
        task: TaskEventInfo,
    },
    TaskCompleted {
        meta: EventMeta,
        task: TaskEventInfo,
    },
    TaskFailed {
        meta: EventMeta,
        task: TaskEventInfo,
    },
    TaskSkipped {
        meta: EventMeta,
        task: TaskEventInfo,
    },
    TaskTimedOut {
        meta: EventMeta,
        task: TaskEventInfo,
    },
    TaskCancelled {
        meta: EventMeta,
        task: TaskEventInfo,
    },
    TaskOutputChunk {
        meta: EventMeta,
        task_id: String,
        attempt: u32,
        stream: OutputStream,
        text: String,
    },
}

impl Event {
    pub fn meta(&self) -> &EventMeta {
        match self {
            Event::WorkflowStarted { meta }
            | Event::WorkflowCompleted { meta }
            | Event::WorkflowFailed { meta, .. }
            | Event::WorkflowCancelled { meta }
            | Event::TaskStarted { meta, .. }
            | Event::TaskCompleted { meta, .. }
            | Event::TaskFailed { meta, .. }
            | Event::TaskSkipped { meta, .. }
            | Event::TaskTimedOut { meta, .. }
            | Event::TaskCancelled { meta, .. }
            | Event::TaskOutputChunk { meta, .. } => meta,
        }
    }

    /// Task id, when the event concerns a single task.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Event::TaskStarted { task, .. }
            | Event::TaskCompleted { task, .. }
            | Event::TaskFailed { task, .. }
            | Event::TaskSkipped { task, .. }
            | Event::TaskTimedOut { task, .. }
            | Event::TaskCancelled { task, .. } => Some(&task.task_id),
            Event::TaskOutputChunk { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// JSON rendering for exporters.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Whether this is the final event for its task.
    pub fn is_terminal_task_event(&self) -> bool {
        matches!(
            self,
            Event::TaskCompleted { .. }
                | Event::TaskFailed { .. }
                | Event::TaskSkipped { .. }
                | Event::TaskTimedOut { .. }
                | Event::TaskCancelled { .. }
        )
    }
}

/// A consumer of engine events.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Subscriber list with per-call isolation.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Deliver an event to every subscriber, in subscription order.
    pub fn publish(&self, event: Event) {
        for subscriber in &self.subscribers {
            let call = AssertUnwindSafe(|| subscriber.on_event(&event));
            if catch_unwind(call).is_err() {
                tracing::warn!(
                    event = ?std::mem::discriminant(&event),
                    "event subscriber panicked; continuing with remaining subscribers"
                );
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// Subscriber that records every event in memory. Used by tests and by
/// exporters that post-process a finished run.
#[derive(Default)]
pub struct MemorySubscriber {
    events: Mutex<Vec<Event>>,
}

impl MemorySubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSubscriber for MemorySubscriber {
    fn on_event(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Subscriber that forwards events into an async stream, for consumers that
/// live on the other side of a channel (TUIs, exporters).
pub struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSubscriber {
    /// Create the subscriber and the stream of events it will forward.
    pub fn channel() -> (Arc<Self>, UnboundedReceiverStream<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), UnboundedReceiverStream::new(rx))
    }
}

impl EventSubscriber for ChannelSubscriber {
    fn on_event(&self, event: &Event) {
        // The receiver may be gone; publishing must never fail.
        let _ = self.tx.send(event.clone());
    }
}
