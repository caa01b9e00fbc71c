// Module: Events
// Flow events are the run's audit trail: one immutable record per stage
// transition, appended by every scene task. Durable storage is the
// surrounding system's concern; the sink trait is the seam.

use chrono::Utc;
use serde::Serialize;
use std::sync::Mutex;
use uuid::Uuid;

/// Severity of one flow event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Error,
}

/// Immutable record of one stage transition during execution.
#[derive(Debug, Clone, Serialize)]
pub struct FlowEvent {
    pub level: EventLevel,
    pub event_id: String,
    pub run_id: String,
    pub scene_id: String,
    /// The node the transition belongs to: an action ID, or the scene ID
    /// itself for scene-level transitions.
    pub trigger_node: String,
    pub stage: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_snapshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_snapshot: Option<String>,
    pub is_terminal: bool,
    pub at: String,
}

impl FlowEvent {
    pub fn stage(
        run_id: impl Into<String>,
        scene_id: impl Into<String>,
        trigger_node: impl Into<String>,
        stage: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            level: EventLevel::Info,
            event_id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            scene_id: scene_id.into(),
            trigger_node: trigger_node.into(),
            stage: stage.into(),
            message: message.into(),
            root_cause: None,
            error_code: None,
            request_snapshot: None,
            response_snapshot: None,
            is_terminal: false,
            at: Utc::now().to_rfc3339(),
        }
    }

    pub fn terminal(mut self) -> Self {
        self.is_terminal = true;
        self
    }

    pub fn failed(mut self, root_cause: impl Into<String>) -> Self {
        self.level = EventLevel::Error;
        self.root_cause = Some(root_cause.into());
        self.is_terminal = true;
        self
    }

    pub fn with_error_code(mut self, code: crate::errors::ErrorCode) -> Self {
        self.error_code = Some(code.formatted());
        self
    }

    pub fn with_request_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.request_snapshot = Some(snapshot.into());
        self
    }

    pub fn with_response_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.response_snapshot = Some(snapshot.into());
        self
    }
}

/// Append-only sink. Implementations must accept concurrent writers from
/// multiple scene tasks.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: FlowEvent);
}

/// Sink that forwards events to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: FlowEvent) {
        match event.level {
            EventLevel::Info => tracing::info!(
                run_id = %event.run_id,
                scene_id = %event.scene_id,
                node = %event.trigger_node,
                stage = %event.stage,
                terminal = event.is_terminal,
                "{}",
                event.message
            ),
            EventLevel::Error => tracing::error!(
                run_id = %event.run_id,
                scene_id = %event.scene_id,
                node = %event.trigger_node,
                stage = %event.stage,
                root_cause = event.root_cause.as_deref().unwrap_or(""),
                error_code = event.error_code.as_deref().unwrap_or(""),
                "{}",
                event.message
            ),
        }
    }
}

/// Sink that keeps the ordered event sequence in memory. Used by tests and
/// by callers that inspect the audit trail after a run.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<FlowEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<FlowEvent> {
        self.events.lock().expect("event sink poisoned").clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: FlowEvent) {
        self.events.lock().expect("event sink poisoned").push(event);
    }
}
