use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// A scene: one ordered group of actions representing a test scenario.
///
/// Immutable once loaded. Exactly one scene task reads it during a run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SceneDefinition {
    pub scene_id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Scene-level budget; the whole action sequence is raced against it.
    #[serde(default = "default_scene_timeout_secs")]
    pub timeout_secs: u64,
    pub actions: Vec<ActionDefinition>,
}

fn default_scene_timeout_secs() -> u64 {
    60
}

/// One HTTP call plus its dependency list, request template and expectations.
///
/// Request fields are filled in place during dependency resolution. Only the
/// task executing the action writes to it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionDefinition {
    pub action_id: String,
    #[serde(default)]
    pub action_name: String,
    /// Back-reference to the owning scene, filled by the loader.
    #[serde(default)]
    pub scene_id: String,
    pub domain: String,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query_params: HashMap<String, String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub body_kind: BodyKind,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub expectations: Vec<ExpectationRule>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub before_hooks: Vec<ActionHook>,
    #[serde(default)]
    pub after_hooks: Vec<ActionHook>,
}

/// How the payload is serialized onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
    #[default]
    Json,
    Form,
}

/// A declared source for one piece of runtime data needed by a request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Dependency {
    #[serde(flatten)]
    pub source: DependencySource,
    /// Dot-path into the producer's captured output or the external value.
    #[serde(default)]
    pub data_path: Option<String>,
    pub target: InjectionTarget,
}

/// Where a dependency's value comes from.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DependencySource {
    /// Another action's previously captured response, possibly from a
    /// different scene. Resolved lazily, immediately before the send.
    SceneOutput { scene: String, action: String },
    /// A value held by the external key-value store. Resolved eagerly.
    ExternalKv { key: String },
    /// Static data copied as-is. Resolved eagerly.
    Literal { value: Value },
    /// Reserved for event-sourced dependencies; accepted, not resolved.
    Event {
        #[serde(default)]
        topic: Option<String>,
    },
}

/// Which request field a resolved value lands in.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InjectionTarget {
    pub field: TargetField,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetField {
    Headers,
    Payload,
    Path,
    Query,
}

/// One expectation on the decoded response body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExpectationRule {
    pub field_path: String,
    #[serde(default = "default_operator")]
    pub operator: String,
    #[serde(rename = "type")]
    pub declared_type: String,
    pub desired: Value,
}

fn default_operator() -> String {
    "eq".to_string()
}

/// Transport retry and per-send timeout for one action.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_send_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_send_timeout_secs() -> u64 {
    30
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            timeout_secs: default_send_timeout_secs(),
        }
    }
}

/// Lifecycle hook run before or after the send stage.
///
/// Accepts `{ "kind": "wait", "duration_ms": 100 }`; `ms` is a short alias
/// for `duration_ms` and loses if both are given.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionHook {
    pub kind: String,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub ms: Option<u64>,
}

impl ActionHook {
    pub fn duration(&self) -> Option<u64> {
        self.duration_ms.or(self.ms)
    }
}

// ============================================================================
// RUN REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Passed,
    Failed,
    /// The owning scene aborted before this action ran.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneStatus {
    Passed,
    Failed,
    TimedOut,
    Cancelled,
}

/// Outcome of one action within a run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionReport {
    pub scene_id: String,
    pub action_id: String,
    pub status: ActionStatus,
    /// Last stage the action reached, e.g. "assert" or "done".
    pub stage: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one scene within a run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SceneReport {
    pub scene_id: String,
    pub status: SceneStatus,
    pub actions: Vec<ActionReport>,
}

/// Aggregated outcome of a whole run. The engine always produces one,
/// whatever happened to the individual scenes.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: String, // "passed" | "failed"
    pub started_at: String,
    pub finished_at: String,
    pub scenes: Vec<SceneReport>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.status == "passed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_definition_defaults() {
        let action: ActionDefinition = serde_json::from_value(json!({
            "action_id": "a1",
            "domain": "https://api.test.com",
            "path": "/users",
            "method": "GET"
        }))
        .unwrap();

        assert_eq!(action.body_kind, BodyKind::Json);
        assert!(action.dependencies.is_empty());
        assert_eq!(action.retry.max_retries, 0);
        assert_eq!(action.retry.timeout_secs, 30);
    }

    #[test]
    fn dependency_source_tagging() {
        let dep: Dependency = serde_json::from_value(json!({
            "source": "scene_output",
            "scene": "s1",
            "action": "a1",
            "data_path": "data.token",
            "target": { "field": "headers", "name": "Authorization" }
        }))
        .unwrap();

        match dep.source {
            DependencySource::SceneOutput { ref scene, ref action } => {
                assert_eq!(scene, "s1");
                assert_eq!(action, "a1");
            }
            _ => panic!("expected scene_output source"),
        }
        assert_eq!(dep.target.field, TargetField::Headers);
    }

    #[test]
    fn literal_dependency_carries_value() {
        let dep: Dependency = serde_json::from_value(json!({
            "source": "literal",
            "value": { "plan": "pro" },
            "target": { "field": "payload", "name": "subscription" }
        }))
        .unwrap();

        match dep.source {
            DependencySource::Literal { ref value } => {
                assert_eq!(value, &json!({ "plan": "pro" }));
            }
            _ => panic!("expected literal source"),
        }
    }

    #[test]
    fn hook_duration_prefers_canonical_field() {
        let hook: ActionHook =
            serde_json::from_value(json!({ "kind": "wait", "duration_ms": 50, "ms": 200 }))
                .unwrap();
        assert_eq!(hook.duration(), Some(50));

        let hook: ActionHook = serde_json::from_value(json!({ "kind": "wait", "ms": 75 })).unwrap();
        assert_eq!(hook.duration(), Some(75));
    }

    #[test]
    fn expectation_operator_defaults_to_eq() {
        let rule: ExpectationRule = serde_json::from_value(json!({
            "field_path": "data.name",
            "type": "string",
            "desired": "foo"
        }))
        .unwrap();
        assert_eq!(rule.operator, "eq");
    }
}
