// Module: Resolve
// Two-phase dependency resolution. The eager phase runs once per action
// before execution starts: external key-value and literal values are always
// available, scene-output references are only checked for legality. The lazy
// phase runs immediately before the send and blocks on the result store for
// outputs other scenes may not have produced yet.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::ErrorCode;
use crate::extract::{extract, render_scalar, ExtractError};
use crate::kv::KvClient;
use crate::protocol::{ActionDefinition, Dependency, DependencySource, InjectionTarget, TargetField};
use crate::store::{FetchError, FetchPolicy, OutputKey, ResultStore};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("external fetch failed for key '{key}': {reason}")]
    KvFetch { key: String, reason: String },

    #[error("no key-value client configured but action declares an external dependency on '{key}'")]
    KvUnavailable { key: String },

    #[error("dependency for '{target}': {source}")]
    DataPath {
        target: String,
        #[source]
        source: ExtractError,
    },

    #[error("wait for output of {key} exhausted: {source}")]
    WaitExhausted {
        key: String,
        #[source]
        source: FetchError,
    },

    #[error("wait for output of {key} cancelled")]
    WaitCancelled { key: String },

    #[error("payload segment '{segment}' exists but is not a map (injecting '{name}')")]
    KeyNotMap { segment: String, name: String },

    #[error("path placeholder '{{{name}}}' not present in '{path}'")]
    PlaceholderNotFound { name: String, path: String },

    #[error("dependency names unknown producer {scene}/{action}")]
    UnknownProducer { scene: String, action: String },

    #[error("dependency on '{producer}' which runs after '{consumer}' in scene '{scene}'")]
    ForwardReference {
        scene: String,
        producer: String,
        consumer: String,
    },
}

impl ResolveError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::KvFetch { .. } | Self::KvUnavailable { .. } => ErrorCode::KV_FETCH_FAILED,
            Self::DataPath { .. } => ErrorCode::DATA_PATH_NOT_FOUND,
            Self::WaitExhausted { .. } => ErrorCode::DEPENDENCY_WAIT_EXHAUSTED,
            Self::WaitCancelled { .. } => ErrorCode::DEPENDENCY_WAIT_CANCELLED,
            Self::KeyNotMap { .. } => ErrorCode::KEY_NOT_MAP,
            Self::PlaceholderNotFound { .. } => ErrorCode::DATA_PATH_NOT_FOUND,
            Self::UnknownProducer { .. } => ErrorCode::UNKNOWN_PRODUCER,
            Self::ForwardReference { .. } => ErrorCode::FORWARD_REFERENCE,
        }
    }
}

// ============================================================================
// PRODUCER CATALOG
// ============================================================================

/// Declared order of every action in the run, used to check scene-output
/// references for legality before anything executes.
#[derive(Debug, Default)]
pub struct ProducerCatalog {
    scenes: HashMap<String, Vec<String>>,
}

impl ProducerCatalog {
    pub fn new(scenes: &[crate::protocol::SceneDefinition]) -> Self {
        let mut catalog = HashMap::new();
        for scene in scenes {
            let order = scene
                .actions
                .iter()
                .map(|a| a.action_id.clone())
                .collect();
            catalog.insert(scene.scene_id.clone(), order);
        }
        Self { scenes: catalog }
    }

    /// Declared action order for one scene.
    pub fn action_ids(&self, scene: &str) -> Option<&Vec<String>> {
        self.scenes.get(scene)
    }

    pub fn position(&self, scene: &str, action: &str) -> Option<usize> {
        self.scenes
            .get(scene)
            .and_then(|order| order.iter().position(|id| id == action))
    }

    /// A producer in the same scene must precede the consumer in declared
    /// order; a producer in a different scene is always legal.
    pub fn check_scene_output(
        &self,
        consumer_scene: &str,
        consumer_action: &str,
        producer_scene: &str,
        producer_action: &str,
    ) -> Result<(), ResolveError> {
        let producer_pos = self.position(producer_scene, producer_action).ok_or_else(|| {
            ResolveError::UnknownProducer {
                scene: producer_scene.to_string(),
                action: producer_action.to_string(),
            }
        })?;

        if producer_scene == consumer_scene {
            let consumer_pos = self
                .position(consumer_scene, consumer_action)
                .unwrap_or(usize::MAX);
            if producer_pos >= consumer_pos {
                return Err(ResolveError::ForwardReference {
                    scene: consumer_scene.to_string(),
                    producer: producer_action.to_string(),
                    consumer: consumer_action.to_string(),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// EAGER PHASE
// ============================================================================

/// Resolves external key-value and literal dependencies into the action's
/// request fields, and checks scene-output references for legality. Runs
/// once per action before execution starts.
pub async fn resolve_eager(
    action: &mut ActionDefinition,
    kv: Option<&dyn KvClient>,
    catalog: &ProducerCatalog,
) -> Result<(), ResolveError> {
    let dependencies = action.dependencies.clone();
    for dep in &dependencies {
        match &dep.source {
            DependencySource::ExternalKv { key } => {
                let value = fetch_external(kv, key, dep.data_path.as_deref()).await?;
                inject(action, &dep.target, &value)?;
                debug!(key = %key, target = %dep.target.name, "external dependency resolved");
            }
            DependencySource::Literal { value } => {
                let value = navigate(value, dep)?;
                inject(action, &dep.target, &value)?;
            }
            DependencySource::SceneOutput { scene, action: producer } => {
                catalog.check_scene_output(&action.scene_id, &action.action_id, scene, producer)?;
            }
            // Reserved; nothing to resolve.
            DependencySource::Event { .. } => {}
        }
    }
    Ok(())
}

async fn fetch_external(
    kv: Option<&dyn KvClient>,
    key: &str,
    data_path: Option<&str>,
) -> Result<Value, ResolveError> {
    let kv = kv.ok_or_else(|| ResolveError::KvUnavailable {
        key: key.to_string(),
    })?;

    // A numeric first path segment selects a list position; the rest of the
    // path descends into the (possibly JSON-encoded) element.
    let path = data_path.unwrap_or("");
    let (first, rest) = match path.split_once('.') {
        Some((first, rest)) => (first, rest),
        None => (path, ""),
    };

    let fetched = match first.parse::<usize>() {
        Ok(index) => kv.lindex(key, index).await.map(|raw| (raw, rest)),
        Err(_) => kv.get(key).await.map(|raw| (raw, path)),
    };
    let (raw, remainder) = fetched.map_err(|e| ResolveError::KvFetch {
        key: key.to_string(),
        reason: e.to_string(),
    })?;

    extract(&Value::String(raw), remainder).map_err(|source| ResolveError::DataPath {
        target: key.to_string(),
        source,
    })
}

fn navigate(value: &Value, dep: &Dependency) -> Result<Value, ResolveError> {
    match dep.data_path.as_deref() {
        None | Some("") => Ok(value.clone()),
        Some(path) => extract(value, path).map_err(|source| ResolveError::DataPath {
            target: dep.target.name.clone(),
            source,
        }),
    }
}

// ============================================================================
// LAZY PHASE
// ============================================================================

/// Resolves scene-output dependencies by blocking on the result store, then
/// injects the extracted values. Runs immediately before the send.
pub async fn resolve_lazy(
    action: &mut ActionDefinition,
    run_id: &str,
    store: &ResultStore,
    policy: &FetchPolicy,
    cancel: &CancellationToken,
) -> Result<(), ResolveError> {
    let dependencies = action.dependencies.clone();
    for dep in &dependencies {
        let (scene, producer) = match &dep.source {
            DependencySource::SceneOutput { scene, action } => (scene, action),
            _ => continue,
        };

        let key = OutputKey::new(run_id, scene.clone(), producer.clone());
        let output = store
            .get_blocking(&key, policy, cancel)
            .await
            .map_err(|err| match err {
                FetchError::Cancelled { key } => ResolveError::WaitCancelled { key },
                exhausted => ResolveError::WaitExhausted {
                    key: key.to_string(),
                    source: exhausted,
                },
            })?;

        let value = navigate(&output, dep)?;
        inject(action, &dep.target, &value)?;
        debug!(
            producer = %key,
            target = %dep.target.name,
            "scene output dependency resolved"
        );
    }
    Ok(())
}

// ============================================================================
// INJECTION
// ============================================================================

/// Writes a resolved value into the declared request field.
fn inject(
    action: &mut ActionDefinition,
    target: &InjectionTarget,
    value: &Value,
) -> Result<(), ResolveError> {
    match target.field {
        TargetField::Headers => {
            let rendered = render_scalar(value);
            // Authorization recebe o esquema Bearer.
            let rendered = if target.name == "Authorization" {
                format!("Bearer {}", rendered)
            } else {
                rendered
            };
            action.headers.insert(target.name.clone(), rendered);
        }
        TargetField::Query => {
            action
                .query_params
                .insert(target.name.clone(), render_scalar(value));
        }
        TargetField::Path => {
            let placeholder = format!("{{{}}}", target.name);
            if !action.path.contains(&placeholder) {
                return Err(ResolveError::PlaceholderNotFound {
                    name: target.name.clone(),
                    path: action.path.clone(),
                });
            }
            action.path = action.path.replace(&placeholder, &render_scalar(value));
        }
        TargetField::Payload => {
            set_payload_path(&mut action.payload, &target.name, value.clone())?;
        }
    }
    Ok(())
}

/// Sets a (possibly dot-separated) path inside the payload map, creating
/// intermediate maps as needed. An intermediate segment that exists but is
/// not itself a map is an error.
fn set_payload_path(
    payload: &mut serde_json::Map<String, Value>,
    name: &str,
    value: Value,
) -> Result<(), ResolveError> {
    let mut segments = name.split('.').peekable();
    let mut current = payload;

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return Ok(());
        }

        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        current = match slot {
            Value::Object(map) => map,
            _ => {
                return Err(ResolveError::KeyNotMap {
                    segment: segment.to_string(),
                    name: name.to_string(),
                })
            }
        };
    }
    unreachable!("split always yields at least one segment")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::protocol::SceneDefinition;
    use serde_json::json;
    use std::time::Duration;

    fn action(scene: &str, id: &str, deps: Vec<Dependency>) -> ActionDefinition {
        serde_json::from_value(json!({
            "action_id": id,
            "scene_id": scene,
            "domain": "https://api.test.com",
            "path": "/users/{userId}",
            "method": "GET",
        }))
        .map(|mut a: ActionDefinition| {
            a.dependencies = deps;
            a
        })
        .unwrap()
    }

    fn dep(source: Value, data_path: Option<&str>, field: &str, name: &str) -> Dependency {
        let mut doc = source;
        doc["data_path"] = match data_path {
            Some(p) => json!(p),
            None => Value::Null,
        };
        doc["target"] = json!({ "field": field, "name": name });
        serde_json::from_value(doc).unwrap()
    }

    fn catalog() -> ProducerCatalog {
        let scenes: Vec<SceneDefinition> = serde_json::from_value(json!([
            {
                "scene_id": "s1",
                "actions": [
                    { "action_id": "a1", "domain": "d", "path": "/", "method": "GET" },
                    { "action_id": "a2", "domain": "d", "path": "/", "method": "GET" }
                ]
            },
            {
                "scene_id": "s2",
                "actions": [
                    { "action_id": "b1", "domain": "d", "path": "/", "method": "GET" }
                ]
            }
        ]))
        .unwrap();
        ProducerCatalog::new(&scenes)
    }

    fn fast_policy() -> FetchPolicy {
        FetchPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            overall_timeout: Duration::from_secs(1),
        }
    }

    // ------------------------------------------------------------------------
    // Eager phase
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn literal_into_nested_payload() {
        let mut a = action(
            "s1",
            "a1",
            vec![dep(
                json!({ "source": "literal", "value": "pro" }),
                None,
                "payload",
                "subscription.plan",
            )],
        );

        resolve_eager(&mut a, None, &catalog()).await.unwrap();
        assert_eq!(
            Value::Object(a.payload),
            json!({ "subscription": { "plan": "pro" } })
        );
    }

    #[tokio::test]
    async fn payload_intermediate_must_be_map() {
        let mut a = action(
            "s1",
            "a1",
            vec![dep(
                json!({ "source": "literal", "value": "x" }),
                None,
                "payload",
                "subscription.plan",
            )],
        );
        a.payload.insert("subscription".to_string(), json!("basic"));

        let err = resolve_eager(&mut a, None, &catalog()).await.unwrap_err();
        assert!(matches!(err, ResolveError::KeyNotMap { ref segment, .. } if segment == "subscription"));
    }

    #[tokio::test]
    async fn external_plain_value_with_path() {
        let kv = MemoryKv::new();
        kv.set("session", r#"{"token": "abc123"}"#).await;

        let mut a = action(
            "s1",
            "a1",
            vec![dep(
                json!({ "source": "external_kv", "key": "session" }),
                Some("token"),
                "query",
                "token",
            )],
        );

        resolve_eager(&mut a, Some(&kv as &dyn KvClient), &catalog()).await.unwrap();
        assert_eq!(a.query_params.get("token"), Some(&"abc123".to_string()));
    }

    #[tokio::test]
    async fn external_numeric_first_segment_uses_lindex() {
        let kv = MemoryKv::new();
        kv.set_list(
            "accounts",
            vec![r#"{"name": "alice"}"#.to_string(), r#"{"name": "bob"}"#.to_string()],
        )
        .await;

        let mut a = action(
            "s1",
            "a1",
            vec![dep(
                json!({ "source": "external_kv", "key": "accounts" }),
                Some("1.name"),
                "query",
                "account",
            )],
        );

        resolve_eager(&mut a, Some(&kv as &dyn KvClient), &catalog()).await.unwrap();
        assert_eq!(a.query_params.get("account"), Some(&"bob".to_string()));
    }

    #[tokio::test]
    async fn external_without_client_fails() {
        let mut a = action(
            "s1",
            "a1",
            vec![dep(
                json!({ "source": "external_kv", "key": "session" }),
                None,
                "query",
                "token",
            )],
        );

        let err = resolve_eager(&mut a, None, &catalog()).await.unwrap_err();
        assert!(matches!(err, ResolveError::KvUnavailable { .. }));
    }

    #[tokio::test]
    async fn scene_output_unknown_producer_rejected() {
        let mut a = action(
            "s1",
            "a2",
            vec![dep(
                json!({ "source": "scene_output", "scene": "s9", "action": "nope" }),
                Some("id"),
                "query",
                "userId",
            )],
        );

        let err = resolve_eager(&mut a, None, &catalog()).await.unwrap_err();
        assert!(matches!(err, ResolveError::UnknownProducer { .. }));
    }

    #[tokio::test]
    async fn same_scene_forward_reference_rejected() {
        // a1 consome a saída de a2, mas a2 vem depois na cena.
        let mut a = action(
            "s1",
            "a1",
            vec![dep(
                json!({ "source": "scene_output", "scene": "s1", "action": "a2" }),
                Some("id"),
                "query",
                "userId",
            )],
        );

        let err = resolve_eager(&mut a, None, &catalog()).await.unwrap_err();
        assert!(matches!(err, ResolveError::ForwardReference { .. }));
    }

    #[tokio::test]
    async fn same_scene_earlier_producer_accepted() {
        let mut a = action(
            "s1",
            "a2",
            vec![dep(
                json!({ "source": "scene_output", "scene": "s1", "action": "a1" }),
                Some("id"),
                "query",
                "userId",
            )],
        );
        resolve_eager(&mut a, None, &catalog()).await.unwrap();
    }

    #[tokio::test]
    async fn cross_scene_producer_always_legal() {
        let mut a = action(
            "s1",
            "a1",
            vec![dep(
                json!({ "source": "scene_output", "scene": "s2", "action": "b1" }),
                Some("id"),
                "query",
                "userId",
            )],
        );
        resolve_eager(&mut a, None, &catalog()).await.unwrap();
    }

    #[tokio::test]
    async fn event_source_is_a_noop() {
        let mut a = action(
            "s1",
            "a1",
            vec![dep(
                json!({ "source": "event", "topic": "payments" }),
                None,
                "query",
                "ignored",
            )],
        );
        resolve_eager(&mut a, None, &catalog()).await.unwrap();
        assert!(a.query_params.is_empty());
    }

    // ------------------------------------------------------------------------
    // Lazy phase
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn lazy_injects_bearer_authorization() {
        let store = ResultStore::new();
        store
            .put(OutputKey::new("r1", "s1", "a1"), json!({"data": {"token": "abc123"}}))
            .await;

        let mut a = action(
            "s2",
            "b1",
            vec![dep(
                json!({ "source": "scene_output", "scene": "s1", "action": "a1" }),
                Some("data.token"),
                "headers",
                "Authorization",
            )],
        );

        let cancel = CancellationToken::new();
        resolve_lazy(&mut a, "r1", &store, &fast_policy(), &cancel)
            .await
            .unwrap();
        assert_eq!(
            a.headers.get("Authorization"),
            Some(&"Bearer abc123".to_string())
        );
    }

    #[tokio::test]
    async fn lazy_injects_query_param() {
        let store = ResultStore::new();
        store
            .put(OutputKey::new("r1", "s1", "a1"), json!({"id": "u1"}))
            .await;

        let mut a = action(
            "s2",
            "b1",
            vec![dep(
                json!({ "source": "scene_output", "scene": "s1", "action": "a1" }),
                Some("id"),
                "query",
                "userId",
            )],
        );

        let cancel = CancellationToken::new();
        resolve_lazy(&mut a, "r1", &store, &fast_policy(), &cancel)
            .await
            .unwrap();
        assert_eq!(a.query_params.get("userId"), Some(&"u1".to_string()));
    }

    #[tokio::test]
    async fn lazy_replaces_path_placeholder() {
        let store = ResultStore::new();
        store
            .put(OutputKey::new("r1", "s1", "a1"), json!({"id": "u1"}))
            .await;

        let mut a = action(
            "s2",
            "b1",
            vec![dep(
                json!({ "source": "scene_output", "scene": "s1", "action": "a1" }),
                Some("id"),
                "path",
                "userId",
            )],
        );

        let cancel = CancellationToken::new();
        resolve_lazy(&mut a, "r1", &store, &fast_policy(), &cancel)
            .await
            .unwrap();
        assert_eq!(a.path, "/users/u1");
    }

    #[tokio::test]
    async fn lazy_missing_placeholder_is_an_error() {
        let store = ResultStore::new();
        store
            .put(OutputKey::new("r1", "s1", "a1"), json!({"id": "u1"}))
            .await;

        let mut a = action(
            "s2",
            "b1",
            vec![dep(
                json!({ "source": "scene_output", "scene": "s1", "action": "a1" }),
                Some("id"),
                "path",
                "orderId",
            )],
        );

        let cancel = CancellationToken::new();
        let err = resolve_lazy(&mut a, "r1", &store, &fast_policy(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::PlaceholderNotFound { .. }));
    }

    #[tokio::test]
    async fn lazy_wait_exhausted_when_producer_never_writes() {
        let store = ResultStore::new();
        let mut a = action(
            "s2",
            "b1",
            vec![dep(
                json!({ "source": "scene_output", "scene": "s1", "action": "a1" }),
                Some("id"),
                "query",
                "userId",
            )],
        );

        let policy = FetchPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            overall_timeout: Duration::from_secs(5),
        };
        let cancel = CancellationToken::new();
        let err = resolve_lazy(&mut a, "r1", &store, &policy, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::WaitExhausted { .. }));
        assert_eq!(err.code(), ErrorCode::DEPENDENCY_WAIT_EXHAUSTED);
    }
}
