// The per-action state machine:
// Validate → ResolveDependencies → BuildRequest → BeforeHooks → Send →
// ReadResponse → AfterHooks → Assert → StoreOutput → Done.
// Every successful stage emits a flow event; any failure emits a terminal
// event and stops the machine.

use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::request::{self, BuildError};
use super::RunContext;
use crate::assertions::{self, AssertionError};
use crate::errors::ErrorCode;
use crate::events::FlowEvent;
use crate::protocol::{ActionDefinition, ActionHook, ActionReport, ActionStatus};
use crate::resolve::{self, ResolveError};
use crate::store::OutputKey;

/// Fixed pause between transport retries.
const RETRY_PAUSE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    ResolveDependencies,
    BuildRequest,
    BeforeHooks,
    Send,
    ReadResponse,
    AfterHooks,
    Assert,
    StoreOutput,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::ResolveDependencies => "resolve_dependencies",
            Self::BuildRequest => "build_request",
            Self::BeforeHooks => "before_hooks",
            Self::Send => "send",
            Self::ReadResponse => "read_response",
            Self::AfterHooks => "after_hooks",
            Self::Assert => "assert",
            Self::StoreOutput => "store_output",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action definition is missing '{field}'")]
    Validation { field: &'static str },

    #[error("invalid HTTP method '{method}'")]
    InvalidMethod { method: String },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("unknown hook kind '{kind}'")]
    UnknownHook { kind: String },

    #[error("hook '{kind}' has no duration")]
    HookMissingDuration { kind: String },

    #[error("transport failed after {attempts} attempt(s): {reason}")]
    Transport { attempts: u32, reason: String },

    #[error("send deadline of {timeout_secs}s elapsed")]
    DeadlineElapsed { timeout_secs: u64 },

    #[error("action cancelled")]
    Cancelled,

    #[error("response body is not JSON: {reason}")]
    ResponseNotJson { reason: String },

    #[error(transparent)]
    Assertion(#[from] AssertionError),
}

impl ActionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } => ErrorCode::MISSING_REQUEST_FIELD,
            Self::InvalidMethod { .. } => ErrorCode::INVALID_HTTP_METHOD,
            Self::Resolve(inner) => inner.code(),
            Self::Build(_) => ErrorCode::INTERNAL,
            Self::UnknownHook { .. } | Self::HookMissingDuration { .. } => ErrorCode::INVALID_HOOK,
            Self::Transport { .. } => ErrorCode::TRANSPORT_FAILED,
            Self::DeadlineElapsed { .. } => ErrorCode::SEND_DEADLINE_ELAPSED,
            Self::Cancelled => ErrorCode::RUN_CANCELLED,
            Self::ResponseNotJson { .. } => ErrorCode::RESPONSE_NOT_JSON,
            Self::Assertion(inner) => inner.code(),
        }
    }
}

/// Outcome of the send stage, made an explicit state instead of a race:
/// the select below is biased towards cancellation, then the deadline,
/// then the response. A response that becomes ready only once the deadline
/// has already elapsed reports `DeadlineElapsed`, deterministically.
#[derive(Debug)]
pub enum SendOutcome {
    Completed(CapturedResponse),
    DeadlineElapsed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: u16,
    pub body_text: String,
}

/// Runs one action to a terminal state and reports it. Never panics and
/// never propagates: every failure lands in the report and the event trail.
#[instrument(name = "action", skip_all, fields(scene_id = %action.scene_id, action_id = %action.action_id))]
pub async fn run_action(
    ctx: &RunContext,
    cancel: &CancellationToken,
    action: &mut ActionDefinition,
) -> ActionReport {
    let started = std::time::Instant::now();
    let scene_id = action.scene_id.clone();
    let action_id = action.action_id.clone();

    match drive(ctx, cancel, action).await {
        Ok(()) => {
            ctx.sink.emit(
                FlowEvent::stage(
                    &ctx.run_id,
                    &scene_id,
                    &action_id,
                    Stage::Done.as_str(),
                    format!("action '{}' done", action_id),
                )
                .terminal(),
            );
            let duration_ms = started.elapsed().as_millis() as u64;
            info!(duration_ms, "action passed");
            ActionReport {
                scene_id,
                action_id,
                status: ActionStatus::Passed,
                stage: Stage::Done.as_str().to_string(),
                duration_ms,
                error: None,
            }
        }
        Err((stage, err)) => {
            ctx.sink.emit(
                FlowEvent::stage(
                    &ctx.run_id,
                    &scene_id,
                    &action_id,
                    stage.as_str(),
                    format!("action '{}' failed at {}", action_id, stage.as_str()),
                )
                .failed(err.to_string())
                .with_error_code(err.code()),
            );
            let duration_ms = started.elapsed().as_millis() as u64;
            warn!(duration_ms, stage = stage.as_str(), error = %err, "action failed");
            ActionReport {
                scene_id,
                action_id,
                status: ActionStatus::Failed,
                stage: stage.as_str().to_string(),
                duration_ms,
                error: Some(format!("[{}] {}", err.code(), err)),
            }
        }
    }
}

async fn drive(
    ctx: &RunContext,
    cancel: &CancellationToken,
    action: &mut ActionDefinition,
) -> Result<(), (Stage, ActionError)> {
    let scene_id = action.scene_id.clone();
    let action_id = action.action_id.clone();

    validate(action).map_err(|e| (Stage::Validate, e))?;
    ctx.sink.emit(FlowEvent::stage(
        &ctx.run_id,
        &scene_id,
        &action_id,
        Stage::Validate.as_str(),
        format!("action '{}' validated", action_id),
    ));

    // Eager first (always-available sources, legality checks), then the
    // blocking fetch of scene outputs right before anything goes out.
    resolve::resolve_eager(action, ctx.kv.as_deref(), &ctx.catalog)
        .await
        .map_err(|e| (Stage::ResolveDependencies, e.into()))?;
    resolve::resolve_lazy(action, &ctx.run_id, &ctx.store, &ctx.fetch_policy, cancel)
        .await
        .map_err(|e| (Stage::ResolveDependencies, e.into()))?;
    ctx.sink.emit(FlowEvent::stage(
        &ctx.run_id,
        &scene_id,
        &action_id,
        Stage::ResolveDependencies.as_str(),
        format!("{} dependency(ies) resolved", action.dependencies.len()),
    ));

    let rendered = request::build(action).map_err(|e| (Stage::BuildRequest, e.into()))?;
    ctx.sink.emit(
        FlowEvent::stage(
            &ctx.run_id,
            &scene_id,
            &action_id,
            Stage::BuildRequest.as_str(),
            format!("{} {}", rendered.method, rendered.url),
        )
        .with_request_snapshot(rendered.raw()),
    );

    run_hooks(&action.before_hooks, cancel)
        .await
        .map_err(|e| (Stage::BeforeHooks, e))?;
    ctx.sink.emit(FlowEvent::stage(
        &ctx.run_id,
        &scene_id,
        &action_id,
        Stage::BeforeHooks.as_str(),
        format!("{} before hook(s) ran", action.before_hooks.len()),
    ));

    let outcome = send_with_retry(
        &ctx.client,
        &rendered,
        action.retry.max_retries,
        action.retry.timeout_secs,
        cancel,
    )
    .await
    .map_err(|e| (Stage::Send, e))?;
    let captured = match outcome {
        SendOutcome::Completed(captured) => captured,
        SendOutcome::DeadlineElapsed => {
            return Err((
                Stage::Send,
                ActionError::DeadlineElapsed {
                    timeout_secs: action.retry.timeout_secs,
                },
            ))
        }
        SendOutcome::Cancelled => return Err((Stage::Send, ActionError::Cancelled)),
    };
    ctx.sink.emit(FlowEvent::stage(
        &ctx.run_id,
        &scene_id,
        &action_id,
        Stage::Send.as_str(),
        format!("response status {}", captured.status),
    ));

    let body: Value = serde_json::from_str(&captured.body_text).map_err(|e| {
        (
            Stage::ReadResponse,
            ActionError::ResponseNotJson {
                reason: e.to_string(),
            },
        )
    })?;
    ctx.sink.emit(
        FlowEvent::stage(
            &ctx.run_id,
            &scene_id,
            &action_id,
            Stage::ReadResponse.as_str(),
            "response decoded",
        )
        .with_response_snapshot(format!("{} {}", captured.status, captured.body_text)),
    );

    run_hooks(&action.after_hooks, cancel)
        .await
        .map_err(|e| (Stage::AfterHooks, e))?;
    ctx.sink.emit(FlowEvent::stage(
        &ctx.run_id,
        &scene_id,
        &action_id,
        Stage::AfterHooks.as_str(),
        format!("{} after hook(s) ran", action.after_hooks.len()),
    ));

    assertions::evaluate_all(&action.expectations, &body)
        .map_err(|e| (Stage::Assert, e.into()))?;
    ctx.sink.emit(FlowEvent::stage(
        &ctx.run_id,
        &scene_id,
        &action_id,
        Stage::Assert.as_str(),
        format!("{} expectation(s) passed", action.expectations.len()),
    ));

    ctx.store
        .put(OutputKey::new(&ctx.run_id, &scene_id, &action_id), body)
        .await;
    ctx.sink.emit(FlowEvent::stage(
        &ctx.run_id,
        &scene_id,
        &action_id,
        Stage::StoreOutput.as_str(),
        "output stored",
    ));

    Ok(())
}

fn validate(action: &ActionDefinition) -> Result<(), ActionError> {
    if action.domain.trim().is_empty() {
        return Err(ActionError::Validation { field: "domain" });
    }
    if action.path.trim().is_empty() {
        return Err(ActionError::Validation { field: "path" });
    }
    if action.method.trim().is_empty() {
        return Err(ActionError::Validation { field: "method" });
    }
    Method::from_bytes(action.method.to_uppercase().as_bytes()).map_err(|_| {
        ActionError::InvalidMethod {
            method: action.method.clone(),
        }
    })?;
    Ok(())
}

async fn run_hooks(hooks: &[ActionHook], cancel: &CancellationToken) -> Result<(), ActionError> {
    for hook in hooks {
        match hook.kind.as_str() {
            "wait" | "sleep" => {
                let ms = hook.duration().ok_or_else(|| ActionError::HookMissingDuration {
                    kind: hook.kind.clone(),
                })?;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ActionError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                }
            }
            other => {
                return Err(ActionError::UnknownHook {
                    kind: other.to_string(),
                })
            }
        }
    }
    Ok(())
}

/// Sends the request, retrying transport failures with a fixed pause up to
/// `max_retries` additional attempts. The whole attempt sequence shares one
/// deadline of `timeout_secs`.
async fn send_with_retry(
    client: &reqwest::Client,
    rendered: &request::RenderedRequest,
    max_retries: u32,
    timeout_secs: u64,
    cancel: &CancellationToken,
) -> Result<SendOutcome, ActionError> {
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);

    let send_loop = async {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match attempt_send(client, rendered).await {
                Ok(captured) => return Ok(captured),
                Err(reason) => {
                    if attempt > max_retries {
                        return Err(ActionError::Transport {
                            attempts: attempt,
                            reason,
                        });
                    }
                    warn!(attempt, error = %reason, "transport error, retrying");
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
            }
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(SendOutcome::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Ok(SendOutcome::DeadlineElapsed),
        result = send_loop => result.map(SendOutcome::Completed),
    }
}

async fn attempt_send(
    client: &reqwest::Client,
    rendered: &request::RenderedRequest,
) -> Result<CapturedResponse, String> {
    let method = Method::from_bytes(rendered.method.as_bytes()).map_err(|e| e.to_string())?;
    let mut builder = client.request(method, &rendered.url);
    for (name, value) in &rendered.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = &rendered.body {
        if let Some(content_type) = rendered.content_type {
            builder = builder.header("Content-Type", content_type);
        }
        builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| e.to_string())?;
    let status = response.status().as_u16();
    let body_text = response.text().await.map_err(|e| e.to_string())?;
    Ok(CapturedResponse { status, body_text })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::protocol::SceneDefinition;
    use crate::resolve::ProducerCatalog;
    use crate::store::{FetchPolicy, ResultStore};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP stub: serves every connection the same canned response,
    /// optionally after a delay.
    async fn stub_server(body: &'static str, delay: Duration) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    tokio::time::sleep(delay).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    fn context(sink: Arc<MemorySink>) -> RunContext {
        RunContext {
            run_id: "r1".to_string(),
            store: Arc::new(ResultStore::new()),
            kv: None,
            fetch_policy: FetchPolicy {
                max_retries: 5,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                overall_timeout: Duration::from_secs(1),
            },
            catalog: ProducerCatalog::new(&[] as &[SceneDefinition]),
            sink,
            client: reqwest::Client::new(),
        }
    }

    fn action(doc: serde_json::Value) -> ActionDefinition {
        serde_json::from_value(doc).unwrap()
    }

    #[tokio::test]
    async fn action_runs_to_done_and_stores_output() {
        let addr = stub_server(r#"{"id": "u1"}"#, Duration::ZERO).await;
        let sink = Arc::new(MemorySink::new());
        let ctx = context(Arc::clone(&sink));
        let cancel = CancellationToken::new();

        let mut a = action(json!({
            "action_id": "a1",
            "scene_id": "s1",
            "domain": format!("http://{}", addr),
            "path": "/users/u1",
            "method": "GET",
            "expectations": [
                { "field_path": "id", "operator": "eq", "type": "string", "desired": "u1" }
            ]
        }));

        let report = run_action(&ctx, &cancel, &mut a).await;
        assert_eq!(report.status, ActionStatus::Passed);
        assert_eq!(report.stage, "done");

        let stored = ctx.store.get(&OutputKey::new("r1", "s1", "a1")).await;
        assert_eq!(stored, Some(json!({"id": "u1"})));

        let events = sink.snapshot();
        let stages: Vec<&str> = events.iter().map(|e| e.stage.as_str()).collect();
        assert_eq!(
            stages,
            vec![
                "validate",
                "resolve_dependencies",
                "build_request",
                "before_hooks",
                "send",
                "read_response",
                "after_hooks",
                "assert",
                "store_output",
                "done"
            ]
        );
        assert!(events.last().unwrap().is_terminal);
    }

    #[tokio::test]
    async fn failed_expectation_stops_at_assert() {
        let addr = stub_server(r#"{"id": "u2"}"#, Duration::ZERO).await;
        let sink = Arc::new(MemorySink::new());
        let ctx = context(Arc::clone(&sink));
        let cancel = CancellationToken::new();

        let mut a = action(json!({
            "action_id": "a1",
            "scene_id": "s1",
            "domain": format!("http://{}", addr),
            "path": "/users/u1",
            "method": "GET",
            "expectations": [
                { "field_path": "id", "operator": "eq", "type": "string", "desired": "u1" }
            ]
        }));

        let report = run_action(&ctx, &cancel, &mut a).await;
        assert_eq!(report.status, ActionStatus::Failed);
        assert_eq!(report.stage, "assert");
        assert!(report.error.as_ref().unwrap().contains("E4001"));

        // Saída não é gravada quando a assertion falha.
        assert!(ctx.store.get(&OutputKey::new("r1", "s1", "a1")).await.is_none());

        let last = sink.snapshot().pop().unwrap();
        assert!(last.is_terminal);
        assert_eq!(last.error_code.as_deref(), Some("E4001"));
    }

    #[tokio::test]
    async fn transport_error_exhausts_retries() {
        // Porta sem listener: conexão recusada em todas as tentativas.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = Arc::new(MemorySink::new());
        let ctx = context(Arc::clone(&sink));
        let cancel = CancellationToken::new();

        let mut a = action(json!({
            "action_id": "a1",
            "scene_id": "s1",
            "domain": format!("http://{}", addr),
            "path": "/unreachable",
            "method": "GET",
            "retry": { "max_retries": 1, "timeout_secs": 10 }
        }));

        let report = run_action(&ctx, &cancel, &mut a).await;
        assert_eq!(report.status, ActionStatus::Failed);
        assert_eq!(report.stage, "send");
        let error = report.error.unwrap();
        assert!(error.contains("E3001"));
        assert!(error.contains("2 attempt(s)"));
    }

    #[tokio::test]
    async fn slow_response_reports_deadline_elapsed() {
        let addr = stub_server(r#"{"ok": true}"#, Duration::from_secs(3)).await;
        let sink = Arc::new(MemorySink::new());
        let ctx = context(Arc::clone(&sink));
        let cancel = CancellationToken::new();

        let mut a = action(json!({
            "action_id": "a1",
            "scene_id": "s1",
            "domain": format!("http://{}", addr),
            "path": "/slow",
            "method": "GET",
            "retry": { "max_retries": 0, "timeout_secs": 1 }
        }));

        let started = std::time::Instant::now();
        let report = run_action(&ctx, &cancel, &mut a).await;
        assert_eq!(report.status, ActionStatus::Failed);
        assert_eq!(report.stage, "send");
        assert!(report.error.unwrap().contains("E3002"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn non_json_response_fails_read_stage() {
        let addr = stub_server("not json at all", Duration::ZERO).await;
        let sink = Arc::new(MemorySink::new());
        let ctx = context(Arc::clone(&sink));
        let cancel = CancellationToken::new();

        let mut a = action(json!({
            "action_id": "a1",
            "scene_id": "s1",
            "domain": format!("http://{}", addr),
            "path": "/text",
            "method": "GET"
        }));

        let report = run_action(&ctx, &cancel, &mut a).await;
        assert_eq!(report.status, ActionStatus::Failed);
        assert_eq!(report.stage, "read_response");
        assert!(report.error.unwrap().contains("E3003"));
    }

    #[tokio::test]
    async fn missing_method_fails_validation() {
        let sink = Arc::new(MemorySink::new());
        let ctx = context(Arc::clone(&sink));
        let cancel = CancellationToken::new();

        let mut a = action(json!({
            "action_id": "a1",
            "scene_id": "s1",
            "domain": "http://api.test.com",
            "path": "/users",
            "method": ""
        }));

        let report = run_action(&ctx, &cancel, &mut a).await;
        assert_eq!(report.status, ActionStatus::Failed);
        assert_eq!(report.stage, "validate");
        assert!(report.error.unwrap().contains("method"));
    }

    #[tokio::test]
    async fn unknown_hook_kind_fails_before_send() {
        let addr = stub_server(r#"{}"#, Duration::ZERO).await;
        let sink = Arc::new(MemorySink::new());
        let ctx = context(Arc::clone(&sink));
        let cancel = CancellationToken::new();

        let mut a = action(json!({
            "action_id": "a1",
            "scene_id": "s1",
            "domain": format!("http://{}", addr),
            "path": "/users",
            "method": "GET",
            "before_hooks": [ { "kind": "shell" } ]
        }));

        let report = run_action(&ctx, &cancel, &mut a).await;
        assert_eq!(report.status, ActionStatus::Failed);
        assert_eq!(report.stage, "before_hooks");
        assert!(report.error.unwrap().contains("E1009"));
    }

    #[tokio::test]
    async fn wait_hook_delays_the_send() {
        let addr = stub_server(r#"{}"#, Duration::ZERO).await;
        let sink = Arc::new(MemorySink::new());
        let ctx = context(Arc::clone(&sink));
        let cancel = CancellationToken::new();

        let mut a = action(json!({
            "action_id": "a1",
            "scene_id": "s1",
            "domain": format!("http://{}", addr),
            "path": "/users",
            "method": "GET",
            "before_hooks": [ { "kind": "wait", "duration_ms": 80 } ]
        }));

        let started = std::time::Instant::now();
        let report = run_action(&ctx, &cancel, &mut a).await;
        assert_eq!(report.status, ActionStatus::Passed);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn pre_cancelled_run_aborts_the_send() {
        let addr = stub_server(r#"{}"#, Duration::ZERO).await;
        let sink = Arc::new(MemorySink::new());
        let ctx = context(Arc::clone(&sink));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut a = action(json!({
            "action_id": "a1",
            "scene_id": "s1",
            "domain": format!("http://{}", addr),
            "path": "/users",
            "method": "GET"
        }));

        let report = run_action(&ctx, &cancel, &mut a).await;
        assert_eq!(report.status, ActionStatus::Failed);
        assert_eq!(report.stage, "send");
        assert!(report.error.unwrap().contains("E3005"));
    }
}
