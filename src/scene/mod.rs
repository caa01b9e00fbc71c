// Module: Scene
// Runs one scene's actions strictly in declared order on its own task.
// The whole sequence is raced against the scene timeout and external
// cancellation; an abort never rolls back outputs already stored.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::events::FlowEvent;
use crate::executors::action::run_action;
use crate::executors::RunContext;
use crate::protocol::{ActionReport, ActionStatus, SceneDefinition, SceneReport, SceneStatus};

#[instrument(name = "scene", skip_all, fields(scene_id = %scene.scene_id))]
pub async fn run_scene(
    ctx: Arc<RunContext>,
    cancel: CancellationToken,
    mut scene: SceneDefinition,
) -> SceneReport {
    let scene_id = scene.scene_id.clone();
    ctx.sink.emit(FlowEvent::stage(
        &ctx.run_id,
        &scene_id,
        &scene_id,
        "scene_started",
        format!("scene '{}' started ({} actions)", scene_id, scene.actions.len()),
    ));

    // Progress lands here as each action finishes, so an aborted sequence
    // still reports what already ran.
    let finished: Arc<Mutex<Vec<ActionReport>>> = Arc::new(Mutex::new(Vec::new()));

    let timeout = Duration::from_secs(scene.timeout_secs);
    let sequence = {
        let ctx = Arc::clone(&ctx);
        let cancel = cancel.clone();
        let finished = Arc::clone(&finished);
        async move {
            let mut failed = false;
            for action in scene.actions.iter_mut() {
                if failed {
                    finished
                        .lock()
                        .expect("scene progress poisoned")
                        .push(skipped(action.scene_id.clone(), action.action_id.clone()));
                    continue;
                }
                let report = run_action(&ctx, &cancel, action).await;
                let action_failed = report.status == ActionStatus::Failed;
                finished.lock().expect("scene progress poisoned").push(report);
                if action_failed {
                    failed = true;
                }
            }
            if failed {
                SceneStatus::Failed
            } else {
                SceneStatus::Passed
            }
        }
    };

    // Biased so an abort wins deterministically over a sequence that became
    // ready in the same poll.
    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            warn!("scene cancelled");
            SceneStatus::Cancelled
        }
        _ = tokio::time::sleep(timeout) => {
            warn!(timeout_secs = timeout.as_secs(), "scene timed out");
            SceneStatus::TimedOut
        }
        status = sequence => status,
    };

    let mut actions = finished.lock().expect("scene progress poisoned").clone();
    // Actions the abort cut off never ran; they still show up in the report.
    if actions.len() < total_actions(&ctx, &scene_id) {
        let ran: Vec<String> = actions.iter().map(|r| r.action_id.clone()).collect();
        for action_id in missing_actions(&ctx, &scene_id, &ran) {
            actions.push(skipped(scene_id.clone(), action_id));
        }
    }

    match status {
        SceneStatus::Passed => {
            ctx.sink.emit(
                FlowEvent::stage(
                    &ctx.run_id,
                    &scene_id,
                    &scene_id,
                    "scene_done",
                    format!("scene '{}' passed", scene_id),
                )
                .terminal(),
            );
            info!("scene passed");
        }
        ref aborted => {
            let (stage, code) = match aborted {
                SceneStatus::TimedOut => ("scene_timeout", crate::errors::ErrorCode::SCENE_TIMEOUT),
                SceneStatus::Cancelled => ("scene_cancelled", crate::errors::ErrorCode::RUN_CANCELLED),
                _ => ("scene_failed", crate::errors::ErrorCode::EXPECTATION_FAILED),
            };
            let event = FlowEvent::stage(
                &ctx.run_id,
                &scene_id,
                &scene_id,
                stage,
                format!("scene '{}' ended: {:?}", scene_id, aborted),
            )
            .terminal();
            let event = match aborted {
                SceneStatus::Failed => event,
                _ => event.with_error_code(code),
            };
            ctx.sink.emit(event);
        }
    }

    SceneReport {
        scene_id,
        status,
        actions,
    }
}

fn skipped(scene_id: String, action_id: String) -> ActionReport {
    ActionReport {
        scene_id,
        action_id,
        status: ActionStatus::Skipped,
        stage: "skipped".to_string(),
        duration_ms: 0,
        error: None,
    }
}

fn total_actions(ctx: &RunContext, scene_id: &str) -> usize {
    ctx.catalog
        .action_ids(scene_id)
        .map(|ids| ids.len())
        .unwrap_or(0)
}

fn missing_actions(ctx: &RunContext, scene_id: &str, ran: &[String]) -> Vec<String> {
    ctx.catalog
        .action_ids(scene_id)
        .map(|ids| {
            ids.iter()
                .filter(|id| !ran.contains(*id))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}
