// Module: Engine
// Top-level execution: owns the run ID, the result store and the event
// sink, launches one task per scene and aggregates a report. The engine
// itself never fails: it returns once every scene reached a terminal
// state, whatever that state is.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::events::{EventSink, FlowEvent, TracingSink};
use crate::executors::RunContext;
use crate::kv::KvClient;
use crate::limits::EngineDefaults;
use crate::protocol::{RunReport, SceneDefinition, SceneReport, SceneStatus};
use crate::resolve::ProducerCatalog;
use crate::scene::run_scene;
use crate::store::ResultStore;

/// One prepared run. Build it, optionally wire collaborators, then `start`.
pub struct Run {
    run_id: String,
    scenes: Vec<SceneDefinition>,
    kv: Option<Arc<dyn KvClient>>,
    sink: Arc<dyn EventSink>,
    defaults: EngineDefaults,
    client: reqwest::Client,
}

impl Run {
    pub fn new(scenes: Vec<SceneDefinition>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            scenes,
            kv: None,
            sink: Arc::new(TracingSink),
            defaults: EngineDefaults::default(),
            client: reqwest::Client::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn with_kv(mut self, kv: Arc<dyn KvClient>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_defaults(mut self, defaults: EngineDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Runs every scene concurrently to a terminal state. Cross-scene
    /// ordering only arises from blocking dependency fetches; scenes with
    /// disjoint dependencies interleave freely.
    #[instrument(name = "run", skip_all, fields(run_id = %self.run_id))]
    pub async fn start(mut self, cancel: CancellationToken) -> RunReport {
        let started_at = Utc::now();

        // Scene back-references; idempotent if the loader already set them.
        for scene in self.scenes.iter_mut() {
            for action in scene.actions.iter_mut() {
                action.scene_id = scene.scene_id.clone();
            }
        }

        let catalog = ProducerCatalog::new(&self.scenes);
        let ctx = Arc::new(RunContext {
            run_id: self.run_id.clone(),
            store: Arc::new(ResultStore::new()),
            kv: self.kv.clone(),
            fetch_policy: self.defaults.fetch_policy(),
            catalog,
            sink: Arc::clone(&self.sink),
            client: self.client.clone(),
        });

        self.sink.emit(FlowEvent::stage(
            &self.run_id,
            "",
            &self.run_id,
            "run_started",
            format!("run started with {} scene(s)", self.scenes.len()),
        ));
        info!(scenes = self.scenes.len(), "run started");

        let scene_order: Vec<String> =
            self.scenes.iter().map(|s| s.scene_id.clone()).collect();

        let mut join_set = JoinSet::new();
        for (index, scene) in self.scenes.drain(..).enumerate() {
            let ctx = Arc::clone(&ctx);
            let cancel = cancel.child_token();
            join_set.spawn(async move { (index, run_scene(ctx, cancel, scene).await) });
        }

        let mut by_index: HashMap<usize, SceneReport> = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, report)) => {
                    by_index.insert(index, report);
                }
                Err(join_error) => {
                    error!(error = %join_error, "scene task aborted");
                }
            }
        }

        // Report in declared order; a scene whose task died still shows up.
        let mut scenes = Vec::with_capacity(scene_order.len());
        for (index, scene_id) in scene_order.into_iter().enumerate() {
            let report = by_index.remove(&index).unwrap_or(SceneReport {
                scene_id,
                status: SceneStatus::Failed,
                actions: Vec::new(),
            });
            scenes.push(report);
        }

        let passed = scenes.iter().all(|s| s.status == SceneStatus::Passed);
        let status = if passed { "passed" } else { "failed" };

        self.sink.emit(
            FlowEvent::stage(
                &self.run_id,
                "",
                &self.run_id,
                "run_finished",
                format!("run finished: {}", status),
            )
            .terminal(),
        );
        info!(status, "run finished");

        RunReport {
            run_id: self.run_id,
            status: status.to_string(),
            started_at: started_at.to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
            scenes,
        }
    }
}
