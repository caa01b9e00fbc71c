// Module: Executors
// Turns one resolved action definition into an HTTP call: request
// rendering, send with retry under an explicit deadline, response capture.

pub mod action;
pub mod request;

use std::sync::Arc;

use crate::events::EventSink;
use crate::kv::KvClient;
use crate::resolve::ProducerCatalog;
use crate::store::{FetchPolicy, ResultStore};

/// Everything an action needs from the owning run. Built once by the engine
/// and shared read-only across scene tasks; the result store is the only
/// member with interior mutability.
pub struct RunContext {
    pub run_id: String,
    pub store: Arc<ResultStore>,
    pub kv: Option<Arc<dyn KvClient>>,
    pub fetch_policy: FetchPolicy,
    pub catalog: ProducerCatalog,
    pub sink: Arc<dyn EventSink>,
    pub client: reqwest::Client,
}
