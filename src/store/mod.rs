// Module: Result Store
// Per-run concurrent map of captured action outputs. Producers write once,
// consumers in other scenes poll with backoff until the value shows up.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Identifies one captured output within a run: run ID plus the real
/// producer scene and action IDs, with an optional sub-path discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputKey {
    pub run_id: String,
    pub scene_id: String,
    pub action_id: String,
    pub discriminator: Option<String>,
}

impl OutputKey {
    pub fn new(
        run_id: impl Into<String>,
        scene_id: impl Into<String>,
        action_id: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            scene_id: scene_id.into(),
            action_id: action_id.into(),
            discriminator: None,
        }
    }

    pub fn with_discriminator(mut self, discriminator: impl Into<String>) -> Self {
        self.discriminator = Some(discriminator.into());
        self
    }
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.run_id, self.scene_id, self.action_id)?;
        if let Some(d) = &self.discriminator {
            write!(f, "#{}", d)?;
        }
        Ok(())
    }
}

/// Polling budget for a blocking fetch.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Re-polls after the first miss. Total attempts = max_retries + 1.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub overall_timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            overall_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no output for {key} after {attempts} attempts over {waited_ms}ms")]
    Exhausted {
        key: String,
        attempts: u32,
        waited_ms: u64,
    },

    #[error("wait for {key} cancelled")]
    Cancelled { key: String },
}

/// The only resource shared across scene tasks. Producer writes and consumer
/// reads race by design; every access goes through this API.
#[derive(Debug, Default)]
pub struct ResultStore {
    entries: RwLock<HashMap<OutputKey, Value>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-write-wins insert.
    pub async fn put(&self, key: OutputKey, value: Value) {
        self.entries.write().await.insert(key, value);
    }

    /// Non-blocking lookup.
    pub async fn get(&self, key: &OutputKey) -> Option<Value> {
        self.entries.read().await.get(key).cloned()
    }

    /// Polls `get` with exponential backoff (capped at `max_delay`, with
    /// jitter) until the value appears, the retry budget runs out, the
    /// overall timeout elapses, or the run is cancelled, whichever first.
    pub async fn get_blocking(
        &self,
        key: &OutputKey,
        policy: &FetchPolicy,
        cancel: &CancellationToken,
    ) -> Result<Value, FetchError> {
        let started = Instant::now();
        let deadline = started + policy.overall_timeout;
        let mut attempts: u32 = 0;
        let mut delay = policy.base_delay;

        loop {
            attempts += 1;
            if let Some(value) = self.get(key).await {
                return Ok(value);
            }

            if attempts > policy.max_retries {
                return Err(FetchError::Exhausted {
                    key: key.to_string(),
                    attempts,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(FetchError::Exhausted {
                    key: key.to_string(),
                    attempts,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            // Pausa limitada pelo deadline global; jitter evita que
            // consumidores sincronizem as leituras.
            let pause = jittered(delay).min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(FetchError::Cancelled { key: key.to_string() });
                }
                _ = tokio::time::sleep(pause) => {}
            }

            delay = (delay * 2).min(policy.max_delay);
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let base = delay.as_millis() as u64;
    if base == 0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0..=base / 4);
    Duration::from_millis(base + jitter)
}
