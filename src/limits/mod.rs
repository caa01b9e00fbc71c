//! # Módulo de Limites de Execução
//!
//! Define os valores padrão do motor: orçamento de polling para buscas
//! bloqueantes no result store e timeout do cliente HTTP.
//!
//! ## Por que isso é importante?
//!
//! 1. **Previsibilidade**: toda espera bloqueante tem um fim conhecido
//! 2. **Recursos controlados**: consumidores não ficam pendurados
//! 3. **Sem estado global**: os padrões vivem num objeto injetado,
//!    nunca em variáveis de pacote
//!
//! ## Limites configuráveis (variáveis de ambiente):
//!
//! | Variável                            | Padrão | Descrição                       |
//! |-------------------------------------|--------|---------------------------------|
//! | SCENE_RUNNER_FETCH_RETRIES          | 10     | Re-polls por busca bloqueante   |
//! | SCENE_RUNNER_FETCH_BASE_DELAY_MS    | 100    | Delay inicial do backoff        |
//! | SCENE_RUNNER_FETCH_MAX_DELAY_MS     | 2000   | Teto do backoff exponencial     |
//! | SCENE_RUNNER_FETCH_TIMEOUT_SECS     | 30     | Timeout total por busca         |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::FetchPolicy;

pub const DEFAULT_FETCH_RETRIES: u32 = 10;
pub const DEFAULT_FETCH_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_FETCH_MAX_DELAY_MS: u64 = 2000;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Padrões do motor para uma execução. Criado uma vez e injetado; nunca
/// mutado durante a execução.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDefaults {
    /// Re-polls por busca bloqueante de saída de cena.
    pub fetch_retries: u32,
    /// Delay inicial entre polls.
    pub fetch_base_delay_ms: u64,
    /// Teto do backoff exponencial.
    pub fetch_max_delay_ms: u64,
    /// Timeout total de uma busca bloqueante.
    pub fetch_timeout_secs: u64,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            fetch_retries: DEFAULT_FETCH_RETRIES,
            fetch_base_delay_ms: DEFAULT_FETCH_BASE_DELAY_MS,
            fetch_max_delay_ms: DEFAULT_FETCH_MAX_DELAY_MS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
        }
    }
}

impl EngineDefaults {
    /// Carrega os padrões com overrides do ambiente.
    pub fn from_env() -> Self {
        let mut defaults = Self::default();

        if let Ok(val) = std::env::var("SCENE_RUNNER_FETCH_RETRIES") {
            if let Ok(n) = val.parse() {
                defaults.fetch_retries = n;
            }
        }
        if let Ok(val) = std::env::var("SCENE_RUNNER_FETCH_BASE_DELAY_MS") {
            if let Ok(n) = val.parse() {
                defaults.fetch_base_delay_ms = n;
            }
        }
        if let Ok(val) = std::env::var("SCENE_RUNNER_FETCH_MAX_DELAY_MS") {
            if let Ok(n) = val.parse() {
                defaults.fetch_max_delay_ms = n;
            }
        }
        if let Ok(val) = std::env::var("SCENE_RUNNER_FETCH_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                defaults.fetch_timeout_secs = n;
            }
        }

        defaults
    }

    /// Orçamento restritivo, pensado para testes.
    pub fn strict() -> Self {
        Self {
            fetch_retries: 3,
            fetch_base_delay_ms: 10,
            fetch_max_delay_ms: 40,
            fetch_timeout_secs: 2,
        }
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            max_retries: self.fetch_retries,
            base_delay: Duration::from_millis(self.fetch_base_delay_ms),
            max_delay: Duration::from_millis(self.fetch_max_delay_ms),
            overall_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }
}
