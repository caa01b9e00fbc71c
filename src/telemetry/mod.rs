//! # Módulo de Telemetria
//!
//! Integração com OpenTelemetry para observabilidade distribuída: spans de
//! cada execução (run → scene → action) exportados via OTLP, mais logging
//! estruturado no console.
//!
//! ## Configuração via variáveis de ambiente:
//!
//! - `OTEL_SERVICE_NAME`: nome do serviço nos traces
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: URL do coletor OTLP (gRPC)
//! - `OTEL_TRACES_SAMPLER_ARG`: taxa de sampling (0.0 a 1.0)
//! - `RUST_LOG`: filtro de log do console
//!
//! Sem endpoint configurado, apenas o console é usado.

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_sdk::Resource;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuração do sistema de telemetria.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// Endpoint OTLP (gRPC). `None` = só console.
    pub otlp_endpoint: Option<String>,
    /// 1.0 = todos os traces, 0.0 = nenhum.
    pub sampling_ratio: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "scene-runner".to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otlp_endpoint = Some(endpoint);
        }
        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
            if let Ok(parsed) = ratio.parse() {
                config.sampling_ratio = parsed;
            }
        }
        config
    }
}

/// Inicializa tracing + OpenTelemetry. Chamar uma vez, no início.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match &config.otlp_endpoint {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint.clone()),
                )
                .with_trace_config(
                    sdktrace::config()
                        .with_sampler(sdktrace::Sampler::TraceIdRatioBased(config.sampling_ratio))
                        .with_resource(Resource::new(vec![KeyValue::new(
                            "service.name",
                            config.service_name.clone(),
                        )])),
                )
                .install_batch(Tokio)?;

            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()?;
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .try_init()?;
        }
    }

    Ok(())
}

/// Flush final dos dados de trace. Chamar antes de encerrar o processo.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
