// Request rendering: URL assembly, body serialization and the diagnostic
// raw-request string attached to flow events.

use serde_json::Value;
use thiserror::Error;

use crate::extract::render_scalar;
use crate::protocol::{ActionDefinition, BodyKind};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to serialize payload: {reason}")]
    Serialize { reason: String },
}

/// A fully assembled request, ready to send and to snapshot into events.
#[derive(Debug, Clone)]
pub struct RenderedRequest {
    pub method: String,
    pub url: String,
    /// Sorted by name so rendering is deterministic.
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub content_type: Option<&'static str>,
}

/// Assembles the outgoing request from the (already resolved) action
/// definition. Query parameters and headers are ordered by name so two runs
/// of the same definition render byte-identical requests.
pub fn build(action: &ActionDefinition) -> Result<RenderedRequest, BuildError> {
    let url = assemble_url(action);

    let mut headers: Vec<(String, String)> = action
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let (body, content_type) = if action.payload.is_empty() {
        (None, None)
    } else {
        match action.body_kind {
            BodyKind::Json => {
                let body = serde_json::to_string(&Value::Object(action.payload.clone()))
                    .map_err(|e| BuildError::Serialize {
                        reason: e.to_string(),
                    })?;
                (Some(body), Some("application/json"))
            }
            BodyKind::Form => (
                Some(form_encode(&action.payload)),
                Some("application/x-www-form-urlencoded"),
            ),
        }
    };

    Ok(RenderedRequest {
        method: action.method.to_uppercase(),
        url,
        headers,
        body,
        content_type,
    })
}

fn assemble_url(action: &ActionDefinition) -> String {
    let base = action.domain.trim_end_matches('/');
    let path = if action.path.starts_with('/') {
        action.path.clone()
    } else {
        format!("/{}", action.path)
    };

    let mut url = format!("{}{}", base, path);
    if !action.query_params.is_empty() {
        let mut params: Vec<(&String, &String)> = action.query_params.iter().collect();
        params.sort_by(|a, b| a.0.cmp(b.0));
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        url.push('?');
        url.push_str(&query);
    }
    url
}

fn form_encode(payload: &serde_json::Map<String, Value>) -> String {
    let mut fields: Vec<(&String, &Value)> = payload.iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));
    fields
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                urlencoding::encode(k),
                urlencoding::encode(&render_scalar(v))
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

impl RenderedRequest {
    /// Diagnostic rendering for flow-event snapshots.
    pub fn raw(&self) -> String {
        let mut out = format!("{} {}", self.method, self.url);
        for (name, value) in &self.headers {
            out.push('\n');
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
        }
        if let Some(content_type) = self.content_type {
            out.push_str("\nContent-Type: ");
            out.push_str(content_type);
        }
        if let Some(body) = &self.body {
            out.push_str("\n\n");
            out.push_str(body);
        }
        out
    }
}
