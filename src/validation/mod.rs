//! # Módulo de Validação de Cenários
//!
//! Valida o conjunto de cenas antes da execução, para falhar cedo com
//! mensagens específicas em vez de falhar no meio de uma requisição.
//!
//! Todos os problemas são coletados de uma vez (não para no primeiro).
//!
//! ## Validações realizadas:
//!
//! 1. Execução não vazia, IDs não vazios e sem duplicatas
//! 2. Campos de requisição obrigatórios (domain, path, method)
//! 3. Método HTTP válido
//! 4. Dependências de saída de cena apontam para produtores reais
//! 5. Produtor na mesma cena precede o consumidor
//! 6. Referências de produtor sem tokens de placeholder (`$sid`, `$aid`)
//! 7. Hooks conhecidos e com duração

use thiserror::Error;

use crate::errors::ErrorCode;
use crate::protocol::{ActionDefinition, DependencySource, SceneDefinition};
use crate::resolve::ProducerCatalog;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("no scenes defined")]
    EmptyRun,

    #[error("scene '{scene_id}': empty ID is not allowed")]
    EmptyId { scene_id: String },

    #[error("scene '{scene_id}' is defined more than once")]
    DuplicateScene { scene_id: String },

    #[error("scene '{scene_id}': action '{action_id}' is defined more than once")]
    DuplicateAction { scene_id: String, action_id: String },

    #[error("scene '{scene_id}', action '{action_id}': required field '{field}' is missing")]
    MissingRequestField {
        scene_id: String,
        action_id: String,
        field: &'static str,
    },

    #[error("scene '{scene_id}', action '{action_id}': invalid HTTP method '{method}'")]
    InvalidHttpMethod {
        scene_id: String,
        action_id: String,
        method: String,
    },

    #[error("scene '{scene_id}', action '{action_id}': dependency names unknown producer {producer_scene}/{producer_action}")]
    UnknownProducer {
        scene_id: String,
        action_id: String,
        producer_scene: String,
        producer_action: String,
    },

    #[error("scene '{scene_id}', action '{action_id}': depends on '{producer_action}' which does not precede it")]
    ForwardReference {
        scene_id: String,
        action_id: String,
        producer_action: String,
    },

    #[error("scene '{scene_id}', action '{action_id}': producer reference '{token}' contains an unsubstituted placeholder")]
    PlaceholderProducerKey {
        scene_id: String,
        action_id: String,
        token: String,
    },

    #[error("scene '{scene_id}', action '{action_id}': invalid hook '{kind}'")]
    InvalidHook {
        scene_id: String,
        action_id: String,
        kind: String,
    },
}

impl ValidationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::EmptyRun => ErrorCode::EMPTY_RUN,
            Self::EmptyId { .. } => ErrorCode::EMPTY_ID,
            Self::DuplicateScene { .. } | Self::DuplicateAction { .. } => ErrorCode::DUPLICATE_ID,
            Self::MissingRequestField { .. } => ErrorCode::MISSING_REQUEST_FIELD,
            Self::InvalidHttpMethod { .. } => ErrorCode::INVALID_HTTP_METHOD,
            Self::UnknownProducer { .. } => ErrorCode::UNKNOWN_PRODUCER,
            Self::ForwardReference { .. } => ErrorCode::FORWARD_REFERENCE,
            Self::PlaceholderProducerKey { .. } => ErrorCode::PLACEHOLDER_PRODUCER_KEY,
            Self::InvalidHook { .. } => ErrorCode::INVALID_HOOK,
        }
    }
}

const VALID_HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

const KNOWN_HOOK_KINDS: &[&str] = &["wait", "sleep"];

pub type ValidationResult = Result<(), Vec<ValidationError>>;

/// Valida o conjunto completo de cenas.
pub fn validate_run(scenes: &[SceneDefinition]) -> ValidationResult {
    let mut errors = Vec::new();

    if scenes.is_empty() {
        return Err(vec![ValidationError::EmptyRun]);
    }

    let mut seen_scenes = Vec::new();
    for scene in scenes {
        if scene.scene_id.trim().is_empty() {
            errors.push(ValidationError::EmptyId {
                scene_id: "<vazio>".to_string(),
            });
            continue;
        }
        if seen_scenes.contains(&scene.scene_id.as_str()) {
            errors.push(ValidationError::DuplicateScene {
                scene_id: scene.scene_id.clone(),
            });
        }
        seen_scenes.push(scene.scene_id.as_str());
    }

    let catalog = ProducerCatalog::new(scenes);
    for scene in scenes {
        let mut seen_actions = Vec::new();
        for action in &scene.actions {
            if action.action_id.trim().is_empty() {
                errors.push(ValidationError::EmptyId {
                    scene_id: scene.scene_id.clone(),
                });
                continue;
            }
            if seen_actions.contains(&action.action_id.as_str()) {
                errors.push(ValidationError::DuplicateAction {
                    scene_id: scene.scene_id.clone(),
                    action_id: action.action_id.clone(),
                });
            }
            seen_actions.push(action.action_id.as_str());

            validate_action(scene, action, &catalog, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_action(
    scene: &SceneDefinition,
    action: &ActionDefinition,
    catalog: &ProducerCatalog,
    errors: &mut Vec<ValidationError>,
) {
    let scene_id = scene.scene_id.clone();
    let action_id = action.action_id.clone();

    for (field, value) in [
        ("domain", &action.domain),
        ("path", &action.path),
        ("method", &action.method),
    ] {
        if value.trim().is_empty() {
            errors.push(ValidationError::MissingRequestField {
                scene_id: scene_id.clone(),
                action_id: action_id.clone(),
                field,
            });
        }
    }

    if !action.method.trim().is_empty()
        && !VALID_HTTP_METHODS.contains(&action.method.to_uppercase().as_str())
    {
        errors.push(ValidationError::InvalidHttpMethod {
            scene_id: scene_id.clone(),
            action_id: action_id.clone(),
            method: action.method.clone(),
        });
    }

    for dep in &action.dependencies {
        let (producer_scene, producer_action) = match &dep.source {
            DependencySource::SceneOutput { scene, action } => (scene, action),
            _ => continue,
        };

        // Chaves são compostas dos IDs reais; um token `$...` indica um
        // template nunca substituído na definição.
        let mut has_placeholder = false;
        for token in [producer_scene, producer_action] {
            if token.contains('$') {
                errors.push(ValidationError::PlaceholderProducerKey {
                    scene_id: scene_id.clone(),
                    action_id: action_id.clone(),
                    token: token.clone(),
                });
                has_placeholder = true;
            }
        }
        if has_placeholder {
            continue;
        }

        if catalog.position(producer_scene, producer_action).is_none() {
            errors.push(ValidationError::UnknownProducer {
                scene_id: scene_id.clone(),
                action_id: action_id.clone(),
                producer_scene: producer_scene.clone(),
                producer_action: producer_action.clone(),
            });
            continue;
        }

        if catalog
            .check_scene_output(&scene_id, &action_id, producer_scene, producer_action)
            .is_err()
            && producer_scene == &scene_id
        {
            errors.push(ValidationError::ForwardReference {
                scene_id: scene_id.clone(),
                action_id: action_id.clone(),
                producer_action: producer_action.clone(),
            });
        }
    }

    for hook in action.before_hooks.iter().chain(action.after_hooks.iter()) {
        if !KNOWN_HOOK_KINDS.contains(&hook.kind.as_str()) || hook.duration().is_none() {
            errors.push(ValidationError::InvalidHook {
                scene_id: scene_id.clone(),
                action_id: action_id.clone(),
                kind: hook.kind.clone(),
            });
        }
    }
}
