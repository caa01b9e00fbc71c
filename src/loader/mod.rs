// Module: Loader
// Reads scenario files from disk. A scenario file is a JSON array of scene
// definitions; action back-references are filled here so the rest of the
// engine can rely on them.

use crate::protocol::SceneDefinition;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Loads the scene definitions for one run from a JSON file.
pub fn load_scenes_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<SceneDefinition>> {
    let path_ref = path.as_ref();

    let content = fs::read_to_string(path_ref)
        .with_context(|| format!("Failed to read scenario file {:?}", path_ref))?;

    let mut scenes: Vec<SceneDefinition> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse scenario JSON {:?}", path_ref))?;

    for scene in scenes.iter_mut() {
        for action in scene.actions.iter_mut() {
            action.scene_id = scene.scene_id.clone();
        }
    }

    Ok(scenes)
}
