//! `stimuli.json`: what was rendered, for building the listening-test definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MANIFEST_FILE: &str = "stimuli.json";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StimulusKind {
    Reference,
    Method,
    QualityAnchor,
    LevelAnchor,
    /// A named variant of the anchor set, written as is.
    Anchor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub track_id: u32,
    pub metric: String,
    /// Folder relative to the output root.
    pub folder: String,
    pub method: String,
    pub kind: StimulusKind,
    /// Target level of a mix; absent for unmixed stimuli.
    pub level_db: Option<f64>,
    /// File name inside `folder`.
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub generated_at: DateTime<Utc>,
    pub target: String,
    pub levels: Vec<f64>,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(target: &str, levels: &[f64], entries: Vec<ManifestEntry>) -> Self {
        Self {
            generated_at: Utc::now(),
            target: target.to_string(),
            levels: levels.to_vec(),
            entries,
        }
    }

    /// Distinct folders in first-seen order.
    pub fn folders(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.entries
            .iter()
            .map(|e| e.folder.as_str())
            .filter(|f| seen.insert(*f))
            .collect()
    }

    /// Distinct separation methods (reference and anchors excluded).
    pub fn methods(&self) -> BTreeSet<&str> {
        self.entries
            .iter()
            .filter(|e| e.kind == StimulusKind::Method)
            .map(|e| e.method.as_str())
            .collect()
    }

    /// Write as pretty JSON into `dir`, returning the file path.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, ManifestError> {
        std::fs::create_dir_all(dir).map_err(io_error(dir))?;
        let path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).map_err(io_error(&path))?;
        log::info!("Wrote manifest with {} stimuli to {}", self.entries.len(), path.display());
        Ok(path)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ManifestError {
    let path = path.display().to_string();
    move |source| ManifestError::Io { path, source }
}
