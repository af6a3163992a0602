pub mod dataset;
pub mod stems;

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::REFERENCE_METHOD;
use dataset::{LookupError, ReferenceDataset, normalize_title};
use stems::StemVocabulary;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot resolve audio for track {track_id} ({method}/{target}): {source}")]
    Resolve {
        track_id: u32,
        method: String,
        target: String,
        source: LookupError,
    },
    #[error("Row for track {track_id} ({method}/{target}) has no filepath and no estimates root is configured")]
    NoFilepath {
        track_id: u32,
        method: String,
        target: String,
    },
}

/// One score of one stem of one separation method on one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub track_id: u32,
    pub title: String,
    pub method: String,
    pub target: String,
    pub metric: String,
    /// NaN for reference rows.
    pub score: f64,
    #[serde(default)]
    pub filepath: Option<PathBuf>,
}

impl ScoredRecord {
    pub fn is_reference(&self) -> bool {
        self.method == REFERENCE_METHOD
    }
}

/// Raw CSV row as published with the evaluation campaign.
#[derive(Debug, Deserialize)]
struct CsvRow {
    track_id: u32,
    title: String,
    method: String,
    target: String,
    metric: String,
    score: f64,
    #[serde(default, deserialize_with = "deserialize_flag")]
    is_dev: bool,
    #[serde(default)]
    filepath: Option<PathBuf>,
}

/// Accepts `0/1` as well as `true/false` (any case).
fn deserialize_flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let raw = String::deserialize(d)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "0.0" => Ok(false),
        "1" | "true" | "1.0" => Ok(true),
        other => Err(serde::de::Error::custom(format!("invalid flag '{other}'"))),
    }
}

/// Filters applied while loading the campaign table.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub include_dev: bool,
    pub excluded_methods: Vec<String>,
    pub stems: StemVocabulary,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            include_dev: false,
            excluded_methods: vec!["IBM".to_string()],
            stems: StemVocabulary::default(),
        }
    }
}

/// Where rows without a `filepath` column get their audio from.
pub struct PathResolver<'a> {
    pub dataset: &'a ReferenceDataset,
    pub estimates_root: &'a Path,
}

/// In-memory score table. Row order is the load order unless sorted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreTable {
    records: Vec<ScoredRecord>,
}

impl ScoreTable {
    pub fn new(records: Vec<ScoredRecord>) -> Self {
        Self { records }
    }

    /// Load the campaign CSV, keeping only eligible rows (see [`LoadOptions`]).
    pub fn from_csv(
        path: &Path,
        options: &LoadOptions,
        resolver: Option<&PathResolver<'_>>,
    ) -> Result<Self, TableError> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        let mut total = 0usize;

        for row in reader.deserialize() {
            let row: CsvRow = row?;
            total += 1;
            if row.is_dev && !options.include_dev {
                continue;
            }
            if options.excluded_methods.iter().any(|m| *m == row.method) {
                continue;
            }
            if !options.stems.contains(&row.target) {
                continue;
            }
            records.push(ScoredRecord {
                track_id: row.track_id,
                title: row.title,
                method: row.method,
                target: row.target,
                metric: row.metric,
                score: row.score,
                filepath: row.filepath,
            });
        }

        let mut table = Self { records }.retain_complete(&options.stems);
        log::info!(
            "Loaded {} of {} rows from {} ({} tracks)",
            table.len(),
            total,
            path.display(),
            table.track_ids().len()
        );

        if let Some(resolver) = resolver {
            table.resolve_filepaths(resolver)?;
        }
        Ok(table)
    }

    /// Read a table previously written with [`ScoreTable::write_csv`], as is.
    pub fn from_csv_unfiltered(path: &Path) -> Result<Self, TableError> {
        let mut reader = csv::Reader::from_path(path)?;
        let records = reader
            .deserialize()
            .collect::<Result<Vec<ScoredRecord>, _>>()?;
        Ok(Self { records })
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), TableError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Drop every (track_id, method, metric) group whose stems are incomplete.
    pub fn retain_complete(self, stems: &StemVocabulary) -> Self {
        let mut groups: HashMap<(u32, &str, &str), Vec<&str>> = HashMap::new();
        for r in &self.records {
            groups
                .entry((r.track_id, r.method.as_str(), r.metric.as_str()))
                .or_default()
                .push(r.target.as_str());
        }
        let complete: BTreeSet<(u32, String, String)> = groups
            .into_iter()
            .filter(|(_, targets)| stems.is_complete(targets.iter().copied()))
            .map(|((t, m, k), _)| (t, m.to_string(), k.to_string()))
            .collect();

        let before = self.records.len();
        let records: Vec<ScoredRecord> = self
            .records
            .into_iter()
            .filter(|r| complete.contains(&(r.track_id, r.method.clone(), r.metric.clone())))
            .collect();
        if records.len() < before {
            log::debug!(
                "Dropped {} rows from groups with incomplete stems",
                before - records.len()
            );
        }
        Self { records }
    }

    /// Fill in missing filepaths from the estimates layout.
    pub fn resolve_filepaths(&mut self, resolver: &PathResolver<'_>) -> Result<(), TableError> {
        for r in self.records.iter_mut().filter(|r| r.filepath.is_none()) {
            let path = resolver
                .dataset
                .estimate_path(
                    resolver.estimates_root,
                    &normalize_title(&r.title),
                    &r.method,
                    &r.target,
                )
                .map_err(|e| TableError::Resolve {
                    track_id: r.track_id,
                    method: r.method.clone(),
                    target: r.target.clone(),
                    source: e,
                })?;
            r.filepath = Some(path);
        }
        Ok(())
    }

    /// Error out on the first row that still lacks a filepath.
    pub fn require_filepaths(&self) -> Result<(), TableError> {
        match self.records.iter().find(|r| r.filepath.is_none()) {
            Some(r) => Err(TableError::NoFilepath {
                track_id: r.track_id,
                method: r.method.clone(),
                target: r.target.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn records(&self) -> &[ScoredRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScoredRecord> {
        self.records.iter()
    }

    /// Rows matching `keep`, cloned into a new table.
    pub fn filter<F>(&self, mut keep: F) -> Self
    where
        F: FnMut(&ScoredRecord) -> bool,
    {
        Self {
            records: self.records.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }

    pub fn track_ids(&self) -> BTreeSet<u32> {
        self.records.iter().map(|r| r.track_id).collect()
    }

    /// Distinct methods of one track, excluding the reference.
    pub fn methods_for_track(&self, track_id: u32) -> BTreeSet<&str> {
        self.records
            .iter()
            .filter(|r| r.track_id == track_id && !r.is_reference())
            .map(|r| r.method.as_str())
            .collect()
    }

    /// Sort by (track_id, method, target), stable for ties.
    pub fn sort(&mut self) {
        self.records.sort_by(|a, b| {
            a.track_id
                .cmp(&b.track_id)
                .then_with(|| a.method.cmp(&b.method))
                .then_with(|| a.target.cmp(&b.target))
        });
    }

    pub fn extend(&mut self, other: ScoreTable) {
        self.records.extend(other.records);
    }
}
