use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::sampling::DispersionConfig;
use crate::selection::SelectionRequest;
use crate::table::LoadOptions;
use crate::table::stems::StemVocabulary;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Application configuration loaded from TOML config file.
/// Every section is optional.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub datasets: DatasetsConfig,
    pub selection: SelectionConfig,
    pub dispersion: DispersionConfig,
    pub render: RenderConfig,
    pub polarity: PolarityConfig,
}

/// Where the score table and audio live.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DatasetsConfig {
    /// Campaign score table (CSV).
    pub scores_csv: Option<PathBuf>,
    /// DSD100-style `Sources/` directory, scanned when no manifest is given.
    pub reference_root: Option<PathBuf>,
    /// YAML listing of reference stems; takes precedence over `reference_root`.
    pub reference_manifest: Option<PathBuf>,
    /// Root of the per-method estimate trees.
    pub estimates_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub num_tracks: usize,
    pub num_algos: usize,
    pub metric: String,
    /// Metrics visited by `run`, each with its own disjoint set of tracks.
    pub metrics: Vec<String>,
    pub target: String,
    pub remove_outliers: bool,
    pub only_algos: Option<Vec<String>>,
    pub exclude_tracks: Vec<u32>,
    pub exclude_algos_in_tracks: BTreeMap<String, Vec<u32>>,
    pub excluded_methods: Vec<String>,
    pub include_dev: bool,
    /// Require accompaniment alongside the four source stems.
    pub strict_stems: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            num_tracks: 2,
            num_algos: 8,
            metric: "SDR".to_string(),
            metrics: vec!["SDR".to_string(), "SIR".to_string(), "SAR".to_string()],
            target: "vocals".to_string(),
            remove_outliers: true,
            only_algos: None,
            exclude_tracks: Vec::new(),
            exclude_algos_in_tracks: BTreeMap::new(),
            excluded_methods: vec!["IBM".to_string()],
            include_dev: false,
            strict_stems: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Expected sample rate of every input file (Hz).
    pub sample_rate: u32,
    /// Loudness every written file is normalized to (LUFS).
    pub target_loudness: f64,
    /// Target level offsets (dB) relative to the accompaniment.
    pub mixing_levels: Vec<f64>,
    /// Active window length (s).
    pub segment_duration: f64,
    /// Energy percentile the active window is matched to.
    pub percentile: f64,
    /// Fade length at both window edges (s).
    pub ramp_duration: f64,
    pub force_mono: bool,
    /// Target level in the level anchor, relative to the mix level (dB).
    pub level_anchor_offset: f64,
    pub trim_factor_distorted: f64,
    pub trim_factor_artefacts: f64,
    /// dB trims for the Distortion and Artefacts parts of the quality anchor.
    pub anchor_balance: [f64; 2],
    /// Parallel track workers. 0 = auto-detect (cores / 2, min 1).
    pub jobs: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            target_loudness: -23.0,
            mixing_levels: vec![-12.0, -6.0, 0.0, 6.0, 12.0],
            segment_duration: 7.0,
            percentile: 75.0,
            ramp_duration: 0.02,
            force_mono: true,
            level_anchor_offset: -14.0,
            trim_factor_distorted: 0.2,
            trim_factor_artefacts: 0.99,
            anchor_balance: [0.0, 0.0],
            jobs: 1,
        }
    }
}

impl RenderConfig {
    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_jobs(&self) -> usize {
        if self.jobs > 0 {
            self.jobs
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }
}

/// Methods whose estimates come out sign-inverted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolarityConfig {
    pub inverted: Vec<String>,
}

impl Default for PolarityConfig {
    fn default() -> Self {
        Self {
            inverted: vec!["GRA2".to_string(), "GRA3".to_string()],
        }
    }
}

impl SelectionConfig {
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            include_dev: self.include_dev,
            excluded_methods: self.excluded_methods.clone(),
            stems: self.stems(),
        }
    }

    pub fn stems(&self) -> StemVocabulary {
        StemVocabulary {
            strict: self.strict_stems,
        }
    }

    pub fn request(&self, dispersion: DispersionConfig) -> SelectionRequest {
        SelectionRequest {
            num_tracks: self.num_tracks,
            num_algos: self.num_algos,
            metric: self.metric.clone(),
            target: self.target.clone(),
            only_algos: self.only_algos.clone(),
            exclude_tracks: self.exclude_tracks.iter().copied().collect(),
            exclude_algos_in_tracks: self
                .exclude_algos_in_tracks
                .iter()
                .map(|(m, tracks)| (m.clone(), tracks.iter().copied().collect::<BTreeSet<_>>()))
                .collect(),
            remove_outliers: self.remove_outliers,
            stems: self.stems(),
            dispersion,
        }
    }
}

impl AppConfig {
    /// Load config from an explicit path (errors are fatal) or from
    /// `~/.config/stimset/config.toml` (errors fall back to defaults).
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            let config = Self::from_file(path)?;
            log::info!("Loaded config from {}", path.display());
            return Ok(config);
        }

        let config = match Self::config_path() {
            Some(path) if path.exists() => match Self::from_file(&path) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!("{e}. Using defaults.");
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        };
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = AppConfig::default();
        assert_eq!(c.selection.num_tracks, 2);
        assert_eq!(c.selection.num_algos, 8);
        assert_eq!(c.selection.excluded_methods, vec!["IBM"]);
        assert_eq!(c.render.mixing_levels, vec![-12.0, -6.0, 0.0, 6.0, 12.0]);
        assert_eq!(c.render.target_loudness, -23.0);
        assert_eq!(c.render.level_anchor_offset, -14.0);
        assert_eq!(c.dispersion.max_iterations, 1000);
        assert_eq!(c.polarity.inverted, vec!["GRA2", "GRA3"]);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let c = AppConfig::parse(
            r#"
            [selection]
            num_algos = 4
            exclude_tracks = [3, 7]

            [selection.exclude_algos_in_tracks]
            KAM = [12]

            [render]
            mixing_levels = [0.0]
            jobs = 4

            [dispersion]
            alpha = 0.05
            "#,
        )
        .unwrap();
        assert_eq!(c.selection.num_algos, 4);
        assert_eq!(c.selection.num_tracks, 2);
        assert_eq!(c.render.mixing_levels, vec![0.0]);
        assert_eq!(c.render.resolve_jobs(), 4);
        assert_eq!(c.render.segment_duration, 7.0);
        assert_eq!(c.dispersion.alpha, 0.05);
        assert_eq!(c.dispersion.max_iterations, 1000);

        let req = c.selection.request(c.dispersion);
        assert_eq!(req.exclude_tracks, BTreeSet::from([3, 7]));
        assert_eq!(req.exclude_algos_in_tracks["KAM"], BTreeSet::from([12]));
        assert_eq!(req.dispersion.alpha, 0.05);
    }

    #[test]
    fn test_relaxed_stems() {
        let c = AppConfig::parse("[selection]\nstrict_stems = false\n").unwrap();
        assert!(!c.selection.load_options().stems.strict);
        assert!(!c.selection.request(c.dispersion).stems.strict);
    }

    #[test]
    fn test_explicit_path_errors_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            AppConfig::load(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[render]\njobs = \"many\"\n").unwrap();
        assert!(matches!(
            AppConfig::load(Some(&bad)),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_auto_jobs_at_least_one() {
        let c = RenderConfig {
            jobs: 0,
            ..Default::default()
        };
        assert!(c.resolve_jobs() >= 1);
    }
}
