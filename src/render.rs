//! Stimulus rendering for a sampled table.
//!
//! Every track is rendered independently. Its active window is located once
//! on the reference target stem and every stem of every method is cropped to
//! that same window, so all stimuli of a track stay time-aligned.

use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::REFERENCE_METHOD;
use crate::anchor::{AnchorRequest, AnchorSynthesizer, RemixParams, combine_anchors};
use crate::audio::segment::{self, ActiveWindow, SegmentError};
use crate::audio::{AudioError, AudioSignal, db_to_amp, io};
use crate::config::{PolarityConfig, RenderConfig};
use crate::manifest::{Manifest, ManifestEntry, ManifestError, StimulusKind};
use crate::table::stems::ACCOMPANIMENT;
use crate::table::{ScoreTable, ScoredRecord};

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Track {track_id}: no '{stem}' row for method {method}")]
    MissingStem {
        track_id: u32,
        method: String,
        stem: String,
    },
    #[error("Track {track_id}: {count} '{stem}' rows for method {method}")]
    AmbiguousStem {
        track_id: u32,
        method: String,
        stem: String,
        count: usize,
    },
    #[error("Track {track_id}: '{stem}' row for method {method} has no filepath")]
    NoFilepath {
        track_id: u32,
        method: String,
        stem: String,
    },
    #[error("Track {track_id}: {source}")]
    Segment {
        track_id: u32,
        source: SegmentError,
    },
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("Failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Sign convention of a method's estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarity {
    #[default]
    Normal,
    Inverted,
}

impl Polarity {
    pub fn apply(self, signal: AudioSignal) -> AudioSignal {
        match self {
            Polarity::Normal => signal,
            Polarity::Inverted => signal.inverted(),
        }
    }
}

/// Per-method polarity corrections. Methods not listed are left as is.
#[derive(Debug, Clone, Default)]
pub struct PolarityTable {
    methods: HashMap<String, Polarity>,
}

impl PolarityTable {
    pub fn from_config(config: &PolarityConfig) -> Self {
        Self {
            methods: config
                .inverted
                .iter()
                .map(|m| (m.clone(), Polarity::Inverted))
                .collect(),
        }
    }

    pub fn set(&mut self, method: &str, polarity: Polarity) {
        self.methods.insert(method.to_string(), polarity);
    }

    pub fn polarity(&self, method: &str) -> Polarity {
        self.methods.get(method).copied().unwrap_or_default()
    }

    pub fn correct(&self, method: &str, signal: AudioSignal) -> AudioSignal {
        self.polarity(method).apply(signal)
    }
}

/// Everything a render run needs besides the table.
pub struct RenderContext<'a> {
    pub config: &'a RenderConfig,
    pub polarity: &'a PolarityTable,
    pub synth: &'a dyn AnchorSynthesizer,
    /// The stem being rated (e.g. vocals); all other stems are interferers.
    pub target: &'a str,
}

pub fn level_label(level: f64) -> String {
    format!("{level}dB")
}

pub fn mix_folder(track_id: u32, metric: &str) -> String {
    format!("mix-{track_id}-{metric}")
}

pub fn target_folder(target: &str, track_id: u32, metric: &str) -> String {
    format!("{target}-{track_id}-{metric}")
}

pub fn method_mix_name(method: &str, level: f64) -> String {
    format!("{method}_mix_{}", level_label(level))
}

pub fn ref_mix_name(level: f64) -> String {
    format!("ref_mix_{}", level_label(level))
}

pub fn quality_anchor_name(level: f64) -> String {
    format!("anchor_quality_mix_{}", level_label(level))
}

pub fn level_anchor_name(level: f64) -> String {
    format!("anchor_level_mix_{}", level_label(level))
}

/// Rows of one track, with the lookups rendering needs.
struct TrackRows<'a> {
    track_id: u32,
    metric: &'a str,
    rows: Vec<&'a ScoredRecord>,
}

impl<'a> TrackRows<'a> {
    fn find(&self, method: &str, stem: &str) -> Result<Option<&'a ScoredRecord>, RenderError> {
        let matches: Vec<&ScoredRecord> = self
            .rows
            .iter()
            .copied()
            .filter(|r| r.method == method && r.target == stem)
            .collect();
        match matches.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(*one)),
            many => Err(RenderError::AmbiguousStem {
                track_id: self.track_id,
                method: method.to_string(),
                stem: stem.to_string(),
                count: many.len(),
            }),
        }
    }

    fn require(&self, method: &str, stem: &str) -> Result<&'a ScoredRecord, RenderError> {
        self.find(method, stem)?.ok_or_else(|| RenderError::MissingStem {
            track_id: self.track_id,
            method: method.to_string(),
            stem: stem.to_string(),
        })
    }

    /// Stems of `method` other than the target and accompaniment.
    fn interferers(&self, method: &str, target: &str) -> Vec<&'a ScoredRecord> {
        self.rows
            .iter()
            .copied()
            .filter(|r| r.method == method && r.target != target && r.target != ACCOMPANIMENT)
            .collect()
    }

    /// Non-reference methods, sorted.
    fn methods(&self) -> Vec<&'a str> {
        let mut methods: Vec<&str> = self
            .rows
            .iter()
            .copied()
            .filter(|r| !r.is_reference())
            .map(|r| r.method.as_str())
            .collect();
        methods.sort_unstable();
        methods.dedup();
        methods
    }
}

/// Loads stems of one track, all cropped to the same window.
struct StemLoader<'a> {
    config: &'a RenderConfig,
    track_id: u32,
    window: ActiveWindow,
}

impl StemLoader<'_> {
    fn load(&self, record: &ScoredRecord) -> Result<AudioSignal, RenderError> {
        let signal = read_record(record, self.config)?;
        segment::segment(&signal, self.window, self.config.ramp_duration).map_err(|source| {
            RenderError::Segment {
                track_id: self.track_id,
                source,
            }
        })
    }

    fn load_sum(&self, records: &[&ScoredRecord]) -> Result<Option<AudioSignal>, RenderError> {
        let signals = records
            .iter()
            .map(|r| self.load(r))
            .collect::<Result<Vec<_>, _>>()?;
        if signals.is_empty() {
            return Ok(None);
        }
        Ok(Some(AudioSignal::sum(&signals)?))
    }
}

fn record_path(record: &ScoredRecord) -> Result<&Path, RenderError> {
    record
        .filepath
        .as_deref()
        .ok_or_else(|| RenderError::NoFilepath {
            track_id: record.track_id,
            method: record.method.clone(),
            stem: record.target.clone(),
        })
}

fn read_record(record: &ScoredRecord, config: &RenderConfig) -> Result<AudioSignal, RenderError> {
    let path = record_path(record)?;
    let signal = io::read_wav_as(path, config.force_mono)?;
    if signal.sample_rate() != config.sample_rate {
        log::warn!(
            "{} is {} Hz, expected {} Hz",
            path.display(),
            signal.sample_rate(),
            config.sample_rate
        );
    }
    Ok(signal)
}

/// Reference target, its active window, and the segmented reference stems.
struct ReferenceStems<'a> {
    loader: StemLoader<'a>,
    target: AudioSignal,
    interferers: Vec<AudioSignal>,
}

impl<'a> ReferenceStems<'a> {
    fn load(track: &TrackRows<'_>, ctx: &RenderContext<'a>) -> Result<Self, RenderError> {
        let target_row = track.require(REFERENCE_METHOD, ctx.target)?;
        let full_target = read_record(target_row, ctx.config)?;
        let window = segment::locate_active_window(
            &full_target,
            ctx.config.segment_duration,
            ctx.config.percentile,
        )
        .map_err(|source| RenderError::Segment {
            track_id: track.track_id,
            source,
        })?;
        log::info!(
            "Track {}: active window at {:.2}s",
            track.track_id,
            window.start_secs(full_target.sample_rate())
        );

        let loader = StemLoader {
            config: ctx.config,
            track_id: track.track_id,
            window,
        };
        let target = segment::segment(&full_target, window, ctx.config.ramp_duration).map_err(
            |source| RenderError::Segment {
                track_id: track.track_id,
                source,
            },
        )?;
        let interferers = track
            .interferers(REFERENCE_METHOD, ctx.target)
            .into_iter()
            .map(|r| loader.load(r))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            loader,
            target,
            interferers,
        })
    }

    /// Sum of the interferers, or silence when there are none.
    fn accompaniment(&self) -> Result<AudioSignal, RenderError> {
        if self.interferers.is_empty() {
            return Ok(AudioSignal::silence(
                self.target.frames(),
                self.target.channels(),
                self.target.sample_rate(),
            ));
        }
        Ok(AudioSignal::sum(&self.interferers)?)
    }

    /// A method's target stem, polarity-corrected.
    fn method_target(
        &self,
        track: &TrackRows<'_>,
        method: &str,
        ctx: &RenderContext<'_>,
    ) -> Result<AudioSignal, RenderError> {
        let row = track.require(method, ctx.target)?;
        Ok(ctx.polarity.correct(method, self.loader.load(row)?))
    }

    /// A method's accompaniment: its own accompaniment stem when present,
    /// otherwise the sum of its remaining stems. Polarity-corrected.
    fn method_accompaniment(
        &self,
        track: &TrackRows<'_>,
        method: &str,
        ctx: &RenderContext<'_>,
    ) -> Result<AudioSignal, RenderError> {
        let accompaniment = match track.find(method, ACCOMPANIMENT)? {
            Some(row) => self.loader.load(row)?,
            None => self
                .loader
                .load_sum(&track.interferers(method, ctx.target))?
                .ok_or_else(|| RenderError::MissingStem {
                    track_id: track.track_id,
                    method: method.to_string(),
                    stem: ACCOMPANIMENT.to_string(),
                })?,
        };
        Ok(ctx.polarity.correct(method, accompaniment))
    }
}

/// Writes normalized stimuli into one folder and records them.
struct FolderWriter<'a> {
    root: &'a Path,
    folder: String,
    track: &'a TrackRows<'a>,
    target_loudness: f64,
    entries: Vec<ManifestEntry>,
}

impl FolderWriter<'_> {
    fn write(
        &mut self,
        signal: &AudioSignal,
        name: &str,
        method: &str,
        kind: StimulusKind,
        level_db: Option<f64>,
    ) -> Result<(), RenderError> {
        let file = format!("{name}.wav");
        let path: PathBuf = self.root.join(&self.folder).join(&file);
        io::write_wav(signal, &path, self.target_loudness)?;
        log::debug!("Wrote {}", path.display());
        self.entries.push(ManifestEntry {
            track_id: self.track.track_id,
            metric: self.track.metric.to_string(),
            folder: self.folder.clone(),
            method: method.to_string(),
            kind,
            level_db,
            file,
        });
        Ok(())
    }
}

fn render_track_mixes(
    track: &TrackRows<'_>,
    out_dir: &Path,
    ctx: &RenderContext<'_>,
) -> Result<Vec<ManifestEntry>, RenderError> {
    let cfg = ctx.config;
    let refs = ReferenceStems::load(track, ctx)?;
    let accompaniment = refs.accompaniment()?;
    let mut out = FolderWriter {
        root: out_dir,
        folder: mix_folder(track.track_id, track.metric),
        track,
        target_loudness: cfg.target_loudness,
        entries: Vec::new(),
    };

    for &level in &cfg.mixing_levels {
        let ref_mix = refs.target.mix(db_to_amp(level), &accompaniment)?;
        out.write(
            &ref_mix,
            &ref_mix_name(level),
            REFERENCE_METHOD,
            StimulusKind::Reference,
            Some(level),
        )?;

        let scaled_target = refs.target.scaled(db_to_amp(level));
        let anchors = ctx.synth.create(&AnchorRequest {
            target: &scaled_target,
            interferers: &refs.interferers,
            trim_factor_distorted: cfg.trim_factor_distorted,
            trim_factor_artefacts: cfg.trim_factor_artefacts,
            remix: Some(RemixParams {
                target_level_offset: cfg.level_anchor_offset,
                balance: cfg.anchor_balance,
            }),
        })?;
        let quality = combine_anchors(&anchors.distortion, &anchors.artefacts)?;
        out.write(
            &quality,
            &quality_anchor_name(level),
            "anchor_quality",
            StimulusKind::QualityAnchor,
            Some(level),
        )?;

        let level_anchor = refs
            .target
            .mix(db_to_amp(level + cfg.level_anchor_offset), &accompaniment)?;
        out.write(
            &level_anchor,
            &level_anchor_name(level),
            "anchor_level",
            StimulusKind::LevelAnchor,
            Some(level),
        )?;
    }

    for method in track.methods() {
        let target = refs.method_target(track, method, ctx)?;
        let accompaniment = refs.method_accompaniment(track, method, ctx)?;
        for &level in &cfg.mixing_levels {
            let mix = target.mix(db_to_amp(level), &accompaniment)?;
            out.write(
                &mix,
                &method_mix_name(method, level),
                method,
                StimulusKind::Method,
                Some(level),
            )?;
        }
    }

    Ok(out.entries)
}

fn render_track_targets(
    track: &TrackRows<'_>,
    out_dir: &Path,
    ctx: &RenderContext<'_>,
) -> Result<Vec<ManifestEntry>, RenderError> {
    let cfg = ctx.config;
    let refs = ReferenceStems::load(track, ctx)?;
    let mut out = FolderWriter {
        root: out_dir,
        folder: target_folder(ctx.target, track.track_id, track.metric),
        track,
        target_loudness: cfg.target_loudness,
        entries: Vec::new(),
    };

    let ref_name = format!("{REFERENCE_METHOD}-{}", ctx.target);
    out.write(&refs.target, &ref_name, REFERENCE_METHOD, StimulusKind::Reference, None)?;

    for method in track.methods() {
        let target = refs.method_target(track, method, ctx)?;
        let name = format!("{method}-{}", ctx.target);
        out.write(&target, &name, method, StimulusKind::Method, None)?;
    }

    let anchors = ctx.synth.create(&AnchorRequest {
        target: &refs.target,
        interferers: &refs.interferers,
        trim_factor_distorted: cfg.trim_factor_distorted,
        trim_factor_artefacts: cfg.trim_factor_artefacts,
        remix: None,
    })?;
    for (name, signal) in anchors.named() {
        out.write(signal, name, name, StimulusKind::Anchor, None)?;
    }

    Ok(out.entries)
}

/// Group rows by (track, metric) in ascending order.
fn group_tracks(table: &ScoreTable) -> Vec<TrackRows<'_>> {
    let mut groups: BTreeMap<(u32, &str), Vec<&ScoredRecord>> = BTreeMap::new();
    for r in table.iter() {
        groups
            .entry((r.track_id, r.metric.as_str()))
            .or_default()
            .push(r);
    }
    groups
        .into_iter()
        .map(|((track_id, metric), rows)| TrackRows {
            track_id,
            metric,
            rows,
        })
        .collect()
}

/// Run `render` for every track, on a rayon pool when `jobs > 1`.
fn render_all<F>(
    table: &ScoreTable,
    jobs: usize,
    render: F,
) -> Result<Vec<ManifestEntry>, RenderError>
where
    F: Fn(&TrackRows<'_>) -> Result<Vec<ManifestEntry>, RenderError> + Sync,
{
    let tracks = group_tracks(table);
    log::info!("Rendering {} tracks with {} workers", tracks.len(), jobs);

    let pb = ProgressBar::new(tracks.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );

    let run = |track: &TrackRows<'_>| {
        pb.set_message(format!("track {}", track.track_id));
        let result = render(track);
        pb.inc(1);
        result
    };

    let per_track: Vec<Vec<ManifestEntry>> = if jobs > 1 {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;
        pool.install(|| {
            use rayon::prelude::*;
            tracks.par_iter().map(run).collect::<Result<Vec<_>, _>>()
        })?
    } else {
        tracks.iter().map(run).collect::<Result<Vec<_>, _>>()?
    };

    let entries: Vec<ManifestEntry> = per_track.into_iter().flatten().collect();
    pb.finish_with_message(format!("Done: {} stimuli", entries.len()));
    Ok(entries)
}

/// Render reference, anchor and per-method mixes at every configured level
/// and write the manifest.
pub fn render_mixes(
    table: &ScoreTable,
    out_dir: &Path,
    ctx: &RenderContext<'_>,
) -> Result<Manifest, RenderError> {
    let entries = render_all(table, ctx.config.resolve_jobs(), |track| {
        render_track_mixes(track, out_dir, ctx)
    })?;
    let manifest = Manifest::new(ctx.target, &ctx.config.mixing_levels, entries);
    manifest.write(out_dir)?;
    Ok(manifest)
}

/// Render unmixed target stimuli (reference, each method, anchor variants)
/// and write the manifest.
pub fn render_targets(
    table: &ScoreTable,
    out_dir: &Path,
    ctx: &RenderContext<'_>,
) -> Result<Manifest, RenderError> {
    let entries = render_all(table, ctx.config.resolve_jobs(), |track| {
        render_track_targets(track, out_dir, ctx)
    })?;
    let manifest = Manifest::new(ctx.target, &[], entries);
    manifest.write(out_dir)?;
    Ok(manifest)
}
