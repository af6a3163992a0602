//! Stratified stimulus selection.
//!
//! Stages, in order:
//! 1. Keep finite-scored rows of the requested metric and target stem, then
//!    apply the method whitelist and the track / (method, track) exclusions
//! 2. Optionally drop per-track score outliers (Tukey fences)
//! 3. Keep tracks whose score IQR exceeds the median IQR of all tracks
//! 4. Disperse per-track median scores to pick `num_tracks` tracks
//! 5. Disperse each chosen track's scores to pick `num_algos` methods
//! 6. Pull every stem of each chosen (track, method) back in
//! 7. Add one reference row per stem, resolved from the reference dataset

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

use crate::REFERENCE_METHOD;
use crate::sampling::{DispersionConfig, SamplingError, SizeDrift, disperse};
use crate::stats;
use crate::table::dataset::{LookupError, ReferenceDataset, normalize_title};
use crate::table::stems::{ACCOMPANIMENT, SOURCE_STEMS, StemVocabulary};
use crate::table::{ScoreTable, ScoredRecord};

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("Method whitelist has {whitelisted} entries but {requested} algorithms were requested")]
    WhitelistSize { requested: usize, whitelisted: usize },
    #[error("No {metric}/{target} rows left to select from")]
    NoCandidates { metric: String, target: String },
    #[error("Sampling {stratum} failed: {source}")]
    Sampling {
        stratum: Stratum,
        source: SamplingError,
    },
    #[error("Reference lookup for track {track_id} failed: {source}")]
    Lookup { track_id: u32, source: LookupError },
}

/// Which dispersion stage a result or warning belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stratum {
    Tracks,
    Methods { track_id: u32 },
}

impl fmt::Display for Stratum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stratum::Tracks => write!(f, "tracks"),
            Stratum::Methods { track_id } => write!(f, "methods of track {track_id}"),
        }
    }
}

/// A dispersion stage that settled for a different size than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftWarning {
    pub stratum: Stratum,
    pub drift: SizeDrift,
}

impl fmt::Display for DriftWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stratum, self.drift)
    }
}

/// Parameters of one selection run.
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub num_tracks: usize,
    pub num_algos: usize,
    pub metric: String,
    pub target: String,
    /// Restrict to these methods; must hold exactly `num_algos` names.
    pub only_algos: Option<Vec<String>>,
    pub exclude_tracks: BTreeSet<u32>,
    /// Method name -> tracks on which that method is not eligible.
    pub exclude_algos_in_tracks: BTreeMap<String, BTreeSet<u32>>,
    pub remove_outliers: bool,
    pub stems: StemVocabulary,
    pub dispersion: DispersionConfig,
}

impl Default for SelectionRequest {
    fn default() -> Self {
        Self {
            num_tracks: 2,
            num_algos: 8,
            metric: "SDR".to_string(),
            target: "vocals".to_string(),
            only_algos: None,
            exclude_tracks: BTreeSet::new(),
            exclude_algos_in_tracks: BTreeMap::new(),
            remove_outliers: true,
            stems: StemVocabulary::default(),
            dispersion: DispersionConfig::default(),
        }
    }
}

/// Sampled rows plus reference rows, sorted by (track_id, method, target).
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub table: ScoreTable,
    pub drift: Vec<DriftWarning>,
}

impl Selection {
    pub fn track_ids(&self) -> BTreeSet<u32> {
        self.table.track_ids()
    }

    /// Selected (non-reference) methods per track.
    pub fn methods(&self) -> BTreeMap<u32, Vec<String>> {
        self.track_ids()
            .into_iter()
            .map(|t| {
                let methods = self
                    .table
                    .methods_for_track(t)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                (t, methods)
            })
            .collect()
    }
}

/// Run the full selection for one metric.
pub fn select(
    table: &ScoreTable,
    request: &SelectionRequest,
    references: &ReferenceDataset,
) -> Result<Selection, SelectionError> {
    if let Some(whitelist) = &request.only_algos {
        if whitelist.len() != request.num_algos {
            return Err(SelectionError::WhitelistSize {
                requested: request.num_algos,
                whitelisted: whitelist.len(),
            });
        }
    }

    let eligible = table
        .filter(|r| !r.is_reference())
        .retain_complete(&request.stems);

    let candidates = candidate_rows(&eligible, request);
    if candidates.is_empty() {
        return Err(SelectionError::NoCandidates {
            metric: request.metric.clone(),
            target: request.target.clone(),
        });
    }

    let mut by_track: BTreeMap<u32, Vec<&ScoredRecord>> = BTreeMap::new();
    for r in candidates {
        by_track.entry(r.track_id).or_default().push(r);
    }

    if request.remove_outliers {
        remove_outliers(&mut by_track);
    }
    keep_high_spread_tracks(&mut by_track, request.num_tracks);

    let mut drift = Vec::new();
    let tracks = pick_tracks(&by_track, request, &mut drift)?;

    let mut picks: Vec<(u32, Vec<&str>)> = Vec::with_capacity(tracks.len());
    for &track_id in &tracks {
        let methods = pick_methods(track_id, &by_track[&track_id], request, &mut drift)?;
        log::debug!("Track {track_id}: methods {methods:?}");
        picks.push((track_id, methods));
    }

    let mut records = expand_stems(&eligible, &picks, &request.metric);
    for (track_id, methods) in &picks {
        records.extend(reference_rows(*track_id, methods, &records, request, references)?);
    }

    let mut table = ScoreTable::new(records);
    table.sort();
    log::info!(
        "Selected {} tracks x {} methods for {}/{} ({} rows)",
        tracks.len(),
        request.num_algos,
        request.metric,
        request.target,
        table.len()
    );
    Ok(Selection { table, drift })
}

/// Select once per metric, never reusing a track across metrics.
pub fn select_across_metrics(
    table: &ScoreTable,
    metrics: &[String],
    request: &SelectionRequest,
    references: &ReferenceDataset,
) -> Result<Selection, SelectionError> {
    let mut combined = Selection::default();
    let mut used = request.exclude_tracks.clone();

    for metric in metrics {
        let per_metric = SelectionRequest {
            metric: metric.clone(),
            exclude_tracks: used.clone(),
            ..request.clone()
        };
        let selection = select(table, &per_metric, references)?;
        log::info!("{metric}: tracks {:?}", selection.track_ids());
        used.extend(selection.track_ids());
        combined.table.extend(selection.table);
        combined.drift.extend(selection.drift);
    }

    combined.table.sort();
    Ok(combined)
}

/// Stage 1: metric/target rows minus whitelist, exclusions and unscored rows.
fn candidate_rows<'a>(
    eligible: &'a ScoreTable,
    request: &SelectionRequest,
) -> Vec<&'a ScoredRecord> {
    eligible
        .iter()
        .filter(|r| r.metric == request.metric && r.target == request.target)
        .filter(|r| {
            if r.score.is_finite() {
                return true;
            }
            log::debug!(
                "Track {}: skipping {} with non-finite {} score",
                r.track_id,
                r.method,
                r.metric
            );
            false
        })
        .filter(|r| {
            request
                .only_algos
                .as_ref()
                .is_none_or(|list| list.iter().any(|m| *m == r.method))
        })
        .filter(|r| !request.exclude_tracks.contains(&r.track_id))
        .filter(|r| {
            request
                .exclude_algos_in_tracks
                .get(&r.method)
                .is_none_or(|tracks| !tracks.contains(&r.track_id))
        })
        .collect()
}

/// Stage 2.
fn remove_outliers(by_track: &mut BTreeMap<u32, Vec<&ScoredRecord>>) {
    for (track_id, rows) in by_track.iter_mut() {
        let scores: Vec<f64> = rows.iter().map(|r| r.score).collect();
        let mask = stats::is_outlier(&scores);
        let before = rows.len();
        let mut flags = mask.into_iter();
        rows.retain(|_| !flags.next().unwrap_or(false));
        if rows.len() < before {
            log::debug!("Track {track_id}: dropped {} outlier(s)", before - rows.len());
        }
    }
    by_track.retain(|_, rows| !rows.is_empty());
}

/// Stage 3. Skipped when it would leave fewer than `num_tracks` tracks, so a
/// population of exactly the requested size is selected whole.
fn keep_high_spread_tracks(by_track: &mut BTreeMap<u32, Vec<&ScoredRecord>>, num_tracks: usize) {
    let spreads: BTreeMap<u32, f64> = by_track
        .iter()
        .map(|(&t, rows)| {
            let scores: Vec<f64> = rows.iter().map(|r| r.score).collect();
            (t, stats::interquartile_range(&scores))
        })
        .collect();
    let spread_values: Vec<f64> = spreads.values().copied().collect();
    let median = stats::median(&spread_values);

    let kept: BTreeSet<u32> = spreads
        .iter()
        .filter(|&(_, &iqr)| iqr > median)
        .map(|(&t, _)| t)
        .collect();
    if kept.len() < num_tracks {
        log::debug!(
            "IQR filter would keep {} of {} tracks; keeping all",
            kept.len(),
            by_track.len()
        );
        return;
    }
    log::debug!(
        "IQR filter (median {median:.3}): {} of {} tracks",
        kept.len(),
        by_track.len()
    );
    by_track.retain(|t, _| kept.contains(t));
}

/// Stage 4.
fn pick_tracks(
    by_track: &BTreeMap<u32, Vec<&ScoredRecord>>,
    request: &SelectionRequest,
    drift: &mut Vec<DriftWarning>,
) -> Result<Vec<u32>, SelectionError> {
    let track_ids: Vec<u32> = by_track.keys().copied().collect();
    let medians: Vec<f64> = by_track
        .values()
        .map(|rows| stats::median(&rows.iter().map(|r| r.score).collect::<Vec<_>>()))
        .collect();

    let indices = sample_indices(&medians, request.num_tracks, Stratum::Tracks, request, drift)?;
    let mut tracks: Vec<u32> = indices.into_iter().map(|i| track_ids[i]).collect();
    tracks.sort_unstable();
    Ok(tracks)
}

/// Stage 5.
fn pick_methods<'a>(
    track_id: u32,
    rows: &[&'a ScoredRecord],
    request: &SelectionRequest,
    drift: &mut Vec<DriftWarning>,
) -> Result<Vec<&'a str>, SelectionError> {
    let scores: Vec<f64> = rows.iter().map(|r| r.score).collect();
    let stratum = Stratum::Methods { track_id };
    let indices = sample_indices(&scores, request.num_algos, stratum, request, drift)?;
    let mut methods: Vec<&str> = indices.into_iter().map(|i| rows[i].method.as_str()).collect();
    methods.sort_unstable();
    methods.dedup();
    Ok(methods)
}

/// Dispersion sample of `values`, taking everything when the population is
/// no larger than the request.
fn sample_indices(
    values: &[f64],
    size: usize,
    stratum: Stratum,
    request: &SelectionRequest,
    drift: &mut Vec<DriftWarning>,
) -> Result<Vec<usize>, SelectionError> {
    if values.len() <= size {
        if values.len() < size {
            let warning = DriftWarning {
                stratum,
                drift: SizeDrift {
                    requested: size,
                    actual: values.len(),
                },
            };
            log::warn!("Only {} candidates for {warning}", values.len());
            drift.push(warning);
        }
        return Ok((0..values.len()).collect());
    }

    let result = disperse(values, size, &request.dispersion)
        .map_err(|source| SelectionError::Sampling { stratum, source })?;
    if let Some(d) = result.drift {
        drift.push(DriftWarning { stratum, drift: d });
    }
    Ok(result.indices)
}

/// Stage 6: every stem row of each chosen (track, method) at `metric`.
/// Accompaniment is dropped from groups that also carry all four sources.
fn expand_stems(
    eligible: &ScoreTable,
    picks: &[(u32, Vec<&str>)],
    metric: &str,
) -> Vec<ScoredRecord> {
    let mut out = Vec::new();
    for (track_id, methods) in picks {
        for method in methods {
            let group: Vec<&ScoredRecord> = eligible
                .iter()
                .filter(|r| r.track_id == *track_id && r.method == *method && r.metric == metric)
                .collect();
            let has_sources = SOURCE_STEMS
                .iter()
                .all(|s| group.iter().any(|r| r.target == *s));
            out.extend(
                group
                    .into_iter()
                    .filter(|r| !(has_sources && r.target == ACCOMPANIMENT))
                    .cloned(),
            );
        }
    }
    out
}

/// Stage 7: one NaN-scored reference row per stem present in the track's
/// first selected method group.
fn reference_rows(
    track_id: u32,
    methods: &[&str],
    sampled: &[ScoredRecord],
    request: &SelectionRequest,
    references: &ReferenceDataset,
) -> Result<Vec<ScoredRecord>, SelectionError> {
    let Some(first) = methods.first() else {
        return Ok(Vec::new());
    };
    let template: Vec<&ScoredRecord> = sampled
        .iter()
        .filter(|r| r.track_id == track_id && r.method == *first)
        .filter(|r| r.target != ACCOMPANIMENT)
        .collect();

    let mut rows = Vec::with_capacity(template.len());
    for r in template {
        let title = normalize_title(&r.title);
        let path = references
            .lookup(&title, &r.target)
            .map_err(|source| SelectionError::Lookup { track_id, source })?;
        rows.push(ScoredRecord {
            track_id,
            title: r.title.clone(),
            method: REFERENCE_METHOD.to_string(),
            target: r.target.clone(),
            metric: request.metric.clone(),
            score: f64::NAN,
            filepath: Some(path),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::dataset::ReferenceEntry;
    use crate::table::stems::{BASS, DRUMS, OTHER, VOCALS};
    use std::path::PathBuf;

    const METHODS: [&str; 5] = ["DUR", "GRA3", "KAM", "OZE", "UHL"];
    const METRICS: [&str; 5] = ["SDR", "SIR", "SAR", "ISR", "SI-SDR"];
    const STEMS: [&str; 5] = [BASS, DRUMS, OTHER, VOCALS, ACCOMPANIMENT];

    /// 64-bit LCG (Knuth MMIX constants) mapped to scores in [-5, 15).
    struct Lcg(u64);

    impl Lcg {
        fn next_score(&mut self) -> f64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 33) as f64 / 2f64.powi(31) * 20.0 - 5.0
        }
    }

    fn title(track_id: u32) -> String {
        format!("{track_id:03} - Artist {track_id:02} - Song {track_id:02}")
    }

    fn campaign(tracks: u32) -> ScoreTable {
        let mut rng = Lcg(42);
        let mut records = Vec::new();
        for track_id in 1..=tracks {
            for method in METHODS {
                for stem in STEMS {
                    for metric in METRICS {
                        records.push(ScoredRecord {
                            track_id,
                            title: title(track_id),
                            method: method.to_string(),
                            target: stem.to_string(),
                            metric: metric.to_string(),
                            score: rng.next_score(),
                            filepath: Some(PathBuf::from(format!(
                                "/est/{method}/{track_id}/{stem}.wav"
                            ))),
                        });
                    }
                }
            }
        }
        ScoreTable::new(records)
    }

    fn references(tracks: u32) -> ReferenceDataset {
        let mut entries = Vec::new();
        for track_id in 1..=tracks {
            for stem in SOURCE_STEMS {
                entries.push(ReferenceEntry {
                    title: title(track_id),
                    stem: stem.to_string(),
                    subset: Some("Test".to_string()),
                    path: PathBuf::from(format!("/ref/{track_id}/{stem}.wav")),
                });
            }
        }
        ReferenceDataset::from_entries(entries)
    }

    fn request(num_tracks: usize, num_algos: usize) -> SelectionRequest {
        SelectionRequest {
            num_tracks,
            num_algos,
            ..Default::default()
        }
    }

    #[test]
    fn test_golden_selection() {
        let table = campaign(10);
        let sel = select(&table, &request(2, 2), &references(10)).unwrap();

        assert!(sel.drift.is_empty());
        assert_eq!(sel.track_ids(), BTreeSet::from([6, 8]));
        let methods = sel.methods();
        assert_eq!(methods[&6], vec!["GRA3", "UHL"]);
        assert_eq!(methods[&8], vec!["GRA3", "OZE"]);

        // 2 tracks x (2 methods x 4 stems + 4 reference stems)
        assert_eq!(sel.table.len(), 24);
        assert!(sel.table.iter().all(|r| r.metric == "SDR"));
        assert!(sel.table.iter().all(|r| r.target != ACCOMPANIMENT));
    }

    #[test]
    fn test_reference_rows() {
        let sel = select(&campaign(10), &request(2, 2), &references(10)).unwrap();
        let refs: Vec<&ScoredRecord> = sel.table.iter().filter(|r| r.is_reference()).collect();
        assert_eq!(refs.len(), 8);
        for r in refs {
            assert!(r.score.is_nan());
            let expected = PathBuf::from(format!("/ref/{}/{}.wav", r.track_id, r.target));
            assert_eq!(r.filepath.as_ref(), Some(&expected));
        }
    }

    #[test]
    fn test_output_sorted() {
        let sel = select(&campaign(10), &request(2, 2), &references(10)).unwrap();
        let keys: Vec<(u32, &str, &str)> = sel
            .table
            .iter()
            .map(|r| (r.track_id, r.method.as_str(), r.target.as_str()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_sampled_scores_come_from_input() {
        let table = campaign(10);
        let sel = select(&table, &request(2, 3), &references(10)).unwrap();
        for r in sel.table.iter().filter(|r| !r.is_reference()) {
            assert!(table.records().contains(r));
        }
    }

    #[test]
    fn test_exact_population_is_selected_whole() {
        let sel = select(&campaign(2), &request(2, 5), &references(2)).unwrap();
        assert_eq!(sel.track_ids(), BTreeSet::from([1, 2]));
        for methods in sel.methods().values() {
            assert_eq!(methods.len(), 5);
        }
    }

    #[test]
    fn test_whitelist_size_mismatch_is_fatal() {
        let req = SelectionRequest {
            only_algos: Some(vec!["DUR".to_string()]),
            ..request(2, 2)
        };
        let err = select(&campaign(3), &req, &references(3)).unwrap_err();
        assert!(matches!(
            err,
            SelectionError::WhitelistSize {
                requested: 2,
                whitelisted: 1
            }
        ));
    }

    #[test]
    fn test_whitelist_restricts_methods() {
        let req = SelectionRequest {
            only_algos: Some(vec!["DUR".to_string(), "KAM".to_string()]),
            ..request(2, 2)
        };
        let sel = select(&campaign(10), &req, &references(10)).unwrap();
        for methods in sel.methods().values() {
            assert_eq!(methods, &vec!["DUR".to_string(), "KAM".to_string()]);
        }
    }

    #[test]
    fn test_exclusions() {
        // Only tracks 8 and 10 remain, so both are selected.
        let req = SelectionRequest {
            exclude_tracks: BTreeSet::from([1, 2, 3, 4, 5, 6, 7, 9]),
            exclude_algos_in_tracks: BTreeMap::from([("GRA3".to_string(), BTreeSet::from([8]))]),
            ..request(2, 2)
        };
        let sel = select(&campaign(10), &req, &references(10)).unwrap();
        assert_eq!(sel.track_ids(), BTreeSet::from([8, 10]));

        let methods = sel.methods();
        assert!(!methods[&8].is_empty());
        assert!(!methods[&8].iter().any(|m| m == "GRA3"));
    }

    #[test]
    fn test_non_finite_scores_are_skipped() {
        let mut records = campaign(6).records().to_vec();
        for r in records.iter_mut() {
            if r.track_id == 2 && r.method == "KAM" && r.target == VOCALS && r.metric == "SDR" {
                r.score = f64::NAN;
            }
        }
        let req = SelectionRequest {
            remove_outliers: false,
            ..request(6, 3)
        };
        let sel = select(&ScoreTable::new(records), &req, &references(6)).unwrap();

        assert_eq!(sel.track_ids(), BTreeSet::from([1, 2, 3, 4, 5, 6]));
        let methods = sel.methods();
        assert!(!methods[&2].iter().any(|m| m == "KAM"));
        assert!(!methods[&2].is_empty());
        assert!(
            sel.table
                .iter()
                .filter(|r| !r.is_reference())
                .all(|r| r.score.is_finite())
        );
    }

    #[test]
    fn test_short_method_pool_reports_drift() {
        let sel = select(&campaign(10), &request(2, 7), &references(10)).unwrap();

        let tracks = sel.track_ids();
        assert_eq!(tracks.len(), 2);
        for &track_id in &tracks {
            let warning = sel
                .drift
                .iter()
                .find(|w| w.stratum == Stratum::Methods { track_id })
                .unwrap();
            assert_eq!(warning.drift.requested, 7);
            assert_eq!(warning.drift.actual, sel.methods()[&track_id].len());
            assert!(warning.drift.actual <= METHODS.len());

            let refs: Vec<&str> = sel
                .table
                .iter()
                .filter(|r| r.track_id == track_id && r.is_reference())
                .map(|r| r.target.as_str())
                .collect();
            assert_eq!(refs, vec![BASS, DRUMS, OTHER, VOCALS]);
        }
    }

    #[test]
    fn test_short_method_pool_without_outliers_keeps_all_methods() {
        let req = SelectionRequest {
            remove_outliers: false,
            ..request(2, 7)
        };
        let sel = select(&campaign(10), &req, &references(10)).unwrap();
        for (track_id, methods) in sel.methods() {
            assert_eq!(methods.len(), 5);
            assert!(sel.drift.contains(&DriftWarning {
                stratum: Stratum::Methods { track_id },
                drift: SizeDrift {
                    requested: 7,
                    actual: 5
                },
            }));
        }
    }

    #[test]
    fn test_incomplete_groups_are_ineligible() {
        // Remove one stem of KAM on every track: KAM must never be picked.
        let table = campaign(4).filter(|r| !(r.method == "KAM" && r.target == DRUMS));
        let req = SelectionRequest {
            remove_outliers: false,
            ..request(2, 4)
        };
        let sel = select(&table, &req, &references(4)).unwrap();
        for methods in sel.methods().values() {
            assert!(!methods.iter().any(|m| m == "KAM"));
            assert_eq!(methods.len(), 4);
        }
    }

    #[test]
    fn test_missing_reference_is_fatal() {
        let err = select(&campaign(10), &request(2, 2), &references(7)).unwrap_err();
        assert!(matches!(err, SelectionError::Lookup { track_id: 8, .. }));
    }

    #[test]
    fn test_no_candidates() {
        let req = SelectionRequest {
            metric: "PES".to_string(),
            ..request(2, 2)
        };
        assert!(matches!(
            select(&campaign(3), &req, &references(3)),
            Err(SelectionError::NoCandidates { .. })
        ));
    }

    #[test]
    fn test_select_across_metrics_uses_disjoint_tracks() {
        let metrics = vec!["SDR".to_string(), "SIR".to_string()];
        let sel = select_across_metrics(&campaign(10), &metrics, &request(2, 2), &references(10))
            .unwrap();
        assert_eq!(sel.track_ids(), BTreeSet::from([3, 4, 6, 8]));

        let metric_of = |t: u32| {
            sel.table
                .iter()
                .find(|r| r.track_id == t)
                .map(|r| r.metric.clone())
                .unwrap()
        };
        assert_eq!(metric_of(6), "SDR");
        assert_eq!(metric_of(8), "SDR");
        assert_eq!(metric_of(3), "SIR");
        assert_eq!(metric_of(4), "SIR");
    }
}
