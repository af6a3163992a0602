//! Reference dataset: ground-truth stems laid out per track title.
//!
//! Two sources are supported: a YAML manifest listing every stem file, or a
//! DSD100-style directory tree `Sources/<subset>/<title>/<stem>.wav` that is
//! walked on load. Separated estimates live in a parallel tree
//! `<estimates_root>/<method>/<subset>/<title>/<stem>.wav`.

use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use walkdir::WalkDir;

use super::stems::{ACCOMPANIMENT, VOCALS};

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("No reference stem '{stem}' for a title containing \"{title}\"")]
    Missing { title: String, stem: String },
    #[error("{count} reference titles contain \"{title}\" for stem '{stem}': {candidates:?}")]
    Ambiguous {
        title: String,
        stem: String,
        count: usize,
        candidates: Vec<String>,
    },
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid reference manifest {path}: {message}")]
    Manifest { path: String, message: String },
}

/// One stem file of one reference track.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReferenceEntry {
    pub title: String,
    pub stem: String,
    /// Dataset split (`Dev` / `Test`) when known.
    #[serde(default)]
    pub subset: Option<String>,
    pub path: PathBuf,
}

/// YAML manifest layout.
#[derive(Debug, Deserialize)]
struct ReferenceManifest {
    #[serde(default)]
    base_path: Option<PathBuf>,
    entries: Vec<ReferenceEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceDataset {
    entries: Vec<ReferenceEntry>,
}

// Leading track index as used in DSD100/SiSEC titles: "005 - Artist - Song"
static TITLE_INDEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+\s*-\s*").unwrap());

/// Strip the numeric index prefix from a track title so it can be matched
/// against reference titles that may or may not carry it.
pub fn normalize_title(title: &str) -> String {
    TITLE_INDEX_RE.replace(title, "").trim().to_string()
}

impl ReferenceDataset {
    pub fn from_entries(entries: Vec<ReferenceEntry>) -> Self {
        Self { entries }
    }

    /// Load a YAML manifest. Relative entry paths are resolved against the
    /// manifest's `base_path`, or the manifest's own directory when absent.
    pub fn from_yaml(path: &Path) -> Result<Self, LookupError> {
        let contents = std::fs::read_to_string(path).map_err(|e| LookupError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let manifest: ReferenceManifest =
            serde_yaml::from_str(&contents).map_err(|e| LookupError::Manifest {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        let base = manifest
            .base_path
            .or_else(|| path.parent().map(Path::to_path_buf))
            .unwrap_or_default();

        let entries = manifest
            .entries
            .into_iter()
            .map(|mut e| {
                if e.path.is_relative() {
                    e.path = base.join(&e.path);
                }
                e
            })
            .collect::<Vec<_>>();

        log::info!(
            "Loaded {} reference stems from {}",
            entries.len(),
            path.display()
        );
        Ok(Self { entries })
    }

    /// Walk a DSD100-style tree. Every `.wav` file becomes an entry whose stem
    /// is the file stem, title the parent directory, subset the grandparent.
    pub fn scan(root: &Path) -> Result<Self, LookupError> {
        if !root.is_dir() {
            return Err(LookupError::Io {
                path: root.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
            });
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let is_wav = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
            if !is_wav {
                continue;
            }

            let stem = path.file_stem().and_then(|s| s.to_str());
            let title_dir = path.parent();
            let title = title_dir.and_then(|p| p.file_name()).and_then(|s| s.to_str());
            let subset = title_dir
                .and_then(|p| p.parent())
                .filter(|p| p != &root)
                .and_then(|p| p.file_name())
                .and_then(|s| s.to_str());

            match (stem, title) {
                (Some(stem), Some(title)) => entries.push(ReferenceEntry {
                    title: title.to_string(),
                    stem: stem.to_string(),
                    subset: subset.map(str::to_string),
                    path: path.to_path_buf(),
                }),
                _ => log::debug!("Skipping unrecognized reference file {}", path.display()),
            }
        }

        log::info!(
            "Found {} reference stems under {}",
            entries.len(),
            root.display()
        );
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The unique entry for `stem` whose title contains `title_substring`.
    pub fn find(&self, title_substring: &str, stem: &str) -> Result<&ReferenceEntry, LookupError> {
        let matches: Vec<&ReferenceEntry> = self
            .entries
            .iter()
            .filter(|e| e.stem == stem && e.title.contains(title_substring))
            .collect();

        match matches.as_slice() {
            [single] => Ok(single),
            [] => Err(LookupError::Missing {
                title: title_substring.to_string(),
                stem: stem.to_string(),
            }),
            many => Err(LookupError::Ambiguous {
                title: title_substring.to_string(),
                stem: stem.to_string(),
                count: many.len(),
                candidates: many.iter().map(|e| e.title.clone()).collect(),
            }),
        }
    }

    /// Path of the reference stem for a track title.
    pub fn lookup(&self, title_substring: &str, stem: &str) -> Result<PathBuf, LookupError> {
        self.find(title_substring, stem).map(|e| e.path.clone())
    }

    /// Where a method's estimate of `stem` lives for this title.
    ///
    /// Reference trees carry no accompaniment, so that stem is placed next to
    /// the vocals entry.
    pub fn estimate_path(
        &self,
        estimates_root: &Path,
        title_substring: &str,
        method: &str,
        stem: &str,
    ) -> Result<PathBuf, LookupError> {
        let anchor_stem = if stem == ACCOMPANIMENT { VOCALS } else { stem };
        let entry = self.find(title_substring, anchor_stem)?;

        let mut path = estimates_root.join(method);
        if let Some(subset) = &entry.subset {
            path.push(subset);
        }
        path.push(&entry.title);
        path.push(format!("{stem}.wav"));
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str, stem: &str, subset: Option<&str>) -> ReferenceEntry {
        ReferenceEntry {
            title: title.to_string(),
            stem: stem.to_string(),
            subset: subset.map(str::to_string),
            path: PathBuf::from(format!("/ref/{title}/{stem}.wav")),
        }
    }

    fn dataset() -> ReferenceDataset {
        ReferenceDataset::from_entries(vec![
            entry("005 - Angela Thomas Wade - Milk Cow Blues", "vocals", Some("Test")),
            entry("005 - Angela Thomas Wade - Milk Cow Blues", "bass", Some("Test")),
            entry(
                "019 - James Elder & Mark M Thompson - The English Actor",
                "vocals",
                Some("Test"),
            ),
            entry("031 - Angela Thomas Wade - Other Song", "vocals", Some("Dev")),
        ])
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(
            normalize_title("005 - Angela Thomas Wade - Milk Cow Blues"),
            "Angela Thomas Wade - Milk Cow Blues"
        );
        assert_eq!(normalize_title("  12-Artist - Song "), "Artist - Song");
        assert_eq!(normalize_title("No Index - Song"), "No Index - Song");
    }

    #[test]
    fn test_lookup_unique() {
        let ds = dataset();
        let path = ds
            .lookup("Angela Thomas Wade - Milk Cow Blues", "bass")
            .unwrap();
        assert_eq!(
            path,
            PathBuf::from("/ref/005 - Angela Thomas Wade - Milk Cow Blues/bass.wav")
        );
    }

    #[test]
    fn test_lookup_missing_stem() {
        let ds = dataset();
        let err = ds.lookup("The English Actor", "drums").unwrap_err();
        assert!(matches!(err, LookupError::Missing { .. }));
    }

    #[test]
    fn test_lookup_ambiguous_title() {
        let ds = dataset();
        let err = ds.lookup("Angela Thomas Wade", "vocals").unwrap_err();
        match err {
            LookupError::Ambiguous { count, .. } => assert_eq!(count, 2),
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn test_estimate_path_layout() {
        let ds = dataset();
        let p = ds
            .estimate_path(Path::new("/est"), "Milk Cow Blues", "GRA2", "bass")
            .unwrap();
        assert_eq!(
            p,
            PathBuf::from("/est/GRA2/Test/005 - Angela Thomas Wade - Milk Cow Blues/bass.wav")
        );
    }

    #[test]
    fn test_estimate_path_accompaniment_uses_vocals_location() {
        let ds = dataset();
        let p = ds
            .estimate_path(Path::new("/est"), "The English Actor", "UHL3", "accompaniment")
            .unwrap();
        assert_eq!(
            p,
            PathBuf::from(
                "/est/UHL3/Test/019 - James Elder & Mark M Thompson - The English Actor/accompaniment.wav"
            )
        );
    }

    #[test]
    fn test_scan_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let track = dir.path().join("Test").join("001 - A - B");
        std::fs::create_dir_all(&track).unwrap();
        for stem in ["vocals", "drums"] {
            std::fs::write(track.join(format!("{stem}.wav")), b"").unwrap();
        }
        std::fs::write(track.join("notes.txt"), b"").unwrap();

        let ds = ReferenceDataset::scan(dir.path()).unwrap();
        assert_eq!(ds.len(), 2);
        let e = ds.find("A - B", "drums").unwrap();
        assert_eq!(e.subset.as_deref(), Some("Test"));
        assert_eq!(e.title, "001 - A - B");
    }

    #[test]
    fn test_yaml_manifest_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("refs.yaml");
        std::fs::write(
            &manifest,
            "base_path: /data/DSD100\n\
             entries:\n\
             \x20 - title: \"001 - A - B\"\n\
             \x20   stem: vocals\n\
             \x20   subset: Dev\n\
             \x20   path: Sources/Dev/001 - A - B/vocals.wav\n",
        )
        .unwrap();

        let ds = ReferenceDataset::from_yaml(&manifest).unwrap();
        assert_eq!(
            ds.lookup("A - B", "vocals").unwrap(),
            PathBuf::from("/data/DSD100/Sources/Dev/001 - A - B/vocals.wav")
        );
    }
}
