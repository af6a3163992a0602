use serde::Deserialize;

pub const BASS: &str = "bass";
pub const DRUMS: &str = "drums";
pub const OTHER: &str = "other";
pub const VOCALS: &str = "vocals";
pub const ACCOMPANIMENT: &str = "accompaniment";

/// Source stems every separated track is expected to provide.
pub const SOURCE_STEMS: [&str; 4] = [BASS, DRUMS, OTHER, VOCALS];

/// Which stems make a (track, method) group complete.
///
/// Strict mode requires exactly the four sources plus `accompaniment`.
/// Relaxed mode requires the four sources and tolerates `accompaniment`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StemVocabulary {
    pub strict: bool,
}

impl Default for StemVocabulary {
    fn default() -> Self {
        Self { strict: true }
    }
}

impl StemVocabulary {
    pub fn strict() -> Self {
        Self { strict: true }
    }

    pub fn relaxed() -> Self {
        Self { strict: false }
    }

    /// Whether `stem` belongs to the vocabulary at all.
    pub fn contains(&self, stem: &str) -> bool {
        stem == ACCOMPANIMENT || SOURCE_STEMS.contains(&stem)
    }

    /// Whether a group carrying `stems` (duplicates allowed) is complete.
    pub fn is_complete<'a, I>(&self, stems: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = [false; 5];
        for stem in stems {
            match stem_slot(stem) {
                Some(slot) => seen[slot] = true,
                None => return false,
            }
        }
        let sources = seen[..4].iter().all(|s| *s);
        if self.strict {
            sources && seen[4]
        } else {
            sources
        }
    }
}

fn stem_slot(stem: &str) -> Option<usize> {
    match stem {
        BASS => Some(0),
        DRUMS => Some(1),
        OTHER => Some(2),
        VOCALS => Some(3),
        ACCOMPANIMENT => Some(4),
        _ => None,
    }
}
