use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structural role of a section within a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    Intro,
    Verse,
    Chorus,
    Build,
    Drop,
    Breakdown,
    Bridge,
    Outro,
    /// Fixed-length pseudo-section produced when no structure is known.
    Window,
    #[serde(other)]
    Other,
}

impl SectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intro => "intro",
            Self::Verse => "verse",
            Self::Chorus => "chorus",
            Self::Build => "build",
            Self::Drop => "drop",
            Self::Breakdown => "breakdown",
            Self::Bridge => "bridge",
            Self::Outro => "outro",
            Self::Window => "window",
            Self::Other => "other",
        }
    }
}

/// A labelled structural section, times in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub kind: SectionKind,
    pub start: f64,
    pub end: f64,
}

impl Section {
    pub fn new(kind: SectionKind, start: f64, end: f64) -> Self {
        Self { kind, start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// A user or analyzer placed cue, time in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuePoint {
    pub time: f64,
    pub label: String,
    #[serde(default)]
    pub kind: Option<String>,
}

/// One analysis run of a track. Re-analysis stores a new `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackAnalysis {
    pub version: i64,
    pub duration: f64,
    pub bpm: f64,
    pub bpm_confidence: f64,
    /// Key value, Camelot ("8A") unless `key_format` says otherwise.
    pub key: String,
    pub key_format: String,
    pub key_confidence: f64,
    /// 0-10
    pub energy_level: i32,
    pub lufs: f64,
    pub true_peak_db: f64,
    pub loudness_range: f64,
    pub waveform_preview: Vec<f64>,
    pub sections: Vec<Section>,
    pub cue_points: Vec<CuePoint>,
    pub sound_context: Option<String>,
    pub qa_flags: Vec<String>,
    pub has_embedding: bool,
}

impl Default for TrackAnalysis {
    fn default() -> Self {
        Self {
            version: 0,
            duration: 0.0,
            bpm: 0.0,
            bpm_confidence: 0.0,
            key: String::new(),
            key_format: "camelot".to_string(),
            key_confidence: 0.0,
            energy_level: 0,
            lufs: 0.0,
            true_peak_db: 0.0,
            loudness_range: 0.0,
            waveform_preview: Vec::new(),
            sections: Vec::new(),
            cue_points: Vec::new(),
            sound_context: None,
            qa_flags: Vec::new(),
            has_embedding: false,
        }
    }
}

impl TrackAnalysis {
    /// Key in Camelot notation, converting standard notation when tagged so.
    /// Unconvertible keys are returned unchanged and will classify as unknown.
    pub fn camelot_key(&self) -> String {
        crate::keys::to_camelot(&self.key, &self.key_format)
            .map(|k| k.to_string())
            .unwrap_or_else(|| self.key.clone())
    }
}

/// A library track with its latest analysis, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: i64,
    pub content_hash: String,
    pub file_path: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub file_size: i64,
    pub modified_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub analysis: Option<TrackAnalysis>,
}

impl Track {
    /// "Artist - Title", for tables and logs.
    pub fn display_name(&self) -> String {
        if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artist, self.title)
        }
    }
}

/// Data for inserting or updating a track.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTrack {
    pub content_hash: String,
    pub file_path: String,
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub file_size: i64,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

/// One entry of an import file produced by the analysis pipeline.
#[derive(Debug, Deserialize)]
pub struct ImportRecord {
    pub track: NewTrack,
    #[serde(default)]
    pub analysis: Option<TrackAnalysis>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

/// Library statistics.
#[derive(Debug)]
pub struct LibraryStats {
    pub total_tracks: i64,
    pub analyzed_tracks: i64,
    pub embedded_tracks: i64,
    pub cached_pairs: i64,
    pub total_duration_hours: f64,
    pub keys: Vec<(String, i64)>,
}
