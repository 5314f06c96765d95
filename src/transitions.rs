//! Phrase-aware mix-in / mix-out point detection for a single track.

use serde::{Deserialize, Serialize};

use crate::curve::{mean, variance};
use crate::db::models::{Section, SectionKind};
use crate::sections::rms_curve;

/// Beats per phrase.
pub const PHRASE_LENGTH: usize = 16;

const ENERGY_CHANGE: f64 = 0.15;
const LOW_ENERGY: f64 = 0.4;
const MIN_BREAKDOWN_SECS: f64 = 8.0;
const BREAKDOWN_SCORE: f64 = 0.7;
const FIRST_PHRASE_SCORE: f64 = 0.9;
const LAST_PHRASE_SCORE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WindowType {
    Intro,
    Outro,
    Breakdown,
    BuildUp,
    Sustain,
}

impl WindowType {
    fn from_section(kind: SectionKind) -> Self {
        match kind {
            SectionKind::Intro => Self::Intro,
            SectionKind::Outro => Self::Outro,
            SectionKind::Breakdown => Self::Breakdown,
            SectionKind::Build => Self::BuildUp,
            _ => Self::Sustain,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intro => "intro",
            Self::Outro => "outro",
            Self::Breakdown => "breakdown",
            Self::BuildUp => "buildUp",
            Self::Sustain => "sustain",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionWindow {
    pub window_type: WindowType,
    pub start_beat: usize,
    pub end_beat: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub avg_energy: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionPoint {
    pub beat: usize,
    pub time: f64,
    pub score: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionAnalysis {
    pub bpm: f64,
    pub total_beats: usize,
    /// One RMS value per beat, normalized to its max.
    pub energy_curve: Vec<f64>,
    pub phrase_boundaries: Vec<usize>,
    pub windows: Vec<TransitionWindow>,
    /// Best first.
    pub mix_in_points: Vec<TransitionPoint>,
    /// Latest first.
    pub mix_out_points: Vec<TransitionPoint>,
    pub recommended_mix_in: Option<usize>,
    pub recommended_mix_out: Option<usize>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TransitionAnalyzer;

impl TransitionAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(
        &self,
        samples: &[f32],
        sample_rate: u32,
        bpm: f64,
        sections: &[Section],
    ) -> TransitionAnalysis {
        let total_beats = if sample_rate == 0 || !bpm.is_finite() || bpm <= 0.0 {
            0
        } else {
            let duration = samples.len() as f64 / sample_rate as f64;
            (duration * bpm / 60.0) as usize
        };
        let beat_secs = if total_beats > 0 { 60.0 / bpm } else { 0.0 };

        let energy_curve = rms_curve(samples, total_beats);
        let phrase_boundaries = phrase_boundaries(&energy_curve);
        let windows = if sections.is_empty() {
            breakdown_windows(&energy_curve, beat_secs)
        } else {
            section_windows(sections, &energy_curve, bpm)
        };

        let mix_in_points = mix_in_points(&phrase_boundaries, &windows, total_beats, beat_secs);
        let mix_out_points = mix_out_points(&phrase_boundaries, &windows, total_beats, beat_secs);

        log::debug!(
            "{} beats, {} phrase boundaries, {} windows, {} in / {} out points",
            total_beats,
            phrase_boundaries.len(),
            windows.len(),
            mix_in_points.len(),
            mix_out_points.len()
        );

        TransitionAnalysis {
            bpm,
            total_beats,
            recommended_mix_in: mix_in_points.first().map(|p| p.beat),
            recommended_mix_out: mix_out_points.first().map(|p| p.beat),
            energy_curve,
            phrase_boundaries,
            windows,
            mix_in_points,
            mix_out_points,
        }
    }
}

/// Every phrase start, plus the nearest phrase start to any sharp energy
/// change that isn't already recorded. Sorted, unique, all `<= total_beats`;
/// a change in the last half phrase records the end of the track.
fn phrase_boundaries(curve: &[f64]) -> Vec<usize> {
    let total = curve.len();
    let mut boundaries: Vec<usize> = (0..total).step_by(PHRASE_LENGTH).collect();

    for i in 1..total {
        if (curve[i] - curve[i - 1]).abs() <= ENERGY_CHANGE {
            continue;
        }
        let nearest = ((i as f64 / PHRASE_LENGTH as f64).round() as usize) * PHRASE_LENGTH;
        if nearest != 0 && nearest <= total && !boundaries.contains(&nearest) {
            boundaries.push(nearest);
        }
    }

    boundaries.sort_unstable();
    boundaries
}

fn section_windows(sections: &[Section], curve: &[f64], bpm: f64) -> Vec<TransitionWindow> {
    let total = curve.len();
    let beat_secs = if total > 0 { 60.0 / bpm } else { 0.0 };
    let to_beat = |t: f64| ((t.max(0.0) * bpm / 60.0).round() as usize).min(total);

    sections
        .iter()
        .filter(|s| s.end > s.start)
        .map(|s| {
            let start_beat = to_beat(s.start);
            let end_beat = to_beat(s.end).max(start_beat);
            let energies = &curve[start_beat..end_beat];
            let avg_energy = mean(energies);
            let var = variance(energies, avg_energy);
            let aligned = start_beat % PHRASE_LENGTH == 0;

            let score = 0.5
                + 0.2 * (1.0 - avg_energy)
                + 0.15 * (1.0 - (var * 10.0).min(1.0))
                + 0.15 * (s.duration() / 30.0).min(1.0)
                + if aligned { 0.1 } else { 0.0 };

            TransitionWindow {
                window_type: WindowType::from_section(s.kind),
                start_beat,
                end_beat,
                start_time: start_beat as f64 * beat_secs,
                end_time: end_beat as f64 * beat_secs,
                avg_energy,
                score: score.clamp(0.0, 1.0),
            }
        })
        .collect()
}

/// Contiguous low-energy stretches of at least `MIN_BREAKDOWN_SECS`.
fn breakdown_windows(curve: &[f64], beat_secs: f64) -> Vec<TransitionWindow> {
    let mut windows = Vec::new();
    let mut run_start: Option<usize> = None;

    // Trailing sentinel closes a run that reaches the end.
    for (i, &e) in curve.iter().chain(std::iter::once(&f64::INFINITY)).enumerate() {
        match (e < LOW_ENERGY, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                if (i - start) as f64 * beat_secs >= MIN_BREAKDOWN_SECS {
                    windows.push(TransitionWindow {
                        window_type: WindowType::Breakdown,
                        start_beat: start,
                        end_beat: i,
                        start_time: start as f64 * beat_secs,
                        end_time: i as f64 * beat_secs,
                        avg_energy: mean(&curve[start..i]),
                        score: BREAKDOWN_SCORE,
                    });
                }
                run_start = None;
            }
            _ => {}
        }
    }
    windows
}

fn point(beat: usize, beat_secs: f64, score: f64, reason: impl Into<String>) -> TransitionPoint {
    TransitionPoint {
        beat,
        time: beat as f64 * beat_secs,
        score,
        reason: reason.into(),
    }
}

fn mix_in_points(
    boundaries: &[usize],
    windows: &[TransitionWindow],
    total_beats: usize,
    beat_secs: f64,
) -> Vec<TransitionPoint> {
    let mut points = Vec::new();
    if let Some(&first) = boundaries.iter().find(|&&b| b > 0 && b < total_beats) {
        points.push(point(first, beat_secs, FIRST_PHRASE_SCORE, "intro on phrase boundary"));
    }
    for w in windows {
        if matches!(w.window_type, WindowType::Intro | WindowType::Breakdown) {
            let reason = format!("{} window start", w.window_type.as_str());
            points.push(point(w.start_beat, beat_secs, w.score, reason));
        }
    }
    points.sort_by(|a, b| b.score.total_cmp(&a.score));
    points
}

fn mix_out_points(
    boundaries: &[usize],
    windows: &[TransitionWindow],
    total_beats: usize,
    beat_secs: f64,
) -> Vec<TransitionPoint> {
    let mut points = Vec::new();
    if let Some(&last) = boundaries.iter().rev().find(|&&b| b + PHRASE_LENGTH <= total_beats) {
        points.push(point(last, beat_secs, LAST_PHRASE_SCORE, "last full phrase"));
    }
    for w in windows {
        if matches!(w.window_type, WindowType::Outro | WindowType::Breakdown) {
            let reason = format!("{} window start", w.window_type.as_str());
            points.push(point(w.start_beat, beat_secs, w.score, reason));
        }
    }
    points.sort_by(|a, b| b.beat.cmp(&a.beat));
    points
}
