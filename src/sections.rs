//! Per-section feature profiles and profile comparison.
//!
//! A profile is built from a raw mono sample buffer. Structural sections come
//! from the analysis when known; otherwise the track is cut into overlapping
//! fixed-length windows. Feature vectors come from an injected
//! [`EmbeddingModel`] so the inference backend can be swapped freely.

use std::sync::atomic::{AtomicBool, Ordering};

use rustfft::{FftPlanner, num_complex::Complex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::curve::{CURVE_RESOLUTION, pearson};
use crate::db::models::{Section, SectionKind};
use crate::similarity::cosine_similarity;

/// Pseudo-section length when a track has no structure, seconds.
pub const WINDOW_SECS: f64 = 8.0;
/// Overlap between consecutive pseudo-sections, seconds.
pub const WINDOW_OVERLAP_SECS: f64 = 2.0;

const FFT_SIZE: usize = 2048;
const MIN_SECTION_MATCH: f64 = 0.5;

#[derive(Error, Debug, PartialEq)]
pub enum ProfileError {
    #[error("invalid section range {start:.2}s..{end:.2}s")]
    InvalidRange { start: f64, end: f64 },
    #[error("profiling cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ProfileError>;

/// Audio embedding inference, e.g. a 512-d model served elsewhere.
pub trait EmbeddingModel: Send + Sync {
    fn embed(&self, samples: &[f32], sample_rate: u32) -> Vec<f32>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionEmbedding {
    pub kind: SectionKind,
    pub start: f64,
    pub end: f64,
    pub vector: Vec<f32>,
    pub rms_energy: f64,
    /// Hz
    pub spectral_centroid: f64,
    pub zero_crossing_rate: f64,
}

impl SectionEmbedding {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSectionProfile {
    pub sections: Vec<SectionEmbedding>,
    /// Duration-weighted mean of section vectors, unit length.
    pub global_embedding: Vec<f32>,
    /// RMS energy at `CURVE_RESOLUTION` points, normalized to its max.
    pub energy_curve: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionMatch {
    pub source_index: usize,
    pub target_index: usize,
    pub source_kind: SectionKind,
    pub target_kind: SectionKind,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileComparison {
    pub global_similarity: f64,
    pub energy_correlation: f64,
    pub section_matches: Vec<SectionMatch>,
    /// Mean of global similarity and energy correlation.
    pub overall: f64,
}

pub struct SectionProfiler<M: EmbeddingModel> {
    model: M,
}

impl<M: EmbeddingModel> SectionProfiler<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn profile(
        &self,
        samples: &[f32],
        sample_rate: u32,
        sections: &[Section],
    ) -> Result<TrackSectionProfile> {
        self.profile_cancellable(samples, sample_rate, sections, &AtomicBool::new(false))
    }

    /// Like [`profile`](Self::profile), checking `cancel` between sections.
    pub fn profile_cancellable(
        &self,
        samples: &[f32],
        sample_rate: u32,
        sections: &[Section],
        cancel: &AtomicBool,
    ) -> Result<TrackSectionProfile> {
        let spans = if sections.is_empty() {
            let duration = if sample_rate == 0 {
                0.0
            } else {
                samples.len() as f64 / sample_rate as f64
            };
            sliding_windows(duration)
        } else {
            for s in sections {
                if s.end <= s.start {
                    return Err(ProfileError::InvalidRange { start: s.start, end: s.end });
                }
            }
            sections.to_vec()
        };

        let mut embedded = Vec::with_capacity(spans.len());
        for span in &spans {
            if cancel.load(Ordering::Relaxed) {
                log::info!("Section profiling cancelled after {} sections", embedded.len());
                return Err(ProfileError::Cancelled);
            }
            embedded.push(self.embed_section(samples, sample_rate, span));
        }

        let global_embedding = global_embedding(&embedded);
        let energy_curve = rms_curve(samples, CURVE_RESOLUTION);
        log::debug!(
            "Profiled {} sections ({}), global dim {}",
            embedded.len(),
            if sections.is_empty() { "windowed" } else { "structural" },
            global_embedding.len()
        );

        Ok(TrackSectionProfile {
            sections: embedded,
            global_embedding,
            energy_curve,
        })
    }

    fn embed_section(&self, samples: &[f32], sample_rate: u32, span: &Section) -> SectionEmbedding {
        let rate = sample_rate as f64;
        let from = ((span.start * rate) as usize).min(samples.len());
        let to = ((span.end * rate) as usize).clamp(from, samples.len());
        let slice = &samples[from..to];

        SectionEmbedding {
            kind: span.kind,
            start: span.start,
            end: span.end,
            vector: self.model.embed(slice, sample_rate),
            rms_energy: rms(slice),
            spectral_centroid: spectral_centroid(slice, sample_rate),
            zero_crossing_rate: zero_crossing_rate(slice),
        }
    }

    /// Compare two profiles. Section matches are informational and do not
    /// contribute to `overall`.
    pub fn compare(&self, a: &TrackSectionProfile, b: &TrackSectionProfile) -> ProfileComparison {
        let global_similarity = cosine_similarity(&a.global_embedding, &b.global_embedding);
        let energy_correlation = pearson(&a.energy_curve, &b.energy_curve);

        let mut section_matches = Vec::new();
        for (i, source) in a.sections.iter().enumerate() {
            let mut best: Option<(usize, f64)> = None;
            for (j, target) in b.sections.iter().enumerate() {
                let score = cosine_similarity(&source.vector, &target.vector);
                if best.is_none_or(|(_, s)| score > s) {
                    best = Some((j, score));
                }
            }
            match best {
                Some((j, score)) if score > MIN_SECTION_MATCH => {
                    section_matches.push(SectionMatch {
                        source_index: i,
                        target_index: j,
                        source_kind: source.kind,
                        target_kind: b.sections[j].kind,
                        score,
                    });
                }
                _ => {}
            }
        }

        ProfileComparison {
            global_similarity,
            energy_correlation,
            overall: (global_similarity + energy_correlation) / 2.0,
            section_matches,
        }
    }
}

/// Window spans covering `[0, duration]`; the last one is cut at the end.
fn sliding_windows(duration: f64) -> Vec<Section> {
    let hop = WINDOW_SECS - WINDOW_OVERLAP_SECS;
    let mut windows = Vec::new();
    let mut start = 0.0;
    while start < duration {
        let end = (start + WINDOW_SECS).min(duration);
        windows.push(Section::new(SectionKind::Window, start, end));
        if end >= duration {
            break;
        }
        start += hop;
    }
    windows
}

fn global_embedding(sections: &[SectionEmbedding]) -> Vec<f32> {
    let Some(dim) = sections.iter().map(|s| s.vector.len()).find(|&d| d > 0) else {
        return Vec::new();
    };

    let mut acc = vec![0.0_f64; dim];
    let mut total_weight = 0.0;
    for s in sections {
        if s.vector.len() != dim {
            log::warn!(
                "Skipping {} section at {:.1}s: vector dim {} != {}",
                s.kind.as_str(),
                s.start,
                s.vector.len(),
                dim
            );
            continue;
        }
        let w = s.duration();
        for (a, &v) in acc.iter_mut().zip(&s.vector) {
            *a += w * v as f64;
        }
        total_weight += w;
    }

    if total_weight > 0.0 {
        acc.iter_mut().for_each(|a| *a /= total_weight);
    }
    let norm = acc.iter().map(|a| a * a).sum::<f64>().sqrt();
    if norm > 0.0 {
        acc.iter_mut().for_each(|a| *a /= norm);
    }
    acc.into_iter().map(|a| a as f32).collect()
}

fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

/// RMS over `points` equal slices of the buffer, scaled so the max is 1.
pub fn rms_curve(samples: &[f32], points: usize) -> Vec<f64> {
    let n = samples.len();
    let mut curve: Vec<f64> = (0..points)
        .map(|i| rms(&samples[i * n / points..(i + 1) * n / points]))
        .collect();
    let max = curve.iter().cloned().fold(0.0, f64::max);
    if max > 0.0 {
        curve.iter_mut().for_each(|v| *v /= max);
    }
    curve
}

fn zero_crossing_rate(samples: &[f32]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    crossings as f64 / (samples.len() - 1) as f64
}

/// Mean spectral centroid over non-overlapping Hann-windowed FFT frames.
/// A slice shorter than one frame is zero-padded.
fn spectral_centroid(samples: &[f32], sample_rate: u32) -> f64 {
    if samples.is_empty() || sample_rate == 0 {
        return 0.0;
    }

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(FFT_SIZE);
    let window: Vec<f32> = (0..FFT_SIZE)
        .map(|i| {
            0.5 * (1.0 - ((2.0 * std::f32::consts::PI * i as f32) / (FFT_SIZE as f32 - 1.0)).cos())
        })
        .collect();
    let bin_width = sample_rate as f64 / FFT_SIZE as f64;

    let mut buffer = vec![Complex::new(0.0_f32, 0.0); FFT_SIZE];
    let mut total = 0.0;
    let mut frames = 0usize;
    for frame in samples.chunks(FFT_SIZE) {
        for (i, slot) in buffer.iter_mut().enumerate() {
            let s = frame.get(i).copied().unwrap_or(0.0);
            *slot = Complex::new(s * window[i], 0.0);
        }
        fft.process(&mut buffer);

        let (weighted, mag_sum) = buffer[..FFT_SIZE / 2 + 1]
            .iter()
            .enumerate()
            .fold((0.0_f64, 0.0_f64), |(w, m), (bin, c)| {
                let mag = c.norm() as f64;
                (w + bin as f64 * bin_width * mag, m + mag)
            });
        if mag_sum > 0.0 {
            total += weighted / mag_sum;
            frames += 1;
        }
    }

    if frames == 0 { 0.0 } else { total / frames as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic stand-in: [rms, zcr, 1].
    struct FeatureModel;

    impl EmbeddingModel for FeatureModel {
        fn embed(&self, samples: &[f32], _sample_rate: u32) -> Vec<f32> {
            vec![rms(samples) as f32, zero_crossing_rate(samples) as f32, 1.0]
        }
    }

    fn sine(freq: f32, rate: u32, secs: f32, amp: f32) -> Vec<f32> {
        let n = (rate as f32 * secs) as usize;
        (0..n)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_windows_without_sections() {
        let samples = sine(50.0, 1000, 20.0, 0.5);
        let profile = SectionProfiler::new(FeatureModel).profile(&samples, 1000, &[]).unwrap();
        let spans: Vec<(f64, f64)> = profile.sections.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(spans, vec![(0.0, 8.0), (6.0, 14.0), (12.0, 20.0)]);
        assert!(profile.sections.iter().all(|s| s.kind == SectionKind::Window));
    }

    #[test]
    fn test_short_track_single_window() {
        let samples = sine(50.0, 1000, 3.0, 0.5);
        let profile = SectionProfiler::new(FeatureModel).profile(&samples, 1000, &[]).unwrap();
        assert_eq!(profile.sections.len(), 1);
        assert_eq!(profile.sections[0].end, 3.0);
    }

    #[test]
    fn test_structural_sections() {
        let samples = sine(50.0, 1000, 30.0, 0.5);
        let sections = vec![
            Section::new(SectionKind::Intro, 0.0, 10.0),
            Section::new(SectionKind::Drop, 10.0, 30.0),
        ];
        let profile = SectionProfiler::new(FeatureModel)
            .profile(&samples, 1000, &sections)
            .unwrap();
        assert_eq!(profile.sections.len(), 2);
        assert_eq!(profile.sections[1].kind, SectionKind::Drop);
        assert!((profile.sections[0].rms_energy - 0.5 / 2f64.sqrt()).abs() < 0.01);
    }

    #[test]
    fn test_invalid_range() {
        let samples = vec![0.1; 1000];
        let sections = vec![Section::new(SectionKind::Verse, 5.0, 5.0)];
        let err = SectionProfiler::new(FeatureModel)
            .profile(&samples, 1000, &sections)
            .unwrap_err();
        assert_eq!(err, ProfileError::InvalidRange { start: 5.0, end: 5.0 });
    }

    #[test]
    fn test_cancelled() {
        let samples = vec![0.1; 20_000];
        let cancel = AtomicBool::new(true);
        let result = SectionProfiler::new(FeatureModel).profile_cancellable(&samples, 1000, &[], &cancel);
        assert_eq!(result, Err(ProfileError::Cancelled));
    }

    #[test]
    fn test_global_embedding_is_unit_length() {
        let mut samples = sine(50.0, 1000, 10.0, 0.2);
        samples.extend(sine(120.0, 1000, 10.0, 0.9));
        let profile = SectionProfiler::new(FeatureModel).profile(&samples, 1000, &[]).unwrap();
        let norm: f32 = profile.global_embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_energy_curve() {
        let mut samples = vec![0.1_f32; 5000];
        samples.extend(vec![0.8_f32; 5000]);
        let curve = rms_curve(&samples, CURVE_RESOLUTION);
        assert_eq!(curve.len(), CURVE_RESOLUTION);
        assert!((curve[99] - 1.0).abs() < 1e-9);
        assert!((curve[0] - 0.125).abs() < 1e-6);
    }

    #[test]
    fn test_silent_track_curve_is_zero() {
        let curve = rms_curve(&vec![0.0; 500], CURVE_RESOLUTION);
        assert!(curve.iter().all(|&v| v == 0.0));
        assert_eq!(rms_curve(&[], 10), vec![0.0; 10]);
    }

    #[test]
    fn test_spectral_centroid_of_sine() {
        let samples = sine(250.0, 4000, 2.0, 0.8);
        let centroid = spectral_centroid(&samples, 4000);
        assert!((centroid - 250.0).abs() < 15.0, "centroid {centroid}");
    }

    #[test]
    fn test_zero_crossing_rate() {
        let alternating: Vec<f32> = (0..100).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!((zero_crossing_rate(&alternating) - 1.0).abs() < 1e-9);
        assert_eq!(zero_crossing_rate(&[0.5; 10]), 0.0);
    }

    #[test]
    fn test_compare_identical() {
        let mut samples = sine(60.0, 1000, 12.0, 0.3);
        samples.extend(sine(200.0, 1000, 12.0, 0.9));
        let profiler = SectionProfiler::new(FeatureModel);
        let profile = profiler.profile(&samples, 1000, &[]).unwrap();
        let cmp = profiler.compare(&profile, &profile);
        assert!((cmp.global_similarity - 1.0).abs() < 1e-6);
        assert!((cmp.energy_correlation - 1.0).abs() < 1e-6);
        assert!((cmp.overall - 1.0).abs() < 1e-6);
        assert_eq!(cmp.section_matches.len(), profile.sections.len());
        assert!(cmp.section_matches.iter().all(|m| m.score > 0.5));
    }

    /// Loud slices embed as [1, 0]; quiet ones as [1, 2], cosine 1/sqrt(5) apart.
    struct LevelModel;

    impl EmbeddingModel for LevelModel {
        fn embed(&self, samples: &[f32], _sample_rate: u32) -> Vec<f32> {
            if rms(samples) > 0.3 { vec![1.0, 0.0] } else { vec![1.0, 2.0] }
        }
    }

    #[test]
    fn test_compare_drops_weak_section_matches() {
        let mut samples = sine(50.0, 1000, 10.0, 0.1);
        samples.extend(sine(50.0, 1000, 10.0, 0.9));
        let mixed = vec![
            Section::new(SectionKind::Intro, 0.0, 10.0),
            Section::new(SectionKind::Drop, 10.0, 20.0),
        ];
        let loud = sine(50.0, 1000, 20.0, 0.9);
        let peak = vec![Section::new(SectionKind::Drop, 0.0, 20.0)];

        let profiler = SectionProfiler::new(LevelModel);
        let a = profiler.profile(&samples, 1000, &mixed).unwrap();
        let b = profiler.profile(&loud, 1000, &peak).unwrap();
        let cmp = profiler.compare(&a, &b);

        // Quiet intro scores 0.447 against the drop and is left out
        assert_eq!(cmp.section_matches.len(), 1);
        let m = &cmp.section_matches[0];
        assert_eq!((m.source_index, m.target_index), (1, 0));
        assert_eq!((m.source_kind, m.target_kind), (SectionKind::Drop, SectionKind::Drop));
        assert!((m.score - 1.0).abs() < 1e-6);

        // Section matches are reported only
        assert_eq!(cmp.overall, (cmp.global_similarity + cmp.energy_correlation) / 2.0);

        let reverse = profiler.compare(&b, &a);
        assert_eq!(reverse.section_matches.len(), 1);
        assert_eq!(reverse.section_matches[0].target_index, 1);
    }

    #[test]
    fn test_compare_empty_profiles() {
        let profiler = SectionProfiler::new(FeatureModel);
        let empty = profiler.profile(&[], 1000, &[]).unwrap();
        let cmp = profiler.compare(&empty, &empty);
        assert_eq!(cmp.overall, 0.0);
        assert!(cmp.section_matches.is_empty());
    }
}
