use serde::{Deserialize, Serialize};

use crate::curve::{self, EnergyCurveShape};

/// Share of the curve compared at the seam for continuation fits.
const SEAM_FRACTION: f64 = 0.10;

/// Slopes smaller than this count as level when comparing seam direction.
const LEVEL_SLOPE: f64 = 0.02;

/// How two energy curves fit together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// Both curves move the same way.
    Parallel,
    /// One curve fills the other's gaps.
    Complementary,
    /// The candidate picks up where the source ends.
    Continuation,
    /// Deliberately different shapes.
    Contrast,
}

impl MatchType {
    /// Evaluation order; earlier types win exact ties.
    pub const ALL: [MatchType; 4] = [
        MatchType::Parallel,
        MatchType::Complementary,
        MatchType::Continuation,
        MatchType::Contrast,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::Complementary => "complementary",
            Self::Continuation => "continuation",
            Self::Contrast => "contrast",
        }
    }
}

/// Best transition point found on an outgoing curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveTransition {
    /// Fraction of the outgoing track (0.5-0.9).
    pub position: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveMatch {
    pub candidate_id: i64,
    pub match_type: MatchType,
    pub overall_score: f64,
    pub correlation: f64,
    pub inverse_correlation: f64,
    pub shape_similarity: f64,
    pub continuation_score: f64,
    pub transition: CurveTransition,
}

/// Raw fit signals between a source and a candidate curve.
#[derive(Debug, Clone, Copy)]
struct FitSignals {
    correlation: f64,
    inverse_correlation: f64,
    shape_similarity: f64,
    continuation: f64,
    level_gap: f64,
}

/// Ranks energy-curve partners and finds transition points. Stateless.
#[derive(Debug, Clone, Default)]
pub struct EnergyCurveMatcher;

impl EnergyCurveMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Rank `candidates` against `source`, best first.
    ///
    /// With `preferred` set, only matches of that type are returned, unless
    /// none qualifies, in which case the full ranking is returned instead.
    pub fn find_matches(
        &self,
        source: &[f64],
        candidates: &[(i64, Vec<f64>)],
        preferred: Option<MatchType>,
        limit: usize,
    ) -> Vec<CurveMatch> {
        let src = curve::normalize(source);
        let src_shape = curve::analyze_shape(&src);

        let mut matches: Vec<CurveMatch> = candidates
            .iter()
            .map(|(id, raw)| {
                let cand = curve::normalize(raw);
                let cand_shape = curve::analyze_shape(&cand);
                let signals = fit_signals(&src, &src_shape, &cand, &cand_shape);
                let (match_type, overall_score) = classify(&signals);
                CurveMatch {
                    candidate_id: *id,
                    match_type,
                    overall_score,
                    correlation: signals.correlation,
                    inverse_correlation: signals.inverse_correlation,
                    shape_similarity: signals.shape_similarity,
                    continuation_score: signals.continuation,
                    transition: optimal_transition_normalized(&src, &cand),
                }
            })
            .collect();

        matches.sort_by(|a, b| {
            b.overall_score
                .partial_cmp(&a.overall_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if let Some(kind) = preferred {
            let filtered: Vec<CurveMatch> = matches
                .iter()
                .filter(|m| m.match_type == kind)
                .cloned()
                .collect();
            if filtered.is_empty() {
                log::debug!("No {} matches, falling back to full ranking", kind.as_str());
            } else {
                matches = filtered;
            }
        }

        matches.truncate(limit);
        matches
    }

    /// Scan 50%..90% of `outgoing` for the point whose energy best meets the
    /// start of `incoming`. The earliest point wins ties.
    pub fn find_optimal_transition(&self, outgoing: &[f64], incoming: &[f64]) -> CurveTransition {
        optimal_transition_normalized(&curve::normalize(outgoing), &curve::normalize(incoming))
    }
}

fn optimal_transition_normalized(outgoing: &[f64], incoming: &[f64]) -> CurveTransition {
    let start_energy = incoming.first().copied().unwrap_or(0.0);
    let last = outgoing.len().saturating_sub(1) as f64;
    let mut best = CurveTransition {
        position: 0.5,
        score: f64::MIN,
    };

    // 10..=18 twentieths = 0.50..=0.90
    for step in 10..=18 {
        let position = step as f64 * 0.05;
        let index = (position * last).round() as usize;
        let energy = outgoing.get(index).copied().unwrap_or(0.0);
        let score = 1.0 - ((energy - start_energy).abs() * 2.0).min(1.0);
        if score > best.score {
            best = CurveTransition { position, score };
        }
    }
    best
}

fn fit_signals(
    src: &[f64],
    src_shape: &EnergyCurveShape,
    cand: &[f64],
    cand_shape: &EnergyCurveShape,
) -> FitSignals {
    let inverted: Vec<f64> = cand.iter().map(|v| 1.0 - v).collect();
    FitSignals {
        correlation: curve::pearson(src, cand),
        inverse_correlation: curve::pearson(src, &inverted),
        shape_similarity: shape_similarity(src_shape, cand_shape),
        continuation: continuation_score(src, cand),
        level_gap: (src_shape.mean - cand_shape.mean).abs(),
    }
}

/// 0.3 trend + 0.3 pattern + 0.2 energy level + 0.2 peak position.
fn shape_similarity(a: &EnergyCurveShape, b: &EnergyCurveShape) -> f64 {
    let trend = if a.trend == b.trend { 0.3 } else { 0.0 };
    let pattern = if a.pattern == b.pattern { 0.3 } else { 0.0 };
    let level = 0.2 * (1.0 - (a.mean - b.mean).abs()).max(0.0);
    let peak = 0.2 * (1.0 - (a.peak_position - b.peak_position).abs()).max(0.0);
    trend + pattern + level + peak
}

/// Compare the tail of `src` with the head of `cand`: level closeness and
/// matching slope direction.
fn continuation_score(src: &[f64], cand: &[f64]) -> f64 {
    let seam = ((src.len().min(cand.len()) as f64 * SEAM_FRACTION).round() as usize).max(1);
    if src.len() < seam || cand.len() < seam {
        return 0.0;
    }
    let tail = &src[src.len() - seam..];
    let head = &cand[..seam];

    let level = 1.0 - (curve::mean(tail) - curve::mean(head)).abs().min(1.0);
    let slope_match = if slope_sign(tail) == slope_sign(head) { 1.0 } else { 0.0 };
    0.6 * level + 0.4 * slope_match
}

fn slope_sign(segment: &[f64]) -> i8 {
    let (Some(first), Some(last)) = (segment.first(), segment.last()) else {
        return 0;
    };
    let slope = last - first;
    if slope > LEVEL_SLOPE {
        1
    } else if slope < -LEVEL_SLOPE {
        -1
    } else {
        0
    }
}

/// Score each match type and keep the highest; ties keep the earlier type.
fn classify(s: &FitSignals) -> (MatchType, f64) {
    let to_unit = |r: f64| (r + 1.0) / 2.0;
    let mut best = (MatchType::Parallel, f64::MIN);
    for kind in MatchType::ALL {
        let score = match kind {
            MatchType::Parallel => 0.7 * to_unit(s.correlation) + 0.3 * s.shape_similarity,
            MatchType::Complementary => {
                0.6 * to_unit(s.inverse_correlation) + 0.3 * (1.0 - s.level_gap)
            }
            MatchType::Continuation => 0.8 * s.continuation + 0.2 * s.shape_similarity,
            MatchType::Contrast => 0.5 * (1.0 - s.shape_similarity) + 0.3 * s.level_gap,
        }
        .clamp(0.0, 1.0);
        if score > best.1 {
            best = (kind, score);
        }
    }
    best
}
