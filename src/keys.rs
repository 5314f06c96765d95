use serde::{Deserialize, Serialize};

/// Similarity assigned when either key cannot be parsed.
const UNKNOWN_SIMILARITY: f64 = 0.2;

/// Minor (A) or major (B) side of the Camelot wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyMode {
    A,
    B,
}

/// A parsed Camelot key: wheel position 1-12 plus mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CamelotKey {
    pub number: u8,
    pub mode: KeyMode,
}

impl CamelotKey {
    /// Parse "<1-12><A|B>" (case-insensitive, surrounding whitespace ignored).
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let mut chars = trimmed.chars();
        let letter = chars.next_back()?;
        let number = chars.as_str();
        let mode = match letter.to_ascii_uppercase() {
            'A' => KeyMode::A,
            'B' => KeyMode::B,
            _ => return None,
        };
        if !number.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let number: u8 = number.parse().ok()?;
        if !(1..=12).contains(&number) {
            return None;
        }
        Some(Self { number, mode })
    }

    /// Shortest distance between two wheel positions (0-6).
    pub fn wheel_distance(&self, other: &CamelotKey) -> u8 {
        let d = (self.number as i16 - other.number as i16).rem_euclid(12) as u8;
        d.min(12 - d)
    }
}

impl std::fmt::Display for CamelotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let letter = match self.mode {
            KeyMode::A => 'A',
            KeyMode::B => 'B',
        };
        write!(f, "{}{}", self.number, letter)
    }
}

/// Harmonic relationship class between two keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyRelation {
    Same,
    Relative,
    Compatible,
    Harmonic,
    Diagonal,
    Clash,
    Unknown,
}

impl KeyRelation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Same => "same",
            Self::Relative => "relative",
            Self::Compatible => "compatible",
            Self::Harmonic => "harmonic",
            Self::Diagonal => "diagonal",
            Self::Clash => "clash",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "same" => Self::Same,
            "relative" => Self::Relative,
            "compatible" => Self::Compatible,
            "harmonic" => Self::Harmonic,
            "diagonal" => Self::Diagonal,
            "clash" => Self::Clash,
            _ => Self::Unknown,
        }
    }

    /// Similarity score carried by each relation class.
    pub fn similarity(&self) -> f64 {
        match self {
            Self::Same => 1.0,
            Self::Relative => 0.9,
            Self::Compatible => 0.85,
            Self::Harmonic => 0.7,
            Self::Diagonal => 0.6,
            Self::Clash => 0.2,
            Self::Unknown => UNKNOWN_SIMILARITY,
        }
    }
}

impl std::fmt::Display for KeyRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyCompatibility {
    pub similarity: f64,
    pub relation: KeyRelation,
}

/// Classify two Camelot keys. Unparseable input yields `Unknown` rather than an error.
pub fn compatibility(a: &str, b: &str) -> KeyCompatibility {
    let relation = match (CamelotKey::parse(a), CamelotKey::parse(b)) {
        (Some(ka), Some(kb)) => relation_between(&ka, &kb),
        _ => KeyRelation::Unknown,
    };
    KeyCompatibility {
        similarity: relation.similarity(),
        relation,
    }
}

/// Ordered rule list. Arm order is the precedence: adjacency with matching mode
/// before the two-step rule, which comes before the diagonal rule.
pub fn relation_between(a: &CamelotKey, b: &CamelotKey) -> KeyRelation {
    let same_mode = a.mode == b.mode;
    match (a.wheel_distance(b), same_mode) {
        (0, true) => KeyRelation::Same,
        (0, false) => KeyRelation::Relative,
        (1, true) => KeyRelation::Compatible,
        (2, true) => KeyRelation::Harmonic,
        (1, false) => KeyRelation::Diagonal,
        _ => KeyRelation::Clash,
    }
}

/// Resolve a stored key to Camelot notation according to its format tag.
/// `"camelot"` values are validated as-is; anything else is tried as
/// standard notation ("Am", "F#", "Ebmin", "C major").
pub fn to_camelot(raw: &str, format: &str) -> Option<CamelotKey> {
    if format.eq_ignore_ascii_case("camelot") {
        return CamelotKey::parse(raw);
    }
    CamelotKey::parse(raw).or_else(|| standard_to_camelot(raw))
}

/// Convert standard key notation to its Camelot position.
pub fn standard_to_camelot(raw: &str) -> Option<CamelotKey> {
    let normalized = raw.trim().replace('\u{266F}', "#").replace('\u{266D}', "b");
    if normalized.is_empty() {
        return None;
    }
    let lower = normalized.to_ascii_lowercase();

    let (root_raw, is_minor) = if lower.ends_with("minor") && normalized.len() > 5 {
        (&normalized[..normalized.len() - 5], true)
    } else if lower.ends_with("min") && normalized.len() > 3 {
        (&normalized[..normalized.len() - 3], true)
    } else if normalized.ends_with('m') && normalized.len() > 1 {
        (&normalized[..normalized.len() - 1], true)
    } else if lower.ends_with("major") && normalized.len() > 5 {
        (&normalized[..normalized.len() - 5], false)
    } else if lower.ends_with("maj") && normalized.len() > 3 {
        (&normalized[..normalized.len() - 3], false)
    } else {
        (normalized.as_str(), false)
    };
    let root = normalize_root(root_raw)?;

    let (number, mode) = if is_minor {
        let n = match root.as_str() {
            "G#" | "Ab" => 1,
            "D#" | "Eb" => 2,
            "A#" | "Bb" => 3,
            "F" => 4,
            "C" => 5,
            "G" => 6,
            "D" => 7,
            "A" => 8,
            "E" => 9,
            "B" => 10,
            "F#" | "Gb" => 11,
            "C#" | "Db" => 12,
            _ => return None,
        };
        (n, KeyMode::A)
    } else {
        let n = match root.as_str() {
            "B" => 1,
            "F#" | "Gb" => 2,
            "C#" | "Db" => 3,
            "G#" | "Ab" => 4,
            "D#" | "Eb" => 5,
            "A#" | "Bb" => 6,
            "F" => 7,
            "C" => 8,
            "G" => 9,
            "D" => 10,
            "A" => 11,
            "E" => 12,
            _ => return None,
        };
        (n, KeyMode::B)
    };
    Some(CamelotKey { number, mode })
}

fn normalize_root(root: &str) -> Option<String> {
    let stripped: String = root.chars().filter(|ch| !ch.is_whitespace()).collect();
    let mut chars = stripped.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    if !matches!(letter, 'A'..='G') {
        return None;
    }
    let accidental = chars.next();
    if chars.next().is_some() {
        return None;
    }
    match accidental {
        Some('#') => Some(format!("{letter}#")),
        Some('b') | Some('B') => Some(format!("{letter}b")),
        Some(_) => None,
        None => Some(letter.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(a: &str, b: &str, sim: f64, rel: KeyRelation) {
        let c = compatibility(a, b);
        assert!((c.similarity - sim).abs() < 1e-9, "{a}/{b}: {}", c.similarity);
        assert_eq!(c.relation, rel, "{a}/{b}");
    }

    #[test]
    fn test_rule_table() {
        check("8A", "8A", 1.0, KeyRelation::Same);
        check("8A", "8B", 0.9, KeyRelation::Relative);
        check("8A", "9A", 0.85, KeyRelation::Compatible);
        check("8A", "10A", 0.7, KeyRelation::Harmonic);
        check("8A", "9B", 0.6, KeyRelation::Diagonal);
        check("8A", "3B", 0.2, KeyRelation::Clash);
    }

    #[test]
    fn test_wraps_around_the_wheel() {
        check("12A", "1A", 0.85, KeyRelation::Compatible);
        check("1B", "11B", 0.7, KeyRelation::Harmonic);
        check("12B", "1A", 0.6, KeyRelation::Diagonal);
    }

    #[test]
    fn test_two_apart_with_mode_change_is_clash() {
        check("8A", "10B", 0.2, KeyRelation::Clash);
    }

    #[test]
    fn test_invalid_notation_is_unknown() {
        check("13A", "8A", 0.2, KeyRelation::Unknown);
        check("8C", "8A", 0.2, KeyRelation::Unknown);
        check("", "", 0.2, KeyRelation::Unknown);
        check("Am", "8A", 0.2, KeyRelation::Unknown);
    }

    #[test]
    fn test_non_ascii_notation_is_unknown() {
        check("8\u{e9}", "8A", 0.2, KeyRelation::Unknown);
        check("\u{2013}", "8A", 0.2, KeyRelation::Unknown);
        check("8A", "\u{2013}\u{2013}", 0.2, KeyRelation::Unknown);
        check("\u{e9}A", "8A", 0.2, KeyRelation::Unknown);
        check("A", "8A", 0.2, KeyRelation::Unknown);
        assert!(CamelotKey::parse("\u{266F}").is_none());
        assert!(CamelotKey::parse("+8A").is_none());
        assert!(standard_to_camelot("\u{e9}m").is_none());
        assert!(to_camelot("\u{2013}", "standard").is_none());
    }

    #[test]
    fn test_parse_is_lenient_on_case_and_whitespace() {
        assert_eq!(
            CamelotKey::parse(" 11b "),
            Some(CamelotKey { number: 11, mode: KeyMode::B })
        );
        check("8a", "8A", 1.0, KeyRelation::Same);
    }

    #[test]
    fn test_relation_is_symmetric() {
        for a in 1..=12u8 {
            for b in 1..=12u8 {
                let ka = format!("{a}A");
                let kb = format!("{b}B");
                assert_eq!(compatibility(&ka, &kb).relation, compatibility(&kb, &ka).relation);
            }
        }
    }

    #[test]
    fn test_standard_notation() {
        assert_eq!(standard_to_camelot("Am").map(|k| k.to_string()), Some("8A".into()));
        assert_eq!(standard_to_camelot("C").map(|k| k.to_string()), Some("8B".into()));
        assert_eq!(standard_to_camelot("F#m").map(|k| k.to_string()), Some("11A".into()));
        assert_eq!(standard_to_camelot("Eb major").map(|k| k.to_string()), Some("5B".into()));
        assert_eq!(standard_to_camelot("Dbmin").map(|k| k.to_string()), Some("12A".into()));
        assert!(standard_to_camelot("H").is_none());
    }

    #[test]
    fn test_to_camelot_respects_format() {
        assert_eq!(to_camelot("8A", "camelot").map(|k| k.number), Some(8));
        assert!(to_camelot("Am", "camelot").is_none());
        assert_eq!(to_camelot("Am", "standard").map(|k| k.to_string()), Some("8A".into()));
    }
}
