//! Expected-value correction
//!
//! Recognized text is compared against the zone's list of known values using
//! an edit similarity in which visually confusable glyph substitutions (N/M,
//! O/0, I/1/l, ...) are cheap. The closest value replaces the text when it is
//! similar enough.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::FusionSettings;

/// Cost of substituting one glyph for a look-alike
const CONFUSABLE_COST: f32 = 0.2;

/// Glyph groups recognizers commonly mistake for each other (lowercase)
const CONFUSABLE_GROUPS: &[&str] = &["mn", "o0", "il1|", "s5", "b8", "z2", "g6", "uv"];

/// Applied correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    /// Text before correction
    pub original: String,
    /// Expected value that replaced it
    pub value: String,
    pub score: f32,
}

/// Matches recognized text against known values
#[derive(Debug, Clone)]
pub struct ValueCorrector {
    threshold: f32,
    containment_bonus: f32,
}

impl ValueCorrector {
    pub fn new(settings: &FusionSettings) -> Self {
        Self {
            threshold: settings.correction_threshold,
            containment_bonus: settings.containment_bonus,
        }
    }

    /// Closest expected value scoring at least the threshold.
    /// A later value only wins with a strictly higher score.
    pub fn correct(&self, text: &str, expected: &[String]) -> Option<Correction> {
        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() || expected.is_empty() {
            return None;
        }

        let mut best: Option<(&String, f32)> = None;
        for value in expected {
            let candidate = value.trim().to_lowercase();
            let mut score = similarity(&normalized, &candidate);
            if !candidate.is_empty()
                && (normalized.contains(&candidate) || candidate.contains(&normalized))
            {
                score = (score + self.containment_bonus).min(1.0);
            }
            debug!("Correction candidate '{}' ~ '{}': {:.2}", text, value, score);

            if best.map_or(score > 0.0, |(_, s)| score > s) {
                best = Some((value, score));
            }
        }

        let (value, score) = best?;
        (score >= self.threshold).then(|| Correction {
            original: text.to_string(),
            value: value.clone(),
            score,
        })
    }
}

fn substitution_cost(a: char, b: char) -> f32 {
    if a == b {
        0.0
    } else if CONFUSABLE_GROUPS
        .iter()
        .any(|group| group.contains(a) && group.contains(b))
    {
        CONFUSABLE_COST
    } else {
        1.0
    }
}

/// 1 - weighted edit distance / longer length
pub fn similarity(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }

    let mut prev: Vec<f32> = (0..=b.len()).map(|j| j as f32).collect();
    let mut curr = vec![0.0f32; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        curr[0] = (i + 1) as f32;
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = (prev[j] + substitution_cost(ca, cb))
                .min(prev[j + 1] + 1.0)
                .min(curr[j] + 1.0);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    (1.0 - prev[b.len()] / longest as f32).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corrector() -> ValueCorrector {
        ValueCorrector::new(&FusionSettings::default())
    }

    fn values(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_confusable_substitution() {
        assert!((similarity("n", "m") - 0.8).abs() < 1e-6);
        assert!((similarity("n", "f") - 0.0).abs() < 1e-6);
        assert!((similarity("abc", "abc") - 1.0).abs() < 1e-6);
        assert!((similarity("", "") - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_n_corrected_to_m() {
        let c = corrector().correct("N", &values(&["M", "F"])).unwrap();
        assert_eq!(c.value, "M");
        assert!(c.score >= 0.8 - 1e-6);
        assert_eq!(c.original, "N");
    }

    #[test]
    fn test_containment_bonus() {
        // "masc" inside "masculin": 0.5 + 0.2
        let c = corrector().correct("MASC", &values(&["Masculin", "Feminin"])).unwrap();
        assert_eq!(c.value, "Masculin");
        assert!((c.score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_below_threshold_not_corrected() {
        assert!(corrector().correct("XYZ", &values(&["M", "F"])).is_none());
        assert!(corrector().correct("", &values(&["M"])).is_none());
        assert!(corrector().correct("M", &[]).is_none());
    }

    #[test]
    fn test_tie_keeps_first_value() {
        let c = corrector().correct("ABC", &values(&["ABD", "ABE"])).unwrap();
        assert_eq!(c.value, "ABD");
    }
}
