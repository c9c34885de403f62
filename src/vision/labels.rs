//! Anchor label matching against page tokens

use tracing::debug;

use crate::request::LabelPattern;
use crate::vision::words::Token;

/// Token shorter than this is only trusted as a label fragment when it
/// covers most of the label
const MIN_FRAGMENT_CHARS: usize = 3;
const MIN_FRAGMENT_RATIO: f64 = 0.7;

/// Best label hit for one anchor
#[derive(Debug, Clone, PartialEq)]
pub struct LabelHit {
    /// Index into the token slice
    pub token_index: usize,
    /// Label as written in the request
    pub label: String,
    pub similarity: f64,
    pub is_regex: bool,
}

/// Scores tokens against anchor labels
#[derive(Debug, Clone)]
pub struct LabelMatcher {
    threshold: f64,
}

impl LabelMatcher {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Similarity of one token to one label (0.0 - 1.0)
    pub fn score(&self, token: &str, label: &LabelPattern) -> f64 {
        match label {
            LabelPattern::Regex { regex, .. } => {
                if regex.is_match(token) {
                    1.0
                } else {
                    0.0
                }
            }
            LabelPattern::Literal(literal) => literal_similarity(token, literal),
        }
    }

    /// Highest-scoring (token, label) pair at or above the threshold.
    ///
    /// Tokens are scanned in order with labels inside; a later pair only wins
    /// with a strictly higher score.
    pub fn best_match(&self, tokens: &[Token], labels: &[LabelPattern]) -> Option<LabelHit> {
        let mut best: Option<LabelHit> = None;

        for (token_index, token) in tokens.iter().enumerate() {
            for label in labels {
                let similarity = self.score(&token.text, label);
                if similarity < self.threshold {
                    continue;
                }
                if best.as_ref().map_or(true, |b| similarity > b.similarity) {
                    debug!(
                        "Label '{}' ~ token '{}' ({:.2})",
                        label.source(),
                        token.text,
                        similarity
                    );
                    best = Some(LabelHit {
                        token_index,
                        label: label.source().to_string(),
                        similarity,
                        is_regex: matches!(label, LabelPattern::Regex { .. }),
                    });
                }
            }
        }

        best
    }
}

fn literal_similarity(token: &str, label: &str) -> f64 {
    let token = token.to_uppercase();
    let label = label.to_uppercase();

    if label.is_empty() {
        return 0.0;
    }

    // "ID" inside "ID:"
    if token.contains(&label) {
        return 1.0;
    }

    // "REPUBL" inside "REPUBLIQUE"
    if !token.is_empty() && label.contains(&token) {
        let token_len = token.chars().count();
        let label_len = label.chars().count();
        if token_len >= MIN_FRAGMENT_CHARS || token_len as f64 / label_len as f64 > MIN_FRAGMENT_RATIO
        {
            return 1.0;
        }
    }

    strsim::normalized_levenshtein(&token, &label)
}
