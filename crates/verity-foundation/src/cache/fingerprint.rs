//! Input normalisation, exact fingerprints and term vectors for approximate
//! matching.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use verity_kernel::stage::StageId;

/// Lowercases, strips punctuation and collapses whitespace.
pub fn normalize(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Exact-match key for a normalised input at one stage.
pub fn fingerprint(stage: StageId, normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stage.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Word-unigram term-frequency vector.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TermVector {
    terms: BTreeMap<String, f32>,
    norm: f32,
}

impl TermVector {
    pub fn from_normalized(normalized: &str) -> Self {
        let mut terms: BTreeMap<String, f32> = BTreeMap::new();
        for word in normalized.split_whitespace() {
            *terms.entry(word.to_string()).or_default() += 1.0;
        }
        let norm = terms.values().map(|v| v * v).sum::<f32>().sqrt();
        Self { terms, norm }
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Cosine similarity in `[0, 1]`; 0 when either side is empty.
    pub fn cosine(&self, other: &Self) -> f32 {
        if self.norm == 0.0 || other.norm == 0.0 {
            return 0.0;
        }
        let (small, large) = if self.terms.len() <= other.terms.len() {
            (self, other)
        } else {
            (other, self)
        };
        let dot: f32 = small
            .terms
            .iter()
            .filter_map(|(term, a)| large.terms.get(term).map(|b| a * b))
            .sum();
        (dot / (self.norm * other.norm)).clamp(0.0, 1.0)
    }
}
