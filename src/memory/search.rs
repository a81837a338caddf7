//! Content fingerprinting and hybrid ranking helpers.
//!
//! Ranking combines semantic similarity from the vector store with a
//! keyword Jaccard overlap, weighted by the configured alpha. When the
//! vector side is unavailable the manager falls back to Jaccard alone.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

/// Fingerprint content for long-term dedupe: lower-case, collapse
/// whitespace, hash.
pub fn fingerprint(content: &str) -> String {
    let normalised: String = content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let digest = Sha256::digest(normalised.as_bytes());
    // Hex-encode the first 16 bytes; ample for per-user uniqueness.
    digest
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Lower-cased alphanumeric tokens of a text.
fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard overlap of the token sets of two texts, in [0, 1].
pub fn keyword_jaccard(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() && tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    if union == 0 {
        0.0
    } else {
        // Set sizes are small; the cast cannot lose meaningful precision.
        #[allow(clippy::cast_precision_loss)]
        {
            intersection as f64 / union as f64
        }
    }
}

/// Combine semantic and keyword scores: `alpha * semantic + (1 - alpha) *
/// keyword`.
pub fn hybrid_score(semantic: f64, keyword: f64, alpha: f64) -> f64 {
    let alpha = alpha.clamp(0.0, 1.0);
    alpha * semantic + (1.0 - alpha) * keyword
}

/// Character-level similarity used by the integrity pre-filter to treat
/// near-identical statements as duplicates rather than contradictions.
///
/// Returns the normalised longest-common-prefix/suffix-free Levenshtein
/// similarity approximated via token Jaccard plus exact-match shortcut.
pub fn string_similarity(a: &str, b: &str) -> f64 {
    let na: String = a.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let nb: String = b.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    if na == nb {
        return 1.0;
    }
    keyword_jaccard(&na, &nb)
}
