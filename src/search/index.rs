//! Tiny in-memory inverted index with field boosts.
//!
//! Terms match exactly, by prefix (query tokens of 3+ chars), or within
//! edit distance one (5+ chars). Rebuilt wholesale on every registry
//! change; cost is linear in the number of tools, expected low hundreds.

use std::collections::HashMap;

/// One searchable tool document.
#[derive(Debug, Clone)]
pub struct IndexedTool {
    /// Namespaced name; the stable identifier.
    pub id: String,
    pub name: String,
    pub original_name: String,
    pub description: String,
    pub source: String,
    pub category: Option<String>,
}

const WEIGHT_NAME: f32 = 3.0;
const WEIGHT_ORIGINAL_NAME: f32 = 3.0;
const WEIGHT_DESCRIPTION: f32 = 1.0;
const WEIGHT_SOURCE: f32 = 0.5;

const QUALITY_EXACT: f32 = 1.0;
const QUALITY_PREFIX: f32 = 0.7;
const QUALITY_FUZZY: f32 = 0.5;

const PREFIX_MIN_LEN: usize = 3;
const FUZZY_MIN_LEN: usize = 5;

/// Lowercase and split on whitespace, `_`, `-`, `.`, `/`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| c.is_whitespace() || matches!(c, '_' | '-' | '.' | '/'))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn within_edit_distance_one(left: &str, right: &str) -> bool {
    let left: Vec<char> = left.chars().collect();
    let right: Vec<char> = right.chars().collect();
    let (shorter, longer) = if left.len() <= right.len() {
        (&left, &right)
    } else {
        (&right, &left)
    };
    match longer.len() - shorter.len() {
        0 => {
            let mismatches = shorter
                .iter()
                .zip(longer.iter())
                .filter(|(a, b)| a != b)
                .count();
            mismatches <= 1
        }
        1 => {
            // One insertion: skip exactly one char of the longer string.
            let mut i = 0;
            let mut j = 0;
            let mut skipped = false;
            while i < shorter.len() && j < longer.len() {
                if shorter[i] == longer[j] {
                    i += 1;
                    j += 1;
                } else if skipped {
                    return false;
                } else {
                    skipped = true;
                    j += 1;
                }
            }
            true
        }
        _ => false,
    }
}

pub struct SearchIndex {
    docs: Vec<IndexedTool>,
    /// term → (doc index → accumulated field weight)
    postings: HashMap<String, HashMap<usize, f32>>,
}

impl Default for SearchIndex {
    fn default() -> Self {
        Self::build(Vec::new())
    }
}

impl SearchIndex {
    pub fn build(docs: Vec<IndexedTool>) -> Self {
        let mut postings: HashMap<String, HashMap<usize, f32>> = HashMap::new();
        for (doc_index, doc) in docs.iter().enumerate() {
            let fields: [(&str, f32); 4] = [
                (&doc.name, WEIGHT_NAME),
                (&doc.original_name, WEIGHT_ORIGINAL_NAME),
                (&doc.description, WEIGHT_DESCRIPTION),
                (&doc.source, WEIGHT_SOURCE),
            ];
            for (text, weight) in fields {
                for token in tokenize(text) {
                    let entry = postings
                        .entry(token)
                        .or_default()
                        .entry(doc_index)
                        .or_insert(0.0);
                    *entry += weight;
                }
            }
        }
        Self { docs, postings }
    }

    pub fn docs(&self) -> &[IndexedTool] {
        &self.docs
    }

    /// Score every document against `query`, best first; ties break on
    /// document order for determinism.
    pub fn query(&self, query: &str) -> Vec<(usize, f32)> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut scores: HashMap<usize, f32> = HashMap::new();
        for token in &tokens {
            for (term, docs) in &self.postings {
                let quality = if term == token {
                    QUALITY_EXACT
                } else if token.len() >= PREFIX_MIN_LEN && term.starts_with(token.as_str()) {
                    QUALITY_PREFIX
                } else if token.len() >= FUZZY_MIN_LEN
                    && within_edit_distance_one(token, term)
                {
                    QUALITY_FUZZY
                } else {
                    continue;
                };
                for (doc_index, weight) in docs {
                    *scores.entry(*doc_index).or_insert(0.0) += weight * quality;
                }
            }
        }

        let mut ranked: Vec<(usize, f32)> = scores.into_iter().collect();
        ranked.sort_by(|left, right| {
            right
                .1
                .partial_cmp(&left.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(left.0.cmp(&right.0))
        });
        ranked
    }
}
