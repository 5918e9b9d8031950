//! Full-text indexing and matching.
//!
//! Text is indexed such that a value matches a query if it contains a
//! sequence of terms where each query term equals, or is a substring of, the
//! stored term in the same relative position (a query for "fo ar" matches a
//! stored "foo bar"). This works by expanding every non-empty contiguous
//! substring of every token at index time, so query tokens can be probed as
//! exact keys.

use std::collections::{BTreeSet, HashSet};

use parking_lot::Mutex;

use super::block::SearchBlock;
use super::Action;
use crate::error::Result;
use crate::model::{Position, PrimaryKey, Text, Value};

/// Terms that are never indexed and are skipped in queries.
pub fn default_stopwords() -> HashSet<String> {
    [
        "a", "about", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in",
        "into", "is", "it", "no", "not", "of", "on", "or", "s", "such", "t", "that", "the",
        "their", "then", "there", "these", "they", "this", "to", "was", "will", "with",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Lowercase (locale-insensitively) and split on whitespace, exactly as at
/// index time. Queries must go through the same path.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase().split_whitespace().map(String::from).collect()
}

/// Every non-empty contiguous substring of `token`, deduplicated.
pub fn substrings(token: &str) -> HashSet<String> {
    let chars: Vec<char> = token.chars().collect();
    let mut out = HashSet::new();
    for i in 0..chars.len() {
        for j in (i + 1)..=chars.len() {
            out.insert(chars[i..j].iter().collect());
        }
    }
    out
}

/// Index one stored value into `block`: one revision per (substring,
/// position), fanned out across `pool` with one task per token. The call
/// returns only after every task has completed, so the block can be safely
/// flushed afterwards. Non-string values are ignored.
pub fn index_value(
    block: &SearchBlock,
    pool: &rayon::ThreadPool,
    stopwords: &HashSet<String>,
    key: &Text,
    value: &Value,
    record: PrimaryKey,
    version: u64,
    action: Action,
) -> Result<()> {
    let Some(text) = value.data().as_str() else {
        return Ok(());
    };
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return Ok(());
    }

    let failure = Mutex::new(None);
    pool.scope(|scope| {
        for (position, token) in tokens.iter().enumerate() {
            let failure = &failure;
            scope.spawn(move |_| {
                if stopwords.contains(token.as_str()) {
                    return;
                }
                for substring in substrings(token) {
                    if stopwords.contains(&substring) {
                        continue;
                    }
                    let result = block.insert(
                        key.clone(),
                        Text::wrap(substring),
                        Position::new(record, position as u32),
                        version,
                        action,
                    );
                    if let Err(e) = result {
                        failure.lock().get_or_insert(e);
                        return;
                    }
                }
            });
        }
    });

    match failure.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Decide whether one record matches a query, given the live positions of
/// each query token within that record. A record matches when some choice of
/// positions, one per token, is strictly increasing: the matched terms appear
/// in the same relative order as the query tokens.
pub fn matches_in_order(positions_per_token: &[BTreeSet<u32>]) -> bool {
    let mut cursor: Option<u32> = None;
    for positions in positions_per_token {
        let next = match cursor {
            None => positions.iter().next(),
            Some(c) => positions.iter().find(|&&p| p > c),
        };
        match next {
            Some(&p) => cursor = Some(p),
            None => return false,
        }
    }
    true
}
