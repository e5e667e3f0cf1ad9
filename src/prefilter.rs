//! Optional prefilters (C12) for `$regex` and `$text` predicates.
//!
//! Both variants trade a small amount of preprocessing for skipping full
//! predicate evaluation on rows that cannot possibly match. Neither is wired
//! into the evaluator unconditionally: [`PrefilterConfig::min_collection_size`]
//! gates them off for small collections where building the index costs more
//! than just scanning, and any internal failure (an unparsable pattern, an
//! empty literal set) degrades silently to "no prefilter" rather than an
//! error — a prefilter is an optimization, never a correctness requirement.
//!
//! ## Trigram regex prefilter
//!
//! [`TrigramIndex`] extracts every 3-byte substring of a field's string
//! value and posts the row id under each one. A pattern's prefilter
//! candidate set is the intersection of the posting lists for trigrams that
//! are guaranteed to appear literally in any match (drawn from the pattern's
//! longest literal runs). Because a trigram list is built only from literal
//! substrings that must appear verbatim in a match, the candidate set is
//! always a superset of the true match set — zero false negatives.
//!
//! ## Bloom-filter text prefilter
//!
//! [`BloomFilter`] is a classic double-hashed bit array, sized from an
//! expected element count and target false-positive rate, in the style of
//! the probabilistic set-membership filters used elsewhere in this stack for
//! cheap existence checks before an expensive exact lookup. [`TextIndex`]
//! builds one filter per row from its tokenized text and a query is rejected
//! up front if any of its tokens is definitely absent from that row's token
//! set.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use crate::config::PrefilterConfig;
use crate::value::RowId;

/// A Bloom filter for probabilistic set membership testing.
///
/// Uses double hashing (`h_i(x) = h1(x) + i * h2(x) mod m`) to derive `k`
/// hash positions from two base hashes, avoiding `k` independent hash
/// computations per insert/query.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes a filter for `expected_items` elements at `false_positive_rate`
    /// (e.g. `0.01` for 1%). Degenerates to a 64-bit, single-hash filter for
    /// a zero or negative expected count rather than panicking.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-6, 0.5);
        let m = (-(n * p.ln()) / (std::f64::consts::LN_2.powi(2))).ceil().max(64.0);
        let k = ((m / n) * std::f64::consts::LN_2).round().max(1.0);
        let num_bits = m as usize;
        let words = num_bits.div_ceil(64);
        BloomFilter {
            bits: vec![0u64; words],
            num_bits,
            num_hashes: k as u32,
        }
    }

    fn hashes<T: Hash>(&self, item: &T) -> (u64, u64) {
        let mut h1 = DefaultHasher::new();
        item.hash(&mut h1);
        let a = h1.finish();
        let mut h2 = DefaultHasher::new();
        (a, "aggpipe-prefilter-salt").hash(&mut h2);
        item.hash(&mut h2);
        let b = h2.finish();
        (a, b)
    }

    pub fn insert<T: Hash>(&mut self, item: &T) {
        let (a, b) = self.hashes(item);
        for i in 0..self.num_hashes as u64 {
            let pos = (a.wrapping_add(i.wrapping_mul(b))) as usize % self.num_bits;
            self.bits[pos / 64] |= 1u64 << (pos % 64);
        }
    }

    /// `false` is a definitive answer; `true` may be a false positive.
    pub fn might_contain<T: Hash>(&self, item: &T) -> bool {
        let (a, b) = self.hashes(item);
        for i in 0..self.num_hashes as u64 {
            let pos = (a.wrapping_add(i.wrapping_mul(b))) as usize % self.num_bits;
            if self.bits[pos / 64] & (1u64 << (pos % 64)) == 0 {
                return false;
            }
        }
        true
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// One Bloom filter per row, built from that row's text field tokens.
/// Gates `$text` predicate evaluation: a row whose filter rejects any query
/// token can be skipped without tokenizing or scanning its text again.
pub struct TextIndex {
    filters: Vec<(RowId, BloomFilter)>,
}

impl TextIndex {
    pub fn build<'a>(rows: impl Iterator<Item = (RowId, &'a str)>) -> Self {
        let filters = rows
            .map(|(id, text)| {
                let tokens = tokenize(text);
                let mut filter = BloomFilter::new(tokens.len().max(8), 0.01);
                for t in &tokens {
                    filter.insert(t);
                }
                (id, filter)
            })
            .collect();
        TextIndex { filters }
    }

    /// Row ids whose Bloom filter does not definitively rule out every query
    /// token. May include rows that do not actually match; never excludes
    /// one that does.
    pub fn candidates(&self, query: &str) -> Vec<RowId> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return self.filters.iter().map(|(id, _)| *id).collect();
        }
        self.filters
            .iter()
            .filter(|(_, filter)| query_tokens.iter().all(|t| filter.might_contain(t)))
            .map(|(id, _)| *id)
            .collect()
    }
}

fn trigrams(s: &str) -> HashSet<String> {
    let chars: Vec<char> = s.chars().collect();
    let mut out = HashSet::new();
    if chars.len() < 3 {
        return out;
    }
    for w in chars.windows(3) {
        out.insert(w.iter().collect());
    }
    out
}

/// Extracts the literal runs of a regex pattern (sequences free of `.`, `*`,
/// `+`, `?`, `|`, `(`, `)`, `[`, `]`, `^`, `$`, `\`) and returns the longest
/// one of length >= 3, if any. A pattern with no such run (e.g. `.*` or a
/// very short anchor) cannot be trigram-prefiltered and the caller should
/// fall back to scanning every row.
fn longest_literal_run(pattern: &str) -> Option<String> {
    let specials = ['.', '*', '+', '?', '|', '(', ')', '[', ']', '^', '$', '\\'];
    pattern
        .split(|c| specials.contains(&c))
        .filter(|run| run.chars().count() >= 3)
        .max_by_key(|run| run.chars().count())
        .map(|s| s.to_string())
}

/// Trigram posting lists over a field's string values, used to prefilter
/// `$regex` candidates with a zero-false-negative guarantee: the returned
/// candidate set is always a superset of the true match set.
pub struct TrigramIndex {
    postings: std::collections::HashMap<String, Vec<RowId>>,
    all_ids: Vec<RowId>,
}

impl TrigramIndex {
    pub fn build<'a>(rows: impl Iterator<Item = (RowId, &'a str)>) -> Self {
        let mut postings: std::collections::HashMap<String, Vec<RowId>> = std::collections::HashMap::new();
        let mut all_ids = Vec::new();
        for (id, text) in rows {
            all_ids.push(id);
            for tri in trigrams(text) {
                postings.entry(tri).or_default().push(id);
            }
        }
        TrigramIndex { postings, all_ids }
    }

    /// Candidate row ids for `pattern`. Falls back to every indexed row
    /// (never dropping a possible match) when no literal run of length >= 3
    /// can be extracted from the pattern.
    pub fn candidates(&self, pattern: &str) -> Vec<RowId> {
        let Some(literal) = longest_literal_run(pattern) else {
            return self.all_ids.clone();
        };
        let needed = trigrams(&literal);
        if needed.is_empty() {
            return self.all_ids.clone();
        }
        let mut iter = needed.iter();
        let first = iter.next().expect("non-empty");
        let mut candidates: HashSet<RowId> = self
            .postings
            .get(first)
            .map(|v| v.iter().copied().collect())
            .unwrap_or_default();
        for tri in iter {
            let posting: HashSet<RowId> = self.postings.get(tri).map(|v| v.iter().copied().collect()).unwrap_or_default();
            candidates = candidates.intersection(&posting).copied().collect();
        }
        let mut out: Vec<RowId> = candidates.into_iter().collect();
        out.sort_unstable();
        out
    }
}

/// Whether a collection of `row_count` documents is large enough, per
/// `config`, for prefilter construction to be worth its cost.
pub fn should_prefilter(config: &PrefilterConfig, row_count: usize) -> bool {
    row_count >= config.min_collection_size
}
