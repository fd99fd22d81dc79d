//! Fuzzy search index and ranking.
//!
//! The index is a flat list of (text, field, entry) records rebuilt whenever
//! the entry set changes. Ranking combines a 0-100 fuzzy score with a
//! deterministic popularity score derived from entry metadata.

use crate::model::{Entry, SearchQuery, SourceType};
use std::collections::HashSet;
use std::sync::Arc;

/// Which entry field an index record was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Name,
    Description,
    Category,
    Tag,
}

/// One searchable record; `entry` points into the snapshot's insertion order.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub text: String,
    pub field: FieldKind,
    pub entry: usize,
}

/// Minimum fuzzy score for a record to count as a match.
const FUZZY_THRESHOLD: f64 = 60.0;

/// Fuzzy weight in the combined score; popularity gets the remainder.
const FUZZY_WEIGHT: f64 = 0.6;

/// Build the flat index over name, description, categories and tags,
/// preserving entry insertion order.
#[must_use]
pub fn build_index(entries: &[Arc<Entry>]) -> Vec<IndexRecord> {
    let mut index = Vec::new();
    for (pos, entry) in entries.iter().enumerate() {
        index.push(IndexRecord {
            text: entry.name.clone(),
            field: FieldKind::Name,
            entry: pos,
        });
        index.push(IndexRecord {
            text: entry.description.clone(),
            field: FieldKind::Description,
            entry: pos,
        });
        for category in &entry.categories {
            index.push(IndexRecord {
                text: category.clone(),
                field: FieldKind::Category,
                entry: pos,
            });
        }
        for tag in &entry.tags {
            index.push(IndexRecord {
                text: tag.clone(),
                field: FieldKind::Tag,
                entry: pos,
            });
        }
    }
    index
}

/// Deterministic popularity score used as the baseline ranking and as a
/// tie-breaker for fuzzy matches. Integer-valued by construction.
#[must_use]
pub fn popularity_score(entry: &Entry) -> i64 {
    let mut score = 0;
    if entry.official {
        score += 20;
    }
    if entry.featured {
        score += 10;
    }
    score += 2 * entry.categories.len().min(3) as i64;
    match entry.source {
        SourceType::McpOfficial => score += 15,
        SourceType::Docker => score += 5,
        _ => {}
    }
    if entry.container_image.is_some() {
        score += 3;
    }
    score
}

/// Weighted-ratio fuzzy score in 0..=100.
///
/// Takes the best of whole-string similarity, token-sorted similarity and a
/// containment bonus, so both typos and word-order differences score high.
#[must_use]
pub fn weighted_ratio(query: &str, text: &str) -> f64 {
    let q = query.trim().to_lowercase();
    let t = text.trim().to_lowercase();
    if q.is_empty() || t.is_empty() {
        return 0.0;
    }
    if q == t {
        return 100.0;
    }

    let mut best = 100.0 * strsim::normalized_levenshtein(&q, &t);

    let qs = sort_tokens(&q);
    let ts = sort_tokens(&t);
    if qs != q || ts != t {
        best = best.max(100.0 * strsim::normalized_levenshtein(&qs, &ts));
    }

    if t.contains(&q) || q.contains(&t) {
        let (short, long) = if q.len() < t.len() {
            (q.len(), t.len())
        } else {
            (t.len(), q.len())
        };
        best = best.max(75.0 + 25.0 * short as f64 / long as f64);
    }

    best
}

fn sort_tokens(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

fn passes_filters(entry: &Entry, query: &SearchQuery) -> bool {
    if !query.sources.is_empty() && !query.sources.contains(&entry.source) {
        return false;
    }
    if !query.categories.is_empty()
        && !query
            .categories
            .iter()
            .any(|c| entry.categories.iter().any(|ec| ec == c))
    {
        return false;
    }
    if !query.tags.is_empty() && !query.tags.iter().any(|t| entry.tags.iter().any(|et| et == t)) {
        return false;
    }
    if query.official_only && !entry.official {
        return false;
    }
    if query.featured_only && !entry.featured {
        return false;
    }
    if let Some(wants_key) = query.requires_api_key
        && entry.requires_api_key != wants_key
    {
        return false;
    }
    true
}

/// Run a search over an index snapshot. `entries` is insertion-ordered and
/// `index` was built from it; results come back best-first, ties in
/// insertion order, at most `limit` (clamped to 1..=100) entries.
#[must_use]
pub fn search(entries: &[Arc<Entry>], index: &[IndexRecord], query: &SearchQuery) -> Vec<Arc<Entry>> {
    let limit = query.limit.clamp(1, 100);

    let candidates: HashSet<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| passes_filters(e, query))
        .map(|(pos, _)| pos)
        .collect();

    let mut scored: Vec<(usize, f64)> = if query.query.trim().is_empty() {
        // No text query: popularity alone.
        let mut all: Vec<usize> = candidates.iter().copied().collect();
        all.sort_unstable();
        all.into_iter()
            .map(|pos| (pos, popularity_score(&entries[pos]) as f64))
            .collect()
    } else {
        // Best record score per candidate entry, then blend with popularity.
        let mut best_fuzzy: Vec<Option<f64>> = vec![None; entries.len()];
        for record in index {
            if !candidates.contains(&record.entry) {
                continue;
            }
            let score = weighted_ratio(&query.query, &record.text);
            if score < FUZZY_THRESHOLD {
                continue;
            }
            let slot = &mut best_fuzzy[record.entry];
            if slot.is_none_or(|prev| score > prev) {
                *slot = Some(score);
            }
        }
        best_fuzzy
            .iter()
            .enumerate()
            .filter_map(|(pos, fuzzy)| {
                fuzzy.map(|f| {
                    let popularity = popularity_score(&entries[pos]) as f64;
                    (pos, f * FUZZY_WEIGHT + popularity * (1.0 - FUZZY_WEIGHT))
                })
            })
            .collect()
    };

    // Stable sort keeps insertion order within equal scores.
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(limit)
        .map(|(pos, _)| Arc::clone(&entries[pos]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Entry;

    fn entry(id: &str, name: &str, source: SourceType) -> Arc<Entry> {
        let mut e = Entry::new(id, name, "identical description", source).expect("valid entry");
        e.description = "identical description".into();
        Arc::new(e)
    }

    #[test]
    fn popularity_monotonic_in_each_signal() {
        let base = entry("a", "a", SourceType::Custom);

        let mut official = (*base).clone();
        official.official = true;
        assert!(popularity_score(&official) > popularity_score(&base));

        let mut featured = (*base).clone();
        featured.featured = true;
        assert!(popularity_score(&featured) > popularity_score(&base));

        let mut imaged = (*base).clone();
        imaged.container_image = Some("mcp/x".into());
        assert!(popularity_score(&imaged) > popularity_score(&base));

        let mut mcp_official = (*base).clone();
        mcp_official.source = SourceType::McpOfficial;
        let mut docker = (*base).clone();
        docker.source = SourceType::Docker;
        assert!(popularity_score(&mcp_official) > popularity_score(&docker));
        assert!(popularity_score(&docker) > popularity_score(&base));
    }

    #[test]
    fn category_bonus_caps_at_three() {
        let mut three = (*entry("a", "a", SourceType::Custom)).clone();
        three.categories = vec!["a".into(), "b".into(), "c".into()];
        let mut five = three.clone();
        five.categories.push("d".into());
        five.categories.push("e".into());
        assert_eq!(popularity_score(&three), popularity_score(&five));
    }

    #[test]
    fn weighted_ratio_exact_and_near() {
        assert_eq!(weighted_ratio("sqlite", "SQLite"), 100.0);
        assert!(weighted_ratio("sqlit", "sqlite") > 60.0);
        assert!(weighted_ratio("postgres server", "server postgres") > 90.0);
        assert!(weighted_ratio("xyzzy", "sqlite") < 60.0);
    }

    #[test]
    fn weighted_ratio_substring_bonus() {
        let score = weighted_ratio("sql", "sqlite database server");
        assert!(score >= 75.0, "containment should clear the threshold: {score}");
    }

    #[test]
    fn empty_query_ranks_by_popularity() {
        // A: official + featured + mcp_official, B: featured + docker, C: plain.
        let mut a = (*entry("a", "alpha", SourceType::McpOfficial)).clone();
        a.official = true;
        a.featured = true;
        let mut b = (*entry("b", "beta", SourceType::Docker)).clone();
        b.featured = true;
        let c = (*entry("c", "gamma", SourceType::Mcpservers)).clone();

        let entries = vec![Arc::new(c), Arc::new(b), Arc::new(a)];
        let index = build_index(&entries);
        let results = search(&entries, &index, &SearchQuery::default());

        let ids: Vec<&str> = results.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn limit_is_clamped_and_honored() {
        let entries: Vec<Arc<Entry>> = (0..5)
            .map(|i| entry(&format!("e{i}"), &format!("entry {i}"), SourceType::Custom))
            .collect();
        let index = build_index(&entries);

        let mut query = SearchQuery::default();
        query.limit = 1;
        assert_eq!(search(&entries, &index, &query).len(), 1);

        query.limit = 0;
        assert_eq!(search(&entries, &index, &query).len(), 1);

        query.limit = 1000;
        assert_eq!(search(&entries, &index, &query).len(), 5);
    }

    #[test]
    fn fuzzy_threshold_drops_distant_text() {
        let entries = vec![entry("only", "filesystem", SourceType::Custom)];
        let index = build_index(&entries);

        // Far beyond 40% edits from "filesystem": no fuzzy match.
        let query = SearchQuery::text("qqqqqqqq");
        assert!(search(&entries, &index, &query).is_empty());

        // But the empty query still surfaces it by popularity.
        assert_eq!(search(&entries, &index, &SearchQuery::default()).len(), 1);
    }

    #[test]
    fn filters_are_exact_match() {
        let mut a = (*entry("a", "server one", SourceType::Docker)).clone();
        a.categories = vec!["Database".into()];
        a.tags = vec!["sql".into()];
        a.requires_api_key = true;
        let b = (*entry("b", "server two", SourceType::Custom)).clone();

        let entries = vec![Arc::new(a), Arc::new(b)];
        let index = build_index(&entries);

        let mut query = SearchQuery::default();
        query.sources = vec![SourceType::Docker];
        assert_eq!(search(&entries, &index, &query).len(), 1);

        let mut query = SearchQuery::default();
        query.categories = vec!["Database".into()];
        let hits = search(&entries, &index, &query);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");

        let mut query = SearchQuery::default();
        query.tags = vec!["nosql".into()];
        assert!(search(&entries, &index, &query).is_empty());

        let mut query = SearchQuery::default();
        query.requires_api_key = Some(false);
        let hits = search(&entries, &index, &query);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b");
    }

    #[test]
    fn fuzzy_results_blend_popularity() {
        // Same name similarity; the official entry must rank first.
        let mut a = (*entry("plain", "sqlite server", SourceType::Mcpservers)).clone();
        a.official = false;
        let mut b = (*entry("official", "sqlite server", SourceType::Mcpservers)).clone();
        b.official = true;

        let entries = vec![Arc::new(a), Arc::new(b)];
        let index = build_index(&entries);
        let results = search(&entries, &index, &SearchQuery::text("sqlite server"));
        assert_eq!(results[0].id, "official");
    }
}
