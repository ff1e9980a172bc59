//! Reciprocal Rank Fusion of the lexical and vector branches.
//!
//! `score(c) = Σ 1 / (k + rank_i(c))` over every list `c` appears in, with
//! 1-based ranks. Raw branch scores are ignored, so BM25 and cosine values
//! never need normalizing against each other.

use std::collections::{HashMap, HashSet};

use crate::models::{SearchHit, SearchMethod};

/// Default RRF smoothing constant.
pub const DEFAULT_RRF_K: f64 = 60.0;

struct Fused<'a> {
    hit: &'a SearchHit,
    score: f64,
    best_rank: usize,
}

fn accumulate<'a>(fused: &mut HashMap<&'a str, Fused<'a>>, list: &'a [SearchHit], k: f64) {
    let mut seen: HashSet<&str> = HashSet::with_capacity(list.len());
    for (i, hit) in list.iter().enumerate() {
        // A repeated id counts only at its first rank within one list.
        if !seen.insert(hit.chunk_id.as_str()) {
            continue;
        }
        let rank = i + 1;
        let contribution = 1.0 / (k + rank as f64);
        fused
            .entry(hit.chunk_id.as_str())
            .and_modify(|f| {
                f.score += contribution;
                f.best_rank = f.best_rank.min(rank);
            })
            .or_insert(Fused {
                hit,
                score: contribution,
                best_rank: rank,
            });
    }
}

/// Fuse two ranked lists into one, truncated to `limit`.
///
/// Ordering: fused score descending, then lower best original rank, then
/// chunk id ascending. Output hits carry [`SearchMethod::Fused`] and the
/// fused score; every output chunk appears in at least one input.
pub fn fuse(lexical: &[SearchHit], vector: &[SearchHit], k: f64, limit: usize) -> Vec<SearchHit> {
    let mut fused: HashMap<&str, Fused<'_>> =
        HashMap::with_capacity(lexical.len() + vector.len());
    accumulate(&mut fused, lexical, k);
    accumulate(&mut fused, vector, k);

    let mut ranked: Vec<Fused<'_>> = fused.into_values().collect();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.best_rank.cmp(&b.best_rank))
            .then_with(|| a.hit.chunk_id.cmp(&b.hit.chunk_id))
    });
    ranked.truncate(limit);

    ranked
        .into_iter()
        .map(|f| SearchHit {
            score: f.score,
            method: SearchMethod::Fused,
            ..f.hit.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, method: SearchMethod) -> SearchHit {
        SearchHit {
            chunk_id: id.to_string(),
            document_id: format!("doc-{id}"),
            chunk_index: 0,
            source_path: format!("{id}.md"),
            title: None,
            text: format!("text of {id}"),
            score: 1.0,
            method,
        }
    }

    fn list(ids: &[&str], method: SearchMethod) -> Vec<SearchHit> {
        ids.iter().map(|id| hit(id, method)).collect()
    }

    fn ids(hits: &[SearchHit]) -> Vec<&str> {
        hits.iter().map(|h| h.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_rrf_scores_match_formula() {
        let lexical = list(&["A", "B", "C"], SearchMethod::Lexical);
        let vector = list(&["C", "A", "D"], SearchMethod::Vector);
        let fused = fuse(&lexical, &vector, 60.0, 10);

        assert_eq!(ids(&fused), vec!["A", "C", "B", "D"]);
        let expect = [
            1.0 / 61.0 + 1.0 / 62.0,
            1.0 / 63.0 + 1.0 / 61.0,
            1.0 / 62.0,
            1.0 / 63.0,
        ];
        for (h, e) in fused.iter().zip(expect) {
            assert!((h.score - e).abs() < 1e-12, "{}: {} != {}", h.chunk_id, h.score, e);
            assert_eq!(h.method, SearchMethod::Fused);
        }
    }

    #[test]
    fn test_fused_set_is_subset_of_inputs() {
        let lexical = list(&["a", "b", "c", "d"], SearchMethod::Lexical);
        let vector = list(&["e", "b", "f"], SearchMethod::Vector);
        let fused = fuse(&lexical, &vector, 60.0, 100);
        assert_eq!(fused.len(), 6);
        for h in &fused {
            assert!(
                lexical.iter().chain(vector.iter()).any(|i| i.chunk_id == h.chunk_id),
                "fabricated {}",
                h.chunk_id
            );
        }
    }

    #[test]
    fn test_ties_break_on_rank_then_id() {
        // Equal scores at equal ranks: chunk id decides.
        let fused = fuse(
            &list(&["y"], SearchMethod::Lexical),
            &list(&["x"], SearchMethod::Vector),
            60.0,
            10,
        );
        assert_eq!(ids(&fused), vec!["x", "y"]);
    }

    #[test]
    fn test_duplicate_ids_count_once_per_list() {
        let lexical = list(&["a", "b", "a"], SearchMethod::Lexical);
        let fused = fuse(&lexical, &[], 60.0, 10);
        assert_eq!(ids(&fused), vec!["a", "b"]);
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_limit_and_empty_inputs() {
        assert!(fuse(&[], &[], 60.0, 10).is_empty());
        let lexical = list(&["a", "b", "c"], SearchMethod::Lexical);
        assert_eq!(fuse(&lexical, &[], 60.0, 2).len(), 2);
        assert!(fuse(&lexical, &[], 60.0, 0).is_empty());
    }

    #[test]
    fn test_single_list_keeps_order() {
        let vector = list(&["q", "p", "r"], SearchMethod::Vector);
        let fused = fuse(&[], &vector, DEFAULT_RRF_K, 10);
        assert_eq!(ids(&fused), vec!["q", "p", "r"]);
        assert_eq!(fused[0].source_path, "q.md");
    }
}
