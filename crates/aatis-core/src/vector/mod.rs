//! In-memory vector index for similarity search.
//!
//! The index is a flat arena of id-keyed entries. Each entry carries an
//! opaque tag that callers use as a search filter (the memory store tags
//! entries with their tier); the index itself attaches no meaning to it.
//!
//! Guarantees:
//! - `search` returns at most `k` hits ordered by descending score, ties
//!   broken by insertion order
//! - `upsert` on an existing id replaces the vector in place and keeps the
//!   entry's insertion position
//! - a rejected call (wrong dimension, non-finite component) leaves the
//!   index unchanged

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Similarity metric, fixed when the index is built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Similarity {
    /// Cosine similarity; vectors are L2-normalised on the way in
    #[default]
    Cosine,
    /// Raw inner product; callers supply normalised vectors
    InnerProduct,
}

/// One search result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub id: u64,
    pub score: f32,
}

#[derive(Debug, Clone)]
struct IndexEntry<T> {
    vector: Vec<f32>,
    tag: T,
    seq: u64,
}

/// Flat vector index keyed by `u64` ids
#[derive(Debug, Clone)]
pub struct VectorIndex<T> {
    dimensions: usize,
    similarity: Similarity,
    entries: HashMap<u64, IndexEntry<T>>,
    next_seq: u64,
}

impl<T: Clone> VectorIndex<T> {
    /// Create an empty index for vectors of the given dimension
    pub fn new(dimensions: usize, similarity: Similarity) -> Self {
        Self {
            dimensions,
            similarity,
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn similarity(&self) -> Similarity {
        self.similarity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Tag currently attached to an entry
    pub fn tag(&self, id: u64) -> Option<&T> {
        self.entries.get(&id).map(|e| &e.tag)
    }

    /// Insert a vector, or replace the vector and tag of an existing id
    pub fn upsert(&mut self, id: u64, vector: &[f32], tag: T) -> Result<()> {
        let prepared = self.prepare(vector)?;

        if let Some(entry) = self.entries.get_mut(&id) {
            entry.vector = prepared;
            entry.tag = tag;
            return Ok(());
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            id,
            IndexEntry {
                vector: prepared,
                tag,
                seq,
            },
        );
        Ok(())
    }

    /// Move an entry under a new tag without touching its vector.
    ///
    /// Returns `false` if the id is not indexed.
    pub fn retag(&mut self, id: u64, tag: T) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.tag = tag;
                true
            }
            None => false,
        }
    }

    /// Remove an entry. Returns `false` if the id was not indexed.
    pub fn remove(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Top-`k` entries most similar to `query`, restricted to entries whose
    /// tag passes `filter`
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&dyn Fn(&T) -> bool>,
    ) -> Result<Vec<SearchHit>> {
        let query = self.prepare(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f32, u64, u64)> = self
            .entries
            .iter()
            .filter(|(_, entry)| filter.map_or(true, |f| f(&entry.tag)))
            .map(|(id, entry)| (dot(&query, &entry.vector), entry.seq, *id))
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, _, id)| SearchHit { id, score })
            .collect())
    }

    fn prepare(&self, vector: &[f32]) -> Result<Vec<f32>> {
        if vector.len() != self.dimensions {
            return Err(Error::dimension_mismatch(self.dimensions, vector.len()));
        }
        if let Some(pos) = vector.iter().position(|x| !x.is_finite()) {
            return Err(Error::InvalidVector(format!(
                "non-finite component at position {}",
                pos
            )));
        }

        match self.similarity {
            Similarity::Cosine => Ok(normalize(vector)),
            Similarity::InnerProduct => Ok(vector.to_vec()),
        }
    }
}

/// L2-normalise a vector. The zero vector is returned unchanged.
pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|x| x / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> VectorIndex<&'static str> {
        VectorIndex::new(3, Similarity::Cosine)
    }

    #[test]
    fn test_search_finds_exact_vector() {
        let mut idx = index();
        idx.upsert(1, &[1.0, 0.0, 0.0], "a").unwrap();
        idx.upsert(2, &[0.0, 1.0, 0.0], "a").unwrap();
        idx.upsert(3, &[0.3, 0.3, 0.9], "a").unwrap();

        let hits = idx.search(&[0.3, 0.3, 0.9], 1, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 3);
        assert!((hits[0].score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_search_respects_k_and_order() {
        let mut idx = index();
        idx.upsert(1, &[1.0, 0.0, 0.0], "a").unwrap();
        idx.upsert(2, &[0.9, 0.1, 0.0], "a").unwrap();
        idx.upsert(3, &[0.0, 0.0, 1.0], "a").unwrap();

        let hits = idx.search(&[1.0, 0.0, 0.0], 2, None).unwrap();
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(hits[0].score >= hits[1].score);

        assert!(idx.search(&[1.0, 0.0, 0.0], 0, None).unwrap().is_empty());
    }

    #[test]
    fn test_ties_broken_by_insertion_order() {
        let mut idx = index();
        idx.upsert(9, &[0.0, 1.0, 0.0], "a").unwrap();
        idx.upsert(4, &[0.0, 2.0, 0.0], "a").unwrap();
        idx.upsert(6, &[0.0, 3.0, 0.0], "a").unwrap();

        for _ in 0..5 {
            let hits = idx.search(&[0.0, 1.0, 0.0], 3, None).unwrap();
            assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![9, 4, 6]);
        }
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut idx = index();
        idx.upsert(1, &[1.0, 0.0, 0.0], "a").unwrap();
        idx.upsert(2, &[1.0, 0.0, 0.0], "a").unwrap();
        idx.upsert(1, &[0.0, 0.0, 1.0], "b").unwrap();

        assert_eq!(idx.len(), 2);
        assert_eq!(idx.tag(1), Some(&"b"));
        let hits = idx.search(&[0.0, 0.0, 1.0], 1, None).unwrap();
        assert_eq!(hits[0].id, 1);

        // Same vector again: entry 1 keeps its original insertion position
        idx.upsert(1, &[1.0, 0.0, 0.0], "a").unwrap();
        let hits = idx.search(&[1.0, 0.0, 0.0], 2, None).unwrap();
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_dimension_mismatch_leaves_index_unchanged() {
        let mut idx = index();
        idx.upsert(1, &[1.0, 0.0, 0.0], "a").unwrap();

        let err = idx.upsert(1, &[1.0, 0.0], "b").unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, actual: 2 }));
        assert_eq!(idx.tag(1), Some(&"a"));
        assert_eq!(idx.len(), 1);

        let err = idx.upsert(2, &[1.0, 0.0, 0.0, 0.0], "b").unwrap_err();
        assert!(err.is_index_error());
        assert!(!idx.contains(2));

        assert!(idx.search(&[1.0], 1, None).is_err());
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut idx = index();
        let err = idx.upsert(1, &[f32::NAN, 0.0, 0.0], "a").unwrap_err();
        assert!(matches!(err, Error::InvalidVector(_)));
        assert!(idx.is_empty());
    }

    #[test]
    fn test_filter_by_tag() {
        let mut idx = index();
        idx.upsert(1, &[1.0, 0.0, 0.0], "stm").unwrap();
        idx.upsert(2, &[1.0, 0.0, 0.0], "ltm").unwrap();

        let only_ltm = |t: &&str| *t == "ltm";
        let hits = idx.search(&[1.0, 0.0, 0.0], 10, Some(&only_ltm)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 2);

        assert!(idx.retag(1, "ltm"));
        let hits = idx.search(&[1.0, 0.0, 0.0], 10, Some(&only_ltm)).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(!idx.retag(99, "ltm"));
    }

    #[test]
    fn test_remove() {
        let mut idx = index();
        idx.upsert(1, &[1.0, 0.0, 0.0], "a").unwrap();
        assert!(idx.remove(1));
        assert!(!idx.remove(1));
        assert!(idx.search(&[1.0, 0.0, 0.0], 5, None).unwrap().is_empty());
    }

    #[test]
    fn test_inner_product_uses_raw_vectors() {
        let mut idx: VectorIndex<()> = VectorIndex::new(2, Similarity::InnerProduct);
        idx.upsert(1, &[2.0, 0.0], ()).unwrap();
        let hits = idx.search(&[3.0, 0.0], 1, None).unwrap();
        assert!((hits[0].score - 6.0).abs() < 1e-5);
    }

    #[test]
    fn test_normalize() {
        let v = normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
