//! Vector memory over the `memories` table.
//!
//! The authoritative copy lives in SQLite; the in-process index is a
//! cache that is rebuilt lazily by scanning the table once when a search
//! finds it empty. Search is cosine top-k over a size-k min-heap, so a
//! query costs O(n log k) instead of a full sort. Vectors are persisted
//! as little-endian f32 blobs.

use sqlx::Row;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::RwLock;
use tracing::debug;

use super::{Store, StoreError};

/// A retrieved memory with its similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryItem {
    pub content: String,
    pub metadata: HashMap<String, String>,
    pub similarity: f32,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    content: String,
    vector: Vec<f32>,
    metadata: HashMap<String, String>,
}

/// Heap element ordered by score. f32 has no total order, so comparisons
/// go through `total_cmp`.
struct Scored {
    score: f32,
    entry: IndexEntry,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.score.total_cmp(&other.score) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score.total_cmp(&other.score)
    }
}

/// In-memory cosine-similarity index. Safe for concurrent readers with
/// exclusive writers.
pub(crate) struct VectorIndex {
    entries: RwLock<Vec<IndexEntry>>,
}

impl VectorIndex {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, content: String, vector: Vec<f32>, metadata: HashMap<String, String>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.push(IndexEntry {
            content,
            vector,
            metadata,
        });
    }

    fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    /// Top-`limit` entries by cosine similarity, descending.
    ///
    /// A zero-magnitude query yields the empty list; entries whose
    /// vector length differs from the query score 0.
    fn search(&self, query: &[f32], limit: usize) -> Vec<MemoryItem> {
        if limit == 0 {
            return Vec::new();
        }

        let query_mag = magnitude(query);
        if query_mag == 0.0 {
            return Vec::new();
        }

        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());

        // Min-heap of the best `limit` scores seen so far.
        let mut heap: BinaryHeap<std::cmp::Reverse<Scored>> = BinaryHeap::with_capacity(limit + 1);

        for entry in entries.iter() {
            let score = cosine_with_query_mag(query, &entry.vector, query_mag);

            if heap.len() < limit {
                heap.push(std::cmp::Reverse(Scored {
                    score,
                    entry: entry.clone(),
                }));
            } else if let Some(min) = heap.peek() {
                if score > min.0.score {
                    heap.pop();
                    heap.push(std::cmp::Reverse(Scored {
                        score,
                        entry: entry.clone(),
                    }));
                }
            }
        }

        // Ascending order of Reverse<Scored> is descending score.
        heap.into_sorted_vec()
            .into_iter()
            .map(|std::cmp::Reverse(s)| MemoryItem {
                content: s.entry.content,
                metadata: s.entry.metadata,
                similarity: s.score,
            })
            .collect()
    }
}

fn magnitude(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity with the query magnitude precomputed once per
/// search. Mismatched lengths and zero vectors score 0.
fn cosine_with_query_mag(query: &[f32], other: &[f32], query_mag: f32) -> f32 {
    if query.len() != other.len() || query.is_empty() || query_mag == 0.0 {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut other_sq = 0.0f32;
    for (a, b) in query.iter().zip(other.iter()) {
        dot += a * b;
        other_sq += b * b;
    }

    if other_sq == 0.0 {
        return 0.0;
    }

    dot / (query_mag * other_sq.sqrt())
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

impl Store {
    /// Persist a memory row and insert it into the index.
    pub async fn add_memory(
        &self,
        content: &str,
        vector: &[f32],
        metadata: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let blob = encode_vector(vector);
        let meta_json = serde_json::to_string(&metadata)?;

        sqlx::query("INSERT INTO memories (content, vector, metadata) VALUES (?, ?, ?)")
            .bind(content)
            .bind(blob)
            .bind(meta_json)
            .execute(&self.pool)
            .await?;

        self.index
            .add(content.to_string(), vector.to_vec(), metadata);

        Ok(())
    }

    /// Top-`limit` memories by cosine similarity to the query vector.
    ///
    /// If the in-memory index is empty (fresh process), it is rebuilt
    /// by scanning the memories table once; subsequent searches hit
    /// memory.
    pub async fn search_memory(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<MemoryItem>, StoreError> {
        if self.index.len() == 0 {
            self.rebuild_index().await?;
        }

        Ok(self.index.search(query, limit))
    }

    async fn rebuild_index(&self) -> Result<(), StoreError> {
        let rows = sqlx::query("SELECT id, content, vector, metadata FROM memories")
            .fetch_all(&self.pool)
            .await?;

        self.index.clear();

        let mut loaded = 0usize;
        for row in rows {
            let content: String = row.get("content");
            let blob: Vec<u8> = row.get("vector");
            let meta_json: String = row.get("metadata");

            // Rows with undecodable metadata are skipped, not fatal.
            let metadata: HashMap<String, String> =
                serde_json::from_str(&meta_json).unwrap_or_default();

            self.index.add(content, decode_vector(&blob), metadata);
            loaded += 1;
        }

        debug!("Rebuilt vector index with {} entries", loaded);
        Ok(())
    }
}
