//! Hybrid retrieval: dense vector search fused with BM25 via Reciprocal
//! Rank Fusion.
//!
//! The BM25 side is an in-memory per-collection index built lazily from the
//! vector store's `text` payloads; writers must call [`HybridSearchEngine::invalidate`].

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use docchat_core::{CoreError, RetrievedDoc};

use crate::config::HybridConfig;
use crate::services::bm25::{tokenize, Bm25Okapi};
use crate::services::vector_db::{Hit, VectorStoreClient};

const SCROLL_PAGE: usize = 1000;

/// Cached BM25 view of one collection.
pub struct CollectionIndex {
  texts: Vec<String>,
  ids: Vec<String>,
  bm25: Option<Bm25Okapi>,
  id_to_idx: HashMap<String, usize>,
}

impl CollectionIndex {
  fn empty() -> Self {
    Self {
      texts: Vec::new(),
      ids: Vec::new(),
      bm25: None,
      id_to_idx: HashMap::new(),
    }
  }

  fn build(texts: Vec<String>, ids: Vec<String>) -> Self {
    if texts.is_empty() {
      return Self::empty();
    }
    let tokenized: Vec<Vec<String>> = texts.iter().map(|t| tokenize(t)).collect();
    let id_to_idx = ids
      .iter()
      .enumerate()
      .map(|(i, id)| (id.clone(), i))
      .collect();
    Self {
      bm25: Some(Bm25Okapi::new(&tokenized)),
      texts,
      ids,
      id_to_idx,
    }
  }

  pub fn text_of(&self, id: &str) -> Option<&str> {
    self
      .id_to_idx
      .get(id)
      .and_then(|&i| self.texts.get(i))
      .map(String::as_str)
  }

  /// Top-k `(id, score)` pairs by BM25, descending. Empty when the index is
  /// unbuilt or the query tokenizes to nothing.
  pub fn bm25_search(&self, query: &str, top_k: usize) -> Vec<(String, f64)> {
    let Some(bm25) = &self.bm25 else {
      return Vec::new();
    };
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
      return Vec::new();
    }
    let scores = bm25.get_scores(&query_tokens);
    let mut scored: Vec<(String, f64)> = self
      .ids
      .iter()
      .cloned()
      .zip(scores)
      .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);
    scored
  }
}

/// Reciprocal Rank Fusion of the two ranked lists.
///
/// `score(d) = Σ 1/(k + rank_i)` with 1-based ranks. Ties keep first-seen
/// order (vector list before BM25 list), so fusion output is deterministic.
/// Vector similarity and BM25 score survive as diagnostics; documents found
/// only via BM25 come back with an empty payload for the caller to hydrate.
pub fn rrf_fusion(
  vector_hits: &[Hit],
  bm25_results: &[(String, f64)],
  k: usize,
) -> Vec<RetrievedDoc> {
  let mut rrf_scores: HashMap<String, f64> = HashMap::new();
  let mut docs: HashMap<String, RetrievedDoc> = HashMap::new();
  let mut seen_order: Vec<String> = Vec::new();

  for (rank, hit) in vector_hits.iter().enumerate() {
    let rrf = 1.0 / (k as f64 + rank as f64 + 1.0);
    *rrf_scores.entry(hit.id.clone()).or_insert(0.0) += rrf;
    if !docs.contains_key(&hit.id) {
      seen_order.push(hit.id.clone());
    }
    let mut doc = RetrievedDoc::new(hit.id.clone(), 0.0, hit.payload.clone());
    doc.vector_score = Some(hit.score);
    docs.insert(hit.id.clone(), doc);
  }

  for (rank, (id, bm25_score)) in bm25_results.iter().enumerate() {
    let rrf = 1.0 / (k as f64 + rank as f64 + 1.0);
    *rrf_scores.entry(id.clone()).or_insert(0.0) += rrf;
    if !docs.contains_key(id) {
      seen_order.push(id.clone());
      docs.insert(id.clone(), RetrievedDoc::new(id.clone(), 0.0, json!({})));
    }
    if let Some(doc) = docs.get_mut(id) {
      doc.bm25_score = Some(*bm25_score as f32);
    }
  }

  let mut ordered: Vec<(String, f64)> = seen_order
    .into_iter()
    .map(|id| {
      let score = rrf_scores.get(&id).copied().unwrap_or(0.0);
      (id, score)
    })
    .collect();
  // Stable sort: equal RRF scores keep first-seen order.
  ordered.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

  ordered
    .into_iter()
    .filter_map(|(id, rrf)| {
      docs.remove(&id).map(|mut doc| {
        doc.score = rrf as f32;
        doc
      })
    })
    .collect()
}

pub struct HybridSearchEngine {
  vector: Arc<VectorStoreClient>,
  config: HybridConfig,
  cache: DashMap<String, Arc<CollectionIndex>>,
  build_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl HybridSearchEngine {
  pub fn new(vector: Arc<VectorStoreClient>, config: HybridConfig) -> Self {
    Self {
      vector,
      config,
      cache: DashMap::new(),
      build_locks: DashMap::new(),
    }
  }

  /// Loads (or returns the cached) BM25 index for a collection. Concurrent
  /// callers for the same collection serialize on a per-collection lock so
  /// the corpus is scrolled only once.
  async fn collection_index(&self, collection: &str) -> Result<Arc<CollectionIndex>, CoreError> {
    if let Some(cached) = self.cache.get(collection) {
      return Ok(cached.clone());
    }

    let lock = self
      .build_locks
      .entry(collection.to_string())
      .or_insert_with(|| Arc::new(Mutex::new(())))
      .clone();
    let _guard = lock.lock().await;

    // Another task may have built it while we waited.
    if let Some(cached) = self.cache.get(collection) {
      return Ok(cached.clone());
    }

    info!("building BM25 index for '{collection}'");
    let mut texts = Vec::new();
    let mut ids = Vec::new();
    let mut offset = None;
    loop {
      let (points, next_offset) = self
        .vector
        .scroll(collection, SCROLL_PAGE, offset, Some(&["text"]))
        .await?;
      for point in points {
        let text = point
          .payload
          .get("text")
          .and_then(|v| v.as_str())
          .unwrap_or("");
        if !text.is_empty() {
          ids.push(point.id);
          texts.push(text.to_string());
        }
      }
      match next_offset {
        Some(next) => offset = Some(next),
        None => break,
      }
    }

    if texts.is_empty() {
      warn!("no texts found in collection '{collection}'");
    } else {
      info!("BM25 index for '{collection}' covers {} documents", texts.len());
    }
    let index = Arc::new(CollectionIndex::build(texts, ids));
    self.cache.insert(collection.to_string(), index.clone());
    Ok(index)
  }

  /// Requests 3x top_k from each side, fuses with RRF, hydrates payloads
  /// for BM25-only documents, and degrades to vector-only ordering when
  /// BM25 has nothing.
  pub async fn hybrid_search(
    &self,
    collection: &str,
    query: &str,
    query_vector: &[f32],
    top_k: usize,
    score_threshold: Option<f32>,
  ) -> Result<Vec<RetrievedDoc>, CoreError> {
    let index = self.collection_index(collection).await?;
    let expanded_top_k = top_k * 3;

    let vector_hits = self
      .vector
      .search(collection, query_vector, expanded_top_k, score_threshold)
      .await?;
    let bm25_results = index.bm25_search(query, expanded_top_k);

    if bm25_results.is_empty() {
      info!("no BM25 results for '{collection}', returning vector results only");
      return Ok(
        vector_hits
          .into_iter()
          .take(top_k)
          .map(|hit| {
            let mut doc = RetrievedDoc::new(hit.id, hit.score, hit.payload);
            doc.vector_score = Some(hit.score);
            doc
          })
          .collect(),
      );
    }

    info!(
      "fusing {} vector + {} BM25 results for '{collection}'",
      vector_hits.len(),
      bm25_results.len()
    );
    let mut fused = rrf_fusion(&vector_hits, &bm25_results, self.config.rrf_k);

    // Documents surfaced only by BM25 carry no payload; take the text from
    // the cached corpus instead of another vector-store round trip.
    for doc in &mut fused {
      if doc.text().is_empty() {
        if let Some(text) = index.text_of(&doc.id) {
          doc.payload = json!({ "text": text });
        }
      }
    }

    fused.truncate(top_k);
    Ok(fused)
  }

  /// Explicit cache invalidation, scoped to one collection or global.
  pub fn invalidate(&self, collection: Option<&str>) {
    match collection {
      Some(name) => {
        if self.cache.remove(name).is_some() {
          info!("BM25 cache invalidated for '{name}'");
        }
        self.build_locks.remove(name);
      }
      None => {
        self.cache.clear();
        self.build_locks.clear();
        info!("all BM25 caches invalidated");
      }
    }
  }
}
