use std::cmp::Ordering;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    embedding::Embedder,
    error::{Error, Result},
    partition::Partition,
    registry::PartitionRegistry,
    text_util::{DEFAULT_PREVIEW_CHARS, preview},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    /// Maximum number of hits.
    pub k: usize,
    /// Minimum similarity; `None` keeps every candidate.
    pub threshold: Option<f32>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            k: 3,
            threshold: None,
        }
    }
}

/// A retrieved chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub partition_id: String,
    pub ordinal: usize,
    pub distance: f32,
    /// `1 - distance`; higher is better.
    pub similarity: f32,
    pub text: String,
}

/// Find the chunks most similar to `query` across all partitions.
///
/// 1. Embed the query once
/// 2. Ask every partition for its `k` nearest chunks
/// 3. Drop candidates below the similarity threshold
/// 4. Rank all candidates by distance and keep the best `k`
///
/// Equal distances rank by partition id, then ordinal. An empty registry
/// or `k == 0` returns nothing without calling the embedder.
pub fn search(
    registry: &PartitionRegistry,
    embedder: &dyn Embedder,
    query: &str,
    params: &SearchParams,
) -> Result<Vec<SearchHit>> {
    if params.k == 0 || registry.is_empty() {
        return Ok(Vec::new());
    }

    let query_vector = embedder.embed(query)?;
    search_vector(registry, &query_vector, params)
}

/// Like [`search`], but returns only the chunk texts, best first.
pub fn search_texts(
    registry: &PartitionRegistry,
    embedder: &dyn Embedder,
    query: &str,
    params: &SearchParams,
) -> Result<Vec<String>> {
    Ok(search(registry, embedder, query, params)?
        .into_iter()
        .map(|hit| hit.text)
        .collect())
}

/// [`search`] with an already embedded query.
pub fn search_vector(
    registry: &PartitionRegistry,
    query: &[f32],
    params: &SearchParams,
) -> Result<Vec<SearchHit>> {
    let Some(dims) = registry.dims() else {
        return Ok(Vec::new());
    };
    if params.k == 0 {
        return Ok(Vec::new());
    }
    if query.len() != dims {
        return Err(Error::Embedding(format!(
            "query embedding has dimension {}, partitions use {dims}",
            query.len()
        )));
    }

    let partitions: Vec<&Partition> = registry.iter().collect();
    let mut hits: Vec<SearchHit> = partitions
        .par_iter()
        .flat_map_iter(|partition| candidates(partition, query, params))
        .collect();

    let pooled = hits.len();
    hits.sort_by(compare_hits);
    hits.truncate(params.k);

    debug!(
        partitions = partitions.len(),
        candidates = pooled,
        returned = hits.len(),
        "search complete"
    );
    Ok(hits)
}

fn candidates(
    partition: &Partition,
    query: &[f32],
    params: &SearchParams,
) -> Vec<SearchHit> {
    let neighbors = match partition.search(query, params.k) {
        Ok(neighbors) => neighbors,
        Err(e) => {
            warn!(
                partition = partition.id(),
                error = %e,
                "partition search failed"
            );
            return Vec::new();
        }
    };

    let metric = partition.metric();
    neighbors
        .into_iter()
        .filter_map(|neighbor| {
            let similarity = metric.similarity(neighbor.distance);
            if params.threshold.is_some_and(|t| similarity < t) {
                return None;
            }
            Some(SearchHit {
                partition_id: partition.id().to_string(),
                ordinal: neighbor.position,
                distance: neighbor.distance,
                similarity,
                text: partition.chunk(neighbor.position)?.to_string(),
            })
        })
        .collect()
}

fn compare_hits(a: &SearchHit, b: &SearchHit) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then_with(|| a.partition_id.cmp(&b.partition_id))
        .then(a.ordinal.cmp(&b.ordinal))
}

pub fn format_human(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No results found.".to_string();
    }

    let mut out = String::new();
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!(
            "{:>3}. [{:.3}] {} #{}\n     {}\n",
            i + 1,
            hit.similarity,
            hit.partition_id,
            hit.ordinal,
            preview(&hit.text, DEFAULT_PREVIEW_CHARS)
        ));
    }
    out.push_str(&format!("\n{} result(s)", hits.len()));
    out
}

#[derive(Serialize)]
struct JsonHit<'a> {
    rank: usize,
    #[serde(flatten)]
    hit: &'a SearchHit,
}

pub fn format_json(hits: &[SearchHit], query: &str) -> Result<String> {
    let results: Vec<JsonHit<'_>> = hits
        .iter()
        .enumerate()
        .map(|(i, hit)| JsonHit { rank: i + 1, hit })
        .collect();

    Ok(serde_json::to_string(&serde_json::json!({
        "query": query,
        "result_count": hits.len(),
        "results": results,
    }))?)
}
