//! One document's chunks and their vector index.

use tracing::{debug, info};

use crate::{
    chunking::Chunk,
    embedding::Embedder,
    error::{Error, Result},
    store::StoreLayout,
    vector_index::{FlatIndex, Metric, Neighbor},
};

/// A searchable document: `chunks()[i]` is the text of vector `i` in
/// `index()`.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    id: String,
    index: FlatIndex,
    chunks: Vec<String>,
}

impl Partition {
    /// Pair an index with its chunk texts. The counts must agree.
    pub fn new(
        id: impl Into<String>,
        index: FlatIndex,
        chunks: Vec<String>,
    ) -> Result<Self> {
        let id = id.into();
        if index.len() != chunks.len() {
            return Err(Error::Build {
                reason: format!(
                    "index holds {} vectors but there are {} chunks",
                    index.len(),
                    chunks.len()
                ),
                partition: id,
            });
        }
        Ok(Self { id, index, chunks })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> &FlatIndex {
        &self.index
    }

    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    pub fn chunk(&self, ordinal: usize) -> Option<&str> {
        self.chunks.get(ordinal).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.index.dims()
    }

    pub fn metric(&self) -> Metric {
        self.index.metric()
    }

    /// Nearest chunks to `query`; neighbor positions are chunk ordinals.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.index.search(query, k)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub metric: Metric,
    /// Chunks per embedding request.
    pub batch_size: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            metric: Metric::default(),
            batch_size: 32,
        }
    }
}

/// Embed `chunks` and build their index in memory, without persisting.
///
/// Fails if the embedder errors, returns the wrong number of vectors, or
/// returns vectors of differing dimension.
pub fn embed_partition(
    partition_id: &str,
    chunks: &[Chunk],
    embedder: &dyn Embedder,
    options: &BuildOptions,
) -> Result<Partition> {
    let fail = |reason: String| Error::Build {
        partition: partition_id.to_string(),
        reason,
    };

    if chunks.is_empty() {
        return Err(fail("document produced no chunks".into()));
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let mut index: Option<FlatIndex> = None;

    for batch in texts.chunks(options.batch_size.max(1)) {
        let vectors = embedder
            .embed_batch(batch)
            .map_err(|e| fail(e.to_string()))?;
        if vectors.len() != batch.len() {
            return Err(fail(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                batch.len()
            )));
        }

        for vector in &vectors {
            let index = index.get_or_insert_with(|| {
                FlatIndex::new(options.metric, vector.len())
            });
            index.add(vector).map_err(|e| fail(e.to_string()))?;
        }
    }

    let index = index.ok_or_else(|| fail("no vectors produced".into()))?;
    debug!(
        partition = partition_id,
        chunks = texts.len(),
        dims = index.dims(),
        "embedded partition"
    );
    Partition::new(partition_id, index, texts)
}

/// Embed `chunks`, build the partition and persist it to `store`.
///
/// Nothing is written unless every step succeeds.
pub fn build_partition(
    store: &StoreLayout,
    partition_id: &str,
    chunks: &[Chunk],
    embedder: &dyn Embedder,
    options: &BuildOptions,
) -> Result<Partition> {
    let partition = embed_partition(partition_id, chunks, embedder, options)?;
    store.write_pair(partition.id(), partition.index(), partition.chunks())?;
    info!(
        partition = partition_id,
        chunks = partition.len(),
        "built partition"
    );
    Ok(partition)
}
