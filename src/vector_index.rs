//! Exact nearest-neighbor index over one partition's embeddings.
//!
//! Vectors are stored contiguously in insertion order, so position `i` in
//! the index is the `i`-th vector added. Search is brute force, which is
//! exact and fast enough for the few hundred chunks a single document
//! produces.
//!
//! Binary format:
//! - 4 bytes: magic `DRIX`
//! - 4 bytes: metric code (u32)
//! - 4 bytes: vector count N (u32)
//! - 4 bytes: dimension D (u32)
//! - N * D * 4 bytes: f32 values in row-major order
//!
//! All integers and floats are stored in native byte order.

use std::{cmp::Ordering, fmt, path::Path};

use bytemuck::{Pod, Zeroable};
use serde::Deserialize;

use crate::error::{Error, Result};

const MAGIC: [u8; 4] = *b"DRIX";

const HEADER_SIZE: usize = std::mem::size_of::<IndexHeader>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct IndexHeader {
    magic: [u8; 4],
    metric: u32,
    count: u32,
    dims: u32,
}

/// Distance function used by an index.
///
/// Both metrics convert distance to similarity as `1 - distance`, but the
/// resulting range differs, see [`Metric::similarity_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// `1 - cos(a, b)`, in `[0, 2]`.
    #[default]
    Cosine,
    /// Squared Euclidean distance.
    L2,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::L2 => "l2",
        }
    }

    /// Distance between two vectors of equal length.
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => 1.0 - cosine_similarity(a, b),
            Metric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| {
                    let d = x - y;
                    d * d
                })
                .sum(),
        }
    }

    pub fn similarity(self, distance: f32) -> f32 {
        1.0 - distance
    }

    /// Inclusive range of [`Metric::similarity`] values.
    ///
    /// For `L2` the range only holds when embeddings are unit-normalized.
    pub fn similarity_range(self) -> (f32, f32) {
        match self {
            Metric::Cosine => (-1.0, 1.0),
            Metric::L2 => (-3.0, 1.0),
        }
    }

    fn code(self) -> u32 {
        match self {
            Metric::Cosine => 1,
            Metric::L2 => 2,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Metric::Cosine),
            2 => Some(Metric::L2),
            _ => None,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty, mismatched or zero
/// vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Scale a vector to unit length in place. Zero vectors are left as-is.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// A search hit: the position of a stored vector and its distance to the
/// query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    metric: Metric,
    dims: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(metric: Metric, dims: usize) -> Self {
        Self {
            metric,
            dims,
            data: Vec::new(),
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        if self.dims == 0 {
            0
        } else {
            self.data.len() / self.dims
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a vector; it takes the next position.
    pub fn add(&mut self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dims || self.dims == 0 {
            return Err(Error::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }
        self.data.extend_from_slice(vector);
        Ok(())
    }

    /// The vector stored at `position`.
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        if position >= self.len() {
            return None;
        }
        let start = position * self.dims;
        Some(&self.data[start..start + self.dims])
    }

    /// Return up to `k` nearest vectors, closest first. Equal distances are
    /// ordered by position.
    ///
    /// # Examples
    ///
    /// ```
    /// use docrag::vector_index::{FlatIndex, Metric};
    ///
    /// let mut index = FlatIndex::new(Metric::L2, 2);
    /// index.add(&[0.0, 0.0]).unwrap();
    /// index.add(&[1.0, 0.0]).unwrap();
    /// index.add(&[5.0, 5.0]).unwrap();
    ///
    /// let hits = index.search(&[0.9, 0.0], 2).unwrap();
    /// assert_eq!(hits[0].position, 1);
    /// assert_eq!(hits[1].position, 0);
    /// ```
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dims {
            return Err(Error::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut neighbors: Vec<Neighbor> = self
            .data
            .chunks_exact(self.dims)
            .enumerate()
            .map(|(position, vector)| Neighbor {
                position,
                distance: self.metric.distance(query, vector),
            })
            .collect();

        if k < neighbors.len() {
            neighbors.select_nth_unstable_by(k, compare_neighbors);
            neighbors.truncate(k);
        }
        neighbors.sort_by(compare_neighbors);
        Ok(neighbors)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let too_large = |what: &str| {
            Error::Config(format!("index {what} does not fit in 32 bits"))
        };
        let header = IndexHeader {
            magic: MAGIC,
            metric: self.metric.code(),
            count: u32::try_from(self.len()).map_err(|_| too_large("size"))?,
            dims: u32::try_from(self.dims)
                .map_err(|_| too_large("dimension"))?,
        };

        let data_len = std::mem::size_of_val(self.data.as_slice());
        let mut bytes = Vec::with_capacity(HEADER_SIZE + data_len);
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.data));
        Ok(bytes)
    }

    /// Decode an index; `path` is only used in error messages.
    pub fn from_bytes(bytes: &[u8], path: &Path) -> Result<Self> {
        let invalid = |reason: String| Error::IndexFormat {
            path: path.to_path_buf(),
            reason,
        };

        if bytes.len() < HEADER_SIZE {
            return Err(invalid(format!(
                "file is {} bytes, shorter than the {HEADER_SIZE}-byte header",
                bytes.len()
            )));
        }

        let header: IndexHeader =
            bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
        if header.magic != MAGIC {
            return Err(invalid("bad magic bytes".into()));
        }
        let metric = Metric::from_code(header.metric).ok_or_else(|| {
            invalid(format!("unknown metric code {}", header.metric))
        })?;

        let count = header.count as usize;
        let dims = header.dims as usize;
        let expected_len = count
            .checked_mul(dims)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(HEADER_SIZE))
            .ok_or_else(|| invalid("header sizes overflow".into()))?;
        if bytes.len() != expected_len {
            return Err(invalid(format!(
                "expected {expected_len} bytes for {count} vectors of \
                 dimension {dims}, found {}",
                bytes.len()
            )));
        }
        if count > 0 && dims == 0 {
            return Err(invalid("zero dimension with stored vectors".into()));
        }

        let data: Vec<f32> = bytes[HEADER_SIZE..]
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();

        Ok(Self { metric, dims, data })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, path)
    }
}

fn compare_neighbors(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then(a.position.cmp(&b.position))
}
