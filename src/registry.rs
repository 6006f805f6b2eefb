//! In-memory set of loaded partitions, keyed by partition id.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    partition::Partition,
    store::StoreLayout,
    vector_index::Metric,
};

/// All partitions available to search.
///
/// Every partition shares one dimension and one metric, so distances are
/// comparable across partitions. The registry is read-only once built.
#[derive(Debug, Clone, Default)]
pub struct PartitionRegistry {
    partitions: BTreeMap<String, Partition>,
}

impl PartitionRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a registry from partitions already in memory.
    ///
    /// Unlike [`PartitionRegistry::load`], incompatible or duplicate
    /// partitions are an error rather than skipped.
    pub fn from_partitions(
        partitions: impl IntoIterator<Item = Partition>,
    ) -> Result<Self> {
        let mut registry = Self::empty();
        for partition in partitions {
            if registry.partitions.contains_key(partition.id()) {
                return Err(Error::Config(format!(
                    "duplicate partition id {:?}",
                    partition.id()
                )));
            }
            registry
                .check_compatible(&partition)
                .map_err(Error::Config)?;
            registry
                .partitions
                .insert(partition.id().to_string(), partition);
        }
        Ok(registry)
    }

    /// Load every persisted partition from `store`.
    ///
    /// Index files without a manifest, pairs whose counts disagree, files
    /// that cannot be read and partitions incompatible with those already
    /// loaded are skipped with a warning. Returns the registry and the
    /// number of partitions loaded; fails only when none load.
    ///
    /// With no expectations the first loadable partition sets the shape.
    /// Use [`PartitionRegistry::load_expecting`] when the embedder's
    /// dimension is known.
    pub fn load(store: &StoreLayout) -> Result<(Self, usize)> {
        Self::load_expecting(store, &Expected::default())
    }

    /// Like [`PartitionRegistry::load`], but partitions whose dimension or
    /// metric differ from `expected` are skipped.
    pub fn load_expecting(
        store: &StoreLayout,
        expected: &Expected,
    ) -> Result<(Self, usize)> {
        store.check_dirs()?;

        let index_ids = store.list_index_ids()?;
        let manifest_ids: BTreeSet<String> =
            store.list_manifest_ids()?.into_iter().collect();

        let mut registry = Self::empty();
        for id in &index_ids {
            if !manifest_ids.contains(id) {
                warn!(
                    partition = %id,
                    path = %store.manifest_path(id).display(),
                    "chunk manifest missing, skipping partition"
                );
                continue;
            }

            let partition = match load_partition(store, id) {
                Ok(p) => p,
                Err(e) => {
                    warn!(partition = %id, error = %e, "skipping partition");
                    continue;
                }
            };

            let checked = expected
                .check(&partition)
                .and_then(|()| registry.check_compatible(&partition));
            if let Err(reason) = checked {
                warn!(partition = %id, %reason, "skipping partition");
                continue;
            }
            registry.partitions.insert(id.clone(), partition);
        }

        let index_ids: BTreeSet<&String> = index_ids.iter().collect();
        for id in manifest_ids.iter().filter(|id| !index_ids.contains(id)) {
            warn!(partition = %id, "chunk manifest has no index file");
        }

        let loaded = registry.len();
        if loaded == 0 {
            return Err(Error::NoPartitions {
                index_dir: store.index_dir().to_path_buf(),
            });
        }

        info!(
            loaded,
            dims = registry.dims().unwrap_or_default(),
            "loaded partitions"
        );
        Ok((registry, loaded))
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Shared vector dimension, or `None` when empty.
    pub fn dims(&self) -> Option<usize> {
        self.partitions.values().next().map(Partition::dims)
    }

    /// Shared metric, or `None` when empty.
    pub fn metric(&self) -> Option<Metric> {
        self.partitions.values().next().map(Partition::metric)
    }

    pub fn get(&self, partition_id: &str) -> Option<&Partition> {
        self.partitions.get(partition_id)
    }

    /// Partitions in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }

    /// Total number of chunks across all partitions.
    pub fn chunk_count(&self) -> usize {
        self.partitions.values().map(Partition::len).sum()
    }

    fn check_compatible(
        &self,
        partition: &Partition,
    ) -> std::result::Result<(), String> {
        let Some(first) = self.partitions.values().next() else {
            return Ok(());
        };
        if partition.dims() != first.dims() {
            return Err(format!(
                "dimension {} differs from the registry's {}",
                partition.dims(),
                first.dims()
            ));
        }
        if partition.metric() != first.metric() {
            return Err(format!(
                "metric {} differs from the registry's {}",
                partition.metric(),
                first.metric()
            ));
        }
        Ok(())
    }
}

/// Shape every loaded partition must have. `None` accepts any value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expected {
    pub dims: Option<usize>,
    pub metric: Option<Metric>,
}

impl Expected {
    fn check(&self, partition: &Partition) -> std::result::Result<(), String> {
        if let Some(dims) = self.dims
            && partition.dims() != dims
        {
            return Err(format!(
                "dimension {} differs from the embedder's {dims}",
                partition.dims()
            ));
        }
        if let Some(metric) = self.metric
            && partition.metric() != metric
        {
            return Err(format!(
                "metric {} differs from the configured {metric}",
                partition.metric()
            ));
        }
        Ok(())
    }
}

fn load_partition(store: &StoreLayout, id: &str) -> Result<Partition> {
    let index = store.read_index(id)?;
    let chunks = store.read_manifest(id)?;
    Partition::new(id, index, chunks)
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use super::*;
    use crate::vector_index::FlatIndex;

    fn store(root: &Path) -> StoreLayout {
        let store = StoreLayout::new(root.join("bins"), root.join("chunks"));
        store.ensure_dirs().unwrap();
        store
    }

    fn write(
        store: &StoreLayout,
        id: &str,
        metric: Metric,
        dims: usize,
        texts: &[&str],
    ) {
        let mut index = FlatIndex::new(metric, dims);
        for i in 0..texts.len() {
            index.add(&vec![i as f32 + 1.0; dims]).unwrap();
        }
        let chunks: Vec<String> = texts.iter().map(|s| s.to_string()).collect();
        store.write_pair(id, &index, &chunks).unwrap();
    }

    fn partition(id: &str, metric: Metric, dims: usize) -> Partition {
        let mut index = FlatIndex::new(metric, dims);
        index.add(&vec![1.0; dims]).unwrap();
        Partition::new(id, index, vec!["text".into()]).unwrap()
    }

    #[test]
    fn loads_every_pair_in_id_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        write(&store, "b.md", Metric::Cosine, 3, &["one", "two"]);
        write(&store, "a.md", Metric::Cosine, 3, &["three"]);

        let (registry, loaded) = PartitionRegistry::load(&store).unwrap();

        assert_eq!(loaded, 2);
        assert_eq!(registry.dims(), Some(3));
        assert_eq!(registry.metric(), Some(Metric::Cosine));
        assert_eq!(registry.chunk_count(), 3);
        let ids: Vec<&str> = registry.iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec!["a.md", "b.md"]);
        assert_eq!(registry.get("b.md").unwrap().chunk(1), Some("two"));
    }

    #[test]
    fn index_without_manifest_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        write(&store, "doc1", Metric::Cosine, 2, &["a", "b"]);
        write(&store, "doc2", Metric::Cosine, 2, &["c"]);
        fs::remove_file(store.manifest_path("doc2")).unwrap();

        let (registry, loaded) = PartitionRegistry::load(&store).unwrap();
        assert_eq!(loaded, 1);
        assert!(registry.get("doc2").is_none());
    }

    #[test]
    fn count_mismatch_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        write(&store, "good", Metric::Cosine, 2, &["a"]);
        write(&store, "bad", Metric::Cosine, 2, &["a", "b"]);
        fs::write(store.manifest_path("bad"), "only one\n---\n").unwrap();

        let (registry, loaded) = PartitionRegistry::load(&store).unwrap();
        assert_eq!(loaded, 1);
        assert!(registry.get("bad").is_none());
    }

    #[test]
    fn incompatible_partitions_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        write(&store, "a", Metric::Cosine, 2, &["x"]);
        write(&store, "b", Metric::Cosine, 3, &["y"]);
        write(&store, "c", Metric::L2, 2, &["z"]);

        let (registry, loaded) = PartitionRegistry::load(&store).unwrap();
        assert_eq!(loaded, 1);
        assert!(registry.get("a").is_some());
    }

    #[test]
    fn stale_first_partition_does_not_set_the_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        write(&store, "a_stale.md", Metric::Cosine, 2, &["old"]);
        write(&store, "b.md", Metric::Cosine, 3, &["x"]);
        write(&store, "c.md", Metric::Cosine, 3, &["y"]);
        write(&store, "d.md", Metric::L2, 3, &["z"]);

        let expected = Expected {
            dims: Some(3),
            metric: Some(Metric::Cosine),
        };
        let (registry, loaded) =
            PartitionRegistry::load_expecting(&store, &expected).unwrap();

        assert_eq!(loaded, 2);
        assert_eq!(registry.dims(), Some(3));
        let ids: Vec<&str> = registry.iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec!["b.md", "c.md"]);
    }

    #[test]
    fn nothing_matching_expectations_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        write(&store, "a.md", Metric::Cosine, 2, &["x"]);

        let expected = Expected {
            dims: Some(5),
            metric: None,
        };
        let err =
            PartitionRegistry::load_expecting(&store, &expected).unwrap_err();
        assert!(matches!(err, Error::NoPartitions { .. }));
    }

    #[test]
    fn corrupt_index_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        write(&store, "good", Metric::Cosine, 2, &["a"]);
        write(&store, "broken", Metric::Cosine, 2, &["b"]);
        fs::write(store.index_path("broken"), b"garbage").unwrap();

        let (_, loaded) = PartitionRegistry::load(&store).unwrap();
        assert_eq!(loaded, 1);
    }

    #[test]
    fn nothing_loadable_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        write(&store, "orphan", Metric::Cosine, 2, &["a"]);
        fs::remove_file(store.manifest_path("orphan")).unwrap();

        let err = PartitionRegistry::load(&store).unwrap_err();
        assert!(matches!(err, Error::NoPartitions { .. }));
    }

    #[test]
    fn missing_directories_are_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StoreLayout::new(
            tmp.path().join("bins"),
            tmp.path().join("chunks"),
        );
        let err = PartitionRegistry::load(&store).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn from_partitions_rejects_mixed_dimensions() {
        let err = PartitionRegistry::from_partitions([
            partition("a", Metric::Cosine, 2),
            partition("b", Metric::Cosine, 4),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = PartitionRegistry::from_partitions([
            partition("a", Metric::Cosine, 2),
            partition("a", Metric::Cosine, 2),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_registry_has_no_shape() {
        let registry = PartitionRegistry::empty();
        assert!(registry.is_empty());
        assert_eq!(registry.dims(), None);
        assert_eq!(registry.metric(), None);
    }
}
