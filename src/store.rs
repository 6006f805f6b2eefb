//! On-disk layout of built partitions.
//!
//! Each partition is persisted as a pair of files sharing its id:
//!
//! ```text
//! <index_dir>/index_<id>.bin      vector index (see `vector_index`)
//! <manifest_dir>/chunks_<id>.txt  chunk texts, each followed by "\n---\n"
//! ```
//!
//! The manifest lists chunks in ordinal order, so line-up with the index is
//! purely positional.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    error::{Error, Result},
    vector_index::FlatIndex,
};

/// Written after every chunk in a manifest file.
pub const CHUNK_SEPARATOR: &str = "\n---\n";

const INDEX_PREFIX: &str = "index_";
const INDEX_SUFFIX: &str = ".bin";
const MANIFEST_PREFIX: &str = "chunks_";
const MANIFEST_SUFFIX: &str = ".txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    index_dir: PathBuf,
    manifest_dir: PathBuf,
}

impl StoreLayout {
    pub fn new(
        index_dir: impl Into<PathBuf>,
        manifest_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            index_dir: index_dir.into(),
            manifest_dir: manifest_dir.into(),
        }
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn manifest_dir(&self) -> &Path {
        &self.manifest_dir
    }

    pub fn index_path(&self, partition_id: &str) -> PathBuf {
        self.index_dir
            .join(format!("{INDEX_PREFIX}{partition_id}{INDEX_SUFFIX}"))
    }

    pub fn manifest_path(&self, partition_id: &str) -> PathBuf {
        self.manifest_dir.join(format!(
            "{MANIFEST_PREFIX}{partition_id}{MANIFEST_SUFFIX}"
        ))
    }

    /// Create both directories for a build.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.index_dir, &self.manifest_dir] {
            fs::create_dir_all(dir).map_err(|_| Error::DataDir(dir.clone()))?;
        }
        Ok(())
    }

    /// Fail unless both directories exist. Serving never creates them.
    pub fn check_dirs(&self) -> Result<()> {
        for (what, dir) in [
            ("index", &self.index_dir),
            ("chunk manifest", &self.manifest_dir),
        ] {
            if !dir.is_dir() {
                return Err(Error::Config(format!(
                    "{what} directory {} does not exist; \
                     run `docrag build` first",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Ids of all index files, sorted.
    pub fn list_index_ids(&self) -> Result<Vec<String>> {
        list_ids(&self.index_dir, partition_id_from_index_file)
    }

    /// Ids of all manifest files, sorted.
    pub fn list_manifest_ids(&self) -> Result<Vec<String>> {
        list_ids(&self.manifest_dir, partition_id_from_manifest_file)
    }

    pub fn read_index(&self, partition_id: &str) -> Result<FlatIndex> {
        FlatIndex::read(&self.index_path(partition_id))
    }

    pub fn read_manifest(&self, partition_id: &str) -> Result<Vec<String>> {
        let content = fs::read_to_string(self.manifest_path(partition_id))?;
        Ok(decode_manifest(&content))
    }

    /// Persist an index and its chunk texts.
    ///
    /// Both files are first written under temporary names. The manifest is
    /// moved into place before the index, so a reader never sees a new
    /// index without its manifest.
    pub fn write_pair(
        &self,
        partition_id: &str,
        index: &FlatIndex,
        chunks: &[String],
    ) -> Result<()> {
        validate_partition_id(partition_id)?;
        if let Some(ordinal) = chunks.iter().position(|c| collides(c)) {
            return Err(Error::Build {
                partition: partition_id.to_string(),
                reason: format!(
                    "chunk {ordinal} contains the manifest separator"
                ),
            });
        }

        let index_bytes = index.to_bytes()?;
        let manifest = encode_manifest(chunks);

        let index_path = self.index_path(partition_id);
        let manifest_path = self.manifest_path(partition_id);
        let index_tmp = temp_path(&index_path);
        let manifest_tmp = temp_path(&manifest_path);

        let staged = fs::write(&manifest_tmp, manifest)
            .and_then(|_| fs::write(&index_tmp, &index_bytes));
        if let Err(e) = staged {
            let _ = fs::remove_file(&manifest_tmp);
            let _ = fs::remove_file(&index_tmp);
            return Err(e.into());
        }

        if let Err(e) = fs::rename(&manifest_tmp, &manifest_path) {
            let _ = fs::remove_file(&manifest_tmp);
            let _ = fs::remove_file(&index_tmp);
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&index_tmp, &index_path) {
            let _ = fs::remove_file(&index_tmp);
            return Err(e.into());
        }

        debug!(
            partition = partition_id,
            chunks = chunks.len(),
            "wrote partition files"
        );
        Ok(())
    }

    /// Delete both files of a partition. Missing files are not an error.
    pub fn remove_pair(&self, partition_id: &str) -> Result<()> {
        for path in [
            self.index_path(partition_id),
            self.manifest_path(partition_id),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Extract the partition id from an index file name such as
/// `index_notes.md.bin`.
///
/// # Examples
///
/// ```
/// use docrag::store::partition_id_from_index_file;
///
/// assert_eq!(
///     partition_id_from_index_file("index_notes.md.bin"),
///     Some("notes.md".to_string())
/// );
/// assert_eq!(partition_id_from_index_file("notes.md"), None);
/// ```
pub fn partition_id_from_index_file(name: &str) -> Option<String> {
    strip_affixes(name, INDEX_PREFIX, INDEX_SUFFIX)
}

pub fn partition_id_from_manifest_file(name: &str) -> Option<String> {
    strip_affixes(name, MANIFEST_PREFIX, MANIFEST_SUFFIX)
}

/// Partition ids become file name components, so they must be plain names.
pub fn validate_partition_id(partition_id: &str) -> Result<()> {
    let bad = partition_id.is_empty()
        || partition_id == "."
        || partition_id == ".."
        || partition_id.contains(['/', '\\']);
    if bad {
        return Err(Error::Config(format!(
            "invalid partition id {partition_id:?}"
        )));
    }
    Ok(())
}

fn strip_affixes(name: &str, prefix: &str, suffix: &str) -> Option<String> {
    let id = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

fn list_ids(
    dir: &Path,
    parse: fn(&str) -> Option<String>,
) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(id) = entry.file_name().to_str().and_then(parse) {
            ids.push(id);
        }
    }
    ids.sort();
    Ok(ids)
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

fn collides(chunk: &str) -> bool {
    chunk == "---"
        || chunk.contains(CHUNK_SEPARATOR)
        || chunk.starts_with("---\n")
        || chunk.ends_with("\n---")
}

fn encode_manifest(chunks: &[String]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        out.push_str(chunk);
        out.push_str(CHUNK_SEPARATOR);
    }
    out
}

/// Split manifest content back into chunks. Only an empty trailing
/// remainder is dropped.
fn decode_manifest(content: &str) -> Vec<String> {
    let mut chunks: Vec<String> =
        content.split(CHUNK_SEPARATOR).map(String::from).collect();
    if chunks.last().is_some_and(|c| c.is_empty()) {
        chunks.pop();
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_index::Metric;

    fn layout(root: &Path) -> StoreLayout {
        StoreLayout::new(root.join("bins"), root.join("chunks"))
    }

    fn sample_index(n: usize) -> FlatIndex {
        let mut index = FlatIndex::new(Metric::Cosine, 2);
        for i in 0..n {
            index.add(&[i as f32, 1.0]).unwrap();
        }
        index
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn file_names_follow_partition_id() {
        let store = StoreLayout::new("/data/bins", "/data/chunks");
        assert_eq!(
            store.index_path("a.txt"),
            PathBuf::from("/data/bins/index_a.txt.bin")
        );
        assert_eq!(
            store.manifest_path("a.txt"),
            PathBuf::from("/data/chunks/chunks_a.txt.txt")
        );
    }

    #[test]
    fn id_extraction_ignores_unrelated_files() {
        assert_eq!(partition_id_from_index_file("index_.bin"), None);
        assert_eq!(partition_id_from_index_file(".index_a.bin.tmp"), None);
        assert_eq!(
            partition_id_from_manifest_file("chunks_a.md.txt"),
            Some("a.md".into())
        );
        assert_eq!(partition_id_from_manifest_file("readme.txt"), None);
    }

    #[test]
    fn manifest_decoding_drops_only_empty_tail() {
        assert_eq!(decode_manifest("a\n---\nb\n---\n"), texts(&["a", "b"]));
        assert_eq!(decode_manifest("a\n---\nb"), texts(&["a", "b"]));
        assert!(decode_manifest("").is_empty());
    }

    #[test]
    fn write_pair_then_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let store = layout(tmp.path());
        store.ensure_dirs().unwrap();

        let chunks = texts(&["first chunk", "second\nchunk", "third"]);
        store.write_pair("doc.md", &sample_index(3), &chunks).unwrap();

        assert_eq!(store.read_manifest("doc.md").unwrap(), chunks);
        assert_eq!(store.read_index("doc.md").unwrap(), sample_index(3));
        assert_eq!(store.list_index_ids().unwrap(), vec!["doc.md"]);
        assert_eq!(store.list_manifest_ids().unwrap(), vec!["doc.md"]);

        let leftovers: Vec<_> = fs::read_dir(store.index_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn write_pair_rejects_separator_collisions_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = layout(tmp.path());
        store.ensure_dirs().unwrap();

        for bad in ["a\n---\nb", "---", "---\nx", "x\n---"] {
            let chunks = texts(&["fine", bad]);
            let err = store
                .write_pair("doc", &sample_index(2), &chunks)
                .unwrap_err();
            assert!(matches!(err, Error::Build { .. }), "{bad:?}");
        }

        assert!(store.list_index_ids().unwrap().is_empty());
        assert!(store.list_manifest_ids().unwrap().is_empty());
    }

    #[test]
    fn listing_is_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let store = layout(tmp.path());
        store.ensure_dirs().unwrap();

        for id in ["zeta", "alpha", "mid"] {
            store
                .write_pair(id, &sample_index(1), &texts(&["text"]))
                .unwrap();
        }
        assert_eq!(
            store.list_index_ids().unwrap(),
            vec!["alpha", "mid", "zeta"]
        );
    }

    #[test]
    fn remove_pair_tolerates_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = layout(tmp.path());
        store.ensure_dirs().unwrap();

        store
            .write_pair("doc", &sample_index(1), &texts(&["text"]))
            .unwrap();
        store.remove_pair("doc").unwrap();
        store.remove_pair("doc").unwrap();
        assert!(store.list_index_ids().unwrap().is_empty());
    }

    #[test]
    fn check_dirs_requires_both_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let store = layout(tmp.path());
        assert!(matches!(store.check_dirs(), Err(Error::Config(_))));

        fs::create_dir_all(store.index_dir()).unwrap();
        assert!(matches!(store.check_dirs(), Err(Error::Config(_))));

        store.ensure_dirs().unwrap();
        store.check_dirs().unwrap();
    }

    #[test]
    fn partition_ids_must_be_plain_names() {
        assert!(validate_partition_id("notes.md").is_ok());
        assert!(validate_partition_id("a__b.md").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            assert!(validate_partition_id(bad).is_err(), "{bad:?}");
        }
    }
}
