use std::{collections::BTreeSet, path::Path};

use kdam::{BarExt, tqdm};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
    chunking::{ChunkingConfig, chunk_document},
    embedding::Embedder,
    error::Result,
    partition::{BuildOptions, build_partition},
    store::StoreLayout,
    walker::SourceFile,
};

/// Turns a file into plain text for chunking.
pub trait DocumentSource: Send + Sync {
    fn extract_text(&self, path: &Path) -> Result<String>;
}

/// UTF-8 text files such as markdown and plain text.
///
/// Lines consisting only of `---` (markdown rules, front matter fences)
/// are rewritten to `***` so chunk text never collides with the manifest
/// separator.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextSource;

impl DocumentSource for PlainTextSource {
    fn extract_text(&self, path: &Path) -> Result<String> {
        let content = std::fs::read_to_string(path)?;
        Ok(neutralize_rules(&content))
    }
}

fn neutralize_rules(content: &str) -> String {
    if !content.lines().any(|line| line.trim() == "---") {
        return content.to_string();
    }

    content
        .split('\n')
        .map(|line| if line.trim() == "---" { "***" } else { line })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub chunking: ChunkingConfig,
    pub build: BuildOptions,
    /// Delete stored partitions whose source file no longer exists.
    pub prune: bool,
    /// Draw a progress bar on stderr.
    pub progress: bool,
}

/// Outcome of a build run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub built: usize,
    /// Documents that produced no chunks.
    pub skipped: usize,
    pub failed: usize,
    pub pruned: usize,
}

/// Build one partition per file into `store`.
///
/// Files are read in parallel, then chunked, embedded and persisted one at
/// a time. A document that fails is logged and counted; it never aborts
/// the run, and its previously stored partition (if any) is left as is.
pub fn build_store(
    store: &StoreLayout,
    files: &[SourceFile],
    source: &dyn DocumentSource,
    embedder: &dyn Embedder,
    options: &IngestOptions,
) -> Result<BuildReport> {
    options.chunking.validate()?;
    store.ensure_dirs()?;

    let loaded: Vec<_> = files
        .par_iter()
        .map(|file| (file, source.extract_text(&file.absolute_path)))
        .collect();

    let mut report = BuildReport::default();
    let mut bar = tqdm!(
        total = files.len(),
        desc = "Building",
        unit = " docs",
        disable = !options.progress
    );

    for (file, text) in loaded {
        let id = file.partition_id.as_str();
        match text {
            Err(e) => {
                warn!(
                    path = %file.relative_path.display(),
                    error = %e,
                    "could not read document"
                );
                report.failed += 1;
            }
            Ok(text) => {
                let chunks = chunk_document(id, &text, &options.chunking);
                if chunks.is_empty() {
                    info!(partition = id, "document is empty, skipping");
                    store.remove_pair(id)?;
                    report.skipped += 1;
                } else {
                    match build_partition(
                        store,
                        id,
                        &chunks,
                        embedder,
                        &options.build,
                    ) {
                        Ok(_) => report.built += 1,
                        Err(e) => {
                            warn!(partition = id, error = %e, "build failed");
                            report.failed += 1;
                        }
                    }
                }
            }
        }
        bar.update(1)?;
    }

    if options.prune {
        report.pruned = prune_missing(store, files)?;
    }

    info!(
        built = report.built,
        skipped = report.skipped,
        failed = report.failed,
        pruned = report.pruned,
        "build finished"
    );
    Ok(report)
}

/// Remove stored partitions with no file in `files`.
fn prune_missing(store: &StoreLayout, files: &[SourceFile]) -> Result<usize> {
    let current: BTreeSet<&str> =
        files.iter().map(|f| f.partition_id.as_str()).collect();

    let mut stored: BTreeSet<String> =
        store.list_index_ids()?.into_iter().collect();
    stored.extend(store.list_manifest_ids()?);

    let mut pruned = 0;
    for id in stored.iter().filter(|id| !current.contains(id.as_str())) {
        store.remove_pair(id)?;
        info!(partition = %id, "removed partition without source file");
        pruned += 1;
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Error,
        walker::{build_matcher, discover_files},
    };

    struct LengthEmbedder;

    impl Embedder for LengthEmbedder {
        fn model_name(&self) -> &str {
            "length"
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    /// Fails on any text mentioning "poison".
    struct PickyEmbedder;

    impl Embedder for PickyEmbedder {
        fn model_name(&self) -> &str {
            "picky"
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains("poison") {
                Err(Error::Embedding("rejected".into()))
            } else {
                Ok(vec![1.0, 0.0])
            }
        }
    }

    fn setup(docs: &[(&str, &str)]) -> (tempfile::TempDir, StoreLayout) {
        let tmp = tempfile::tempdir().unwrap();
        let docs_dir = tmp.path().join("docs");
        std::fs::create_dir(&docs_dir).unwrap();
        for (name, content) in docs {
            std::fs::write(docs_dir.join(name), content).unwrap();
        }
        let store = StoreLayout::new(
            tmp.path().join("bins"),
            tmp.path().join("chunks"),
        );
        (tmp, store)
    }

    fn discover(tmp: &tempfile::TempDir) -> Vec<SourceFile> {
        let matcher = build_matcher(&["*.md".into(), "*.txt".into()]).unwrap();
        discover_files(&tmp.path().join("docs"), &matcher).unwrap()
    }

    #[test]
    fn rules_become_asterisks() {
        assert_eq!(
            neutralize_rules("---\ntitle: x\n---\nbody\n"),
            "***\ntitle: x\n***\nbody\n"
        );
        assert_eq!(neutralize_rules("a --- b"), "a --- b");
    }

    #[test]
    fn builds_one_partition_per_file() {
        let (tmp, store) = setup(&[
            ("a.md", "# Alpha\n\nFirst document."),
            ("b.txt", "Second document."),
        ]);
        let files = discover(&tmp);

        let report = build_store(
            &store,
            &files,
            &PlainTextSource,
            &LengthEmbedder,
            &IngestOptions::default(),
        )
        .unwrap();

        assert_eq!(report.built, 2);
        assert_eq!(store.list_index_ids().unwrap(), vec!["a.md", "b.txt"]);
        assert_eq!(
            store.read_manifest("b.txt").unwrap(),
            vec!["Second document."]
        );
    }

    #[test]
    fn empty_documents_are_skipped() {
        let (tmp, store) = setup(&[("blank.md", "  \n\n "), ("ok.md", "text")]);
        let files = discover(&tmp);

        let report = build_store(
            &store,
            &files,
            &PlainTextSource,
            &LengthEmbedder,
            &IngestOptions::default(),
        )
        .unwrap();

        assert_eq!(report.built, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.list_index_ids().unwrap(), vec!["ok.md"]);
    }

    #[test]
    fn one_failing_document_does_not_stop_the_build() {
        let (tmp, store) =
            setup(&[("bad.md", "poison pill"), ("good.md", "healthy text")]);
        let files = discover(&tmp);

        let report = build_store(
            &store,
            &files,
            &PlainTextSource,
            &PickyEmbedder,
            &IngestOptions::default(),
        )
        .unwrap();

        assert_eq!(report.built, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(store.list_index_ids().unwrap(), vec!["good.md"]);
        assert_eq!(store.list_manifest_ids().unwrap(), vec!["good.md"]);
    }

    #[test]
    fn prune_removes_partitions_without_sources() {
        let (tmp, store) = setup(&[("keep.md", "keep"), ("gone.md", "gone")]);
        let options = IngestOptions {
            prune: true,
            ..IngestOptions::default()
        };
        build_store(
            &store,
            &discover(&tmp),
            &PlainTextSource,
            &LengthEmbedder,
            &options,
        )
        .unwrap();

        std::fs::remove_file(tmp.path().join("docs/gone.md")).unwrap();
        let report = build_store(
            &store,
            &discover(&tmp),
            &PlainTextSource,
            &LengthEmbedder,
            &options,
        )
        .unwrap();

        assert_eq!(report.pruned, 1);
        assert_eq!(store.list_index_ids().unwrap(), vec!["keep.md"]);
        assert_eq!(store.list_manifest_ids().unwrap(), vec!["keep.md"]);
    }

    #[test]
    fn invalid_chunking_is_rejected_up_front() {
        let (tmp, store) = setup(&[("a.md", "text")]);
        let options = IngestOptions {
            chunking: ChunkingConfig {
                max_size: 10,
                overlap: 10,
                ..ChunkingConfig::default()
            },
            ..IngestOptions::default()
        };

        let err = build_store(
            &store,
            &discover(&tmp),
            &PlainTextSource,
            &LengthEmbedder,
            &options,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!store.index_dir().exists());
    }
}
