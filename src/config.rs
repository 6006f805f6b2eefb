//! TOML configuration.
//!
//! Every key is optional; a missing file means all defaults. See
//! [`Config`] for the layout.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::{
    chunking::ChunkingConfig,
    completion::CompletionConfig,
    data_dir::DataDir,
    embedding::EmbeddingConfig,
    error::{Error, Result},
    partition::BuildOptions,
    search::SearchParams,
    store::StoreLayout,
    vector_index::Metric,
};

/// Complete configuration, one field per TOML table.
///
/// # Examples
///
/// ```
/// use docrag::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [retrieval]
///     top_k = 5
///     similarity_threshold = 0.7
/// "#).unwrap();
/// assert_eq!(config.retrieval.top_k, 5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub store: StoreConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub completion: CompletionConfig,
    pub build: BuildConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory of index files; relative paths resolve against the data
    /// directory.
    pub index_dir: PathBuf,
    /// Directory of chunk manifests; resolved like `index_dir`.
    pub manifest_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            index_dir: PathBuf::from("bins"),
            manifest_dir: PathBuf::from("chunks"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub similarity_threshold: Option<f32>,
    pub metric: Metric,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            similarity_threshold: None,
            metric: Metric::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Glob patterns selecting source files.
    pub include: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            include: vec!["*.md".to_string(), "*.txt".to_string()],
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub top_k: Option<usize>,
    pub threshold: Option<f32>,
    pub model: Option<String>,
    pub include: Option<Vec<String>>,
}

impl Config {
    /// Find and load the configuration.
    ///
    /// Uses `explicit` (from `--config`) if given, else `config.toml` in
    /// the data directory if it exists, else defaults.
    pub fn resolve(
        explicit: Option<&Path>,
        data_dir: &DataDir,
    ) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(Error::NotFound {
                    kind: "config file",
                    name: path.display().to_string(),
                });
            }
            return load_config(path);
        }

        let default_path = data_dir.config_file();
        if default_path.is_file() {
            load_config(&default_path)
        } else {
            debug!("no config file, using defaults");
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Apply command-line overrides and re-validate.
    pub fn apply(&mut self, overrides: Overrides) -> Result<()> {
        if let Some(top_k) = overrides.top_k {
            self.retrieval.top_k = top_k;
        }
        if let Some(threshold) = overrides.threshold {
            self.retrieval.similarity_threshold = Some(threshold);
        }
        if let Some(model) = overrides.model {
            self.completion.model = model;
        }
        if let Some(include) = overrides.include {
            self.build.include = include;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        self.embedding.validate()?;
        self.completion.validate()?;

        if self.retrieval.top_k == 0 {
            return Err(Error::Config("retrieval.top_k must be >= 1".into()));
        }
        if let Some(threshold) = self.retrieval.similarity_threshold {
            let metric = self.retrieval.metric;
            let (low, high) = metric.similarity_range();
            if !(low..=high).contains(&threshold) {
                return Err(Error::Config(format!(
                    "retrieval.similarity_threshold {threshold} is outside \
                     [{low}, {high}] for metric {metric}"
                )));
            }
            if metric == Metric::L2 && !self.embedding.normalize {
                return Err(Error::Config(
                    "retrieval.similarity_threshold with metric l2 requires \
                     embedding.normalize = true"
                        .into(),
                ));
            }
        }

        if self.build.include.is_empty() {
            return Err(Error::Config(
                "build.include must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Store directories, with relative paths placed under `data_dir`.
    pub fn store_layout(&self, data_dir: &DataDir) -> StoreLayout {
        StoreLayout::new(
            data_dir.root().join(&self.store.index_dir),
            data_dir.root().join(&self.store.manifest_dir),
        )
    }

    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            k: self.retrieval.top_k,
            threshold: self.retrieval.similarity_threshold,
        }
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            metric: self.retrieval.metric,
            batch_size: self.embedding.batch_size,
        }
    }
}

/// Read, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    debug!(path = %path.display(), "loaded config");
    Ok(config)
}
