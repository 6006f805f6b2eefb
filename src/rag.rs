//! Question answering over the partition store.
//!
//! A [`RagSession`] owns the loaded registry and both model clients. Each
//! question retrieves the closest chunks, joins them into the prompt
//! context and asks the completer. Retrieval problems degrade to an empty
//! context; completion problems become an error-shaped answer. Neither
//! ends the session.

use tracing::{debug, info, warn};

use crate::{
    completion::{Completer, Prompt, TokenStream},
    config::Config,
    embedding::Embedder,
    error::{Error, Result},
    registry::{Expected, PartitionRegistry},
    search::{SearchHit, SearchParams, search},
    store::StoreLayout,
    text_util::join_context,
};

const DIMENSION_PROBE: &str = "dimension probe";

/// A complete answer and the chunks it was grounded on.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub context: Vec<SearchHit>,
    pub text: String,
}

/// A streamed answer. `tokens` can be consumed once.
#[derive(Debug)]
pub struct AnswerStream {
    pub context: Vec<SearchHit>,
    pub tokens: TokenStream,
}

pub struct RagSession {
    registry: PartitionRegistry,
    store: StoreLayout,
    embedder: Box<dyn Embedder>,
    completer: Box<dyn Completer>,
    params: SearchParams,
    expected: Expected,
    system_prompt: String,
    closed: bool,
}

impl RagSession {
    /// Probe the embedder once, then load the partitions that match its
    /// dimension and the configured metric.
    ///
    /// Partitions of another shape are skipped with a warning. Fails if
    /// the embedder is unreachable, a store directory is missing, or no
    /// matching partition loads.
    pub fn initialize(
        config: &Config,
        store: StoreLayout,
        embedder: Box<dyn Embedder>,
        completer: Box<dyn Completer>,
    ) -> Result<Self> {
        let dims = embedder.embed(DIMENSION_PROBE)?.len();
        let expected = Expected {
            dims: Some(dims),
            metric: Some(config.retrieval.metric),
        };
        let (registry, loaded) =
            PartitionRegistry::load_expecting(&store, &expected)?;

        info!(
            partitions = loaded,
            chunks = registry.chunk_count(),
            dims,
            embedder = embedder.model_name(),
            completer = completer.model_name(),
            "retrieval session ready"
        );

        Ok(Self {
            registry,
            store,
            embedder,
            completer,
            params: config.search_params(),
            expected,
            system_prompt: config.completion.system_prompt.clone(),
            closed: false,
        })
    }

    pub fn registry(&self) -> &PartitionRegistry {
        &self.registry
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn embedder_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn completer_name(&self) -> &str {
        self.completer.model_name()
    }

    /// The chunks most relevant to `query`. Failures are logged and yield
    /// no chunks.
    pub fn retrieve(&self, query: &str) -> Vec<SearchHit> {
        match search(&self.registry, &*self.embedder, query, &self.params) {
            Ok(hits) => {
                debug!(hits = hits.len(), "retrieved context");
                hits
            }
            Err(e) => {
                warn!(error = %e, "retrieval failed, answering without it");
                Vec::new()
            }
        }
    }

    pub fn answer(&self, query: &str) -> Answer {
        let context = self.retrieve(query);
        let prompt = self.prompt(query, &context);
        let text = self
            .completer
            .complete(&prompt)
            .unwrap_or_else(|e| error_answer(&e));
        Answer { context, text }
    }

    /// Like [`RagSession::answer`], but the text arrives incrementally. A
    /// failure becomes one final error-shaped increment.
    pub fn answer_stream(&self, query: &str) -> AnswerStream {
        let context = self.retrieve(query);
        let prompt = self.prompt(query, &context);

        let tokens = match self.completer.complete_stream(&prompt) {
            Ok(stream) => {
                let mut failed = false;
                TokenStream::new(stream.map_while(move |item| {
                    if failed {
                        return None;
                    }
                    Some(Ok(item.unwrap_or_else(|e| {
                        failed = true;
                        error_answer(&e)
                    })))
                }))
            }
            Err(e) => TokenStream::new(std::iter::once(Ok(error_answer(&e)))),
        };

        AnswerStream { context, tokens }
    }

    /// Load the store again and replace the registry if that succeeds.
    /// On failure the current registry stays in service.
    pub fn reload(&mut self) -> Result<usize> {
        let (registry, loaded) =
            PartitionRegistry::load_expecting(&self.store, &self.expected)?;

        self.registry = registry;
        info!(partitions = loaded, "reloaded partitions");
        Ok(loaded)
    }

    /// Release the completer. Errors are logged, never returned.
    pub fn shutdown(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match self.completer.close() {
            Ok(()) => debug!("retrieval session closed"),
            Err(e) => warn!(error = %e, "failed to close completion session"),
        }
    }

    fn prompt(&self, query: &str, context: &[SearchHit]) -> Prompt {
        let texts: Vec<&str> =
            context.iter().map(|hit| hit.text.as_str()).collect();
        Prompt::new(&self.system_prompt, join_context(&texts), query)
    }
}

impl Drop for RagSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Text shown in place of an answer when the model call fails.
pub fn error_answer(error: &Error) -> String {
    format!("Error generating answer: {error}")
}
