//! docrag - a partitioned retrieval engine for grounding answers in your
//! own documents.
//!
//! Every source document becomes one partition: its chunks are embedded
//! into a flat vector index (`index_<id>.bin`) stored next to a chunk
//! manifest (`chunks_<id>.txt`). A query is embedded once, searched
//! against every partition in parallel, and the globally closest chunks
//! become the context of a chat-completion prompt.
//!
//! # Quick start
//!
//! ```no_run
//! use docrag::{Config, DataDir, RagSession};
//! use docrag::completion::create_completer;
//! use docrag::embedding::create_embedder;
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config = Config::resolve(None, &data_dir).unwrap();
//!
//! let session = RagSession::initialize(
//!     &config,
//!     config.store_layout(&data_dir),
//!     create_embedder(&config.embedding).unwrap(),
//!     create_completer(&config.completion).unwrap(),
//! )
//! .unwrap();
//!
//! let answer = session.answer("How do I configure chunking?");
//! for hit in &answer.context {
//!     let score = hit.similarity;
//!     println!("{}#{} ({score:.3})", hit.partition_id, hit.ordinal);
//! }
//! println!("{}", answer.text);
//! session.shutdown();
//! ```

pub mod chunking;
pub mod completion;
pub mod config;
pub mod data_dir;
pub mod embedding;
pub mod error;
mod http;
pub mod ingestion;
pub mod partition;
pub mod rag;
pub mod registry;
pub mod search;
pub mod store;
pub mod text_util;
pub mod vector_index;
pub mod walker;

pub use chunking::{Chunk, ChunkingConfig};
pub use completion::{Completer, Prompt, TokenStream};
pub use config::Config;
pub use data_dir::DataDir;
pub use embedding::Embedder;
pub use error::{Error, Result};
pub use partition::Partition;
pub use rag::{Answer, AnswerStream, RagSession};
pub use registry::PartitionRegistry;
pub use search::{SearchHit, SearchParams};
pub use store::StoreLayout;
pub use vector_index::{FlatIndex, Metric};
