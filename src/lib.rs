//! Resumable streaming extraction of EPO DOCDB bulk delivery archives.
//!
//! Given a directory of outer bulk archives, walks the three-level nested structure
//! (outer archive → inner archive → concatenated XML stream of exchange documents),
//! emits one record per exchange document to a caller-supplied sink, and maintains
//! durable progress state in a SQLite-backed store so an interrupted run resumes
//! without re-emitting completed work. See `SPEC_FULL.md` for the full design.
//!
//! This crate has no network surface and no CLI: callers drive it programmatically
//! by constructing a [`PipelineConfig`] with [`PipelineConfig::builder`] and handing
//! it to [`Pipeline::new`].
//!
//! ```no_run
//! use std::num::NonZeroUsize;
//! use std::path::Path;
//! use docdb_extract::{Pipeline, PipelineConfig};
//!
//! let config = PipelineConfig::builder()
//!     .workers(NonZeroUsize::new(4).unwrap())
//!     .state_backing_path("./docdb_state.sqlite3")
//!     .content_handler(|logical_name: &str, fragment: &str| {
//!         println!("{logical_name}: {} bytes", fragment.len());
//!     })
//!     .build();
//!
//! let pipeline = Pipeline::new(config)?;
//! pipeline.process_directory(Path::new("./deliveries"))?;
//! # Ok::<(), docdb_extract::PipelineError>(())
//! ```

pub mod archive;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod orchestrator;
pub mod splitter;
pub mod state;

pub use config::{PipelineConfig, PipelineConfigBuilder, Sink};
pub use error::{ArchiveError, DispatchError, PipelineError, SplitterError, StateError};
pub use orchestrator::Pipeline;
pub use splitter::DocumentSplitter;
pub use state::{StateEntry, StateStore, Status};
