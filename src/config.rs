//! Pipeline configuration (SPEC_FULL.md §6, §12).
//!
//! A plain builder struct — no CLI, no schema, no deserialization. The non-goals in
//! SPEC_FULL.md §1/§9 place configuration loading outside the core; callers construct
//! a `PipelineConfig` directly in code.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::splitter::DEFAULT_MAX_LINE_BYTES;

/// Receives every emitted `(logical_name, fragment)` pair. Invoked from worker
/// threads; implementations must be `Send + Sync` and should treat calls as
/// potentially concurrent across distinct inner archives (SPEC_FULL.md §5).
pub trait Sink: Send + Sync {
    fn handle(&self, logical_name: &str, fragment: &str);
}

impl<F> Sink for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn handle(&self, logical_name: &str, fragment: &str) {
        self(logical_name, fragment)
    }
}

/// Configuration recognised by the [`crate::Pipeline`] (SPEC_FULL.md §6).
#[derive(Clone)]
pub struct PipelineConfig {
    pub(crate) workers: NonZeroUsize,
    pub(crate) authorities: HashSet<String>,
    pub(crate) file_types: Vec<String>,
    pub(crate) archive_extension: String,
    pub(crate) max_line_bytes: usize,
    pub(crate) state_backing_path: PathBuf,
    pub(crate) content_handler: Arc<dyn Sink>,
}

impl std::fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("workers", &self.workers)
            .field("authorities", &self.authorities)
            .field("file_types", &self.file_types)
            .field("archive_extension", &self.archive_extension)
            .field("max_line_bytes", &self.max_line_bytes)
            .field("state_backing_path", &self.state_backing_path)
            .field("content_handler", &"<sink>")
            .finish()
    }
}

/// Builds a [`PipelineConfig`]. `state_backing_path` and `content_handler` are
/// required; every other field has the default named in SPEC_FULL.md §6.
pub struct PipelineConfigBuilder {
    workers: NonZeroUsize,
    authorities: HashSet<String>,
    file_types: Vec<String>,
    archive_extension: String,
    max_line_bytes: usize,
    state_backing_path: Option<PathBuf>,
    content_handler: Option<Arc<dyn Sink>>,
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        PipelineConfigBuilder {
            workers: NonZeroUsize::new(1).unwrap(),
            authorities: HashSet::new(),
            file_types: Vec::new(),
            archive_extension: "zip".to_string(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            state_backing_path: None,
            content_handler: None,
        }
    }
}

impl PipelineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workers(mut self, workers: NonZeroUsize) -> Self {
        self.workers = workers;
        self
    }

    /// Upper-cases every code before storing it, since `extract_authority`
    /// (src/dispatcher.rs) can only ever produce an upper-case two-letter match
    /// (`[A-Z]{2}`) and filenames on disk are always upper-case. Without this, a
    /// caller configuring e.g. `authorities(["ep"])` would silently reject every
    /// inner archive of that authority instead of including them.
    pub fn authorities<I, S>(mut self, authorities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authorities = authorities
            .into_iter()
            .map(|a| a.into().to_uppercase())
            .collect();
        self
    }

    pub fn file_types<I, S>(mut self, file_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.file_types = file_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn archive_extension(mut self, extension: impl Into<String>) -> Self {
        self.archive_extension = extension.into();
        self
    }

    pub fn max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    pub fn state_backing_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_backing_path = Some(path.into());
        self
    }

    pub fn content_handler(mut self, handler: impl Sink + 'static) -> Self {
        self.content_handler = Some(Arc::new(handler));
        self
    }

    /// Builds the config. Panics if `state_backing_path` or `content_handler` were
    /// never set — both are required for the pipeline to do anything meaningful.
    pub fn build(self) -> PipelineConfig {
        PipelineConfig {
            workers: self.workers,
            authorities: self.authorities,
            file_types: self.file_types,
            archive_extension: self.archive_extension,
            max_line_bytes: self.max_line_bytes,
            state_backing_path: self
                .state_backing_path
                .expect("state_backing_path is required"),
            content_handler: self.content_handler.expect("content_handler is required"),
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorities_are_normalized_to_upper_case() {
        let config = PipelineConfigBuilder::new()
            .authorities(["ep", "Us", "WO"])
            .state_backing_path("unused.sqlite3")
            .content_handler(|_: &str, _: &str| {})
            .build();
        assert!(config.authorities.contains("EP"));
        assert!(config.authorities.contains("US"));
        assert!(config.authorities.contains("WO"));
        assert!(!config.authorities.contains("ep"));
    }
}
