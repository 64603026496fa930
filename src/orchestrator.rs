//! Pipeline Orchestrator (SPEC_FULL.md §4.5).
//!
//! Drives a directory of outer archives end to end: enumerates and sorts them,
//! applies the outer-level file-type filter and state check, then delegates each
//! surviving outer archive to the Dispatcher's worker pool before committing its
//! `mark_done`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::dispatcher;
use crate::error::PipelineError;
use crate::state::StateStore;

const OUTER_ARCHIVE_PREFIX: &str = "docdb_";

/// A delivered bulk archive found on disk, identified by its absolute path.
///
/// `delivery_name` is derived purely for log context (SPEC_FULL.md §13): it is the
/// filename with the `docdb_` prefix and archive extension stripped, never part of
/// a persisted or hashed key.
struct OuterArchive {
    path: PathBuf,
    state_key: String,
    delivery_name: String,
}

impl OuterArchive {
    fn from_path(path: PathBuf) -> Self {
        let state_key = path.to_string_lossy().into_owned();
        let delivery_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| derive_delivery_name(n))
            .unwrap_or_else(|| state_key.clone());
        OuterArchive {
            path,
            state_key,
            delivery_name,
        }
    }
}

fn derive_delivery_name(file_name: &str) -> String {
    let stripped = file_name
        .strip_prefix(OUTER_ARCHIVE_PREFIX)
        .unwrap_or(file_name);
    match stripped.rfind('.') {
        Some(i) => stripped[..i].to_string(),
        None => stripped.to_string(),
    }
}

/// Drives the resumable DOCDB extraction pipeline described by SPEC_FULL.md §2-§5.
///
/// Owns the durable [`StateStore`] and the [`PipelineConfig`] for the run. Cheap to
/// construct; the expensive state lives in the store's single SQLite connection.
pub struct Pipeline {
    config: PipelineConfig,
    state: StateStore,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    /// Opens (or creates) the state store at `config.state_backing_path` and returns
    /// a pipeline ready to drive `process_directory`/`process_outer_archive`.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::new_with_cancel(config, Arc::new(AtomicBool::new(false)))
    }

    /// Like [`Pipeline::new`], but takes an externally-owned cancellation flag
    /// instead of allocating a fresh one. Useful when the caller needs to hold the
    /// handle before the pipeline exists (e.g. to reference it from the sink itself).
    pub fn new_with_cancel(
        config: PipelineConfig,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, PipelineError> {
        let state = StateStore::open(&config.state_backing_path)?;
        Ok(Pipeline {
            config,
            state,
            cancel,
        })
    }

    /// Returns a cheap, clonable cancellation handle. Setting it from another thread
    /// (e.g. a signal handler) stops workers at their next checkpoint (SPEC_FULL.md
    /// §5): between inner archives and between emitted records inside the splitter.
    /// In-flight reads are not forcibly interrupted.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Enumerates every regular file in `dir` whose name starts with `docdb_` and
    /// ends with the configured archive extension, sorts them in ascending
    /// lexicographic order of absolute path, and processes each in turn.
    ///
    /// Per SPEC_FULL.md §5, outer archives are processed strictly in order: the
    /// records of one outer archive all precede the records of the next.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn process_directory(&self, dir: &Path) -> Result<(), PipelineError> {
        let mut candidates = self.enumerate_outer_archives(dir)?;
        candidates.sort_by(|a, b| a.path.cmp(&b.path));

        tracing::info!(dir = %dir.display(), count = candidates.len(), "enumerated outer archives");

        for outer in candidates {
            if self.cancel.load(std::sync::atomic::Ordering::Relaxed) {
                tracing::debug!("process_directory cancelled");
                return Ok(());
            }

            if !crate::dispatcher::file_type_allowed(
                outer.path.to_string_lossy().as_ref(),
                &self.config.file_types,
            ) {
                tracing::debug!(delivery = %outer.delivery_name, "skipping outer archive: file-type filter rejected");
                continue;
            }

            match self.state.register_or_skip(&outer.state_key) {
                Ok(true) => {
                    tracing::debug!(delivery = %outer.delivery_name, "skipping outer archive: already done");
                    continue;
                }
                Ok(false) => {}
                Err(e) => return Err(e.into()),
            }

            self.process_outer_archive_inner(&outer)?;
        }

        Ok(())
    }

    /// Processes a single outer archive by absolute path: opens it, dispatches its
    /// qualifying inner archives across the worker pool, and on clean completion
    /// marks the outer archive itself done (which cascades to purge its inner-archive
    /// rows from the state store).
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn process_outer_archive(&self, path: &Path) -> Result<(), PipelineError> {
        let outer = OuterArchive::from_path(path.to_path_buf());
        self.process_outer_archive_inner(&outer)
    }

    fn process_outer_archive_inner(&self, outer: &OuterArchive) -> Result<(), PipelineError> {
        if !outer.path.is_file() {
            tracing::error!(
                delivery = %outer.delivery_name,
                path = %outer.path.display(),
                "outer archive cannot be opened, skipping"
            );
            return Ok(());
        }

        match dispatcher::dispatch(
            &outer.state_key,
            &outer.path,
            &self.config,
            &self.state,
            &self.cancel,
        ) {
            Ok(outcome) => {
                if self.cancel.load(std::sync::atomic::Ordering::Relaxed) {
                    tracing::debug!(delivery = %outer.delivery_name, "not marking done: run was cancelled");
                    return Ok(());
                }
                if !outcome.all_inner_archives_succeeded {
                    tracing::warn!(
                        delivery = %outer.delivery_name,
                        "not marking outer archive done: at least one inner archive failed and will retry"
                    );
                    return Ok(());
                }
                self.state.mark_done(&outer.state_key)?;
                tracing::info!(delivery = %outer.delivery_name, "outer archive complete");
                Ok(())
            }
            Err(crate::error::DispatchError::State(e)) => Err(e.into()),
            Err(crate::error::DispatchError::Archive(e)) => {
                tracing::error!(
                    delivery = %outer.delivery_name,
                    error = %e,
                    "outer archive failed, will retry on next run"
                );
                Ok(())
            }
        }
    }

    fn enumerate_outer_archives(&self, dir: &Path) -> Result<Vec<OuterArchive>, PipelineError> {
        let suffix = format!(".{}", self.config.archive_extension);
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(_) => continue,
            };
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if name.starts_with(OUTER_ARCHIVE_PREFIX) && name.ends_with(&suffix) {
                found.push(OuterArchive::from_path(entry.path()));
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_name_strips_prefix_and_extension() {
        assert_eq!(
            derive_delivery_name("docdb_xml_202401_epo.zip"),
            "xml_202401_epo"
        );
        assert_eq!(derive_delivery_name("no_prefix.zip"), "no_prefix");
        assert_eq!(derive_delivery_name("docdb_noext"), "noext");
    }
}
