//! Dispatcher (SPEC_FULL.md §4.4).
//!
//! For one outer archive: selects which inner archives qualify, enqueues them on a
//! bounded channel sized to the accepted count, and drains that channel with a fixed
//! pool of OS threads (see SPEC_FULL.md §5 for why threads rather than an async
//! runtime).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Mutex};

use regex::Regex;

use crate::archive::InnerArchiveReader;
use crate::config::PipelineConfig;
use crate::error::{ArchiveError, DispatchError, StateError};
use crate::splitter::DocumentSplitter;
use crate::state::StateStore;

const INNER_ARCHIVE_PREFIX: &str = "Root/DOC/";

/// Selects and processes every qualifying inner archive of the outer archive at
/// `outer_file_path`, identified in the state store as `outer_path`. Returns a
/// [`DispatchOutcome`] reporting whether every accepted inner archive completed
/// cleanly, which the caller must check before marking the outer archive itself
/// done (SPEC_FULL.md §4.5).
#[tracing::instrument(level = "debug", skip(config, state, cancel))]
pub fn dispatch(
    outer_path: &str,
    outer_file_path: &Path,
    config: &PipelineConfig,
    state: &StateStore,
    cancel: &AtomicBool,
) -> Result<DispatchOutcome, DispatchError> {
    let accepted = select_candidates(outer_path, outer_file_path, config, state)?;
    tracing::info!(
        %outer_path,
        count = accepted.len(),
        "selected inner archives for dispatch"
    );

    let (tx, rx) = mpsc::sync_channel::<String>(accepted.len().max(1));
    for inner_path in accepted {
        tx.send(inner_path)
            .expect("channel is sized to the accepted count");
    }
    drop(tx);

    let rx = Mutex::new(rx);
    let outcome = WorkerOutcome::new();

    std::thread::scope(|scope| {
        for worker_id in 0..config.workers.get() {
            scope.spawn(|| {
                worker_loop(
                    worker_id,
                    outer_path,
                    outer_file_path,
                    config,
                    state,
                    cancel,
                    &rx,
                    &outcome,
                );
            });
        }
    });

    let had_archive_error = outcome.had_archive_error();
    match outcome.into_fatal() {
        Some(e) => Err(DispatchError::State(e)),
        None => Ok(DispatchOutcome {
            all_inner_archives_succeeded: !had_archive_error,
        }),
    }
}

/// Whether every accepted inner archive of the outer archive completed and was
/// individually `mark_done`'d. SPEC_FULL.md §4.5 only permits the caller to
/// `mark_done` the *outer* archive itself on "clean completion of all inner
/// archives"; if any inner archive failed with a non-fatal archive-shaped error, it
/// was logged and skipped (left `Todo`, eligible for retry) rather than failing the
/// whole outer archive, so `dispatch` must still report that fact here rather than
/// returning a bare `Ok(())` that looks indistinguishable from a fully clean run.
pub struct DispatchOutcome {
    pub all_inner_archives_succeeded: bool,
}

/// Tracks the two kinds of outcome a worker can report back to `dispatch`: the
/// first-wins fatal state-store error that must abort the whole run, and whether
/// any (non-fatal) inner archive was skipped due to an archive-shaped error.
struct WorkerOutcome {
    fatal: Mutex<Option<StateError>>,
    had_archive_error: AtomicBool,
}

impl WorkerOutcome {
    fn new() -> Self {
        WorkerOutcome {
            fatal: Mutex::new(None),
            had_archive_error: AtomicBool::new(false),
        }
    }

    fn set_fatal(&self, e: StateError) {
        let mut guard = self.fatal.lock().expect("fatal-error mutex poisoned");
        if guard.is_none() {
            *guard = Some(e);
        }
    }

    fn set_archive_error(&self) {
        self.had_archive_error.store(true, Ordering::Relaxed);
    }

    fn had_archive_error(&self) -> bool {
        self.had_archive_error.load(Ordering::Relaxed)
    }

    fn into_fatal(self) -> Option<StateError> {
        self.fatal.into_inner().expect("fatal-error mutex poisoned")
    }
}

fn worker_loop(
    worker_id: usize,
    outer_path: &str,
    outer_file_path: &Path,
    config: &PipelineConfig,
    state: &StateStore,
    cancel: &AtomicBool,
    rx: &Mutex<mpsc::Receiver<String>>,
    outcome: &WorkerOutcome,
) {
    loop {
        if cancel.load(Ordering::Relaxed) {
            tracing::debug!(worker_id, "worker stopping: cancelled");
            return;
        }

        let next = {
            let guard = rx.lock().expect("work queue mutex poisoned");
            guard.recv()
        };
        let inner_path = match next {
            Ok(path) => path,
            Err(_) => return, // channel drained and closed
        };

        if let Err(e) = process_inner_archive(outer_path, outer_file_path, &inner_path, config, state, cancel) {
            match e {
                DispatchError::State(state_err) => {
                    tracing::error!(
                        %outer_path,
                        %inner_path,
                        error = %state_err,
                        "state store failure, aborting run"
                    );
                    outcome.set_fatal(state_err);
                    cancel.store(true, Ordering::Relaxed);
                    return;
                }
                DispatchError::Archive(archive_err) => {
                    tracing::error!(
                        %outer_path,
                        %inner_path,
                        error = %archive_err,
                        "inner archive failed, skipping"
                    );
                    outcome.set_archive_error();
                }
            }
        }
    }
}

/// Processes one inner archive to completion: opens its own handle onto the outer
/// archive (SPEC_FULL.md §5 — one handle per worker rather than a shared, mutex-
/// guarded one), streams every member through the Document Splitter, and marks the
/// unit done on success. Archive-shaped errors are logged and swallowed (`Ok(())`,
/// the unit stays `Todo` for retry); only a state-store failure escapes as `Err`.
fn process_inner_archive(
    outer_path: &str,
    outer_file_path: &Path,
    inner_path: &str,
    config: &PipelineConfig,
    state: &StateStore,
    cancel: &AtomicBool,
) -> Result<(), DispatchError> {
    let file = File::open(outer_file_path).map_err(ArchiveError::from)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(ArchiveError::from)?;

    let mut entry = match archive.by_name(inner_path) {
        Ok(entry) => entry,
        Err(e) => {
            tracing::warn!(%outer_path, %inner_path, error = %e, "inner archive entry missing, skipping");
            return Ok(());
        }
    };

    let mut inner_reader = match InnerArchiveReader::new(&mut entry) {
        Ok(reader) => reader,
        Err(e) => {
            tracing::warn!(%outer_path, %inner_path, error = %e, "inner archive is corrupt, skipping");
            return Ok(());
        }
    };

    while let Some(member) = inner_reader.next_entry() {
        if cancel.load(Ordering::Relaxed) {
            tracing::debug!(%outer_path, %inner_path, "cancelled mid inner-archive");
            return Ok(());
        }

        let (member_name, member_reader) = match member {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(
                    %outer_path, %inner_path, error = %e,
                    "failed reading archive member, skipping remainder of inner archive"
                );
                return Ok(());
            }
        };

        let splitter = DocumentSplitter::with_max_line_bytes(member_reader, config.max_line_bytes);
        for result in splitter {
            if cancel.load(Ordering::Relaxed) {
                tracing::debug!(%outer_path, %inner_path, %member_name, "cancelled mid document stream");
                return Ok(());
            }
            match result {
                Ok((logical_name, fragment)) => {
                    config.content_handler.handle(&logical_name, &fragment);
                }
                Err(e) => {
                    tracing::error!(
                        %outer_path, %inner_path, %member_name, error = %e,
                        "splitter error, skipping remainder of inner archive"
                    );
                    return Ok(());
                }
            }
        }
    }

    state.mark_done(&format!("{}/{}", outer_path, inner_path))?;
    Ok(())
}

/// Runs selection rules 1-4 of SPEC_FULL.md §4.4 over every entry of the outer
/// archive, returning the inner-archive entry names that qualify for processing.
fn select_candidates(
    outer_path: &str,
    outer_file_path: &Path,
    config: &PipelineConfig,
    state: &StateStore,
) -> Result<Vec<String>, DispatchError> {
    let file = File::open(outer_file_path).map_err(ArchiveError::from)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(ArchiveError::from)?;

    let mut accepted = Vec::new();
    for i in 0..archive.len() {
        let (name, is_dir) = {
            let entry = archive.by_index(i).map_err(ArchiveError::from)?;
            (entry.name().to_string(), entry.is_dir())
        };

        if !is_candidate_path(&name, is_dir, &config.archive_extension) {
            continue;
        }

        if !config.authorities.is_empty() {
            match extract_authority(&name, &config.archive_extension) {
                Some(code) if config.authorities.contains(&code) => {}
                _ => {
                    tracing::warn!(inner_path = %name, "skipping: authority filter rejected or unmatched");
                    continue;
                }
            }
        }

        if !file_type_allowed(&name, &config.file_types) {
            tracing::debug!(inner_path = %name, "skipping: file-type filter rejected");
            continue;
        }

        let state_path = format!("{}/{}", outer_path, name);
        if state.register_or_skip(&state_path)? {
            tracing::debug!(inner_path = %name, "skipping: already done");
            continue;
        }

        accepted.push(name);
    }

    Ok(accepted)
}

/// Rule 1: only non-directory entries under `Root/DOC/` ending in `.{ext}`.
fn is_candidate_path(name: &str, is_dir: bool, ext: &str) -> bool {
    !is_dir && name.starts_with(INNER_ARCHIVE_PREFIX) && name.ends_with(&format!(".{}", ext))
}

/// Rule 2: extracts the two-letter authority code from `-XX-<digits>.<ext>` at the
/// end of the entry's basename. Returns `None` if the pattern doesn't match, which
/// the caller treats as a conservative skip when a filter is configured.
fn extract_authority(name: &str, ext: &str) -> Option<String> {
    let basename = Path::new(name).file_name()?.to_str()?;
    let pattern = format!(r"-([A-Z]{{2}})-\d{{1,10}}\.{}$", regex::escape(ext));
    let re = Regex::new(&pattern).ok()?;
    re.captures(basename).map(|caps| caps[1].to_string())
}

/// Rule 3: case-insensitive substring match against any configured file type. An
/// empty configured set allows everything through.
///
/// Reused at the outer-archive level by [`crate::orchestrator::Pipeline`]
/// (SPEC_FULL.md §4.5's `process_directory` applies the same rule to outer paths).
pub(crate) fn file_type_allowed(path: &str, configured: &[String]) -> bool {
    if configured.is_empty() {
        return true;
    }
    let lower = path.to_lowercase();
    configured.iter().any(|needle| lower.contains(&needle.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_path_requires_prefix_extension_and_non_directory() {
        assert!(is_candidate_path("Root/DOC/EPRTBJV1-EP-2024.zip", false, "zip"));
        assert!(!is_candidate_path("Root/DOC/EPRTBJV1-EP-2024.zip", true, "zip"));
        assert!(!is_candidate_path("Other/DOC/EPRTBJV1-EP-2024.zip", false, "zip"));
        assert!(!is_candidate_path("Root/DOC/EPRTBJV1-EP-2024.tar", false, "zip"));
    }

    #[test]
    fn authority_is_extracted_from_filename_suffix() {
        assert_eq!(
            extract_authority("Root/DOC/EPNWA1CreateDelete-EP-202401.zip", "zip").as_deref(),
            Some("EP")
        );
        assert_eq!(
            extract_authority("Root/DOC/EPNWA1CreateDelete-US-202401.zip", "zip").as_deref(),
            Some("US")
        );
    }

    #[test]
    fn authority_extraction_fails_conservatively_on_mismatch() {
        assert_eq!(extract_authority("Root/DOC/nocode.zip", "zip"), None);
        assert_eq!(extract_authority("Root/DOC/bad-epo-202401.zip", "zip"), None);
    }

    #[test]
    fn file_type_filter_is_case_insensitive_and_empty_means_allow_all() {
        assert!(file_type_allowed("Root/DOC/anything.zip", &[]));
        assert!(file_type_allowed(
            "Root/DOC/EPNWA1CreateDelete-EP-1.zip",
            &["createdelete".to_string()]
        ));
        assert!(!file_type_allowed(
            "Root/DOC/EPNWA1Full-EP-1.zip",
            &["createdelete".to_string()]
        ));
    }
}
