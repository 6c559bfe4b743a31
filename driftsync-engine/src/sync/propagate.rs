use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use driftsync_core::{
    HbfInfo, ReplicaCapabilities, Severity, Side, StatusCode, Vio, VioError, VioErrorKind,
    VioHandle, classify, close_severity, current_euid, current_uid,
};

use super::entry::{Applied, Entry, EntryKind, Pending, SyncTrees, path_hash};
use super::journal::{JournalError, ProgressJournal, ResumeRecord};
use super::paths;
use super::progress::{OverallProgress, ProgressCallback, ProgressEvent, ProgressKind};
use super::rename::RenameTable;

#[derive(Debug, Error)]
pub enum PropagateError {
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("propagation aborted")]
    Aborted,
    #[error("fatal replica error: {0}")]
    Fatal(VioError),
}

/// Result of one per-entry operation. A soft failure is recorded on the
/// entry and the driver moves on; fatal failures surface as
/// [`PropagateError`] and stop the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Done,
    Soft,
}

/// Per-sync configuration, immutable for the duration of a run.
#[derive(Debug, Clone, Copy)]
pub struct PropagateConfig {
    /// Skip an entry once its journal error counter exceeds this value;
    /// `None` disables the blacklist.
    pub blacklist_threshold: Option<u32>,
    pub uid: u32,
    pub euid: u32,
}

impl Default for PropagateConfig {
    fn default() -> Self {
        Self {
            blacklist_threshold: Some(3),
            uid: current_uid(),
            euid: current_euid(),
        }
    }
}

/// Ignored leftovers reconciliation tagged for cleanup, per replica. The
/// deferred-rmdir pass unlinks the ones under a directory before retrying
/// its removal.
#[derive(Debug, Default)]
pub struct IgnoredFiles {
    pub local: Vec<String>,
    pub remote: Vec<String>,
}

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;
const XFER_BUF_SIZE: usize = 64 * 1024;

/// Executes a reconciliation plan against both replicas.
///
/// The driver walks each tree three times: renames first (so later entries
/// resolve through the adjusted paths), then files, then directories.
/// Files go before directories because writing into a directory changes its
/// mtime and would clobber a just-applied directory mtime. Directory
/// removals that fail with not-empty are deferred to a final cleanup pass
/// ordered longest-path-first.
pub struct Propagator {
    vio: Vio,
    journal: ProgressJournal,
    local_caps: ReplicaCapabilities,
    remote_caps: ReplicaCapabilities,
    config: PropagateConfig,
    progress_cb: Option<ProgressCallback>,
    cancel: CancellationToken,
    renames: RenameTable,
    overall: OverallProgress,
    status: StatusCode,
    error_string: Option<String>,
}

impl Propagator {
    pub fn new(vio: Vio, journal: ProgressJournal) -> Self {
        Self {
            vio,
            journal,
            local_caps: ReplicaCapabilities::local_fs(),
            remote_caps: ReplicaCapabilities::dav(),
            config: PropagateConfig::default(),
            progress_cb: None,
            cancel: CancellationToken::new(),
            renames: RenameTable::new(),
            overall: OverallProgress::default(),
            status: StatusCode::Ok,
            error_string: None,
        }
    }

    pub fn with_caps(mut self, local: ReplicaCapabilities, remote: ReplicaCapabilities) -> Self {
        self.local_caps = local;
        self.remote_caps = remote;
        self
    }

    pub fn with_config(mut self, config: PropagateConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress_cb = Some(callback);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Status of the last failure observed, `Ok` for a clean run.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn error_string(&self) -> Option<&str> {
        self.error_string.as_deref()
    }

    pub fn overall(&self) -> OverallProgress {
        self.overall
    }

    /// Propagate both trees: local entries first (pushes toward the remote
    /// replica), then remote entries (pulls toward the local one).
    pub async fn run(
        &mut self,
        trees: &mut SyncTrees,
        ignored: &IgnoredFiles,
    ) -> Result<(), PropagateError> {
        self.init_progress(trees);
        self.propagate_side(Side::Local, trees, &ignored.local).await?;
        self.propagate_side(Side::Remote, trees, &ignored.remote).await?;
        self.finalize_progress();
        Ok(())
    }

    /// Walk one replica's tree and apply every entry.
    pub async fn propagate_side(
        &mut self,
        side: Side,
        trees: &mut SyncTrees,
        ignored: &[String],
    ) -> Result<(), PropagateError> {
        let order = trees.tree(side).phashes();

        for &phash in &order {
            self.check_abort()?;
            let Some(entry) = trees.tree(side).get(phash) else {
                continue;
            };
            if entry.pending == Pending::Rename && entry.applied.is_none() {
                self.rename_entry(side, phash, trees).await?;
            }
        }

        for &phash in &order {
            self.check_abort()?;
            let (kind, pending, applied) = match trees.tree(side).get(phash) {
                Some(entry) => (entry.kind, entry.pending, entry.applied),
                None => continue,
            };
            if kind != EntryKind::File || applied.is_some() {
                continue;
            }
            match pending {
                Pending::New | Pending::Sync => {
                    self.push_entry(side, phash, trees).await?;
                }
                Pending::Remove => {
                    self.remove_file(side, phash, trees).await?;
                }
                Pending::Conflict => {
                    self.conflict_file(side, phash, trees).await?;
                }
                Pending::Rename => {}
            }
        }

        let mut deferred: Vec<u64> = Vec::new();
        for &phash in &order {
            self.check_abort()?;
            let (kind, pending, applied) = match trees.tree(side).get(phash) {
                Some(entry) => (entry.kind, entry.pending, entry.applied),
                None => continue,
            };
            if kind != EntryKind::Directory || applied.is_some() {
                continue;
            }
            match pending {
                Pending::New => {
                    self.apply_dir(side, phash, trees, true).await?;
                }
                Pending::Sync | Pending::Conflict => {
                    self.apply_dir(side, phash, trees, false).await?;
                }
                Pending::Remove => {
                    self.remove_dir(side, phash, trees, &mut deferred).await?;
                }
                Pending::Rename => {}
            }
        }

        self.cleanup_pass(side, trees, deferred, ignored).await
    }

    fn check_abort(&mut self) -> Result<(), PropagateError> {
        if self.cancel.is_cancelled() {
            eprintln!("[driftsync] propagation aborted");
            self.status = StatusCode::Aborted;
            return Err(PropagateError::Aborted);
        }
        Ok(())
    }

    fn caps(&self, side: Side) -> &ReplicaCapabilities {
        match side {
            Side::Local => &self.local_caps,
            Side::Remote => &self.remote_caps,
        }
    }

    /// Count the files to transmit in both replicas and announce the run.
    fn init_progress(&mut self, trees: &SyncTrees) {
        if self.progress_cb.is_none() {
            return;
        }
        for entry in trees.remote.iter().chain(trees.local.iter()) {
            if entry.kind == EntryKind::File
                && matches!(
                    entry.pending,
                    Pending::New | Pending::Sync | Pending::Conflict
                )
            {
                self.overall.file_count += 1;
                self.overall.byte_sum += entry.size;
            }
        }
        self.notify(ProgressKind::StartSyncSequence, None, 0, 0);
    }

    fn finalize_progress(&mut self) {
        self.notify(ProgressKind::FinishedSyncSequence, None, 0, 0);
    }

    fn notify(&self, kind: ProgressKind, path: Option<&str>, curr_bytes: i64, file_size: i64) {
        if let Some(callback) = &self.progress_cb {
            callback(&ProgressEvent {
                kind,
                path: path.map(str::to_string),
                curr_bytes,
                file_size,
                overall_bytes: self.overall.byte_current,
                overall_size: self.overall.byte_sum,
                file_no: self.overall.current_file_no,
                file_count: self.overall.file_count,
            });
        }
    }

    /// Record a per-entry failure: mark the entry and its ancestors, bump
    /// the journal's error counter, persist the resume record.
    async fn record_error(
        &mut self,
        trees: &mut SyncTrees,
        entry: &mut Entry,
        message: &str,
        record: Option<ResumeRecord>,
    ) -> Result<(), PropagateError> {
        entry.set_error(message);
        trees.mark_parent_error(&entry.path);
        let mut record = record.unwrap_or_else(|| {
            ResumeRecord::fresh(entry.phash, entry.modtime, entry.fingerprint.clone())
        });
        record.error = record.error.saturating_add(1);
        record.error_string = entry.error_string.clone();
        self.journal.put(&record).await?;
        Ok(())
    }

    /// Journal record for an entry, honoring the blacklist threshold.
    /// Returns the record plus whether the entry must be skipped.
    async fn preflight(
        &mut self,
        entry: &Entry,
    ) -> Result<(Option<ResumeRecord>, bool), PropagateError> {
        let record = self
            .journal
            .get(entry.phash, entry.modtime, entry.fingerprint.as_deref())
            .await?;
        let skip = match (self.config.blacklist_threshold, &record) {
            (Some(limit), Some(record)) if record.error > limit => {
                eprintln!(
                    "[driftsync] file: {}, skipped after {} errors: {}",
                    entry.path,
                    record.error,
                    record.error_string.as_deref().unwrap_or("unknown error")
                );
                true
            }
            _ => false,
        };
        Ok((record, skip))
    }

    async fn blacklist_skip(
        &mut self,
        trees: &mut SyncTrees,
        side: Side,
        mut entry: Entry,
        record: Option<ResumeRecord>,
    ) -> Result<OpStatus, PropagateError> {
        let message = record
            .as_ref()
            .and_then(|record| record.error_string.clone())
            .unwrap_or_else(|| "too many failed attempts".to_string());
        self.record_error(trees, &mut entry, &message, record).await?;
        trees.tree_mut(side).replace(entry);
        Ok(OpStatus::Soft)
    }

    /// On a failed removal, refresh what the statedb merger will record so
    /// the removal is retried next sync.
    async fn remove_error(&self, side: Side, entry: &mut Entry) {
        entry.applied = Some(Applied::None);
        if side == Side::Local {
            if let Ok(stat) = self.vio.stat(Side::Local, &entry.path).await {
                entry.inode = stat.inode;
                entry.modtime = stat.mtime;
            }
            entry.fingerprint = None;
        }
    }

    /// Deferred directory removals, longest path first, with ignored
    /// leftovers under each directory unlinked before the retry.
    async fn cleanup_pass(
        &mut self,
        side: Side,
        trees: &mut SyncTrees,
        deferred: Vec<u64>,
        ignored: &[String],
    ) -> Result<(), PropagateError> {
        if deferred.is_empty() {
            return Ok(());
        }
        let mut items: Vec<(String, u64)> = deferred
            .into_iter()
            .filter_map(|phash| {
                trees
                    .tree(side)
                    .get(phash)
                    .map(|entry| (entry.path.clone(), phash))
            })
            .collect();
        items.sort();

        for (path, phash) in items.into_iter().rev() {
            self.check_abort()?;
            let prefix = format!("{path}/");
            for leftover in ignored {
                if !leftover.starts_with(prefix.as_str()) {
                    continue;
                }
                eprintln!(
                    "[driftsync] removing ignored file {}",
                    self.vio.display(side, leftover)
                );
                self.vio
                    .unlink(side, leftover)
                    .await
                    .map_err(PropagateError::Fatal)?;
            }

            let Some(mut entry) = trees.tree(side).get(phash).cloned() else {
                continue;
            };
            match self.vio.rmdir(side, &entry.path).await {
                Ok(()) => {
                    entry.applied = Some(Applied::Deleted);
                    eprintln!(
                        "[driftsync] cleanup dir: {}",
                        self.vio.display(side, &entry.path)
                    );
                }
                Err(err) => {
                    eprintln!(
                        "[driftsync] dir: {}, command: rmdir, error: {}",
                        self.vio.display(side, &entry.path),
                        err
                    );
                    self.remove_error(side, &mut entry).await;
                }
            }
            trees.tree_mut(side).replace(entry);
        }
        Ok(())
    }
}

include!("propagate_files.rs");
include!("propagate_ops.rs");

#[cfg(test)]
#[path = "propagate_tests/mod.rs"]
mod tests;
