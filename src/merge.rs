//! Merge engine: applies a decoded snapshot to the catalog.
//!
//! The whole snapshot is written inside one transaction. Each record is
//! inserted with `INSERT OR IGNORE`, so the catalog's UNIQUE constraint is
//! the only identity check: rows that already exist are skipped and
//! counted, never overwritten. A storage failure rolls the entire batch
//! back. Concurrent merges queue on the catalog write lock and commit one
//! after another.

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::codec;
use crate::error::IngestResult;
use crate::models::Record;
use crate::progress::{MergeProgressEvent, MergeProgressReporter};
use crate::store::{self, Catalog};
use crate::transfer::StagedSnapshot;

/// Outcome of one merge batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    /// Records attempted.
    pub processed: u64,
    /// New rows written.
    pub inserted: u64,
    /// Records whose identity already existed.
    pub skipped: u64,
    /// Records missing required fields; never written.
    pub rejected: u64,
}

pub async fn merge(
    catalog: &Catalog,
    snapshot: &str,
    records: &[Record],
    progress: &dyn MergeProgressReporter,
    progress_every: u64,
) -> IngestResult<MergeSummary> {
    let total = records.len() as u64;
    let every = progress_every.max(1);
    let mut summary = MergeSummary::default();

    let mut tx = catalog.begin_write().await?;

    for record in records {
        summary.processed += 1;

        if let Err(reason) = record.validate() {
            tracing::debug!(%snapshot, path = %record.path, %reason, "rejecting record");
            summary.rejected += 1;
        } else if store::insert_or_ignore(tx.connection(), record).await? {
            summary.inserted += 1;
        } else {
            summary.skipped += 1;
        }

        if summary.processed % every == 0 {
            progress.report(MergeProgressEvent::Merging {
                snapshot: snapshot.to_string(),
                n: summary.processed,
                total,
            });
        }
    }

    tx.commit().await?;

    progress.report(MergeProgressEvent::Committed {
        snapshot: snapshot.to_string(),
        inserted: summary.inserted,
        skipped: summary.skipped,
    });

    Ok(summary)
}

/// Decodes and merges a staged snapshot.
///
/// The staging file is deleted only after a successful commit; on decode
/// or merge failure it stays in place for diagnosis.
pub async fn ingest_snapshot(
    catalog: &Catalog,
    staged: &StagedSnapshot,
    progress: &dyn MergeProgressReporter,
    progress_every: u64,
) -> IngestResult<MergeSummary> {
    let outcome = async {
        let records = codec::decode(&staged.path).await?;
        merge(catalog, &staged.name, &records, progress, progress_every).await
    }
    .await;

    match outcome {
        Ok(summary) => {
            remove_staged(&staged.path).await;
            Ok(summary)
        }
        Err(e) => {
            if e.retains_artifact() {
                tracing::warn!(
                    snapshot = %staged.name,
                    path = %staged.path.display(),
                    error = %e,
                    "snapshot not merged; staging file kept"
                );
            }
            Err(e)
        }
    }
}

/// Removes a staging file and any journal sidecars SQLite left next to it
/// while the snapshot was read.
async fn remove_staged(path: &Path) {
    let mut targets = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut sidecar = path.as_os_str().to_os_string();
        sidecar.push(suffix);
        targets.push(PathBuf::from(sidecar));
    }

    for target in targets {
        if let Err(e) = tokio::fs::remove_file(&target).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %target.display(), error = %e, "could not remove staging file");
            }
        }
    }
}

/// Decodes and merges a local snapshot file without touching it afterwards.
pub async fn import_file(
    catalog: &Catalog,
    path: &Path,
    progress: &dyn MergeProgressReporter,
    progress_every: u64,
) -> IngestResult<MergeSummary> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let records = codec::decode(path).await?;
    if records.is_empty() {
        tracing::info!(snapshot = %name, "snapshot contains no records");
    }
    merge(catalog, &name, &records, progress, progress_every).await
}
