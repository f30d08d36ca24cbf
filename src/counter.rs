use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future;
use indicatif::MultiProgress;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::membership::MembershipSet;
use crate::planner;
use crate::progress_reporter::ProgressReporter;
use crate::scanner::{self, RangeStats, ScanError};
use crate::shared_types::{ByteCount, ChunkRange};

#[derive(Error, Debug)]
pub(crate) enum CountError {
    #[error("failed to stat {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to split {path} into chunks: {source}")]
    Plan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{failed} of {total} chunks failed; the reported count is a lower bound")]
    Incomplete { failed: usize, total: usize },
}

#[derive(Debug, Clone)]
pub(crate) struct CountPreferences {
    pub(crate) path: PathBuf,
    pub(crate) workers: u32,
    pub(crate) block_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CountReport {
    pub(crate) unique: u64,
    pub(crate) workers: u32,
    pub(crate) lines: u64,
    pub(crate) bytes: ByteCount,
    pub(crate) elapsed: Duration,
    pub(crate) failed_chunks: usize,
}

impl CountReport {
    /// Fails if any chunk could not be scanned completely.
    pub(crate) fn ensure_complete(&self) -> Result<(), CountError> {
        if self.failed_chunks == 0 {
            Ok(())
        } else {
            Err(CountError::Incomplete {
                failed: self.failed_chunks,
                total: self.workers as usize,
            })
        }
    }
}

/// Counts the distinct addresses in `specs.path`.
///
/// Every chunk is scanned by its own task; the count is only read after all
/// of them have finished. A chunk that fails is logged and recorded in
/// [`CountReport::failed_chunks`] without stopping the others.
pub(crate) async fn start_count(
    specs: CountPreferences,
    multi: MultiProgress,
) -> Result<CountReport, CountError> {
    let started = Instant::now();

    let file_size = tokio::fs::metadata(&specs.path)
        .await
        .map_err(|source| CountError::Metadata {
            path: specs.path.clone(),
            source,
        })?
        .len();
    debug!("File size: {}", file_size);

    let workers = if specs.workers == 0 {
        warn!("worker count of 0 requested, scanning with a single worker");
        1
    } else {
        specs.workers
    };

    let chunks = planner::plan_file(&specs.path, file_size, workers)
        .await
        .map_err(|source| CountError::Plan {
            path: specs.path.clone(),
            source,
        })?;
    debug!("scanning with {workers} workers over {} chunks", chunks.len());

    let set = Arc::new(MembershipSet::new());
    let (s_progress, r_progress) = mpsc::channel::<ByteCount>(workers as usize * 4);
    let reporter = ProgressReporter::new(r_progress, file_size, multi).spawn();

    let totals = scan_chunks(&specs.path, &chunks, specs.block_size, &set, s_progress).await;
    if let Err(e) = reporter.await {
        debug!("progress reporter stopped early: {e}");
    }

    let unique = set.count();
    debug!("scanned {} lines, {} bytes", totals.lines, totals.bytes);
    Ok(CountReport {
        unique,
        workers,
        lines: totals.lines,
        bytes: totals.bytes,
        elapsed: started.elapsed(),
        failed_chunks: totals.failed_chunks,
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ScanTotals {
    lines: u64,
    bytes: ByteCount,
    failed_chunks: usize,
}

/// Scans every chunk on its own task and waits for all of them.
///
/// A failing chunk is logged and counted; it does not stop the others.
async fn scan_chunks(
    path: &Path,
    chunks: &[ChunkRange],
    block_size: usize,
    set: &Arc<MembershipSet>,
    s_progress: mpsc::Sender<ByteCount>,
) -> ScanTotals {
    let handles = chunks
        .iter()
        .map(|&range| {
            spawn_scan_worker(
                path.to_owned(),
                range,
                block_size,
                Arc::clone(set),
                s_progress.clone(),
            )
        })
        .collect::<Vec<_>>();
    drop(s_progress);

    let mut totals = ScanTotals::default();
    for (range, joined) in chunks.iter().zip(future::join_all(handles).await) {
        match joined {
            Ok(Ok(stats)) => {
                totals.lines += stats.lines;
                totals.bytes += stats.bytes;
            }
            Ok(Err(e)) => {
                error!("Error scanning bytes {}..{}: {}", range.start, range.end, e);
                totals.failed_chunks += 1;
            }
            Err(e) => {
                error!("Scan worker for bytes {}..{} died: {}", range.start, range.end, e);
                totals.failed_chunks += 1;
            }
        }
    }
    totals
}

fn spawn_scan_worker(
    path: PathBuf,
    range: ChunkRange,
    block_size: usize,
    set: Arc<MembershipSet>,
    s_progress: mpsc::Sender<ByteCount>,
) -> JoinHandle<Result<RangeStats, ScanError>> {
    tokio::spawn(async move {
        scanner::scan_range(&path, range, block_size, &set, Some(s_progress)).await
    })
}
