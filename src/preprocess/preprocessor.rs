//! The preprocessing orchestrator: drives the scanner thread, the photo
//! worker pool, and the single-writer database applier from the main
//! thread.
//!
//! Dataflow: scanner thread -> scan queue -> main thread -> worker pool
//! (N threads, each owning an EXIF reader) -> metadata queue -> main thread
//! -> store adapter. All queues are bounded so memory stays flat regardless
//! of project size.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use rusqlite::Connection;

use crate::conf::{ConfigManager, Sample};
use crate::db::{self, open_connection, run_migrations};
use crate::pool::{WorkerPool, WorkerPoolOptions};
use crate::preprocess::extractor::{self, close_thread_exif_reader};
use crate::preprocess::metadata::PhotoMetadata;
use crate::preprocess::metrics::{PreprocessMetrics, PreprocessSummary};
use crate::preprocess::ExtractError;
use crate::scan::{enqueue_thread, ScanMetrics};

/// Caps all three pipeline queues (scan, task, metadata). Keeps memory
/// bounded when a slow stage would otherwise let queues fill without limit.
const QUEUE_MAX_SIZE: usize = 100;

/// Poll interval for the metadata queue. Short enough that the main thread
/// can notice cancellation and stalls promptly.
const METADATA_POLL: Duration = Duration::from_millis(100);

/// Ticks of [`METADATA_POLL`] after which a silent stall is fatal.
const STALL_FATAL_TICKS: u64 = 3000;

/// What a pool worker hands back to the main thread for one photo.
pub enum PreprocessResult {
    Loaded(Box<PhotoMetadata>),
    /// The RAW decoder rejected the file; the main thread only needs to
    /// forget the pending entry.
    Invalid { rel_path: String },
}

/// Signature of the per-photo extractor. Swappable so tests can drive the
/// whole pipeline without real RAW files.
pub type ExtractFn = dyn Fn(&Path) -> Result<PhotoMetadata, ExtractError> + Send + Sync;

pub struct Preprocessor {
    config: Arc<ConfigManager>,
    cancel: Arc<AtomicBool>,
    extractor: Arc<ExtractFn>,
}

impl Preprocessor {
    pub fn new(config: Arc<ConfigManager>) -> Self {
        Self::with_extractor(config, Arc::new(extractor::load_photo_metadata))
    }

    pub fn with_extractor(config: Arc<ConfigManager>, extractor: Arc<ExtractFn>) -> Self {
        Preprocessor {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            extractor,
        }
    }

    /// Shared cancellation flag. Setting it makes the scanner and the main
    /// loop wind down cleanly; used for interrupt handling.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run the complete preprocessing step: load metadata for every photo
    /// and reconcile it with the database.
    pub fn run(&self) -> anyhow::Result<PreprocessSummary> {
        let (project, database) = {
            let root = self.config.root();
            (root.project().clone(), root.database.clone())
        };
        tracing::info!(
            "preprocessing \"{}\" (this may take a while)",
            project.display()
        );

        let mut conn = open_connection(&database)?;
        run_migrations(&conn)?;

        match self.preprocess_all(&mut conn) {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.cancel.store(true, Ordering::SeqCst);
                tracing::error!(
                    "failed to preprocess photos in \"{}\": {e:#}",
                    project.display()
                );
                Err(e)
            }
        }
    }

    fn preprocess_all(&self, conn: &mut Connection) -> anyhow::Result<PreprocessSummary> {
        let (configured_workers, error_threshold, sample) = {
            let root = self.config.root();
            (root.workers(), root.max_processing_errors(), root.sample)
        };
        let total_workers = determine_worker_count(configured_workers, sample);

        let scan_metrics = Arc::new(ScanMetrics::new());
        let metrics = Arc::new(PreprocessMetrics::new(Arc::clone(&scan_metrics)));

        let (scan_tx, scan_rx) = crossbeam_channel::bounded::<PathBuf>(QUEUE_MAX_SIZE);
        let (meta_tx, meta_rx) = crossbeam_channel::bounded::<PreprocessResult>(QUEUE_MAX_SIZE);

        // Invalid files are swallowed here rather than counted as errors:
        // the handler updates the invalid-file metric and tells the main
        // thread to drop its pending entry
        let handler_metrics = Arc::clone(&metrics);
        let invalid_tx = meta_tx.clone();
        let error_handler: crate::pool::ErrorHandler = Box::new(move |error, rel_path| {
            if matches!(
                error.downcast_ref::<ExtractError>(),
                Some(ExtractError::InvalidFile { .. })
            ) {
                handler_metrics.invalid_photo_file(rel_path);
                let _ = invalid_tx.send(PreprocessResult::Invalid {
                    rel_path: rel_path.to_string(),
                });
                return true;
            }
            handler_metrics.record_error();
            false
        });

        let pool = WorkerPool::new(WorkerPoolOptions {
            max_workers: total_workers - 1,
            error_threshold,
            task_queue_size: QUEUE_MAX_SIZE,
            name_prefix: "prp-wkr-".to_string(),
            results: Some(meta_tx),
            error_handler: Some(error_handler),
            on_close_hook: Some(Box::new(close_thread_exif_reader)),
        })?;

        let scanner = enqueue_thread(
            Arc::clone(&self.config),
            scan_metrics,
            scan_tx,
            Arc::clone(&self.cancel),
            true,
        );
        pool.start()?;

        let result = self.drive(conn, &pool, &scan_rx, &meta_rx, metrics.as_ref());

        if result.is_err() {
            self.cancel.store(true, Ordering::SeqCst);
        }
        // Disconnecting the receiver unblocks any worker stuck sending into
        // a full metadata queue
        drop(meta_rx);
        if result.is_err() {
            // Discard queued work and wait out the in-flight tasks so
            // nothing races the teardown
            let _ = pool.close(true);
            let _ = pool.join();
        }
        drop(scan_rx);
        let _ = scanner.join();

        match result {
            Ok(()) => {
                metrics.log_preprocessing_summary();
                Ok(metrics.summary())
            }
            Err(e) => {
                tracing::warn!("preprocessing stopped; {}", metrics.debug_info());
                tracing::warn!(
                    "worker pool {} with {} recorded error(s)",
                    pool.progress_str(),
                    pool.error_count()
                );
                Err(e)
            }
        }
    }

    /// The main-thread loop pair. Loop A alternates between feeding the
    /// pool from the scanner and applying finished metadata; loop B drains
    /// the metadata queue after the scanner is exhausted. The single commit
    /// happens only after loop B completes, so a failed run rolls back.
    fn drive(
        &self,
        conn: &mut Connection,
        pool: &WorkerPool<PreprocessResult>,
        scan_rx: &Receiver<PathBuf>,
        meta_rx: &Receiver<PreprocessResult>,
        metrics: &PreprocessMetrics,
    ) -> anyhow::Result<()> {
        let error_threshold = self.config.root().max_processing_errors();
        let tx = conn.transaction()?;
        let mut pending: HashMap<String, PathBuf> = HashMap::new();
        let mut timeouts = 0u64;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                anyhow::bail!("preprocessing interrupted");
            }
            match scan_rx.try_recv() {
                Ok(path) => self.submit_photo(pool, path, &mut pending)?,
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break,
            }
            apply_metadata(
                &tx,
                meta_rx,
                pool,
                &mut pending,
                metrics,
                &mut timeouts,
                error_threshold,
            )?;
        }

        tracing::debug!("finished scanning for photos; preprocessing any remaining photos in queue");
        pool.close(false)?;

        while apply_metadata(
            &tx,
            meta_rx,
            pool,
            &mut pending,
            metrics,
            &mut timeouts,
            error_threshold,
        )? {
            if self.cancel.load(Ordering::SeqCst) {
                anyhow::bail!("preprocessing interrupted");
            }
        }

        // Surface a cancellation (error budget overflow or a worker panic)
        // before committing anything
        pool.join()?;

        tracing::debug!("committing db changes");
        tx.commit()?;
        Ok(())
    }

    fn submit_photo(
        &self,
        pool: &WorkerPool<PreprocessResult>,
        path: PathBuf,
        pending: &mut HashMap<String, PathBuf>,
    ) -> anyhow::Result<()> {
        let (date, group, file_name) = extractor::identity_from_path(&path)?;
        let rel_path = format!("{date}/{group}/{file_name}");
        tracing::debug!("sending \"{rel_path}\" preprocessing task to worker pool");

        pending.insert(rel_path.clone(), path.clone());
        let extract = Arc::clone(&self.extractor);
        pool.submit(
            move || {
                let metadata = extract(&path)?;
                Ok(PreprocessResult::Loaded(Box::new(metadata)))
            },
            rel_path,
        )?;
        Ok(())
    }
}

/// Pull one finished result from the metadata queue and apply it to the
/// database (statements execute now; the commit comes later). Returns false
/// once the pool is finished and the queue fully drained.
///
/// Repeated empty polls feed the stall ladder: warnings at 10 s and 30 s,
/// queue/pool diagnostics each minute, and a fatal error at 5 minutes
/// naming the outstanding photos.
#[allow(clippy::too_many_arguments)]
fn apply_metadata(
    conn: &Connection,
    meta_rx: &Receiver<PreprocessResult>,
    pool: &WorkerPool<PreprocessResult>,
    pending: &mut HashMap<String, PathBuf>,
    metrics: &PreprocessMetrics,
    timeouts: &mut u64,
    error_threshold: usize,
) -> anyhow::Result<bool> {
    let result = match meta_rx.recv_timeout(METADATA_POLL) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
            // Done only when the workers are finished AND the queue is
            // drained; checking the queue second avoids racing a result
            // that landed right after the timeout
            if pool.is_finished() && meta_rx.is_empty() {
                return Ok(false);
            }
            *timeouts += 1;
            let t = *timeouts;
            let elapsed = t as f64 * METADATA_POLL.as_secs_f64();
            if t == 100 || t == 300 {
                tracing::warn!(
                    "preprocessor main thread stalled {elapsed:.1} seconds ({t} iterations) \
                     while waiting for the next photo from the metadata queue"
                );
            } else if t == STALL_FATAL_TICKS {
                let mut outstanding: Vec<&String> = pending.keys().collect();
                outstanding.sort();
                outstanding.truncate(10);
                anyhow::bail!(
                    "forcibly terminating after preprocessor main thread stalled for \
                     {elapsed:.1} seconds while waiting on the metadata queue; \
                     {} enqueued photo(s) remain: {}{}",
                    pending.len(),
                    outstanding
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                    if pending.len() > 10 { ", ..." } else { "" },
                );
            } else if t >= 600 && t % 600 == 0 {
                let queued = meta_rx.len();
                tracing::warn!(
                    "preprocessor main thread remains stalled after {elapsed:.1} seconds; \
                     worker pool {}; metadata queue {}",
                    pool.progress_str(),
                    if queued == 0 {
                        "empty".to_string()
                    } else {
                        format!("contains ~{queued} record(s)")
                    }
                );
            }
            return Ok(true);
        }
    };

    *timeouts = 0;

    match result {
        PreprocessResult::Invalid { rel_path } => {
            if pending.remove(&rel_path).is_none() {
                tracing::warn!(
                    "unexpected: no pending photo record matching \"{rel_path}\" to remove"
                );
            }
        }
        PreprocessResult::Loaded(metadata) => {
            let rel_path = metadata.rel_path();
            pending.remove(&rel_path);
            tracing::debug!("applying metadata to db record for \"{rel_path}\"");
            match db::upsert_photo(conn, &metadata) {
                Ok(applied) => metrics.preprocessed_photo(applied),
                Err(e) => {
                    // Store failures burn the same error budget as
                    // extraction failures
                    tracing::error!("error writing database record for \"{rel_path}\": {e}");
                    metrics.record_error();
                    if metrics.summary().errors > error_threshold {
                        return Err(anyhow::Error::new(e).context(format!(
                            "too many processing errors: exceeded threshold of {error_threshold}"
                        )));
                    }
                }
            }
        }
    }
    Ok(true)
}

/// Total thread count for the pipeline, per the configured worker count `W`
/// and sample size `S`: at least 2 (one thread is reserved for the
/// scanner); no more than `S + 1` when sampling needs fewer; otherwise `W`.
/// The pool itself runs one less than the returned total.
fn determine_worker_count(configured: usize, sample: Sample) -> usize {
    let total = if configured < 2 {
        2
    } else {
        match sample.size() {
            Some(s) if s + 1 < configured => s + 1,
            _ => configured,
        }
    };

    if let Some(s) = sample.size() {
        let extra = configured.saturating_sub(total);
        if extra > 0 {
            tracing::info!(
                "preprocessing a{} sample of {s} photo{} with {total} workers \
                 (one reserved for file scanner; {extra} extra worker{} not used)",
                if sample.is_random() { " random" } else { "" },
                if s == 1 { "" } else { "s" },
                if extra == 1 { "" } else { "s" },
            );
        } else {
            tracing::info!(
                "preprocessing a{} sample of {s} photo{} with {total} workers",
                if sample.is_random() { " random" } else { "" },
                if s == 1 { "" } else { "s" },
            );
        }
    } else if configured < 2 {
        tracing::info!(
            "preprocessing photos with {total} workers (minimum 2 workers required for \
             file scanning and metadata extraction)"
        );
    } else {
        tracing::info!("preprocessing all photos with {total} workers");
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count_minimum_two() {
        assert_eq!(determine_worker_count(1, Sample::Off), 2);
        assert_eq!(determine_worker_count(0, Sample::Off), 2);
    }

    #[test]
    fn test_worker_count_capped_by_sample() {
        // Sample of 3 photos needs at most 4 threads (3 workers + scanner)
        assert_eq!(determine_worker_count(20, Sample::Deterministic(3)), 4);
        assert_eq!(determine_worker_count(20, Sample::Random(1)), 2);
    }

    #[test]
    fn test_worker_count_unchanged_when_sample_is_large() {
        assert_eq!(determine_worker_count(4, Sample::Deterministic(100)), 4);
        assert_eq!(determine_worker_count(6, Sample::Off), 6);
    }
}
