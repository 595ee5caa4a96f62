pub mod metrics;
pub mod scanner;

pub use metrics::ScanMetrics;
pub use scanner::{list_dates, list_dates_ordered, list_groups, list_photos_in_group, scan_photos};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;

use crate::conf::ConfigManager;

/// Scan for photos on a dedicated thread, pushing each path into `output`.
///
/// The bounded channel provides back-pressure; dropping the sender when the
/// scan finishes is the end-of-stream signal for the consumer. The cancel
/// flag is polled before each push so a failing pipeline can stop the
/// scanner promptly.
pub fn enqueue_thread(
    cfg: Arc<ConfigManager>,
    metrics: Arc<ScanMetrics>,
    output: Sender<PathBuf>,
    cancel: Arc<AtomicBool>,
    log_summary: bool,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("scanner".to_string())
        .spawn(move || {
            for photo in scan_photos(&cfg, &metrics, false, false) {
                if cancel.load(Ordering::SeqCst) {
                    tracing::debug!("scanner cancelled");
                    return;
                }
                // A closed receiver means the consumer went away
                if output.send(photo).is_err() {
                    return;
                }
            }
            if log_summary {
                let sample = cfg.root().sample;
                metrics.log_summary(sample.is_active(), sample.is_random(), false);
            }
        })
        .expect("failed to spawn scanner thread")
}

/// Run the standalone `scan` mode: walk the whole project (validating each
/// file against the RAW decoder) and log summary statistics.
pub fn run_scanner(cfg: &ConfigManager) -> anyhow::Result<()> {
    let (project, sample, database) = {
        let root = cfg.root();
        (root.project().clone(), root.sample, root.database.clone())
    };
    tracing::info!(
        "scanning timelapse project \"{}\" (this may take some time)",
        project.display()
    );

    if let Some(size) = sample.size() {
        tracing::info!(
            "sampling {size}{} photo{}",
            if sample.is_random() { " random" } else { "" },
            if size == 1 { "" } else { "s" }
        );
    }

    let metrics = ScanMetrics::new();
    let iter = scan_photos(cfg, &metrics, true, true);

    // With a small sample, name each photo; otherwise just exhaust the
    // iterator for its metrics side effects
    if matches!(sample.size(), Some(n) if n <= 10) {
        for photo in iter {
            tracing::info!("found photo \"{}\"", photo.display());
        }
    } else {
        iter.for_each(drop);
    }

    metrics.log_summary(sample.is_active(), sample.is_random(), true);

    // When a database already exists, report how much of the project it has
    // indexed so far
    if database.is_file() {
        let conn = crate::db::open_connection(&database)?;
        let indexed = crate::db::scanner::count_photos(&conn)?;
        tracing::info!(
            "database \"{}\" currently holds {indexed} photo record{}",
            database.display(),
            if indexed == 1 { "" } else { "s" }
        );
    }
    Ok(())
}
