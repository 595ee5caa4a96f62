//! Preprocessing counters layered over the scan metrics: database outcomes
//! (new / updated) and task errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::db::Applied;
use crate::scan::ScanMetrics;

pub struct PreprocessMetrics {
    scan: Arc<ScanMetrics>,
    preprocessed: AtomicUsize,
    new_photos: AtomicUsize,
    updated_photos: AtomicUsize,
    errors: AtomicUsize,
}

/// End-of-run totals, also returned to the caller for tests and the exit
/// summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreprocessSummary {
    pub new_photos: usize,
    pub updated_photos: usize,
    pub errors: usize,
    pub invalid_files: usize,
    pub total_scanned: usize,
}

impl PreprocessMetrics {
    pub fn new(scan: Arc<ScanMetrics>) -> Self {
        PreprocessMetrics {
            scan,
            preprocessed: AtomicUsize::new(0),
            new_photos: AtomicUsize::new(0),
            updated_photos: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        }
    }

    pub fn scan(&self) -> &ScanMetrics {
        &self.scan
    }

    pub fn preprocessed_photo(&self, applied: Applied) {
        self.preprocessed.fetch_add(1, Ordering::SeqCst);
        match applied {
            Applied::New => {
                self.new_photos.fetch_add(1, Ordering::SeqCst);
            }
            Applied::Updated => {
                self.updated_photos.fetch_add(1, Ordering::SeqCst);
            }
            Applied::Unchanged => {}
        }
    }

    /// Record an invalid photo file discovered during extraction.
    pub fn invalid_photo_file(&self, rel_path: &str) {
        self.scan.invalid_photo_file(rel_path);
    }

    /// Count a failed task. The pool already logs the error itself.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn summary(&self) -> PreprocessSummary {
        PreprocessSummary {
            new_photos: self.new_photos.load(Ordering::SeqCst),
            updated_photos: self.updated_photos.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            invalid_files: self.scan.invalid_files(),
            total_scanned: self.scan.total_photos(),
        }
    }

    /// One summary line at the end of a successful run.
    pub fn log_preprocessing_summary(&self) {
        let s = self.summary();
        let changes = s.new_photos + s.updated_photos;
        if changes == 0 {
            tracing::info!(
                "no changes detected: {} error{} while preprocessing {} photo{}",
                s.errors,
                if s.errors == 1 { "" } else { "s" },
                s.total_scanned,
                if s.total_scanned == 1 { "" } else { "s" },
            );
        } else {
            tracing::info!(
                "saved {changes} change{} to database: {} new photo{} and {} updated \
                 record{} with {} error{}; scanned a total of {} photo{}",
                if changes == 1 { "" } else { "s" },
                s.new_photos,
                if s.new_photos == 1 { "" } else { "s" },
                s.updated_photos,
                if s.updated_photos == 1 { "" } else { "s" },
                s.errors,
                if s.errors == 1 { "" } else { "s" },
                s.total_scanned,
                if s.total_scanned == 1 { "" } else { "s" },
            );
        }
    }

    /// Lock-light counter snapshot for fatal-error diagnostics.
    pub fn debug_info(&self) -> String {
        format!(
            "scanned {}: {} preprocessed with {} new, {} to update, and {} error(s)",
            self.scan.debug_info(),
            self.preprocessed.load(Ordering::SeqCst),
            self.new_photos.load(Ordering::SeqCst),
            self.updated_photos.load(Ordering::SeqCst),
            self.errors.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = PreprocessMetrics::new(Arc::new(ScanMetrics::new()));
        m.preprocessed_photo(Applied::New);
        m.preprocessed_photo(Applied::New);
        m.preprocessed_photo(Applied::Updated);
        m.preprocessed_photo(Applied::Unchanged);
        m.record_error();

        let s = m.summary();
        assert_eq!(s.new_photos, 2);
        assert_eq!(s.updated_photos, 1);
        assert_eq!(s.errors, 1);
    }

    #[test]
    fn test_invalid_files_flow_to_scan_metrics() {
        let scan = Arc::new(ScanMetrics::new());
        let m = PreprocessMetrics::new(scan.clone());
        m.invalid_photo_file("2025-01-01/a/bad.bin");
        assert_eq!(scan.invalid_files(), 1);
        assert_eq!(m.summary().invalid_files, 1);
    }
}
