//! Progress counters and the running total-photo estimate used for ETA
//! reporting. One metrics instance covers one scan.
//!
//! The estimate assumes each date has roughly the same number of photos and
//! all groups within one date have roughly the same number of photos, but
//! makes no assumption across dates.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Update a running average with a new observation.
///
/// Early observations dominate: the weight applied to the prior follows
/// `w = 0.5 + 0.5 / (1 + e^(-9 (x - 0.5)))` where `x` is the fraction of
/// observations already folded into the prior, so by the final observation
/// nearly all weight stays on the prior. The very first observation replaces
/// the prior entirely (it was based on nothing).
pub fn update_estimate(prior: f64, n_total: usize, n_remaining: usize, observed: f64) -> f64 {
    let n_elapsed = n_total.saturating_sub(n_remaining);
    if n_elapsed <= 1 {
        return observed;
    }
    let x = (n_elapsed as f64 - 1.0) / n_total as f64;
    let prior_weight = 0.5 + 0.5 / (1.0 + (-9.0 * (x - 0.5)).exp());
    prior * prior_weight + observed * (1.0 - prior_weight)
}

#[derive(Debug)]
struct EstimateState {
    total_dates: Option<usize>,
    dates_remaining: usize,
    total_groups: usize,
    photos_in_group: usize,
    photos_in_date: usize,
    groups_in_date: Option<usize>,
    groups_remaining: usize,
    estimate: usize,
    avg_per_date: f64,
    avg_per_group: f64,
    est_total_groups: f64,
    est_group_ratio: f64,
    fixed_sample: bool,
}

/// Counters shared between the scanner thread (which advances them) and the
/// pool workers (which mark files invalid after the fact).
pub struct ScanMetrics {
    total_files: AtomicUsize,
    invalid_files: AtomicUsize,
    state: Mutex<EstimateState>,
}

/// Initial guess for photos per date, superseded as soon as the first group
/// finishes.
const INITIAL_AVG_PHOTOS_PER_DATE: f64 = 500.0;

impl Default for ScanMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanMetrics {
    pub fn new() -> Self {
        ScanMetrics {
            total_files: AtomicUsize::new(0),
            invalid_files: AtomicUsize::new(0),
            state: Mutex::new(EstimateState {
                total_dates: None,
                dates_remaining: 0,
                total_groups: 0,
                photos_in_group: 0,
                photos_in_date: 0,
                groups_in_date: None,
                groups_remaining: 0,
                estimate: 0,
                avg_per_date: INITIAL_AVG_PHOTOS_PER_DATE,
                avg_per_group: 0.0,
                est_total_groups: 0.0,
                est_group_ratio: 1.0,
                fixed_sample: false,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EstimateState> {
        self.state.lock().expect("scan metrics lock poisoned")
    }

    /// Total files touched so far, valid or not.
    pub fn total_files(&self) -> usize {
        self.total_files.load(Ordering::SeqCst)
    }

    /// Files that turned out not to be parseable photos.
    pub fn invalid_files(&self) -> usize {
        self.invalid_files.load(Ordering::SeqCst)
    }

    /// Files scanned so far minus those marked invalid.
    pub fn total_photos(&self) -> usize {
        self.total_files() - self.invalid_files()
    }

    pub fn total_estimate(&self) -> usize {
        self.state().estimate
    }

    /// Estimated photos still to come. Mostly useful with a fixed sample,
    /// where the estimate is exact.
    pub fn remaining_photos(&self) -> usize {
        self.state().estimate.saturating_sub(self.total_photos())
    }

    /// Mark a file as invalid after it was already yielded (the extractor
    /// discovered the decoder rejects it).
    pub fn invalid_photo_file(&self, rel_path: &str) {
        self.invalid_files.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("marked \"{rel_path}\" as an invalid photo file");
    }

    /// Called once when scanning begins, with the total date count and the
    /// sample size, if any.
    pub fn start(&self, dates: usize, sample_size: Option<usize>) {
        let mut s = self.state();
        s.total_dates = Some(dates);
        s.dates_remaining = dates;
        match sample_size {
            Some(size) => {
                s.fixed_sample = true;
                s.estimate = size;
            }
            None => {
                s.estimate = (s.avg_per_date * dates as f64) as usize;
            }
        }
    }

    /// Called per date. The group count may be unknown under a fixed-size
    /// sample, where no estimation happens.
    pub fn start_date(&self, date_str: &str, groups: Option<usize>) {
        tracing::debug!("scanning date \"{date_str}\"");
        let mut s = self.state();
        s.photos_in_date = 0;
        s.dates_remaining = s.dates_remaining.saturating_sub(1);
        match groups {
            Some(n) => {
                s.groups_in_date = Some(n);
                s.groups_remaining = n;
                s.total_groups += n;
            }
            None => {
                s.groups_in_date = None;
                s.groups_remaining = 0;
            }
        }
        if !s.fixed_sample {
            if let (Some(groups), Some(total_dates)) = (groups, s.total_dates) {
                if groups > 0 {
                    s.avg_per_group = s.avg_per_date / groups as f64;
                }
                let scanned_dates = total_dates - s.dates_remaining;
                if scanned_dates > 0 {
                    s.est_total_groups =
                        s.total_groups as f64 / scanned_dates as f64 * total_dates as f64;
                }
            }
        }
    }

    pub fn start_group(&self, group_str: &str) {
        tracing::debug!("scanning group \"{group_str}\"");
        let mut s = self.state();
        s.photos_in_group = 0;
        if s.groups_remaining > 0 {
            s.groups_remaining -= 1;
        }
        if s.groups_in_date.is_none() {
            s.total_groups += 1;
        }
        if !s.fixed_sample && s.est_total_groups > 0.0 {
            s.est_group_ratio =
                (s.total_groups - s.groups_remaining) as f64 / s.est_total_groups;
        }
    }

    /// Called per scanned photo. Returns true when a fixed-size sample just
    /// reached its target, meaning scanning should stop.
    pub fn next_photo(&self, invalid: bool) -> bool {
        self.total_files.fetch_add(1, Ordering::SeqCst);

        if invalid {
            self.invalid_files.fetch_add(1, Ordering::SeqCst);
            return false;
        }

        let total = self.total_photos();
        let mut s = self.state();
        s.photos_in_group += 1;

        if s.fixed_sample {
            return total >= s.estimate;
        }

        // Count already exceeds the estimate: assume ~10 more photos in this
        // group and recompute
        if total > s.estimate {
            recalculate_estimate(&mut s, self.total_files(), 10, false);
        }

        // Photo fraction outran the group fraction: the per-group average is
        // too low, inflate it by 25%
        if s.estimate > 0 && total as f64 / s.estimate as f64 > s.est_group_ratio {
            s.avg_per_group *= 1.25;
            recalculate_estimate(&mut s, self.total_files(), 0, false);
        }

        false
    }

    pub fn end_group(&self) {
        let total_files = self.total_files();
        let mut s = self.state();
        s.photos_in_date += s.photos_in_group;

        if s.fixed_sample {
            return;
        }
        let (Some(groups_in_date), Some(total_dates)) = (s.groups_in_date, s.total_dates) else {
            return;
        };

        s.avg_per_group = update_estimate(
            s.avg_per_group,
            groups_in_date,
            s.groups_remaining,
            s.photos_in_group as f64,
        );

        // The very first finished group replaces the arbitrary initial
        // estimate entirely
        if s.dates_remaining + 1 == total_dates && s.groups_remaining + 1 == groups_in_date {
            s.avg_per_group = s.photos_in_group as f64;
            s.avg_per_date = s.avg_per_group * groups_in_date as f64;
            s.estimate = (s.avg_per_date * total_dates as f64) as usize;
        } else {
            recalculate_estimate(&mut s, total_files, 0, true);
        }
    }

    pub fn end_date(&self) {
        let mut s = self.state();
        if s.fixed_sample {
            return;
        }
        let Some(total_dates) = s.total_dates else {
            return;
        };
        s.avg_per_date = update_estimate(
            s.avg_per_date,
            total_dates,
            s.dates_remaining,
            s.photos_in_date as f64,
        );
    }

    /// Finished scanning: pin the estimate to the real total.
    pub fn end(&self) {
        let total = self.total_files();
        let mut s = self.state();
        if !s.fixed_sample {
            s.estimate = total;
        }
    }

    /// Log one summary line for the scan.
    pub fn log_summary(&self, sample: bool, random: bool, finished: bool) {
        let photos = self.total_photos();
        let files = self.total_files();
        let invalid = self.invalid_files();
        let s = self.state();
        let dates = s.total_dates.unwrap_or(0);
        let groups = s.total_groups;

        if photos == 0 {
            if sample {
                tracing::warn!(
                    "unable to {}sample {} photo(s): couldn't find any photos \
                     ({dates} date dir(s), {groups} group(s))",
                    if random { "randomly " } else { "" },
                    s.estimate
                );
            } else {
                tracing::warn!(
                    "couldn't find any photos: {dates} date dir(s) with {groups} group(s)"
                );
            }
            return;
        }

        if finished {
            tracing::info!(
                "scanned {photos} photo{} across {groups} group{} in {dates} date{} \
                 ({invalid} invalid file{})",
                if photos == 1 { "" } else { "s" },
                if groups == 1 { "" } else { "s" },
                if dates == 1 { "" } else { "s" },
                if invalid == 1 { "" } else { "s" },
            );
        } else {
            tracing::info!(
                "scanned {files} file{} across {groups} group{} in {dates} date{}; \
                 processing still running",
                if files == 1 { "" } else { "s" },
                if groups == 1 { "" } else { "s" },
                if dates == 1 { "" } else { "s" },
            );
        }
    }

    /// Counter snapshot for fatal-error diagnostics. Holds the state lock
    /// only long enough to copy numbers.
    pub fn debug_info(&self) -> String {
        let (dates, groups, estimate) = {
            let s = self.state();
            (s.total_dates.unwrap_or(0), s.total_groups, s.estimate)
        };
        format!(
            "{} file(s) in {} group(s) across {} date(s); {} invalid; estimate {}",
            self.total_files(),
            groups,
            dates,
            self.invalid_files(),
            estimate
        )
    }
}

/// Recompute the total estimate from the per-group and per-date averages,
/// optionally padding the active group with `ghost_inc` assumed photos.
fn recalculate_estimate(
    s: &mut EstimateState,
    total_files: usize,
    ghost_inc: usize,
    finished_group: bool,
) {
    let (Some(groups_in_date), Some(total_dates)) = (s.groups_in_date, s.total_dates) else {
        return;
    };

    let refined_avg_per_group = if ghost_inc > 0 {
        update_estimate(
            s.avg_per_group,
            groups_in_date,
            s.groups_remaining,
            (s.photos_in_group + ghost_inc) as f64,
        )
    } else {
        s.avg_per_group
    };

    let mut remaining_in_this_date = refined_avg_per_group * s.groups_remaining as f64;
    if !finished_group {
        remaining_in_this_date +=
            (refined_avg_per_group - s.photos_in_group as f64).max(0.0);
    }

    let refined_avg_per_date = update_estimate(
        s.avg_per_date,
        total_dates,
        s.dates_remaining,
        s.photos_in_date as f64 + remaining_in_this_date,
    );

    s.estimate = (total_files as f64
        + ghost_inc as f64
        + refined_avg_per_date * s.dates_remaining as f64
        + remaining_in_this_date) as usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_estimate_first_observation_replaces_prior() {
        assert_eq!(update_estimate(500.0, 10, 9, 20.0), 20.0);
    }

    #[test]
    fn test_update_estimate_late_observations_barely_move() {
        // Second-to-last observation of 10: x near 1, prior weight near 1
        let updated = update_estimate(100.0, 10, 1, 0.0);
        assert!(updated > 95.0, "late observation moved estimate to {updated}");
    }

    #[test]
    fn test_update_estimate_early_observations_shared_weight() {
        // Second observation: x = 1/10, prior weight near the 0.5 floor
        let updated = update_estimate(100.0, 10, 8, 0.0);
        assert!(updated < 60.0, "early observation barely moved estimate: {updated}");
    }

    #[test]
    fn test_sigmoid_weight_midpoint() {
        // At x = 0.5 the weight is exactly 0.75, so the update is the
        // 3:1-weighted blend of prior and observation
        let updated = update_estimate(100.0, 10, 4, 0.0);
        assert!((updated - 75.0).abs() < 1.0, "got {updated}");
    }

    #[test]
    fn test_invalid_plus_photos_equals_files() {
        let m = ScanMetrics::new();
        m.start(1, None);
        m.start_date("2025-01-01", Some(1));
        m.start_group("a");
        for i in 0..10 {
            m.next_photo(i % 3 == 0);
        }
        m.end_group();
        m.end_date();
        m.end();
        assert_eq!(m.total_files(), 10);
        assert_eq!(m.invalid_files(), 4);
        assert_eq!(m.total_photos() + m.invalid_files(), m.total_files());
    }

    #[test]
    fn test_invalid_after_the_fact() {
        let m = ScanMetrics::new();
        m.start(1, None);
        m.start_date("2025-01-01", Some(1));
        m.start_group("a");
        for _ in 0..5 {
            m.next_photo(false);
        }
        m.invalid_photo_file("2025-01-01/a/junk.bin");
        assert_eq!(m.total_photos(), 4);
        assert_eq!(m.total_files(), 5);
    }

    #[test]
    fn test_fixed_sample_signals_completion() {
        let m = ScanMetrics::new();
        m.start(2, Some(3));
        m.start_date("2025-01-01", None);
        m.start_group("a");
        assert!(!m.next_photo(false));
        assert!(!m.next_photo(false));
        assert!(m.next_photo(false), "third photo reaches the sample size");
        assert_eq!(m.remaining_photos(), 0);
    }

    #[test]
    fn test_first_group_replaces_initial_estimate() {
        let m = ScanMetrics::new();
        m.start(4, None);
        // Initial estimate comes from the arbitrary per-date prior
        assert_eq!(m.total_estimate(), 2000);

        m.start_date("2025-01-01", Some(2));
        m.start_group("a");
        for _ in 0..50 {
            m.next_photo(false);
        }
        m.end_group();
        // 50 photos/group * 2 groups * 4 dates
        assert_eq!(m.total_estimate(), 400);
    }

    #[test]
    fn test_estimate_bumps_when_count_exceeds_it() {
        let m = ScanMetrics::new();
        m.start(1, None);
        m.start_date("2025-01-01", Some(1));
        m.start_group("a");
        for _ in 0..30 {
            m.next_photo(false);
        }
        m.end_group();
        m.end_date();
        // More photos keep arriving past the refined estimate
        m.start_group("b");
        for _ in 0..100 {
            m.next_photo(false);
        }
        assert!(m.total_estimate() >= m.total_photos());
    }

    #[test]
    fn test_end_pins_estimate_to_actual() {
        let m = ScanMetrics::new();
        m.start(1, None);
        m.start_date("2025-01-01", Some(1));
        m.start_group("a");
        for _ in 0..7 {
            m.next_photo(false);
        }
        m.end_group();
        m.end_date();
        m.end();
        assert_eq!(m.total_estimate(), 7);
    }
}
