//! Directory traversal: date dirs -> group dirs -> photo files, under the
//! configured filtering, ordering, and sampling policy.

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;

use crate::conf::{ConfigManager, GroupOrdering, Sample, DEFAULT_CONFIG_FILE};
use crate::db::{MAX_DATE_LENGTH, MAX_GROUP_LENGTH, MAX_PHOTO_NAME_LENGTH};
use crate::scan::metrics::ScanMetrics;

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Non-recursive listing of a directory's subdirectories or files. Read
/// errors are logged and produce an empty listing.
fn list_entries(dir: &Path, want_dirs: bool) -> Vec<PathBuf> {
    let reader = match std::fs::read_dir(dir) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("cannot read directory \"{}\": {e}", dir.display());
            return Vec::new();
        }
    };
    reader
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| if want_dirs { p.is_dir() } else { p.is_file() })
        .collect()
}

fn max_length_ok(path: &Path, max: usize) -> bool {
    let name = entry_name(path);
    if name.len() > max {
        tracing::warn!(
            "skipping \"{}\": \"{name}\" exceeds the maximum supported length \
             in the database ({max} characters)",
            path.display()
        );
        false
    } else {
        true
    }
}

/// All date directories in the project, filtered but unordered.
pub fn list_dates(cfg: &ConfigManager) -> Vec<PathBuf> {
    let (project, format) = {
        let root = cfg.root();
        (root.project().clone(), root.date_format().to_string())
    };
    let filter = cfg.date_filter();
    list_entries(&project, true)
        .into_iter()
        .filter(|p| {
            let name = entry_name(p);
            chrono::NaiveDate::parse_from_str(&name, &format).is_ok() && filter.allows(&name)
        })
        .filter(|p| max_length_ok(p, MAX_DATE_LENGTH))
        .collect()
}

/// Date directories in chronological order (by parsed date).
pub fn list_dates_ordered(cfg: &ConfigManager) -> Vec<PathBuf> {
    let format = cfg.root().date_format().to_string();
    let mut dates = list_dates(cfg);
    dates.sort_by_key(|p| chrono::NaiveDate::parse_from_str(&entry_name(p), &format).ok());
    dates
}

/// Group directories in one date, accepted and ordered per the date's
/// ordering policy.
pub fn list_groups(cfg: &ConfigManager, date_dir: &Path, order: bool) -> Vec<PathBuf> {
    let date_name = entry_name(date_dir);
    let ordering = cfg.group_ordering(&date_name);
    let filter = cfg.group_filter(&date_name);

    let mut groups: Vec<PathBuf> = list_entries(date_dir, true)
        .into_iter()
        .filter(|p| {
            let name = entry_name(p);
            let accepted = match ordering {
                GroupOrdering::Natural => true,
                GroupOrdering::Num => name.parse::<f64>().is_ok(),
                GroupOrdering::Abc => !name.is_empty() && name.chars().all(|c| c.is_alphabetic()),
            };
            accepted && filter.allows(&name)
        })
        .filter(|p| max_length_ok(p, MAX_GROUP_LENGTH))
        .collect();

    if order {
        match ordering {
            GroupOrdering::Natural => groups.sort_by_key(|p| entry_name(p)),
            GroupOrdering::Num => groups.sort_by(|a, b| {
                let na = entry_name(a).parse::<f64>().unwrap_or(f64::MAX);
                let nb = entry_name(b).parse::<f64>().unwrap_or(f64::MAX);
                na.partial_cmp(&nb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| entry_name(a).cmp(&entry_name(b)))
            }),
            // a, b, ..., z, aa, ab: length first, then case-insensitive name
            GroupOrdering::Abc => {
                groups.sort_by_key(|p| {
                    let name = entry_name(p);
                    (name.len(), name.to_lowercase())
                });
            }
        }
    }
    groups
}

/// Photo files in one group, filtered and optionally ordered. The
/// per-directory config file is never a photo.
pub fn list_photos_in_group(cfg: &ConfigManager, group_dir: &Path, order: bool) -> Vec<PathBuf> {
    let group_name = entry_name(group_dir);
    let date_name = group_dir
        .parent()
        .map(|p| entry_name(p))
        .unwrap_or_default();
    let filter = cfg.photo_filter(&date_name, &group_name);

    let mut photos: Vec<PathBuf> = list_entries(group_dir, false)
        .into_iter()
        .filter(|p| entry_name(p) != DEFAULT_CONFIG_FILE)
        .filter(|p| max_length_ok(p, MAX_PHOTO_NAME_LENGTH))
        .filter(|p| filter.allows(&entry_name(p)))
        .collect();

    if order {
        photos.sort_by_key(|p| entry_name(p));
    }
    photos
}

/// Sequential iterator over every photo in the project: dates in
/// chronological order (when ordered), groups per ordering policy, photos
/// lexicographic. Stops early under a deterministic sample.
pub struct PhotoIter<'a> {
    cfg: &'a ConfigManager,
    metrics: &'a ScanMetrics,
    order: bool,
    validate: bool,
    dates: std::vec::IntoIter<PathBuf>,
    groups: std::vec::IntoIter<PathBuf>,
    photos: std::vec::IntoIter<PathBuf>,
    in_date: bool,
    in_group: bool,
    done: bool,
    ended: bool,
}

impl<'a> PhotoIter<'a> {
    pub fn new(
        cfg: &'a ConfigManager,
        metrics: &'a ScanMetrics,
        order: bool,
        validate: bool,
    ) -> Self {
        let sample = cfg.root().sample;
        // A deterministic sample is implicitly ordered so that the same
        // photos are chosen on every run
        let order = order || sample.is_active();
        let dates = if order {
            list_dates_ordered(cfg)
        } else {
            list_dates(cfg)
        };
        let sample_size = match sample {
            Sample::Deterministic(n) => Some(n),
            _ => None,
        };
        metrics.start(dates.len(), sample_size);
        PhotoIter {
            cfg,
            metrics,
            order,
            validate,
            dates: dates.into_iter(),
            groups: Vec::new().into_iter(),
            photos: Vec::new().into_iter(),
            in_date: false,
            in_group: false,
            done: false,
            ended: false,
        }
    }

    fn end(&mut self) {
        if !self.ended {
            self.metrics.end();
            self.ended = true;
        }
        self.done = true;
    }
}

impl Iterator for PhotoIter<'_> {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        loop {
            if self.done {
                return None;
            }
            if let Some(photo) = self.photos.next() {
                let invalid =
                    self.validate && !crate::preprocess::raw::is_raw_compatible(&photo);
                if self.metrics.next_photo(invalid) {
                    self.end();
                    return Some(photo);
                }
                if invalid {
                    continue;
                }
                return Some(photo);
            }
            if self.in_group {
                self.metrics.end_group();
                self.in_group = false;
            }
            if let Some(group) = self.groups.next() {
                self.metrics.start_group(&entry_name(&group));
                self.in_group = true;
                self.photos = list_photos_in_group(self.cfg, &group, self.order).into_iter();
                continue;
            }
            if self.in_date {
                self.metrics.end_date();
                self.in_date = false;
            }
            if let Some(date) = self.dates.next() {
                let groups = list_groups(self.cfg, &date, self.order);
                self.metrics.start_date(&entry_name(&date), Some(groups.len()));
                self.in_date = true;
                self.groups = groups.into_iter();
                continue;
            }
            self.end();
            return None;
        }
    }
}

/// One open date in the randomized work list: a shuffled group sequence and
/// the shuffled photos of the active group.
struct OpenDate {
    groups: std::vec::IntoIter<PathBuf>,
    photos: std::vec::IntoIter<PathBuf>,
}

impl OpenDate {
    /// Open a date by loading its first (random) group. None when the date
    /// has no groups at all.
    fn open(cfg: &ConfigManager, metrics: &ScanMetrics, date_dir: &Path) -> Option<OpenDate> {
        let mut rng = rand::thread_rng();
        let mut groups = list_groups(cfg, date_dir, false);
        groups.shuffle(&mut rng);
        let mut groups = groups.into_iter();
        let first = groups.next()?;
        metrics.start_group(&entry_name(&first));
        let mut photos = list_photos_in_group(cfg, &first, false);
        photos.shuffle(&mut rng);
        Some(OpenDate {
            groups,
            photos: photos.into_iter(),
        })
    }

    /// Next photo from this date, advancing to the next group as each one
    /// drains. None once the date is exhausted.
    fn next_photo(&mut self, cfg: &ConfigManager, metrics: &ScanMetrics) -> Option<PathBuf> {
        loop {
            if let Some(photo) = self.photos.next() {
                return Some(photo);
            }
            let group = self.groups.next()?;
            metrics.start_group(&entry_name(&group));
            let mut photos = list_photos_in_group(cfg, &group, false);
            photos.shuffle(&mut rand::thread_rng());
            self.photos = photos.into_iter();
        }
    }
}

/// Randomized iterator for `sample = "~N"`: a stratified draw over dates.
///
/// Dates are opened lazily into a rotating work list and one photo is pulled
/// from each in turn, so memory stays proportional to the number of open
/// dates rather than the project size. New dates open only while the number
/// of open dates is below the photos still needed.
pub struct RandomPhotoIter<'a> {
    cfg: &'a ConfigManager,
    metrics: &'a ScanMetrics,
    validate: bool,
    dates: std::vec::IntoIter<PathBuf>,
    dates_exhausted: bool,
    open: Vec<OpenDate>,
    cursor: usize,
    done: bool,
    ended: bool,
}

impl<'a> RandomPhotoIter<'a> {
    pub fn new(
        cfg: &'a ConfigManager,
        metrics: &'a ScanMetrics,
        sample_size: usize,
        validate: bool,
    ) -> Self {
        let mut dates = list_dates(cfg);
        dates.shuffle(&mut rand::thread_rng());
        metrics.start(dates.len(), Some(sample_size));
        RandomPhotoIter {
            cfg,
            metrics,
            validate,
            dates: dates.into_iter(),
            dates_exhausted: false,
            open: Vec::new(),
            cursor: 0,
            done: false,
            ended: false,
        }
    }

    fn end(&mut self) {
        if !self.ended {
            self.metrics.end();
            self.ended = true;
        }
        self.done = true;
    }
}

impl Iterator for RandomPhotoIter<'_> {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        loop {
            if self.done {
                return None;
            }

            // Open another date while there are fewer open dates than photos
            // still needed
            if !self.dates_exhausted
                && self.open.len() - self.cursor < self.metrics.remaining_photos()
            {
                match self.dates.next() {
                    Some(date_dir) => {
                        self.metrics.start_date(&entry_name(&date_dir), None);
                        match OpenDate::open(self.cfg, self.metrics, &date_dir) {
                            Some(open) => self.open.push(open),
                            None => {
                                tracing::debug!(
                                    "date \"{}\" has no groups",
                                    entry_name(&date_dir)
                                );
                            }
                        }
                        continue;
                    }
                    None => self.dates_exhausted = true,
                }
            }

            if self.cursor >= self.open.len() {
                if self.open.is_empty() {
                    // Out of dates before reaching the sample size
                    self.end();
                    return None;
                }
                self.cursor = 0;
            }

            match self.open[self.cursor].next_photo(self.cfg, self.metrics) {
                None => {
                    self.open.remove(self.cursor);
                    continue;
                }
                Some(photo) => {
                    let invalid =
                        self.validate && !crate::preprocess::raw::is_raw_compatible(&photo);
                    if self.metrics.next_photo(invalid) {
                        self.end();
                        return Some(photo);
                    }
                    if invalid {
                        continue;
                    }
                    self.cursor += 1;
                    return Some(photo);
                }
            }
        }
    }
}

/// Iterator over the project's photos following the configured sampling
/// policy.
pub fn scan_photos<'a>(
    cfg: &'a ConfigManager,
    metrics: &'a ScanMetrics,
    order: bool,
    validate: bool,
) -> Box<dyn Iterator<Item = PathBuf> + 'a> {
    let sample = cfg.root().sample;
    match sample {
        Sample::Random(n) => Box::new(RandomPhotoIter::new(cfg, metrics, n, validate)),
        _ => Box::new(PhotoIter::new(cfg, metrics, order, validate)),
    }
}
