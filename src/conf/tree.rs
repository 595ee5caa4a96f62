//! The three-level configuration tree: root, date, group.
//!
//! Values resolve by a pull model. The root holds a concrete value for every
//! option; date and group nodes hold `Option` overrides. Reading an option
//! for a given date/group walks group -> date -> root and takes the first
//! explicitly-set value, so a parent change automatically reaches every
//! child that has not overridden it, while a child override always wins.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::conf::options::{
    process_date_format, ChromaticAberration, FlipRotate, GroupOrdering, LogLevel, Sample,
    ThumbLocation, WhiteBalance,
};
use crate::conf::{ConfigError, DEFAULT_DATABASE_FILE};

/// Level of a path target in the project directory structure. Date
/// directories sit directly in the project root (level 1), groups inside
/// dates (2), photo files inside groups (3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathLevel {
    Date = 1,
    Group = 2,
    Photo = 3,
}

fn split_parts(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

/// Shape check shared by every `trunc_path` implementation: warn when a
/// path expected to be a file has no extension, or vice versa. Blank paths
/// are out of scope everywhere.
fn check_shape(path: &str, file: bool, warn: bool) -> Option<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return None;
    }
    if warn {
        let last = split_parts(trimmed).last().copied().unwrap_or(trimmed);
        let has_ext = last.rsplit_once('.').is_some_and(|(stem, _)| !stem.is_empty());
        if file && !has_ext && last != "*" {
            tracing::warn!(
                "expected a file path, but \"{}\" is missing an extension; is it a directory?",
                path
            );
        } else if !file && has_ext {
            tracing::warn!(
                "expected a directory path, but \"{}\" has a file extension; is it a file?",
                path
            );
        }
    }
    Some(trimmed.to_string())
}

/// Truncate `path` to the scope of the date directory `date_dir`, or return
/// None when the path is outside that scope. Paths shorter than the target
/// level carry no date component and pass through unchanged.
pub(crate) fn trunc_for_date(
    date_dir: &str,
    path: &str,
    level: PathLevel,
    file: bool,
    warn: bool,
) -> Option<String> {
    let parts = split_parts(path);
    if parts.len() < level as usize {
        return check_shape(path, file, warn);
    }
    let index = parts.iter().position(|p| *p == date_dir)?;
    if parts.len() - index != level as usize {
        if warn {
            tracing::warn!(
                "path \"{}\" matches date \"{}\" at an unexpected position; do you have a \
                 group or photo with the same name as this date?",
                path,
                date_dir
            );
        }
        return None;
    }
    check_shape(&parts[index + 1..].join("/"), file, warn)
}

/// Truncate `path` to the scope of the group directory `group_dir`, or
/// return None when the path is outside that scope. Single-component paths
/// carry no group component and pass through unchanged.
pub(crate) fn trunc_for_group(
    group_dir: &str,
    path: &str,
    level: PathLevel,
    file: bool,
    warn: bool,
) -> Option<String> {
    let parts = split_parts(path);
    if parts.len() == 1 {
        return check_shape(path, file, warn);
    }
    let index = parts.iter().position(|p| *p == group_dir)?;
    if index + 1 == parts.len() {
        if warn {
            tracing::warn!(
                "path \"{}\" ends with \"{}\", which matches the group name; do you have a \
                 photo with the same name as this group?",
                path,
                group_dir
            );
        }
        return None;
    }
    check_shape(&parts[index + 1..].join("/"), file, warn)
}

/// The options that apply per group of photos. The root holds a concrete
/// copy of these as project-wide defaults; date and group nodes override
/// them through [`PhotoOverrides`].
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoOptions {
    pub white_balance: WhiteBalance,
    pub chromatic_aberration: ChromaticAberration,
    pub median_filter: u32,
    pub dark_frame: Option<PathBuf>,
    pub flip_rotate: FlipRotate,
    pub thumbnail_location: ThumbLocation,
    pub thumbnail_path: PathBuf,
    pub use_embedded_thumbnail: bool,
    pub thumbnail_resize_factor: f64,
    pub thumbnail_quality: u8,
}

impl Default for PhotoOptions {
    fn default() -> Self {
        PhotoOptions {
            white_balance: WhiteBalance::Manual([1.0, 1.0, 1.0, 1.0]),
            chromatic_aberration: ChromaticAberration::default(),
            median_filter: 0,
            dark_frame: None,
            flip_rotate: FlipRotate::Default,
            thumbnail_location: ThumbLocation::Root,
            thumbnail_path: PathBuf::from("thumb"),
            use_embedded_thumbnail: true,
            thumbnail_resize_factor: 1.0,
            thumbnail_quality: 75,
        }
    }
}

/// Per-node overrides for [`PhotoOptions`]. `None` means "inherit".
#[derive(Debug, Clone, Default)]
pub struct PhotoOverrides {
    pub white_balance: Option<WhiteBalance>,
    pub chromatic_aberration: Option<ChromaticAberration>,
    pub median_filter: Option<u32>,
    pub dark_frame: Option<Option<PathBuf>>,
    pub flip_rotate: Option<FlipRotate>,
    pub thumbnail_location: Option<ThumbLocation>,
    pub thumbnail_path: Option<PathBuf>,
    pub use_embedded_thumbnail: Option<bool>,
    pub thumbnail_resize_factor: Option<f64>,
    pub thumbnail_quality: Option<u8>,
}

impl PhotoOverrides {
    /// Apply every set override on top of `base`.
    pub fn apply(&self, base: &mut PhotoOptions) {
        if let Some(v) = &self.white_balance {
            base.white_balance = v.clone();
        }
        if let Some(v) = self.chromatic_aberration {
            base.chromatic_aberration = v;
        }
        if let Some(v) = self.median_filter {
            base.median_filter = v;
        }
        if let Some(v) = &self.dark_frame {
            base.dark_frame = v.clone();
        }
        if let Some(v) = self.flip_rotate {
            base.flip_rotate = v;
        }
        if let Some(v) = self.thumbnail_location {
            base.thumbnail_location = v;
        }
        if let Some(v) = &self.thumbnail_path {
            base.thumbnail_path = v.clone();
        }
        if let Some(v) = self.use_embedded_thumbnail {
            base.use_embedded_thumbnail = v;
        }
        if let Some(v) = self.thumbnail_resize_factor {
            base.thumbnail_resize_factor = v;
        }
        if let Some(v) = self.thumbnail_quality {
            base.thumbnail_quality = v;
        }
    }

    pub fn set_thumbnail_resize_factor(&mut self, f: f64) -> Result<(), ConfigError> {
        validate_resize_factor(f)?;
        self.thumbnail_resize_factor = Some(f);
        Ok(())
    }

    pub fn set_thumbnail_quality(&mut self, q: i64) -> Result<(), ConfigError> {
        self.thumbnail_quality = Some(validate_quality(q)?);
        Ok(())
    }

    pub fn set_median_filter(&mut self, mf: i64) -> Result<(), ConfigError> {
        self.median_filter = Some(validate_median_filter(mf)?);
        Ok(())
    }
}

fn validate_resize_factor(f: f64) -> Result<(), ConfigError> {
    if f > 0.0 && f <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::value(
            "thumbnail_resize_factor",
            format!("must be in (0, 1], got {f}"),
        ))
    }
}

fn validate_quality(q: i64) -> Result<u8, ConfigError> {
    if (0..=100).contains(&q) {
        Ok(q as u8)
    } else {
        Err(ConfigError::value(
            "thumbnail_quality",
            format!("must be in 0..=100, got {q}"),
        ))
    }
}

fn validate_median_filter(mf: i64) -> Result<u32, ConfigError> {
    if mf >= 0 {
        Ok(mf as u32)
    } else {
        Err(ConfigError::value(
            "median_filter",
            format!("must be non-negative, got {mf}"),
        ))
    }
}

/// The root of the configuration tree. Holds a concrete value for every
/// option plus the root-scoped include/exclude sets (fully-qualified
/// `date/group/photo` entries).
#[derive(Debug, Clone)]
pub struct RootConfig {
    project: PathBuf,
    pub database: PathBuf,
    pub log_file: Option<PathBuf>,
    pub log_level: LogLevel,
    workers: usize,
    max_processing_errors: usize,
    pub sample: Sample,
    date_format: String,
    pub group_ordering: GroupOrdering,
    pub defaults: PhotoOptions,
    pub exclude_dates: BTreeSet<String>,
    pub include_dates: BTreeSet<String>,
    pub exclude_groups: BTreeSet<String>,
    pub include_groups: BTreeSet<String>,
    pub exclude_photos: BTreeSet<String>,
    pub include_photos: BTreeSet<String>,
}

impl RootConfig {
    pub fn new(project: PathBuf) -> Result<Self, ConfigError> {
        if !project.is_dir() {
            return Err(ConfigError::value(
                "project",
                format!("\"{}\" is not a directory", project.display()),
            ));
        }
        Ok(RootConfig {
            project,
            database: PathBuf::from(DEFAULT_DATABASE_FILE),
            log_file: default_log_file(),
            log_level: LogLevel::Default,
            workers: 20,
            max_processing_errors: 5,
            sample: Sample::Off,
            date_format: "%Y-%m-%d".to_string(),
            group_ordering: GroupOrdering::default(),
            defaults: PhotoOptions::default(),
            exclude_dates: BTreeSet::new(),
            include_dates: BTreeSet::new(),
            exclude_groups: BTreeSet::new(),
            include_groups: BTreeSet::new(),
            exclude_photos: BTreeSet::new(),
            include_photos: BTreeSet::new(),
        })
    }

    pub fn project(&self) -> &PathBuf {
        &self.project
    }

    /// Return `path` relative to the project directory, when it is inside it.
    pub fn rel_path<'a>(&self, path: &'a std::path::Path) -> &'a std::path::Path {
        path.strip_prefix(&self.project).unwrap_or(path)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn set_workers(&mut self, w: i64) -> Result<(), ConfigError> {
        if w < 1 {
            return Err(ConfigError::value(
                "workers",
                format!("must be at least 1, got {w}"),
            ));
        }
        self.workers = w as usize;
        Ok(())
    }

    pub fn max_processing_errors(&self) -> usize {
        self.max_processing_errors
    }

    pub fn set_max_processing_errors(&mut self, n: i64) -> Result<(), ConfigError> {
        if n < 0 {
            return Err(ConfigError::value(
                "max_processing_errors",
                format!("must be non-negative, got {n}"),
            ));
        }
        self.max_processing_errors = n as usize;
        Ok(())
    }

    pub fn date_format(&self) -> &str {
        &self.date_format
    }

    /// Accepts the human form (`yyyy-mm-dd`) or the strftime form directly.
    pub fn set_date_format(&mut self, fmt: &str) -> Result<(), ConfigError> {
        let converted = process_date_format(fmt);
        if converted.trim().is_empty() {
            return Err(ConfigError::value("date_format", "format cannot be blank"));
        }
        self.date_format = converted;
        Ok(())
    }

    /// All paths are in scope for the root, so this only runs the shape check.
    pub fn trunc_path(&self, path: &str, _level: PathLevel, file: bool) -> Option<String> {
        check_shape(path, file, true)
    }

    pub fn add_exclude_dates<I: IntoIterator<Item = String>>(&mut self, items: I) {
        let scoped: Vec<String> = items
            .into_iter()
            .filter_map(|p| self.trunc_path(&p, PathLevel::Date, false))
            .collect();
        self.exclude_dates.extend(scoped);
    }

    pub fn add_include_dates<I: IntoIterator<Item = String>>(&mut self, items: I) {
        let scoped: Vec<String> = items
            .into_iter()
            .filter_map(|p| self.trunc_path(&p, PathLevel::Date, false))
            .collect();
        self.include_dates.extend(scoped);
    }

    pub fn add_exclude_groups<I: IntoIterator<Item = String>>(&mut self, items: I) {
        let scoped: Vec<String> = items
            .into_iter()
            .filter_map(|p| self.trunc_path(&p, PathLevel::Group, false))
            .collect();
        self.exclude_groups.extend(scoped);
    }

    pub fn add_include_groups<I: IntoIterator<Item = String>>(&mut self, items: I) {
        let scoped: Vec<String> = items
            .into_iter()
            .filter_map(|p| self.trunc_path(&p, PathLevel::Group, false))
            .collect();
        self.include_groups.extend(scoped);
    }

    pub fn add_exclude_photos<I: IntoIterator<Item = String>>(&mut self, items: I) {
        let scoped: Vec<String> = items
            .into_iter()
            .filter_map(|p| self.trunc_path(&p, PathLevel::Photo, true))
            .collect();
        self.exclude_photos.extend(scoped);
    }

    pub fn add_include_photos<I: IntoIterator<Item = String>>(&mut self, items: I) {
        let scoped: Vec<String> = items
            .into_iter()
            .filter_map(|p| self.trunc_path(&p, PathLevel::Photo, true))
            .collect();
        self.include_photos.extend(scoped);
    }
}

/// Default log location under the platform state directory, mirroring where
/// other per-user tool logs go. None when the platform offers no such dir.
fn default_log_file() -> Option<PathBuf> {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|d| d.join("tlmerge").join("tlmerge.log"))
}

/// Date-level node: overrides scoped to one date directory.
#[derive(Debug, Clone)]
pub struct DateConfig {
    date_dir: String,
    pub group_ordering: Option<GroupOrdering>,
    pub overrides: PhotoOverrides,
    pub exclude_groups: BTreeSet<String>,
    pub include_groups: BTreeSet<String>,
    pub exclude_photos: BTreeSet<String>,
    pub include_photos: BTreeSet<String>,
}

impl DateConfig {
    pub fn new(date_dir: impl Into<String>) -> Self {
        DateConfig {
            date_dir: date_dir.into(),
            group_ordering: None,
            overrides: PhotoOverrides::default(),
            exclude_groups: BTreeSet::new(),
            include_groups: BTreeSet::new(),
            exclude_photos: BTreeSet::new(),
            include_photos: BTreeSet::new(),
        }
    }

    pub fn date_dir(&self) -> &str {
        &self.date_dir
    }

    pub fn trunc_path(&self, path: &str, level: PathLevel, file: bool) -> Option<String> {
        trunc_for_date(&self.date_dir, path, level, file, true)
    }

    pub fn add_exclude_groups<I: IntoIterator<Item = String>>(&mut self, items: I) {
        let scoped: Vec<String> = items
            .into_iter()
            .filter_map(|p| self.trunc_path(&p, PathLevel::Group, false))
            .collect();
        self.exclude_groups.extend(scoped);
    }

    pub fn add_include_groups<I: IntoIterator<Item = String>>(&mut self, items: I) {
        let scoped: Vec<String> = items
            .into_iter()
            .filter_map(|p| self.trunc_path(&p, PathLevel::Group, false))
            .collect();
        self.include_groups.extend(scoped);
    }

    pub fn add_exclude_photos<I: IntoIterator<Item = String>>(&mut self, items: I) {
        let scoped: Vec<String> = items
            .into_iter()
            .filter_map(|p| self.trunc_path(&p, PathLevel::Photo, true))
            .collect();
        self.exclude_photos.extend(scoped);
    }

    pub fn add_include_photos<I: IntoIterator<Item = String>>(&mut self, items: I) {
        let scoped: Vec<String> = items
            .into_iter()
            .filter_map(|p| self.trunc_path(&p, PathLevel::Photo, true))
            .collect();
        self.include_photos.extend(scoped);
    }
}

/// Group-level node: overrides scoped to one group inside one date.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    date_dir: String,
    group_dir: String,
    pub overrides: PhotoOverrides,
    pub exclude_photos: BTreeSet<String>,
    pub include_photos: BTreeSet<String>,
}

impl GroupConfig {
    pub fn new(date_dir: impl Into<String>, group_dir: impl Into<String>) -> Self {
        GroupConfig {
            date_dir: date_dir.into(),
            group_dir: group_dir.into(),
            overrides: PhotoOverrides::default(),
            exclude_photos: BTreeSet::new(),
            include_photos: BTreeSet::new(),
        }
    }

    pub fn date_dir(&self) -> &str {
        &self.date_dir
    }

    pub fn group_dir(&self) -> &str {
        &self.group_dir
    }

    /// Strips a matching leading date component and then a matching group
    /// component, or reports the path as out of scope.
    pub fn trunc_path(&self, path: &str, level: PathLevel, file: bool) -> Option<String> {
        let stripped = trunc_for_date(&self.date_dir, path, level, file, true)?;
        trunc_for_group(&self.group_dir, &stripped, level, file, true)
    }

    pub fn add_exclude_photos<I: IntoIterator<Item = String>>(&mut self, items: I) {
        let scoped: Vec<String> = items
            .into_iter()
            .filter_map(|p| self.trunc_path(&p, PathLevel::Photo, true))
            .collect();
        self.exclude_photos.extend(scoped);
    }

    pub fn add_include_photos<I: IntoIterator<Item = String>>(&mut self, items: I) {
        let scoped: Vec<String> = items
            .into_iter()
            .filter_map(|p| self.trunc_path(&p, PathLevel::Photo, true))
            .collect();
        self.include_photos.extend(scoped);
    }
}

/// An exclude set filtered by an include set: a name is dropped iff it
/// appears in exclude and is not rescued by include.
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    pub exclude: BTreeSet<String>,
    pub include: BTreeSet<String>,
}

impl NameFilter {
    pub fn allows(&self, name: &str) -> bool {
        !(self.exclude.contains(name) && !self.include.contains(name))
    }
}

/// Build the full path to the directory holding thumbnails for one group.
/// The path is not validated and may not exist yet.
pub fn thumbnail_dir(
    options: &PhotoOptions,
    project: &std::path::Path,
    date_dir: &str,
    group_dir: &str,
) -> PathBuf {
    let path = &options.thumbnail_path;
    match options.thumbnail_location {
        ThumbLocation::Root => project.join(path).join(date_dir).join(group_dir),
        ThumbLocation::Date => project.join(date_dir).join(path).join(group_dir),
        ThumbLocation::Group => project.join(date_dir).join(group_dir).join(path),
        ThumbLocation::Custom => path.join(date_dir).join(group_dir),
    }
}
