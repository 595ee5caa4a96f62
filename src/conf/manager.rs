//! The config manager owns the configuration tree and serves the effective
//! options at each level of the project. Date and group nodes are created
//! lazily, either while loading per-directory YAML files or when the scanner
//! first touches a directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Deserialize;
use serde_yaml::Value;

use crate::conf::options::{
    matches_date_format, ChromaticAberration, FlipRotate, GroupOrdering, LogLevel, Sample,
    ThumbLocation, WhiteBalance,
};
use crate::conf::tree::{
    trunc_for_date, trunc_for_group, DateConfig, GroupConfig, NameFilter, PathLevel, PhotoOptions,
    PhotoOverrides, RootConfig,
};
use crate::conf::{ConfigError, DEFAULT_CONFIG_FILE};

#[derive(Debug)]
enum Node {
    Date(DateConfig),
    Group(GroupConfig),
}

/// Owns the root config and the lazily-built tree of date/group nodes,
/// keyed by `(date_dir, Option<group_dir>)`.
///
/// Reads are concurrent (scanner and pool workers both consult the tree);
/// writes only happen before the pipeline starts, while YAML files and CLI
/// arguments are applied.
pub struct ConfigManager {
    root: RwLock<RootConfig>,
    tree: RwLock<BTreeMap<(String, Option<String>), Node>>,
}

impl ConfigManager {
    pub fn new(project: PathBuf) -> Result<Self, ConfigError> {
        Ok(ConfigManager {
            root: RwLock::new(RootConfig::new(project)?),
            tree: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn root(&self) -> RwLockReadGuard<'_, RootConfig> {
        self.root.read().expect("config root lock poisoned")
    }

    pub fn root_mut(&self) -> RwLockWriteGuard<'_, RootConfig> {
        self.root.write().expect("config root lock poisoned")
    }

    /// Run `f` against the date node, creating it first if needed. New date
    /// names are validated against the configured date format.
    pub fn with_date<R>(
        &self,
        date_dir: &str,
        f: impl FnOnce(&mut DateConfig) -> R,
    ) -> Result<R, ConfigError> {
        self.ensure_date(date_dir)?;
        let mut tree = self.tree.write().expect("config tree lock poisoned");
        match tree.get_mut(&(date_dir.to_string(), None)) {
            Some(Node::Date(cfg)) => Ok(f(cfg)),
            _ => unreachable!("date node created above"),
        }
    }

    /// Run `f` against the group node, creating it (and its date parent)
    /// first if needed.
    pub fn with_group<R>(
        &self,
        date_dir: &str,
        group_dir: &str,
        f: impl FnOnce(&mut GroupConfig) -> R,
    ) -> Result<R, ConfigError> {
        self.ensure_date(date_dir)?;
        let mut tree = self.tree.write().expect("config tree lock poisoned");
        let key = (date_dir.to_string(), Some(group_dir.to_string()));
        let node = tree
            .entry(key)
            .or_insert_with(|| Node::Group(GroupConfig::new(date_dir, group_dir)));
        match node {
            Node::Group(cfg) => Ok(f(cfg)),
            _ => unreachable!("group key always maps to a group node"),
        }
    }

    fn ensure_date(&self, date_dir: &str) -> Result<(), ConfigError> {
        {
            let tree = self.tree.read().expect("config tree lock poisoned");
            if tree.contains_key(&(date_dir.to_string(), None)) {
                return Ok(());
            }
        }
        let format = self.root().date_format().to_string();
        if !matches_date_format(date_dir, &format) {
            return Err(ConfigError::value(
                "date",
                format!("directory \"{date_dir}\" doesn't match date format \"{format}\""),
            ));
        }
        let mut tree = self.tree.write().expect("config tree lock poisoned");
        tree.entry((date_dir.to_string(), None))
            .or_insert_with(|| Node::Date(DateConfig::new(date_dir)));
        Ok(())
    }

    fn date_node(&self, date_dir: &str) -> Option<DateConfig> {
        let tree = self.tree.read().expect("config tree lock poisoned");
        match tree.get(&(date_dir.to_string(), None)) {
            Some(Node::Date(cfg)) => Some(cfg.clone()),
            _ => None,
        }
    }

    fn group_node(&self, date_dir: &str, group_dir: &str) -> Option<GroupConfig> {
        let tree = self.tree.read().expect("config tree lock poisoned");
        match tree.get(&(date_dir.to_string(), Some(group_dir.to_string()))) {
            Some(Node::Group(cfg)) => Some(cfg.clone()),
            _ => None,
        }
    }

    /// Group ordering policy for one date: date override, else root.
    pub fn group_ordering(&self, date_dir: &str) -> GroupOrdering {
        self.date_node(date_dir)
            .and_then(|d| d.group_ordering)
            .unwrap_or(self.root().group_ordering)
    }

    /// Effective per-group options: root defaults overlaid with date and
    /// group overrides, most specific last.
    pub fn photo_options(&self, date_dir: &str, group_dir: &str) -> PhotoOptions {
        let mut options = self.root().defaults.clone();
        if let Some(date) = self.date_node(date_dir) {
            date.overrides.apply(&mut options);
        }
        if let Some(group) = self.group_node(date_dir, group_dir) {
            group.overrides.apply(&mut options);
        }
        options
    }

    pub fn date_filter(&self) -> NameFilter {
        let root = self.root();
        NameFilter {
            exclude: root.exclude_dates.clone(),
            include: root.include_dates.clone(),
        }
    }

    /// Filter for group names within one date. Root-level entries
    /// (`date/group` or bare `group`) are narrowed to this date's scope and
    /// merged with the date node's own sets.
    pub fn group_filter(&self, date_dir: &str) -> NameFilter {
        let mut filter = NameFilter::default();
        {
            let root = self.root();
            for p in &root.exclude_groups {
                if let Some(g) = trunc_for_date(date_dir, p, PathLevel::Group, false, false) {
                    filter.exclude.insert(g);
                }
            }
            for p in &root.include_groups {
                if let Some(g) = trunc_for_date(date_dir, p, PathLevel::Group, false, false) {
                    filter.include.insert(g);
                }
            }
        }
        if let Some(date) = self.date_node(date_dir) {
            filter.exclude.extend(date.exclude_groups.iter().cloned());
            filter.include.extend(date.include_groups.iter().cloned());
        }
        filter
    }

    /// Filter for photo file names within one group, merging the root, date,
    /// and group level sets, each narrowed to this group's scope.
    pub fn photo_filter(&self, date_dir: &str, group_dir: &str) -> NameFilter {
        let mut filter = NameFilter::default();
        let narrow = |p: &String| -> Option<String> {
            let stripped = trunc_for_date(date_dir, p, PathLevel::Photo, true, false)?;
            trunc_for_group(group_dir, &stripped, PathLevel::Photo, true, false)
        };
        {
            let root = self.root();
            filter.exclude.extend(root.exclude_photos.iter().filter_map(narrow));
            filter.include.extend(root.include_photos.iter().filter_map(narrow));
        }
        if let Some(date) = self.date_node(date_dir) {
            filter.exclude.extend(date.exclude_photos.iter().filter_map(|p| {
                trunc_for_group(group_dir, p, PathLevel::Photo, true, false)
            }));
            filter.include.extend(date.include_photos.iter().filter_map(|p| {
                trunc_for_group(group_dir, p, PathLevel::Photo, true, false)
            }));
        }
        if let Some(group) = self.group_node(date_dir, group_dir) {
            filter.exclude.extend(group.exclude_photos.iter().cloned());
            filter.include.extend(group.include_photos.iter().cloned());
        }
        filter
    }

    // ── YAML loading ──────────────────────────────────────────────────────────

    /// Load the root config file if it exists. Returns whether a file was
    /// found and applied.
    pub fn load_root_file(&self, file: &Path) -> Result<bool, ConfigError> {
        if !file.exists() {
            return Ok(false);
        }
        if !file.is_file() {
            return Err(ConfigError::file(
                file.display(),
                "exists but is not a file; is it a directory?",
            ));
        }
        for doc in load_config_documents(file)? {
            self.apply_root_document(&doc, file)?;
        }
        Ok(true)
    }

    /// Walk the project tree and load every date- and group-level config
    /// file. Returns the number of files loaded.
    pub fn load_all(&self) -> Result<usize, ConfigError> {
        let (project, format) = {
            let root = self.root();
            (root.project().clone(), root.date_format().to_string())
        };

        let mut loaded = 0;
        for date_dir in list_subdirs(&project) {
            let date_name = dir_name(&date_dir);
            if !matches_date_format(&date_name, &format) {
                continue;
            }
            loaded += self.load_dir_file(&date_dir, &date_name, None)? as usize;
            for group_dir in list_subdirs(&date_dir) {
                let group_name = dir_name(&group_dir);
                loaded += self.load_dir_file(&group_dir, &date_name, Some(&group_name))? as usize;
            }
        }
        Ok(loaded)
    }

    fn load_dir_file(
        &self,
        dir: &Path,
        date: &str,
        group: Option<&str>,
    ) -> Result<bool, ConfigError> {
        let file = dir.join(DEFAULT_CONFIG_FILE);
        if !file.is_file() {
            return Ok(false);
        }
        let docs = load_config_documents(&file)?;
        let n = docs.len();
        for doc in docs {
            match group {
                None => self.apply_date_document(&doc, date, &file)?,
                Some(g) => self.apply_group_document(&doc, date, g, &file)?,
            }
        }
        tracing::debug!(
            "loaded config \"{}\" with {} YAML document{}",
            file.display(),
            n,
            if n == 1 { "" } else { "s" }
        );
        Ok(true)
    }

    fn apply_root_document(&self, doc: &Mapping, file: &Path) -> Result<(), ConfigError> {
        // date_format first: it affects how later keys (e.g. exclude_dates
        // and override targets) are interpreted
        if let Some(v) = doc.get("date_format") {
            self.root_mut().set_date_format(&scalar_string("date_format", v)?)?;
        }

        let mut overrides: Vec<Mapping> = Vec::new();
        for (key, value) in doc {
            match key.as_str() {
                "date_format" => {}
                "overrides" => overrides = override_list(value)?,
                _ => self.apply_root_option(key, value)?,
            }
        }
        for o in overrides {
            self.apply_override(&o, None, file)?;
        }
        Ok(())
    }

    fn apply_root_option(&self, key: &str, value: &Value) -> Result<(), ConfigError> {
        let mut root = self.root_mut();
        match key {
            "database" => root.database = PathBuf::from(scalar_string(key, value)?),
            "log" => {
                root.log_file = match coerce_none(value) {
                    Some(s) => Some(PathBuf::from(s)),
                    None => None,
                }
            }
            "verbose" => {
                if scalar_bool(key, value)? {
                    root.log_level = LogLevel::Verbose;
                }
            }
            "quiet" => {
                if scalar_bool(key, value)? {
                    root.log_level = LogLevel::Quiet;
                }
            }
            "silent" => {
                if scalar_bool(key, value)? {
                    root.log_level = LogLevel::Silent;
                }
            }
            "workers" => root.set_workers(scalar_int(key, value)?)?,
            "max_processing_errors" => root.set_max_processing_errors(scalar_int(key, value)?)?,
            "sample" => {
                root.sample = match coerce_none(value) {
                    Some(s) => Sample::parse(&s)?,
                    None => Sample::Off,
                }
            }
            "group_ordering" => {
                root.group_ordering = GroupOrdering::parse(&scalar_string(key, value)?)?
            }
            "exclude_dates" => root.add_exclude_dates(string_list(key, value)?),
            "include_dates" => root.add_include_dates(string_list(key, value)?),
            "exclude_groups" => root.add_exclude_groups(string_list(key, value)?),
            "include_groups" => root.add_include_groups(string_list(key, value)?),
            "exclude_photos" => root.add_exclude_photos(string_list(key, value)?),
            "include_photos" => root.add_include_photos(string_list(key, value)?),
            _ => {
                let mut staged = PhotoOverrides::default();
                if !apply_photo_option(key, value, &mut staged)? {
                    return Err(ConfigError::value(
                        key,
                        "unknown configuration option for the root configuration file",
                    ));
                }
                staged.apply(&mut root.defaults);
            }
        }
        Ok(())
    }

    fn apply_date_document(
        &self,
        doc: &Mapping,
        date: &str,
        file: &Path,
    ) -> Result<(), ConfigError> {
        let mut overrides: Vec<Mapping> = Vec::new();
        for (key, value) in doc {
            match key.as_str() {
                "overrides" => overrides = override_list(value)?,
                "group_ordering" => {
                    let ordering = GroupOrdering::parse(&scalar_string(key, value)?)?;
                    self.with_date(date, |d| d.group_ordering = Some(ordering))?;
                }
                "exclude_groups" => {
                    let items = string_list(key, value)?;
                    self.with_date(date, |d| d.add_exclude_groups(items))?;
                }
                "include_groups" => {
                    let items = string_list(key, value)?;
                    self.with_date(date, |d| d.add_include_groups(items))?;
                }
                "exclude_photos" => {
                    let items = string_list(key, value)?;
                    self.with_date(date, |d| d.add_exclude_photos(items))?;
                }
                "include_photos" => {
                    let items = string_list(key, value)?;
                    self.with_date(date, |d| d.add_include_photos(items))?;
                }
                _ => {
                    let mut staged = PhotoOverrides::default();
                    if !apply_photo_option(key, value, &mut staged)? {
                        return Err(ConfigError::value(
                            key,
                            format!("unknown configuration option for date \"{date}\""),
                        ));
                    }
                    self.with_date(date, |d| merge_overrides(&mut d.overrides, staged))?;
                }
            }
        }
        for o in overrides {
            self.apply_override(&o, Some(date), file)?;
        }
        Ok(())
    }

    fn apply_group_document(
        &self,
        doc: &Mapping,
        date: &str,
        group: &str,
        _file: &Path,
    ) -> Result<(), ConfigError> {
        for (key, value) in doc {
            match key.as_str() {
                "overrides" => {
                    return Err(ConfigError::value(
                        "overrides",
                        "overrides are only supported at the root and date levels",
                    ));
                }
                "exclude_photos" => {
                    let items = string_list(key, value)?;
                    self.with_group(date, group, |g| g.add_exclude_photos(items))?;
                }
                "include_photos" => {
                    let items = string_list(key, value)?;
                    self.with_group(date, group, |g| g.add_include_photos(items))?;
                }
                _ => {
                    let mut staged = PhotoOverrides::default();
                    if !apply_photo_option(key, value, &mut staged)? {
                        return Err(ConfigError::value(
                            key,
                            format!("unknown configuration option for group \"{date}/{group}\""),
                        ));
                    }
                    self.with_group(date, group, |g| merge_overrides(&mut g.overrides, staged))?;
                }
            }
        }
        Ok(())
    }

    /// Force photo-level options onto every existing date and group node,
    /// clearing any conflicting per-directory overrides. Command-line
    /// arguments use this so they beat date- and group-level YAML files.
    pub fn propagate_photo_overrides(&self, staged: &PhotoOverrides) {
        let mut tree = self.tree.write().expect("config tree lock poisoned");
        for node in tree.values_mut() {
            match node {
                Node::Date(date) => merge_overrides(&mut date.overrides, staged.clone()),
                Node::Group(group) => merge_overrides(&mut group.overrides, staged.clone()),
            }
        }
    }

    /// Force a group ordering onto every existing date node; see
    /// [`ConfigManager::propagate_photo_overrides`].
    pub fn propagate_group_ordering(&self, ordering: GroupOrdering) {
        let mut tree = self.tree.write().expect("config tree lock poisoned");
        for node in tree.values_mut() {
            if let Node::Date(date) = node {
                date.group_ordering = Some(ordering);
            }
        }
    }

    /// Apply one `overrides:` entry: a sub-document targeted at a date
    /// (root files only) or a group.
    fn apply_override(
        &self,
        doc: &Mapping,
        date_context: Option<&str>,
        file: &Path,
    ) -> Result<(), ConfigError> {
        let date_str = doc.get("date").map(|v| scalar_string("date", v)).transpose()?;
        let group_str = doc.get("group").map(|v| scalar_string("group", v)).transpose()?;
        let date_str = date_str.filter(|s| !s.trim().is_empty());
        let group_str = group_str.filter(|s| !s.trim().is_empty());

        let date = match (date_context, &date_str) {
            (None, None) => {
                return Err(ConfigError::file(
                    file.display(),
                    "a config override in the root file must specify a date",
                ));
            }
            (Some(ctx), Some(d)) if ctx != d => {
                return Err(ConfigError::file(
                    file.display(),
                    format!("unexpected date \"{d}\" in an override inside the \"{ctx}\" config"),
                ));
            }
            (Some(ctx), _) => ctx.to_string(),
            (None, Some(d)) => d.clone(),
        };

        if group_str.is_none() && date_context.is_some() {
            return Err(ConfigError::file(
                file.display(),
                format!("a config override in the \"{date}\" config must specify a group"),
            ));
        }

        let mut body = doc.clone();
        body.remove("date");
        body.remove("group");

        match group_str {
            Some(group) => self.apply_group_document(&body, &date, &group, file),
            None => self.apply_date_document(&body, &date, file),
        }
    }
}

fn merge_overrides(target: &mut PhotoOverrides, staged: PhotoOverrides) {
    macro_rules! take {
        ($field:ident) => {
            if staged.$field.is_some() {
                target.$field = staged.$field;
            }
        };
    }
    take!(white_balance);
    take!(chromatic_aberration);
    take!(median_filter);
    take!(dark_frame);
    take!(flip_rotate);
    take!(thumbnail_location);
    take!(thumbnail_path);
    take!(use_embedded_thumbnail);
    take!(thumbnail_resize_factor);
    take!(thumbnail_quality);
}

/// Parse a photo-level option into `staged`. Returns false when the key is
/// not a photo-level option at all.
fn apply_photo_option(
    key: &str,
    value: &Value,
    staged: &mut PhotoOverrides,
) -> Result<bool, ConfigError> {
    match key {
        "white_balance" => staged.white_balance = Some(parse_white_balance(value)?),
        "chromatic_aberration" => {
            staged.chromatic_aberration = Some(parse_chromatic_aberration(value)?)
        }
        "median_filter" => staged.set_median_filter(scalar_int(key, value)?)?,
        "dark_frame" => {
            staged.dark_frame = Some(coerce_none(value).map(PathBuf::from));
        }
        "flip_rotate" => {
            staged.flip_rotate = Some(match value {
                Value::Number(n) => FlipRotate::parse(&n.to_string())?,
                other => FlipRotate::parse(&scalar_string(key, other)?)?,
            })
        }
        "thumbnail_location" => {
            staged.thumbnail_location = Some(ThumbLocation::parse(&scalar_string(key, value)?)?)
        }
        "thumbnail_path" => staged.thumbnail_path = Some(PathBuf::from(scalar_string(key, value)?)),
        "use_embedded_thumbnail" => {
            staged.use_embedded_thumbnail = Some(scalar_bool(key, value)?)
        }
        "thumbnail_resize_factor" => {
            staged.set_thumbnail_resize_factor(scalar_f64(key, value)?)?
        }
        "thumbnail_quality" => staged.set_thumbnail_quality(scalar_int(key, value)?)?,
        _ => return Ok(false),
    }
    Ok(true)
}

// ── YAML plumbing ─────────────────────────────────────────────────────────────

/// A parsed YAML document with lowercase string keys, duplicates rejected.
type Mapping = BTreeMap<String, Value>;

fn load_config_documents(file: &Path) -> Result<Vec<Mapping>, ConfigError> {
    let text = std::fs::read_to_string(file)
        .map_err(|e| ConfigError::file(file.display(), e.to_string()))?;

    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(&text) {
        let value = Value::deserialize(de)
            .map_err(|e| ConfigError::file(file.display(), e.to_string()))?;
        if value.is_null() {
            continue;
        }
        docs.push(normalize_mapping(&value).map_err(|e| ConfigError::file(file.display(), e))?);
    }

    if docs.is_empty() {
        return Err(ConfigError::file(
            file.display(),
            "couldn't find any YAML documents; is it empty?",
        ));
    }
    Ok(docs)
}

/// Lowercase all keys of a YAML mapping and reject duplicates. Option keys
/// are case-insensitive by design, so `Workers` and `workers` collide.
fn normalize_mapping(value: &Value) -> Result<Mapping, String> {
    let Value::Mapping(map) = value else {
        return Err("expected a mapping of option names to values".to_string());
    };
    let mut out = Mapping::new();
    for (k, v) in map {
        let Value::String(k) = k else {
            return Err(format!("expected string keys in YAML mapping, got {k:?}"));
        };
        let key = k.to_lowercase();
        if out.insert(key.clone(), v.clone()).is_some() {
            return Err(format!(
                "duplicate key \"{key}\"; configuration keys are case-insensitive"
            ));
        }
    }
    Ok(out)
}

fn override_list(value: &Value) -> Result<Vec<Mapping>, ConfigError> {
    let items: Vec<&Value> = match value {
        Value::Sequence(seq) => seq.iter().collect(),
        other => vec![other],
    };
    items
        .into_iter()
        .map(|v| normalize_mapping(v).map_err(|e| ConfigError::value("overrides", e)))
        .collect()
}

fn scalar_string(key: &str, value: &Value) -> Result<String, ConfigError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ConfigError::value(
            key,
            format!("expected a scalar value, got {other:?}"),
        )),
    }
}

fn scalar_bool(key: &str, value: &Value) -> Result<bool, ConfigError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" => Ok(true),
            "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::value(key, format!("expected a boolean, got \"{other}\""))),
        },
        other => Err(ConfigError::value(key, format!("expected a boolean, got {other:?}"))),
    }
}

fn scalar_int(key: &str, value: &Value) -> Result<i64, ConfigError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| ConfigError::value(key, format!("expected an integer, got {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| ConfigError::value(key, format!("expected an integer, got \"{s}\""))),
        other => Err(ConfigError::value(key, format!("expected an integer, got {other:?}"))),
    }
}

fn scalar_f64(key: &str, value: &Value) -> Result<f64, ConfigError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ConfigError::value(key, format!("expected a number, got {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| ConfigError::value(key, format!("expected a number, got \"{s}\""))),
        other => Err(ConfigError::value(key, format!("expected a number, got {other:?}"))),
    }
}

/// A single string or a sequence of scalars. A comma-separated string is
/// split on commas, with backslash escaping a literal comma.
fn string_list(key: &str, value: &Value) -> Result<Vec<String>, ConfigError> {
    match value {
        Value::Null => Ok(vec![]),
        Value::Sequence(seq) => seq.iter().map(|v| scalar_string(key, v)).collect(),
        Value::String(s) => Ok(split_csv(s)),
        other => Err(ConfigError::value(
            key,
            format!("expected a string or list of strings, got {other:?}"),
        )),
    }
}

fn split_csv(s: &str) -> Vec<String> {
    if s.trim().is_empty() {
        return vec![];
    }
    let mut items = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == ',' {
            items.push(current.trim().to_string());
            current = String::new();
        } else {
            current.push(c);
        }
    }
    items.push(current.trim().to_string());
    items.retain(|i| !i.is_empty());
    items
}

/// False or a falsy string (`""`, `"0"`, `"na"`, `"no"`, `"n/a"`, `"off"`,
/// `"false"`, `"disable"`) reads as None; anything else as its string form.
fn coerce_none(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(false) => None,
        Value::String(s) => {
            let lower = s.trim().to_lowercase();
            if matches!(lower.as_str(), "" | "0" | "na" | "no" | "n/a" | "off" | "false" | "disable")
            {
                None
            } else {
                Some(s.trim().to_string())
            }
        }
        other => scalar_string("value", other).ok(),
    }
}

fn parse_white_balance(value: &Value) -> Result<WhiteBalance, ConfigError> {
    match value {
        Value::String(s) => WhiteBalance::parse(s),
        Value::Sequence(seq) => {
            let floats: Result<Vec<f64>, _> =
                seq.iter().map(|v| scalar_f64("white_balance", v)).collect();
            WhiteBalance::from_multipliers(&floats?)
        }
        Value::Mapping(_) => {
            let map = normalize_mapping(value).map_err(|e| ConfigError::value("white_balance", e))?;
            let get = |names: &[&str]| -> Option<&Value> {
                names.iter().find_map(|n| map.get(*n))
            };
            let r = get(&["r", "red"])
                .ok_or_else(|| ConfigError::value("white_balance", "missing red multiplier"))?;
            let g1 = get(&["g1", "green_1", "green1", "g", "green"])
                .ok_or_else(|| ConfigError::value("white_balance", "missing green multiplier"))?;
            let b = get(&["b", "blue"])
                .ok_or_else(|| ConfigError::value("white_balance", "missing blue multiplier"))?;
            // green_2 falls back to green_1 when omitted
            let g2 = get(&["g2", "green_2", "green2"]).unwrap_or(g1);
            WhiteBalance::from_multipliers(&[
                scalar_f64("white_balance", r)?,
                scalar_f64("white_balance", g1)?,
                scalar_f64("white_balance", b)?,
                scalar_f64("white_balance", g2)?,
            ])
        }
        other => Err(ConfigError::value(
            "white_balance",
            format!("expected a string, list, or mapping, got {other:?}"),
        )),
    }
}

fn parse_chromatic_aberration(value: &Value) -> Result<ChromaticAberration, ConfigError> {
    match value {
        Value::String(s) => ChromaticAberration::parse(s),
        Value::Sequence(seq) => {
            let floats: Result<Vec<f64>, _> = seq
                .iter()
                .map(|v| scalar_f64("chromatic_aberration", v))
                .collect();
            ChromaticAberration::from_multipliers(&floats?)
        }
        Value::Mapping(_) => {
            let map = normalize_mapping(value)
                .map_err(|e| ConfigError::value("chromatic_aberration", e))?;
            let r = map.get("r").or_else(|| map.get("red")).ok_or_else(|| {
                ConfigError::value("chromatic_aberration", "missing red multiplier")
            })?;
            let b = map.get("b").or_else(|| map.get("blue")).ok_or_else(|| {
                ConfigError::value("chromatic_aberration", "missing blue multiplier")
            })?;
            ChromaticAberration::from_multipliers(&[
                scalar_f64("chromatic_aberration", r)?,
                scalar_f64("chromatic_aberration", b)?,
            ])
        }
        other => Err(ConfigError::value(
            "chromatic_aberration",
            format!("expected a string, list, or mapping, got {other:?}"),
        )),
    }
}

fn list_subdirs(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect()
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Write a root config file populated with the default settings, used by
/// `--make_config` when the file doesn't exist yet.
pub fn write_default_config(file: &Path) -> Result<(), ConfigError> {
    let text = "\
# tlmerge project configuration.
# Option names are case-insensitive. A root file may also contain an
# `overrides:` list of date- or group-targeted sub-documents.
date_format: '%Y-%m-%d'
group_ordering: abc
workers: 20
max_processing_errors: 5
sample: null
white_balance: [1.0, 1.0, 1.0, 1.0]
chromatic_aberration: [1.0, 1.0]
median_filter: 0
dark_frame: null
thumbnail_location: root
thumbnail_path: thumb
use_embedded_thumbnail: true
thumbnail_resize_factor: 1.0
thumbnail_quality: 75
exclude_dates: []
include_dates: []
exclude_groups: []
include_groups: []
exclude_photos: []
include_photos: []
";
    std::fs::write(file, text).map_err(|e| ConfigError::file(file.display(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn manager() -> (TempDir, ConfigManager) {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = ConfigManager::new(tmp.path().to_path_buf()).unwrap();
        (tmp, mgr)
    }

    #[test]
    fn test_root_value_inherited_by_new_date_and_group() {
        let (_tmp, mgr) = manager();
        mgr.root_mut().defaults.thumbnail_quality = 90;

        mgr.with_date("2025-01-01", |_| ()).unwrap();
        mgr.with_group("2025-01-01", "a", |_| ()).unwrap();

        let opts = mgr.photo_options("2025-01-01", "a");
        assert_eq!(opts.thumbnail_quality, 90);
    }

    #[test]
    fn test_group_override_survives_root_reset() {
        let (_tmp, mgr) = manager();
        mgr.with_group("2025-01-01", "a", |g| {
            g.overrides.set_thumbnail_quality(50).unwrap();
        })
        .unwrap();

        // Changing the root afterwards must not clobber the group override
        mgr.root_mut().defaults.thumbnail_quality = 99;

        assert_eq!(mgr.photo_options("2025-01-01", "a").thumbnail_quality, 50);
        // A sibling group without an override still follows the root
        assert_eq!(mgr.photo_options("2025-01-01", "b").thumbnail_quality, 99);
    }

    #[test]
    fn test_parent_change_propagates_to_existing_children() {
        let (_tmp, mgr) = manager();
        mgr.with_group("2025-01-01", "a", |_| ()).unwrap();
        mgr.root_mut().defaults.median_filter = 3;
        assert_eq!(mgr.photo_options("2025-01-01", "a").median_filter, 3);
    }

    #[test]
    fn test_new_date_validated_against_format() {
        let (_tmp, mgr) = manager();
        assert!(mgr.with_date("not-a-date", |_| ()).is_err());
        assert!(mgr.with_date("2025-06-15", |_| ()).is_ok());
    }

    #[test]
    fn test_group_filter_scopes_root_entries() {
        let (_tmp, mgr) = manager();
        mgr.root_mut()
            .add_exclude_groups(vec!["2025-01-01/a".to_string(), "everywhere".to_string()]);

        let f = mgr.group_filter("2025-01-01");
        assert!(!f.allows("a"));
        assert!(!f.allows("everywhere"));
        assert!(f.allows("b"));

        // A different date is unaffected by the date-qualified entry
        let f2 = mgr.group_filter("2025-01-02");
        assert!(f2.allows("a"));
        assert!(!f2.allows("everywhere"));
    }

    #[test]
    fn test_photo_filter_unions_all_levels() {
        let (_tmp, mgr) = manager();
        mgr.root_mut()
            .add_exclude_photos(vec!["2025-01-01/a/root.dng".to_string()]);
        mgr.with_date("2025-01-01", |d| {
            d.add_exclude_photos(vec!["a/date.dng".to_string()]);
        })
        .unwrap();
        mgr.with_group("2025-01-01", "a", |g| {
            g.add_exclude_photos(vec!["group.dng".to_string()]);
            g.add_include_photos(vec!["group.dng".to_string()]);
        })
        .unwrap();

        let f = mgr.photo_filter("2025-01-01", "a");
        assert!(!f.allows("root.dng"));
        assert!(!f.allows("date.dng"));
        // excluded but rescued by include
        assert!(f.allows("group.dng"));
        assert!(f.allows("other.dng"));
    }

    #[test]
    fn test_load_root_file_applies_options() {
        let (tmp, mgr) = manager();
        let file = tmp.path().join(DEFAULT_CONFIG_FILE);
        fs::write(
            &file,
            "workers: 4\nSample: '~3'\nthumbnail_quality: 60\nexclude_dates: 2025-01-05\n",
        )
        .unwrap();

        assert!(mgr.load_root_file(&file).unwrap());
        let root = mgr.root();
        assert_eq!(root.workers(), 4);
        assert_eq!(root.sample, Sample::Random(3));
        assert_eq!(root.defaults.thumbnail_quality, 60);
        assert!(root.exclude_dates.contains("2025-01-05"));
    }

    #[test]
    fn test_load_root_file_missing_is_ok() {
        let (tmp, mgr) = manager();
        assert!(!mgr.load_root_file(&tmp.path().join("nope.tlmerge")).unwrap());
    }

    #[test]
    fn test_unknown_key_is_fatal() {
        let (tmp, mgr) = manager();
        let file = tmp.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&file, "wokers: 4\n").unwrap();
        assert!(mgr.load_root_file(&file).is_err());
    }

    #[test]
    fn test_duplicate_case_insensitive_keys_rejected() {
        let (tmp, mgr) = manager();
        let file = tmp.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&file, "workers: 4\nWorkers: 5\n").unwrap();
        assert!(mgr.load_root_file(&file).is_err());
    }

    #[test]
    fn test_root_overrides_target_date_and_group() {
        let (tmp, mgr) = manager();
        let file = tmp.path().join(DEFAULT_CONFIG_FILE);
        fs::write(
            &file,
            concat!(
                "thumbnail_quality: 80\n",
                "overrides:\n",
                "  - date: '2025-01-01'\n",
                "    group_ordering: num\n",
                "  - date: '2025-01-01'\n",
                "    group: a\n",
                "    thumbnail_quality: 40\n",
            ),
        )
        .unwrap();

        mgr.load_root_file(&file).unwrap();
        assert_eq!(mgr.group_ordering("2025-01-01"), GroupOrdering::Num);
        assert_eq!(mgr.photo_options("2025-01-01", "a").thumbnail_quality, 40);
        assert_eq!(mgr.photo_options("2025-01-01", "b").thumbnail_quality, 80);
    }

    #[test]
    fn test_override_without_date_in_root_file_fails() {
        let (tmp, mgr) = manager();
        let file = tmp.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&file, "overrides:\n  - group: a\n    thumbnail_quality: 40\n").unwrap();
        assert!(mgr.load_root_file(&file).is_err());
    }

    #[test]
    fn test_load_all_picks_up_date_and_group_files() {
        let (tmp, mgr) = manager();
        let group_dir = tmp.path().join("2025-01-01").join("a");
        fs::create_dir_all(&group_dir).unwrap();
        fs::write(
            tmp.path().join("2025-01-01").join(DEFAULT_CONFIG_FILE),
            "group_ordering: natural\n",
        )
        .unwrap();
        fs::write(group_dir.join(DEFAULT_CONFIG_FILE), "median_filter: 2\n").unwrap();

        let n = mgr.load_all().unwrap();
        assert_eq!(n, 2);
        assert_eq!(mgr.group_ordering("2025-01-01"), GroupOrdering::Natural);
        assert_eq!(mgr.photo_options("2025-01-01", "a").median_filter, 2);
    }

    #[test]
    fn test_group_file_rejects_overrides() {
        let (tmp, mgr) = manager();
        let group_dir = tmp.path().join("2025-01-01").join("a");
        fs::create_dir_all(&group_dir).unwrap();
        fs::write(
            group_dir.join(DEFAULT_CONFIG_FILE),
            "overrides:\n  - group: b\n    median_filter: 1\n",
        )
        .unwrap();
        assert!(mgr.load_all().is_err());
    }

    #[test]
    fn test_white_balance_mapping_form() {
        let (tmp, mgr) = manager();
        let file = tmp.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&file, "white_balance:\n  r: 2.0\n  g1: 1.0\n  b: 1.5\n").unwrap();
        mgr.load_root_file(&file).unwrap();
        assert_eq!(
            mgr.root().defaults.white_balance,
            WhiteBalance::Manual([2.0, 1.0, 1.5, 1.0])
        );
    }

    #[test]
    fn test_multi_document_file() {
        let (tmp, mgr) = manager();
        let file = tmp.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&file, "workers: 3\n---\nthumbnail_quality: 42\n").unwrap();
        mgr.load_root_file(&file).unwrap();
        assert_eq!(mgr.root().workers(), 3);
        assert_eq!(mgr.root().defaults.thumbnail_quality, 42);
    }

    #[test]
    fn test_write_default_config_roundtrips() {
        let (tmp, mgr) = manager();
        let file = tmp.path().join(DEFAULT_CONFIG_FILE);
        write_default_config(&file).unwrap();
        assert!(mgr.load_root_file(&file).unwrap());
        assert_eq!(mgr.root().workers(), 20);
    }

    #[test]
    fn test_split_csv_escapes() {
        assert_eq!(split_csv("a, b, c"), vec!["a", "b", "c"]);
        assert_eq!(split_csv("a\\,b, c"), vec!["a,b", "c"]);
        assert!(split_csv("  ").is_empty());
    }
}
