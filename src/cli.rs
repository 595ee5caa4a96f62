//! Command-line front end. Every option is also settable through a
//! `TLMERGE_*` environment variable; explicit flags win over the
//! environment, and both win over YAML config files (which is why
//! [`Cli::apply_to`] runs after the files are loaded).

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::conf::tree::PhotoOverrides;
use crate::conf::{
    ChromaticAberration, ConfigError, ConfigManager, GroupOrdering, LogLevel, Sample,
    ThumbLocation, WhiteBalance,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Walk the project and report photo counts without touching the database
    Scan,
    /// Extract metadata for every photo and reconcile it with the database
    Preprocess,
    /// Emit JPEG thumbnails for every photo
    Thumb,
}

#[derive(Parser, Debug)]
#[command(
    name = "tlmerge",
    version,
    about = "Batch ingestion pipeline for time-lapse photography projects"
)]
pub struct Cli {
    /// Execution mode
    #[arg(value_enum)]
    pub mode: Mode,

    /// Timelapse project directory
    #[arg(short = 'p', long, env = "TLMERGE_PROJECT", value_name = "PATH")]
    pub project: Option<PathBuf>,

    /// Root config file (defaults to config.tlmerge in the project dir)
    #[arg(short = 'c', long, env = "TLMERGE_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Database file path
    #[arg(short = 'd', long, env = "TLMERGE_DATABASE", value_name = "FILE")]
    pub database: Option<PathBuf>,

    /// Write a config file with default settings if none exists
    #[arg(long = "make_config")]
    pub make_config: bool,

    /// Worker thread count hint (minimum 1)
    #[arg(long, env = "TLMERGE_WORKERS", value_name = "N")]
    pub workers: Option<i64>,

    /// Recoverable task failures tolerated before the run is cancelled
    #[arg(long = "max_processing_errors", env = "TLMERGE_MAX_PROCESSING_ERRORS", value_name = "N")]
    pub max_processing_errors: Option<i64>,

    /// Process only the first N photos ("N"), N random photos ("~N"), or
    /// everything ("-1")
    #[arg(long, env = "TLMERGE_SAMPLE", allow_hyphen_values = true)]
    pub sample: Option<String>,

    /// Log file path; pass without a value to disable file logging
    #[arg(
        long,
        env = "TLMERGE_LOG",
        value_name = "FILE",
        num_args = 0..=1,
        default_missing_value = ""
    )]
    pub log: Option<String>,

    /// Debug-level console output
    #[arg(short = 'v', long, conflicts_with_all = ["quiet", "silent"])]
    pub verbose: bool,

    /// Warnings and errors only
    #[arg(short = 'q', long, conflicts_with = "silent")]
    pub quiet: bool,

    /// No console output at all
    #[arg(short = 's', long)]
    pub silent: bool,

    /// Date directory format, e.g. "yyyy-mm-dd" or "%Y-%m-%d"
    #[arg(long = "date_format", env = "TLMERGE_DATE_FORMAT", value_name = "FMT")]
    pub date_format: Option<String>,

    #[arg(long = "include_dates", env = "TLMERGE_INCLUDE_DATES", num_args = 1.., value_name = "DATE")]
    pub include_dates: Vec<String>,

    #[arg(long = "exclude_dates", env = "TLMERGE_EXCLUDE_DATES", num_args = 1.., value_name = "DATE")]
    pub exclude_dates: Vec<String>,

    #[arg(long = "include_groups", env = "TLMERGE_INCLUDE_GROUPS", num_args = 1.., value_name = "DATE/GROUP")]
    pub include_groups: Vec<String>,

    #[arg(long = "exclude_groups", env = "TLMERGE_EXCLUDE_GROUPS", num_args = 1.., value_name = "DATE/GROUP")]
    pub exclude_groups: Vec<String>,

    /// Group ordering policy: abc, natural, or num
    #[arg(long = "group_ordering", env = "TLMERGE_GROUP_ORDERING", value_name = "POLICY")]
    pub group_ordering: Option<String>,

    /// White balance multipliers: R G1 B G2 (or R G B)
    #[arg(long = "white_balance", env = "TLMERGE_WHITE_BALANCE", num_args = 1..=4, value_name = "MULT")]
    pub white_balance: Option<Vec<String>>,

    /// Chromatic aberration multipliers: R B
    #[arg(long = "chromatic_aberration", env = "TLMERGE_CHROMATIC_ABERRATION", num_args = 1..=2, value_name = "MULT")]
    pub chromatic_aberration: Option<Vec<String>>,

    /// Median filter passes
    #[arg(long = "median_filter", env = "TLMERGE_MEDIAN_FILTER", value_name = "N")]
    pub median_filter: Option<i64>,

    /// Dark frame file subtracted while developing
    #[arg(long = "dark_frame", env = "TLMERGE_DARK_FRAME", value_name = "FILE")]
    pub dark_frame: Option<PathBuf>,

    /// Thumbnail directory placement: root, date, group, or custom
    #[arg(long = "thumbnail_location", env = "TLMERGE_THUMBNAIL_LOCATION", value_name = "WHERE")]
    pub thumbnail_location: Option<String>,

    /// Thumbnail directory name (or absolute path for custom placement)
    #[arg(long = "thumbnail_path", env = "TLMERGE_THUMBNAIL_PATH", value_name = "NAME")]
    pub thumbnail_path: Option<PathBuf>,

    /// Thumbnail scale factor in (0, 1]
    #[arg(long = "thumbnail_resize_factor", env = "TLMERGE_THUMBNAIL_RESIZE_FACTOR", value_name = "F")]
    pub thumbnail_resize_factor: Option<f64>,

    /// Thumbnail JPEG quality, 0 to 100
    #[arg(long = "thumbnail_quality", env = "TLMERGE_THUMBNAIL_QUALITY", value_name = "Q")]
    pub thumbnail_quality: Option<i64>,
}

impl Cli {
    /// Apply every explicitly given option to the configuration tree.
    /// Called after YAML loading, so CLI and environment values win; photo
    /// options are also forced onto existing date/group nodes.
    pub fn apply_to(&self, config: &ConfigManager) -> Result<(), ConfigError> {
        {
            let mut root = config.root_mut();
            if let Some(database) = &self.database {
                root.database = database.clone();
            }
            if let Some(log) = &self.log {
                root.log_file = parse_log_value(log);
            }
            if self.verbose {
                root.log_level = LogLevel::Verbose;
            } else if self.quiet {
                root.log_level = LogLevel::Quiet;
            } else if self.silent {
                root.log_level = LogLevel::Silent;
            }
            if let Some(workers) = self.workers {
                root.set_workers(workers)?;
            }
            if let Some(mpe) = self.max_processing_errors {
                root.set_max_processing_errors(mpe)?;
            }
            if let Some(sample) = &self.sample {
                root.sample = Sample::parse(sample)?;
            }
            if let Some(fmt) = &self.date_format {
                root.set_date_format(fmt)?;
            }
            root.add_include_dates(self.include_dates.clone());
            root.add_exclude_dates(self.exclude_dates.clone());
            root.add_include_groups(self.include_groups.clone());
            root.add_exclude_groups(self.exclude_groups.clone());
        }

        if let Some(ordering) = &self.group_ordering {
            let ordering = GroupOrdering::parse(ordering)?;
            config.root_mut().group_ordering = ordering;
            config.propagate_group_ordering(ordering);
        }

        let staged = self.photo_overrides()?;
        staged.apply(&mut config.root_mut().defaults);
        config.propagate_photo_overrides(&staged);

        Ok(())
    }

    /// The photo-level options given on the command line, as one override
    /// set.
    fn photo_overrides(&self) -> Result<PhotoOverrides, ConfigError> {
        let mut staged = PhotoOverrides::default();
        if let Some(wb) = &self.white_balance {
            staged.white_balance = Some(WhiteBalance::parse(&wb.join(" "))?);
        }
        if let Some(ca) = &self.chromatic_aberration {
            staged.chromatic_aberration = Some(ChromaticAberration::parse(&ca.join(" "))?);
        }
        if let Some(mf) = self.median_filter {
            staged.set_median_filter(mf)?;
        }
        if let Some(df) = &self.dark_frame {
            staged.dark_frame = Some(Some(df.clone()));
        }
        if let Some(location) = &self.thumbnail_location {
            staged.thumbnail_location = Some(ThumbLocation::parse(location)?);
        }
        if let Some(path) = &self.thumbnail_path {
            staged.thumbnail_path = Some(path.clone());
        }
        if let Some(factor) = self.thumbnail_resize_factor {
            staged.set_thumbnail_resize_factor(factor)?;
        }
        if let Some(quality) = self.thumbnail_quality {
            staged.set_thumbnail_quality(quality)?;
        }
        Ok(staged)
    }
}

/// `--log` with no value (or a falsy one) disables the file; anything else
/// is the file path.
fn parse_log_value(value: &str) -> Option<PathBuf> {
    let lower = value.trim().to_lowercase();
    if matches!(
        lower.as_str(),
        "" | "0" | "na" | "no" | "n/a" | "off" | "false" | "disable"
    ) {
        None
    } else {
        Some(PathBuf::from(value.trim()))
    }
}
