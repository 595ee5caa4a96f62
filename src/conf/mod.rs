pub mod log;
pub mod manager;
pub mod options;
pub mod tree;

pub use manager::ConfigManager;
pub use options::{
    ChromaticAberration, FlipRotate, GroupOrdering, LogLevel, Sample, ThumbLocation, WhiteBalance,
};
pub use tree::{DateConfig, GroupConfig, PhotoOptions, RootConfig};

/// Per-directory configuration file name. A file with this name in a group
/// directory is never treated as a photo.
pub const DEFAULT_CONFIG_FILE: &str = "config.tlmerge";

/// Database file created in the working directory when `--database` is not
/// given.
pub const DEFAULT_DATABASE_FILE: &str = "tlmerge.sqlite";

/// Prefix for environment-variable overrides, e.g. `TLMERGE_WORKERS`.
pub const ENV_VAR_PREFIX: &str = "TLMERGE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {option}: {reason}")]
    Value { option: String, reason: String },

    #[error("invalid config file \"{file}\": {reason}")]
    File { file: String, reason: String },
}

impl ConfigError {
    pub fn value(option: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Value {
            option: option.into(),
            reason: reason.into(),
        }
    }

    pub fn file(file: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        ConfigError::File {
            file: file.to_string(),
            reason: reason.into(),
        }
    }
}
