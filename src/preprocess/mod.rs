pub mod exif;
pub mod extractor;
pub mod metadata;
pub mod metrics;
pub mod preprocessor;
pub mod raw;

#[cfg(test)]
mod integration_tests;

pub use metadata::PhotoMetadata;
pub use metrics::{PreprocessMetrics, PreprocessSummary};
pub use preprocessor::Preprocessor;

/// Failures while extracting metadata from one photo.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// The RAW decoder refuses the file. Handled by the pipeline's error
    /// handler: the file is counted as invalid and skipped, no database row
    /// is touched, and the error budget is unaffected.
    #[error("invalid photo file \"{path}\": {reason}")]
    InvalidFile { path: String, reason: String },

    /// The file decoded, but a mandatory value is missing or malformed.
    /// Counts against the error budget.
    #[error("metadata failure for \"{path}\": {reason}")]
    Metadata { path: String, reason: String },
}
