//! The metadata record produced for each photo by the extractor and
//! reconciled against the database by the orchestrator.

use chrono::{DateTime, FixedOffset};

/// The six attributes that identify a camera row. Two photos sharing all of
/// them (null-equals-null) share one row.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraIdentity {
    pub make: String,
    pub model: String,
    pub daylight_wb_red: Option<f64>,
    pub daylight_wb_green1: Option<f64>,
    pub daylight_wb_blue: Option<f64>,
    pub daylight_wb_green2: Option<f64>,
}

impl CameraIdentity {
    pub fn label(&self) -> String {
        format!("{} {}", self.make, self.model)
    }
}

/// The nine attributes that identify a lens row. A lens with make, model,
/// and spec all absent is not stored at all; [`PhotoMetadata::lens`] is
/// `None` in that case.
#[derive(Debug, Clone, PartialEq)]
pub struct LensIdentity {
    pub make: Option<String>,
    pub model: Option<String>,
    pub spec: Option<String>,
    pub min_focal_length: f64,
    pub max_focal_length: f64,
    pub lens_f_stops: f64,
    pub max_aperture_min_focal: f64,
    pub max_aperture_max_focal: f64,
    pub effective_max_aperture: f64,
}

impl LensIdentity {
    /// A lens is storable only when at least one identity string is known.
    pub fn is_identified(&self) -> bool {
        self.make.is_some() || self.model.is_some() || self.spec.is_some()
    }

    pub fn label(&self) -> String {
        format!(
            "{} {}",
            self.make.as_deref().unwrap_or("(unknown make)"),
            self.model.as_deref().unwrap_or("(unknown model)")
        )
    }
}

/// Everything extracted from one photo file: identity, capture settings,
/// raster dimensions, sensor statistics, and the camera/lens identities.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoMetadata {
    // Identity within the project: directory names, not parsed dates
    pub date: String,
    pub group: String,
    pub file_name: String,

    // Capture
    pub time_taken: DateTime<FixedOffset>,
    pub file_size_kb: i64,
    pub iso: Option<i64>,
    pub shutter_speed: Option<String>,
    pub aperture: Option<f64>,
    pub focal_length: Option<f64>,
    pub auto_focus: Option<bool>,
    pub focus_distance: f64,
    pub field_of_view: f64,

    // Raster
    pub raw_width: i64,
    pub raw_height: i64,
    pub width: i64,
    pub height: i64,
    pub thumb_width: Option<i64>,
    pub thumb_height: Option<i64>,

    // White balance
    pub capture_wb_red: Option<f64>,
    pub capture_wb_green1: Option<f64>,
    pub capture_wb_blue: Option<f64>,
    pub capture_wb_green2: Option<f64>,
    pub avg_red: f64,
    pub avg_green: f64,
    pub avg_blue: f64,

    // Darkness and saturation levels
    pub black_level_red: f64,
    pub black_level_green1: f64,
    pub black_level_blue: f64,
    pub black_level_green2: f64,
    pub white_level_red: f64,
    pub white_level_green1: f64,
    pub white_level_blue: f64,
    pub white_level_green2: f64,

    // Brightness distribution
    pub brightness_min: i64,
    pub brightness_p10: f64,
    pub brightness_p20: f64,
    pub brightness_p30: f64,
    pub brightness_p40: f64,
    pub brightness_median: f64,
    pub brightness_p60: f64,
    pub brightness_p70: f64,
    pub brightness_p80: f64,
    pub brightness_p90: f64,
    pub brightness_max: i64,
    pub brightness_mean: f64,
    pub brightness_stdev: f64,
    pub brightness_iqr: f64,
    pub exposure_difference: Option<f64>,

    pub camera: CameraIdentity,
    pub lens: Option<LensIdentity>,
}

impl PhotoMetadata {
    /// The photo's relative path within the project as a single string,
    /// used as its identifier in logs and error messages.
    pub fn rel_path(&self) -> String {
        format!("{}/{}/{}", self.date, self.group, self.file_name)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    /// A fully-populated metadata record for tests, keyed by its identity
    /// triple. Same inputs produce an identical record, so idempotence
    /// tests work as they would with a real extractor.
    pub fn metadata(date: &str, group: &str, file_name: &str) -> PhotoMetadata {
        PhotoMetadata {
            date: date.to_string(),
            group: group.to_string(),
            file_name: file_name.to_string(),
            time_taken: FixedOffset::east_opt(3600)
                .unwrap()
                .with_ymd_and_hms(2025, 1, 1, 12, 30, 45)
                .unwrap(),
            file_size_kb: 24_210,
            iso: Some(200),
            shutter_speed: Some("1/250".to_string()),
            aperture: Some(5.6),
            focal_length: Some(35.0),
            auto_focus: Some(true),
            focus_distance: 5.31,
            field_of_view: 54.4,
            raw_width: 6048,
            raw_height: 4024,
            width: 6000,
            height: 4000,
            thumb_width: Some(160),
            thumb_height: Some(120),
            capture_wb_red: Some(2.1),
            capture_wb_green1: Some(1.0),
            capture_wb_blue: Some(1.6),
            capture_wb_green2: Some(1.0),
            avg_red: 87.2,
            avg_green: 110.5,
            avg_blue: 95.8,
            black_level_red: 512.0,
            black_level_green1: 512.0,
            black_level_blue: 512.0,
            black_level_green2: 512.0,
            white_level_red: 16383.0,
            white_level_green1: 16383.0,
            white_level_blue: 16383.0,
            white_level_green2: 16383.0,
            brightness_min: 2,
            brightness_p10: 18.0,
            brightness_p20: 31.0,
            brightness_p30: 44.0,
            brightness_p40: 58.0,
            brightness_median: 72.0,
            brightness_p60: 85.0,
            brightness_p70: 99.0,
            brightness_p80: 120.0,
            brightness_p90: 151.0,
            brightness_max: 248,
            brightness_mean: 79.4,
            brightness_stdev: 42.7,
            brightness_iqr: 66.0,
            exposure_difference: Some(-0.3),
            camera: CameraIdentity {
                make: "Nikon".to_string(),
                model: "Z 6".to_string(),
                daylight_wb_red: Some(2.19),
                daylight_wb_green1: Some(1.0),
                daylight_wb_blue: Some(1.52),
                daylight_wb_green2: Some(1.0),
            },
            lens: Some(LensIdentity {
                make: Some("Nikon".to_string()),
                model: Some("NIKKOR Z 35mm f/1.8 S".to_string()),
                spec: Some("35mm f/1.8".to_string()),
                min_focal_length: 35.0,
                max_focal_length: 35.0,
                lens_f_stops: 7.0,
                max_aperture_min_focal: 1.8,
                max_aperture_max_focal: 1.8,
                effective_max_aperture: 1.8,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lens_identified_requires_one_string() {
        let mut lens = fixtures::metadata("d", "g", "f").lens.unwrap();
        assert!(lens.is_identified());
        lens.make = None;
        lens.model = None;
        assert!(lens.is_identified(), "spec alone identifies a lens");
        lens.spec = None;
        assert!(!lens.is_identified());
    }

    #[test]
    fn test_rel_path_joins_identity() {
        let m = fixtures::metadata("2025-01-01", "a", "0001.dng");
        assert_eq!(m.rel_path(), "2025-01-01/a/0001.dng");
    }

    #[test]
    fn test_identical_metadata_compares_equal() {
        let a = fixtures::metadata("2025-01-01", "a", "0001.dng");
        let b = fixtures::metadata("2025-01-01", "a", "0001.dng");
        assert_eq!(a, b);
    }
}
