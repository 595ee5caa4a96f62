//! Per-photo metadata extraction: RAW decode first (which also vets the
//! file), then the EXIF pass through the calling worker's thread-local
//! reader, merged into one [`PhotoMetadata`].

use std::cell::RefCell;
use std::path::Path;

use crate::preprocess::exif::{ExifFields, ExifReader};
use crate::preprocess::metadata::{CameraIdentity, LensIdentity, PhotoMetadata};
use crate::preprocess::raw::{self, RawSummary};
use crate::preprocess::ExtractError;

thread_local! {
    static EXIF_READER: RefCell<Option<ExifReader>> = const { RefCell::new(None) };
}

/// Tear down the calling thread's EXIF reader. Wired into the worker pool's
/// close hook so each worker disposes its own reader on exit.
pub fn close_thread_exif_reader() {
    EXIF_READER.with(|slot| {
        slot.borrow_mut().take();
    });
}

fn with_thread_exif_reader<R>(f: impl FnOnce(&ExifReader) -> R) -> R {
    EXIF_READER.with(|slot| {
        let mut slot = slot.borrow_mut();
        f(slot.get_or_insert_with(ExifReader::new))
    })
}

/// The `(date, group, file_name)` identity triple from a photo path's last
/// three components.
pub fn identity_from_path(file: &Path) -> Result<(String, String, String), ExtractError> {
    let mut tail = file
        .iter()
        .rev()
        .take(3)
        .map(|part| part.to_string_lossy().into_owned());
    let (Some(file_name), Some(group), Some(date)) = (tail.next(), tail.next(), tail.next())
    else {
        return Err(ExtractError::Metadata {
            path: file.display().to_string(),
            reason: "path has fewer than three components (expected date/group/photo)".to_string(),
        });
    };
    Ok((date, group, file_name))
}

/// Load the complete metadata for one photo file.
///
/// The RAW decode runs first so an unsupported file fails fast as
/// [`ExtractError::InvalidFile`] before any EXIF work happens.
pub fn load_photo_metadata(file: &Path) -> Result<PhotoMetadata, ExtractError> {
    let (date, group, file_name) = identity_from_path(file)?;
    tracing::debug!("loading metadata for \"{date}/{group}/{file_name}\"");

    let file_size_kb = match std::fs::metadata(file) {
        Ok(meta) => (meta.len() / 1000) as i64,
        Err(e) => {
            return Err(ExtractError::InvalidFile {
                path: file.display().to_string(),
                reason: e.to_string(),
            });
        }
    };

    let summary = raw::summarize_raw(file)?;
    let fields = with_thread_exif_reader(|reader| reader.read(file))?;

    build_metadata(file, date, group, file_name, file_size_kb, summary, fields)
}

fn build_metadata(
    file: &Path,
    date: String,
    group: String,
    file_name: String,
    file_size_kb: i64,
    summary: RawSummary,
    fields: ExifFields,
) -> Result<PhotoMetadata, ExtractError> {
    let display = || file.display().to_string();

    let time_taken = fields.time_taken.ok_or_else(|| ExtractError::Metadata {
        path: display(),
        reason: "mandatory tag DateTimeOriginal is missing or unparseable".to_string(),
    })?;

    let lens = build_lens(&fields);

    // EXIF make/model first, the decoder's normalized names as fallback
    let make = fields
        .make
        .or_else(|| non_empty(summary.make.clone()))
        .ok_or_else(|| ExtractError::Metadata {
            path: display(),
            reason: "mandatory camera make is missing".to_string(),
        })?;
    let model = fields
        .model
        .or_else(|| non_empty(summary.model.clone()))
        .ok_or_else(|| ExtractError::Metadata {
            path: display(),
            reason: "mandatory camera model is missing".to_string(),
        })?;
    let [wb_r, wb_g1, wb_b, wb_g2] = match summary.camera_wb {
        Some(wb) => [Some(wb[0]), Some(wb[1]), Some(wb[2]), Some(wb[3])],
        None => [None; 4],
    };

    Ok(PhotoMetadata {
        date,
        group,
        file_name,
        time_taken,
        file_size_kb,
        iso: fields.iso,
        shutter_speed: fields.shutter_speed,
        aperture: fields.aperture,
        focal_length: fields.focal_length,
        auto_focus: None,
        focus_distance: 0.0,
        field_of_view: fields.field_of_view.unwrap_or(0.0),
        raw_width: fields.raw_width.unwrap_or(summary.raw_width),
        raw_height: fields.raw_height.unwrap_or(summary.raw_height),
        width: summary.width,
        height: summary.height,
        thumb_width: fields.thumb_width,
        thumb_height: fields.thumb_height,
        capture_wb_red: wb_r,
        capture_wb_green1: wb_g1,
        capture_wb_blue: wb_b,
        capture_wb_green2: wb_g2,
        avg_red: summary.avg_red,
        avg_green: summary.avg_green,
        avg_blue: summary.avg_blue,
        black_level_red: summary.black_levels[0],
        black_level_green1: summary.black_levels[1],
        black_level_blue: summary.black_levels[2],
        black_level_green2: summary.black_levels[3],
        white_level_red: summary.white_levels[0],
        white_level_green1: summary.white_levels[1],
        white_level_blue: summary.white_levels[2],
        white_level_green2: summary.white_levels[3],
        brightness_min: summary.brightness.min as i64,
        brightness_p10: summary.brightness.deciles[0],
        brightness_p20: summary.brightness.deciles[1],
        brightness_p30: summary.brightness.deciles[2],
        brightness_p40: summary.brightness.deciles[3],
        brightness_median: summary.brightness.deciles[4],
        brightness_p60: summary.brightness.deciles[5],
        brightness_p70: summary.brightness.deciles[6],
        brightness_p80: summary.brightness.deciles[7],
        brightness_p90: summary.brightness.deciles[8],
        brightness_max: summary.brightness.max as i64,
        brightness_mean: summary.brightness.mean,
        brightness_stdev: summary.brightness.stdev,
        brightness_iqr: summary.brightness.iqr,
        exposure_difference: None,
        camera: CameraIdentity {
            make,
            model,
            // The decoder does not expose daylight multipliers; absent
            // components simply stay null in the camera identity
            daylight_wb_red: None,
            daylight_wb_green1: None,
            daylight_wb_blue: None,
            daylight_wb_green2: None,
        },
        lens,
    })
}

/// A lens is recorded only when at least one identity string is present.
fn build_lens(fields: &ExifFields) -> Option<LensIdentity> {
    if fields.lens_make.is_none() && fields.lens_model.is_none() && fields.lens_spec.is_none() {
        return None;
    }
    let min_focal = fields
        .lens_min_focal
        .or(fields.focal_length)
        .unwrap_or(0.0);
    let max_focal = fields
        .lens_max_focal
        .or(fields.focal_length)
        .unwrap_or(0.0);
    let effective = fields
        .effective_max_aperture
        .or(fields.lens_max_aperture_min_focal)
        .unwrap_or(0.0);
    Some(LensIdentity {
        make: fields.lens_make.clone(),
        model: fields.lens_model.clone(),
        spec: fields.lens_spec.clone(),
        // The range must satisfy min <= max even on odd EXIF blocks
        min_focal_length: min_focal.min(max_focal),
        max_focal_length: min_focal.max(max_focal),
        lens_f_stops: 0.0,
        max_aperture_min_focal: fields.lens_max_aperture_min_focal.unwrap_or(effective),
        max_aperture_max_focal: fields.lens_max_aperture_max_focal.unwrap_or(effective),
        effective_max_aperture: effective,
    })
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
