//! Identity store adapter: upserts Photo rows and deduplicates Camera and
//! Lens rows by full attribute match.
//!
//! All functions take a plain `&Connection`; the orchestrator passes a
//! transaction (which derefs to one), executes statements as each photo
//! lands ("flush"), and commits once when the pipeline drains. Camera and
//! Lens rows are never mutated after insert — when an existing photo's
//! camera or lens identity changes, the photo is relinked to a matching or
//! freshly inserted row so other photos referencing the old row are
//! unaffected.

use chrono::DateTime;
use rusqlite::{named_params, params, Connection, OptionalExtension};

use crate::preprocess::metadata::{CameraIdentity, LensIdentity, PhotoMetadata};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),
}

/// What an upsert did to the Photo row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    New,
    Updated,
    Unchanged,
}

/// Id of the Camera row matching all six identity attributes (NULL matches
/// NULL), or None.
pub fn find_camera_id(conn: &Connection, camera: &CameraIdentity) -> Result<Option<i64>, StoreError> {
    let id = conn
        .query_row(
            "SELECT id FROM Cameras
             WHERE make = ?1 AND model = ?2
               AND daylight_wb_red IS ?3 AND daylight_wb_green1 IS ?4
               AND daylight_wb_blue IS ?5 AND daylight_wb_green2 IS ?6",
            params![
                camera.make,
                camera.model,
                camera.daylight_wb_red,
                camera.daylight_wb_green1,
                camera.daylight_wb_blue,
                camera.daylight_wb_green2,
            ],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn insert_camera(conn: &Connection, camera: &CameraIdentity) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO Cameras (make, model, daylight_wb_red, daylight_wb_green1,
                              daylight_wb_blue, daylight_wb_green2)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            camera.make,
            camera.model,
            camera.daylight_wb_red,
            camera.daylight_wb_green1,
            camera.daylight_wb_blue,
            camera.daylight_wb_green2,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn get_or_create_camera(conn: &Connection, camera: &CameraIdentity) -> Result<i64, StoreError> {
    if let Some(id) = find_camera_id(conn, camera)? {
        return Ok(id);
    }
    tracing::debug!("creating new camera record for {}", camera.label());
    insert_camera(conn, camera)
}

/// Id of the Lens row matching all nine identity attributes, or None.
pub fn find_lens_id(conn: &Connection, lens: &LensIdentity) -> Result<Option<i64>, StoreError> {
    let id = conn
        .query_row(
            "SELECT id FROM Lenses
             WHERE make IS ?1 AND model IS ?2 AND spec IS ?3
               AND min_focal_length = ?4 AND max_focal_length = ?5
               AND lens_f_stops = ?6 AND max_aperture_min_focal = ?7
               AND max_aperture_max_focal = ?8 AND effective_max_aperture = ?9",
            params![
                lens.make,
                lens.model,
                lens.spec,
                lens.min_focal_length,
                lens.max_focal_length,
                lens.lens_f_stops,
                lens.max_aperture_min_focal,
                lens.max_aperture_max_focal,
                lens.effective_max_aperture,
            ],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn insert_lens(conn: &Connection, lens: &LensIdentity) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO Lenses (make, model, spec, min_focal_length, max_focal_length,
                             lens_f_stops, max_aperture_min_focal,
                             max_aperture_max_focal, effective_max_aperture)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            lens.make,
            lens.model,
            lens.spec,
            lens.min_focal_length,
            lens.max_focal_length,
            lens.lens_f_stops,
            lens.max_aperture_min_focal,
            lens.max_aperture_max_focal,
            lens.effective_max_aperture,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn get_or_create_lens(conn: &Connection, lens: &LensIdentity) -> Result<i64, StoreError> {
    if let Some(id) = find_lens_id(conn, lens)? {
        return Ok(id);
    }
    tracing::debug!("creating new lens record for {}", lens.label());
    insert_lens(conn, lens)
}

struct StoredPhoto {
    metadata: PhotoMetadata,
    camera_id: i64,
    lens_id: Option<i64>,
}

const PHOTO_COLUMNS: &str = "\
    time_taken, file_size_kb, iso, shutter_speed, aperture, focal_length,
    auto_focus, focus_distance, field_of_view,
    raw_width, raw_height, width, height, thumb_width, thumb_height,
    capture_wb_red, capture_wb_green1, capture_wb_blue, capture_wb_green2,
    avg_red, avg_green, avg_blue,
    black_level_red, black_level_green1, black_level_blue, black_level_green2,
    white_level_red, white_level_green1, white_level_blue, white_level_green2,
    brightness_min, brightness_p10, brightness_p20, brightness_p30,
    brightness_p40, brightness_median, brightness_p60, brightness_p70,
    brightness_p80, brightness_p90, brightness_max, brightness_mean,
    brightness_stdev, brightness_iqr, exposure_difference";

/// Load a photo with its camera and lens identities joined back in, so the
/// stored state can be compared against fresh metadata field-for-field.
fn load_photo(
    conn: &Connection,
    date: &str,
    group: &str,
    file_name: &str,
) -> Result<Option<StoredPhoto>, StoreError> {
    let sql = format!(
        "SELECT p.camera_id, p.lens_id, {photo_cols},
                c.make, c.model, c.daylight_wb_red, c.daylight_wb_green1,
                c.daylight_wb_blue, c.daylight_wb_green2,
                l.make, l.model, l.spec, l.min_focal_length, l.max_focal_length,
                l.lens_f_stops, l.max_aperture_min_focal,
                l.max_aperture_max_focal, l.effective_max_aperture
         FROM Photos p
         JOIN Cameras c ON c.id = p.camera_id
         LEFT JOIN Lenses l ON l.id = p.lens_id
         WHERE p.date = ?1 AND p.\"group\" = ?2 AND p.file_name = ?3",
        photo_cols = PHOTO_COLUMNS
            .split(',')
            .map(|c| format!("p.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let stored = conn
        .query_row(&sql, params![date, group, file_name], |row| {
            let camera_id: i64 = row.get(0)?;
            let lens_id: Option<i64> = row.get(1)?;

            let time_taken_str: String = row.get(2)?;
            let time_taken = DateTime::parse_from_rfc3339(&time_taken_str).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;

            let lens = match lens_id {
                None => None,
                Some(_) => Some(LensIdentity {
                    make: row.get(53)?,
                    model: row.get(54)?,
                    spec: row.get(55)?,
                    min_focal_length: row.get(56)?,
                    max_focal_length: row.get(57)?,
                    lens_f_stops: row.get(58)?,
                    max_aperture_min_focal: row.get(59)?,
                    max_aperture_max_focal: row.get(60)?,
                    effective_max_aperture: row.get(61)?,
                }),
            };

            Ok(StoredPhoto {
                camera_id,
                lens_id,
                metadata: PhotoMetadata {
                    date: date.to_string(),
                    group: group.to_string(),
                    file_name: file_name.to_string(),
                    time_taken,
                    file_size_kb: row.get(3)?,
                    iso: row.get(4)?,
                    shutter_speed: row.get(5)?,
                    aperture: row.get(6)?,
                    focal_length: row.get(7)?,
                    auto_focus: row.get(8)?,
                    focus_distance: row.get(9)?,
                    field_of_view: row.get(10)?,
                    raw_width: row.get(11)?,
                    raw_height: row.get(12)?,
                    width: row.get(13)?,
                    height: row.get(14)?,
                    thumb_width: row.get(15)?,
                    thumb_height: row.get(16)?,
                    capture_wb_red: row.get(17)?,
                    capture_wb_green1: row.get(18)?,
                    capture_wb_blue: row.get(19)?,
                    capture_wb_green2: row.get(20)?,
                    avg_red: row.get(21)?,
                    avg_green: row.get(22)?,
                    avg_blue: row.get(23)?,
                    black_level_red: row.get(24)?,
                    black_level_green1: row.get(25)?,
                    black_level_blue: row.get(26)?,
                    black_level_green2: row.get(27)?,
                    white_level_red: row.get(28)?,
                    white_level_green1: row.get(29)?,
                    white_level_blue: row.get(30)?,
                    white_level_green2: row.get(31)?,
                    brightness_min: row.get(32)?,
                    brightness_p10: row.get(33)?,
                    brightness_p20: row.get(34)?,
                    brightness_p30: row.get(35)?,
                    brightness_p40: row.get(36)?,
                    brightness_median: row.get(37)?,
                    brightness_p60: row.get(38)?,
                    brightness_p70: row.get(39)?,
                    brightness_p80: row.get(40)?,
                    brightness_p90: row.get(41)?,
                    brightness_max: row.get(42)?,
                    brightness_mean: row.get(43)?,
                    brightness_stdev: row.get(44)?,
                    brightness_iqr: row.get(45)?,
                    exposure_difference: row.get(46)?,
                    camera: CameraIdentity {
                        make: row.get(47)?,
                        model: row.get(48)?,
                        daylight_wb_red: row.get(49)?,
                        daylight_wb_green1: row.get(50)?,
                        daylight_wb_blue: row.get(51)?,
                        daylight_wb_green2: row.get(52)?,
                    },
                    lens,
                },
            })
        })
        .optional()?;
    Ok(stored)
}

fn write_photo_row(
    conn: &Connection,
    m: &PhotoMetadata,
    camera_id: i64,
    lens_id: Option<i64>,
    update: bool,
) -> Result<(), StoreError> {
    let sql = if update {
        r#"UPDATE Photos SET
            camera_id = :camera_id, lens_id = :lens_id,
            time_taken = :time_taken, file_size_kb = :file_size_kb, iso = :iso,
            shutter_speed = :shutter_speed, aperture = :aperture,
            focal_length = :focal_length, auto_focus = :auto_focus,
            focus_distance = :focus_distance, field_of_view = :field_of_view,
            raw_width = :raw_width, raw_height = :raw_height,
            width = :width, height = :height,
            thumb_width = :thumb_width, thumb_height = :thumb_height,
            capture_wb_red = :capture_wb_red, capture_wb_green1 = :capture_wb_green1,
            capture_wb_blue = :capture_wb_blue, capture_wb_green2 = :capture_wb_green2,
            avg_red = :avg_red, avg_green = :avg_green, avg_blue = :avg_blue,
            black_level_red = :black_level_red, black_level_green1 = :black_level_green1,
            black_level_blue = :black_level_blue, black_level_green2 = :black_level_green2,
            white_level_red = :white_level_red, white_level_green1 = :white_level_green1,
            white_level_blue = :white_level_blue, white_level_green2 = :white_level_green2,
            brightness_min = :brightness_min, brightness_p10 = :brightness_p10,
            brightness_p20 = :brightness_p20, brightness_p30 = :brightness_p30,
            brightness_p40 = :brightness_p40, brightness_median = :brightness_median,
            brightness_p60 = :brightness_p60, brightness_p70 = :brightness_p70,
            brightness_p80 = :brightness_p80, brightness_p90 = :brightness_p90,
            brightness_max = :brightness_max, brightness_mean = :brightness_mean,
            brightness_stdev = :brightness_stdev, brightness_iqr = :brightness_iqr,
            exposure_difference = :exposure_difference
         WHERE date = :date AND "group" = :group AND file_name = :file_name"#
    } else {
        r#"INSERT INTO Photos (
            date, "group", file_name, camera_id, lens_id,
            time_taken, file_size_kb, iso, shutter_speed, aperture, focal_length,
            auto_focus, focus_distance, field_of_view,
            raw_width, raw_height, width, height, thumb_width, thumb_height,
            capture_wb_red, capture_wb_green1, capture_wb_blue, capture_wb_green2,
            avg_red, avg_green, avg_blue,
            black_level_red, black_level_green1, black_level_blue, black_level_green2,
            white_level_red, white_level_green1, white_level_blue, white_level_green2,
            brightness_min, brightness_p10, brightness_p20, brightness_p30,
            brightness_p40, brightness_median, brightness_p60, brightness_p70,
            brightness_p80, brightness_p90, brightness_max, brightness_mean,
            brightness_stdev, brightness_iqr, exposure_difference
        ) VALUES (
            :date, :group, :file_name, :camera_id, :lens_id,
            :time_taken, :file_size_kb, :iso, :shutter_speed, :aperture, :focal_length,
            :auto_focus, :focus_distance, :field_of_view,
            :raw_width, :raw_height, :width, :height, :thumb_width, :thumb_height,
            :capture_wb_red, :capture_wb_green1, :capture_wb_blue, :capture_wb_green2,
            :avg_red, :avg_green, :avg_blue,
            :black_level_red, :black_level_green1, :black_level_blue, :black_level_green2,
            :white_level_red, :white_level_green1, :white_level_blue, :white_level_green2,
            :brightness_min, :brightness_p10, :brightness_p20, :brightness_p30,
            :brightness_p40, :brightness_median, :brightness_p60, :brightness_p70,
            :brightness_p80, :brightness_p90, :brightness_max, :brightness_mean,
            :brightness_stdev, :brightness_iqr, :exposure_difference
        )"#
    };

    conn.execute(
        sql,
        named_params! {
            ":date": m.date,
            ":group": m.group,
            ":file_name": m.file_name,
            ":camera_id": camera_id,
            ":lens_id": lens_id,
            ":time_taken": m.time_taken.to_rfc3339(),
            ":file_size_kb": m.file_size_kb,
            ":iso": m.iso,
            ":shutter_speed": m.shutter_speed,
            ":aperture": m.aperture,
            ":focal_length": m.focal_length,
            ":auto_focus": m.auto_focus,
            ":focus_distance": m.focus_distance,
            ":field_of_view": m.field_of_view,
            ":raw_width": m.raw_width,
            ":raw_height": m.raw_height,
            ":width": m.width,
            ":height": m.height,
            ":thumb_width": m.thumb_width,
            ":thumb_height": m.thumb_height,
            ":capture_wb_red": m.capture_wb_red,
            ":capture_wb_green1": m.capture_wb_green1,
            ":capture_wb_blue": m.capture_wb_blue,
            ":capture_wb_green2": m.capture_wb_green2,
            ":avg_red": m.avg_red,
            ":avg_green": m.avg_green,
            ":avg_blue": m.avg_blue,
            ":black_level_red": m.black_level_red,
            ":black_level_green1": m.black_level_green1,
            ":black_level_blue": m.black_level_blue,
            ":black_level_green2": m.black_level_green2,
            ":white_level_red": m.white_level_red,
            ":white_level_green1": m.white_level_green1,
            ":white_level_blue": m.white_level_blue,
            ":white_level_green2": m.white_level_green2,
            ":brightness_min": m.brightness_min,
            ":brightness_p10": m.brightness_p10,
            ":brightness_p20": m.brightness_p20,
            ":brightness_p30": m.brightness_p30,
            ":brightness_p40": m.brightness_p40,
            ":brightness_median": m.brightness_median,
            ":brightness_p60": m.brightness_p60,
            ":brightness_p70": m.brightness_p70,
            ":brightness_p80": m.brightness_p80,
            ":brightness_p90": m.brightness_p90,
            ":brightness_max": m.brightness_max,
            ":brightness_mean": m.brightness_mean,
            ":brightness_stdev": m.brightness_stdev,
            ":brightness_iqr": m.brightness_iqr,
            ":exposure_difference": m.exposure_difference,
        },
    )?;
    Ok(())
}

/// Insert or update the Photo row for this metadata record.
///
/// New photos resolve their camera and lens by exact identity match,
/// inserting fresh rows only when no match exists. Existing photos are
/// overwritten; if their camera/lens identity changed, they are relinked to
/// a matching-or-new row (the previous rows stay untouched). Re-running
/// with identical metadata is a no-op.
pub fn upsert_photo(conn: &Connection, m: &PhotoMetadata) -> Result<Applied, StoreError> {
    let stored = load_photo(conn, &m.date, &m.group, &m.file_name)?;

    let Some(stored) = stored else {
        let camera_id = get_or_create_camera(conn, &m.camera)?;
        let lens_id = match &m.lens {
            Some(lens) if lens.is_identified() => Some(get_or_create_lens(conn, lens)?),
            _ => None,
        };
        write_photo_row(conn, m, camera_id, lens_id, false)?;
        return Ok(Applied::New);
    };

    if stored.metadata == *m {
        return Ok(Applied::Unchanged);
    }

    let camera_id = if stored.metadata.camera == m.camera {
        stored.camera_id
    } else {
        get_or_create_camera(conn, &m.camera)?
    };
    let lens_id = if stored.metadata.lens == m.lens {
        stored.lens_id
    } else {
        match &m.lens {
            Some(lens) if lens.is_identified() => Some(get_or_create_lens(conn, lens)?),
            _ => None,
        }
    };
    write_photo_row(conn, m, camera_id, lens_id, true)?;
    Ok(Applied::Updated)
}
