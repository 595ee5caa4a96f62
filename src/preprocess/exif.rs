//! EXIF extraction via a per-worker reader handle.
//!
//! Each pool worker owns one `ExifReader` in a thread-local slot (created
//! lazily on first use, dropped by the pool's close hook). The reader works
//! on any TIFF-based RAW container as well as plain JPEGs.

use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Timelike};
use exif::{In, Tag, Value};

use crate::preprocess::ExtractError;

/// Everything the EXIF side of extraction can supply. All fields are
/// optional here; the extractor decides which ones are mandatory.
#[derive(Debug, Clone, Default)]
pub struct ExifFields {
    pub time_taken: Option<DateTime<FixedOffset>>,
    pub iso: Option<i64>,
    pub shutter_speed: Option<String>,
    pub aperture: Option<f64>,
    pub focal_length: Option<f64>,
    pub field_of_view: Option<f64>,
    pub raw_width: Option<i64>,
    pub raw_height: Option<i64>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub lens_make: Option<String>,
    pub lens_model: Option<String>,
    pub lens_spec: Option<String>,
    pub lens_min_focal: Option<f64>,
    pub lens_max_focal: Option<f64>,
    pub lens_max_aperture_min_focal: Option<f64>,
    pub lens_max_aperture_max_focal: Option<f64>,
    pub effective_max_aperture: Option<f64>,
    pub thumb_width: Option<i64>,
    pub thumb_height: Option<i64>,
}

/// A reusable EXIF reading handle, one per worker thread.
pub struct ExifReader {
    reader: exif::Reader,
}

impl Default for ExifReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ExifReader {
    pub fn new() -> Self {
        ExifReader {
            reader: exif::Reader::new(),
        }
    }

    /// Read and interpret the EXIF block of one photo file. Any failure to
    /// open or parse is a metadata failure (the RAW decoder has already
    /// accepted the file by the time this runs).
    pub fn read(&self, path: &Path) -> Result<ExifFields, ExtractError> {
        let display = path.display().to_string();
        let file = std::fs::File::open(path).map_err(|e| ExtractError::Metadata {
            path: display.clone(),
            reason: format!("cannot open for EXIF read: {e}"),
        })?;
        let mut buf_reader = BufReader::new(file);
        let exif = self
            .reader
            .read_from_container(&mut buf_reader)
            .map_err(|e| ExtractError::Metadata {
                path: display,
                reason: format!("cannot read EXIF: {e}"),
            })?;

        let time_taken = read_capture_time(&exif);
        let focal_length = rational(&exif, Tag::FocalLength);
        let focal_35mm = uint(&exif, Tag::FocalLengthIn35mmFilm).map(|v| v as f64);

        let (thumb_width, thumb_height) = thumbnail_dimensions(&exif);

        let lens_spec_values = rationals(&exif, Tag::LensSpecification);
        let spec_at = |i: usize| -> Option<f64> {
            lens_spec_values
                .as_ref()
                .and_then(|v| v.get(i).copied())
                .filter(|f| f.is_finite() && *f > 0.0)
        };

        Ok(ExifFields {
            time_taken,
            iso: uint(&exif, Tag::PhotographicSensitivity),
            shutter_speed: shutter_string(&exif),
            aperture: rational(&exif, Tag::FNumber),
            focal_length,
            field_of_view: field_of_view(focal_35mm.or(focal_length)),
            raw_width: uint(&exif, Tag::ImageWidth).or_else(|| uint(&exif, Tag::PixelXDimension)),
            raw_height: uint(&exif, Tag::ImageLength)
                .or_else(|| uint(&exif, Tag::PixelYDimension)),
            make: ascii(&exif, Tag::Make),
            model: ascii(&exif, Tag::Model),
            lens_make: ascii(&exif, Tag::LensMake),
            lens_model: ascii(&exif, Tag::LensModel),
            lens_spec: display_string(&exif, Tag::LensSpecification),
            lens_min_focal: spec_at(0),
            lens_max_focal: spec_at(1),
            lens_max_aperture_min_focal: spec_at(2),
            lens_max_aperture_max_focal: spec_at(3),
            effective_max_aperture: rational(&exif, Tag::MaxApertureValue)
                .map(apex_to_f_number),
            thumb_width,
            thumb_height,
        })
    }
}

/// Extract the embedded JPEG preview from the EXIF thumbnail IFD, if any.
/// Camera files typically carry a small preview there; reading it is far
/// cheaper than developing the full image.
pub fn embedded_thumbnail(path: &Path) -> Option<Vec<u8>> {
    let file = std::fs::File::open(path).ok()?;
    let exif = exif::Reader::new()
        .read_from_container(&mut BufReader::new(file))
        .ok()?;
    let range = preview_range(&exif)?;
    Some(exif.buf()[range].to_vec())
}

/// Byte range of the thumbnail-IFD JPEG stream inside the EXIF buffer. None
/// when the pointer/length pair is absent, empty, or runs past the buffer.
fn preview_range(exif: &exif::Exif) -> Option<std::ops::Range<usize>> {
    let start = thumbnail_ifd_long(exif, Tag::JPEGInterchangeFormat)? as usize;
    let length = thumbnail_ifd_long(exif, Tag::JPEGInterchangeFormatLength)? as usize;
    let end = start.checked_add(length)?;
    if length == 0 || end > exif.buf().len() {
        return None;
    }
    Some(start..end)
}

fn thumbnail_ifd_long(exif: &exif::Exif, tag: Tag) -> Option<u32> {
    match &exif.get_field(tag, In::THUMBNAIL)?.value {
        Value::Long(values) => values.first().copied(),
        _ => None,
    }
}

/// Best effort: decode the embedded preview's header for its dimensions.
fn thumbnail_dimensions(exif: &exif::Exif) -> (Option<i64>, Option<i64>) {
    let Some(range) = preview_range(exif) else {
        return (None, None);
    };
    match image::load_from_memory(&exif.buf()[range]) {
        Ok(img) => (Some(img.width() as i64), Some(img.height() as i64)),
        Err(_) => (None, None),
    }
}

fn ascii(exif: &exif::Exif, tag: Tag) -> Option<String> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match &field.value {
        Value::Ascii(vecs) => {
            let s = vecs
                .first()
                .and_then(|v| std::str::from_utf8(v).ok())?
                .trim()
                .trim_end_matches('\0')
                .trim()
                .to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        }
        _ => None,
    }
}

fn uint(exif: &exif::Exif, tag: Tag) -> Option<i64> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match &field.value {
        Value::Short(v) => v.first().map(|&x| x as i64),
        Value::Long(v) => v.first().map(|&x| x as i64),
        _ => None,
    }
}

fn rational(exif: &exif::Exif, tag: Tag) -> Option<f64> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match &field.value {
        Value::Rational(v) => v.first().map(|r| r.to_f64()),
        Value::SRational(v) => v.first().map(|r| r.to_f64()),
        _ => None,
    }
}

fn rationals(exif: &exif::Exif, tag: Tag) -> Option<Vec<f64>> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match &field.value {
        Value::Rational(v) => Some(v.iter().map(|r| r.to_f64()).collect()),
        _ => None,
    }
}

fn display_string(exif: &exif::Exif, tag: Tag) -> Option<String> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    let s = field.display_value().to_string();
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Shutter speed as the raw exposure-time fraction, e.g. "1/250" or "30/1".
fn shutter_string(exif: &exif::Exif) -> Option<String> {
    let field = exif.get_field(Tag::ExposureTime, In::PRIMARY)?;
    match &field.value {
        Value::Rational(v) => v.first().map(|r| format!("{}/{}", r.num, r.denom)),
        _ => None,
    }
}

/// Horizontal field of view in degrees for a full-frame-equivalent focal
/// length (36mm sensor width).
fn field_of_view(focal_35mm: Option<f64>) -> Option<f64> {
    let f = focal_35mm.filter(|f| *f > 0.0)?;
    Some((2.0 * (36.0 / (2.0 * f)).atan()).to_degrees())
}

/// APEX aperture value to an f-number: N = 2^(Av/2).
fn apex_to_f_number(av: f64) -> f64 {
    2f64.powf(av / 2.0)
}

fn read_capture_time(exif: &exif::Exif) -> Option<DateTime<FixedOffset>> {
    let field = exif.get_field(Tag::DateTimeOriginal, In::PRIMARY)?;
    let datetime = match &field.value {
        Value::Ascii(vecs) => vecs.first().and_then(|v| std::str::from_utf8(v).ok())?,
        _ => return None,
    };
    let subsec = ascii(exif, Tag::SubSecTimeOriginal);
    let offset = ascii(exif, Tag::OffsetTimeOriginal);
    parse_exif_datetime(datetime, subsec.as_deref(), offset.as_deref())
}

/// Parse an EXIF datetime ("YYYY:MM:DD HH:MM:SS", dashes tolerated) with
/// optional sub-second digits and timezone offset. Without an offset the
/// time is taken as UTC.
pub fn parse_exif_datetime(
    datetime: &str,
    subsec: Option<&str>,
    offset: Option<&str>,
) -> Option<DateTime<FixedOffset>> {
    let s = datetime.trim();
    if s.len() < 19 {
        return None;
    }
    let date = s[..10].replace(':', "-");
    let normalized = format!("{} {}", date, &s[11..19]);
    let mut naive = NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S").ok()?;

    if let Some(subsec) = subsec {
        let digits: String = subsec.chars().filter(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            let mut padded = digits;
            padded.truncate(9);
            while padded.len() < 9 {
                padded.push('0');
            }
            if let Ok(nanos) = padded.parse::<u32>() {
                naive = naive.with_nanosecond(nanos).unwrap_or(naive);
            }
        }
    }

    let tz = offset.and_then(parse_offset).unwrap_or(FixedOffset::east_opt(0)?);
    tz.from_local_datetime(&naive).single()
}

fn parse_offset(offset: &str) -> Option<FixedOffset> {
    let s = offset.trim();
    if s.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = if let Some(rest) = s.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = s.strip_prefix('-') {
        (-1, rest)
    } else {
        return None;
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exif_datetime_basic() {
        let dt = parse_exif_datetime("2024:03:15 12:30:45", None, None).unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-03-15 12:30:45");
        assert_eq!(dt.offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_parse_exif_datetime_with_subsec_and_offset() {
        let dt = parse_exif_datetime("2024:03:15 12:30:45", Some("25"), Some("+01:00")).unwrap();
        assert_eq!(dt.nanosecond(), 250_000_000);
        assert_eq!(dt.offset().local_minus_utc(), 3600);
    }

    #[test]
    fn test_parse_exif_datetime_negative_offset() {
        let dt = parse_exif_datetime("2024-03-15 12:30:45", None, Some("-05:30")).unwrap();
        assert_eq!(dt.offset().local_minus_utc(), -(5 * 3600 + 30 * 60));
    }

    #[test]
    fn test_parse_exif_datetime_invalid() {
        assert!(parse_exif_datetime("not a date", None, None).is_none());
        assert!(parse_exif_datetime("", None, None).is_none());
        assert!(parse_exif_datetime("short", None, None).is_none());
    }

    #[test]
    fn test_field_of_view_full_frame() {
        // 35mm on full frame: 2 * atan(36 / 70) ≈ 54.43°
        let fov = field_of_view(Some(35.0)).unwrap();
        assert!((fov - 54.43).abs() < 0.05, "got {fov}");
        assert!(field_of_view(Some(0.0)).is_none());
        assert!(field_of_view(None).is_none());
    }

    #[test]
    fn test_apex_to_f_number() {
        assert!((apex_to_f_number(2.0) - 2.0).abs() < 1e-9);
        assert!((apex_to_f_number(5.0) - 5.656854).abs() < 1e-5);
    }

    #[test]
    fn test_read_missing_file_is_metadata_error() {
        let reader = ExifReader::new();
        match reader.read(Path::new("/nonexistent/photo.nef")) {
            Err(ExtractError::Metadata { .. }) => {}
            other => panic!("expected Metadata error, got {other:?}"),
        }
    }

    #[test]
    fn test_read_garbage_is_metadata_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.jpg");
        std::fs::write(&path, b"not an image at all").unwrap();
        let reader = ExifReader::new();
        assert!(reader.read(&path).is_err());
    }

    /// Minimal JPEG with an APP1/EXIF segment carrying Make, Model, and an
    /// ExifIFD with DateTimeOriginal.
    ///
    /// TIFF layout (little-endian, offsets from the "II" header):
    ///   0..8    header, IFD0 at offset 8
    ///   8..50   IFD0: 3 entries (Make, Model, ExifIFD ptr) + next=0
    ///   50..68  ExifIFD: 1 entry (DateTimeOriginal) + next=0
    ///   68..74  Make  "Canon\0"
    ///   74..81  Model "EOS R5\0"
    ///   81..101 DateTimeOriginal (19 chars + null)
    fn make_jpeg_with_exif(datetime: &str) -> Vec<u8> {
        assert_eq!(datetime.len(), 19);
        let make_bytes = b"Canon\x00";
        let model_bytes = b"EOS R5\x00";
        let mut dt_bytes = datetime.as_bytes().to_vec();
        dt_bytes.push(0);

        let mut tiff: Vec<u8> = Vec::new();
        tiff.extend_from_slice(b"II");
        tiff.extend_from_slice(&[0x2A, 0x00]);
        tiff.extend_from_slice(&8u32.to_le_bytes());

        // IFD0: 3 entries, ascending tags 0x010F, 0x0110, 0x8769
        tiff.extend_from_slice(&3u16.to_le_bytes());
        // Make: ASCII, count 6, offset 68
        tiff.extend_from_slice(&0x010Fu16.to_le_bytes());
        tiff.extend_from_slice(&2u16.to_le_bytes());
        tiff.extend_from_slice(&6u32.to_le_bytes());
        tiff.extend_from_slice(&68u32.to_le_bytes());
        // Model: ASCII, count 7, offset 74
        tiff.extend_from_slice(&0x0110u16.to_le_bytes());
        tiff.extend_from_slice(&2u16.to_le_bytes());
        tiff.extend_from_slice(&7u32.to_le_bytes());
        tiff.extend_from_slice(&74u32.to_le_bytes());
        // ExifIFD pointer: LONG, offset 50
        tiff.extend_from_slice(&0x8769u16.to_le_bytes());
        tiff.extend_from_slice(&4u16.to_le_bytes());
        tiff.extend_from_slice(&1u32.to_le_bytes());
        tiff.extend_from_slice(&50u32.to_le_bytes());
        tiff.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(tiff.len(), 50);

        // ExifIFD: DateTimeOriginal, ASCII, count 20, offset 81
        tiff.extend_from_slice(&1u16.to_le_bytes());
        tiff.extend_from_slice(&0x9003u16.to_le_bytes());
        tiff.extend_from_slice(&2u16.to_le_bytes());
        tiff.extend_from_slice(&20u32.to_le_bytes());
        tiff.extend_from_slice(&81u32.to_le_bytes());
        tiff.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(tiff.len(), 68);

        tiff.extend_from_slice(make_bytes);
        assert_eq!(tiff.len(), 74);
        tiff.extend_from_slice(model_bytes);
        assert_eq!(tiff.len(), 81);
        tiff.extend_from_slice(&dt_bytes);

        let mut app1: Vec<u8> = b"Exif\x00\x00".to_vec();
        app1.extend_from_slice(&tiff);
        let app1_len = (app1.len() + 2) as u16;

        let mut jpeg: Vec<u8> = Vec::new();
        jpeg.extend_from_slice(&[0xFF, 0xD8]);
        jpeg.extend_from_slice(&[0xFF, 0xE1]);
        jpeg.extend_from_slice(&app1_len.to_be_bytes());
        jpeg.extend_from_slice(&app1);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        jpeg
    }

    #[test]
    fn test_read_extracts_make_model_and_capture_time() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("shot.jpg");
        std::fs::write(&path, make_jpeg_with_exif("2023:01:15 10:30:00")).unwrap();

        let fields = ExifReader::new().read(&path).unwrap();
        assert_eq!(fields.make.as_deref(), Some("Canon"));
        assert_eq!(fields.model.as_deref(), Some("EOS R5"));
        let dt = fields.time_taken.expect("capture time must be extracted");
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S").to_string(), "2023-01-15 10:30:00");
        // Fields absent from the file stay None
        assert!(fields.iso.is_none());
        assert!(fields.lens_model.is_none());
    }
}
