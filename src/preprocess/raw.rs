//! RAW decoding and sensor statistics: dimensions, white balance, black and
//! white levels, grey-world channel averages, and the brightness
//! distribution.
//!
//! Statistics come from a half-size demosaic: each 2x2 block of the Bayer
//! mosaic collapses into one RGB pixel (greens averaged) with no white
//! balance applied and no auto-brightening, which keeps the numbers
//! comparable across photos from the same camera.

use std::path::Path;

use crate::preprocess::ExtractError;

/// Brightness distribution of the half-size image, on an 8-bit scale.
#[derive(Debug, Clone, PartialEq)]
pub struct BrightnessStats {
    pub min: u8,
    pub max: u8,
    pub mean: f64,
    pub stdev: f64,
    pub iqr: f64,
    /// p10 through p90.
    pub deciles: [f64; 9],
}

/// Everything pulled from the RAW decoder for one photo.
#[derive(Debug, Clone)]
pub struct RawSummary {
    /// Camera make/model as normalized by the decoder. Fallbacks for files
    /// whose EXIF block lacks the tags.
    pub make: String,
    pub model: String,
    pub raw_width: i64,
    pub raw_height: i64,
    /// Crop-area dimensions (the usable image, not the full sensor).
    pub width: i64,
    pub height: i64,
    /// As-shot white balance multipliers, when the file carries them.
    pub camera_wb: Option<[f64; 4]>,
    pub black_levels: [f64; 4],
    pub white_levels: [f64; 4],
    pub avg_red: f64,
    pub avg_green: f64,
    pub avg_blue: f64,
    pub brightness: BrightnessStats,
}

/// Whether the RAW decoder can open this file at all. Used by the scan
/// mode's validation pass; somewhat expensive.
pub fn is_raw_compatible(path: &Path) -> bool {
    rawloader::decode_file(path).is_ok()
}

/// Decode a RAW file and compute its sensor statistics.
///
/// Any decode failure reports the file as invalid: the decoder draws no
/// usable line between unsupported formats and I/O problems, and either way
/// the file yields no metadata.
pub fn summarize_raw(path: &Path) -> Result<RawSummary, ExtractError> {
    let display = path.display().to_string();
    let raw = rawloader::decode_file(path).map_err(|e| ExtractError::InvalidFile {
        path: display.clone(),
        reason: e.to_string(),
    })?;

    let width = raw.width;
    let height = raw.height;

    // crops are [top, right, bottom, left]
    let crop_width = width.saturating_sub(raw.crops[1] + raw.crops[3]);
    let crop_height = height.saturating_sub(raw.crops[0] + raw.crops[2]);

    let camera_wb = wb_from_coeffs(raw.wb_coeffs);
    let black_levels = levels_to_f64(raw.blacklevels);
    let white_levels = levels_to_f64(raw.whitelevels);

    let cfa = raw.cfa.clone();
    let stats = match &raw.data {
        rawloader::RawImageData::Integer(data) => mosaic_stats(
            width,
            height,
            raw.cpp,
            |i| data[i] as f64,
            |y, x| cfa.color_at(y, x),
            &black_levels,
            &white_levels,
        ),
        rawloader::RawImageData::Float(data) => mosaic_stats(
            width,
            height,
            raw.cpp,
            |i| data[i] as f64,
            |y, x| cfa.color_at(y, x),
            &black_levels,
            &white_levels,
        ),
    };

    let (avg_rgb, brightness) = stats.ok_or_else(|| ExtractError::Metadata {
        path: display,
        reason: format!(
            "cannot compute sensor statistics for a {}x{} mosaic with {} sample(s) per pixel",
            width, height, raw.cpp
        ),
    })?;

    Ok(RawSummary {
        make: raw.clean_make.clone(),
        model: raw.clean_model.clone(),
        raw_width: width as i64,
        raw_height: height as i64,
        width: crop_width as i64,
        height: crop_height as i64,
        camera_wb,
        black_levels,
        white_levels,
        avg_red: avg_rgb[0],
        avg_green: avg_rgb[1],
        avg_blue: avg_rgb[2],
        brightness,
    })
}

/// The decoder reports missing white balance as NaN components. A missing
/// second green falls back to the first.
fn wb_from_coeffs(coeffs: [f32; 4]) -> Option<[f64; 4]> {
    let [r, g1, b, g2] = coeffs;
    if !r.is_finite() || !g1.is_finite() || !b.is_finite() {
        return None;
    }
    let g2 = if g2.is_finite() { g2 } else { g1 };
    Some([r as f64, g1 as f64, b as f64, g2 as f64])
}

fn levels_to_f64(levels: [u16; 4]) -> [f64; 4] {
    [
        levels[0] as f64,
        levels[1] as f64,
        levels[2] as f64,
        levels[3] as f64,
    ]
}

/// Half-size statistics over a raw mosaic (cpp = 1) or an already-demosaiced
/// interleaved image (cpp = 3).
///
/// Values are normalized per channel by `(v - black) / (white - black)` and
/// scaled to the 0..255 range before averaging, so the results line up with
/// the 8-bit brightness plane. Returns None for degenerate inputs.
fn mosaic_stats(
    width: usize,
    height: usize,
    cpp: usize,
    pixel: impl Fn(usize) -> f64,
    color_at: impl Fn(usize, usize) -> usize,
    black: &[f64; 4],
    white: &[f64; 4],
) -> Option<([f64; 3], BrightnessStats)> {
    let mut histogram = [0u64; 256];
    let mut channel_sum = [0f64; 3];
    let mut block_count = 0u64;

    let normalize = |v: f64, c: usize| -> f64 {
        let range = white[c] - black[c];
        if range <= 0.0 {
            return 0.0;
        }
        ((v - black[c]) / range).clamp(0.0, 1.0) * 255.0
    };

    match cpp {
        1 => {
            if width < 2 || height < 2 {
                return None;
            }
            for by in 0..height / 2 {
                for bx in 0..width / 2 {
                    let mut sum = [0f64; 3];
                    let mut count = [0u32; 3];
                    for dy in 0..2 {
                        for dx in 0..2 {
                            let y = by * 2 + dy;
                            let x = bx * 2 + dx;
                            let c = color_at(y, x).min(3);
                            let v = normalize(pixel(y * width + x), c);
                            // Channel 3 is the mosaic's second green
                            let rgb = match c {
                                0 => 0,
                                2 => 2,
                                _ => 1,
                            };
                            sum[rgb] += v;
                            count[rgb] += 1;
                        }
                    }
                    // Blocks missing a primary (non-Bayer mosaics) are skipped
                    if count.iter().any(|&n| n == 0) {
                        continue;
                    }
                    let r = sum[0] / count[0] as f64;
                    let g = sum[1] / count[1] as f64;
                    let b = sum[2] / count[2] as f64;
                    channel_sum[0] += r;
                    channel_sum[1] += g;
                    channel_sum[2] += b;
                    histogram[brightness_of(r, g, b)] += 1;
                    block_count += 1;
                }
            }
        }
        3 => {
            let pixels = width * height;
            if pixels == 0 {
                return None;
            }
            for i in 0..pixels {
                let r = normalize(pixel(i * 3), 0);
                let g = normalize(pixel(i * 3 + 1), 1);
                let b = normalize(pixel(i * 3 + 2), 2);
                channel_sum[0] += r;
                channel_sum[1] += g;
                channel_sum[2] += b;
                histogram[brightness_of(r, g, b)] += 1;
                block_count += 1;
            }
        }
        _ => return None,
    }

    if block_count == 0 {
        return None;
    }

    let avg = [
        channel_sum[0] / block_count as f64,
        channel_sum[1] / block_count as f64,
        channel_sum[2] / block_count as f64,
    ];
    Some((avg, brightness_stats(&histogram, block_count)))
}

fn brightness_of(r: f64, g: f64, b: f64) -> usize {
    (((r + g + b) / 3.0) as usize).min(255)
}

fn brightness_stats(histogram: &[u64; 256], total: u64) -> BrightnessStats {
    let min = histogram.iter().position(|&n| n > 0).unwrap_or(0) as u8;
    let max = histogram.iter().rposition(|&n| n > 0).unwrap_or(0) as u8;

    let mut sum = 0f64;
    for (value, &count) in histogram.iter().enumerate() {
        sum += value as f64 * count as f64;
    }
    let mean = sum / total as f64;

    let mut variance = 0f64;
    for (value, &count) in histogram.iter().enumerate() {
        let d = value as f64 - mean;
        variance += d * d * count as f64;
    }
    let stdev = (variance / total as f64).sqrt();

    let p25 = percentile(histogram, total, 25.0);
    let p75 = percentile(histogram, total, 75.0);
    let mut deciles = [0f64; 9];
    for (i, decile) in deciles.iter_mut().enumerate() {
        *decile = percentile(histogram, total, (i as f64 + 1.0) * 10.0);
    }

    BrightnessStats {
        min,
        max,
        mean,
        stdev,
        iqr: p75 - p25,
        deciles,
    }
}

/// Linear-interpolated percentile over the 8-bit histogram.
fn percentile(histogram: &[u64; 256], total: u64, p: f64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let rank = (total as f64 - 1.0) * p / 100.0;
    let lo = rank.floor() as u64;
    let hi = rank.ceil() as u64;
    let frac = rank - lo as f64;
    let v_lo = value_at_rank(histogram, lo) as f64;
    let v_hi = value_at_rank(histogram, hi) as f64;
    v_lo + (v_hi - v_lo) * frac
}

fn value_at_rank(histogram: &[u64; 256], rank: u64) -> u8 {
    let mut seen = 0u64;
    for (value, &count) in histogram.iter().enumerate() {
        seen += count;
        if seen > rank {
            return value as u8;
        }
    }
    255
}
