//! Thumbnail generation: a parallel map over the scanner output. Each photo
//! becomes a JPEG in the directory derived from the group's thumbnail
//! location and path settings.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;

use crate::conf::tree::thumbnail_dir;
use crate::conf::ConfigManager;
use crate::preprocess::exif::embedded_thumbnail;
use crate::preprocess::extractor::identity_from_path;
use crate::scan::{scan_photos, ScanMetrics};

/// Render pool size. The configured worker count governs this stage too,
/// but unlike preprocessing no thread is reserved for the scanner: the scan
/// pass has already finished by the time rendering begins. JPEG decode and
/// re-encode are CPU-bound, so there is no point exceeding the host's
/// parallelism either.
fn render_thread_count(configured_workers: usize) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    configured_workers.clamp(1, cores)
}

/// Run the `thumb` mode: emit a JPEG thumbnail for every photo the scanner
/// yields. Individual failures are logged and skipped; the run itself only
/// fails on setup problems.
pub fn generate_thumbnails(cfg: &ConfigManager) -> anyhow::Result<()> {
    let (project, workers) = {
        let root = cfg.root();
        (root.project().clone(), root.workers())
    };
    tracing::info!(
        "generating thumbnails for \"{}\" (this may take a while)",
        project.display()
    );

    let metrics = ScanMetrics::new();
    let photos: Vec<PathBuf> = scan_photos(cfg, &metrics, true, false).collect();

    let written = AtomicUsize::new(0);
    let skipped = AtomicUsize::new(0);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(render_thread_count(workers))
        .build()
        .unwrap_or_else(|_| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(1)
                .build()
                .expect("single-thread rayon pool")
        });

    pool.install(|| {
        photos.par_iter().for_each(|photo| {
            match generate_thumbnail(cfg, &project, photo) {
                Ok(path) => {
                    tracing::debug!("thumbnail saved to \"{}\"", path.display());
                    written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!("skipping thumbnail for \"{}\": {e:#}", photo.display());
                    skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    });

    tracing::info!(
        "thumbnails complete: {} written, {} skipped, {} photo(s) scanned",
        written.load(Ordering::Relaxed),
        skipped.load(Ordering::Relaxed),
        photos.len()
    );
    Ok(())
}

/// Produce one thumbnail: `<layout dir>/<stem>.jpg`, resized by the group's
/// resize factor and encoded at its JPEG quality.
fn generate_thumbnail(
    cfg: &ConfigManager,
    project: &Path,
    photo: &Path,
) -> anyhow::Result<PathBuf> {
    let (date, group, file_name) = identity_from_path(photo)?;
    let options = cfg.photo_options(&date, &group);

    let stem = Path::new(&file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or(file_name.clone());
    let out_dir = thumbnail_dir(&options, project, &date, &group);
    let out_path = out_dir.join(format!("{stem}.jpg"));

    let img = load_source(photo, options.use_embedded_thumbnail)?;
    let img = apply_resize(img, options.thumbnail_resize_factor);

    std::fs::create_dir_all(&out_dir)?;
    let file = std::fs::File::create(&out_path)?;
    let mut writer = std::io::BufWriter::new(file);
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, options.thumbnail_quality);
    img.to_rgb8().write_with_encoder(encoder)?;

    Ok(out_path)
}

/// Prefer the embedded EXIF preview when configured: extracting it skips
/// the full decode entirely. Either way the other source is the fallback.
fn load_source(photo: &Path, prefer_embedded: bool) -> anyhow::Result<image::DynamicImage> {
    let from_embedded = || {
        embedded_thumbnail(photo).and_then(|bytes| image::load_from_memory(&bytes).ok())
    };

    if prefer_embedded {
        if let Some(img) = from_embedded() {
            return Ok(img);
        }
    }
    match image::open(photo) {
        Ok(img) => Ok(img),
        Err(open_err) => from_embedded()
            .ok_or_else(|| anyhow::anyhow!("cannot decode photo or its embedded preview: {open_err}")),
    }
}

fn apply_resize(img: image::DynamicImage, factor: f64) -> image::DynamicImage {
    if factor >= 1.0 {
        return img;
    }
    let width = ((img.width() as f64 * factor).round() as u32).max(1);
    let height = ((img.height() as f64 * factor).round() as u32).max(1);
    img.thumbnail(width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::ThumbLocation;
    use tempfile::TempDir;

    fn project_with_jpeg(width: u32, height: u32) -> (TempDir, ConfigManager, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let group_dir = tmp.path().join("2025-01-01").join("a");
        std::fs::create_dir_all(&group_dir).unwrap();
        let photo = group_dir.join("0001.jpg");
        image::DynamicImage::new_rgb8(width, height)
            .save(&photo)
            .unwrap();
        let cfg = ConfigManager::new(tmp.path().to_path_buf()).unwrap();
        (tmp, cfg, photo)
    }

    #[test]
    fn test_thumbnail_written_to_root_layout() {
        let (tmp, cfg, photo) = project_with_jpeg(64, 48);
        let out = generate_thumbnail(&cfg, tmp.path(), &photo).unwrap();
        assert_eq!(
            out,
            tmp.path().join("thumb").join("2025-01-01").join("a").join("0001.jpg")
        );
        assert!(out.exists());
        let img = image::open(&out).unwrap();
        assert_eq!((img.width(), img.height()), (64, 48));
    }

    #[test]
    fn test_thumbnail_group_layout_and_resize() {
        let (tmp, cfg, photo) = project_with_jpeg(100, 50);
        {
            cfg.root_mut().defaults.thumbnail_location = ThumbLocation::Group;
            cfg.root_mut().defaults.thumbnail_resize_factor = 0.5;
        }
        let out = generate_thumbnail(&cfg, tmp.path(), &photo).unwrap();
        assert_eq!(
            out,
            tmp.path()
                .join("2025-01-01")
                .join("a")
                .join("thumb")
                .join("0001.jpg")
        );
        let img = image::open(&out).unwrap();
        assert_eq!((img.width(), img.height()), (50, 25));
    }

    #[test]
    fn test_thumbnail_output_is_jpeg() {
        let (tmp, cfg, photo) = project_with_jpeg(32, 32);
        let out = generate_thumbnail(&cfg, tmp.path(), &photo).unwrap();
        let bytes = std::fs::read(&out).unwrap();
        assert_eq!(&bytes[0..2], &[0xFF, 0xD8], "must start with JPEG magic");
    }

    #[test]
    fn test_undecodable_photo_is_an_error_not_a_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let group_dir = tmp.path().join("2025-01-01").join("a");
        std::fs::create_dir_all(&group_dir).unwrap();
        let photo = group_dir.join("0001.nef");
        std::fs::write(&photo, b"not an image").unwrap();
        let cfg = ConfigManager::new(tmp.path().to_path_buf()).unwrap();
        assert!(generate_thumbnail(&cfg, tmp.path(), &photo).is_err());
    }

    #[test]
    fn test_generate_thumbnails_end_to_end() {
        let (tmp, cfg, _photo) = project_with_jpeg(40, 40);
        generate_thumbnails(&cfg).unwrap();
        assert!(tmp
            .path()
            .join("thumb")
            .join("2025-01-01")
            .join("a")
            .join("0001.jpg")
            .exists());
    }

    #[test]
    fn test_apply_resize_noop_at_factor_one() {
        let img = image::DynamicImage::new_rgb8(10, 10);
        let out = apply_resize(img, 1.0);
        assert_eq!((out.width(), out.height()), (10, 10));
    }

    #[test]
    fn test_render_thread_count_follows_workers_up_to_cores() {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        assert_eq!(render_thread_count(1), 1);
        assert_eq!(render_thread_count(cores + 100), cores);
        assert!(render_thread_count(0) >= 1);
    }
}
