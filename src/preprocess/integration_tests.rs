//! End-to-end pipeline tests: scanner thread -> worker pool -> database
//! applier, running against real temp directories and SQLite files, with a
//! stub extractor standing in for the RAW/EXIF readers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::conf::{ConfigManager, Sample};
use crate::preprocess::extractor::identity_from_path;
use crate::preprocess::metadata::fixtures;
use crate::preprocess::preprocessor::{ExtractFn, Preprocessor};
use crate::preprocess::ExtractError;

/// Stub extractor: `.junk` files are rejected by the "decoder", `.noexif`
/// files fail their metadata pass, everything else yields a deterministic
/// record keyed by its identity triple.
fn stub_extractor() -> Arc<ExtractFn> {
    Arc::new(|path: &Path| {
        let (date, group, file_name) = identity_from_path(path)?;
        if file_name.ends_with(".junk") {
            return Err(ExtractError::InvalidFile {
                path: path.display().to_string(),
                reason: "unsupported file".to_string(),
            });
        }
        if file_name.ends_with(".noexif") {
            return Err(ExtractError::Metadata {
                path: path.display().to_string(),
                reason: "mandatory tag DateTimeOriginal is missing".to_string(),
            });
        }
        Ok(fixtures::metadata(&date, &group, &file_name))
    })
}

struct Fixture {
    _tmp: TempDir,
    config: Arc<ConfigManager>,
    db_path: PathBuf,
}

fn fixture(photos: &[(&str, &str, &str)]) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let project = tmp.path().join("project");
    for (date, group, file) in photos {
        let dir = project.join(date).join(group);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), b"raw bytes").unwrap();
    }
    std::fs::create_dir_all(&project).unwrap();

    let db_path = tmp.path().join("test.sqlite");
    let config = Arc::new(ConfigManager::new(project).unwrap());
    config.root_mut().database = db_path.clone();
    config.root_mut().set_workers(4).unwrap();

    Fixture {
        _tmp: tmp,
        config,
        db_path,
    }
}

fn db(fx: &Fixture) -> rusqlite::Connection {
    rusqlite::Connection::open(&fx.db_path).unwrap()
}

fn count(conn: &rusqlite::Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
        .unwrap()
}

#[test]
fn test_single_photo_creates_photo_camera_and_lens_rows() {
    let fx = fixture(&[("2025-01-01", "a", "0001.dng")]);
    let pre = Preprocessor::with_extractor(Arc::clone(&fx.config), stub_extractor());
    let summary = pre.run().unwrap();

    assert_eq!(summary.new_photos, 1);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.invalid_files, 0);

    let conn = db(&fx);
    assert_eq!(count(&conn, "Photos"), 1);
    assert_eq!(count(&conn, "Cameras"), 1);
    assert_eq!(count(&conn, "Lenses"), 1);

    let (date, group, file): (String, String, String) = conn
        .query_row(
            "SELECT date, \"group\", file_name FROM Photos",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap();
    assert_eq!((date.as_str(), group.as_str(), file.as_str()), ("2025-01-01", "a", "0001.dng"));
}

#[test]
fn test_same_camera_photos_share_rows() {
    let fx = fixture(&[
        ("2025-01-01", "a", "0001.dng"),
        ("2025-01-01", "a", "0002.dng"),
    ]);
    let pre = Preprocessor::with_extractor(Arc::clone(&fx.config), stub_extractor());
    let summary = pre.run().unwrap();
    assert_eq!(summary.new_photos, 2);

    let conn = db(&fx);
    assert_eq!(count(&conn, "Photos"), 2);
    assert_eq!(count(&conn, "Cameras"), 1);
    assert_eq!(count(&conn, "Lenses"), 1);

    let distinct: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT camera_id) + COUNT(DISTINCT lens_id) FROM Photos",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(distinct, 2, "both photos share one camera_id and one lens_id");
}

#[test]
fn test_second_run_changes_nothing() {
    let fx = fixture(&[
        ("2025-01-01", "a", "0001.dng"),
        ("2025-01-02", "b", "0002.dng"),
    ]);

    let first = Preprocessor::with_extractor(Arc::clone(&fx.config), stub_extractor())
        .run()
        .unwrap();
    assert_eq!(first.new_photos, 2);

    let second = Preprocessor::with_extractor(Arc::clone(&fx.config), stub_extractor())
        .run()
        .unwrap();
    assert_eq!(second.new_photos, 0, "second run must create nothing");
    assert_eq!(second.updated_photos, 0, "second run must update nothing");

    let conn = db(&fx);
    assert_eq!(count(&conn, "Photos"), 2);
    assert_eq!(count(&conn, "Cameras"), 1);
    assert_eq!(count(&conn, "Lenses"), 1);
}

#[test]
fn test_deterministic_sample_picks_least_photo_on_every_run() {
    let fx = fixture(&[
        ("2025-01-02", "a", "0003.dng"),
        ("2025-01-01", "b", "0002.dng"),
        ("2025-01-01", "a", "0001.dng"),
    ]);
    fx.config.root_mut().sample = Sample::Deterministic(1);

    for run in 0..2 {
        let summary = Preprocessor::with_extractor(Arc::clone(&fx.config), stub_extractor())
            .run()
            .unwrap();
        if run == 0 {
            assert_eq!(summary.new_photos, 1);
        } else {
            assert_eq!(summary.new_photos, 0);
            assert_eq!(summary.updated_photos, 0);
        }
    }

    let conn = db(&fx);
    assert_eq!(count(&conn, "Photos"), 1);
    let file: String = conn
        .query_row("SELECT file_name FROM Photos", [], |r| r.get(0))
        .unwrap();
    assert_eq!(file, "0001.dng", "lexicographic least by (date, group, file)");
}

#[test]
fn test_random_sample_stores_exactly_n_photos() {
    let fx = fixture(&[
        ("2025-01-01", "a", "0001.dng"),
        ("2025-01-01", "a", "0002.dng"),
        ("2025-01-02", "a", "0003.dng"),
        ("2025-01-03", "a", "0004.dng"),
    ]);
    fx.config.root_mut().sample = Sample::Random(2);

    let summary = Preprocessor::with_extractor(Arc::clone(&fx.config), stub_extractor())
        .run()
        .unwrap();
    assert_eq!(summary.new_photos, 2);
    assert_eq!(summary.invalid_files, 0);
    assert_eq!(count(&db(&fx), "Photos"), 2);
}

#[test]
fn test_invalid_file_is_tolerated_with_zero_error_budget() {
    let fx = fixture(&[
        ("2025-01-01", "a", "0001.dng"),
        ("2025-01-01", "a", "0002.dng"),
        ("2025-01-01", "a", "0003.junk"),
    ]);
    fx.config.root_mut().set_max_processing_errors(0).unwrap();

    let summary = Preprocessor::with_extractor(Arc::clone(&fx.config), stub_extractor())
        .run()
        .unwrap();

    assert_eq!(summary.invalid_files, 1);
    assert_eq!(summary.errors, 0, "invalid files never touch the error budget");
    assert_eq!(summary.new_photos, 2);
    // invalid + stored photos account for every file touched
    assert_eq!(summary.total_scanned + summary.invalid_files, 3);

    let conn = db(&fx);
    assert_eq!(count(&conn, "Photos"), 2);
    let junk: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM Photos WHERE file_name = '0003.junk'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(junk, 0, "no row for the rejected file");
}

#[test]
fn test_error_budget_overflow_fails_run_and_rolls_back() {
    let fx = fixture(&[
        ("2025-01-01", "a", "0001.noexif"),
        ("2025-01-01", "a", "0002.noexif"),
        ("2025-01-01", "a", "0003.noexif"),
        ("2025-01-01", "a", "0004.dng"),
    ]);
    fx.config.root_mut().set_max_processing_errors(2).unwrap();

    let result = Preprocessor::with_extractor(Arc::clone(&fx.config), stub_extractor()).run();
    assert!(result.is_err(), "exceeding the error budget must fail the run");

    // Flushed-but-uncommitted writes are rolled back with the transaction
    let conn = db(&fx);
    assert_eq!(count(&conn, "Photos"), 0);
    assert_eq!(count(&conn, "Cameras"), 0);
}

#[test]
fn test_errors_within_budget_do_not_fail_run() {
    let fx = fixture(&[
        ("2025-01-01", "a", "0001.noexif"),
        ("2025-01-01", "a", "0002.dng"),
    ]);
    fx.config.root_mut().set_max_processing_errors(5).unwrap();

    let summary = Preprocessor::with_extractor(Arc::clone(&fx.config), stub_extractor())
        .run()
        .unwrap();
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.new_photos, 1);
    assert_eq!(count(&db(&fx), "Photos"), 1);
}

#[test]
fn test_excluded_photo_never_reaches_the_pipeline() {
    let fx = fixture(&[
        ("2025-01-01", "a", "0001.dng"),
        ("2025-01-01", "a", "0002.dng"),
    ]);
    fx.config
        .root_mut()
        .add_exclude_photos(vec!["2025-01-01/a/0002.dng".to_string()]);

    let summary = Preprocessor::with_extractor(Arc::clone(&fx.config), stub_extractor())
        .run()
        .unwrap();
    assert_eq!(summary.new_photos, 1);
    assert_eq!(count(&db(&fx), "Photos"), 1);
}

#[test]
fn test_empty_project_completes_cleanly() {
    let fx = fixture(&[]);
    let summary = Preprocessor::with_extractor(Arc::clone(&fx.config), stub_extractor())
        .run()
        .unwrap();
    assert_eq!(summary.new_photos, 0);
    assert_eq!(summary.total_scanned, 0);
}
