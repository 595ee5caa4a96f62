//! Database-side photo listing: iterate the photos already indexed in the
//! store instead of walking the file system, honoring the same sampling
//! policy as the directory scanner.

use std::path::{Path, PathBuf};

use rusqlite::Connection;

use crate::conf::Sample;
use crate::db::store::StoreError;

/// The `(date, group, file_name)` identity of every stored photo, under the
/// configured sampling policy. A random sample draws rows in random order;
/// `order` then sorts whatever was selected.
pub fn list_photo_records(
    conn: &Connection,
    sample: Sample,
    order: bool,
) -> Result<Vec<(String, String, String)>, StoreError> {
    let sql = match (sample, order) {
        (Sample::Random(_), true) => {
            // Sample first, then order what was drawn
            "SELECT date, \"group\", file_name FROM (
                 SELECT date, \"group\", file_name FROM Photos
                 ORDER BY RANDOM() LIMIT ?1
             ) ORDER BY date, \"group\", file_name"
        }
        (Sample::Random(_), false) => {
            "SELECT date, \"group\", file_name FROM Photos ORDER BY RANDOM() LIMIT ?1"
        }
        (Sample::Deterministic(_), _) => {
            "SELECT date, \"group\", file_name FROM Photos
             ORDER BY date, \"group\", file_name LIMIT ?1"
        }
        (Sample::Off, true) => {
            "SELECT date, \"group\", file_name FROM Photos
             ORDER BY date, \"group\", file_name"
        }
        (Sample::Off, false) => "SELECT date, \"group\", file_name FROM Photos",
    };

    let mut stmt = conn.prepare(sql)?;
    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    };
    let rows = match sample.size() {
        Some(n) => stmt.query_map([n as i64], map_row)?,
        None => stmt.query_map([], map_row)?,
    };
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Convenience over [`list_photo_records`]: full paths inside the project.
pub fn list_photo_paths(
    conn: &Connection,
    project: &Path,
    sample: Sample,
    order: bool,
) -> Result<Vec<PathBuf>, StoreError> {
    Ok(list_photo_records(conn, sample, order)?
        .into_iter()
        .map(|(date, group, file)| project.join(date).join(group).join(file))
        .collect())
}

/// Total number of photo records in the store.
pub fn count_photos(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM Photos", [], |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{run_migrations, upsert_photo};
    use crate::preprocess::metadata::fixtures::metadata;

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        for (date, group, file) in [
            ("2025-01-02", "a", "0003.dng"),
            ("2025-01-01", "b", "0002.dng"),
            ("2025-01-01", "a", "0001.dng"),
        ] {
            upsert_photo(&conn, &metadata(date, group, file)).unwrap();
        }
        conn
    }

    #[test]
    fn test_lists_all_records_in_order() {
        let conn = seeded();
        let records = list_photo_records(&conn, Sample::Off, true).unwrap();
        assert_eq!(
            records,
            vec![
                ("2025-01-01".into(), "a".into(), "0001.dng".into()),
                ("2025-01-01".into(), "b".into(), "0002.dng".into()),
                ("2025-01-02".into(), "a".into(), "0003.dng".into()),
            ]
        );
    }

    #[test]
    fn test_deterministic_sample_takes_least_records() {
        let conn = seeded();
        let records = list_photo_records(&conn, Sample::Deterministic(2), false).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].2, "0001.dng");
        assert_eq!(records[1].2, "0002.dng");
    }

    #[test]
    fn test_random_sample_limits_and_orders() {
        let conn = seeded();
        let records = list_photo_records(&conn, Sample::Random(2), true).unwrap();
        assert_eq!(records.len(), 2);
        // Whatever was drawn comes back sorted
        assert!(records[0] <= records[1]);
    }

    #[test]
    fn test_paths_join_project_root() {
        let conn = seeded();
        let paths =
            list_photo_paths(&conn, Path::new("/proj"), Sample::Deterministic(1), true).unwrap();
        assert_eq!(paths, vec![PathBuf::from("/proj/2025-01-01/a/0001.dng")]);
    }

    #[test]
    fn test_count_photos() {
        let conn = seeded();
        assert_eq!(count_photos(&conn).unwrap(), 3);
        let empty = Connection::open_in_memory().unwrap();
        run_migrations(&empty).unwrap();
        assert_eq!(count_photos(&empty).unwrap(), 0);
    }
}
