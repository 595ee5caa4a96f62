// All tables are created in one flat block; the schema is stable and there
// is no migration chain.
//
// Camera and Lens rows are content-addressed: the composite UNIQUE
// constraint over every identity attribute rejects duplicate inserts. Under
// the single-writer design that constraint should never fire, but it guards
// the invariant at the schema level too.
pub fn run_migrations(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS Cameras (
            id                  INTEGER PRIMARY KEY,
            make                TEXT NOT NULL,
            model               TEXT NOT NULL,
            daylight_wb_red     REAL,
            daylight_wb_green1  REAL,
            daylight_wb_blue    REAL,
            daylight_wb_green2  REAL,
            UNIQUE (make, model, daylight_wb_red, daylight_wb_green1,
                    daylight_wb_blue, daylight_wb_green2)
        );

        CREATE TABLE IF NOT EXISTS Lenses (
            id                      INTEGER PRIMARY KEY,
            make                    TEXT,
            model                   TEXT,
            spec                    TEXT,
            min_focal_length        REAL NOT NULL,
            max_focal_length        REAL NOT NULL,
            lens_f_stops            REAL NOT NULL,
            max_aperture_min_focal  REAL NOT NULL,
            max_aperture_max_focal  REAL NOT NULL,
            effective_max_aperture  REAL NOT NULL,
            CHECK (make IS NOT NULL OR model IS NOT NULL OR spec IS NOT NULL),
            UNIQUE (make, model, spec, min_focal_length, max_focal_length,
                    lens_f_stops, max_aperture_min_focal,
                    max_aperture_max_focal, effective_max_aperture)
        );

        CREATE TABLE IF NOT EXISTS Photos (
            date                TEXT NOT NULL,
            "group"             TEXT NOT NULL,
            file_name           TEXT NOT NULL,

            camera_id           INTEGER NOT NULL REFERENCES Cameras(id),
            lens_id             INTEGER REFERENCES Lenses(id),

            time_taken          TEXT NOT NULL,
            file_size_kb        INTEGER NOT NULL,
            iso                 INTEGER,
            shutter_speed       TEXT,
            aperture            REAL,
            focal_length        REAL,
            auto_focus          INTEGER,
            focus_distance      REAL NOT NULL,
            field_of_view       REAL NOT NULL,

            raw_width           INTEGER NOT NULL,
            raw_height          INTEGER NOT NULL,
            width               INTEGER NOT NULL,
            height              INTEGER NOT NULL,
            thumb_width         INTEGER,
            thumb_height        INTEGER,

            capture_wb_red      REAL,
            capture_wb_green1   REAL,
            capture_wb_blue     REAL,
            capture_wb_green2   REAL,
            avg_red             REAL NOT NULL,
            avg_green           REAL NOT NULL,
            avg_blue            REAL NOT NULL,

            black_level_red     REAL NOT NULL,
            black_level_green1  REAL NOT NULL,
            black_level_blue    REAL NOT NULL,
            black_level_green2  REAL NOT NULL,
            white_level_red     REAL NOT NULL,
            white_level_green1  REAL NOT NULL,
            white_level_blue    REAL NOT NULL,
            white_level_green2  REAL NOT NULL,

            brightness_min      INTEGER NOT NULL,
            brightness_p10      REAL NOT NULL,
            brightness_p20      REAL NOT NULL,
            brightness_p30      REAL NOT NULL,
            brightness_p40      REAL NOT NULL,
            brightness_median   REAL NOT NULL,
            brightness_p60      REAL NOT NULL,
            brightness_p70      REAL NOT NULL,
            brightness_p80      REAL NOT NULL,
            brightness_p90      REAL NOT NULL,
            brightness_max      INTEGER NOT NULL,
            brightness_mean     REAL NOT NULL,
            brightness_stdev    REAL NOT NULL,
            brightness_iqr      REAL NOT NULL,
            exposure_difference REAL,

            PRIMARY KEY (date, "group", file_name)
        );

        CREATE INDEX IF NOT EXISTS idx_photos_camera ON Photos(camera_id);
        CREATE INDEX IF NOT EXISTS idx_photos_lens   ON Photos(lens_id);
        "#,
    )?;

    Ok(())
}
