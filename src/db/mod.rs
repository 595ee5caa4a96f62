pub mod connection;
pub mod migrations;
pub mod scanner;
pub mod store;

pub use connection::open_connection;
pub use migrations::run_migrations;
pub use store::{upsert_photo, Applied, StoreError};

// Key-length bounds enforced by the schema. The scanner skips directory and
// file names that exceed them.

pub const MAX_DATE_LENGTH: usize = 25;
pub const MAX_GROUP_LENGTH: usize = 25;
pub const MAX_PHOTO_NAME_LENGTH: usize = 25;
