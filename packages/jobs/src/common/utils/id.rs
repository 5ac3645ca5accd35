use uuid::Uuid;

/// Generate a primary key for a new row.
///
/// V7 UUIDs are time-ordered, which keeps index inserts append-mostly.
pub fn db_id() -> Uuid {
    Uuid::now_v7()
}
