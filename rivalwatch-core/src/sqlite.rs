use rusqlite::Connection;

/// Connection settings shared by every store: WAL journaling, enforced
/// foreign keys and a busy timeout so a concurrent CLI reader does not fail
/// while a run is being saved.
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA foreign_keys = ON;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}
