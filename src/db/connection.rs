use std::path::PathBuf;

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbPooledConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Create a new database connection pool.
pub fn create_pool(database_url: &str) -> Result<DbPool, Box<dyn std::error::Error>> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(16)
        .build(manager)
        .map_err(|e| format!("Failed to create connection pool: {}", e))?;

    Ok(pool)
}

/// Resolve the database path: `PLEXBRIDGE_DB` env override, else the platform
/// data directory, else the working directory.
pub fn get_db_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(path) = std::env::var("PLEXBRIDGE_DB") {
        return Ok(PathBuf::from(path));
    }

    let data_dir = dirs::data_dir()
        .map(|d| d.join("plexbridge"))
        .unwrap_or_else(|| PathBuf::from("."));

    std::fs::create_dir_all(&data_dir).map_err(|e| {
        format!(
            "Cannot create data directory at '{}': {}. Please check folder permissions.",
            data_dir.display(),
            e
        )
    })?;

    Ok(data_dir.join("plexbridge.db"))
}

/// Establish a connection to the SQLite database with busy timeout.
pub fn establish_connection(database_url: &str) -> Result<SqliteConnection, diesel::ConnectionError> {
    let mut conn = SqliteConnection::establish(database_url)?;

    // Handle concurrent access from the scheduler and request handlers.
    diesel::sql_query("PRAGMA busy_timeout = 5000")
        .execute(&mut conn)
        .map_err(|e| {
            diesel::ConnectionError::BadConnection(format!("Failed to set busy_timeout: {}", e))
        })?;
    diesel::sql_query("PRAGMA foreign_keys = ON")
        .execute(&mut conn)
        .map_err(|e| {
            diesel::ConnectionError::BadConnection(format!("Failed to enable foreign_keys: {}", e))
        })?;

    Ok(conn)
}

/// Run all pending migrations.
pub fn run_migrations(
    conn: &mut SqliteConnection,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    conn.run_pending_migrations(MIGRATIONS)?;
    Ok(())
}
