use anyhow::{Context, Result};
use tracing::info;

use crate::connection::{Connection, Dialect};

const MYSQL_ACCOUNTS: &str = "
    CREATE TABLE IF NOT EXISTS accounts (
        id          BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        username    VARCHAR(64) NOT NULL UNIQUE,
        password    VARCHAR(255) NOT NULL,
        email       VARCHAR(255) NOT NULL DEFAULT '',
        status      VARCHAR(16) NOT NULL DEFAULT 'active',
        created_at  DATETIME NOT NULL,
        updated_at  DATETIME NOT NULL,
        last_login  DATETIME NULL
    )";

const SQLITE_ACCOUNTS: &str = "
    CREATE TABLE IF NOT EXISTS accounts (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        username    TEXT NOT NULL UNIQUE,
        password    TEXT NOT NULL,
        email       TEXT NOT NULL DEFAULT '',
        status      TEXT NOT NULL DEFAULT 'active',
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL,
        last_login  TEXT
    )";

/// Create the account schema if it does not exist yet.
pub fn run(conn: &mut Connection) -> Result<()> {
    let ddl = match conn.dialect() {
        Dialect::MySql => MYSQL_ACCOUNTS,
        Dialect::Sqlite => SQLITE_ACCOUNTS,
    };
    conn.execute(ddl, &[]).context("creating accounts table")?;

    info!("Database migrations complete");
    Ok(())
}
