use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;

use crate::connection::{Connection, Row, Value};
use crate::migrations;
use crate::models::{AccountRow, NewAccount, STATUS_ACTIVE};
use crate::pool::ConnectionPool;

const SELECT_ACCOUNT: &str = "SELECT id, username, password, email, status, created_at, updated_at, last_login FROM accounts";

/// Timestamp format shared by both dialects.
pub fn now_timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parameterised SQL over the `accounts` table. Every call takes a
/// connection from the pool and returns it before returning.
#[derive(Clone)]
pub struct AccountRepository {
    pool: Arc<ConnectionPool>,
}

impl AccountRepository {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn ensure_schema(&self) -> Result<()> {
        self.pool.with_connection(migrations::run)
    }

    pub fn get_by_username(&self, username: &str) -> Result<Option<AccountRow>> {
        self.pool.with_connection(|conn| {
            query_account(conn, &format!("{} WHERE username = ?", SELECT_ACCOUNT), &[username.into()])
        })
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<AccountRow>> {
        self.pool.with_connection(|conn| {
            query_account(conn, &format!("{} WHERE id = ?", SELECT_ACCOUNT), &[id.into()])
        })
    }

    /// Insert an active account and return its id.
    pub fn create(&self, account: &NewAccount<'_>) -> Result<i64> {
        self.pool.with_connection(|conn| {
            let now = now_timestamp();
            conn.execute(
                "INSERT INTO accounts (username, password, email, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
                &[
                    account.username.into(),
                    account.password_hash.into(),
                    account.email.into(),
                    STATUS_ACTIVE.into(),
                    now.as_str().into(),
                    now.as_str().into(),
                ],
            )
            .with_context(|| format!("inserting account {}", account.username))?;
            conn.last_insert_id()
                .ok_or_else(|| anyhow!("no id returned for account {}", account.username))
        })
    }

    /// Write back password, email and status. Returns false if no row
    /// has that id.
    pub fn update(&self, account: &AccountRow) -> Result<bool> {
        self.pool.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE accounts SET password = ?, email = ?, status = ?, updated_at = ? WHERE id = ?",
                    &[
                        (&account.password).into(),
                        (&account.email).into(),
                        (&account.status).into(),
                        now_timestamp().into(),
                        account.id.into(),
                    ],
                )
                .with_context(|| format!("updating account {}", account.id))?;
            Ok(changed > 0)
        })
    }

    pub fn delete_by_id(&self, id: i64) -> Result<bool> {
        self.pool.with_connection(|conn| {
            let changed = conn
                .execute("DELETE FROM accounts WHERE id = ?", &[id.into()])
                .with_context(|| format!("deleting account {}", id))?;
            Ok(changed > 0)
        })
    }

    /// One page of accounts ordered by id.
    pub fn get_all(&self, limit: u32, offset: u32) -> Result<Vec<AccountRow>> {
        self.pool.with_connection(|conn| {
            let rows = conn
                .query(
                    &format!("{} ORDER BY id LIMIT ? OFFSET ?", SELECT_ACCOUNT),
                    &[limit.into(), offset.into()],
                )
                .context("listing accounts")?;
            rows.iter().map(account_from_row).collect()
        })
    }

    pub fn update_last_login(&self, id: i64) -> Result<bool> {
        self.pool.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE accounts SET last_login = ? WHERE id = ?",
                    &[now_timestamp().into(), id.into()],
                )
                .with_context(|| format!("recording login for account {}", id))?;
            Ok(changed > 0)
        })
    }
}

fn query_account(conn: &mut Connection, sql: &str, params: &[Value]) -> Result<Option<AccountRow>> {
    let row = conn.query_one(sql, params).context("querying account")?;
    row.as_ref().map(account_from_row).transpose()
}

fn account_from_row(row: &Row) -> Result<AccountRow> {
    let text = |column: &str| {
        row.get_str(column)
            .ok_or_else(|| anyhow!("accounts.{} is missing", column))
    };
    Ok(AccountRow {
        id: row.get_i64("id").ok_or_else(|| anyhow!("accounts.id is missing"))?,
        username: text("username")?,
        password: text("password")?,
        email: row.get_str("email").unwrap_or_default(),
        status: text("status")?,
        created_at: text("created_at")?,
        updated_at: text("updated_at")?,
        last_login: row.get_str("last_login"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{DriverFactory, DriverKind};
    use crate::models::STATUS_DISABLED;
    use crate::pool::PoolConfig;
    use tempfile::TempDir;

    fn repository(dir: &TempDir) -> AccountRepository {
        let config = PoolConfig {
            driver: DriverKind::Sqlite,
            database: dir.path().join("accounts.db").to_string_lossy().into_owned(),
            max_pool_size: 2,
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::initialize("account", config, Arc::new(DriverFactory)).unwrap();
        let repo = AccountRepository::new(pool);
        repo.ensure_schema().unwrap();
        repo
    }

    fn new_account<'a>(username: &'a str, email: &'a str) -> NewAccount<'a> {
        NewAccount {
            username,
            password_hash: "$argon2id$stub",
            email,
        }
    }

    #[test]
    fn test_create_and_lookup() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir);

        let id = repo.create(&new_account("alice", "alice@x.com")).unwrap();
        let by_name = repo.get_by_username("alice").unwrap().unwrap();
        assert_eq!(by_name.id, id);
        assert_eq!(by_name.email, "alice@x.com");
        assert!(by_name.is_active());
        assert!(by_name.last_login.is_none());

        let by_id = repo.get_by_id(id).unwrap().unwrap();
        assert_eq!(by_id, by_name);
        assert!(repo.get_by_username("nobody").unwrap().is_none());
        assert!(repo.get_by_id(id + 100).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_username_fails() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir);
        repo.create(&new_account("bob", "")).unwrap();
        assert!(repo.create(&new_account("bob", "other@x.com")).is_err());
    }

    #[test]
    fn test_update_and_last_login() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir);
        let id = repo.create(&new_account("carol", "c@x.com")).unwrap();

        let mut account = repo.get_by_id(id).unwrap().unwrap();
        account.email = "carol@y.com".into();
        account.status = STATUS_DISABLED.into();
        assert!(repo.update(&account).unwrap());

        assert!(repo.update_last_login(id).unwrap());
        let stored = repo.get_by_id(id).unwrap().unwrap();
        assert_eq!(stored.email, "carol@y.com");
        assert!(!stored.is_active());
        assert!(stored.last_login.is_some());

        account.id = id + 1;
        assert!(!repo.update(&account).unwrap());
    }

    #[test]
    fn test_delete_and_paging() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir);
        let ids: Vec<i64> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|name| repo.create(&new_account(name, "")).unwrap())
            .collect();

        let page = repo.get_all(2, 1).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].username, "b");
        assert_eq!(page[1].username, "c");

        assert!(repo.delete_by_id(ids[0]).unwrap());
        assert!(!repo.delete_by_id(ids[0]).unwrap());
        assert_eq!(repo.get_all(10, 0).unwrap().len(), 4);
        assert_eq!(repo.pool().active_connections(), 0);
    }
}
