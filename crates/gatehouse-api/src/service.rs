use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use gatehouse_db::{AccountRepository, AccountRow, DatabaseManager, DbError, NewAccount};

use crate::auth;
use crate::models::AccountInfo;

/// Pool the account queries run against.
pub const ACCOUNT_POOL: &str = "account";

/// Outcome of a registration attempt that reached the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created(i64),
    UsernameTaken,
}

/// Account lookups and credential checks over the "account" pool.
pub struct AccountService {
    db: Arc<DatabaseManager>,
}

impl AccountService {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    fn repository(&self) -> Result<AccountRepository> {
        let pool = self
            .db
            .pool(ACCOUNT_POOL)
            .ok_or_else(|| DbError::UnknownPool(ACCOUNT_POOL.to_string()))?;
        Ok(AccountRepository::new(pool))
    }

    pub fn ensure_schema(&self) -> Result<()> {
        self.repository()?.ensure_schema()
    }

    /// The account if `password` matches and the account is active.
    pub fn verify_password(&self, username: &str, password: &str) -> Result<Option<AccountRow>> {
        let Some(account) = self
            .repository()?
            .get_by_username(username)
            .context("looking up account")?
        else {
            debug!(username, "Login for unknown account");
            return Ok(None);
        };

        if !account.is_active() {
            info!(username, status = %account.status, "Login refused for inactive account");
            return Ok(None);
        }
        if !auth::verify_password(&account.password, password) {
            debug!(username, "Password mismatch");
            return Ok(None);
        }
        Ok(Some(account))
    }

    pub fn create_account(&self, username: &str, password: &str, email: &str) -> Result<Registration> {
        let repo = self.repository()?;
        if repo.get_by_username(username)?.is_some() {
            return Ok(Registration::UsernameTaken);
        }

        let password_hash = auth::hash_password(password)?;
        let id = repo.create(&NewAccount {
            username,
            password_hash: &password_hash,
            email,
        })?;
        info!(username, id, "Account created");
        Ok(Registration::Created(id))
    }

    pub fn update_last_login(&self, id: i64) -> Result<()> {
        self.repository()?.update_last_login(id)?;
        Ok(())
    }

    pub fn get_account(&self, username: &str) -> Result<Option<AccountInfo>> {
        Ok(self.repository()?.get_by_username(username)?.map(AccountInfo::from))
    }
}
