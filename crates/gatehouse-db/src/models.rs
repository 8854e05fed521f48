//! Row types for the account schema.

/// One row of `accounts`. Timestamps are `YYYY-MM-DD HH:MM:SS` in UTC.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountRow {
    pub id: i64,
    pub username: String,
    /// Argon2 PHC string.
    pub password: String,
    pub email: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    pub last_login: Option<String>,
}

impl AccountRow {
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }
}

/// Fields needed to insert an account.
#[derive(Debug, Clone)]
pub struct NewAccount<'a> {
    pub username: &'a str,
    pub password_hash: &'a str,
    pub email: &'a str,
}

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_DISABLED: &str = "disabled";
