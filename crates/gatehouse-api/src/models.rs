use serde::Serialize;

use gatehouse_db::AccountRow;

/// Account as shown to clients. Never carries the password hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountInfo {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    pub last_login: Option<String>,
}

impl From<AccountRow> for AccountInfo {
    fn from(row: AccountRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
            email: row.email,
            status: row.status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_login: row.last_login,
        }
    }
}

/// Input limits applied before touching the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountPolicy {
    pub password_min_length: usize,
    pub username_max_length: usize,
}

impl Default for AccountPolicy {
    fn default() -> Self {
        Self {
            password_min_length: 0,
            username_max_length: 64,
        }
    }
}
