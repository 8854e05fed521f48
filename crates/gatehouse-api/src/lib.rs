//! Account business logic: password hashing, the account service and the
//! request handlers behind the protocol's message types.

pub mod auth;
pub mod handlers;
pub mod models;
pub mod service;

pub use handlers::AccountHandlers;
pub use models::{AccountInfo, AccountPolicy};
pub use service::{ACCOUNT_POOL, AccountService, Registration};
