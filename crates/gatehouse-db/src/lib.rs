pub mod accounts;
pub mod connection;
pub mod error;
pub mod manager;
pub mod migrations;
pub mod models;
pub mod mysql;
pub mod pool;
pub mod sqlite;

pub use accounts::AccountRepository;
pub use connection::{Connection, ConnectionFactory, Dialect, Driver, DriverFactory, DriverKind, Row, Value};
pub use error::DbError;
pub use manager::DatabaseManager;
pub use models::{AccountRow, NewAccount};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
