use std::fmt;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::DbError;
use crate::pool::PoolConfig;

/// SQL flavour spoken by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Sqlite,
}

impl Dialect {
    fn begin_statement(self) -> &'static str {
        match self {
            Dialect::MySql => "START TRANSACTION",
            Dialect::Sqlite => "BEGIN",
        }
    }
}

/// A single SQL parameter or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Real(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
        }
    }
}

/// One result row, columns in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new(columns: Vec<(String, Value)>) -> Self {
        Self { columns }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }

    /// Column as text. NULL and missing columns are `None`.
    pub fn get_str(&self, column: &str) -> Option<String> {
        match self.get(column)? {
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            Value::Int(v) => Some(*v),
            Value::Real(v) => Some(*v as i64),
            Value::Text(v) => v.parse().ok(),
            Value::Null => None,
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Database client behind a pooled connection.
pub trait Driver: Send {
    fn dialect(&self) -> Dialect;

    /// Cheap round trip. False means the connection is unusable.
    fn ping(&mut self) -> bool;

    /// Run a statement, returning affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError>;

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError>;

    fn last_insert_id(&mut self) -> Option<i64>;
}

/// Opens drivers for a pool.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, config: &PoolConfig) -> Result<Box<dyn Driver>, DbError>;
}

/// Which driver a pool uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverKind {
    #[default]
    MySql,
    /// `database` is a file path.
    Sqlite,
}

impl DriverKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mysql" => Some(DriverKind::MySql),
            "sqlite" | "sqlite3" => Some(DriverKind::Sqlite),
            _ => None,
        }
    }
}

/// Factory that opens whichever driver the pool config names.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverFactory;

impl ConnectionFactory for DriverFactory {
    fn connect(&self, config: &PoolConfig) -> Result<Box<dyn Driver>, DbError> {
        match config.driver {
            DriverKind::MySql => Ok(Box::new(crate::mysql::MySqlDriver::connect(config)?)),
            DriverKind::Sqlite => Ok(Box::new(crate::sqlite::SqliteDriver::open(config)?)),
        }
    }
}

/// A pooled database connection.
///
/// Owned by the pool's idle list or by whoever acquired it; never shared.
pub struct Connection {
    id: u64,
    driver: Box<dyn Driver>,
    in_transaction: bool,
    last_error: Option<String>,
    created_at: Instant,
    last_used: Instant,
}

impl Connection {
    pub fn new(id: u64, driver: Box<dyn Driver>) -> Self {
        let now = Instant::now();
        Self {
            id,
            driver,
            in_transaction: false,
            last_error: None,
            created_at: now,
            last_used: now,
        }
    }

    /// Pool-unique identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dialect(&self) -> Dialect {
        self.driver.dialect()
    }

    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        let result = self.driver.execute(sql, params);
        self.record(result)
    }

    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        let result = self.driver.query(sql, params);
        self.record(result)
    }

    /// First row of a query, if any.
    pub fn query_one(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>, DbError> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    pub fn last_insert_id(&mut self) -> Option<i64> {
        self.driver.last_insert_id()
    }

    pub fn begin_transaction(&mut self) -> Result<(), DbError> {
        if self.in_transaction {
            return Err(DbError::Query("transaction already open".into()));
        }
        let begin = self.dialect().begin_statement();
        self.execute(begin, &[])?;
        self.in_transaction = true;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), DbError> {
        self.execute("COMMIT", &[])?;
        self.in_transaction = false;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), DbError> {
        let result = self.execute("ROLLBACK", &[]);
        self.in_transaction = false;
        result.map(|_| ())
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn ping(&mut self) -> bool {
        self.driver.ping()
    }

    /// Ready to go back to the idle list: no open transaction and the
    /// server still answers.
    pub fn is_healthy(&mut self) -> bool {
        if self.in_transaction {
            if let Err(e) = self.rollback() {
                warn!(conn = self.id, "Rollback of abandoned transaction failed: {}", e);
                return false;
            }
        }
        self.ping()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    fn record<T>(&mut self, result: Result<T, DbError>) -> Result<T, DbError> {
        match &result {
            Ok(_) => self.last_error = None,
            Err(e) => self.last_error = Some(e.to_string()),
        }
        result
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("dialect", &self.dialect())
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}
