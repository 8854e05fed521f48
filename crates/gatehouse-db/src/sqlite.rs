use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{ToSql, params_from_iter};
use tracing::debug;

use crate::connection::{Dialect, Driver, Row, Value};
use crate::error::DbError;
use crate::pool::PoolConfig;

/// SQLite driver. The pool's `database` setting is the file path.
pub struct SqliteDriver {
    conn: rusqlite::Connection,
}

impl SqliteDriver {
    pub fn open(config: &PoolConfig) -> Result<Self, DbError> {
        let conn = rusqlite::Connection::open(&config.database)
            .map_err(|e| DbError::Connect(e.to_string()))?;
        conn.busy_timeout(config.query_timeout)
            .map_err(|e| DbError::Connect(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| DbError::Connect(e.to_string()))?;
        debug!(path = %config.database, "SQLite connection opened");
        Ok(Self { conn })
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Int(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            Value::Real(v) => ToSqlOutput::Borrowed(ValueRef::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
        })
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn query_error(e: rusqlite::Error) -> DbError {
    DbError::Query(e.to_string())
}

impl Driver for SqliteDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn ping(&mut self) -> bool {
        self.conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok()
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        let changed = self
            .conn
            .execute(sql, params_from_iter(params.iter()))
            .map_err(query_error)?;
        Ok(changed as u64)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        let mut stmt = self.conn.prepare(sql).map_err(query_error)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let mut rows = stmt.query(params_from_iter(params.iter())).map_err(query_error)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(query_error)? {
            let mut columns = Vec::with_capacity(names.len());
            for (i, name) in names.iter().enumerate() {
                let value = row.get_ref(i).map_err(query_error)?;
                columns.push((name.clone(), from_sqlite(value)));
            }
            out.push(Row::new(columns));
        }
        Ok(out)
    }

    fn last_insert_id(&mut self) -> Option<i64> {
        match self.conn.last_insert_rowid() {
            0 => None,
            id => Some(id),
        }
    }
}
