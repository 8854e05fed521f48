use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder, Params};
use tracing::debug;

use crate::connection::{Dialect, Driver, Row, Value};
use crate::error::DbError;
use crate::pool::PoolConfig;

/// MySQL driver over the synchronous `mysql` client.
pub struct MySqlDriver {
    conn: Conn,
}

impl MySqlDriver {
    pub fn connect(config: &PoolConfig) -> Result<Self, DbError> {
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(config.host.clone()))
            .tcp_port(config.port)
            .db_name(Some(config.database.clone()))
            .user(Some(config.username.clone()))
            .pass(Some(config.password.clone()))
            .tcp_connect_timeout(Some(config.connection_timeout))
            .read_timeout(Some(config.query_timeout))
            .write_timeout(Some(config.query_timeout));
        let conn = Conn::new(opts).map_err(|e| DbError::Connect(e.to_string()))?;
        debug!(host = %config.host, port = config.port, database = %config.database, "MySQL connection opened");
        Ok(Self { conn })
    }
}

fn to_params(params: &[Value]) -> Params {
    if params.is_empty() {
        return Params::Empty;
    }
    Params::Positional(params.iter().map(to_mysql).collect())
}

fn to_mysql(value: &Value) -> mysql::Value {
    match value {
        Value::Null => mysql::Value::NULL,
        Value::Int(v) => mysql::Value::Int(*v),
        Value::Real(v) => mysql::Value::Double(*v),
        Value::Text(v) => mysql::Value::Bytes(v.as_bytes().to_vec()),
    }
}

fn from_mysql(value: &mysql::Value) -> Value {
    match value {
        mysql::Value::NULL => Value::Null,
        mysql::Value::Bytes(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        mysql::Value::Int(v) => Value::Int(*v),
        mysql::Value::UInt(v) => Value::Int(*v as i64),
        mysql::Value::Float(v) => Value::Real(*v as f64),
        mysql::Value::Double(v) => Value::Real(*v),
        mysql::Value::Date(year, month, day, hour, minute, second, _micros) => Value::Text(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            year, month, day, hour, minute, second
        )),
        mysql::Value::Time(negative, days, hours, minutes, seconds, _micros) => {
            let sign = if *negative { "-" } else { "" };
            let hours = *days * 24 + *hours as u32;
            Value::Text(format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds))
        }
    }
}

fn convert_row(row: &mysql::Row) -> Row {
    let columns = row
        .columns_ref()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let value = row.as_ref(i).map(from_mysql).unwrap_or(Value::Null);
            (column.name_str().into_owned(), value)
        })
        .collect();
    Row::new(columns)
}

impl Driver for MySqlDriver {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    fn ping(&mut self) -> bool {
        self.conn.query_drop("SELECT 1").is_ok()
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        let result = if params.is_empty() {
            self.conn.query_drop(sql)
        } else {
            self.conn.exec_drop(sql, to_params(params))
        };
        result.map_err(|e| DbError::Query(e.to_string()))?;
        Ok(self.conn.affected_rows())
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        let rows: Vec<mysql::Row> = if params.is_empty() {
            self.conn.query(sql)
        } else {
            self.conn.exec(sql, to_params(params))
        }
        .map_err(|e| DbError::Query(e.to_string()))?;
        Ok(rows.iter().map(convert_row).collect())
    }

    fn last_insert_id(&mut self) -> Option<i64> {
        match self.conn.last_insert_id() {
            0 => None,
            id => Some(id as i64),
        }
    }
}
