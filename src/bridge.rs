//! SQL bridge: executes one parameterized statement and shapes the result
//! as JSON.
//!
//! Rows keep their column order and each value keeps the storage class the
//! engine reported for it.

use crate::config::BridgeMode;
use crate::error::{AppError, Result};
use base64::{Engine, engine::general_purpose::STANDARD};
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, Statement, ToSql};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// One SQL request as read from stdin.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeRequest {
    /// Statement text with positional placeholders.
    pub sql: String,
    /// Values bound to `?1`, `?2`, ...
    #[serde(default)]
    pub params: Vec<SqlValue>,
}

impl BridgeRequest {
    /// Build a request.
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Parse a request document.
    pub fn from_json(input: &[u8]) -> Result<Self> {
        serde_json::from_slice(input)
            .map_err(|e| AppError::InvalidRequest(format!("Malformed SQL request: {}", e)))
    }
}

/// A single SQL value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    /// NULL.
    Null,
    /// Boolean parameter, stored as 0/1.
    Bool(bool),
    /// 64-bit integer.
    Integer(i64),
    /// Double precision float.
    Real(f64),
    /// UTF-8 text. Blob columns come back base64 encoded.
    Text(String),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl SqlValue {
    fn from_column(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Text(STANDARD.encode(b)),
        }
    }

    /// Integer value, if this is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Text value, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// A result row: column names in select order mapped to values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row(Vec<(String, SqlValue)>);

impl Row {
    /// Look up a column by name.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.0.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }

    /// Column names in order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Bridge response document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BridgeResponse {
    /// `query-all`.
    Rows {
        /// All rows.
        rows: Vec<Row>,
    },
    /// `query-one`.
    Row {
        /// First row, if any.
        row: Option<Row>,
    },
    /// `execute`.
    Changes {
        /// Rows affected; 0 for DDL.
        changes: usize,
    },
}

impl BridgeResponse {
    /// Serialize as one newline-terminated JSON document.
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut out = serde_json::to_vec(self)?;
        out.push(b'\n');
        Ok(out)
    }
}

/// Run a request in the given mode.
pub fn run(conn: &Connection, request: &BridgeRequest, mode: BridgeMode) -> Result<BridgeResponse> {
    Ok(match mode {
        BridgeMode::QueryAll => BridgeResponse::Rows {
            rows: query_all(conn, request)?,
        },
        BridgeMode::QueryOne => BridgeResponse::Row {
            row: query_one(conn, request)?,
        },
        BridgeMode::Execute => BridgeResponse::Changes {
            changes: execute(conn, request)?,
        },
    })
}

/// Return every row.
pub fn query_all(conn: &Connection, request: &BridgeRequest) -> Result<Vec<Row>> {
    let mut stmt = prepare(conn, request)?;
    let names = column_names(&stmt);
    let mut rows = stmt.query(rusqlite::params_from_iter(request.params.iter()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(read_row(row, &names)?);
    }
    Ok(out)
}

/// Return the first row, if any. The caller adds `LIMIT 1` when it wants one.
pub fn query_one(conn: &Connection, request: &BridgeRequest) -> Result<Option<Row>> {
    let mut stmt = prepare(conn, request)?;
    let names = column_names(&stmt);
    let mut rows = stmt.query(rusqlite::params_from_iter(request.params.iter()))?;

    match rows.next()? {
        Some(row) => Ok(Some(read_row(row, &names)?)),
        None => Ok(None),
    }
}

/// Execute a statement and return the number of changed rows.
pub fn execute(conn: &Connection, request: &BridgeRequest) -> Result<usize> {
    let mut stmt = prepare(conn, request)?;
    let changes = stmt.execute(rusqlite::params_from_iter(request.params.iter()))?;
    // sqlite3_changes() is not reset by schema statements.
    Ok(if is_schema_statement(&request.sql) {
        0
    } else {
        changes
    })
}

fn prepare<'c>(conn: &'c Connection, request: &BridgeRequest) -> Result<Statement<'c>> {
    let stmt = conn.prepare(&request.sql)?;
    let expected = stmt.parameter_count();
    if expected != request.params.len() {
        return Err(AppError::InvalidRequest(format!(
            "Statement expects {} parameter(s), got {}",
            expected,
            request.params.len()
        )));
    }
    Ok(stmt)
}

fn column_names(stmt: &Statement<'_>) -> Vec<String> {
    stmt.column_names().into_iter().map(String::from).collect()
}

fn read_row(row: &rusqlite::Row<'_>, names: &[String]) -> Result<Row> {
    let mut values = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        values.push((name.clone(), SqlValue::from_column(row.get_ref(i)?)));
    }
    Ok(Row(values))
}

fn is_schema_statement(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(keyword.as_str(), "CREATE" | "DROP" | "ALTER")
}
