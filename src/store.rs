//! SQLite-backed data store
//!
//! Executes read-only statements against the box-score database and exposes
//! the schema and value vocabulary the rest of the pipeline is built from.

use crate::entities::VocabularySource;
use crate::error::{PipelineError, Result};
use crate::schema::{Column, SchemaDescriptor, SchemaProvider};
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{error, info};

/// One cell of a result row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<Value> for ScalarValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ScalarValue::Null,
            Value::Integer(i) => ScalarValue::Integer(i),
            Value::Real(f) => ScalarValue::Real(f),
            Value::Text(s) => ScalarValue::Text(s),
            Value::Blob(b) => ScalarValue::Blob(b),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Integer(i) => write!(f, "{}", i),
            ScalarValue::Real(r) => write!(f, "{}", r),
            ScalarValue::Text(s) => write!(f, "{}", s),
            ScalarValue::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// A result row: column names paired with values, in select-list order.
/// Serializes as a JSON object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    cells: Vec<(String, ScalarValue)>,
}

impl Row {
    pub fn new(cells: Vec<(String, ScalarValue)>) -> Self {
        Self { cells }
    }

    pub fn cells(&self) -> &[(String, ScalarValue)] {
        &self.cells
    }

    pub fn get(&self, column: &str) -> Option<&ScalarValue> {
        self.cells
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (name, value) in &self.cells {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .cells
            .iter()
            .map(|(name, value)| format!("{}: {}", name, value))
            .collect();
        write!(f, "{{{}}}", rendered.join(", "))
    }
}

/// Executes a validated statement.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// [`PipelineError::Execution`] when the store rejects the statement.
    async fn execute(&self, sql: &str) -> Result<Vec<Row>>;
}

/// rusqlite is blocking; [`DataStore::execute`] runs queries on tokio's
/// blocking pool so the connection lock is never held on a runtime worker.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open an existing database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PipelineError::Config(format!(
                "database not found at {}",
                path.display()
            )));
        }
        let conn = Connection::open(path).map_err(|e| {
            PipelineError::Execution(format!("Failed to open database {}: {}", path.display(), e))
        })?;
        let store = Self::from_connection(conn)?;
        info!("Connected to database at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA cache_size = 10000;
             PRAGMA temp_store = MEMORY;",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run setup statements (fixtures, migrations). Not subject to the
    /// read-only restriction applied to pipeline queries.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.lock().execute_batch(sql)?;
        Ok(())
    }

    /// Up to `limit` distinct non-null values of `column`, rendered as text.
    pub fn distinct_column_values(&self, table: &str, column: &str, limit: usize) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT {col} FROM {table} WHERE {col} IS NOT NULL LIMIT ?1",
            col = quote_ident(column),
            table = quote_ident(table)
        );
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let values = stmt
            .query_map(params![limit as i64], |row| row.get::<_, Value>(0))?
            .filter_map(|v| v.ok())
            .filter_map(|v| match ScalarValue::from(v) {
                ScalarValue::Null | ScalarValue::Blob(_) => None,
                other => Some(other.to_string()),
            })
            .collect();
        Ok(values)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        lock_connection(&self.conn)
    }
}

fn lock_connection(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn run_query(conn: &Connection, sql: &str) -> Result<Vec<Row>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| PipelineError::Execution(format!("SQLite error: {}", e)))?;

    if !stmt.readonly() {
        return Err(PipelineError::Execution(
            "refusing to run a statement that modifies the database".to_string(),
        ));
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt
        .query([])
        .map_err(|e| PipelineError::Execution(format!("SQLite error: {}", e)))?;

    let mut result = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|e| PipelineError::Execution(format!("SQLite error: {}", e)))?
    {
        let mut cells = Vec::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            let value: Value = row.get(i)?;
            cells.push((name.clone(), ScalarValue::from(value)));
        }
        result.push(Row::new(cells));
    }
    Ok(result)
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>> {
        let start = Instant::now();
        let conn = Arc::clone(&self.conn);
        let statement = sql.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            let guard = lock_connection(&conn);
            run_query(&guard, &statement)
        })
        .await
        .map_err(|e| PipelineError::Execution(format!("query task failed: {}", e)))?;
        match outcome {
            Ok(rows) => {
                info!(
                    "Query executed in {:.3}s, returned {} rows",
                    start.elapsed().as_secs_f64(),
                    rows.len()
                );
                Ok(rows)
            }
            Err(e) => {
                error!("Query failed: {}", e);
                Err(e)
            }
        }
    }
}

impl SchemaProvider for SqliteStore {
    fn get_schema(&self, table: &str) -> Result<Option<SchemaDescriptor>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(r#"SELECT name, type, "notnull", pk FROM pragma_table_info(?1)"#)?;
        let columns = stmt
            .query_map(params![table], |row| {
                Ok(Column {
                    name: row.get(0)?,
                    declared_type: row.get(1)?,
                    not_null: row.get::<_, i64>(2)? != 0,
                    is_primary_key: row.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PipelineError::Schema(format!("Failed to read schema for '{}': {}", table, e)))?;

        if columns.is_empty() {
            return Ok(None);
        }
        info!("Retrieved schema for '{}' with {} columns", table, columns.len());
        Ok(Some(SchemaDescriptor::new(table, columns)))
    }
}

impl VocabularySource for SqliteStore {
    fn distinct_values(&self, table: &str, column: &str) -> Result<Vec<String>> {
        self.distinct_column_values(table, column, 1000)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .execute_batch(
                r#"CREATE TABLE stats (Name TEXT NOT NULL, "No" INTEGER, Pts INTEGER, Opponent TEXT);
                   INSERT INTO stats VALUES ('Betts, Lauren', 51, 20, 'USC');
                   INSERT INTO stats VALUES ('Rice, Kiki', 1, 14, 'USC');
                   INSERT INTO stats VALUES ('Totals', NULL, 78, 'USC');"#,
            )
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_execute_returns_named_cells() {
        let store = fixture();
        let rows = store
            .execute("SELECT Name, Pts FROM stats WHERE Pts > 15 ORDER BY Pts")
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("name"), Some(&ScalarValue::Text("Betts, Lauren".to_string())));
        assert_eq!(rows[1].get("Pts"), Some(&ScalarValue::Integer(78)));
        assert_eq!(
            serde_json::to_string(&rows[0]).unwrap(),
            r#"{"Name":"Betts, Lauren","Pts":20}"#
        );
    }

    #[tokio::test]
    async fn test_execute_refuses_writes() {
        let store = fixture();
        let err = store.execute("DELETE FROM stats").await.unwrap_err();
        assert!(err.is_execution());

        let rows = store.execute("SELECT COUNT(*) AS n FROM stats").await.unwrap();
        assert_eq!(rows[0].get("n"), Some(&ScalarValue::Integer(3)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_queries_share_connection() {
        let store = Arc::new(fixture());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store.execute("SELECT Name FROM stats WHERE Opponent = 'USC'").await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().len(), 3);
        }
    }

    #[tokio::test]
    async fn test_bad_sql_is_execution_error() {
        let store = fixture();
        let err = store.execute("SELECT nope FROM stats").await.unwrap_err();
        assert!(matches!(err, PipelineError::Execution(_)));
    }

    #[test]
    fn test_schema_introspection() {
        let store = fixture();
        let schema = store.get_schema("stats").unwrap().unwrap();
        assert_eq!(schema.columns().len(), 4);
        assert_eq!(schema.columns()[0].name, "Name");
        assert!(schema.columns()[0].not_null);
        assert_eq!(schema.columns()[1].declared_type, "INTEGER");

        assert!(store.get_schema("missing").unwrap().is_none());
    }

    #[test]
    fn test_distinct_values_skip_nulls() {
        let store = fixture();
        let mut numbers = store.distinct_column_values("stats", "No", 10).unwrap();
        numbers.sort();
        assert_eq!(numbers, vec!["1".to_string(), "51".to_string()]);

        let opponents = store.distinct_column_values("stats", "Opponent", 10).unwrap();
        assert_eq!(opponents, vec!["USC".to_string()]);
    }
}
