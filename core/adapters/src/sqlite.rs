//! SQLite-backed search index and record source.
//!
//! The index is a keyed entry table mirrored into FTS5. Writes run on a
//! dedicated connection inside an open transaction that `commit` closes;
//! queries run on a second connection and therefore only see committed
//! documents. Uncommitted writes are rolled back when the index is dropped.

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use indexsync_common::{ClassTag, Error, RecordKey, Result};

use crate::index::{Document, IndexClient, IndexHit, Query};
use crate::source::{FieldRecord, RecordSource};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn backend(err: rusqlite::Error) -> Error {
    Error::AdapterUnavailable(format!("sqlite: {}", err))
}

fn lock<'a>(conn: &'a Mutex<Connection>, what: &str) -> Result<MutexGuard<'a, Connection>> {
    conn.lock()
        .map_err(|_| Error::AdapterUnavailable(format!("{} connection poisoned", what)))
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(backend)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(backend)?;
    Ok(conn)
}

/// Full-text index stored in SQLite.
///
/// Entries live in a regular table keyed by `(class, doc_key)`. Their text
/// is mirrored into an FTS5 table under the same rowid, so every upsert and
/// removal is a key lookup.
pub struct SqliteIndex {
    path: PathBuf,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl SqliteIndex {
    /// Create or open an index database.
    ///
    /// # Errors
    /// - Database creation or schema setup failure
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = open_connection(&path)?;

        // WAL keeps the reader on the last committed snapshot while a write
        // transaction is open.
        writer
            .query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(backend)?;
        writer
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS entries (
                    id INTEGER PRIMARY KEY,
                    class TEXT NOT NULL,
                    doc_key TEXT NOT NULL,
                    fields TEXT NOT NULL,
                    UNIQUE (class, doc_key)
                );
                CREATE VIRTUAL TABLE IF NOT EXISTS entry_text USING fts5(body);
                "#,
            )
            .map_err(backend)?;

        let reader = open_connection(&path)?;

        info!("SQLite index opened at {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    fn begin_if_needed(conn: &Connection) -> Result<()> {
        if conn.is_autocommit() {
            conn.execute_batch("BEGIN IMMEDIATE").map_err(backend)?;
        }
        Ok(())
    }

    fn entry_id(conn: &Connection, class: &ClassTag, key: &str) -> Result<Option<i64>> {
        conn.query_row(
            "SELECT id FROM entries WHERE class = ?1 AND doc_key = ?2",
            params![class.as_str(), key],
            |row| row.get(0),
        )
        .optional()
        .map_err(backend)
    }

    fn upsert(conn: &Connection, doc: &Document) -> Result<()> {
        let key = serde_json::to_string(&doc.key)?;
        let fields = serde_json::to_string(&doc.fields).map_err(|e| Error::DocumentRejected {
            key: doc.key.clone(),
            reason: e.to_string(),
        })?;

        let id = match Self::entry_id(conn, &doc.class, &key)? {
            Some(id) => {
                conn.execute(
                    "UPDATE entries SET fields = ?1 WHERE id = ?2",
                    params![fields, id],
                )
                .map_err(backend)?;
                conn.execute("DELETE FROM entry_text WHERE rowid = ?1", params![id])
                    .map_err(backend)?;
                id
            }
            None => {
                conn.execute(
                    "INSERT INTO entries (class, doc_key, fields) VALUES (?1, ?2, ?3)",
                    params![doc.class.as_str(), key, fields],
                )
                .map_err(backend)?;
                conn.last_insert_rowid()
            }
        };
        conn.execute(
            "INSERT INTO entry_text (rowid, body) VALUES (?1, ?2)",
            params![id, doc.body()],
        )
        .map_err(backend)?;
        Ok(())
    }

    fn hit_from_row(raw_key: String, raw_fields: Option<String>) -> IndexHit {
        let fields = raw_fields
            .and_then(|f| serde_json::from_str(&f).ok())
            .unwrap_or_default();
        IndexHit {
            key: serde_json::from_str(&raw_key).ok(),
            fields,
        }
    }
}

/// Quote a term as an FTS5 phrase.
fn fts_phrase(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

#[async_trait]
impl IndexClient for SqliteIndex {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn index_one(&self, doc: &Document) -> Result<()> {
        let conn = lock(&self.writer, "index writer")?;
        Self::begin_if_needed(&conn)?;
        Self::upsert(&conn, doc)
    }

    async fn index_many(&self, docs: &[Document]) -> Result<()> {
        let conn = lock(&self.writer, "index writer")?;
        Self::begin_if_needed(&conn)?;

        conn.execute_batch("SAVEPOINT index_many").map_err(backend)?;
        for doc in docs {
            if let Err(err) = Self::upsert(&conn, doc) {
                conn.execute_batch("ROLLBACK TO index_many; RELEASE index_many")
                    .map_err(backend)?;
                return Err(err);
            }
        }
        conn.execute_batch("RELEASE index_many").map_err(backend)?;

        debug!("Indexed {} documents into {}", docs.len(), self.path.display());
        Ok(())
    }

    async fn remove_one(&self, class: &ClassTag, key: &RecordKey) -> Result<()> {
        let conn = lock(&self.writer, "index writer")?;
        Self::begin_if_needed(&conn)?;
        if let Some(id) = Self::entry_id(&conn, class, &serde_json::to_string(key)?)? {
            conn.execute("DELETE FROM entry_text WHERE rowid = ?1", params![id])
                .map_err(backend)?;
            conn.execute("DELETE FROM entries WHERE id = ?1", params![id])
                .map_err(backend)?;
        }
        Ok(())
    }

    async fn remove_all(&self, class: &ClassTag) -> Result<()> {
        let conn = lock(&self.writer, "index writer")?;
        Self::begin_if_needed(&conn)?;
        conn.execute(
            "DELETE FROM entry_text WHERE rowid IN (SELECT id FROM entries WHERE class = ?1)",
            params![class.as_str()],
        )
        .map_err(backend)?;
        let removed = conn
            .execute("DELETE FROM entries WHERE class = ?1", params![class.as_str()])
            .map_err(backend)?;
        debug!("Removed {} {} documents (uncommitted)", removed, class);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let conn = lock(&self.writer, "index writer")?;
        if !conn.is_autocommit() {
            conn.execute_batch("COMMIT").map_err(backend)?;
        }
        Ok(())
    }

    async fn query(&self, class: &ClassTag, query: &Query) -> Result<Vec<IndexHit>> {
        let conn = lock(&self.reader, "index reader")?;

        let (sql, args): (&str, Vec<String>) = match query {
            Query::MatchAll => (
                "SELECT doc_key, fields FROM entries WHERE class = ?1",
                vec![class.to_string()],
            ),
            Query::Key(key) => (
                "SELECT doc_key, fields FROM entries WHERE class = ?1 AND doc_key = ?2",
                vec![class.to_string(), serde_json::to_string(key)?],
            ),
            Query::Text(term) => (
                "SELECT e.doc_key, e.fields FROM entry_text \
                 JOIN entries e ON e.id = entry_text.rowid \
                 WHERE e.class = ?1 AND entry_text MATCH ?2 ORDER BY entry_text.rank",
                vec![class.to_string(), fts_phrase(term)],
            ),
        };

        let mut stmt = conn.prepare(sql).map_err(backend)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok(Self::hit_from_row(row.get(0)?, row.get(1)?))
            })
            .map_err(backend)?;

        let hits = rows
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(backend)?;
        Ok(hits)
    }
}

/// How a record class maps onto a table of the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    /// Table holding the records.
    pub table: String,
    /// Primary key column.
    pub key_column: String,
    /// Columns extracted as document fields.
    #[serde(default)]
    pub fields: Vec<String>,
}

impl TableMapping {
    pub fn new(table: impl Into<String>, key_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_column: key_column.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, column: impl Into<String>) -> Self {
        self.fields.push(column.into());
        self
    }

    /// Check that every name is a plain SQL identifier.
    ///
    /// Names are interpolated into statements, so nothing else is accepted.
    pub fn validate(&self) -> Result<()> {
        let names = std::iter::once(&self.table)
            .chain(std::iter::once(&self.key_column))
            .chain(self.fields.iter());
        for name in names {
            let valid = name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(Error::InvalidInput(format!(
                    "Not a valid SQL identifier: {:?}",
                    name
                )));
            }
        }
        Ok(())
    }

    fn select_columns(&self) -> String {
        std::iter::once(&self.key_column)
            .chain(self.fields.iter())
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Record source reading rows from SQLite tables.
///
/// Pages are ordered by the key column. SQLite sorts integers before text,
/// which matches the ordering of [`RecordKey`].
pub struct SqliteRecordSource {
    conn: Mutex<Connection>,
    tables: HashMap<ClassTag, TableMapping>,
}

impl SqliteRecordSource {
    /// Open a record store database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_connection(open_connection(path.as_ref())?))
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            tables: HashMap::new(),
        }
    }

    /// Map a class onto a table.
    ///
    /// # Errors
    /// - `InvalidInput` if the mapping names are not plain identifiers
    pub fn with_table(mut self, class: ClassTag, mapping: TableMapping) -> Result<Self> {
        mapping.validate()?;
        self.tables.insert(class, mapping);
        Ok(self)
    }

    /// Verify that every mapped table exists.
    ///
    /// # Errors
    /// - `NotFound` naming the first missing table
    pub fn check_tables(&self) -> Result<()> {
        let conn = lock(&self.conn, "record store")?;
        for (class, mapping) in &self.tables {
            if !table_exists(&conn, &mapping.table)? {
                return Err(Error::NotFound(format!(
                    "Table {} for class {} does not exist",
                    mapping.table, class
                )));
            }
        }
        Ok(())
    }

    fn mapping(&self, class: &ClassTag) -> Result<&TableMapping> {
        self.tables
            .get(class)
            .ok_or_else(|| Error::NotFound(format!("No table mapped for class {}", class)))
    }

    fn key_from_value(value: Value) -> Result<RecordKey> {
        match value {
            Value::Integer(n) => Ok(RecordKey::Int(n)),
            Value::Text(s) => Ok(RecordKey::Text(s)),
            other => Err(Error::Serialization(format!(
                "Unsupported primary key value: {:?}",
                other
            ))),
        }
    }

    fn field_text(value: Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::Integer(n) => Some(n.to_string()),
            Value::Real(f) => Some(f.to_string()),
            Value::Text(s) => Some(s),
            Value::Blob(b) => Some(String::from_utf8_lossy(&b).into_owned()),
        }
    }

    fn load(
        &self,
        class: &ClassTag,
        limit: Option<(u64, u64)>,
    ) -> Result<Vec<FieldRecord>> {
        let mapping = self.mapping(class)?;
        let mut sql = format!(
            "SELECT {} FROM \"{}\" ORDER BY \"{}\"",
            mapping.select_columns(),
            mapping.table,
            mapping.key_column
        );
        if let Some((offset, limit)) = limit {
            sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));
        }

        let conn = lock(&self.conn, "record store")?;
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                let mut values = Vec::with_capacity(mapping.fields.len() + 1);
                for i in 0..=mapping.fields.len() {
                    values.push(row.get::<_, Value>(i)?);
                }
                Ok(values)
            })
            .map_err(backend)?;

        let mut records = Vec::new();
        for row in rows {
            let mut values = row.map_err(backend)?.into_iter();
            let key = Self::key_from_value(values.next().unwrap_or(Value::Null))?;
            let mut fields = BTreeMap::new();
            for (name, value) in mapping.fields.iter().zip(values) {
                if let Some(text) = Self::field_text(value) {
                    fields.insert(name.clone(), text);
                }
            }
            records.push(FieldRecord {
                class: class.clone(),
                key,
                fields,
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl RecordSource for SqliteRecordSource {
    type Record = FieldRecord;

    fn name(&self) -> &str {
        "sqlite"
    }

    async fn count(&self, class: &ClassTag) -> Result<u64> {
        let mapping = self.mapping(class)?;
        let conn = lock(&self.conn, "record store")?;
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM \"{}\"", mapping.table),
                [],
                |row| row.get(0),
            )
            .map_err(backend)?;
        Ok(count as u64)
    }

    async fn fetch_page(
        &self,
        class: &ClassTag,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<FieldRecord>> {
        self.load(class, Some((offset, limit)))
    }

    async fn fetch_all(&self, class: &ClassTag) -> Result<Vec<FieldRecord>> {
        self.load(class, None)
    }

    async fn keys(&self, class: &ClassTag) -> Result<Vec<RecordKey>> {
        let mapping = self.mapping(class)?;
        let conn = lock(&self.conn, "record store")?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT \"{}\" FROM \"{}\"",
                mapping.key_column, mapping.table
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, Value>(0))
            .map_err(backend)?;

        let mut keys = Vec::new();
        for value in rows {
            keys.push(Self::key_from_value(value.map_err(backend)?)?);
        }
        Ok(keys)
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(backend)
}
