//! SQLite persistence for execution records and logs.
//!
//! Uses WAL mode so log reads do not block the writer. Log rows are keyed by
//! `(execution_id, seq)` and cascade away with their execution row.

use crate::errors::StorageError;
use crate::logs::{LogBackend, LogEntry, LogLevel, LogPage, LogQuery, LogSummary, SortOrder, SummaryScope};
use crate::records::{ExecutionRecord, ExecutionRecordStore};
use crate::utils::{from_micros, to_micros, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS executions (
        id             TEXT PRIMARY KEY,
        tenant_id      TEXT NOT NULL,
        project_id     TEXT NOT NULL,
        status         TEXT NOT NULL,
        started_at_us  INTEGER NOT NULL,
        updated_at_us  INTEGER NOT NULL,
        body           TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_executions_project
        ON executions(tenant_id, project_id, started_at_us);

    CREATE TABLE IF NOT EXISTS execution_logs (
        execution_id   TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
        seq            INTEGER NOT NULL,
        tenant_id      TEXT NOT NULL,
        project_id     TEXT NOT NULL,
        timestamp_us   INTEGER NOT NULL,
        level          TEXT NOT NULL,
        stage          TEXT,
        message        TEXT NOT NULL,
        metadata       TEXT,
        PRIMARY KEY (execution_id, seq)
    );

    CREATE INDEX IF NOT EXISTS idx_logs_execution_time
        ON execution_logs(execution_id, timestamp_us, seq);
    CREATE INDEX IF NOT EXISTS idx_logs_time_level_stage
        ON execution_logs(timestamp_us, level, stage);
    CREATE INDEX IF NOT EXISTS idx_logs_tenant_time
        ON execution_logs(tenant_id, timestamp_us);
";

const LOG_COLUMNS: &str =
    "seq, execution_id, tenant_id, project_id, timestamp_us, level, stage, message, metadata";

/// One SQLite database holding records and logs.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the file cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(backend)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "sqlite store opened");
        Ok(store)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(backend)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of stored log rows for an execution.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the count fails.
    pub fn log_count(&self, execution_id: Uuid) -> Result<u64, StorageError> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM execution_logs WHERE execution_id = ?1",
                params![execution_id.to_string()],
                |row| row.get(0),
            )
            .map_err(backend)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn insert_log(conn: &Connection, entry: &LogEntry) -> Result<(), StorageError> {
        let metadata = entry
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO execution_logs
                (execution_id, seq, tenant_id, project_id, timestamp_us, level, stage, message, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.execution_id.to_string(),
                seq_to_sql(entry.id),
                entry.tenant_id,
                entry.project_id,
                to_micros(&entry.timestamp),
                entry.level.as_str(),
                entry.stage.map(|s| s.as_str()),
                entry.message,
                metadata,
            ],
        )
        .map_err(log_write_error)?;
        Ok(())
    }
}

/// A WHERE clause under construction with its positional parameters.
#[derive(Default)]
struct Filter {
    clauses: Vec<String>,
    params: Vec<SqlValue>,
}

impl Filter {
    fn push(&mut self, clause: &str, values: impl IntoIterator<Item = SqlValue>) {
        self.clauses.push(clause.to_string());
        self.params.extend(values);
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    fn for_query(query: &LogQuery) -> Self {
        let mut filter = Self::default();
        filter.push("execution_id = ?", [SqlValue::Text(query.execution_id.to_string())]);
        if let Some(tenant) = &query.tenant_id {
            filter.push("tenant_id = ?", [SqlValue::Text(tenant.clone())]);
        }
        if let Some(level) = query.level {
            filter.push("level = ?", [SqlValue::Text(level.as_str().to_string())]);
        }
        if let Some(stage) = query.stage {
            filter.push("stage = ?", [SqlValue::Text(stage.as_str().to_string())]);
        }
        if let Some(start) = &query.start_time {
            filter.push("timestamp_us >= ?", [SqlValue::Integer(to_micros(start))]);
        }
        if let Some(end) = &query.end_time {
            filter.push("timestamp_us < ?", [SqlValue::Integer(to_micros(end))]);
        }
        if let Some(needle) = &query.search {
            filter.push("instr(message, ?) > 0", [SqlValue::Text(needle.clone())]);
        }
        filter
    }
}

fn backend(err: rusqlite::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

/// Constraint failures on a log row (a missing execution row) are final.
fn log_write_error(err: rusqlite::Error) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            StorageError::Refused(err.to_string())
        }
        _ => backend(err),
    }
}

fn seq_to_sql(seq: u64) -> i64 {
    i64::try_from(seq).unwrap_or(i64::MAX)
}

fn timestamp_from_sql(micros: i64) -> Result<Timestamp, StorageError> {
    from_micros(micros).ok_or_else(|| StorageError::Corrupt(format!("timestamp {micros} out of range")))
}

/// Raw column values of one log row, decoded outside the rusqlite closure
/// so decoding errors stay typed.
struct LogRow {
    seq: i64,
    execution_id: String,
    tenant_id: String,
    project_id: String,
    timestamp_us: i64,
    level: String,
    stage: Option<String>,
    message: String,
    metadata: Option<String>,
}

impl LogRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            execution_id: row.get(1)?,
            tenant_id: row.get(2)?,
            project_id: row.get(3)?,
            timestamp_us: row.get(4)?,
            level: row.get(5)?,
            stage: row.get(6)?,
            message: row.get(7)?,
            metadata: row.get(8)?,
        })
    }

    fn decode(self) -> Result<LogEntry, StorageError> {
        let execution_id =
            Uuid::parse_str(&self.execution_id).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let level: LogLevel = self.level.parse().map_err(StorageError::Corrupt)?;
        let stage = self
            .stage
            .map(|s| s.parse())
            .transpose()
            .map_err(StorageError::Corrupt)?;
        let metadata = self
            .metadata
            .map(|m| serde_json::from_str(&m))
            .transpose()
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        Ok(LogEntry {
            id: u64::try_from(self.seq).map_err(|e| StorageError::Corrupt(e.to_string()))?,
            execution_id,
            tenant_id: self.tenant_id,
            project_id: self.project_id,
            timestamp: timestamp_from_sql(self.timestamp_us)?,
            level,
            message: self.message,
            stage,
            metadata,
        })
    }
}

#[async_trait]
impl ExecutionRecordStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn save(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        let body = serde_json::to_string(record).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let conn = self.conn.lock();
        // An upsert rather than REPLACE: replacing would cascade-delete the logs.
        conn.execute(
            "INSERT INTO executions (id, tenant_id, project_id, status, started_at_us, updated_at_us, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                updated_at_us = excluded.updated_at_us,
                body = excluded.body",
            params![
                record.id.to_string(),
                record.tenant_id,
                record.project_id,
                record.status.as_str(),
                to_micros(&record.started_at),
                to_micros(&record.updated_at),
                body,
            ],
        )
        .map_err(backend)?;
        Ok(())
    }

    async fn get(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, StorageError> {
        let body: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT body FROM executions WHERE id = ?1 AND tenant_id = ?2",
                params![execution_id.to_string(), tenant_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?
        };
        body.map(|b| serde_json::from_str(&b).map_err(|e| StorageError::Corrupt(e.to_string())))
            .transpose()
    }

    async fn list_for_project(
        &self,
        tenant_id: &str,
        project_id: &str,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        let bodies: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT body FROM executions
                     WHERE tenant_id = ?1 AND project_id = ?2
                     ORDER BY started_at_us DESC, id DESC",
                )
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![tenant_id, project_id], |row| row.get(0))
                .map_err(backend)?;
            rows.collect::<rusqlite::Result<_>>().map_err(backend)?
        };
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(|e| StorageError::Corrupt(e.to_string())))
            .collect()
    }

    async fn delete(&self, tenant_id: &str, execution_id: Uuid) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM executions WHERE id = ?1 AND tenant_id = ?2",
                params![execution_id.to_string(), tenant_id],
            )
            .map_err(backend)?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl LogBackend for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn append(&self, entry: &LogEntry) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        Self::insert_log(&conn, entry)
    }

    async fn append_batch(&self, entries: &[LogEntry]) -> Result<usize, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(backend)?;
        let mut refused = 0;
        for entry in entries {
            // A failed constraint only aborts its own statement.
            match Self::insert_log(&tx, entry) {
                Ok(()) => {}
                Err(StorageError::Refused(reason)) => {
                    refused += 1;
                    warn!(execution_id = %entry.execution_id, seq = entry.id, %reason, "log row refused");
                }
                Err(e) => return Err(e),
            }
        }
        tx.commit().map_err(backend)?;
        debug!(count = entries.len(), refused, "log batch written");
        Ok(refused)
    }

    async fn query(&self, query: &LogQuery, limit: usize) -> Result<LogPage, StorageError> {
        let filter = Filter::for_query(query);
        let conn = self.conn.lock();

        let total: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM execution_logs{}", filter.sql()),
                params_from_iter(filter.params.iter()),
                |row| row.get(0),
            )
            .map_err(backend)?;

        let mut paged = filter;
        if let Some(after) = query.after_id {
            let cursor_ts: Option<i64> = conn
                .query_row(
                    "SELECT timestamp_us FROM execution_logs WHERE execution_id = ?1 AND seq = ?2",
                    params![query.execution_id.to_string(), seq_to_sql(after)],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            let op = match query.sort {
                SortOrder::Asc => ">",
                SortOrder::Desc => "<",
            };
            match cursor_ts {
                Some(ts) => paged.push(
                    &format!("(timestamp_us, seq) {op} (?, ?)"),
                    [SqlValue::Integer(ts), SqlValue::Integer(seq_to_sql(after))],
                ),
                None => paged.push(&format!("seq {op} ?"), [SqlValue::Integer(seq_to_sql(after))]),
            }
        }

        let order = match query.sort {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        // One row past the page tells whether more remain.
        let fetch = limit.saturating_add(1);
        paged.params.push(SqlValue::Integer(i64::try_from(fetch).unwrap_or(i64::MAX)));
        paged
            .params
            .push(SqlValue::Integer(i64::try_from(query.offset).unwrap_or(i64::MAX)));
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM execution_logs{} ORDER BY timestamp_us {order}, seq {order} LIMIT ? OFFSET ?",
            paged.sql()
        );

        let rows: Vec<LogRow> = {
            let mut stmt = conn.prepare(&sql).map_err(backend)?;
            let mapped = stmt
                .query_map(params_from_iter(paged.params.iter()), LogRow::read)
                .map_err(backend)?;
            mapped.collect::<rusqlite::Result<_>>().map_err(backend)?
        };
        drop(conn);

        let mut entries = rows
            .into_iter()
            .map(LogRow::decode)
            .collect::<Result<Vec<_>, _>>()?;
        let has_more = entries.len() > limit;
        entries.truncate(limit);
        let next_cursor = if has_more { entries.last().map(|e| e.id) } else { None };

        Ok(LogPage {
            entries,
            total: usize::try_from(total).unwrap_or(0),
            next_cursor,
            has_more,
        })
    }

    async fn summary(&self, scope: &SummaryScope) -> Result<LogSummary, StorageError> {
        let mut query = LogQuery::new(scope.execution_id);
        query.tenant_id = scope.tenant_id.clone();
        query.start_time = scope.start_time;
        query.end_time = scope.end_time;
        let filter = Filter::for_query(&query);

        let groups: Vec<(String, Option<String>, i64, i64, i64)> = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT level, stage, COUNT(*), MIN(timestamp_us), MAX(timestamp_us)
                     FROM execution_logs{} GROUP BY level, stage",
                    filter.sql()
                ))
                .map_err(backend)?;
            let mapped = stmt
                .query_map(params_from_iter(filter.params.iter()), |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })
                .map_err(backend)?;
            mapped.collect::<rusqlite::Result<_>>().map_err(backend)?
        };

        let mut summary = LogSummary::default();
        for (level, stage, count, first, last) in groups {
            let count = usize::try_from(count).unwrap_or(0);
            summary.total += count;
            *summary.by_level.entry(level).or_insert(0) += count;
            if let Some(stage) = stage {
                *summary.by_stage.entry(stage).or_insert(0) += count;
            }
            let first = timestamp_from_sql(first)?;
            let last = timestamp_from_sql(last)?;
            summary.first_timestamp = Some(summary.first_timestamp.map_or(first, |t| t.min(first)));
            summary.last_timestamp = Some(summary.last_timestamp.map_or(last, |t| t.max(last)));
        }
        Ok(summary)
    }

    async fn last_sequence(&self, execution_id: Uuid) -> Result<Option<u64>, StorageError> {
        let conn = self.conn.lock();
        let max: Option<i64> = conn
            .query_row(
                "SELECT MAX(seq) FROM execution_logs WHERE execution_id = ?1",
                params![execution_id.to_string()],
                |row| row.get(0),
            )
            .map_err(backend)?;
        Ok(max.and_then(|m| u64::try_from(m).ok()))
    }

    async fn delete_execution(&self, execution_id: Uuid) -> Result<u64, StorageError> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM execution_logs WHERE execution_id = ?1",
                params![execution_id.to_string()],
            )
            .map_err(backend)?;
        Ok(removed as u64)
    }
}
