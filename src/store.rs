use crate::record::DiagnosticRecord;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

const CORRELATION_PAGE_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to serialise record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to create datastore directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),

    #[error("datastore lock poisoned")]
    Poisoned,

    #[error("datastore task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Datastore-assigned identifier of a diagnostic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(RecordId),
    /// The same `(Metadata.id, platform)` was already stored.
    Duplicate(RecordId),
}

impl InsertOutcome {
    pub fn record_id(&self) -> RecordId {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, InsertOutcome::Duplicate(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record_id: RecordId,
    pub received_at: DateTime<Utc>,
    pub record: DiagnosticRecord,
}

/// Correlation details captured when a message or object arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewEmailCorrelation {
    pub email_id: Option<String>,
    pub email_subject: Option<String>,
    pub email_from: Option<String>,
    /// The client-side `Metadata.id` the reply is waiting for.
    pub diagnostic_info_record_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailCorrelation {
    pub row_id: i64,
    pub email_id: Option<String>,
    pub email_subject: Option<String>,
    pub email_from: Option<String>,
    pub diagnostic_info_record_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorLogEntry {
    pub module: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

impl ErrorLogEntry {
    pub fn now(module: impl Into<String>, error: impl fmt::Display) -> Self {
        ErrorLogEntry {
            module: module.into(),
            error: error.to_string(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformCount {
    pub platform: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub module: String,
    pub error: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub since: DateTime<Utc>,
    pub new_records: u64,
    pub platforms: Vec<PlatformCount>,
    pub top_errors: Vec<ErrorCount>,
    pub pending_correlations: u64,
    /// Highest error log id covered by `top_errors`.
    #[serde(skip)]
    pub error_watermark: i64,
}

/// SQLite-backed persistence shared by all workers.
///
/// Cloning is cheap; clones share one connection. The lock is only held
/// for the duration of a single statement or transaction.
#[derive(Clone)]
pub struct Datastore {
    conn: Arc<Mutex<Connection>>,
    correlation_ttl: chrono::Duration,
}

impl fmt::Debug for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datastore")
            .field("correlation_ttl", &self.correlation_ttl)
            .finish_non_exhaustive()
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {value:?}: {e}")))
}

impl Datastore {
    pub fn open(path: &str, correlation_ttl: chrono::Duration) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, correlation_ttl)
    }

    pub fn open_in_memory(correlation_ttl: chrono::Duration) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, correlation_ttl)
    }

    fn from_connection(conn: Connection, correlation_ttl: chrono::Duration) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS diagnostic_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                version INTEGER NOT NULL,
                received_at TEXT NOT NULL,
                body TEXT NOT NULL,
                UNIQUE (client_id, platform)
            );
            CREATE INDEX IF NOT EXISTS diagnostic_records_received_at
                ON diagnostic_records (received_at);

            CREATE TABLE IF NOT EXISTS email_correlations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email_id TEXT,
                email_subject TEXT,
                email_from TEXT,
                diagnostic_info_record_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS email_correlations_created_at
                ON email_correlations (created_at, id);

            CREATE TABLE IF NOT EXISTS error_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                module TEXT NOT NULL,
                error TEXT NOT NULL,
                at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS stats_cursor (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_send_time TEXT NOT NULL
            );",
        )?;

        Ok(Datastore {
            conn: Arc::new(Mutex::new(conn)),
            correlation_ttl,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Runs `f` against this datastore on the blocking pool, so callers on
    /// the async workers never wait on SQLite directly.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Datastore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    pub fn insert_diagnostic(&self, record: &DiagnosticRecord) -> Result<InsertOutcome> {
        self.insert_diagnostic_at(record, Utc::now())
    }

    pub fn insert_diagnostic_at(
        &self,
        record: &DiagnosticRecord,
        received_at: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        let body = serde_json::to_string(&record.tree)?;
        let platform = record.metadata.platform.as_str();
        let client_id = record.metadata.id.as_str();

        let conn = self.lock()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO diagnostic_records
             (client_id, platform, version, received_at, body)
             VALUES (?, ?, ?, ?, ?)",
            params![
                client_id,
                platform,
                record.metadata.version,
                ts(received_at),
                body
            ],
        )?;

        if changed == 1 {
            return Ok(InsertOutcome::Inserted(RecordId(conn.last_insert_rowid())));
        }

        let existing: i64 = conn.query_row(
            "SELECT id FROM diagnostic_records WHERE client_id = ? AND platform = ?",
            params![client_id, platform],
            |row| row.get(0),
        )?;
        log::debug!("Record {client_id} ({platform}) already stored as {existing}");
        Ok(InsertOutcome::Duplicate(RecordId(existing)))
    }

    pub fn find_diagnostic(&self, record_id: RecordId) -> Result<Option<StoredRecord>> {
        let raw = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT id, received_at, body FROM diagnostic_records WHERE id = ?",
                params![record_id.0],
                raw_record,
            )
            .optional()?
        };
        raw.map(decode_record).transpose()
    }

    /// Most recent record carrying the given client-side `Metadata.id`.
    pub fn find_diagnostic_by_client_id(&self, client_id: &str) -> Result<Option<StoredRecord>> {
        let raw = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT id, received_at, body FROM diagnostic_records
                 WHERE client_id = ? ORDER BY id DESC LIMIT 1",
                params![client_id],
                raw_record,
            )
            .optional()?
        };
        raw.map(decode_record).transpose()
    }

    pub fn insert_email_correlation(&self, row: &NewEmailCorrelation) -> Result<EmailCorrelation> {
        self.insert_email_correlation_at(row, Utc::now())
    }

    pub fn insert_email_correlation_at(
        &self,
        row: &NewEmailCorrelation,
        created_at: DateTime<Utc>,
    ) -> Result<EmailCorrelation> {
        let expires_at = created_at + self.correlation_ttl;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO email_correlations
             (email_id, email_subject, email_from, diagnostic_info_record_id, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                row.email_id,
                row.email_subject,
                row.email_from,
                row.diagnostic_info_record_id,
                ts(created_at),
                ts(expires_at)
            ],
        )?;
        Ok(EmailCorrelation {
            row_id: conn.last_insert_rowid(),
            email_id: row.email_id.clone(),
            email_subject: row.email_subject.clone(),
            email_from: row.email_from.clone(),
            diagnostic_info_record_id: row.diagnostic_info_record_id.clone(),
            created_at,
            expires_at,
        })
    }

    /// Inserts every row or none of them.
    pub fn insert_email_correlations(&self, rows: &[NewEmailCorrelation]) -> Result<usize> {
        let created_at = Utc::now();
        let expires_at = created_at + self.correlation_ttl;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO email_correlations
                 (email_id, email_subject, email_from, diagnostic_info_record_id, created_at, expires_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.email_id,
                    row.email_subject,
                    row.email_from,
                    row.diagnostic_info_record_id,
                    ts(created_at),
                    ts(expires_at)
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn remove_email_correlation(&self, row: &EmailCorrelation) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM email_correlations WHERE id = ?",
            params![row.row_id],
        )?;
        Ok(removed > 0)
    }

    /// Deletes every correlation whose TTL has elapsed at `now`.
    pub fn expire_email_correlations(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM email_correlations WHERE expires_at <= ?",
            params![ts(now)],
        )?;
        Ok(removed)
    }

    /// Lazily pages through pending correlations, oldest first.
    ///
    /// Each call starts a fresh pass; rows inserted behind the cursor are
    /// picked up by the next pass.
    pub fn iterate_email_correlations(&self) -> CorrelationCursor {
        CorrelationCursor {
            store: self.clone(),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn correlation_page(
        &self,
        after: Option<(&str, i64)>,
        limit: usize,
    ) -> Result<Vec<EmailCorrelation>> {
        let conn = self.lock()?;
        let (created_at, id) = after.unwrap_or(("", 0));
        let mut stmt = conn.prepare(
            "SELECT id, email_id, email_subject, email_from, diagnostic_info_record_id,
                    created_at, expires_at
             FROM email_correlations
             WHERE created_at > ?1 OR (created_at = ?1 AND id > ?2)
             ORDER BY created_at ASC, id ASC
             LIMIT ?3",
        )?;
        let raw = stmt
            .query_map(params![created_at, id, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        raw.into_iter()
            .map(
                |(row_id, email_id, email_subject, email_from, record_id, created, expires)| {
                    Ok(EmailCorrelation {
                        row_id,
                        email_id,
                        email_subject,
                        email_from,
                        diagnostic_info_record_id: record_id,
                        created_at: parse_ts(&created)?,
                        expires_at: parse_ts(&expires)?,
                    })
                },
            )
            .collect()
    }

    pub fn pending_correlation_count(&self) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM email_correlations", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Records received at or after `since`.
    pub fn get_new_record_count(&self, since: DateTime<Utc>) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM diagnostic_records WHERE received_at >= ?",
            params![ts(since)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn get_stats(&self, since: DateTime<Utc>) -> Result<StatsSummary> {
        let new_records = self.get_new_record_count(since)?;
        let pending_correlations = self.pending_correlation_count()?;

        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT platform, COUNT(*) AS n FROM diagnostic_records
             WHERE received_at >= ?
             GROUP BY platform ORDER BY n DESC, platform ASC",
        )?;
        let platforms = stmt
            .query_map(params![ts(since)], |row| {
                Ok(PlatformCount {
                    platform: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Same lock as the watermark read, so no append falls between them.
        let error_watermark: i64 =
            conn.query_row("SELECT COALESCE(MAX(id), 0) FROM error_log", [], |row| {
                row.get(0)
            })?;
        let mut stmt = conn.prepare(
            "SELECT module, error, COUNT(*) AS n FROM error_log
             WHERE at >= ?1 AND id <= ?2
             GROUP BY module, error ORDER BY n DESC, module ASC
             LIMIT 20",
        )?;
        let top_errors = stmt
            .query_map(params![ts(since), error_watermark], |row| {
                Ok(ErrorCount {
                    module: row.get(0)?,
                    error: row.get(1)?,
                    count: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(StatsSummary {
            since,
            new_records,
            platforms,
            top_errors,
            pending_correlations,
            error_watermark,
        })
    }

    pub fn get_stats_cursor(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT last_send_time FROM stats_cursor WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);
        value.as_deref().map(parse_ts).transpose()
    }

    /// Advances the cursor; an older timestamp leaves it unchanged.
    pub fn set_stats_cursor(&self, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO stats_cursor (id, last_send_time) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET last_send_time = excluded.last_send_time
             WHERE excluded.last_send_time > stats_cursor.last_send_time",
            params![ts(at)],
        )?;
        Ok(())
    }

    pub fn append_error(&self, entry: &ErrorLogEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO error_log (module, error, at) VALUES (?, ?, ?)",
            params![entry.module, entry.error, ts(entry.at)],
        )?;
        Ok(())
    }

    /// Returns entries logged since `since` and removes them, together with
    /// anything older.
    pub fn drain_errors(&self, since: DateTime<Utc>) -> Result<Vec<ErrorLogEntry>> {
        self.drain_errors_through(since, i64::MAX)
    }

    /// Like [`Datastore::drain_errors`], but leaves every entry with an id
    /// above `watermark` for the next report.
    pub fn drain_errors_through(
        &self,
        since: DateTime<Utc>,
        watermark: i64,
    ) -> Result<Vec<ErrorLogEntry>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let raw = {
            let mut stmt = tx.prepare(
                "SELECT id, module, error, at FROM error_log
                 WHERE at >= ?1 AND id <= ?2 ORDER BY at, id",
            )?;
            let rows = stmt
                .query_map(params![ts(since), watermark], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        let max_id = raw.iter().map(|(id, ..)| *id).max().unwrap_or(0);
        tx.execute(
            "DELETE FROM error_log WHERE id <= ?1 OR (at < ?2 AND id <= ?3)",
            params![max_id, ts(since), watermark],
        )?;
        tx.commit()?;
        drop(conn);

        raw.into_iter()
            .map(|(_, module, error, at)| {
                Ok(ErrorLogEntry {
                    module,
                    error,
                    at: parse_ts(&at)?,
                })
            })
            .collect()
    }
}

fn raw_record(row: &Row<'_>) -> rusqlite::Result<(i64, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn decode_record((id, received_at, body): (i64, String, String)) -> Result<StoredRecord> {
    let tree: serde_json::Value = serde_json::from_str(&body)?;
    let record = DiagnosticRecord::from_tree(tree)
        .map_err(|e| StoreError::Corrupt(format!("record {id}: {e}")))?;
    Ok(StoredRecord {
        record_id: RecordId(id),
        received_at: parse_ts(&received_at)?,
        record,
    })
}

/// Restartable, page-at-a-time iterator over pending correlations.
pub struct CorrelationCursor {
    store: Datastore,
    after: Option<(String, i64)>,
    buffer: VecDeque<EmailCorrelation>,
    exhausted: bool,
}

impl CorrelationCursor {
    /// Starts again from the oldest pending correlation.
    pub fn restart(&mut self) {
        self.after = None;
        self.buffer.clear();
        self.exhausted = false;
    }
}

impl Iterator for CorrelationCursor {
    type Item = Result<EmailCorrelation>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            let after = self.after.as_ref().map(|(c, id)| (c.as_str(), *id));
            match self.store.correlation_page(after, CORRELATION_PAGE_SIZE) {
                Ok(page) => {
                    if page.len() < CORRELATION_PAGE_SIZE {
                        self.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        self.after = Some((ts(last.created_at), last.row_id));
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
impl Datastore {
    pub(crate) fn execute_batch(&self, sql: &str) {
        self.lock().unwrap().execute_batch(sql).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn store() -> Datastore {
        Datastore::open_in_memory(Duration::minutes(360)).unwrap()
    }

    fn record(id: &str, platform: &str) -> DiagnosticRecord {
        DiagnosticRecord::from_tree(json!({
            "Metadata": {"platform": platform, "version": 2, "id": id},
            "Feedback": {"Message": {"text": "hi"}}
        }))
        .unwrap()
    }

    fn correlation(id: &str) -> NewEmailCorrelation {
        NewEmailCorrelation {
            email_id: Some(format!("<{id}@x>")),
            email_subject: Some("feedback".to_string()),
            email_from: Some("user@example.com".to_string()),
            diagnostic_info_record_id: id.to_string(),
        }
    }

    #[test]
    fn test_insert_and_find() {
        let store = store();
        let outcome = store.insert_diagnostic(&record("abc", "android")).unwrap();
        assert!(!outcome.is_duplicate());

        let stored = store.find_diagnostic(outcome.record_id()).unwrap().unwrap();
        assert_eq!(stored.record.metadata.id, "abc");
        assert_eq!(stored.record, record("abc", "android"));

        let by_client = store.find_diagnostic_by_client_id("abc").unwrap().unwrap();
        assert_eq!(by_client.record_id, outcome.record_id());
        assert!(store.find_diagnostic(RecordId(999)).unwrap().is_none());
    }

    #[test]
    fn test_reingest_is_deduplicated() {
        let store = store();
        let first = store.insert_diagnostic(&record("abc", "android")).unwrap();
        let second = store.insert_diagnostic(&record("abc", "android")).unwrap();
        assert_eq!(second, InsertOutcome::Duplicate(first.record_id()));
        assert_eq!(
            store
                .get_new_record_count(Utc::now() - Duration::hours(1))
                .unwrap(),
            1
        );

        // Same id from a different platform is a different record.
        let other = store.insert_diagnostic(&record("abc", "windows")).unwrap();
        assert!(!other.is_duplicate());
    }

    #[test]
    fn test_new_record_count_window() {
        let store = store();
        let base = Utc::now() - Duration::hours(2);
        store
            .insert_diagnostic_at(&record("a", "android"), base)
            .unwrap();
        store
            .insert_diagnostic_at(&record("b", "android"), base + Duration::minutes(30))
            .unwrap();
        store
            .insert_diagnostic_at(&record("c", "ios"), base + Duration::minutes(90))
            .unwrap();

        assert_eq!(store.get_new_record_count(base).unwrap(), 3);
        assert_eq!(
            store
                .get_new_record_count(base + Duration::minutes(30))
                .unwrap(),
            2
        );
        assert_eq!(store.get_new_record_count(Utc::now()).unwrap(), 0);

        let stats = store.get_stats(base).unwrap();
        assert_eq!(stats.new_records, 3);
        assert_eq!(
            stats.platforms[0],
            PlatformCount {
                platform: "android".to_string(),
                count: 2
            }
        );
    }

    #[test]
    fn test_correlations_iterate_in_created_order() {
        let store = store();
        let base = Utc::now();
        for (i, id) in ["c", "a", "b"].iter().enumerate() {
            store
                .insert_email_correlation_at(&correlation(id), base - Duration::minutes(i as i64))
                .unwrap();
        }
        let ids: Vec<String> = store
            .iterate_email_correlations()
            .map(|c| c.unwrap().diagnostic_info_record_id)
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_correlation_cursor_pages_and_restarts() {
        let store = store();
        let base = Utc::now();
        for i in 0..(CORRELATION_PAGE_SIZE + 5) {
            store
                .insert_email_correlation_at(
                    &correlation(&format!("id{i}")),
                    base + Duration::seconds(i as i64),
                )
                .unwrap();
        }
        let mut cursor = store.iterate_email_correlations();
        assert_eq!(cursor.by_ref().count(), CORRELATION_PAGE_SIZE + 5);
        assert!(cursor.next().is_none());

        cursor.restart();
        let first = cursor.next().unwrap().unwrap();
        assert_eq!(first.diagnostic_info_record_id, "id0");
        assert!(store.remove_email_correlation(&first).unwrap());
        assert!(!store.remove_email_correlation(&first).unwrap());
        assert_eq!(
            store.pending_correlation_count().unwrap(),
            (CORRELATION_PAGE_SIZE + 4) as u64
        );
    }

    #[test]
    fn test_expired_correlations_are_swept() {
        let store = store();
        let now = Utc::now();
        store
            .insert_email_correlation_at(&correlation("old"), now - Duration::minutes(361))
            .unwrap();
        store
            .insert_email_correlation_at(&correlation("fresh"), now)
            .unwrap();

        assert_eq!(store.expire_email_correlations(now).unwrap(), 1);
        let remaining: Vec<_> = store
            .iterate_email_correlations()
            .map(|c| c.unwrap().diagnostic_info_record_id)
            .collect();
        assert_eq!(remaining, vec!["fresh"]);
    }

    #[test]
    fn test_stats_cursor_is_monotonic() {
        let store = store();
        assert!(store.get_stats_cursor().unwrap().is_none());

        let now = Utc::now();
        store.set_stats_cursor(now).unwrap();
        store.set_stats_cursor(now - Duration::days(1)).unwrap();
        let cursor = store.get_stats_cursor().unwrap().unwrap();
        assert_eq!(ts(cursor), ts(now));

        store.set_stats_cursor(now + Duration::days(1)).unwrap();
        assert!(store.get_stats_cursor().unwrap().unwrap() > now);
    }

    #[test]
    fn test_errors_are_drained() {
        let store = store();
        let now = Utc::now();
        let entry = |module: &str, at| ErrorLogEntry {
            module: module.to_string(),
            error: "boom".to_string(),
            at,
        };
        store
            .append_error(&entry("stale", now - Duration::days(3)))
            .unwrap();
        store.append_error(&entry("bucket", now)).unwrap();
        store.append_error(&entry("bucket", now)).unwrap();

        let stats = store.get_stats(now - Duration::days(1)).unwrap();
        assert_eq!(stats.top_errors[0].count, 2);

        let drained = store.drain_errors(now - Duration::days(1)).unwrap();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|e| e.module == "bucket"));
        assert!(store.drain_errors(now - Duration::days(10)).unwrap().is_empty());
    }

    #[test]
    fn test_errors_after_snapshot_survive_drain() {
        let store = store();
        let since = Utc::now() - Duration::hours(1);
        store
            .append_error(&ErrorLogEntry::now("bucket", "reported"))
            .unwrap();
        let stats = store.get_stats(since).unwrap();
        assert_eq!(stats.top_errors.len(), 1);

        store
            .append_error(&ErrorLogEntry::now("mail", "arrived late"))
            .unwrap();
        let drained = store
            .drain_errors_through(since, stats.error_watermark)
            .unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].error, "reported");

        let next = store.get_stats(since).unwrap();
        assert_eq!(next.top_errors.len(), 1);
        assert_eq!(next.top_errors[0].error, "arrived late");
    }

    #[test]
    fn test_correlation_batch() {
        let store = store();
        assert_eq!(store.insert_email_correlations(&[]).unwrap(), 0);
        let rows = [correlation("a"), correlation("b")];
        assert_eq!(store.insert_email_correlations(&rows).unwrap(), 2);
        let pending: Vec<_> = store
            .iterate_email_correlations()
            .collect::<Result<_>>()
            .unwrap();
        let ids: Vec<_> = pending
            .iter()
            .map(|c| c.diagnostic_info_record_id.as_str())
            .collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(pending.iter().all(|c| c.expires_at > c.created_at));
    }

    #[tokio::test]
    async fn test_blocking_runs_against_shared_connection() {
        let store = store();
        let outcome = store
            .blocking(|s| s.insert_diagnostic(&record("abc", "android")))
            .await
            .unwrap();
        let stored = store.find_diagnostic(outcome.record_id()).unwrap().unwrap();
        assert_eq!(stored.record.metadata.id, "abc");

        let err = store
            .blocking(|_| -> Result<()> { Err(StoreError::Poisoned) })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Poisoned));
    }

    #[tokio::test]
    async fn test_waiting_on_the_connection_leaves_runtime_free() {
        let store = store();
        let guard = store.conn.lock().unwrap();
        let pending = tokio::spawn({
            let store = store.clone();
            async move {
                store
                    .blocking(|s| s.get_new_record_count(Utc::now() - Duration::hours(1)))
                    .await
            }
        });

        // Single-threaded runtime: this only wakes if the query is off-thread.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        drop(guard);
        assert_eq!(pending.await.unwrap().unwrap(), 0);
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("feedback.db");
        let store = Datastore::open(path.to_str().unwrap(), Duration::minutes(5)).unwrap();
        store.insert_diagnostic(&record("x", "ios")).unwrap();
        assert!(path.exists());
    }
}
