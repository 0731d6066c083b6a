//! SQLite persistence.
//!
//! Uniqueness lives in the schema: `identity_id` and `contact_address` are
//! UNIQUE, attendance is keyed by (identity_id, date, session_tag). A
//! constraint violation on insert is reported as `InsertOutcome::Exists`,
//! so the guarantee holds for every process sharing the database file.
//!
//! Writes go through a single writer connection. A file-backed store also
//! keeps a small pool of read-only connections so lookups, gallery loads and
//! reports never wait on each other or on the writer (WAL mode).

use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::store::{Conflict, InsertOutcome, ReportQuery, Store, StoreError};
use rollcall_core::types::{AttendanceEvent, DedupKey, Embedding, Identity, ReportRow};
use rusqlite::{ffi, params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y-%m-%d";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle read connections kept open between calls.
const MAX_IDLE_READERS: usize = 4;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS identities (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  identity_id TEXT NOT NULL UNIQUE,
  display_name TEXT NOT NULL,
  contact_address TEXT NOT NULL UNIQUE,
  group_tag TEXT NOT NULL,
  embedding_json TEXT NOT NULL,
  enrolled_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
  identity_id TEXT NOT NULL,
  date TEXT NOT NULL,
  session_tag TEXT NOT NULL,
  event_id TEXT NOT NULL,
  group_tag TEXT NOT NULL,
  committed_at TEXT NOT NULL,
  PRIMARY KEY (identity_id, date, session_tag)
);

CREATE INDEX IF NOT EXISTS idx_attendance_date_group
  ON attendance(date, group_tag);
";

const IDENTITY_COLUMNS: &str =
    "identity_id, display_name, contact_address, group_tag, embedding_json, enrolled_at";

const ATTENDANCE_COLUMNS: &str = "event_id, identity_id, date, session_tag, group_tag, committed_at";

pub struct SqliteStore {
    writer: Mutex<Connection>,
    /// `None` for an in-memory database, which only the writer can see.
    readers: Option<ReaderPool>,
}

struct ReaderPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl ReaderPool {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            idle: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Result<Connection, StoreError> {
        let idle = self
            .idle
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite reader pool poisoned".into()))?
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => {
                let conn = Connection::open_with_flags(
                    &self.path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
                .map_err(|e| {
                    StoreError::Unavailable(format!("opening reader {}: {e}", self.path.display()))
                })?;
                conn.busy_timeout(BUSY_TIMEOUT)
                    .map_err(unavailable("configuring reader"))?;
                Ok(conn)
            }
        }
    }

    fn give_back(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < MAX_IDLE_READERS {
                idle.push(conn);
            }
        }
    }
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("creating {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("opening {}: {e}", path.display())))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(unavailable("configuring busy timeout"))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(unavailable("configuring sqlite pragmas"))?;
        Self::with_connection(conn, Some(ReaderPool::new(path)))
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(unavailable("opening in-memory sqlite"))?;
        Self::with_connection(conn, None)
    }

    fn with_connection(conn: Connection, readers: Option<ReaderPool>) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_V1)
            .map_err(unavailable("applying schema"))?;
        Ok(Self {
            writer: Mutex::new(conn),
            readers,
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.writer
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection poisoned".into()))
    }

    /// Run `f` on a read connection.
    fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        match &self.readers {
            Some(pool) => {
                let conn = pool.take()?;
                let result = f(&conn);
                pool.give_back(conn);
                result
            }
            None => f(&*self.writer()?),
        }
    }

    fn query_identity(&self, column: &str, value: &str) -> Result<Option<Identity>, StoreError> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE {column} = ?1");
        self.read(|conn| {
            conn.query_row(&sql, params![value], IdentityRow::from_row)
                .optional()
                .map_err(unavailable("querying identity"))?
                .map(IdentityRow::into_identity)
                .transpose()
        })
    }
}

impl Store for SqliteStore {
    fn identity(&self, identity_id: &str) -> Result<Option<Identity>, StoreError> {
        self.query_identity("identity_id", identity_id)
    }

    fn identity_by_contact(&self, contact_address: &str) -> Result<Option<Identity>, StoreError> {
        self.query_identity("contact_address", contact_address)
    }

    fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        let rows = self.read(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY seq"))
                .map_err(unavailable("preparing gallery query"))?;
            let rows = stmt
                .query_map([], IdentityRow::from_row)
                .map_err(unavailable("loading gallery"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(unavailable("loading gallery"))?;
            Ok(rows)
        })?;
        rows.into_iter().map(IdentityRow::into_identity).collect()
    }

    fn identity_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self.read(|conn| {
            conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))
                .map_err(unavailable("counting identities"))
        })?;
        usize::try_from(count).map_err(|_| StoreError::Corrupt(format!("identity count {count}")))
    }

    fn insert_identity(&self, identity: &Identity) -> Result<InsertOutcome, StoreError> {
        let embedding_json = serde_json::to_string(&identity.embedding)
            .map_err(|e| StoreError::Corrupt(format!("encoding embedding: {e}")))?;
        let conn = self.writer()?;
        let result = conn.execute(
            "INSERT INTO identities(identity_id, display_name, contact_address, group_tag, embedding_json, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                identity.identity_id,
                identity.display_name,
                identity.contact_address,
                identity.group_tag,
                embedding_json,
                identity.enrolled_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            // SQLite names only one of the violated indexes, so ask the
            // table which key is taken, identity id first.
            Err(e) if is_unique_violation(&e) => {
                let taken = |column: &str, value: &str| -> Result<bool, StoreError> {
                    conn.query_row(
                        &format!("SELECT 1 FROM identities WHERE {column} = ?1"),
                        params![value],
                        |_| Ok(()),
                    )
                    .optional()
                    .map(|row| row.is_some())
                    .map_err(unavailable("classifying identity conflict"))
                };
                if taken("identity_id", &identity.identity_id)? {
                    Ok(InsertOutcome::Exists(Conflict::IdentityId))
                } else if taken("contact_address", &identity.contact_address)? {
                    Ok(InsertOutcome::Exists(Conflict::ContactAddress))
                } else {
                    Err(StoreError::Unavailable(format!(
                        "inserting identity: {e} (no conflicting row found)"
                    )))
                }
            }
            Err(e) => Err(StoreError::Unavailable(format!("inserting identity: {e}"))),
        }
    }

    fn attendance(&self, key: &DedupKey) -> Result<Option<AttendanceEvent>, StoreError> {
        self.read(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {ATTENDANCE_COLUMNS} FROM attendance
                     WHERE identity_id = ?1 AND date = ?2 AND session_tag = ?3"
                ),
                params![
                    key.identity_id,
                    key.date.format(DATE_FORMAT).to_string(),
                    key.session_tag
                ],
                AttendanceRow::from_row,
            )
            .optional()
            .map_err(unavailable("querying attendance"))?
            .map(AttendanceRow::into_event)
            .transpose()
        })
    }

    fn insert_attendance(&self, event: &AttendanceEvent) -> Result<InsertOutcome, StoreError> {
        let conn = self.writer()?;
        let result = conn.execute(
            "INSERT INTO attendance(identity_id, date, session_tag, event_id, group_tag, committed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.identity_id,
                event.date.format(DATE_FORMAT).to_string(),
                event.session_tag,
                event.event_id.to_string(),
                event.group_tag,
                event.committed_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Exists(Conflict::DedupKey)),
            Err(e) => Err(StoreError::Unavailable(format!("inserting attendance: {e}"))),
        }
    }

    fn attendance_report(&self, query: &ReportQuery) -> Result<Vec<ReportRow>, StoreError> {
        let raw = self.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT a.date, a.identity_id, i.display_name, a.group_tag, a.session_tag
                     FROM attendance a
                     JOIN identities i ON i.identity_id = a.identity_id
                     WHERE a.date BETWEEN ?1 AND ?2
                       AND (?3 IS NULL OR a.group_tag = ?3)
                     ORDER BY a.date, a.identity_id, a.session_tag",
                )
                .map_err(unavailable("preparing report query"))?;
            let raw = stmt
                .query_map(
                    params![
                        query.from.format(DATE_FORMAT).to_string(),
                        query.to.format(DATE_FORMAT).to_string(),
                        query.group_tag,
                    ],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .map_err(unavailable("running report query"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(unavailable("running report query"))?;
            Ok(raw)
        })?;

        raw.into_iter()
            .map(|(date, identity_id, display_name, group_tag, session_tag)| {
                Ok(ReportRow {
                    date: parse_date(&date)?,
                    identity_id,
                    display_name,
                    group_tag,
                    session_tag,
                })
            })
            .collect()
    }
}

struct IdentityRow {
    identity_id: String,
    display_name: String,
    contact_address: String,
    group_tag: String,
    embedding_json: String,
    enrolled_at: String,
}

impl IdentityRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            identity_id: row.get(0)?,
            display_name: row.get(1)?,
            contact_address: row.get(2)?,
            group_tag: row.get(3)?,
            embedding_json: row.get(4)?,
            enrolled_at: row.get(5)?,
        })
    }

    fn into_identity(self) -> Result<Identity, StoreError> {
        let embedding: Embedding = serde_json::from_str(&self.embedding_json).map_err(|e| {
            StoreError::Corrupt(format!("identity {} embedding: {e}", self.identity_id))
        })?;
        Ok(Identity {
            enrolled_at: parse_timestamp(&self.enrolled_at)?,
            identity_id: self.identity_id,
            display_name: self.display_name,
            contact_address: self.contact_address,
            group_tag: self.group_tag,
            embedding,
        })
    }
}

struct AttendanceRow {
    event_id: String,
    identity_id: String,
    date: String,
    session_tag: String,
    group_tag: String,
    committed_at: String,
}

impl AttendanceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get(0)?,
            identity_id: row.get(1)?,
            date: row.get(2)?,
            session_tag: row.get(3)?,
            group_tag: row.get(4)?,
            committed_at: row.get(5)?,
        })
    }

    fn into_event(self) -> Result<AttendanceEvent, StoreError> {
        Ok(AttendanceEvent {
            event_id: Uuid::parse_str(&self.event_id)
                .map_err(|e| StoreError::Corrupt(format!("event id {:?}: {e}", self.event_id)))?,
            date: parse_date(&self.date)?,
            committed_at: parse_timestamp(&self.committed_at)?,
            identity_id: self.identity_id,
            session_tag: self.session_tag,
            group_tag: self.group_tag,
        })
    }
}

/// UNIQUE or PRIMARY KEY violation. NOT NULL, CHECK and other constraint
/// failures are not conflicts.
fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn unavailable(context: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |e| StoreError::Unavailable(format!("{context}: {e}"))
}

fn parse_date(raw: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("date {raw:?}: {e}")))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str, contact: &str, group: &str) -> Identity {
        Identity {
            identity_id: id.into(),
            display_name: format!("Student {id}"),
            contact_address: contact.into(),
            group_tag: group.into(),
            embedding: Embedding::new(vec![0.25, -0.5, 0.125]),
            enrolled_at: Utc::now(),
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, d).unwrap()
    }

    fn temp_db(name: &str) -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!("rollcall-test-{}", Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn test_identity_roundtrip_and_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_identity(&identity("S2", "b@x.com", "EE")).unwrap();
        store.insert_identity(&identity("S1", "a@x.com", "CS")).unwrap();

        let loaded = store.identity("S1").unwrap().unwrap();
        assert_eq!(loaded.embedding.values, vec![0.25, -0.5, 0.125]);
        assert_eq!(store.identity_by_contact("b@x.com").unwrap().unwrap().identity_id, "S2");
        assert!(store.identity("S9").unwrap().is_none());

        let ids: Vec<_> = store.identities().unwrap().into_iter().map(|i| i.identity_id).collect();
        assert_eq!(ids, vec!["S2", "S1"]);
    }

    #[test]
    fn test_identity_conflicts_from_constraints() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.insert_identity(&identity("S1", "a@x.com", "CS")).unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            store.insert_identity(&identity("S1", "new@x.com", "CS")).unwrap(),
            InsertOutcome::Exists(Conflict::IdentityId)
        );
        assert_eq!(
            store.insert_identity(&identity("S2", "a@x.com", "CS")).unwrap(),
            InsertOutcome::Exists(Conflict::ContactAddress)
        );
    }

    #[test]
    fn test_attendance_conflict_and_lookup() {
        let store = SqliteStore::open_in_memory().unwrap();
        let key = DedupKey::new("S1", day(3), "morning");
        let event = AttendanceEvent::new(key.clone(), "CS", Utc::now());
        assert_eq!(store.insert_attendance(&event).unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            store
                .insert_attendance(&AttendanceEvent::new(key.clone(), "CS", Utc::now()))
                .unwrap(),
            InsertOutcome::Exists(Conflict::DedupKey)
        );
        let loaded = store.attendance(&key).unwrap().unwrap();
        assert_eq!(loaded.event_id, event.event_id);
        assert_eq!(loaded.date, day(3));
        assert!(store.attendance(&DedupKey::new("S1", day(3), "afternoon")).unwrap().is_none());
    }

    #[test]
    fn test_conflict_enforced_across_connections() {
        // Two handles on one file stand in for two processes.
        let path = temp_db("shared.db");
        let a = SqliteStore::open(&path).unwrap();
        let b = SqliteStore::open(&path).unwrap();

        let key = DedupKey::new("S1", day(4), "morning");
        assert_eq!(
            a.insert_attendance(&AttendanceEvent::new(key.clone(), "CS", Utc::now())).unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            b.insert_attendance(&AttendanceEvent::new(key, "CS", Utc::now())).unwrap(),
            InsertOutcome::Exists(Conflict::DedupKey)
        );
        assert_eq!(
            b.insert_identity(&identity("S1", "a@x.com", "CS")).unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            a.insert_identity(&identity("S1", "a@x.com", "CS")).unwrap(),
            InsertOutcome::Exists(Conflict::IdentityId)
        );

        drop((a, b));
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_identity_collision_on_both_keys_reports_identity_id() {
        let path = temp_db("both.db");
        let store = SqliteStore::open(&path).unwrap();
        store.insert_identity(&identity("S1", "a@x.com", "CS")).unwrap();
        store.insert_identity(&identity("S2", "b@x.com", "CS")).unwrap();

        assert_eq!(
            store.insert_identity(&identity("S1", "a@x.com", "CS")).unwrap(),
            InsertOutcome::Exists(Conflict::IdentityId)
        );
        // Identity id of one row, contact of another.
        assert_eq!(
            store.insert_identity(&identity("S2", "a@x.com", "CS")).unwrap(),
            InsertOutcome::Exists(Conflict::IdentityId)
        );
        assert_eq!(store.identity_count().unwrap(), 2);

        drop(store);
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_not_null_violation_is_not_a_conflict() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .writer()
            .unwrap()
            .execute("INSERT INTO identities(identity_id) VALUES ('S1')", [])
            .unwrap_err();
        assert!(!is_unique_violation(&err));

        let dup = store
            .writer()
            .unwrap()
            .execute_batch(
                "INSERT INTO attendance VALUES ('S1', '2024-10-01', 'm', 'e1', 'CS', 't');
                 INSERT INTO attendance VALUES ('S1', '2024-10-01', 'm', 'e2', 'CS', 't');",
            )
            .unwrap_err();
        assert!(is_unique_violation(&dup));
    }

    #[test]
    fn test_reads_do_not_wait_for_writer() {
        let path = temp_db("readers.db");
        let store = SqliteStore::open(&path).unwrap();
        store.insert_identity(&identity("S1", "a@x.com", "CS")).unwrap();

        let writer = store.writer().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::scope(|s| {
            for _ in 0..2 {
                let tx = tx.clone();
                let store = &store;
                s.spawn(move || {
                    let _ = tx.send(store.identity_count());
                });
            }
            for _ in 0..2 {
                let count = rx
                    .recv_timeout(Duration::from_secs(5))
                    .expect("read blocked while the writer was held");
                assert_eq!(count.unwrap(), 1);
            }
            drop(writer);
        });

        drop(store);
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_identity_count() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.identity_count().unwrap(), 0);
        store.insert_identity(&identity("S1", "a@x.com", "CS")).unwrap();
        store.insert_identity(&identity("S2", "b@x.com", "EE")).unwrap();
        assert_eq!(store.identity_count().unwrap(), 2);
    }

    #[test]
    fn test_report_filters_joins_and_orders() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_identity(&identity("S1", "a@x.com", "CS")).unwrap();
        store.insert_identity(&identity("S2", "b@x.com", "EE")).unwrap();
        for (id, group, d, session) in [
            ("S2", "EE", 2, "morning"),
            ("S1", "CS", 2, "afternoon"),
            ("S1", "CS", 2, "morning"),
            ("S1", "CS", 20, "morning"),
            ("S9", "CS", 2, "morning"), // no identity row: dropped by the join
        ] {
            let e = AttendanceEvent::new(DedupKey::new(id, day(d), session), group, Utc::now());
            store.insert_attendance(&e).unwrap();
        }

        let all = store.attendance_report(&ReportQuery::new(day(1), day(7), Some("all"))).unwrap();
        let got: Vec<_> = all
            .iter()
            .map(|r| (r.identity_id.as_str(), r.session_tag.as_str()))
            .collect();
        assert_eq!(got, vec![("S1", "afternoon"), ("S1", "morning"), ("S2", "morning")]);
        assert_eq!(all[0].display_name, "Student S1");

        let ee = store.attendance_report(&ReportQuery::new(day(1), day(7), Some("EE"))).unwrap();
        assert_eq!(ee.len(), 1);
        assert_eq!(ee[0].identity_id, "S2");
    }

    #[test]
    fn test_corrupt_embedding_is_reported() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .writer()
            .unwrap()
            .execute(
                "INSERT INTO identities(identity_id, display_name, contact_address, group_tag, embedding_json, enrolled_at)
                 VALUES ('S1', 'n', 'c', 'g', 'not json', '2024-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        assert!(matches!(store.identities(), Err(StoreError::Corrupt(_))));
    }
}
