//! SQLite-backed durable store for souls, plus the pause flag.
//!
//! One row per soul. Objectives, requirements, feedback and iterations are
//! JSON blobs; everything else is a plain column. A uniqueness constraint on
//! `project_path` enforces one soul per project.
//!
//! All operations go through a single store-wide mutex around the connection.
//! Contention is low (a handful of active souls), and holding one lock across
//! [`SoulStore::modify`] keeps read-modify-write cycles on feedback lists from
//! interleaving.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, ffi, params};
use tracing::{debug, instrument};

use crate::core::soul::{Bug, Feature, Feedback, Iteration, Soul, TestResult};
use crate::core::types::SoulStatus;
use crate::io::pause::PauseFlag;

pub const DB_FILE: &str = "souls.db";
pub const PAUSE_FILE: &str = "paused";

const SOUL_COLUMNS: &str = "id, name, project_path, objectives, requirements, status, \
     feedback, iterations, created_at, updated_at";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt soul row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

pub struct SoulStore {
    conn: Mutex<Connection>,
    pause: PauseFlag,
}

impl SoulStore {
    /// Open (or create) the store under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        Self::new(data_dir.join(DB_FILE), data_dir.join(PAUSE_FILE))
    }

    pub fn new(
        db_path: impl AsRef<Path>,
        pause_path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;",
        )?;
        create_tables(&conn)?;
        debug!(db = %db_path.display(), "soul store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            pause: PauseFlag::new(pause_path),
        })
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    #[instrument(skip_all, fields(soul_id = %soul.id))]
    pub fn create(&self, soul: &Soul) -> Result<(), StoreError> {
        let row = EncodedSoul::encode(soul)?;
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO souls ({SOUL_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    row.id,
                    row.name,
                    row.project_path,
                    row.objectives,
                    row.requirements,
                    row.status,
                    row.feedback,
                    row.iterations,
                    row.created_at,
                    row.updated_at,
                ],
            )
            .map_err(|err| conflict_or(err, &row))?;
            Ok(())
        })
    }

    #[instrument(skip_all, fields(soul_id = %soul.id))]
    pub fn update(&self, soul: &Soul) -> Result<(), StoreError> {
        self.with_conn(|conn| update_locked(conn, soul))
    }

    pub fn get(&self, id: &str) -> Result<Soul, StoreError> {
        self.with_conn(|conn| get_locked(conn, id))
    }

    pub fn get_by_project_path(&self, project_path: &Path) -> Result<Soul, StoreError> {
        let path = project_path.to_string_lossy().into_owned();
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {SOUL_COLUMNS} FROM souls WHERE project_path = ?1"),
                    params![path],
                    EncodedSoul::from_row,
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("soul for path {path}")))?;
            row.decode()
        })
    }

    /// All souls, most recently updated first.
    pub fn list(&self) -> Result<Vec<Soul>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SOUL_COLUMNS} FROM souls ORDER BY updated_at DESC, id ASC"
            ))?;
            let rows = stmt.query_map([], EncodedSoul::from_row)?;
            rows.map(|row| row?.decode()).collect()
        })
    }

    pub fn list_by_status(&self, status: SoulStatus) -> Result<Vec<Soul>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SOUL_COLUMNS} FROM souls WHERE status = ?1 \
                 ORDER BY updated_at DESC, id ASC"
            ))?;
            let rows = stmt.query_map(params![status.as_str()], EncodedSoul::from_row)?;
            rows.map(|row| row?.decode()).collect()
        })
    }

    #[instrument(skip(self))]
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let rows = conn.execute("DELETE FROM souls WHERE id = ?1", params![id])?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("soul {id}")));
            }
            Ok(())
        })
    }

    /// Fetch, mutate and save a soul while holding the store lock.
    ///
    /// `f` must not call back into the store.
    pub fn modify<F>(&self, id: &str, f: F) -> Result<Soul, StoreError>
    where
        F: FnOnce(&mut Soul),
    {
        self.with_conn(|conn| {
            let mut soul = get_locked(conn, id)?;
            f(&mut soul);
            update_locked(conn, &soul)?;
            Ok(soul)
        })
    }

    pub fn update_objectives(&self, id: &str, objectives: Vec<String>) -> Result<Soul, StoreError> {
        self.modify(id, |soul| soul.set_objectives(objectives))
    }

    pub fn update_requirements(
        &self,
        id: &str,
        requirements: Vec<String>,
    ) -> Result<Soul, StoreError> {
        self.modify(id, |soul| soul.set_requirements(requirements))
    }

    pub fn set_status(&self, id: &str, status: SoulStatus) -> Result<Soul, StoreError> {
        self.modify(id, |soul| soul.set_status(status))
    }

    pub fn add_feature(&self, id: &str, feature: Feature) -> Result<Soul, StoreError> {
        self.modify(id, |soul| soul.add_implemented_feature(feature))
    }

    pub fn add_bug(&self, id: &str, bug: Bug) -> Result<Soul, StoreError> {
        self.modify(id, |soul| soul.add_bug(bug))
    }

    pub fn add_test_result(&self, id: &str, result: TestResult) -> Result<Soul, StoreError> {
        self.modify(id, |soul| soul.add_test_result(result))
    }

    pub fn mark_bug_fixed(&self, id: &str, bug_id: &str) -> Result<Soul, StoreError> {
        let mut found = false;
        let soul = self.modify(id, |soul| found = soul.mark_bug_fixed(bug_id))?;
        if !found {
            return Err(StoreError::NotFound(format!("bug {bug_id} on soul {id}")));
        }
        Ok(soul)
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    pub fn set_paused(&self, paused: bool) -> anyhow::Result<()> {
        self.pause.set_paused(paused)
    }
}

fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS souls (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            project_path TEXT NOT NULL UNIQUE,
            objectives TEXT NOT NULL,
            requirements TEXT NOT NULL,
            status TEXT NOT NULL,
            feedback TEXT NOT NULL,
            iterations TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_souls_updated_at ON souls(updated_at);",
    )?;
    Ok(())
}

fn get_locked(conn: &Connection, id: &str) -> Result<Soul, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {SOUL_COLUMNS} FROM souls WHERE id = ?1"),
            params![id],
            EncodedSoul::from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("soul {id}")))?;
    row.decode()
}

fn update_locked(conn: &Connection, soul: &Soul) -> Result<(), StoreError> {
    let row = EncodedSoul::encode(soul)?;
    let rows = conn
        .execute(
            "UPDATE souls SET name = ?2, project_path = ?3, objectives = ?4, requirements = ?5, \
             status = ?6, feedback = ?7, iterations = ?8, created_at = ?9, updated_at = ?10 \
             WHERE id = ?1",
            params![
                row.id,
                row.name,
                row.project_path,
                row.objectives,
                row.requirements,
                row.status,
                row.feedback,
                row.iterations,
                row.created_at,
                row.updated_at,
            ],
        )
        .map_err(|err| conflict_or(err, &row))?;
    if rows == 0 {
        return Err(StoreError::NotFound(format!("soul {}", soul.id)));
    }
    Ok(())
}

fn conflict_or(err: rusqlite::Error, row: &EncodedSoul) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _) if code.code == ErrorCode::ConstraintViolation => {
            let reason = match code.extended_code {
                ffi::SQLITE_CONSTRAINT_PRIMARYKEY => format!("soul {} already exists", row.id),
                ffi::SQLITE_CONSTRAINT_UNIQUE => {
                    format!("a soul already exists for {}", row.project_path)
                }
                _ => format!("constraint violated writing soul {}: {err}", row.id),
            };
            StoreError::Conflict(reason)
        }
        _ => StoreError::Sqlite(err),
    }
}

/// Column-level representation of a soul row.
struct EncodedSoul {
    id: String,
    name: String,
    project_path: String,
    objectives: String,
    requirements: String,
    status: String,
    feedback: String,
    iterations: String,
    created_at: String,
    updated_at: String,
}

impl EncodedSoul {
    fn encode(soul: &Soul) -> Result<Self, StoreError> {
        Ok(Self {
            id: soul.id.clone(),
            name: soul.name.clone(),
            project_path: soul.project_path.to_string_lossy().into_owned(),
            objectives: serde_json::to_string(&soul.objectives)?,
            requirements: serde_json::to_string(&soul.requirements)?,
            status: soul.status.as_str().to_string(),
            feedback: serde_json::to_string(&soul.feedback)?,
            iterations: serde_json::to_string(&soul.iterations)?,
            created_at: encode_time(soul.created_at),
            updated_at: encode_time(soul.updated_at),
        })
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            project_path: row.get(2)?,
            objectives: row.get(3)?,
            requirements: row.get(4)?,
            status: row.get(5)?,
            feedback: row.get(6)?,
            iterations: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn decode(self) -> Result<Soul, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let status = self.status.parse::<SoulStatus>().map_err(corrupt)?;
        let created_at = decode_time(&self.created_at).map_err(corrupt)?;
        let updated_at = decode_time(&self.updated_at).map_err(corrupt)?;
        let objectives: Vec<String> = serde_json::from_str(&self.objectives)?;
        let requirements: Vec<String> = serde_json::from_str(&self.requirements)?;
        let feedback: Feedback = serde_json::from_str(&self.feedback)?;
        let iterations: Vec<Iteration> = serde_json::from_str(&self.iterations)?;
        Ok(Soul {
            id: self.id,
            name: self.name,
            project_path: PathBuf::from(self.project_path),
            objectives,
            requirements,
            status,
            feedback,
            iterations,
            created_at,
            updated_at,
        })
    }
}

// Fixed nanosecond precision keeps text order equal to time order.
fn encode_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_time(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| format!("bad timestamp '{raw}': {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::extractor::extract_feedback;
    use crate::core::types::IterationKind;
    use std::sync::Arc;
    use std::thread;

    fn temp_store() -> (tempfile::TempDir, SoulStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SoulStore::open(dir.path()).expect("open store");
        (dir, store)
    }

    fn rich_soul(path: &str) -> Soul {
        let mut soul = Soul::new(path, "");
        soul.set_objectives(vec!["ship a todo app".to_string()]);
        soul.set_requirements(vec!["rust".to_string(), "sqlite".to_string()]);
        soul.start_iteration("agent-1", IterationKind::Development);
        soul.complete_iteration("agent-1", "Implemented login page\nBug: logout broken");
        soul.start_iteration("agent-2", IterationKind::Test);
        let extracted = extract_feedback(
            "Implemented login page\nBug: logout broken\n✅ login test",
            "agent-1",
            Utc::now(),
        );
        for feature in extracted.features {
            soul.add_implemented_feature(feature);
        }
        for bug in extracted.bugs {
            soul.add_bug(bug);
        }
        for result in extracted.test_results {
            soul.add_test_result(result);
        }
        soul
    }

    #[test]
    fn create_then_get_round_trips() {
        let (_dir, store) = temp_store();
        let soul = rich_soul("/work/todo");
        store.create(&soul).expect("create");

        let loaded = store.get(&soul.id).expect("get");
        assert_eq!(loaded, soul);
        assert_eq!(
            store.get_by_project_path(Path::new("/work/todo")).expect("by path"),
            soul
        );
    }

    #[test]
    fn duplicate_project_path_is_a_conflict() {
        let (_dir, store) = temp_store();
        store.create(&Soul::new("/work/todo", "a")).expect("create");
        let err = store.create(&Soul::new("/work/todo", "b")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "{err}");
        assert!(err.to_string().contains("/work/todo"), "{err}");
    }

    #[test]
    fn duplicate_id_is_a_conflict_naming_the_id() {
        let (_dir, store) = temp_store();
        let soul = Soul::new("/work/todo", "a");
        store.create(&soul).expect("create");
        let mut twin = soul.clone();
        twin.project_path = PathBuf::from("/work/other");

        let err = store.create(&twin).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "{err}");
        let message = err.to_string();
        assert!(message.contains(&soul.id), "{message}");
        assert!(!message.contains("/work/other"), "{message}");
    }

    #[test]
    fn missing_ids_are_not_found() {
        let (_dir, store) = temp_store();
        let ghost = Soul::new("/nowhere", "ghost");
        assert!(matches!(store.get(&ghost.id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.update(&ghost), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(&ghost.id), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.get_by_project_path(Path::new("/nowhere")),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.add_feature(&ghost.id, rich_soul("/x").feedback.implemented_features[0].clone()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn update_replaces_row_and_delete_removes_it() {
        let (_dir, store) = temp_store();
        let mut soul = Soul::new("/work/todo", "");
        store.create(&soul).expect("create");

        soul.set_status(SoulStatus::Working);
        store.update(&soul).expect("update");
        assert_eq!(store.get(&soul.id).expect("get").status, SoulStatus::Working);

        store.delete(&soul.id).expect("delete");
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn list_orders_most_recently_updated_first() {
        let (_dir, store) = temp_store();
        let a = Soul::new("/a", "");
        let b = Soul::new("/b", "");
        let c = Soul::new("/c", "");
        for soul in [&a, &b, &c] {
            store.create(soul).expect("create");
        }
        thread::sleep(std::time::Duration::from_millis(2));
        store
            .update_objectives(&a.id, vec!["touch a".to_string()])
            .expect("touch a");

        let ids: Vec<String> = store.list().expect("list").into_iter().map(|s| s.id).collect();
        assert_eq!(ids[0], a.id);
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn list_by_status_filters() {
        let (_dir, store) = temp_store();
        let a = Soul::new("/a", "");
        let b = Soul::new("/b", "");
        store.create(&a).expect("create");
        store.create(&b).expect("create");
        store.set_status(&b.id, SoulStatus::Working).expect("status");

        let working = store.list_by_status(SoulStatus::Working).expect("list");
        assert_eq!(working.len(), 1);
        assert_eq!(working[0].id, b.id);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let soul = rich_soul("/work/todo");
        {
            let store = SoulStore::open(dir.path()).expect("open");
            store.create(&soul).expect("create");
            store.set_paused(true).expect("pause");
        }
        let reopened = SoulStore::open(dir.path()).expect("reopen");
        assert_eq!(reopened.get(&soul.id).expect("get"), soul);
        assert!(reopened.is_paused());
    }

    #[test]
    fn fresh_store_is_not_paused() {
        let (_dir, store) = temp_store();
        assert!(!store.is_paused());
    }

    #[test]
    fn mark_bug_fixed_reports_unknown_bug() {
        let (_dir, store) = temp_store();
        let soul = rich_soul("/work/todo");
        store.create(&soul).expect("create");
        let bug_id = soul.feedback.known_bugs[0].id.clone();

        let updated = store.mark_bug_fixed(&soul.id, &bug_id).expect("fix");
        assert!(updated.unfixed_bugs().is_empty());
        assert!(matches!(
            store.mark_bug_fixed(&soul.id, "bug-missing"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn concurrent_modifications_are_not_lost() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        let soul = Soul::new("/work/todo", "");
        store.create(&soul).expect("create");
        let template = rich_soul("/x").feedback.implemented_features[0].clone();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                let id = soul.id.clone();
                let template = template.clone();
                thread::spawn(move || {
                    for i in 0..10 {
                        let mut feature = template.clone();
                        feature.description = format!("feature {t}-{i}");
                        store.add_feature(&id, feature).expect("add");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let loaded = store.get(&soul.id).expect("get");
        assert_eq!(loaded.feedback.implemented_features.len(), 40);
    }
}
