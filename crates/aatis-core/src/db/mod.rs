//! Direct SQLite persistence for the orchestration core.
//!
//! Persisted layout:
//! - memory records keyed by id, with their tier tag
//! - tasks keyed by id, with the full append-only transition log
//! - the capability registry snapshot
//! - loaded rule set versions and every policy verdict
//! - the audit event stream
//!
//! Database location priority (see [`Database::find_database`]):
//! 1. AATIS_DATABASE_PATH env var
//! 2. ~/.aatis/aatis.db

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::audit::{AuditEvent, AuditEventType, AuditSink};
use crate::error::{Error, Result};
use crate::types::{
    CapabilityDescriptor, MemoryId, MemoryRecord, MemoryTier, PolicyVerdict, Provenance, Task,
    TaskState, TransitionEntry, VerdictOutcome,
};

/// Schema migration applied on open
pub const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Database connection wrapper.
///
/// Thread-safe via internal Mutex. All database operations acquire the lock.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open database at specific path and apply the schema
    pub fn open_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(Error::Database)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// Open a private in-memory database with the schema applied
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::Database)?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// Find database file location
    pub fn find_database() -> PathBuf {
        if let Ok(path) = std::env::var("AATIS_DATABASE_PATH") {
            return PathBuf::from(path);
        }

        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".aatis").join("aatis.db")
    }

    /// Apply the schema (idempotent)
    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Check database connectivity
    pub fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("SELECT 1").map_err(Error::Database)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Memory Record Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or replace a memory record
    pub fn upsert_memory_record(&self, record: &MemoryRecord) -> Result<()> {
        let embedding_json = serde_json::to_string(&record.embedding)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO memory_records (id, tier, source_text, embedding_json, provenance_agent,
                                         provenance_task, access_count, created_at, last_accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                tier = excluded.tier,
                access_count = excluded.access_count,
                last_accessed_at = excluded.last_accessed_at",
            params![
                record.id.0 as i64,
                record.tier.as_str(),
                record.source_text,
                embedding_json,
                record.provenance.agent,
                record.provenance.task_id,
                record.access_count as i64,
                to_millis(&record.created_at),
                to_millis(&record.last_accessed_at),
            ],
        )?;
        Ok(())
    }

    /// Delete a memory record. Returns whether a row was removed.
    pub fn delete_memory_record(&self, id: MemoryId) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM memory_records WHERE id = ?1", params![id.0 as i64])?;
        Ok(rows > 0)
    }

    /// Allocate a memory id no process sharing this database has used,
    /// and that is above every persisted record
    pub fn allocate_memory_id(&self) -> Result<MemoryId> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO memory_id_seq (id)
             SELECT MAX(
                 COALESCE((SELECT MAX(id) FROM memory_records), 0),
                 COALESCE((SELECT seq FROM sqlite_sequence WHERE name = 'memory_id_seq'), 0)
             ) + 1",
            [],
        )?;
        let id = tx.last_insert_rowid();
        // only the sequence counter matters
        tx.execute("DELETE FROM memory_id_seq WHERE id < ?1", params![id])?;
        tx.commit()?;
        Ok(MemoryId(id as u64))
    }

    /// Get a memory record by id
    pub fn get_memory_record(&self, id: MemoryId) -> Result<Option<MemoryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, tier, source_text, embedding_json, provenance_agent, provenance_task,
                    access_count, created_at, last_accessed_at
             FROM memory_records WHERE id = ?1",
        )?;
        let row = stmt
            .query_row(params![id.0 as i64], MemoryRow::from_row)
            .optional()?;
        row.map(MemoryRow::into_record).transpose()
    }

    /// List memory records, optionally restricted to one tier, oldest id first
    pub fn list_memory_records(&self, tier: Option<MemoryTier>) -> Result<Vec<MemoryRecord>> {
        let conn = self.lock()?;
        let rows = if let Some(tier) = tier {
            let mut stmt = conn.prepare(
                "SELECT id, tier, source_text, embedding_json, provenance_agent, provenance_task,
                        access_count, created_at, last_accessed_at
                 FROM memory_records WHERE tier = ?1 ORDER BY id",
            )?;
            stmt.query_map(params![tier.as_str()], MemoryRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, tier, source_text, embedding_json, provenance_agent, provenance_task,
                        access_count, created_at, last_accessed_at
                 FROM memory_records ORDER BY id",
            )?;
            stmt.query_map([], MemoryRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        rows.into_iter().map(MemoryRow::into_record).collect()
    }

    /// Count memory records per tier
    pub fn memory_counts(&self) -> Result<HashMap<MemoryTier, i64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT tier, COUNT(*) FROM memory_records GROUP BY tier")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut counts = HashMap::new();
        for (tier, count) in rows {
            let tier = tier.parse::<MemoryTier>().map_err(Error::Corrupt)?;
            counts.insert(tier, count);
        }
        Ok(counts)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Task Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Save a task snapshot and append any transition not yet persisted.
    ///
    /// Transition rows are insert-only; an existing `(task_id, seq)` row is
    /// never rewritten.
    pub fn save_task(&self, task: &Task) -> Result<()> {
        let task_json = serde_json::to_string(task)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO tasks (id, state, assigned_capability, task_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                assigned_capability = excluded.assigned_capability,
                task_json = excluded.task_json,
                updated_at = excluded.updated_at",
            params![
                task.id,
                task.state.as_str(),
                task.assigned_capability,
                task_json,
                to_millis(&task.created_at),
                to_millis(&task.updated_at),
            ],
        )?;
        for entry in &task.transitions {
            tx.execute(
                "INSERT OR IGNORE INTO task_transitions
                    (task_id, seq, from_state, to_state, actor, entry_json, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    task.id,
                    entry.seq,
                    entry.from.as_str(),
                    entry.to.as_str(),
                    entry.actor.to_string(),
                    serde_json::to_string(entry)?,
                    to_millis(&entry.at),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Get a task by id
    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT task_json FROM tasks WHERE id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(Error::from))
            .transpose()
    }

    /// List tasks, newest first, optionally filtered by state
    pub fn list_tasks(&self, state: Option<TaskState>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let limit = limit as i64;
        let rows: Vec<String> = if let Some(state) = state {
            let mut stmt = conn.prepare(
                "SELECT task_json FROM tasks WHERE state = ?1 ORDER BY created_at DESC LIMIT ?2",
            )?;
            stmt.query_map(params![state.as_str(), limit], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            let mut stmt =
                conn.prepare("SELECT task_json FROM tasks ORDER BY created_at DESC LIMIT ?1")?;
            stmt.query_map(params![limit], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(Error::from))
            .collect()
    }

    /// Transition log of a task, as persisted in the append-only table
    pub fn list_transitions(&self, task_id: &str) -> Result<Vec<TransitionEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT entry_json FROM task_transitions WHERE task_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![task_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(Error::from))
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Capability Registry Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Save a registry entry
    pub fn save_capability(&self, registration_seq: u64, descriptor: &CapabilityDescriptor) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO capabilities (name, registration_seq, descriptor_json, registered_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                descriptor_json = excluded.descriptor_json",
            params![
                descriptor.name,
                registration_seq as i64,
                serde_json::to_string(descriptor)?,
                to_millis(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Remove a registry entry. Returns whether a row was removed.
    pub fn delete_capability(&self, name: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM capabilities WHERE name = ?1", params![name])?;
        Ok(rows > 0)
    }

    /// Registry snapshot in registration order
    pub fn list_capabilities(&self) -> Result<Vec<(u64, CapabilityDescriptor)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT registration_seq, descriptor_json FROM capabilities ORDER BY registration_seq",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(seq, json)| Ok((seq as u64, serde_json::from_str(&json)?)))
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Core Lease
    // ─────────────────────────────────────────────────────────────────────────

    /// Take or renew the core lease. Returns the other holder when a live
    /// lease (heartbeat within `stale_after`) belongs to someone else.
    pub fn acquire_lease(&self, holder: &str, stale_after: chrono::Duration) -> Result<Option<String>> {
        let now = Utc::now();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current: Option<(String, i64)> = tx
            .query_row("SELECT holder, heartbeat_at FROM core_lease WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        if let Some((other, heartbeat)) = current {
            if other != holder && now.timestamp_millis() - heartbeat <= stale_after.num_milliseconds() {
                return Ok(Some(other));
            }
        }
        tx.execute(
            "INSERT INTO core_lease (id, holder, heartbeat_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET holder = excluded.holder, heartbeat_at = excluded.heartbeat_at",
            params![holder, to_millis(&now)],
        )?;
        tx.commit()?;
        Ok(None)
    }

    /// Drop the lease if `holder` owns it
    pub fn release_lease(&self, holder: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM core_lease WHERE id = 1 AND holder = ?1", params![holder])?;
        Ok(rows > 0)
    }

    /// Holder of a live lease, if any
    pub fn lease_holder(&self, stale_after: chrono::Duration) -> Result<Option<String>> {
        let conn = self.lock()?;
        let current: Option<(String, i64)> = conn
            .query_row("SELECT holder, heartbeat_at FROM core_lease WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        let now = Utc::now().timestamp_millis();
        Ok(current
            .filter(|(_, heartbeat)| now - heartbeat <= stale_after.num_milliseconds())
            .map(|(holder, _)| holder))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Rule Set & Verdict Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Record that a rule set version was loaded. Fails if the version was
    /// already recorded, by this or another process.
    pub fn record_rule_set_version(&self, version: u32, rule_count: usize) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO rule_set_versions (version, rule_count, loaded_at)
             VALUES (?1, ?2, ?3)",
            params![version, rule_count as i64, to_millis(&Utc::now())],
        )?;
        Ok(())
    }

    /// Highest rule set version ever loaded
    pub fn current_rule_set_version(&self) -> Result<Option<u32>> {
        let conn = self.lock()?;
        let version: Option<i64> =
            conn.query_row("SELECT MAX(version) FROM rule_set_versions", [], |row| row.get(0))?;
        Ok(version.map(|v| v as u32))
    }

    /// Append a policy verdict
    pub fn insert_verdict(&self, verdict: &PolicyVerdict) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO policy_verdicts
                (task_id, rule_set_version, outcome, violated_json, warnings_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                verdict.task_id,
                verdict.rule_set_version,
                verdict.outcome.as_str(),
                serde_json::to_string(&verdict.violated_rules)?,
                serde_json::to_string(&verdict.warnings)?,
                to_millis(&verdict.timestamp),
            ],
        )?;
        Ok(())
    }

    /// Verdicts recorded for a task, oldest first
    pub fn list_verdicts(&self, task_id: &str) -> Result<Vec<PolicyVerdict>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, rule_set_version, outcome, violated_json, warnings_json, created_at
             FROM policy_verdicts WHERE task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(task_id, version, outcome, violated, warnings, created_at)| {
                Ok(PolicyVerdict {
                    task_id,
                    rule_set_version: version as u32,
                    outcome: outcome.parse::<VerdictOutcome>().map_err(Error::Corrupt)?,
                    violated_rules: serde_json::from_str(&violated)?,
                    warnings: serde_json::from_str(&warnings)?,
                    timestamp: from_millis(created_at)?,
                })
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Audit Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Append an audit event
    pub fn insert_audit_event(&self, event: &AuditEvent) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO audit_events (entity_id, event_type, actor, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.entity_id,
                event.event_type.as_str(),
                event.actor,
                event.detail,
                to_millis(&event.timestamp),
            ],
        )?;
        Ok(())
    }

    /// Most recent audit events, returned oldest first
    pub fn list_audit_events(&self, entity_id: Option<&str>, limit: usize) -> Result<Vec<AuditEvent>> {
        let conn = self.lock()?;
        let limit = limit as i64;
        let map = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        };
        let rows = if let Some(entity_id) = entity_id {
            let mut stmt = conn.prepare(
                "SELECT entity_id, event_type, actor, detail, created_at FROM audit_events
                 WHERE entity_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            stmt.query_map(params![entity_id, limit], map)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            let mut stmt = conn.prepare(
                "SELECT entity_id, event_type, actor, detail, created_at FROM audit_events
                 ORDER BY id DESC LIMIT ?1",
            )?;
            stmt.query_map(params![limit], map)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut events = rows
            .into_iter()
            .map(|(entity_id, event_type, actor, detail, created_at)| {
                Ok(AuditEvent {
                    entity_id,
                    event_type: event_type.parse::<AuditEventType>().map_err(Error::Corrupt)?,
                    timestamp: from_millis(created_at)?,
                    actor,
                    detail,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        events.reverse();
        Ok(events)
    }
}

impl AuditSink for Database {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        self.insert_audit_event(event)
    }
}

/// Raw memory row before parsing
struct MemoryRow {
    id: i64,
    tier: String,
    source_text: String,
    embedding_json: String,
    provenance_agent: String,
    provenance_task: Option<String>,
    access_count: i64,
    created_at: i64,
    last_accessed_at: i64,
}

impl MemoryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tier: row.get(1)?,
            source_text: row.get(2)?,
            embedding_json: row.get(3)?,
            provenance_agent: row.get(4)?,
            provenance_task: row.get(5)?,
            access_count: row.get(6)?,
            created_at: row.get(7)?,
            last_accessed_at: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<MemoryRecord> {
        Ok(MemoryRecord {
            id: MemoryId(self.id as u64),
            embedding: serde_json::from_str(&self.embedding_json)?,
            source_text: self.source_text,
            tier: self.tier.parse::<MemoryTier>().map_err(Error::Corrupt)?,
            created_at: from_millis(self.created_at)?,
            last_accessed_at: from_millis(self.last_accessed_at)?,
            access_count: self.access_count as u64,
            provenance: Provenance {
                agent: self.provenance_agent,
                task_id: self.provenance_task,
            },
        })
    }
}

fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Corrupt(format!("timestamp out of range: {}", ms)))
}
