//! Tiered Memory Store
//!
//! Records live in exactly one of three tiers. The vector index is a single
//! arena whose entry tags are the record tiers, so tier membership is a
//! search filter and a tier transition is a retag.
//!
//! Locking:
//! - `state` (records + index) is one `RwLock`, so every observer sees a
//!   record under exactly one tier
//! - each tier has a writer mutex; an operation takes the mutexes of every
//!   tier it may touch, always lowest tier first
//! - reads take no tier mutex and run concurrently with writers of other
//!   tiers
//!
//! Capacity policy when a tier is full:
//! - STM: evict the least recently used STM record
//! - MTM: demote the least recently used MTM record to STM (which may in
//!   turn evict from STM)
//! - LTM: evict the least recently used LTM record
//!
//! LRU order is last access, then creation time, then id.
//!
//! Database writes happen while `state` is still write-locked, so the
//! persisted rows follow the in-memory order of changes and an access update
//! can never resurrect an evicted record.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, RwLock};

use aatis_core::audit::{self, AuditEvent, AuditEventType, AuditSink, NullAuditSink};
use aatis_core::types::{MemoryId, MemoryRecord, MemoryTier, NewMemoryRecord, Provenance};
use aatis_core::{Database, VectorIndex};

use super::embeddings::EmbeddingProvider;
use crate::config::MemoryConfig;
use crate::utils::{Clock, SystemClock, content_hash, elapsed_since};
use crate::{SDKError, SDKResult};

/// A record returned by a search, with its similarity score
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryHit {
    pub record: MemoryRecord,
    pub score: f32,
}

/// Record counts per tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub short_term: usize,
    pub medium_term: usize,
    pub long_term: usize,
}

impl MemoryStats {
    pub fn get(&self, tier: MemoryTier) -> usize {
        match tier {
            MemoryTier::ShortTerm => self.short_term,
            MemoryTier::MediumTerm => self.medium_term,
            MemoryTier::LongTerm => self.long_term,
        }
    }

    pub fn total(&self) -> usize {
        self.short_term + self.medium_term + self.long_term
    }
}

/// Outcome of one sweep, including cascaded capacity moves
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// `(id, new tier)`
    pub promoted: Vec<(MemoryId, MemoryTier)>,
    /// `(id, new tier)`
    pub demoted: Vec<(MemoryId, MemoryTier)>,
    /// `(id, tier it was evicted from)`
    pub evicted: Vec<(MemoryId, MemoryTier)>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty() && self.demoted.is_empty() && self.evicted.is_empty()
    }
}

/// A state change, applied in memory and then persisted and audited
#[derive(Debug)]
enum Change {
    Written(MemoryRecord),
    Moved {
        record: MemoryRecord,
        from: MemoryTier,
        reason: &'static str,
    },
    Evicted {
        record: MemoryRecord,
        reason: &'static str,
    },
}

struct MemoryState {
    records: HashMap<MemoryId, MemoryRecord>,
    index: VectorIndex<MemoryTier>,
    counts: [usize; 3],
}

impl MemoryState {
    fn count(&self, tier: MemoryTier) -> usize {
        self.counts[tier.index()]
    }

    fn tier_of(&self, id: MemoryId) -> Option<MemoryTier> {
        self.records.get(&id).map(|r| r.tier)
    }

    /// Least recently used record of a tier
    fn lru(&self, tier: MemoryTier) -> Option<MemoryId> {
        self.records
            .values()
            .filter(|r| r.tier == tier)
            .min_by(|a, b| {
                a.last_accessed_at
                    .cmp(&b.last_accessed_at)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|r| r.id)
    }

    fn insert(&mut self, record: MemoryRecord) {
        self.counts[record.tier.index()] += 1;
        self.records.insert(record.id, record);
    }

    fn evict(&mut self, id: MemoryId, reason: &'static str, changes: &mut Vec<Change>) {
        if let Some(record) = self.records.remove(&id) {
            self.index.remove(id.0);
            self.counts[record.tier.index()] -= 1;
            changes.push(Change::Evicted { record, reason });
        }
    }

    /// Free one slot in `tier` if it is full
    fn make_room(&mut self, tier: MemoryTier, config: &MemoryConfig, changes: &mut Vec<Change>) {
        if self.count(tier) < capacity(config, tier) {
            return;
        }
        let Some(victim) = self.lru(tier) else {
            return;
        };

        match tier {
            MemoryTier::MediumTerm => {
                self.move_to(victim, MemoryTier::ShortTerm, "capacity", config, changes);
            }
            MemoryTier::ShortTerm | MemoryTier::LongTerm => {
                self.evict(victim, "capacity", changes);
            }
        }
    }

    /// Move a record to another tier, applying the target's capacity policy.
    ///
    /// The record is detached while room is made, so a cascade can never pick
    /// it as a victim.
    fn move_to(
        &mut self,
        id: MemoryId,
        to: MemoryTier,
        reason: &'static str,
        config: &MemoryConfig,
        changes: &mut Vec<Change>,
    ) -> Option<MemoryRecord> {
        let mut record = self.records.remove(&id)?;
        let from = record.tier;
        if from == to {
            self.records.insert(id, record.clone());
            return Some(record);
        }
        self.counts[from.index()] -= 1;

        self.make_room(to, config, changes);

        record.tier = to;
        self.index.retag(id.0, to);
        self.insert(record.clone());

        changes.push(Change::Moved {
            record: record.clone(),
            from,
            reason,
        });
        Some(record)
    }
}

fn capacity(config: &MemoryConfig, tier: MemoryTier) -> usize {
    match tier {
        MemoryTier::ShortTerm => config.stm_capacity,
        MemoryTier::MediumTerm => config.mtm_capacity,
        MemoryTier::LongTerm => config.ltm_capacity,
    }
}

/// Tiers whose writer lock is needed to insert into `tier`
fn write_scope(tier: MemoryTier) -> Vec<MemoryTier> {
    match tier {
        // a full MTM demotes into STM
        MemoryTier::MediumTerm => vec![MemoryTier::ShortTerm, MemoryTier::MediumTerm],
        other => vec![other],
    }
}

/// Three-tier memory store backed by the vector index
pub struct TieredMemory {
    config: MemoryConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    state: RwLock<MemoryState>,
    tier_locks: [Mutex<()>; 3],
    next_id: AtomicU64,
    db: Option<Arc<Database>>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl TieredMemory {
    /// Create an empty store over the given index
    pub fn new(
        config: MemoryConfig,
        index: VectorIndex<MemoryTier>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            config,
            embedder,
            state: RwLock::new(MemoryState {
                records: HashMap::new(),
                index,
                counts: [0; 3],
            }),
            tier_locks: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
            next_id: AtomicU64::new(1),
            db: None,
            audit: Arc::new(NullAuditSink),
            clock: Arc::new(SystemClock),
        }
    }

    /// Persist every change to the database
    pub fn with_db(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a record into a tier, running the tier's capacity policy first.
    ///
    /// A vector of the wrong dimension is rejected and nothing is stored.
    pub async fn write(&self, input: NewMemoryRecord, tier: MemoryTier) -> SDKResult<MemoryRecord> {
        let _guards = self.lock_tiers(&write_scope(tier)).await;
        let now = self.clock.now();
        let mut changes = Vec::new();

        let stored = {
            let mut state = self.state.write().await;
            let id = self.allocate_id()?;

            // Validates the vector; the index is untouched on error
            state.index.upsert(id.0, &input.embedding, tier)?;
            state.make_room(tier, &self.config, &mut changes);

            let record = MemoryRecord {
                id,
                embedding: input.embedding,
                source_text: input.source_text,
                tier,
                created_at: now,
                last_accessed_at: now,
                access_count: 0,
                provenance: input.provenance,
            };
            state.insert(record.clone());
            changes.push(Change::Written(record.clone()));
            self.persist(&changes);
            record
        };

        self.commit(changes);
        Ok(stored)
    }

    /// Embed text and write it
    pub async fn remember(
        &self,
        text: &str,
        provenance: Provenance,
        tier: MemoryTier,
    ) -> SDKResult<MemoryRecord> {
        let embedding = self.embedder.embed(text).await?;
        self.write(
            NewMemoryRecord {
                embedding,
                source_text: text.to_string(),
                provenance,
            },
            tier,
        )
        .await
    }

    /// Move a record one tier up
    pub async fn promote(&self, id: MemoryId) -> SDKResult<MemoryRecord> {
        self.shift(id, true).await
    }

    /// Move a record one tier down
    pub async fn demote(&self, id: MemoryId) -> SDKResult<MemoryRecord> {
        self.shift(id, false).await
    }

    async fn shift(&self, id: MemoryId, up: bool) -> SDKResult<MemoryRecord> {
        loop {
            let current = self
                .state
                .read()
                .await
                .tier_of(id)
                .ok_or(aatis_core::Error::MemoryNotFound(id))?;
            let target = if up { current.promoted() } else { current.demoted() }.ok_or_else(|| {
                SDKError::invalid_operation(format!(
                    "{} is already in the {} tier",
                    id,
                    if up { "highest" } else { "lowest" }
                ))
            })?;

            let mut scope = write_scope(target);
            scope.push(current);
            let _guards = self.lock_tiers(&scope).await;

            let mut changes = Vec::new();
            let moved = {
                let mut state = self.state.write().await;
                let moved = match state.tier_of(id) {
                    None => return Err(aatis_core::Error::MemoryNotFound(id).into()),
                    // moved by someone else while we waited for the locks
                    Some(tier) if tier != current => continue,
                    Some(_) => state.move_to(id, target, "manual", &self.config, &mut changes),
                };
                self.persist(&changes);
                moved
            };

            self.commit(changes);
            return moved.ok_or_else(|| aatis_core::Error::MemoryNotFound(id).into());
        }
    }

    /// Remove a record from whatever tier holds it
    pub async fn evict(&self, id: MemoryId, reason: &'static str) -> SDKResult<MemoryRecord> {
        loop {
            let current = self
                .state
                .read()
                .await
                .tier_of(id)
                .ok_or(aatis_core::Error::MemoryNotFound(id))?;
            let _guards = self.lock_tiers(&[current]).await;

            let mut changes = Vec::new();
            {
                let mut state = self.state.write().await;
                match state.tier_of(id) {
                    None => return Err(aatis_core::Error::MemoryNotFound(id).into()),
                    Some(tier) if tier != current => continue,
                    Some(_) => state.evict(id, reason, &mut changes),
                }
                self.persist(&changes);
            }

            let evicted = changes.iter().find_map(|change| match change {
                Change::Evicted { record, .. } => Some(record.clone()),
                _ => None,
            });
            self.commit(changes);
            return evicted.ok_or_else(|| aatis_core::Error::MemoryNotFound(id).into());
        }
    }

    /// Apply the tier policies: promote hot records, demote or evict idle
    /// ones, and bring LTM back under capacity.
    pub async fn sweep(&self) -> SDKResult<SweepReport> {
        let _guards = self.lock_tiers(&MemoryTier::ALL).await;
        let now = self.clock.now();
        let config = &self.config;
        let mut changes = Vec::new();

        {
            let mut state = self.state.write().await;

            let mut stm_promote = Vec::new();
            let mut stm_evict = Vec::new();
            let mut mtm_promote = Vec::new();
            let mut mtm_demote = Vec::new();

            for record in state.records.values() {
                let idle = elapsed_since(record.last_accessed_at, now);
                match record.tier {
                    MemoryTier::ShortTerm => {
                        if record.access_count >= config.stm_promotion_threshold
                            && idle <= config.stm_recency_window()
                        {
                            stm_promote.push(record.id);
                        } else if idle > config.stm_ttl() {
                            stm_evict.push(record.id);
                        }
                    }
                    MemoryTier::MediumTerm => {
                        if record.access_count >= config.mtm_promotion_threshold
                            && idle <= config.mtm_ttl()
                        {
                            mtm_promote.push(record.id);
                        } else if idle > config.mtm_ttl() {
                            mtm_demote.push(record.id);
                        }
                    }
                    MemoryTier::LongTerm => {}
                }
            }
            for ids in [&mut stm_promote, &mut stm_evict, &mut mtm_promote, &mut mtm_demote] {
                ids.sort();
            }

            // Evictions and upward moves first so the lower tiers have room
            for id in stm_evict {
                if state.tier_of(id) == Some(MemoryTier::ShortTerm) {
                    state.evict(id, "idle", &mut changes);
                }
            }
            for id in mtm_promote {
                if state.tier_of(id) == Some(MemoryTier::MediumTerm) {
                    state.move_to(id, MemoryTier::LongTerm, "sustained access", config, &mut changes);
                }
            }
            for id in stm_promote {
                if state.tier_of(id) == Some(MemoryTier::ShortTerm) {
                    state.move_to(id, MemoryTier::MediumTerm, "access threshold", config, &mut changes);
                }
            }
            for id in mtm_demote {
                if state.tier_of(id) == Some(MemoryTier::MediumTerm) {
                    state.move_to(id, MemoryTier::ShortTerm, "idle", config, &mut changes);
                }
            }
            while state.count(MemoryTier::LongTerm) > config.ltm_capacity {
                match state.lru(MemoryTier::LongTerm) {
                    Some(victim) => state.evict(victim, "capacity", &mut changes),
                    None => break,
                }
            }
            self.persist(&changes);
        }

        let mut report = SweepReport::default();
        for change in &changes {
            match change {
                Change::Moved { record, from, .. } if record.tier > *from => {
                    report.promoted.push((record.id, record.tier))
                }
                Change::Moved { record, .. } => report.demoted.push((record.id, record.tier)),
                Change::Evicted { record, .. } => report.evicted.push((record.id, record.tier)),
                Change::Written(_) => {}
            }
        }

        if !report.is_empty() {
            tracing::info!(
                promoted = report.promoted.len(),
                demoted = report.demoted.len(),
                evicted = report.evicted.len(),
                "Memory sweep applied"
            );
        }
        self.commit(changes);
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Search one tier (or all tiers). Every returned record has its access
    /// count and last access updated.
    pub async fn read(
        &self,
        query: &[f32],
        tier: Option<MemoryTier>,
        k: usize,
    ) -> SDKResult<Vec<MemoryHit>> {
        let hits = self.search(query, tier, k).await?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut results = Vec::with_capacity(hits.len());
        {
            let mut state = self.state.write().await;
            for (id, score) in hits {
                let Some(record) = state.records.get_mut(&id) else {
                    continue; // evicted between search and update
                };
                if tier.is_some_and(|t| record.tier != t) {
                    continue;
                }
                record.access_count += 1;
                record.last_accessed_at = now;
                results.push(MemoryHit {
                    record: record.clone(),
                    score,
                });
            }

            if let Some(db) = &self.db {
                for hit in &results {
                    if let Err(e) = db.upsert_memory_record(&hit.record) {
                        tracing::error!(id = %hit.record.id, error = %e, "Failed to persist memory access");
                    }
                }
            }
        }
        Ok(results)
    }

    /// Embed text and read
    pub async fn recall(
        &self,
        text: &str,
        tier: Option<MemoryTier>,
        k: usize,
    ) -> SDKResult<Vec<MemoryHit>> {
        let query = self.embedder.embed(text).await?;
        self.read(&query, tier, k).await
    }

    /// Search one tier (or all tiers) without touching access statistics
    pub async fn peek(
        &self,
        text: &str,
        tier: Option<MemoryTier>,
        k: usize,
    ) -> SDKResult<Vec<MemoryHit>> {
        let query = self.embedder.embed(text).await?;
        let hits = self.search(&query, tier, k).await?;
        let state = self.state.read().await;
        Ok(hits
            .into_iter()
            .filter_map(|(id, score)| {
                state.records.get(&id).map(|record| MemoryHit {
                    record: record.clone(),
                    score,
                })
            })
            .collect())
    }

    async fn search(
        &self,
        query: &[f32],
        tier: Option<MemoryTier>,
        k: usize,
    ) -> SDKResult<Vec<(MemoryId, f32)>> {
        let state = self.state.read().await;
        let only_tier = |tag: &MemoryTier| Some(*tag) == tier;
        let filter: Option<&dyn Fn(&MemoryTier) -> bool> = match tier {
            Some(_) => Some(&only_tier),
            None => None,
        };
        let hits = state.index.search(query, k, filter)?;
        Ok(hits.into_iter().map(|h| (MemoryId(h.id), h.score)).collect())
    }

    /// Get a record without touching access statistics
    pub async fn get(&self, id: MemoryId) -> Option<MemoryRecord> {
        self.state.read().await.records.get(&id).cloned()
    }

    /// Records of one tier (or all tiers), ordered by id
    pub async fn records(&self, tier: Option<MemoryTier>) -> Vec<MemoryRecord> {
        let state = self.state.read().await;
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| tier.is_none_or(|t| r.tier == t))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Record counts per tier
    pub async fn stats(&self) -> MemoryStats {
        let state = self.state.read().await;
        MemoryStats {
            short_term: state.count(MemoryTier::ShortTerm),
            medium_term: state.count(MemoryTier::MediumTerm),
            long_term: state.count(MemoryTier::LongTerm),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────────

    /// Load persisted records into the store. Records whose vectors no longer
    /// fit the index are skipped. Returns the number loaded.
    pub async fn load_from_db(&self) -> SDKResult<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let persisted = db.list_memory_records(None)?;

        let _guards = self.lock_tiers(&MemoryTier::ALL).await;
        let mut state = self.state.write().await;
        let mut loaded = 0;

        for record in persisted {
            self.next_id.fetch_max(record.id.0 + 1, Ordering::SeqCst);
            if state.records.contains_key(&record.id) {
                continue;
            }
            if let Err(e) = state.index.upsert(record.id.0, &record.embedding, record.tier) {
                tracing::warn!(id = %record.id, error = %e, "Skipping persisted memory record");
                continue;
            }
            state.insert(record);
            loaded += 1;
        }

        tracing::info!(loaded, "Loaded memory records");
        Ok(loaded)
    }

    /// Ids come from the database when there is one, so other processes
    /// writing to the same file never reuse them
    fn allocate_id(&self) -> SDKResult<MemoryId> {
        match &self.db {
            Some(db) => {
                let id = db.allocate_memory_id()?;
                self.next_id.fetch_max(id.0 + 1, Ordering::SeqCst);
                Ok(id)
            }
            None => Ok(MemoryId(self.next_id.fetch_add(1, Ordering::SeqCst))),
        }
    }

    async fn lock_tiers(&self, tiers: &[MemoryTier]) -> Vec<MutexGuard<'_, ()>> {
        let mut tiers = tiers.to_vec();
        tiers.sort();
        tiers.dedup();

        let mut guards = Vec::with_capacity(tiers.len());
        for tier in tiers {
            guards.push(self.tier_locks[tier.index()].lock().await);
        }
        guards
    }

    /// Write applied changes through to the database. Called with `state`
    /// write-locked.
    fn persist(&self, changes: &[Change]) {
        let Some(db) = &self.db else {
            return;
        };
        for change in changes {
            let persisted = match change {
                Change::Written(record) | Change::Moved { record, .. } => db.upsert_memory_record(record),
                Change::Evicted { record, .. } => db.delete_memory_record(record.id).map(|_| ()),
            };
            if let Err(e) = persisted {
                tracing::error!(error = %e, "Failed to persist memory change");
            }
        }
    }

    /// Log and audit applied changes
    fn commit(&self, changes: Vec<Change>) {
        for change in changes {
            let event = match change {
                Change::Written(record) => {
                    tracing::debug!(id = %record.id, tier = %record.tier, provenance = %record.provenance, "Memory written");
                    AuditEvent::new(
                        record.id.to_string(),
                        AuditEventType::MemoryWritten,
                        record.provenance.to_string(),
                        format!(
                            "tier={} sha256={}",
                            record.tier,
                            &content_hash(&record.source_text)[..16]
                        ),
                    )
                }
                Change::Moved { record, from, reason } => {
                    let event_type = if record.tier > from {
                        AuditEventType::MemoryPromoted
                    } else {
                        AuditEventType::MemoryDemoted
                    };
                    tracing::debug!(id = %record.id, from = %from, to = %record.tier, reason, "Memory tier transition");
                    AuditEvent::new(
                        record.id.to_string(),
                        event_type,
                        "memory",
                        format!("{} -> {} ({})", from, record.tier, reason),
                    )
                }
                Change::Evicted { record, reason } => {
                    tracing::info!(id = %record.id, tier = %record.tier, reason, "Memory record evicted");
                    AuditEvent::new(
                        record.id.to_string(),
                        AuditEventType::MemoryEvicted,
                        "memory",
                        format!("tier={} reason={}", record.tier, reason),
                    )
                }
            };
            audit::emit(self.audit.as_ref(), event.at(self.clock.now()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HashingEmbedder;
    use crate::utils::ManualClock;
    use aatis_core::Similarity;
    use aatis_core::audit::MemoryAuditSink;
    use chrono::Duration;

    const DIMS: usize = 4;

    struct Fixture {
        memory: Arc<TieredMemory>,
        clock: Arc<ManualClock>,
        audit: Arc<MemoryAuditSink>,
    }

    fn fixture(config: MemoryConfig) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let audit = Arc::new(MemoryAuditSink::new());
        let memory = TieredMemory::new(
            config,
            VectorIndex::new(DIMS, Similarity::Cosine),
            Arc::new(HashingEmbedder::new(DIMS)),
        )
        .with_audit(audit.clone())
        .with_clock(clock.clone());
        Fixture {
            memory: Arc::new(memory),
            clock,
            audit,
        }
    }

    fn small() -> MemoryConfig {
        MemoryConfig {
            stm_capacity: 2,
            mtm_capacity: 2,
            ltm_capacity: 2,
            ..Default::default()
        }
    }

    fn rec(v: [f32; DIMS], text: &str) -> NewMemoryRecord {
        NewMemoryRecord {
            embedding: v.to_vec(),
            source_text: text.into(),
            provenance: Provenance::task("recon", "t-1"),
        }
    }

    #[tokio::test]
    async fn test_write_then_read_finds_record() {
        let f = fixture(MemoryConfig::default());
        let a = f.memory.write(rec([1.0, 0.0, 0.0, 0.0], "a"), MemoryTier::ShortTerm).await.unwrap();
        f.memory.write(rec([0.0, 1.0, 0.0, 0.0], "b"), MemoryTier::ShortTerm).await.unwrap();

        let hits = f.memory.read(&[1.0, 0.0, 0.0, 0.0], None, 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, a.id);
        assert_eq!(hits[0].record.access_count, 1);

        assert_eq!(f.memory.get(a.id).await.unwrap().access_count, 1);
        assert_eq!(f.memory.stats().await.short_term, 2);
        assert_eq!(f.audit.events_of(AuditEventType::MemoryWritten).len(), 2);
    }

    #[tokio::test]
    async fn test_read_respects_tier_filter() {
        let f = fixture(MemoryConfig::default());
        f.memory.write(rec([1.0, 0.0, 0.0, 0.0], "stm"), MemoryTier::ShortTerm).await.unwrap();
        let ltm = f.memory.write(rec([1.0, 0.0, 0.0, 0.0], "ltm"), MemoryTier::LongTerm).await.unwrap();

        let hits = f.memory.read(&[1.0, 0.0, 0.0, 0.0], Some(MemoryTier::LongTerm), 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, ltm.id);

        let all = f.memory.read(&[1.0, 0.0, 0.0, 0.0], None, 5).await.unwrap();
        assert_eq!(all.len(), 2);
        // equal scores: lower id first
        assert!(all[0].record.id < all[1].record.id);
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_rejected() {
        let f = fixture(MemoryConfig::default());
        let err = f
            .memory
            .write(
                NewMemoryRecord {
                    embedding: vec![1.0, 0.0],
                    source_text: "short".into(),
                    provenance: Provenance::agent("recon"),
                },
                MemoryTier::ShortTerm,
            )
            .await
            .unwrap_err();
        assert!(err.is_dimension_mismatch());
        assert_eq!(f.memory.stats().await.total(), 0);

        assert!(f.memory.read(&[1.0], None, 3).await.unwrap_err().is_dimension_mismatch());
    }

    #[tokio::test]
    async fn test_full_stm_evicts_lru() {
        let f = fixture(small());
        let a = f.memory.write(rec([1.0, 0.0, 0.0, 0.0], "a"), MemoryTier::ShortTerm).await.unwrap();
        f.clock.advance(Duration::seconds(1));
        let b = f.memory.write(rec([0.0, 1.0, 0.0, 0.0], "b"), MemoryTier::ShortTerm).await.unwrap();
        f.clock.advance(Duration::seconds(1));

        // touch a, so b becomes least recently used
        f.memory.read(&[1.0, 0.0, 0.0, 0.0], None, 1).await.unwrap();
        f.clock.advance(Duration::seconds(1));

        let c = f.memory.write(rec([0.0, 0.0, 1.0, 0.0], "c"), MemoryTier::ShortTerm).await.unwrap();
        assert!(f.memory.get(a.id).await.is_some());
        assert!(f.memory.get(b.id).await.is_none());
        assert!(f.memory.get(c.id).await.is_some());
        assert_eq!(f.memory.stats().await.short_term, 2);

        let evicted = f.audit.events_of(AuditEventType::MemoryEvicted);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].entity_id, b.id.to_string());
        assert!(evicted[0].detail.contains("short_term"));
    }

    #[tokio::test]
    async fn test_full_mtm_demotes_lru_to_stm() {
        let f = fixture(small());
        let a = f.memory.write(rec([1.0, 0.0, 0.0, 0.0], "a"), MemoryTier::MediumTerm).await.unwrap();
        f.clock.advance(Duration::seconds(1));
        f.memory.write(rec([0.0, 1.0, 0.0, 0.0], "b"), MemoryTier::MediumTerm).await.unwrap();
        f.clock.advance(Duration::seconds(1));
        f.memory.write(rec([0.0, 0.0, 1.0, 0.0], "c"), MemoryTier::MediumTerm).await.unwrap();

        assert_eq!(f.memory.get(a.id).await.unwrap().tier, MemoryTier::ShortTerm);
        let stats = f.memory.stats().await;
        assert_eq!((stats.short_term, stats.medium_term), (1, 2));
        assert_eq!(f.audit.events_of(AuditEventType::MemoryDemoted).len(), 1);
    }

    #[tokio::test]
    async fn test_ltm_eviction_tie_breaks() {
        let f = fixture(small());
        // same clock reading for all: same last access and creation time
        let a = f.memory.write(rec([1.0, 0.0, 0.0, 0.0], "a"), MemoryTier::LongTerm).await.unwrap();
        let b = f.memory.write(rec([0.0, 1.0, 0.0, 0.0], "b"), MemoryTier::LongTerm).await.unwrap();
        f.memory.write(rec([0.0, 0.0, 1.0, 0.0], "c"), MemoryTier::LongTerm).await.unwrap();

        // lowest id goes first
        assert!(f.memory.get(a.id).await.is_none());
        assert!(f.memory.get(b.id).await.is_some());
    }

    #[tokio::test]
    async fn test_promote_into_full_tiers_keeps_promoted_record() {
        let f = fixture(small());
        let x = f.memory.write(rec([1.0, 0.0, 0.0, 0.0], "x"), MemoryTier::ShortTerm).await.unwrap();
        f.clock.advance(Duration::seconds(1));
        f.memory.write(rec([0.0, 1.0, 0.0, 0.0], "s2"), MemoryTier::ShortTerm).await.unwrap();
        f.memory.write(rec([0.0, 0.0, 1.0, 0.0], "m1"), MemoryTier::MediumTerm).await.unwrap();
        f.memory.write(rec([0.0, 0.0, 0.0, 1.0], "m2"), MemoryTier::MediumTerm).await.unwrap();

        let promoted = f.memory.promote(x.id).await.unwrap();
        assert_eq!(promoted.tier, MemoryTier::MediumTerm);

        let stats = f.memory.stats().await;
        assert_eq!((stats.short_term, stats.medium_term), (2, 2));
        let all = f.memory.records(None).await;
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_promote_demote_bounds() {
        let f = fixture(MemoryConfig::default());
        let r = f.memory.write(rec([1.0, 0.0, 0.0, 0.0], "r"), MemoryTier::ShortTerm).await.unwrap();

        assert!(f.memory.demote(r.id).await.is_err());
        assert_eq!(f.memory.promote(r.id).await.unwrap().tier, MemoryTier::MediumTerm);
        assert_eq!(f.memory.promote(r.id).await.unwrap().tier, MemoryTier::LongTerm);
        assert!(f.memory.promote(r.id).await.is_err());
        assert_eq!(f.memory.demote(r.id).await.unwrap().tier, MemoryTier::MediumTerm);

        let err = f.memory.promote(MemoryId(999)).await.unwrap_err();
        assert!(err.is_not_found());

        // the index filter follows the tier
        let hits = f.memory.read(&[1.0, 0.0, 0.0, 0.0], Some(MemoryTier::MediumTerm), 1).await.unwrap();
        assert_eq!(hits[0].record.id, r.id);
    }

    #[tokio::test]
    async fn test_sweep_promotes_hot_and_evicts_idle() {
        let f = fixture(MemoryConfig::default());
        let hot = f.memory.write(rec([1.0, 0.0, 0.0, 0.0], "hot"), MemoryTier::ShortTerm).await.unwrap();
        let cold = f.memory.write(rec([0.0, 1.0, 0.0, 0.0], "cold"), MemoryTier::ShortTerm).await.unwrap();

        for _ in 0..3 {
            f.memory.read(&[1.0, 0.0, 0.0, 0.0], Some(MemoryTier::ShortTerm), 1).await.unwrap();
        }
        let report = f.memory.sweep().await.unwrap();
        assert_eq!(report.promoted, vec![(hot.id, MemoryTier::MediumTerm)]);
        assert!(report.evicted.is_empty());

        f.clock.advance(Duration::seconds(901));
        let report = f.memory.sweep().await.unwrap();
        assert_eq!(report.evicted, vec![(cold.id, MemoryTier::ShortTerm)]);
        assert_eq!(f.memory.get(hot.id).await.unwrap().tier, MemoryTier::MediumTerm);
    }

    #[tokio::test]
    async fn test_stale_hits_are_not_promoted() {
        let f = fixture(MemoryConfig::default());
        let r = f.memory.write(rec([1.0, 0.0, 0.0, 0.0], "r"), MemoryTier::ShortTerm).await.unwrap();
        for _ in 0..3 {
            f.memory.read(&[1.0, 0.0, 0.0, 0.0], None, 1).await.unwrap();
        }
        // outside the recency window but inside the TTL
        f.clock.advance(Duration::seconds(400));
        let report = f.memory.sweep().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(f.memory.get(r.id).await.unwrap().tier, MemoryTier::ShortTerm);
    }

    #[tokio::test]
    async fn test_never_accessed_record_is_never_promoted() {
        let f = fixture(MemoryConfig::default());
        let r = f.memory.write(rec([1.0, 0.0, 0.0, 0.0], "r"), MemoryTier::ShortTerm).await.unwrap();

        for _ in 0..20 {
            f.clock.advance(Duration::seconds(60));
            let report = f.memory.sweep().await.unwrap();
            assert!(report.promoted.is_empty());
        }
        assert!(f.memory.get(r.id).await.is_none());
        let evicted = f.audit.events_of(AuditEventType::MemoryEvicted);
        assert_eq!(evicted.len(), 1);
        assert!(f.audit.events_of(AuditEventType::MemoryPromoted).is_empty());
    }

    #[tokio::test]
    async fn test_mtm_sweep() {
        let f = fixture(MemoryConfig::default());
        let sustained = f.memory.write(rec([1.0, 0.0, 0.0, 0.0], "sustained"), MemoryTier::MediumTerm).await.unwrap();
        let idle = f.memory.write(rec([0.0, 1.0, 0.0, 0.0], "idle"), MemoryTier::MediumTerm).await.unwrap();

        f.clock.advance(Duration::seconds(86_401));
        for _ in 0..8 {
            f.memory.read(&[1.0, 0.0, 0.0, 0.0], None, 1).await.unwrap();
        }
        let report = f.memory.sweep().await.unwrap();
        assert_eq!(report.promoted, vec![(sustained.id, MemoryTier::LongTerm)]);
        assert_eq!(report.demoted, vec![(idle.id, MemoryTier::ShortTerm)]);
    }

    #[tokio::test]
    async fn test_remember_and_recall_use_embedder() {
        let f = fixture(MemoryConfig::default());
        let stored = f
            .memory
            .remember("ssh open on alpha", Provenance::agent("recon"), MemoryTier::ShortTerm)
            .await
            .unwrap();
        let hits = f.memory.recall("ssh open on alpha", None, 1).await.unwrap();
        assert_eq!(hits[0].record.id, stored.id);

        let peeked = f.memory.peek("ssh open on alpha", None, 1).await.unwrap();
        assert_eq!(peeked[0].record.access_count, 1);
    }

    #[tokio::test]
    async fn test_write_through_and_reload() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let f = fixture(MemoryConfig::default());
        let memory = TieredMemory::new(
            MemoryConfig::default(),
            VectorIndex::new(DIMS, Similarity::Cosine),
            Arc::new(HashingEmbedder::new(DIMS)),
        )
        .with_db(db.clone())
        .with_clock(f.clock.clone());

        let a = memory.write(rec([1.0, 0.0, 0.0, 0.0], "a"), MemoryTier::ShortTerm).await.unwrap();
        let b = memory.write(rec([0.0, 1.0, 0.0, 0.0], "b"), MemoryTier::ShortTerm).await.unwrap();
        memory.promote(b.id).await.unwrap();
        memory.read(&[1.0, 0.0, 0.0, 0.0], None, 1).await.unwrap();

        let reloaded = TieredMemory::new(
            MemoryConfig::default(),
            VectorIndex::new(DIMS, Similarity::Cosine),
            Arc::new(HashingEmbedder::new(DIMS)),
        )
        .with_db(db.clone());
        assert_eq!(reloaded.load_from_db().await.unwrap(), 2);
        assert_eq!(reloaded.get(a.id).await.unwrap().access_count, 1);
        assert_eq!(reloaded.get(b.id).await.unwrap().tier, MemoryTier::MediumTerm);

        let c = reloaded.write(rec([0.0, 0.0, 1.0, 0.0], "c"), MemoryTier::ShortTerm).await.unwrap();
        assert!(c.id > b.id);
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_tiers_consistent() {
        let f = fixture(MemoryConfig {
            stm_capacity: 8,
            mtm_capacity: 8,
            ltm_capacity: 8,
            ..Default::default()
        });

        let mut handles = Vec::new();
        for i in 0..60u32 {
            let memory = f.memory.clone();
            handles.push(tokio::spawn(async move {
                let tier = MemoryTier::ALL[(i % 3) as usize];
                let v = [1.0, i as f32, 0.5, 0.25];
                memory.write(rec(v, "x"), tier).await.unwrap();
                if i % 4 == 0 {
                    memory.read(&v, None, 3).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let stats = f.memory.stats().await;
        assert!(stats.short_term <= 8 && stats.medium_term <= 8 && stats.long_term <= 8);

        let records = f.memory.records(None).await;
        assert_eq!(records.len(), stats.total());
        for tier in MemoryTier::ALL {
            let hits = f.memory.read(&[1.0, 0.0, 0.5, 0.25], Some(tier), 100).await.unwrap();
            assert_eq!(hits.len(), stats.get(tier));
            assert!(hits.iter().all(|h| h.record.tier == tier));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reads_racing_evictions_keep_database_in_sync() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let memory = Arc::new(
            TieredMemory::new(
                small(),
                VectorIndex::new(DIMS, Similarity::Cosine),
                Arc::new(HashingEmbedder::new(DIMS)),
            )
            .with_db(db.clone()),
        );

        let writer = {
            let memory = memory.clone();
            tokio::spawn(async move {
                for i in 0..200u32 {
                    memory
                        .write(rec([1.0, i as f32, 0.0, 0.0], "w"), MemoryTier::ShortTerm)
                        .await
                        .unwrap();
                }
            })
        };
        let reader = {
            let memory = memory.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    memory.read(&[1.0, 1.0, 0.0, 0.0], None, 2).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        writer.await.unwrap();
        reader.await.unwrap();

        let key = |r: &MemoryRecord| (r.id, r.tier, r.access_count);
        let in_memory: Vec<_> = memory.records(None).await.iter().map(key).collect();
        let mut persisted: Vec<_> = db.list_memory_records(None).unwrap().iter().map(key).collect();
        persisted.sort();
        assert_eq!(in_memory.len(), 2);
        assert_eq!(persisted, in_memory);
    }

    #[tokio::test]
    async fn test_evict_removes_record_and_row() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let memory = TieredMemory::new(
            MemoryConfig::default(),
            VectorIndex::new(DIMS, Similarity::Cosine),
            Arc::new(HashingEmbedder::new(DIMS)),
        )
        .with_db(db.clone());

        let a = memory.write(rec([1.0, 0.0, 0.0, 0.0], "a"), MemoryTier::ShortTerm).await.unwrap();
        let evicted = memory.evict(a.id, "discarded").await.unwrap();
        assert_eq!(evicted.id, a.id);
        assert!(memory.get(a.id).await.is_none());
        assert!(db.get_memory_record(a.id).unwrap().is_none());
        assert_eq!(memory.stats().await.total(), 0);
        assert!(memory.evict(a.id, "discarded").await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_with_unbounded_ttl() {
        let f = fixture(MemoryConfig {
            mtm_ttl_secs: u64::MAX,
            ..Default::default()
        });
        let a = f.memory.write(rec([1.0, 0.0, 0.0, 0.0], "a"), MemoryTier::MediumTerm).await.unwrap();
        f.clock.advance(Duration::days(365));
        f.memory.sweep().await.unwrap();
        assert_eq!(f.memory.get(a.id).await.unwrap().tier, MemoryTier::MediumTerm);
    }
}
