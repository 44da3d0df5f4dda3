//! SQLite storage implementation
//!
//! Typed operations over the persistent store; no other module issues
//! SQL. Uses separate reader/writer connections for interior mutability,
//! so all methods take `&self` and the store is `Send + Sync` behind an
//! `Arc`. The HNSW index shadows the `memories` table and is rebuilt
//! from it on open, so index/commit divergence cannot survive a restart.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use uuid::Uuid;

use crate::associations::{AssociationEdge, MemoryHub};
use crate::embeddings::{vector_from_bytes, vector_to_bytes};
use crate::error::{CoreError, Result};
use crate::handshake::{GhostContext, GhostLog, Reflection};
use crate::memory::{Memory, MemoryMetadata, PHI_MAX, Tier};
use crate::resonance::ResonanceStats;
use crate::search::VectorIndex;
use crate::tier::TierPromotion;

/// Column list shared by every memory SELECT
const MEMORY_COLUMNS: &str = "id, content, content_hash, tier, tier_last_updated, access_count, \
     last_accessed, accessed_in_conversation_ids, category, tags, source, metadata, \
     conversation_id, resonance_phi, is_catalyst, created_at, updated_at, deleted_at";

/// Over-fetch multiplier for similarity candidates, so post-filters
/// (liveness, tier, exclusion) do not starve the caller
const CANDIDATE_OVERFETCH: usize = 4;

/// Input for a memory insert
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub id: String,
    pub content: String,
    pub content_hash: String,
    pub embedding: Vec<f32>,
    pub tier: Tier,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub metadata: MemoryMetadata,
    pub conversation_id: Option<String>,
    pub resonance_phi: f64,
    pub is_catalyst: bool,
}

/// Storage port over SQLite plus the in-process HNSW index
pub struct SqliteStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    index: Mutex<VectorIndex>,
}

fn lock_poisoned(which: &str) -> CoreError {
    CoreError::StorageFailed(rusqlite::Error::ModuleError(format!(
        "{} lock poisoned",
        which
    )))
}

impl SqliteStore {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) the store at the given path.
    ///
    /// With no path, a platform data directory is used.
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("dev", "resona", "core").ok_or_else(|| {
                    CoreError::InvalidInput("could not determine data directory".into())
                })?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir).map_err(|e| {
                    CoreError::InvalidInput(format!("cannot create data dir: {}", e))
                })?;
                data_dir.join("resona.db")
            }
        };

        let writer = Connection::open(&path)?;
        Self::configure_connection(&writer)?;
        super::migrations::apply_migrations(&writer)?;

        let reader = Connection::open(&path)?;
        Self::configure_connection(&reader)?;

        Self::build(writer, reader)
    }

    /// Open a throwaway in-memory store (shared-cache so both
    /// connections see the same database)
    pub fn open_in_memory() -> Result<Self> {
        let uri = format!("file:resona-{}?mode=memory&cache=shared", Uuid::new_v4());
        let writer = Connection::open(&uri)?;
        Self::configure_connection(&writer)?;
        super::migrations::apply_migrations(&writer)?;

        let reader = Connection::open(&uri)?;
        Self::configure_connection(&reader)?;

        Self::build(writer, reader)
    }

    fn build(writer: Connection, reader: Connection) -> Result<Self> {
        let mut index = VectorIndex::new()
            .map_err(|e| CoreError::StorageFailed(rusqlite::Error::ModuleError(e.to_string())))?;

        {
            let mut stmt =
                writer.prepare("SELECT id, embedding FROM memories WHERE deleted_at IS NULL")?;
            let rows: Vec<(String, Vec<u8>)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            for (id, blob) in rows {
                match vector_from_bytes(&blob) {
                    Some(vector) => {
                        if let Err(e) = index.add(&id, &vector) {
                            tracing::warn!(memory_id = %id, error = %e, "failed to index embedding");
                        }
                    }
                    None => tracing::warn!(memory_id = %id, "malformed embedding blob skipped"),
                }
            }
        }

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            index: Mutex::new(index),
        })
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader.lock().map_err(|_| lock_poisoned("reader"))
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer.lock().map_err(|_| lock_poisoned("writer"))
    }

    fn index(&self) -> Result<std::sync::MutexGuard<'_, VectorIndex>> {
        self.index.lock().map_err(|_| lock_poisoned("index"))
    }

    // ========================================================================
    // ROW MAPPING
    // ========================================================================

    fn parse_tier(raw: &str) -> rusqlite::Result<Tier> {
        raw.parse::<Tier>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })
    }

    fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
        let tier_raw: String = row.get("tier")?;
        let conversations_json: String = row.get("accessed_in_conversation_ids")?;
        let tags_json: String = row.get("tags")?;
        let metadata_json: String = row.get("metadata")?;

        Ok(Memory {
            id: row.get("id")?,
            content: row.get("content")?,
            content_hash: row.get("content_hash")?,
            tier: Self::parse_tier(&tier_raw)?,
            tier_last_updated: row.get("tier_last_updated")?,
            access_count: row.get("access_count")?,
            last_accessed: row.get("last_accessed")?,
            accessed_in_conversation_ids: serde_json::from_str(&conversations_json)
                .unwrap_or_default(),
            category: row.get("category")?,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            source: row.get("source")?,
            metadata: MemoryMetadata::from_json(&metadata_json),
            conversation_id: row.get("conversation_id")?,
            resonance_phi: row.get("resonance_phi")?,
            is_catalyst: row.get("is_catalyst")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            deleted_at: row.get("deleted_at")?,
        })
    }

    // ========================================================================
    // MEMORIES
    // ========================================================================

    /// Insert a new memory row and index its embedding
    pub fn insert_memory(&self, new: NewMemory) -> Result<Memory> {
        let now = Utc::now();
        let tags_json = serde_json::to_string(&new.tags).unwrap_or_else(|_| "[]".into());
        let conversations = match &new.conversation_id {
            Some(c) => serde_json::to_string(&[c]).unwrap_or_else(|_| "[]".into()),
            None => "[]".to_string(),
        };

        {
            let writer = self.writer()?;
            writer.execute(
                "INSERT INTO memories
                    (id, content, content_hash, embedding, tier, tier_last_updated,
                     access_count, last_accessed, accessed_in_conversation_ids,
                     category, tags, source, metadata, conversation_id,
                     resonance_phi, is_catalyst, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    new.id,
                    new.content,
                    new.content_hash,
                    vector_to_bytes(&new.embedding),
                    new.tier.as_str(),
                    now,
                    now,
                    conversations,
                    new.category,
                    tags_json,
                    new.source,
                    new.metadata.to_json(),
                    new.conversation_id,
                    new.resonance_phi,
                    new.is_catalyst,
                    now,
                    now,
                ],
            )?;
        }

        if let Err(e) = self.index()?.add(&new.id, &new.embedding) {
            tracing::warn!(memory_id = %new.id, error = %e, "failed to index new memory");
        }

        self.get_memory(&new.id)?
            .ok_or_else(|| CoreError::MemoryNotFound(new.id.clone()))
    }

    /// Fetch a memory regardless of deletion state
    pub fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"
        ))?;
        let memory = stmt
            .query_row(params![id], Self::row_to_memory)
            .optional()?;
        Ok(memory)
    }

    /// Fetch a live memory
    pub fn get_live_memory(&self, id: &str) -> Result<Option<Memory>> {
        Ok(self.get_memory(id)?.filter(|m| m.is_live()))
    }

    /// Exact-dedup lookup among live memories
    pub fn find_live_by_hash(&self, content_hash: &str) -> Result<Option<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE content_hash = ?1 AND deleted_at IS NULL"
        ))?;
        let memory = stmt
            .query_row(params![content_hash], Self::row_to_memory)
            .optional()?;
        Ok(memory)
    }

    /// Dedup hit path: bump access count and timestamps, leave phi alone
    pub fn touch_exact_duplicate(
        &self,
        id: &str,
        conversation_id: Option<&str>,
    ) -> Result<Memory> {
        let now = Utc::now();
        {
            let writer = self.writer()?;
            let changed = writer.execute(
                "UPDATE memories SET
                    access_count = access_count + 1,
                    last_accessed = ?2,
                    updated_at = ?2,
                    accessed_in_conversation_ids = CASE
                        WHEN ?3 IS NULL THEN accessed_in_conversation_ids
                        ELSE json_insert(accessed_in_conversation_ids, '$[#]', ?3)
                    END
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, now, conversation_id],
            )?;
            if changed == 0 {
                return Err(CoreError::MemoryNotFound(id.to_string()));
            }
        }
        self.get_memory(id)?
            .ok_or_else(|| CoreError::MemoryNotFound(id.to_string()))
    }

    /// Touch a live memory's timestamps without changing its state
    pub fn touch_memory(&self, id: &str) -> Result<Memory> {
        let now = Utc::now();
        {
            let writer = self.writer()?;
            let changed = writer.execute(
                "UPDATE memories SET last_accessed = ?2, updated_at = ?2
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, now],
            )?;
            if changed == 0 {
                return Err(CoreError::MemoryNotFound(id.to_string()));
            }
        }
        self.get_memory(id)?
            .ok_or_else(|| CoreError::MemoryNotFound(id.to_string()))
    }

    /// Fetch the stored embedding for a memory
    pub fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let reader = self.reader()?;
        let blob: Option<Vec<u8>> = reader
            .query_row(
                "SELECT embedding FROM memories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.and_then(|b| vector_from_bytes(&b)))
    }

    /// Soft-delete a memory and drop it from the vector index
    pub fn soft_delete(&self, id: &str) -> Result<bool> {
        let now = Utc::now();
        let changed = {
            let writer = self.writer()?;
            writer.execute(
                "UPDATE memories SET deleted_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, now],
            )?
        };
        if changed > 0 {
            if let Err(e) = self.index()?.remove(id) {
                tracing::warn!(memory_id = %id, error = %e, "failed to unindex memory");
            }
        }
        Ok(changed > 0)
    }

    /// Live memories most similar to an embedding, best first.
    ///
    /// The HNSW index is over-fetched so liveness/tier/exclusion filters
    /// do not starve the caller; results are capped at `limit`.
    pub fn similar_memories(
        &self,
        embedding: &[f32],
        limit: usize,
        min_similarity: f32,
        exclude_id: Option<&str>,
        tiers: Option<&[Tier]>,
    ) -> Result<Vec<(Memory, f32)>> {
        let overfetch = limit.saturating_mul(CANDIDATE_OVERFETCH).max(32);
        let hits = {
            let index = self.index()?;
            index
                .search_with_threshold(embedding, overfetch, min_similarity)
                .map_err(|e| {
                    CoreError::StorageFailed(rusqlite::Error::ModuleError(e.to_string()))
                })?
        };

        let mut results = Vec::with_capacity(limit);
        for (id, similarity) in hits {
            if results.len() == limit {
                break;
            }
            if exclude_id == Some(id.as_str()) {
                continue;
            }
            let Some(memory) = self.get_memory(&id)? else {
                continue;
            };
            if !memory.is_live() {
                continue;
            }
            if let Some(allowed) = tiers {
                if !allowed.contains(&memory.tier) {
                    continue;
                }
            }
            results.push((memory, similarity));
        }
        Ok(results)
    }

    /// One batched access update for retrieval results: bump access
    /// count and phi (+0.1, clamped), touch `last_accessed`, append the
    /// conversation scope
    pub fn batch_update_access(&self, ids: &[String], conversation_id: Option<&str>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE memories SET
                access_count = access_count + 1,
                resonance_phi = MIN(resonance_phi + 0.1, {PHI_MAX}),
                last_accessed = ?1,
                updated_at = ?1,
                accessed_in_conversation_ids = CASE
                    WHEN ?2 IS NULL THEN accessed_in_conversation_ids
                    ELSE json_insert(accessed_in_conversation_ids, '$[#]', ?2)
                END
             WHERE deleted_at IS NULL AND id IN ({placeholders})"
        );

        let mut values: Vec<Value> = Vec::with_capacity(ids.len() + 2);
        values.push(Value::Text(now.to_rfc3339()));
        values.push(match conversation_id {
            Some(c) => Value::Text(c.to_string()),
            None => Value::Null,
        });
        values.extend(ids.iter().map(|id| Value::Text(id.clone())));

        let writer = self.writer()?;
        writer.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    /// Tiered bootstrap snapshot in a single windowed query.
    ///
    /// All `active` rows (unbounded, recency order), then
    /// `ceil(0.7 * remaining)` thread rows and `floor(0.3 * remaining)`
    /// stable rows by phi with access/recency fallback, where
    /// `remaining = max(limit - |active|, 0)`.
    pub fn bootstrap_rows(
        &self,
        limit: i64,
        include_active: bool,
        include_thread: bool,
        include_stable: bool,
    ) -> Result<Vec<Memory>> {
        let sql = format!(
            "WITH live AS (
                SELECT {MEMORY_COLUMNS} FROM memories WHERE deleted_at IS NULL
            ),
            lims AS (
                SELECT MAX(?1 - CASE WHEN ?2 THEN
                    (SELECT COUNT(*) FROM live WHERE tier = 'active') ELSE 0 END, 0) AS remaining
            ),
            ranked AS (
                SELECT live.*, ROW_NUMBER() OVER (
                    PARTITION BY tier
                    ORDER BY
                        CASE WHEN tier = 'active' THEN last_accessed END DESC,
                        resonance_phi DESC,
                        access_count DESC,
                        last_accessed DESC
                ) AS rn
                FROM live
                WHERE tier IN ('active', 'thread', 'stable')
            )
            SELECT {MEMORY_COLUMNS} FROM ranked, lims
            WHERE (tier = 'active' AND ?2)
               OR (tier = 'thread' AND ?3 AND rn <= (remaining * 7 + 9) / 10)
               OR (tier = 'stable' AND ?4 AND rn <= (remaining * 3) / 10)
            ORDER BY CASE tier WHEN 'active' THEN 0 WHEN 'thread' THEN 1 ELSE 2 END, rn"
        );

        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![limit, include_active, include_thread, include_stable],
                Self::row_to_memory,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Number of live memories
    pub fn count_live(&self) -> Result<i64> {
        let reader = self.reader()?;
        let count = reader.query_row(
            "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Bounded sample of live embeddings for diagnostic scans
    pub fn live_embeddings(&self, cap: usize) -> Result<Vec<(String, Vec<f32>)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, embedding FROM memories WHERE deleted_at IS NULL
             ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows: Vec<(String, Vec<u8>)> = stmt
            .query_map(params![cap as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, blob)| vector_from_bytes(&blob).map(|v| (id, v)))
            .collect())
    }

    // ========================================================================
    // TIERS
    // ========================================================================

    /// Rows among `ids` that clear the given per-tier access thresholds
    pub fn promotion_candidates(
        &self,
        ids: &[String],
        active_threshold: i64,
        thread_threshold: i64,
    ) -> Result<Vec<Memory>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE deleted_at IS NULL
               AND ((tier = 'active' AND access_count >= ?1)
                 OR (tier = 'thread' AND access_count >= ?2))
               AND id IN ({placeholders})"
        );

        let mut values: Vec<Value> = Vec::with_capacity(ids.len() + 2);
        values.push(Value::Integer(active_threshold));
        values.push(Value::Integer(thread_threshold));
        values.extend(ids.iter().map(|id| Value::Text(id.clone())));

        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), Self::row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Apply a batch of promotions and their audit rows in one transaction
    pub fn apply_promotions(&self, promotions: &[TierPromotion]) -> Result<()> {
        if promotions.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        for promo in promotions {
            tx.execute(
                "UPDATE memories SET tier = ?2, tier_last_updated = ?3, updated_at = ?3
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![promo.memory_id, promo.to_tier.as_str(), promo.created_at],
            )?;
            tx.execute(
                "INSERT INTO tier_promotions
                    (id, memory_id, from_tier, to_tier, reason,
                     access_count_at_promotion, days_since_last_access, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    promo.id,
                    promo.memory_id,
                    promo.from_tier.as_str(),
                    promo.to_tier.as_str(),
                    promo.reason,
                    promo.access_count_at_promotion,
                    promo.days_since_last_access,
                    promo.created_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Promotion audit rows for a memory, oldest first
    pub fn promotions_for(&self, memory_id: &str) -> Result<Vec<TierPromotion>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, memory_id, from_tier, to_tier, reason,
                    access_count_at_promotion, days_since_last_access, created_at
             FROM tier_promotions WHERE memory_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![memory_id], |row| {
                let from_raw: String = row.get("from_tier")?;
                let to_raw: String = row.get("to_tier")?;
                Ok(TierPromotion {
                    id: row.get("id")?,
                    memory_id: row.get("memory_id")?,
                    from_tier: Self::parse_tier(&from_raw)?,
                    to_tier: Self::parse_tier(&to_raw)?,
                    reason: row.get("reason")?,
                    access_count_at_promotion: row.get("access_count_at_promotion")?,
                    days_since_last_access: row.get("days_since_last_access")?,
                    created_at: row.get("created_at")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // RESONANCE
    // ========================================================================

    /// Phi adjustment for one access: +1.0 catalyst / +0.1 otherwise,
    /// clamped at the ceiling, with the access log row in the same
    /// transaction. Returns `(new_phi, capped)`.
    pub fn adjust_resonance(&self, id: &str, is_catalyst: bool) -> Result<(f64, bool)> {
        let now = Utc::now();
        let increment = if is_catalyst { 1.0 } else { 0.1 };

        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let phi: Option<f64> = tx
            .query_row(
                "SELECT resonance_phi FROM memories WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(phi) = phi else {
            return Err(CoreError::MemoryNotFound(id.to_string()));
        };

        let raw = phi + increment;
        let capped = raw > PHI_MAX;
        let new_phi = raw.min(PHI_MAX);

        tx.execute(
            "UPDATE memories SET
                resonance_phi = ?2,
                is_catalyst = MAX(is_catalyst, ?3),
                last_accessed = ?4,
                updated_at = ?4
             WHERE id = ?1",
            params![id, new_phi, is_catalyst, now],
        )?;
        tx.execute(
            "INSERT INTO memory_access_log (memory_id, accessed_at) VALUES (?1, ?2)",
            params![id, now],
        )?;
        tx.commit()?;

        Ok((new_phi, capped))
    }

    /// Set the catalyst flag (monotone; never unset). Returns whether
    /// the flag was newly set.
    pub fn mark_catalyst(&self, id: &str) -> Result<bool> {
        let now = Utc::now();
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE memories SET is_catalyst = 1, updated_at = ?2
             WHERE id = ?1 AND deleted_at IS NULL AND is_catalyst = 0",
            params![id, now],
        )?;
        Ok(changed > 0)
    }

    /// Access-log entries for a memory since `since`
    pub fn recent_access_count(&self, id: &str, since: DateTime<Utc>) -> Result<i64> {
        let reader = self.reader()?;
        let count = reader.query_row(
            "SELECT COUNT(*) FROM memory_access_log
             WHERE memory_id = ?1 AND accessed_at >= ?2",
            params![id, since],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Number of association edges incident to a memory
    pub fn association_degree(&self, id: &str) -> Result<i64> {
        let reader = self.reader()?;
        let count = reader.query_row(
            "SELECT COUNT(*) FROM memory_associations
             WHERE memory_a = ?1 OR memory_b = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Drop access-log entries older than the cutoff
    pub fn cleanup_access_log(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let writer = self.writer()?;
        let deleted = writer.execute(
            "DELETE FROM memory_access_log WHERE accessed_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    /// Decay sweep: 5% phi reduction for live rows inactive since the
    /// cutoff with phi above the floor. Returns `(count, total_delta)`.
    pub fn decay_sweep(&self, inactive_cutoff: DateTime<Utc>, phi_floor: f64) -> Result<(usize, f64)> {
        let now = Utc::now();
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let (count, total_delta): (i64, f64) = tx.query_row(
            "SELECT COUNT(*), COALESCE(SUM(resonance_phi * 0.05), 0.0)
             FROM memories
             WHERE deleted_at IS NULL AND last_accessed < ?1 AND resonance_phi > ?2",
            params![inactive_cutoff, phi_floor],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        tx.execute(
            "UPDATE memories SET resonance_phi = resonance_phi * 0.95, updated_at = ?3
             WHERE deleted_at IS NULL AND last_accessed < ?1 AND resonance_phi > ?2",
            params![inactive_cutoff, phi_floor, now],
        )?;
        tx.commit()?;

        Ok((count as usize, total_delta))
    }

    /// Highest-phi catalysts
    pub fn top_catalysts(&self, limit: i64) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE deleted_at IS NULL AND is_catalyst = 1
             ORDER BY resonance_phi DESC, last_accessed DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit], Self::row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Aggregate resonance statistics over live memories
    pub fn resonance_stats(&self) -> Result<ResonanceStats> {
        let reader = self.reader()?;
        let (total, catalysts, avg_phi, max_phi): (i64, i64, f64, f64) = reader.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(is_catalyst), 0),
                    COALESCE(AVG(resonance_phi), 0.0),
                    COALESCE(MAX(resonance_phi), 0.0)
             FROM memories WHERE deleted_at IS NULL",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let mut stmt = reader.prepare(
            "SELECT tier, COUNT(*) FROM memories
             WHERE deleted_at IS NULL GROUP BY tier",
        )?;
        let mut by_tier = std::collections::HashMap::new();
        let pairs: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (tier_raw, count) in pairs {
            if let Ok(tier) = tier_raw.parse::<Tier>() {
                by_tier.insert(tier, count);
            }
        }

        Ok(ResonanceStats {
            total_memories: total,
            catalyst_count: catalysts,
            average_phi: avg_phi,
            max_phi,
            by_tier,
        })
    }

    // ========================================================================
    // CONSOLIDATION
    // ========================================================================

    /// Merge an absorbed variant into a surviving memory and optionally
    /// soft-delete the absorbed row, all in one transaction.
    pub fn absorb_variant(
        &self,
        survivor_id: &str,
        absorbed_id: Option<&str>,
        variant: crate::memory::SemanticVariant,
    ) -> Result<Memory> {
        let now = Utc::now();
        {
            let mut writer = self.writer()?;
            let tx = writer.transaction()?;

            let row: Option<(f64, String)> = tx
                .query_row(
                    "SELECT resonance_phi, metadata FROM memories
                     WHERE id = ?1 AND deleted_at IS NULL",
                    params![survivor_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let Some((phi, metadata_json)) = row else {
                return Err(CoreError::MemoryNotFound(survivor_id.to_string()));
            };

            let new_phi = (phi + variant.phi_contributed).min(PHI_MAX);
            let was_catalyst = variant.was_catalyst;
            let mut metadata = MemoryMetadata::from_json(&metadata_json);
            metadata.semantic_variants.push(variant);

            tx.execute(
                "UPDATE memories SET
                    resonance_phi = ?2,
                    access_count = access_count + 1,
                    last_accessed = ?3,
                    updated_at = ?3,
                    is_catalyst = MAX(is_catalyst, ?4),
                    metadata = ?5
                 WHERE id = ?1",
                params![survivor_id, new_phi, now, was_catalyst, metadata.to_json()],
            )?;

            if let Some(absorbed) = absorbed_id {
                tx.execute(
                    "UPDATE memories SET deleted_at = ?2, updated_at = ?2
                     WHERE id = ?1 AND deleted_at IS NULL",
                    params![absorbed, now],
                )?;
            }
            tx.commit()?;
        }

        if let Some(absorbed) = absorbed_id {
            if let Err(e) = self.index()?.remove(absorbed) {
                tracing::warn!(memory_id = %absorbed, error = %e, "failed to unindex absorbed memory");
            }
        }

        self.get_memory(survivor_id)?
            .ok_or_else(|| CoreError::MemoryNotFound(survivor_id.to_string()))
    }

    // ========================================================================
    // ASSOCIATIONS
    // ========================================================================

    /// One batched co-occurrence upsert. Pairs must already be
    /// canonically ordered, deduplicated, and chunked to at most 1 000.
    pub fn upsert_co_occurrence_batch(
        &self,
        pairs: &[(String, String)],
        conversation_id: Option<&str>,
    ) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        debug_assert!(pairs.len() <= 1_000);

        let now = Utc::now();
        let contexts = match conversation_id {
            Some(c) => serde_json::to_string(&[c]).unwrap_or_else(|_| "[]".into()),
            None => "[]".to_string(),
        };

        let rows_sql = pairs
            .iter()
            .map(|_| "(?, ?, 1, 1.0, ?, ?, ?)")
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO memory_associations
                (memory_a, memory_b, co_occurrence_count, strength,
                 conversation_contexts, first_co_occurred_at, last_co_occurred_at)
             VALUES {rows_sql}
             ON CONFLICT(memory_a, memory_b) DO UPDATE SET
                co_occurrence_count = memory_associations.co_occurrence_count + 1,
                strength = ln(2.0 + memory_associations.co_occurrence_count) / 10.0,
                conversation_contexts = CASE
                    WHEN excluded.conversation_contexts = '[]'
                        THEN memory_associations.conversation_contexts
                    ELSE json_insert(memory_associations.conversation_contexts, '$[#]',
                                     json_extract(excluded.conversation_contexts, '$[0]'))
                END,
                last_co_occurred_at = excluded.last_co_occurred_at"
        );

        let now_text = now.to_rfc3339();
        let mut values: Vec<Value> = Vec::with_capacity(pairs.len() * 5);
        for (a, b) in pairs {
            values.push(Value::Text(a.clone()));
            values.push(Value::Text(b.clone()));
            values.push(Value::Text(contexts.clone()));
            values.push(Value::Text(now_text.clone()));
            values.push(Value::Text(now_text.clone()));
        }

        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        tx.execute(&sql, params_from_iter(values))?;
        tx.commit()?;
        Ok(())
    }

    /// Edges incident to a memory above a strength floor, strongest
    /// first, other endpoint live
    pub fn discover_associations(
        &self,
        memory_id: &str,
        min_strength: f64,
        limit: i64,
    ) -> Result<Vec<AssociationEdge>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT a.memory_a, a.memory_b, a.co_occurrence_count, a.strength,
                    a.conversation_contexts, a.first_co_occurred_at, a.last_co_occurred_at,
                    other.content, other.tier, other.resonance_phi
             FROM memory_associations a
             JOIN memories other
               ON other.id = CASE WHEN a.memory_a = ?1 THEN a.memory_b ELSE a.memory_a END
              AND other.deleted_at IS NULL
             WHERE (a.memory_a = ?1 OR a.memory_b = ?1) AND a.strength >= ?2
             ORDER BY a.strength DESC, a.co_occurrence_count DESC
             LIMIT ?3",
        )?;

        let rows = stmt
            .query_map(params![memory_id, min_strength, limit], |row| {
                let contexts_json: String = row.get("conversation_contexts")?;
                let tier_raw: String = row.get("tier")?;
                Ok(AssociationEdge {
                    memory_a: row.get("memory_a")?,
                    memory_b: row.get("memory_b")?,
                    co_occurrence_count: row.get("co_occurrence_count")?,
                    strength: row.get("strength")?,
                    conversation_contexts: serde_json::from_str(&contexts_json)
                        .unwrap_or_default(),
                    first_co_occurred_at: row.get("first_co_occurred_at")?,
                    last_co_occurred_at: row.get("last_co_occurred_at")?,
                    other_content: row.get("content")?,
                    other_tier: Self::parse_tier(&tier_raw)?,
                    other_phi: row.get("resonance_phi")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Aggregate degree and average strength across both endpoints;
    /// both endpoints must be live, so soft-deleted neighbours
    /// contribute no phantom degree
    pub fn find_hubs(&self, min_connections: i64, limit: i64) -> Result<Vec<MemoryHub>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "WITH live_edges AS (
                SELECT a.memory_a, a.memory_b, a.strength
                FROM memory_associations a
                JOIN memories ma ON ma.id = a.memory_a AND ma.deleted_at IS NULL
                JOIN memories mb ON mb.id = a.memory_b AND mb.deleted_at IS NULL
            ),
            endpoints AS (
                SELECT memory_a AS id, strength FROM live_edges
                UNION ALL
                SELECT memory_b AS id, strength FROM live_edges
            )
            SELECT m.id, m.content, m.tier, m.resonance_phi, m.is_catalyst,
                   COUNT(*) AS degree, AVG(e.strength) AS avg_strength
            FROM endpoints e
            JOIN memories m ON m.id = e.id
            GROUP BY m.id
            HAVING COUNT(*) >= ?1
            ORDER BY degree DESC, avg_strength DESC
            LIMIT ?2",
        )?;

        let rows = stmt
            .query_map(params![min_connections, limit], |row| {
                let tier_raw: String = row.get("tier")?;
                Ok(MemoryHub {
                    memory_id: row.get("id")?,
                    content: row.get("content")?,
                    tier: Self::parse_tier(&tier_raw)?,
                    resonance_phi: row.get("resonance_phi")?,
                    is_catalyst: row.get("is_catalyst")?,
                    connection_count: row.get("degree")?,
                    average_strength: row.get("avg_strength")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Synthesis-link upsert: new edges seed at strength 2.0, rewoven
    /// edges gain +1.0
    pub fn weave_link(&self, id_a: &str, id_b: &str, context: &str) -> Result<()> {
        let (a, b) = if id_a < id_b { (id_a, id_b) } else { (id_b, id_a) };
        if a == b {
            return Ok(());
        }
        let now = Utc::now();
        let contexts = serde_json::to_string(&[context]).unwrap_or_else(|_| "[]".into());

        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO memory_associations
                (memory_a, memory_b, co_occurrence_count, strength,
                 conversation_contexts, first_co_occurred_at, last_co_occurred_at)
             VALUES (?1, ?2, 1, 2.0, ?3, ?4, ?4)
             ON CONFLICT(memory_a, memory_b) DO UPDATE SET
                strength = memory_associations.strength + 1.0,
                co_occurrence_count = memory_associations.co_occurrence_count + 1,
                conversation_contexts = json_insert(
                    memory_associations.conversation_contexts, '$[#]', ?5),
                last_co_occurred_at = excluded.last_co_occurred_at",
            params![a, b, contexts, now, context],
        )?;
        Ok(())
    }

    // ========================================================================
    // FOLD SAMPLING
    // ========================================================================

    /// Highest-phi memory in the network tier
    pub fn top_network_memory(&self) -> Result<Option<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE deleted_at IS NULL AND tier = 'network'
             ORDER BY resonance_phi DESC, last_accessed DESC LIMIT 1"
        ))?;
        let memory = stmt.query_row([], Self::row_to_memory).optional()?;
        Ok(memory)
    }

    /// Memory maximising `phi * days_since_last_access` with phi above
    /// 1.0, excluding the given ids
    pub fn max_staleness_memory(&self, exclude: &[String]) -> Result<Option<Memory>> {
        let placeholders = if exclude.is_empty() {
            "''".to_string()
        } else {
            exclude.iter().map(|_| "?").collect::<Vec<_>>().join(",")
        };
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE deleted_at IS NULL AND resonance_phi > 1.0
               AND id NOT IN ({placeholders})
             ORDER BY resonance_phi * (julianday('now') - julianday(last_accessed)) DESC,
                      resonance_phi DESC
             LIMIT 1"
        );

        let values: Vec<Value> = exclude.iter().map(|id| Value::Text(id.clone())).collect();
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let memory = stmt
            .query_row(params_from_iter(values), Self::row_to_memory)
            .optional()?;
        Ok(memory)
    }

    /// Candidate pool for overtone sampling: live, phi above 1.0,
    /// excluding the given ids, phi-ranked, with embeddings
    pub fn overtone_candidates(
        &self,
        exclude: &[String],
        cap: usize,
    ) -> Result<Vec<(Memory, Vec<f32>)>> {
        let placeholders = if exclude.is_empty() {
            "''".to_string()
        } else {
            exclude.iter().map(|_| "?").collect::<Vec<_>>().join(",")
        };
        let sql = format!(
            "SELECT {MEMORY_COLUMNS}, embedding FROM memories
             WHERE deleted_at IS NULL AND resonance_phi > 1.0
               AND id NOT IN ({placeholders})
             ORDER BY resonance_phi DESC
             LIMIT {cap}"
        );

        let values: Vec<Value> = exclude.iter().map(|id| Value::Text(id.clone())).collect();
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                let memory = Self::row_to_memory(row)?;
                let blob: Vec<u8> = row.get("embedding")?;
                Ok((memory, blob))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(m, blob)| vector_from_bytes(&blob).map(|v| (m, v)))
            .collect())
    }

    /// Evolve a memory in place: new content, hash, embedding, phi
    /// increment, and an evolution-history entry, in one transaction
    pub fn evolve_memory(
        &self,
        id: &str,
        new_content: &str,
        new_hash: &str,
        new_embedding: &[f32],
        phi_delta: f64,
        entry: crate::memory::EvolutionEntry,
    ) -> Result<Memory> {
        let now = Utc::now();
        {
            let mut writer = self.writer()?;
            let tx = writer.transaction()?;

            let metadata_json: Option<String> = tx
                .query_row(
                    "SELECT metadata FROM memories WHERE id = ?1 AND deleted_at IS NULL",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(metadata_json) = metadata_json else {
                return Err(CoreError::MemoryNotFound(id.to_string()));
            };

            let mut metadata = MemoryMetadata::from_json(&metadata_json);
            metadata.evolution_history.push(entry);

            tx.execute(
                "UPDATE memories SET
                    content = ?2,
                    content_hash = ?3,
                    embedding = ?4,
                    resonance_phi = MIN(resonance_phi + ?5, ?6),
                    metadata = ?7,
                    updated_at = ?8
                 WHERE id = ?1",
                params![
                    id,
                    new_content,
                    new_hash,
                    vector_to_bytes(new_embedding),
                    phi_delta,
                    PHI_MAX,
                    metadata.to_json(),
                    now,
                ],
            )?;
            tx.commit()?;
        }

        if let Err(e) = self.index()?.add(id, new_embedding) {
            tracing::warn!(memory_id = %id, error = %e, "failed to reindex evolved memory");
        }

        self.get_memory(id)?
            .ok_or_else(|| CoreError::MemoryNotFound(id.to_string()))
    }

    /// Fold-created memories, newest first
    pub fn fold_history(&self, limit: i64) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE deleted_at IS NULL AND category = 'the_fold'
             ORDER BY created_at DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit], Self::row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // GHOSTS & REFLECTIONS
    // ========================================================================

    /// Persist a continuity snapshot
    pub fn insert_ghost(&self, ghost: &GhostLog) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO ghost_logs
                (id, prompt_text, top_phi_memories, top_phi_values, synthesis_method,
                 conversation_id, context_type, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                ghost.id,
                ghost.prompt_text,
                serde_json::to_string(&ghost.top_phi_memories).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&ghost.top_phi_values).unwrap_or_else(|_| "[]".into()),
                ghost.synthesis_method,
                ghost.conversation_id,
                ghost.context_type.as_str(),
                ghost.created_at,
                ghost.expires_at,
            ],
        )?;
        Ok(())
    }

    fn row_to_ghost(row: &rusqlite::Row) -> rusqlite::Result<GhostLog> {
        let memories_json: String = row.get("top_phi_memories")?;
        let values_json: String = row.get("top_phi_values")?;
        let context_raw: String = row.get("context_type")?;
        Ok(GhostLog {
            id: row.get("id")?,
            prompt_text: row.get("prompt_text")?,
            top_phi_memories: serde_json::from_str(&memories_json).unwrap_or_default(),
            top_phi_values: serde_json::from_str(&values_json).unwrap_or_default(),
            synthesis_method: row.get("synthesis_method")?,
            conversation_id: row.get("conversation_id")?,
            context_type: context_raw.parse::<GhostContext>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
                )
            })?,
            created_at: row.get("created_at")?,
            expires_at: row.get("expires_at")?,
        })
    }

    /// Most recent non-expired ghost for a conversation
    pub fn latest_conversation_ghost(&self, conversation_id: &str) -> Result<Option<GhostLog>> {
        let now = Utc::now();
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, prompt_text, top_phi_memories, top_phi_values, synthesis_method,
                    conversation_id, context_type, created_at, expires_at
             FROM ghost_logs
             WHERE conversation_id = ?1 AND expires_at > ?2
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let ghost = stmt
            .query_row(params![conversation_id, now], Self::row_to_ghost)
            .optional()?;
        Ok(ghost)
    }

    /// Most recent non-expired global ghost
    pub fn latest_global_ghost(&self) -> Result<Option<GhostLog>> {
        let now = Utc::now();
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, prompt_text, top_phi_memories, top_phi_values, synthesis_method,
                    conversation_id, context_type, created_at, expires_at
             FROM ghost_logs
             WHERE conversation_id IS NULL AND expires_at > ?1
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let ghost = stmt.query_row(params![now], Self::row_to_ghost).optional()?;
        Ok(ghost)
    }

    /// Whether a significant memory (catalyst or phi >= 4.0) landed in
    /// the given scope since `since`
    pub fn significant_change_since(
        &self,
        since: DateTime<Utc>,
        conversation_id: Option<&str>,
    ) -> Result<bool> {
        let reader = self.reader()?;
        let exists: i64 = reader.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM memories
                WHERE deleted_at IS NULL
                  AND created_at > ?1
                  AND (is_catalyst = 1 OR resonance_phi >= 4.0)
                  AND (?2 IS NULL OR conversation_id = ?2)
             )",
            params![since, conversation_id],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    /// Drop expired ghosts
    pub fn cleanup_expired_ghosts(&self) -> Result<usize> {
        let now = Utc::now();
        let writer = self.writer()?;
        let deleted = writer.execute("DELETE FROM ghost_logs WHERE expires_at < ?1", params![now])?;
        Ok(deleted)
    }

    /// Phi-ranked candidate pool for handshake synthesis. Global scope
    /// applies the phi >= 2 floor; conversation scope takes everything
    /// and lets the ranking boost sort it out.
    pub fn top_phi_candidates(
        &self,
        conversation_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE deleted_at IS NULL
               AND (?1 IS NOT NULL OR resonance_phi >= 2.0)
             ORDER BY resonance_phi DESC, last_accessed DESC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![conversation_id, limit], Self::row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Open research threads: active/thread-tier memories in the
    /// research_thread category
    pub fn research_threads(&self, limit: i64) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE deleted_at IS NULL
               AND category = 'research_thread'
               AND tier IN ('active', 'thread')
             ORDER BY resonance_phi DESC, last_accessed DESC
             LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit], Self::row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Persist a session reflection
    pub fn insert_reflection(&self, reflection: &Reflection) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO meta_reflections
                (id, reflection_type, conversation_id, metrics, insights,
                 recommendations, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                reflection.id,
                reflection.reflection_type,
                reflection.conversation_id,
                reflection.metrics.to_string(),
                serde_json::to_string(&reflection.insights).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&reflection.recommendations)
                    .unwrap_or_else(|_| "[]".into()),
                reflection.created_at,
            ],
        )?;
        Ok(())
    }

    fn row_to_reflection(row: &rusqlite::Row) -> rusqlite::Result<Reflection> {
        let metrics_json: String = row.get("metrics")?;
        let insights_json: String = row.get("insights")?;
        let recommendations_json: String = row.get("recommendations")?;
        Ok(Reflection {
            id: row.get("id")?,
            reflection_type: row.get("reflection_type")?,
            conversation_id: row.get("conversation_id")?,
            metrics: serde_json::from_str(&metrics_json)
                .unwrap_or(serde_json::Value::Object(Default::default())),
            insights: serde_json::from_str(&insights_json).unwrap_or_default(),
            recommendations: serde_json::from_str(&recommendations_json).unwrap_or_default(),
            created_at: row.get("created_at")?,
        })
    }

    /// Most recent reflection, preferring the conversation scope
    pub fn latest_reflection(&self, conversation_id: Option<&str>) -> Result<Option<Reflection>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, reflection_type, conversation_id, metrics, insights,
                    recommendations, created_at
             FROM meta_reflections
             ORDER BY (conversation_id IS NOT NULL AND conversation_id = ?1) DESC,
                      created_at DESC
             LIMIT 1",
        )?;
        let reflection = stmt
            .query_row(params![conversation_id], Self::row_to_reflection)
            .optional()?;
        Ok(reflection)
    }

    /// Fold-produced memories created after `since`, newest first
    pub fn fold_memories_since(
        &self,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE deleted_at IS NULL
               AND category = 'the_fold'
               AND source = 'autonomous_synthesis'
               AND (?1 IS NULL OR created_at > ?1)
             ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![since, limit], Self::row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // CONFIG
    // ========================================================================

    /// Typed numeric getter with a default
    pub fn get_config_number(&self, key: &str, default: f64) -> Result<f64> {
        let reader = self.reader()?;
        let raw: Option<String> = reader
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            None => Ok(default),
            Some(text) => text.parse::<f64>().map_err(|_| CoreError::ConfigInvalid {
                key: key.to_string(),
                value: text,
            }),
        }
    }

    /// Persist a numeric config value
    pub fn set_config_number(&self, key: &str, value: f64) -> Result<()> {
        self.set_config_text(key, &value.to_string())
    }

    /// Raw text getter
    pub fn get_config_text(&self, key: &str) -> Result<Option<String>> {
        let reader = self.reader()?;
        let raw = reader
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw)
    }

    /// Persist a raw text config value
    pub fn set_config_text(&self, key: &str, value: &str) -> Result<()> {
        let now = Utc::now();
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
