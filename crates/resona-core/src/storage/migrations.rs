//! Database migrations
//!
//! Schema migration definitions for the storage layer.

use rusqlite::Connection;

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: memories, associations, promotions, access log",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Handshake continuity: ghost logs and meta reflections",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Config key/value store for engine tunables",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: memories and the co-occurrence graph
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    embedding BLOB NOT NULL,

    tier TEXT NOT NULL DEFAULT 'active',
    tier_last_updated TEXT NOT NULL,

    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed TEXT NOT NULL,
    accessed_in_conversation_ids TEXT NOT NULL DEFAULT '[]',

    category TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    source TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    conversation_id TEXT,

    resonance_phi REAL NOT NULL DEFAULT 0.0
        CHECK (resonance_phi >= 0.0 AND resonance_phi <= 5.0),
    is_catalyst INTEGER NOT NULL DEFAULT 0,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

-- Exact-dedup identity holds among live rows only
CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_live_hash
    ON memories(content_hash) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_memories_live_tier
    ON memories(tier) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_memories_phi
    ON memories(resonance_phi DESC);
CREATE INDEX IF NOT EXISTS idx_memories_last_accessed
    ON memories(last_accessed);
CREATE INDEX IF NOT EXISTS idx_memories_category
    ON memories(category) WHERE deleted_at IS NULL;

-- FTS5 mirror of content
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    id,
    content,
    content='memories',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, id, content)
    VALUES (NEW.rowid, NEW.id, NEW.content);
END;

CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, id, content)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content);
END;

CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, id, content)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content);
    INSERT INTO memories_fts(rowid, id, content)
    VALUES (NEW.rowid, NEW.id, NEW.content);
END;

-- Undirected co-occurrence edges, canonically ordered
CREATE TABLE IF NOT EXISTS memory_associations (
    memory_a TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    memory_b TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    co_occurrence_count INTEGER NOT NULL DEFAULT 1
        CHECK (co_occurrence_count >= 1),
    strength REAL NOT NULL DEFAULT 1.0,
    conversation_contexts TEXT NOT NULL DEFAULT '[]',
    first_co_occurred_at TEXT NOT NULL,
    last_co_occurred_at TEXT NOT NULL,
    PRIMARY KEY (memory_a, memory_b),
    CHECK (memory_a < memory_b)
);

CREATE INDEX IF NOT EXISTS idx_associations_b ON memory_associations(memory_b);
CREATE INDEX IF NOT EXISTS idx_associations_strength
    ON memory_associations(strength DESC);

-- Append-only promotion audit
CREATE TABLE IF NOT EXISTS tier_promotions (
    id TEXT PRIMARY KEY,
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    from_tier TEXT NOT NULL,
    to_tier TEXT NOT NULL,
    reason TEXT NOT NULL,
    access_count_at_promotion INTEGER NOT NULL,
    days_since_last_access REAL NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_promotions_memory ON tier_promotions(memory_id);

-- Short-lived access trace for catalyst detection (24h retention)
CREATE TABLE IF NOT EXISTS memory_access_log (
    memory_id TEXT NOT NULL,
    accessed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_access_log_memory
    ON memory_access_log(memory_id, accessed_at);
CREATE INDEX IF NOT EXISTS idx_access_log_time
    ON memory_access_log(accessed_at);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);
"#;

/// V2: handshake continuity snapshots and session reflections
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS ghost_logs (
    id TEXT PRIMARY KEY,
    prompt_text TEXT NOT NULL,
    top_phi_memories TEXT NOT NULL DEFAULT '[]',
    top_phi_values TEXT NOT NULL DEFAULT '[]',
    synthesis_method TEXT NOT NULL DEFAULT 'standard',
    conversation_id TEXT,
    context_type TEXT NOT NULL DEFAULT 'global',
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ghosts_conversation
    ON ghost_logs(conversation_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_ghosts_context
    ON ghost_logs(context_type, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_ghosts_expiry ON ghost_logs(expires_at);

CREATE TABLE IF NOT EXISTS meta_reflections (
    id TEXT PRIMARY KEY,
    reflection_type TEXT NOT NULL,
    conversation_id TEXT,
    metrics TEXT NOT NULL DEFAULT '{}',
    insights TEXT NOT NULL DEFAULT '[]',
    recommendations TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reflections_conversation
    ON meta_reflections(conversation_id, created_at DESC);
"#;

/// V3: engine tunables
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Apply all pending migrations to a connection
pub fn apply_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    let current: u32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );
        conn.execute_batch(migration.up)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at)
             VALUES (?1, datetime('now'))",
            rusqlite::params![migration.version],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_cleanly_and_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        apply_migrations(&conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);

        // Canonical-order CHECK holds
        conn.execute_batch(
            "INSERT INTO memories (id, content, content_hash, embedding, tier_last_updated,
                                   last_accessed, created_at, updated_at)
             VALUES ('a', 'x', 'h1', x'00', '2026-01-01T00:00:00Z',
                     '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z'),
                    ('b', 'y', 'h2', x'00', '2026-01-01T00:00:00Z',
                     '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');",
        )
        .unwrap();

        let reversed = conn.execute(
            "INSERT INTO memory_associations
                 (memory_a, memory_b, first_co_occurred_at, last_co_occurred_at)
             VALUES ('b', 'a', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(reversed.is_err());
    }
}
