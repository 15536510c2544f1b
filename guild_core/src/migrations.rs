//! Versioned schema changes, applied once at startup before anything loads.

use rusqlite::params;
use thiserror::Error;

use crate::model::now_millis;
use crate::pool::{ConnectionPool, PoolError};

pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

const VERSION_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    applied_at INTEGER NOT NULL
);
";

// Uniqueness of names lives in the registry. Cross-guild rows (claims,
// members) are keyed by their natural key so reordered jobs of different
// guilds converge on the latest owner.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "core_tables",
        sql: "
CREATE TABLE IF NOT EXISTS guilds (
    id INTEGER PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    balance_cache INTEGER NOT NULL DEFAULT 0,
    level INTEGER NOT NULL DEFAULT 1,
    exp INTEGER NOT NULL DEFAULT 0,
    pvp_enabled INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_guilds_name ON guilds(name);

CREATE TABLE IF NOT EXISTS members (
    player_id TEXT PRIMARY KEY NOT NULL,
    guild_id INTEGER NOT NULL,
    rank_ordinal INTEGER NOT NULL,
    joined_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_members_guild ON members(guild_id);

CREATE TABLE IF NOT EXISTS ranks (
    guild_id INTEGER NOT NULL,
    ordinal INTEGER NOT NULL,
    name TEXT NOT NULL,
    permissions INTEGER NOT NULL,
    PRIMARY KEY (guild_id, ordinal)
);

CREATE TABLE IF NOT EXISTS claims (
    world TEXT NOT NULL,
    x INTEGER NOT NULL,
    z INTEGER NOT NULL,
    guild_id INTEGER NOT NULL,
    claimed_at INTEGER NOT NULL,
    PRIMARY KEY (world, x, z)
);
CREATE INDEX IF NOT EXISTS idx_claims_guild ON claims(guild_id);

CREATE TABLE IF NOT EXISTS ledger (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guild_id INTEGER NOT NULL,
    delta INTEGER NOT NULL,
    reason TEXT NOT NULL,
    actor TEXT,
    ts INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ledger_guild ON ledger(guild_id);
",
    },
    Migration {
        version: 2,
        name: "guild_sequences",
        sql: "
CREATE TABLE IF NOT EXISTS guild_sequences (
    guild_id INTEGER PRIMARY KEY NOT NULL,
    last_sequence INTEGER NOT NULL,
    retired INTEGER NOT NULL DEFAULT 0
);
",
    },
    Migration {
        version: 3,
        name: "invites_and_upgrades",
        sql: "
CREATE TABLE IF NOT EXISTS invites (
    guild_id INTEGER NOT NULL,
    player_id TEXT NOT NULL,
    invited_at INTEGER NOT NULL,
    PRIMARY KEY (guild_id, player_id)
);

CREATE TABLE IF NOT EXISTS upgrades (
    guild_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    level INTEGER NOT NULL,
    PRIMARY KEY (guild_id, name)
);
",
    },
    Migration {
        version: 4,
        name: "homes",
        sql: "
CREATE TABLE IF NOT EXISTS homes (
    guild_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    world TEXT NOT NULL,
    x REAL NOT NULL,
    y REAL NOT NULL,
    z REAL NOT NULL,
    yaw REAL NOT NULL DEFAULT 0,
    pitch REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (guild_id, name)
);
",
    },
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("schema bookkeeping failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration {version} ({name}) failed: {source}")]
    Failed {
        version: u32,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("database schema version {found} is newer than supported version {supported}")]
    NewerSchema { found: u32, supported: u32 },
}

pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Brings the schema up to date. Any failure is fatal for startup.
pub fn run_migrations(pool: &ConnectionPool) -> Result<u32, MigrationError> {
    run_migration_list(pool, MIGRATIONS)
}

fn run_migration_list(pool: &ConnectionPool, migrations: &[Migration]) -> Result<u32, MigrationError> {
    let mut conn = pool.acquire()?;
    conn.execute_batch(VERSION_TABLE)?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    let supported = migrations.iter().map(|m| m.version).max().unwrap_or(0);
    if current > supported {
        return Err(MigrationError::NewerSchema {
            found: current,
            supported,
        });
    }

    let mut applied = current;
    for migration in migrations.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|source| MigrationError::Failed {
                version: migration.version,
                name: migration.name,
                source,
            })?;
        tx.execute(
            "INSERT INTO schema_version (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, now_millis() as i64],
        )?;
        tx.commit()?;
        applied = migration.version;
        tracing::info!(
            target: "guilds::store",
            version = migration.version,
            name = migration.name,
            "schema.migration_applied"
        );
    }

    if applied == current {
        tracing::info!(target: "guilds::store", version = current, "schema.up_to_date");
    }
    Ok(applied)
}
