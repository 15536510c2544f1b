//! SQL side of the guild store: bulk load at startup and transactional batch
//! application for the flush workers.

use std::collections::BTreeMap;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, ToSql, TransactionBehavior};
use thiserror::Error;

use crate::job::{Mutation, PersistenceJob};
use crate::model::{ClaimKey, Guild, GuildHome, GuildId, GuildRow, Member, Permissions, PlayerId, Rank};
use crate::pool::{ConnectionPool, PoolError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("store call failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("guild {guild} received sequence {attempted} but {last_applied} is already applied")]
    SequenceConflict {
        guild: GuildId,
        last_applied: u64,
        attempted: u64,
    },
}

impl StoreError {
    /// Corruption quarantines a live guild instead of retrying.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::SequenceConflict { .. })
    }
}

/// Applies persistence jobs. Implemented by [`GuildRepository`]; the flush
/// workers only see this trait.
pub trait BatchWriter: Send + Sync {
    fn apply_batch(&self, job: &PersistenceJob) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct GuildSnapshot {
    pub guild: Guild,
    pub last_sequence: u64,
    /// The cached balance disagreed with the ledger and was replaced by the ledger sum.
    pub balance_repaired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceAudit {
    pub ledger_sum: i64,
    pub balance_cache: Option<i64>,
}

impl BalanceAudit {
    pub fn consistent(&self) -> bool {
        self.balance_cache.map_or(self.ledger_sum == 0, |cache| cache == self.ledger_sum)
    }
}

#[derive(Clone)]
pub struct GuildRepository {
    pool: ConnectionPool,
}

impl GuildRepository {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Reads every stored guild inside one read transaction.
    pub fn load_all(&self) -> Result<Vec<GuildSnapshot>, StoreError> {
        let mut conn = self.pool.acquire()?;
        let tx = conn.transaction()?;

        let mut guilds = load_guild_rows(&tx)?;
        attach_ranks(&tx, &mut guilds)?;
        attach_members(&tx, &mut guilds)?;
        attach_claims(&tx, &mut guilds)?;
        attach_invites(&tx, &mut guilds)?;
        attach_upgrades(&tx, &mut guilds)?;
        attach_homes(&tx, &mut guilds)?;
        let ledger_sums = ledger_sums(&tx)?;
        let sequences = last_sequences(&tx)?;
        tx.commit()?;

        let snapshots = guilds
            .into_values()
            .map(|mut guild| {
                let ledger_sum = ledger_sums.get(&guild.id).copied().unwrap_or(0);
                let balance_repaired = ledger_sum != guild.balance;
                if balance_repaired {
                    tracing::warn!(
                        target: "guilds::store",
                        guild = %guild.id,
                        balance_cache = guild.balance,
                        ledger_sum,
                        "load.balance_reconciled"
                    );
                    guild.balance = ledger_sum;
                }
                guild.ranks.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
                GuildSnapshot {
                    last_sequence: sequences.get(&guild.id).copied().unwrap_or(0),
                    guild,
                    balance_repaired,
                }
            })
            .collect::<Vec<_>>();

        tracing::info!(target: "guilds::store", guilds = snapshots.len(), "load.completed");
        Ok(snapshots)
    }

    /// Ids are never reused, including ids of disbanded guilds.
    pub fn next_guild_id(&self) -> Result<GuildId, StoreError> {
        let conn = self.pool.acquire()?;
        let max: i64 = conn.query_row(
            "SELECT MAX(
                 (SELECT COALESCE(MAX(id), 0) FROM guilds),
                 (SELECT COALESCE(MAX(guild_id), 0) FROM guild_sequences)
             )",
            [],
            |row| row.get(0),
        )?;
        Ok(GuildId(max as u64 + 1))
    }

    /// Highest membership or claim stamp on disk, orphans included.
    pub fn last_stamp(&self) -> Result<u64, StoreError> {
        let conn = self.pool.acquire()?;
        let max: i64 = conn.query_row(
            "SELECT MAX(
                 (SELECT COALESCE(MAX(joined_at), 0) FROM members),
                 (SELECT COALESCE(MAX(claimed_at), 0) FROM claims)
             )",
            [],
            |row| row.get(0),
        )?;
        Ok(max as u64)
    }

    pub fn last_sequence(&self, guild: GuildId) -> Result<u64, StoreError> {
        let conn = self.pool.acquire()?;
        Ok(read_last_sequence(&conn, guild)?)
    }

    pub fn claim_owner(&self, key: &ClaimKey) -> Result<Option<GuildId>, StoreError> {
        let conn = self.pool.acquire()?;
        let owner = conn
            .query_row(
                "SELECT guild_id FROM claims WHERE world = ?1 AND x = ?2 AND z = ?3",
                params![key.world, key.coord.x, key.coord.z],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    pub fn audit_balance(&self, guild: GuildId) -> Result<BalanceAudit, StoreError> {
        let conn = self.pool.acquire()?;
        let ledger_sum: i64 = conn.query_row(
            "SELECT COALESCE(SUM(delta), 0) FROM ledger WHERE guild_id = ?1",
            params![guild],
            |row| row.get(0),
        )?;
        let balance_cache = conn
            .query_row(
                "SELECT balance_cache FROM guilds WHERE id = ?1",
                params![guild],
                |row| row.get(0),
            )
            .optional()?;
        Ok(BalanceAudit {
            ledger_sum,
            balance_cache,
        })
    }
}

impl BatchWriter for GuildRepository {
    /// One transaction per job: sequence check, ops, sequence bump.
    fn apply_batch(&self, job: &PersistenceJob) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last_applied = read_last_sequence(&tx, job.guild)?;
        if job.sequence <= last_applied {
            return Err(StoreError::SequenceConflict {
                guild: job.guild,
                last_applied,
                attempted: job.sequence,
            });
        }

        for op in &job.ops {
            apply_op(&tx, job.guild, op)?;
        }

        tx.execute(
            "INSERT INTO guild_sequences (guild_id, last_sequence, retired) VALUES (?1, ?2, ?3)
             ON CONFLICT(guild_id) DO UPDATE SET
                 last_sequence = excluded.last_sequence,
                 retired = MAX(retired, excluded.retired)",
            params![job.guild, job.sequence as i64, job.deletes_guild()],
        )?;
        tx.commit()?;

        tracing::debug!(
            target: "guilds::store",
            guild = %job.guild,
            sequence = job.sequence,
            ops = job.ops.len(),
            "batch.applied"
        );
        Ok(())
    }
}

fn read_last_sequence(conn: &Connection, guild: GuildId) -> rusqlite::Result<u64> {
    let last: Option<i64> = conn
        .query_row(
            "SELECT last_sequence FROM guild_sequences WHERE guild_id = ?1",
            params![guild],
            |row| row.get(0),
        )
        .optional()?;
    Ok(last.unwrap_or(0) as u64)
}

fn apply_op(conn: &Connection, guild: GuildId, op: &Mutation) -> rusqlite::Result<()> {
    match op {
        Mutation::UpsertGuild(row) => {
            conn.execute(
                "INSERT INTO guilds (id, name, owner_id, created_at, balance_cache, level, exp, pvp_enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     owner_id = excluded.owner_id,
                     balance_cache = excluded.balance_cache,
                     level = excluded.level,
                     exp = excluded.exp,
                     pvp_enabled = excluded.pvp_enabled",
                params![
                    row.id,
                    row.name,
                    row.owner,
                    row.created_at as i64,
                    row.balance,
                    row.level,
                    row.exp as i64,
                    row.pvp_enabled
                ],
            )?;
        }
        Mutation::UpsertRank(rank) => {
            conn.execute(
                "INSERT INTO ranks (guild_id, ordinal, name, permissions) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(guild_id, ordinal) DO UPDATE SET
                     name = excluded.name,
                     permissions = excluded.permissions",
                params![guild, rank.ordinal, rank.name, rank.permissions.bits()],
            )?;
        }
        // Rows move between guilds only on a strictly newer stamp; a stale
        // write from the previous guild is dropped.
        Mutation::UpsertMember(member) => {
            conn.execute(
                "INSERT INTO members (player_id, guild_id, rank_ordinal, joined_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(player_id) DO UPDATE SET
                     guild_id = excluded.guild_id,
                     rank_ordinal = excluded.rank_ordinal,
                     joined_at = excluded.joined_at
                 WHERE members.guild_id = excluded.guild_id OR excluded.joined_at > members.joined_at",
                params![member.player, guild, member.rank, member.joined_at as i64],
            )?;
        }
        Mutation::RemoveMember(player) => {
            conn.execute(
                "DELETE FROM members WHERE player_id = ?1 AND guild_id = ?2",
                params![player, guild],
            )?;
        }
        Mutation::InsertClaim { key, claimed_at } => {
            conn.execute(
                "INSERT INTO claims (world, x, z, guild_id, claimed_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(world, x, z) DO UPDATE SET
                     guild_id = excluded.guild_id,
                     claimed_at = excluded.claimed_at
                 WHERE claims.guild_id = excluded.guild_id OR excluded.claimed_at > claims.claimed_at",
                params![key.world, key.coord.x, key.coord.z, guild, *claimed_at as i64],
            )?;
        }
        Mutation::DeleteClaim(key) => {
            conn.execute(
                "DELETE FROM claims WHERE world = ?1 AND x = ?2 AND z = ?3 AND guild_id = ?4",
                params![key.world, key.coord.x, key.coord.z, guild],
            )?;
        }
        Mutation::AppendLedger(entry) => {
            conn.execute(
                "INSERT INTO ledger (guild_id, delta, reason, actor, ts) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![guild, entry.delta, entry.reason, entry.actor, entry.at as i64],
            )?;
        }
        Mutation::UpsertInvite { player, invited_at } => {
            conn.execute(
                "INSERT INTO invites (guild_id, player_id, invited_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(guild_id, player_id) DO UPDATE SET invited_at = excluded.invited_at",
                params![guild, player, *invited_at as i64],
            )?;
        }
        Mutation::RemoveInvite(player) => {
            conn.execute(
                "DELETE FROM invites WHERE guild_id = ?1 AND player_id = ?2",
                params![guild, player],
            )?;
        }
        Mutation::SetUpgrade { name, level } => {
            conn.execute(
                "INSERT INTO upgrades (guild_id, name, level) VALUES (?1, ?2, ?3)
                 ON CONFLICT(guild_id, name) DO UPDATE SET level = excluded.level",
                params![guild, name, level],
            )?;
        }
        Mutation::UpsertHome { name, home } => {
            conn.execute(
                "INSERT INTO homes (guild_id, name, world, x, y, z, yaw, pitch)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(guild_id, name) DO UPDATE SET
                     world = excluded.world,
                     x = excluded.x,
                     y = excluded.y,
                     z = excluded.z,
                     yaw = excluded.yaw,
                     pitch = excluded.pitch",
                params![
                    guild,
                    name,
                    home.world,
                    home.x,
                    home.y,
                    home.z,
                    f64::from(home.yaw),
                    f64::from(home.pitch)
                ],
            )?;
        }
        Mutation::DeleteHome(name) => {
            conn.execute(
                "DELETE FROM homes WHERE guild_id = ?1 AND name = ?2",
                params![guild, name],
            )?;
        }
        Mutation::DeleteGuild => {
            conn.execute("DELETE FROM guilds WHERE id = ?1", params![guild])?;
            conn.execute("DELETE FROM members WHERE guild_id = ?1", params![guild])?;
            conn.execute("DELETE FROM ranks WHERE guild_id = ?1", params![guild])?;
            conn.execute("DELETE FROM claims WHERE guild_id = ?1", params![guild])?;
            conn.execute("DELETE FROM invites WHERE guild_id = ?1", params![guild])?;
            conn.execute("DELETE FROM upgrades WHERE guild_id = ?1", params![guild])?;
            conn.execute("DELETE FROM homes WHERE guild_id = ?1", params![guild])?;
        }
    }
    Ok(())
}

fn load_guild_rows(conn: &Connection) -> rusqlite::Result<BTreeMap<GuildId, Guild>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, owner_id, created_at, balance_cache, level, exp, pvp_enabled FROM guilds",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(GuildRow {
            id: row.get(0)?,
            name: row.get(1)?,
            owner: row.get(2)?,
            created_at: row.get::<_, i64>(3)? as u64,
            balance: row.get(4)?,
            level: row.get(5)?,
            exp: row.get::<_, i64>(6)? as u64,
            pvp_enabled: row.get(7)?,
        })
    })?;

    let mut guilds = BTreeMap::new();
    for row in rows {
        let row = row?;
        guilds.insert(row.id, Guild::from_row(row));
    }
    Ok(guilds)
}

fn orphan(table: &'static str, guild: GuildId) {
    tracing::warn!(target: "guilds::store", table, guild = %guild, "load.orphan_row_skipped");
}

fn attach_ranks(conn: &Connection, guilds: &mut BTreeMap<GuildId, Guild>) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare("SELECT guild_id, ordinal, name, permissions FROM ranks")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, GuildId>(0)?,
            Rank {
                ordinal: row.get(1)?,
                name: row.get(2)?,
                permissions: Permissions::from_bits_truncate(row.get(3)?),
            },
        ))
    })?;
    for row in rows {
        let (id, rank) = row?;
        match guilds.get_mut(&id) {
            Some(guild) => guild.ranks.push(rank),
            None => orphan("ranks", id),
        }
    }
    Ok(())
}

fn attach_members(conn: &Connection, guilds: &mut BTreeMap<GuildId, Guild>) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare("SELECT guild_id, player_id, rank_ordinal, joined_at FROM members")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, GuildId>(0)?,
            Member {
                player: row.get(1)?,
                rank: row.get(2)?,
                joined_at: row.get::<_, i64>(3)? as u64,
            },
        ))
    })?;
    for row in rows {
        let (id, member) = row?;
        match guilds.get_mut(&id) {
            Some(guild) => {
                guild.members.insert(member.player, member);
            }
            None => orphan("members", id),
        }
    }
    Ok(())
}

fn attach_claims(conn: &Connection, guilds: &mut BTreeMap<GuildId, Guild>) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare("SELECT guild_id, world, x, z, claimed_at FROM claims")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, GuildId>(0)?,
            ClaimKey::new(row.get::<_, String>(1)?, row.get(2)?, row.get(3)?),
            row.get::<_, i64>(4)? as u64,
        ))
    })?;
    for row in rows {
        let (id, key, claimed_at) = row?;
        match guilds.get_mut(&id) {
            Some(guild) => {
                guild.claims.insert(key, claimed_at);
            }
            None => orphan("claims", id),
        }
    }
    Ok(())
}

fn attach_invites(conn: &Connection, guilds: &mut BTreeMap<GuildId, Guild>) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare("SELECT guild_id, player_id, invited_at FROM invites")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, GuildId>(0)?,
            row.get::<_, PlayerId>(1)?,
            row.get::<_, i64>(2)? as u64,
        ))
    })?;
    for row in rows {
        let (id, player, invited_at) = row?;
        match guilds.get_mut(&id) {
            Some(guild) => {
                guild.invites.insert(player, invited_at);
            }
            None => orphan("invites", id),
        }
    }
    Ok(())
}

fn attach_upgrades(conn: &Connection, guilds: &mut BTreeMap<GuildId, Guild>) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare("SELECT guild_id, name, level FROM upgrades")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, GuildId>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, u32>(2)?,
        ))
    })?;
    for row in rows {
        let (id, name, level) = row?;
        match guilds.get_mut(&id) {
            Some(guild) => {
                guild.upgrades.insert(name, level);
            }
            None => orphan("upgrades", id),
        }
    }
    Ok(())
}

fn attach_homes(conn: &Connection, guilds: &mut BTreeMap<GuildId, Guild>) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare("SELECT guild_id, name, world, x, y, z, yaw, pitch FROM homes")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, GuildId>(0)?,
            row.get::<_, String>(1)?,
            GuildHome {
                world: row.get(2)?,
                x: row.get(3)?,
                y: row.get(4)?,
                z: row.get(5)?,
                yaw: row.get::<_, f64>(6)? as f32,
                pitch: row.get::<_, f64>(7)? as f32,
            },
        ))
    })?;
    for row in rows {
        let (id, name, home) = row?;
        match guilds.get_mut(&id) {
            Some(guild) => {
                guild.homes.insert(name, home);
            }
            None => orphan("homes", id),
        }
    }
    Ok(())
}

fn ledger_sums(conn: &Connection) -> rusqlite::Result<BTreeMap<GuildId, i64>> {
    let mut stmt = conn.prepare("SELECT guild_id, SUM(delta) FROM ledger GROUP BY guild_id")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, GuildId>(0)?, row.get::<_, i64>(1)?)))?;
    rows.collect()
}

fn last_sequences(conn: &Connection) -> rusqlite::Result<BTreeMap<GuildId, u64>> {
    let mut stmt = conn.prepare("SELECT guild_id, last_sequence FROM guild_sequences")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, GuildId>(0)?, row.get::<_, i64>(1)? as u64))
    })?;
    rows.collect()
}

impl ToSql for GuildId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0 as i64))
    }
}

impl FromSql for GuildId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(|id| GuildId(id as u64))
    }
}

impl ToSql for PlayerId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.to_string()))
    }
}

impl FromSql for PlayerId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|err: uuid::Error| FromSqlError::Other(Box::new(err)))
    }
}
