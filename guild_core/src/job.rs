use std::collections::HashSet;

use crate::model::{ClaimKey, GuildHome, GuildId, GuildRow, LedgerEntry, Member, PlayerId, Rank};

/// One recorded change to a guild, replayed against the store in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    UpsertGuild(GuildRow),
    UpsertRank(Rank),
    UpsertMember(Member),
    RemoveMember(PlayerId),
    InsertClaim { key: ClaimKey, claimed_at: u64 },
    DeleteClaim(ClaimKey),
    AppendLedger(LedgerEntry),
    UpsertInvite { player: PlayerId, invited_at: u64 },
    RemoveInvite(PlayerId),
    SetUpgrade { name: String, level: u32 },
    UpsertHome { name: String, home: GuildHome },
    DeleteHome(String),
    /// Removes every row of the guild except its ledger history.
    DeleteGuild,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CoalesceKey {
    Guild,
    Rank(u16),
    Member(PlayerId),
    Claim(ClaimKey),
    Invite(PlayerId),
    Upgrade(String),
    Home(String),
}

impl Mutation {
    fn coalesce_key(&self) -> Option<CoalesceKey> {
        match self {
            Mutation::UpsertGuild(_) => Some(CoalesceKey::Guild),
            Mutation::UpsertRank(rank) => Some(CoalesceKey::Rank(rank.ordinal)),
            Mutation::UpsertMember(member) => Some(CoalesceKey::Member(member.player)),
            Mutation::RemoveMember(player) => Some(CoalesceKey::Member(*player)),
            Mutation::InsertClaim { key, .. } | Mutation::DeleteClaim(key) => {
                Some(CoalesceKey::Claim(key.clone()))
            }
            Mutation::UpsertInvite { player, .. } | Mutation::RemoveInvite(player) => {
                Some(CoalesceKey::Invite(*player))
            }
            Mutation::SetUpgrade { name, .. } => Some(CoalesceKey::Upgrade(name.clone())),
            Mutation::UpsertHome { name, .. } | Mutation::DeleteHome(name) => {
                Some(CoalesceKey::Home(name.clone()))
            }
            Mutation::AppendLedger(_) | Mutation::DeleteGuild => None,
        }
    }
}

/// Keeps only the last mutation per row, preserving relative order.
/// Ledger appends and guild deletion are never merged.
pub fn coalesce(ops: Vec<Mutation>) -> Vec<Mutation> {
    let mut seen = HashSet::new();
    let mut kept: Vec<Mutation> = ops
        .into_iter()
        .rev()
        .filter(|op| match op.coalesce_key() {
            Some(key) => seen.insert(key),
            None => true,
        })
        .collect();
    kept.reverse();
    kept
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLane {
    Normal,
    /// Disband jobs jump the queue.
    Priority,
}

#[derive(Debug, Clone)]
pub struct PersistenceJob {
    pub guild: GuildId,
    pub sequence: u64,
    pub ops: Vec<Mutation>,
    pub lane: JobLane,
}

impl PersistenceJob {
    pub fn new(guild: GuildId, sequence: u64, ops: Vec<Mutation>) -> Self {
        Self {
            guild,
            sequence,
            ops: coalesce(ops),
            lane: JobLane::Normal,
        }
    }

    pub fn priority(mut self) -> Self {
        self.lane = JobLane::Priority;
        self
    }

    pub fn deletes_guild(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, Mutation::DeleteGuild))
    }
}
