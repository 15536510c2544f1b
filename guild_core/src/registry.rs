//! Authoritative in-memory guild state, owned by the tick thread.
//!
//! Every mutation completes synchronously, marks the guild dirty and appends to
//! its change log. The write-behind scheduler drains the change log later.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::GuildConfig;
use crate::error::GuildError;
use crate::job::Mutation;
use crate::model::{ClaimKey, Guild, GuildHome, GuildId, GuildRow, LedgerEntry, Member, Permissions, PlayerId};
use crate::repository::GuildSnapshot;

pub struct GuildRegistry {
    config: Arc<GuildConfig>,
    guilds: HashMap<GuildId, Guild>,
    by_player: HashMap<PlayerId, GuildId>,
    /// Lower-cased names. Entries of retired guilds stay until their final job drains.
    by_name: HashMap<String, GuildId>,
    retired: HashSet<GuildId>,
    pending: HashMap<GuildId, Vec<Mutation>>,
    next_id: u64,
    /// Last stamp handed to a membership or claim. Store-side guards order
    /// rows of different guilds by it, so it never goes backwards.
    last_stamp: u64,
}

/// State handed back by a disband: the evicted guild and its final change log.
pub struct RetiredGuild {
    pub guild: Guild,
    pub final_ops: Vec<Mutation>,
}

impl GuildRegistry {
    pub fn new(config: Arc<GuildConfig>, next_id: GuildId) -> Self {
        Self {
            config,
            guilds: HashMap::new(),
            by_player: HashMap::new(),
            by_name: HashMap::new(),
            retired: HashSet::new(),
            pending: HashMap::new(),
            next_id: next_id.0.max(1),
            last_stamp: 0,
        }
    }

    /// Builds the registry and its indices from a startup load.
    pub fn from_snapshots(
        config: Arc<GuildConfig>,
        snapshots: Vec<GuildSnapshot>,
        next_id: GuildId,
    ) -> Self {
        let mut registry = GuildRegistry::new(config, next_id);
        for snapshot in snapshots {
            let mut guild = snapshot.guild;
            let id = guild.id;
            registry.next_id = registry.next_id.max(id.0 + 1);
            let newest = guild
                .members
                .values()
                .map(|member| member.joined_at)
                .chain(guild.claims.values().copied())
                .max()
                .unwrap_or(0);
            registry.resume_stamps(newest);

            if guild.ranks.is_empty() {
                guild.ranks = registry.config.default_ranks();
                for rank in &guild.ranks {
                    registry.record(id, Mutation::UpsertRank(rank.clone()));
                }
            }
            if snapshot.balance_repaired {
                registry.record(id, Mutation::UpsertGuild(guild.row()));
            }

            for player in guild.members.keys() {
                if let Some(previous) = registry.by_player.insert(*player, id) {
                    tracing::warn!(
                        target: "guilds::registry",
                        player = %player,
                        guild = %id,
                        previous = %previous,
                        "load.duplicate_membership"
                    );
                }
            }
            let lower = guild.name.to_lowercase();
            if let Some(previous) = registry.by_name.insert(lower, id) {
                tracing::warn!(
                    target: "guilds::registry",
                    name = %guild.name,
                    guild = %id,
                    previous = %previous,
                    "load.duplicate_name"
                );
            }
            guild.dirty = registry.pending.contains_key(&id);
            registry.guilds.insert(id, guild);
        }
        tracing::info!(
            target: "guilds::registry",
            guilds = registry.guilds.len(),
            players = registry.by_player.len(),
            "registry.loaded"
        );
        registry
    }

    pub fn config(&self) -> &GuildConfig {
        &self.config
    }

    pub fn get(&self, id: GuildId) -> Option<&Guild> {
        self.guilds.get(&id)
    }

    pub fn guild_of(&self, player: PlayerId) -> Option<GuildId> {
        self.by_player.get(&player).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&Guild> {
        self.by_name
            .get(&name.to_lowercase())
            .and_then(|id| self.guilds.get(id))
    }

    pub fn len(&self) -> usize {
        self.guilds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guilds.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Guild> {
        self.guilds.values()
    }

    pub fn is_retired(&self, id: GuildId) -> bool {
        self.retired.contains(&id)
    }

    /// Fails unless the guild is loaded and accepts mutations.
    pub fn ensure_writable(&self, id: GuildId) -> Result<&Guild, GuildError> {
        if self.retired.contains(&id) {
            return Err(GuildError::Retired(id));
        }
        let guild = self.guilds.get(&id).ok_or(GuildError::NotFound(id))?;
        if guild.read_only {
            return Err(GuildError::Quarantined(id));
        }
        Ok(guild)
    }

    fn writable_mut(&mut self, id: GuildId) -> Result<&mut Guild, GuildError> {
        self.ensure_writable(id)?;
        self.guilds.get_mut(&id).ok_or(GuildError::NotFound(id))
    }

    pub fn check_permission(
        &self,
        id: GuildId,
        actor: PlayerId,
        permission: Permissions,
    ) -> Result<&Guild, GuildError> {
        let guild = self.ensure_writable(id)?;
        require(guild, actor, permission)?;
        Ok(guild)
    }

    /// Never hands out a stamp at or below one already persisted, so a
    /// pre-restart stamp still loses to anything issued afterwards.
    pub fn resume_stamps(&mut self, persisted: u64) {
        self.last_stamp = self.last_stamp.max(persisted);
    }

    pub fn last_stamp(&self) -> u64 {
        self.last_stamp
    }

    /// Wall-clock millis where the clock allows, bumped past the previous
    /// stamp when it stalls or steps back.
    fn stamp(&mut self, now: u64) -> u64 {
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }

    fn record(&mut self, id: GuildId, mutation: Mutation) {
        self.pending.entry(id).or_default().push(mutation);
        if let Some(guild) = self.guilds.get_mut(&id) {
            guild.dirty = true;
        }
    }

    fn validate_name(&self, name: &str, renaming: Option<GuildId>) -> Result<String, GuildError> {
        if !self.config.names().accepts(name) {
            return Err(GuildError::InvalidName(name.to_string()));
        }
        let lower = name.to_lowercase();
        match self.by_name.get(&lower) {
            Some(holder) if Some(*holder) != renaming => Err(GuildError::DuplicateName(name.to_string())),
            _ => Ok(lower),
        }
    }

    pub fn create_guild(&mut self, name: &str, owner: PlayerId, now: u64) -> Result<GuildId, GuildError> {
        let lower = self.validate_name(name, None)?;
        if let Some(existing) = self.guild_of(owner) {
            return Err(GuildError::AlreadyInGuild {
                guild: existing,
                player: owner,
            });
        }

        let id = GuildId(self.next_id);
        self.next_id += 1;
        let joined_at = self.stamp(now);

        let mut guild = Guild::from_row(GuildRow {
            id,
            name: name.to_string(),
            owner,
            created_at: now,
            balance: 0,
            level: self.config.tiers().first().map(|tier| tier.level).unwrap_or(1),
            exp: 0,
            pvp_enabled: false,
        });
        guild.ranks = self.config.default_ranks();
        let top = guild.top_rank().map(|rank| rank.ordinal).unwrap_or(0);
        let member = Member {
            player: owner,
            rank: top,
            joined_at,
        };
        guild.members.insert(owner, member.clone());

        let ranks = guild.ranks.clone();
        let row = guild.row();
        self.guilds.insert(id, guild);
        self.by_player.insert(owner, id);
        self.by_name.insert(lower, id);

        self.record(id, Mutation::UpsertGuild(row));
        for rank in ranks {
            self.record(id, Mutation::UpsertRank(rank));
        }
        self.record(id, Mutation::UpsertMember(member));

        tracing::info!(target: "guilds::registry", guild = %id, name, owner = %owner, "guild.created");
        Ok(id)
    }

    /// Evicts the guild and retires its id. The name stays reserved until
    /// [`GuildRegistry::release_retired`] is called.
    pub fn disband(&mut self, actor: PlayerId, id: GuildId) -> Result<RetiredGuild, GuildError> {
        let guild = self.ensure_writable(id)?;
        if actor != guild.owner {
            require(guild, actor, Permissions::DISBAND)?;
        }

        let guild = self.guilds.remove(&id).ok_or(GuildError::NotFound(id))?;
        for player in guild.members.keys() {
            self.by_player.remove(player);
        }
        self.retired.insert(id);

        let mut final_ops = self.pending.remove(&id).unwrap_or_default();
        final_ops.push(Mutation::DeleteGuild);

        tracing::info!(
            target: "guilds::registry",
            guild = %id,
            members = guild.members.len(),
            claims = guild.claims.len(),
            "guild.disbanded"
        );
        Ok(RetiredGuild { guild, final_ops })
    }

    pub fn release_retired(&mut self, id: GuildId) {
        if self.retired.remove(&id) {
            self.by_name.retain(|_, holder| *holder != id);
            tracing::debug!(target: "guilds::registry", guild = %id, "guild.id_released");
        }
    }

    fn join(&mut self, id: GuildId, player: PlayerId, now: u64) -> Result<(), GuildError> {
        if let Some(existing) = self.guild_of(player) {
            return Err(GuildError::AlreadyInGuild {
                guild: existing,
                player,
            });
        }
        let limit = {
            let guild = self.ensure_writable(id)?;
            self.config.member_limit(guild.level)
        };
        let guild = self.writable_mut(id)?;
        if guild.members.len() >= limit {
            return Err(GuildError::MemberLimitReached { guild: id, limit });
        }
        let rank = guild.lowest_rank().map(|rank| rank.ordinal).unwrap_or(0);
        let joined_at = self.stamp(now);
        let guild = self.writable_mut(id)?;
        let member = Member {
            player,
            rank,
            joined_at,
        };
        guild.members.insert(player, member.clone());
        let had_invite = guild.invites.remove(&player).is_some();
        self.by_player.insert(player, id);

        if had_invite {
            self.record(id, Mutation::RemoveInvite(player));
        }
        self.record(id, Mutation::UpsertMember(member));
        tracing::info!(target: "guilds::registry", guild = %id, player = %player, "member.joined");
        Ok(())
    }

    /// Direct join from the event dispatch; no invite needed.
    pub fn add_member(&mut self, id: GuildId, player: PlayerId, now: u64) -> Result<(), GuildError> {
        self.join(id, player, now)
    }

    pub fn invite(&mut self, actor: PlayerId, id: GuildId, player: PlayerId, now: u64) -> Result<(), GuildError> {
        self.check_permission(id, actor, Permissions::INVITE)?;
        if let Some(existing) = self.guild_of(player) {
            return Err(GuildError::AlreadyInGuild {
                guild: existing,
                player,
            });
        }
        let guild = self.writable_mut(id)?;
        guild.invites.insert(player, now);
        self.record(id, Mutation::UpsertInvite { player, invited_at: now });
        tracing::debug!(target: "guilds::registry", guild = %id, player = %player, "invite.sent");
        Ok(())
    }

    pub fn revoke_invite(&mut self, actor: PlayerId, id: GuildId, player: PlayerId) -> Result<(), GuildError> {
        self.check_permission(id, actor, Permissions::INVITE)?;
        let guild = self.writable_mut(id)?;
        if guild.invites.remove(&player).is_none() {
            return Err(GuildError::NoInvite { guild: id, player });
        }
        self.record(id, Mutation::RemoveInvite(player));
        Ok(())
    }

    pub fn accept_invite(&mut self, player: PlayerId, id: GuildId, now: u64) -> Result<(), GuildError> {
        let guild = self.ensure_writable(id)?;
        if !guild.invites.contains_key(&player) {
            return Err(GuildError::NoInvite { guild: id, player });
        }
        self.join(id, player, now)
    }

    /// Leave (actor == player) or kick. Removing the owner requires a successor.
    pub fn remove_member(
        &mut self,
        actor: PlayerId,
        id: GuildId,
        player: PlayerId,
        successor: Option<PlayerId>,
    ) -> Result<(), GuildError> {
        let guild = self.ensure_writable(id)?;
        if !guild.is_member(player) {
            return Err(GuildError::NotMember { guild: id, player });
        }
        if actor != player {
            require(guild, actor, Permissions::KICK)?;
            if player == guild.owner || !outranks(guild, actor, player) {
                return Err(GuildError::InsufficientRank { guild: id, player: actor });
            }
        }

        if player == guild.owner {
            let successor = successor.ok_or(GuildError::InvalidOwnershipTransfer {
                guild: id,
                reason: "the owner cannot leave without a designated successor",
            })?;
            self.transfer_ownership(player, id, successor)?;
        }

        let guild = self.writable_mut(id)?;
        guild.members.remove(&player);
        self.by_player.remove(&player);
        self.record(id, Mutation::RemoveMember(player));
        tracing::info!(
            target: "guilds::registry",
            guild = %id,
            player = %player,
            kicked = actor != player,
            "member.removed"
        );
        Ok(())
    }

    pub fn set_rank(&mut self, actor: PlayerId, id: GuildId, player: PlayerId, ordinal: u16) -> Result<(), GuildError> {
        let guild = self.check_permission(id, actor, Permissions::MANAGE_RANKS)?;
        let current = guild
            .member(player)
            .map(|member| member.rank)
            .ok_or(GuildError::NotMember { guild: id, player })?;
        if guild.rank(ordinal).is_none() {
            return Err(GuildError::RankNotFound { guild: id, ordinal });
        }
        if player == guild.owner {
            if actor != guild.owner {
                return Err(GuildError::InsufficientRank { guild: id, player: actor });
            }
            if Some(ordinal) != guild.top_rank().map(|rank| rank.ordinal) {
                return Err(GuildError::InvalidOwnershipTransfer {
                    guild: id,
                    reason: "the owner keeps the top rank; transfer ownership first",
                });
            }
        } else if actor != guild.owner {
            let actor_rank = guild.member(actor).map(|member| member.rank).unwrap_or(0);
            if current >= actor_rank || ordinal >= actor_rank {
                return Err(GuildError::InsufficientRank { guild: id, player: actor });
            }
        }

        let guild = self.writable_mut(id)?;
        let Some(member) = guild.members.get_mut(&player) else {
            return Err(GuildError::NotMember { guild: id, player });
        };
        member.rank = ordinal;
        let member = member.clone();
        self.record(id, Mutation::UpsertMember(member));
        tracing::debug!(target: "guilds::registry", guild = %id, player = %player, ordinal, "member.rank_set");
        Ok(())
    }

    /// The new owner takes the top rank; the old owner drops to the next one.
    pub fn transfer_ownership(&mut self, actor: PlayerId, id: GuildId, successor: PlayerId) -> Result<(), GuildError> {
        let guild = self.ensure_writable(id)?;
        if actor != guild.owner {
            return Err(GuildError::PermissionDenied { guild: id, player: actor });
        }
        if successor == guild.owner || !guild.is_member(successor) {
            return Err(GuildError::InvalidOwnershipTransfer {
                guild: id,
                reason: "the successor must be another member of the guild",
            });
        }
        let top = guild.top_rank().map(|rank| rank.ordinal).unwrap_or(0);
        let demoted = guild
            .ranks
            .get(1)
            .or_else(|| guild.top_rank())
            .map(|rank| rank.ordinal)
            .unwrap_or(0);
        let previous = guild.owner;

        let guild = self.writable_mut(id)?;
        guild.owner = successor;
        let mut changed = Vec::with_capacity(2);
        for (player, ordinal) in [(successor, top), (previous, demoted)] {
            if let Some(member) = guild.members.get_mut(&player) {
                member.rank = ordinal;
                changed.push(member.clone());
            }
        }
        let row = guild.row();
        self.record(id, Mutation::UpsertGuild(row));
        for member in changed {
            self.record(id, Mutation::UpsertMember(member));
        }
        tracing::info!(
            target: "guilds::registry",
            guild = %id,
            from = %previous,
            to = %successor,
            "guild.ownership_transferred"
        );
        Ok(())
    }

    /// Appends a ledger entry and updates the cached balance. The balance never goes negative.
    pub fn apply_ledger(
        &mut self,
        id: GuildId,
        delta: i64,
        reason: &str,
        actor: Option<PlayerId>,
        now: u64,
    ) -> Result<i64, GuildError> {
        let guild = self.writable_mut(id)?;
        let balance = guild
            .balance
            .checked_add(delta)
            .filter(|balance| *balance >= 0)
            .ok_or(GuildError::InsufficientFunds {
                guild: id,
                balance: guild.balance,
                requested: delta.saturating_neg(),
            })?;
        guild.balance = balance;
        let row = guild.row();
        self.record(
            id,
            Mutation::AppendLedger(LedgerEntry {
                guild: id,
                delta,
                reason: reason.to_string(),
                actor,
                at: now,
            }),
        );
        self.record(id, Mutation::UpsertGuild(row));
        Ok(balance)
    }

    pub fn rename(&mut self, actor: PlayerId, id: GuildId, new_name: &str) -> Result<(), GuildError> {
        self.check_permission(id, actor, Permissions::RENAME)?;
        let lower = self.validate_name(new_name, Some(id))?;
        let guild = self.writable_mut(id)?;
        let old = std::mem::replace(&mut guild.name, new_name.to_string());
        let row = guild.row();
        self.by_name.remove(&old.to_lowercase());
        self.by_name.insert(lower, id);
        self.record(id, Mutation::UpsertGuild(row));
        tracing::info!(target: "guilds::registry", guild = %id, from = %old, to = new_name, "guild.renamed");
        Ok(())
    }

    pub fn set_pvp(&mut self, actor: PlayerId, id: GuildId, enabled: bool) -> Result<(), GuildError> {
        self.check_permission(id, actor, Permissions::TOGGLE_PVP)?;
        let guild = self.writable_mut(id)?;
        guild.pvp_enabled = enabled;
        let row = guild.row();
        self.record(id, Mutation::UpsertGuild(row));
        Ok(())
    }

    /// Adds experience and levels up through every tier whose threshold is met.
    pub fn add_exp(&mut self, id: GuildId, amount: u64) -> Result<u32, GuildError> {
        let config = Arc::clone(&self.config);
        let guild = self.writable_mut(id)?;
        guild.exp = guild.exp.saturating_add(amount);
        let before = guild.level;
        while let Some(next) = config.next_tier(guild.level) {
            if guild.exp < next.exp_required {
                break;
            }
            guild.level = next.level;
        }
        let level = guild.level;
        let row = guild.row();
        self.record(id, Mutation::UpsertGuild(row));
        if level != before {
            tracing::info!(target: "guilds::registry", guild = %id, from = before, to = level, "guild.level_up");
        }
        Ok(level)
    }

    pub fn set_upgrade(&mut self, actor: PlayerId, id: GuildId, name: &str, level: u32) -> Result<(), GuildError> {
        self.check_permission(id, actor, Permissions::MANAGE_UPGRADES)?;
        let guild = self.writable_mut(id)?;
        guild.upgrades.insert(name.to_string(), level);
        self.record(
            id,
            Mutation::SetUpgrade {
                name: name.to_string(),
                level,
            },
        );
        Ok(())
    }

    /// Creates or moves a named home. Moving an existing home does not count
    /// against the tier's home limit.
    pub fn set_home(&mut self, actor: PlayerId, id: GuildId, name: &str, home: GuildHome) -> Result<(), GuildError> {
        if !valid_home_name(name) {
            return Err(GuildError::InvalidHomeName(name.to_string()));
        }
        let guild = self.check_permission(id, actor, Permissions::SET_HOME)?;
        let name = name.to_lowercase();
        let limit = self.config.home_limit(guild.level);
        if !guild.homes.contains_key(&name) && guild.homes.len() >= limit {
            return Err(GuildError::HomeLimitReached { guild: id, limit });
        }

        let guild = self.writable_mut(id)?;
        guild.homes.insert(name.clone(), home.clone());
        tracing::debug!(target: "guilds::registry", guild = %id, home = %name, world = %home.world, "guild.home_set");
        self.record(id, Mutation::UpsertHome { name, home });
        Ok(())
    }

    pub fn delete_home(&mut self, actor: PlayerId, id: GuildId, name: &str) -> Result<(), GuildError> {
        self.check_permission(id, actor, Permissions::SET_HOME)?;
        let name = name.to_lowercase();
        let guild = self.writable_mut(id)?;
        if guild.homes.remove(&name).is_none() {
            return Err(GuildError::HomeNotFound { guild: id, name });
        }
        self.record(id, Mutation::DeleteHome(name));
        Ok(())
    }

    /// Any member may look a home up, including in a quarantined guild.
    pub fn home(&self, actor: PlayerId, id: GuildId, name: &str) -> Result<&GuildHome, GuildError> {
        let guild = self.guilds.get(&id).ok_or(GuildError::NotFound(id))?;
        if !guild.is_member(actor) {
            return Err(GuildError::NotMember { guild: id, player: actor });
        }
        guild.home(name).ok_or_else(|| GuildError::HomeNotFound {
            guild: id,
            name: name.to_lowercase(),
        })
    }

    /// Used by the claim manager after it has validated the claim.
    pub(crate) fn attach_claim(&mut self, id: GuildId, key: ClaimKey, now: u64) -> Result<(), GuildError> {
        self.ensure_writable(id)?;
        let claimed_at = self.stamp(now);
        let guild = self.writable_mut(id)?;
        guild.claims.insert(key.clone(), claimed_at);
        self.record(id, Mutation::InsertClaim { key, claimed_at });
        Ok(())
    }

    pub(crate) fn detach_claim(&mut self, id: GuildId, key: &ClaimKey) -> Result<(), GuildError> {
        let guild = self.writable_mut(id)?;
        guild.claims.remove(key);
        self.record(id, Mutation::DeleteClaim(key.clone()));
        Ok(())
    }

    /// Dirty guilds that have unflushed changes, in id order.
    pub fn dirty_ids(&self) -> Vec<GuildId> {
        let mut ids: Vec<GuildId> = self
            .pending
            .iter()
            .filter(|(id, ops)| !ops.is_empty() && !self.retired.contains(*id))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn has_pending(&self, id: GuildId) -> bool {
        self.pending.get(&id).map_or(false, |ops| !ops.is_empty())
    }

    pub fn take_pending(&mut self, id: GuildId) -> Vec<Mutation> {
        self.pending.remove(&id).unwrap_or_default()
    }

    /// Puts a failed job's mutations back ahead of anything recorded since.
    pub fn requeue_front(&mut self, id: GuildId, mut ops: Vec<Mutation>) {
        let pending = self.pending.entry(id).or_default();
        ops.append(pending);
        *pending = ops;
        if let Some(guild) = self.guilds.get_mut(&id) {
            guild.dirty = true;
        }
    }

    /// Clears the dirty flag unless something newer is already queued.
    pub fn mark_persisted(&mut self, id: GuildId) {
        let has_pending = self.has_pending(id);
        if let Some(guild) = self.guilds.get_mut(&id) {
            guild.dirty = has_pending;
        }
    }

    pub fn quarantine(&mut self, id: GuildId) {
        if let Some(guild) = self.guilds.get_mut(&id) {
            guild.read_only = true;
        }
    }

    pub fn quarantined(&self) -> Vec<GuildId> {
        let mut ids: Vec<GuildId> = self
            .guilds
            .values()
            .filter(|guild| guild.read_only)
            .map(|guild| guild.id)
            .collect();
        ids.sort();
        ids
    }
}

fn require(guild: &Guild, actor: PlayerId, permission: Permissions) -> Result<(), GuildError> {
    if !guild.is_member(actor) {
        return Err(GuildError::NotMember {
            guild: guild.id,
            player: actor,
        });
    }
    if !guild.has_permission(actor, permission) {
        return Err(GuildError::PermissionDenied {
            guild: guild.id,
            player: actor,
        });
    }
    Ok(())
}

fn valid_home_name(name: &str) -> bool {
    let len = name.chars().count();
    (1..=32).contains(&len) && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn outranks(guild: &Guild, actor: PlayerId, target: PlayerId) -> bool {
    if actor == guild.owner {
        return true;
    }
    match (guild.member(actor), guild.member(target)) {
        (Some(actor), Some(target)) => actor.rank > target.rank,
        _ => false,
    }
}
