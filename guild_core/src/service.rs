//! Public entry points for the host. Every call runs on the tick thread and
//! returns before any storage I/O happens.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::claims::{ClaimManager, ClaimObserver};
use crate::config::{GuildConfig, GuildConfigError};
use crate::economy::EconomyProvider;
use crate::error::GuildError;
use crate::migrations::{run_migrations, MigrationError};
use crate::model::{now_millis, Claim, ClaimKey, Guild, GuildHome, GuildId, Permissions, PlayerId};
use crate::pool::{ConnectionPool, PoolError};
use crate::registry::GuildRegistry;
use crate::repository::{BalanceAudit, GuildRepository, StoreError};
use crate::scheduler::{FlushError, FlushEvent, WriteBehindScheduler};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] GuildConfigError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error("failed to load guilds: {0}")]
    Load(#[from] StoreError),
    #[error("failed to start flush workers: {0}")]
    Workers(#[from] io::Error),
}

pub struct GuildService {
    config: Arc<GuildConfig>,
    repository: GuildRepository,
    registry: GuildRegistry,
    claims: ClaimManager,
    scheduler: WriteBehindScheduler,
    economy: Box<dyn EconomyProvider>,
    ticks: u64,
}

impl GuildService {
    /// Opens the store, migrates it and loads every guild before returning.
    pub fn start(config: GuildConfig, economy: Box<dyn EconomyProvider>) -> Result<Self, StartupError> {
        config.validate()?;
        let config = Arc::new(config);
        let storage = config.storage();

        let pool = ConnectionPool::open(storage.database_path(), storage)?;
        let schema_version = run_migrations(&pool)?;
        let repository = GuildRepository::new(pool);

        let snapshots = repository.load_all()?;
        let next_id = repository.next_guild_id()?;
        let sequences: Vec<(GuildId, u64)> = snapshots
            .iter()
            .map(|snapshot| (snapshot.guild.id, snapshot.last_sequence))
            .collect();

        let mut registry = GuildRegistry::from_snapshots(Arc::clone(&config), snapshots, next_id);
        registry.resume_stamps(repository.last_stamp()?);
        let claims = ClaimManager::from_registry(&registry);
        let mut scheduler = WriteBehindScheduler::start(Arc::new(repository.clone()), config.flush())?;
        for (guild, last_sequence) in sequences {
            scheduler.register(guild, last_sequence);
        }

        tracing::info!(
            target: "guilds::registry",
            schema_version,
            guilds = registry.len(),
            claims = claims.len(),
            next_id = %next_id,
            "service.started"
        );

        Ok(Self {
            config,
            repository,
            registry,
            claims,
            scheduler,
            economy,
            ticks: 0,
        })
    }

    pub fn config(&self) -> &GuildConfig {
        &self.config
    }

    pub fn add_claim_observer(&mut self, observer: Box<dyn ClaimObserver>) {
        self.claims.add_observer(observer);
    }

    pub fn create_guild(&mut self, name: &str, owner: PlayerId) -> Result<GuildId, GuildError> {
        observe("create_guild", self.registry.create_guild(name, owner, now_millis()))
    }

    /// Releases every claim at once; the store catches up on the priority lane.
    pub fn disband_guild(&mut self, actor: PlayerId, guild: GuildId) -> Result<(), GuildError> {
        let retired = observe("disband_guild", self.registry.disband(actor, guild))?;
        self.claims.release_all(&retired.guild);
        self.scheduler.retire(guild, retired.final_ops, Instant::now());
        Ok(())
    }

    pub fn add_member(&mut self, guild: GuildId, player: PlayerId) -> Result<(), GuildError> {
        observe("add_member", self.registry.add_member(guild, player, now_millis()))
    }

    pub fn invite(&mut self, actor: PlayerId, guild: GuildId, player: PlayerId) -> Result<(), GuildError> {
        observe("invite", self.registry.invite(actor, guild, player, now_millis()))
    }

    pub fn accept_invite(&mut self, player: PlayerId, guild: GuildId) -> Result<(), GuildError> {
        observe("accept_invite", self.registry.accept_invite(player, guild, now_millis()))
    }

    pub fn revoke_invite(&mut self, actor: PlayerId, guild: GuildId, player: PlayerId) -> Result<(), GuildError> {
        observe("revoke_invite", self.registry.revoke_invite(actor, guild, player))
    }

    /// Leave when `actor == player`, kick otherwise. The owner needs a successor.
    pub fn remove_member(
        &mut self,
        actor: PlayerId,
        guild: GuildId,
        player: PlayerId,
        successor: Option<PlayerId>,
    ) -> Result<(), GuildError> {
        observe(
            "remove_member",
            self.registry.remove_member(actor, guild, player, successor),
        )
    }

    pub fn set_rank(&mut self, actor: PlayerId, guild: GuildId, player: PlayerId, ordinal: u16) -> Result<(), GuildError> {
        observe("set_rank", self.registry.set_rank(actor, guild, player, ordinal))
    }

    pub fn transfer_ownership(&mut self, actor: PlayerId, guild: GuildId, successor: PlayerId) -> Result<(), GuildError> {
        observe(
            "transfer_ownership",
            self.registry.transfer_ownership(actor, guild, successor),
        )
    }

    pub fn claim(&mut self, actor: PlayerId, guild: GuildId, key: ClaimKey) -> Result<(), GuildError> {
        let result = self
            .registry
            .check_permission(guild, actor, Permissions::CLAIM)
            .map(|_| ())
            .and_then(|()| self.claims.try_claim(&mut self.registry, guild, key, now_millis()));
        observe("claim", result)
    }

    pub fn unclaim(&mut self, actor: PlayerId, guild: GuildId, key: &ClaimKey) -> Result<(), GuildError> {
        let result = self
            .registry
            .check_permission(guild, actor, Permissions::UNCLAIM)
            .map(|_| ())
            .and_then(|()| self.claims.unclaim(&mut self.registry, guild, key));
        observe("unclaim", result)
    }

    /// Moves currency from the player into the guild bank. The player is
    /// refunded if the ledger refuses the entry.
    pub fn deposit(&mut self, actor: PlayerId, guild: GuildId, amount: i64) -> Result<i64, GuildError> {
        if amount <= 0 {
            return Err(GuildError::InvalidAmount(amount));
        }
        observe(
            "deposit",
            self.registry.check_permission(guild, actor, Permissions::DEPOSIT).map(|_| ()),
        )?;
        observe("deposit", self.economy.debit(actor, amount).map_err(GuildError::from))?;

        match self.registry.apply_ledger(guild, amount, "deposit", Some(actor), now_millis()) {
            Ok(balance) => Ok(balance),
            Err(err) => {
                self.compensate(actor, amount, &err);
                observe("deposit", Err(err))
            }
        }
    }

    /// Moves currency from the guild bank to the player. The ledger is only
    /// written once the economy has paid out.
    pub fn withdraw(&mut self, actor: PlayerId, guild: GuildId, amount: i64) -> Result<i64, GuildError> {
        if amount <= 0 {
            return Err(GuildError::InvalidAmount(amount));
        }
        let balance = observe(
            "withdraw",
            self.registry
                .check_permission(guild, actor, Permissions::WITHDRAW)
                .map(|guild| guild.balance),
        )?;
        if balance < amount {
            return observe(
                "withdraw",
                Err(GuildError::InsufficientFunds {
                    guild,
                    balance,
                    requested: amount,
                }),
            );
        }
        observe("withdraw", self.economy.credit(actor, amount).map_err(GuildError::from))?;

        match self.registry.apply_ledger(guild, -amount, "withdraw", Some(actor), now_millis()) {
            Ok(balance) => Ok(balance),
            Err(err) => {
                if let Err(undo) = self.economy.debit(actor, amount) {
                    tracing::error!(
                        target: "guilds::registry",
                        guild = %guild,
                        player = %actor,
                        amount,
                        error = %undo,
                        "economy.compensation_failed"
                    );
                }
                observe("withdraw", Err(err))
            }
        }
    }

    fn compensate(&mut self, player: PlayerId, amount: i64, cause: &GuildError) {
        match self.economy.credit(player, amount) {
            Ok(()) => tracing::warn!(
                target: "guilds::registry",
                player = %player,
                amount,
                cause = %cause,
                "economy.refunded"
            ),
            Err(err) => tracing::error!(
                target: "guilds::registry",
                player = %player,
                amount,
                cause = %cause,
                error = %err,
                "economy.compensation_failed"
            ),
        }
    }

    pub fn rename_guild(&mut self, actor: PlayerId, guild: GuildId, new_name: &str) -> Result<(), GuildError> {
        observe("rename_guild", self.registry.rename(actor, guild, new_name))
    }

    pub fn set_pvp(&mut self, actor: PlayerId, guild: GuildId, enabled: bool) -> Result<(), GuildError> {
        observe("set_pvp", self.registry.set_pvp(actor, guild, enabled))
    }

    pub fn add_exp(&mut self, guild: GuildId, amount: u64) -> Result<u32, GuildError> {
        observe("add_exp", self.registry.add_exp(guild, amount))
    }

    pub fn set_upgrade(&mut self, actor: PlayerId, guild: GuildId, name: &str, level: u32) -> Result<(), GuildError> {
        observe("set_upgrade", self.registry.set_upgrade(actor, guild, name, level))
    }

    pub fn set_home(&mut self, actor: PlayerId, guild: GuildId, name: &str, home: GuildHome) -> Result<(), GuildError> {
        observe("set_home", self.registry.set_home(actor, guild, name, home))
    }

    pub fn delete_home(&mut self, actor: PlayerId, guild: GuildId, name: &str) -> Result<(), GuildError> {
        observe("delete_home", self.registry.delete_home(actor, guild, name))
    }

    /// Where a member of `guild` would be sent by the named home.
    pub fn home(&self, actor: PlayerId, guild: GuildId, name: &str) -> Result<GuildHome, GuildError> {
        self.registry.home(actor, guild, name).cloned()
    }

    pub fn guild(&self, guild: GuildId) -> Option<&Guild> {
        self.registry.get(guild)
    }

    pub fn guild_by_name(&self, name: &str) -> Option<&Guild> {
        self.registry.by_name(name)
    }

    pub fn guild_of(&self, player: PlayerId) -> Option<GuildId> {
        self.registry.guild_of(player)
    }

    pub fn guild_count(&self) -> usize {
        self.registry.len()
    }

    pub fn claim_owner(&self, key: &ClaimKey) -> Option<GuildId> {
        self.claims.owner_at(key)
    }

    pub fn claims_of(&self, guild: GuildId) -> Vec<Claim> {
        self.registry
            .get(guild)
            .map(|g| {
                g.claims
                    .iter()
                    .map(|(key, claimed_at)| Claim {
                        key: key.clone(),
                        guild,
                        claimed_at: *claimed_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Unclaimed land is open to everyone; claimed land only to members.
    pub fn can_interact(&self, player: PlayerId, key: &ClaimKey) -> bool {
        match self.claims.owner_at(key) {
            None => true,
            Some(owner) => self.registry.guild_of(player) == Some(owner),
        }
    }

    /// PvP is allowed outside claims and inside claims of guilds that enabled it.
    pub fn pvp_enabled_at(&self, key: &ClaimKey) -> bool {
        match self.claims.owner_at(key) {
            None => true,
            Some(owner) => self.registry.get(owner).map_or(true, |guild| guild.pvp_enabled),
        }
    }

    pub fn quarantined(&self) -> Vec<GuildId> {
        self.registry.quarantined()
    }

    /// Reads the store directly; not for use on a live tick.
    pub fn audit_balance(&self, guild: GuildId) -> Result<BalanceAudit, StoreError> {
        self.repository.audit_balance(guild)
    }

    /// Drains completions first, then flushes every `interval_ticks` ticks.
    pub fn tick(&mut self) -> Vec<FlushEvent> {
        let now = Instant::now();
        let events = self.scheduler.drain_completions(&mut self.registry, now);
        self.ticks += 1;
        if self.ticks % self.config.flush().interval_ticks() == 0 {
            self.scheduler.flush(&mut self.registry, now);
        }
        events
    }

    /// Dispatches whatever is ready without waiting for the flush interval.
    pub fn flush_now(&mut self) -> usize {
        self.scheduler.flush(&mut self.registry, Instant::now())
    }

    pub fn flush_blocking(&mut self, timeout: Duration) -> Result<Vec<FlushEvent>, FlushError> {
        self.scheduler.flush_blocking(&mut self.registry, timeout)
    }

    /// Saves everything that is dirty, then stops the workers.
    pub fn shutdown(mut self, timeout: Duration) -> Result<(), FlushError> {
        let result = self.scheduler.flush_blocking(&mut self.registry, timeout).map(|_| ());
        self.scheduler.shutdown();
        tracing::info!(target: "guilds::registry", saved = result.is_ok(), "service.stopped");
        result
    }
}

fn observe<T>(operation: &'static str, result: Result<T, GuildError>) -> Result<T, GuildError> {
    if let Err(err) = &result {
        tracing::debug!(
            target: "guilds::registry",
            operation,
            kind = ?err.kind(),
            error = %err,
            "call.rejected"
        );
    }
    result
}
