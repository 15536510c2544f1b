use std::{
    collections::HashSet,
    env, fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::model::{Permissions, Rank};

pub const BUILTIN_GUILD_CONFIG: &str = include_str!("data/guild_config.json");

/// Upgrade whose level grants extra claim slots.
pub const CLAIM_SLOTS_UPGRADE: &str = "claim_slots";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuildConfig {
    storage: StorageConfig,
    flush: FlushConfig,
    claims: ClaimConfig,
    tiers: Vec<TierConfig>,
    ranks: Vec<Rank>,
    names: NameRules,
    server: ServerConfig,
}

impl Default for GuildConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            flush: FlushConfig::default(),
            claims: ClaimConfig::default(),
            tiers: vec![
                TierConfig::new(1, 0, 10, 5, 1),
                TierConfig::new(2, 1_000, 20, 10, 1),
                TierConfig::new(3, 5_000, 35, 20, 2),
                TierConfig::new(4, 15_000, 50, 35, 3),
                TierConfig::new(5, 40_000, 75, 50, 5),
            ],
            ranks: vec![
                Rank {
                    name: "leader".to_string(),
                    ordinal: 100,
                    permissions: Permissions::all(),
                },
                Rank {
                    name: "officer".to_string(),
                    ordinal: 50,
                    permissions: Permissions::CLAIM
                        | Permissions::UNCLAIM
                        | Permissions::INVITE
                        | Permissions::KICK
                        | Permissions::DEPOSIT
                        | Permissions::WITHDRAW
                        | Permissions::MANAGE_RANKS
                        | Permissions::SET_HOME,
                },
                Rank {
                    name: "member".to_string(),
                    ordinal: 10,
                    permissions: Permissions::CLAIM | Permissions::DEPOSIT,
                },
                Rank {
                    name: "recruit".to_string(),
                    ordinal: 0,
                    permissions: Permissions::DEPOSIT,
                },
            ],
            names: NameRules::default(),
            server: ServerConfig::default(),
        }
    }
}

impl GuildConfig {
    pub fn builtin() -> Self {
        serde_json::from_str(BUILTIN_GUILD_CONFIG).expect("builtin guild config should parse")
    }

    pub fn from_json_str(json: &str) -> Result<Self, GuildConfigError> {
        let config: GuildConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, GuildConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|source| GuildConfigError::ReadFailed {
                path: path.to_path_buf(),
                source,
            })?;
        GuildConfig::from_json_str(&contents)
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.database_path = path.into();
        self
    }

    pub fn validate(&self) -> Result<(), GuildConfigError> {
        if self.storage.pool_size == 0 {
            return Err(GuildConfigError::Invalid("storage.pool_size must be at least 1".into()));
        }
        if self.flush.worker_threads == 0 || self.flush.queue_capacity == 0 {
            return Err(GuildConfigError::Invalid(
                "flush.worker_threads and flush.queue_capacity must be at least 1".into(),
            ));
        }
        if self.flush.interval_ticks == 0 {
            return Err(GuildConfigError::Invalid("flush.interval_ticks must be at least 1".into()));
        }
        if self.tiers.is_empty() {
            return Err(GuildConfigError::Invalid("at least one tier is required".into()));
        }
        if self.tiers.windows(2).any(|pair| pair[0].level >= pair[1].level) {
            return Err(GuildConfigError::Invalid("tiers must be sorted by strictly increasing level".into()));
        }
        if self.ranks.is_empty() {
            return Err(GuildConfigError::Invalid("at least one rank is required".into()));
        }
        let mut ordinals = HashSet::new();
        for rank in &self.ranks {
            if !ordinals.insert(rank.ordinal) {
                return Err(GuildConfigError::Invalid(format!(
                    "duplicate rank ordinal {} ({})",
                    rank.ordinal, rank.name
                )));
            }
        }
        if self.server.tick_ms == 0 {
            return Err(GuildConfigError::Invalid("server.tick_ms must be at least 1".into()));
        }
        if self.names.min_len == 0 || self.names.min_len > self.names.max_len {
            return Err(GuildConfigError::Invalid("names.min_len must be within 1..=max_len".into()));
        }
        Ok(())
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    pub fn flush(&self) -> &FlushConfig {
        &self.flush
    }

    pub fn claims(&self) -> &ClaimConfig {
        &self.claims
    }

    pub fn names(&self) -> &NameRules {
        &self.names
    }

    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    pub fn tiers(&self) -> &[TierConfig] {
        &self.tiers
    }

    /// Rank template for new guilds, highest ordinal first.
    pub fn default_ranks(&self) -> Vec<Rank> {
        let mut ranks = self.ranks.clone();
        ranks.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
        ranks
    }

    /// Tier for `level`, or the highest tier below it when the table has gaps.
    pub fn tier(&self, level: u32) -> &TierConfig {
        self.tiers
            .iter()
            .rev()
            .find(|tier| tier.level <= level)
            .unwrap_or(&self.tiers[0])
    }

    pub fn next_tier(&self, level: u32) -> Option<&TierConfig> {
        self.tiers.iter().find(|tier| tier.level > level)
    }

    pub fn claim_limit(&self, level: u32, claim_slot_upgrades: u32) -> usize {
        let base = self.tier(level).max_claims;
        let bonus = claim_slot_upgrades.saturating_mul(self.claims.slots_per_upgrade_level);
        base.saturating_add(bonus) as usize
    }

    pub fn member_limit(&self, level: u32) -> usize {
        self.tier(level).member_limit as usize
    }

    pub fn home_limit(&self, level: u32) -> usize {
        self.tier(level).home_limit as usize
    }
}

#[derive(Debug, Error)]
pub enum GuildConfigError {
    #[error("failed to parse guild config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read guild config from {path:?}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid guild config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    database_path: PathBuf,
    pool_size: u32,
    acquire_timeout_ms: u64,
    busy_timeout_ms: u64,
}

impl StorageConfig {
    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("guilds.sqlite"),
            pool_size: 4,
            acquire_timeout_ms: 2_000,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    interval_ticks: u64,
    worker_threads: usize,
    queue_capacity: usize,
    retry: RetryConfig,
}

impl FlushConfig {
    pub fn interval_ticks(&self) -> u64 {
        self.interval_ticks
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval_ticks: 20,
            worker_threads: 2,
            queue_capacity: 256,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    multiplier: f64,
    alert_after_attempts: u32,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), capped at the maximum.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay_ms = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(delay_ms.min(self.max_backoff_ms as f64) as u64)
    }

    pub fn alert_after_attempts(&self) -> u32 {
        self.alert_after_attempts
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 250,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            alert_after_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    require_contiguous: bool,
    slots_per_upgrade_level: u32,
}

impl ClaimConfig {
    pub fn require_contiguous(&self) -> bool {
        self.require_contiguous
    }

    pub fn slots_per_upgrade_level(&self) -> u32 {
        self.slots_per_upgrade_level
    }
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            require_contiguous: false,
            slots_per_upgrade_level: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    pub level: u32,
    pub exp_required: u64,
    pub max_claims: u32,
    pub member_limit: u32,
    #[serde(default = "default_home_limit")]
    pub home_limit: u32,
}

fn default_home_limit() -> u32 {
    1
}

impl TierConfig {
    fn new(level: u32, exp_required: u64, max_claims: u32, member_limit: u32, home_limit: u32) -> Self {
        Self {
            level,
            exp_required,
            max_claims,
            member_limit,
            home_limit,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NameRules {
    min_len: usize,
    max_len: usize,
}

impl NameRules {
    pub fn accepts(&self, name: &str) -> bool {
        let len = name.chars().count();
        len >= self.min_len
            && len <= self.max_len
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl Default for NameRules {
    fn default() -> Self {
        Self {
            min_len: 3,
            max_len: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    command_bind: SocketAddr,
    tick_ms: u64,
    shutdown_timeout_ms: u64,
}

impl ServerConfig {
    pub fn command_bind(&self) -> SocketAddr {
        self.command_bind
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command_bind: SocketAddr::from(([127, 0, 0, 1], 41100)),
            tick_ms: 50,
            shutdown_timeout_ms: 10_000,
        }
    }
}

pub fn load_guild_config_from_env() -> (GuildConfig, Option<PathBuf>) {
    let override_path = env::var("GUILD_CONFIG_PATH").ok().map(PathBuf::from);
    let default_path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src/data/guild_config.json");

    let candidates: Vec<PathBuf> = match override_path {
        Some(ref path) => vec![path.clone()],
        None => vec![default_path],
    };

    for path in candidates {
        match GuildConfig::from_file(&path) {
            Ok(config) => {
                tracing::info!(
                    target: "guilds::config",
                    path = %path.display(),
                    "guild_config.loaded=file"
                );
                return (config, Some(path));
            }
            Err(err) => {
                tracing::warn!(
                    target: "guilds::config",
                    path = %path.display(),
                    error = %err,
                    "guild_config.load_failed"
                );
            }
        }
    }

    tracing::info!(target: "guilds::config", "guild_config.loaded=builtin");
    (GuildConfig::builtin(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_matches_defaults() {
        let builtin = GuildConfig::builtin();
        builtin.validate().expect("builtin config is valid");
        let defaults = GuildConfig::default();
        assert_eq!(builtin.tiers().len(), defaults.tiers().len());
        assert_eq!(builtin.default_ranks(), defaults.default_ranks());
        assert_eq!(builtin.claim_limit(1, 0), 10);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = GuildConfig::from_json_str(
            r#"{ "storage": { "pool_size": 2, "acquire_timeout_ms": 50 }, "claims": { "require_contiguous": true } }"#,
        )
        .expect("partial config parses");
        assert_eq!(config.storage().pool_size(), 2);
        assert_eq!(config.storage().acquire_timeout(), Duration::from_millis(50));
        assert!(config.claims().require_contiguous());
        assert_eq!(config.flush().interval_ticks(), 20);
        assert_eq!(config.member_limit(2), 10);
    }

    #[test]
    fn duplicate_rank_ordinals_are_rejected() {
        let err = GuildConfig::from_json_str(
            r#"{ "ranks": [
                { "name": "a", "ordinal": 5, "permissions": "CLAIM" },
                { "name": "b", "ordinal": 5, "permissions": "DEPOSIT" }
            ] }"#,
        )
        .expect_err("duplicate ordinals");
        assert!(matches!(err, GuildConfigError::Invalid(_)));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff_delay(1), Duration::from_millis(250));
        assert_eq!(retry.backoff_delay(2), Duration::from_millis(500));
        assert_eq!(retry.backoff_delay(3), Duration::from_millis(1_000));
        assert_eq!(retry.backoff_delay(40), Duration::from_millis(30_000));
    }

    #[test]
    fn claim_limit_includes_upgrade_slots_and_tier_gaps() {
        let config = GuildConfig::default();
        assert_eq!(config.claim_limit(1, 3), 16);
        assert_eq!(config.claim_limit(9, 0), 75);
        assert_eq!(config.next_tier(1).map(|tier| tier.level), Some(2));
        assert!(config.next_tier(5).is_none());
    }

    #[test]
    fn tiers_without_home_limit_allow_one_home() {
        let config = GuildConfig::from_json_str(
            r#"{ "tiers": [
                { "level": 1, "exp_required": 0, "max_claims": 4, "member_limit": 3 },
                { "level": 2, "exp_required": 100, "max_claims": 8, "member_limit": 6, "home_limit": 4 }
            ] }"#,
        )
        .expect("tiers parse");
        assert_eq!(config.home_limit(1), 1);
        assert_eq!(config.home_limit(2), 4);
        assert_eq!(GuildConfig::builtin().home_limit(5), 5);
    }
}
