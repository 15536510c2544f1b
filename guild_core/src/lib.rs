//! Guild state and claim consistency engine for a tick-driven game server.
//!
//! The tick thread owns all guild and claim state through [`GuildService`];
//! durable storage is updated behind it by a pool of flush workers that talk
//! to SQLite over pooled connections.

pub mod claims;
pub mod config;
pub mod economy;
mod error;
pub mod job;
pub mod migrations;
mod model;
pub mod pool;
mod registry;
pub mod repository;
pub mod scheduler;
mod service;

pub use claims::{ClaimChange, ClaimManager, ClaimObserver};
pub use config::{load_guild_config_from_env, GuildConfig, GuildConfigError, CLAIM_SLOTS_UPGRADE};
pub use economy::{EconomyError, EconomyProvider, NoEconomy};
pub use error::{ClaimError, ErrorKind, GuildError};
pub use job::{Mutation, PersistenceJob};
pub use model::{
    now_millis, ChunkCoord, Claim, ClaimKey, Guild, GuildHome, GuildId, GuildRow, LedgerEntry, Member,
    Permissions, PlayerId, Rank,
};
pub use pool::{ConnectionPool, PoolError};
pub use registry::{GuildRegistry, RetiredGuild};
pub use repository::{BalanceAudit, BatchWriter, GuildRepository, GuildSnapshot, StoreError};
pub use scheduler::{FlushError, FlushEvent, WriteBehindScheduler};
pub use service::{GuildService, StartupError};
