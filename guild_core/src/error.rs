use thiserror::Error;

use crate::economy::EconomyError;
use crate::model::{ClaimKey, GuildId, PlayerId};

/// Failure taxonomy shared by every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; nothing changed.
    Validation,
    /// Lost a race; nothing changed.
    Concurrency,
    /// Storage hiccup; retried with backoff.
    TransientStore,
    /// Store contents disagree with memory; guild is quarantined.
    Corruption,
}

#[derive(Debug, Error)]
pub enum GuildError {
    #[error("a guild named `{0}` already exists")]
    DuplicateName(String),
    #[error("guild name `{0}` is not allowed")]
    InvalidName(String),
    #[error("guild {0} not found")]
    NotFound(GuildId),
    #[error("player {player} is not a member of guild {guild}")]
    NotMember { guild: GuildId, player: PlayerId },
    #[error("player {player} already belongs to guild {guild}")]
    AlreadyInGuild { guild: GuildId, player: PlayerId },
    #[error("guild {guild} ownership cannot move: {reason}")]
    InvalidOwnershipTransfer { guild: GuildId, reason: &'static str },
    #[error("player {player} lacks the permission for this action in guild {guild}")]
    PermissionDenied { guild: GuildId, player: PlayerId },
    #[error("player {player} cannot manage ranks at or above their own in guild {guild}")]
    InsufficientRank { guild: GuildId, player: PlayerId },
    #[error("guild {guild} has no rank with ordinal {ordinal}")]
    RankNotFound { guild: GuildId, ordinal: u16 },
    #[error("guild {guild} is full ({limit} members)")]
    MemberLimitReached { guild: GuildId, limit: usize },
    #[error("player {player} has no pending invite from guild {guild}")]
    NoInvite { guild: GuildId, player: PlayerId },
    #[error("guild {guild} bank holds {balance}, cannot withdraw {requested}")]
    InsufficientFunds {
        guild: GuildId,
        balance: i64,
        requested: i64,
    },
    #[error("home name `{0}` is not allowed")]
    InvalidHomeName(String),
    #[error("guild {guild} has no home named `{name}`")]
    HomeNotFound { guild: GuildId, name: String },
    #[error("guild {guild} is at its home limit of {limit}")]
    HomeLimitReached { guild: GuildId, limit: usize },
    #[error("amount {0} must be positive")]
    InvalidAmount(i64),
    #[error("economy provider refused the transfer: {0}")]
    Economy(#[from] EconomyError),
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error("guild {0} is quarantined after a store corruption error")]
    Quarantined(GuildId),
    #[error("guild {0} is being disbanded")]
    Retired(GuildId),
}

impl GuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GuildError::Claim(err) => err.kind(),
            GuildError::Economy(EconomyError::Unavailable(_)) => ErrorKind::TransientStore,
            GuildError::Quarantined(_) => ErrorKind::Corruption,
            GuildError::Retired(_) => ErrorKind::Concurrency,
            _ => ErrorKind::Validation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimError {
    #[error("{key} is already claimed by guild {owner}")]
    AlreadyClaimed { key: ClaimKey, owner: GuildId },
    #[error("guild {guild} is at its claim limit of {limit}")]
    LimitExceeded { guild: GuildId, limit: usize },
    #[error("{0} is not claimed")]
    NotClaimed(ClaimKey),
    #[error("{key} belongs to guild {owner}, not guild {guild}")]
    NotOwner {
        key: ClaimKey,
        guild: GuildId,
        owner: GuildId,
    },
    #[error("{0} does not border an existing claim in its world")]
    NotContiguous(ClaimKey),
    #[error("unclaiming {0} would break the guild's contiguous territory")]
    WouldBreakContiguity(ClaimKey),
}

impl ClaimError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClaimError::AlreadyClaimed { .. } => ErrorKind::Concurrency,
            _ => ErrorKind::Validation,
        }
    }
}
