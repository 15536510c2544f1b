use thiserror::Error;

use crate::model::PlayerId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EconomyError {
    #[error("player {player} cannot cover {amount}")]
    InsufficientFunds { player: PlayerId, amount: i64 },
    #[error("economy provider unavailable: {0}")]
    Unavailable(String),
}

/// Player currency, owned by the host. Called on the tick thread.
pub trait EconomyProvider: Send {
    fn debit(&mut self, player: PlayerId, amount: i64) -> Result<(), EconomyError>;
    fn credit(&mut self, player: PlayerId, amount: i64) -> Result<(), EconomyError>;
}

/// Used when the host has no economy; every transfer is refused.
#[derive(Debug, Default)]
pub struct NoEconomy;

impl EconomyProvider for NoEconomy {
    fn debit(&mut self, _player: PlayerId, _amount: i64) -> Result<(), EconomyError> {
        Err(EconomyError::Unavailable("no economy provider installed".into()))
    }

    fn credit(&mut self, _player: PlayerId, _amount: i64) -> Result<(), EconomyError> {
        Err(EconomyError::Unavailable("no economy provider installed".into()))
    }
}
