#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use guild_core::{
    ClaimChange, ClaimObserver, EconomyError, EconomyProvider, GuildConfig, GuildService, PlayerId,
};
use tempfile::TempDir;

static INIT: Once = Once::new();

pub const SAVE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A database directory that outlives individual service instances.
pub struct TestStore {
    pub dir: TempDir,
}

impl TestStore {
    pub fn new() -> anyhow::Result<Self> {
        init_tracing();
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn config(&self) -> GuildConfig {
        GuildConfig::builtin().with_database_path(self.dir.path().join("guilds.sqlite"))
    }

    pub fn start(&self) -> anyhow::Result<GuildService> {
        self.start_with(TestEconomy::default())
    }

    pub fn start_with(&self, economy: TestEconomy) -> anyhow::Result<GuildService> {
        Ok(GuildService::start(self.config(), Box::new(economy))?)
    }
}

/// Player wallets shared with the test body so balances can be checked
/// after the service has taken ownership of the provider.
#[derive(Clone, Default)]
pub struct TestEconomy {
    wallets: Arc<Mutex<HashMap<PlayerId, i128>>>,
}

impl TestEconomy {
    pub fn grant(&self, player: PlayerId, amount: i128) {
        *self.wallets.lock().unwrap().entry(player).or_default() += amount;
    }

    pub fn balance(&self, player: PlayerId) -> i128 {
        self.wallets.lock().unwrap().get(&player).copied().unwrap_or(0)
    }
}

impl EconomyProvider for TestEconomy {
    fn debit(&mut self, player: PlayerId, amount: i64) -> Result<(), EconomyError> {
        let mut wallets = self.wallets.lock().unwrap();
        let wallet = wallets.entry(player).or_default();
        if *wallet < amount as i128 {
            return Err(EconomyError::InsufficientFunds { player, amount });
        }
        *wallet -= amount as i128;
        Ok(())
    }

    fn credit(&mut self, player: PlayerId, amount: i64) -> Result<(), EconomyError> {
        *self.wallets.lock().unwrap().entry(player).or_default() += amount as i128;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingObserver {
    pub changes: Arc<Mutex<Vec<ClaimChange>>>,
}

impl RecordingObserver {
    pub fn take(&self) -> Vec<ClaimChange> {
        std::mem::take(&mut *self.changes.lock().unwrap())
    }
}

impl ClaimObserver for RecordingObserver {
    fn claim_changed(&self, change: &ClaimChange) {
        self.changes.lock().unwrap().push(change.clone());
    }
}
