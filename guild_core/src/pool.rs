//! Bounded pool of SQLite connections shared by the flush workers.
//!
//! Connections are validated on checkout and replaced when the probe fails.
//! Acquisition only ever happens on worker threads or during startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;

use crate::config::StorageConfig;

pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to open connection pool for {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: r2d2::Error,
    },
    #[error("timed out after {waited:?} waiting for a store connection")]
    Timeout {
        waited: Duration,
        #[source]
        source: r2d2::Error,
    },
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: r2d2::Pool<SqliteConnectionManager>,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    pub fn open(path: &Path, storage: &StorageConfig) -> Result<Self, PoolError> {
        let busy_timeout = storage.busy_timeout();
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        });

        let inner = r2d2::Pool::builder()
            .max_size(storage.pool_size())
            .connection_timeout(storage.acquire_timeout())
            .test_on_check_out(true)
            .build(manager)
            .map_err(|source| PoolError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        tracing::info!(
            target: "guilds::store",
            path = %path.display(),
            size = storage.pool_size(),
            acquire_timeout_ms = storage.acquire_timeout().as_millis() as u64,
            "pool.opened"
        );

        Ok(Self {
            inner,
            acquire_timeout: storage.acquire_timeout(),
        })
    }

    /// Blocks up to the configured acquisition timeout.
    pub fn acquire(&self) -> Result<PooledConnection, PoolError> {
        self.acquire_timeout(self.acquire_timeout)
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection, PoolError> {
        self.inner.get_timeout(timeout).map_err(|source| {
            tracing::warn!(
                target: "guilds::store",
                waited_ms = timeout.as_millis() as u64,
                "pool.acquire_timeout"
            );
            PoolError::Timeout {
                waited: timeout,
                source,
            }
        })
    }

    /// Returns a connection to the pool. Dropping it has the same effect.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    pub fn max_size(&self) -> u32 {
        self.inner.max_size()
    }

    pub fn idle_connections(&self) -> u32 {
        self.inner.state().idle_connections
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use crossbeam_channel::bounded;

    use super::*;
    use crate::config::GuildConfig;

    fn small_pool(dir: &tempfile::TempDir) -> ConnectionPool {
        let config = GuildConfig::from_json_str(
            r#"{ "storage": { "pool_size": 2, "acquire_timeout_ms": 50 } }"#,
        )
        .expect("config");
        ConnectionPool::open(&dir.path().join("pool.sqlite"), config.storage()).expect("pool")
    }

    #[test]
    fn third_acquire_times_out_when_exhausted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = small_pool(&dir);
        let first = pool.acquire().expect("first");
        let second = pool.acquire().expect("second");

        let started = Instant::now();
        let err = pool.acquire().expect_err("pool exhausted");
        assert!(matches!(err, PoolError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));

        pool.release(first);
        pool.release(second);
        assert_eq!(pool.max_size(), 2);
    }

    #[test]
    fn waiting_acquire_succeeds_after_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = small_pool(&dir);
        let first = pool.acquire().expect("first");
        let _second = pool.acquire().expect("second");

        let (ready_tx, ready_rx) = bounded(1);
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                ready_tx.send(()).expect("signal");
                pool.acquire_timeout(Duration::from_secs(2)).map(|_| ())
            })
        };

        ready_rx.recv().expect("waiter started");
        thread::sleep(Duration::from_millis(10));
        pool.release(first);
        waiter.join().expect("join").expect("acquired after release");
    }

    #[test]
    fn connections_are_usable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = small_pool(&dir);
        let conn = pool.acquire().expect("conn");
        let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0)).expect("query");
        assert_eq!(one, 1);
    }
}
