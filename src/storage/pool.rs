//! Bounded PostgreSQL connection pool.
//!
//! Every logical operation takes an exclusive connection for its duration.
//! Connections are returned to the pool when the guard drops, which covers
//! success, error and cancellation of the calling future alike.

use std::future::Future;
use std::time::{Duration, Instant};

use backon::{BackoffBuilder, Retryable};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Postgres;
use tracing::{info, warn};

use crate::error::{HistoryError, Result};
use crate::utils::retry::{connect_backoff, is_retryable, transient_backoff};

/// Sizing and timing of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub min_size: u32,
    pub max_size: u32,
    /// How long a caller waits for a free connection before `PoolExhausted`.
    pub acquire_timeout: Duration,
    /// Idle connections beyond `min_size` are closed after this long.
    pub idle_timeout: Duration,
    /// Silent retries after a connection-level failure.
    pub connect_retries: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 5,
            max_size: 20,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            connect_retries: 3,
        }
    }
}

impl PoolSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(HistoryError::Validation(
                "max_pool_size must be at least 1".into(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(HistoryError::Validation(format!(
                "min_pool_size ({}) exceeds max_pool_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(HistoryError::Validation(
                "acquire timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .min_connections(self.min_size)
            .max_connections(self.max_size)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(Some(self.idle_timeout))
            .test_before_acquire(true)
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub min_size: u32,
    pub max_size: u32,
    /// Open connections (idle plus in use).
    pub size: u32,
    pub idle: u32,
    pub active: u32,
}

/// Shared connection pool. Cloning shares the same underlying pool.
#[derive(Clone)]
pub struct ConnectionPool {
    pool: PgPool,
    settings: PoolSettings,
}

impl ConnectionPool {
    /// Open the pool, retrying transient connection failures.
    pub async fn connect(options: PgConnectOptions, settings: PoolSettings) -> Result<Self> {
        settings.validate()?;

        let pool = (|| {
            let options = options.clone();
            let pool_options = settings.pool_options();
            async move {
                pool_options
                    .connect_with(options)
                    .await
                    .map_err(HistoryError::from)
            }
        })
        .retry(connect_backoff(settings.connect_retries))
        .when(is_retryable)
        .notify(|err: &HistoryError, dur: Duration| {
            warn!(error = %err, delay = ?dur, "Database connection failed, retrying");
        })
        .await?;

        info!(
            host = options.get_host(),
            port = options.get_port(),
            min = settings.min_size,
            max = settings.max_size,
            "Connection pool opened"
        );
        Ok(Self { pool, settings })
    }

    /// Pool that opens connections on first use.
    pub fn connect_lazy(options: PgConnectOptions, settings: PoolSettings) -> Result<Self> {
        settings.validate()?;
        let pool = settings.pool_options().connect_lazy_with(options);
        Ok(Self { pool, settings })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Underlying sqlx pool, for callers that manage their own statements.
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    /// Take an exclusive connection, waiting up to the acquire timeout.
    pub async fn acquire(&self) -> Result<PoolConnection<Postgres>> {
        let started = Instant::now();
        match self.pool.acquire().await {
            Ok(conn) => Ok(conn),
            Err(sqlx::Error::PoolTimedOut) => Err(HistoryError::PoolExhausted {
                waited: started.elapsed(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Run `op` on an exclusive connection.
    ///
    /// A connection-level failure discards the attempt and re-runs `op` on a
    /// fresh connection, up to `connect_retries` times. Any other error is
    /// returned as is.
    pub async fn with_connection<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(PoolConnection<Postgres>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delays = transient_backoff(self.settings.connect_retries).build();
        loop {
            let conn = self.acquire().await?;
            match op(conn).await {
                Err(err) if is_retryable(&err) => match delays.next() {
                    Some(delay) => {
                        warn!(error = %err, delay = ?delay, "Connection failure, retrying on a fresh connection");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                },
                result => return result,
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let size = self.pool.size();
        let idle = u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX).min(size);
        PoolStatus {
            min_size: self.settings.min_size,
            max_size: self.settings.max_size,
            size,
            idle,
            active: size - idle,
        }
    }

    /// Close every connection; later acquisitions fail with `PoolClosed`.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
