//! A Redis backed [`CounterStore`].
//!
//! Speaks RESP2 over a small pool of TCP connections. Counters are advanced
//! with `INCRBY`, so every range claim is a single atomic command on the
//! primary. Two topologies are supported: a standalone server, and a
//! sentinel-managed deployment where the primary's address is resolved with
//! `SENTINEL get-master-addr-by-name` and re-resolved after a failover.

mod connection;
#[cfg(test)]
pub(crate) mod fake;
mod pool;
mod resp;

pub use pool::PoolStats;

use super::CounterStore;
use crate::{Error, Result, StoreError};
use connection::{Connection, Handshake};
use core::{fmt, time::Duration};
use parking_lot::Mutex;
use pool::Pool;

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// One server at a fixed address.
    Standalone { host: String, port: u16 },
    /// A primary discovered through sentinels.
    Sentinel {
        /// Sentinel addresses, tried in order.
        sentinels: Vec<(String, u16)>,
        /// The monitored service (master) name.
        service_name: String,
        /// Password for the sentinels themselves, if they require one.
        sentinel_password: Option<String>,
    },
}

/// Connection settings for a [`RedisStore`].
///
/// The defaults match a local server: `localhost:6379`, database 0, no
/// credentials, 50 pooled connections and a 5 second socket timeout.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub topology: Topology,
    /// Logical database selected on every new connection.
    pub db: u32,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Upper bound on concurrently open connections.
    pub max_connections: usize,
    /// Bound for connecting and for each command round trip.
    pub socket_timeout: Duration,
    /// Idle connections older than this are closed instead of reused. Zero
    /// disables the check.
    pub idle_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::standalone("localhost", 6379)
    }
}

impl StoreConfig {
    pub const DEFAULT_MAX_CONNECTIONS: usize = 50;
    pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

    pub fn standalone(host: impl Into<String>, port: u16) -> Self {
        Self::with_topology(Topology::Standalone {
            host: host.into(),
            port,
        })
    }

    pub fn sentinel<I, H>(sentinels: I, service_name: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = (H, u16)>,
        H: Into<String>,
    {
        Self::with_topology(Topology::Sentinel {
            sentinels: sentinels
                .into_iter()
                .map(|(host, port)| (host.into(), port))
                .collect(),
            service_name: service_name.into(),
            sentinel_password: None,
        })
    }

    fn with_topology(topology: Topology) -> Self {
        Self {
            topology,
            db: 0,
            username: None,
            password: None,
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            socket_timeout: Self::DEFAULT_SOCKET_TIMEOUT,
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// ACL user name, sent with the password as `AUTH <user> <password>`.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Password for the sentinels. Ignored for standalone topologies.
    pub fn with_sentinel_password(mut self, password: impl Into<String>) -> Self {
        if let Topology::Sentinel {
            sentinel_password, ..
        } = &mut self.topology
        {
            *sentinel_password = Some(password.into());
        }
        self
    }

    pub fn with_max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::validation("max_connections", "must be at least 1"));
        }
        if self.socket_timeout.is_zero() {
            return Err(Error::validation("socket_timeout", "must be non-zero"));
        }
        match &self.topology {
            Topology::Standalone { host, .. } if host.is_empty() => {
                Err(Error::validation("host", "must not be empty"))
            }
            Topology::Sentinel { sentinels, .. } if sentinels.is_empty() => {
                Err(Error::validation("sentinels", "at least one sentinel is required"))
            }
            Topology::Sentinel { service_name, .. } if service_name.is_empty() => {
                Err(Error::validation("service_name", "must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

// Credentials stay out of logs.
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("topology", &self.topology)
            .field("db", &self.db)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("max_connections", &self.max_connections)
            .field("socket_timeout", &self.socket_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

/// Counter store backed by Redis.
///
/// Construction does not touch the network; connections are opened on first
/// use. Safe to share between tasks and threads.
#[derive(Debug)]
pub struct RedisStore {
    config: StoreConfig,
    handshake: Handshake,
    pool: Pool,
    primary: Mutex<Option<(String, u16)>>,
}

impl RedisStore {
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an unusable configuration.
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let handshake = Handshake {
            username: config.username.clone(),
            password: config.password.clone(),
            db: config.db,
        };
        let pool = Pool::new(
            config.max_connections,
            config.idle_timeout,
            config.socket_timeout,
        );
        let primary = match &config.topology {
            Topology::Standalone { host, port } => Some((host.clone(), *port)),
            Topology::Sentinel { .. } => None,
        };
        Ok(Self {
            config,
            handshake,
            pool,
            primary: Mutex::new(primary),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Closes idle connections and rejects further commands with
    /// [`StoreError::PoolClosed`].
    pub fn close(&self) {
        self.pool.close();
    }

    /// The primary's address, resolving it through the sentinels if needed.
    async fn primary(&self) -> Result<(String, u16), StoreError> {
        let cached = self.primary.lock().clone();
        if let Some(addr) = cached {
            return Ok(addr);
        }

        let Topology::Sentinel {
            sentinels,
            service_name,
            sentinel_password,
        } = &self.config.topology
        else {
            return Err(StoreError::Protocol("standalone address missing".to_owned()));
        };

        let handshake = Handshake {
            password: sentinel_password.clone(),
            ..Handshake::default()
        };
        for (host, port) in sentinels {
            let resolved = async {
                let mut conn =
                    Connection::connect(host, *port, &handshake, self.config.socket_timeout)
                        .await?;
                conn.primary_address(service_name).await
            }
            .await;

            match resolved {
                Ok(Some(addr)) => {
                    #[cfg(feature = "tracing")]
                    tracing::info!(
                        sentinel = %format_args!("{host}:{port}"),
                        primary = %format_args!("{}:{}", addr.0, addr.1),
                        service = %service_name,
                        "resolved primary"
                    );
                    *self.primary.lock() = Some(addr.clone());
                    return Ok(addr);
                }
                Ok(None) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(sentinel = %format_args!("{host}:{port}"), service = %service_name, "sentinel does not know the service");
                }
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(sentinel = %format_args!("{host}:{port}"), error = %_err, "sentinel unreachable");
                }
            }
        }

        Err(StoreError::NoPrimary {
            service: service_name.clone(),
            sentinels: sentinels.len(),
        })
    }

    async fn open(&self) -> Result<Connection, StoreError> {
        let (host, port) = self.primary().await?;
        Connection::connect(&host, port, &self.handshake, self.config.socket_timeout).await
    }
}

impl CounterStore for RedisStore {
    async fn incr_by(&self, key: &str, by: u64) -> Result<u64, StoreError> {
        let mut conn = self.pool.get(|| self.open()).await?;
        let value = conn.incr_by(key, by).await?;
        conn.release();
        Ok(value)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.get(|| self.open()).await?;
        conn.ping().await?;
        conn.release();
        Ok(())
    }

    async fn reset(&self) {
        self.pool.clear();
        if matches!(self.config.topology, Topology::Sentinel { .. }) {
            *self.primary.lock() = None;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!("connection pool reset");
    }
}
