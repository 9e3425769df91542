use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use distinctid::{GeneratorConfig, Layout, RetryPolicy, StoreConfig};
use std::time::Duration;

/// Command line and environment configuration for the `distinctid` binary.
///
/// Every store and generator setting can come from a flag or from the
/// environment (a `.env` file in the working directory is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "distinctid",
    version,
    about = "Distinct, time-sortable 64-bit ids backed by Redis counters"
)]
pub struct CliArgs {
    /// Redis host. Ignored when sentinels are configured.
    ///
    /// Environment variable: `DISTINCTID_REDIS_HOST`
    #[arg(long, env = "DISTINCTID_REDIS_HOST", default_value_t = String::from("localhost"))]
    pub redis_host: String,

    /// Redis port.
    ///
    /// Environment variable: `DISTINCTID_REDIS_PORT`
    #[arg(long, env = "DISTINCTID_REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    /// Logical database holding the counters.
    ///
    /// Environment variable: `DISTINCTID_REDIS_DB`
    #[arg(long, env = "DISTINCTID_REDIS_DB", default_value_t = 0)]
    pub redis_db: u32,

    /// Environment variable: `DISTINCTID_REDIS_PASSWORD`
    #[arg(long, env = "DISTINCTID_REDIS_PASSWORD", hide_env_values = true)]
    pub redis_password: Option<String>,

    /// ACL user name; only sent together with a password.
    ///
    /// Environment variable: `DISTINCTID_REDIS_USERNAME`
    #[arg(long, env = "DISTINCTID_REDIS_USERNAME")]
    pub redis_username: Option<String>,

    /// Upper bound on pooled connections.
    ///
    /// Environment variable: `DISTINCTID_REDIS_MAX_CONNECTIONS`
    #[arg(long, env = "DISTINCTID_REDIS_MAX_CONNECTIONS", default_value_t = 50)]
    pub redis_max_connections: usize,

    /// Connect and per-command timeout in milliseconds.
    ///
    /// Environment variable: `DISTINCTID_REDIS_SOCKET_TIMEOUT_MS`
    #[arg(long, env = "DISTINCTID_REDIS_SOCKET_TIMEOUT_MS", default_value_t = 5_000)]
    pub redis_socket_timeout_ms: u64,

    /// Comma separated `host:port` list of sentinels. When set, the primary
    /// is discovered through them.
    ///
    /// Environment variable: `DISTINCTID_REDIS_SENTINELS`
    #[arg(long, env = "DISTINCTID_REDIS_SENTINELS")]
    pub redis_sentinels: Option<String>,

    /// Service name monitored by the sentinels.
    ///
    /// Environment variable: `DISTINCTID_REDIS_SERVICE_NAME`
    #[arg(long, env = "DISTINCTID_REDIS_SERVICE_NAME", default_value_t = String::from("mymaster"))]
    pub redis_service_name: String,

    /// Counter keys are `<prefix>:<shard>:seq`.
    ///
    /// Environment variable: `DISTINCTID_KEY_PREFIX`
    #[arg(long, env = "DISTINCTID_KEY_PREFIX", default_value_t = String::from("shard"))]
    pub key_prefix: String,

    /// Attempts per store round trip, the first one included.
    ///
    /// Environment variable: `DISTINCTID_RETRY_ATTEMPTS`
    #[arg(long, env = "DISTINCTID_RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    /// Values claimed per round trip for single ids; 0 disables buffering.
    ///
    /// Environment variable: `DISTINCTID_BUFFER_SIZE`
    #[arg(long, env = "DISTINCTID_BUFFER_SIZE", default_value_t = 0)]
    pub buffer_size: u64,

    /// Bit split of the generated ids.
    ///
    /// Environment variable: `DISTINCTID_LAYOUT`
    #[arg(long, env = "DISTINCTID_LAYOUT", value_enum, default_value_t = LayoutArg::Twitter)]
    pub layout: LayoutArg,

    /// Log the elapsed time of every generation call.
    ///
    /// Environment variable: `DISTINCTID_LOG_TIMINGS`
    #[arg(long, env = "DISTINCTID_LOG_TIMINGS", default_value_t = false)]
    pub log_timings: bool,

    /// Shard the ids are generated for.
    ///
    /// Environment variable: `SHARD_ID`
    #[arg(long, env = "SHARD_ID", default_value_t = 1, allow_negative_numbers = true)]
    pub shard_id: i64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print single ids, one per line.
    Next {
        /// How many ids to print.
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u64,
        /// Print zero padded 20-digit ids.
        #[arg(long, default_value_t = false)]
        padded: bool,
    },
    /// Print a batch of ids claimed with a single round trip.
    Batch {
        #[arg(short = 'n', long, allow_negative_numbers = true)]
        count: i64,
    },
    /// Exit with status 0 if the store answers PING, 1 otherwise.
    Health,
    /// Split an id into timestamp, shard and sequence.
    Decode { id: u64 },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutArg {
    /// 41-bit timestamp, 10-bit shard, 12-bit sequence.
    Twitter,
    /// 40-bit timestamp, 13-bit shard, 10-bit sequence.
    Legacy,
}

impl From<LayoutArg> for Layout {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::Twitter => Layout::TWITTER,
            LayoutArg::Legacy => Layout::LEGACY,
        }
    }
}

/// Validated settings for one run.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub generator: GeneratorConfig,
    pub shard_id: i64,
    pub command: Command,
}

impl TryFrom<CliArgs> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.redis_max_connections == 0 {
            bail!("DISTINCTID_REDIS_MAX_CONNECTIONS must be greater than 0");
        }
        if args.redis_socket_timeout_ms == 0 {
            bail!("DISTINCTID_REDIS_SOCKET_TIMEOUT_MS must be greater than 0");
        }
        if args.retry_attempts == 0 {
            bail!("DISTINCTID_RETRY_ATTEMPTS must be greater than 0");
        }

        let layout = Layout::from(args.layout);
        if args.shard_id < 0 || args.shard_id as u64 > layout.max_shard() {
            bail!(
                "SHARD_ID ({}) is outside the {:?} layout's range 0..={}",
                args.shard_id,
                args.layout,
                layout.max_shard()
            );
        }

        let mut store = match args.redis_sentinels.as_deref() {
            Some(list) if !list.trim().is_empty() => {
                StoreConfig::sentinel(parse_sentinels(list)?, args.redis_service_name)
            }
            _ => StoreConfig::standalone(args.redis_host, args.redis_port),
        }
        .with_db(args.redis_db)
        .with_max_connections(args.redis_max_connections)
        .with_socket_timeout(Duration::from_millis(args.redis_socket_timeout_ms));

        match (args.redis_password, args.redis_username) {
            (Some(password), username) => {
                store = store.with_password(password);
                if let Some(username) = username {
                    store = store.with_username(username);
                }
            }
            (None, Some(_)) => bail!("DISTINCTID_REDIS_USERNAME requires DISTINCTID_REDIS_PASSWORD"),
            (None, None) => {}
        }

        let generator = GeneratorConfig::default()
            .with_layout(layout)
            .with_key_prefix(args.key_prefix)
            .with_buffer_size(args.buffer_size)
            .with_retry(RetryPolicy::default().with_max_attempts(args.retry_attempts))
            .with_log_timings(args.log_timings);

        Ok(Self {
            store,
            generator,
            shard_id: args.shard_id,
            command: args.command,
        })
    }
}

/// Parses `host:port[,host:port...]`.
fn parse_sentinels(list: &str) -> anyhow::Result<Vec<(String, u16)>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (host, port) = entry
                .rsplit_once(':')
                .with_context(|| format!("sentinel `{entry}` is not host:port"))?;
            let port = port
                .parse()
                .with_context(|| format!("sentinel `{entry}` has an invalid port"))?;
            Ok((host.to_owned(), port))
        })
        .collect()
}
