#![doc = include_str!("../README.md")]

mod config;
mod telemetry;

use clap::Parser;
use config::{AppConfig, CliArgs, Command};
use distinctid::{
    CUSTOM_EPOCH, DistinctId, Generator, GeneratorConfig, Layout, RedisStore, StoreConfig,
};
use std::io::{BufWriter, Write};
use std::process::ExitCode;
use telemetry::init_telemetry;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = AppConfig::try_from(args)?;

    init_telemetry()?;

    match config.command {
        Command::Decode { id } => {
            decode(config.generator.layout, DistinctId::from_raw(id));
            Ok(ExitCode::SUCCESS)
        }
        Command::Next { count, padded } => {
            let mut generator = connect(config.store, config.generator, config.shard_id)?;
            let mut out = BufWriter::new(std::io::stdout().lock());
            for _ in 0..count {
                let id = generator.distinct_async(config.shard_id).await?;
                if padded {
                    writeln!(out, "{}", id.to_padded_string())?;
                } else {
                    writeln!(out, "{id}")?;
                }
            }
            out.flush()?;
            tracing::debug!(stats = ?generator.stats(), "done");
            Ok(ExitCode::SUCCESS)
        }
        Command::Batch { count } => {
            let mut generator = connect(config.store, config.generator, config.shard_id)?;
            let ids = generator
                .distinct_batch_async(count, config.shard_id)
                .await?;
            let mut out = BufWriter::new(std::io::stdout().lock());
            for id in ids {
                writeln!(out, "{id}")?;
            }
            out.flush()?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Health => {
            let generator = connect(config.store, config.generator, config.shard_id)?;
            if generator.health_check().await {
                println!("ok");
                Ok(ExitCode::SUCCESS)
            } else {
                tracing::error!("coordination store did not answer PING");
                println!("unavailable");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

fn connect(
    store: StoreConfig,
    generator: GeneratorConfig,
    shard_id: i64,
) -> anyhow::Result<Generator<RedisStore>> {
    tracing::debug!(?store, shard_id, "connecting");
    Ok(Generator::connect(store, generator)?)
}

fn decode(layout: Layout, id: DistinctId) {
    let parts = layout.decode(id);
    let unix_ms = parts.timestamp + CUSTOM_EPOCH.as_millis() as u64;
    println!("{:?}", layout.describe(id));
    println!("unix_ms: {unix_ms}");
    if !layout.is_valid(id) {
        println!("warning: reserved bits are set; not an id of this layout");
    }
}
