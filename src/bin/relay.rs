//! relay CLI: run the bridge service or poke at its log and cache.

use anyhow::Context;
use clap::{Parser, Subcommand};
use relay_rs::bridge::{PublishMode, Publisher, PublisherConfig};
use relay_rs::config::Config;
use relay_rs::config::secrets::expose_optional;
use relay_rs::db::{Db, PgKv, PgLog};
use relay_rs::engine::{Backends, ControlPlane};
use relay_rs::log::DurableLog;
use relay_rs::model::{Delivery, Message, StartOffset};
use relay_rs::store::KeyedStore;
use relay_rs::telemetry::{TelemetryConfig, init_telemetry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "relay", about = "HTTP to log to cache message bridge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service, subscriber, and worker pool
    Serve {
        /// TOML config file (environment variables otherwise)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Publish one message and wait for the log to acknowledge it
    Publish {
        /// Message text
        message: String,
        /// Message uid (generated if omitted)
        #[arg(long)]
        uid: Option<String>,
    },
    /// Show one cached message
    Get {
        /// Message uid
        uid: String,
    },
    /// List cached keys
    Keys,
    /// Print records from the log
    Tail {
        /// Where to start: oldest or newest
        #[arg(long, default_value = "oldest")]
        from: StartOffset,
        /// Maximum records to print
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => cmd_serve(config).await,
        Command::Publish { message, uid } => {
            let config = Config::from_env()?;
            cmd_publish(&config, message, uid).await
        }
        Command::Get { uid } => {
            let config = Config::from_env()?;
            cmd_get(&config, uid).await
        }
        Command::Keys => {
            let config = Config::from_env()?;
            cmd_keys(&config).await
        }
        Command::Tail { from, limit } => {
            let config = Config::from_env()?;
            cmd_tail(&config, from, limit).await
        }
    }
}

async fn cmd_serve(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = match path {
        Some(path) => Config::from_file(&path)?,
        None => Config::from_env()?,
    };

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "relay"))?;

    let backends = Backends::connect(&config).await?;
    let control = ControlPlane::start(&config, backends).await?;

    let ctrl = Arc::clone(&control);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("interrupt received");
        ctrl.request_shutdown();
    });

    let addr = config.http_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(%addr, "listening");

    let ctrl = Arc::clone(&control);
    axum::serve(listener, relay_rs::http::router(Arc::clone(&control)))
        .with_graceful_shutdown(async move { ctrl.shutdown_requested().await })
        .await?;

    control.shutdown().await?;
    Ok(())
}

async fn connect(url: Option<&str>, name: &str) -> anyhow::Result<Db> {
    let url = url.with_context(|| format!("{name} must be set"))?;
    let db = Db::connect(url).await?;
    db.migrate().await?;
    Ok(db)
}

async fn cmd_publish(
    config: &Config,
    message: String,
    uid: Option<String>,
) -> anyhow::Result<()> {
    let db = connect(expose_optional(&config.broker_url), "BROKER_URL").await?;
    let publisher = Publisher::start(
        Arc::new(PgLog::new(db.clone())),
        PublisherConfig::new(config.topic_partition()).mode(PublishMode::Sync),
    );

    let message = match uid {
        Some(uid) => Message::new(uid, message),
        None => Message::generated(message),
    };
    let delivery = publisher.publish_entity(&message).await;
    publisher.close().await;
    db.close().await;

    match delivery? {
        Delivery::Acknowledged(offset) => println!(
            "Published: {} at {} offset {offset}",
            message.uid,
            config.topic_partition()
        ),
        Delivery::Enqueued => println!("Enqueued: {}", message.uid),
    }
    Ok(())
}

async fn cmd_get(config: &Config, uid: String) -> anyhow::Result<()> {
    let db = connect(expose_optional(&config.cache_url), "CACHE_URL").await?;
    let store = KeyedStore::<Message>::new(Arc::new(PgKv::new(db.clone())));
    let found = store.get(&Message::key_for(&uid)).await;
    db.close().await;

    match found? {
        Some(message) => {
            println!("UID:      {}", message.uid);
            println!("Message:  {}", message.message);
        }
        None => anyhow::bail!("no message with uid '{uid}'"),
    }
    Ok(())
}

async fn cmd_keys(config: &Config) -> anyhow::Result<()> {
    let db = connect(expose_optional(&config.cache_url), "CACHE_URL").await?;
    let store = KeyedStore::<Message>::new(Arc::new(PgKv::new(db.clone())));
    let keys = store.keys().await;
    db.close().await;

    let keys = keys?;
    if keys.is_empty() {
        println!("No cached keys.");
        return Ok(());
    }
    for key in &keys {
        println!("{key}");
    }
    println!("\n{} key(s)", keys.len());
    Ok(())
}

async fn cmd_tail(config: &Config, from: StartOffset, limit: usize) -> anyhow::Result<()> {
    let db = connect(expose_optional(&config.broker_url), "BROKER_URL").await?;
    let log = PgLog::new(db.clone());
    let tp = config.topic_partition();

    let records = async {
        let start = match from {
            StartOffset::Oldest => log.earliest_offset(&tp).await?,
            StartOffset::Newest => {
                let next = log.next_offset(&tp).await?;
                next.saturating_sub(limit as i64).max(0)
            }
        };
        log.read(&tp, start, limit).await
    }
    .await;
    db.close().await;

    let records = records?;
    if records.is_empty() {
        println!("No records in {tp}.");
        return Ok(());
    }

    println!("{:<8}  {:<48}  {:<16}  PAYLOAD", "OFFSET", "KEY", "PRODUCED");
    println!("{}", "-".repeat(100));
    for record in &records {
        println!(
            "{:<8}  {:<48}  {:<16}  {}",
            record.offset,
            record.key,
            record.produced_at.format("%Y-%m-%d %H:%M"),
            String::from_utf8_lossy(&record.payload)
        );
    }
    println!("\n{} record(s)", records.len());
    Ok(())
}
