use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use tile_worker::{
    config::Config,
    decision::{DecisionEngine, DecisionPolicy},
    grid::Tile,
    processor::TileProcessor,
    provider::HttpMapProvider,
    queue::{Consumer, TileJob, sqlite::SqliteQueue},
    remote::HttpRemoteTruth,
    splitter::ImageSplitter,
    storage::StorageBackend,
    tracking::sqlite::SqliteTracking,
};
use tracing::{error, info};

#[derive(Parser)]
struct Opts {
    #[clap(short, long, env = "TILE_WORKER_CONFIG")]
    config: PathBuf,
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Consume rendering jobs until interrupted
    Work,
    /// Push a rendering job to the queue
    Enqueue {
        #[clap(long)]
        z: u8,
        #[clap(long)]
        x: u32,
        #[clap(long)]
        y: u32,
        #[clap(long, default_value_t = 1)]
        metatile: u32,
        #[clap(long)]
        force: bool,
        #[clap(long)]
        state: Option<i64>,
    },
}

async fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read config from {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&config)
        .with_context(|| format!("parse config from {}", path.display()))?;
    config.validate().map_err(|msg| anyhow!("{msg}"))?;
    Ok(config)
}

async fn open_queue(config: &Config) -> anyhow::Result<SqliteQueue> {
    let queue = SqliteQueue::open(&config.queue.url, config.queue.name.clone())
        .await
        .with_context(|| format!("open queue {}", config.queue.url))?;
    Ok(queue
        .with_retry(config.queue.retry_limit, config.queue.retry_delay_secs)
        .with_expiry(config.queue.expire_secs))
}

async fn enqueue(config: &Config, job: TileJob) -> anyhow::Result<()> {
    if !config.grid.is_in_bounds(&job.tile) {
        return Err(anyhow!("tile {} is outside the grid", job.tile));
    }
    if job.tile.metatile > config.tiles.max_metatile {
        return Err(anyhow!(
            "metatile of {} exceeds the limit of {} tiles per side",
            job.tile,
            config.tiles.max_metatile
        ));
    }
    let queue = open_queue(config).await?;
    let id = queue.enqueue(&job).await.with_context(|| "enqueue job")?;
    info!(id, tile = %job.tile, "job enqueued");
    Ok(())
}

async fn work(config: Config) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .build()
        .with_context(|| "build http client")?;

    let tracking = match &config.decision.tracking {
        Some(tracking) => Some(
            SqliteTracking::open(
                &tracking.url,
                tracking.location.clone(),
                config.decision.cooldown.page_size,
            )
            .await
            .with_context(|| format!("open tracking store {}", tracking.url))?,
        ),
        None => None,
    };
    let remote = config
        .decision
        .remote_truth
        .as_ref()
        .map(|remote| HttpRemoteTruth::new(client.clone(), remote.url.clone()));
    let decision = DecisionEngine::new(
        DecisionPolicy::from_config(&config.decision),
        config.grid,
        tracking,
        remote,
    );

    let storages = futures::future::join_all(
        config
            .storage
            .iter()
            .map(|storage| StorageBackend::from_config(storage, config.grid, config.tiles.format)),
    )
    .await;
    for storage in &storages {
        info!(%storage, "storage destination ready");
    }

    let processor = TileProcessor {
        map: HttpMapProvider::new(client, config.map.clone()),
        splitter: ImageSplitter {
            grid: config.grid,
            tile_size: config.tiles.tile_size,
            format: config.tiles.format,
            blank_rule: config.tiles.filter_blank.then_some(config.tiles.blank_rule),
        },
        storages,
        decision,
        grid: config.grid,
        tile_size: config.tiles.tile_size,
        max_metatile: config.tiles.max_metatile,
    };

    let consumer = Consumer::new(open_queue(&config).await?, config.queue.concurrency);
    let poll_interval = Duration::from_millis(config.queue.poll_interval_ms);
    info!(
        queue = config.queue.name,
        concurrency = config.queue.concurrency,
        "worker started"
    );

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested, finishing in-flight jobs");
                consumer.stop();
            }
            Err(error) => error!(%error, "failed to listen for shutdown signal"),
        }
        futures::future::pending::<std::convert::Infallible>().await
    };
    let processor = &processor;
    let consume = async {
        loop {
            let handled = consumer
                .consume(move |job| processor.process_tile(job))
                .await
                .with_context(|| "consume queue")?;
            if consumer.is_stopping() {
                return Ok::<_, anyhow::Error>(());
            }
            if handled == 0 {
                tokio::time::sleep(poll_interval).await;
            }
        }
    };
    tokio::select! {
        result = consume => result?,
        never = shutdown => match never {},
    }
    info!("worker stopped");
    Ok(())
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    let config = load_config(&opts.config).await?;
    match opts.command.unwrap_or(Command::Work) {
        Command::Work => work(config).await,
        Command::Enqueue {
            z,
            x,
            y,
            metatile,
            force,
            state,
        } => {
            let job = TileJob {
                force: force.then_some(true),
                state,
                ..TileJob::new(Tile::new(z, x, y).with_metatile(metatile))
            };
            enqueue(&config, job).await
        }
    }
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    if let Err(e) = run(opts).await {
        error!(?e, "critical error");
        std::process::exit(1);
    }
}
