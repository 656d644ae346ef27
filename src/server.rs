use crate::{
    api,
    backfill::{BackFillConfig, BackFillService},
    chain::ChainType,
    constants::*,
    content_store::rocks::RocksContentStore,
    index::store::IndexerStore,
    service::{Components, Service},
    subscription::NodeInfo,
    upstream::filesystem::{ArchiveFetcher, FilesystemStreamer},
};
use clap::{ArgAction, Parser};
use serde_derive::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, instrument, level_filters::LevelFilter};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ServerArgs {
    /// Path to a YAML service configuration, replacing the service flags below
    #[arg(long)]
    config: Option<PathBuf>,
    /// Chain the watched node follows
    #[arg(long, value_enum, default_value_t = ChainType::Ethereum)]
    chain: ChainType,
    /// Path to directory for the relational index
    #[arg(short, long, default_value = DEFAULT_DATABASE_DIR)]
    database_dir: PathBuf,
    /// Path to directory for the content store
    #[arg(long, default_value = DEFAULT_CONTENT_DIR)]
    content_dir: PathBuf,
    /// Path to directory to watch for new payloads
    #[arg(short, long, default_value = DEFAULT_WATCH_DIR)]
    watch_dir: PathBuf,
    /// Path to directory of historical payloads used for back-fill
    #[arg(short, long, default_value = DEFAULT_ARCHIVE_DIR)]
    archive_dir: PathBuf,
    /// Path of the subscriber domain socket
    #[arg(long, default_value = DEFAULT_SOCKET)]
    socket: PathBuf,
    /// Follow the live feed
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    sync: bool,
    /// Number of publish/index workers
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,
    /// Capacity of the publish/index work queue
    #[arg(long, default_value_t = WORK_QUEUE_SIZE)]
    work_queue_size: usize,
    /// Repair gaps in the index
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    backfill: bool,
    /// Heights per back-fill batch
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: u64,
    /// Back-fill workers per pass
    #[arg(long, default_value_t = DEFAULT_BATCH_NUMBER)]
    batch_number: usize,
    /// Seconds between gap checks
    #[arg(long, default_value_t = DEFAULT_GAP_CHECK_FREQUENCY.as_secs())]
    gap_check_frequency: u64,
    /// Treat heights below the first indexed one as a gap
    #[arg(long, default_value_t = false)]
    backfill_from_genesis: bool,
    /// Identity of the watched node
    #[arg(long, default_value = "")]
    node_id: String,
    #[arg(long, default_value = DEFAULT_CLIENT_NAME)]
    client_name: String,
    #[arg(long, default_value = "")]
    genesis_block: String,
    #[arg(long, default_value_t = DEFAULT_NETWORK_ID)]
    network_id: u64,
    #[arg(long, default_value_t = DEFAULT_CHAIN_ID)]
    chain_id: u64,
    /// Path to directory for logs
    #[arg(short, long, default_value = DEFAULT_LOG_DIR)]
    log_dir: PathBuf,
    /// Max file log level
    #[arg(long, default_value_t = LevelFilter::DEBUG)]
    log_level: LevelFilter,
    /// Max stdout log level
    #[arg(long, default_value_t = LevelFilter::INFO)]
    log_level_stdout: LevelFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: String,
    pub client_name: String,
    pub genesis_block: String,
    pub network_id: u64,
    pub chain_id: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            client_name: DEFAULT_CLIENT_NAME.into(),
            genesis_block: String::new(),
            network_id: DEFAULT_NETWORK_ID,
            chain_id: DEFAULT_CHAIN_ID,
        }
    }
}

/// Everything needed to assemble a running watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub chain: ChainType,
    pub database_dir: PathBuf,
    pub content_dir: PathBuf,
    pub watch_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub socket: PathBuf,
    pub sync: bool,
    pub workers: usize,
    pub work_queue_size: usize,
    pub backfill: bool,
    pub batch_size: u64,
    pub batch_number: usize,
    /// Seconds between gap checks
    pub gap_check_frequency: u64,
    pub backfill_from_genesis: bool,
    pub node: NodeConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            chain: ChainType::Ethereum,
            database_dir: DEFAULT_DATABASE_DIR.into(),
            content_dir: DEFAULT_CONTENT_DIR.into(),
            watch_dir: DEFAULT_WATCH_DIR.into(),
            archive_dir: DEFAULT_ARCHIVE_DIR.into(),
            socket: DEFAULT_SOCKET.into(),
            sync: true,
            workers: DEFAULT_WORKERS,
            work_queue_size: WORK_QUEUE_SIZE,
            backfill: true,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_number: DEFAULT_BATCH_NUMBER,
            gap_check_frequency: DEFAULT_GAP_CHECK_FREQUENCY.as_secs(),
            backfill_from_genesis: false,
            node: NodeConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        debug!("Reading service config from {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn backfill_config(&self) -> BackFillConfig {
        BackFillConfig {
            batch_size: self.batch_size,
            batch_number: self.batch_number,
            gap_check_frequency: Duration::from_secs(self.gap_check_frequency.max(1)),
        }
    }

    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.node.id.clone(),
            client_name: self.node.client_name.clone(),
            genesis_block: self.node.genesis_block.clone(),
            network_id: self.node.network_id,
            chain_id: self.node.chain_id,
            chain: self.chain,
        }
    }
}

impl From<&ServerArgs> for ServiceConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            chain: args.chain,
            database_dir: args.database_dir.clone(),
            content_dir: args.content_dir.clone(),
            watch_dir: args.watch_dir.clone(),
            archive_dir: args.archive_dir.clone(),
            socket: args.socket.clone(),
            sync: args.sync,
            workers: args.workers,
            work_queue_size: args.work_queue_size,
            backfill: args.backfill,
            batch_size: args.batch_size,
            batch_number: args.batch_number,
            gap_check_frequency: args.gap_check_frequency,
            backfill_from_genesis: args.backfill_from_genesis,
            node: NodeConfig {
                id: args.node_id.clone(),
                client_name: args.client_name.clone(),
                genesis_block: args.genesis_block.clone(),
                network_id: args.network_id,
                chain_id: args.chain_id,
            },
        }
    }
}

/// A running watcher: service loops, optional back-fill and the socket API
pub struct IpldWatcher {
    service: Service,
    backfill: Option<BackFillService>,
    socket: PathBuf,
    api: JoinHandle<()>,
    loops: Vec<JoinHandle<()>>,
    _serve_sender: mpsc::Sender<crate::payload::ConvertedData>,
}

impl IpldWatcher {
    #[instrument(skip_all)]
    pub async fn start(config: ServiceConfig) -> anyhow::Result<Self> {
        info!("Starting ipld-watcher for {}", config.chain);
        for dir in [&config.database_dir, &config.content_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }

        let content_store = Arc::new(RocksContentStore::new(&config.content_dir)?);
        let index_store = Arc::new(IndexerStore::new(&config.database_dir)?);
        let components = Components::new(
            config.chain,
            content_store,
            index_store,
            config.backfill_from_genesis,
        );
        let service = Service::new(
            config.chain,
            components.clone(),
            config.node_info(),
            config.workers,
            config.work_queue_size,
        );

        let (serve_sender, serve_receiver) = mpsc::channel(SERVE_CHAN_SIZE);
        let mut loops = vec![service.serve(serve_receiver)];

        if config.sync {
            tokio::fs::create_dir_all(&config.watch_dir).await?;
            let streamer =
                FilesystemStreamer::new(config.chain, &config.watch_dir, PAYLOAD_CHAN_SIZE);
            loops.push(
                service
                    .sync(&streamer, serve_sender.clone(), PAYLOAD_CHAN_SIZE)
                    .await?,
            );
        }

        let backfill = if config.backfill {
            let fetcher = Arc::new(ArchiveFetcher::new(config.chain, &config.archive_dir));
            let backfill = BackFillService::new(
                &components,
                fetcher,
                Some(serve_sender.clone()),
                config.backfill_config(),
            );
            loops.push(backfill.backfill());
            Some(backfill)
        } else {
            None
        };

        let api = api::start(&config.socket, service.clone())?;
        Ok(Self {
            service,
            backfill,
            socket: config.socket,
            api,
            loops,
            _serve_sender: serve_sender,
        })
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub async fn stop(self) {
        if let Some(backfill) = &self.backfill {
            backfill.stop();
        }
        self.service.stop().await;
        self.api.abort();
        for handle in self.loops {
            let _ = handle.await;
        }
        api::remove_socket(&self.socket);
        info!("ipld-watcher stopped");
    }
}

pub async fn run(args: ServerArgs) -> anyhow::Result<()> {
    let log_file = log_file(&args.log_dir).await?;
    init_tracing(&log_file, args.log_level, args.log_level_stdout)?;

    let config = match &args.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::from(&args),
    };
    let watcher = IpldWatcher::start(config).await?;
    wait_for_signal().await?;
    watcher.stop().await;
    Ok(())
}

/// First unused `ipld-watcher-N.log` in `log_dir`
async fn log_file(log_dir: &Path) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(log_dir).await?;
    let mut log_number = 0;
    let mut log_fname = log_dir.join("ipld-watcher-0.log");
    while tokio::fs::metadata(&log_fname).await.is_ok() {
        log_number += 1;
        log_fname = log_dir.join(format!("ipld-watcher-{log_number}.log"));
    }
    Ok(log_fname)
}

fn init_tracing(
    log_file: &Path,
    log_level: LevelFilter,
    log_level_stdout: LevelFilter,
) -> anyhow::Result<()> {
    let log_file = std::fs::File::create(log_file)?;
    let file_layer = tracing_subscriber::fmt::layer().with_writer(log_file);

    let stdout_layer = tracing_subscriber::fmt::layer();
    tracing_subscriber::registry()
        .with(stdout_layer.with_filter(log_level_stdout))
        .with(file_layer.with_filter(log_level))
        .try_init()?;
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = int.recv() => info!("Received SIGINT"),
    }
    Ok(())
}
