use std::time::Duration;

pub const DEFAULT_DATABASE_DIR: &str = concat!(env!("HOME"), "/.ipld-watcher/database");
pub const DEFAULT_CONTENT_DIR: &str = concat!(env!("HOME"), "/.ipld-watcher/content");
pub const DEFAULT_WATCH_DIR: &str = concat!(env!("HOME"), "/.ipld-watcher/watch");
pub const DEFAULT_ARCHIVE_DIR: &str = concat!(env!("HOME"), "/.ipld-watcher/archive");
pub const DEFAULT_LOG_DIR: &str = concat!(env!("HOME"), "/.ipld-watcher/logs");
pub const DEFAULT_SOCKET: &str = concat!(env!("HOME"), "/.ipld-watcher/ipld-watcher.sock");

/// Capacity of the channel carrying raw payloads from the upstream feed
pub const PAYLOAD_CHAN_SIZE: usize = 20_000;
/// Capacity of the converted-payload channel feeding the serve loop
pub const SERVE_CHAN_SIZE: usize = 20_000;
/// Capacity of each subscriber's outbound payload channel
pub const SUBSCRIPTION_CHAN_SIZE: usize = 1_000;
/// Capacity of the publish/index work queue
pub const WORK_QUEUE_SIZE: usize = 1_000;
/// Capacity of the upstream transport error channel
pub const ERROR_CHAN_SIZE: usize = 64;

pub const DEFAULT_WORKERS: usize = 1;
pub const DEFAULT_BATCH_SIZE: u64 = 100;
pub const DEFAULT_BATCH_NUMBER: usize = 10;
pub const DEFAULT_GAP_CHECK_FREQUENCY: Duration = Duration::from_secs(60);
pub const DEFAULT_NETWORK_ID: u64 = 1;
pub const DEFAULT_CHAIN_ID: u64 = 1;

/// How long the historical sender waits to deliver the back-fill sentinel
pub const SENTINEL_SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_CLIENT_NAME: &str = "ipld-watcher";
