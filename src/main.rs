use clap::{Parser, Subcommand};
use ipld_watcher::{client, server};

#[derive(Parser, Debug)]
#[command(name = "ipld-watcher", author, version, about, long_about = Some("IPLD Watcher\n\n\
Publish, index and stream blockchain data as content-addressed objects"))]
struct Cli {
    #[command(subcommand)]
    command: WatcherCommand,
}

#[derive(Subcommand, Debug)]
enum WatcherCommand {
    /// Server commands
    Server(server::ServerArgs),
    /// Client commands
    Client(client::ClientArgs),
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        WatcherCommand::Client(args) => client::run(&args).await,
        WatcherCommand::Server(args) => server::run(args).await,
    }
}
