use crate::{
    api::Request,
    constants::DEFAULT_SOCKET,
    filter::SubscriptionFilter,
    subscription::{Flag, SubscriptionPayload},
};
use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, process};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
};
use tracing::instrument;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct ClientArgs {
    /// Path of the server's domain socket
    #[arg(long, default_value = DEFAULT_SOCKET)]
    socket: PathBuf,
    #[command(subcommand)]
    command: ClientCli,
}

#[derive(Subcommand, Debug)]
pub enum ClientCli {
    /// Stream data matching a subscription filter
    Subscribe(SubscribeArgs),
    /// Cancel a subscription
    Unsubscribe(UnsubscribeArgs),
    /// Show the identity of the watched node
    NodeInfo,
}

#[derive(Args, Debug)]
pub struct SubscribeArgs {
    /// Path to a JSON subscription filter
    #[arg(short, long)]
    filter: PathBuf,
}

#[derive(Args, Debug)]
pub struct UnsubscribeArgs {
    /// Subscription id
    #[arg(short, long)]
    id: Uuid,
}

#[instrument(skip_all)]
pub async fn run(args: &ClientArgs) -> anyhow::Result<()> {
    let request = match &args.command {
        ClientCli::Subscribe(SubscribeArgs { filter }) => {
            let contents = tokio::fs::read(filter).await?;
            let filter: SubscriptionFilter = serde_json::from_slice(&contents)?;
            Request::Subscribe(filter)
        }
        ClientCli::Unsubscribe(UnsubscribeArgs { id }) => Request::Unsubscribe(*id),
        ClientCli::NodeInfo => Request::NodeInfo,
    };

    let conn = match UnixStream::connect(&args.socket).await {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("Make sure the server has started!");
            eprintln!("Error: {e}");
            process::exit(111);
        }
    };
    let (reader, mut writer) = conn.into_split();
    let mut request = serde_json::to_vec(&request)?;
    request.push(b'\n');
    writer.write_all(&request).await?;

    let mut lines = BufReader::new(reader).lines();
    match args.command {
        ClientCli::Subscribe(_) => {
            while let Some(line) = lines.next_line().await? {
                match serde_json::from_str::<SubscriptionPayload>(&line) {
                    Ok(payload) if payload.is_error() => {
                        eprintln!("Error at height {}: {}", payload.height, payload.err);
                    }
                    Ok(payload) if payload.flag == Flag::BackFillComplete => {
                        println!("Back-fill complete at height {}", payload.height);
                    }
                    Ok(payload) => match payload.bundle() {
                        Ok(bundle) => println!("{}", serde_json::to_string(&bundle)?),
                        Err(_) => println!("{line}"),
                    },
                    // subscription acknowledgement
                    Err(_) => println!("{line}"),
                }
            }
        }
        _ => {
            if let Some(line) = lines.next_line().await? {
                println!("{line}");
            }
        }
    }
    Ok(())
}
