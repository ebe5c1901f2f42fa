use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};
use server::server::{ServerConfig, SyncServer};
use server::store::{MemoryStore, PgStore, UserStore};

/// Main-method of the application.
/// Parses command-line arguments, connects the datastore and runs the
/// reactor loop until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Postgres connection URL; omit to run against an in-memory store
        #[clap(long)]
        database_url: Option<String>,
        /// Name of the session cookie issued by the upstream login flow
        #[clap(long, default_value = "sessionid")]
        session_cookie: String,
        /// Broadcast tick interval in milliseconds
        #[clap(long, default_value = "1000")]
        broadcast_ms: u64,
        /// Keepalive ping interval in seconds
        #[clap(long, default_value = "10")]
        keepalive_secs: u64,
        /// Seconds of pong silence before a connection is evicted
        #[clap(long, default_value = "30")]
        client_timeout_secs: u64,
        /// Datastore pull interval in seconds
        #[clap(long, default_value = "30")]
        pull_secs: u64,
        /// Datastore push interval in seconds
        #[clap(long, default_value = "20")]
        push_secs: u64,
    }

    let args = Args::parse();

    let store: Arc<dyn UserStore> = match &args.database_url {
        Some(url) => {
            info!("Connecting to datastore");
            Arc::new(PgStore::connect(url).await?)
        }
        None => {
            warn!("No database URL given; positions will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let config = ServerConfig {
        session_cookie: args.session_cookie,
        broadcast_interval: Duration::from_millis(args.broadcast_ms),
        keepalive_interval: Duration::from_secs(args.keepalive_secs),
        client_timeout: Duration::from_secs(args.client_timeout_secs),
        pull_interval: Duration::from_secs(args.pull_secs),
        push_interval: Duration::from_secs(args.push_secs),
        ..ServerConfig::default()
    };

    let address = format!("{}:{}", args.host, args.port);
    let server = SyncServer::bind(&address, config, store).await?;

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    }
}
