use std::net::SocketAddr;

use clap::Parser;
use map_reduce_rs::mr::{
    function::FunctionRegistry,
    worker::{self, Worker},
};
use tracing_subscriber::EnvFilter;

/// A stateless MapReduce worker, it serves map and reduce calls until interrupted
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The address to serve the worker RPC on
    #[arg(short, long, default_value = "127.0.0.1:1030")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let registry = FunctionRegistry::with_builtins();
    tracing::info!(
        "[Worker Configuration] Map functions {:?} | Reduce functions {:?}",
        registry.map_names(),
        registry.reduce_names()
    );

    let (addr, server) = worker::serve(args.listen, Worker::new(registry)).await?;
    tracing::info!("[Preparation] Worker is ready at {}, waiting for the coordinator", addr);

    tokio::select! {
        result = server => {
            result?;
            tracing::warn!("Worker RPC server stopped");
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Worker exited, wish you a good day :)");
        }
    }
    Ok(())
}
