use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use map_reduce_rs::mr::{
    config::CoordinatorConfig,
    coordinator::Coordinator,
    job::{collect_splits, Job},
    transport::TarpcTransport,
};
use tracing_subscriber::EnvFilter;

/// Runs one MapReduce job over a fixed set of workers and prints the result of every partition
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Worker endpoint, repeat the flag for every worker
    #[arg(short, long = "worker", required = true)]
    workers: Vec<SocketAddr>,

    /// The number of reduce tasks (partitions)
    #[arg(short, long, default_value_t = 10)]
    reduce_tasks: usize,

    #[arg(long, default_value = "word_count")]
    map_function: String,

    #[arg(long, default_value = "sum")]
    reduce_function: String,

    /// Overrides `MR_DISPATCH_TIMEOUT_MS`
    #[arg(long)]
    dispatch_timeout_ms: Option<u64>,

    /// Write every partition result to `<DIR>/mr-out-<partition>.txt`
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Input files, directories contribute their `.txt` files
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = CoordinatorConfig::from_env();
    if let Some(ms) = args.dispatch_timeout_ms {
        config.dispatch_timeout = Duration::from_millis(ms);
    }

    let splits = collect_splits(&args.inputs).await?;
    let job = Job::new(splits, args.map_function, args.reduce_function, args.reduce_tasks)?;

    // The dispatch timeout is what bounds a task, the RPC deadline only has to outlive it
    let transport = Arc::new(TarpcTransport::new(
        config.dispatch_timeout.max(Duration::from_secs(60)),
    ));
    let coordinator = Coordinator::new(job, args.workers, transport, config)?;
    let results = coordinator.run().await?;

    let job = coordinator.job();
    tracing::info!(
        "[Reduce] {} over {} input split(s) produced {} partition(s) with {}",
        job.map_function,
        job.splits.len(),
        results.len(),
        job.reduce_function
    );

    if let Some(dir) = &args.output {
        tokio::fs::create_dir_all(dir).await?;
    }
    for (partition, output) in &results {
        println!("[Reduce] Partition #{}: {}", partition, output);
        if let Some(dir) = &args.output {
            tokio::fs::write(dir.join(format!("mr-out-{}.txt", partition)), output).await?;
        }
    }

    if let Some(dir) = &args.output {
        tracing::info!("The MapReduce process has finished, please check the results at {}", dir.display());
    }
    Ok(())
}
