use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use meshbus_node::{run_request, run_topology, NodeConfig};

/// meshbus - scatter-gather and channel topology over publish/subscribe.
#[derive(Parser, Debug)]
#[command(name = "meshbus", version, about)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a small in-memory cluster and print the topology it discovers.
    Topology {
        #[arg(long, default_value_t = 3)]
        instances: usize,
        #[arg(long, default_value_t = 6000)]
        duration_ms: u64,
    },
    /// Scatter one request to in-memory responders and print the replies.
    Request {
        #[arg(long, default_value_t = 3)]
        responders: usize,
        #[arg(long, default_value = "demo:request")]
        topic: String,
        /// Stop once this many replies arrived instead of waiting for the deadline.
        #[arg(long)]
        wait: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = NodeConfig::load(cli.config.as_deref())?;

    let output = match cli.command {
        Command::Topology { instances, duration_ms } => {
            let topology = run_topology(&config, instances, Duration::from_millis(duration_ms)).await?;
            serde_json::to_string_pretty(&topology)?
        }
        Command::Request { responders, topic, wait } => {
            if let Some(wait) = wait {
                config.collector.wait_for_responses = Some(wait);
            }
            let payloads = run_request(&config, responders, &topic).await?;
            serde_json::to_string_pretty(&payloads)?
        }
    };
    println!("{output}");
    Ok(())
}
