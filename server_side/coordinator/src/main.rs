use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use coordinator::{
    engine::CompletionMode,
    protocol::ProtocolConfig,
    queue::DEFAULT_CAPACITY,
    runtime::{open_serial, run_coordinator},
    Config,
};
use tokio::{
    io::{stdin, AsyncBufReadExt, BufReader},
    runtime::Builder,
    spawn,
    sync::mpsc,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Run the motion coordinator on the given serial port.", long_about = None)]
struct Args {
    /// Serial port the axis controllers are attached to.
    #[arg(short, long)]
    port: String,
    #[arg(short, long, default_value_t = 115200)]
    baud: u32,
    /// Where the queue and settings are kept.
    #[arg(short, long, default_value = "data")]
    data_folder: PathBuf,
    /// Send every command on its own line instead of batching frames.
    #[arg(long)]
    legacy: bool,
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
    #[arg(long, default_value_t = 20)]
    batch_timeout_ms: u64,
    #[arg(long, value_enum, default_value_t = CompletionMode::Ack)]
    completion: CompletionMode,
    #[arg(long, default_value_t = 50)]
    tick_ms: u64,
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    queue_capacity: usize,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            data_folder: self.data_folder.clone(),
            protocol: ProtocolConfig {
                batching: !self.legacy,
                batch_size: self.batch_size,
                batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            },
            completion: self.completion,
            queue_capacity: self.queue_capacity,
            tick: Duration::from_millis(self.tick_ms),
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = args.config();
    let engine = config.build_engine()?;
    info!("opening {} at {} baud", args.port, args.baud);
    let (reader, writer) = open_serial(&args.port, args.baud).await?;

    let (sender, receiver) = mpsc::channel(16);
    spawn(async move {
        let mut lines = BufReader::new(stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if sender.send(line).await.is_err() {
                break;
            }
        }
    });
    let engine = run_coordinator(engine, reader, writer, receiver, config.tick).await?;
    info!("stopped in state {}", engine.state());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("starting coordinator with {:?}", args);
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the runtime")?;
    let result = runtime.block_on(run(args));
    if let Err(e) = &result {
        error!("coordinator failed: {:#}", e);
    }
    result
}
