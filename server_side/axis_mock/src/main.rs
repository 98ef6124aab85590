use axis_mock::{mock_axes, pty::serve_on_pty};
use clap::Parser;
use tokio::io::{stdin, stdout};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Simulated axis controllers for the coordinator bus.", long_about = None)]
struct Args {
    /// Serve on a fresh pseudo-terminal and print its path, instead of using stdin and stdout.
    #[arg(long)]
    pty: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    if !args.pty {
        let report = mock_axes(stdin(), stdout()).await?;
        info!("bus closed: {:?}", report);
        return Ok(());
    }
    let bus = serve_on_pty(|reader, writer| async move {
        match mock_axes(reader, writer).await {
            Ok(report) => info!("bus closed: {:?}", report),
            Err(e) => error!("mock axes failed: {:#}", e),
        }
    })
    .await?;
    println!("{}", bus.path().display());
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    bus.close().await;
    Ok(())
}
