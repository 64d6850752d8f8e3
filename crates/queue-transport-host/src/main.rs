use clap::Parser;
use queue_transport_host::{run_cli, Cli};
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run_cli(cli).await {
        error!("Host error: {}", e);
        eprintln!("{e}");
        std::process::exit(e.exit_code());
    }
}
