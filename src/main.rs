//! chunked-export
//!
//! Chunked CSV export service for large search results.
//!
//! # Usage
//!
//! ```bash
//! # Run the HTTP / WebSocket service
//! chunked-export serve --port 3000
//!
//! # Export one search result to the current directory
//! chunked-export export --menu traffic --from 2024-01-01T00:00:00 --to 2024-01-02T00:00:00
//! ```

use chunked_export::cli::CliInterface;
use chunked_export::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = CliInterface::new()?;
    initialize_logging(&cli);
    cli.run().await
}

/// Initialize logging from the configured level, verbosity flags and
/// `RUST_LOG`, which wins when set.
fn initialize_logging(cli: &CliInterface) {
    let level = cli.config().logging.level.to_tracing_level();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if cli.config().logging.timestamps {
        subscriber.init();
    } else {
        subscriber.without_time().init();
    }
}
