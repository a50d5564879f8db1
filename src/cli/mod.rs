//! Command-line interface for chunked-export
//!
//! This module handles:
//! - Command-line argument parsing using clap
//! - Configuration loading with CLI overrides
//! - Dispatch to the HTTP service, the one-shot export and the helper
//!   subcommands

mod export;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backend::{OpenSearchClient, SearchBackend};
use crate::config::{Config, LogLevel};
use crate::error::Result;
use crate::export::{ExportCoordinator, ExportSettings, StartRequest};
use crate::query::{Menu, SearchParams};

pub use export::{ExportOutcome, run_export, summary_table};

/// Owner recorded on sessions started from the command line.
const CLI_OWNER: &str = "cli";

/// Chunked CSV export of search results
#[derive(Parser, Debug)]
#[command(
    name = "chunked-export",
    version,
    about = "Chunked CSV export of large search results",
    long_about = "Splits large search results into fixed-size CSV chunks generated in
parallel, with live progress over WebSocket and per-file downloads."
)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    pub config_file: Option<PathBuf>,

    /// Quiet mode (errors only, no progress bars)
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Very verbose mode (trace logging)
    #[arg(long = "vv", global = true)]
    pub very_verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP and WebSocket service (default)
    Serve {
        /// Address to bind
        #[arg(long, value_name = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,
    },

    /// Export one search result to CSV files and exit
    Export(ExportArgs),

    /// Show configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Validate configuration file
        #[arg(long)]
        validate: bool,
    },

    /// Show version information
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Log category: traffic, threat or system
    #[arg(long)]
    pub menu: Menu,

    /// Start of the time range, e.g. 2024-01-01T00:00:00
    #[arg(long, value_name = "TIME")]
    pub from: String,

    /// End of the time range
    #[arg(long, value_name = "TIME")]
    pub to: String,

    /// Free-text phrase matched against all fields
    #[arg(long, value_name = "TEXT", default_value = "")]
    pub search_term: String,

    /// Filter expression, e.g. "srcIp = '10.0.0.1' AND action != 'allow'"
    #[arg(long, value_name = "EXPR")]
    pub filter: Option<String>,

    /// Directory receiving the CSV files
    #[arg(short = 'o', long, value_name = "DIR", default_value = ".")]
    pub out: PathBuf,

    /// Rows per file
    #[arg(long, value_name = "ROWS")]
    pub chunk_size: Option<u64>,
}

impl ExportArgs {
    fn params(&self) -> SearchParams {
        let mut params = SearchParams::new(self.menu, &self.from, &self.to);
        params.search_term = self.search_term.clone();
        params.filter = self.filter.clone();
        params
    }
}

/// CLI interface handler
pub struct CliInterface {
    args: CliArgs,
    config: Config,
}

impl CliInterface {
    pub fn new() -> Result<Self> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Self::load_config(&args)?;
        Ok(Self { args, config })
    }

    /// Load the configuration file and environment, then apply flags.
    fn load_config(args: &CliArgs) -> Result<Config> {
        let mut config = Config::load(args.config_file.as_deref())?;
        Self::apply_args_to_config(&mut config, args);
        Ok(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn args(&self) -> &CliArgs {
        &self.args
    }

    fn apply_args_to_config(config: &mut Config, args: &CliArgs) {
        Self::apply_logging_args(config, args);

        match &args.command {
            Some(Commands::Serve { host, port }) => {
                if let Some(host) = host {
                    config.server.host = host.clone();
                }
                if let Some(port) = port {
                    config.server.port = *port;
                }
            }
            Some(Commands::Export(export)) => {
                if let Some(chunk_size) = export.chunk_size {
                    config.export.chunk_size = chunk_size;
                }
                config.export.download_dir = export.out.clone();
            }
            _ => {}
        }
    }

    fn apply_logging_args(config: &mut Config, args: &CliArgs) {
        config.logging.level = if args.very_verbose {
            LogLevel::Trace
        } else if args.verbose {
            LogLevel::Debug
        } else if args.quiet {
            LogLevel::Error
        } else {
            config.logging.level
        };
    }

    /// Run the selected subcommand.
    pub async fn run(&self) -> Result<()> {
        match &self.args.command {
            None | Some(Commands::Serve { .. }) => {
                self.config.validate()?;
                crate::server::serve(self.config.clone()).await
            }
            Some(Commands::Export(export)) => self.export(export).await,
            Some(Commands::Config { show, validate }) => self.handle_config_command(*show, *validate),
            Some(Commands::Version) => {
                self.show_version();
                Ok(())
            }
        }
    }

    async fn export(&self, args: &ExportArgs) -> Result<()> {
        self.config.validate()?;
        tokio::fs::create_dir_all(&args.out).await?;

        let backend: Arc<dyn SearchBackend> = Arc::new(OpenSearchClient::new(&self.config.backend)?);
        let coordinator = ExportCoordinator::new(backend, ExportSettings::from_config(&self.config));

        let interrupt = CancellationToken::new();
        let on_signal = interrupt.clone();
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_signal.cancel();
            } else {
                warn!("failed to listen for Ctrl+C");
            }
        });

        let request = StartRequest::new(CLI_OWNER, args.params());
        let outcome = run_export(&coordinator, request, &args.out, !self.args.quiet, interrupt).await;
        signal.abort();
        let outcome = outcome?;

        if !self.args.quiet {
            println!("{}", summary_table(&outcome.session));
        }
        for file in &outcome.files {
            println!("{}", file.display());
        }
        Ok(())
    }

    fn show_version(&self) {
        println!("chunked-export version {}", crate::VERSION);
        println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
    }

    fn handle_config_command(&self, show: bool, validate: bool) -> Result<()> {
        if validate {
            self.validate_config_file();
        }

        if show || !validate {
            self.show_config()?;
        }

        Ok(())
    }

    fn validate_config_file(&self) {
        let path = self.config_path();
        println!("Validating configuration file: {}", path.display());

        if !path.exists() {
            println!("Configuration file does not exist, defaults apply");
            return;
        }

        match Config::from_file(&path) {
            Ok(config) => match config.validate() {
                Ok(()) => println!("Configuration is valid"),
                Err(e) => println!("Configuration validation failed: {e}"),
            },
            Err(e) => println!("Failed to load configuration: {e}"),
        }
    }

    fn show_config(&self) -> Result<()> {
        println!("Configuration file: {}", self.config_path().display());
        println!();
        println!("{}", self.config.to_toml_string()?);
        Ok(())
    }

    fn config_path(&self) -> PathBuf {
        self.args
            .config_file
            .clone()
            .unwrap_or_else(Config::default_path)
    }
}
