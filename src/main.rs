use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use ledger_cache::app::{App, DemoOptions};
use ledger_cache::config::Config;
use ledger_cache::logging;

#[derive(Parser, Debug)]
#[command(name = "ledger-cache")]
#[command(about = "Client-side cache, preloader and auto-sync for a ledger service")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./ledger-cache.yaml, then $XDG_CONFIG_HOME/ledger-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log level or filter directive; LEDGER_CACHE_LOG takes precedence
  #[arg(short, long)]
  log_level: Option<String>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run a scripted session against the in-memory ledger and print diagnostics
  Demo {
    /// Rows per transaction page
    #[arg(long)]
    page_size: Option<u64>,

    /// Number of writes to perform
    #[arg(long, default_value_t = 3)]
    mutations: usize,
  },
  /// Print the effective configuration
  Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(level) = args.log_level {
    config.logging.level = level;
  }

  match args.command.unwrap_or(Command::Demo {
    page_size: None,
    mutations: 3,
  }) {
    Command::Config => {
      print!("{}", config.to_yaml()?);
    }
    Command::Demo {
      page_size,
      mutations,
    } => {
      let _guard = logging::init(&config.logging)?;
      let opts = DemoOptions {
        page_size: page_size.unwrap_or(config.pagination.default_page_size),
        mutations,
      };

      let mut app = App::new(config)?;
      let report = app.run_demo(opts).await?;
      println!("{}", serde_json::to_string_pretty(&report)?);
    }
  }

  Ok(())
}
