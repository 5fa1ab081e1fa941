mod api;
mod app;
mod cache;
mod commands;
mod config;
mod logging;
mod provider;
mod query;
mod render;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "heatdash")]
#[command(about = "Weather and heat-demand dashboard for district heating forecasts")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/heatdash/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Prediction backend URL, overrides the config file
  #[arg(long)]
  api_url: Option<String>,

  /// Don't read or write the persistent cache
  #[arg(long)]
  no_cache: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(url) = args.api_url {
    config.api.url = url;
  }
  if args.no_cache {
    config.cache.enabled = false;
  }

  let _log_guard = logging::init(&config.log)?;

  let app = app::App::new(config)?;
  app.run(args.command).await?;

  Ok(())
}
