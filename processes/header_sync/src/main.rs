//! 'main' for the Meridian header sync process

use anyhow::Result;
use caryatid_module_clock::Clock;
use caryatid_process::Process;
use clap::Parser;
use config::{Config, Environment, File};
use meridian_common::messages::Message;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meridian_module_header_downloader::HeaderDownloader;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, value_name = "PATH", default_values_t = vec!["header-sync.toml".to_string()])]
    config: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Get arguments and config
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,fjall=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Meridian header sync process");

    let mut builder = Config::builder();
    for file in &args.config {
        builder = builder.add_source(File::with_name(file));
    }
    let config = Arc::new(builder.add_source(Environment::with_prefix("MERIDIAN")).build()?);

    let mut process = Process::<Message>::create(config).await;

    HeaderDownloader::register(&mut process);
    Clock::<Message>::register(&mut process);

    process.run().await?;

    info!("Exiting");
    Ok(())
}
