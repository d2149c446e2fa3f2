use std::path::PathBuf;

use anyhow::Result;
use config::Config;

use crate::working_chain::ChainSettings;

/// Where persisted headers go.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    #[default]
    Memory,
    Fjall,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DownloaderConfig {
    pub block_headers_topic: String,
    pub get_block_headers_topic: String,
    pub new_block_hashes_topic: String,
    pub clock_tick_topic: String,

    pub request_headers_topic: String,
    pub send_block_headers_topic: String,
    pub penalize_peer_topic: String,
    pub peer_min_block_topic: String,
    pub headers_persisted_topic: String,

    #[serde(flatten)]
    pub chain: ChainSettings,

    pub max_future_drift: u64,
    #[serde(default)]
    pub store: StoreKind,
    pub database_path: PathBuf,
    #[serde(default)]
    pub clear_on_start: bool,
    pub status_interval: u64,
}

impl DownloaderConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }
}
