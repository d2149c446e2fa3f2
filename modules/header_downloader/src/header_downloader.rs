//! Meridian header downloader module for Caryatid
//! Assembles a verified header chain from batches delivered by peers, asks
//! peers for the gaps and commits the connected prefix to storage

use std::sync::Arc;

use anyhow::Result;
use caryatid_sdk::{module, Context};
use config::Config;
use meridian_common::messages::{Message, SyncMessage};
use tokio::sync::RwLock;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub mod adapters;
pub mod configuration;
pub mod error;
pub mod forest;
pub mod header_list;
pub mod link;
pub mod queues;
pub mod stores;
pub mod validator;
pub mod working_chain;

use crate::{
    adapters::HeaderSync, configuration::DownloaderConfig, validator::BasicHeaderValidator,
    working_chain::WorkingChain,
};

/// Header downloader module
#[module(
    message_type(Message),
    name = "header-downloader",
    description = "Block header chain downloader"
)]
pub struct HeaderDownloader;

impl HeaderDownloader {
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let cfg = Arc::new(DownloaderConfig::try_load(&config)?);

        let store = stores::open(&cfg)?;
        let validator = BasicHeaderValidator::new(cfg.max_future_drift);
        let mut sync = HeaderSync::new(WorkingChain::new(cfg.chain.clone()), store, Box::new(validator));
        sync.recover()?;
        let status = sync.status();
        info!(
            highest_in_db = status.highest_in_db,
            links = status.links,
            "Header downloader starting"
        );
        let sync = Arc::new(RwLock::new(sync));

        info!(
            "Creating subscribers on '{}', '{}', '{}' and '{}'",
            cfg.block_headers_topic,
            cfg.get_block_headers_topic,
            cfg.new_block_hashes_topic,
            cfg.clock_tick_topic
        );
        let mut headers_subscription = context.subscribe(&cfg.block_headers_topic).await?;
        let mut requests_subscription = context.subscribe(&cfg.get_block_headers_topic).await?;
        let mut announces_subscription = context.subscribe(&cfg.new_block_hashes_topic).await?;
        let mut clock_subscription = context.subscribe(&cfg.clock_tick_topic).await?;
        let mut status_subscription = context.subscribe(&cfg.clock_tick_topic).await?;

        let (event_context, event_cfg, event_sync) = (context.clone(), cfg.clone(), sync.clone());
        context.clone().run(async move {
            let (context, cfg) = (event_context, event_cfg);
            loop {
                tokio::select! {
                    result = headers_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Block headers read failed");
                            return;
                        };
                        let Message::Sync(SyncMessage::BlockHeaders(msg)) = message.as_ref() else {
                            continue;
                        };

                        let span = info_span!("header_batch", peer = %msg.peer, headers = msg.headers.len());
                        async {
                            let out = {
                                let mut sync = event_sync.write().await;
                                let mut out = sync.handle_block_headers(msg);
                                out.extend(Self::commit(&mut sync));
                                out
                            };
                            publish_all(&context, &cfg, out).await;
                        }
                        .instrument(span)
                        .await;
                    }

                    result = requests_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Header request read failed");
                            return;
                        };
                        let Message::Sync(SyncMessage::GetBlockHeaders(msg)) = message.as_ref() else {
                            continue;
                        };
                        let reply = event_sync.read().await.handle_get_block_headers(msg);
                        match reply {
                            Ok(reply) => publish_all(&context, &cfg, vec![reply]).await,
                            Err(e) => error!(peer = %msg.peer, "Failed to serve headers: {e}"),
                        }
                    }

                    result = announces_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Block announce read failed");
                            return;
                        };
                        if let Message::Sync(SyncMessage::NewBlockHashes(msg)) = message.as_ref() {
                            let out = event_sync.write().await.handle_new_block_hashes(msg);
                            publish_all(&context, &cfg, out).await;
                        }
                    }

                    result = clock_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Clock tick read failed");
                            return;
                        };
                        let Message::Clock(tick) = message.as_ref() else {
                            continue;
                        };

                        let now = tick.time.timestamp().max(0) as u64;
                        let out = {
                            let mut sync = event_sync.write().await;
                            let mut out = sync.handle_tick(now);
                            out.extend(Self::commit(&mut sync));
                            out
                        };
                        publish_all(&context, &cfg, out).await;
                    }
                }
            }
        });

        // Periodic status, off the event loop
        let status_interval = cfg.status_interval;
        context.clone().run(async move {
            loop {
                let Ok((_, message)) = status_subscription.read().await else {
                    error!("Status clock tick read failed");
                    return;
                };
                let Message::Clock(tick) = message.as_ref() else {
                    continue;
                };
                if status_interval == 0 || !tick.number.is_multiple_of(status_interval) {
                    continue;
                }

                let status = sync.read().await.status();
                info!(
                    links = status.links,
                    pending = status.pending,
                    anchors = status.anchors,
                    highest_in_db = status.highest_in_db,
                    top_seen = status.top_seen_height,
                    bad_headers = status.bad_headers,
                    in_sync = status.in_sync,
                    "Header chain status"
                );
            }
        });

        Ok(())
    }

    /// Commit whatever is persistable. Storage failures are logged and the
    /// round retried on the next trigger.
    fn commit(sync: &mut HeaderSync) -> Vec<SyncMessage> {
        sync.commit().unwrap_or_else(|e| {
            error!("Failed to persist headers: {e}");
            Vec::new()
        })
    }
}

/// Topic an outbound message is published on. Inbound kinds have none.
pub fn outbound_topic<'a>(cfg: &'a DownloaderConfig, msg: &SyncMessage) -> Option<&'a str> {
    let topic = match msg {
        SyncMessage::SendGetBlockHeaders(_) => &cfg.request_headers_topic,
        SyncMessage::SendBlockHeaders(_) => &cfg.send_block_headers_topic,
        SyncMessage::PenalizePeer(_) => &cfg.penalize_peer_topic,
        SyncMessage::PeerMinBlock(_) => &cfg.peer_min_block_topic,
        SyncMessage::HeadersPersisted(_) => &cfg.headers_persisted_topic,
        SyncMessage::BlockHeaders(_)
        | SyncMessage::GetBlockHeaders(_)
        | SyncMessage::NewBlockHashes(_) => return None,
    };
    Some(topic)
}

async fn publish_all(context: &Context<Message>, cfg: &DownloaderConfig, messages: Vec<SyncMessage>) {
    for msg in messages {
        let Some(topic) = outbound_topic(cfg, &msg) else {
            warn!("No outbound topic for {msg:?}");
            continue;
        };
        debug!("Publishing on '{topic}'");
        context
            .message_bus
            .publish(topic, Arc::new(Message::Sync(msg)))
            .await
            .unwrap_or_else(|e| error!("Failed to publish on '{topic}': {e}"));
    }
}
