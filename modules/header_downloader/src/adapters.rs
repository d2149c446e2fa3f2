//! Bus-facing side of header synchronisation: turns inbound messages into
//! working chain operations and their results into outbound messages.

use std::sync::Arc;

use meridian_common::{
    messages::{
        BlockHeadersMessage, GetBlockHeadersMessage, GetBlockHeadersRequest, HashOrNumber,
        HeadersPersistedMessage, NewBlockHashesMessage, PeerMinBlockMessage, PenalizePeerMessage,
        SendGetBlockHeadersMessage, SyncMessage,
    },
    BlockHeader, PeerId, PeerPenalty, Penalty,
};
use tracing::{debug, warn};

use crate::{
    error::HeaderDownloadError,
    stores::HeaderStore,
    validator::HeaderValidator,
    working_chain::{ChainStatus, HeaderRequest, WorkingChain},
};

/// Working chain together with the collaborators its operations need.
pub struct HeaderSync {
    chain: WorkingChain,
    store: Arc<dyn HeaderStore>,
    validator: Box<dyn HeaderValidator>,
    last_request_id: u64,
}

impl HeaderSync {
    pub fn new(
        chain: WorkingChain,
        store: Arc<dyn HeaderStore>,
        validator: Box<dyn HeaderValidator>,
    ) -> Self {
        Self {
            chain,
            store,
            validator,
            last_request_id: 0,
        }
    }

    pub fn chain(&self) -> &WorkingChain {
        &self.chain
    }

    pub fn status(&self) -> ChainStatus {
        self.chain.status()
    }

    /// Seed the chain from whatever the store already holds.
    pub fn recover(&mut self) -> Result<(), HeaderDownloadError> {
        self.chain.recover_initial_state(self.store.as_ref())
    }

    fn next_request_id(&mut self) -> u64 {
        self.last_request_id += 1;
        self.last_request_id
    }

    /// Headers delivered by a peer. The peer's min-block hint is reported
    /// even when the batch earns it a penalty.
    pub fn handle_block_headers(&mut self, msg: &BlockHeadersMessage) -> Vec<SyncMessage> {
        let decoded = msg.headers.iter().map(|bytes| BlockHeader::decode(bytes));
        let headers = match decoded.collect::<Result<Vec<_>, _>>() {
            Ok(headers) => headers,
            Err(e) => {
                warn!(peer = %msg.peer, request_id = msg.request_id, "Undecodable header: {e}");
                return vec![penalize(PeerPenalty::new(msg.peer, Penalty::Kick))];
            }
        };
        let highest = headers.iter().map(BlockHeader::number).max();

        let outcome = self.chain.accept_headers(headers, msg.peer);
        let mut out: Vec<SyncMessage> = outcome
            .penalty
            .map(|penalty| PeerPenalty::new(msg.peer, penalty))
            .into_iter()
            .chain(outcome.penalties)
            .map(penalize)
            .collect();
        out.extend(highest.map(|min_block| peer_min_block(msg.peer, min_block)));
        out
    }

    /// Requests due at `now`, plus penalties for anchors given up on.
    pub fn handle_tick(&mut self, now: u64) -> Vec<SyncMessage> {
        let tick = self.chain.on_tick(now);
        let mut out: Vec<SyncMessage> = tick.penalties.into_iter().map(penalize).collect();
        for request in tick.requests {
            let request_id = self.next_request_id();
            out.push(SyncMessage::SendGetBlockHeaders(SendGetBlockHeadersMessage {
                request_id,
                min_block: request.min_block(),
                request: wire_request(&request),
            }));
        }
        out
    }

    /// Announced blocks: note the height and fetch headers not seen yet.
    pub fn handle_new_block_hashes(&mut self, msg: &NewBlockHashesMessage) -> Vec<SyncMessage> {
        let mut out = Vec::new();
        for announce in &msg.announces {
            if !self.chain.save_external_announce(announce.hash, announce.number) {
                continue;
            }
            let request_id = self.next_request_id();
            out.push(SyncMessage::SendGetBlockHeaders(SendGetBlockHeadersMessage {
                request_id,
                request: GetBlockHeadersRequest {
                    origin: HashOrNumber::Hash(announce.hash),
                    amount: 1,
                    skip: 0,
                    reverse: false,
                },
                min_block: announce.number,
            }));
        }
        if let Some(highest) = msg.announces.iter().map(|announce| announce.number).max() {
            out.push(peer_min_block(msg.peer, highest));
        }
        out
    }

    /// Serve a peer's header request from storage. At most `max_len`
    /// headers are returned, fewer if the walk leaves the stored chain.
    pub fn handle_get_block_headers(
        &self,
        msg: &GetBlockHeadersMessage,
    ) -> Result<SyncMessage, HeaderDownloadError> {
        let request = &msg.request;
        let amount = request.amount.min(self.chain.settings().max_len);
        let step = request.skip.saturating_add(1);

        let mut next = match request.origin {
            HashOrNumber::Hash(hash) => self.store.read_header_by_hash(&hash)?,
            HashOrNumber::Number(number) => self.store.read_header_by_number(number)?,
        };
        let mut headers = Vec::new();
        while let Some(header) = next.take() {
            if headers.len() as u64 >= amount {
                break;
            }
            headers.push(header.encode());
            let following = if request.reverse {
                header.number().checked_sub(step)
            } else {
                header.number().checked_add(step)
            };
            if let Some(number) = following {
                next = self.store.read_header_by_number(number)?;
            }
        }
        debug!(peer = %msg.peer, requested = request.amount, served = headers.len(), "Serving headers");

        Ok(SyncMessage::SendBlockHeaders(BlockHeadersMessage {
            peer: msg.peer,
            request_id: msg.request_id,
            headers,
        }))
    }

    /// Persist what can be persisted and report it.
    pub fn commit(&mut self) -> Result<Vec<SyncMessage>, HeaderDownloadError> {
        let outcome = self.chain.insert_headers(self.store.as_ref(), self.validator.as_ref())?;
        let mut out: Vec<SyncMessage> = outcome.penalties.into_iter().map(penalize).collect();
        if let (Some(&(from, _)), Some(&(to, tip_hash))) =
            (outcome.persisted.first(), outcome.persisted.last())
        {
            out.push(SyncMessage::HeadersPersisted(HeadersPersistedMessage {
                from,
                to,
                tip_hash,
            }));
        }
        Ok(out)
    }
}

fn wire_request(request: &HeaderRequest) -> GetBlockHeadersRequest {
    GetBlockHeadersRequest {
        origin: match request.hash {
            Some(hash) => HashOrNumber::Hash(hash),
            None => HashOrNumber::Number(request.number),
        },
        amount: request.length,
        skip: request.skip,
        reverse: request.reverse,
    }
}

fn penalize(penalty: PeerPenalty) -> SyncMessage {
    SyncMessage::PenalizePeer(PenalizePeerMessage {
        peer: penalty.peer,
        penalty: penalty.penalty,
    })
}

fn peer_min_block(peer: PeerId, min_block: u64) -> SyncMessage {
    SyncMessage::PeerMinBlock(PeerMinBlockMessage { peer, min_block })
}
