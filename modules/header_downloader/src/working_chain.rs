//! Orchestration over the header forest: accepting batches, deciding which
//! ranges to request next and committing verified prefixes to storage.

use std::collections::HashSet;

use meridian_common::{BlockHash, BlockHeader, BlockNum, PeerId, PeerPenalty, Penalty};
use tracing::{debug, info, trace, warn};

use crate::{
    error::HeaderDownloadError,
    forest::{AnchorOrdering, AttachKind, Forest, ForestLimits, Refusal},
    header_list::HeaderList,
    link::LinkId,
    stores::HeaderStore,
    validator::{HeaderValidator, ValidationError},
};

/// Tunables of the working chain.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ChainSettings {
    /// Seconds an anchor request may stay unanswered.
    pub request_timeout: u64,
    /// Missed requests before an anchor is abandoned.
    pub anchor_timeout_threshold: u32,
    /// Headers asked for in one request.
    pub max_len: u64,
    /// Skeleton stride in multiples of `max_len`.
    pub stride_factor: u64,
    pub max_requests_per_tick: usize,
    pub anchor_limit: usize,
    pub link_limit: usize,
    pub persisted_link_limit: usize,
    /// Skeleton requests stop once this many anchors exist.
    pub skeleton_anchor_limit: usize,
    pub anchor_ordering: AnchorOrdering,
    pub preverified_hashes: Vec<BlockHash>,
    /// Height of the highest preverified hash.
    pub preverified_height: BlockNum,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            request_timeout: 5,
            anchor_timeout_threshold: 10,
            max_len: 192,
            stride_factor: 8,
            max_requests_per_tick: 64,
            anchor_limit: 512,
            link_limit: 65_536,
            persisted_link_limit: 3_000,
            skeleton_anchor_limit: 16,
            anchor_ordering: AnchorOrdering::default(),
            preverified_hashes: Vec::new(),
            preverified_height: 0,
        }
    }
}

impl ChainSettings {
    pub fn forest_limits(&self) -> ForestLimits {
        ForestLimits {
            link_limit: self.link_limit,
            anchor_limit: self.anchor_limit,
            persisted_link_limit: self.persisted_link_limit,
            anchor_ordering: self.anchor_ordering,
        }
    }

    /// Distance between consecutive skeleton headers.
    pub fn stride(&self) -> u64 {
        self.stride_factor * self.max_len
    }
}

/// A header range to ask peers for.
///
/// Anchor requests name the missing parent by hash and walk down from it;
/// skeleton requests name a height and walk up with a stride.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderRequest {
    pub hash: Option<BlockHash>,
    pub number: BlockNum,
    pub length: u64,
    pub skip: u64,
    pub reverse: bool,
}

impl HeaderRequest {
    /// Lowest height a peer must have reached to answer in full.
    pub fn min_block(&self) -> BlockNum {
        if self.reverse {
            self.number
        } else {
            self.number + self.length * self.skip
        }
    }
}

/// Result of accepting one batch.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AcceptOutcome {
    /// Penalty for the sender, if the batch was bad.
    pub penalty: Option<Penalty>,
    /// Penalties for other peers whose pending links this batch proved wrong.
    pub penalties: Vec<PeerPenalty>,
    /// A new gap was opened and needs requests.
    pub request_more: bool,
    /// Something now hangs directly under a persisted header.
    pub persistable: bool,
}

/// Requests and penalties produced by one tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub requests: Vec<HeaderRequest>,
    pub penalties: Vec<PeerPenalty>,
}

/// Result of one persistence round.
#[derive(Debug, Default)]
pub struct InsertOutcome {
    /// Headers written, in the order they were written.
    pub persisted: Vec<(BlockNum, BlockHash)>,
    pub penalties: Vec<PeerPenalty>,
    /// The round ended before the run was exhausted.
    pub stopped_early: bool,
}

/// Read-only snapshot for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainStatus {
    pub links: usize,
    pub pending: usize,
    pub anchors: usize,
    pub highest_in_db: BlockNum,
    pub top_seen_height: BlockNum,
    pub bad_headers: usize,
    pub in_sync: bool,
}

pub struct WorkingChain {
    forest: Forest,
    settings: ChainSettings,
    bad_headers: HashSet<BlockHash>,
    top_seen_height: BlockNum,
    next_skeleton_time: u64,
}

impl WorkingChain {
    pub fn new(settings: ChainSettings) -> Self {
        let forest =
            Forest::new(settings.forest_limits(), settings.preverified_hashes.iter().copied());
        Self {
            forest,
            settings,
            bad_headers: HashSet::new(),
            top_seen_height: 0,
            next_skeleton_time: 0,
        }
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    pub fn highest_in_db(&self) -> BlockNum {
        self.forest.highest_in_db()
    }

    pub fn top_seen_height(&self) -> BlockNum {
        self.top_seen_height
    }

    pub fn is_bad(&self, hash: &BlockHash) -> bool {
        self.bad_headers.contains(hash)
    }

    /// Seed the forest with the tail of the stored chain so that new headers
    /// can attach to it.
    pub fn recover_initial_state(
        &mut self,
        store: &dyn HeaderStore,
    ) -> Result<(), HeaderDownloadError> {
        let Some(highest) = store.highest_header()? else {
            info!("Header store is empty");
            return Ok(());
        };

        let limit = self.settings.persisted_link_limit.max(1);
        let mut headers = vec![highest];
        while headers.len() < limit {
            let Some(last) = headers.last() else {
                break;
            };
            if last.number() == 0 {
                break;
            }
            match store.read_header(last.number() - 1, &last.parent_hash())? {
                Some(parent) => headers.push(parent),
                None => break,
            }
        }

        for header in headers.iter().rev() {
            self.forest.add_persisted_stub(header);
        }
        info!(
            highest_in_db = self.forest.highest_in_db(),
            stubs = headers.len(),
            "Recovered header chain from store"
        );
        Ok(())
    }

    /// Take in one batch from `peer`.
    ///
    /// A batch with a known bad header, or one that contradicts itself, is
    /// dropped whole with a penalty. Otherwise each segment is attached in
    /// turn.
    pub fn accept_headers(&mut self, headers: Vec<BlockHeader>, peer: PeerId) -> AcceptOutcome {
        let mut outcome = AcceptOutcome::default();
        if headers.is_empty() {
            return outcome;
        }

        if let Some(bad) = headers
            .iter()
            .find(|h| self.bad_headers.contains(&h.hash()) || self.bad_headers.contains(&h.parent_hash()))
        {
            warn!(%peer, height = bad.number(), hash = %bad.hash(), "Batch contains a known bad header");
            outcome.penalty = Some(Penalty::BadBlock);
            return outcome;
        }

        let list = HeaderList::new(headers);
        let segments = match list.split_into_segments() {
            Ok(segments) => segments,
            Err(penalty) => {
                warn!(%peer, headers = list.len(), "Rejected batch: {penalty}");
                outcome.penalty = Some(penalty);
                return outcome;
            }
        };

        if let Some(highest) = list.headers().iter().map(|h| h.number()).max() {
            self.top_seen_height = self.top_seen_height.max(highest);
        }

        for segment in &segments {
            let attached = self.forest.attach(segment, peer);
            match attached.kind {
                AttachKind::Refused(Refusal::HeightMismatch) => {
                    warn!(%peer, "Segment heights do not follow on from the forest");
                    outcome.penalty.get_or_insert(Penalty::WrongChildBlockHeight);
                }
                AttachKind::Refused(reason) => {
                    debug!(%peer, ?reason, "Segment refused");
                }
                _ => {}
            }
            for liar in attached.blamed {
                let penalty = PeerPenalty::new(liar, Penalty::WrongChildBlockHeight);
                if !outcome.penalties.contains(&penalty) {
                    outcome.penalties.push(penalty);
                }
            }
            outcome.request_more |= attached.new_anchor;
            outcome.persistable |= attached.persistable;
        }
        outcome
    }

    /// The next anchor request due at `now`, if any.
    ///
    /// Picking an anchor whose last request went unanswered counts a missed
    /// deadline. An anchor that has missed too many is dropped with its
    /// links, and its peer penalised.
    pub fn request_more_headers(&mut self, now: u64) -> (Option<HeaderRequest>, Vec<PeerPenalty>) {
        let mut penalties = Vec::new();
        while let Some(id) = self.forest.next_due_anchor(now) {
            let missed = self.forest.anchor(id).is_some_and(|anchor| anchor.timestamp != 0);
            if missed {
                let count = self.forest.record_timeout(id).unwrap_or_default();
                if count >= self.settings.anchor_timeout_threshold {
                    if let Some((peer, removed)) = self.forest.invalidate_anchor(id) {
                        warn!(%peer, removed, timeouts = count, "Abandoned anchor");
                        penalties.push(PeerPenalty::new(peer, Penalty::AbandonedAnchor));
                    }
                    continue;
                }
            }

            let Some(anchor) = self.forest.anchor(id) else {
                break;
            };
            let request = HeaderRequest {
                hash: Some(anchor.parent_hash),
                number: anchor.block_height.saturating_sub(1),
                length: self.settings.max_len,
                skip: 0,
                reverse: true,
            };
            return (Some(request), penalties);
        }
        (None, penalties)
    }

    /// Record that `request` went out at `now`.
    pub fn request_ack(&mut self, request: &HeaderRequest, now: u64) {
        let Some(id) = request.hash.and_then(|hash| self.forest.anchor_id(&hash)) else {
            return;
        };
        let deadline = now + self.settings.request_timeout.max(1);
        self.forest.set_anchor_deadline(id, deadline);
    }

    /// A sparse forward request towards the highest height seen, one header
    /// per stride above what is stored.
    pub fn request_skeleton(&self) -> Option<HeaderRequest> {
        if self.forest.anchor_count() >= self.settings.skeleton_anchor_limit {
            return None;
        }
        let stride = self.settings.stride();
        if stride == 0 {
            return None;
        }
        let highest = self.forest.highest_in_db();
        let length = (self.top_seen_height.saturating_sub(highest) / stride).min(self.settings.max_len);
        if length == 0 {
            return None;
        }
        Some(HeaderRequest {
            hash: None,
            number: highest + stride,
            length,
            skip: stride - 1,
            reverse: false,
        })
    }

    /// All requests due at `now`: anchor requests up to the per-tick cap,
    /// each acknowledged as sent, then at most one skeleton request per
    /// request timeout.
    pub fn on_tick(&mut self, now: u64) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        while outcome.requests.len() < self.settings.max_requests_per_tick {
            let (request, penalties) = self.request_more_headers(now);
            outcome.penalties.extend(penalties);
            let Some(request) = request else {
                break;
            };
            self.request_ack(&request, now);
            outcome.requests.push(request);
        }

        if now >= self.next_skeleton_time {
            if let Some(skeleton) = self.request_skeleton() {
                trace!(from = skeleton.number, length = skeleton.length, "Skeleton request");
                self.next_skeleton_time = now + self.settings.request_timeout;
                outcome.requests.push(skeleton);
            }
        }
        outcome
    }

    pub fn next_persistable_run(&self) -> Vec<LinkId> {
        self.forest.next_persistable_run()
    }

    /// Validate and store the current persistable run, lowest first.
    ///
    /// A header that fails validation is marked bad and its subtree dropped;
    /// the rest of the run carries on. Stored heights are never rewritten: a
    /// fork whose height was stored earlier in the round is dropped. A header from the future, or one at or
    /// below the preverified height that is not preverified, ends the round.
    pub fn insert_headers(
        &mut self,
        store: &dyn HeaderStore,
        validator: &dyn HeaderValidator,
    ) -> Result<InsertOutcome, HeaderDownloadError> {
        let mut outcome = InsertOutcome::default();

        for id in self.forest.next_persistable_run() {
            // Gone if an ancestor earlier in this run failed
            let Some(link) = self.forest.link(id) else {
                continue;
            };
            if link.height <= self.settings.preverified_height && !link.preverified {
                debug!(height = link.height, "Waiting for the preverified chain");
                outcome.stopped_early = true;
                break;
            }
            let Some(header) = link.header.clone() else {
                continue;
            };
            let (peer, preverified, height) = (link.peer, link.preverified, link.height);
            let parent_persisted = link
                .parent
                .and_then(|parent| self.forest.link(parent))
                .is_some_and(|parent| parent.persisted);
            if parent_persisted && height <= self.forest.highest_in_db() {
                // A sibling at this height was stored earlier in the round
                let removed = self.forest.remove_subtree(id);
                debug!(height, removed, "Dropped fork below the stored tip");
                continue;
            }

            if !preverified {
                let parent = store
                    .read_header(header.number().saturating_sub(1), &header.parent_hash())?
                    .ok_or(HeaderDownloadError::MissingParent {
                        number: header.number(),
                        hash: header.parent_hash(),
                    })?;
                match validator.validate(&header, &parent) {
                    Ok(()) => {}
                    Err(ValidationError::FutureBlock { timestamp, now }) => {
                        debug!(height = header.number(), timestamp, now, "Header from the future");
                        outcome.stopped_early = true;
                        break;
                    }
                    Err(error) => {
                        warn!(
                            height = header.number(),
                            hash = %header.hash(),
                            %peer,
                            "Invalid header: {error}"
                        );
                        self.bad_headers.insert(header.hash());
                        outcome.penalties.push(PeerPenalty::new(peer, Penalty::BadBlock));
                        self.forest.remove_subtree(id);
                        continue;
                    }
                }
            }

            store.append_header(&header)?;
            self.forest.mark_persisted(id);
            outcome.persisted.push((header.number(), header.hash()));
        }

        let evicted = self.forest.evict_persisted_stubs();
        if !outcome.persisted.is_empty() {
            debug!(
                count = outcome.persisted.len(),
                highest_in_db = self.forest.highest_in_db(),
                evicted,
                "Persisted headers"
            );
        }
        Ok(outcome)
    }

    /// Note a block announced by a peer. Returns true if the header is not
    /// known yet and worth fetching.
    pub fn save_external_announce(&mut self, hash: BlockHash, number: BlockNum) -> bool {
        self.top_seen_height = self.top_seen_height.max(number);
        number > self.forest.highest_in_db()
            && !self.forest.contains(&hash)
            && !self.bad_headers.contains(&hash)
    }

    /// Storage has caught up with everything seen and with the preverified
    /// height.
    pub fn in_sync(&self) -> bool {
        let highest = self.forest.highest_in_db();
        highest >= self.settings.preverified_height
            && self.top_seen_height > 0
            && highest >= self.top_seen_height
    }

    /// Mark headers found invalid elsewhere. Pending links with these hashes
    /// are dropped with their subtrees.
    pub fn add_bad_headers(&mut self, hashes: impl IntoIterator<Item = BlockHash>) {
        for hash in hashes {
            self.bad_headers.insert(hash);
            let Some(id) = self.forest.link_id(&hash) else {
                continue;
            };
            if self.forest.link(id).is_some_and(|link| !link.persisted) {
                let removed = self.forest.remove_subtree(id);
                debug!(%hash, removed, "Dropped bad header");
            }
        }
    }

    pub fn status(&self) -> ChainStatus {
        ChainStatus {
            links: self.forest.link_count(),
            pending: self.forest.pending_count(),
            anchors: self.forest.anchor_count(),
            highest_in_db: self.forest.highest_in_db(),
            top_seen_height: self.top_seen_height,
            bad_headers: self.bad_headers.len(),
            in_sync: self.in_sync(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{stores::InMemoryHeaderStore, validator::BasicHeaderValidator};
    use meridian_test_utils::{chain, fork_from, hash, orphan, GENESIS_TIME};
    use test_case::test_case;

    const PEER: PeerId = PeerId(1);
    const OTHER: PeerId = PeerId(2);

    fn settings() -> ChainSettings {
        ChainSettings {
            request_timeout: 10,
            anchor_timeout_threshold: 3,
            max_len: 4,
            stride_factor: 2,
            ..ChainSettings::default()
        }
    }

    fn validator() -> BasicHeaderValidator {
        BasicHeaderValidator::new(15).with_clock(|| u64::MAX / 2)
    }

    /// Helper: working chain recovered from a store holding `stored`.
    fn recovered(settings: ChainSettings, stored: &[BlockHeader]) -> (WorkingChain, InMemoryHeaderStore) {
        let store = InMemoryHeaderStore::with_headers(stored).unwrap();
        let mut chain = WorkingChain::new(settings);
        chain.recover_initial_state(&store).unwrap();
        (chain, store)
    }

    #[test]
    fn first_batch_opens_anchor() {
        let headers = chain(2);
        let mut working = WorkingChain::new(settings());

        let outcome = working.accept_headers(headers[1..=2].to_vec(), PEER);
        assert_eq!(
            outcome,
            AcceptOutcome {
                request_more: true,
                ..AcceptOutcome::default()
            }
        );
        let anchor = working.forest().anchor_by_parent(&headers[0].hash()).unwrap();
        assert_eq!(anchor.block_height, 1);
        assert_eq!(working.status().pending, 2);
        assert_eq!(working.top_seen_height(), 2);
    }

    #[test]
    fn repeated_delivery_changes_nothing() {
        let headers = chain(2);
        let mut working = WorkingChain::new(settings());
        working.accept_headers(headers[1..=2].to_vec(), PEER);
        let before = working.status();

        let outcome = working.accept_headers(vec![headers[2].clone()], OTHER);
        assert_eq!(outcome, AcceptOutcome::default());
        assert_eq!(working.status(), before);
        working.forest().assert_consistent();
    }

    #[test]
    fn inconsistent_batch_is_penalised_without_changes() {
        let headers = chain(2);
        let liar = BlockHeader::new(headers[1].hash(), 5, GENESIS_TIME + 60, 1, vec![]);
        let mut working = WorkingChain::new(settings());

        let outcome = working.accept_headers(vec![headers[1].clone(), headers[2].clone(), liar], PEER);
        assert_eq!(outcome.penalty, Some(Penalty::WrongChildBlockHeight));
        assert_eq!(working.status().links, 0);
        assert_eq!(working.status().anchors, 0);
    }

    #[test]
    fn known_bad_header_is_penalised() {
        let headers = chain(3);
        let mut working = WorkingChain::new(settings());
        working.add_bad_headers([headers[2].hash()]);

        let direct = working.accept_headers(vec![headers[2].clone()], PEER);
        assert_eq!(direct.penalty, Some(Penalty::BadBlock));
        let descendant = working.accept_headers(vec![headers[3].clone()], PEER);
        assert_eq!(descendant.penalty, Some(Penalty::BadBlock));
        assert_eq!(working.status().links, 0);
    }

    #[test]
    fn height_mismatch_with_forest_is_penalised() {
        let headers = chain(3);
        let (mut working, _store) = recovered(settings(), &headers);
        let liar = BlockHeader::new(headers[3].hash(), 7, GENESIS_TIME + 100, 1, vec![]);

        let outcome = working.accept_headers(vec![liar], PEER);
        assert_eq!(outcome.penalty, Some(Penalty::WrongChildBlockHeight));
    }

    #[test]
    fn anchor_request_walks_down_from_gap() {
        let headers = chain(10);
        let mut working = WorkingChain::new(settings());
        working.accept_headers(headers[8..=10].to_vec(), PEER);

        let (request, penalties) = working.request_more_headers(100);
        assert!(penalties.is_empty());
        assert_eq!(
            request,
            Some(HeaderRequest {
                hash: Some(headers[7].hash()),
                number: 7,
                length: 4,
                skip: 0,
                reverse: true,
            })
        );
    }

    #[test]
    fn acknowledged_anchor_waits_for_timeout() {
        let mut working = WorkingChain::new(settings());
        working.accept_headers(vec![orphan(50, 1)], PEER);

        let (request, _) = working.request_more_headers(100);
        let request = request.unwrap();
        working.request_ack(&request, 100);

        assert_eq!(working.request_more_headers(105).0, None);
        assert_eq!(working.request_more_headers(110).0, Some(request));
        let anchor = working.forest().anchor_by_parent(&hash(1)).unwrap();
        assert_eq!(anchor.timeout_count, 1);
        assert_eq!(anchor.timestamp, 0);
    }

    #[test]
    fn anchor_is_abandoned_after_threshold() {
        let mut working = WorkingChain::new(settings());
        working.accept_headers(vec![orphan(50, 1)], PEER);
        working.accept_headers(vec![orphan(80, 2)], OTHER);
        let mut now = 100;

        // Two deadlines missed: one short of the threshold
        for _ in 0..3 {
            let (request, penalties) = working.request_more_headers(now);
            assert!(penalties.is_empty());
            let request = request.unwrap();
            assert_eq!(request.hash, Some(hash(1)));
            working.request_ack(&request, now);
            // Keep the other anchor quiet
            let other = working.forest().anchor_id(&hash(2)).unwrap();
            working.forest.set_anchor_deadline(other, u64::MAX);
            now += 10;
        }
        assert_eq!(working.forest().anchor_by_parent(&hash(1)).unwrap().timeout_count, 2);

        let (request, penalties) = working.request_more_headers(now);
        assert_eq!(penalties, vec![PeerPenalty::new(PEER, Penalty::AbandonedAnchor)]);
        assert_eq!(request, None);
        assert!(working.forest().anchor_by_parent(&hash(1)).is_none());
        assert!(working.forest().anchor_by_parent(&hash(2)).is_some());
        assert_eq!(working.status().pending, 1);
        working.forest().assert_consistent();
    }

    #[test]
    fn skeleton_spans_strides_to_top_seen() {
        let headers = chain(2);
        let (mut working, _store) = recovered(settings(), &headers);
        assert_eq!(working.request_skeleton(), None);

        // stride = 2 * 4 = 8; 25 above the store is three strides
        assert!(working.save_external_announce(hash(9), 27));
        assert_eq!(
            working.request_skeleton(),
            Some(HeaderRequest {
                hash: None,
                number: 10,
                length: 3,
                skip: 7,
                reverse: false,
            })
        );
    }

    #[test]
    fn skeleton_is_capped_and_suppressed_by_anchors() {
        let mut working = WorkingChain::new(ChainSettings {
            skeleton_anchor_limit: 2,
            ..settings()
        });
        working.save_external_announce(hash(9), 10_000);
        assert_eq!(working.request_skeleton().map(|r| r.length), Some(4));

        working.accept_headers(vec![orphan(50, 1)], PEER);
        working.accept_headers(vec![orphan(90, 2)], PEER);
        assert_eq!(working.request_skeleton(), None);
    }

    #[test]
    fn tick_caps_requests_and_adds_skeleton_once() {
        let mut working = WorkingChain::new(ChainSettings {
            max_requests_per_tick: 2,
            ..settings()
        });
        for n in 1..=3u8 {
            working.accept_headers(vec![orphan(100 * n as u64, n)], PEER);
        }
        working.save_external_announce(hash(9), 1_000);

        let first = working.on_tick(100);
        assert_eq!(first.requests.len(), 3);
        assert_eq!(first.requests.iter().filter(|r| r.hash.is_none()).count(), 1);

        let second = working.on_tick(101);
        assert_eq!(second.requests.len(), 1);
        assert!(second.requests[0].hash.is_some());
    }

    #[test_case(AnchorOrdering::LowestFirst ; "lowest first")]
    #[test_case(AnchorOrdering::HighestFirst ; "highest first")]
    fn every_anchor_gets_requested(ordering: AnchorOrdering) {
        let mut working = WorkingChain::new(ChainSettings {
            max_requests_per_tick: 2,
            anchor_ordering: ordering,
            ..settings()
        });
        for n in 1..=5u8 {
            working.accept_headers(vec![orphan(100 * n as u64, n)], PEER);
        }

        let mut requested = HashSet::new();
        for now in 1..=3 {
            for request in working.on_tick(now).requests {
                requested.extend(request.hash);
            }
        }
        assert_eq!(requested.len(), 5);
    }

    #[test]
    fn inserts_run_in_height_order() {
        let headers = chain(6);
        let (mut working, store) = recovered(settings(), &headers[0..=2]);
        working.accept_headers(headers[3..=6].to_vec(), PEER);

        let outcome = working.insert_headers(&store, &validator()).unwrap();
        let heights: Vec<u64> = outcome.persisted.iter().map(|(n, _)| *n).collect();
        assert_eq!(heights, vec![3, 4, 5, 6]);
        assert!(outcome.penalties.is_empty());
        assert_eq!(working.highest_in_db(), 6);
        assert_eq!(store.highest_header().unwrap(), Some(headers[6].clone()));
        assert!(working.next_persistable_run().is_empty());
        working.forest().assert_consistent();
    }

    #[test]
    fn invalid_header_drops_only_its_branch() {
        let headers = chain(2);
        let (mut working, store) = recovered(settings(), &headers);
        let good = fork_from(&headers[2], 2, 1);
        let bad_head =
            BlockHeader::new(headers[2].hash(), 3, headers[2].timestamp() + 12, 0, vec![2]);
        let bad_tail = fork_from(&bad_head, 1, 2);

        let mut bad = vec![bad_head.clone()];
        bad.extend(bad_tail.clone());
        working.accept_headers(bad, OTHER);
        working.accept_headers(good.clone(), PEER);

        let outcome = working.insert_headers(&store, &validator()).unwrap();
        assert_eq!(outcome.penalties, vec![PeerPenalty::new(OTHER, Penalty::BadBlock)]);
        assert_eq!(outcome.persisted.len(), 2);
        assert!(working.is_bad(&bad_head.hash()));
        assert!(!working.forest().contains(&bad_tail[0].hash()));
        assert!(working.forest().contains(&headers[2].hash()));
        assert_eq!(store.read_header_by_number(4).unwrap(), Some(good[1].clone()));
        working.forest().assert_consistent();
    }

    #[test]
    fn fork_below_stored_tip_is_never_persisted() {
        let headers = chain(5);
        let (mut working, store) = recovered(settings(), &headers);

        let outcome = working.accept_headers(fork_from(&headers[2], 1, 9), PEER);
        assert_eq!(outcome.penalty, None);
        let outcome = working.insert_headers(&store, &validator()).unwrap();
        assert!(outcome.persisted.is_empty());
        assert_eq!(store.read_header_by_number(3).unwrap(), Some(headers[3].clone()));
        assert_eq!(working.highest_in_db(), 5);
    }

    #[test]
    fn only_one_fork_is_stored_per_height() {
        let headers = chain(2);
        let (mut working, store) = recovered(settings(), &headers);
        let first = fork_from(&headers[2], 2, 1);
        let second = fork_from(&headers[2], 2, 2);
        working.accept_headers(first.clone(), PEER);
        working.accept_headers(second.clone(), OTHER);

        let outcome = working.insert_headers(&store, &validator()).unwrap();
        assert_eq!(outcome.persisted, vec![(3, first[0].hash()), (4, first[1].hash())]);
        assert!(outcome.penalties.is_empty());
        assert_eq!(store.read_header_by_number(3).unwrap(), Some(first[0].clone()));
        assert!(!working.forest().contains(&second[0].hash()));
        assert!(!working.forest().contains(&second[1].hash()));
        working.forest().assert_consistent();
    }

    #[test]
    fn planted_anchor_does_not_block_honest_batch() {
        let headers = chain(6);
        let (mut working, store) = recovered(settings(), &headers[0..=2]);
        let planted = BlockHeader::new(headers[4].hash(), 50, GENESIS_TIME + 48, 1, vec![]);
        working.accept_headers(vec![planted.clone()], OTHER);

        let outcome = working.accept_headers(headers[3..=6].to_vec(), PEER);
        assert_eq!(outcome.penalty, None);
        assert_eq!(
            outcome.penalties,
            vec![PeerPenalty::new(OTHER, Penalty::WrongChildBlockHeight)]
        );
        assert!(outcome.persistable);
        assert!(!working.forest().contains(&planted.hash()));

        let inserted = working.insert_headers(&store, &validator()).unwrap();
        let heights: Vec<u64> = inserted.persisted.iter().map(|(n, _)| *n).collect();
        assert_eq!(heights, vec![3, 4, 5, 6]);
        assert_eq!(store.highest_header().unwrap(), Some(headers[6].clone()));
    }

    #[test]
    fn future_header_stops_round_without_penalty() {
        let headers = chain(3);
        let (mut working, store) = recovered(settings(), &headers[0..=0]);
        working.accept_headers(headers[1..=3].to_vec(), PEER);
        let validator = BasicHeaderValidator::new(15).with_clock(|| GENESIS_TIME);

        let outcome = working.insert_headers(&store, &validator).unwrap();
        assert_eq!(outcome.persisted.len(), 1);
        assert!(outcome.penalties.is_empty());
        assert!(outcome.stopped_early);
        assert_eq!(working.status().pending, 2);
    }

    #[test]
    fn unverified_headers_wait_below_preverified_height() {
        let headers = chain(4);
        let (mut working, store) = recovered(
            ChainSettings {
                preverified_hashes: vec![headers[3].hash()],
                preverified_height: 3,
                ..settings()
            },
            &headers[0..=0],
        );
        working.accept_headers(headers[1..=2].to_vec(), PEER);
        let outcome = working.insert_headers(&store, &validator()).unwrap();
        assert!(outcome.persisted.is_empty());
        assert!(outcome.stopped_early);

        working.accept_headers(headers[3..=4].to_vec(), PEER);
        let outcome = working.insert_headers(&store, &validator()).unwrap();
        assert_eq!(outcome.persisted.len(), 4);
    }

    #[test]
    fn preverified_headers_skip_validation() {
        let genesis = chain(0);
        // Zero difficulty would fail validation
        let one = BlockHeader::new(genesis[0].hash(), 1, GENESIS_TIME + 12, 0, vec![]);
        let two = BlockHeader::new(one.hash(), 2, GENESIS_TIME + 24, 0, vec![]);
        let (mut working, store) = recovered(
            ChainSettings {
                preverified_hashes: vec![two.hash()],
                preverified_height: 2,
                ..settings()
            },
            &genesis,
        );
        working.accept_headers(vec![one, two], PEER);

        let outcome = working.insert_headers(&store, &validator()).unwrap();
        assert_eq!(outcome.persisted.len(), 2);
        assert!(outcome.penalties.is_empty());
    }

    #[test]
    fn recovery_is_bounded() {
        let headers = chain(20);
        let (working, _store) = recovered(
            ChainSettings {
                persisted_link_limit: 5,
                ..settings()
            },
            &headers,
        );
        assert_eq!(working.highest_in_db(), 20);
        assert_eq!(working.status().links, 5);
        assert!(working.forest().contains(&headers[16].hash()));
        assert!(!working.forest().contains(&headers[15].hash()));
        working.forest().assert_consistent();
    }

    #[test]
    fn sync_verdict_follows_store_and_announcements() {
        let headers = chain(3);
        let (mut working, store) = recovered(settings(), &headers[0..=1]);
        assert!(!working.in_sync());

        assert!(working.save_external_announce(headers[3].hash(), 3));
        assert!(!working.save_external_announce(headers[1].hash(), 1));
        working.accept_headers(headers[2..=3].to_vec(), PEER);
        assert!(!working.in_sync());

        working.insert_headers(&store, &validator()).unwrap();
        assert!(working.in_sync());
        assert!(working.status().in_sync);
    }

    #[test]
    fn reported_bad_header_drops_pending_subtree() {
        let headers = chain(4);
        let (mut working, _store) = recovered(settings(), &headers[0..=1]);
        working.accept_headers(headers[2..=4].to_vec(), PEER);

        working.add_bad_headers([headers[3].hash()]);
        assert!(working.forest().contains(&headers[2].hash()));
        assert!(!working.forest().contains(&headers[4].hash()));
        assert_eq!(working.status().bad_headers, 1);
    }
}
