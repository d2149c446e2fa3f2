//! In-memory forest of pending headers.
//!
//! Links are kept in an arena addressed by [`LinkId`] with a hash index next
//! to it; anchors likewise by [`AnchorId`] with an index on the missing
//! parent hash. Four queues give ordered views over the arena: pending links
//! oldest first (persistence) and youngest first (eviction), anchors by
//! request deadline, and persisted stubs oldest first.

use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
};

use meridian_common::{BlockHash, BlockHeader, BlockNum, PeerId};
use tracing::{debug, trace, warn};

use crate::{
    header_list::Segment,
    link::{Anchor, AnchorId, Attachment, Link, LinkId},
    queues::IndexedQueue,
};

/// Which anchor goes first when several share a request deadline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnchorOrdering {
    #[default]
    LowestFirst,
    HighestFirst,
}

/// How a segment was merged into the forest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachKind {
    /// Filled the gap between an existing link and an anchor.
    Connect,
    /// Grew an anchored subtree downwards.
    ExtendDown,
    /// Grew an existing link upwards.
    ExtendUp,
    /// Started a new subtree.
    NewAnchor,
    /// Everything in the segment was already known.
    Duplicate,
    /// Not attached.
    Refused(Refusal),
}

/// Why a segment was not attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Refusal {
    /// Would add a fork under a preverified link that already has a child.
    PreverifiedFork,
    /// Would open a gap at or below the highest persisted height.
    TooFarPast,
    /// The forest already holds the maximum number of anchors.
    AnchorLimit,
    /// Heights do not follow on from the link it would join.
    HeightMismatch,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachOutcome {
    pub kind: AttachKind,
    /// A new gap was opened and needs requests.
    pub new_anchor: bool,
    /// The segment hangs directly under a persisted link.
    pub persistable: bool,
    /// Peers whose links claimed a height the segment proved wrong. Their
    /// links were dropped before attaching.
    pub blamed: Vec<PeerId>,
}

impl AttachOutcome {
    fn new(kind: AttachKind) -> Self {
        Self {
            kind,
            new_anchor: false,
            persistable: false,
            blamed: Vec::new(),
        }
    }

    fn refused(refusal: Refusal) -> Self {
        Self::new(AttachKind::Refused(refusal))
    }
}

/// Size bounds and ordering policy of a forest.
#[derive(Clone, Debug)]
pub struct ForestLimits {
    /// Pending links kept before the youngest are evicted.
    pub link_limit: usize,
    /// Anchors allowed before new subtrees are refused.
    pub anchor_limit: usize,
    /// Persisted stubs kept as attachment points.
    pub persisted_link_limit: usize,
    pub anchor_ordering: AnchorOrdering,
}

impl Default for ForestLimits {
    fn default() -> Self {
        Self {
            link_limit: 65_536,
            anchor_limit: 512,
            persisted_link_limit: 3_000,
            anchor_ordering: AnchorOrdering::default(),
        }
    }
}

type AnchorKey = (u64, u64);

pub struct Forest {
    links: HashMap<LinkId, Link>,
    link_by_hash: HashMap<BlockHash, LinkId>,
    anchors: HashMap<AnchorId, Anchor>,
    anchor_by_parent: HashMap<BlockHash, AnchorId>,
    next_link_id: u64,
    next_anchor_id: u64,

    persist_queue: IndexedQueue<BlockNum, LinkId>,
    evict_queue: IndexedQueue<Reverse<BlockNum>, LinkId>,
    anchor_queue: IndexedQueue<AnchorKey, AnchorId>,
    persisted_queue: IndexedQueue<BlockNum, LinkId>,

    preverified_hashes: HashSet<BlockHash>,
    highest_in_db: BlockNum,
    limits: ForestLimits,
}

impl Forest {
    pub fn new(limits: ForestLimits, preverified_hashes: impl IntoIterator<Item = BlockHash>) -> Self {
        Self {
            links: HashMap::new(),
            link_by_hash: HashMap::new(),
            anchors: HashMap::new(),
            anchor_by_parent: HashMap::new(),
            next_link_id: 0,
            next_anchor_id: 0,
            persist_queue: IndexedQueue::new(),
            evict_queue: IndexedQueue::new(),
            anchor_queue: IndexedQueue::new(),
            persisted_queue: IndexedQueue::new(),
            preverified_hashes: preverified_hashes.into_iter().collect(),
            highest_in_db: 0,
            limits,
        }
    }

    pub fn limits(&self) -> &ForestLimits {
        &self.limits
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn link_id(&self, hash: &BlockHash) -> Option<LinkId> {
        self.link_by_hash.get(hash).copied()
    }

    pub fn link_by_hash(&self, hash: &BlockHash) -> Option<&Link> {
        self.link_id(hash).and_then(|id| self.links.get(&id))
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.link_by_hash.contains_key(hash)
    }

    pub fn anchor(&self, id: AnchorId) -> Option<&Anchor> {
        self.anchors.get(&id)
    }

    pub fn anchor_id(&self, parent_hash: &BlockHash) -> Option<AnchorId> {
        self.anchor_by_parent.get(parent_hash).copied()
    }

    pub fn anchor_by_parent(&self, parent_hash: &BlockHash) -> Option<&Anchor> {
        self.anchor_id(parent_hash).and_then(|id| self.anchors.get(&id))
    }

    /// Anchors in request order.
    pub fn anchors(&self) -> impl Iterator<Item = (AnchorId, &Anchor)> + '_ {
        self.anchor_queue
            .iter()
            .filter_map(|(_, id)| self.anchors.get(&id).map(|anchor| (id, anchor)))
    }

    /// Every link, pending or persisted.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn pending_count(&self) -> usize {
        self.persist_queue.len()
    }

    pub fn persisted_count(&self) -> usize {
        self.persisted_queue.len()
    }

    pub fn anchor_count(&self) -> usize {
        self.anchors.len()
    }

    pub fn highest_in_db(&self) -> BlockNum {
        self.highest_in_db
    }

    pub fn is_preverified_hash(&self, hash: &BlockHash) -> bool {
        self.preverified_hashes.contains(hash)
    }

    /// Merge one segment into the forest.
    ///
    /// Headers above the highest one that some anchor is waiting for are
    /// ignored, as are headers below the highest one whose parent is already
    /// a link. Re-attaching known headers changes nothing.
    ///
    /// The header an anchor waits for fixes the height of the links above
    /// it. Links of that anchor at any other height are dropped first and
    /// their peers reported in [`AttachOutcome::blamed`].
    pub fn attach(&mut self, segment: &Segment, peer: PeerId) -> AttachOutcome {
        let mut blamed = Vec::new();
        let (anchor, start) = loop {
            let (anchor, start) = self.find_anchor(segment);
            let Some(id) = anchor else {
                break (None, start);
            };
            let dropped = self.drop_contradicting_links(id, segment.get(start));
            if dropped.is_empty() {
                break (Some(id), start);
            }
            for liar in dropped {
                if !blamed.contains(&liar) {
                    blamed.push(liar);
                }
            }
        };

        let (parent, end) = self.find_link(segment, start);
        if end <= start {
            trace!(
                height = segment.highest().map(|h| h.number()),
                "Duplicate segment"
            );
            return AttachOutcome {
                blamed,
                ..AttachOutcome::new(AttachKind::Duplicate)
            };
        }

        let run = segment.slice(start, end);
        let mut outcome = match (anchor, parent) {
            (Some(anchor), Some(parent)) => self.connect(&run, parent, anchor, peer),
            (Some(anchor), None) => self.extend_down(&run, anchor, peer),
            (None, Some(parent)) => self.extend_up(&run, parent, peer),
            (None, None) => self.new_anchor(&run, peer),
        };
        debug!(
            kind = ?outcome.kind,
            from = run.lowest().map(|h| h.number()),
            to = run.highest().map(|h| h.number()),
            %peer,
            "Attached segment"
        );

        if !matches!(outcome.kind, AttachKind::Refused(_)) {
            self.prune();
        }
        outcome.blamed = blamed;
        outcome
    }

    /// Drop the links of `anchor` whose height does not follow on from
    /// `top`, the header the anchor is waiting for. Returns the peers that
    /// supplied them.
    fn drop_contradicting_links(&mut self, anchor: AnchorId, top: Option<&BlockHeader>) -> Vec<PeerId> {
        let expected = top.and_then(|top| top.number().checked_add(1));
        let contradicting: Vec<LinkId> = match self.anchors.get(&anchor) {
            Some(entry) => entry
                .links
                .iter()
                .copied()
                .filter(|id| self.links.get(id).is_some_and(|link| Some(link.height) != expected))
                .collect(),
            None => return Vec::new(),
        };

        let mut peers = Vec::new();
        for id in contradicting {
            let Some((peer, height)) = self.links.get(&id).map(|link| (link.peer, link.height)) else {
                continue;
            };
            let removed = self.remove_subtree(id);
            warn!(%peer, height, ?expected, removed, "Dropped links at the wrong height for their parent");
            peers.push(peer);
        }
        peers
    }

    /// Highest position whose header is the missing parent of an anchor.
    fn find_anchor(&self, segment: &Segment) -> (Option<AnchorId>, usize) {
        segment
            .headers()
            .enumerate()
            .find_map(|(position, header)| {
                self.anchor_id(&header.hash()).map(|anchor| (Some(anchor), position))
            })
            .unwrap_or((None, 0))
    }

    /// First position at or below `start` whose parent is a known link. An
    /// end of zero marks the segment as already known.
    fn find_link(&self, segment: &Segment, start: usize) -> (Option<LinkId>, usize) {
        match segment.get(start) {
            Some(header) if self.contains(&header.hash()) => return (None, 0),
            None => return (None, 0),
            _ => {}
        }
        segment
            .headers()
            .enumerate()
            .skip(start)
            .find_map(|(position, header)| {
                self.link_id(&header.parent_hash()).map(|link| (Some(link), position + 1))
            })
            .unwrap_or((None, segment.len()))
    }

    fn connect(
        &mut self,
        run: &Segment,
        parent: LinkId,
        anchor: AnchorId,
        peer: PeerId,
    ) -> AttachOutcome {
        if let Some(refusal) = self.check_parent(parent, run) {
            return AttachOutcome::refused(refusal);
        }

        let inherit = self.anchor_preverified(anchor);
        let Some(top) = self.add_chain(run, Attachment::Link(parent), peer) else {
            return AttachOutcome::new(AttachKind::Duplicate);
        };
        self.reparent_anchor_links(anchor, top);
        self.remove_anchor(anchor);
        if inherit {
            self.mark_preverified(top);
        }

        AttachOutcome {
            persistable: self.links.get(&parent).is_some_and(|link| link.persisted),
            ..AttachOutcome::new(AttachKind::Connect)
        }
    }

    fn extend_down(&mut self, run: &Segment, anchor: AnchorId, peer: PeerId) -> AttachOutcome {
        let (Some(old), Some(lowest)) = (self.anchors.get(&anchor), run.lowest()) else {
            return AttachOutcome::new(AttachKind::Duplicate);
        };

        let anchor_peer = old.peer;
        let inherit = self.anchor_preverified(anchor);
        let (below, created) = match self.anchor_id(&lowest.parent_hash()) {
            Some(existing) => (existing, false),
            None => (
                self.add_anchor(lowest.parent_hash(), lowest.number(), anchor_peer),
                true,
            ),
        };

        let Some(top) = self.add_chain(run, Attachment::Anchor(below), peer) else {
            return AttachOutcome::new(AttachKind::Duplicate);
        };
        self.reparent_anchor_links(anchor, top);
        self.remove_anchor(anchor);
        if inherit {
            self.mark_preverified(top);
        }

        AttachOutcome {
            new_anchor: created,
            ..AttachOutcome::new(AttachKind::ExtendDown)
        }
    }

    fn extend_up(&mut self, run: &Segment, parent: LinkId, peer: PeerId) -> AttachOutcome {
        if let Some(refusal) = self.check_parent(parent, run) {
            return AttachOutcome::refused(refusal);
        }
        if self.add_chain(run, Attachment::Link(parent), peer).is_none() {
            return AttachOutcome::new(AttachKind::Duplicate);
        }

        AttachOutcome {
            persistable: self.links.get(&parent).is_some_and(|link| link.persisted),
            ..AttachOutcome::new(AttachKind::ExtendUp)
        }
    }

    fn new_anchor(&mut self, run: &Segment, peer: PeerId) -> AttachOutcome {
        let Some(lowest) = run.lowest() else {
            return AttachOutcome::new(AttachKind::Duplicate);
        };
        if lowest.number() <= self.highest_in_db {
            return AttachOutcome::refused(Refusal::TooFarPast);
        }

        // A sibling subtree may already be waiting for the same parent
        let (anchor, created) = match self.anchor_id(&lowest.parent_hash()) {
            Some(existing) => (existing, false),
            None => {
                if self.anchors.len() >= self.limits.anchor_limit {
                    return AttachOutcome::refused(Refusal::AnchorLimit);
                }
                (
                    self.add_anchor(lowest.parent_hash(), lowest.number(), peer),
                    true,
                )
            }
        };
        self.add_chain(run, Attachment::Anchor(anchor), peer);

        AttachOutcome {
            new_anchor: created,
            ..AttachOutcome::new(AttachKind::NewAnchor)
        }
    }

    /// Can `run` hang under `parent`?
    fn check_parent(&self, parent: LinkId, run: &Segment) -> Option<Refusal> {
        let link = self.links.get(&parent)?;
        if link.preverified && !link.next.is_empty() {
            return Some(Refusal::PreverifiedFork);
        }
        match run.lowest() {
            Some(lowest) if link.height.checked_add(1) != Some(lowest.number()) => {
                Some(Refusal::HeightMismatch)
            }
            // A fork off a stored header that does not climb past the stored
            // tip could only overwrite canonical entries
            Some(lowest) if link.persisted && lowest.number() <= self.highest_in_db => {
                Some(Refusal::TooFarPast)
            }
            _ => None,
        }
    }

    fn anchor_preverified(&self, anchor: AnchorId) -> bool {
        self.anchors.get(&anchor).is_some_and(|anchor| {
            anchor
                .links
                .iter()
                .any(|id| self.links.get(id).is_some_and(|link| link.preverified))
        })
    }

    /// Chain `run` bottom-up onto `below`, returning the top link.
    fn add_chain(&mut self, run: &Segment, below: Attachment, peer: PeerId) -> Option<LinkId> {
        let mut below = below;
        let mut top = None;
        for header in run.headers().rev() {
            let id = self.add_link(header.clone(), below, peer);
            below = Attachment::Link(id);
            top = Some(id);
        }
        top
    }

    fn add_link(&mut self, header: BlockHeader, below: Attachment, peer: PeerId) -> LinkId {
        let id = LinkId(self.next_link_id);
        self.next_link_id += 1;

        let mut link = Link::new(header, peer);
        match below {
            Attachment::Link(parent) => link.parent = Some(parent),
            Attachment::Anchor(anchor) => link.anchor = Some(anchor),
        }

        let (hash, height) = (link.hash, link.height);
        self.links.insert(id, link);
        self.link_by_hash.insert(hash, id);
        self.persist_queue.insert(id, height);
        self.evict_queue.insert(id, Reverse(height));

        match below {
            Attachment::Link(parent) => {
                if let Some(parent) = self.links.get_mut(&parent) {
                    parent.next.push(id);
                }
            }
            Attachment::Anchor(anchor) => {
                if let Some(entry) = self.anchors.get_mut(&anchor) {
                    entry.links.push(id);
                }
                self.refresh_anchor(anchor);
            }
        }

        if self.preverified_hashes.contains(&hash) {
            self.mark_preverified(id);
        }
        id
    }

    fn add_anchor(&mut self, parent_hash: BlockHash, block_height: BlockNum, peer: PeerId) -> AnchorId {
        let id = AnchorId(self.next_anchor_id);
        self.next_anchor_id += 1;

        let anchor = Anchor::new(parent_hash, block_height, peer);
        let key = self.anchor_key(&anchor);
        self.anchors.insert(id, anchor);
        self.anchor_by_parent.insert(parent_hash, id);
        self.anchor_queue.insert(id, key);
        id
    }

    fn anchor_key(&self, anchor: &Anchor) -> AnchorKey {
        let height = match self.limits.anchor_ordering {
            AnchorOrdering::LowestFirst => anchor.block_height,
            AnchorOrdering::HighestFirst => u64::MAX - anchor.block_height,
        };
        (anchor.timestamp, height)
    }

    /// Recompute the height of `anchor` from its links and requeue it.
    fn refresh_anchor(&mut self, anchor: AnchorId) {
        let lowest = match self.anchors.get(&anchor) {
            Some(entry) => entry
                .links
                .iter()
                .filter_map(|id| self.links.get(id).map(|link| link.height))
                .min(),
            None => return,
        };
        if let Some(entry) = self.anchors.get_mut(&anchor) {
            if let Some(lowest) = lowest {
                entry.block_height = lowest;
            }
        }
        self.reschedule_anchor(anchor);
    }

    fn reschedule_anchor(&mut self, anchor: AnchorId) {
        if let Some(entry) = self.anchors.get(&anchor) {
            let key = self.anchor_key(entry);
            self.anchor_queue.reschedule(anchor, key);
        }
    }

    /// Move every link hanging from `anchor` under `top`.
    fn reparent_anchor_links(&mut self, anchor: AnchorId, top: LinkId) {
        let children = match self.anchors.get_mut(&anchor) {
            Some(entry) => std::mem::take(&mut entry.links),
            None => return,
        };
        for child in &children {
            if let Some(link) = self.links.get_mut(child) {
                link.anchor = None;
                link.parent = Some(top);
            }
        }
        if let Some(link) = self.links.get_mut(&top) {
            link.next.extend(children);
        }
    }

    fn remove_anchor(&mut self, anchor: AnchorId) -> Option<Anchor> {
        let entry = self.anchors.remove(&anchor)?;
        if self.anchor_by_parent.get(&entry.parent_hash) == Some(&anchor) {
            self.anchor_by_parent.remove(&entry.parent_hash);
        }
        self.anchor_queue.remove(anchor);
        Some(entry)
    }

    /// Flag `id` and all its ancestors as preverified.
    pub fn mark_preverified(&mut self, id: LinkId) {
        let mut current = Some(id);
        while let Some(id) = current {
            let Some(link) = self.links.get_mut(&id) else {
                break;
            };
            if link.preverified {
                break;
            }
            link.preverified = true;
            current = link.parent;
        }
    }

    /// Evict the youngest non-preverified links until the pending count is
    /// back within the limit.
    fn prune(&mut self) {
        while self.persist_queue.len() > self.limits.link_limit {
            let victim = self
                .evict_queue
                .iter()
                .map(|(_, id)| id)
                .find(|id| self.links.get(id).is_some_and(|link| !link.preverified));
            let Some(victim) = victim else {
                break;
            };
            let height = self.links.get(&victim).map(|link| link.height);
            let removed = self.remove_subtree(victim);
            warn!(?height, removed, "Forest over capacity, evicted youngest link");
        }
    }

    /// Remove `root` and everything above it. Returns the number of links
    /// removed. The parent link or anchor loses the child; an anchor left
    /// without links is removed too.
    pub fn remove_subtree(&mut self, root: LinkId) -> usize {
        let Some(link) = self.links.get(&root) else {
            return 0;
        };
        let (parent, anchor) = (link.parent, link.anchor);

        if let Some(parent) = parent.and_then(|parent| self.links.get_mut(&parent)) {
            parent.next.retain(|&child| child != root);
        }
        if let Some(anchor) = anchor {
            let emptied = match self.anchors.get_mut(&anchor) {
                Some(entry) => {
                    entry.links.retain(|&child| child != root);
                    entry.links.is_empty()
                }
                None => false,
            };
            if emptied {
                self.remove_anchor(anchor);
            }
        }

        let mut removed = 0;
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(link) = self.links.remove(&id) else {
                continue;
            };
            self.link_by_hash.remove(&link.hash);
            self.persist_queue.remove(id);
            self.evict_queue.remove(id);
            self.persisted_queue.remove(id);
            stack.extend(link.next);
            removed += 1;
        }

        if let Some(anchor) = anchor {
            self.refresh_anchor(anchor);
        }
        removed
    }

    /// Drop `anchor` and every link reachable only through it. Returns the
    /// peer that supplied it and the number of links removed.
    pub fn invalidate_anchor(&mut self, anchor: AnchorId) -> Option<(PeerId, usize)> {
        let entry = self.remove_anchor(anchor)?;
        let removed = entry.links.iter().map(|&link| self.remove_subtree(link)).sum();
        Some((entry.peer, removed))
    }

    /// The anchor first in line, if its deadline is not in the future.
    pub fn next_due_anchor(&self, now: u64) -> Option<AnchorId> {
        let (_, id) = self.anchor_queue.peek()?;
        let anchor = self.anchors.get(&id)?;
        (anchor.timestamp <= now).then_some(id)
    }

    /// Set the request deadline of `anchor`.
    pub fn set_anchor_deadline(&mut self, anchor: AnchorId, timestamp: u64) -> bool {
        let Some(entry) = self.anchors.get_mut(&anchor) else {
            return false;
        };
        entry.timestamp = timestamp;
        self.reschedule_anchor(anchor);
        true
    }

    /// Count a missed deadline against `anchor` and make it due again.
    /// Returns the updated count.
    pub fn record_timeout(&mut self, anchor: AnchorId) -> Option<u32> {
        let entry = self.anchors.get_mut(&anchor)?;
        entry.timeout_count += 1;
        entry.timestamp = 0;
        let count = entry.timeout_count;
        self.reschedule_anchor(anchor);
        Some(count)
    }

    /// Maximal set of pending links, height ascending, whose parent is
    /// either persisted or earlier in the set.
    ///
    /// Heights never skip: a link more than one above everything persisted
    /// or collected so far ends the walk. A link hanging from a persisted
    /// header at or below the stored tip is a fork and never persistable.
    pub fn next_persistable_run(&self) -> Vec<LinkId> {
        let mut run = Vec::new();
        let mut in_run = HashSet::new();
        let mut frontier = self.highest_in_db;

        for (height, id) in self.persist_queue.iter() {
            if height > frontier.saturating_add(1) {
                break;
            }
            let Some(parent) = self.links.get(&id).and_then(|link| link.parent) else {
                continue;
            };
            let parent_ready = in_run.contains(&parent)
                || (height > self.highest_in_db
                    && self.links.get(&parent).is_some_and(|p| p.persisted));
            if parent_ready {
                run.push(id);
                in_run.insert(id);
                frontier = frontier.max(height);
            }
        }
        run
    }

    /// Record that the header of `id` is now in storage. The link drops its
    /// header and becomes a stub.
    pub fn mark_persisted(&mut self, id: LinkId) -> Option<BlockHeader> {
        let link = self.links.get_mut(&id)?;
        assert!(link.anchor.is_none(), "persisted link {} hangs from an anchor", link.hash);
        link.persisted = true;
        let header = link.header.take();
        let height = link.height;

        self.persist_queue.remove(id);
        self.evict_queue.remove(id);
        self.persisted_queue.insert(id, height);
        self.highest_in_db = self.highest_in_db.max(height);
        header
    }

    /// Add a persisted stub for a header read back from storage. Stubs must
    /// be added parents first.
    pub fn add_persisted_stub(&mut self, header: &BlockHeader) -> LinkId {
        if let Some(existing) = self.link_id(&header.hash()) {
            return existing;
        }
        let id = LinkId(self.next_link_id);
        self.next_link_id += 1;

        let mut link = Link::stub(header);
        if let Some(parent) = self.link_id(&header.parent_hash()) {
            link.parent = Some(parent);
            if let Some(parent) = self.links.get_mut(&parent) {
                parent.next.push(id);
            }
        }
        link.preverified = self.preverified_hashes.contains(&link.hash);

        self.link_by_hash.insert(link.hash, id);
        self.persisted_queue.insert(id, link.height);
        self.highest_in_db = self.highest_in_db.max(link.height);
        self.links.insert(id, link);
        id
    }

    /// Drop the oldest persisted stubs beyond the limit. A stub with pending
    /// children is kept, since they still need it as their parent.
    pub fn evict_persisted_stubs(&mut self) -> usize {
        let excess = self.persisted_queue.len().saturating_sub(self.limits.persisted_link_limit);
        if excess == 0 {
            return 0;
        }

        let victims: Vec<LinkId> = self
            .persisted_queue
            .iter()
            .map(|(_, id)| id)
            .filter(|id| {
                self.links.get(id).is_some_and(|link| {
                    link.next.iter().all(|child| self.links.get(child).is_some_and(|c| c.persisted))
                })
            })
            .take(excess)
            .collect();

        for &id in &victims {
            let Some(link) = self.links.remove(&id) else {
                continue;
            };
            self.link_by_hash.remove(&link.hash);
            self.persisted_queue.remove(id);
            for child in &link.next {
                if let Some(child) = self.links.get_mut(child) {
                    child.parent = None;
                }
            }
            if let Some(parent) = link.parent.and_then(|parent| self.links.get_mut(&parent)) {
                parent.next.retain(|&child| child != id);
            }
        }
        victims.len()
    }

    /// Panics if any structural invariant of the forest is broken.
    pub fn assert_consistent(&self) {
        assert_eq!(self.links.len(), self.link_by_hash.len(), "link index size");
        for (hash, id) in &self.link_by_hash {
            let link = self.links.get(id).expect("indexed link exists");
            assert_eq!(&link.hash, hash, "link index hash");
        }

        for (&id, link) in &self.links {
            if let Some(parent) = link.parent {
                let parent = self.links.get(&parent).expect("parent link exists");
                assert!(parent.next.contains(&id), "parent lists child {}", link.hash);
                assert_eq!(parent.hash, link.parent_hash, "parent hash of {}", link.hash);
                assert_eq!(parent.height + 1, link.height, "height of {}", link.hash);
            }
            if let Some(anchor) = link.anchor {
                assert!(link.parent.is_none(), "{} has parent and anchor", link.hash);
                let anchor = self.anchors.get(&anchor).expect("anchor exists");
                assert!(anchor.links.contains(&id), "anchor lists {}", link.hash);
                assert_eq!(anchor.parent_hash, link.parent_hash, "anchor parent of {}", link.hash);
            }
            for child in &link.next {
                let child = self.links.get(child).expect("child link exists");
                assert_eq!(child.parent, Some(id), "child points back to {}", link.hash);
            }

            if link.persisted {
                assert!(link.header.is_none(), "persisted {} keeps header", link.hash);
                assert_eq!(self.persisted_queue.key(id), Some(link.height));
                assert!(!self.persist_queue.contains(id));
            } else {
                assert!(
                    link.parent.is_some() || link.anchor.is_some(),
                    "pending {} is rooted",
                    link.hash
                );
                let header = link.header.as_ref().expect("pending link has header");
                assert_eq!(header.hash(), link.hash);
                assert_eq!(header.number(), link.height);
                assert_eq!(self.persist_queue.key(id), Some(link.height));
                assert_eq!(self.evict_queue.key(id), Some(Reverse(link.height)));
            }
            if link.preverified {
                if let Some(parent) = link.parent.and_then(|parent| self.links.get(&parent)) {
                    assert!(parent.preverified, "ancestor of preverified {}", link.hash);
                }
            }
        }

        assert_eq!(self.anchors.len(), self.anchor_by_parent.len(), "anchor index size");
        for (&id, anchor) in &self.anchors {
            assert_eq!(self.anchor_by_parent.get(&anchor.parent_hash), Some(&id));
            assert!(!anchor.links.is_empty(), "anchor {} is empty", anchor.parent_hash);
            let lowest = anchor.links.iter().filter_map(|l| self.links.get(l)).map(|l| l.height).min();
            assert_eq!(lowest, Some(anchor.block_height), "height of anchor {}", anchor.parent_hash);
            assert_eq!(self.anchor_queue.key(id), Some(self.anchor_key(anchor)));
        }

        assert_eq!(
            self.persist_queue.len() + self.persisted_queue.len(),
            self.links.len(),
            "every link queued once"
        );
        assert_eq!(self.evict_queue.len(), self.persist_queue.len());
        assert_eq!(self.anchor_queue.len(), self.anchors.len());
        assert!(self.persist_queue.is_consistent());
        assert!(self.evict_queue.is_consistent());
        assert!(self.anchor_queue.is_consistent());
        assert!(self.persisted_queue.is_consistent());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header_list::HeaderList;
    use meridian_test_utils::{chain, chain_from, fork_from, hash, orphan, GENESIS_TIME};

    const PEER: PeerId = PeerId(1);
    const OTHER: PeerId = PeerId(2);

    fn forest() -> Forest {
        Forest::new(ForestLimits::default(), [])
    }

    /// Helper: the single segment made from `headers`.
    fn segment(headers: &[BlockHeader]) -> Segment {
        let mut segments = HeaderList::new(headers.to_vec()).split_into_segments().unwrap();
        assert_eq!(segments.len(), 1);
        segments.remove(0)
    }

    fn attach(forest: &mut Forest, headers: &[BlockHeader]) -> AttachOutcome {
        let outcome = forest.attach(&segment(headers), PEER);
        forest.assert_consistent();
        outcome
    }

    /// Helper: a forest whose storage already holds `headers`.
    fn persisted(headers: &[BlockHeader]) -> Forest {
        let mut forest = forest();
        for header in headers {
            forest.add_persisted_stub(header);
        }
        forest.assert_consistent();
        forest
    }

    fn heights(forest: &Forest, run: &[LinkId]) -> Vec<u64> {
        run.iter().map(|id| forest.link(*id).unwrap().height).collect()
    }

    #[test]
    fn unanchored_segment_opens_anchor() {
        let headers = chain(2);
        let mut forest = forest();

        let outcome = attach(&mut forest, &headers[1..=2]);
        assert_eq!(outcome.kind, AttachKind::NewAnchor);
        assert!(outcome.new_anchor);
        assert!(!outcome.persistable);

        assert_eq!(forest.anchor_count(), 1);
        let anchor = forest.anchor_by_parent(&headers[0].hash()).unwrap();
        assert_eq!(anchor.block_height, 1);
        assert_eq!(anchor.links.len(), 1);
        assert_eq!(forest.pending_count(), 2);

        let bottom = forest.link_by_hash(&headers[1].hash()).unwrap();
        let top = forest.link_id(&headers[2].hash()).unwrap();
        assert_eq!(bottom.next, vec![top]);
    }

    #[test]
    fn repeated_segment_is_a_no_op() {
        let headers = chain(2);
        let mut forest = forest();
        attach(&mut forest, &headers[1..=2]);

        let outcome = attach(&mut forest, &headers[2..=2]);
        assert_eq!(outcome.kind, AttachKind::Duplicate);
        let outcome = attach(&mut forest, &headers[1..=2]);
        assert_eq!(outcome.kind, AttachKind::Duplicate);
        assert_eq!(forest.pending_count(), 2);
        assert_eq!(forest.anchor_count(), 1);
    }

    #[test]
    fn extends_up_from_persisted_link() {
        let headers = chain(5);
        let mut forest = persisted(&headers[0..=2]);

        let outcome = attach(&mut forest, &headers[3..=5]);
        assert_eq!(outcome.kind, AttachKind::ExtendUp);
        assert!(outcome.persistable);
        assert_eq!(forest.anchor_count(), 0);
        assert_eq!(forest.pending_count(), 3);
    }

    #[test]
    fn extends_anchor_down() {
        let headers = chain(6);
        let mut forest = forest();
        attach(&mut forest, &headers[5..=6]);
        let old = forest.anchor_id(&headers[4].hash()).unwrap();

        let outcome = attach(&mut forest, &headers[3..=4]);
        assert_eq!(outcome.kind, AttachKind::ExtendDown);
        assert!(outcome.new_anchor);
        assert!(forest.anchor(old).is_none());

        let anchor = forest.anchor_by_parent(&headers[2].hash()).unwrap();
        assert_eq!(anchor.block_height, 3);
        assert_eq!(anchor.peer, PEER);
        let four = forest.link_id(&headers[4].hash()).unwrap();
        let five = forest.link_by_hash(&headers[5].hash()).unwrap();
        assert_eq!(five.parent, Some(four));
    }

    #[test]
    fn connects_anchor_to_persisted_link() {
        let headers = chain(6);
        let mut forest = persisted(&headers[0..=2]);
        attach(&mut forest, &headers[5..=6]);

        let outcome = attach(&mut forest, &headers[3..=4]);
        assert_eq!(outcome.kind, AttachKind::Connect);
        assert!(outcome.persistable);
        assert_eq!(forest.anchor_count(), 0);
        assert_eq!(heights(&forest, &forest.next_persistable_run()), vec![3, 4, 5, 6]);
    }

    #[test]
    fn ignores_headers_above_anchor_parent() {
        let headers = chain(6);
        let mut forest = forest();
        attach(&mut forest, &headers[4..=4]);

        // 5 and 6 sit above the header anchor 4 waits for
        let outcome = attach(&mut forest, &headers[2..=6]);
        assert_eq!(outcome.kind, AttachKind::ExtendDown);
        assert!(forest.contains(&headers[3].hash()));
        assert!(!forest.contains(&headers[5].hash()));
        assert!(!forest.contains(&headers[6].hash()));
    }

    #[test]
    fn ignores_headers_below_known_parent() {
        let headers = chain(5);
        let mut forest = persisted(&headers[0..=3]);

        // 2 and 3 are already persisted
        let outcome = attach(&mut forest, &headers[2..=5]);
        assert_eq!(outcome.kind, AttachKind::ExtendUp);
        assert_eq!(forest.pending_count(), 2);
    }

    #[test]
    fn anchor_too_far_in_past_is_refused() {
        let headers = chain(5);
        let mut forest = persisted(&headers[0..=5]);
        let stale = orphan(4, 7);

        let outcome = attach(&mut forest, &[stale]);
        assert_eq!(outcome.kind, AttachKind::Refused(Refusal::TooFarPast));
        assert_eq!(forest.anchor_count(), 0);
    }

    #[test]
    fn anchor_limit_is_enforced() {
        let mut forest = Forest::new(
            ForestLimits {
                anchor_limit: 2,
                ..ForestLimits::default()
            },
            [],
        );
        attach(&mut forest, &[orphan(10, 1)]);
        attach(&mut forest, &[orphan(20, 2)]);
        let outcome = attach(&mut forest, &[orphan(30, 3)]);
        assert_eq!(outcome.kind, AttachKind::Refused(Refusal::AnchorLimit));
        assert_eq!(forest.anchor_count(), 2);
    }

    #[test]
    fn fork_below_stored_tip_is_refused() {
        let headers = chain(5);
        let mut forest = persisted(&headers[0..=5]);
        let fork = fork_from(&headers[2], 1, 9);

        let outcome = attach(&mut forest, &fork);
        assert_eq!(outcome.kind, AttachKind::Refused(Refusal::TooFarPast));
        assert_eq!(forest.pending_count(), 0);
        assert!(forest.next_persistable_run().is_empty());
    }

    #[test]
    fn sibling_of_persisted_header_leaves_the_run() {
        let headers = chain(3);
        let mut forest = persisted(&headers[0..=2]);
        let sibling = fork_from(&headers[2], 1, 9);
        attach(&mut forest, &headers[3..=3]);
        attach(&mut forest, &sibling);
        assert_eq!(heights(&forest, &forest.next_persistable_run()), vec![3, 3]);

        let canonical = forest.link_id(&headers[3].hash()).unwrap();
        forest.mark_persisted(canonical);
        forest.assert_consistent();
        assert!(forest.next_persistable_run().is_empty());
        assert!(forest.contains(&sibling[0].hash()));
    }

    #[test]
    fn anchor_links_at_wrong_height_are_dropped() {
        let headers = chain(6);
        let mut forest = persisted(&headers[0..=2]);
        // Claims headers[4] as parent but not its height
        let liar = BlockHeader::new(headers[4].hash(), 50, GENESIS_TIME, 1, vec![]);
        forest.attach(&segment(&[liar.clone()]), OTHER);
        assert_eq!(forest.anchor_by_parent(&headers[4].hash()).unwrap().block_height, 50);

        let outcome = attach(&mut forest, &headers[3..=6]);
        assert_eq!(outcome.kind, AttachKind::ExtendUp);
        assert_eq!(outcome.blamed, vec![OTHER]);
        assert!(!forest.contains(&liar.hash()));
        assert_eq!(forest.anchor_count(), 0);
        assert_eq!(heights(&forest, &forest.next_persistable_run()), vec![3, 4, 5, 6]);
    }

    #[test]
    fn honest_sibling_survives_dropped_anchor_links() {
        let headers = chain(6);
        let mut forest = persisted(&headers[0..=2]);
        attach(&mut forest, &headers[5..=5]);
        let liar = BlockHeader::new(headers[4].hash(), 50, GENESIS_TIME, 1, vec![]);
        forest.attach(&segment(&[liar.clone()]), OTHER);
        assert_eq!(forest.anchor_by_parent(&headers[4].hash()).unwrap().links.len(), 2);

        let outcome = attach(&mut forest, &headers[3..=4]);
        assert_eq!(outcome.kind, AttachKind::Connect);
        assert_eq!(outcome.blamed, vec![OTHER]);
        assert!(forest.contains(&headers[5].hash()));
        assert!(!forest.contains(&liar.hash()));
        assert_eq!(heights(&forest, &forest.next_persistable_run()), vec![3, 4, 5]);
    }

    #[test]
    fn siblings_share_an_anchor() {
        let headers = chain(3);
        let left = fork_from(&headers[3], 1, 1);
        let right = fork_from(&headers[3], 1, 2);
        let mut forest = forest();

        let first = attach(&mut forest, &left);
        let second = attach(&mut forest, &right);
        assert!(first.new_anchor);
        assert!(!second.new_anchor);
        assert_eq!(forest.anchor_count(), 1);
        assert_eq!(forest.anchor_by_parent(&headers[3].hash()).unwrap().links.len(), 2);
    }

    #[test]
    fn height_mismatch_is_refused() {
        let headers = chain(3);
        let mut forest = persisted(&headers[0..=3]);
        let liar = BlockHeader::new(headers[3].hash(), 9, 0, 1, vec![]);

        let outcome = attach(&mut forest, &[liar]);
        assert_eq!(outcome.kind, AttachKind::Refused(Refusal::HeightMismatch));
        assert_eq!(forest.pending_count(), 0);
    }

    #[test]
    fn preverified_hash_marks_ancestors() {
        let headers = chain(6);
        let mut forest = Forest::new(ForestLimits::default(), [headers[4].hash()]);
        attach(&mut forest, &headers[1..=6]);

        for number in 1..=4 {
            assert!(forest.link_by_hash(&headers[number].hash()).unwrap().preverified);
        }
        for number in 5..=6 {
            assert!(!forest.link_by_hash(&headers[number].hash()).unwrap().preverified);
        }
    }

    #[test]
    fn extending_below_preverified_anchor_inherits() {
        let headers = chain(6);
        let mut forest = Forest::new(ForestLimits::default(), [headers[5].hash()]);
        attach(&mut forest, &headers[5..=6]);

        attach(&mut forest, &headers[2..=4]);
        assert!(forest.link_by_hash(&headers[2].hash()).unwrap().preverified);
    }

    #[test]
    fn fork_under_preverified_link_is_refused() {
        let headers = chain(4);
        let mut forest = Forest::new(ForestLimits::default(), [headers[3].hash()]);
        attach(&mut forest, &headers[1..=3]);

        let fork = fork_from(&headers[2], 1, 5);
        let outcome = attach(&mut forest, &fork);
        assert_eq!(outcome.kind, AttachKind::Refused(Refusal::PreverifiedFork));
    }

    #[test]
    fn over_capacity_evicts_youngest() {
        let headers = chain(6);
        let mut forest = Forest::new(
            ForestLimits {
                link_limit: 4,
                ..ForestLimits::default()
            },
            [],
        );
        attach(&mut forest, &headers[1..=6]);
        assert_eq!(forest.pending_count(), 4);
        assert!(forest.contains(&headers[4].hash()));
        assert!(!forest.contains(&headers[5].hash()));
        assert!(!forest.contains(&headers[6].hash()));
    }

    #[test]
    fn preverified_chain_outlives_link_limit() {
        let headers = chain(6);
        let mut forest = Forest::new(
            ForestLimits {
                link_limit: 3,
                ..ForestLimits::default()
            },
            [headers[4].hash()],
        );

        attach(&mut forest, &headers[1..=4]);
        assert_eq!(forest.pending_count(), 4);

        attach(&mut forest, &headers[5..=6]);
        assert_eq!(forest.pending_count(), 4);
        for number in 1..=4 {
            assert!(forest.link_by_hash(&headers[number].hash()).unwrap().preverified);
        }
        assert!(!forest.contains(&headers[5].hash()));
        assert!(!forest.contains(&headers[6].hash()));
    }

    #[test]
    fn eviction_empties_and_removes_anchor() {
        let headers = chain(3);
        let mut forest = Forest::new(
            ForestLimits {
                link_limit: 3,
                ..ForestLimits::default()
            },
            [],
        );
        attach(&mut forest, &headers[1..=3]);
        attach(&mut forest, &[orphan(50, 9)]);
        assert_eq!(forest.anchor_count(), 1);
        assert!(forest.anchor_by_parent(&hash(9)).is_none());
    }

    #[test]
    fn removing_branch_keeps_sibling_and_ancestor() {
        let headers = chain(2);
        let mut forest = persisted(&headers[0..=1]);
        attach(&mut forest, &headers[2..=2]);
        let left = fork_from(&headers[2], 2, 1);
        let right = fork_from(&headers[2], 2, 2);
        attach(&mut forest, &left);
        attach(&mut forest, &right);

        let root = forest.link_id(&left[0].hash()).unwrap();
        assert_eq!(forest.remove_subtree(root), 2);
        forest.assert_consistent();

        assert!(forest.contains(&headers[2].hash()));
        assert!(forest.contains(&right[0].hash()));
        assert!(forest.contains(&right[1].hash()));
        assert!(!forest.contains(&left[1].hash()));
    }

    #[test]
    fn invalidating_anchor_leaves_other_anchors() {
        let mut forest = forest();
        let low = chain_from(&orphan(10, 1), 2);
        attach(&mut forest, &[orphan(10, 1)]);
        attach(&mut forest, &low);
        attach(&mut forest, &[orphan(40, 2)]);

        let anchor = forest.anchor_id(&hash(1)).unwrap();
        assert_eq!(forest.invalidate_anchor(anchor), Some((PEER, 3)));
        forest.assert_consistent();
        assert_eq!(forest.anchor_count(), 1);
        assert_eq!(forest.pending_count(), 1);
    }

    #[test]
    fn persistable_run_stops_at_gap() {
        let headers = chain(14);
        let mut forest = persisted(&headers[0..=10]);
        attach(&mut forest, &headers[11..=12]);
        attach(&mut forest, &headers[14..=14]);

        let run = forest.next_persistable_run();
        assert_eq!(heights(&forest, &run), vec![11, 12]);
    }

    #[test]
    fn persisting_turns_links_into_stubs() {
        let headers = chain(3);
        let mut forest = persisted(&headers[0..=1]);
        attach(&mut forest, &headers[2..=3]);

        for id in forest.next_persistable_run() {
            assert!(forest.mark_persisted(id).is_some());
        }
        forest.assert_consistent();
        assert_eq!(forest.highest_in_db(), 3);
        assert_eq!(forest.pending_count(), 0);
        assert_eq!(forest.persisted_count(), 4);
        assert!(forest.next_persistable_run().is_empty());

        // Re-delivery after persistence changes nothing
        let outcome = attach(&mut forest, &headers[2..=3]);
        assert_eq!(outcome.kind, AttachKind::Duplicate);
        assert_eq!(forest.link_count(), 4);
    }

    #[test]
    fn old_stubs_are_evicted() {
        let headers = chain(9);
        let mut forest = Forest::new(
            ForestLimits {
                persisted_link_limit: 3,
                ..ForestLimits::default()
            },
            [],
        );
        for header in &headers {
            forest.add_persisted_stub(header);
        }
        assert_eq!(forest.evict_persisted_stubs(), 7);
        forest.assert_consistent();
        assert_eq!(forest.persisted_count(), 3);
        assert!(forest.contains(&headers[7].hash()));
        assert!(!forest.contains(&headers[6].hash()));
    }

    #[test]
    fn stub_with_pending_child_is_kept() {
        let headers = chain(3);
        let mut forest = Forest::new(
            ForestLimits {
                persisted_link_limit: 0,
                ..ForestLimits::default()
            },
            [],
        );
        forest.add_persisted_stub(&headers[0]);
        forest.add_persisted_stub(&headers[1]);
        attach(&mut forest, &headers[2..=3]);

        assert_eq!(forest.evict_persisted_stubs(), 1);
        forest.assert_consistent();
        assert!(forest.contains(&headers[1].hash()));
        assert!(!forest.contains(&headers[0].hash()));
    }

    #[test]
    fn anchor_ordering_picks_tie_break() {
        for (ordering, expected) in
            [(AnchorOrdering::LowestFirst, 10), (AnchorOrdering::HighestFirst, 30)]
        {
            let mut forest = Forest::new(
                ForestLimits {
                    anchor_ordering: ordering,
                    ..ForestLimits::default()
                },
                [],
            );
            attach(&mut forest, &[orphan(20, 2)]);
            attach(&mut forest, &[orphan(10, 1)]);
            attach(&mut forest, &[orphan(30, 3)]);
            let first = forest.next_due_anchor(0).unwrap();
            assert_eq!(forest.anchor(first).unwrap().block_height, expected);
        }
    }

    #[test]
    fn deadline_and_timeouts_requeue_anchor() {
        let mut forest = forest();
        attach(&mut forest, &[orphan(10, 1)]);
        attach(&mut forest, &[orphan(20, 2)]);
        let low = forest.anchor_id(&hash(1)).unwrap();
        let high = forest.anchor_id(&hash(2)).unwrap();

        assert!(forest.set_anchor_deadline(low, 100));
        forest.assert_consistent();
        assert_eq!(forest.next_due_anchor(50), Some(high));
        assert!(forest.set_anchor_deadline(high, 100));
        assert_eq!(forest.next_due_anchor(50), None);
        assert_eq!(forest.next_due_anchor(100), Some(low));

        assert_eq!(forest.record_timeout(low), Some(1));
        forest.assert_consistent();
        assert_eq!(forest.anchor(low).unwrap().timestamp, 0);
    }
}
