//! Splitting of an inbound header batch into contiguous segments.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use meridian_common::{BlockHash, BlockHeader, Penalty};

/// One batch of headers as received from a peer, shared by every segment cut
/// from it.
#[derive(Debug)]
pub struct HeaderList {
    headers: Vec<BlockHeader>,
}

impl HeaderList {
    pub fn new(headers: Vec<BlockHeader>) -> Arc<Self> {
        Arc::new(Self { headers })
    }

    pub fn headers(&self) -> &[BlockHeader] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Group the batch into maximal hash-linked runs.
    ///
    /// Segments are returned highest first and each is ordered high to low.
    /// A header with exactly one in-batch child continues that child's
    /// segment; a header with none or several starts a new one, so forks are
    /// never merged. A batch that contradicts itself is rejected as a whole.
    pub fn split_into_segments(self: &Arc<Self>) -> Result<Vec<Segment>, Penalty> {
        let headers = &self.headers;

        let mut order: Vec<usize> = (0..headers.len()).collect();
        order.sort_by(|&a, &b| {
            headers[b]
                .number()
                .cmp(&headers[a].number())
                .then_with(|| headers[a].hash().cmp(&headers[b].hash()))
        });

        let mut seen: HashSet<BlockHash> = HashSet::with_capacity(headers.len());
        let mut children: HashMap<BlockHash, Vec<usize>> = HashMap::new();
        let mut segment_of: HashMap<BlockHash, usize> = HashMap::new();
        let mut segments: Vec<Vec<usize>> = Vec::new();

        for index in order {
            let header = &headers[index];
            if !seen.insert(header.hash()) {
                return Err(Penalty::DuplicateHeader);
            }

            // Heights only go down from here, so a parent already visited
            // cannot sit exactly one below this header
            if seen.contains(&header.parent_hash()) {
                return Err(Penalty::WrongChildBlockHeight);
            }

            let mut continues = None;
            if let Some(kids) = children.get(&header.hash()) {
                let expected = header.number().checked_add(1);
                if kids.iter().any(|&kid| Some(headers[kid].number()) != expected) {
                    return Err(Penalty::WrongChildBlockHeight);
                }
                if let [only] = kids.as_slice() {
                    continues = segment_of.get(&headers[*only].hash()).copied();
                }
            }

            let segment = match continues {
                Some(segment) => {
                    segments[segment].push(index);
                    segment
                }
                None => {
                    segments.push(vec![index]);
                    segments.len() - 1
                }
            };
            segment_of.insert(header.hash(), segment);
            children.entry(header.parent_hash()).or_default().push(index);
        }

        Ok(segments
            .into_iter()
            .map(|indices| Segment {
                list: self.clone(),
                indices,
            })
            .collect())
    }
}

/// A contiguous run of headers from one batch, highest first.
#[derive(Clone, Debug)]
pub struct Segment {
    list: Arc<HeaderList>,
    indices: Vec<usize>,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Header at `position`, counting down from the top.
    pub fn get(&self, position: usize) -> Option<&BlockHeader> {
        self.indices.get(position).map(|&index| &self.list.headers[index])
    }

    /// Headers from highest to lowest.
    pub fn headers(&self) -> impl DoubleEndedIterator<Item = &BlockHeader> + '_ {
        self.indices.iter().map(|&index| &self.list.headers[index])
    }

    pub fn highest(&self) -> Option<&BlockHeader> {
        self.get(0)
    }

    pub fn lowest(&self) -> Option<&BlockHeader> {
        self.indices.last().map(|&index| &self.list.headers[index])
    }

    /// Sub-run `[start, end)` sharing the same batch.
    pub fn slice(&self, start: usize, end: usize) -> Segment {
        Segment {
            list: self.list.clone(),
            indices: self.indices[start..end].to_vec(),
        }
    }
}
