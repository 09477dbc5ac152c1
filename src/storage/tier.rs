use crate::error::Result;
use crate::storage::event::{Event, EventWithToken, TransactionWithToken};
use crate::storage::index::PositionInfo;
use crate::storage::segment::{EventIterator, EventSource, SegmentView, TransactionIterator};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Callback run by the receiving tier once it owns a handed over segment.
pub type HandoverCallback = Box<dyn FnOnce() + Send>;

/// One storage tier in the chain primary -> secondary -> ...
///
/// Each tier owns a set of segments identified by the token of their first event.
/// `next` links to the tier that receives segments this tier hands over.
pub trait SegmentTier: Send + Sync {
    fn context(&self) -> &str;

    /// Opens the segments with an id below `last_initialized`.
    fn init(&self, last_initialized: u64) -> Result<()>;

    /// Takes ownership of a completed segment.
    fn handover(&self, segment: u64, callback: HandoverCallback) -> Result<()>;

    /// Removes segments starting after `token`, cascading down the chain when the
    /// tier runs empty.
    fn rollback(&self, token: i64) -> Result<()>;

    /// Forgets a segment without deleting its files, used when a higher tier
    /// reopens it for writing.
    fn release(&self, segment: u64);

    /// Segment ids owned by this tier, newest first.
    fn segments(&self) -> Vec<u64>;

    fn event_source(&self, segment: u64) -> Result<Option<Arc<dyn EventSource>>>;

    /// Positions of an aggregate's events in a segment, ordered by sequence number.
    fn positions(&self, segment: u64, aggregate_id: &str) -> Result<Vec<PositionInfo>>;

    fn cleanup(&self);

    /// Files of closed segments newer than `last_segment_backed_up`.
    fn backup_filenames(&self, last_segment_backed_up: i64) -> Vec<PathBuf>;

    fn next(&self) -> Option<Arc<dyn SegmentTier>>;
}

/// All segment ids of the chain starting at `tier`.
pub fn all_segments(tier: &dyn SegmentTier) -> BTreeSet<u64> {
    let mut segments: BTreeSet<u64> = tier.segments().into_iter().collect();
    let mut next = tier.next();
    while let Some(current) = next {
        segments.extend(current.segments());
        next = current.next();
    }
    segments
}

/// Finds the event source of a segment in the first tier that holds it.
pub fn find_source(tier: &dyn SegmentTier, segment: u64) -> Result<Option<Arc<dyn EventSource>>> {
    if let Some(source) = tier.event_source(segment)? {
        return Ok(Some(source));
    }
    let mut next = tier.next();
    while let Some(current) = next {
        if let Some(source) = current.event_source(segment)? {
            return Ok(Some(source));
        }
        next = current.next();
    }
    Ok(None)
}

/// Highest stored sequence number of an aggregate, looking at no more than
/// `max_segments` of the newest segments.
pub fn last_sequence_number(
    tier: &dyn SegmentTier,
    aggregate_id: &str,
    max_segments: usize,
) -> Result<Option<u64>> {
    let mut checked = 0usize;
    let mut current: Option<Arc<dyn SegmentTier>> = None;
    loop {
        let tier_ref: &dyn SegmentTier = match &current {
            Some(t) => t.as_ref(),
            None => tier,
        };
        for segment in tier_ref.segments() {
            if checked >= max_segments {
                return Ok(None);
            }
            checked += 1;
            // includes writes not yet committed, they are already reserved
            let positions = tier_ref.positions(segment, aggregate_id)?;
            if let Some(last) = positions.last() {
                return Ok(Some(last.aggregate_sequence_number));
            }
        }
        match tier_ref.next() {
            Some(next) => current = Some(next),
            None => return Ok(None),
        }
    }
}

/// Events of an aggregate with a sequence number of at least `from_sequence`,
/// in sequence order.
pub fn aggregate_events(tier: &dyn SegmentTier, aggregate_id: &str, from_sequence: u64) -> Result<Vec<Event>> {
    let mut batches: Vec<Vec<Event>> = Vec::new();
    let mut current: Option<Arc<dyn SegmentTier>> = None;
    let mut seen = BTreeSet::new();
    'tiers: loop {
        let tier_ref: &dyn SegmentTier = match &current {
            Some(t) => t.as_ref(),
            None => tier,
        };
        for segment in tier_ref.segments() {
            if !seen.insert(segment) {
                continue;
            }
            let positions = visible_positions(tier_ref, segment, aggregate_id)?;
            if positions.is_empty() {
                continue;
            }
            let Some(source) = tier_ref.event_source(segment)? else {
                continue;
            };
            let view = SegmentView::new(source);
            let mut events = Vec::new();
            for info in positions.iter().filter(|p| p.aggregate_sequence_number >= from_sequence) {
                events.push(view.read_event(info.position)?);
            }
            batches.push(events);
            if positions[0].aggregate_sequence_number <= from_sequence {
                break 'tiers;
            }
        }
        match tier_ref.next() {
            Some(next) => current = Some(next),
            None => break,
        }
    }
    Ok(batches.into_iter().rev().flatten().collect())
}

/// Positions that readers may already see.
fn visible_positions(tier: &dyn SegmentTier, segment: u64, aggregate_id: &str) -> Result<Vec<PositionInfo>> {
    let positions = tier.positions(segment, aggregate_id)?;
    if positions.is_empty() {
        return Ok(positions);
    }
    let limit = match tier.event_source(segment)? {
        Some(source) => source.readable_limit(),
        None => return Ok(Vec::new()),
    };
    Ok(positions.into_iter().filter(|p| p.position < limit).collect())
}

fn start_segment(segments: &BTreeSet<u64>, token: i64) -> Option<u64> {
    let token = token.max(0) as u64;
    segments.range(..=token).next_back().copied()
}

/// Lazily reads events across segments and tiers, starting at a token.
pub struct EventStream {
    root: Arc<dyn SegmentTier>,
    current: Option<EventIterator>,
    current_segment: Option<u64>,
    next_token: i64,
    finished: bool,
}

impl EventStream {
    pub fn new(root: Arc<dyn SegmentTier>, from_token: i64) -> Self {
        Self {
            root,
            current: None,
            current_segment: None,
            next_token: from_token.max(0),
            finished: false,
        }
    }

    fn open_next(&mut self) -> Result<bool> {
        let segments = all_segments(self.root.as_ref());
        let segment = match self.current_segment {
            None => start_segment(&segments, self.next_token),
            Some(current) => segments.range(current + 1..).next().copied(),
        };
        let Some(segment) = segment else {
            return Ok(false);
        };
        if self.current_segment.is_some() {
            self.next_token = self.next_token.max(segment as i64);
        }
        let Some(source) = find_source(self.root.as_ref(), segment)? else {
            return Ok(false);
        };
        self.current = Some(EventIterator::new(source, self.next_token)?);
        self.current_segment = Some(segment);
        Ok(true)
    }
}

impl Iterator for EventStream {
    type Item = Result<EventWithToken>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(iterator) = self.current.as_mut() {
                match iterator.next() {
                    Some(Ok(info)) => {
                        self.next_token = info.token + 1;
                        return Some(Ok(EventWithToken {
                            token: info.token,
                            event: info.event,
                        }));
                    }
                    Some(Err(e)) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }
            match self.open_next() {
                Ok(true) => {}
                Ok(false) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Lazily reads whole transactions across segments and tiers.
pub struct TransactionStream {
    root: Arc<dyn SegmentTier>,
    current: Option<TransactionIterator>,
    current_segment: Option<u64>,
    next_token: i64,
    finished: bool,
}

impl TransactionStream {
    pub fn new(root: Arc<dyn SegmentTier>, from_token: i64) -> Self {
        Self {
            root,
            current: None,
            current_segment: None,
            next_token: from_token.max(0),
            finished: false,
        }
    }

    fn open_next(&mut self) -> Result<bool> {
        let segments = all_segments(self.root.as_ref());
        let segment = match self.current_segment {
            None => start_segment(&segments, self.next_token),
            Some(current) => segments.range(current + 1..).next().copied(),
        };
        let Some(segment) = segment else {
            return Ok(false);
        };
        if self.current_segment.is_some() {
            self.next_token = self.next_token.max(segment as i64);
        }
        let Some(source) = find_source(self.root.as_ref(), segment)? else {
            return Ok(false);
        };
        self.current = Some(TransactionIterator::new(source, self.next_token)?);
        self.current_segment = Some(segment);
        Ok(true)
    }
}

impl Iterator for TransactionStream {
    type Item = Result<TransactionWithToken>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(iterator) = self.current.as_mut() {
                match iterator.next() {
                    Some(Ok(tx)) => {
                        self.next_token = tx.token + tx.events.len() as i64;
                        return Some(Ok(tx));
                    }
                    Some(Err(e)) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }
            match self.open_next() {
                Ok(true) => {}
                Ok(false) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
