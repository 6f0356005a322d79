/// file: src/buffer.rs
/// description: bounded newest-first event buffer with identity-based dedupe
use crate::types::{Event, EventId};
use std::collections::HashSet;

pub const DEFAULT_RETENTION_CAP: usize = 500;

/// Which copy survives when an incoming event's id is already buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// A buffered copy is never displaced or overwritten; re-deliveries are
    /// dropped and stored events keep their relative order.
    #[default]
    StoredFirst,
    /// Last seen wins: a re-delivered copy moves to the front with its
    /// new contents.
    IncomingFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderingPolicy {
    /// Newest arrival first. Batches from different channels are not
    /// reconciled against each other.
    #[default]
    Arrival,
    /// Re-sort the whole buffer by descending `event_id` after each merge.
    EventId,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// Ids that were not in the buffer before this merge.
    pub inserted: usize,
    /// Copies of the newly inserted events, newest first.
    pub fresh: Vec<Event>,
    /// Batch entries whose id was already buffered or repeated in the batch.
    pub duplicates: usize,
    /// Entries cut off by the retention cap.
    pub evicted: usize,
}

#[derive(Debug, Clone)]
pub struct EventBuffer {
    events: Vec<Event>,
    cap: usize,
    merge_policy: MergePolicy,
    ordering: OrderingPolicy,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_CAP)
    }
}

impl EventBuffer {
    pub fn new(cap: usize) -> Self {
        Self::with_policies(cap, MergePolicy::default(), OrderingPolicy::default())
    }

    pub fn with_policies(cap: usize, merge_policy: MergePolicy, ordering: OrderingPolicy) -> Self {
        Self {
            events: Vec::new(),
            cap: cap.max(1),
            merge_policy,
            ordering,
        }
    }

    /// Merges a batch given in feed order (oldest first). The batch ends up
    /// newest-first in front of the existing entries, duplicates by
    /// `event_id` are removed, and the result is cut to the cap.
    pub fn merge(&mut self, batch: Vec<Event>) -> MergeOutcome {
        if batch.is_empty() {
            return MergeOutcome::default();
        }

        let batch_len = batch.len();
        let previous = std::mem::take(&mut self.events);
        let stored: HashSet<EventId> = previous.iter().map(|e| e.event_id.clone()).collect();
        let mut seen: HashSet<EventId> = HashSet::with_capacity(batch_len + previous.len());
        let mut merged = Vec::with_capacity(batch_len + previous.len());
        let mut fresh = Vec::new();

        for event in batch.into_iter().rev() {
            let is_new = !stored.contains(&event.event_id);
            if self.merge_policy == MergePolicy::StoredFirst && !is_new {
                continue;
            }
            if seen.insert(event.event_id.clone()) {
                if is_new {
                    fresh.push(event.clone());
                }
                merged.push(event);
            }
        }

        merged.extend(
            previous
                .into_iter()
                .filter(|event| !seen.contains(&event.event_id)),
        );

        if self.ordering == OrderingPolicy::EventId {
            merged.sort_by(|a, b| b.event_id.cmp(&a.event_id));
        }

        let evicted = merged.len().saturating_sub(self.cap);
        merged.truncate(self.cap);
        self.events = merged;

        MergeOutcome {
            inserted: fresh.len(),
            duplicates: batch_len - fresh.len(),
            evicted,
            fresh,
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn newest(&self) -> Option<&Event> {
        self.events.first()
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.events.iter().any(|e| &e.event_id == id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
