//! In-memory buffer between the scan loop and the upstream writer.
//!
//! Readings are queued per measurement group, each queue kept in capture
//! order. The capacity ceiling counts pending group entries (points): when it
//! is exceeded the oldest entries across all groups are dropped so ingestion
//! never waits on the sink. Draining only detaches queues, so it never holds
//! up `add` for more than a swap.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use log::warn;

use crate::metrics::Metrics;
use crate::models::{Batch, MeasurementGroup, Queued, SharedReading};

#[derive(Debug, Default)]
struct State {
    groups: [VecDeque<Queued>; 4],
    next_id: u64,
}

impl State {
    fn len(&self) -> usize {
        self.groups.iter().map(VecDeque::len).sum()
    }

    /// Drop the oldest entries across all groups until at most `capacity` remain
    fn enforce_capacity(&mut self, capacity: usize) -> u64 {
        let mut len = self.len();
        let mut evicted = 0;
        while len > capacity {
            let oldest = self
                .groups
                .iter()
                .enumerate()
                .filter_map(|(i, queue)| queue.front().map(|entry| (entry.key(), i)))
                .min();
            let Some((_, i)) = oldest else {
                break;
            };
            self.groups[i].pop_front();
            len -= 1;
            evicted += 1;
        }
        evicted
    }
}

#[derive(Debug)]
pub struct Buffer {
    capacity: usize,
    state: Mutex<State>,
    metrics: Arc<Metrics>,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Self::with_metrics(capacity, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Buffer {
            capacity,
            state: Mutex::new(State::default()),
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a reading under every measurement group it carries
    pub fn add(&self, reading: SharedReading) {
        let evicted = {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;

            let entry = Queued { id, reading };
            let key = entry.key();
            for group in entry.reading.groups() {
                let queue = &mut state.groups[group.index()];
                // Readings almost always arrive in capture order, so this is
                // normally the end of the queue
                let pos = queue.partition_point(|e| e.key() < key);
                queue.insert(pos, entry.clone());
            }
            state.enforce_capacity(self.capacity)
        };
        self.report_evictions(evicted);
    }

    /// Detach pending entries for one group, or every group when `group` is
    /// `None`. Groups with nothing pending produce no batch.
    pub fn drain(&self, group: Option<MeasurementGroup>) -> Vec<Batch> {
        let groups = match group {
            Some(group) => vec![group],
            None => MeasurementGroup::ALL.to_vec(),
        };

        let detached: Vec<(MeasurementGroup, VecDeque<Queued>)> = {
            let mut state = self.lock();
            groups
                .into_iter()
                .map(|group| (group, std::mem::take(&mut state.groups[group.index()])))
                .collect()
        };

        detached
            .into_iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(group, entries)| Batch {
                group,
                entries: entries.into(),
            })
            .collect()
    }

    /// Put an undelivered batch back, keeping capture order
    pub fn requeue(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        let evicted = {
            let mut state = self.lock();
            let queue = &mut state.groups[batch.group.index()];
            let mut merged: Vec<Queued> = std::mem::take(queue).into();
            merged.extend(batch.entries);
            merged.sort_by_key(Queued::key);
            *queue = merged.into();
            state.enforce_capacity(self.capacity)
        };
        self.report_evictions(evicted);
    }

    fn report_evictions(&self, evicted: u64) {
        if evicted > 0 {
            self.metrics.record_evicted(evicted);
            warn!(
                "Buffer full ({} points), dropped {} oldest (total dropped: {})",
                self.capacity,
                evicted,
                self.metrics.evicted()
            );
        }
    }

    /// Group entries waiting to be written, across all groups
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_in(&self, group: MeasurementGroup) -> usize {
        self.lock().groups[group.index()].len()
    }

    pub fn evicted(&self) -> u64 {
        self.metrics.evicted()
    }
}
