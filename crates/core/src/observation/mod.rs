//! Hand-off of observation records from the sampling loop to readers.
//!
//! The writer builds every record completely before pushing an
//! `Arc<ObservationRecord>` into the shared history, so a reader either sees a
//! record whole or not at all, never a snapshot that is still being filled.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{BridgeError, ControlState, Result, Snapshot};

/// One published tick. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    iteration: u64,
    frequency: f64,
    timestamp: Duration,
    state: ControlState,
    extended: Snapshot,
}

impl ObservationRecord {
    pub fn new(
        iteration: u64,
        frequency: f64,
        timestamp: Duration,
        state: ControlState,
        extended: Snapshot,
    ) -> Self {
        Self {
            iteration,
            frequency,
            timestamp,
            state,
            extended,
        }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Configured sampling rate in ticks per second.
    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    /// Time since the bridge's timestamp baseline.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    pub fn extended(&self) -> &Snapshot {
        &self.extended
    }

    pub(crate) fn into_extended(self) -> Snapshot {
        self.extended
    }
}

#[derive(Debug)]
struct Entry {
    run: u64,
    record: Arc<ObservationRecord>,
}

impl Entry {
    fn position(&self) -> (u64, u64) {
        (self.run, self.record.iteration())
    }
}

#[derive(Debug)]
struct Slot {
    /// Oldest first, at most `depth` entries.
    history: VecDeque<Entry>,
    depth: usize,
    /// Bumped on every start so restarted counters still order after old ones.
    run: u64,
    closed: bool,
}

/// Shared state between one [`Publisher`] at a time and any number of readers.
#[derive(Debug)]
pub(crate) struct Channel {
    segment_id: String,
    slot: Mutex<Slot>,
    changed: Condvar,
}

impl Channel {
    /// Creates a channel keeping the last `depth` records (at least one).
    pub(crate) fn new(segment_id: impl Into<String>, depth: usize) -> Arc<Self> {
        let depth = depth.max(1);
        Arc::new(Self {
            segment_id: segment_id.into(),
            slot: Mutex::new(Slot {
                history: VecDeque::with_capacity(depth),
                depth,
                run: 0,
                closed: false,
            }),
            changed: Condvar::new(),
        })
    }

    /// Opens the channel for a new run of the sampling loop.
    pub(crate) fn begin_run(self: &Arc<Self>) -> Result<Publisher> {
        let mut slot = self.lock()?;
        slot.run += 1;
        slot.closed = false;
        Ok(Publisher {
            channel: Arc::clone(self),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Slot>> {
        self.slot
            .lock()
            .map_err(|_| BridgeError::msg("observation channel has been poisoned"))
    }
}

/// Writer side, owned by the sampling loop. Dropping it closes the channel.
#[derive(Debug)]
pub(crate) struct Publisher {
    channel: Arc<Channel>,
}

impl Publisher {
    /// Appends `record` to the history and returns the record it evicted.
    pub(crate) fn publish(
        &self,
        record: ObservationRecord,
    ) -> Result<Option<Arc<ObservationRecord>>> {
        let evicted = {
            let mut slot = self.channel.lock()?;
            let run = slot.run;
            slot.history.push_back(Entry {
                run,
                record: Arc::new(record),
            });
            if slot.history.len() > slot.depth {
                slot.history.pop_front().map(|entry| entry.record)
            } else {
                None
            }
        };
        self.channel.changed.notify_all();
        Ok(evicted)
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.channel.lock() {
            slot.closed = true;
        }
        self.channel.changed.notify_all();
    }
}

/// Consumer view over the observations of one bridge.
///
/// A reader walks the history in publication order. One that falls further
/// behind than the history depth resumes at the oldest record still held, so
/// it may skip ticks but never goes backwards.
#[derive(Debug, Clone)]
pub struct ObservationReader {
    channel: Arc<Channel>,
    seen: Option<(u64, u64)>,
}

impl ObservationReader {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            seen: None,
        }
    }

    /// Identifier of the segment the observations are published under.
    pub fn segment_id(&self) -> &str {
        &self.channel.segment_id
    }

    /// Returns the most recent record without waiting.
    pub fn latest(&self) -> Result<Option<Arc<ObservationRecord>>> {
        let slot = self.channel.lock()?;
        Ok(slot.history.back().map(|entry| Arc::clone(&entry.record)))
    }

    /// Returns the record of `iteration` if the history still holds it.
    ///
    /// After a counter reset the most recent run wins.
    pub fn read(&self, iteration: u64) -> Result<Option<Arc<ObservationRecord>>> {
        let slot = self.channel.lock()?;
        Ok(slot
            .history
            .iter()
            .rev()
            .find(|entry| entry.record.iteration() == iteration)
            .map(|entry| Arc::clone(&entry.record)))
    }

    /// Waits for the record following the last one this reader returned.
    ///
    /// A fresh or reset reader starts at the newest record. Returns `None` on
    /// timeout, or once the sampling loop has ended and nothing newer is left.
    pub fn wait_for_next(&mut self, timeout: Duration) -> Result<Option<Arc<ObservationRecord>>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.channel.lock()?;
        loop {
            let next = match self.seen {
                None => slot.history.back(),
                Some(seen) => slot.history.iter().find(|entry| entry.position() > seen),
            };
            if let Some(entry) = next {
                self.seen = Some(entry.position());
                return Ok(Some(Arc::clone(&entry.record)));
            }
            if slot.closed {
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .channel
                .changed
                .wait_timeout(slot, deadline - now)
                .map_err(|_| BridgeError::msg("observation channel has been poisoned"))?;
            slot = guard;
        }
    }

    /// Forgets the position so the next wait starts at the newest record.
    pub fn reset_next_index(&mut self) {
        self.seen = None;
    }
}
