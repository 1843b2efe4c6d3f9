// ABOUTME: Timer queue for deferred orchestrator actions such as invitations, replies and sign-offs.
// ABOUTME: Entries are ordered by fire time and each carries a CancellationToken checked when it comes due.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Handle to a scheduled entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug)]
struct TimerEntry<T> {
    payload: T,
    token: CancellationToken,
}

/// Deferred work keyed by fire time.
///
/// The queue is driven by explicit `now` values, so the owner decides how
/// time advances (a tokio interval in production, fixed instants in tests).
#[derive(Debug)]
pub struct TimerQueue<T> {
    entries: BTreeMap<(DateTime<Utc>, TimerId), TimerEntry<T>>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub fn schedule(&mut self, fire_at: DateTime<Utc>, payload: T, token: CancellationToken) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.entries
            .insert((fire_at, id), TimerEntry { payload, token });
        id
    }

    pub fn schedule_after(
        &mut self,
        now: DateTime<Utc>,
        delay: Duration,
        payload: T,
        token: CancellationToken,
    ) -> TimerId {
        self.schedule(now + delay, payload, token)
    }

    /// Cancel one entry; returns false if it already fired or never existed
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let key = self.entries.keys().find(|(_, entry_id)| *entry_id == id).copied();
        match key.and_then(|key| self.entries.remove(&key)) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove and return every payload due at or before `now`, earliest first.
    /// Cancelled entries are dropped silently.
    pub fn drain_due(&mut self, now: DateTime<Utc>) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let entry = entry.remove();
            if !entry.token.is_cancelled() {
                due.push(entry.payload);
            }
        }
        due
    }

    /// Drop entries whose token has been cancelled
    pub fn purge_cancelled(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.token.is_cancelled());
        before - self.entries.len()
    }

    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
