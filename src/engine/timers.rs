//! Deadline-ordered timer registry.
//!
//! Deadlines are [`Tick`]s, milliseconds on a wrapping 32-bit clock. Two
//! deadlines are compared relative to the nearest pending one, so ordering
//! stays correct across the wrap as long as every pending deadline is within
//! about 24 days of the others.
//!
//! While the dispatch thread delivers due timers it locks the due prefix.
//! New entries are inserted after it and deletions inside it only mark the
//! entry as cancelled; the prefix is removed when the pass unlocks.

use crate::error::Error;
use crate::event::Param;
use crate::socket::{SocketRef, SocketUid};

/// Wrapping millisecond clock value.
pub type Tick = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    Active,
    Cancelled,
}

#[derive(Debug)]
pub struct TimerEntry {
    pub target: SocketRef,
    pub deadline: Tick,
    pub id: u32,
    pub param: Option<Param>,
    pub status: TimerStatus,
}

impl TimerEntry {
    pub fn new(target: SocketRef, deadline: Tick, id: u32, param: Option<Param>) -> Self {
        Self {
            target,
            deadline,
            id,
            param,
            status: TimerStatus::Active,
        }
    }
}

/// A due timer taken out of the locked prefix.
#[derive(Debug)]
pub struct FiredTimer {
    pub target: SocketRef,
    pub id: u32,
    pub param: Option<Param>,
}

/// Result of [`TimerRegistry::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerDeletion {
    /// Entries removed or cancelled.
    pub matched: usize,
    /// The earliest unlocked entry was removed, so the armed deadline is stale.
    pub head_removed: bool,
}

#[derive(Debug, Default)]
pub struct TimerRegistry {
    entries: Vec<TimerEntry>,
    locked: Option<usize>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.is_some()
    }

    fn locked_len(&self) -> usize {
        self.locked.unwrap_or(0)
    }

    /// Deadline of the first entry after the locked prefix.
    pub fn head_deadline(&self) -> Option<Tick> {
        self.entries.get(self.locked_len()).map(|e| e.deadline)
    }

    /// `(uid, id, deadline)` of every pending entry, in firing order.
    pub fn pending(&self) -> impl Iterator<Item = (SocketUid, u32, Tick)> + '_ {
        self.entries
            .iter()
            .filter(|e| e.status == TimerStatus::Active)
            .map(|e| (e.target.uid, e.id, e.deadline))
    }

    /// Index at which an entry with `deadline` goes, searching from `left`.
    /// Entries with an equal deadline stay in front of the new one.
    pub fn find_index(&self, deadline: Tick, left: usize) -> usize {
        let Some(first) = self.entries.get(left) else {
            return left;
        };
        let base = if (deadline.wrapping_sub(first.deadline) as i32) < 0 {
            deadline
        } else {
            first.deadline
        };
        let key = deadline.wrapping_sub(base);
        left + self.entries[left..].partition_point(|e| e.deadline.wrapping_sub(base) <= key)
    }

    /// Inserts `entry` and returns its index. Index 0 means the nearest
    /// deadline changed.
    pub fn insert(&mut self, entry: TimerEntry) -> Result<usize, Error> {
        self.entries
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory("timer registry"))?;
        let index = self.find_index(entry.deadline, self.locked_len());
        self.entries.insert(index, entry);
        Ok(index)
    }

    /// Removes every entry of socket `uid` with timer `id`. Entries in the
    /// locked prefix are cancelled instead.
    pub fn delete(&mut self, uid: SocketUid, id: u32) -> TimerDeletion {
        let locked = self.locked_len();
        let matches = |e: &TimerEntry| e.target.uid == uid && e.id == id;

        let mut outcome = TimerDeletion::default();
        for entry in self.entries[..locked].iter_mut() {
            if matches(&*entry) && entry.status == TimerStatus::Active {
                entry.status = TimerStatus::Cancelled;
                entry.param = None;
                outcome.matched += 1;
            }
        }

        outcome.head_removed = self.entries.get(locked).is_some_and(|e| matches(e));
        let mut index = 0;
        self.entries.retain(|entry| {
            let keep = index < locked || !matches(entry);
            index += 1;
            if !keep {
                outcome.matched += 1;
            }
            keep
        });
        outcome
    }

    /// Locks the prefix of entries due at `now` and returns its length.
    pub fn lock_due(&mut self, now: Tick) -> usize {
        let due = self.find_index(now, 0);
        if due > 0 {
            self.locked = Some(due);
        }
        due
    }

    /// Takes entry `index` of the locked prefix unless it was cancelled.
    pub fn take_locked(&mut self, index: usize) -> Option<FiredTimer> {
        if index >= self.locked_len() {
            return None;
        }
        let entry = &mut self.entries[index];
        if entry.status != TimerStatus::Active {
            return None;
        }
        entry.status = TimerStatus::Cancelled;
        Some(FiredTimer {
            target: entry.target,
            id: entry.id,
            param: entry.param.take(),
        })
    }

    /// Drops the locked prefix.
    pub fn unlock(&mut self) {
        if let Some(locked) = self.locked.take() {
            self.entries.drain(..locked);
        }
    }
}
