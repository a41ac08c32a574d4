use crate::error::Error;
use crate::socket::{Socket, SocketRef, SocketUid};
use std::sync::Arc;
use tracing::{error, trace};

/// Dense slot-indexed table of registered sockets.
///
/// Freed slots are reused lowest-first. The slot index is part of the poll
/// token, so the table never grows past `max`.
#[derive(Debug)]
pub(crate) struct SocketTable {
    slots: Vec<Option<Arc<Socket>>>,
    first_free: Option<usize>,
    max: usize,
}

impl SocketTable {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            slots: Vec::new(),
            first_free: None,
            max,
        }
    }

    pub(crate) fn insert(&mut self, socket: Arc<Socket>) -> Result<usize, Error> {
        if let Some(slot) = self.first_free {
            self.slots[slot] = Some(socket);
            self.first_free = (slot + 1..self.slots.len()).find(|&i| self.slots[i].is_none());
            return Ok(slot);
        }

        if self.slots.len() >= self.max {
            error!(max = self.max, "Socket table is full");
            return Err(Error::TableFull { max: self.max });
        }
        self.slots
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory("socket table"))?;
        self.slots.push(Some(socket));
        Ok(self.slots.len() - 1)
    }

    /// Empties `slot` if it holds the socket with `uid`.
    pub(crate) fn remove(&mut self, slot: usize, uid: SocketUid) -> Option<Arc<Socket>> {
        match self.slots.get_mut(slot) {
            Some(entry) if entry.as_ref().is_some_and(|s| s.uid() == uid) => {
                if self.first_free.map_or(true, |free| slot < free) {
                    self.first_free = Some(slot);
                }
                entry.take()
            }
            _ => {
                error!(slot, uid, "Removing a socket from a slot it does not occupy");
                None
            }
        }
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&Arc<Socket>> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub(crate) fn find_by_uid(&self, uid: SocketUid) -> Option<&Arc<Socket>> {
        self.slots.iter().flatten().find(|s| s.uid() == uid)
    }

    /// Finds the socket a weak reference points to. When the slot holds
    /// another socket (after a swap or a reuse) the table is scanned for the
    /// unique ID.
    pub(crate) fn resolve(&self, target: SocketRef) -> Option<Arc<Socket>> {
        if let Some(socket) = target
            .slot
            .and_then(|slot| self.get(slot))
            .filter(|s| s.uid() == target.uid)
        {
            return Some(Arc::clone(socket));
        }
        let found = self.find_by_uid(target.uid).cloned();
        if found.is_some() {
            trace!(uid = target.uid, slot = ?target.slot, "Socket found by unique ID");
        }
        found
    }

    pub(crate) fn swap(&mut self, a: usize, b: usize) {
        self.slots.swap(a, b);
    }

    pub(crate) fn live_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Socket>> {
        self.slots.iter().flatten()
    }
}
