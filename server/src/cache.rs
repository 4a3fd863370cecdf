//! Object cache and load state machine.
//!
//! An object id is in exactly one of three states:
//! - **Unloaded**: no entry at all.
//! - **Loading**: a fetch is outstanding; requests queue behind it.
//! - **Active**: the object is in RAM.
//!
//! Gone is not a state: deleting an object removes its entry, so the next
//! reference starts over from Unloaded.

use dbss_shared::{DoId, ObjectRequest};
use log::debug;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::object::DistributedObject;
use crate::store::Context;

/// Outstanding fetch for one object and the requests waiting on it.
#[derive(Debug)]
pub struct PendingLoad {
    pub do_id: DoId,
    pub context: Context,
    /// Requests in arrival order, the triggering request first.
    pub queue: Vec<ObjectRequest>,
    pub started: Instant,
}

impl PendingLoad {
    pub fn new(do_id: DoId, context: Context, first: ObjectRequest) -> Self {
        Self {
            do_id,
            context,
            queue: vec![first],
            started: Instant::now(),
        }
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.started.elapsed() > timeout
    }
}

/// Load state of one object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Unloaded,
    Loading,
    Active,
}

#[derive(Debug)]
enum Entry {
    Loading(PendingLoad),
    Active(DistributedObject),
}

#[derive(Debug, Default)]
pub struct ObjectCache {
    entries: HashMap<DoId, Entry>,
    /// Fetch context -> object id, for every Loading entry.
    contexts: HashMap<Context, DoId>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, do_id: DoId) -> ObjectState {
        match self.entries.get(&do_id) {
            None => ObjectState::Unloaded,
            Some(Entry::Loading(_)) => ObjectState::Loading,
            Some(Entry::Active(_)) => ObjectState::Active,
        }
    }

    pub fn get(&self, do_id: DoId) -> Option<&DistributedObject> {
        match self.entries.get(&do_id) {
            Some(Entry::Active(obj)) => Some(obj),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, do_id: DoId) -> Option<&mut DistributedObject> {
        match self.entries.get_mut(&do_id) {
            Some(Entry::Active(obj)) => Some(obj),
            _ => None,
        }
    }

    pub fn is_context_pending(&self, context: Context) -> bool {
        self.contexts.contains_key(&context)
    }

    /// Object a pending context belongs to.
    pub fn pending_object(&self, context: Context) -> Option<DoId> {
        self.contexts.get(&context).copied()
    }

    /// Moves an Unloaded object to Loading.
    ///
    /// Returns the request back if the object is not Unloaded or the context
    /// is already in use, leaving the cache untouched.
    pub fn begin_load(
        &mut self,
        do_id: DoId,
        context: Context,
        first: ObjectRequest,
    ) -> Result<(), ObjectRequest> {
        if self.entries.contains_key(&do_id) || self.contexts.contains_key(&context) {
            return Err(first);
        }
        self.contexts.insert(context, do_id);
        self.entries
            .insert(do_id, Entry::Loading(PendingLoad::new(do_id, context, first)));
        Ok(())
    }

    /// Appends a request behind an outstanding fetch.
    ///
    /// Returns the request back if the object is not Loading.
    pub fn enqueue(&mut self, request: ObjectRequest) -> Result<(), ObjectRequest> {
        match self.entries.get_mut(&request.do_id()) {
            Some(Entry::Loading(pending)) => {
                pending.queue.push(request);
                Ok(())
            }
            _ => Err(request),
        }
    }

    /// Ends the Loading state for `context`, handing back the pending load.
    ///
    /// A context that is not pending yields `None`, which makes every
    /// completion after the first a no-op.
    pub fn take_pending(&mut self, context: Context) -> Option<PendingLoad> {
        let do_id = self.contexts.remove(&context)?;
        match self.entries.remove(&do_id) {
            Some(Entry::Loading(pending)) => Some(pending),
            Some(other) => {
                // context map and entry disagree; keep the entry as it was
                self.entries.insert(do_id, other);
                None
            }
            None => None,
        }
    }

    /// Installs a freshly loaded object. The id must not be Loading.
    pub fn activate(&mut self, obj: DistributedObject) {
        debug!("Object {} is now active", obj.id());
        self.entries.insert(obj.id(), Entry::Active(obj));
    }

    /// Removes an Active object. Loading entries are left alone.
    pub fn remove(&mut self, do_id: DoId) -> Option<DistributedObject> {
        match self.entries.remove(&do_id) {
            Some(Entry::Active(obj)) => Some(obj),
            Some(loading) => {
                self.entries.insert(do_id, loading);
                None
            }
            None => None,
        }
    }

    /// Drops every pending load older than `timeout` and returns them.
    pub fn expire(&mut self, timeout: Duration) -> Vec<PendingLoad> {
        let expired: Vec<Context> = self
            .entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Loading(pending) if pending.is_timed_out(timeout) => Some(pending.context),
                _ => None,
            })
            .collect();

        expired
            .into_iter()
            .filter_map(|context| self.take_pending(context))
            .collect()
    }

    /// Number of objects live in RAM.
    pub fn active_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, Entry::Active(_)))
            .count()
    }

    /// Number of outstanding fetches.
    pub fn loading_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
