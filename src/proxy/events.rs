//! Completion events for copy-engine slots, with aliasing.
//!
//! Many logical slots can share one hardware event: a slot that *tracks*
//! another borrows its completion instead of owning a recorded event. Events
//! live in an arena and refer to each other by `EventId`, so freeing a
//! connection never leaves a dangling link behind.

use std::sync::Arc;

use crate::common::error::{P2pError, Result};
use crate::common::layout::NCCL_STEPS;
use crate::runtime::{DeviceRuntime, EventHandle, EventStatus, StreamHandle};

/// Index of one event slot: `(block, step mod S)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventId {
    block: u32,
    slot: u32,
}

impl EventId {
    fn index(&self) -> usize {
        self.block as usize * NCCL_STEPS + self.slot as usize
    }
}

/// The `S` event slots reserved by one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventBlock(u32);

impl EventBlock {
    pub fn event(&self, slot: usize) -> EventId {
        EventId {
            block: self.0,
            slot: (slot % NCCL_STEPS) as u32,
        }
    }
}

#[derive(Debug)]
struct MemcpyEvent {
    event: EventHandle,
    resolved: bool,
    tracking: Option<EventId>,
    trackers: Vec<EventId>,
}

pub struct EventPool {
    runtime: Arc<dyn DeviceRuntime>,
    slots: Vec<Option<MemcpyEvent>>,
    free_blocks: Vec<u32>,
}

impl EventPool {
    pub fn new(runtime: Arc<dyn DeviceRuntime>) -> EventPool {
        EventPool {
            runtime,
            slots: Vec::new(),
            free_blocks: Vec::new(),
        }
    }

    /// Create `S` resolved events for one connection.
    pub fn create_block(&mut self) -> Result<EventBlock> {
        let mut created = Vec::with_capacity(NCCL_STEPS);
        for _ in 0..NCCL_STEPS {
            match self.runtime.event_create() {
                Ok(event) => created.push(MemcpyEvent {
                    event,
                    resolved: true,
                    tracking: None,
                    trackers: Vec::new(),
                }),
                Err(e) => {
                    for ev in created {
                        if let Err(destroy) = self.runtime.event_destroy(ev.event) {
                            log::warn!("destroying event after failed block create: {}", destroy);
                        }
                    }
                    return Err(e);
                }
            }
        }
        let block = match self.free_blocks.pop() {
            Some(block) => block,
            None => {
                let block = (self.slots.len() / NCCL_STEPS) as u32;
                self.slots.resize_with(self.slots.len() + NCCL_STEPS, || None);
                block
            }
        };
        let base = block as usize * NCCL_STEPS;
        for (i, ev) in created.into_iter().enumerate() {
            self.slots[base + i] = Some(ev);
        }
        Ok(EventBlock(block))
    }

    /// Detach and destroy every event of `block`. All slots are released even
    /// when some step fails; the first failure is returned.
    pub fn destroy_block(&mut self, block: EventBlock) -> Result<()> {
        let mut first_err = None;
        let mut live = false;
        for slot in 0..NCCL_STEPS {
            let id = block.event(slot);
            if self.slot_mut(id).is_none() {
                continue;
            }
            live = true;
            if let Err(e) = self.untrack(id) {
                first_err.get_or_insert(e);
            }
            let ev = match self.slots.get_mut(id.index()).and_then(Option::take) {
                Some(ev) => ev,
                None => continue,
            };
            // Anything still borrowing this event is vacuously complete.
            for t in ev.trackers {
                if let Some(tracker) = self.slot_mut(t) {
                    tracker.resolved = true;
                    tracker.tracking = None;
                }
            }
            if let Err(e) = self.runtime.event_destroy(ev.event) {
                log::warn!("event destroy in block {} failed: {}", block.0, e);
                first_err.get_or_insert(e);
            }
        }
        if live {
            self.free_blocks.push(block.0);
        } else {
            first_err.get_or_insert(P2pError::protocol(format!("event block {} destroyed twice", block.0)));
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn slot_mut(&mut self, id: EventId) -> Option<&mut MemcpyEvent> {
        self.slots.get_mut(id.index()).and_then(|s| s.as_mut())
    }

    fn get(&self, id: EventId) -> Result<&MemcpyEvent> {
        self.slots
            .get(id.index())
            .and_then(|s| s.as_ref())
            .ok_or_else(|| P2pError::protocol(format!("unknown memcpy event {:?}", id)))
    }

    fn get_mut(&mut self, id: EventId) -> Result<&mut MemcpyEvent> {
        self.slot_mut(id)
            .ok_or_else(|| P2pError::protocol(format!("unknown memcpy event {:?}", id)))
    }

    fn detach(&mut self, tracker: EventId, target: EventId) {
        if let Some(t) = self.slot_mut(target) {
            if let Some(pos) = t.trackers.iter().position(|&x| x == tracker) {
                t.trackers.remove(pos);
            }
        }
    }

    /// Re-arm `id` on `stream` for a new asynchronous operation.
    pub fn record(&mut self, id: EventId, stream: StreamHandle) -> Result<()> {
        let ev = self.get_mut(id)?;
        if !ev.resolved {
            log::warn!("Overwriting an unresolved event record.");
        }
        let resolved = ev.resolved;
        let handle = ev.event;
        let trackers = std::mem::take(&mut ev.trackers);
        let tracking = ev.tracking.take();
        for t in trackers {
            if let Some(tracker) = self.slot_mut(t) {
                tracker.resolved = resolved;
            }
        }
        if let Some(target) = tracking {
            self.detach(id, target);
        }
        self.runtime.event_record(handle, stream)?;
        self.get_mut(id)?.resolved = false;
        Ok(())
    }

    /// Make `id` an alias of `target`'s completion.
    pub fn track(&mut self, id: EventId, target: EventId) -> Result<()> {
        if id == target {
            return Err(P2pError::protocol("memcpy event cannot track itself"));
        }
        let target_ev = self.get(target)?;
        if target_ev.tracking.is_some() {
            return Err(P2pError::protocol("tracker should not track another tracker"));
        }
        let target_resolved = target_ev.resolved;
        let ev = self.get(id)?;
        if !ev.trackers.is_empty() {
            return Err(P2pError::protocol("memcpy event with pending trackers cannot track"));
        }
        if let Some(old) = ev.tracking {
            self.detach(id, old);
        }
        let ev = self.get_mut(id)?;
        ev.tracking = Some(target);
        ev.resolved = target_resolved;
        if !target_resolved {
            let t = self.get_mut(target)?;
            if !t.trackers.contains(&id) {
                t.trackers.push(id);
            }
        }
        Ok(())
    }

    /// Drop the alias link. A detached, unresolved tracker counts as complete.
    pub fn untrack(&mut self, id: EventId) -> Result<()> {
        let ev = self.get_mut(id)?;
        if let Some(target) = ev.tracking.take() {
            if !ev.resolved {
                ev.resolved = true;
                self.detach(id, target);
            }
        }
        Ok(())
    }

    pub fn query(&mut self, id: EventId) -> Result<bool> {
        self.query_depth(id, 0)
    }

    fn query_depth(&mut self, id: EventId, depth: usize) -> Result<bool> {
        if depth > 1 {
            return Err(P2pError::protocol("memcpy event tracking deeper than one hop"));
        }
        let ev = self.get(id)?;
        if ev.resolved {
            return Ok(true);
        }
        if let Some(target) = ev.tracking {
            return self.query_depth(target, depth + 1);
        }
        match self.runtime.event_query(ev.event)? {
            EventStatus::Ready => {
                let ev = self.get_mut(id)?;
                ev.resolved = true;
                let trackers = std::mem::take(&mut ev.trackers);
                for t in trackers {
                    if let Some(tracker) = self.slot_mut(t) {
                        tracker.resolved = true;
                    }
                }
                Ok(true)
            }
            EventStatus::NotReady => Ok(false),
        }
    }

    pub fn is_resolved(&self, id: EventId) -> bool {
        self.get(id).map(|ev| ev.resolved).unwrap_or(false)
    }

    pub fn tracking(&self, id: EventId) -> Option<EventId> {
        self.get(id).ok().and_then(|ev| ev.tracking)
    }

    pub fn tracker_count(&self, id: EventId) -> usize {
        self.get(id).map(|ev| ev.trackers.len()).unwrap_or(0)
    }
}
