//! Bounded event window for in-flight device operations

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::diagnostics::{InternalError, ResourceExhausted, Result};

/// What an event slot tracks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDescriptor {
    WriteBuffer { bytes: usize },
    ReadBuffer { bytes: usize },
    Launch { kernel: String },
    Barrier,
    Marker,
}

impl fmt::Display for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventDescriptor::WriteBuffer { bytes } => write!(f, "writeBuffer({} bytes)", bytes),
            EventDescriptor::ReadBuffer { bytes } => write!(f, "readBuffer({} bytes)", bytes),
            EventDescriptor::Launch { kernel } => write!(f, "launch({})", kernel),
            EventDescriptor::Barrier => write!(f, "barrier"),
            EventDescriptor::Marker => write!(f, "marker"),
        }
    }
}

/// Start and stop timestamps the device fills in; zero means not reached yet
#[derive(Debug, Clone, Default)]
pub struct EventTimers {
    pub start: Arc<AtomicU64>,
    pub stop: Arc<AtomicU64>,
}

impl EventTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_ns(&self) -> u64 {
        self.start.load(Ordering::Acquire)
    }

    pub fn stop_ns(&self) -> u64 {
        self.stop.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.stop_ns() != 0
    }

    pub fn elapsed_ns(&self) -> Option<u64> {
        let (start, stop) = (self.start_ns(), self.stop_ns());
        (stop != 0).then(|| stop.saturating_sub(start))
    }
}

#[derive(Debug, Clone)]
struct EventSlot {
    descriptor: EventDescriptor,
    timers: EventTimers,
}

/// Resolved view of one event
#[derive(Debug, Clone)]
pub struct Event {
    /// `None` for the empty event
    pub index: Option<usize>,
    pub descriptor: Option<EventDescriptor>,
    pub timers: EventTimers,
}

impl Event {
    /// Stands in for "no event"; always complete
    pub fn empty() -> Self {
        let timers = EventTimers::new();
        timers.stop.store(1, Ordering::Release);
        Self {
            index: None,
            descriptor: None,
            timers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.timers.is_complete()
    }
}

/// Fixed-capacity slot allocator, one per (plan, device)
///
/// A circular window recycles every slot that is not retained. A linear window
/// hands each slot out once and only reuses it after `release`.
#[derive(Debug)]
pub struct EventPool {
    capacity: usize,
    circular: bool,
    cursor: usize,
    slots: Vec<Option<EventSlot>>,
    retained: Vec<bool>,
    live: Vec<bool>,
}

impl EventPool {
    pub fn new(capacity: usize, circular: bool) -> Self {
        Self {
            capacity,
            circular,
            cursor: 0,
            slots: vec![None; capacity],
            retained: vec![false; capacity],
            live: vec![false; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_circular(&self) -> bool {
        self.circular
    }

    pub fn retained_count(&self) -> usize {
        self.retained.iter().filter(|r| **r).count()
    }

    /// Claim the next clear slot at or after the cursor
    pub fn register_event(&mut self, descriptor: EventDescriptor, timers: EventTimers) -> Result<usize> {
        let index = self.next_free()?;
        tracing::trace!(index, %descriptor, "event registered");
        self.slots[index] = Some(EventSlot { descriptor, timers });
        self.live[index] = true;
        self.cursor = if self.circular {
            (index + 1) % self.capacity
        } else {
            index + 1
        };
        Ok(index)
    }

    fn next_free(&self) -> Result<usize> {
        if self.circular {
            if self.capacity > 0 {
                for step in 0..self.capacity {
                    let index = (self.cursor + step) % self.capacity;
                    if !self.retained[index] {
                        return Ok(index);
                    }
                }
            }
            return Err(InternalError::EventSlotsRetained {
                retained: self.retained_count(),
                capacity: self.capacity,
            }
            .into());
        }

        (self.cursor..self.capacity)
            .find(|&i| !self.live[i] && !self.retained[i])
            .ok_or_else(|| {
                ResourceExhausted::EventWindowFull {
                    capacity: self.capacity,
                }
                .into()
            })
    }

    fn slot(&self, index: usize) -> Result<&EventSlot> {
        self.slots
            .get(index)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| InternalError::UndefinedEvent(index).into())
    }

    pub fn get_timers(&self, index: usize) -> Result<EventTimers> {
        Ok(self.slot(index)?.timers.clone())
    }

    pub fn get_descriptor(&self, index: usize) -> Result<EventDescriptor> {
        Ok(self.slot(index)?.descriptor.clone())
    }

    pub fn is_retained(&self, index: usize) -> bool {
        self.retained.get(index).copied().unwrap_or(false)
    }

    /// Keep the slot's timers alive until `release`
    pub fn retain(&mut self, index: usize) -> Result<()> {
        self.slot(index)?;
        self.retained[index] = true;
        Ok(())
    }

    /// Clear the retained flag so the slot may be handed out again
    pub fn release(&mut self, index: usize) -> Result<()> {
        self.slot(index)?;
        self.retained[index] = false;
        self.live[index] = false;
        if !self.circular && index < self.cursor {
            self.cursor = index;
        }
        Ok(())
    }

    pub fn resolve(&self, index: Option<usize>) -> Result<Event> {
        let Some(index) = index else {
            return Ok(Event::empty());
        };
        let slot = self.slot(index)?;
        Ok(Event {
            index: Some(index),
            descriptor: Some(slot.descriptor.clone()),
            timers: slot.timers.clone(),
        })
    }

    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.retained.iter_mut().for_each(|r| *r = false);
        self.live.iter_mut().for_each(|l| *l = false);
        self.cursor = 0;
    }
}
