//! Latest-wins buffer hand-off between a producer and a consumer thread
//!
//! An [`AsyncResource`] tracks a small fixed set of slots. The producer claims a free slot,
//! fills it and marks it ready; the consumer takes the newest ready slot. When the producer
//! finishes a slot while an older one is still waiting, the older one goes back to the free
//! pool, so a lagging consumer drops frames but never sees them out of order. With three slots
//! the producer always finds a free one.
//!
//! The same state machine serves both directions. For geometry upload the producer is the
//! emulation thread (`Writing`) and the renderer consumes (`Using`); for color readback the
//! renderer produces (`Using`) and the front-end reads (`Reading`).

use std::sync::{Arc, Mutex, MutexGuard};

use emu_core::logging::{log, LogCategory, LogLevel};

use crate::geometry::GeometryList;
use crate::{Render3DError, Render3DResult};

/// Sentinel slot index for "no slot", for callers that keep raw indices
pub const RESOURCE_INDEX_NONE: usize = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    Disabled,
    Free,
    Writing,
    Ready,
    Using,
    Reading,
}

/// Which side labels its ownership how
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Producer `Writing`, consumer `Using`
    Upload,
    /// Producer `Using`, consumer `Reading`
    Readback,
}

impl Direction {
    fn producer_state(self) -> SlotState {
        match self {
            Direction::Upload => SlotState::Writing,
            Direction::Readback => SlotState::Using,
        }
    }

    fn consumer_state(self) -> SlotState {
        match self {
            Direction::Upload => SlotState::Using,
            Direction::Readback => SlotState::Reading,
        }
    }
}

/// Convert an optional slot index into the raw sentinel form
pub fn index_or_none(index: Option<usize>) -> usize {
    index.unwrap_or(RESOURCE_INDEX_NONE)
}

#[derive(Debug, Clone)]
pub struct AsyncResource<const N: usize> {
    states: [SlotState; N],
    direction: Direction,
    current_ready: Option<usize>,
    current_consumer: Option<usize>,
}

impl<const N: usize> AsyncResource<N> {
    pub fn new(direction: Direction) -> Self {
        Self {
            states: [SlotState::Free; N],
            direction,
            current_ready: None,
            current_consumer: None,
        }
    }

    pub fn state(&self, index: usize) -> Option<SlotState> {
        self.states.get(index).copied()
    }

    pub fn ready_index(&self) -> Option<usize> {
        self.current_ready
    }

    pub fn consumer_index(&self) -> Option<usize> {
        self.current_consumer
    }

    /// Slot currently owned by the producer, if any
    pub fn producer_index(&self) -> Option<usize> {
        let producer = self.direction.producer_state();
        self.states.iter().position(|&s| s == producer)
    }

    /// Claim a free slot for the producer
    ///
    /// Returns `None` when the producer already holds a slot or nothing is free.
    pub fn bind_write(&mut self) -> Option<usize> {
        if self.producer_index().is_some() {
            return None;
        }
        let index = self.states.iter().position(|&s| s == SlotState::Free)?;
        self.states[index] = self.direction.producer_state();
        Some(index)
    }

    /// Like [`bind_write`](Self::bind_write), but takes back the unclaimed ready slot when no
    /// slot is free
    pub fn bind_write_reclaim(&mut self) -> Option<usize> {
        if let Some(index) = self.bind_write() {
            return Some(index);
        }
        if self.producer_index().is_some() {
            return None;
        }
        let index = self.current_ready.take()?;
        self.states[index] = self.direction.producer_state();
        Some(index)
    }

    /// Mark the producer's slot ready; an older unclaimed ready slot is freed
    pub fn unbind_write(&mut self, index: usize) -> Render3DResult<()> {
        if self.state(index) != Some(self.direction.producer_state()) {
            return Err(Render3DError::InvalidBinding(format!(
                "slot {} is not bound for writing ({:?})",
                index,
                self.state(index)
            )));
        }
        if let Some(stale) = self.current_ready.replace(index) {
            self.states[stale] = SlotState::Free;
            log(LogCategory::Resource, LogLevel::Trace, || {
                format!("slot {} superseded by slot {}", stale, index)
            });
        }
        self.states[index] = SlotState::Ready;
        Ok(())
    }

    /// Take the newest ready slot for the consumer
    ///
    /// A slot the consumer already holds is released when a newer one is ready; otherwise the
    /// held slot is returned again. `None` when nothing is ready or held.
    pub fn bind_usage(&mut self) -> Option<usize> {
        if let Some(ready) = self.current_ready.take() {
            if let Some(stale) = self.current_consumer.take() {
                self.states[stale] = SlotState::Free;
            }
            self.states[ready] = self.direction.consumer_state();
            self.current_consumer = Some(ready);
        }
        self.current_consumer
    }

    /// Release the consumer's slot and return its index
    pub fn unbind_usage(&mut self) -> Render3DResult<usize> {
        let index = self.current_consumer.take().ok_or_else(|| {
            Render3DError::InvalidBinding("no slot is bound for usage".to_string())
        })?;
        self.states[index] = SlotState::Free;
        Ok(index)
    }

    /// Enable or disable a slot that nobody owns
    pub fn set_slot_enabled(&mut self, index: usize, enabled: bool) -> Render3DResult<()> {
        let state = self.state(index).ok_or_else(|| {
            Render3DError::InvalidValue(format!("slot {} out of range (0..{})", index, N))
        })?;
        match (state, enabled) {
            (SlotState::Disabled, true) => self.states[index] = SlotState::Free,
            (SlotState::Free, false) => self.states[index] = SlotState::Disabled,
            (SlotState::Disabled, false) | (SlotState::Free, true) => {}
            (owned, _) => {
                return Err(Render3DError::InvalidBinding(format!(
                    "slot {} is {:?}",
                    index, owned
                )))
            }
        }
        Ok(())
    }

    /// Return every enabled slot to the free pool
    pub fn reset(&mut self) {
        for state in self.states.iter_mut() {
            if *state != SlotState::Disabled {
                *state = SlotState::Free;
            }
        }
        self.current_ready = None;
        self.current_consumer = None;
    }
}

struct GeometrySlots {
    resource: AsyncResource<3>,
    lists: [Option<Arc<GeometryList>>; 3],
}

/// Geometry snapshots handed from the emulation thread to the renderer
pub struct GeometryResource {
    inner: Mutex<GeometrySlots>,
}

impl Default for GeometryResource {
    fn default() -> Self {
        Self::new()
    }
}

impl GeometryResource {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GeometrySlots {
                resource: AsyncResource::new(Direction::Upload),
                lists: [None, None, None],
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GeometrySlots> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish a finished geometry list, replacing any list the renderer has not taken yet
    pub fn publish(&self, list: GeometryList) -> Render3DResult<usize> {
        let mut slots = self.lock();
        let index = slots.resource.bind_write().ok_or_else(|| {
            Render3DError::InvalidBuffer("no free geometry slot".to_string())
        })?;
        slots.lists[index] = Some(Arc::new(list));
        slots.resource.unbind_write(index)?;
        Ok(index)
    }

    /// Newest published list, or the one already held when nothing newer exists
    pub fn acquire(&self) -> Option<Arc<GeometryList>> {
        let mut slots = self.lock();
        let index = slots.resource.bind_usage()?;
        slots.lists[index].clone()
    }

    pub fn release(&self) -> Render3DResult<()> {
        let mut slots = self.lock();
        let index = slots.resource.unbind_usage()?;
        slots.lists[index] = None;
        Ok(())
    }

    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.lock().resource.state(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_wins() {
        let mut res: AsyncResource<3> = AsyncResource::new(Direction::Upload);
        let first = res.bind_write().expect("free slot");
        res.unbind_write(first).expect("unbind");
        let second = res.bind_write().expect("free slot");
        res.unbind_write(second).expect("unbind");

        assert_eq!(res.state(first), Some(SlotState::Free));
        assert_eq!(res.bind_usage(), Some(second));
        assert_eq!(res.state(second), Some(SlotState::Using));
    }

    #[test]
    fn test_only_one_writer() {
        let mut res: AsyncResource<3> = AsyncResource::new(Direction::Upload);
        assert!(res.bind_write().is_some());
        assert_eq!(res.bind_write(), None);
    }

    #[test]
    fn test_unbind_unowned_slot_is_binding_error() {
        let mut res: AsyncResource<3> = AsyncResource::new(Direction::Upload);
        let err = res.unbind_write(1).unwrap_err();
        assert_eq!(err.code(), 3);
        assert_eq!(res.state(1), Some(SlotState::Free));

        let index = res.bind_write().expect("free slot");
        res.unbind_write(index).expect("unbind");
        // double unbind
        assert!(res.unbind_write(index).is_err());
        assert_eq!(res.state(index), Some(SlotState::Ready));
        assert!(res.unbind_usage().is_err());
    }

    #[test]
    fn test_bind_usage_keeps_current_until_newer_ready() {
        let mut res: AsyncResource<3> = AsyncResource::new(Direction::Upload);
        assert_eq!(res.bind_usage(), None);

        let a = res.bind_write().expect("free slot");
        res.unbind_write(a).expect("unbind");
        assert_eq!(res.bind_usage(), Some(a));
        assert_eq!(res.bind_usage(), Some(a));

        let b = res.bind_write().expect("free slot");
        res.unbind_write(b).expect("unbind");
        assert_eq!(res.bind_usage(), Some(b));
        assert_eq!(res.state(a), Some(SlotState::Free));

        assert_eq!(res.unbind_usage(), Ok(b));
        assert_eq!(res.bind_usage(), None);
    }

    #[test]
    fn test_producer_never_starves_with_three_slots() {
        let mut res: AsyncResource<3> = AsyncResource::new(Direction::Upload);
        for _ in 0..10 {
            let w = res.bind_write().expect("a slot is always free");
            res.unbind_write(w).expect("unbind");
            res.bind_usage();
        }
    }

    #[test]
    fn test_readback_labels_and_reclaim() {
        let mut res: AsyncResource<2> = AsyncResource::new(Direction::Readback);
        let a = res.bind_write().expect("free slot");
        assert_eq!(res.state(a), Some(SlotState::Using));
        res.unbind_write(a).expect("unbind");
        let b = res.bind_write().expect("free slot");
        res.unbind_write(b).expect("unbind");
        assert_eq!(res.bind_usage(), Some(b));
        assert_eq!(res.state(b), Some(SlotState::Reading));

        // a is free again; fill it and leave it ready
        let c = res.bind_write().expect("free slot");
        res.unbind_write(c).expect("unbind");
        // nothing free: reclaim the ready slot
        assert_eq!(res.bind_write(), None);
        assert_eq!(res.bind_write_reclaim(), Some(c));
    }

    #[test]
    fn test_slot_enable() {
        let mut res: AsyncResource<2> = AsyncResource::new(Direction::Upload);
        res.set_slot_enabled(0, false).expect("disable");
        assert_eq!(res.bind_write(), Some(1));
        assert!(res.set_slot_enabled(1, false).is_err());
        assert!(res.set_slot_enabled(5, true).is_err());
        res.set_slot_enabled(0, true).expect("enable");
        assert_eq!(res.state(0), Some(SlotState::Free));
    }

    #[test]
    fn test_index_sentinel() {
        assert_eq!(index_or_none(None), RESOURCE_INDEX_NONE);
        assert_eq!(index_or_none(Some(2)), 2);
    }

    #[test]
    fn test_geometry_resource_publish_acquire() {
        let geometry = GeometryResource::new();
        assert!(geometry.acquire().is_none());

        geometry.publish(GeometryList::default()).expect("publish");
        let mut newer = GeometryList::default();
        newer.vertices.push(Default::default());
        geometry.publish(newer).expect("publish");

        let acquired = geometry.acquire().expect("ready list");
        assert_eq!(acquired.vertices.len(), 1);
        geometry.release().expect("release");
        assert!(geometry.release().is_err());
    }
}
