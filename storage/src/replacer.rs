//! Replacement policies deciding which unpinned frame is evicted next.

use lru::LruCache;
use parking_lot::Mutex;

use crate::page::FrameId;

/// Tracks frames that may be evicted and picks the next victim.
///
/// Every method takes its own internal lock, so a replacer can be shared between threads.
/// The buffer pool only calls into it while holding the pool lock, never the other way around.
pub trait Replacer: Send + Sync {
    /// Marks `frame_id` as evictable. Does nothing if it's already evictable.
    fn record_unpinned(&self, frame_id: FrameId);

    /// Makes `frame_id` non-evictable. Does nothing if it's not tracked.
    fn record_pinned(&self, frame_id: FrameId);

    /// Removes and returns the next frame to evict, `None` if nothing can be evicted.
    fn select_victim(&self) -> Option<FrameId>;

    /// Puts back a frame returned by [`Replacer::select_victim`] that couldn't be evicted,
    /// so that it's the next victim again.
    fn restore_victim(&self, frame_id: FrameId);

    /// Number of frames this replacer can track, `None` if there is no limit.
    fn capacity(&self) -> Option<usize> {
        None
    }

    /// Number of currently evictable frames.
    fn size(&self) -> usize;
}

/// Available replacement policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplacerKind {
    #[default]
    Lru,
    Clock,
}

impl ReplacerKind {
    /// Creates replacer of this kind for a pool of `pool_size` frames.
    pub fn build(self, pool_size: usize) -> Box<dyn Replacer> {
        match self {
            ReplacerKind::Lru => Box::new(LruReplacer::new()),
            ReplacerKind::Clock => Box::new(ClockReplacer::new(pool_size)),
        }
    }
}

/// Evicts the frame that was unpinned the longest time ago.
///
/// Order is defined by unpin events only - unpinning an already evictable frame
/// does not move it.
pub struct LruReplacer {
    lru: Mutex<LruCache<FrameId, ()>>,
}

impl LruReplacer {
    pub fn new() -> Self {
        Self {
            lru: Mutex::new(LruCache::unbounded()),
        }
    }
}

impl Default for LruReplacer {
    fn default() -> Self {
        Self::new()
    }
}

impl Replacer for LruReplacer {
    fn record_unpinned(&self, frame_id: FrameId) {
        let mut lru = self.lru.lock();
        // `contains` does not touch the order, `push` would make the frame MRU again.
        if !lru.contains(&frame_id) {
            lru.push(frame_id, ());
        }
    }

    fn record_pinned(&self, frame_id: FrameId) {
        self.lru.lock().pop(&frame_id);
    }

    fn select_victim(&self) -> Option<FrameId> {
        self.lru.lock().pop_lru().map(|(frame_id, _)| frame_id)
    }

    fn restore_victim(&self, frame_id: FrameId) {
        let mut lru = self.lru.lock();
        lru.push(frame_id, ());
        lru.demote(&frame_id);
    }

    fn size(&self) -> usize {
        self.lru.lock().len()
    }
}

/// Second-chance clock over all frame slots.
///
/// Unpinning sets the frame's reference bit. The hand sweeps over evictable frames,
/// clearing set bits, and evicts the first evictable frame whose bit is already clear.
pub struct ClockReplacer {
    state: Mutex<ClockState>,
}

struct ClockState {
    slots: Vec<ClockSlot>,
    hand: usize,
    evictable: usize,
}

#[derive(Clone, Copy, Default)]
struct ClockSlot {
    evictable: bool,
    referenced: bool,
}

impl ClockReplacer {
    pub fn new(pool_size: usize) -> Self {
        Self {
            state: Mutex::new(ClockState {
                slots: vec![ClockSlot::default(); pool_size],
                hand: 0,
                evictable: 0,
            }),
        }
    }
}

impl Replacer for ClockReplacer {
    fn record_unpinned(&self, frame_id: FrameId) {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(frame_id) else {
            log::warn!("clock replacer: frame {frame_id} out of range");
            return;
        };
        if slot.evictable {
            return;
        }
        slot.evictable = true;
        slot.referenced = true;
        state.evictable += 1;
    }

    fn record_pinned(&self, frame_id: FrameId) {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(frame_id) else {
            return;
        };
        if slot.evictable {
            *slot = ClockSlot::default();
            state.evictable -= 1;
        }
    }

    fn select_victim(&self) -> Option<FrameId> {
        let mut state = self.state.lock();
        if state.evictable == 0 {
            return None;
        }
        // Two sweeps are enough: the first one clears every reference bit.
        let len = state.slots.len();
        for _ in 0..2 * len {
            let hand = state.hand;
            state.hand = (hand + 1) % len;
            let slot = &mut state.slots[hand];
            if !slot.evictable {
                continue;
            }
            if slot.referenced {
                slot.referenced = false;
                continue;
            }
            *slot = ClockSlot::default();
            state.evictable -= 1;
            return Some(hand);
        }
        None
    }

    fn restore_victim(&self, frame_id: FrameId) {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(frame_id) else {
            return;
        };
        if slot.evictable {
            return;
        }
        // Clear reference bit and park the hand on it, the next sweep takes it right away.
        *slot = ClockSlot {
            evictable: true,
            referenced: false,
        };
        state.evictable += 1;
        state.hand = frame_id;
    }

    fn size(&self) -> usize {
        self.state.lock().evictable
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.state.lock().slots.len())
    }
}
