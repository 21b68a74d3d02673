//! Replacer module — victim selection for the buffer pool, with ARC as the
//! default policy behind a small trait.

use std::collections::HashMap;

use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::{FrameId, PageId};

/// Error for [`Replacer`] related operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplacerError {
    #[error("frame id {0} is out of range")]
    FrameOutOfRange(FrameId),
    #[error("frame {0} is not evictable")]
    NotEvictable(FrameId),
}

/// Tracks frame usage and picks eviction victims for the buffer pool.
///
/// The pool depends only on this trait; [`ArcReplacer`] is one policy.
pub trait Replacer: Send + Sync {
    /// Records an access of `page_id`, resident in `frame_id`. Frames enter
    /// the replacer non-evictable; the pool toggles them explicitly.
    fn record_access(&self, frame_id: FrameId, page_id: PageId) -> Result<(), ReplacerError>;

    /// Picks a victim among evictable frames and detaches it, or returns
    /// `None` when every tracked frame is pinned.
    fn evict(&self) -> Option<FrameId>;

    /// Toggles the evictable bit of a tracked frame. Untracked frames are
    /// ignored. The replacer's size counts only evictable frames.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool) -> Result<(), ReplacerError>;

    /// Detaches a specific tracked frame, which must be evictable. Untracked
    /// frames are ignored.
    fn remove(&self, frame_id: FrameId) -> Result<(), ReplacerError>;

    /// Number of evictable frames currently tracked.
    fn size(&self) -> usize;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AliveList {
    Mru,
    Mfu,
}

struct AliveEntry {
    page_id: PageId,
    evictable: bool,
    list: AliveList,
}

/// The four ARC sequences plus the adaptation target.
///
/// The [`LruCache`]s are unbounded ordered dictionaries: most recent at the
/// front, `pop_lru` at the back. All capacity bookkeeping is done here so the
/// cache type can never evict behind ARC's back.
///
/// Invariants, with `c` the frame capacity:
/// - `mru.len() + mru_ghost.len() <= c`
/// - `mru.len() + mru_ghost.len() + mfu.len() + mfu_ghost.len() <= 2c`
/// - a page id appears in at most one of the four lists
/// - `mru ∪ mfu` is exactly the key set of `alive`
struct ArcState {
    /// Resident frames seen once since entering the cache.
    mru: LruCache<FrameId, ()>,
    /// Resident frames seen at least twice.
    mfu: LruCache<FrameId, ()>,
    /// Page ids recently evicted from `mru`.
    mru_ghost: LruCache<PageId, ()>,
    /// Page ids recently evicted from `mfu`.
    mfu_ghost: LruCache<PageId, ()>,
    alive: HashMap<FrameId, AliveEntry>,
    /// Number of evictable frames in `alive`.
    evictable_count: usize,
    /// Target size for the `mru` side, `p` in the ARC paper, in `[0, c]`.
    mru_target: usize,
}

/// Adaptive Replacement Cache victim selector.
///
/// Two departures from the paper, both deliberate: the `|MRU| == p` tie-break
/// goes to the `MRU` side (the paper calls its own choice arbitrary), and
/// non-evictable entries are transparently skipped, falling back to the other
/// side when the preferred one is exhausted.
pub struct ArcReplacer {
    state: Mutex<ArcState>,
    /// Maximum number of live frames, `c` in the paper.
    capacity: usize,
}

impl ArcReplacer {
    pub fn new(capacity: usize) -> Self {
        ArcReplacer {
            state: Mutex::new(ArcState {
                mru: LruCache::unbounded(),
                mfu: LruCache::unbounded(),
                mru_ghost: LruCache::unbounded(),
                mfu_ghost: LruCache::unbounded(),
                alive: HashMap::new(),
                evictable_count: 0,
                mru_target: 0,
            }),
            capacity,
        }
    }

    fn check_frame_id(&self, frame_id: FrameId) -> Result<(), ReplacerError> {
        if frame_id >= self.capacity {
            return Err(ReplacerError::FrameOutOfRange(frame_id));
        }
        Ok(())
    }

    #[cfg(test)]
    fn mru_target(&self) -> usize {
        self.state.lock().mru_target
    }
}

impl ArcState {
    /// Least-recent evictable frame of one alive list.
    fn victim_in(&self, list: AliveList) -> Option<FrameId> {
        let cache = match list {
            AliveList::Mru => &self.mru,
            AliveList::Mfu => &self.mfu,
        };
        cache
            .iter()
            .rev()
            .map(|(&frame_id, _)| frame_id)
            .find(|frame_id| self.alive[frame_id].evictable)
    }

    /// Detaches a live frame and remembers its page id in the matching ghost
    /// list.
    fn detach(&mut self, frame_id: FrameId) {
        let entry = self.alive.remove(&frame_id).expect("frame must be alive");
        match entry.list {
            AliveList::Mru => {
                self.mru.pop(&frame_id);
                self.mru_ghost.push(entry.page_id, ());
            }
            AliveList::Mfu => {
                self.mfu.pop(&frame_id);
                self.mfu_ghost.push(entry.page_id, ());
            }
        }
        if entry.evictable {
            self.evictable_count -= 1;
        }
    }
}

impl Replacer for ArcReplacer {
    fn record_access(&self, frame_id: FrameId, page_id: PageId) -> Result<(), ReplacerError> {
        self.check_frame_id(frame_id)?;
        let mut s = self.state.lock();
        let s = &mut *s;

        // Resident hit: promote to the front of the mfu side.
        if let Some(entry) = s.alive.get(&frame_id) {
            match entry.list {
                AliveList::Mru => {
                    s.mru.pop(&frame_id);
                }
                AliveList::Mfu => {
                    s.mfu.pop(&frame_id);
                }
            }
            s.mfu.push(frame_id, ());
            s.alive.get_mut(&frame_id).expect("entry exists").list = AliveList::Mfu;
            return Ok(());
        }

        // Ghost hit on the mru side: the mru side was too small, grow its
        // target. Sizes are taken after removing the hit entry; the ratio
        // form extends the paper's rule to an empty opposite side.
        if s.mru_ghost.pop(&page_id).is_some() {
            let grow = 1.max(s.mfu_ghost.len() / s.mru_ghost.len().max(1));
            s.mru_target = (s.mru_target + grow).min(self.capacity);
            s.mfu.push(frame_id, ());
            s.alive.insert(
                frame_id,
                AliveEntry {
                    page_id,
                    evictable: false,
                    list: AliveList::Mfu,
                },
            );
            return Ok(());
        }

        // Ghost hit on the mfu side: shrink the mru target.
        if s.mfu_ghost.pop(&page_id).is_some() {
            let shrink = 1.max(s.mru_ghost.len() / s.mfu_ghost.len().max(1));
            s.mru_target = s.mru_target.saturating_sub(shrink);
            s.mfu.push(frame_id, ());
            s.alive.insert(
                frame_id,
                AliveEntry {
                    page_id,
                    evictable: false,
                    list: AliveList::Mfu,
                },
            );
            return Ok(());
        }

        // Never seen: trim the directory so `mru + mru_ghost` stays within c
        // and the four lists within 2c, then install at the front of mru.
        let mru_total = s.mru.len() + s.mru_ghost.len();
        let total = mru_total + s.mfu.len() + s.mfu_ghost.len();
        if mru_total == self.capacity {
            s.mru_ghost.pop_lru();
        } else if total >= 2 * self.capacity {
            s.mfu_ghost.pop_lru();
        }
        s.mru.push(frame_id, ());
        s.alive.insert(
            frame_id,
            AliveEntry {
                page_id,
                evictable: false,
                list: AliveList::Mru,
            },
        );
        Ok(())
    }

    fn evict(&self) -> Option<FrameId> {
        let mut s = self.state.lock();
        let sides = if s.mru.len() >= s.mru_target.max(1) {
            [AliveList::Mru, AliveList::Mfu]
        } else {
            [AliveList::Mfu, AliveList::Mru]
        };
        for side in sides {
            if let Some(victim) = s.victim_in(side) {
                s.detach(victim);
                return Some(victim);
            }
        }
        None
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) -> Result<(), ReplacerError> {
        self.check_frame_id(frame_id)?;
        let mut s = self.state.lock();
        let s = &mut *s;
        let Some(entry) = s.alive.get_mut(&frame_id) else {
            return Ok(());
        };
        if entry.evictable == evictable {
            return Ok(());
        }
        entry.evictable = evictable;
        if evictable {
            s.evictable_count += 1;
        } else {
            s.evictable_count -= 1;
        }
        Ok(())
    }

    fn remove(&self, frame_id: FrameId) -> Result<(), ReplacerError> {
        self.check_frame_id(frame_id)?;
        let mut s = self.state.lock();
        let Some(entry) = s.alive.get(&frame_id) else {
            return Ok(());
        };
        if !entry.evictable {
            return Err(ReplacerError::NotEvictable(frame_id));
        }
        s.detach(frame_id);
        Ok(())
    }

    fn size(&self) -> usize {
        self.state.lock().evictable_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Installs `page_id` in `frame_id` and marks it evictable, the state a
    /// resident unpinned page ends up in.
    fn install(replacer: &ArcReplacer, frame_id: FrameId, page_id: PageId) {
        replacer.record_access(frame_id, page_id).unwrap();
        replacer.set_evictable(frame_id, true).unwrap();
    }

    #[test]
    fn evicts_in_lru_order_from_the_mru_side() {
        let replacer = ArcReplacer::new(4);
        install(&replacer, 0, 10);
        install(&replacer, 1, 11);
        install(&replacer, 2, 12);
        assert_eq!(replacer.size(), 3);

        assert_eq!(replacer.evict(), Some(0));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn resident_hit_promotes_to_mfu() {
        let replacer = ArcReplacer::new(3);
        install(&replacer, 0, 10);
        install(&replacer, 1, 11);

        // Frame 0 is accessed again, so frame 1 becomes the better victim.
        replacer.record_access(0, 10).unwrap();
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn non_evictable_frames_are_skipped() {
        let replacer = ArcReplacer::new(3);
        install(&replacer, 0, 10);
        install(&replacer, 1, 11);
        replacer.set_evictable(0, false).unwrap();
        assert_eq!(replacer.size(), 1);

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(0, true).unwrap();
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn remove_rejects_non_evictable_frames() {
        let replacer = ArcReplacer::new(3);
        replacer.record_access(0, 10).unwrap();
        assert_eq!(replacer.remove(0), Err(ReplacerError::NotEvictable(0)));

        replacer.set_evictable(0, true).unwrap();
        assert_eq!(replacer.remove(0), Ok(()));
        assert_eq!(replacer.size(), 0);
        // Unknown frames are ignored.
        assert_eq!(replacer.remove(0), Ok(()));
    }

    #[test]
    fn out_of_range_frame_ids_are_rejected() {
        let replacer = ArcReplacer::new(3);
        assert_eq!(
            replacer.record_access(3, 0),
            Err(ReplacerError::FrameOutOfRange(3))
        );
        assert_eq!(
            replacer.set_evictable(7, true),
            Err(ReplacerError::FrameOutOfRange(7))
        );
        assert_eq!(replacer.remove(9), Err(ReplacerError::FrameOutOfRange(9)));
    }

    #[test]
    fn removed_frame_leaves_a_ghost_that_adapts_the_target() {
        let replacer = ArcReplacer::new(4);
        install(&replacer, 0, 10);
        replacer.remove(0).unwrap();

        // Page 10 is remembered as an mru ghost; touching it again grows the
        // mru target and resurrects it on the mfu side.
        install(&replacer, 1, 10);
        assert_eq!(replacer.mru_target(), 1);
        assert_eq!(replacer.evict(), Some(1));
    }

    /// The full ARC transition scenario: capacity 7, six resident pages, a
    /// re-access, a burst of evictions, two ghost resurrections per side and
    /// a target that adapts in both directions.
    #[test]
    fn arc_transitions_end_to_end() {
        let replacer = ArcReplacer::new(7);

        // Six pages come in, page n in frame n. Frame 6 stays pinned.
        for n in 1..=6 {
            install(&replacer, n, n as PageId);
        }
        replacer.set_evictable(6, false).unwrap();
        assert_eq!(replacer.size(), 5);

        // Page 1 is touched again and moves to the mfu side.
        replacer.record_access(1, 1).unwrap();

        // mru now reads [5, 4, 3, 2] oldest-last, so three evictions peel
        // frames 2, 3 and 4 into the mru ghost list.
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(4));
        assert_eq!(replacer.mru_target(), 0);

        // A brand-new page lands in the freed frame 2.
        install(&replacer, 2, 7);

        // Pages 2, 3 and 4 come back while their ghosts are still warm; each
        // hit grows the mru target by one.
        install(&replacer, 3, 2);
        assert_eq!(replacer.mru_target(), 1);
        install(&replacer, 4, 3);
        assert_eq!(replacer.mru_target(), 2);
        install(&replacer, 7, 4);
        assert_eq!(replacer.mru_target(), 3);

        // mru holds frames [2, 6, 5] with 6 pinned; its length still meets
        // the target, so the victim comes from its tail: frame 5 (page 5),
        // and the next eviction falls through to the mfu tail: frame 1
        // (page 1).
        assert_eq!(replacer.evict(), Some(5));
        assert_eq!(replacer.evict(), Some(1));

        // Page 1 resurrects from the mfu ghost list, shrinking the target.
        install(&replacer, 5, 1);
        assert_eq!(replacer.mru_target(), 2);

        // mru is [frame 2 (page 7), frame 6 (pinned)]; the pinned frame is
        // skipped and page 7 goes next.
        assert_eq!(replacer.evict(), Some(2));
    }

    #[test]
    fn directory_stays_within_twice_the_capacity() {
        let capacity = 4;
        let replacer = ArcReplacer::new(capacity);

        // Cycle far more pages than 2c through the replacer.
        for round in 0u32..8 {
            for frame in 0..capacity {
                let page = round * capacity as u32 + frame as u32;
                install(&replacer, frame, page);
                replacer.evict().unwrap();
            }
        }

        let s = replacer.state.lock();
        assert!(s.mru.len() + s.mru_ghost.len() <= capacity);
        assert!(s.mru.len() + s.mru_ghost.len() + s.mfu.len() + s.mfu_ghost.len() <= 2 * capacity);
        assert_eq!(s.evictable_count, 0);
    }
}
