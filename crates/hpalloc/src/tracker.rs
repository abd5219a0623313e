//! Per-huge-page bookkeeping for the filler.
//!
//! A [`PageTracker`] exists for every huge page that is partially used by the
//! filler. It keeps two bitmaps over the 256 page slots: which pages are
//! free, and which of those are currently released (unbacked). Trackers are
//! owned by the [`TrackerSlab`]; the filler's pools and the page map hold
//! non-owning [`TrackerId`] handles, and a tracker is destroyed only through
//! the single release path once it is fully empty.

use crate::backend::MemoryModify;
use crate::bitmap::RunBitmap;
use crate::lifetime::LifetimeTracker;
use crate::pages::{HugePage, Length, PageId, PAGES_PER_HUGE_PAGE, PAGE_SIZE};
use crate::platform::abort_with_message;

const WORDS: usize = PAGES_PER_HUGE_PAGE / 64;

/// Result of carving an allocation out of a tracker.
pub struct TrackerAlloc {
    pub page: PageId,
    /// Any page of the run was released and must be backed before use.
    pub from_released: bool,
    /// How many of the run's pages were released (for the filler's counters).
    pub released_covered: Length,
}

pub struct PageTracker {
    location: HugePage,
    /// Set bit = page is free (possibly released).
    free: RunBitmap<WORDS>,
    /// Set bit = page is free and currently unbacked.
    released: RunBitmap<WORDS>,
    longest_free_range: Length,
    used_pages: Length,
    was_donated: bool,
    abandoned: bool,
    abandoned_count: Length,
    lifetime: Option<LifetimeTracker>,
    birth_ns: u64,
}

impl PageTracker {
    /// A tracker for a fresh, fully free huge page.
    pub fn new(location: HugePage, birth_ns: u64, donated: bool) -> Self {
        PageTracker {
            location,
            free: RunBitmap::all_set(),
            released: RunBitmap::all_clear(),
            longest_free_range: Length::new(PAGES_PER_HUGE_PAGE),
            used_pages: Length::ZERO,
            was_donated: donated,
            abandoned: false,
            abandoned_count: Length::ZERO,
            lifetime: None,
            birth_ns,
        }
    }

    #[inline]
    pub fn location(&self) -> HugePage {
        self.location
    }

    #[inline]
    pub fn longest_free_range(&self) -> Length {
        self.longest_free_range
    }

    #[inline]
    pub fn used_pages(&self) -> Length {
        self.used_pages
    }

    #[inline]
    pub fn free_pages(&self) -> Length {
        Length::new(self.free.set_count())
    }

    /// Free pages that are currently unbacked.
    #[inline]
    pub fn released_pages(&self) -> Length {
        Length::new(self.released.set_count())
    }

    /// Whether any part of the huge page has been subreleased.
    #[inline]
    pub fn released(&self) -> bool {
        self.released.set_count() > 0
    }

    #[inline]
    pub fn was_donated(&self) -> bool {
        self.was_donated
    }

    #[inline]
    pub fn abandoned(&self) -> bool {
        self.abandoned
    }

    pub fn set_abandoned(&mut self, value: bool) {
        self.abandoned = value;
    }

    #[inline]
    pub fn abandoned_count(&self) -> Length {
        self.abandoned_count
    }

    pub fn set_abandoned_count(&mut self, n: Length) {
        self.abandoned_count = n;
    }

    #[inline]
    pub fn birth_ns(&self) -> u64 {
        self.birth_ns
    }

    pub fn lifetime(&self) -> Option<&LifetimeTracker> {
        self.lifetime.as_ref()
    }

    pub fn attach_lifetime(&mut self, lt: LifetimeTracker) {
        self.lifetime = Some(lt);
    }

    pub fn take_lifetime(&mut self) -> Option<LifetimeTracker> {
        self.lifetime.take()
    }

    /// Allocate `n` contiguous pages, first fit. The caller guarantees
    /// `longest_free_range() >= n`.
    pub fn get(&mut self, n: Length) -> TrackerAlloc {
        let start = match self.free.find_set_run(n.raw()) {
            Some(s) => s,
            None => abort_with_message("hpalloc: tracker get without a sufficient free run\n"),
        };
        self.free.clear_range(start, n.raw());
        let released_covered = self.released.count_range(start, n.raw());
        if released_covered > 0 {
            // The caller backs these before handing the span out; they stop
            // being "released" now. clear_range only tolerates fully-set
            // ranges, so clip each released run against the allocated run.
            let end = start + n.raw();
            let overlaps: Vec<(usize, usize)> = self
                .released
                .set_runs()
                .filter(|&(s, l)| s < end && s + l > start)
                .map(|(s, l)| {
                    let lo = s.max(start);
                    let hi = (s + l).min(end);
                    (lo, hi - lo)
                })
                .collect();
            for (lo, len) in overlaps {
                self.released.clear_range(lo, len);
            }
        }
        self.used_pages += n;
        self.longest_free_range = Length::new(self.free.longest_set_run());
        TrackerAlloc {
            page: self.location.first_page() + Length::new(start),
            from_released: released_covered > 0,
            released_covered: Length::new(released_covered),
        }
    }

    /// Return `n` pages starting at `p`.
    pub fn put(&mut self, p: PageId, n: Length) {
        let first = self.location.first_page();
        if p < first || (p + n).raw() > (first + Length::new(PAGES_PER_HUGE_PAGE)).raw() {
            abort_with_message("hpalloc: tracker put outside its huge page\n");
        }
        let start = (p - first).raw();
        self.free.set_range(start, n.raw());
        self.used_pages -= n;
        self.longest_free_range = Length::new(self.free.longest_set_run());
    }

    /// Visit every maximal free run, split into segments of uniform backing:
    /// `f(len, released)`.
    pub fn for_each_free_segment(&self, mut f: impl FnMut(Length, bool)) {
        for (start, len) in self.free.set_runs() {
            let mut s = start;
            let end = start + len;
            while s < end {
                let released = self.released.is_set(s);
                let mut e = s + 1;
                while e < end && self.released.is_set(e) == released {
                    e += 1;
                }
                f(Length::new(e - s), released);
                s = e;
            }
        }
    }

    /// Unback every free-and-backed run through `unback`, marking the runs
    /// that succeed as released. Returns the number of pages released.
    pub fn release_free_pages(&mut self, unback: &dyn MemoryModify) -> Length {
        let mut released = Length::ZERO;
        // Collect first: unback may be slow and the run set must not change
        // under the iterator.
        let runs: Vec<(usize, usize)> = self.free.set_runs().collect();
        for (start, len) in runs {
            // Split off the parts that are already released.
            let mut s = start;
            let end = start + len;
            while s < end {
                if self.released.is_set(s) {
                    s += 1;
                    continue;
                }
                let mut e = s;
                while e < end && !self.released.is_set(e) {
                    e += 1;
                }
                let page = self.location.first_page() + Length::new(s);
                if unback.unback(page.address(), (e - s) * PAGE_SIZE) {
                    self.released.set_range(s, e - s);
                    released += Length::new(e - s);
                }
                s = e;
            }
        }
        released
    }
}

/// Non-owning handle to a tracker in the slab.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct TrackerId(u32);

impl TrackerId {
    pub(crate) fn new(raw: u32) -> Self {
        TrackerId(raw)
    }

    pub(crate) fn raw(self) -> u32 {
        self.0
    }
}

/// Owner of all live trackers. Slots are reused; the page map and the
/// filler's pools never outlive the tracker they point at because removal
/// happens in the same critical section as the emptying deallocation.
pub struct TrackerSlab {
    slots: Vec<Option<PageTracker>>,
    free_slots: Vec<u32>,
}

impl TrackerSlab {
    pub fn new() -> Self {
        TrackerSlab {
            slots: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    pub fn insert(&mut self, t: PageTracker) -> TrackerId {
        match self.free_slots.pop() {
            Some(idx) => {
                debug_assert!(self.slots[idx as usize].is_none());
                self.slots[idx as usize] = Some(t);
                TrackerId(idx)
            }
            None => {
                self.slots.push(Some(t));
                TrackerId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, id: TrackerId) -> &PageTracker {
        match self.slots.get(id.0 as usize).and_then(|s| s.as_ref()) {
            Some(t) => t,
            None => abort_with_message("hpalloc: dangling tracker handle\n"),
        }
    }

    pub fn get_mut(&mut self, id: TrackerId) -> &mut PageTracker {
        match self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut()) {
            Some(t) => t,
            None => abort_with_message("hpalloc: dangling tracker handle\n"),
        }
    }

    pub fn remove(&mut self, id: TrackerId) -> PageTracker {
        match self.slots.get_mut(id.0 as usize).and_then(|s| s.take()) {
            Some(t) => {
                self.free_slots.push(id.0);
                t
            }
            None => abort_with_message("hpalloc: removing dangling tracker handle\n"),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (TrackerId, &PageTracker)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|t| (TrackerId(i as u32), t)))
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TrackerSlab {
    fn default() -> Self {
        Self::new()
    }
}
