//! The filler: a pool of partially-used huge pages.
//!
//! Sub-huge allocations are packed onto tracked huge pages, best fit: the
//! candidate with the smallest sufficient longest-free-range wins, ties going
//! to the most utilized tracker, then to the lowest address so behavior is
//! deterministic. Donated trackers (tails of multi-huge-page allocations)
//! are held apart and only drawn from when no regular candidate exists, to
//! keep donors reassemblable; the first hit re-files them into the regular
//! pool. Subrelease walks trackers with the largest free runs first and is
//! deferred while a recent demand spike suggests the memory is about to be
//! needed again.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::backend::MemoryModify;
use crate::pages::{HugeLength, Length, PageId, HUGE_PAGE_SIZE, PAGES_PER_HUGE_PAGE};
use crate::platform::abort_with_message;
use crate::stats::{BackingStats, Printer};
use crate::tracker::{TrackerId, TrackerSlab};

const K: usize = PAGES_PER_HUGE_PAGE;

/// Spans holding at most this many objects go to the "few objects" sub-pool
/// when segregation is enabled.
const FEW_OBJECTS_PER_SPAN_MAX: usize = 16;

/// Guards on deferring subrelease after a demand spike.
#[derive(Clone, Copy, Debug, Default)]
pub struct SkipSubreleaseIntervals {
    /// Window within which a demand peak suppresses release.
    pub peak_interval: Duration,
    /// Together with `long_interval`, caps how long release is deferred.
    pub short_interval: Duration,
    pub long_interval: Duration,
}

impl SkipSubreleaseIntervals {
    pub fn skipping_enabled(&self) -> bool {
        !self.peak_interval.is_zero()
    }
}

/// Successful `try_get`.
pub struct FillerHit {
    pub id: TrackerId,
    pub page: PageId,
    pub from_released: bool,
}

#[derive(PartialEq, Eq, Debug)]
pub enum PutOutcome {
    /// The tracker still holds live pages.
    NotEmpty,
    /// The tracker is fully empty and has been removed from the pool; the
    /// caller must take it through its release path.
    Emptied,
}

/// Pool ordering key: (longest free range, K - used pages, huge page, id).
/// BTreeSet order then realizes the selection policy directly.
type Key = (usize, usize, usize, u32);

#[derive(Clone, Copy)]
struct Filing {
    donated: bool,
    pool: usize,
}

pub struct HugePageFiller {
    separate_few_many: bool,
    pools: [BTreeSet<Key>; 2],
    donated: BTreeSet<Key>,
    filings: HashMap<TrackerId, Filing>,

    pages_used: Length,
    pages_free_backed: Length,
    pages_released: Length,

    // Demand tracking for skip-subrelease.
    peak_pages: Length,
    peak_at_ns: u64,
    skip_since_ns: Option<u64>,
}

fn key_for(id: TrackerId, slab: &TrackerSlab) -> Key {
    let t = slab.get(id);
    (
        t.longest_free_range().raw(),
        K - t.used_pages().raw(),
        t.location().raw(),
        id.raw(),
    )
}

fn lowest_sufficient(set: &BTreeSet<Key>, n: usize) -> Option<Key> {
    set.range((n, 0, 0, 0u32)..).next().copied()
}

impl HugePageFiller {
    pub fn new(separate_allocs_for_few_and_many_objects_spans: bool) -> Self {
        HugePageFiller {
            separate_few_many: separate_allocs_for_few_and_many_objects_spans,
            pools: [BTreeSet::new(), BTreeSet::new()],
            donated: BTreeSet::new(),
            filings: HashMap::new(),
            pages_used: Length::ZERO,
            pages_free_backed: Length::ZERO,
            pages_released: Length::ZERO,
            peak_pages: Length::ZERO,
            peak_at_ns: 0,
            skip_since_ns: None,
        }
    }

    fn pool_index(&self, objects_per_span: usize) -> usize {
        if self.separate_few_many && objects_per_span > FEW_OBJECTS_PER_SPAN_MAX {
            1
        } else {
            0
        }
    }

    fn note_demand(&mut self, now_ns: u64) {
        if self.pages_used >= self.peak_pages {
            self.peak_pages = self.pages_used;
            self.peak_at_ns = now_ns;
        }
    }

    /// Best-effort allocation of `n` pages from an existing tracker.
    pub fn try_get(
        &mut self,
        n: Length,
        objects_per_span: usize,
        slab: &mut TrackerSlab,
        now_ns: u64,
    ) -> Option<FillerHit> {
        debug_assert!(!n.is_zero() && n.raw() <= K);
        let pool = self.pool_index(objects_per_span);

        let (key, from_donated) = match lowest_sufficient(&self.pools[pool], n.raw()) {
            Some(k) => (k, false),
            // Sub-pools are never crossed; donated trackers are the shared
            // fallback of last resort.
            None => (lowest_sufficient(&self.donated, n.raw())?, true),
        };
        let id = TrackerId::new(key.3);
        if from_donated {
            self.donated.remove(&key);
            // Its donor slack is being consumed; from here on it competes
            // like any other tracker.
            self.filings.insert(id, Filing {
                donated: false,
                pool,
            });
        } else {
            self.pools[pool].remove(&key);
        }

        let t = slab.get_mut(id);
        let a = t.get(n);
        self.pages_used += n;
        self.pages_released -= a.released_covered;
        self.pages_free_backed -= n - a.released_covered;

        let filing = self.filings[&id];
        self.pools[filing.pool].insert(key_for(id, slab));
        self.note_demand(now_ns);

        Some(FillerHit {
            id,
            page: a.page,
            from_released: a.from_released,
        })
    }

    /// Insert a tracker that already carries its initial allocation.
    pub fn contribute(
        &mut self,
        id: TrackerId,
        slab: &TrackerSlab,
        donated: bool,
        objects_per_span: usize,
        now_ns: u64,
    ) {
        let t = slab.get(id);
        debug_assert!(!t.released());
        let filing = Filing {
            donated,
            pool: self.pool_index(objects_per_span),
        };
        self.filings.insert(id, filing);
        let key = key_for(id, slab);
        if donated {
            self.donated.insert(key);
        } else {
            self.pools[filing.pool].insert(key);
        }
        self.pages_used += t.used_pages();
        self.pages_free_backed += t.free_pages();
        self.note_demand(now_ns);
    }

    /// Return `n` pages at `p` to the tracker. On `Emptied` the tracker has
    /// left the pool and the caller owns its fate.
    pub fn put(
        &mut self,
        id: TrackerId,
        p: PageId,
        n: Length,
        _objects_per_span: usize,
        slab: &mut TrackerSlab,
        now_ns: u64,
    ) -> PutOutcome {
        let Some(filing) = self.filings.get(&id).copied() else {
            abort_with_message("hpalloc: filler put on an untracked huge page\n");
        };
        let key = key_for(id, slab);
        let removed = if filing.donated {
            self.donated.remove(&key)
        } else {
            self.pools[filing.pool].remove(&key)
        };
        if !removed {
            abort_with_message("hpalloc: filler pool lists out of sync\n");
        }

        let t = slab.get_mut(id);
        t.put(p, n);
        self.pages_used -= n;
        self.pages_free_backed += n;

        if t.used_pages().is_zero() {
            self.pages_free_backed -= t.free_pages() - t.released_pages();
            self.pages_released -= t.released_pages();
            self.filings.remove(&id);
            self.note_demand(now_ns);
            return PutOutcome::Emptied;
        }
        let key = key_for(id, slab);
        if filing.donated {
            self.donated.insert(key);
        } else {
            self.pools[filing.pool].insert(key);
        }
        self.note_demand(now_ns);
        PutOutcome::NotEmpty
    }

    /// Whether release should be deferred because demand recently spiked.
    fn should_skip(&mut self, now_ns: u64, intervals: SkipSubreleaseIntervals) -> bool {
        if !intervals.skipping_enabled() {
            self.skip_since_ns = None;
            return false;
        }
        let window = intervals.peak_interval.as_nanos() as u64;
        if now_ns.saturating_sub(self.peak_at_ns) > window {
            // Stale peak: current demand becomes the reference point.
            self.peak_pages = self.pages_used;
            self.peak_at_ns = now_ns;
            self.skip_since_ns = None;
            return false;
        }
        if self.peak_pages <= self.pages_used {
            self.skip_since_ns = None;
            return false;
        }
        let cap = intervals
            .short_interval
            .max(intervals.long_interval)
            .as_nanos() as u64;
        let since = *self.skip_since_ns.get_or_insert(now_ns);
        if cap > 0 && now_ns.saturating_sub(since) >= cap {
            self.skip_since_ns = None;
            return false;
        }
        true
    }

    /// Subrelease: unback free runs, preferring trackers with the largest
    /// contiguous free space. With `release_partial` unset, only mostly-empty
    /// trackers (free run of at least half a huge page) are eligible.
    /// `hit_limit` is the emergency override that ignores the spike guard.
    pub fn release_pages(
        &mut self,
        target: Length,
        intervals: SkipSubreleaseIntervals,
        release_partial: bool,
        hit_limit: bool,
        now_ns: u64,
        unback: &dyn MemoryModify,
        slab: &mut TrackerSlab,
    ) -> Length {
        if !hit_limit && self.should_skip(now_ns, intervals) {
            log::debug!("hpalloc: subrelease deferred, demand spike in window");
            return Length::ZERO;
        }

        let min_run = if release_partial { 1 } else { K / 2 };
        let mut candidates: Vec<(usize, usize, TrackerId)> = self
            .filings
            .keys()
            .map(|&id| {
                let t = slab.get(id);
                (t.longest_free_range().raw(), t.location().raw(), id)
            })
            .filter(|&(lfr, _, _)| lfr >= min_run)
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut released = Length::ZERO;
        for (_, _, id) in candidates {
            if released >= target {
                break;
            }
            // The free bitmap is untouched by releasing, so pool keys stay
            // valid.
            let got = slab.get_mut(id).release_free_pages(unback);
            self.pages_free_backed -= got;
            self.pages_released += got;
            released += got;
        }
        log::debug!(
            "hpalloc: subrelease returned {} of {} requested pages",
            released.raw(),
            target.raw()
        );
        released
    }

    pub fn size(&self) -> HugeLength {
        HugeLength::new(self.filings.len())
    }

    pub fn used_pages(&self) -> Length {
        self.pages_used
    }

    pub fn free_pages(&self) -> Length {
        self.pages_free_backed
    }

    pub fn released_pages(&self) -> Length {
        self.pages_released
    }

    pub fn stats(&self) -> BackingStats {
        BackingStats {
            system_bytes: self.filings.len() * HUGE_PAGE_SIZE,
            free_bytes: self.pages_free_backed.in_bytes(),
            unmapped_bytes: self.pages_released.in_bytes(),
        }
    }

    pub fn print(&self, out: &mut Printer) {
        use core::fmt::Write as _;
        let _ = writeln!(
            out,
            "HugePageFiller: {} huge pages ({} donated-pending), {} used / {} free / {} released pages",
            self.filings.len(),
            self.donated.len(),
            self.pages_used.raw(),
            self.pages_free_backed.raw(),
            self.pages_released.raw()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::HugePage;
    use crate::tracker::PageTracker;

    struct AlwaysUnback;
    impl MemoryModify for AlwaysUnback {
        fn unback(&self, _ptr: usize, _bytes: usize) -> bool {
            true
        }
    }

    /// Install a tracker at huge page `hp` with `used` pages allocated.
    fn seed(
        filler: &mut HugePageFiller,
        slab: &mut TrackerSlab,
        hp: usize,
        used: usize,
        donated: bool,
    ) -> TrackerId {
        let mut t = PageTracker::new(HugePage::new(hp), 0, donated);
        let a = t.get(Length::new(used));
        assert_eq!(a.page, HugePage::new(hp).first_page());
        if donated {
            t.set_abandoned_count(Length::new(used));
        }
        let id = slab.insert(t);
        filler.contribute(id, slab, donated, 1, 0);
        id
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_range() {
        let mut filler = HugePageFiller::new(false);
        let mut slab = TrackerSlab::new();
        let tight = seed(&mut filler, &mut slab, 1, K - 50, false); // lfr 50
        let roomy = seed(&mut filler, &mut slab, 2, K - 200, false); // lfr 200

        let hit = filler.try_get(Length::new(30), 1, &mut slab, 0).unwrap();
        assert_eq!(hit.id, tight);

        // 100 no longer fits the tight tracker.
        let hit = filler.try_get(Length::new(100), 1, &mut slab, 0).unwrap();
        assert_eq!(hit.id, roomy);
    }

    #[test]
    fn ties_go_to_the_most_utilized_then_lowest_address() {
        let mut filler = HugePageFiller::new(false);
        let mut slab = TrackerSlab::new();
        // Same longest free range via a different arrangement: allocate then
        // free interior pages so lfr matches but used differs.
        let light = seed(&mut filler, &mut slab, 5, K - 100, false); // used 156, lfr 100
        let heavy = seed(&mut filler, &mut slab, 3, K - 100, false);
        // Make `heavy` more utilized: take 40 more pages from its range.
        let hit = filler.try_get(Length::new(40), 1, &mut slab, 0).unwrap();
        // Best-fit tie at lfr 100 resolved by lowest address: hp 3.
        assert_eq!(hit.id, heavy);

        // Now heavy has lfr 60, light lfr 100. Ask for 50: heavy is the
        // tighter fit even though less free in total.
        let hit = filler.try_get(Length::new(50), 1, &mut slab, 0).unwrap();
        assert_eq!(hit.id, heavy);
        let _ = light;
    }

    #[test]
    fn donated_trackers_are_last_resort_and_refile() {
        let mut filler = HugePageFiller::new(false);
        let mut slab = TrackerSlab::new();
        let donated = seed(&mut filler, &mut slab, 1, 44, true); // lfr 212
        let regular = seed(&mut filler, &mut slab, 2, K - 20, false); // lfr 20

        // A fit exists in the regular pool: donated is not touched.
        let hit = filler.try_get(Length::new(10), 1, &mut slab, 0).unwrap();
        assert_eq!(hit.id, regular);

        // Too big for the regular tracker: falls through to donated.
        let hit = filler.try_get(Length::new(100), 1, &mut slab, 0).unwrap();
        assert_eq!(hit.id, donated);

        // Re-filed: with both in the regular pool, best fit now picks the
        // donated one (lfr 112 < regular's remaining 10... ask for 5).
        let hit = filler.try_get(Length::new(5), 1, &mut slab, 0).unwrap();
        assert_eq!(hit.id, regular, "regular lfr 10 is the tighter fit");
        let hit = filler.try_get(Length::new(50), 1, &mut slab, 0).unwrap();
        assert_eq!(hit.id, donated);
    }

    #[test]
    fn sub_pools_do_not_cross() {
        let mut filler = HugePageFiller::new(true);
        let mut slab = TrackerSlab::new();
        // objects_per_span = 1 → few pool.
        let few = seed(&mut filler, &mut slab, 1, 100, false);

        // A many-objects request must not land on the few-objects tracker.
        assert!(filler.try_get(Length::new(10), 1000, &mut slab, 0).is_none());
        let hit = filler.try_get(Length::new(10), 1, &mut slab, 0).unwrap();
        assert_eq!(hit.id, few);
    }

    #[test]
    fn put_tracks_emptying_and_counters() {
        let mut filler = HugePageFiller::new(false);
        let mut slab = TrackerSlab::new();
        let id = seed(&mut filler, &mut slab, 1, 100, false);
        assert_eq!(filler.used_pages(), Length::new(100));
        assert_eq!(filler.free_pages(), Length::new(K - 100));

        let first = HugePage::new(1).first_page();
        let outcome = filler.put(id, first, Length::new(40), 1, &mut slab, 0);
        assert_eq!(outcome, PutOutcome::NotEmpty);
        assert_eq!(filler.used_pages(), Length::new(60));

        let outcome = filler.put(id, first + Length::new(40), Length::new(60), 1, &mut slab, 0);
        assert_eq!(outcome, PutOutcome::Emptied);
        assert_eq!(filler.used_pages(), Length::ZERO);
        assert_eq!(filler.free_pages(), Length::ZERO);
        assert_eq!(filler.size(), HugeLength::ZERO);
        // The tracker object itself still exists for the caller to dispose.
        assert_eq!(slab.get(id).used_pages(), Length::ZERO);
    }

    #[test]
    fn release_respects_partial_gate_and_order() {
        let mut filler = HugePageFiller::new(false);
        let mut slab = TrackerSlab::new();
        let mostly_empty = seed(&mut filler, &mut slab, 1, 50, false); // lfr 206
        let mostly_full = seed(&mut filler, &mut slab, 2, K - 40, false); // lfr 40

        // Partial release disabled: only the mostly-empty tracker qualifies.
        let released = filler.release_pages(
            Length::new(K * 2),
            SkipSubreleaseIntervals::default(),
            false,
            false,
            0,
            &AlwaysUnback,
            &mut slab,
        );
        assert_eq!(released, Length::new(206));
        assert!(slab.get(mostly_empty).released());
        assert!(!slab.get(mostly_full).released());

        // Enabled: the rest becomes eligible too.
        let released = filler.release_pages(
            Length::new(K),
            SkipSubreleaseIntervals::default(),
            true,
            false,
            0,
            &AlwaysUnback,
            &mut slab,
        );
        assert_eq!(released, Length::new(40));
        assert_eq!(filler.released_pages(), Length::new(246));
    }

    /// Seed a demand spike: 200 pages used at t=0, shrinking to 10.
    fn spiked_filler() -> (HugePageFiller, TrackerSlab) {
        let mut filler = HugePageFiller::new(false);
        let mut slab = TrackerSlab::new();
        let id = seed(&mut filler, &mut slab, 1, 200, false);
        let first = HugePage::new(1).first_page();
        filler.put(id, first + Length::new(10), Length::new(190), 1, &mut slab, 1);
        (filler, slab)
    }

    fn spike_intervals() -> SkipSubreleaseIntervals {
        SkipSubreleaseIntervals {
            peak_interval: Duration::from_secs(60),
            short_interval: Duration::from_secs(10),
            long_interval: Duration::from_secs(30),
        }
    }

    #[test]
    fn spike_defers_release_until_deferral_cap() {
        let (mut filler, mut slab) = spiked_filler();
        let intervals = spike_intervals();

        // t = 1s: spike is within the window, release is skipped.
        let t1 = 1_000_000_000;
        let released = filler.release_pages(
            Length::new(K),
            intervals,
            true,
            false,
            t1,
            &AlwaysUnback,
            &mut slab,
        );
        assert_eq!(released, Length::ZERO);

        // Deferral caps out after max(short, long) = 30s of skipping.
        let t2 = t1 + 31_000_000_000;
        let released = filler.release_pages(
            Length::new(K),
            intervals,
            true,
            false,
            t2,
            &AlwaysUnback,
            &mut slab,
        );
        assert_eq!(released, Length::new(246));
    }

    #[test]
    fn hit_limit_overrides_spike_guard() {
        let (mut filler, mut slab) = spiked_filler();
        let released = filler.release_pages(
            Length::new(10),
            spike_intervals(),
            true,
            true,
            1_000_000_000,
            &AlwaysUnback,
            &mut slab,
        );
        assert!(released >= Length::new(10));
    }
}
