//! The placement router.
//!
//! Decides, per allocation, which reservoir serves it: the filler packs
//! anything up to half a huge page (and sub-huge large requests when it can),
//! the lifetime region takes predicted-short-lived large requests, regions
//! absorb large requests once pending slack says direct huge pages are
//! wasteful, and everything else goes to whole huge pages from the cache,
//! donating unused tails back to the filler. Deallocation walks the same
//! provenance in reverse through the page map.
//!
//! Locking discipline is the delicate part: a single page-heap lock
//! serializes all bookkeeping, but backing memory (after allocation) and
//! unbacking cache-owned ranges happen with the lock dropped — a range that
//! has been pulled out of the cache is unreachable to every other thread, so
//! the OS call needs no lock.

use core::cell::UnsafeCell;
use core::fmt::Write as _;

use crate::backend::{Forwarder, MemoryModify, MemoryTag};
use crate::config;
use crate::filler::{HugePageFiller, PutOutcome};
use crate::huge_allocator::HugeAllocator;
use crate::huge_cache::HugeCache;
use crate::lifetime::{LifetimeBasedAllocator, LifetimeContext};
use crate::page_map::PageMap;
use crate::pages::{
    HugeLength, HugePage, HugeRange, Length, PageId, PAGES_PER_HUGE_PAGE, PAGE_SIZE,
};
use crate::platform::abort_with_message;
use crate::region::{HugeRegion, HugeRegionSet};
use crate::span::Span;
use crate::stats::{
    bytes_to_mib, BackingStats, LargeSpanStats, PageAgeHistograms, PageAllocInfo, PbtxtRegion,
    Printer, SmallSpanStats, MAX_SMALL_SPAN_PAGES,
};
use crate::sync::RawMutex;
use crate::tracker::{PageTracker, TrackerId, TrackerSlab};

const K: usize = PAGES_PER_HUGE_PAGE;

/// Below this much pending donated slack, large allocations keep going to
/// raw huge pages on the expectation that small allocations absorb the
/// slack (64 MiB).
const REGION_SLACK_THRESHOLD_BYTES: usize = 64 * 1024 * 1024;

/// Construction-time options. These shape internal pool structure and are
/// fixed for the allocator's lifetime; everything else is read through the
/// forwarder on each use.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    pub tag: MemoryTag,
    pub use_huge_region_more_often: bool,
    pub separate_allocs_for_few_and_many_objects_spans: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            tag: MemoryTag::Normal,
            use_huge_region_more_often: config::use_huge_region_more_often(),
            separate_allocs_for_few_and_many_objects_spans:
                config::separate_allocs_for_few_and_many_objects_spans(),
        }
    }
}

struct Core {
    tag: MemoryTag,
    filler: HugePageFiller,
    slab: TrackerSlab,
    regions: HugeRegionSet,
    alloc: HugeAllocator,
    cache: HugeCache,
    lifetime: LifetimeBasedAllocator,
    page_map: PageMap,
    /// Huge pages whose tail slack was contributed to the filler by a live
    /// or not-yet-reassembled multi-huge-page allocation.
    donated_huge_pages: HugeLength,
    /// Pages stuck in the filler after their donor was freed.
    abandoned_pages: Length,
    info: PageAllocInfo,
}

impl Core {
    fn new(options: Options) -> Self {
        Core {
            tag: options.tag,
            filler: HugePageFiller::new(options.separate_allocs_for_few_and_many_objects_spans),
            slab: TrackerSlab::new(),
            regions: HugeRegionSet::new(options.use_huge_region_more_often),
            alloc: HugeAllocator::new(options.tag),
            cache: HugeCache::new(),
            lifetime: LifetimeBasedAllocator::new(),
            page_map: PageMap::new(),
            donated_huge_pages: HugeLength::ZERO,
            abandoned_pages: Length::ZERO,
            info: PageAllocInfo::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    fn finalize<F: Forwarder>(&mut self, n: Length, page: PageId, fwd: &F) -> Span {
        self.page_map.set_span(page, n);
        self.info.record_alloc(n);
        fwd.shrink_to_usage_limit(n);
        Span::new(page, n)
    }

    /// Create a tracker on `hp`, carve its leading `n` pages for the caller,
    /// and hand the remainder to the filler.
    fn alloc_and_contribute(
        &mut self,
        hp: HugePage,
        n: Length,
        objects_per_span: usize,
        donated: bool,
        now: u64,
    ) -> PageId {
        debug_assert!(!n.is_zero());
        let mut t = PageTracker::new(hp, now, donated);
        if donated {
            // Measured into abandoned_pages if the donor dies before the
            // huge page reassembles.
            t.set_abandoned_count(n);
        }
        let a = t.get(n);
        debug_assert_eq!(a.page, hp.first_page());
        let id = self.slab.insert(t);
        self.page_map.set_tracker(hp, Some(id));
        self.filler.contribute(id, &self.slab, donated, objects_per_span, now);
        a.page
    }

    fn refill_filler<F: Forwarder>(
        &mut self,
        n: Length,
        objects_per_span: usize,
        fwd: &F,
        now: u64,
    ) -> Option<(PageId, bool)> {
        let (r, from_released) = self.cache.get(HugeLength::new(1), fwd, &mut self.alloc)?;
        fwd.shrink_to_usage_limit(n);
        let page = self.alloc_and_contribute(r.start(), n, objects_per_span, false, now);
        Some((page, from_released))
    }

    fn alloc_small<F: Forwarder>(
        &mut self,
        n: Length,
        objects_per_span: usize,
        fwd: &F,
        now: u64,
    ) -> Option<(Span, bool)> {
        if let Some(hit) = self.filler.try_get(n, objects_per_span, &mut self.slab, now) {
            return Some((self.finalize(n, hit.page, fwd), hit.from_released));
        }
        let (page, from_released) = self.refill_filler(n, objects_per_span, fwd, now)?;
        Some((self.finalize(n, page, fwd), from_released))
    }

    fn alloc_large<F: Forwarder>(
        &mut self,
        n: Length,
        objects_per_span: usize,
        ctx: Option<&LifetimeContext>,
        fwd: &F,
        now: u64,
    ) -> Option<(Span, bool)> {
        // Exact huge-page multiples skip every packing tier.
        let hl = HugeLength::from_pages_ceil(n);
        if hl.in_pages() == n {
            return self.alloc_raw_hugepages(n, objects_per_span, fwd, now);
        }

        if n.raw() < K {
            if let Some(hit) = self.filler.try_get(n, objects_per_span, &mut self.slab, now) {
                return Some((self.finalize(n, hit.page, fwd), hit.from_released));
            }
        }

        if let Some((page, fr)) = self
            .lifetime
            .maybe_get(n, ctx, fwd, &mut self.alloc, now)
        {
            return Some((self.finalize(n, page, fwd), fr));
        }

        if let Some((page, fr)) = self.regions.maybe_get(n) {
            return Some((self.finalize(n, page, fwd), fr));
        }

        // Either allocate a new region, or go to huge pages directly and
        // hope small allocations fill the slack. Direct is faster and
        // usually tighter, but pathological once slack outgrows the small
        // allocations available to soak it up.
        let slack = self.info.slack();
        let donated = if self.regions.use_huge_region_more_often() {
            self.abandoned_pages + slack
        } else {
            slack
        };
        if donated < Length::new(REGION_SLACK_THRESHOLD_BYTES / PAGE_SIZE) {
            return self.alloc_raw_hugepages_maybe_track(n, objects_per_span, ctx, fwd, now);
        }
        let small = self.info.small();
        if slack < small && !self.regions.use_huge_region_more_often() {
            return self.alloc_raw_hugepages_maybe_track(n, objects_per_span, ctx, fwd, now);
        }
        if !self.add_region(fwd, now) {
            return self.alloc_raw_hugepages_maybe_track(n, objects_per_span, ctx, fwd, now);
        }
        match self.regions.maybe_get(n) {
            Some((page, fr)) => Some((self.finalize(n, page, fwd), fr)),
            None => abort_with_message("hpalloc: fresh region could not satisfy allocation\n"),
        }
    }

    fn alloc_raw_hugepages<F: Forwarder>(
        &mut self,
        n: Length,
        objects_per_span: usize,
        fwd: &F,
        now: u64,
    ) -> Option<(Span, bool)> {
        let hl = HugeLength::from_pages_ceil(n);
        let (r, from_released) = self.cache.get(hl, fwd, &mut self.alloc)?;

        let total = hl.in_pages();
        let slack = total - n;
        let first = r.start();
        self.page_map.set_tracker(first, None);
        let last = first + r.len() - HugeLength::new(1);
        if slack.is_zero() {
            self.page_map.set_tracker(last, None);
            return Some((self.finalize(total, first.first_page(), fwd), from_released));
        }

        // Donate the tail: the caller's part of the last huge page is a
        // "virtual" allocation in the tracker; the slack becomes filler
        // inventory.
        self.donated_huge_pages += HugeLength::new(1);
        let here = Length::new(K) - slack;
        self.alloc_and_contribute(last, here, objects_per_span, true, now);
        self.info.add_slack(slack);
        let mut span = self.finalize(n, first.first_page(), fwd);
        span.set_donated(true);
        Some((span, from_released))
    }

    /// As `alloc_raw_hugepages`, additionally attaching a lifetime tracker
    /// to the donated tail when a prediction context is present.
    fn alloc_raw_hugepages_maybe_track<F: Forwarder>(
        &mut self,
        n: Length,
        objects_per_span: usize,
        ctx: Option<&LifetimeContext>,
        fwd: &F,
        now: u64,
    ) -> Option<(Span, bool)> {
        let (span, from_released) = self.alloc_raw_hugepages(n, objects_per_span, fwd, now)?;
        if span.donated() {
            let hp = HugePage::containing(span.last_page());
            let Some(id) = self.page_map.tracker(hp) else {
                abort_with_message("hpalloc: donated span without a tail tracker\n");
            };
            let t = self.slab.get_mut(id);
            if t.was_donated() {
                self.lifetime.maybe_add_tracker(ctx, t, now);
            }
        }
        Some((span, from_released))
    }

    fn add_region<F: Forwarder>(&mut self, fwd: &F, now: u64) -> bool {
        let Some(r) = self.alloc.get(HugeRegion::size(), fwd) else {
            return false;
        };
        log::debug!("hpalloc: new huge region at {:#x}", r.start().address());
        self.regions.contribute(HugeRegion::new(r, now));
        true
    }

    fn dispatch<F: Forwarder>(
        &mut self,
        n: Length,
        objects_per_span: usize,
        ctx: Option<&LifetimeContext>,
        fwd: &F,
        now: u64,
    ) -> Option<(Span, bool)> {
        if n.raw() <= K / 2 {
            self.alloc_small(n, objects_per_span, fwd, now)
        } else if n <= HugeRegion::size().in_pages() {
            self.alloc_large(n, objects_per_span, ctx, fwd, now)
        } else {
            self.alloc_raw_hugepages(n, objects_per_span, fwd, now)
        }
    }

    // -----------------------------------------------------------------------
    // Deallocation
    // -----------------------------------------------------------------------

    /// Destroy an empty tracker and hand its huge page to the cache.
    fn release_hugepage(&mut self, id: TrackerId, now: u64) {
        let mut t = self.slab.remove(id);
        if !t.used_pages().is_zero() {
            abort_with_message("hpalloc: releasing a huge page with live pages\n");
        }
        if t.take_lifetime().is_some() {
            abort_with_message("hpalloc: lifetime handle survived to tracker teardown\n");
        }
        self.page_map.set_tracker(t.location(), None);
        let r = HugeRange::new(t.location(), HugeLength::new(1));
        if t.released() {
            self.cache.release_unbacked(r, now);
        } else {
            self.cache.release(r, now);
        }
    }

    /// Path (a): the span lived on a filler-tracked huge page.
    fn delete_from_hugepage(
        &mut self,
        id: TrackerId,
        p: PageId,
        n: Length,
        objects_per_span: usize,
        might_abandon: bool,
        now: u64,
    ) {
        match self.filler.put(id, p, n, objects_per_span, &mut self.slab, now) {
            PutOutcome::NotEmpty => {
                if might_abandon {
                    // The donor is gone but its huge page still carries
                    // other allocations: the donated portion is stranded.
                    let t = self.slab.get_mut(id);
                    if !t.was_donated() {
                        abort_with_message(
                            "hpalloc: donated span freed on a non-donated huge page\n",
                        );
                    }
                    let cnt = t.abandoned_count();
                    t.set_abandoned(true);
                    self.abandoned_pages += cnt;
                    self.info.sub_slack(Length::new(K) - cnt);
                }
            }
            PutOutcome::Emptied => {
                let t = self.slab.get_mut(id);
                let cnt = t.abandoned_count();
                if t.was_donated() {
                    self.donated_huge_pages -= HugeLength::new(1);
                    if t.abandoned() {
                        t.set_abandoned(false);
                        self.abandoned_pages -= cnt;
                    } else {
                        // The donor itself is being freed and nothing is
                        // stranded; its pending slack retires with it.
                        debug_assert!(might_abandon);
                        self.info.sub_slack(Length::new(K) - cnt);
                    }
                } else if !cnt.is_zero() {
                    abort_with_message("hpalloc: abandoned count on a non-donated tracker\n");
                }
                let lt = self.slab.get_mut(id).take_lifetime();
                self.lifetime.maybe_put_tracker(lt, now);
                self.release_hugepage(id, now);
            }
        }
    }

    fn delete<F: Forwarder>(&mut self, span: Span, objects_per_span: usize, fwd: &F, now: u64) {
        let p = span.first_page();
        let n = span.num_pages();
        let hp = HugePage::containing(p);
        let might_abandon = span.donated();
        drop(span);

        if fwd.tag_of(p.address()) != Some(self.tag) {
            abort_with_message("hpalloc: span tag mismatch on delete\n");
        }
        match self.page_map.clear_span(p) {
            Some(reg) if reg == n => {}
            Some(_) => abort_with_message("hpalloc: span length does not match page map\n"),
            None => abort_with_message("hpalloc: deleting a span that is not live\n"),
        }
        self.info.record_free(n);

        // Where did we come from? (a) the filler...
        if let Some(id) = self.page_map.tracker(hp) {
            if HugePage::containing(p + n - Length::new(1)) != hp {
                abort_with_message("hpalloc: filler span straddles huge pages\n");
            }
            return self.delete_from_hugepage(id, p, n, objects_per_span, might_abandon, now);
        }

        // (b) a region, (c) the lifetime region...
        if self.regions.maybe_put(p, n) {
            return;
        }
        if self.lifetime.maybe_put(p, n, now) {
            return;
        }

        // (d) ...or straight from the cache as whole huge pages.
        if n.raw() < K {
            abort_with_message("hpalloc: freeing pages owned by no reservoir\n");
        }
        let mut hl = HugeLength::from_pages_ceil(n);
        let last = hp + hl - HugeLength::new(1);
        let slack = hl.in_pages() - n;
        if slack.is_zero() {
            if self.page_map.tracker(last).is_some() {
                abort_with_message("hpalloc: exact huge range carries a tail tracker\n");
            }
        } else {
            let Some(id) = self.page_map.tracker(last) else {
                abort_with_message("hpalloc: donated tail tracker missing\n");
            };
            {
                // Clear the lifetime handle before any of the three branches
                // below can reclaim the tracker storage.
                let t = self.slab.get_mut(id);
                if !t.was_donated() {
                    abort_with_message("hpalloc: tail tracker was never donated\n");
                }
                let lt = t.take_lifetime();
                self.lifetime.maybe_put_tracker(lt, now);
            }
            self.info.sub_slack(slack);

            // The donor's part of the tail is a virtual allocation in the
            // tracker; give it back.
            let virt = last.first_page();
            let virt_len = Length::new(K) - slack;
            match self
                .filler
                .put(id, virt, virt_len, objects_per_span, &mut self.slab, now)
            {
                PutOutcome::NotEmpty => {
                    // Slack was used; the tail stays behind in the filler.
                    hl -= HugeLength::new(1);
                    let t = self.slab.get_mut(id);
                    let cnt = t.abandoned_count();
                    t.set_abandoned(true);
                    self.abandoned_pages += cnt;
                }
                PutOutcome::Emptied => {
                    self.donated_huge_pages -= HugeLength::new(1);
                    let t = self.slab.get(id);
                    if t.abandoned() {
                        abort_with_message("hpalloc: reassembled tail still marked abandoned\n");
                    }
                    if t.released() {
                        // Sub-released tail: split it off and return it
                        // unbacked on its own.
                        hl -= HugeLength::new(1);
                        self.release_hugepage(id, now);
                    } else {
                        // Drop the tracker object but keep the huge page in
                        // the range being returned.
                        self.page_map.set_tracker(last, None);
                        let t = self.slab.remove(id);
                        debug_assert!(t.used_pages().is_zero());
                    }
                }
            }
        }
        self.cache.release(HugeRange::new(hp, hl), now);
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    fn stats(&self) -> BackingStats {
        let astats = self.alloc.stats();
        let actual_system = astats.system_bytes;
        let mut s = astats;
        s += self.cache.stats();
        s += self.filler.stats();
        s += self.regions.stats();
        if let Some(l) = self.lifetime.region_stats() {
            s += l;
        }
        // Every tier manages memory drawn from the same reservation; only
        // the bottom tier's system byte count is real.
        s.system_bytes = actual_system;
        s
    }

    fn span_stats(&self, ages: Option<&mut PageAgeHistograms>) -> (SmallSpanStats, LargeSpanStats) {
        let mut small = SmallSpanStats::new();
        let mut large = LargeSpanStats::default();
        for (_, t) in self.slab.iter() {
            t.for_each_free_segment(|len, released| {
                if len.raw() < MAX_SMALL_SPAN_PAGES {
                    small.record(len, released);
                } else {
                    large.record(len, released);
                }
            });
        }
        self.regions.add_span_stats(&mut small, &mut large);
        self.cache.add_span_stats(&mut small, &mut large);
        self.alloc.add_span_stats(&mut small, &mut large);
        if let Some(ages) = ages {
            for (_, t) in self.slab.iter() {
                ages.record(t.free_pages(), t.birth_ns());
            }
            self.regions.collect_ages(ages);
            self.cache.collect_ages(ages);
        }
        (small, large)
    }

    /// Per-tier breakdown with the double-counting adjustment applied:
    /// (filler, region, lifetime, cache, alloc).
    fn breakdown(
        &self,
    ) -> (
        BackingStats,
        BackingStats,
        Option<BackingStats>,
        BackingStats,
        BackingStats,
    ) {
        let fstats = self.filler.stats();
        let rstats = self.regions.stats();
        let lstats = self.lifetime.region_stats();
        let mut cstats = self.cache.stats();
        // Everything in the filler came from the cache.
        cstats.system_bytes -= fstats.system_bytes;
        let mut astats = self.alloc.stats();
        // And everything everywhere came from the allocator.
        astats.system_bytes -= fstats.system_bytes
            + rstats.system_bytes
            + lstats.unwrap_or_default().system_bytes
            + cstats.system_bytes;
        (fstats, rstats, lstats, cstats, astats)
    }

    fn print<F: Forwarder>(&self, out: &mut Printer, everything: bool, fwd: &F, now: u64) {
        let bstats = self.stats();
        let _ = writeln!(
            out,
            "HugePageAware: {:10.1} MiB used, {:10.1} MiB free, {:10.1} MiB unmapped, {:10.1} MiB system",
            bytes_to_mib(bstats.used_bytes()),
            bytes_to_mib(bstats.free_bytes),
            bytes_to_mib(bstats.unmapped_bytes),
            bytes_to_mib(bstats.system_bytes)
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "Huge page aware allocator components:");
        let _ = writeln!(out, "------------------------------------------------");
        let _ = writeln!(out, "HugePageAware: breakdown of used / free / unmapped space:");

        fn line(out: &mut Printer, label: &str, s: BackingStats) {
            let _ = writeln!(
                out,
                "{label} {:6.1} MiB used, {:6.1} MiB free, {:6.1} MiB unmapped",
                bytes_to_mib(s.used_bytes()),
                bytes_to_mib(s.free_bytes),
                bytes_to_mib(s.unmapped_bytes)
            );
        }

        let (fstats, rstats, lstats, cstats, astats) = self.breakdown();
        line(out, "HugePageAware: filler  ", fstats);
        line(out, "HugePageAware: region  ", rstats);
        if let Some(l) = lstats {
            line(out, "HugePageAware: lifetime", l);
        }
        line(out, "HugePageAware: cache   ", cstats);
        line(out, "HugePageAware: alloc   ", astats);
        let _ = writeln!(out);

        let _ = writeln!(
            out,
            "HugePageAware: filler donations {} ({} pages from abandoned donations)",
            self.donated_huge_pages.raw(),
            self.abandoned_pages.raw()
        );

        self.filler.print(out);
        let _ = writeln!(out);
        if everything {
            self.regions.print(out);
            self.cache.print(out);
            self.lifetime.print(out);
            self.alloc.print(out);
            self.info.print(out);
            let mut ages = PageAgeHistograms::new(now);
            self.span_stats(Some(&mut ages));
            ages.print("HugePageAware", out);
        }

        let _ = writeln!(
            out,
            "PARAMETER use_huge_region_more_often {}",
            if self.regions.use_huge_region_more_often() { 1 } else { 0 }
        );
        let _ = writeln!(
            out,
            "PARAMETER hpaa_subrelease {}",
            if fwd.hpaa_subrelease() { 1 } else { 0 }
        );
    }

    fn print_in_pbtxt<F: Forwarder>(&self, region: &mut PbtxtRegion<'_>, fwd: &F) {
        let mut hpaa = region.sub_region("huge_page_allocator");
        hpaa.print_bool("using_hpaa", true);
        hpaa.print_bool("using_hpaa_subrelease", fwd.hpaa_subrelease());
        hpaa.print_bool(
            "use_huge_region_more_often",
            self.regions.use_huge_region_more_often(),
        );

        fn usage(out: &mut PbtxtRegion<'_>, key: &str, s: BackingStats) {
            let mut sub = out.sub_region(key);
            sub.print_i64("used", s.used_bytes() as i64);
            sub.print_i64("free", s.free_bytes as i64);
            sub.print_i64("unmapped", s.unmapped_bytes as i64);
        }

        let (fstats, rstats, lstats, cstats, astats) = self.breakdown();
        usage(&mut hpaa, "filler_usage", fstats);
        usage(&mut hpaa, "region_usage", rstats);
        if let Some(l) = lstats {
            usage(&mut hpaa, "lifetime_region_usage", l);
        }
        usage(&mut hpaa, "cache_usage", cstats);
        usage(&mut hpaa, "alloc_usage", astats);

        self.lifetime.print_in_pbtxt(&mut hpaa);
        hpaa.print_i64(
            "filler_donated_huge_pages",
            self.donated_huge_pages.raw() as i64,
        );
        hpaa.print_i64("filler_abandoned_pages", self.abandoned_pages.raw() as i64);
    }
}

/// Unback hook for subrelease paths that keep the page-heap lock held
/// (filler free runs, region huge pages): the ranges stay reachable through
/// live bookkeeping, so the lock cannot be dropped.
struct UnbackUnderLock<'a, F: Forwarder> {
    fwd: &'a F,
}

impl<F: Forwarder> MemoryModify for UnbackUnderLock<'_, F> {
    fn unback(&self, ptr: usize, bytes: usize) -> bool {
        self.fwd.release(ptr, bytes)
    }
}

/// The huge-page-aware page allocator.
///
/// All placement state sits behind one lock; the forwarder supplies memory,
/// clock, and parameters. See the module docs for the locking discipline.
pub struct HugePageAwareAllocator<F: Forwarder> {
    lock: RawMutex,
    fwd: F,
    core: UnsafeCell<Core>,
}

unsafe impl<F: Forwarder + Send> Send for HugePageAwareAllocator<F> {}
unsafe impl<F: Forwarder + Sync> Sync for HugePageAwareAllocator<F> {}

impl<F: Forwarder> HugePageAwareAllocator<F> {
    pub fn new(fwd: F, options: Options) -> Self {
        HugePageAwareAllocator {
            lock: RawMutex::new(),
            fwd,
            core: UnsafeCell::new(Core::new(options)),
        }
    }

    pub fn forwarder(&self) -> &F {
        &self.fwd
    }

    /// Allocate a run of `n` pages. `None` means out of memory.
    pub fn allocate(&self, n: Length, objects_per_span: usize) -> Option<Span> {
        if n.is_zero() {
            abort_with_message("hpalloc: allocate of zero pages\n");
        }
        // Lifetime context is collected before the lock.
        let ctx =
            LifetimeBasedAllocator::collect_context(n, objects_per_span, self.fwd.lifetime_options());
        let now = self.fwd.now_nanos();

        self.lock.lock();
        let core = unsafe { &mut *self.core.get() };
        let result = core.dispatch(n, objects_per_span, ctx.as_ref(), &self.fwd, now);
        self.lock.unlock();

        let (span, from_released) = result?;
        if from_released {
            // The span is exclusively ours now; backing needs no lock.
            self.fwd.back(span.start_address(), span.bytes_in_span());
        }
        Some(span)
    }

    /// As `allocate`, aligned to an `align`-page boundary (a power of two of
    /// at most one huge page). Alignments above one page bypass the filler
    /// and draw whole huge pages.
    pub fn allocate_aligned(&self, n: Length, align: Length, objects_per_span: usize) -> Option<Span> {
        if align.raw() <= 1 {
            return self.allocate(n, objects_per_span);
        }
        if !align.raw().is_power_of_two() || align.raw() > K {
            abort_with_message("hpalloc: unsupported span alignment\n");
        }
        if n.is_zero() {
            abort_with_message("hpalloc: allocate of zero pages\n");
        }
        let now = self.fwd.now_nanos();

        self.lock.lock();
        let core = unsafe { &mut *self.core.get() };
        let result = core.alloc_raw_hugepages(n, objects_per_span, &self.fwd, now);
        self.lock.unlock();

        let (span, from_released) = result?;
        debug_assert_eq!(span.first_page().raw() % align.raw(), 0);
        if from_released {
            self.fwd.back(span.start_address(), span.bytes_in_span());
        }
        Some(span)
    }

    /// Return a span. Aborts on a span this allocator does not own (wrong
    /// tag, double free, or foreign memory).
    pub fn deallocate(&self, span: Span, objects_per_span: usize) {
        let now = self.fwd.now_nanos();
        self.lock.lock();
        let core = unsafe { &mut *self.core.get() };
        core.delete(span, objects_per_span, &self.fwd, now);
        let overflow = core.cache.extract_overflow();
        self.lock.unlock();

        if !overflow.is_empty() {
            // Cache-owned ranges over the bound: unback without the lock.
            let results: Vec<bool> = overflow
                .iter()
                .map(|e| {
                    self.fwd
                        .release(e.range().start().address(), e.range().in_bytes())
                })
                .collect();
            self.lock.lock();
            let core = unsafe { &mut *self.core.get() };
            core.cache.finish_subrelease(overflow, &results);
            self.lock.unlock();
        }
    }

    /// Try to release at least `num_pages` to the OS. Returns the pages
    /// actually released (possibly more: whole ranges are not split, and
    /// possibly fewer: there may not be enough idle memory).
    pub fn release_at_least_n_pages(&self, num_pages: Length) -> Length {
        let now = self.fwd.now_nanos();
        let mut released = Length::ZERO;

        self.lock.lock();
        let core = unsafe { &mut *self.core.get() };
        let pending = core
            .cache
            .extract_for_subrelease(HugeLength::from_pages_ceil(num_pages));
        if !pending.is_empty() {
            // The extracted ranges are owned by us alone: drop the lock for
            // the OS calls.
            self.lock.unlock();
            let results: Vec<bool> = pending
                .iter()
                .map(|e| {
                    self.fwd
                        .release(e.range().start().address(), e.range().in_bytes())
                })
                .collect();
            self.lock.lock();
            let core = unsafe { &mut *self.core.get() };
            released += core.cache.finish_subrelease(pending, &results).in_pages();
        }

        let core = unsafe { &mut *self.core.get() };
        if self.fwd.hpaa_subrelease() && released < num_pages {
            let unback = UnbackUnderLock { fwd: &self.fwd };
            let Core { filler, slab, .. } = core;
            released += filler.release_pages(
                num_pages - released,
                self.fwd.skip_subrelease_intervals(),
                self.fwd.release_partial_alloc_pages(),
                false,
                now,
                &unback,
                slab,
            );
        }
        let core = unsafe { &mut *self.core.get() };
        if core.regions.use_huge_region_more_often() {
            let unback = UnbackUnderLock { fwd: &self.fwd };
            released += core.regions.release_pages(&unback);
        }
        core.info.record_release(num_pages, released);
        self.lock.unlock();
        released
    }

    /// Emergency release: ignore the demand-spike guards and subrelease
    /// straight from the filler, even at the cost of breaking huge pages.
    pub fn release_at_least_n_pages_breaking_hugepages(&self, n: Length) -> Length {
        let now = self.fwd.now_nanos();
        self.lock.lock();
        let core = unsafe { &mut *self.core.get() };
        let unback = UnbackUnderLock { fwd: &self.fwd };
        let Core { filler, slab, info, .. } = core;
        let released = filler.release_pages(
            n,
            Default::default(),
            false,
            true,
            now,
            &unback,
            slab,
        );
        info.record_release(n, released);
        self.lock.unlock();
        released
    }

    pub fn stats(&self) -> BackingStats {
        self.lock.lock();
        let s = unsafe { &*self.core.get() }.stats();
        self.lock.unlock();
        s
    }

    pub fn get_small_span_stats(&self, result: &mut SmallSpanStats) {
        self.lock.lock();
        let (small, _) = unsafe { &*self.core.get() }.span_stats(None);
        self.lock.unlock();
        *result = small;
    }

    pub fn get_large_span_stats(&self, result: &mut LargeSpanStats) {
        self.lock.lock();
        let (_, large) = unsafe { &*self.core.get() }.span_stats(None);
        self.lock.unlock();
        *result = large;
    }

    pub fn donated_huge_pages(&self) -> HugeLength {
        self.lock.lock();
        let v = unsafe { &*self.core.get() }.donated_huge_pages;
        self.lock.unlock();
        v
    }

    pub fn abandoned_pages(&self) -> Length {
        self.lock.lock();
        let v = unsafe { &*self.core.get() }.abandoned_pages;
        self.lock.unlock();
        v
    }

    pub fn filler_stats(&self) -> BackingStats {
        self.lock.lock();
        let s = unsafe { &*self.core.get() }.filler.stats();
        self.lock.unlock();
        s
    }

    pub fn cache_stats(&self) -> BackingStats {
        self.lock.lock();
        let s = unsafe { &*self.core.get() }.cache.stats();
        self.lock.unlock();
        s
    }

    pub fn region_stats(&self) -> BackingStats {
        self.lock.lock();
        let s = unsafe { &*self.core.get() }.regions.stats();
        self.lock.unlock();
        s
    }

    pub fn lifetime_region_stats(&self) -> Option<BackingStats> {
        self.lock.lock();
        let s = unsafe { &*self.core.get() }.lifetime.region_stats();
        self.lock.unlock();
        s
    }

    pub fn n_regions(&self) -> usize {
        self.lock.lock();
        let v = unsafe { &*self.core.get() }.regions.n_regions();
        self.lock.unlock();
        v
    }

    /// Print the report; `everything` adds per-tier internals and age
    /// histograms.
    pub fn print(&self, out: &mut Printer, everything: bool) {
        let now = self.fwd.now_nanos();
        self.lock.lock();
        unsafe { &*self.core.get() }.print(out, everything, &self.fwd, now);
        self.lock.unlock();
    }

    /// `print` with everything included.
    pub fn print_all(&self, out: &mut Printer) {
        self.print(out, true);
    }

    pub fn print_in_pbtxt(&self, region: &mut PbtxtRegion<'_>) {
        self.lock.lock();
        unsafe { &*self.core.get() }.print_in_pbtxt(region, &self.fwd);
        self.lock.unlock();
    }
}
