//! Multi-huge-page arenas.
//!
//! A region spans allocations across consecutive huge pages, trading perfect
//! huge-page packing for bounded slack: it is used when direct huge-page
//! allocation would strand too much tail space. Backing is tracked per huge
//! page; fully-free backed huge pages can be released without giving up the
//! region's address space.

use crate::backend::MemoryModify;
use crate::bitmap::RunBitmap;
use crate::pages::{HugeLength, HugeRange, Length, PageId, PAGES_PER_HUGE_PAGE, PAGE_SIZE};
use crate::platform::abort_with_message;
use crate::stats::{
    BackingStats, LargeSpanStats, PageAgeHistograms, Printer, SmallSpanStats, MAX_SMALL_SPAN_PAGES,
};

/// Region size: 16 huge pages (32 MiB).
pub const HUGE_PAGES_PER_REGION: usize = 16;
pub const REGION_PAGES: usize = HUGE_PAGES_PER_REGION * PAGES_PER_HUGE_PAGE;

const WORDS: usize = REGION_PAGES / 64;
const K: usize = PAGES_PER_HUGE_PAGE;

pub struct HugeRegion {
    location: HugeRange,
    /// Set bit = page is free.
    free: RunBitmap<WORDS>,
    backed: [bool; HUGE_PAGES_PER_REGION],
    used_pages: Length,
    birth_ns: u64,
}

impl HugeRegion {
    pub const fn size() -> HugeLength {
        HugeLength::new(HUGE_PAGES_PER_REGION)
    }

    pub fn new(location: HugeRange, now_ns: u64) -> Self {
        debug_assert_eq!(location.len(), Self::size());
        HugeRegion {
            location,
            free: RunBitmap::all_set(),
            backed: [false; HUGE_PAGES_PER_REGION],
            used_pages: Length::ZERO,
            birth_ns: now_ns,
        }
    }

    #[inline]
    fn first_page(&self) -> PageId {
        self.location.start().first_page()
    }

    pub fn contains(&self, p: PageId) -> bool {
        let first = self.first_page();
        p >= first && (p - first).raw() < REGION_PAGES
    }

    pub fn longest_free_run(&self) -> Length {
        Length::new(self.free.longest_set_run())
    }

    /// Allocate `n` contiguous pages, first fit. The boolean is true when
    /// the run touches a huge page that needs backing first.
    pub fn maybe_get(&mut self, n: Length) -> Option<(PageId, bool)> {
        let start = self.free.find_set_run(n.raw())?;
        self.free.clear_range(start, n.raw());
        self.used_pages += n;

        let hp_lo = start / K;
        let hp_hi = (start + n.raw() - 1) / K;
        let mut from_released = false;
        for hp in hp_lo..=hp_hi {
            if !self.backed[hp] {
                from_released = true;
                self.backed[hp] = true;
            }
        }
        Some((self.first_page() + Length::new(start), from_released))
    }

    /// Return `[p, p+n)`; the caller has checked `contains(p)`.
    pub fn put(&mut self, p: PageId, n: Length) {
        let start = (p - self.first_page()).raw();
        if start + n.raw() > REGION_PAGES {
            abort_with_message("hpalloc: region put crosses region boundary\n");
        }
        self.free.set_range(start, n.raw());
        self.used_pages -= n;
    }

    /// Unback every backed huge page whose pages are all free.
    pub fn release_pages(&mut self, unback: &dyn MemoryModify) -> Length {
        let mut released = Length::ZERO;
        for hp in 0..HUGE_PAGES_PER_REGION {
            if !self.backed[hp] || self.free.count_range(hp * K, K) != K {
                continue;
            }
            let addr = (self.location.start() + HugeLength::new(hp)).address();
            if unback.unback(addr, K * PAGE_SIZE) {
                self.backed[hp] = false;
                released += Length::new(K);
            }
        }
        released
    }

    pub fn used_pages(&self) -> Length {
        self.used_pages
    }

    /// (backed free pages, unbacked free pages)
    fn free_split(&self) -> (Length, Length) {
        let mut backed = 0;
        let mut unbacked = 0;
        for hp in 0..HUGE_PAGES_PER_REGION {
            let free = self.free.count_range(hp * K, K);
            if self.backed[hp] {
                backed += free;
            } else {
                unbacked += free;
            }
        }
        (Length::new(backed), Length::new(unbacked))
    }

    pub fn stats(&self) -> BackingStats {
        let (backed, unbacked) = self.free_split();
        BackingStats {
            system_bytes: Self::size().in_bytes(),
            free_bytes: backed.in_bytes(),
            unmapped_bytes: unbacked.in_bytes(),
        }
    }

    pub fn add_span_stats(&self, small: &mut SmallSpanStats, large: &mut LargeSpanStats) {
        // Split each free run into segments of uniform backedness.
        for (start, len) in self.free.set_runs() {
            let mut s = start;
            let end = start + len;
            while s < end {
                let backed = self.backed[s / K];
                let mut e = s;
                while e < end && self.backed[e / K] == backed {
                    e += 1;
                }
                let seg = Length::new(e - s);
                if seg.raw() < MAX_SMALL_SPAN_PAGES {
                    small.record(seg, !backed);
                } else {
                    large.record(seg, !backed);
                }
                s = e;
            }
        }
    }

    pub fn collect_ages(&self, ages: &mut PageAgeHistograms) {
        ages.record(Length::new(self.free.set_count()), self.birth_ns);
    }
}

/// The set of regions, plus the policy bit that raises region propensity.
pub struct HugeRegionSet {
    regions: Vec<HugeRegion>,
    use_huge_region_more_often: bool,
}

impl HugeRegionSet {
    pub fn new(use_huge_region_more_often: bool) -> Self {
        HugeRegionSet {
            regions: Vec::new(),
            use_huge_region_more_often,
        }
    }

    #[inline]
    pub fn use_huge_region_more_often(&self) -> bool {
        self.use_huge_region_more_often
    }

    pub fn n_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn contribute(&mut self, region: HugeRegion) {
        self.regions.push(region);
    }

    /// Best fit across regions: the region with the smallest sufficient
    /// longest free run.
    pub fn maybe_get(&mut self, n: Length) -> Option<(PageId, bool)> {
        let idx = self
            .regions
            .iter()
            .enumerate()
            .filter(|(_, r)| r.longest_free_run() >= n)
            .min_by_key(|(_, r)| r.longest_free_run())
            .map(|(i, _)| i)?;
        self.regions[idx].maybe_get(n)
    }

    /// Return pages if some region owns them.
    pub fn maybe_put(&mut self, p: PageId, n: Length) -> bool {
        for r in self.regions.iter_mut() {
            if r.contains(p) {
                r.put(p, n);
                return true;
            }
        }
        false
    }

    /// Release all fully-free backed huge pages in all regions.
    pub fn release_pages(&mut self, unback: &dyn MemoryModify) -> Length {
        let mut released = Length::ZERO;
        for r in self.regions.iter_mut() {
            released += r.release_pages(unback);
        }
        released
    }

    pub fn stats(&self) -> BackingStats {
        let mut s = BackingStats::default();
        for r in &self.regions {
            s += r.stats();
        }
        s
    }

    pub fn add_span_stats(&self, small: &mut SmallSpanStats, large: &mut LargeSpanStats) {
        for r in &self.regions {
            r.add_span_stats(small, large);
        }
    }

    pub fn collect_ages(&self, ages: &mut PageAgeHistograms) {
        for r in &self.regions {
            r.collect_ages(ages);
        }
    }

    pub fn print(&self, out: &mut Printer) {
        use core::fmt::Write as _;
        let _ = writeln!(
            out,
            "HugeRegionSet: {} regions of {} huge pages each",
            self.regions.len(),
            HUGE_PAGES_PER_REGION
        );
        for (i, r) in self.regions.iter().enumerate() {
            let (backed, unbacked) = r.free_split();
            let _ = writeln!(
                out,
                "HugeRegionSet: region {} used {} / free {} / unbacked-free {} pages",
                i,
                r.used_pages().raw(),
                backed.raw(),
                unbacked.raw()
            );
        }
    }
}
