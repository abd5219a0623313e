//! Hot cache of whole huge-page ranges.
//!
//! Freed ranges land here backed; a bounded amount stays backed so the next
//! burst of demand skips the OS entirely. Subrelease converts backed entries
//! to unbacked oldest-first (ties broken by size, largest first); unbacked
//! entries keep their address space and are handed out with a "back me
//! first" flag.
//!
//! Unbacking is a slow OS call, so it happens in two phases: the owner
//! extracts the victim entries (removing them from the cache makes them
//! unreachable to concurrent gets), performs the calls with the page-heap
//! lock dropped, then reinserts the entries with their new backing state.

use crate::backend::Forwarder;
use crate::huge_allocator::HugeAllocator;
use crate::pages::{HugeLength, HugeRange};
use crate::stats::{BackingStats, LargeSpanStats, PageAgeHistograms, Printer, SmallSpanStats};

/// Bound on backed bytes held: 512 huge pages (1 GiB).
const CACHE_LIMIT: HugeLength = HugeLength::new(512);

#[derive(Clone, Copy, Debug)]
pub struct CacheEntry {
    range: HugeRange,
    backed: bool,
    since_ns: u64,
}

impl CacheEntry {
    pub fn range(&self) -> HugeRange {
        self.range
    }

    pub fn backed(&self) -> bool {
        self.backed
    }
}

pub struct HugeCache {
    entries: Vec<CacheEntry>,
    /// Huge pages currently out on loan (gotten, not yet released back).
    usage: HugeLength,
    limit: HugeLength,
    hits: u64,
    misses: u64,
}

impl HugeCache {
    pub fn new() -> Self {
        HugeCache {
            entries: Vec::new(),
            usage: HugeLength::ZERO,
            limit: CACHE_LIMIT,
            hits: 0,
            misses: 0,
        }
    }

    fn backed_total(&self) -> HugeLength {
        self.entries
            .iter()
            .filter(|e| e.backed)
            .fold(HugeLength::ZERO, |acc, e| acc + e.range.len())
    }

    fn unbacked_total(&self) -> HugeLength {
        self.entries
            .iter()
            .filter(|e| !e.backed)
            .fold(HugeLength::ZERO, |acc, e| acc + e.range.len())
    }

    /// Index of the best candidate of the wanted backing class: exact length
    /// preferred (oldest first), otherwise the smallest larger range (oldest
    /// on ties).
    fn pick(&self, n: HugeLength, backed: bool) -> Option<usize> {
        let mut exact: Option<usize> = None;
        let mut larger: Option<usize> = None;
        for (i, e) in self.entries.iter().enumerate() {
            if e.backed != backed {
                continue;
            }
            if e.range.len() == n {
                let better = match exact {
                    None => true,
                    Some(j) => e.since_ns < self.entries[j].since_ns,
                };
                if better {
                    exact = Some(i);
                }
            } else if e.range.len() > n {
                let better = match larger {
                    None => true,
                    Some(j) => {
                        let cur = &self.entries[j];
                        (e.range.len(), e.since_ns) < (cur.range.len(), cur.since_ns)
                    }
                };
                if better {
                    larger = Some(i);
                }
            }
        }
        exact.or(larger)
    }

    fn take(&mut self, idx: usize, n: HugeLength) -> HugeRange {
        let e = self.entries.swap_remove(idx);
        if e.range.len() > n {
            // Split: keep the tail cached with its class and age.
            self.entries.push(CacheEntry {
                range: HugeRange::new(e.range.start() + n, e.range.len() - n),
                backed: e.backed,
                since_ns: e.since_ns,
            });
        }
        HugeRange::new(e.range.start(), n)
    }

    /// Get `n` huge pages. The boolean is true when the range needs backing
    /// before use (it was unbacked in the cache or freshly reserved).
    pub fn get<F: Forwarder>(
        &mut self,
        n: HugeLength,
        fwd: &F,
        alloc: &mut HugeAllocator,
    ) -> Option<(HugeRange, bool)> {
        if let Some(idx) = self.pick(n, true) {
            self.hits += 1;
            self.usage += n;
            return Some((self.take(idx, n), false));
        }
        if let Some(idx) = self.pick(n, false) {
            self.hits += 1;
            self.usage += n;
            return Some((self.take(idx, n), true));
        }
        self.misses += 1;
        let r = alloc.get(n, fwd)?;
        self.usage += n;
        Some((r, true))
    }

    /// Return a backed range to the cache.
    pub fn release(&mut self, r: HugeRange, now_ns: u64) {
        self.usage -= r.len();
        self.entries.push(CacheEntry {
            range: r,
            backed: true,
            since_ns: now_ns,
        });
    }

    /// Return an unbacked range to the cache.
    pub fn release_unbacked(&mut self, r: HugeRange, now_ns: u64) {
        self.usage -= r.len();
        self.entries.push(CacheEntry {
            range: r,
            backed: false,
            since_ns: now_ns,
        });
    }

    /// Victim selection shared by subrelease and the bound: oldest backed
    /// entry, largest on ties.
    fn victim(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, e) in self.entries.iter().enumerate() {
            if !e.backed {
                continue;
            }
            let better = match best {
                None => true,
                Some(j) => {
                    let cur = &self.entries[j];
                    (e.since_ns, core::cmp::Reverse(e.range.len()))
                        < (cur.since_ns, core::cmp::Reverse(cur.range.len()))
                }
            };
            if better {
                best = Some(i);
            }
        }
        best
    }

    /// Remove backed entries to be unbacked until at least `n` huge pages
    /// are covered (or no backed entries remain). The removed entries are
    /// owned by the caller until `finish_subrelease`.
    pub fn extract_for_subrelease(&mut self, n: HugeLength) -> Vec<CacheEntry> {
        let mut out = Vec::new();
        let mut covered = HugeLength::ZERO;
        while covered < n {
            let Some(idx) = self.victim() else { break };
            let e = self.entries.swap_remove(idx);
            covered += e.range.len();
            out.push(e);
        }
        out
    }

    /// Remove the oldest backed entries beyond the cache bound, to be
    /// unbacked by the caller.
    pub fn extract_overflow(&mut self) -> Vec<CacheEntry> {
        let mut out = Vec::new();
        while self.backed_total() > self.limit {
            let Some(idx) = self.victim() else { break };
            let e = self.entries.swap_remove(idx);
            log::debug!(
                "hpalloc: cache over limit, unbacking {} huge pages",
                e.range.len().raw()
            );
            out.push(e);
        }
        out
    }

    /// Reinsert entries extracted for unbacking. `results[i]` says whether
    /// the OS honored the release of `extracted[i]`; refused ranges stay
    /// backed. Returns the huge pages actually released.
    pub fn finish_subrelease(
        &mut self,
        extracted: Vec<CacheEntry>,
        results: &[bool],
    ) -> HugeLength {
        debug_assert_eq!(extracted.len(), results.len());
        let mut released = HugeLength::ZERO;
        for (mut e, &ok) in extracted.into_iter().zip(results) {
            if ok {
                released += e.range.len();
                e.backed = false;
            }
            self.entries.push(e);
        }
        released
    }

    pub fn stats(&self) -> BackingStats {
        let backed = self.backed_total();
        let unbacked = self.unbacked_total();
        BackingStats {
            system_bytes: (self.usage + backed + unbacked).in_bytes(),
            free_bytes: backed.in_bytes(),
            unmapped_bytes: unbacked.in_bytes(),
        }
    }

    pub fn add_span_stats(&self, _small: &mut SmallSpanStats, large: &mut LargeSpanStats) {
        for e in &self.entries {
            large.record(e.range.in_pages(), !e.backed);
        }
    }

    pub fn collect_ages(&self, ages: &mut PageAgeHistograms) {
        for e in &self.entries {
            ages.record(e.range.in_pages(), e.since_ns);
        }
    }

    pub fn print(&self, out: &mut Printer) {
        use core::fmt::Write as _;
        let _ = writeln!(
            out,
            "HugeCache: {} ranges ({} backed huge pages, {} unbacked), {} loaned, {} hits, {} misses",
            self.entries.len(),
            self.backed_total().raw(),
            self.unbacked_total().raw(),
            self.usage.raw(),
            self.hits,
            self.misses
        );
    }
}

impl Default for HugeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryTag, MockForwarder};
    use crate::pages::HugePage;

    fn range(start: usize, len: usize) -> HugeRange {
        HugeRange::new(HugePage::new(start), HugeLength::new(len))
    }

    #[test]
    fn prefers_backed_exact_then_backed_larger_then_unbacked() {
        let fwd = MockForwarder::new();
        let mut alloc = HugeAllocator::new(MemoryTag::Normal);
        let mut cache = HugeCache::new();

        // Seed: pretend three ranges were loaned out and returned.
        cache.usage = HugeLength::new(6);
        cache.release(range(100, 3), 0);
        cache.release(range(200, 1), 1);
        cache.release_unbacked(range(300, 2), 2);

        // Exact backed beats larger backed.
        let (r, needs_back) = cache.get(HugeLength::new(1), &fwd, &mut alloc).unwrap();
        assert_eq!(r.start(), HugePage::new(200));
        assert!(!needs_back);

        // Larger backed is split.
        let (r, needs_back) = cache.get(HugeLength::new(2), &fwd, &mut alloc).unwrap();
        assert_eq!(r.start(), HugePage::new(100));
        assert!(!needs_back);

        // Remaining backed tail (102,1) serves an exact 1.
        let (r, _) = cache.get(HugeLength::new(1), &fwd, &mut alloc).unwrap();
        assert_eq!(r.start(), HugePage::new(102));

        // Only the unbacked range is left; it needs backing.
        let (r, needs_back) = cache.get(HugeLength::new(2), &fwd, &mut alloc).unwrap();
        assert_eq!(r.start(), HugePage::new(300));
        assert!(needs_back);

        // Nothing cached: falls through to the allocator.
        let (_, needs_back) = cache.get(HugeLength::new(1), &fwd, &mut alloc).unwrap();
        assert!(needs_back);
    }

    #[test]
    fn subrelease_is_oldest_first_largest_on_ties() {
        let mut cache = HugeCache::new();
        cache.usage = HugeLength::new(6);
        cache.release(range(10, 1), 5);
        cache.release(range(20, 2), 1); // oldest, tie on time with below
        cache.release(range(30, 3), 1); // same age, larger: wins the tie
        let extracted = cache.extract_for_subrelease(HugeLength::new(4));
        let starts: Vec<usize> = extracted.iter().map(|e| e.range.start().raw()).collect();
        assert_eq!(starts, vec![30, 20]);

        let released = cache.finish_subrelease(extracted, &[true, false]);
        assert_eq!(released, HugeLength::new(3));
        // The refused range is still backed and still cached.
        assert_eq!(cache.backed_total(), HugeLength::new(3));
        assert_eq!(cache.unbacked_total(), HugeLength::new(3));
    }

    #[test]
    fn stats_account_loaned_and_held() {
        let fwd = MockForwarder::new();
        let mut alloc = HugeAllocator::new(MemoryTag::Normal);
        let mut cache = HugeCache::new();

        let (r, _) = cache.get(HugeLength::new(2), &fwd, &mut alloc).unwrap();
        let s = cache.stats();
        assert_eq!(s.system_bytes, 2 * crate::pages::HUGE_PAGE_SIZE);
        assert_eq!(s.free_bytes, 0);

        cache.release(r, 0);
        let s = cache.stats();
        assert_eq!(s.system_bytes, 2 * crate::pages::HUGE_PAGE_SIZE);
        assert_eq!(s.free_bytes, 2 * crate::pages::HUGE_PAGE_SIZE);
        assert_eq!(s.unmapped_bytes, 0);
    }
}
