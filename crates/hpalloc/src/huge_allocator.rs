//! Bottom tier: tracks address space reserved from the OS.
//!
//! Keeps an address-ordered free list of whole-huge-page ranges. Reserves
//! fresh aligned ranges on miss and never returns anything to the OS itself;
//! committing and releasing physical pages is the cache's business.

use std::collections::BTreeMap;

use crate::backend::{Forwarder, MemoryTag};
use crate::pages::{HugeLength, HugePage, HugeRange, HUGE_PAGE_SIZE};
use crate::stats::{BackingStats, LargeSpanStats, Printer, SmallSpanStats};

pub struct HugeAllocator {
    tag: MemoryTag,
    /// start huge page index -> run length, address-ordered.
    free: BTreeMap<usize, HugeLength>,
    free_total: HugeLength,
    reserved_bytes: usize,
}

impl HugeAllocator {
    pub fn new(tag: MemoryTag) -> Self {
        HugeAllocator {
            tag,
            free: BTreeMap::new(),
            free_total: HugeLength::ZERO,
            reserved_bytes: 0,
        }
    }

    /// Insert a free range, coalescing with address-adjacent neighbors so
    /// the list stays made of maximal runs.
    fn insert_free(&mut self, mut start: usize, mut len: HugeLength) {
        self.free_total += len;
        let prev = self.free.range(..start).next_back().map(|(&s, &l)| (s, l));
        if let Some((prev_start, prev_len)) = prev {
            if prev_start + prev_len.raw() == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        let end = start + len.raw();
        if let Some(next_len) = self.free.get(&end).copied() {
            self.free.remove(&end);
            len += next_len;
        }
        self.free.insert(start, len);
    }

    /// Get a range of exactly `n` huge pages. Prefers an exact-length free
    /// range, then splits the lowest-addressed larger one, then reserves
    /// fresh address space.
    pub fn get<F: Forwarder>(&mut self, n: HugeLength, fwd: &F) -> Option<HugeRange> {
        debug_assert!(!n.is_zero());

        if let Some((&start, _)) = self.free.iter().find(|&(_, &len)| len == n) {
            self.free.remove(&start);
            self.free_total -= n;
            return Some(HugeRange::new(HugePage::new(start), n));
        }

        if let Some((&start, &len)) = self.free.iter().find(|&(_, &len)| len > n) {
            self.free.remove(&start);
            self.free_total -= len;
            self.insert_free(start + n.raw(), len - n);
            return Some(HugeRange::new(HugePage::new(start), n));
        }

        let range = fwd.allocate(n.in_bytes(), HUGE_PAGE_SIZE, self.tag)?;
        debug_assert_eq!(range.ptr % HUGE_PAGE_SIZE, 0);
        self.reserved_bytes += range.bytes;
        let start = HugePage::from_address(range.ptr);
        log::debug!(
            "hpalloc: reserved {} fresh huge pages at {:#x}",
            range.bytes / HUGE_PAGE_SIZE,
            range.ptr
        );
        // The forwarder may round up; keep the excess on the free list.
        let got = HugeLength::new(range.bytes / HUGE_PAGE_SIZE);
        if got > n {
            self.insert_free((start + n).raw(), got - n);
        }
        Some(HugeRange::new(start, n))
    }

    pub fn stats(&self) -> BackingStats {
        BackingStats {
            system_bytes: self.reserved_bytes,
            free_bytes: 0,
            // Fresh reservations are address space only; nothing on the free
            // list has ever been touched through this tier.
            unmapped_bytes: self.free_total.in_bytes(),
        }
    }

    pub fn add_span_stats(&self, _small: &mut SmallSpanStats, large: &mut LargeSpanStats) {
        for (_, &len) in self.free.iter() {
            large.record(len.in_pages(), true);
        }
    }

    pub fn print(&self, out: &mut Printer) {
        use core::fmt::Write as _;
        let _ = writeln!(
            out,
            "HugeAllocator: {} MiB reserved, {} huge pages in {} free ranges",
            self.reserved_bytes >> 20,
            self.free_total.raw(),
            self.free.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockForwarder;
    use crate::pages::Length;

    #[test]
    fn reserves_exactly_what_is_asked() {
        let fwd = MockForwarder::new();
        let mut alloc = HugeAllocator::new(MemoryTag::Normal);
        let r = alloc.get(HugeLength::new(2), &fwd).unwrap();
        assert_eq!(r.len(), HugeLength::new(2));
        assert_eq!(alloc.stats().system_bytes, 2 * HUGE_PAGE_SIZE);
        assert_eq!(alloc.stats().unmapped_bytes, 0);
    }

    #[test]
    fn exact_match_is_preferred_over_split() {
        let fwd = MockForwarder::new();
        let mut alloc = HugeAllocator::new(MemoryTag::Normal);

        // Seed the free list with a 3-range and a 1-range by splitting.
        let a = alloc.get(HugeLength::new(4), &fwd).unwrap();
        let _hold = alloc.get(HugeLength::new(1), &fwd).unwrap();
        // Manufacture free ranges: 3 then 1 (address order puts 3 first).
        alloc.free.insert(a.start().raw(), HugeLength::new(3));
        alloc.free.insert(a.start().raw() + 3, HugeLength::new(1));
        alloc.free_total = HugeLength::new(4);

        // Exact match of 1 must pick the 1-range, not split the 3-range.
        let got = alloc.get(HugeLength::new(1), &fwd).unwrap();
        assert_eq!(got.start().raw(), a.start().raw() + 3);
        assert_eq!(alloc.free.get(&a.start().raw()), Some(&HugeLength::new(3)));
    }

    #[test]
    fn splits_lowest_address_first() {
        let fwd = MockForwarder::new();
        let mut alloc = HugeAllocator::new(MemoryTag::Normal);
        let a = alloc.get(HugeLength::new(8), &fwd).unwrap();
        alloc.free.insert(a.start().raw(), HugeLength::new(8));
        alloc.free_total = HugeLength::new(8);

        let got = alloc.get(HugeLength::new(3), &fwd).unwrap();
        assert_eq!(got.start(), a.start());
        assert_eq!(got.len(), HugeLength::new(3));
        assert_eq!(
            alloc.free.get(&(a.start().raw() + 3)),
            Some(&HugeLength::new(5))
        );
        assert_eq!(alloc.free_total, HugeLength::new(5));
        // No fresh reservation happened.
        assert_eq!(alloc.stats().system_bytes, 8 * HUGE_PAGE_SIZE);
    }

    #[test]
    fn adjacent_free_ranges_coalesce() {
        let fwd = MockForwarder::new();
        let mut alloc = HugeAllocator::new(MemoryTag::Normal);
        let a = alloc.get(HugeLength::new(6), &fwd).unwrap();
        let s = a.start().raw();

        // Hand back three adjacent pieces, middle first: they must merge
        // into a single maximal run.
        alloc.insert_free(s + 2, HugeLength::new(2));
        alloc.insert_free(s, HugeLength::new(2));
        alloc.insert_free(s + 4, HugeLength::new(2));
        assert_eq!(alloc.free.len(), 1);
        assert_eq!(alloc.free.get(&s), Some(&HugeLength::new(6)));
        assert_eq!(alloc.free_total, HugeLength::new(6));

        // An exact get of the merged length takes the whole run back.
        let r = alloc.get(HugeLength::new(6), &fwd).unwrap();
        assert_eq!(r.start().raw(), s);
        assert!(alloc.free.is_empty());
        assert_eq!(alloc.free_total, HugeLength::ZERO);
        // No fresh reservation was needed.
        assert_eq!(alloc.stats().system_bytes, 6 * HUGE_PAGE_SIZE);
    }

    #[test]
    fn non_adjacent_free_ranges_stay_separate() {
        let fwd = MockForwarder::new();
        let mut alloc = HugeAllocator::new(MemoryTag::Normal);
        let a = alloc.get(HugeLength::new(5), &fwd).unwrap();
        let s = a.start().raw();

        alloc.insert_free(s, HugeLength::new(2));
        alloc.insert_free(s + 3, HugeLength::new(2));
        assert_eq!(alloc.free.len(), 2, "a one-huge-page gap prevents merging");
        assert_eq!(alloc.free_total, HugeLength::new(4));
    }

    #[test]
    fn span_stats_report_free_ranges_as_returned() {
        let fwd = MockForwarder::new();
        let mut alloc = HugeAllocator::new(MemoryTag::Normal);
        let a = alloc.get(HugeLength::new(2), &fwd).unwrap();
        alloc.free.insert(a.start().raw(), HugeLength::new(2));
        alloc.free_total = HugeLength::new(2);

        let mut small = SmallSpanStats::new();
        let mut large = LargeSpanStats::default();
        alloc.add_span_stats(&mut small, &mut large);
        assert_eq!(large.spans, 1);
        assert_eq!(large.returned_pages, Length::new(512));
    }
}
