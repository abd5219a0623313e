//! End-to-end placement scenarios against the mock forwarder.
//!
//! Each test starts from a fresh allocator with 8 KiB pages and 256-page
//! (2 MiB) huge pages and drives the public API only, checking the
//! observable accounting: per-tier stats, donation and abandonment counters,
//! and the release/back calls recorded by the mock.

use std::time::Duration;

use hpalloc::pages::{PAGES_PER_HUGE_PAGE, PAGE_SIZE};
use hpalloc::stats::Printer;
use hpalloc::{
    HugePage, HugePageAwareAllocator, Length, LifetimePredictionOptions, MemoryTag, MockForwarder,
    Options, Span,
};

const K: usize = PAGES_PER_HUGE_PAGE;
const HP_BYTES: usize = K * PAGE_SIZE;

fn options() -> Options {
    Options {
        tag: MemoryTag::Normal,
        use_huge_region_more_often: false,
        separate_allocs_for_few_and_many_objects_spans: false,
    }
}

fn hpaa() -> HugePageAwareAllocator<MockForwarder> {
    HugePageAwareAllocator::new(MockForwarder::new(), options())
}

fn pages(n: usize) -> Length {
    Length::new(n)
}

/// used + free + unmapped must always equal system.
fn check_sum_invariant(a: &HugePageAwareAllocator<MockForwarder>) {
    let s = a.stats();
    assert_eq!(
        s.used_bytes() + s.free_bytes + s.unmapped_bytes,
        s.system_bytes,
        "stats do not sum to system: {s:?}"
    );
    assert_eq!(
        s.system_bytes,
        a.forwarder().reserved_bytes(),
        "system bytes must equal the OS reservation"
    );
}

// ---------------------------------------------------------------------------
// S1: a one-page span packs into a single huge page
// ---------------------------------------------------------------------------

#[test]
fn small_alloc_fits_in_filler() {
    let a = hpaa();
    let s1 = a.allocate(pages(1), 1).unwrap();

    let st = a.stats();
    assert_eq!(st.used_bytes(), PAGE_SIZE);
    assert_eq!(st.free_bytes, (K - 1) * PAGE_SIZE);
    assert_eq!(st.system_bytes, HP_BYTES);
    assert_eq!(a.donated_huge_pages().raw(), 0);
    check_sum_invariant(&a);

    a.deallocate(s1, 1);
    let st = a.stats();
    assert_eq!(st.used_bytes(), 0);
    // The whole huge page went back to the cache, backed.
    assert_eq!(a.filler_stats().system_bytes, 0);
    assert_eq!(a.cache_stats().free_bytes, HP_BYTES);
    check_sum_invariant(&a);
}

// ---------------------------------------------------------------------------
// S2: an exact huge page bypasses the filler entirely
// ---------------------------------------------------------------------------

#[test]
fn exact_huge_page_creates_no_tracker() {
    let a = hpaa();
    let s = a.allocate(pages(K), 1).unwrap();
    assert_eq!(s.num_pages(), pages(K));
    assert!(!s.donated());
    assert_eq!(a.donated_huge_pages().raw(), 0);
    assert_eq!(a.filler_stats().system_bytes, 0, "no tracker created");
    check_sum_invariant(&a);

    a.deallocate(s, 1);
    assert_eq!(a.cache_stats().free_bytes, HP_BYTES);
    assert_eq!(a.stats().used_bytes(), 0);
    check_sum_invariant(&a);
}

// ---------------------------------------------------------------------------
// S3: donated slack, abandonment, reassembly
// ---------------------------------------------------------------------------

#[test]
fn donated_slack_lifecycle() {
    let a = hpaa();

    // 300 pages = 2 huge pages with 212 pages of slack donated to the filler.
    let s300 = a.allocate(pages(300), 1).unwrap();
    assert!(s300.donated());
    assert_eq!(a.donated_huge_pages().raw(), 1);
    assert_eq!(a.abandoned_pages().raw(), 0);
    let fstats = a.filler_stats();
    assert_eq!(fstats.system_bytes, HP_BYTES, "one donated tracker");
    assert_eq!(fstats.used_bytes(), 44 * PAGE_SIZE);
    assert_eq!(fstats.free_bytes, 212 * PAGE_SIZE);
    check_sum_invariant(&a);

    // A small allocation must land in the donated tail.
    let s10 = a.allocate(pages(10), 1).unwrap();
    assert_eq!(
        s10.first_page(),
        s300.first_page() + pages(300),
        "small span should start right after the donor inside the tail"
    );
    assert_eq!(a.stats().system_bytes, 2 * HP_BYTES, "no new huge page");

    // Freeing the donor strands the donated portion: abandonment.
    a.deallocate(s300, 1);
    assert_eq!(a.donated_huge_pages().raw(), 1, "tail not reassembled yet");
    assert_eq!(a.abandoned_pages().raw(), 44);
    check_sum_invariant(&a);

    // Freeing the straggler reassembles the huge page.
    a.deallocate(s10, 1);
    assert_eq!(a.donated_huge_pages().raw(), 0);
    assert_eq!(a.abandoned_pages().raw(), 0);
    assert_eq!(a.stats().used_bytes(), 0);
    check_sum_invariant(&a);
}

// ---------------------------------------------------------------------------
// S4: sustained slack pushes large allocations into regions
// ---------------------------------------------------------------------------

#[test]
fn slack_pressure_routes_to_region() {
    let a = HugePageAwareAllocator::new(
        MockForwarder::new(),
        Options {
            use_huge_region_more_often: true,
            ..options()
        },
    );

    // Each 300-page allocation leaves 212 pages of pending slack. The region
    // path opens once donated slack reaches 64 MiB = 8192 pages: 39 * 212 =
    // 8268.
    let mut spans: Vec<Span> = Vec::new();
    for _ in 0..39 {
        spans.push(a.allocate(pages(300), 1).unwrap());
    }
    assert_eq!(a.n_regions(), 0);
    let donated_before = a.donated_huge_pages();

    let in_region = a.allocate(pages(300), 1).unwrap();
    assert_eq!(a.n_regions(), 1, "allocation must route through a region");
    assert_eq!(
        a.donated_huge_pages(),
        donated_before,
        "region placement donates nothing"
    );
    assert!(!in_region.donated());
    assert_eq!(a.region_stats().used_bytes(), 300 * PAGE_SIZE);
    check_sum_invariant(&a);

    // With the policy bit set, freeing the region span lets the release path
    // reclaim the region's huge pages.
    a.deallocate(in_region, 1);
    let released = a.release_at_least_n_pages(pages(1));
    assert!(released >= pages(256));
    check_sum_invariant(&a);

    for s in spans {
        a.deallocate(s, 1);
    }
    assert_eq!(a.stats().used_bytes(), 0);
    assert_eq!(a.abandoned_pages().raw(), 0);
    check_sum_invariant(&a);
}

// ---------------------------------------------------------------------------
// S5: subrelease round trip through the cache
// ---------------------------------------------------------------------------

#[test]
fn subrelease_round_trip() {
    let a = hpaa();

    let spans: Vec<Span> = (0..K).map(|_| a.allocate(pages(1), 1).unwrap()).collect();
    assert_eq!(a.filler_stats().system_bytes, HP_BYTES);
    assert_eq!(a.stats().used_bytes(), HP_BYTES);

    for s in spans {
        a.deallocate(s, 1);
    }
    // Tracker emptied; the huge page is backed in the cache.
    assert_eq!(a.filler_stats().system_bytes, 0);
    assert_eq!(a.cache_stats().free_bytes, HP_BYTES);

    let released = a.release_at_least_n_pages(pages(K));
    assert!(released >= pages(K));
    let st = a.stats();
    assert_eq!(st.unmapped_bytes, HP_BYTES);
    assert_eq!(a.forwarder().released_bytes(), HP_BYTES, "OS saw the release");
    check_sum_invariant(&a);

    // Reuse comes from released memory and is backed before return.
    let s = a.allocate(pages(1), 1).unwrap();
    assert!(
        a.forwarder()
            .backed_calls()
            .iter()
            .any(|&(p, l)| p == s.start_address() && l == s.bytes_in_span()),
        "span range must be backed before it is returned"
    );
    check_sum_invariant(&a);
    a.deallocate(s, 1);
}

// ---------------------------------------------------------------------------
// S6: aligned allocation bypasses the filler
// ---------------------------------------------------------------------------

#[test]
fn aligned_alloc_bypasses_filler() {
    let a = hpaa();

    // Seed the filler: it could trivially satisfy a 10-page request.
    let seed = a.allocate(pages(1), 1).unwrap();

    let s = a.allocate_aligned(pages(10), pages(K), 1).unwrap();
    assert_eq!(s.first_page().raw() % K, 0, "huge-page aligned");
    assert_ne!(
        HugePage::containing(s.first_page()),
        HugePage::containing(seed.first_page()),
        "must not come from the filler's huge page"
    );
    // The unused tail of its huge page was donated.
    assert!(s.donated());
    assert_eq!(a.donated_huge_pages().raw(), 1);
    check_sum_invariant(&a);

    a.deallocate(s, 1);
    assert_eq!(a.donated_huge_pages().raw(), 0);
    a.deallocate(seed, 1);
    assert_eq!(a.stats().used_bytes(), 0);
    check_sum_invariant(&a);
}

#[test]
fn aligned_alloc_with_unit_alignment_uses_filler() {
    let a = hpaa();
    let seed = a.allocate(pages(1), 1).unwrap();
    let s = a.allocate_aligned(pages(10), pages(1), 1).unwrap();
    assert_eq!(
        HugePage::containing(s.first_page()),
        HugePage::containing(seed.first_page()),
        "align <= 1 behaves exactly like allocate"
    );
    a.deallocate(s, 1);
    a.deallocate(seed, 1);
}

// ---------------------------------------------------------------------------
// Lifetime prediction end to end
// ---------------------------------------------------------------------------

#[test]
fn short_lived_large_allocs_move_to_lifetime_region() {
    let a = hpaa();
    a.forwarder().set_lifetime_options(LifetimePredictionOptions {
        enabled: true,
        short_lived_threshold: Duration::from_millis(500),
    });

    // First round trains the predictor through the donated-tail tracker.
    let s = a.allocate(pages(300), 7).unwrap();
    assert!(s.donated());
    a.forwarder().advance_clock(Duration::from_millis(1));
    a.deallocate(s, 7);
    assert!(a.lifetime_region_stats().is_none(), "no region yet");

    // Same request shape, now predicted short-lived.
    let s2 = a.allocate(pages(300), 7).unwrap();
    assert!(!s2.donated(), "lifetime region placement does not donate");
    let lstats = a.lifetime_region_stats().expect("lifetime region exists");
    assert_eq!(lstats.used_bytes(), 300 * PAGE_SIZE);
    check_sum_invariant(&a);

    a.deallocate(s2, 7);
    let lstats = a.lifetime_region_stats().unwrap();
    assert_eq!(lstats.used_bytes(), 0);
    check_sum_invariant(&a);
}

// ---------------------------------------------------------------------------
// Filler sub-pool segregation
// ---------------------------------------------------------------------------

#[test]
fn few_and_many_object_spans_get_separate_huge_pages() {
    let a = HugePageAwareAllocator::new(
        MockForwarder::new(),
        Options {
            separate_allocs_for_few_and_many_objects_spans: true,
            ..options()
        },
    );

    let few = a.allocate(pages(4), 1).unwrap();
    let many = a.allocate(pages(4), 1024).unwrap();
    assert_ne!(
        HugePage::containing(few.first_page()),
        HugePage::containing(many.first_page()),
        "sub-pools must not share huge pages"
    );
    assert_eq!(a.filler_stats().system_bytes, 2 * HP_BYTES);

    a.deallocate(few, 1);
    a.deallocate(many, 1024);
    assert_eq!(a.stats().used_bytes(), 0);
}

// ---------------------------------------------------------------------------
// Release edge cases
// ---------------------------------------------------------------------------

#[test]
fn refused_os_release_is_not_fatal() {
    let a = hpaa();
    let s = a.allocate(pages(1), 1).unwrap();
    a.deallocate(s, 1);
    assert_eq!(a.cache_stats().free_bytes, HP_BYTES);

    a.forwarder().set_honor_release(false);
    let released = a.release_at_least_n_pages(pages(K));
    assert_eq!(released, pages(0));
    // The range stays backed and stats reflect that.
    assert_eq!(a.cache_stats().free_bytes, HP_BYTES);
    assert_eq!(a.stats().unmapped_bytes, 0);
    check_sum_invariant(&a);

    a.forwarder().set_honor_release(true);
    assert!(a.release_at_least_n_pages(pages(K)) >= pages(K));
    check_sum_invariant(&a);
}

#[test]
fn emergency_release_breaks_huge_pages() {
    let a = hpaa();
    let s = a.allocate(pages(100), 1).unwrap();

    // The regular path defers to the spike guard; the emergency path never
    // does and releases from a still-used huge page.
    a.forwarder().set_skip_subrelease_intervals(hpalloc::SkipSubreleaseIntervals {
        peak_interval: Duration::from_secs(60),
        short_interval: Duration::from_secs(60),
        long_interval: Duration::from_secs(60),
    });
    let released = a.release_at_least_n_pages_breaking_hugepages(pages(50));
    assert_eq!(released, pages(K - 100));
    assert_eq!(a.filler_stats().unmapped_bytes, (K - 100) * PAGE_SIZE);
    check_sum_invariant(&a);

    // Reusing the released range backs it again.
    let s2 = a.allocate(pages(120), 1).unwrap();
    assert!(
        a.forwarder()
            .backed_calls()
            .iter()
            .any(|&(p, l)| p == s2.start_address() && l == s2.bytes_in_span())
    );
    a.deallocate(s2, 1);
    a.deallocate(s, 1);
    check_sum_invariant(&a);
}

#[test]
fn oom_propagates_as_none() {
    let a = hpaa();
    let s = a.allocate(pages(1), 1).unwrap();
    a.forwarder().set_fail_allocations(true);
    // The filler still has room for small requests...
    assert!(a.allocate(pages(2), 1).is_some());
    // ...but anything needing fresh huge pages fails cleanly.
    assert!(a.allocate(pages(K), 1).is_none());
    assert!(a.allocate(pages(K * 20), 1).is_none());
    a.forwarder().set_fail_allocations(false);
    a.deallocate(s, 1);
}

// ---------------------------------------------------------------------------
// Report output
// ---------------------------------------------------------------------------

#[test]
fn print_reports_tiers_and_parameters() {
    let a = hpaa();
    let s = a.allocate(pages(300), 1).unwrap();

    let mut out = Printer::new();
    a.print(&mut out, true);
    let text = out.as_str();
    assert!(text.contains("HugePageAware: breakdown of used / free / unmapped space:"));
    assert!(text.contains("HugePageAware: filler  "));
    assert!(text.contains("HugePageAware: cache   "));
    assert!(text.contains("HugePageAware: alloc   "));
    assert!(text.contains("MiB used,"));
    assert!(text.contains("HugePageAware: filler donations 1 (0 pages from abandoned donations)"));
    assert!(text.contains("PARAMETER use_huge_region_more_often 0"));
    assert!(text.contains("PARAMETER hpaa_subrelease 1"));

    let mut buf = String::new();
    {
        let mut root = hpalloc::stats::PbtxtRegion::new(&mut buf);
        a.print_in_pbtxt(&mut root);
    }
    assert!(buf.contains("huge_page_allocator {"));
    assert!(buf.contains("using_hpaa: true"));
    assert!(buf.contains("filler_donated_huge_pages: 1"));

    a.deallocate(s, 1);
}

#[test]
fn span_stats_see_filler_free_space() {
    let a = hpaa();
    let s = a.allocate(pages(10), 1).unwrap();

    let mut small = hpalloc::stats::SmallSpanStats::new();
    a.get_small_span_stats(&mut small);
    // 246 free pages in one run: too big for the small buckets.
    assert_eq!(small.normal_length.iter().sum::<usize>(), 0);

    let mut large = hpalloc::stats::LargeSpanStats::default();
    a.get_large_span_stats(&mut large);
    assert_eq!(large.spans, 1);
    assert_eq!(large.normal_pages, pages(K - 10));

    a.deallocate(s, 1);
}
