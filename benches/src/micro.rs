/// Microbenchmarks for the page-level placement engine.
///
/// Runs against the mock forwarder, so the numbers measure pure bookkeeping
/// (pool selection, bitmaps, page map) without OS noise. Sizes are in pages
/// (8 KiB each).

use std::hint::black_box;
use std::time::Instant;

use hpalloc::{HugePageAwareAllocator, Length, MemoryTag, MockForwarder, Options};

fn hpaa() -> HugePageAwareAllocator<MockForwarder> {
    HugePageAwareAllocator::new(
        MockForwarder::new(),
        Options {
            tag: MemoryTag::Normal,
            use_huge_region_more_often: false,
            separate_allocs_for_few_and_many_objects_spans: false,
        },
    )
}

/// Allocate/deallocate latency for a fixed span size.
fn bench_alloc_free(pages: usize, iterations: usize) -> f64 {
    let a = hpaa();
    // Warmup populates the filler and cache.
    for _ in 0..1000 {
        let s = a.allocate(black_box(Length::new(pages)), 1).unwrap();
        a.deallocate(black_box(s), 1);
    }
    let start = Instant::now();
    for _ in 0..iterations {
        let s = a.allocate(black_box(Length::new(pages)), 1).unwrap();
        a.deallocate(black_box(s), 1);
    }
    start.elapsed().as_nanos() as f64 / iterations as f64
}

/// Steady-state packing: many live small spans, FIFO replacement.
fn bench_packed_churn(pages: usize, live: usize, iterations: usize) -> f64 {
    let a = hpaa();
    let mut spans: std::collections::VecDeque<_> = (0..live)
        .map(|_| a.allocate(Length::new(pages), 1).unwrap())
        .collect();
    let start = Instant::now();
    for _ in 0..iterations {
        let old = spans.pop_front().unwrap();
        a.deallocate(black_box(old), 1);
        spans.push_back(a.allocate(black_box(Length::new(pages)), 1).unwrap());
    }
    let elapsed = start.elapsed().as_nanos() as f64 / iterations as f64;
    for s in spans {
        a.deallocate(s, 1);
    }
    elapsed
}

/// Release path cost with a populated cache.
fn bench_release(iterations: usize) -> f64 {
    let a = hpaa();
    let start = Instant::now();
    for _ in 0..iterations {
        let s = a.allocate(Length::new(256), 1).unwrap();
        a.deallocate(s, 1);
        black_box(a.release_at_least_n_pages(Length::new(256)));
    }
    start.elapsed().as_nanos() as f64 / iterations as f64
}

fn main() {
    const ITERS: usize = 100_000;

    println!("hpalloc microbenchmarks ({} iterations each)", ITERS);
    for pages in [1, 4, 32, 128, 300, 1000] {
        println!(
            "alloc/free {:5} pages: {:8.1} ns/op",
            pages,
            bench_alloc_free(pages, ITERS)
        );
    }
    for (pages, live) in [(1, 1024), (8, 512), (100, 64)] {
        println!(
            "churn {:3} pages x {:4} live: {:8.1} ns/op",
            pages,
            live,
            bench_packed_churn(pages, live, ITERS)
        );
    }
    println!("release round trip: {:8.1} ns/op", bench_release(10_000));
}
