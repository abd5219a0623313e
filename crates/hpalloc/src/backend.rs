//! The capability interface between the placement engine and the process.
//!
//! The allocator core never calls the OS or reads global configuration
//! directly; everything goes through a [`Forwarder`]. Production wires
//! [`SystemForwarder`] (mmap + madvise + the env-configured parameter block),
//! tests and fuzzers wire [`MockForwarder`] (deterministic address space,
//! manual clock, recorded syscalls). The allocator is generic over the
//! forwarder, so there is no dynamic dispatch on the allocation path.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::config;
use crate::filler::SkipSubreleaseIntervals;
use crate::lifetime::LifetimePredictionOptions;
use crate::pages::{align_up, Length, HUGE_PAGE_SIZE};
use crate::platform;

/// Address-space partition an allocation belongs to. Tags keep differently
/// treated memory (normal, sampled, cold) in disjoint regions so a pointer's
/// tag can be recovered and verified on free.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum MemoryTag {
    #[default]
    Normal,
    Sampled,
    Cold,
}

impl MemoryTag {
    pub(crate) fn index(self) -> usize {
        match self {
            MemoryTag::Normal => 0,
            MemoryTag::Sampled => 1,
            MemoryTag::Cold => 2,
        }
    }
}

/// Base of the tag-partitioned address space; each tag gets a 4 TiB window.
const TAG_WINDOW_SHIFT: usize = 42;
const TAG_BASE: usize = 0x1000_0000_0000;

fn tag_window_base(tag: MemoryTag) -> usize {
    TAG_BASE + (tag.index() << TAG_WINDOW_SHIFT)
}

/// A raw reserved virtual range.
#[derive(Clone, Copy, Debug)]
pub struct AddressRange {
    pub ptr: usize,
    pub bytes: usize,
}

/// Unback hook handed to components that subrelease memory they own.
///
/// The cache's implementation drops the page-heap lock around the OS call;
/// the filler's and the regions' hold it. A `false` return means the OS
/// declined the hint and the range must be treated as still backed.
pub trait MemoryModify {
    #[must_use]
    fn unback(&self, ptr: usize, bytes: usize) -> bool;
}

/// Capabilities the placement engine needs from the process: virtual memory,
/// a clock, and the runtime parameter block.
pub trait Forwarder {
    /// Reserve `bytes` of address space aligned to `align` inside the tag's
    /// partition. Returns `None` when address space is exhausted.
    fn allocate(&self, bytes: usize, align: usize, tag: MemoryTag) -> Option<AddressRange>;

    /// Hint that `[ptr, ptr+len)` is unused; physical pages may be reclaimed.
    /// Returns whether the hint was honored. Never fatal.
    #[must_use]
    fn release(&self, ptr: usize, len: usize) -> bool;

    /// Ensure `[ptr, ptr+len)` is faulted in before reuse of a previously
    /// released range.
    fn back(&self, ptr: usize, len: usize);

    /// Which tag partition owns `ptr`. `None` for foreign addresses.
    fn tag_of(&self, ptr: usize) -> Option<MemoryTag>;

    /// Monotonic clock.
    fn now_nanos(&self) -> u64;

    /// Give the surrounding heap a chance to shed memory after demand grew
    /// by `n` pages. No-op by default.
    fn shrink_to_usage_limit(&self, n: Length) {
        let _ = n;
    }

    // Runtime parameters. These may change between calls.
    fn hpaa_subrelease(&self) -> bool;
    fn release_partial_alloc_pages(&self) -> bool;
    fn skip_subrelease_intervals(&self) -> SkipSubreleaseIntervals;
    fn lifetime_options(&self) -> LifetimePredictionOptions;
}

// ---------------------------------------------------------------------------
// Production forwarder
// ---------------------------------------------------------------------------

/// Forwarder bound to the OS and the process-wide parameter block.
pub struct SystemForwarder {
    cursors: [AtomicUsize; 3],
    reservations: Mutex<Vec<(usize, usize, MemoryTag)>>,
}

impl SystemForwarder {
    pub fn new() -> Self {
        SystemForwarder {
            cursors: [
                AtomicUsize::new(tag_window_base(MemoryTag::Normal)),
                AtomicUsize::new(tag_window_base(MemoryTag::Sampled)),
                AtomicUsize::new(tag_window_base(MemoryTag::Cold)),
            ],
            reservations: Mutex::new(Vec::new()),
        }
    }
}

impl Default for SystemForwarder {
    fn default() -> Self {
        Self::new()
    }
}

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

impl Forwarder for SystemForwarder {
    fn allocate(&self, bytes: usize, align: usize, tag: MemoryTag) -> Option<AddressRange> {
        let bytes = align_up(bytes, HUGE_PAGE_SIZE);
        let align = align.max(HUGE_PAGE_SIZE);
        let hint = self.cursors[tag.index()].fetch_add(bytes + align, Ordering::Relaxed);
        let ptr = unsafe { platform::map_aligned(bytes, align, align_up(hint, align)) };
        if ptr.is_null() {
            return None;
        }
        unsafe { platform::advise_hugepage(ptr, bytes) };
        log::debug!("reserved {} bytes at {:#x} (tag {:?})", bytes, ptr as usize, tag);
        self.reservations
            .lock()
            .unwrap()
            .push((ptr as usize, bytes, tag));
        Some(AddressRange {
            ptr: ptr as usize,
            bytes,
        })
    }

    fn release(&self, ptr: usize, len: usize) -> bool {
        unsafe { platform::release_pages(ptr as *mut u8, len) }
    }

    fn back(&self, ptr: usize, len: usize) {
        unsafe { platform::back_pages(ptr as *mut u8, len) };
    }

    fn tag_of(&self, ptr: usize) -> Option<MemoryTag> {
        let reservations = self.reservations.lock().unwrap();
        reservations
            .iter()
            .find(|(base, bytes, _)| ptr >= *base && ptr < base + bytes)
            .map(|(_, _, tag)| *tag)
    }

    fn now_nanos(&self) -> u64 {
        process_epoch().elapsed().as_nanos() as u64
    }

    fn hpaa_subrelease(&self) -> bool {
        config::hpaa_subrelease()
    }

    fn release_partial_alloc_pages(&self) -> bool {
        config::release_partial_alloc_pages()
    }

    fn skip_subrelease_intervals(&self) -> SkipSubreleaseIntervals {
        SkipSubreleaseIntervals {
            peak_interval: config::filler_skip_subrelease_interval(),
            short_interval: config::filler_skip_subrelease_short_interval(),
            long_interval: config::filler_skip_subrelease_long_interval(),
        }
    }

    fn lifetime_options(&self) -> LifetimePredictionOptions {
        LifetimePredictionOptions {
            enabled: config::lifetime_prediction_enabled(),
            short_lived_threshold: config::lifetime_threshold(),
        }
    }
}

// ---------------------------------------------------------------------------
// Mock forwarder
// ---------------------------------------------------------------------------

/// Deterministic forwarder for tests and fuzzing: hands out addresses from
/// per-tag bump cursors without touching the OS, records every release/back
/// call, and exposes a manually advanced clock and parameter knobs.
pub struct MockForwarder {
    cursors: [AtomicUsize; 3],
    reservations: Mutex<Vec<(usize, usize, MemoryTag)>>,
    released: Mutex<Vec<(usize, usize)>>,
    backed: Mutex<Vec<(usize, usize)>>,
    clock_ns: AtomicU64,
    fail_allocations: AtomicBool,
    honor_release: AtomicBool,
    reserved_bytes: AtomicUsize,

    subrelease: AtomicBool,
    release_partial: AtomicBool,
    skip_interval_ms: AtomicU64,
    skip_short_interval_ms: AtomicU64,
    skip_long_interval_ms: AtomicU64,
    lifetime_enabled: AtomicBool,
    lifetime_threshold_ms: AtomicU64,
}

impl MockForwarder {
    pub fn new() -> Self {
        MockForwarder {
            cursors: [
                AtomicUsize::new(tag_window_base(MemoryTag::Normal)),
                AtomicUsize::new(tag_window_base(MemoryTag::Sampled)),
                AtomicUsize::new(tag_window_base(MemoryTag::Cold)),
            ],
            reservations: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            backed: Mutex::new(Vec::new()),
            clock_ns: AtomicU64::new(0),
            fail_allocations: AtomicBool::new(false),
            honor_release: AtomicBool::new(true),
            reserved_bytes: AtomicUsize::new(0),
            subrelease: AtomicBool::new(true),
            release_partial: AtomicBool::new(false),
            skip_interval_ms: AtomicU64::new(0),
            skip_short_interval_ms: AtomicU64::new(0),
            skip_long_interval_ms: AtomicU64::new(0),
            lifetime_enabled: AtomicBool::new(false),
            lifetime_threshold_ms: AtomicU64::new(500),
        }
    }

    pub fn advance_clock(&self, d: Duration) {
        self.clock_ns.fetch_add(d.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Make subsequent `allocate` calls fail (simulated address-space OOM).
    pub fn set_fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::Relaxed);
    }

    /// Make `release` report that the OS declined the hint.
    pub fn set_honor_release(&self, honor: bool) {
        self.honor_release.store(honor, Ordering::Relaxed);
    }

    pub fn set_subrelease(&self, v: bool) {
        self.subrelease.store(v, Ordering::Relaxed);
    }

    pub fn set_release_partial_alloc_pages(&self, v: bool) {
        self.release_partial.store(v, Ordering::Relaxed);
    }

    pub fn set_skip_subrelease_intervals(&self, i: SkipSubreleaseIntervals) {
        self.skip_interval_ms
            .store(i.peak_interval.as_millis() as u64, Ordering::Relaxed);
        self.skip_short_interval_ms
            .store(i.short_interval.as_millis() as u64, Ordering::Relaxed);
        self.skip_long_interval_ms
            .store(i.long_interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_lifetime_options(&self, o: LifetimePredictionOptions) {
        self.lifetime_enabled.store(o.enabled, Ordering::Relaxed);
        self.lifetime_threshold_ms
            .store(o.short_lived_threshold.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes.load(Ordering::Relaxed)
    }

    pub fn released_calls(&self) -> Vec<(usize, usize)> {
        self.released.lock().unwrap().clone()
    }

    pub fn backed_calls(&self) -> Vec<(usize, usize)> {
        self.backed.lock().unwrap().clone()
    }

    pub fn released_bytes(&self) -> usize {
        self.released.lock().unwrap().iter().map(|&(_, l)| l).sum()
    }
}

impl Default for MockForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Forwarder for MockForwarder {
    fn allocate(&self, bytes: usize, align: usize, tag: MemoryTag) -> Option<AddressRange> {
        if self.fail_allocations.load(Ordering::Relaxed) {
            return None;
        }
        let bytes = align_up(bytes, HUGE_PAGE_SIZE);
        let align = align.max(HUGE_PAGE_SIZE);
        let cursor = &self.cursors[tag.index()];
        let ptr = loop {
            let cur = cursor.load(Ordering::Relaxed);
            let aligned = align_up(cur, align);
            if cursor
                .compare_exchange(cur, aligned + bytes, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break aligned;
            }
        };
        self.reserved_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.reservations.lock().unwrap().push((ptr, bytes, tag));
        Some(AddressRange { ptr, bytes })
    }

    fn release(&self, ptr: usize, len: usize) -> bool {
        if !self.honor_release.load(Ordering::Relaxed) {
            return false;
        }
        self.released.lock().unwrap().push((ptr, len));
        true
    }

    fn back(&self, ptr: usize, len: usize) {
        self.backed.lock().unwrap().push((ptr, len));
    }

    fn tag_of(&self, ptr: usize) -> Option<MemoryTag> {
        let reservations = self.reservations.lock().unwrap();
        reservations
            .iter()
            .find(|(base, bytes, _)| ptr >= *base && ptr < base + bytes)
            .map(|(_, _, tag)| *tag)
    }

    fn now_nanos(&self) -> u64 {
        self.clock_ns.load(Ordering::Relaxed)
    }

    fn hpaa_subrelease(&self) -> bool {
        self.subrelease.load(Ordering::Relaxed)
    }

    fn release_partial_alloc_pages(&self) -> bool {
        self.release_partial.load(Ordering::Relaxed)
    }

    fn skip_subrelease_intervals(&self) -> SkipSubreleaseIntervals {
        SkipSubreleaseIntervals {
            peak_interval: Duration::from_millis(self.skip_interval_ms.load(Ordering::Relaxed)),
            short_interval: Duration::from_millis(
                self.skip_short_interval_ms.load(Ordering::Relaxed),
            ),
            long_interval: Duration::from_millis(
                self.skip_long_interval_ms.load(Ordering::Relaxed),
            ),
        }
    }

    fn lifetime_options(&self) -> LifetimePredictionOptions {
        LifetimePredictionOptions {
            enabled: self.lifetime_enabled.load(Ordering::Relaxed),
            short_lived_threshold: Duration::from_millis(
                self.lifetime_threshold_ms.load(Ordering::Relaxed),
            ),
        }
    }
}
