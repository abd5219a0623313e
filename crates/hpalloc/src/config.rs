//! Runtime parameters.
//!
//! Read once from `HPALLOC_*` environment variables on first use, then served
//! from atomics so they can be flipped at runtime (values may change between
//! calls; the allocator re-reads them through its forwarder on every use).

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Once;
use std::time::Duration;

static INIT: Once = Once::new();

static SUBRELEASE: AtomicBool = AtomicBool::new(true);
static USE_HUGE_REGION_MORE_OFTEN: AtomicBool = AtomicBool::new(false);
static RELEASE_PARTIAL_ALLOC_PAGES: AtomicBool = AtomicBool::new(false);
static SEPARATE_FEW_MANY: AtomicBool = AtomicBool::new(false);
static SKIP_INTERVAL_MS: AtomicU64 = AtomicU64::new(0);
static SKIP_SHORT_INTERVAL_MS: AtomicU64 = AtomicU64::new(0);
static SKIP_LONG_INTERVAL_MS: AtomicU64 = AtomicU64::new(0);
static LIFETIME_PREDICTION: AtomicBool = AtomicBool::new(false);
static LIFETIME_THRESHOLD_MS: AtomicU64 = AtomicU64::new(500);

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key) {
        Ok(v) => match v.as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        },
        Err(_) => None,
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn read_env() {
    if let Some(v) = env_bool("HPALLOC_SUBRELEASE") {
        SUBRELEASE.store(v, Ordering::Relaxed);
    }
    if let Some(v) = env_bool("HPALLOC_USE_HUGE_REGION_MORE_OFTEN") {
        USE_HUGE_REGION_MORE_OFTEN.store(v, Ordering::Relaxed);
    }
    if let Some(v) = env_bool("HPALLOC_RELEASE_PARTIAL_ALLOC_PAGES") {
        RELEASE_PARTIAL_ALLOC_PAGES.store(v, Ordering::Relaxed);
    }
    if let Some(v) = env_bool("HPALLOC_SEPARATE_FEW_MANY_OBJECT_SPANS") {
        SEPARATE_FEW_MANY.store(v, Ordering::Relaxed);
    }
    if let Some(v) = env_u64("HPALLOC_SKIP_SUBRELEASE_INTERVAL_MS") {
        SKIP_INTERVAL_MS.store(v, Ordering::Relaxed);
    }
    if let Some(v) = env_u64("HPALLOC_SKIP_SUBRELEASE_SHORT_INTERVAL_MS") {
        SKIP_SHORT_INTERVAL_MS.store(v, Ordering::Relaxed);
    }
    if let Some(v) = env_u64("HPALLOC_SKIP_SUBRELEASE_LONG_INTERVAL_MS") {
        SKIP_LONG_INTERVAL_MS.store(v, Ordering::Relaxed);
    }
    if let Some(v) = env_bool("HPALLOC_LIFETIME_PREDICTION") {
        LIFETIME_PREDICTION.store(v, Ordering::Relaxed);
    }
    if let Some(v) = env_u64("HPALLOC_LIFETIME_THRESHOLD_MS") {
        LIFETIME_THRESHOLD_MS.store(v, Ordering::Relaxed);
    }
}

fn init() {
    INIT.call_once(read_env);
}

pub fn hpaa_subrelease() -> bool {
    init();
    SUBRELEASE.load(Ordering::Relaxed)
}

pub fn set_hpaa_subrelease(v: bool) {
    init();
    SUBRELEASE.store(v, Ordering::Relaxed);
}

pub fn use_huge_region_more_often() -> bool {
    init();
    USE_HUGE_REGION_MORE_OFTEN.load(Ordering::Relaxed)
}

pub fn set_use_huge_region_more_often(v: bool) {
    init();
    USE_HUGE_REGION_MORE_OFTEN.store(v, Ordering::Relaxed);
}

pub fn release_partial_alloc_pages() -> bool {
    init();
    RELEASE_PARTIAL_ALLOC_PAGES.load(Ordering::Relaxed)
}

pub fn set_release_partial_alloc_pages(v: bool) {
    init();
    RELEASE_PARTIAL_ALLOC_PAGES.store(v, Ordering::Relaxed);
}

pub fn separate_allocs_for_few_and_many_objects_spans() -> bool {
    init();
    SEPARATE_FEW_MANY.load(Ordering::Relaxed)
}

pub fn set_separate_allocs_for_few_and_many_objects_spans(v: bool) {
    init();
    SEPARATE_FEW_MANY.store(v, Ordering::Relaxed);
}

pub fn filler_skip_subrelease_interval() -> Duration {
    init();
    Duration::from_millis(SKIP_INTERVAL_MS.load(Ordering::Relaxed))
}

pub fn set_filler_skip_subrelease_interval(d: Duration) {
    init();
    SKIP_INTERVAL_MS.store(d.as_millis() as u64, Ordering::Relaxed);
}

pub fn filler_skip_subrelease_short_interval() -> Duration {
    init();
    Duration::from_millis(SKIP_SHORT_INTERVAL_MS.load(Ordering::Relaxed))
}

pub fn set_filler_skip_subrelease_short_interval(d: Duration) {
    init();
    SKIP_SHORT_INTERVAL_MS.store(d.as_millis() as u64, Ordering::Relaxed);
}

pub fn filler_skip_subrelease_long_interval() -> Duration {
    init();
    Duration::from_millis(SKIP_LONG_INTERVAL_MS.load(Ordering::Relaxed))
}

pub fn set_filler_skip_subrelease_long_interval(d: Duration) {
    init();
    SKIP_LONG_INTERVAL_MS.store(d.as_millis() as u64, Ordering::Relaxed);
}

pub fn lifetime_prediction_enabled() -> bool {
    init();
    LIFETIME_PREDICTION.load(Ordering::Relaxed)
}

pub fn set_lifetime_prediction_enabled(v: bool) {
    init();
    LIFETIME_PREDICTION.store(v, Ordering::Relaxed);
}

pub fn lifetime_threshold() -> Duration {
    init();
    Duration::from_millis(LIFETIME_THRESHOLD_MS.load(Ordering::Relaxed))
}

pub fn set_lifetime_threshold(d: Duration) {
    init();
    LIFETIME_THRESHOLD_MS.store(d.as_millis() as u64, Ordering::Relaxed);
}
