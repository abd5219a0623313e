//! Lifetime-based segregation of large allocations.
//!
//! Keeps an exponential moving average of realized lifetimes per request
//! fingerprint, collected lock-free before the page-heap lock is taken.
//! Requests predicted to be short-lived are routed into a dedicated region so
//! their churn does not fragment the filler. The predictor is allowed to
//! have no opinion; training data comes both from region allocations and
//! from lifetime trackers attached to donated huge-page tails.

use std::collections::HashMap;
use std::time::Duration;

use crate::backend::Forwarder;
use crate::huge_allocator::HugeAllocator;
use crate::pages::{Length, PageId};
use crate::region::HugeRegion;
use crate::stats::{BackingStats, PbtxtRegion, Printer};

#[derive(Clone, Copy, Debug)]
pub struct LifetimePredictionOptions {
    pub enabled: bool,
    /// Predicted lifetimes below this route to the lifetime region.
    pub short_lived_threshold: Duration,
}

impl Default for LifetimePredictionOptions {
    fn default() -> Self {
        LifetimePredictionOptions {
            enabled: false,
            short_lived_threshold: Duration::from_millis(500),
        }
    }
}

/// Fingerprint of an allocation request, computed without the lock.
#[derive(Clone, Copy, Debug)]
pub struct LifetimeContext {
    fingerprint: u64,
}

impl LifetimeContext {
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

/// Handle attached to a donated huge-page tail; when the huge page
/// reassembles, the realized lifetime of the donor feeds the predictor.
#[derive(Clone, Copy, Debug)]
pub struct LifetimeTracker {
    pub fingerprint: u64,
    pub birth_ns: u64,
}

/// splitmix64 finalizer -- good hash for low-entropy inputs.
#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x
}

struct SiteStats {
    ema_ns: u64,
    samples: u64,
}

struct LiveAlloc {
    fingerprint: u64,
    birth_ns: u64,
}

pub struct LifetimeBasedAllocator {
    sites: HashMap<u64, SiteStats>,
    region: Option<HugeRegion>,
    live: HashMap<usize, LiveAlloc>,
    predictions_short: u64,
    predictions_long: u64,
    tracked_donations: u64,
}

impl LifetimeBasedAllocator {
    pub fn new() -> Self {
        LifetimeBasedAllocator {
            sites: HashMap::new(),
            region: None,
            live: HashMap::new(),
            predictions_short: 0,
            predictions_long: 0,
            tracked_donations: 0,
        }
    }

    /// Fingerprint the request. Pure computation, called before the lock is
    /// taken; this layer has no call stacks, so the request shape stands in
    /// for the call site.
    pub fn collect_context(
        n: Length,
        objects_per_span: usize,
        opts: LifetimePredictionOptions,
    ) -> Option<LifetimeContext> {
        if !opts.enabled {
            return None;
        }
        let raw = (n.raw() as u64) ^ (objects_per_span as u64).wrapping_mul(0x9E3779B97F4A7C15);
        Some(LifetimeContext {
            fingerprint: splitmix64(raw),
        })
    }

    fn predicted_short(&mut self, fingerprint: u64, threshold: Duration) -> bool {
        let short = match self.sites.get(&fingerprint) {
            Some(s) => s.samples > 0 && s.ema_ns < threshold.as_nanos() as u64,
            None => false,
        };
        if short {
            self.predictions_short += 1;
        } else {
            self.predictions_long += 1;
        }
        short
    }

    /// Route a predicted-short-lived request to the lifetime region.
    /// `None` means no opinion; the caller proceeds with regular placement.
    pub fn maybe_get<F: Forwarder>(
        &mut self,
        n: Length,
        ctx: Option<&LifetimeContext>,
        fwd: &F,
        alloc: &mut HugeAllocator,
        now_ns: u64,
    ) -> Option<(PageId, bool)> {
        let ctx = ctx?;
        let opts = fwd.lifetime_options();
        if !opts.enabled || !self.predicted_short(ctx.fingerprint, opts.short_lived_threshold) {
            return None;
        }
        if self.region.is_none() {
            let r = alloc.get(HugeRegion::size(), fwd)?;
            log::debug!("hpalloc: created lifetime region at {:#x}", r.start().address());
            self.region = Some(HugeRegion::new(r, now_ns));
        }
        let (page, from_released) = self.region.as_mut()?.maybe_get(n)?;
        self.live.insert(
            page.raw(),
            LiveAlloc {
                fingerprint: ctx.fingerprint,
                birth_ns: now_ns,
            },
        );
        Some((page, from_released))
    }

    /// Take back pages if they belong to the lifetime region, recording the
    /// realized lifetime.
    pub fn maybe_put(&mut self, p: PageId, n: Length, now_ns: u64) -> bool {
        let Some(region) = self.region.as_mut() else {
            return false;
        };
        if !region.contains(p) {
            return false;
        }
        region.put(p, n);
        if let Some(live) = self.live.remove(&p.raw()) {
            let lifetime = now_ns.saturating_sub(live.birth_ns);
            Self::record_sample_in(&mut self.sites, live.fingerprint, lifetime);
        }
        true
    }

    /// Attach a lifetime tracker to a donated tail so the donor's realized
    /// lifetime is recorded when the huge page reassembles.
    pub fn maybe_add_tracker(
        &mut self,
        ctx: Option<&LifetimeContext>,
        tracker: &mut crate::tracker::PageTracker,
        now_ns: u64,
    ) {
        if let Some(ctx) = ctx {
            tracker.attach_lifetime(LifetimeTracker {
                fingerprint: ctx.fingerprint,
                birth_ns: now_ns,
            });
            self.tracked_donations += 1;
        }
    }

    /// Record the realized lifetime of a detached tracker handle.
    pub fn maybe_put_tracker(&mut self, lt: Option<LifetimeTracker>, now_ns: u64) {
        if let Some(lt) = lt {
            let lifetime = now_ns.saturating_sub(lt.birth_ns);
            Self::record_sample_in(&mut self.sites, lt.fingerprint, lifetime);
        }
    }

    fn record_sample_in(sites: &mut HashMap<u64, SiteStats>, fingerprint: u64, sample_ns: u64) {
        let s = sites.entry(fingerprint).or_insert(SiteStats {
            ema_ns: sample_ns,
            samples: 0,
        });
        if s.samples > 0 {
            let delta = sample_ns as i64 - s.ema_ns as i64;
            s.ema_ns = (s.ema_ns as i64 + delta / 8) as u64;
        }
        s.samples += 1;
    }

    pub fn region_stats(&self) -> Option<BackingStats> {
        self.region.as_ref().map(|r| r.stats())
    }

    pub fn print(&self, out: &mut Printer) {
        use core::fmt::Write as _;
        let _ = writeln!(
            out,
            "LifetimeBasedAllocator: {} sites, {} short / {} long predictions, {} tracked donations",
            self.sites.len(),
            self.predictions_short,
            self.predictions_long,
            self.tracked_donations
        );
    }

    pub fn print_in_pbtxt(&self, out: &mut PbtxtRegion<'_>) {
        let mut region = out.sub_region("lifetime_based_allocator");
        region.print_i64("sites", self.sites.len() as i64);
        region.print_i64("short_predictions", self.predictions_short as i64);
        region.print_i64("long_predictions", self.predictions_long as i64);
        region.print_i64("tracked_donations", self.tracked_donations as i64);
        region.print_bool("region_allocated", self.region.is_some());
    }
}

impl Default for LifetimeBasedAllocator {
    fn default() -> Self {
        Self::new()
    }
}
