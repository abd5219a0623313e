//! Statistics types and text output plumbing.

use core::fmt::{self, Write as _};

use crate::pages::{Length, PAGES_PER_HUGE_PAGE};

/// Byte-level accounting of one tier (or the whole allocator).
///
/// `system_bytes` is what the tier manages, `free_bytes` what is backed but
/// idle, `unmapped_bytes` what is reserved but returned to the OS. Used space
/// is the difference.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct BackingStats {
    pub system_bytes: usize,
    pub free_bytes: usize,
    pub unmapped_bytes: usize,
}

impl BackingStats {
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.system_bytes - self.free_bytes - self.unmapped_bytes
    }
}

impl core::ops::AddAssign for BackingStats {
    fn add_assign(&mut self, rhs: BackingStats) {
        self.system_bytes += rhs.system_bytes;
        self.free_bytes += rhs.free_bytes;
        self.unmapped_bytes += rhs.unmapped_bytes;
    }
}

impl core::ops::Add for BackingStats {
    type Output = BackingStats;
    fn add(mut self, rhs: BackingStats) -> BackingStats {
        self += rhs;
        self
    }
}

/// Free runs shorter than this many pages are reported per exact length.
pub const MAX_SMALL_SPAN_PAGES: usize = 64;

/// Counts of free page runs below [`MAX_SMALL_SPAN_PAGES`], bucketed by
/// length; `normal` runs are backed, `returned` runs are unbacked.
#[derive(Clone, Copy, Debug)]
pub struct SmallSpanStats {
    pub normal_length: [usize; MAX_SMALL_SPAN_PAGES],
    pub returned_length: [usize; MAX_SMALL_SPAN_PAGES],
}

impl SmallSpanStats {
    pub fn new() -> Self {
        SmallSpanStats {
            normal_length: [0; MAX_SMALL_SPAN_PAGES],
            returned_length: [0; MAX_SMALL_SPAN_PAGES],
        }
    }

    pub fn record(&mut self, len: Length, returned: bool) {
        debug_assert!(len.raw() < MAX_SMALL_SPAN_PAGES);
        if returned {
            self.returned_length[len.raw()] += 1;
        } else {
            self.normal_length[len.raw()] += 1;
        }
    }
}

impl Default for SmallSpanStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate of free page runs of [`MAX_SMALL_SPAN_PAGES`] pages or more.
#[derive(Clone, Copy, Debug, Default)]
pub struct LargeSpanStats {
    pub spans: usize,
    pub normal_pages: Length,
    pub returned_pages: Length,
}

impl LargeSpanStats {
    pub fn record(&mut self, len: Length, returned: bool) {
        self.spans += 1;
        if returned {
            self.returned_pages += len;
        } else {
            self.normal_pages += len;
        }
    }
}

/// Allocation usage counters the router's region policy feeds on.
#[derive(Default, Debug)]
pub struct PageAllocInfo {
    nalloc: u64,
    nfree: u64,
    /// Pages in currently-live small spans (n <= K/2).
    small_pages: Length,
    /// Aggregate slack reserved by live huge-page-aligned allocations whose
    /// donors have not yet been freed.
    slack_pages: Length,
    release_calls: u64,
    release_requested: Length,
    release_achieved: Length,
}

impl PageAllocInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_alloc(&mut self, n: Length) {
        self.nalloc += 1;
        if n.raw() <= PAGES_PER_HUGE_PAGE / 2 {
            self.small_pages += n;
        }
    }

    pub fn record_free(&mut self, n: Length) {
        self.nfree += 1;
        if n.raw() <= PAGES_PER_HUGE_PAGE / 2 {
            self.small_pages -= n;
        }
    }

    pub fn add_slack(&mut self, n: Length) {
        self.slack_pages += n;
    }

    pub fn sub_slack(&mut self, n: Length) {
        self.slack_pages -= n;
    }

    /// Pages of live small spans available to absorb slack.
    pub fn small(&self) -> Length {
        self.small_pages
    }

    /// Pending donated slack in the filler.
    pub fn slack(&self) -> Length {
        self.slack_pages
    }

    pub fn record_release(&mut self, requested: Length, achieved: Length) {
        self.release_calls += 1;
        self.release_requested += requested;
        self.release_achieved += achieved;
    }

    pub fn print(&self, out: &mut Printer) {
        let _ = writeln!(
            out,
            "HugePageAware: {} allocs, {} frees, {} live small pages, {} slack pages",
            self.nalloc,
            self.nfree,
            self.small_pages.raw(),
            self.slack_pages.raw()
        );
        let _ = writeln!(
            out,
            "HugePageAware: {} release calls: {} pages requested, {} pages released",
            self.release_calls,
            self.release_requested.raw(),
            self.release_achieved.raw()
        );
    }
}

/// Accumulates formatted report text.
pub struct Printer {
    buf: String,
}

impl Printer {
    pub fn new() -> Self {
        Printer { buf: String::new() }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}

impl Default for Printer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buf.push_str(s);
        Ok(())
    }
}

/// Nested text-proto emitter:
/// `region.sub_region("x")` opens `x {`, closes on drop.
pub struct PbtxtRegion<'a> {
    buf: &'a mut String,
    indent: usize,
    named: bool,
}

impl<'a> PbtxtRegion<'a> {
    pub fn new(buf: &'a mut String) -> Self {
        PbtxtRegion {
            buf,
            indent: 0,
            named: false,
        }
    }

    fn pad(&mut self) {
        for _ in 0..self.indent {
            self.buf.push_str("  ");
        }
    }

    pub fn sub_region(&mut self, name: &str) -> PbtxtRegion<'_> {
        self.pad();
        self.buf.push_str(name);
        self.buf.push_str(" {\n");
        PbtxtRegion {
            indent: self.indent + 1,
            buf: &mut *self.buf,
            named: true,
        }
    }

    pub fn print_i64(&mut self, name: &str, value: i64) {
        self.pad();
        let _ = writeln!(self.buf, "{name}: {value}");
    }

    pub fn print_bool(&mut self, name: &str, value: bool) {
        self.pad();
        let _ = writeln!(self.buf, "{name}: {value}");
    }
}

impl Drop for PbtxtRegion<'_> {
    fn drop(&mut self) {
        if self.named {
            self.indent -= 1;
            self.pad();
            self.buf.push_str("}\n");
        }
    }
}

/// Coarse ages of idle memory, bucketed by powers of ten of seconds.
pub struct PageAgeHistograms {
    now_ns: u64,
    buckets: [Length; 5],
}

const AGE_BOUNDS_SECS: [u64; 4] = [1, 10, 100, 1000];

impl PageAgeHistograms {
    pub fn new(now_ns: u64) -> Self {
        PageAgeHistograms {
            now_ns,
            buckets: [Length::ZERO; 5],
        }
    }

    pub fn record(&mut self, pages: Length, birth_ns: u64) {
        let age_secs = self.now_ns.saturating_sub(birth_ns) / 1_000_000_000;
        let mut bucket = AGE_BOUNDS_SECS.len();
        for (i, bound) in AGE_BOUNDS_SECS.iter().enumerate() {
            if age_secs < *bound {
                bucket = i;
                break;
            }
        }
        self.buckets[bucket] += pages;
    }

    pub fn print(&self, label: &str, out: &mut Printer) {
        let _ = writeln!(
            out,
            "{label}: per-page ages (pages): <1s {}, <10s {}, <100s {}, <1000s {}, older {}",
            self.buckets[0].raw(),
            self.buckets[1].raw(),
            self.buckets[2].raw(),
            self.buckets[3].raw(),
            self.buckets[4].raw()
        );
    }
}

/// Bytes as MiB with one decimal, the report's unit of choice.
pub fn bytes_to_mib(bytes: usize) -> f64 {
    const MIB: f64 = 1048576.0;
    bytes as f64 / MIB
}
