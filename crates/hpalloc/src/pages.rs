//! Strongly typed page units.
//!
//! Everything at this layer is counted in pages (8 KiB) or huge pages
//! (2 MiB = 256 pages). Mixing the two up is the classic source of
//! off-by-256 bugs, so the counts and identifiers are distinct types with
//! only the conversions that make sense.

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// log2 of the small page size.
pub const PAGE_SHIFT: usize = 13;

/// Small page size: 8 KiB.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// log2 of the huge page size.
pub const HUGE_PAGE_SHIFT: usize = 21;

/// Huge page size: 2 MiB.
pub const HUGE_PAGE_SIZE: usize = 1 << HUGE_PAGE_SHIFT;

/// Number of small pages per huge page (256).
pub const PAGES_PER_HUGE_PAGE: usize = HUGE_PAGE_SIZE / PAGE_SIZE;

/// Align `value` up to the next multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Align `value` down to the previous multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// A count of small pages.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Length(usize);

impl Length {
    pub const ZERO: Length = Length(0);

    #[inline]
    pub const fn new(n: usize) -> Self {
        Length(n)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn in_bytes(self) -> usize {
        self.0 << PAGE_SHIFT
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Saturating subtraction; release paths routinely overshoot.
    #[inline]
    pub const fn saturating_sub(self, rhs: Length) -> Length {
        Length(self.0.saturating_sub(rhs.0))
    }
}

impl Add for Length {
    type Output = Length;
    #[inline]
    fn add(self, rhs: Length) -> Length {
        Length(self.0 + rhs.0)
    }
}

impl AddAssign for Length {
    #[inline]
    fn add_assign(&mut self, rhs: Length) {
        self.0 += rhs.0;
    }
}

impl Sub for Length {
    type Output = Length;
    #[inline]
    fn sub(self, rhs: Length) -> Length {
        debug_assert!(self.0 >= rhs.0);
        Length(self.0 - rhs.0)
    }
}

impl SubAssign for Length {
    #[inline]
    fn sub_assign(&mut self, rhs: Length) {
        debug_assert!(self.0 >= rhs.0);
        self.0 -= rhs.0;
    }
}

impl fmt::Debug for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}pg", self.0)
    }
}

/// A count of huge pages.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HugeLength(usize);

impl HugeLength {
    pub const ZERO: HugeLength = HugeLength(0);

    #[inline]
    pub const fn new(n: usize) -> Self {
        HugeLength(n)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn in_pages(self) -> Length {
        Length(self.0 * PAGES_PER_HUGE_PAGE)
    }

    #[inline]
    pub const fn in_bytes(self) -> usize {
        self.0 << HUGE_PAGE_SHIFT
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Smallest huge length covering `n` pages.
    #[inline]
    pub const fn from_pages_ceil(n: Length) -> HugeLength {
        HugeLength(n.raw().div_ceil(PAGES_PER_HUGE_PAGE))
    }
}

impl Add for HugeLength {
    type Output = HugeLength;
    #[inline]
    fn add(self, rhs: HugeLength) -> HugeLength {
        HugeLength(self.0 + rhs.0)
    }
}

impl AddAssign for HugeLength {
    #[inline]
    fn add_assign(&mut self, rhs: HugeLength) {
        self.0 += rhs.0;
    }
}

impl Sub for HugeLength {
    type Output = HugeLength;
    #[inline]
    fn sub(self, rhs: HugeLength) -> HugeLength {
        debug_assert!(self.0 >= rhs.0);
        HugeLength(self.0 - rhs.0)
    }
}

impl SubAssign for HugeLength {
    #[inline]
    fn sub_assign(&mut self, rhs: HugeLength) {
        debug_assert!(self.0 >= rhs.0);
        self.0 -= rhs.0;
    }
}

impl fmt::Debug for HugeLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}hp", self.0)
    }
}

/// Identifier of a small page: its address divided by the page size.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PageId(usize);

impl PageId {
    #[inline]
    pub const fn new(index: usize) -> Self {
        PageId(index)
    }

    #[inline]
    pub const fn from_address(addr: usize) -> Self {
        PageId(addr >> PAGE_SHIFT)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn address(self) -> usize {
        self.0 << PAGE_SHIFT
    }
}

impl Add<Length> for PageId {
    type Output = PageId;
    #[inline]
    fn add(self, rhs: Length) -> PageId {
        PageId(self.0 + rhs.raw())
    }
}

impl Sub<Length> for PageId {
    type Output = PageId;
    #[inline]
    fn sub(self, rhs: Length) -> PageId {
        debug_assert!(self.0 >= rhs.raw());
        PageId(self.0 - rhs.raw())
    }
}

impl Sub for PageId {
    type Output = Length;
    #[inline]
    fn sub(self, rhs: PageId) -> Length {
        debug_assert!(self.0 >= rhs.0);
        Length(self.0 - rhs.0)
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{:#x}", self.0)
    }
}

/// Identifier of a huge page: its address divided by the huge page size.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HugePage(usize);

impl HugePage {
    #[inline]
    pub const fn new(index: usize) -> Self {
        HugePage(index)
    }

    #[inline]
    pub const fn from_address(addr: usize) -> Self {
        debug_assert!(addr & (HUGE_PAGE_SIZE - 1) == 0);
        HugePage(addr >> HUGE_PAGE_SHIFT)
    }

    /// The huge page containing the given small page.
    #[inline]
    pub const fn containing(p: PageId) -> Self {
        HugePage(p.raw() >> (HUGE_PAGE_SHIFT - PAGE_SHIFT))
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn address(self) -> usize {
        self.0 << HUGE_PAGE_SHIFT
    }

    #[inline]
    pub const fn first_page(self) -> PageId {
        PageId::new(self.0 * PAGES_PER_HUGE_PAGE)
    }
}

impl Add<HugeLength> for HugePage {
    type Output = HugePage;
    #[inline]
    fn add(self, rhs: HugeLength) -> HugePage {
        HugePage(self.0 + rhs.raw())
    }
}

impl Sub<HugeLength> for HugePage {
    type Output = HugePage;
    #[inline]
    fn sub(self, rhs: HugeLength) -> HugePage {
        debug_assert!(self.0 >= rhs.raw());
        HugePage(self.0 - rhs.raw())
    }
}

impl Sub for HugePage {
    type Output = HugeLength;
    #[inline]
    fn sub(self, rhs: HugePage) -> HugeLength {
        debug_assert!(self.0 >= rhs.0);
        HugeLength(self.0 - rhs.0)
    }
}

impl fmt::Debug for HugePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hp{:#x}", self.0)
    }
}

/// A contiguous run of huge pages.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HugeRange {
    start: HugePage,
    len: HugeLength,
}

impl HugeRange {
    #[inline]
    pub const fn new(start: HugePage, len: HugeLength) -> Self {
        HugeRange { start, len }
    }

    #[inline]
    pub const fn start(self) -> HugePage {
        self.start
    }

    #[inline]
    pub const fn len(self) -> HugeLength {
        self.len
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.len.is_zero()
    }

    /// One past the last huge page.
    #[inline]
    pub fn end(self) -> HugePage {
        self.start + self.len
    }

    #[inline]
    pub const fn in_pages(self) -> Length {
        self.len.in_pages()
    }

    #[inline]
    pub const fn in_bytes(self) -> usize {
        self.len.in_bytes()
    }

    #[inline]
    pub fn contains(self, p: HugePage) -> bool {
        p >= self.start && p < self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert_eq!(PAGE_SIZE, 8192);
        assert_eq!(HUGE_PAGE_SIZE, 2 * 1024 * 1024);
        assert_eq!(PAGES_PER_HUGE_PAGE, 256);
    }

    #[test]
    fn huge_length_from_pages() {
        assert_eq!(HugeLength::from_pages_ceil(Length::new(1)).raw(), 1);
        assert_eq!(HugeLength::from_pages_ceil(Length::new(256)).raw(), 1);
        assert_eq!(HugeLength::from_pages_ceil(Length::new(257)).raw(), 2);
        assert_eq!(HugeLength::from_pages_ceil(Length::new(300)).raw(), 2);
        assert_eq!(HugeLength::new(2).in_pages().raw(), 512);
    }

    #[test]
    fn page_huge_page_round_trip() {
        let hp = HugePage::new(7);
        assert_eq!(HugePage::containing(hp.first_page()), hp);
        let last = hp.first_page() + Length::new(PAGES_PER_HUGE_PAGE - 1);
        assert_eq!(HugePage::containing(last), hp);
        let next = hp.first_page() + Length::new(PAGES_PER_HUGE_PAGE);
        assert_eq!(HugePage::containing(next), HugePage::new(8));
    }

    #[test]
    fn range_contains() {
        let r = HugeRange::new(HugePage::new(4), HugeLength::new(3));
        assert!(!r.contains(HugePage::new(3)));
        assert!(r.contains(HugePage::new(4)));
        assert!(r.contains(HugePage::new(6)));
        assert!(!r.contains(HugePage::new(7)));
        assert_eq!(r.end(), HugePage::new(7));
    }
}
