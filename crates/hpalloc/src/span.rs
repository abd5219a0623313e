//! Caller-visible allocation handle.

use crate::pages::{Length, PageId};

/// A contiguous run of pages owned by exactly one caller between allocation
/// and deallocation.
///
/// Deliberately neither `Clone` nor `Copy`: a span is a capability, and
/// `deallocate` consumes it. The `donated` flag marks spans whose trailing
/// huge page also contributed slack to the filler; the deallocation path uses
/// it to decide whether that slack must be accounted as abandoned.
#[derive(Debug)]
pub struct Span {
    first_page: PageId,
    num_pages: Length,
    donated: bool,
}

impl Span {
    pub(crate) fn new(first_page: PageId, num_pages: Length) -> Self {
        Span {
            first_page,
            num_pages,
            donated: false,
        }
    }

    #[inline]
    pub fn first_page(&self) -> PageId {
        self.first_page
    }

    #[inline]
    pub fn last_page(&self) -> PageId {
        self.first_page + self.num_pages - Length::new(1)
    }

    #[inline]
    pub fn num_pages(&self) -> Length {
        self.num_pages
    }

    #[inline]
    pub fn start_address(&self) -> usize {
        self.first_page.address()
    }

    #[inline]
    pub fn bytes_in_span(&self) -> usize {
        self.num_pages.in_bytes()
    }

    #[inline]
    pub fn donated(&self) -> bool {
        self.donated
    }

    pub(crate) fn set_donated(&mut self, value: bool) {
        self.donated = value;
    }
}
