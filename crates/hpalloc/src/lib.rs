extern crate libc;

pub mod backend;
pub mod bitmap;
pub mod config;
pub mod filler;
pub mod hpaa;
pub mod huge_allocator;
pub mod huge_cache;
pub mod lifetime;
pub mod page_map;
pub mod pages;
pub mod platform;
pub mod region;
pub mod span;
pub mod stats;
pub mod sync;
pub mod tracker;

pub use backend::{AddressRange, Forwarder, MemoryTag, MockForwarder, SystemForwarder};
pub use filler::SkipSubreleaseIntervals;
pub use hpaa::{HugePageAwareAllocator, Options};
pub use lifetime::LifetimePredictionOptions;
pub use pages::{HugeLength, HugePage, HugeRange, Length, PageId};
pub use span::Span;
pub use stats::BackingStats;
