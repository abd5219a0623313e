#![no_main]

use libfuzzer_sys::fuzz_target;

use hpalloc::{HugePageAwareAllocator, Length, MemoryTag, MockForwarder, Options, Span};

/// Fuzz target that interprets a byte slice as a sequence of page-heap
/// operations against the mock forwarder.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=allocate, 1=deallocate, 2=release, 3=advance clock)
///   byte 1-2: page count (little-endian u16, clamped to 1..=1024)
///   byte 3: slot index (which tracked span to operate on)
///
/// After every operation the stats must sum: used + free + unmapped ==
/// system == the mock's reservation. At the end everything is freed and the
/// heap must report zero used bytes.
const MAX_SLOTS: usize = 32;

fn check(a: &HugePageAwareAllocator<MockForwarder>) {
    let s = a.stats();
    assert_eq!(
        s.used_bytes() + s.free_bytes + s.unmapped_bytes,
        s.system_bytes
    );
    assert_eq!(s.system_bytes, a.forwarder().reserved_bytes());
}

fuzz_target!(|data: &[u8]| {
    let a = HugePageAwareAllocator::new(
        MockForwarder::new(),
        Options {
            tag: MemoryTag::Normal,
            use_huge_region_more_often: data.first().is_some_and(|b| b & 1 != 0),
            separate_allocs_for_few_and_many_objects_spans: data
                .first()
                .is_some_and(|b| b & 2 != 0),
        },
    );
    let mut slots: Vec<Option<Span>> = (0..MAX_SLOTS).map(|_| None).collect();

    let mut i = 1;
    while i + 4 <= data.len() {
        let opcode = data[i] & 0x03;
        let raw = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let n = 1 + raw % 1024;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        match opcode {
            0 => {
                if let Some(old) = slots[slot].take() {
                    a.deallocate(old, 1);
                }
                if let Some(span) = a.allocate(Length::new(n), 1 + raw % 64) {
                    assert_eq!(span.num_pages(), Length::new(n));
                    slots[slot] = Some(span);
                }
            }
            1 => {
                if let Some(span) = slots[slot].take() {
                    a.deallocate(span, 1);
                }
            }
            2 => {
                a.release_at_least_n_pages(Length::new(n));
            }
            3 => {
                a.forwarder()
                    .advance_clock(std::time::Duration::from_millis(raw as u64));
            }
            _ => unreachable!(),
        }
        check(&a);
    }

    // Cleanup: every live span goes back and the heap must be exact.
    for slot in slots.iter_mut() {
        if let Some(span) = slot.take() {
            a.deallocate(span, 1);
        }
    }
    check(&a);
    assert_eq!(a.stats().used_bytes(), 0);
    assert_eq!(a.donated_huge_pages().raw(), 0);
    assert_eq!(a.abandoned_pages().raw(), 0);
});
