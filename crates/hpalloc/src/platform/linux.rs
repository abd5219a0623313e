use core::ptr;

unsafe fn map_at(hint: usize, size: usize) -> *mut u8 {
    let result = libc::mmap(
        hint as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Map anonymous read-write memory aligned to `align`, near `hint`.
///
/// The kernel is free to ignore the hint; alignment is enforced by
/// over-mapping by `align` and trimming the head and tail.
///
/// # Safety
/// `size` must be page-aligned and non-zero; `align` a power of two.
pub unsafe fn map_aligned(size: usize, align: usize, hint: usize) -> *mut u8 {
    // A hinted mapping at an aligned hint usually comes back aligned.
    let direct = map_at(hint, size);
    if !direct.is_null() {
        if direct as usize & (align - 1) == 0 {
            return direct;
        }
        libc::munmap(direct as *mut libc::c_void, size);
    }

    // Over-map and trim.
    let padded = size + align;
    let base = map_at(0, padded);
    if base.is_null() {
        return ptr::null_mut();
    }
    let addr = base as usize;
    let aligned = (addr + align - 1) & !(align - 1);
    let head = aligned - addr;
    let tail = padded - head - size;
    if head > 0 {
        libc::munmap(base as *mut libc::c_void, head);
    }
    if tail > 0 {
        libc::munmap((aligned + size) as *mut libc::c_void, tail);
    }
    aligned as *mut u8
}

/// Unmap memory.
///
/// # Safety
/// `ptr` must have been returned by `map_aligned` with the same `size`.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// Release physical pages back to the kernel, keeping the reservation.
/// MADV_DONTNEED guarantees zero-filled pages on next access.
///
/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn release_pages(ptr: *mut u8, size: usize) -> bool {
    libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_DONTNEED) == 0
}

/// Hint that the range will be needed soon.
///
/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn back_pages(ptr: *mut u8, size: usize) {
    libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_WILLNEED);
}

/// Encourage transparent huge-page promotion for the range.
///
/// # Safety
/// Region must be valid and huge-page-aligned.
pub unsafe fn advise_hugepage(ptr: *mut u8, size: usize) {
    libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_HUGEPAGE);
}
