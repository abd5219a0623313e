#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

/// Map an anonymous read-write region of `size` bytes aligned to `align`,
/// near `hint` if possible. Returns null on failure.
///
/// # Safety
/// `size` must be page-aligned and non-zero; `align` a power of two.
#[inline]
pub unsafe fn map_aligned(size: usize, align: usize, hint: usize) -> *mut u8 {
    sys::map_aligned(size, align, hint)
}

/// Unmap previously mapped memory.
///
/// # Safety
/// `ptr` must have been returned by `map_aligned` and `size` must match.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, size);
}

/// Tell the kernel the range's contents are no longer needed; physical pages
/// may be reclaimed while the reservation stays. Returns whether the hint was
/// honored — callers must treat `false` as "still backed", never as an error.
///
/// # Safety
/// `ptr` and `size` must refer to a valid mapped region and be page-aligned.
#[inline]
pub unsafe fn release_pages(ptr: *mut u8, size: usize) -> bool {
    sys::release_pages(ptr, size)
}

/// Ask the kernel to fault the range back in ahead of use. Best effort.
///
/// # Safety
/// `ptr` and `size` must refer to a valid mapped region and be page-aligned.
#[inline]
pub unsafe fn back_pages(ptr: *mut u8, size: usize) {
    sys::back_pages(ptr, size);
}

/// Mark the range as a candidate for kernel huge-page promotion.
///
/// # Safety
/// `ptr` and `size` must refer to a valid mapped region, huge-page-aligned.
#[inline]
pub unsafe fn advise_hugepage(ptr: *mut u8, size: usize) {
    sys::advise_hugepage(ptr, size);
}

/// Abort with a diagnostic message to stderr.
/// Used when bookkeeping corruption is detected; the allocator never unwinds.
#[cold]
#[inline(never)]
pub fn abort_with_message(msg: &str) -> ! {
    unsafe {
        // Write directly to stderr fd (2) -- no allocation needed
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort();
    }
}
