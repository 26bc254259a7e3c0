use std::ffi::{c_void, CStr};
use std::mem::size_of;
use std::ptr::{self, NonNull};

use log::{debug, trace};
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};

use crate::errors::PeError;

/// Rounds `value` up to the next multiple of `alignment` (a power of two).
/// Wraps on overflow; callers detect that as `result < value`.
pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    value.wrapping_add(alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to the previous multiple of `alignment`.
pub(crate) fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// Owner of the single contiguous virtual-memory reservation that hosts a
/// mapped image.
///
/// The reservation is created read-write (reserve + commit) and released
/// with `MEM_RELEASE` on drop, which keeps every load-failure path free of
/// leaked mappings.
pub(crate) struct Arena {
    base: NonNull<u8>,
    size: usize,
}

impl Arena {
    /// Reserves and commits `align_up(size, page_size)` bytes.
    ///
    /// The first attempt asks for placement at `preferred_base`; if the OS
    /// refuses, a second attempt lets it pick any address.
    pub fn allocate(preferred_base: usize, size: usize, page_size: usize) -> Result<Self, PeError> {
        let aligned = align_up(size, page_size);
        if aligned == 0 || aligned < size {
            return Err(PeError::AllocationFailed(size));
        }

        unsafe {
            let mut base = VirtualAlloc(
                preferred_base as *const c_void,
                aligned,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            );

            if base.is_null() {
                trace!("arena: preferred base {preferred_base:#x} unavailable, retrying anywhere");
                base = VirtualAlloc(
                    ptr::null(),
                    aligned,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                );
            }

            match NonNull::new(base as *mut u8) {
                Some(base) => {
                    debug!("arena: {aligned:#x} bytes at {:p}", base.as_ptr());
                    Ok(Self {
                        base,
                        size: aligned,
                    })
                }
                None => Err(PeError::AllocationFailed(aligned)),
            }
        }
    }

    /// Returns the base address of the reservation.
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Returns the reservation size in bytes (page-rounded).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns a pointer to `len` bytes at `offset`, or `None` when the
    /// range leaves the reservation.
    pub fn slice_at(&self, offset: usize, len: usize) -> Option<*mut u8> {
        offset
            .checked_add(len)
            .filter(|&end| end <= self.size)
            .map(|_| unsafe { self.base.as_ptr().add(offset) })
    }

    /// Bounds-checked unaligned read of a `T` at `offset`.
    pub fn read_at<T: Copy>(&self, offset: usize) -> Option<T> {
        self.slice_at(offset, size_of::<T>())
            .map(|p| unsafe { ptr::read_unaligned(p as *const T) })
    }

    /// Returns the NUL-terminated string starting at `offset`, bounded by
    /// the end of the reservation.
    pub fn cstr_at(&self, offset: usize) -> Option<&CStr> {
        if offset >= self.size {
            return None;
        }

        let bytes = unsafe {
            std::slice::from_raw_parts(self.base.as_ptr().add(offset), self.size - offset)
        };
        CStr::from_bytes_until_nul(bytes).ok()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            VirtualFree(self.base.as_ptr() as *mut c_void, 0, MEM_RELEASE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(0, 0x1000), 0);
        assert_eq!(align_up(1, 0x1000), 0x1000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert_eq!(align_down(0x1000, 0x1000), 0x1000);
    }

    #[test]
    fn allocation_is_page_rounded_and_zeroed() {
        let arena = Arena::allocate(0, 0x1234, 0x1000).unwrap();
        assert_eq!(arena.size(), 0x2000);
        let tail: u8 = arena.read_at(arena.size() - 1).unwrap();
        assert_eq!(tail, 0);
        assert!(arena.slice_at(arena.size(), 1).is_none());
        assert!(arena.read_at::<u64>(arena.size() - 4).is_none());
    }

    #[test]
    fn zero_sized_allocation_fails() {
        assert!(matches!(
            Arena::allocate(0, 0, 0x1000),
            Err(PeError::AllocationFailed(_))
        ));
    }

    #[test]
    fn cstr_reads_are_bounded() {
        let arena = Arena::allocate(0, 0x1000, 0x1000).unwrap();
        // Freshly committed pages are zeroed, so offset 0 is an empty string.
        assert_eq!(arena.cstr_at(0).unwrap().to_bytes(), b"");
        assert!(arena.cstr_at(arena.size()).is_none());
    }
}
