//! Huge-page-aligned allocation for the transposition table.
//!
//! Large pages are attempted first (mmap with `MAP_HUGETLB` on Linux,
//! `VirtualAlloc` with `MEM_LARGE_PAGES` on Windows). Missing the large
//! pages is fine and falls back to an ordinary aligned allocation; getting
//! no memory at all is the caller's fatal problem.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

#[cfg(target_os = "linux")]
const FALLBACK_ALIGN: usize = 2 * 1024 * 1024;
#[cfg(not(target_os = "linux"))]
const FALLBACK_ALIGN: usize = 4096;

#[cfg(target_os = "linux")]
const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

enum Backing {
    #[cfg(target_os = "linux")]
    HugePages { bytes: usize },
    #[cfg(target_os = "windows")]
    LargePages,
    Std { layout: Layout },
}

/// One zero-filled allocation, freed exactly once on drop.
pub struct LargePageAlloc {
    ptr: NonNull<u8>,
    backing: Backing,
}

impl LargePageAlloc {
    /// Zeroed allocation of at least `bytes` bytes. Returns `None` only
    /// when every allocation path failed.
    pub fn zeroed(bytes: usize) -> Option<Self> {
        debug_assert!(bytes > 0);

        if let Some(alloc) = Self::try_large_pages(bytes) {
            return Some(alloc);
        }

        let layout = Layout::from_size_align(bytes, FALLBACK_ALIGN).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)?;

        #[cfg(target_os = "linux")]
        unsafe {
            libc::madvise(ptr.as_ptr().cast(), bytes, libc::MADV_HUGEPAGE);
        }

        Some(Self {
            ptr,
            backing: Backing::Std { layout },
        })
    }

    #[cfg(target_os = "linux")]
    fn try_large_pages(bytes: usize) -> Option<Self> {
        // MAP_HUGETLB requires a multiple of the huge page size
        let rounded = (bytes + HUGE_PAGE_SIZE - 1) & !(HUGE_PAGE_SIZE - 1);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                rounded,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        Some(Self {
            ptr: NonNull::new(ptr.cast())?,
            backing: Backing::HugePages { bytes: rounded },
        })
    }

    #[cfg(target_os = "windows")]
    fn try_large_pages(bytes: usize) -> Option<Self> {
        use windows_sys::Win32::System::Memory::{
            VirtualAlloc, MEM_COMMIT, MEM_LARGE_PAGES, MEM_RESERVE, PAGE_READWRITE,
        };
        let ptr = unsafe {
            VirtualAlloc(
                std::ptr::null(),
                bytes,
                MEM_RESERVE | MEM_COMMIT | MEM_LARGE_PAGES,
                PAGE_READWRITE,
            )
        };
        Some(Self {
            ptr: NonNull::new(ptr.cast())?,
            backing: Backing::LargePages,
        })
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    fn try_large_pages(_bytes: usize) -> Option<Self> {
        None
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Whether the backing memory actually sits on large pages
    pub fn on_large_pages(&self) -> bool {
        !matches!(self.backing, Backing::Std { .. })
    }
}

impl Drop for LargePageAlloc {
    fn drop(&mut self) {
        match self.backing {
            #[cfg(target_os = "linux")]
            Backing::HugePages { bytes } => unsafe {
                libc::munmap(self.ptr.as_ptr().cast(), bytes);
            },
            #[cfg(target_os = "windows")]
            Backing::LargePages => unsafe {
                use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
                VirtualFree(self.ptr.as_ptr().cast(), 0, MEM_RELEASE);
            },
            Backing::Std { layout } => unsafe {
                dealloc(self.ptr.as_ptr(), layout);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_zeroed_and_aligned() {
        let alloc = LargePageAlloc::zeroed(1 << 20).expect("1 MiB allocation failed");
        let ptr = alloc.as_ptr();
        assert_eq!(ptr as usize % 4096, 0);
        let slice = unsafe { std::slice::from_raw_parts(ptr, 1 << 20) };
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_drop_and_realloc() {
        for _ in 0..4 {
            let alloc = LargePageAlloc::zeroed(1 << 16).unwrap();
            unsafe { alloc.as_ptr().write(0xAB) };
        }
    }
}
