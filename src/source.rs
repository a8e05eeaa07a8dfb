//! Where the heap comes from
//!
//! The allocator never frees memory back; it only asks its [`HeapSource`] to move the break up.

use core::{marker::PhantomData, ptr::NonNull};

use crate::{consts, util};

/// A contiguous region that can only grow upwards, in the style of `sbrk(2)`
///
/// Implementations must never move or shrink memory already handed out (except through
/// [`reset`](HeapSource::reset)) and must return 8-byte aligned memory.
pub trait HeapSource {
    /// Extends the heap by `incr` bytes and returns the old break, i.e. the start of the new
    /// bytes; returns `None` when the source is exhausted
    fn sbrk(&mut self, incr: usize) -> Option<NonNull<u8>>;

    /// First byte of the heap
    fn heap_lo(&self) -> *mut u8;

    /// Last byte of the heap; `heap_lo() - 1` while the heap is empty
    fn heap_hi(&self) -> *mut u8;

    /// Gives back every byte obtained so far and rewinds the break to `heap_lo`
    fn reset(&mut self);

    /// Number of bytes obtained so far
    fn heap_size(&self) -> usize {
        (self.heap_hi() as usize).wrapping_sub(self.heap_lo() as usize).wrapping_add(1)
    }
}

/// A [`HeapSource`] carved out of a caller provided slice
///
/// The start of `memory` is aligned up to 8 bytes so a few bytes may go unused.
pub struct Region<'a> {
    start: NonNull<u8>,
    len: usize,
    brk: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> Region<'a> {
    /// Wraps `memory`; its contents are clobbered as the heap grows over it
    pub fn new(memory: &'a mut [u8]) -> Self {
        let ptr = memory.as_mut_ptr();
        let padding = (consts::ALIGN_SIZE - ptr as usize % consts::ALIGN_SIZE) % consts::ALIGN_SIZE;
        let len = util::round_down(memory.len().saturating_sub(padding), consts::ALIGN_SIZE);

        Region {
            start: unsafe { NonNull::new_unchecked(ptr.add(padding.min(memory.len()))) },
            len,
            brk: 0,
            _marker: PhantomData,
        }
    }

    /// Total number of bytes the heap may grow to
    pub fn capacity(&self) -> usize {
        self.len
    }
}

impl HeapSource for Region<'_> {
    fn sbrk(&mut self, incr: usize) -> Option<NonNull<u8>> {
        sbrk_within(self.start, self.len, &mut self.brk, incr)
    }

    fn heap_lo(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    fn heap_hi(&self) -> *mut u8 {
        self.start.as_ptr().wrapping_add(self.brk).wrapping_sub(1)
    }

    fn reset(&mut self) {
        self.brk = 0;
    }
}

fn sbrk_within(
    start: NonNull<u8>,
    len: usize,
    brk: &mut usize,
    incr: usize,
) -> Option<NonNull<u8>> {
    let new_brk = brk.checked_add(incr)?;
    if new_brk > len {
        log::debug!("heap source exhausted: {} + {} > {}", brk, incr, len);
        return None;
    }

    let old = unsafe { NonNull::new_unchecked(start.as_ptr().add(*brk)) };
    *brk = new_brk;
    Some(old)
}

#[cfg(all(feature = "mmap", unix))]
pub use self::mmap::MmapRegion;

#[cfg(all(feature = "mmap", unix))]
mod mmap {
    use core::ptr::{self, NonNull};

    use super::{sbrk_within, HeapSource};
    use crate::{consts, util, OutOfMemory};

    /// A [`HeapSource`] backed by an anonymous memory mapping of fixed capacity
    ///
    /// The whole capacity is reserved up front so the heap never moves; pages are only touched as
    /// the break moves over them.
    pub struct MmapRegion {
        start: NonNull<u8>,
        len: usize,
        brk: usize,
    }

    impl MmapRegion {
        /// Default capacity: 64 MiB
        pub const DEFAULT_CAPACITY: usize = 64 << 20;

        /// Maps `capacity` bytes (rounded up to 8, capped at the largest heap the allocator can
        /// address)
        pub fn with_capacity(capacity: usize) -> Result<Self, OutOfMemory> {
            let len = util::round_up(capacity.min(consts::MAX_HEAP_SIZE), consts::ALIGN_SIZE)
                .ok_or(OutOfMemory)?
                .0;
            if len == 0 {
                return Err(OutOfMemory);
            }

            let addr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };

            if addr == libc::MAP_FAILED {
                log::error!("mmap of {} bytes failed", len);
                return Err(OutOfMemory);
            }

            log::debug!("mapped {} bytes at {:p}", len, addr);

            Ok(MmapRegion {
                start: NonNull::new(addr as *mut u8).ok_or(OutOfMemory)?,
                len,
                brk: 0,
            })
        }

        /// Maps a region of [`DEFAULT_CAPACITY`](Self::DEFAULT_CAPACITY) bytes
        pub fn new() -> Result<Self, OutOfMemory> {
            Self::with_capacity(Self::DEFAULT_CAPACITY)
        }

        /// Total number of bytes the heap may grow to
        pub fn capacity(&self) -> usize {
            self.len
        }
    }

    impl HeapSource for MmapRegion {
        fn sbrk(&mut self, incr: usize) -> Option<NonNull<u8>> {
            sbrk_within(self.start, self.len, &mut self.brk, incr)
        }

        fn heap_lo(&self) -> *mut u8 {
            self.start.as_ptr()
        }

        fn heap_hi(&self) -> *mut u8 {
            self.start.as_ptr().wrapping_add(self.brk).wrapping_sub(1)
        }

        fn reset(&mut self) {
            self.brk = 0;
        }
    }

    impl Drop for MmapRegion {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start.as_ptr() as *mut libc::c_void, self.len);
            }
        }
    }
}
