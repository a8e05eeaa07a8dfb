//! A segregated free list allocator with boundary-tag coalescing
//!
//! # Features
//!
//! - One contiguous heap that only grows, obtained in bulk from a [`HeapSource`] (an `sbrk`-like
//!   primitive)
//!
//! - Nine LIFO free lists segregated by size: `(0, 16]`, `(16, 32]`, ..., `(1024, 2048]` and
//!   `(2048, ∞)`
//!
//! - "Second fit" placement: within a size class the first two fitting blocks are compared and the
//!   one leaving the smaller remainder wins
//!
//! - Only 4 bytes of metadata per allocated block: allocated blocks have no footer, the next block
//!   remembers whether its predecessor is allocated
//!
//! - Immediate coalescing of free neighbors
//!
//! - An in-band consistency checker, [`SegAlloc::check_heap`]
//!
//! # Example
//!
//! ```
//! use segalloc::{Region, SegAlloc};
//!
//! let mut memory = [0u8; 4096];
//! let mut heap = SegAlloc::new(Region::new(&mut memory));
//! heap.init().unwrap();
//!
//! unsafe {
//!     let p = heap.alloc(100).unwrap();
//!     p.as_ptr().write_bytes(0xAA, 100);
//!
//!     let q = heap.realloc(Some(p), 200).unwrap();
//!     assert_eq!(*q.as_ptr(), 0xAA);
//!
//!     heap.dealloc(Some(q));
//! }
//!
//! assert!(heap.check_heap(false).is_ok());
//! ```
//!
//! # Heap layout
//!
//! ``` text
//! heap_lo                                                                   heap_hi
//! | pad | prologue hdr | prologue ftr | block | block | ... | block | epilogue hdr |
//!   4B        4B             4B
//! ```
//!
//! Every block starts with a 4-byte header holding its size (a multiple of 8) and two flags: the
//! block's own allocated bit and the allocated bit of the block physically before it. Free blocks
//! additionally store two 4-byte list links right after the header and a footer (a copy of the
//! size and allocated bit) in their last word, so the smallest block is 16 bytes. Payloads are
//! 8-byte aligned.
//!
//! # Cargo features
//!
//! - `mmap` (default): provides [`MmapRegion`], a heap source backed by an anonymous `mmap`
//! - `ufmt`: `ufmt::uDebug` implementations
//! - `checked`: runs [`SegAlloc::check_heap`] on entry to every allocation operation and panics
//!   on the first violation
//!
//! # Limitations
//!
//! Free list links are stored as 32-bit offsets from the start of the heap, so a heap can't grow
//! past 4 GiB. The allocator is not thread safe; wrap it in a lock to share it.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]
#![deny(rust_2018_compatibility)]
#![deny(rust_2018_idioms)]

use core::{cmp, fmt, ptr, ptr::NonNull};

use log::{debug, trace};

pub use crate::{
    check::HeapError,
    consts::{ALIGN_SIZE, CHUNK_SIZE, MIN_BLOCK_SIZE, NUM_CLASSES},
    source::{HeapSource, Region},
};
#[cfg(all(feature = "mmap", unix))]
pub use crate::source::MmapRegion;
use crate::{
    block::{Block, BlockHeader},
    free_block::FreeBlock,
};

#[macro_use]
mod macros;
mod block;
mod check;
mod consts;
mod free_block;
mod source;
mod util;

type Offset = core::num::NonZeroU32;

/// The heap source could not provide the memory needed to (re)initialize the heap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("heap source exhausted")
    }
}

/// The segregated free list allocator
///
/// Owns its heap source, the heap base and the heads of the nine free lists, so several
/// independent heaps can coexist.
pub struct SegAlloc<S> {
    source: S,
    // `heap_lo` at the time of `init`; `None` until then
    base: Option<NonNull<u8>>,
    free_lists: [Option<Offset>; consts::NUM_CLASSES],
}

impl<S> SegAlloc<S> {
    /* Constructors */
    /// Constructs an allocator over `source`; no memory is requested until [`init`] or the first
    /// allocation
    ///
    /// [`init`]: SegAlloc::init
    pub const fn new(source: S) -> Self {
        Self {
            source,
            base: None,
            free_lists: [None; consts::NUM_CLASSES],
        }
    }

    /// The heap source
    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: HeapSource> SegAlloc<S> {
    /* Public API */
    /// Resets the heap and lays out an empty one: the prologue and epilogue sentinels plus a single
    /// free block of [`CHUNK_SIZE`] bytes
    ///
    /// Every pointer previously handed out becomes dangling.
    pub fn init(&mut self) -> Result<(), OutOfMemory> {
        self.source.reset();
        self.base = None;
        self.free_lists = [None; consts::NUM_CLASSES];

        let base = self
            .source
            .sbrk(consts::INITIAL_HEAP_SIZE)
            .ok_or(OutOfMemory)?;
        debug_assert_eq!(base.as_ptr() as usize % consts::ALIGN_SIZE, 0);

        unsafe {
            let words = base.as_ptr() as *mut BlockHeader;

            // alignment padding
            ptr::write(words, BlockHeader::pack(0, false));
            // prologue header and footer
            ptr::write(words.add(1), BlockHeader::pack(consts::PROLOGUE_SIZE, true));
            ptr::write(words.add(2), BlockHeader::pack(consts::PROLOGUE_SIZE, true));
            // epilogue, preceded by the (allocated) prologue
            let mut epilogue = BlockHeader::pack(0, true);
            epilogue.set_prev_alloc_bit(true);
            ptr::write(words.add(3), epilogue);

            self.base = Some(base);

            self.extend(consts::CHUNK_SIZE).ok_or(OutOfMemory)?;
        }

        debug!("initialized heap at {:p}", base);

        Ok(())
    }

    /// Allocates a block with room for at least `size` bytes
    ///
    /// The returned pointer is 8-byte aligned. Returns `None` when `size` is zero or the heap
    /// source is exhausted. Initializes the heap if needed.
    ///
    /// # Safety
    ///
    /// No pointer obtained before the last [`init`](SegAlloc::init) may be used afterwards.
    pub unsafe fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        #[cfg(feature = "checked")]
        self.assert_consistent();

        if size == 0 {
            return None;
        }

        if self.base.is_none() {
            self.init().ok()?;
        }

        let asize = util::adjust_request(size)?;

        let fb = if let Some(fb) = self.find_fit(asize) {
            fb
        } else {
            // no fit; grow the heap
            self.extend(cmp::max(asize, consts::CHUNK_SIZE))?
        };

        let block = self.place(fb, asize);
        trace!("alloc({}) -> {:?}", size, block);

        Some(block.data_pointer())
    }

    /// Returns the block referenced by `ptr` to the heap; `None` is a no-op
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc`, `realloc` or `alloc_zeroed` on this allocator and must not
    /// have been freed already.
    pub unsafe fn dealloc(&mut self, ptr: Option<NonNull<u8>>) {
        let ptr = if let Some(ptr) = ptr {
            ptr
        } else {
            return;
        };

        #[cfg(feature = "checked")]
        self.assert_consistent();

        debug_assert!(self.contains(ptr));

        let block = Block::from_data_pointer(ptr);
        debug_assert!(block.is_alloc());

        trace!("dealloc({:?})", block);

        let fb = block.into_free();
        let mut next = fb.block().next_neighbor();
        next.set_prev_alloc_bit(false);

        self.coalesce(fb);
    }

    /// Moves the allocation referenced by `ptr` to a fresh block of at least `size` bytes
    ///
    /// The first `min(size, old capacity)` bytes are preserved. `size == 0` frees `ptr` and returns
    /// `None`; `ptr == None` behaves like [`alloc`](SegAlloc::alloc). If the new block can't be
    /// allocated `ptr` is left untouched and `None` is returned.
    ///
    /// # Safety
    ///
    /// Same as [`dealloc`](SegAlloc::dealloc).
    pub unsafe fn realloc(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            self.dealloc(ptr);
            return None;
        }

        let old = if let Some(old) = ptr {
            old
        } else {
            return self.alloc(size);
        };

        let new = self.alloc(size)?;

        let old_size = self.usable_size(old);
        ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), cmp::min(size, old_size));
        self.dealloc(Some(old));

        Some(new)
    }

    /// Allocates room for `count` elements of `size` bytes each and zeroes it
    ///
    /// Returns `None` if `count * size` overflows or is zero, or the heap is exhausted.
    ///
    /// # Safety
    ///
    /// Same as [`alloc`](SegAlloc::alloc).
    pub unsafe fn alloc_zeroed(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let bytes = count.checked_mul(size)?;
        let ptr = self.alloc(bytes)?;
        ptr::write_bytes(ptr.as_ptr(), 0, bytes);

        Some(ptr)
    }

    /// Number of bytes the caller may use through `ptr`; at least what was requested
    ///
    /// # Safety
    ///
    /// `ptr` must reference a live allocation of this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        debug_assert!(self.contains(ptr));

        Block::from_data_pointer(ptr).usable_size()
    }

    /// Number of bytes obtained from the heap source so far
    pub fn heap_size(&self) -> usize {
        if self.base.is_some() {
            self.source.heap_size()
        } else {
            0
        }
    }

    /* Private API */
    /// Grows the heap by at least `bytes` and returns the resulting free block, already merged with
    /// a free block that ended at the old epilogue and already listed
    unsafe fn extend(&mut self, bytes: usize) -> Option<FreeBlock> {
        self.base?;

        let (size, _) = util::round_up(bytes, consts::ALIGN_SIZE)?;
        if self.source.heap_size().checked_add(size)? > consts::MAX_HEAP_SIZE {
            debug!("refusing to grow past {} bytes", consts::MAX_HEAP_SIZE);
            return None;
        }

        let start = self.source.sbrk(size)?;

        // the old epilogue header becomes the header of the new block
        let header = start.as_ptr().sub(BlockHeader::SIZE);
        let epilogue = Block::new_unchecked(header as *mut _);
        debug_assert!(epilogue.size() == 0 && epilogue.is_alloc());

        let fb = FreeBlock::from_parts(header as *mut _, size, epilogue.is_prev_alloc());
        ptr::write(fb.block().next_neighbor().header(), BlockHeader::pack(0, true));

        debug!("grew heap by {} bytes; {} bytes total", size, self.source.heap_size());

        Some(self.coalesce(fb))
    }

    /// Merges an unlinked free block with its free neighbors and lists the result
    unsafe fn coalesce(&mut self, fb: FreeBlock) -> FreeBlock {
        let fb = self.merge_prev(fb);
        let fb = self.merge_next(fb);

        self.insert(fb);

        fb
    }

    unsafe fn merge_prev(&mut self, unlinked: FreeBlock) -> FreeBlock {
        if let Some(mut prev) = unlinked.block().prev_neighbor() {
            self.unlink(prev);

            // the merged block keeps `prev`'s header, and its prev-allocated bit
            let size = prev.size();
            prev.resize(size + unlinked.size());
            trace!("merged {:?} into its predecessor", unlinked.header());

            prev
        } else {
            // previous block is being used; nothing to do
            unlinked
        }
    }

    unsafe fn merge_next(&mut self, mut unlinked: FreeBlock) -> FreeBlock {
        let next = unlinked.block().next_neighbor();

        if next.is_alloc() {
            // next block is being used (or is the epilogue); nothing to do
            unlinked
        } else {
            let next = FreeBlock::new_unchecked(next.header() as *mut _);
            self.unlink(next);

            let size = unlinked.size();
            unlinked.resize(size + next.size());
            trace!("merged {:?} into its predecessor", next.header());

            unlinked
        }
    }

    /// Searches the size classes upwards from the one `asize` maps to
    unsafe fn find_fit(&self, asize: usize) -> Option<FreeBlock> {
        (util::size_class(asize)..consts::NUM_CLASSES)
            .find_map(|class| self.second_fit(class, asize))
    }

    /// Picks, out of the first two blocks of `class` that can hold `asize` bytes, the one that
    /// leaves the smaller remainder
    unsafe fn second_fit(&self, class: usize, asize: usize) -> Option<FreeBlock> {
        let mut fits = self.free_list(class).filter(|fb| fb.size() >= asize);

        let first = fits.next()?;
        match fits.next() {
            Some(second) if second.size() < first.size() => Some(second),
            _ => Some(first),
        }
    }

    /// Turns the listed free block `fb` into an allocated block of `asize` bytes, splitting off the
    /// excess if it can form a block of its own
    unsafe fn place(&mut self, fb: FreeBlock, asize: usize) -> Block {
        debug_assert!(fb.size() >= asize);

        self.unlink(fb);

        let block = if fb.size() - asize < consts::MIN_BLOCK_SIZE {
            fb.into_used()
        } else {
            let (left, right) = fb.split(asize);
            self.insert(right);
            left
        };

        let mut next = block.next_neighbor();
        next.set_prev_alloc_bit(true);

        block
    }

    /// Pushes `block` at the head of the list of its size class
    unsafe fn insert(&mut self, mut block: FreeBlock) {
        let base = self.base();
        let i = util::size_class(block.size());
        let offset = block.offset(base);

        let head = self.free_lists[i];
        if let Some(head) = head {
            FreeBlock::from_offset(base, head).set_prev_free(Some(offset));
        }

        block.set_next_free(head);
        block.set_prev_free(None);
        self.free_lists[i] = Some(offset);
    }

    /// Removes `block` from the list of its size class; must be called before the size changes
    unsafe fn unlink(&mut self, mut block: FreeBlock) {
        let base = self.base();
        let next = block.next_free();
        let prev = block.prev_free();

        if let Some(prev) = prev {
            FreeBlock::from_offset(base, prev).set_next_free(next);
        } else {
            // this is the head of the list
            let i = util::size_class(block.size());
            debug_assert_eq!(self.free_lists[i], Some(block.offset(base)));

            self.free_lists[i] = next;
        }

        if let Some(next) = next {
            FreeBlock::from_offset(base, next).set_prev_free(prev);
        }

        block.set_next_free(None);
        block.set_prev_free(None);
    }

    fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        addr >= self.source.heap_lo() as usize && addr <= self.source.heap_hi() as usize
    }

    #[cfg(feature = "checked")]
    fn assert_consistent(&self) {
        if let Err(e) = self.check_heap(false) {
            panic!("heap check failed: {}", e);
        }
    }
}

impl<S> SegAlloc<S> {
    /* Getters */
    unsafe fn base(&self) -> NonNull<u8> {
        self.base.unwrap_or_else(|| assume_unreachable!())
    }

    /// Every listed free block, in list order, tagged with its size class
    #[cfg(test)]
    fn free_blocks(&self) -> impl Iterator<Item = (usize, FreeBlock)> + '_ {
        (0..consts::NUM_CLASSES)
            .flat_map(move |class| self.free_list(class).map(move |fb| (class, fb)))
    }

    fn free_list(&self, class: usize) -> FreeListIterator {
        FreeListIterator {
            base: self.base,
            head: self.free_lists[class],
        }
    }
}

struct FreeListIterator {
    base: Option<NonNull<u8>>,
    head: Option<Offset>,
}

impl Iterator for FreeListIterator {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<FreeBlock> {
        let head = self.head?;
        let base = self.base?;

        let fb = unsafe { FreeBlock::from_offset(base, head) };
        self.head = fb.next_free();
        Some(fb)
    }
}

struct FreeBlocks<'a, S>(&'a SegAlloc<S>);

#[cfg(feature = "ufmt")]
impl<S> ufmt::uDebug for FreeBlocks<'_, S> {
    fn fmt<W>(&self, f: &mut ufmt::Formatter<'_, W>) -> Result<(), W::Error>
    where
        W: ufmt::uWrite + ?Sized,
    {
        let mut map = f.debug_map()?;
        for class in (0..consts::NUM_CLASSES).filter(|&class| self.0.free_lists[class].is_some()) {
            map.entry(&class, &List(self.0.free_list(class)))?;
        }
        map.finish()
    }
}

impl<S> fmt::Debug for FreeBlocks<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for class in (0..consts::NUM_CLASSES).filter(|&class| self.0.free_lists[class].is_some()) {
            map.entry(&class, &List(self.0.free_list(class)));
        }
        map.finish()
    }
}

struct List(FreeListIterator);

#[cfg(feature = "ufmt")]
impl ufmt::uDebug for List {
    fn fmt<W>(&self, f: &mut ufmt::Formatter<'_, W>) -> Result<(), W::Error>
    where
        W: ufmt::uWrite + ?Sized,
    {
        f.debug_list()?
            .entries(FreeListIterator {
                base: self.0.base,
                head: self.0.head,
            })?
            .finish()
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(FreeListIterator {
                base: self.0.base,
                head: self.0.head,
            })
            .finish()
    }
}

#[cfg(feature = "ufmt")]
impl<S: HeapSource> ufmt::uDebug for SegAlloc<S> {
    fn fmt<W>(&self, f: &mut ufmt::Formatter<'_, W>) -> Result<(), W::Error>
    where
        W: ufmt::uWrite + ?Sized,
    {
        f.debug_struct("SegAlloc")?
            .field("base", &self.base.map(|base| base.as_ptr() as usize))?
            .field("heap_size", &self.heap_size())?
            .field("free_blocks", &FreeBlocks(self))?
            .finish()
    }
}

impl<S: HeapSource> fmt::Debug for SegAlloc<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegAlloc")
            .field("base", &self.base)
            .field("heap_size", &self.heap_size())
            .field("free_blocks", &FreeBlocks(self))
            .finish()
    }
}
