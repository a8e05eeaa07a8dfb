use core::{fmt, mem, ops, ptr, ptr::NonNull};

use crate::{
    block::{Block, BlockHeader},
    consts, Offset,
};

#[repr(C)]
pub struct FreeBlockHeader {
    // inheritance
    block: BlockHeader,
    next_free: Option<Offset>,
    prev_free: Option<Offset>,
}

impl FreeBlockHeader {
    pub const SIZE: usize = mem::size_of::<Self>();

    /* Setters */
    pub fn set_next_free(&mut self, next_free: Option<Offset>) {
        self.next_free = next_free;
    }

    pub fn set_prev_free(&mut self, prev_free: Option<Offset>) {
        self.prev_free = prev_free;
    }

    /* Getters */
    pub fn next_free(&self) -> Option<Offset> {
        self.next_free
    }

    pub fn prev_free(&self) -> Option<Offset> {
        self.prev_free
    }
}

impl ops::Deref for FreeBlockHeader {
    type Target = BlockHeader;

    fn deref(&self) -> &BlockHeader {
        &self.block
    }
}

impl ops::DerefMut for FreeBlockHeader {
    fn deref_mut(&mut self) -> &mut BlockHeader {
        &mut self.block
    }
}

/// A free block; doubles as a node of one of the segregated lists
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct FreeBlock {
    header: NonNull<FreeBlockHeader>,
}

impl FreeBlock {
    /* Constructors */
    pub unsafe fn new_unchecked(header: *mut FreeBlockHeader) -> Self {
        debug_assert_eq!((header as usize + BlockHeader::SIZE) % consts::ALIGN_SIZE, 0);

        FreeBlock {
            header: NonNull::new_unchecked(header),
        }
    }

    /// Writes a fresh, unlinked free block of `size` bytes at `header`, footer included
    pub unsafe fn from_parts(header: *mut FreeBlockHeader, size: usize, prev_alloc: bool) -> Self {
        debug_assert_eq!(size % consts::ALIGN_SIZE, 0);
        debug_assert!(size >= consts::MIN_BLOCK_SIZE);

        let mut block = BlockHeader::pack(size, false);
        block.set_prev_alloc_bit(prev_alloc);
        ptr::write(
            header,
            FreeBlockHeader {
                block,
                next_free: None,
                prev_free: None,
            },
        );

        let fb = FreeBlock::new_unchecked(header);
        fb.block().write_footer();
        fb
    }

    pub unsafe fn from_offset(base: NonNull<u8>, offset: Offset) -> Self {
        let header = base.as_ptr().add(offset.get() as usize);
        debug_assert!(!Block::new_unchecked(header as *mut _).is_alloc());

        FreeBlock::new_unchecked(header as *mut _)
    }

    /* Getters */
    /// Position of this block's header relative to the heap `base`
    pub fn offset(&self, base: NonNull<u8>) -> Offset {
        unsafe {
            let delta = (self.header.as_ptr() as usize)
                .checked_sub(base.as_ptr() as usize)
                .unwrap_or_else(|| assume_unreachable!());

            Offset::new(u32::try_from(delta).unwrap_or_else(|_| assume_unreachable!()))
                .unwrap_or_else(|| assume_unreachable!())
        }
    }

    pub fn header(&self) -> *mut FreeBlockHeader {
        self.header.as_ptr()
    }

    pub fn block(&self) -> Block {
        unsafe { Block::new_unchecked(self.header() as *mut _) }
    }

    /* Miscellaneous */
    /// Grows (or shrinks) this block in place and rewrites its footer; flags are preserved
    pub unsafe fn resize(&mut self, size: usize) {
        debug_assert!(size >= consts::MIN_BLOCK_SIZE);

        self.set_size(size);
        self.block().write_footer();
    }

    /// Splits this block in an allocated block of `n` bytes and a free remainder
    ///
    /// The remainder is unlinked and physically follows the allocated block.
    pub unsafe fn split(self, n: usize) -> (Block, FreeBlock) {
        debug_assert_eq!(n % consts::ALIGN_SIZE, 0);

        let total = self.size();
        debug_assert!(total >= n + consts::MIN_BLOCK_SIZE);

        let mut left = self.into_used();
        left.set_size(n);

        let start = (left.header() as *mut u8).add(n);
        let right = FreeBlock::from_parts(start as *mut _, total - n, true);

        (left, right)
    }

    pub fn into_used(self) -> Block {
        let mut block = self.block();
        block.set_alloc_bit(true);
        block
    }
}

#[cfg(feature = "ufmt")]
impl ufmt::uDebug for FreeBlock {
    fn fmt<W>(&self, f: &mut ufmt::Formatter<'_, W>) -> Result<(), W::Error>
    where
        W: ufmt::uWrite + ?Sized,
    {
        f.debug_struct("FreeBlock")?
            .field("header", &(self.header() as usize))?
            .field("size", &self.size())?
            .field("prev_alloc", &self.is_prev_alloc())?
            .field("next_free", &self.next_free().map(Offset::get))?
            .field("prev_free", &self.prev_free().map(Offset::get))?
            .finish()
    }
}

impl fmt::Debug for FreeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeBlock")
            .field("header", &self.header())
            .field("size", &self.size())
            .field("prev_alloc", &self.is_prev_alloc())
            .field("next_free", &self.next_free())
            .field("prev_free", &self.prev_free())
            .finish()
    }
}

impl ops::Deref for FreeBlock {
    type Target = FreeBlockHeader;

    fn deref(&self) -> &FreeBlockHeader {
        unsafe { &*self.header.as_ptr() }
    }
}

impl ops::DerefMut for FreeBlock {
    fn deref_mut(&mut self) -> &mut FreeBlockHeader {
        unsafe { &mut *self.header.as_ptr() }
    }
}
