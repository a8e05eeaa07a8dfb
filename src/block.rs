use core::{fmt, mem, ops, ptr, ptr::NonNull};

use crate::{consts, free_block::FreeBlock};

/// A header or footer word
///
/// The low three bits of the size are always zero (sizes are multiples of 8) so they carry the
/// flags. Footers only mirror the size and the allocated bit.
#[repr(transparent)]
pub struct BlockHeader {
    word: u32,
}

impl BlockHeader {
    pub const SIZE: usize = mem::size_of::<BlockHeader>();

    const ALLOC_BIT: u32 = 1 << 0;
    const PREV_ALLOC_BIT: u32 = 1 << 1;
    const FLAG_BITS: u32 = 0b111;

    /// Packs a size and an allocated flag into a header word, prev-allocated cleared
    pub fn pack(size: usize, alloc: bool) -> Self {
        debug_assert_eq!(size % consts::ALIGN_SIZE, 0);
        debug_assert!(size <= consts::MAX_HEAP_SIZE);

        BlockHeader {
            word: size as u32 | if alloc { Self::ALLOC_BIT } else { 0 },
        }
    }

    /* Setters */
    pub fn set_size(&mut self, size: usize) {
        debug_assert_eq!(size % consts::ALIGN_SIZE, 0);
        debug_assert!(size <= consts::MAX_HEAP_SIZE);

        self.word = size as u32 | (self.word & Self::FLAG_BITS);
    }

    pub fn set_alloc_bit(&mut self, alloc: bool) {
        if alloc {
            self.word |= Self::ALLOC_BIT;
        } else {
            self.word &= !Self::ALLOC_BIT;
        }
    }

    pub fn set_prev_alloc_bit(&mut self, prev_alloc: bool) {
        if prev_alloc {
            self.word |= Self::PREV_ALLOC_BIT;
        } else {
            self.word &= !Self::PREV_ALLOC_BIT;
        }
    }

    /* Getters */
    pub fn size(&self) -> usize {
        (self.word & !Self::FLAG_BITS) as usize
    }

    pub fn is_alloc(&self) -> bool {
        self.word & Self::ALLOC_BIT != 0
    }

    pub fn is_prev_alloc(&self) -> bool {
        self.word & Self::PREV_ALLOC_BIT != 0
    }

    /// The part of the header a footer mirrors
    pub fn tag(&self) -> u32 {
        self.word & !Self::PREV_ALLOC_BIT
    }

    fn mirror(&self) -> Self {
        BlockHeader { word: self.tag() }
    }
}

impl fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHeader")
            .field("size", &self.size())
            .field("alloc", &self.is_alloc())
            .field("prev_alloc", &self.is_prev_alloc())
            .finish()
    }
}

/// A view of any block (allocated, free or sentinel) through its header
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Block {
    header: NonNull<BlockHeader>,
}

impl Block {
    /* Constructors */
    pub unsafe fn new_unchecked(header: *mut BlockHeader) -> Self {
        // payloads are 8-byte aligned so headers sit one word below an 8-byte boundary
        debug_assert_eq!((header as usize + BlockHeader::SIZE) % consts::ALIGN_SIZE, 0);

        Block {
            header: NonNull::new_unchecked(header),
        }
    }

    pub unsafe fn from_data_pointer(ptr: NonNull<u8>) -> Self {
        Block::new_unchecked(ptr.as_ptr().sub(BlockHeader::SIZE) as *mut _)
    }

    /* Getters */
    pub fn header(&self) -> *mut BlockHeader {
        self.header.as_ptr()
    }

    pub fn data_pointer(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.header() as *mut u8).add(BlockHeader::SIZE)) }
    }

    pub fn address(&self) -> usize {
        self.header() as usize
    }

    /// Bytes the caller may use: allocated blocks have no footer
    pub fn usable_size(&self) -> usize {
        self.size() - BlockHeader::SIZE
    }

    /* Neighbors */
    // NOTE(safety) must not be called on the epilogue
    pub unsafe fn next_neighbor(&self) -> Block {
        debug_assert!(self.size() != 0);

        Block::new_unchecked((self.header() as *mut u8).add(self.size()) as *mut _)
    }

    /// The physically preceding block, only reachable when it is free (allocated blocks carry no
    /// footer to step back over)
    pub unsafe fn prev_neighbor(&self) -> Option<FreeBlock> {
        if self.is_prev_alloc() {
            None
        } else {
            let footer = &*self.header().sub(1);
            let start = (self.header() as *mut u8).sub(footer.size());
            debug_assert!(!footer.is_alloc());

            Some(FreeBlock::new_unchecked(start as *mut _))
        }
    }

    /// Word at the tail of the block; only meaningful for free blocks
    pub unsafe fn footer(&self) -> *mut BlockHeader {
        debug_assert!(self.size() >= consts::MIN_BLOCK_SIZE);

        (self.header() as *mut u8).add(self.size() - BlockHeader::SIZE) as *mut _
    }

    /* Miscellaneous */
    pub unsafe fn write_footer(&self) {
        ptr::write(self.footer(), self.mirror());
    }

    /// Marks this block as free and writes its footer; the next neighbor's prev-allocated bit is
    /// left untouched
    pub unsafe fn into_free(mut self) -> FreeBlock {
        self.set_alloc_bit(false);
        self.write_footer();
        FreeBlock::new_unchecked(self.header() as *mut _)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("header", &self.header)
            .field("size", &self.size())
            .field("alloc", &self.is_alloc())
            .field("prev_alloc", &self.is_prev_alloc())
            .finish()
    }
}

impl ops::Deref for Block {
    type Target = BlockHeader;

    fn deref(&self) -> &BlockHeader {
        unsafe { &*self.header.as_ptr() }
    }
}

impl ops::DerefMut for Block {
    fn deref_mut(&mut self) -> &mut BlockHeader {
        unsafe { &mut *self.header.as_ptr() }
    }
}
