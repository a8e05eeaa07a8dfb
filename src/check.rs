//! Heap consistency checker

use core::{fmt, ptr::NonNull};

use log::{error, info};

use crate::{
    block::{Block, BlockHeader},
    consts,
    free_block::{FreeBlock, FreeBlockHeader},
    util, HeapSource, Offset, SegAlloc,
};

/// An invariant violation found by [`SegAlloc::check_heap`]
///
/// Addresses are those of the offending block's header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// The prologue is not an allocated 8-byte block
    BadPrologue,
    /// The block walk did not end on an allocated, zero sized block in the last word of the heap
    BadEpilogue(usize),
    /// A block, or a list link, points outside of the heap
    OutOfBounds(usize),
    /// A payload is not 8-byte aligned
    Misaligned(usize),
    /// A block is smaller than the minimum block size
    BadSize(usize, usize),
    /// A free block's footer doesn't match its header
    FooterMismatch(usize),
    /// A block's prev-allocated bit disagrees with its predecessor
    PrevAllocMismatch(usize),
    /// Two physically adjacent blocks are both free
    ContiguousFree(usize),
    /// The free list of the given class contains an allocated block
    AllocatedInList(usize, usize),
    /// The free list of the given class contains a block whose size belongs to another class
    WrongClass(usize, usize),
    /// A block's backward link doesn't point at the block that links to it
    InconsistentLinks(usize, usize),
    /// The free list of the given class loops
    Cycle(usize),
    /// A free block is missing from the list of its size class
    NotInList(usize),
    /// The lists hold a different number of blocks (first) than the heap has free blocks (second)
    ListCountMismatch(usize, usize),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HeapError::BadPrologue => f.write_str("bad prologue header"),
            HeapError::BadEpilogue(addr) => write!(f, "bad epilogue header at {:#x}", addr),
            HeapError::OutOfBounds(addr) => write!(f, "{:#x} is outside of the heap", addr),
            HeapError::Misaligned(addr) => {
                write!(f, "block at {:#x} is not double word aligned", addr)
            }
            HeapError::BadSize(addr, size) => write!(f, "block at {:#x} has size {}", addr, size),
            HeapError::FooterMismatch(addr) => {
                write!(f, "header and footer of {:#x} don't match", addr)
            }
            HeapError::PrevAllocMismatch(addr) => {
                write!(f, "prev-allocated bit of {:#x} is stale", addr)
            }
            HeapError::ContiguousFree(addr) => {
                write!(f, "contiguous free blocks at {:#x}", addr)
            }
            HeapError::AllocatedInList(class, addr) => {
                write!(f, "free list {} contains allocated block {:#x}", class, addr)
            }
            HeapError::WrongClass(class, addr) => {
                write!(f, "free list {} contains block {:#x} of another class", class, addr)
            }
            HeapError::InconsistentLinks(class, addr) => write!(
                f,
                "prev/next pointers around {:#x} in free list {} are not consistent",
                addr, class
            ),
            HeapError::Cycle(class) => write!(f, "free list {} has a cycle", class),
            HeapError::NotInList(addr) => write!(f, "free block {:#x} is not in its list", addr),
            HeapError::ListCountMismatch(listed, free) => write!(
                f,
                "free lists hold {} blocks but the heap has {} free blocks",
                listed, free
            ),
        }
    }
}

/// Inclusive address range of the heap
struct Bounds {
    lo: usize,
    hi: usize,
}

impl Bounds {
    fn check(&self, addr: usize, len: usize) -> Result<(), HeapError> {
        match addr.checked_add(len - 1) {
            Some(end) if addr >= self.lo && end <= self.hi => Ok(()),
            _ => Err(HeapError::OutOfBounds(addr)),
        }
    }
}

impl<S: HeapSource> SegAlloc<S> {
    /// Walks every block and every free list and returns the first broken invariant
    ///
    /// Checked invariants: sentinels are intact, blocks are aligned and within the heap, free
    /// blocks have matching footers, prev-allocated bits are accurate, no two free blocks are
    /// adjacent, every list holds only free blocks of its size class with consistent links and no
    /// cycles, and every free block is listed exactly once.
    ///
    /// With `verbose` the heap layout is dumped at `info` level. Violations are logged at `error`
    /// level. Nothing is modified. A heap that was never initialized is trivially consistent.
    pub fn check_heap(&self, verbose: bool) -> Result<(), HeapError> {
        let result = self.check(verbose);
        if let Err(e) = result {
            error!("{}", e);
        }
        result
    }

    fn check(&self, verbose: bool) -> Result<(), HeapError> {
        let base = if let Some(base) = self.base {
            base
        } else {
            return Ok(());
        };

        let bounds = Bounds {
            lo: self.source.heap_lo() as usize,
            hi: self.source.heap_hi() as usize,
        };

        if verbose {
            info!("heap ({:#x}..={:#x}):", bounds.lo, bounds.hi);
        }

        unsafe {
            let prologue = base.as_ptr().add(BlockHeader::SIZE);
            bounds.check(prologue as usize, consts::PROLOGUE_SIZE)?;
            let prologue = Block::new_unchecked(prologue as *mut _);

            // the walk relies on the prologue, so don't go any further with a broken one
            if prologue.size() != consts::PROLOGUE_SIZE
                || !prologue.is_alloc()
                || (*prologue.header().add(1)).tag() != prologue.tag()
            {
                return Err(HeapError::BadPrologue);
            }

            let free = self.check_blocks(prologue, &bounds, verbose)?;
            let listed = self.check_lists(base, &bounds, verbose)?;
            self.check_membership(prologue)?;

            if listed != free {
                return Err(HeapError::ListCountMismatch(listed, free));
            }
        }

        Ok(())
    }

    /// Physical walk from the prologue to the epilogue; returns the number of free blocks
    unsafe fn check_blocks(
        &self,
        prologue: Block,
        bounds: &Bounds,
        verbose: bool,
    ) -> Result<usize, HeapError> {
        let mut free = 0;
        let mut prev = prologue;
        let mut block = prologue.next_neighbor();

        loop {
            let addr = block.address();
            bounds.check(addr, BlockHeader::SIZE)?;

            if verbose {
                print_block(block);
            }

            if block.is_prev_alloc() != prev.is_alloc() {
                return Err(HeapError::PrevAllocMismatch(addr));
            }

            if block.size() == 0 {
                break;
            }

            if block.data_pointer().as_ptr() as usize % consts::ALIGN_SIZE != 0 {
                return Err(HeapError::Misaligned(addr));
            }

            if block.size() < consts::MIN_BLOCK_SIZE {
                return Err(HeapError::BadSize(addr, block.size()));
            }

            // room for the block and at least the epilogue after it
            bounds.check(addr, block.size() + BlockHeader::SIZE)?;

            if !block.is_alloc() {
                if (*block.footer()).tag() != block.tag() {
                    return Err(HeapError::FooterMismatch(addr));
                }

                if !prev.is_alloc() {
                    return Err(HeapError::ContiguousFree(addr));
                }

                free += 1;
            }

            prev = block;
            block = block.next_neighbor();
        }

        if !block.is_alloc() || block.address() + BlockHeader::SIZE - 1 != bounds.hi {
            return Err(HeapError::BadEpilogue(block.address()));
        }

        Ok(free)
    }

    /// Checks every list node; returns the total number of listed blocks
    unsafe fn check_lists(
        &self,
        base: NonNull<u8>,
        bounds: &Bounds,
        verbose: bool,
    ) -> Result<usize, HeapError> {
        let mut listed = 0;

        for class in 0..consts::NUM_CLASSES {
            self.check_acyclic(class, base, bounds)?;

            let (lower, upper) = util::class_range(class);
            let mut prev: Option<Offset> = None;
            let mut cursor = self.free_lists[class];
            let mut len = 0;

            while let Some(offset) = cursor {
                let fb = node(base, bounds, offset)?;
                let addr = fb.header() as usize;

                if fb.is_alloc() {
                    return Err(HeapError::AllocatedInList(class, addr));
                }

                if fb.size() <= lower || fb.size() > upper {
                    return Err(HeapError::WrongClass(class, addr));
                }

                // covers both `next.prev == self` and the head having no backward link
                if fb.prev_free() != prev {
                    return Err(HeapError::InconsistentLinks(class, addr));
                }

                len += 1;
                prev = Some(offset);
                cursor = fb.next_free();
            }

            if verbose && len != 0 {
                info!("free list {} ({}, {}]: {} blocks", class, lower, upper, len);
            }

            listed += len;
        }

        Ok(listed)
    }

    /// Floyd's cycle detection over the forward links of `class`
    unsafe fn check_acyclic(
        &self,
        class: usize,
        base: NonNull<u8>,
        bounds: &Bounds,
    ) -> Result<(), HeapError> {
        let mut slow = self.free_lists[class];
        let mut fast = self.free_lists[class];

        while let Some(offset) = fast {
            fast = match node(base, bounds, offset)?.next_free() {
                Some(offset) => node(base, bounds, offset)?.next_free(),
                None => return Ok(()),
            };

            if let Some(offset) = slow {
                slow = node(base, bounds, offset)?.next_free();
            }

            if fast.is_some() && fast == slow {
                return Err(HeapError::Cycle(class));
            }
        }

        Ok(())
    }

    /// Every physically free block must be in the list of its size class
    unsafe fn check_membership(&self, prologue: Block) -> Result<(), HeapError> {
        let mut block = prologue.next_neighbor();

        while block.size() != 0 {
            if !block.is_alloc() {
                let fb = FreeBlock::new_unchecked(block.header() as *mut _);
                let class = util::size_class(fb.size());

                if !self.free_list(class).any(|listed| listed == fb) {
                    return Err(HeapError::NotInList(block.address()));
                }
            }

            block = block.next_neighbor();
        }

        Ok(())
    }
}

/// Resolves a list link, making sure it lands on a plausible free block header
unsafe fn node(base: NonNull<u8>, bounds: &Bounds, offset: Offset) -> Result<FreeBlock, HeapError> {
    let addr = (base.as_ptr() as usize).wrapping_add(offset.get() as usize);

    bounds.check(addr, FreeBlockHeader::SIZE)?;
    if (addr + BlockHeader::SIZE) % consts::ALIGN_SIZE != 0 {
        return Err(HeapError::Misaligned(addr));
    }

    Ok(FreeBlock::new_unchecked(addr as *mut _))
}

fn print_block(block: Block) {
    if block.size() == 0 {
        info!("{:p}: EOL", block.data_pointer());
    } else {
        info!(
            "{:p}: header: [{}:{}]",
            block.data_pointer(),
            block.size(),
            if block.is_alloc() { 'a' } else { 'f' }
        );
    }
}
