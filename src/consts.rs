/// Size of a header (or footer) word
pub const WORD_SIZE: usize = 4;

// All payloads are 8-byte aligned and all block sizes are multiples of 8
pub const ALIGN_SIZE_LOG2: u32 = 3;
/// All block sizes are multiple of this number; this number is also the alignment of every pointer
/// handed out by the allocator
pub const ALIGN_SIZE: usize = 1 << ALIGN_SIZE_LOG2;

/// Smallest block the allocator will ever create: header, two links and a footer
pub const MIN_BLOCK_SIZE: usize = 2 * ALIGN_SIZE;

/// Minimum number of bytes requested from the heap source on every growth
pub const CHUNK_SIZE: usize = 160;

/// Padding word, prologue header, prologue footer and epilogue header
pub const INITIAL_HEAP_SIZE: usize = 4 * WORD_SIZE;

/// Size of the prologue block
pub const PROLOGUE_SIZE: usize = ALIGN_SIZE;

/// Number of segregated free lists
pub const NUM_CLASSES: usize = 9;

/// Inclusive upper bound of each size class; class `i` holds blocks in
/// `(CLASS_LIMITS[i - 1], CLASS_LIMITS[i]]`
pub const CLASS_LIMITS: [usize; NUM_CLASSES] = [
    16,
    32,
    64,
    128,
    256,
    512,
    1024,
    2048,
    usize::MAX,
];

// Free list links are 32-bit offsets from the heap base
pub const MAX_HEAP_SIZE: usize = u32::MAX as usize & !(ALIGN_SIZE - 1);

// NOTE CHUNK_SIZE must be a valid free block size
#[allow(dead_code)]
const ASSERT0: [(); 0 - !(CHUNK_SIZE % ALIGN_SIZE == 0 && CHUNK_SIZE >= MIN_BLOCK_SIZE) as usize] =
    [];
