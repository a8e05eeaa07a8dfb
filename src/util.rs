use crate::consts;

/// Index of the segregated list that holds free blocks of `size` bytes
pub(crate) fn size_class(size: usize) -> usize {
    debug_assert_eq!(size % consts::ALIGN_SIZE, 0);
    debug_assert!(size != 0);

    consts::CLASS_LIMITS
        .iter()
        .position(|&limit| size <= limit)
        .unwrap_or(consts::NUM_CLASSES - 1)
}

/// Exclusive lower and inclusive upper size bound of class `class`
pub(crate) fn class_range(class: usize) -> (usize, usize) {
    debug_assert!(class < consts::NUM_CLASSES);

    let lower = if class == 0 {
        0
    } else {
        consts::CLASS_LIMITS[class - 1]
    };

    (lower, consts::CLASS_LIMITS[class])
}

/// Block size needed to serve a request for `size` payload bytes
///
/// Allocated blocks only carry a header so the block is the payload plus one word, rounded up to
/// the alignment. Tiny requests still get a minimum sized block because the block must be able to
/// hold the free list links once it is released.
pub(crate) fn adjust_request(size: usize) -> Option<usize> {
    debug_assert!(size != 0);

    if size <= consts::ALIGN_SIZE {
        Some(consts::MIN_BLOCK_SIZE)
    } else {
        let (asize, _) = round_up(size.checked_add(consts::WORD_SIZE)?, consts::ALIGN_SIZE)?;

        if asize > consts::MAX_HEAP_SIZE {
            None
        } else {
            Some(asize)
        }
    }
}

pub fn round_down(x: usize, multiple: usize) -> usize {
    x - x % multiple
}

pub fn round_up(x: usize, multiple: usize) -> Option<(/* x */ usize, /* rem */ usize)> {
    let rem = x % multiple;
    if rem == 0 {
        Some((x, 0))
    } else {
        Some((x.checked_add(multiple - rem)?, rem))
    }
}
