/// Marks a code path that the allocator invariants rule out
///
/// Panics in debug builds; in release builds reaching it is undefined behavior so it must only
/// be used inside `unsafe` code whose preconditions have already been stated.
macro_rules! assume_unreachable {
    () => {
        if cfg!(debug_assertions) {
            unreachable!()
        } else {
            core::hint::unreachable_unchecked()
        }
    };
}
