#![allow(clippy::cast_possible_truncation)]

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

pub const GTT_PAGE_SIZE_4K: u64 = 1 << 12;
pub const GTT_PAGE_SIZE_64K: u64 = 1 << 16;
pub const GTT_PAGE_SIZE_2M: u64 = 1 << 21;
pub const GTT_MIN_ALIGNMENT: u64 = GTT_PAGE_SIZE_4K;

#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn align_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}

/// Largest power of two not above `val`. `val` must be nonzero.
#[must_use]
pub const fn rounddown_pow_of_two(val: u64) -> u64 {
    1 << (63 - val.leading_zeros())
}

/// Round `val` up to a multiple of `multiple`, which need not be a power of two.
#[must_use]
pub const fn roundup(val: u64, multiple: u64) -> u64 {
    val.div_ceil(multiple) * multiple
}

/// True if `[start, start + size)` does not fit below `max`.
#[must_use]
pub const fn range_overflows(start: u64, size: u64, max: u64) -> bool {
    start >= max || size > max - start
}

#[must_use]
pub const fn pages(bytes: u64) -> usize {
    (bytes >> PAGE_SHIFT) as usize
}

/// Locks a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}
