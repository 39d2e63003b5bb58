//! Making room in an address space by unbinding other entries.

use crate::error::{VmaError, VmaResult};
use crate::gem::GemObject;
use crate::mm::InsertMode;
use crate::mm::range::COLOR_UNEVICTABLE;
use crate::sync::{WaitCtx, WwCtx, WwGuard};
use crate::utils::GTT_PAGE_SIZE_4K;
use crate::vm::address_space::VmGuard;
use crate::vm::flags::PinFlags;
use crate::vm::vma::Vma;
use std::sync::Arc;

/// How a victim's object is held while it is unbound.
enum Held<'a> {
    /// Already locked through the caller's acquire context.
    ByCaller,
    Trylocked(WwGuard<'a>),
    /// The object is being destroyed; nothing else can reach the entry.
    Dying,
}

fn grab<'a>(obj: Option<&'a Arc<GemObject>>, ww: Option<&WwCtx>) -> Option<Held<'a>> {
    let Some(obj) = obj else {
        return Some(Held::Dying);
    };
    if ww.is_some_and(|ww| obj.ww_lock().is_locked_by(ww)) {
        return Some(Held::ByCaller);
    }
    obj.ww_lock().try_lock().map(Held::Trylocked)
}

/// Evicts idle, then busy, unpinned entries in least recently used order
/// until `[start, end)` has room for `size` bytes at `alignment`.
///
/// Entries whose object lock is contended are left alone. `NONBLOCK`
/// restricts eviction to idle entries.
#[allow(clippy::too_many_arguments)]
pub fn evict_something(
    guard: &mut VmGuard<'_>,
    ww: Option<&mut WwCtx>,
    ctx: &WaitCtx,
    size: u64,
    alignment: u64,
    color: u64,
    start: u64,
    end: u64,
    flags: PinFlags,
) -> VmaResult<()> {
    let ww = ww.as_deref();
    let fits = |guard: &VmGuard<'_>| guard.mm.can_fit(size, alignment, color, start, end, InsertMode::Low);

    let passes: &[bool] = if flags.contains(PinFlags::NONBLOCK) {
        &[true]
    } else {
        &[true, false]
    };
    for &idle_only in passes {
        for vma in guard.bound_list() {
            if vma.is_pinned() || (idle_only && vma.is_active()) {
                continue;
            }
            let Some(node) = vma.node() else {
                continue;
            };
            if node.end() <= start || node.start >= end {
                continue;
            }

            let obj = vma.object().ok();
            let Some(held) = grab(obj.as_ref(), ww) else {
                continue;
            };
            let unbound = vma.unbind_locked(guard, ctx);
            drop(held);
            match unbound {
                Ok(()) => {}
                Err(VmaError::Interrupted) => return Err(VmaError::Interrupted),
                Err(err) => {
                    log::debug!("eviction of {:?} failed: {err}", vma.key());
                    continue;
                }
            }
            if fits(guard) {
                return Ok(());
            }
        }
    }

    if fits(guard) { Ok(()) } else { Err(VmaError::NoSpace) }
}

/// Evicts whatever overlaps `[start, start + size)` so it can be reserved.
///
/// Fails with `NoSpace` without touching anything if an overlapping entry
/// is pinned, is busy under `NONBLOCK`, belongs to a contended object, or
/// the range holds space that is not an entry. With cache colouring, the
/// guard pages on both sides are cleared too unless the neighbour there has
/// the same colour.
pub fn evict_for_node(
    guard: &mut VmGuard<'_>,
    ww: Option<&mut WwCtx>,
    ctx: &WaitCtx,
    start: u64,
    size: u64,
    color: u64,
    flags: PinFlags,
) -> VmaResult<()> {
    let ww = ww.as_deref();
    let target_end = start + size;
    let (mut lo, mut hi) = (start, target_end);
    if guard.mm.color_adjust() {
        lo = lo.saturating_sub(GTT_PAGE_SIZE_4K);
        hi += GTT_PAGE_SIZE_4K;
    }

    let bound = guard.bound_list();
    let mut victims: Vec<(Arc<Vma>, Option<Arc<GemObject>>)> = Vec::new();
    for node in guard.mm.overlapping(lo, hi) {
        if node.color == COLOR_UNEVICTABLE {
            return Err(VmaError::NoSpace);
        }
        if guard.mm.color_adjust() && node.color == color && (node.end() == start || node.start == target_end) {
            continue;
        }
        let vma = bound
            .iter()
            .find(|v| v.node().is_some_and(|n| n.start == node.start))
            .ok_or(VmaError::NoSpace)?;
        if vma.is_pinned() {
            return Err(VmaError::NoSpace);
        }
        if flags.contains(PinFlags::NONBLOCK) && vma.is_active() {
            return Err(VmaError::NoSpace);
        }
        victims.push((vma.clone(), vma.object().ok()));
    }

    let mut held = Vec::with_capacity(victims.len());
    for (_, obj) in &victims {
        held.push(grab(obj.as_ref(), ww).ok_or(VmaError::NoSpace)?);
    }

    // Hold the victims in place while the others go.
    for (vma, _) in &victims {
        vma.add_pin();
    }
    let mut result = Ok(());
    for (vma, _) in &victims {
        vma.unpin();
        if result.is_ok() {
            result = vma.unbind_locked(guard, ctx);
        }
    }
    drop(held);
    result
}

/// Evicts every unpinned entry of the address space. Returns how many were
/// evicted.
///
/// Entries of objects already locked by `ww` are evicted first. Others are
/// evicted under a try-lock of their object and skipped if that fails.
/// Only an interrupted wait aborts the sweep; other failures skip the entry.
pub fn evict_vm(guard: &mut VmGuard<'_>, ww: Option<&mut WwCtx>, ctx: &WaitCtx) -> VmaResult<usize> {
    let ww = ww.as_deref();
    let mut evicted = 0;
    loop {
        let candidates: Vec<_> = guard
            .bound_list()
            .into_iter()
            .filter(|v| !v.is_pinned())
            .map(|v| {
                let obj = v.object().ok();
                (v, obj)
            })
            .collect();
        let mut locked = Vec::new();
        let mut trylocked = Vec::new();

        for (vma, obj) in &candidates {
            match grab(obj.as_ref(), ww) {
                Some(held @ (Held::ByCaller | Held::Dying)) => locked.push((vma, held)),
                Some(held) => trylocked.push((vma, held)),
                None => {}
            }
        }
        if locked.is_empty() && trylocked.is_empty() {
            return Ok(evicted);
        }

        let attempted = locked.len() + trylocked.len();
        let mut failed = 0;
        for (vma, held) in locked.into_iter().chain(trylocked) {
            let unbound = vma.unbind_locked(guard, ctx);
            drop(held);
            match unbound {
                Ok(()) => evicted += 1,
                Err(VmaError::Interrupted) => return Err(VmaError::Interrupted),
                Err(err) => {
                    log::debug!("eviction of {:?} failed: {err}", vma.key());
                    failed += 1;
                }
            }
        }
        if failed == attempted {
            return Ok(evicted);
        }
    }
}
