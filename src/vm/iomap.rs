//! CPU access through the GGTT aperture, and the fence registers that
//! detile it.

use crate::error::{VmaError, VmaResult};
use crate::gem::Tiling;
use crate::sync::{Fence, WaitCtx};
use crate::utils::{GTT_MIN_ALIGNMENT, GTT_PAGE_SIZE_4K, align_up, lock, roundup};
use crate::vm::flags::{BindFlags, VmaFlags};
use crate::vm::vma::Vma;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

/// Granule of fence register sizes and placements.
pub const FENCE_PAGE: u64 = GTT_PAGE_SIZE_4K;

const fn tile_height(tiling: Tiling) -> u64 {
    match tiling {
        Tiling::None => 1,
        Tiling::X => 8,
        Tiling::Y => 32,
    }
}

/// Width in bytes of one tile row; strides must be a multiple of it.
#[must_use]
pub const fn tile_width(tiling: Tiling) -> u32 {
    match tiling {
        Tiling::None => 1,
        Tiling::X => 512,
        Tiling::Y => 128,
    }
}

/// Aperture footprint a fence register needs to cover `size` bytes.
pub fn fence_size(size: u64, tiling: Tiling, stride: u32) -> VmaResult<u64> {
    if tiling == Tiling::None {
        return Ok(size);
    }
    if stride == 0 {
        debug_assert!(false, "tiled object without a stride");
        return Err(VmaError::InvalidArgument("tiled object without a stride"));
    }
    let row = u64::from(stride) * tile_height(tiling);
    Ok(align_up(roundup(size, row), FENCE_PAGE))
}

#[must_use]
pub const fn fence_alignment(tiling: Tiling) -> u64 {
    match tiling {
        Tiling::None => GTT_MIN_ALIGNMENT,
        Tiling::X | Tiling::Y => FENCE_PAGE,
    }
}

// ===========================================================================================
// Fence registers
// ===========================================================================================

#[derive(Debug, Default)]
struct FenceReg {
    owner: Weak<Vma>,
    pins: usize,
    stamp: u64,
    /// Last request that relied on the register.
    last_use: Option<Arc<Fence>>,
    start: u64,
    size: u64,
    tiling: Tiling,
    stride: u32,
}

#[derive(Debug, Default)]
struct RegsState {
    regs: Vec<FenceReg>,
    clock: u64,
}

/// The detiling registers of the aperture. Unpinned registers are handed
/// out least recently used first, revoking their previous owner.
pub struct FenceRegs {
    state: Mutex<RegsState>,
}

impl fmt::Debug for FenceRegs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceRegs")
            .field("count", &self.count())
            .field("pinned", &self.pinned())
            .finish()
    }
}

/// What a register is currently programmed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceSetup {
    pub start: u64,
    pub size: u64,
    pub tiling: Tiling,
    pub stride: u32,
}

impl FenceRegs {
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(RegsState {
                regs: (0..count).map(|_| FenceReg::default()).collect(),
                clock: 0,
            }),
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        lock(&self.state).regs.len()
    }

    /// Registers with at least one pin.
    #[must_use]
    pub fn pinned(&self) -> usize {
        lock(&self.state).regs.iter().filter(|r| r.pins > 0).count()
    }

    #[must_use]
    pub fn owner(&self, idx: usize) -> Option<Arc<Vma>> {
        lock(&self.state).regs.get(idx).and_then(|r| r.owner.upgrade())
    }

    #[must_use]
    pub fn setup(&self, idx: usize) -> Option<FenceSetup> {
        let state = lock(&self.state);
        let reg = state.regs.get(idx)?;
        reg.owner.upgrade().map(|_| FenceSetup {
            start: reg.start,
            size: reg.size,
            tiling: reg.tiling,
            stride: reg.stride,
        })
    }

    pub(crate) fn track(&self, idx: usize, fence: Arc<Fence>) {
        if let Some(reg) = lock(&self.state).regs.get_mut(idx) {
            reg.last_use = Some(fence);
        }
    }

    fn owned_by(reg: &FenceReg, vma: &Vma) -> bool {
        std::ptr::eq(reg.owner.as_ptr(), vma)
    }

    /// Pins the register `vma` already owns, or claims one. Returns the
    /// register index and, for a claim, the previous owner and the fence
    /// it still has to wait for.
    fn claim(&self, vma: &Arc<Vma>, current: Option<usize>) -> VmaResult<(usize, bool, Option<Arc<Vma>>, Option<Arc<Fence>>)> {
        let mut state = lock(&self.state);
        state.clock += 1;
        let stamp = state.clock;

        if let Some(idx) = current {
            if let Some(reg) = state.regs.get_mut(idx).filter(|r| Self::owned_by(r, vma)) {
                reg.pins += 1;
                reg.stamp = stamp;
                return Ok((idx, false, None, None));
            }
        }

        let idx = state
            .regs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.pins == 0)
            .min_by_key(|(_, r)| (r.owner.strong_count() > 0, r.stamp))
            .map(|(i, _)| i)
            .ok_or(VmaError::Busy)?;

        let reg = &mut state.regs[idx];
        reg.pins = 1;
        reg.stamp = stamp;
        let prev = reg.owner.upgrade();
        let busy = reg.last_use.take().filter(|f| !f.is_signaled());
        Ok((idx, true, prev, busy))
    }

    fn program(&self, idx: usize, vma: &Arc<Vma>, setup: FenceSetup) {
        if let Some(reg) = lock(&self.state).regs.get_mut(idx) {
            reg.owner = Arc::downgrade(vma);
            reg.start = setup.start;
            reg.size = setup.size;
            reg.tiling = setup.tiling;
            reg.stride = setup.stride;
        }
    }

    fn unpin(&self, idx: usize) {
        if let Some(reg) = lock(&self.state).regs.get_mut(idx) {
            debug_assert!(reg.pins > 0, "unbalanced fence unpin");
            reg.pins = reg.pins.saturating_sub(1);
        }
    }

    /// Drops `vma`'s ownership of `idx` unless the register is pinned.
    fn release(&self, idx: usize, vma: &Vma) -> VmaResult<Option<Arc<Fence>>> {
        let mut state = lock(&self.state);
        let Some(reg) = state.regs.get_mut(idx).filter(|r| Self::owned_by(r, vma)) else {
            return Ok(None);
        };
        if reg.pins > 0 {
            return Err(VmaError::Busy);
        }
        reg.owner = Weak::new();
        Ok(reg.last_use.take())
    }
}

// ===========================================================================================
// Entry side
// ===========================================================================================

impl Vma {
    /// Pins a fence register covering the entry if its object is tiled.
    pub fn pin_fence(self: &Arc<Self>, ctx: &WaitCtx) -> VmaResult<()> {
        let current = self.lock_state().fence;
        let obj = self.object()?;
        let (tiling, stride) = obj.tiling();
        if current.is_none() && tiling == Tiling::None {
            return Ok(());
        }
        let gt = self.gt().ok_or(VmaError::NoDevice)?;
        let regs = gt.fence_regs();

        let (idx, claimed, prev, busy) = regs.claim(self, current)?;
        if !claimed {
            self.lock_state().fence_pins += 1;
            return Ok(());
        }

        if let Some(busy) = busy {
            if let Err(err) = busy.wait(ctx) {
                regs.unpin(idx);
                return Err(err);
            }
        }
        if let Some(prev) = prev.filter(|p| !Arc::ptr_eq(p, self)) {
            log::trace!("stealing fence register {idx} from {:?}", prev.key());
            prev.revoke_mmap();
            let mut prev_state = prev.lock_state();
            if prev_state.fence == Some(idx) {
                prev_state.fence = None;
            }
        }

        let node = self.node().ok_or(VmaError::Invariant("fence for an unplaced entry"))?;
        regs.program(
            idx,
            self,
            FenceSetup {
                start: node.start,
                size: self.fence_size(),
                tiling,
                stride,
            },
        );
        let mut state = self.lock_state();
        state.fence = Some(idx);
        state.fence_pins += 1;
        Ok(())
    }

    pub fn unpin_fence(&self) {
        let idx = {
            let mut state = self.lock_state();
            if state.fence_pins == 0 {
                return;
            }
            state.fence_pins -= 1;
            state.fence
        };
        if let (Some(idx), Some(gt)) = (idx, self.gt()) {
            gt.fence_regs().unpin(idx);
        }
    }

    /// Gives the entry's fence register up, once every request relying on
    /// it has completed. Fails with `Busy` while it is pinned.
    pub fn revoke_fence(&self) -> VmaResult<()> {
        let Some(idx) = self.lock_state().fence else {
            return Ok(());
        };
        let Some(gt) = self.gt() else {
            self.lock_state().fence = None;
            return Ok(());
        };
        if let Some(last_use) = gt.fence_regs().release(idx, self)? {
            last_use.wait_uninterruptible();
        }
        self.revoke_mmap();
        self.lock_state().fence = None;
        Ok(())
    }

    #[must_use]
    pub fn fence_reg(&self) -> Option<usize> {
        self.lock_state().fence
    }

    /// Maps the entry for CPU access through the aperture.
    ///
    /// The entry must live in the GGTT and be bound globally. Unless the
    /// object is in local memory, it also has to sit in the mappable part of
    /// the aperture. The entry stays pinned until the mapping is dropped.
    pub fn pin_iomap(self: &Arc<Self>, ctx: &WaitCtx) -> VmaResult<IoMap> {
        if !self.is_ggtt() || !self.is_bound(BindFlags::GLOBAL) {
            debug_assert!(false, "iomap of an entry not bound in the GGTT");
            return Err(VmaError::InvalidArgument("iomap needs a global binding"));
        }
        let obj = self.object()?;
        if !obj.is_lmem() && !self.is_map_and_fenceable() {
            return Err(VmaError::NoDevice);
        }
        let node = self.node().ok_or(VmaError::Invariant("iomap of an unplaced entry"))?;

        self.add_pin();
        if let Err(err) = self.pin_fence(ctx) {
            self.unpin();
            return Err(err);
        }
        self.lock_state().iomap = true;
        self.set_flags(VmaFlags::GGTT_WRITE);
        Ok(IoMap {
            vma: self.clone(),
            base: node.start,
            len: self.size(),
        })
    }

    /// Drops a CPU mapping, flushing what was written through it.
    pub fn unpin_iomap(map: IoMap) {
        drop(map);
    }

    /// Makes writes through the aperture visible to the GPU.
    pub fn flush_writes(&self) {
        if !self.clear_flags(VmaFlags::GGTT_WRITE) {
            return;
        }
        if let Some(gt) = self.gt() {
            gt.flush_ggtt_writes();
        }
    }
}

/// A pinned CPU view of an entry through the aperture.
#[derive(Debug)]
pub struct IoMap {
    vma: Arc<Vma>,
    base: u64,
    len: u64,
}

impl IoMap {
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn vma(&self) -> &Arc<Vma> {
        &self.vma
    }

    fn check(&self, offset: u64, len: usize) -> VmaResult<u64> {
        let len = len as u64;
        if offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(VmaError::InvalidArgument("access past the end of the mapping"));
        }
        Ok(self.base + offset)
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> VmaResult<()> {
        let addr = self.check(offset, buf.len())?;
        self.vma.vm().read(addr, buf)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> VmaResult<()> {
        let addr = self.check(offset, data.len())?;
        self.vma.set_flags(VmaFlags::GGTT_WRITE);
        self.vma.vm().write(addr, data)
    }
}

impl Drop for IoMap {
    fn drop(&mut self) {
        self.vma.flush_writes();
        self.vma.unpin_fence();
        self.vma.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untiled_fence_is_the_object() {
        assert_eq!(fence_size(3 * FENCE_PAGE, Tiling::None, 0).unwrap(), 3 * FENCE_PAGE);
        assert_eq!(fence_alignment(Tiling::None), GTT_MIN_ALIGNMENT);
    }

    #[test]
    fn tiled_fence_covers_whole_tile_rows() {
        // 2048 byte stride, eight rows per X tile: 16K per tile row.
        let size = fence_size(5 * FENCE_PAGE, Tiling::X, 2048).unwrap();
        assert_eq!(size, 32 << 10);
        let size = fence_size(16 << 10, Tiling::Y, 512).unwrap();
        assert_eq!(size, 16 << 10);
    }

    #[test]
    fn free_registers_are_preferred_over_stealing() {
        let regs = FenceRegs::new(2);
        assert_eq!(regs.count(), 2);
        assert_eq!(regs.pinned(), 0);
        assert!(regs.owner(0).is_none());
        assert!(regs.setup(1).is_none());
    }
}
