//! Buffer objects: backing storage, residency and the bookkeeping the
//! mapping entries and the migration engine rely on.

use crate::error::{VmaError, VmaResult};
use crate::gt::Gt;
use crate::mm::{MemoryRegion, RegionId, SgTable};
use crate::sync::{Fence, Reservation, WaitCtx, WwCtx, WwMutex};
use crate::utils::{GTT_PAGE_SIZE_4K, PAGE_SIZE, align_up, lock, read, write};
use crate::vm::flags::{BindFlags, CacheLevel};
use crate::vm::iomap;
use crate::vm::vma::{Vma, VmaRegistry};
use crate::vm::LockClass;
use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

bitflags! {
    /// Cache domains an object is coherent with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Domains: u32 {
        const CPU = 0x01;
        const RENDER = 0x02;
        const SAMPLER = 0x04;
        const COMMAND = 0x08;
        const INSTRUCTION = 0x10;
        const VERTEX = 0x20;
        const GTT = 0x40;
        const WC = 0x80;
        const GPU_DOMAINS = Self::RENDER.bits()
            | Self::SAMPLER.bits()
            | Self::COMMAND.bits()
            | Self::INSTRUCTION.bits()
            | Self::VERTEX.bits();
    }
}

bitflags! {
    /// How the CPU reaches the current backing store.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemFlags: u32 {
        const STRUCT_PAGE = 1 << 0;
        const IOMEM = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ObjectFlags: u32 {
        /// System pages must come back zeroed, even on a pure clear.
        const CPU_CLEAR = 1 << 0;
        const READONLY = 1 << 1;
    }
}

bitflags! {
    /// Options for [`GemObject::unbind`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UnbindFlags: u32 {
        /// Also unbind entries the GPU is still using, after waiting.
        const ACTIVE = 1 << 0;
        /// Only report whether anything is bound.
        const TEST = 1 << 1;
        /// Flush deferred unbind work and retry once if an address space
        /// was closing.
        const BARRIER = 1 << 2;
        /// Prefer asynchronous unbinds.
        const ASYNC = 1 << 3;
        const VM_TRYLOCK = 1 << 4;
    }
}

/// Who owns the object. Kernel objects are never cleared on the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectKind {
    #[default]
    Device,
    Kernel,
}

/// CPU caching of system backing pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caching {
    Cached,
    WriteCombined,
}

/// Retention advice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Madvise {
    #[default]
    WillNeed,
    DontNeed,
    /// The backing store was discarded; contents are gone for good.
    Purged,
}

/// Shrinker bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lru {
    /// Not in system memory, so the shrinker cannot touch it.
    Unshrinkable,
    Purgeable,
    HasPages,
    NoPages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tiling {
    #[default]
    None,
    X,
    Y,
}

/// Creation parameters for a [`GemObject`].
#[derive(Debug, Clone)]
pub struct ObjectParams {
    pub size: u64,
    /// Allowed regions, preferred first. Empty means system memory only.
    pub placements: Vec<RegionId>,
    pub kind: ObjectKind,
    pub flags: ObjectFlags,
}

impl ObjectParams {
    #[must_use]
    pub const fn new(size: u64) -> Self {
        Self {
            size,
            placements: Vec::new(),
            kind: ObjectKind::Device,
            flags: ObjectFlags::empty(),
        }
    }

    #[must_use]
    pub fn placements(mut self, regions: &[RegionId]) -> Self {
        self.placements = regions.to_vec();
        self
    }

    #[must_use]
    pub const fn kernel(mut self) -> Self {
        self.kind = ObjectKind::Kernel;
        self
    }

    #[must_use]
    pub const fn flags(mut self, flags: ObjectFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Residency state, under the object's `mm` lock.
#[derive(Debug)]
pub(super) struct ObjMm {
    /// The resource: pages in `resident`, kept across `put_pages`.
    pub backing: Option<Arc<SgTable>>,
    pub resident: Arc<MemoryRegion>,
    /// Pages handed out to mappings, and how many users pin them.
    pub pages: Option<Arc<SgTable>>,
    pub pages_pin: usize,
    pub madv: Madvise,
    pub dirty: bool,
    pub mem_flags: MemFlags,
    pub cache_level: CacheLevel,
    pub caching: Caching,
    pub read_domains: Domains,
    pub write_domain: Domains,
    /// Page list for direct io access while in local memory.
    pub cached_io: Option<Arc<SgTable>>,
    pub moving: Option<Arc<Fence>>,
    pub lru: Lru,
    /// The placement the object counts as living in.
    pub region: Arc<MemoryRegion>,
    pub placements: Vec<Arc<MemoryRegion>>,
    pub tiling: Tiling,
    pub stride: u32,
}

impl ObjMm {
    pub(super) fn adjust_lru(&mut self) {
        self.lru = if !self.resident.uses_tt() {
            Lru::Unshrinkable
        } else if self.madv != Madvise::WillNeed {
            Lru::Purgeable
        } else if self.backing.is_some() {
            Lru::HasPages
        } else {
            Lru::NoPages
        };
    }

    /// Read/write domains right after the backing store changed.
    pub(super) fn adjust_domains(&mut self) {
        let domain = if self.resident.is_local() || self.caching != Caching::Cached {
            Domains::WC
        } else {
            Domains::CPU
        };
        self.read_domains = domain;
        self.write_domain = domain;
    }
}

/// A GPU buffer object.
pub struct GemObject {
    gt: Arc<Gt>,
    size: u64,
    kind: ObjectKind,
    flags: ObjectFlags,
    ww: Arc<WwMutex>,
    resv: Reservation,
    vmas: RwLock<VmaRegistry>,
    pub(super) mm: Mutex<ObjMm>,
    userfault_count: AtomicUsize,
    was_bound: AtomicBool,
}

impl fmt::Debug for GemObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mm = lock(&self.mm);
        f.debug_struct("GemObject")
            .field("size", &self.size)
            .field("kind", &self.kind)
            .field("region", &mm.region.name())
            .field("resident", &mm.resident.name())
            .field("madv", &mm.madv)
            .field("pages_pin", &mm.pages_pin)
            .finish_non_exhaustive()
    }
}

impl GemObject {
    /// Creates an object placed in the first of its allowed regions.
    ///
    /// The size is rounded up to the largest minimum page size among the
    /// placements, so the object can move between them page for page.
    /// Backing pages are only allocated on first use.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size or an unknown region.
    pub fn new(gt: &Arc<Gt>, params: ObjectParams) -> VmaResult<Arc<Self>> {
        if params.size == 0 {
            return Err(VmaError::InvalidArgument("zero sized object"));
        }
        let memory = gt.memory();
        let placements = if params.placements.is_empty() {
            vec![memory.system().clone()]
        } else {
            params
                .placements
                .iter()
                .map(|&id| memory.region(id).cloned())
                .collect::<Option<Vec<_>>>()
                .ok_or(VmaError::InvalidArgument("unknown placement region"))?
        };
        let page = placements
            .iter()
            .map(|r| r.min_page_size())
            .max()
            .unwrap_or(PAGE_SIZE);
        let size = align_up(params.size, page);

        let region = placements[0].clone();
        let caching = if region.uses_tt() && (gt.config().has_llc || gt.config().has_snoop) {
            Caching::Cached
        } else {
            Caching::WriteCombined
        };
        let mut mm = ObjMm {
            backing: None,
            resident: region.clone(),
            pages: None,
            pages_pin: 0,
            madv: Madvise::WillNeed,
            dirty: false,
            mem_flags: MemFlags::empty(),
            cache_level: CacheLevel::None,
            caching,
            read_domains: Domains::empty(),
            write_domain: Domains::empty(),
            cached_io: None,
            moving: None,
            lru: Lru::NoPages,
            region,
            placements,
            tiling: Tiling::None,
            stride: 0,
        };
        mm.adjust_domains();
        mm.adjust_lru();
        let obj = Self {
            gt: gt.clone(),
            size,
            kind: params.kind,
            flags: params.flags,
            ww: WwMutex::new(),
            resv: Reservation::new(),
            vmas: RwLock::new(VmaRegistry::default()),
            mm: Mutex::new(mm),
            userfault_count: AtomicUsize::new(0),
            was_bound: AtomicBool::new(false),
        };
        obj.adjust_after_move(&mut lock(&obj.mm));
        Ok(Arc::new(obj))
    }

    // ===========================================================================================
    // Accessors
    // ===========================================================================================

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn gt(&self) -> &Arc<Gt> {
        &self.gt
    }

    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[must_use]
    pub fn vmas(&self) -> &RwLock<VmaRegistry> {
        &self.vmas
    }

    /// Every mapping entry of the object, GGTT ones first.
    #[must_use]
    pub fn vma_list(&self) -> Vec<Arc<Vma>> {
        read(&self.vmas).iter().cloned().collect()
    }

    #[must_use]
    pub fn ww_lock(&self) -> &Arc<WwMutex> {
        &self.ww
    }

    #[must_use]
    pub const fn resv(&self) -> &Reservation {
        &self.resv
    }

    pub(super) fn lock_mm(&self) -> MutexGuard<'_, ObjMm> {
        lock(&self.mm)
    }

    /// The region the object counts as placed in.
    #[must_use]
    pub fn region(&self) -> Arc<MemoryRegion> {
        lock(&self.mm).region.clone()
    }

    /// The region the backing store currently lives in. Differs from
    /// [`GemObject::region`] after an eviction to a region outside the
    /// placements.
    #[must_use]
    pub fn resident_region(&self) -> Arc<MemoryRegion> {
        lock(&self.mm).resident.clone()
    }

    #[must_use]
    pub fn placements(&self) -> Vec<RegionId> {
        lock(&self.mm).placements.iter().map(|r| r.id()).collect()
    }

    /// Whether GPU bindings of the current backing go to local memory.
    #[must_use]
    pub fn is_lmem(&self) -> bool {
        lock(&self.mm).resident.is_local()
    }

    #[must_use]
    pub const fn is_readonly(&self) -> bool {
        self.flags.contains(ObjectFlags::READONLY)
    }

    #[must_use]
    pub const fn flags(&self) -> ObjectFlags {
        self.flags
    }

    #[must_use]
    pub fn cache_level(&self) -> CacheLevel {
        lock(&self.mm).cache_level
    }

    #[must_use]
    pub fn mem_flags(&self) -> MemFlags {
        lock(&self.mm).mem_flags
    }

    #[must_use]
    pub fn domains(&self) -> (Domains, Domains) {
        let mm = lock(&self.mm);
        (mm.read_domains, mm.write_domain)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        lock(&self.mm).dirty
    }

    #[must_use]
    pub fn madv(&self) -> Madvise {
        lock(&self.mm).madv
    }

    #[must_use]
    pub fn lru(&self) -> Lru {
        lock(&self.mm).lru
    }

    #[must_use]
    pub fn cached_io(&self) -> Option<Arc<SgTable>> {
        lock(&self.mm).cached_io.clone()
    }

    #[must_use]
    pub fn tiling(&self) -> (Tiling, u32) {
        let mm = lock(&self.mm);
        (mm.tiling, mm.stride)
    }

    /// Whether any entry of the object was ever bound.
    #[must_use]
    pub fn was_bound(&self) -> bool {
        self.was_bound.load(Ordering::Acquire)
    }

    pub(crate) fn mark_bound(&self) {
        self.was_bound.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn userfault_count(&self) -> usize {
        self.userfault_count.load(Ordering::Acquire)
    }

    pub(crate) fn userfault_inc(&self) {
        self.userfault_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn userfault_dec(&self) {
        let prev = self.userfault_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "userfault count underflow");
    }

    // ===========================================================================================
    // Locking
    // ===========================================================================================

    /// Takes the object lock through `ww`.
    pub fn lock(self: &Arc<Self>, ww: &mut WwCtx, ctx: &WaitCtx) -> VmaResult<()> {
        self.ww.lock(ww, ctx)
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.ww.is_locked()
    }

    // ===========================================================================================
    // Pages
    // ===========================================================================================

    pub(super) fn populate_locked(&self, mm: &mut ObjMm) -> VmaResult<Arc<SgTable>> {
        if mm.madv == Madvise::Purged {
            return Err(VmaError::InvalidArgument("object contents were purged"));
        }
        if let Some(backing) = &mm.backing {
            return Ok(backing.clone());
        }
        let blocks = mm.resident.alloc(self.size)?;
        let backing = SgTable::from_blocks(blocks);
        log::trace!("populated {} bytes in {}", self.size, mm.resident.name());
        mm.backing = Some(backing.clone());
        if mm.resident.is_local() {
            mm.cached_io = Some(backing.clone());
        }
        mm.adjust_lru();
        Ok(backing)
    }

    /// Pins the backing pages, allocating them on first use.
    pub fn pin_pages(&self) -> VmaResult<Arc<SgTable>> {
        let mut mm = lock(&self.mm);
        let pages = match &mm.pages {
            Some(pages) => pages.clone(),
            None => {
                let pages = self.populate_locked(&mut mm)?;
                mm.pages = Some(pages.clone());
                pages
            }
        };
        mm.pages_pin += 1;
        Ok(pages)
    }

    pub fn unpin_pages(&self) {
        let mut mm = lock(&self.mm);
        debug_assert!(mm.pages_pin > 0, "unbalanced unpin_pages");
        mm.pages_pin = mm.pages_pin.saturating_sub(1);
    }

    /// The pages currently handed out to mappings.
    #[must_use]
    pub fn pages(&self) -> Option<Arc<SgTable>> {
        lock(&self.mm).pages.clone()
    }

    #[must_use]
    pub fn pages_pin_count(&self) -> usize {
        lock(&self.mm).pages_pin
    }

    /// Takes the pages back from the mapping layer. The backing store itself
    /// stays until the object moves or is purged.
    ///
    /// # Errors
    /// `Busy` while any user still pins them.
    pub fn put_pages(&self) -> VmaResult<()> {
        let mut mm = lock(&self.mm);
        if mm.pages_pin > 0 {
            return Err(VmaError::Busy);
        }
        mm.pages = None;
        Ok(())
    }

    /// Whether backing storage is allocated.
    #[must_use]
    pub fn has_backing(&self) -> bool {
        lock(&self.mm).backing.is_some()
    }

    // ===========================================================================================
    // Fences
    // ===========================================================================================

    /// The completion of the move that produced the current backing, while
    /// it is still outstanding or failed.
    #[must_use]
    pub fn moving_fence(&self) -> Option<Arc<Fence>> {
        let mut mm = lock(&self.mm);
        if mm
            .moving
            .as_ref()
            .is_some_and(|f| f.is_signaled() && f.error().is_none())
        {
            mm.moving = None;
        }
        mm.moving.clone()
    }

    /// Waits for a pending move and reports its outcome.
    pub fn wait_moving(&self, ctx: &WaitCtx) -> VmaResult<()> {
        let Some(fence) = self.moving_fence() else {
            return Ok(());
        };
        fence.wait(ctx)?;
        fence.error().map_or(Ok(()), Err)
    }

    /// Records GPU use of the object by a request.
    pub(crate) fn mark_gpu_access(&self, write: bool) {
        let mut mm = lock(&self.mm);
        if write {
            mm.write_domain = Domains::RENDER;
            mm.read_domains = Domains::empty();
        }
        mm.read_domains |= Domains::GPU_DOMAINS;
        mm.dirty = true;
    }

    // ===========================================================================================
    // CPU access
    // ===========================================================================================

    fn cpu_access<F>(&self, ctx: &WaitCtx, offset: u64, len: usize, write: bool, mut f: F) -> VmaResult<()>
    where
        F: FnMut(u64, std::ops::Range<usize>) -> VmaResult<()>,
    {
        if offset.checked_add(len as u64).is_none_or(|end| end > self.size) {
            return Err(VmaError::InvalidArgument("access past the end of the object"));
        }
        self.wait_moving(ctx)?;
        if write {
            self.resv.wait(ctx)?;
        } else if let (Some(excl), _) = self.resv.fences() {
            excl.wait(ctx)?;
        }

        let backing = {
            let mut mm = lock(&self.mm);
            let backing = self.populate_locked(&mut mm)?;
            mm.read_domains |= Domains::CPU;
            if write {
                mm.write_domain = Domains::CPU;
                mm.read_domains = Domains::CPU;
                mm.dirty = true;
            }
            backing
        };

        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let page = usize::try_from(pos / GTT_PAGE_SIZE_4K).map_err(|_| VmaError::TooBig)?;
            let in_page = pos % GTT_PAGE_SIZE_4K;
            let dma = backing
                .dma_address(page)
                .ok_or(VmaError::Invariant("backing shorter than the object"))?;
            let chunk = (len - done).min(usize::try_from(GTT_PAGE_SIZE_4K - in_page).unwrap_or(usize::MAX));
            f(dma + in_page, done..done + chunk)?;
            done += chunk;
        }
        Ok(())
    }

    /// Reads through the CPU after outstanding GPU writes and moves.
    pub fn read(&self, ctx: &WaitCtx, offset: u64, buf: &mut [u8]) -> VmaResult<()> {
        let memory = self.gt.memory().clone();
        self.cpu_access(ctx, offset, buf.len(), false, |dma, span| memory.read(dma, &mut buf[span]))
    }

    /// Writes through the CPU once the GPU is done with the object.
    pub fn write(&self, ctx: &WaitCtx, offset: u64, data: &[u8]) -> VmaResult<()> {
        if self.is_readonly() {
            return Err(VmaError::InvalidArgument("object is read-only"));
        }
        let memory = self.gt.memory().clone();
        self.cpu_access(ctx, offset, data.len(), true, |dma, span| memory.write(dma, &data[span]))
    }

    // ===========================================================================================
    // Advice and tiling
    // ===========================================================================================

    /// Sets the retention advice. Returns whether the contents still exist.
    pub fn madvise(&self, advice: Madvise) -> bool {
        let mut mm = lock(&self.mm);
        if mm.madv != Madvise::Purged {
            mm.madv = advice;
        }
        mm.adjust_lru();
        mm.madv != Madvise::Purged
    }

    /// Discards the backing store. The object keeps failing page requests.
    pub(super) fn purge_locked(mm: &mut ObjMm) {
        log::debug!("purging {} bytes from {}", mm.backing.as_ref().map_or(0, |b| b.len_bytes()), mm.resident.name());
        mm.backing = None;
        mm.pages = None;
        mm.cached_io = None;
        mm.madv = Madvise::Purged;
        mm.adjust_lru();
    }

    /// Changes the tiling layout.
    ///
    /// GGTT entries get new fence requirements; placed ones that no longer
    /// satisfy them are unbound.
    ///
    /// # Errors
    /// `InvalidArgument` for a stride that does not fit the tiling, `Busy`
    /// if a misfit entry is pinned.
    pub fn set_tiling(&self, ctx: &WaitCtx, tiling: Tiling, stride: u32) -> VmaResult<()> {
        let stride = if tiling == Tiling::None { 0 } else { stride };
        if tiling != Tiling::None && (stride == 0 || stride % iomap::tile_width(tiling) != 0) {
            return Err(VmaError::InvalidArgument("stride is not a multiple of the tile width"));
        }

        let ggtt: Vec<_> = read(&self.vmas).ggtt().cloned().collect();
        for vma in &ggtt {
            let size = iomap::fence_size(vma.size(), tiling, stride)?;
            let alignment = iomap::fence_alignment(tiling);
            let misfit = vma
                .node()
                .is_some_and(|n| n.size < size || n.start % alignment != 0);
            if misfit {
                vma.unbind(ctx)?;
            }
            if vma.fence_reg().is_some() {
                vma.revoke_fence()?;
            }
            vma.set_fence_params(size, alignment);
            vma.set_map_and_fenceable();
        }

        let mut mm = lock(&self.mm);
        mm.tiling = tiling;
        mm.stride = stride;
        Ok(())
    }

    // ===========================================================================================
    // Unbinding
    // ===========================================================================================

    /// Unbinds every bound entry of the object.
    ///
    /// Entries still in use by the GPU are only unbound with `ACTIVE`. With
    /// `ASYNC` an entry is first offered an asynchronous unbind, which needs
    /// the object lock held; a refusal falls back to a synchronous one.
    /// With `TEST` nothing is unbound and `Busy` reports a bound entry.
    pub fn unbind(&self, flags: UnbindFlags, ctx: &WaitCtx) -> VmaResult<()> {
        let mut flushed = false;
        loop {
            match self.unbind_pass(flags, ctx) {
                Err(VmaError::Again) if flags.contains(UnbindFlags::BARRIER) && !flushed => {
                    self.gt.unbound_wq().flush();
                    flushed = true;
                }
                other => return other,
            }
        }
    }

    fn unbind_pass(&self, flags: UnbindFlags, ctx: &WaitCtx) -> VmaResult<()> {
        for vma in self.vma_list() {
            if !vma.is_bound(BindFlags::all()) {
                continue;
            }
            if flags.contains(UnbindFlags::TEST) {
                return Err(VmaError::Busy);
            }
            let vm = vma.vm().clone();
            if !vm.tryopen() {
                return Err(VmaError::Again);
            }
            let result = Self::unbind_one(&vma, flags, ctx);
            vm.close();
            result?;
        }
        Ok(())
    }

    fn unbind_one(vma: &Arc<Vma>, flags: UnbindFlags, ctx: &WaitCtx) -> VmaResult<()> {
        let trylock = flags.contains(UnbindFlags::VM_TRYLOCK);
        let mut result = Err(VmaError::Busy);
        if flags.contains(UnbindFlags::ASYNC) {
            result = vma.unbind_async(ctx, trylock);
        }
        if result == Err(VmaError::Busy) && (flags.contains(UnbindFlags::ACTIVE) || !vma.is_active()) {
            result = if trylock {
                let class = if vma.is_bound(BindFlags::GLOBAL) {
                    LockClass::Global
                } else {
                    LockClass::User
                };
                match vma.vm().try_lock(class) {
                    Some(mut guard) => vma.unbind_locked(&mut guard, ctx),
                    None => Err(VmaError::Busy),
                }
            } else {
                vma.unbind(ctx)
            };
        }
        result
    }

    // ===========================================================================================
    // Post-move bookkeeping
    // ===========================================================================================

    /// Recomputes region, memory flags and cache level from where the
    /// backing now lives. The region only follows into an allowed placement.
    pub(super) fn adjust_after_move(&self, mm: &mut ObjMm) {
        if mm.region.id() != mm.resident.id() {
            if let Some(mr) = mm.placements.iter().find(|r| r.id() == mm.resident.id()) {
                mm.region = mr.clone();
            }
        }

        mm.mem_flags = if mm.resident.is_local() {
            MemFlags::IOMEM
        } else {
            MemFlags::STRUCT_PAGE
        };
        mm.cache_level = self.cache_level_for(&mm.resident, mm.caching);
    }

    /// Cache level of a binding of backing in `region`.
    pub(super) fn cache_level_for(&self, region: &MemoryRegion, caching: Caching) -> CacheLevel {
        let config = self.gt.config();
        if (config.has_llc || config.has_snoop) && !region.is_local() && caching == Caching::Cached {
            CacheLevel::Llc
        } else {
            CacheLevel::None
        }
    }
}

impl Drop for GemObject {
    fn drop(&mut self) {
        let vmas = write(&self.vmas).drain();
        if vmas.is_empty() {
            return;
        }
        for vma in &vmas {
            self.gt.remove_closed(vma);
        }
        // The last reference may go away under an address space lock that
        // the unbinds need, so they run on a worker.
        self.gt.unbound_wq().queue(move || {
            for vma in vmas {
                vma.destroy();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::mm::RegionId;

    fn gt() -> Arc<Gt> {
        Gt::new(DeviceConfig::new().ggtt(16 << 20, 8 << 20).local_memory(8 << 20)).unwrap()
    }

    #[test]
    fn size_rounds_to_placement_pages() {
        let gt = gt();
        let obj = GemObject::new(&gt, ObjectParams::new(4096).placements(&[RegionId(0), RegionId(1)])).unwrap();
        assert_eq!(obj.size(), 64 << 10);
        assert!(GemObject::new(&gt, ObjectParams::new(0)).is_err());
        assert!(GemObject::new(&gt, ObjectParams::new(4096).placements(&[RegionId(7)])).is_err());
    }

    #[test]
    fn system_objects_start_cached_and_cpu_coherent() {
        let gt = gt();
        let obj = GemObject::new(&gt, ObjectParams::new(8192)).unwrap();
        assert_eq!(obj.cache_level(), CacheLevel::Llc);
        assert_eq!(obj.mem_flags(), MemFlags::STRUCT_PAGE);
        assert_eq!(obj.domains(), (Domains::CPU, Domains::CPU));
        assert_eq!(obj.lru(), Lru::NoPages);

        let lmem = GemObject::new(&gt, ObjectParams::new(8192).placements(&[RegionId(1)])).unwrap();
        assert!(lmem.is_lmem());
        assert_eq!(lmem.cache_level(), CacheLevel::None);
        assert_eq!(lmem.mem_flags(), MemFlags::IOMEM);
        assert_eq!(lmem.lru(), Lru::Unshrinkable);
    }

    #[test]
    fn pinned_pages_cannot_be_put() {
        let gt = gt();
        let obj = GemObject::new(&gt, ObjectParams::new(8192)).unwrap();
        let pages = obj.pin_pages().unwrap();
        assert!(Arc::ptr_eq(&pages, &obj.pages().unwrap()));
        assert_eq!(obj.put_pages(), Err(VmaError::Busy));
        obj.unpin_pages();
        obj.put_pages().unwrap();
        assert!(obj.pages().is_none());
        assert!(obj.has_backing());
    }

    #[test]
    fn cpu_access_spans_pages() {
        let gt = gt();
        let obj = GemObject::new(&gt, ObjectParams::new(3 * 4096)).unwrap();
        let ctx = WaitCtx::uninterruptible();
        let data: Vec<u8> = (0..6000).map(|i| (i % 251) as u8).collect();
        obj.write(&ctx, 3000, &data).unwrap();
        let mut back = vec![0; data.len()];
        obj.read(&ctx, 3000, &mut back).unwrap();
        assert_eq!(back, data);
        assert!(obj.is_dirty());
        assert!(obj.read(&ctx, 3 * 4096 - 1, &mut [0; 2]).is_err());
    }

    #[test]
    fn purged_objects_refuse_pages() {
        let gt = gt();
        let obj = GemObject::new(&gt, ObjectParams::new(4096)).unwrap();
        assert!(obj.madvise(Madvise::DontNeed));
        assert_eq!(obj.lru(), Lru::Purgeable);
        GemObject::purge_locked(&mut obj.lock_mm());
        assert!(!obj.madvise(Madvise::WillNeed));
        assert!(obj.pin_pages().is_err());
    }

    #[test]
    fn tiling_checks_stride() {
        let gt = gt();
        let obj = GemObject::new(&gt, ObjectParams::new(64 << 10)).unwrap();
        let ctx = WaitCtx::uninterruptible();
        assert!(obj.set_tiling(&ctx, Tiling::X, 100).is_err());
        obj.set_tiling(&ctx, Tiling::X, 512).unwrap();
        assert_eq!(obj.tiling(), (Tiling::X, 512));
        obj.set_tiling(&ctx, Tiling::None, 512).unwrap();
        assert_eq!(obj.tiling(), (Tiling::None, 0));
    }
}
