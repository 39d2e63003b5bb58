//! GPU address spaces: a range allocator, a page table and the list of
//! entries currently placed in them.

use crate::error::{VmaError, VmaResult};
use crate::gt::pm::RuntimePm;
use crate::mm::{Memory, Node, RangeAllocator, SgTable};
use crate::mm::sgt::SCRATCH_DMA;
use crate::sync::{Fence, FenceWork, WaitCtx, WorkQueue};
use crate::utils::{GTT_PAGE_SIZE_2M, GTT_PAGE_SIZE_4K, GTT_PAGE_SIZE_64K, PAGE_SHIFT, align_down, lock};
use crate::vm::flags::{BindFlags, CacheLevel};
use crate::vm::vma::Vma;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::thread;
use std::time::Duration;

static NEXT_VM: AtomicU64 = AtomicU64::new(1);

const LOCK_POLL: Duration = Duration::from_micros(500);

/// Stable identity of an address space, used to order mapping keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmKind {
    /// The global GTT. Only `[0, mappable_end)` is reachable by the CPU.
    Ggtt { mappable_end: u64 },
    /// A per-context address space.
    Ppgtt,
    /// The per-context view that shadows the GGTT for local binds. It is
    /// only ever reached through GGTT entries.
    AliasingPpgtt,
}

/// Which kind of caller took the address space lock. Global binds may be
/// taken while user binds are held, so the two are kept apart for
/// diagnostics; both classes share one mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockClass {
    Global,
    User,
}

/// One page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    pub dma: u64,
    pub read_only: bool,
    pub cache_level: CacheLevel,
    pub lmem: bool,
}

/// Page directories reserved ahead of taking the address space lock.
#[derive(Debug, Default)]
pub struct PtStash {
    tables: usize,
}

impl PtStash {
    #[must_use]
    pub const fn tables(&self) -> usize {
        self.tables
    }
}

/// Everything the address space lock protects.
#[derive(Debug)]
pub struct VmState {
    pub(crate) mm: RangeAllocator,
    bound: Vec<Weak<Vma>>,
}

impl VmState {
    /// Moves `vma` to the most recently used end of the bound list.
    pub(crate) fn add_tail(&mut self, vma: &Arc<Vma>) {
        self.detach(vma);
        self.bound.push(Arc::downgrade(vma));
    }

    pub(crate) fn detach(&mut self, vma: &Vma) {
        let ptr: *const Vma = vma;
        self.bound.retain(|w| w.strong_count() > 0 && w.as_ptr() != ptr);
    }

    /// Placed entries, least recently used first.
    #[must_use]
    pub fn bound_list(&self) -> Vec<Arc<Vma>> {
        self.bound.iter().filter_map(Weak::upgrade).collect()
    }

    #[must_use]
    pub fn mm(&self) -> &RangeAllocator {
        &self.mm
    }
}

/// Holds the address space lock.
pub struct VmGuard<'a> {
    class: LockClass,
    state: MutexGuard<'a, VmState>,
}

impl VmGuard<'_> {
    #[must_use]
    pub const fn class(&self) -> LockClass {
        self.class
    }
}

impl Deref for VmGuard<'_> {
    type Target = VmState;

    fn deref(&self) -> &VmState {
        &self.state
    }
}

impl DerefMut for VmGuard<'_> {
    fn deref_mut(&mut self) -> &mut VmState {
        &mut self.state
    }
}

impl fmt::Debug for VmGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmGuard").field("class", &self.class).finish()
    }
}

#[derive(Debug)]
struct PendingUnbind {
    start: u64,
    end: u64,
    fence: Arc<Fence>,
}

pub struct AddressSpace {
    id: VmId,
    kind: VmKind,
    total: u64,
    memory: Arc<Memory>,
    unbind_wq: Arc<WorkQueue>,
    rpm: RuntimePm,
    bind_async: BindFlags,
    coloring: bool,
    alias: Option<Arc<AddressSpace>>,
    open: AtomicUsize,
    state: Mutex<VmState>,
    ptes: Mutex<BTreeMap<u64, Pte>>,
    page_tables: Mutex<BTreeSet<u64>>,
    pending_unbind: Mutex<Vec<PendingUnbind>>,
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("total", &format_args!("0x{:x}", self.total))
            .finish_non_exhaustive()
    }
}

impl AddressSpace {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kind: VmKind,
        total: u64,
        memory: Arc<Memory>,
        unbind_wq: Arc<WorkQueue>,
        rpm: RuntimePm,
        bind_async: BindFlags,
        coloring: bool,
        alias: Option<Arc<AddressSpace>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: VmId(NEXT_VM.fetch_add(1, Ordering::Relaxed)),
            kind,
            total,
            memory,
            unbind_wq,
            rpm,
            bind_async,
            coloring,
            alias,
            open: AtomicUsize::new(1),
            state: Mutex::new(VmState {
                mm: RangeAllocator::new(0, total, coloring),
                bound: Vec::new(),
            }),
            ptes: Mutex::new(BTreeMap::new()),
            page_tables: Mutex::new(BTreeSet::new()),
            pending_unbind: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub const fn id(&self) -> VmId {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> VmKind {
        self.kind
    }

    #[must_use]
    pub const fn is_ggtt(&self) -> bool {
        matches!(self.kind, VmKind::Ggtt { .. })
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// End of the CPU-visible aperture; the whole space outside the GGTT.
    #[must_use]
    pub const fn mappable_end(&self) -> u64 {
        match self.kind {
            VmKind::Ggtt { mappable_end } => mappable_end,
            _ => self.total,
        }
    }

    /// Bind kinds this address space executes on a worker.
    #[must_use]
    pub const fn bind_async_flags(&self) -> BindFlags {
        self.bind_async
    }

    #[must_use]
    pub const fn has_cache_coloring(&self) -> bool {
        self.coloring
    }

    #[must_use]
    pub fn alias(&self) -> Option<&Arc<AddressSpace>> {
        self.alias.as_ref()
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    pub(crate) fn unbind_wq(&self) -> &Arc<WorkQueue> {
        &self.unbind_wq
    }

    pub(crate) const fn rpm(&self) -> &RuntimePm {
        &self.rpm
    }

    /// Minimum placement alignment for memory backed by a region with
    /// pages of `min_page_size`.
    #[must_use]
    pub const fn min_alignment(&self, min_page_size: u64) -> u64 {
        if min_page_size >= GTT_PAGE_SIZE_64K && !self.is_ggtt() {
            GTT_PAGE_SIZE_64K
        } else {
            GTT_PAGE_SIZE_4K
        }
    }

    // ===========================================================================================
    // Locking
    // ===========================================================================================

    /// Takes the address space lock, giving up with `Interrupted` if `ctx`
    /// allows it and its token is raised while waiting.
    pub fn lock(&self, ctx: &WaitCtx, class: LockClass) -> VmaResult<VmGuard<'_>> {
        if !ctx.interruptible || ctx.interrupt.is_none() {
            return Ok(self.lock_uninterruptible(class));
        }
        loop {
            match self.state.try_lock() {
                Ok(state) => return Ok(VmGuard { class, state }),
                Err(TryLockError::Poisoned(p)) => {
                    return Ok(VmGuard {
                        class,
                        state: p.into_inner(),
                    });
                }
                Err(TryLockError::WouldBlock) => {
                    ctx.check()?;
                    thread::sleep(LOCK_POLL);
                }
            }
        }
    }

    pub fn lock_uninterruptible(&self, class: LockClass) -> VmGuard<'_> {
        VmGuard {
            class,
            state: lock(&self.state),
        }
    }

    #[must_use]
    pub fn try_lock(&self, class: LockClass) -> Option<VmGuard<'_>> {
        match self.state.try_lock() {
            Ok(state) => Some(VmGuard { class, state }),
            Err(TryLockError::Poisoned(p)) => Some(VmGuard {
                class,
                state: p.into_inner(),
            }),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    // ===========================================================================================
    // Page tables
    // ===========================================================================================

    /// Reserves page directories for a mapping of `size` bytes. The global
    /// GTT is flat and needs none.
    pub fn alloc_pt_stash(&self, size: u64) -> PtStash {
        if self.is_ggtt() {
            return PtStash::default();
        }
        PtStash {
            tables: usize::try_from(size.div_ceil(GTT_PAGE_SIZE_2M)).unwrap_or(usize::MAX) + 1,
        }
    }

    /// Makes sure page tables exist for `[start, start + len)`, taking them
    /// from `stash` when one was reserved.
    pub fn allocate_va_range(&self, mut stash: Option<&mut PtStash>, start: u64, len: u64) -> VmaResult<()> {
        let mut tables = lock(&self.page_tables);
        let first = align_down(start, GTT_PAGE_SIZE_2M) / GTT_PAGE_SIZE_2M;
        let last = (start + len).div_ceil(GTT_PAGE_SIZE_2M);
        for idx in first..last {
            if tables.contains(&idx) {
                continue;
            }
            if let Some(stash) = stash.as_deref_mut() {
                if stash.tables == 0 {
                    debug_assert!(false, "page table stash exhausted");
                    return Err(VmaError::Invariant("page table stash exhausted"));
                }
                stash.tables -= 1;
            }
            tables.insert(idx);
        }
        Ok(())
    }

    /// Page tables currently allocated.
    #[must_use]
    pub fn page_table_count(&self) -> usize {
        lock(&self.page_tables).len()
    }

    /// Writes a PTE for every page of `pages` starting at `start`.
    pub fn insert_entries(&self, pages: &SgTable, start: u64, template: Pte) {
        let mut ptes = lock(&self.ptes);
        let first = start >> PAGE_SHIFT;
        for (i, dma) in pages.page_addresses().enumerate() {
            let idx = first + i as u64;
            if dma == SCRATCH_DMA {
                ptes.remove(&idx);
            } else {
                ptes.insert(idx, Pte { dma, ..template });
            }
        }
    }

    /// Points `[start, start + len)` back at scratch.
    pub fn clear_range(&self, start: u64, len: u64) {
        let first = start >> PAGE_SHIFT;
        let last = (start + len) >> PAGE_SHIFT;
        let mut ptes = lock(&self.ptes);
        let doomed: Vec<u64> = ptes.range(first..last).map(|(&k, _)| k).collect();
        for idx in doomed {
            ptes.remove(&idx);
        }
    }

    #[must_use]
    pub fn pte(&self, addr: u64) -> Option<Pte> {
        lock(&self.ptes).get(&(addr >> PAGE_SHIFT)).copied()
    }

    /// Number of live (non-scratch) PTEs.
    #[must_use]
    pub fn pte_count(&self) -> usize {
        lock(&self.ptes).len()
    }

    /// Reads through the page table. Scratch reads back as zero.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> VmaResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let va = addr + done as u64;
            let in_page = (va & (GTT_PAGE_SIZE_4K - 1)) as usize;
            let chunk = (buf.len() - done).min(GTT_PAGE_SIZE_4K as usize - in_page);
            match self.pte(va) {
                Some(pte) => self.memory.read(pte.dma + in_page as u64, &mut buf[done..done + chunk])?,
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        Ok(())
    }

    /// Writes through the page table. Writes to scratch are dropped.
    pub fn write(&self, addr: u64, data: &[u8]) -> VmaResult<()> {
        let mut done = 0;
        while done < data.len() {
            let va = addr + done as u64;
            let in_page = (va & (GTT_PAGE_SIZE_4K - 1)) as usize;
            let chunk = (data.len() - done).min(GTT_PAGE_SIZE_4K as usize - in_page);
            if let Some(pte) = self.pte(va) {
                if pte.read_only {
                    return Err(VmaError::InvalidArgument("write through read-only pte"));
                }
                self.memory.write(pte.dma + in_page as u64, &data[done..done + chunk])?;
            }
            done += chunk;
        }
        Ok(())
    }

    // ===========================================================================================
    // Pending unbinds
    // ===========================================================================================

    pub(crate) fn add_pending_unbind(&self, start: u64, end: u64, fence: Arc<Fence>) {
        lock(&self.pending_unbind).push(PendingUnbind { start, end, fence });
    }

    pub(crate) fn remove_pending_unbind(&self, fence: &Arc<Fence>) {
        lock(&self.pending_unbind).retain(|p| !Arc::ptr_eq(&p.fence, fence));
    }

    fn pending_in(&self, start: u64, end: u64) -> Vec<Arc<Fence>> {
        lock(&self.pending_unbind)
            .iter()
            .filter(|p| p.start < end && start < p.end && !p.fence.is_signaled())
            .map(|p| p.fence.clone())
            .collect()
    }

    /// Blocks until every unbind touching `[start, start + size)` is done.
    pub fn bind_dep_sync(&self, start: u64, size: u64, ctx: &WaitCtx) -> VmaResult<()> {
        for fence in self.pending_in(start, start + size) {
            fence.wait(ctx)?;
        }
        Ok(())
    }

    /// Orders `work` after every unbind touching `[start, start + size)`.
    pub fn bind_dep_await(&self, work: &mut FenceWork, start: u64, size: u64) {
        for fence in self.pending_in(start, start + size) {
            work.chain(Some(&fence));
        }
    }

    /// Whether any unbind is still outstanding.
    #[must_use]
    pub fn has_pending_unbinds(&self) -> bool {
        lock(&self.pending_unbind).iter().any(|p| !p.fence.is_signaled())
    }

    // ===========================================================================================
    // Open count and diagnostics
    // ===========================================================================================

    pub fn open(&self) {
        self.open.fetch_add(1, Ordering::AcqRel);
    }

    /// Takes an open reference unless the address space is already closed.
    pub fn tryopen(&self) -> bool {
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 0).then_some(n + 1))
            .is_ok()
    }

    /// Drops an open reference. Once closed, pending unbinds skip rewriting
    /// PTEs nobody can observe anymore.
    pub fn close(&self) {
        let prev = self.open.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced address space close");
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) > 0
    }

    /// Currently placed ranges, in address order.
    #[must_use]
    pub fn bound_ranges(&self) -> Vec<Node> {
        lock(&self.state).mm.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::GTT_PAGE_SIZE_4K as PAGE;

    fn ppgtt(memory: Arc<Memory>) -> Arc<AddressSpace> {
        AddressSpace::new(
            VmKind::Ppgtt,
            1 << 32,
            memory,
            WorkQueue::new("test-unbind", 1),
            RuntimePm::new(),
            BindFlags::LOCAL,
            false,
            None,
        )
    }

    #[test]
    fn ptes_route_reads_and_writes() {
        let memory = Arc::new(Memory::new(1 << 20, 0));
        let vm = ppgtt(memory.clone());
        let pages = SgTable::from_blocks(memory.system().alloc(2 * PAGE).unwrap());
        let template = Pte {
            dma: 0,
            read_only: false,
            cache_level: CacheLevel::None,
            lmem: false,
        };
        vm.insert_entries(&pages, 16 * PAGE, template);
        vm.write(17 * PAGE + 8, b"hello").unwrap();

        let mut buf = [0; 5];
        memory.read(pages.dma_address(1).unwrap() + 8, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        vm.clear_range(16 * PAGE, 2 * PAGE);
        vm.read(17 * PAGE + 8, &mut buf).unwrap();
        assert_eq!(buf, [0; 5]);
        assert_eq!(vm.pte_count(), 0);
    }

    #[test]
    fn stash_covers_straddling_range() {
        let vm = ppgtt(Arc::new(Memory::new(1 << 20, 0)));
        let mut stash = vm.alloc_pt_stash(GTT_PAGE_SIZE_2M);
        vm.allocate_va_range(Some(&mut stash), GTT_PAGE_SIZE_2M - PAGE, GTT_PAGE_SIZE_2M)
            .unwrap();
        assert_eq!(vm.page_table_count(), 2);
        assert_eq!(stash.tables(), 0);
    }

    #[test]
    fn pending_unbinds_block_overlapping_binds() {
        let vm = ppgtt(Arc::new(Memory::new(1 << 20, 0)));
        let fence = Fence::new("unbind");
        vm.add_pending_unbind(0, 4 * PAGE, fence.clone());

        let ctx = WaitCtx::uninterruptible().with_timeout(Duration::from_millis(5));
        assert_eq!(vm.bind_dep_sync(2 * PAGE, PAGE, &ctx), Err(VmaError::TimedOut));
        assert_eq!(vm.bind_dep_sync(4 * PAGE, PAGE, &ctx), Ok(()));

        fence.signal();
        vm.remove_pending_unbind(&fence);
        assert!(!vm.has_pending_unbinds());
    }

    #[test]
    fn open_count_gates_tryopen() {
        let vm = ppgtt(Arc::new(Memory::new(1 << 20, 0)));
        assert!(vm.tryopen());
        vm.close();
        vm.close();
        assert!(!vm.is_open());
        assert!(!vm.tryopen());
    }
}
