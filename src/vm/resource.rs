//! Residency descriptors: the detached inputs of one binding.
//!
//! A descriptor outlives its entry's binding so that an unbind can finish on
//! a worker after the entry itself has moved on. The pages it holds stay
//! valid until its unbind fence signals.

use crate::error::VmaResult;
use crate::gt::pm::Wakeref;
use crate::mm::{PageSizes, RegionId, SgTable};
use crate::sync::{Fence, FenceWork};
use crate::utils::lock;
use crate::vm::address_space::{AddressSpace, PtStash, Pte};
use crate::vm::flags::{BindFlags, CacheLevel};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Low level page table operations of one kind of address space.
pub trait VmaOps: Send + Sync + fmt::Debug {
    /// Writes the PTEs for `res`. Only the bind kinds in `flags` are new.
    fn bind_vma(
        &self,
        vm: &AddressSpace,
        stash: Option<&mut PtStash>,
        res: &VmaResource,
        cache_level: CacheLevel,
        flags: BindFlags,
    ) -> VmaResult<()>;

    /// Points the range of `res` back at scratch.
    fn unbind_vma(&self, vm: &AddressSpace, res: &VmaResource);
}

/// Operations for the global GTT. A local bind on the GGTT lands in the
/// aliasing address space when there is one.
#[derive(Debug, Default)]
pub struct GgttOps;

impl VmaOps for GgttOps {
    fn bind_vma(
        &self,
        vm: &AddressSpace,
        stash: Option<&mut PtStash>,
        res: &VmaResource,
        cache_level: CacheLevel,
        flags: BindFlags,
    ) -> VmaResult<()> {
        let template = res.pte_template(cache_level);
        if flags.contains(BindFlags::LOCAL) {
            if let Some(alias) = vm.alias() {
                alias.allocate_va_range(stash, res.start, res.node_size)?;
                alias.insert_entries(&res.pages, res.start, template);
            }
        }
        if flags.contains(BindFlags::GLOBAL) {
            vm.insert_entries(&res.pages, res.start, template);
        }
        Ok(())
    }

    fn unbind_vma(&self, vm: &AddressSpace, res: &VmaResource) {
        let bound = res.bound_flags();
        if bound.contains(BindFlags::GLOBAL) {
            vm.clear_range(res.start, res.node_size);
        }
        if bound.contains(BindFlags::LOCAL) {
            if let Some(alias) = vm.alias() {
                alias.clear_range(res.start, res.node_size);
            }
        }
    }
}

/// Operations for a per-context address space.
#[derive(Debug, Default)]
pub struct PpgttOps;

impl VmaOps for PpgttOps {
    fn bind_vma(
        &self,
        vm: &AddressSpace,
        stash: Option<&mut PtStash>,
        res: &VmaResource,
        cache_level: CacheLevel,
        _flags: BindFlags,
    ) -> VmaResult<()> {
        if !res.allocated.load(Ordering::Acquire) {
            vm.allocate_va_range(stash, res.start, res.node_size)?;
            res.allocated.store(true, Ordering::Release);
        }
        vm.insert_entries(&res.pages, res.start, res.pte_template(cache_level));
        Ok(())
    }

    fn unbind_vma(&self, vm: &AddressSpace, res: &VmaResource) {
        if res.allocated.load(Ordering::Acquire) {
            vm.clear_range(res.start, res.node_size);
        }
    }
}

/// A descriptor allocated before the address space lock is taken, so the
/// bind itself never allocates.
#[derive(Debug)]
#[must_use = "an unused descriptor should be dropped explicitly"]
pub struct ResourceSlot(());

/// Snapshot of an entry's bind inputs.
pub struct VmaResource {
    pub(crate) vm: Arc<AddressSpace>,
    pub(crate) ops: Arc<dyn VmaOps>,
    pub(crate) pages: Arc<SgTable>,
    pub(crate) page_sizes: PageSizes,
    pub(crate) read_only: bool,
    pub(crate) lmem: bool,
    pub(crate) region: Option<RegionId>,
    pub(crate) start: u64,
    pub(crate) node_size: u64,
    pub(crate) vma_size: u64,
    allocated: AtomicBool,
    bound: AtomicU32,
    wakeref: Mutex<Option<Wakeref>>,
    /// Work the unbind must wait for besides the bind itself.
    chain: Mutex<Vec<Arc<Fence>>>,
}

impl fmt::Debug for VmaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmaResource")
            .field("vm", &self.vm.id())
            .field("start", &format_args!("0x{:x}", self.start))
            .field("node_size", &self.node_size)
            .field("bound", &self.bound_flags())
            .finish_non_exhaustive()
    }
}

/// What an entry looked like when its binding was created.
#[derive(Debug)]
pub(crate) struct ResourceInit {
    pub vm: Arc<AddressSpace>,
    pub ops: Arc<dyn VmaOps>,
    pub pages: Arc<SgTable>,
    pub page_sizes: PageSizes,
    pub read_only: bool,
    pub lmem: bool,
    pub region: Option<RegionId>,
    pub start: u64,
    pub node_size: u64,
    pub vma_size: u64,
}

impl VmaResource {
    pub fn alloc() -> ResourceSlot {
        ResourceSlot(())
    }

    pub(crate) fn init(_slot: ResourceSlot, init: ResourceInit) -> Arc<Self> {
        Arc::new(Self {
            vm: init.vm,
            ops: init.ops,
            pages: init.pages,
            page_sizes: init.page_sizes,
            read_only: init.read_only,
            lmem: init.lmem,
            region: init.region,
            start: init.start,
            node_size: init.node_size,
            vma_size: init.vma_size,
            allocated: AtomicBool::new(false),
            bound: AtomicU32::new(0),
            wakeref: Mutex::new(None),
            chain: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn pages(&self) -> &Arc<SgTable> {
        &self.pages
    }

    #[must_use]
    pub const fn page_sizes(&self) -> PageSizes {
        self.page_sizes
    }

    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub const fn node_size(&self) -> u64 {
        self.node_size
    }

    #[must_use]
    pub const fn vma_size(&self) -> u64 {
        self.vma_size
    }

    #[must_use]
    pub const fn region(&self) -> Option<RegionId> {
        self.region
    }

    #[must_use]
    pub fn bound_flags(&self) -> BindFlags {
        BindFlags::from_bits_truncate(self.bound.load(Ordering::Acquire))
    }

    pub(crate) fn mark_bound(&self, flags: BindFlags) {
        self.bound.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn pte_template(&self, cache_level: CacheLevel) -> Pte {
        Pte {
            dma: 0,
            read_only: self.read_only,
            cache_level,
            lmem: self.lmem,
        }
    }

    /// Runs the low level bind for `flags` and records them.
    pub(crate) fn bind(&self, stash: Option<&mut PtStash>, cache_level: CacheLevel, flags: BindFlags) -> VmaResult<()> {
        self.ops.bind_vma(&self.vm, stash, self, cache_level, flags)?;
        self.mark_bound(flags);
        Ok(())
    }

    /// Makes the unbind wait for `fences` too.
    pub(crate) fn await_fences(&self, fences: Vec<Arc<Fence>>) {
        lock(&self.chain).extend(fences);
    }

    /// Keeps the device awake until the unbind has run.
    pub(crate) fn hold_wakeref(&self) {
        *lock(&self.wakeref) = Some(self.vm.rpm().get());
    }

    /// Queues the unbind of this binding and returns its completion.
    ///
    /// The range is registered as pending so that new binds overlapping it
    /// wait. With nothing to wait for, the PTEs are cleared before this
    /// returns. An address space that was closed in the meantime is left
    /// alone.
    pub fn unbind(self: &Arc<Self>) -> Arc<Fence> {
        let mut work = FenceWork::new("vma-unbind", self.vm.unbind_wq().clone());
        work.ignore_errors();
        for fence in lock(&self.chain).drain(..) {
            work.chain(Some(&fence));
        }

        let fence = work.fence().clone();
        self.vm
            .add_pending_unbind(self.start, self.start + self.node_size, fence.clone());

        let res = self.clone();
        work.enable(move || {
            if res.vm.is_open() {
                res.ops.unbind_vma(&res.vm, &res);
            }
        });

        let res = self.clone();
        let done = fence.clone();
        work.on_release(move || {
            res.vm.remove_pending_unbind(&done);
            lock(&res.wakeref).take();
        });
        work.commit();
        fence
    }
}
