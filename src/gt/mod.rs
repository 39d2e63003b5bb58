//! The graphics tile: engines, the global GTT and device-wide bookkeeping.

pub mod engine;
pub mod migrate;
pub mod pm;

use crate::config::DeviceConfig;
use crate::error::{VmaError, VmaResult};
use crate::mm::Memory;
use crate::sync::{Fence, WaitCtx, WorkQueue, wait_all};
use crate::utils::{GTT_PAGE_SIZE_4K, is_aligned, lock};
use crate::vm::{AddressSpace, BindFlags, FenceRegs, Vma, VmKind};
use engine::{Engine, EngineClass};
use migrate::MigrateContext;
use pm::RuntimePm;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const PPGTT_SIZE: u64 = 1 << 48;
const GGTT_MAX_SIZE: u64 = 1 << 32;

pub struct Gt {
    config: DeviceConfig,
    memory: Arc<Memory>,
    ggtt: Arc<AddressSpace>,
    engines: Vec<Arc<Engine>>,
    migrate: Option<MigrateContext>,
    unbound_wq: Arc<WorkQueue>,
    highpri_wq: Arc<WorkQueue>,
    rpm: RuntimePm,
    fences: FenceRegs,
    wedged: AtomicBool,
    /// Closed entries waiting for the GT to idle.
    closed: Mutex<Vec<Arc<Vma>>>,
    requests: Mutex<Vec<Arc<Fence>>>,
    ggtt_flushes: AtomicU64,
}

impl fmt::Debug for Gt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gt")
            .field("ggtt", &self.ggtt)
            .field("engines", &self.engines)
            .field("wedged", &self.is_wedged())
            .finish_non_exhaustive()
    }
}

impl Gt {
    /// Brings up a GT for `config`.
    ///
    /// # Errors
    /// `InvalidArgument` if the GGTT is empty, above 4GiB or not page
    /// aligned, or if the mappable aperture does not fit inside it.
    pub fn new(config: DeviceConfig) -> VmaResult<Arc<Self>> {
        if config.ggtt_size == 0 || config.ggtt_size > GGTT_MAX_SIZE {
            return Err(VmaError::InvalidArgument("ggtt size out of range"));
        }
        if config.mappable_end > config.ggtt_size {
            return Err(VmaError::InvalidArgument("mappable aperture larger than the ggtt"));
        }
        if !is_aligned(config.ggtt_size, GTT_PAGE_SIZE_4K) || !is_aligned(config.mappable_end, GTT_PAGE_SIZE_4K) {
            return Err(VmaError::InvalidArgument("ggtt bounds not page aligned"));
        }

        let memory = Arc::new(Memory::new(config.system_size, config.local_size));
        let unbound_wq = WorkQueue::new("unbound", config.bind_workers);
        let highpri_wq = WorkQueue::new("highpri", 1);
        let rpm = RuntimePm::new();

        let async_flags = |flags: BindFlags| if config.async_binds { flags } else { BindFlags::empty() };
        let alias = AddressSpace::new(
            VmKind::AliasingPpgtt,
            config.ggtt_size,
            memory.clone(),
            unbound_wq.clone(),
            rpm.clone(),
            async_flags(BindFlags::LOCAL),
            false,
            None,
        );
        let ggtt = AddressSpace::new(
            VmKind::Ggtt {
                mappable_end: config.mappable_end,
            },
            config.ggtt_size,
            memory.clone(),
            unbound_wq.clone(),
            rpm.clone(),
            async_flags(BindFlags::GLOBAL | BindFlags::LOCAL),
            config.cache_coloring,
            Some(alias),
        );

        let rcs = Engine::new("rcs0", EngineClass::Render);
        let bcs = Engine::new("bcs0", EngineClass::Copy);
        let migrate = config
            .migrate_engine
            .then(|| MigrateContext::new(bcs.clone(), memory.clone()));

        log::debug!(
            "gt: ggtt {}MiB ({}MiB mappable), {} fence registers, lmem {}",
            config.ggtt_size >> 20,
            config.mappable_end >> 20,
            config.num_fence_regs,
            config.has_local_memory(),
        );

        Ok(Arc::new(Self {
            memory,
            ggtt,
            engines: vec![rcs, bcs],
            migrate,
            unbound_wq,
            highpri_wq,
            rpm,
            fences: FenceRegs::new(config.num_fence_regs),
            wedged: AtomicBool::new(false),
            closed: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            ggtt_flushes: AtomicU64::new(0),
            config,
        }))
    }

    // ===========================================================================================
    // Accessors
    // ===========================================================================================

    #[must_use]
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    #[must_use]
    pub fn ggtt(&self) -> &Arc<AddressSpace> {
        &self.ggtt
    }

    /// The per-context shadow of the GGTT used for local binds.
    #[must_use]
    pub fn alias(&self) -> Option<&Arc<AddressSpace>> {
        self.ggtt.alias()
    }

    #[must_use]
    pub fn engines(&self) -> &[Arc<Engine>] {
        &self.engines
    }

    #[must_use]
    pub fn engine(&self, class: EngineClass) -> Option<&Arc<Engine>> {
        self.engines.iter().find(|e| e.class() == class)
    }

    #[must_use]
    pub const fn migrate(&self) -> Option<&MigrateContext> {
        self.migrate.as_ref()
    }

    #[must_use]
    pub fn unbound_wq(&self) -> &Arc<WorkQueue> {
        &self.unbound_wq
    }

    #[must_use]
    pub fn highpri_wq(&self) -> &Arc<WorkQueue> {
        &self.highpri_wq
    }

    #[must_use]
    pub const fn rpm(&self) -> &RuntimePm {
        &self.rpm
    }

    #[must_use]
    pub const fn fence_regs(&self) -> &FenceRegs {
        &self.fences
    }

    /// A new per-context address space.
    #[must_use]
    pub fn create_ppgtt(&self) -> Arc<AddressSpace> {
        let bind_async = if self.config.async_binds {
            BindFlags::LOCAL
        } else {
            BindFlags::empty()
        };
        AddressSpace::new(
            VmKind::Ppgtt,
            PPGTT_SIZE,
            self.memory.clone(),
            self.unbound_wq.clone(),
            self.rpm.clone(),
            bind_async,
            false,
            None,
        )
    }

    // ===========================================================================================
    // Requests and idleness
    // ===========================================================================================

    /// Counts `fence` towards the GT being busy until it signals.
    pub fn track_request(&self, fence: Arc<Fence>) {
        let mut requests = lock(&self.requests);
        requests.retain(|f| !f.is_signaled());
        requests.push(fence);
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        lock(&self.requests).iter().all(|f| f.is_signaled())
    }

    /// Waits for every tracked request and queued job, then parks.
    pub fn wait_for_idle(&self, ctx: &WaitCtx) -> VmaResult<()> {
        let requests = lock(&self.requests).clone();
        wait_all(&requests, ctx)?;
        for engine in &self.engines {
            engine.flush_barriers();
        }
        self.unbound_wq.flush();
        self.highpri_wq.flush();
        lock(&self.requests).retain(|f| !f.is_signaled());
        self.park();
        Ok(())
    }

    /// Retires idle work so that contexts let go of their entries.
    pub fn flush_idle_contexts(&self, ctx: &WaitCtx) -> VmaResult<()> {
        self.wait_for_idle(ctx)
    }

    /// Reaps closed entries whose object is not locked elsewhere; the rest
    /// stay queued for the next idle point.
    pub fn park(&self) {
        let closed = std::mem::take(&mut *lock(&self.closed));
        if closed.is_empty() {
            return;
        }
        let requeue = Vma::parked(closed);
        lock(&self.closed).extend(requeue);
    }

    pub(crate) fn add_closed(&self, vma: Arc<Vma>) {
        lock(&self.closed).push(vma);
    }

    pub(crate) fn remove_closed(&self, vma: &Vma) {
        let ptr: *const Vma = vma;
        lock(&self.closed).retain(|v| !std::ptr::eq(Arc::as_ptr(v), ptr));
    }

    #[must_use]
    pub fn closed_count(&self) -> usize {
        lock(&self.closed).len()
    }

    // ===========================================================================================
    // Device state
    // ===========================================================================================

    /// Marks the GPU unusable; accelerated operations fail from now on.
    pub fn set_wedged(&self) {
        log::warn!("gt wedged");
        self.wedged.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_wedged(&self) -> bool {
        self.wedged.load(Ordering::Acquire)
    }

    /// Makes CPU writes through the aperture visible to the GPU.
    pub fn flush_ggtt_writes(&self) {
        self.ggtt_flushes.fetch_add(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn ggtt_flush_count(&self) -> u64 {
        self.ggtt_flushes.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ggtt_bounds_are_validated() {
        let too_big = DeviceConfig::new().ggtt(8 << 30, 64 << 20);
        assert!(Gt::new(too_big).is_err());
        let bad_aperture = DeviceConfig::new().ggtt(16 << 20, 32 << 20);
        assert!(Gt::new(bad_aperture).is_err());
        let unaligned = DeviceConfig::new().ggtt(16 << 20, (8 << 20) + 1);
        assert!(Gt::new(unaligned).is_err());
    }

    #[test]
    fn bring_up_wires_ggtt_and_engines() {
        let gt = Gt::new(DeviceConfig::new().ggtt(16 << 20, 8 << 20).local_memory(8 << 20)).unwrap();
        assert!(gt.ggtt().is_ggtt());
        assert_eq!(gt.ggtt().mappable_end(), 8 << 20);
        assert_eq!(gt.alias().map(|a| a.kind()), Some(VmKind::AliasingPpgtt));
        assert!(gt.migrate().is_some());
        assert_eq!(gt.fence_regs().count(), 16);

        let ppgtt = gt.create_ppgtt();
        assert_eq!(ppgtt.total(), PPGTT_SIZE);
        assert_ne!(ppgtt.id(), gt.ggtt().id());
    }

    #[test]
    fn idle_waits_for_tracked_requests() {
        let gt = Gt::new(DeviceConfig::new().ggtt(16 << 20, 8 << 20).local_memory(0)).unwrap();
        let fence = gt.engines()[0].create_request().submit_nop();
        gt.track_request(fence.clone());
        gt.wait_for_idle(&WaitCtx::uninterruptible()).unwrap();
        assert!(fence.is_signaled());
        assert!(gt.is_idle());
    }
}
