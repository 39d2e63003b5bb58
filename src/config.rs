//! Device configuration.
//!
//! Everything that the driver would probe from hardware is handed in here
//! instead, so tests can build small, deterministic devices.

/// Failure injection for the migration engine.
///
/// With `fail_gpu_migration` the blit scheduled is always a clear rather than
/// a copy, and the completion is treated as failed so the CPU fallback runs.
/// With `fail_work_allocation` the deferred CPU copy item is never allocated,
/// so the blit is waited on synchronously and the copy runs inline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureModes {
    pub fail_gpu_migration: bool,
    pub fail_work_allocation: bool,
}

impl FailureModes {
    #[must_use]
    pub const fn new(fail_gpu_migration: bool, fail_work_allocation: bool) -> Self {
        Self {
            fail_gpu_migration,
            fail_work_allocation,
        }
    }

    #[must_use]
    pub const fn any(self) -> bool {
        self.fail_gpu_migration || self.fail_work_allocation
    }
}

#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    pub has_llc: bool,
    pub has_snoop: bool,
    /// Whether GGTT placement must keep differently cached neighbours apart.
    pub cache_coloring: bool,
    /// Whether a GPU migration context is available for accelerated moves.
    pub migrate_engine: bool,
    /// Whether address spaces may run binds on a worker after their
    /// dependencies, instead of on the pinning thread.
    pub async_binds: bool,
    pub ggtt_size: u64,
    pub mappable_end: u64,
    pub num_fence_regs: usize,
    pub system_size: u64,
    pub local_size: u64,
    pub bind_workers: usize,
    pub failure_modes: FailureModes,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceConfig {
    const DEFAULT_GGTT_SIZE: u64 = 256 << 20;
    const DEFAULT_MAPPABLE_END: u64 = 64 << 20;
    const DEFAULT_SYSTEM_SIZE: u64 = 1 << 30;
    const DEFAULT_LOCAL_SIZE: u64 = 512 << 20;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            has_llc: true,
            has_snoop: false,
            cache_coloring: false,
            migrate_engine: true,
            async_binds: true,
            ggtt_size: Self::DEFAULT_GGTT_SIZE,
            mappable_end: Self::DEFAULT_MAPPABLE_END,
            num_fence_regs: 16,
            system_size: Self::DEFAULT_SYSTEM_SIZE,
            local_size: Self::DEFAULT_LOCAL_SIZE,
            bind_workers: 2,
            failure_modes: FailureModes::new(false, false),
        }
    }

    #[must_use]
    pub const fn llc(mut self, has_llc: bool) -> Self {
        self.has_llc = has_llc;
        self
    }

    #[must_use]
    pub const fn snoop(mut self, has_snoop: bool) -> Self {
        self.has_snoop = has_snoop;
        self
    }

    #[must_use]
    pub const fn cache_coloring(mut self) -> Self {
        self.cache_coloring = true;
        self
    }

    #[must_use]
    pub const fn without_migrate_engine(mut self) -> Self {
        self.migrate_engine = false;
        self
    }

    #[must_use]
    pub const fn sync_binds(mut self) -> Self {
        self.async_binds = false;
        self
    }

    #[must_use]
    pub const fn ggtt(mut self, size: u64, mappable_end: u64) -> Self {
        self.ggtt_size = size;
        self.mappable_end = mappable_end;
        self
    }

    #[must_use]
    pub const fn fence_regs(mut self, count: usize) -> Self {
        self.num_fence_regs = count;
        self
    }

    #[must_use]
    pub const fn system_memory(mut self, size: u64) -> Self {
        self.system_size = size;
        self
    }

    #[must_use]
    pub const fn local_memory(mut self, size: u64) -> Self {
        self.local_size = size;
        self
    }

    #[must_use]
    pub const fn bind_workers(mut self, count: usize) -> Self {
        self.bind_workers = count;
        self
    }

    #[must_use]
    pub const fn failure_modes(mut self, modes: FailureModes) -> Self {
        self.failure_modes = modes;
        self
    }

    #[must_use]
    pub const fn has_local_memory(&self) -> bool {
        self.local_size > 0
    }
}
