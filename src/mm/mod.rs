//! Physical memory: tiers, their backing bytes and page lists.

pub mod range;
pub mod region;
pub mod sgt;

pub use range::{InsertMode, Node, RangeAllocator};
pub use region::{Block, Memory, MemoryRegion, RegionId, RegionKind};
pub use sgt::{PageSizes, SgEntry, SgTable};
