//! GPU virtual memory: address spaces and the entries mapping objects into
//! them.

pub mod address_space;
pub mod bind;
pub mod evict;
pub mod flags;
pub mod iomap;
pub mod pin;
pub mod resource;
pub mod unbind;
pub mod view;
pub mod vma;

pub use address_space::{AddressSpace, LockClass, PtStash, Pte, VmGuard, VmId, VmKind, VmState};
pub use bind::VmaWork;
pub use evict::{evict_for_node, evict_something, evict_vm};
pub use flags::{BindFlags, CacheLevel, PIN_MASK, PinFlags, VmaFlags};
pub use iomap::{FenceRegs, FenceSetup, IoMap};
pub use resource::{GgttOps, PpgttOps, ResourceSlot, VmaOps, VmaResource};
pub use view::{GgttView, PlaneInfo, RemappedInfo, RotationInfo};
pub use vma::{ExecFlags, Vma, VmaKey, VmaRegistry};
