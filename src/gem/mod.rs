//! Buffer objects and moving their contents between memory regions.

pub mod memcpy;
pub mod migrate;
pub mod object;

pub use memcpy::{ArmOutcome, MemcpyArg, MemcpyState, MemcpyWork};
pub use migrate::{MoveDesc, copy_object, move_pages};
pub use object::{
    Caching, Domains, GemObject, Lru, Madvise, MemFlags, ObjectFlags, ObjectKind, ObjectParams, Tiling, UnbindFlags,
};
