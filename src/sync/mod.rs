//! Completion signals and the primitives built on them.

pub mod active;
pub mod deps;
pub mod fence;
pub mod resv;
pub mod work;
pub mod ww;

pub use active::Active;
pub use deps::Deps;
pub use fence::{Fence, Interrupt, Timeline, WaitCtx, wait_all};
pub use resv::Reservation;
pub use work::{FenceWork, WorkQueue};
pub use ww::{WwCtx, WwGuard, WwMutex, ww_retry};
