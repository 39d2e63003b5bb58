//! GPU address-space management: mapping buffer objects into global and
//! per-context address spaces, and migrating their backing store between
//! system and device-local memory.

pub mod config;
pub mod error;
pub mod gem;
pub mod gt;
pub mod mm;
pub mod sync;
pub mod utils;
pub mod vm;

pub use config::{DeviceConfig, FailureModes};
pub use error::{VmaError, VmaResult};
