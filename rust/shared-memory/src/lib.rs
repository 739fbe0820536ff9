//! Parameter Exchange - Shared Memory Module
//!
//! POSIX shared regions, named semaphores and the slot views a training
//! process uses to trade parameters and gradients with a peer process.

pub mod error;
pub mod platform;
pub mod region;
pub mod semaphore;
pub mod slot;
pub mod wait;

pub use error::*;
pub use platform::*;
pub use region::*;
pub use semaphore::*;
pub use slot::*;
pub use wait::*;
