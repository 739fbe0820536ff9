//! Parameter Exchange - Core Module
//!
//! Semaphore-gated exchange of parameters and gradients between a training
//! process and a peer process over shared memory, plus the pieces a worker
//! run needs around it: configuration, peer launch and the training loop.

pub mod channel;
pub mod config;
pub mod error;
pub mod loopback;
pub mod peer;
pub mod trainer;

pub use channel::*;
pub use config::RunConfig;
pub use error::*;
pub use peer::{PeerCommand, PeerProcess, Readiness};
pub use trainer::{DecayGradients, GradientSource, RunSummary, Trainer};

/// Re-export common types
pub mod prelude {
    pub use crate::{
        channel::{ExchangeChannel, ExchangeConfig, SyncPair},
        config::RunConfig,
        error::{ExchangeError, Result},
        peer::{PeerCommand, PeerProcess},
        trainer::{GradientSource, Trainer},
    };
    pub use param_exchange_shm::{ActiveSlotIndex, NamedSemaphore, ParameterSlot, SharedRegion, SlotSet, WaitOptions};
}

/// Current version of the exchange crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
