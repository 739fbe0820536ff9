//! Semaphore-gated parameter/gradient exchange with the peer process
//!
//! One cycle per training step:
//!
//! 1. the peer writes a parameter slot, stores its index and releases
//!    `peer_written`;
//! 2. the local side acquires `peer_written`, reads the active slot, writes
//!    its gradients and releases `local_written`;
//! 3. the peer acquires `local_written` and consumes the gradients.
//!
//! Nothing but the semaphores orders the two sides. Out-of-protocol access
//! to the shared region is a data race.

use crate::Result;
use bytemuck::Pod;
use param_exchange_shm::{
    ActiveSlotIndex, LocalSemaphore, ParameterSlot, PlatformUtils, Semaphore, SharedMemoryError, SharedRegion,
    SlotSet, WaitOptions, SLOT_HEADER_SIZE,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// The two semaphores of the handshake, seen from one side.
///
/// Tracks whether a cycle is open so that acquire/release pairing is
/// checked at runtime: acquiring twice or completing a cycle that was never
/// opened is a `ProtocolViolation`.
pub struct SyncPair {
    peer_written: Box<dyn Semaphore>,
    local_written: Box<dyn Semaphore>,
    cycle_open: bool,
    stats: HandshakeStats,
}

/// Counters kept by a `SyncPair`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeStats {
    /// Completed cycles
    pub cycles: u64,
    /// Releases outside a cycle (standalone publishes, seeding)
    pub unpaired_releases: u64,
    /// Cycles abandoned after a failure between acquire and release
    pub aborted: u64,
}

impl std::fmt::Debug for SyncPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPair")
            .field("peer_written", &self.peer_written.name())
            .field("local_written", &self.local_written.name())
            .field("cycle_open", &self.cycle_open)
            .field("stats", &self.stats)
            .finish()
    }
}

impl SyncPair {
    /// `peer_written` is waited on, `local_written` is released
    pub fn new(peer_written: impl Semaphore + 'static, local_written: impl Semaphore + 'static) -> Self {
        Self {
            peer_written: Box::new(peer_written),
            local_written: Box::new(local_written),
            cycle_open: false,
            stats: HandshakeStats::default(),
        }
    }

    /// In-process pair plus its mirror for a peer stub: what one side
    /// releases the other acquires.
    pub fn loopback() -> (SyncPair, SyncPair) {
        let peer_written = Arc::new(LocalSemaphore::new("loopback_peer_written", 0));
        let local_written = Arc::new(LocalSemaphore::new("loopback_local_written", 0));
        let local = SyncPair::new(Arc::clone(&peer_written), Arc::clone(&local_written));
        let peer = SyncPair::new(local_written, peer_written);
        (local, peer)
    }

    /// Block until the other side signals, opening a cycle
    pub fn begin_cycle(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.cycle_open {
            return Err(violation(format!(
                "acquire of {} while the previous cycle is still open",
                self.peer_written.name()
            )));
        }
        self.peer_written.acquire(timeout)?;
        self.cycle_open = true;
        Ok(())
    }

    /// Release the other side, closing the open cycle
    pub fn complete_cycle(&mut self) -> Result<()> {
        if !self.cycle_open {
            return Err(violation(format!(
                "release of {} without a matching acquire of {}",
                self.local_written.name(),
                self.peer_written.name()
            )));
        }
        self.local_written.release()?;
        self.cycle_open = false;
        self.stats.cycles += 1;
        Ok(())
    }

    /// Close an open cycle without releasing; the other side is not told
    /// that anything was written.
    pub fn abort_cycle(&mut self) {
        if self.cycle_open {
            warn!("Abandoning open cycle on {} without release", self.peer_written.name());
            self.cycle_open = false;
            self.stats.aborted += 1;
        }
    }

    /// Release `local_written`. Inside an open cycle this completes it;
    /// outside it is a standalone signal.
    pub fn signal(&mut self) -> Result<()> {
        if self.cycle_open {
            return self.complete_cycle();
        }
        self.local_written.release()?;
        self.stats.unpaired_releases += 1;
        debug!("Standalone release of {}", self.local_written.name());
        Ok(())
    }

    /// Whether a cycle is open
    pub fn is_cycle_open(&self) -> bool {
        self.cycle_open
    }

    /// Handshake counters
    pub fn stats(&self) -> HandshakeStats {
        self.stats
    }
}

fn oversized(param_count: usize) -> crate::ExchangeError {
    crate::ExchangeError::config(0, format!("{} parameters do not fit in memory", param_count))
}

fn violation(message: String) -> crate::ExchangeError {
    error!("Protocol violation: {}", message);
    SharedMemoryError::ProtocolViolation(message).into()
}

/// `bind_slot` as a free function: a bounds-checked view of the region
pub fn bind_slot(
    region: &Arc<SharedRegion>,
    byte_offset: usize,
    element_count: usize,
    element_width: usize,
) -> Result<ParameterSlot> {
    Ok(ParameterSlot::bind(region, byte_offset, element_count, element_width)?)
}

/// Write `values` into `slot`, then release `local_written`. No acquire is
/// needed: the peer gates its reads on the release.
pub fn publish<T: Pod>(slot: &ParameterSlot, values: &[T], sync: &mut SyncPair) -> Result<()> {
    slot.write(values)?;
    sync.signal()
}

/// The slot the peer currently selects, validated against the set
pub fn fetch_latest<'a>(slot_set: &'a SlotSet, active: &ActiveSlotIndex) -> Result<(usize, &'a ParameterSlot)> {
    match slot_set.active(active) {
        Ok(found) => Ok(found),
        Err(err) => {
            error!("Refusing to read parameters: {}", err);
            Err(err.into())
        }
    }
}

/// Parameters handed back by one exchange cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange<T> {
    /// Slot the parameters were read from
    pub slot_index: usize,
    /// Copy of the slot contents
    pub parameters: Vec<T>,
}

/// One full handshake: wait for the peer, copy the latest parameters, write
/// `local_gradients` into `gradient_slot`, release the peer.
///
/// The parameters are copied before the release. A failure after the
/// acquire abandons the cycle without releasing, so the peer never reads
/// gradients that were not written.
pub fn exchange_cycle<T: Pod>(
    local_gradients: &[T],
    slot_set: &SlotSet,
    gradient_slot: &ParameterSlot,
    active: &ActiveSlotIndex,
    sync: &mut SyncPair,
    timeout: Option<Duration>,
) -> Result<Exchange<T>> {
    sync.begin_cycle(timeout)?;

    let inner = || -> Result<Exchange<T>> {
        let (slot_index, slot) = fetch_latest(slot_set, active)?;
        let parameters = slot.to_vec::<T>()?;
        gradient_slot.write(local_gradients)?;
        Ok(Exchange { slot_index, parameters })
    };

    match inner() {
        Ok(exchange) => {
            sync.complete_cycle()?;
            Ok(exchange)
        }
        Err(err) => {
            sync.abort_cycle();
            Err(err)
        }
    }
}

/// Where the channel's pieces sit inside the peer's regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeLayout {
    /// Gradient slot offset inside the control region
    pub gradient_offset: usize,
    /// ActiveSlotIndex offset inside the control region
    pub index_offset: usize,
    /// Parameter offset inside each `<base>_BUF_<i>` region
    pub parameter_offset: usize,
}

impl ExchangeLayout {
    /// Default placement in a control region of `size` bytes: gradients in
    /// the second half, the index in the last 8 bytes (the peer pads the
    /// trailing i32), parameters after the per-buffer sequence number.
    pub fn for_control_region(size: usize) -> Self {
        Self {
            gradient_offset: size / 2,
            index_offset: size.saturating_sub(8),
            parameter_offset: SLOT_HEADER_SIZE,
        }
    }

    /// Apply offsets announced by the peer on startup: gradient offset
    /// first, then index offset.
    pub fn with_announced(mut self, offsets: &[u64]) -> Self {
        if let Some(gradient) = offsets.first() {
            self.gradient_offset = *gradient as usize;
        }
        if let Some(index) = offsets.get(1) {
            self.index_offset = *index as usize;
        }
        self
    }
}

/// Everything needed to attach to a running peer
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Control region holding gradients and the active index
    pub control_region: String,
    /// Base name of the parameter buffers (`<base>_BUF_<i>`)
    pub slot_base: String,
    /// Number of parameter buffers
    pub slot_count: usize,
    /// Elements per parameter/gradient array
    pub param_count: usize,
    /// Offsets announced by the peer, if any
    pub announced_offsets: Vec<u64>,
    /// Region attach policy
    pub wait: WaitOptions,
    /// Per-cycle acquire timeout; `None` blocks
    pub acquire_timeout: Option<Duration>,
}

/// A bound exchange channel: slots, index and sync pair
#[derive(Debug)]
pub struct ExchangeChannel {
    parameters: SlotSet,
    gradients: ParameterSlot,
    active: ActiveSlotIndex,
    sync: SyncPair,
    acquire_timeout: Option<Duration>,
}

impl ExchangeChannel {
    /// Assemble from already bound parts
    pub fn new(
        parameters: SlotSet,
        gradients: ParameterSlot,
        active: ActiveSlotIndex,
        sync: SyncPair,
        acquire_timeout: Option<Duration>,
    ) -> Self {
        Self {
            parameters,
            gradients,
            active,
            sync,
            acquire_timeout,
        }
    }

    /// Attach to the peer's regions and bind f32 slots per `config`
    #[instrument(skip(config, sync), fields(control = %config.control_region))]
    pub fn connect(config: &ExchangeConfig, sync: SyncPair) -> Result<Self> {
        let width = std::mem::size_of::<f32>();
        let array_bytes = config
            .param_count
            .checked_mul(width)
            .ok_or_else(|| oversized(config.param_count))?;

        let control = Arc::new(SharedRegion::attach(&config.control_region, 1, &config.wait)?);
        let layout = ExchangeLayout::for_control_region(control.size()).with_announced(&config.announced_offsets);
        debug!("Exchange layout {:?}", layout);

        let buffers = (0..config.slot_count)
            .map(|i| {
                let name = PlatformUtils::slot_region_name(&config.slot_base, i);
                let min_size = layout
                    .parameter_offset
                    .checked_add(array_bytes)
                    .ok_or_else(|| oversized(config.param_count))?;
                Ok(Arc::new(SharedRegion::attach(&name, min_size, &config.wait)?))
            })
            .collect::<Result<Vec<_>>>()?;

        let parameters = SlotSet::across_regions(&buffers, layout.parameter_offset, config.param_count, width)?;
        let gradients = ParameterSlot::bind(&control, layout.gradient_offset, config.param_count, width)?;
        let active = ActiveSlotIndex::bind(&control, layout.index_offset)?;

        Ok(Self::new(parameters, gradients, active, sync, config.acquire_timeout))
    }

    /// Write gradients and release the peer
    pub fn publish<T: Pod>(&mut self, values: &[T]) -> Result<()> {
        publish(&self.gradients, values, &mut self.sync)
    }

    /// Index and view of the slot the peer currently selects
    pub fn fetch_latest(&self) -> Result<(usize, &ParameterSlot)> {
        fetch_latest(&self.parameters, &self.active)
    }

    /// One handshake with precomputed gradients
    pub fn exchange_cycle<T: Pod>(&mut self, local_gradients: &[T]) -> Result<Exchange<T>> {
        exchange_cycle(
            local_gradients,
            &self.parameters,
            &self.gradients,
            &self.active,
            &mut self.sync,
            self.acquire_timeout,
        )
    }

    /// One handshake computing gradients inside it: `compute` receives the
    /// latest parameters and fills the gradient buffer. Returns the slot
    /// index that was read.
    pub fn step<T: Pod>(&mut self, compute: impl FnOnce(&[T], &mut [T])) -> Result<usize> {
        self.sync.begin_cycle(self.acquire_timeout)?;

        let inner = |parameters: &SlotSet, gradients: &ParameterSlot, active: &ActiveSlotIndex| -> Result<usize> {
            let (slot_index, slot) = fetch_latest(parameters, active)?;
            let latest = slot.to_vec::<T>()?;
            let mut grads = vec![T::zeroed(); gradients.byte_len() / std::mem::size_of::<T>().max(1)];
            compute(&latest, &mut grads);
            gradients.write(&grads)?;
            Ok(slot_index)
        };

        match inner(&self.parameters, &self.gradients, &self.active) {
            Ok(slot_index) => {
                self.sync.complete_cycle()?;
                Ok(slot_index)
            }
            Err(err) => {
                self.sync.abort_cycle();
                Err(err)
            }
        }
    }

    /// Number of parameter slots
    pub fn slot_count(&self) -> usize {
        self.parameters.len()
    }

    /// Elements per parameter array
    pub fn param_count(&self) -> usize {
        self.gradients.element_count()
    }

    /// Handshake counters
    pub fn stats(&self) -> HandshakeStats {
        self.sync.stats()
    }
}
