//! In-process stand-in for the peer process
//!
//! Runs the peer half of the handshake on a thread over anonymous regions:
//! applies each batch of gradients to the current parameters, writes the
//! result to the next slot and advances the active index modulo the slot
//! count. Used by `--loopback` runs and the channel tests.

use crate::channel::{ExchangeChannel, ExchangeLayout, SyncPair};
use crate::{ExchangeError, Result};
use param_exchange_shm::{ActiveSlotIndex, ParameterSlot, SharedMemoryError, SharedRegion, SlotSet, SLOT_HEADER_SIZE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// How often the peer thread rechecks its stop flag while waiting
const PEER_POLL: Duration = Duration::from_millis(50);

/// Loopback run parameters
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Initial parameters, also fixes the array length
    pub initial: Vec<f32>,
    /// Number of parameter slots
    pub slot_count: usize,
    /// Step size the peer applies to each gradient
    pub learning_rate: f32,
    /// Stop after this many cycles; `None` runs until stopped
    pub max_cycles: Option<u64>,
    /// Local acquire timeout
    pub acquire_timeout: Option<Duration>,
}

/// Handle to the peer thread
#[derive(Debug)]
pub struct LoopbackPeer {
    handle: JoinHandle<Result<u64>>,
    stop: Arc<AtomicBool>,
}

impl LoopbackPeer {
    /// Ask the thread to exit at its next wait
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the thread; returns the cycles it served
    pub fn join(self) -> Result<u64> {
        self.handle
            .join()
            .map_err(|_| ExchangeError::Peer("loopback peer panicked".to_string()))?
    }
}

/// Build a channel wired to a loopback peer thread
pub fn spawn(options: LoopbackOptions) -> Result<(ExchangeChannel, LoopbackPeer)> {
    let param_count = options.initial.len();
    let array_bytes = param_count * std::mem::size_of::<f32>();

    // Gradients end exactly where the trailing index padding begins
    let control = Arc::new(SharedRegion::anonymous(2 * array_bytes + 16)?);
    let layout = ExchangeLayout::for_control_region(control.size());
    let buffers = (0..options.slot_count)
        .map(|_| SharedRegion::anonymous(SLOT_HEADER_SIZE + array_bytes).map(Arc::new))
        .collect::<std::result::Result<Vec<_>, SharedMemoryError>>()?;

    let parameters = SlotSet::across_regions(&buffers, layout.parameter_offset, param_count, 4)?;
    let gradients = ParameterSlot::bind(&control, layout.gradient_offset, param_count, 4)?;
    let active = ActiveSlotIndex::bind(&control, layout.index_offset)?;
    let (local_sync, peer_sync) = SyncPair::loopback();

    let stop = Arc::new(AtomicBool::new(false));
    let peer_state = PeerState {
        parameters: parameters.clone(),
        gradients: gradients.clone(),
        active: active.clone(),
        sync: peer_sync,
        learning_rate: options.learning_rate,
        max_cycles: options.max_cycles,
        stop: Arc::clone(&stop),
    };
    let initial = options.initial;
    let handle = std::thread::Builder::new()
        .name("loopback-peer".to_string())
        .spawn(move || peer_state.serve(&initial))?;

    let channel = ExchangeChannel::new(parameters, gradients, active, local_sync, options.acquire_timeout);
    Ok((channel, LoopbackPeer { handle, stop }))
}

struct PeerState {
    parameters: SlotSet,
    gradients: ParameterSlot,
    active: ActiveSlotIndex,
    sync: SyncPair,
    learning_rate: f32,
    max_cycles: Option<u64>,
    stop: Arc<AtomicBool>,
}

impl PeerState {
    fn serve(mut self, initial: &[f32]) -> Result<u64> {
        let mut current = 0usize;
        self.parameters.slot(current)?.write(initial)?;
        self.active.store(current as i32)?;
        self.sync.signal()?;

        let mut cycles = 0u64;
        while self.max_cycles.map_or(true, |max| cycles < max) {
            match self.sync.begin_cycle(Some(PEER_POLL)) {
                Ok(()) => {}
                Err(ExchangeError::Channel(SharedMemoryError::Timeout(_))) => {
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    continue;
                }
                Err(err) => return Err(err),
            }

            let grads = self.gradients.to_vec::<f32>()?;
            let params = self.parameters.slot(current)?.to_vec::<f32>()?;
            let next = (current + 1) % self.parameters.len();
            let updated: Vec<f32> = params
                .iter()
                .zip(&grads)
                .map(|(p, g)| p - self.learning_rate * g)
                .collect();

            self.parameters.slot(next)?.write(&updated)?;
            self.active.store(next as i32)?;
            current = next;
            self.sync.complete_cycle()?;
            cycles += 1;
            debug!("loopback peer cycle {} -> slot {}", cycles, next);
        }

        info!("Loopback peer served {} cycles", cycles);
        Ok(cycles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_applies_gradients() {
        let (mut channel, peer) = spawn(LoopbackOptions {
            initial: vec![1.0, 2.0],
            slot_count: 2,
            learning_rate: 0.5,
            max_cycles: Some(2),
            acquire_timeout: Some(Duration::from_secs(5)),
        })
        .unwrap();

        let first = channel.exchange_cycle(&[2.0f32, 2.0]).unwrap();
        assert_eq!(first.slot_index, 0);
        assert_eq!(first.parameters, vec![1.0, 2.0]);

        let second = channel.exchange_cycle(&[0.0f32, 0.0]).unwrap();
        assert_eq!(second.slot_index, 1);
        assert_eq!(second.parameters, vec![0.0, 1.0]);

        assert_eq!(peer.join().unwrap(), 2);
    }

    #[test]
    fn test_stop_flag_ends_idle_peer() {
        let (_channel, peer) = spawn(LoopbackOptions {
            initial: vec![0.0; 4],
            slot_count: 3,
            learning_rate: 0.1,
            max_cycles: None,
            acquire_timeout: None,
        })
        .unwrap();
        peer.stop();
        assert_eq!(peer.join().unwrap(), 0);
    }
}
