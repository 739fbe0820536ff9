//! Training loop driver
//!
//! Runs one exchange cycle per training step. The gradient computation
//! itself is supplied by a `GradientSource`.

use crate::channel::ExchangeChannel;
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// Maps the latest parameters to local gradients
pub trait GradientSource: Send {
    /// Fill `gradients` (same length as `parameters`); returns the step loss
    fn compute(&mut self, parameters: &[f32], gradients: &mut [f32]) -> f32;
}

impl<F> GradientSource for F
where
    F: FnMut(&[f32], &mut [f32]) -> f32 + Send,
{
    fn compute(&mut self, parameters: &[f32], gradients: &mut [f32]) -> f32 {
        self(parameters, gradients)
    }
}

/// Gradient of `rate / 2 * |p|^2`: pulls every parameter towards zero.
/// Loss is the mean squared parameter.
#[derive(Debug, Clone, Copy)]
pub struct DecayGradients {
    pub rate: f32,
}

impl GradientSource for DecayGradients {
    fn compute(&mut self, parameters: &[f32], gradients: &mut [f32]) -> f32 {
        for (g, p) in gradients.iter_mut().zip(parameters) {
            *g = p * self.rate;
        }
        if parameters.is_empty() {
            return 0.0;
        }
        parameters.iter().map(|p| p * p).sum::<f32>() / parameters.len() as f32
    }
}

/// Outcome of a training run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Exchange cycles completed
    pub cycles: u64,
    /// Epochs run to completion
    pub epochs: u32,
    /// How often each parameter slot was read
    pub slot_visits: Vec<u64>,
    /// Loss of the last step, if any ran
    pub last_loss: Option<f32>,
    /// Whether the stop flag ended the run early
    pub stopped: bool,
}

/// Drives `GradientSource` steps through an `ExchangeChannel`
pub struct Trainer<S> {
    channel: ExchangeChannel,
    source: S,
    stop: Arc<AtomicBool>,
    log_interval: u64,
}

impl<S: GradientSource> Trainer<S> {
    pub fn new(channel: ExchangeChannel, source: S) -> Self {
        Self {
            channel,
            source,
            stop: Arc::new(AtomicBool::new(false)),
            log_interval: 20,
        }
    }

    /// Share an externally owned stop flag (set from a signal handler)
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Log every `interval` steps of an epoch
    pub fn with_log_interval(mut self, interval: u64) -> Self {
        self.log_interval = interval.max(1);
        self
    }

    /// Flag that stops the run between cycles
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn channel(&self) -> &ExchangeChannel {
        &self.channel
    }

    /// Train for `epochs` × `steps_per_epoch` cycles
    #[instrument(skip(self))]
    pub fn run(&mut self, epochs: u32, steps_per_epoch: u64) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary {
            cycles: 0,
            epochs: 0,
            slot_visits: vec![0; self.channel.slot_count()],
            last_loss: None,
            stopped: false,
        };

        'epochs: for epoch in 1..=epochs {
            for step in 0..steps_per_epoch {
                if self.stop.load(Ordering::SeqCst) {
                    summary.stopped = true;
                    break 'epochs;
                }

                let source = &mut self.source;
                let mut loss = 0.0;
                let slot = self.channel.step::<f32>(|parameters, gradients| {
                    loss = source.compute(parameters, gradients);
                })?;

                summary.cycles += 1;
                summary.slot_visits[slot] += 1;
                summary.last_loss = Some(loss);

                if step % self.log_interval == 0 {
                    info!("epoch: {} step: {} slot: {} loss={:.6}", epoch, step, slot, loss);
                } else {
                    debug!("epoch {} step {} used slot {}", epoch, step, slot);
                }
            }
            summary.epochs = epoch;
        }

        info!(
            "Training finished after {} cycles in {:.2?} (slot visits {:?})",
            summary.cycles,
            started.elapsed(),
            summary.slot_visits
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{self, LoopbackOptions};
    use std::time::Duration;

    fn loopback_trainer(initial: Vec<f32>, slots: usize) -> (Trainer<DecayGradients>, loopback::LoopbackPeer) {
        let (channel, peer) = loopback::spawn(LoopbackOptions {
            initial,
            slot_count: slots,
            learning_rate: 0.5,
            max_cycles: None,
            acquire_timeout: Some(Duration::from_secs(5)),
        })
        .unwrap();
        (Trainer::new(channel, DecayGradients { rate: 1.0 }), peer)
    }

    #[test]
    fn test_decay_gradients() {
        let mut source = DecayGradients { rate: 0.5 };
        let mut grads = [0.0; 2];
        let loss = source.compute(&[2.0, -4.0], &mut grads);
        assert_eq!(grads, [1.0, -2.0]);
        assert_eq!(loss, 10.0);
        assert_eq!(source.compute(&[], &mut []), 0.0);
    }

    #[test]
    fn test_run_shrinks_parameters_and_visits_slots() {
        let (mut trainer, peer) = loopback_trainer(vec![8.0, -8.0], 3);
        let summary = trainer.run(2, 3).unwrap();

        assert_eq!(summary.cycles, 6);
        assert_eq!(summary.epochs, 2);
        assert_eq!(summary.slot_visits, vec![2, 2, 2]);
        assert!(!summary.stopped);
        // Each peer update halves the parameters: 8 -> 4 -> ... -> 0.25
        assert_eq!(summary.last_loss, Some(0.0625));

        peer.stop();
        assert_eq!(peer.join().unwrap(), 6);
    }

    #[test]
    fn test_stop_flag_ends_run() {
        let (trainer, peer) = loopback_trainer(vec![1.0], 2);
        let stop = Arc::new(AtomicBool::new(true));
        let mut trainer = trainer.with_stop_flag(Arc::clone(&stop));

        let summary = trainer.run(10, 10).unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.cycles, 0);
        assert_eq!(summary.epochs, 0);

        peer.stop();
        peer.join().unwrap();
    }

    #[test]
    fn test_closure_source() {
        let (channel, peer) = loopback::spawn(LoopbackOptions {
            initial: vec![1.0, 1.0],
            slot_count: 1,
            learning_rate: 1.0,
            max_cycles: Some(1),
            acquire_timeout: Some(Duration::from_secs(5)),
        })
        .unwrap();

        let mut trainer = Trainer::new(channel, |params: &[f32], grads: &mut [f32]| {
            grads.fill(0.25);
            params[0]
        });
        let summary = trainer.run(1, 1).unwrap();
        assert_eq!(summary.last_loss, Some(1.0));
        assert_eq!(peer.join().unwrap(), 1);
    }
}
