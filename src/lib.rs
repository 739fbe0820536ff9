//! Parameter exchange worker
//!
//! Command line surface and run helpers around the exchange channel. The
//! channel itself lives in `param-exchange-core`, the shared memory
//! primitives in `param-exchange-shm`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use param_exchange_core::{
    DecayGradients, ExchangeChannel, ExchangeError, PeerCommand, PeerProcess, RunConfig, RunSummary, SyncPair, Trainer,
};
use param_exchange_shm::{ActiveSlotIndex, NamedSemaphore, Semaphore, SharedRegion, WaitOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use param_exchange_core as exchange;
pub use param_exchange_shm as shm;

/// Parameter exchange worker
#[derive(Parser, Debug, PartialEq)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,

    /// Log level (trace, debug, info, warn, error) or a full filter
    #[clap(short, long, default_value = "info")]
    pub log_level: String,

    /// Debug logging (same as --log-level=debug)
    #[clap(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Launch the peer and train against it
    Run {
        /// Run configuration (key/value text or .toml)
        #[clap(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Peer program, overrides `derecho_path`
        #[clap(long, value_name = "PROGRAM")]
        peer: Option<PathBuf>,

        /// Attach to a peer started separately
        #[clap(long, conflicts_with = "loopback")]
        no_peer: bool,

        /// Train against an in-process peer stub
        #[clap(long)]
        loopback: bool,
    },

    /// Write per-process copies of a configuration
    Replicate {
        #[clap(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Directory receiving `process<i>/`
        #[clap(short, long, value_name = "DIR")]
        out: PathBuf,

        #[clap(short = 'n', long, default_value = "1")]
        count: usize,
    },

    /// Remove semaphores and regions left behind by a previous run
    Unlink {
        #[clap(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Attach to a region and print its size and active slot index
    Inspect {
        /// Region name
        #[clap(short, long)]
        region: String,

        /// Byte offset of the active slot index (default: size - 8)
        #[clap(long)]
        index_offset: Option<usize>,
    },
}

impl Cli {
    /// Filter handed to the subscriber
    pub fn log_filter(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.log_level
        }
    }
}

/// Load the run configuration and apply command line overrides
pub fn load_config(path: &PathBuf, peer: Option<&PathBuf>) -> Result<RunConfig> {
    let mut config =
        RunConfig::from_file(path).with_context(|| format!("failed to load configuration {}", path.display()))?;
    if let Some(peer) = peer {
        config.peer_path = Some(peer.clone());
    }
    Ok(config)
}

/// Every IPC name a run uses
pub fn ipc_names(config: &RunConfig) -> (Vec<String>, Vec<String>) {
    let semaphores = vec![config.local_sem_name.clone(), config.peer_sem_name.clone()];
    let mut regions = vec![config.model_shm_name.clone(), config.gradient_shm_name.clone()];
    regions.extend(config.slot_region_names());
    (semaphores, regions)
}

/// Unlink leftovers of a previous run; returns the names that existed
pub fn remove_stale(config: &RunConfig) -> Result<Vec<String>> {
    let (semaphores, regions) = ipc_names(config);
    let mut removed = Vec::new();

    for name in semaphores {
        if NamedSemaphore::unlink(&name).with_context(|| format!("failed to unlink semaphore {}", name))? {
            removed.push(name);
        }
    }
    for name in regions {
        if SharedRegion::unlink(&name).with_context(|| format!("failed to unlink region {}", name))? {
            removed.push(name);
        }
    }

    if !removed.is_empty() {
        warn!("Removed stale IPC objects: {:?}", removed);
    }
    Ok(removed)
}

/// Fresh semaphores for a run, both at zero: `(peer_written, local_written)`
pub fn create_semaphores(config: &RunConfig) -> Result<(NamedSemaphore, NamedSemaphore)> {
    let local_written = NamedSemaphore::recreate(&config.local_sem_name, 0)
        .with_context(|| format!("failed to create semaphore {}", config.local_sem_name))?;
    let peer_written = NamedSemaphore::recreate(&config.peer_sem_name, 0)
        .with_context(|| format!("failed to create semaphore {}", config.peer_sem_name))?;
    info!(
        "Semaphores ready: {} (peer writes), {} (local writes)",
        config.peer_sem_name, config.local_sem_name
    );
    Ok((peer_written, local_written))
}

/// Step size of the smoke-test gradient source
pub const DECAY_RATE: f32 = 0.01;

/// How long training may still finish after the peer has exited
const PEER_EXIT_GRACE: Duration = Duration::from_millis(500);

/// Semaphores for a worker run: `(peer_written, local_written)`.
///
/// A worker that launches the peer owns the run and starts from a clean
/// slate. Otherwise the peer may already be up, so existing semaphores are
/// opened as they are and nothing is unlinked.
pub fn prepare_semaphores(config: &RunConfig, launch_peer: bool) -> Result<(NamedSemaphore, NamedSemaphore)> {
    if launch_peer {
        remove_stale(config)?;
        return create_semaphores(config);
    }

    let open = |name: &str| -> Result<NamedSemaphore> {
        let provisioned =
            NamedSemaphore::create_or_open(name, 0).with_context(|| format!("failed to open semaphore {}", name))?;
        if !provisioned.was_created() {
            info!("Using semaphore {} created by the peer", name);
        }
        Ok(provisioned.into_inner())
    };
    let local_written = open(&config.local_sem_name)?;
    let peer_written = open(&config.peer_sem_name)?;
    Ok((peer_written, local_written))
}

/// Train against the peer: launch it (or wait for one started separately),
/// attach to its regions and run the configured epochs.
///
/// A launched peer that exits before training is done fails the run with
/// `ExchangeError::PeerExited`.
pub async fn run_worker(config: RunConfig, launch_peer: bool, stop: Arc<AtomicBool>) -> Result<RunSummary> {
    let (peer_written, local_written) = prepare_semaphores(&config, launch_peer)?;

    let mut peer = None;
    let mut announced = Vec::new();
    if launch_peer {
        let command = PeerCommand::from_config(&config)?;
        let mut process = PeerProcess::launch(&command)?;
        if let Some(expected) = config.readiness_offsets {
            let readiness = process
                .await_readiness(expected, Duration::from_millis(config.readiness_timeout_ms))
                .await
                .context("peer did not become ready")?;
            if readiness.node_id != i64::from(config.local_id) {
                warn!(
                    "Peer reports node id {} but the configuration says {}",
                    readiness.node_id, config.local_id
                );
            }
            announced = readiness.offsets;
        }
        process.forward_output();
        peer = Some(process);
    } else {
        info!("Waiting for an externally started peer");
    }

    let exchange_config = config.exchange_config(announced)?;
    let sync = SyncPair::new(peer_written, local_written);
    let (epochs, steps) = (config.num_epochs, config.steps_per_epoch);
    let flag = Arc::clone(&stop);
    let mut training = tokio::task::spawn_blocking(move || -> Result<RunSummary> {
        let channel = ExchangeChannel::connect(&exchange_config, sync).context("failed to attach to the peer")?;
        let mut trainer = Trainer::new(channel, DecayGradients { rate: DECAY_RATE }).with_stop_flag(flag);
        Ok(trainer.run(epochs, steps)?)
    });

    let Some(mut process) = peer else {
        return training.await.context("training thread failed")?;
    };

    tokio::select! {
        joined = &mut training => {
            let outcome = joined.context("training thread failed")?;
            match &outcome {
                Ok(summary) if !summary.stopped => {
                    let status = process.wait().await?;
                    if !status.success() {
                        bail!("peer exited with {}", status);
                    }
                }
                _ => process.terminate().await?,
            }
            outcome
        }
        status = process.wait() => {
            let status = status?;
            // A peer may exit right after its final publish
            match tokio::time::timeout(PEER_EXIT_GRACE, &mut training).await {
                Ok(Ok(Ok(summary))) if status.success() && !summary.stopped => return Ok(summary),
                Ok(_) => {}
                Err(_) => {
                    warn!("Peer exited with {} while training was still running", status);
                    stop.store(true, Ordering::SeqCst);
                    wake_trainer(&config.peer_sem_name);
                    if tokio::time::timeout(PEER_EXIT_GRACE, &mut training).await.is_err() {
                        warn!("Training thread did not stop, leaving it behind");
                    }
                }
            }
            Err(ExchangeError::PeerExited(status.code()).into())
        }
    }
}

/// Release `peer_written` on the peer's behalf so a trainer blocked in
/// acquire returns and sees its stop flag
fn wake_trainer(peer_sem_name: &str) {
    let released = NamedSemaphore::create_or_open(peer_sem_name, 0).and_then(|sem| sem.into_inner().release());
    if let Err(err) = released {
        warn!("Could not wake the training thread: {}", err);
    }
}

/// Size and active index of a region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionReport {
    pub name: String,
    pub size: usize,
    pub index_offset: usize,
    pub active_index: i32,
}

/// Attach to `name` and read its active slot index
pub fn inspect_region(name: &str, index_offset: Option<usize>, wait: &WaitOptions) -> Result<RegionReport> {
    let region = Arc::new(SharedRegion::attach(name, 1, wait).with_context(|| format!("failed to attach {}", name))?);
    let index_offset = index_offset.unwrap_or_else(|| region.size().saturating_sub(8));
    let index = ActiveSlotIndex::bind(&region, index_offset)?;

    Ok(RegionReport {
        name: name.to_string(),
        size: region.size(),
        index_offset,
        active_index: index.load()?,
    })
}

/// Attach policy for one-shot commands
pub fn inspect_wait() -> WaitOptions {
    WaitOptions::fixed(Duration::from_secs(1), Duration::from_millis(50))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["param-exchange", "run", "--config", "derecho.cfg"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Run {
                config: PathBuf::from("derecho.cfg"),
                peer: None,
                no_peer: false,
                loopback: false,
            }
        );
        assert_eq!(cli.log_filter(), "info");

        let cli = Cli::try_parse_from(["param-exchange", "-v", "run", "-c", "x.toml", "--loopback"]).unwrap();
        assert_eq!(cli.log_filter(), "debug");
        assert!(matches!(cli.command, Command::Run { loopback: true, .. }));
    }

    #[test]
    fn test_no_peer_conflicts_with_loopback() {
        let err = Cli::try_parse_from(["param-exchange", "run", "-c", "x", "--no-peer", "--loopback"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_replicate_and_inspect_commands() {
        let cli = Cli::try_parse_from(["param-exchange", "replicate", "-c", "derecho.cfg", "-o", "out", "-n", "3"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Replicate {
                config: PathBuf::from("derecho.cfg"),
                out: PathBuf::from("out"),
                count: 3,
            }
        );

        let cli = Cli::try_parse_from(["param-exchange", "inspect", "--region", "model_shm", "--index-offset", "1016"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Inspect {
                region: "model_shm".to_string(),
                index_offset: Some(1016),
            }
        );
    }

    #[test]
    fn test_ipc_names() {
        let config = RunConfig::default();
        let (semaphores, regions) = ipc_names(&config);
        assert_eq!(semaphores, vec!["/python_sem", "/cpp_sem"]);
        assert_eq!(
            regions,
            vec!["model_shm", "gradient_shm", "model_shm_BUF_0", "model_shm_BUF_1", "model_shm_BUF_2"]
        );
    }

    #[test]
    fn test_load_config_with_peer_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("derecho.cfg");
        std::fs::write(&path, "derecho_path = ./async_sgd\n").unwrap();

        let config = load_config(&path, None).unwrap();
        assert_eq!(config.peer_path, Some(PathBuf::from("./async_sgd")));
        let config = load_config(&path, Some(&PathBuf::from("/bin/peer"))).unwrap();
        assert_eq!(config.peer_path, Some(PathBuf::from("/bin/peer")));
    }

    const PARAMS: usize = 4;

    fn named_config(prefix: &str) -> RunConfig {
        let base = shm::PlatformUtils::generate_region_name(prefix);
        let mut config = RunConfig::default();
        config.local_sem_name = format!("/{}_l", base);
        config.peer_sem_name = format!("/{}_p", base);
        config.model_shm_name = base.clone();
        config.gradient_shm_name = format!("{}_g", base);
        config.num_in_features = PARAMS;
        config.num_out_features = 1;
        config.num_epochs = 1;
        config.steps_per_epoch = 1;
        config.attach_timeout_ms = 2_000;
        config.poll_interval_ms = 20;
        config
    }

    #[test]
    fn test_remove_stale_and_inspect() {
        let config = named_config("pe_cli");

        let mut region = SharedRegion::create(&config.model_shm_name, 64).unwrap();
        region.persist();
        region.write_i32(56, 2).unwrap();

        let report = inspect_region(&config.model_shm_name, None, &inspect_wait()).unwrap();
        assert_eq!(report.size, 64);
        assert_eq!(report.index_offset, 56);
        assert_eq!(report.active_index, 2);

        let removed = remove_stale(&config).unwrap();
        assert_eq!(removed, vec![config.model_shm_name.clone()]);
        assert!(remove_stale(&config).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_peer_run_keeps_the_peers_objects() -> Result<(), Box<dyn std::error::Error>> {
        let config = named_config("pe_np");
        let bytes = PARAMS * 4;
        let control_size = 2 * bytes + 16;

        // The peer is already up with slot 0 published
        let control = SharedRegion::create(&config.model_shm_name, control_size)?;
        let buffers = config
            .slot_region_names()
            .iter()
            .map(|name| SharedRegion::create(name, shm::SLOT_HEADER_SIZE + bytes))
            .collect::<shm::Result<Vec<_>>>()?;
        let local_written = NamedSemaphore::create(&config.local_sem_name, 0)?;
        let peer_written = NamedSemaphore::create(&config.peer_sem_name, 0)?;

        let params = [1.0f32, 2.0, 3.0, 4.0];
        let raw: Vec<u8> = params.iter().flat_map(|v| v.to_ne_bytes()).collect();
        buffers[0].write_bytes(shm::SLOT_HEADER_SIZE, &raw)?;
        control.write_i32(control_size - 8, 0)?;
        peer_written.release()?;

        let summary = run_worker(config.clone(), false, Arc::new(AtomicBool::new(false))).await?;
        assert_eq!(summary.cycles, 1);
        assert_eq!(summary.slot_visits, vec![1, 0, 0]);
        assert!(!summary.stopped);

        // Gradients were handed back through the peer's own objects
        assert!(local_written.try_acquire()?);
        let mut raw = vec![0u8; bytes];
        control.read_bytes(control_size / 2, &mut raw)?;
        let grads: Vec<f32> = raw
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let expected: Vec<f32> = params.iter().map(|p| p * DECAY_RATE).collect();
        assert_eq!(grads, expected);

        let wait = inspect_wait();
        assert_eq!(inspect_region(&config.model_shm_name, None, &wait)?.size, control_size);
        for name in config.slot_region_names() {
            SharedRegion::attach(&name, shm::SLOT_HEADER_SIZE + bytes, &wait)?;
        }
        Ok(())
    }

    #[test]
    fn test_prepare_semaphores_without_peer_opens_existing() -> Result<(), Box<dyn std::error::Error>> {
        let config = named_config("pe_sem");
        let peer_written = NamedSemaphore::create(&config.peer_sem_name, 0)?;
        peer_written.release()?;

        let (opened, local_written) = prepare_semaphores(&config, false)?;
        // The pending release survived, so the semaphore was not recreated
        assert!(opened.try_acquire()?);
        assert!(!local_written.try_acquire()?);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_peer_exit_mid_run_fails_instead_of_hanging() -> Result<(), Box<dyn std::error::Error>> {
        use std::os::unix::fs::PermissionsExt;

        let mut config = named_config("pe_exit");
        config.steps_per_epoch = 10;
        config.acquire_timeout_ms = Some(30_000);

        // Sets up the regions, then exits without ever publishing
        let dir = tempfile::tempdir()?;
        let script = dir.path().join("peer.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\ntruncate -s {control} /dev/shm/{base}\nfor i in 0 1 2; do truncate -s {slot} /dev/shm/{base}_BUF_$i; done\necho regions ready\nexit 0\n",
                control = 2 * PARAMS * 4 + 16,
                slot = shm::SLOT_HEADER_SIZE + PARAMS * 4,
                base = config.model_shm_name,
            ),
        )?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;
        config.peer_path = Some(script);

        let started = std::time::Instant::now();
        let err = run_worker(config.clone(), true, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap_err();
        assert!(
            matches!(err.downcast_ref::<ExchangeError>(), Some(ExchangeError::PeerExited(Some(0)))),
            "{:?}",
            err
        );
        assert!(started.elapsed() < Duration::from_secs(10));

        remove_stale(&config)?;
        Ok(())
    }
}
