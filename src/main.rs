use anyhow::{bail, Context, Result};
use clap::Parser;
use param_exchange::exchange::loopback::{self, LoopbackOptions};
use param_exchange::exchange::{config, DecayGradients, PeerCommand, PeerProcess, RunConfig, RunSummary, Trainer};
use param_exchange::{
    inspect_region, inspect_wait, load_config, remove_stale, run_worker, Cli, Command, DECAY_RATE,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_env_filter(cli.log_filter()).init();

    match &cli.command {
        Command::Run {
            config,
            peer,
            no_peer,
            loopback,
        } => {
            let config = load_config(config, peer.as_ref())?;
            let stop = install_stop_handler()?;

            if *loopback {
                run_loopback(config, stop).await?;
            } else if config.is_leader() {
                run_leader(&config).await?;
            } else {
                report(&run_worker(config, !*no_peer, stop).await?);
            }
        }

        Command::Replicate { config: source, out, count } => {
            let written = config::write_replicas(source, out, *count)
                .with_context(|| format!("failed to replicate {}", source.display()))?;
            for path in written {
                println!("{}", path.display());
            }
        }

        Command::Unlink { config } => {
            let config = load_config(config, None)?;
            let removed = remove_stale(&config)?;
            if removed.is_empty() {
                println!("Nothing to remove");
            }
            for name in removed {
                println!("Removed {}", name);
            }
        }

        Command::Inspect { region, index_offset } => {
            let report = inspect_region(region, *index_offset, &inspect_wait())?;
            println!("region:       {}", report.name);
            println!("size:         {} bytes", report.size);
            println!("index offset: {}", report.index_offset);
            println!("active index: {}", report.active_index);
        }
    }

    Ok(())
}

/// First Ctrl-C stops training between cycles, a second one exits
fn install_stop_handler() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("Stopping after the current cycle (Ctrl-C again to exit)");
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(stop)
}

/// The leader runs the peer as parameter server and waits for it
async fn run_leader(config: &RunConfig) -> Result<()> {
    info!("Node {} is the leader, running the peer as parameter server", config.local_id);
    let command = PeerCommand::from_config(config)?;
    let mut peer = PeerProcess::launch(&command)?;
    let forward = peer.forward_output();

    let status = peer.wait().await?;
    if let Some(forward) = forward {
        let _ = forward.await;
    }
    if !status.success() {
        bail!("peer exited with {}", status);
    }
    Ok(())
}

async fn run_loopback(config: RunConfig, stop: Arc<AtomicBool>) -> Result<()> {
    let param_count = config.param_count()?.max(1);
    info!(
        "Loopback run: {} parameters, {} slots",
        param_count, config.slot_count
    );

    let options = LoopbackOptions {
        initial: vec![1.0; param_count],
        slot_count: config.slot_count,
        learning_rate: 0.1,
        max_cycles: None,
        acquire_timeout: config.acquire_timeout(),
    };
    let (epochs, steps) = (config.num_epochs, config.steps_per_epoch);

    let summary = tokio::task::spawn_blocking(move || -> Result<RunSummary> {
        let (channel, peer) = loopback::spawn(options)?;
        let mut trainer = Trainer::new(channel, DecayGradients { rate: DECAY_RATE }).with_stop_flag(stop);
        let summary = trainer.run(epochs, steps);
        peer.stop();
        let served = peer.join()?;
        info!("Loopback peer served {} cycles", served);
        Ok(summary?)
    })
    .await
    .context("training thread failed")??;

    report(&summary);
    Ok(())
}

fn report(summary: &RunSummary) {
    println!(
        "cycles: {} epochs: {} stopped: {}",
        summary.cycles, summary.epochs, summary.stopped
    );
    println!("slot visits: {:?}", summary.slot_visits);
    if let Some(loss) = summary.last_loss {
        println!("last loss: {:.6}", loss);
    }
}
