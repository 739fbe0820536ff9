//! Peer process management
//!
//! The peer is an external executable launched with
//! `<num_nodes> <num_params> <local_sem> <peer_sem> <control_region> <gradient_region>`.
//! Once it has set up its regions it may print its node id followed by the
//! offsets it chose, one integer per line, on stdout.

use crate::config::RunConfig;
use crate::{ExchangeError, Result};
use param_exchange_shm::SharedMemoryError;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Program and arguments of the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl PeerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The peer invocation for a run configuration
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let program = config
            .peer_path
            .clone()
            .ok_or_else(|| ExchangeError::MissingKey("derecho_path".to_string()))?;

        Ok(Self::new(program)
            .arg(config.num_nodes.to_string())
            .arg(config.param_count()?.to_string())
            .arg(config.local_sem_name.clone())
            .arg(config.peer_sem_name.clone())
            .arg(config.model_shm_name.clone())
            .arg(config.gradient_shm_name.clone()))
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// What the peer printed once it was ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub node_id: i64,
    /// Offsets in the order printed (gradient offset, then index offset)
    pub offsets: Vec<u64>,
}

/// A readiness line is a single integer; anything else is ordinary output
pub fn parse_readiness_line(line: &str) -> Option<i64> {
    line.trim().parse().ok()
}

/// A running peer process
#[derive(Debug)]
pub struct PeerProcess {
    child: Child,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    program: String,
}

impl PeerProcess {
    /// Spawn the peer with stdout captured. The child is killed if the
    /// handle is dropped while it still runs.
    pub fn launch(command: &PeerCommand) -> Result<Self> {
        let program = command.program.display().to_string();
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExchangeError::Peer(format!("failed to launch {}: {}", program, e)))?;

        let stdout = child.stdout.take().map(|out| BufReader::new(out).lines());
        info!("Launched peer {} (pid {:?}) with args {:?}", program, child.id(), command.args);

        Ok(Self { child, stdout, program })
    }

    /// OS process id, while running
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Read the node id and `offset_count` offsets from the peer's stdout.
    ///
    /// Lines that are not integers are logged and skipped. EOF before the
    /// handshake completes yields `PeerExited` with the exit code; running
    /// past `timeout` yields `ResourceUnavailable`.
    pub async fn await_readiness(&mut self, offset_count: usize, timeout: Duration) -> Result<Readiness> {
        let started = Instant::now();
        let program = self.program.clone();

        match tokio::time::timeout(timeout, self.read_readiness(offset_count)).await {
            Ok(result) => {
                let readiness = result?;
                info!(
                    "Peer {} ready as node {} with offsets {:?}",
                    program, readiness.node_id, readiness.offsets
                );
                Ok(readiness)
            }
            Err(_) => Err(SharedMemoryError::ResourceUnavailable {
                resource: format!("readiness of peer {}", program),
                waited_ms: started.elapsed().as_millis() as u64,
            }
            .into()),
        }
    }

    async fn read_readiness(&mut self, offset_count: usize) -> Result<Readiness> {
        let mut values = Vec::with_capacity(offset_count + 1);

        while values.len() < offset_count + 1 {
            let line = match self.stdout.as_mut() {
                Some(lines) => lines.next_line().await?,
                None => None,
            };
            let Some(line) = line else {
                let status = self.child.wait().await?;
                warn!("Peer {} closed its output during startup ({})", self.program, status);
                return Err(ExchangeError::PeerExited(status.code()));
            };

            match parse_readiness_line(&line) {
                Some(value) => values.push(value),
                None => debug!("peer: {}", line),
            }
        }

        let node_id = values[0];
        let offsets = values[1..]
            .iter()
            .map(|&v| {
                u64::try_from(v).map_err(|_| ExchangeError::Peer(format!("peer announced negative offset {}", v)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Readiness { node_id, offsets })
    }

    /// Relay the rest of the peer's stdout into the log
    pub fn forward_output(&mut self) -> Option<JoinHandle<()>> {
        let mut lines = self.stdout.take()?;
        let program = self.program.clone();
        Some(tokio::spawn(async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => info!(target: "peer", "{}: {}", program, line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Stopped reading output of {}: {}", program, e);
                        break;
                    }
                }
            }
        }))
    }

    /// Wait for the peer to exit
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        if status.success() {
            info!("Peer {} exited", self.program);
        } else {
            warn!("Peer {} exited with {}", self.program, status);
        }
        Ok(status)
    }

    /// Kill the peer and reap it
    pub async fn terminate(&mut self) -> Result<()> {
        if self.child.id().is_some() {
            info!("Terminating peer {}", self.program);
            self.child.kill().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> PeerCommand {
        PeerCommand::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn test_command_from_config() {
        let mut config = RunConfig::parse("num_in_features = 784\nnum_out_features = 10\nnum_nodes = 3").unwrap();
        assert!(matches!(
            PeerCommand::from_config(&config),
            Err(ExchangeError::MissingKey(_))
        ));

        config.peer_path = Some(PathBuf::from("/opt/peer"));
        let command = PeerCommand::from_config(&config).unwrap();
        assert_eq!(command.program(), &PathBuf::from("/opt/peer"));
        assert_eq!(
            command.args(),
            &["3", "7840", "/python_sem", "/cpp_sem", "model_shm", "gradient_shm"]
        );
    }

    #[test]
    fn test_parse_readiness_line() {
        assert_eq!(parse_readiness_line(" 3\n"), Some(3));
        assert_eq!(parse_readiness_line("-1"), Some(-1));
        assert_eq!(parse_readiness_line("Finished constructing group"), None);
        assert_eq!(parse_readiness_line(""), None);
    }

    #[tokio::test]
    async fn test_readiness_skips_chatter() {
        let mut peer = PeerProcess::launch(&shell("echo starting; echo 2; echo 'joined'; echo 512; echo 1016; sleep 1")).unwrap();
        let readiness = peer.await_readiness(2, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            readiness,
            Readiness {
                node_id: 2,
                offsets: vec![512, 1016]
            }
        );
        peer.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_before_ready() {
        let mut peer = PeerProcess::launch(&shell("echo 1; exit 3")).unwrap();
        let err = peer.await_readiness(1, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::PeerExited(Some(3))), "{:?}", err);
    }

    #[tokio::test]
    async fn test_readiness_timeout() {
        let mut peer = PeerProcess::launch(&shell("sleep 5")).unwrap();
        let err = peer.await_readiness(0, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Channel(SharedMemoryError::ResourceUnavailable { .. })
        ));
        peer.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_reports_status() {
        let mut peer = PeerProcess::launch(&shell("exit 0")).unwrap();
        assert!(peer.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_launch_missing_program() {
        let err = PeerProcess::launch(&PeerCommand::new("/nonexistent/peer-binary")).unwrap_err();
        assert!(matches!(err, ExchangeError::Peer(_)));
    }
}
