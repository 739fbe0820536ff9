//! Run configuration
//!
//! Accepts the peer's plain-text format (`key = value` or `key value`, `#`
//! comments, `[section]` headers ignored) and `.toml` files. Also produces
//! per-process replicas so several workers can share one host.

use crate::{ExchangeConfig, ExchangeError, Result};
use param_exchange_shm::{PlatformUtils, WaitOptions, MAX_SLOTS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Keys whose numeric value is offset by the process index in replicas
const PER_PROCESS_NUMERIC_KEYS: &[&str] = &["local_id", "gms_port", "rpc_port", "sst_port", "rdmc_port"];

/// Keys naming IPC objects; replicas suffix them with `_<index>`
const IPC_NAME_KEYS: &[&str] = &["local_sem_name", "peer_sem_name", "model_shm_name", "gradient_shm_name"];

/// Worker run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Node identity inside the peer group
    #[serde(default)]
    pub local_id: u32,

    /// Group leader address
    #[serde(default = "default_ip")]
    pub leader_ip: String,

    /// This node's address
    #[serde(default = "default_ip")]
    pub local_ip: String,

    /// Leader membership port
    #[serde(default = "default_gms_port")]
    pub leader_gms_port: u16,

    /// This node's membership port
    #[serde(default = "default_gms_port")]
    pub gms_port: u16,

    /// Peer transport ports; passed through to the peer's own config
    #[serde(default)]
    pub rpc_port: Option<u16>,

    #[serde(default)]
    pub sst_port: Option<u16>,

    #[serde(default)]
    pub rdmc_port: Option<u16>,

    /// Network interface the peer binds
    #[serde(default)]
    pub domain: Option<String>,

    /// Nodes in the group, leader included
    #[serde(default = "default_num_nodes")]
    pub num_nodes: u32,

    /// Model input width
    #[serde(default)]
    pub num_in_features: usize,

    /// Model output width
    #[serde(default)]
    pub num_out_features: usize,

    #[serde(default = "default_num_epochs")]
    pub num_epochs: u32,

    #[serde(default = "default_steps_per_epoch")]
    pub steps_per_epoch: u64,

    /// Peer executable
    #[serde(default, alias = "derecho_path")]
    pub peer_path: Option<PathBuf>,

    /// Semaphore the local side releases ("local write complete")
    #[serde(default = "default_local_sem_name")]
    pub local_sem_name: String,

    /// Semaphore the peer releases ("peer write complete")
    #[serde(default = "default_peer_sem_name")]
    pub peer_sem_name: String,

    /// Control region; parameter buffers are `<name>_BUF_<i>`
    #[serde(default = "default_model_shm_name")]
    pub model_shm_name: String,

    /// Gradient region name passed to the peer
    #[serde(default = "default_gradient_shm_name")]
    pub gradient_shm_name: String,

    #[serde(default = "default_slot_count")]
    pub slot_count: usize,

    #[serde(default = "default_attach_timeout_ms")]
    pub attach_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Per-cycle acquire timeout
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: Option<u64>,

    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,

    /// Offsets the peer prints after its node id; absent means the peer
    /// prints nothing the worker waits for
    #[serde(default)]
    pub readiness_offsets: Option<usize>,

    /// Keys this loader does not interpret
    #[serde(skip)]
    pub extra: BTreeMap<String, String>,
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_gms_port() -> u16 {
    23580
}

fn default_num_nodes() -> u32 {
    2
}

fn default_num_epochs() -> u32 {
    100
}

fn default_steps_per_epoch() -> u64 {
    469
}

fn default_local_sem_name() -> String {
    "/python_sem".to_string()
}

fn default_peer_sem_name() -> String {
    "/cpp_sem".to_string()
}

fn default_model_shm_name() -> String {
    "model_shm".to_string()
}

fn default_gradient_shm_name() -> String {
    "gradient_shm".to_string()
}

fn default_slot_count() -> usize {
    3
}

fn default_attach_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_acquire_timeout_ms() -> Option<u64> {
    Some(60_000)
}

fn default_readiness_timeout_ms() -> u64 {
    60_000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            local_id: 0,
            leader_ip: default_ip(),
            local_ip: default_ip(),
            leader_gms_port: default_gms_port(),
            gms_port: default_gms_port(),
            rpc_port: None,
            sst_port: None,
            rdmc_port: None,
            domain: None,
            num_nodes: default_num_nodes(),
            num_in_features: 0,
            num_out_features: 0,
            num_epochs: default_num_epochs(),
            steps_per_epoch: default_steps_per_epoch(),
            peer_path: None,
            local_sem_name: default_local_sem_name(),
            peer_sem_name: default_peer_sem_name(),
            model_shm_name: default_model_shm_name(),
            gradient_shm_name: default_gradient_shm_name(),
            slot_count: default_slot_count(),
            attach_timeout_ms: default_attach_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            readiness_timeout_ms: default_readiness_timeout_ms(),
            readiness_offsets: None,
            extra: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    /// Load from a file; `.toml` goes through serde, anything else is
    /// parsed as key/value text
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let config = if path.extension().map_or(false, |ext| ext == "toml") {
            toml::from_str(&content)?
        } else {
            Self::parse(&content)?
        };

        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse key/value text
    pub fn parse(text: &str) -> Result<Self> {
        let mut config = Self::default();
        for entry in parse_entries(text)? {
            config.apply(&entry)?;
        }
        Ok(config)
    }

    fn apply(&mut self, entry: &Entry) -> Result<()> {
        let value = entry.value.as_str();
        match entry.key.as_str() {
            "local_id" => self.local_id = parse_value(entry)?,
            "leader_ip" => self.leader_ip = value.to_string(),
            "local_ip" => self.local_ip = value.to_string(),
            "leader_gms_port" => self.leader_gms_port = parse_value(entry)?,
            "gms_port" => self.gms_port = parse_value(entry)?,
            "rpc_port" => self.rpc_port = Some(parse_value(entry)?),
            "sst_port" => self.sst_port = Some(parse_value(entry)?),
            "rdmc_port" => self.rdmc_port = Some(parse_value(entry)?),
            "domain" => self.domain = Some(value.to_string()),
            "num_nodes" => self.num_nodes = parse_value(entry)?,
            "num_in_features" => self.num_in_features = parse_value(entry)?,
            "num_out_features" => self.num_out_features = parse_value(entry)?,
            "num_epochs" => self.num_epochs = parse_value(entry)?,
            "steps_per_epoch" => self.steps_per_epoch = parse_value(entry)?,
            "derecho_path" | "peer_path" => self.peer_path = Some(PathBuf::from(value)),
            "local_sem_name" => self.local_sem_name = value.to_string(),
            "peer_sem_name" => self.peer_sem_name = value.to_string(),
            "model_shm_name" => self.model_shm_name = value.to_string(),
            "gradient_shm_name" => self.gradient_shm_name = value.to_string(),
            "slot_count" => self.slot_count = parse_value(entry)?,
            "attach_timeout_ms" => self.attach_timeout_ms = parse_value(entry)?,
            "poll_interval_ms" => self.poll_interval_ms = parse_value(entry)?,
            "acquire_timeout_ms" => self.acquire_timeout_ms = Some(parse_value(entry)?),
            "readiness_timeout_ms" => self.readiness_timeout_ms = parse_value(entry)?,
            "readiness_offsets" => self.readiness_offsets = Some(parse_value(entry)?),
            other => {
                debug!("Keeping uninterpreted key {} at line {}", other, entry.line);
                self.extra.insert(other.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// Reject values the run cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 || self.slot_count > MAX_SLOTS {
            return Err(ExchangeError::config(
                0,
                format!("slot_count must be 1..={}, got {}", MAX_SLOTS, self.slot_count),
            ));
        }
        self.param_count()?;
        for name in [&self.local_sem_name, &self.peer_sem_name, &self.model_shm_name, &self.gradient_shm_name] {
            PlatformUtils::validate_name(name)?;
        }
        Ok(())
    }

    /// Whether this node is the group leader (runs the peer as the
    /// parameter server instead of training)
    pub fn is_leader(&self) -> bool {
        self.leader_ip == self.local_ip && self.leader_gms_port == self.gms_port
    }

    /// Elements in one parameter array; the f32 array must be addressable
    pub fn param_count(&self) -> Result<usize> {
        self.num_in_features
            .checked_mul(self.num_out_features)
            .filter(|count| count.checked_mul(std::mem::size_of::<f32>()).is_some())
            .ok_or_else(|| {
                ExchangeError::config(
                    0,
                    format!(
                        "num_in_features {} x num_out_features {} overflows the parameter array",
                        self.num_in_features, self.num_out_features
                    ),
                )
            })
    }

    /// Attach policy
    pub fn wait_options(&self) -> WaitOptions {
        WaitOptions {
            timeout: Duration::from_millis(self.attach_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..WaitOptions::default()
        }
    }

    /// Per-cycle acquire timeout
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    /// Parameter buffer region names
    pub fn slot_region_names(&self) -> Vec<String> {
        (0..self.slot_count)
            .map(|i| PlatformUtils::slot_region_name(&self.model_shm_name, i))
            .collect()
    }

    /// Channel configuration, with offsets the peer announced
    pub fn exchange_config(&self, announced_offsets: Vec<u64>) -> Result<ExchangeConfig> {
        Ok(ExchangeConfig {
            control_region: self.model_shm_name.clone(),
            slot_base: self.model_shm_name.clone(),
            slot_count: self.slot_count,
            param_count: self.param_count()?,
            announced_offsets,
            wait: self.wait_options(),
            acquire_timeout: self.acquire_timeout(),
        })
    }
}

/// One `key value` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// 1-based line number
    pub line: usize,
    pub key: String,
    pub value: String,
}

/// Parse key/value text into entries, in file order
pub fn parse_entries(text: &str) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let Some(content) = significant(raw) else {
            continue;
        };
        let (key, value) = split_pair(content).ok_or_else(|| ExchangeError::config(line, "expected `key = value` or `key value`"))?;
        entries.push(Entry {
            line,
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(entries)
}

/// Line content without comments; `None` for blank, comment and section lines
fn significant(raw: &str) -> Option<&str> {
    let content = match raw.find('#') {
        Some(pos) => &raw[..pos],
        None => raw,
    }
    .trim();

    if content.is_empty() || (content.starts_with('[') && content.ends_with(']')) {
        return None;
    }
    Some(content)
}

fn split_pair(content: &str) -> Option<(&str, &str)> {
    let (key, value) = match content.find('=') {
        Some(pos) => (&content[..pos], &content[pos + 1..]),
        None => content.split_once(char::is_whitespace)?,
    };
    let (key, value) = (key.trim(), value.trim());
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value))
}

fn parse_value<T: std::str::FromStr>(entry: &Entry) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    entry.value.parse().map_err(|e: T::Err| {
        ExchangeError::config(entry.line, format!("invalid value {:?} for {}: {}", entry.value, entry.key, e))
    })
}

/// Per-process copy of a configuration text.
///
/// Numeric ids and ports are offset by `index`, `domain` becomes `lo` and
/// IPC names gain a `_<index>` suffix. Everything else, comments included,
/// is kept verbatim.
pub fn replicate(text: &str, index: usize) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    for (idx, raw) in text.lines().enumerate() {
        out.push_str(&replicate_line(raw, idx + 1, index)?);
        out.push('\n');
    }
    Ok(out)
}

fn replicate_line(raw: &str, line: usize, index: usize) -> Result<String> {
    let Some(content) = significant(raw) else {
        return Ok(raw.to_string());
    };
    let Some((key, value)) = split_pair(content) else {
        return Ok(raw.to_string());
    };

    let replaced = if PER_PROCESS_NUMERIC_KEYS.contains(&key) {
        let base: u64 = value
            .parse()
            .map_err(|_| ExchangeError::config(line, format!("{} must be numeric to replicate, got {:?}", key, value)))?;
        (base + index as u64).to_string()
    } else if key == "domain" {
        "lo".to_string()
    } else if IPC_NAME_KEYS.contains(&key) {
        PlatformUtils::process_scoped_name(value, index)
    } else {
        return Ok(raw.to_string());
    };

    // Keep the key and separator as written, swap only the value
    let key_end = raw.find(key).map_or(0, |pos| pos + key.len());
    let value_start = raw[key_end..].find(value).map_or(raw.len(), |pos| key_end + pos);
    let value_end = (value_start + value.len()).min(raw.len());
    Ok(format!("{}{}{}", &raw[..value_start], replaced, &raw[value_end..]))
}

/// Write `process<i>/<file name>` replicas of `source` under `dest` for
/// `i` in `0..count`. Existing process directories are left alone.
pub fn write_replicas(source: &Path, dest: &Path, count: usize) -> Result<Vec<PathBuf>> {
    let text = std::fs::read_to_string(source)?;
    let file_name = source
        .file_name()
        .ok_or_else(|| ExchangeError::config(0, format!("{} has no file name", source.display())))?;

    let mut written = Vec::new();
    for i in 0..count {
        let dir = dest.join(format!("process{}", i));
        if dir.exists() {
            info!("Directory {} already exists, skipping", dir.display());
            continue;
        }
        std::fs::create_dir_all(&dir)?;
        let target = dir.join(file_name);
        std::fs::write(&target, replicate(&text, i)?)?;
        info!("Wrote {}", target.display());
        written.push(target);
    }
    Ok(written)
}
