//! Fixture configuration.
//!
//! A [`FixtureSpec`] is the declarative description of a test cluster. It is
//! loaded from TOML (or built in code), passed by value to
//! [`ClusterOrchestrator::deploy`](crate::ClusterOrchestrator::deploy), and
//! never mutated afterwards.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Declarative description of the desired test cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureSpec {
    /// Fixture name, used in logs and resource names.
    #[serde(default = "default_name")]
    pub name: String,
    /// Number of cluster members.
    pub node_count: usize,
    /// Leave nodes running at teardown for manual inspection.
    #[serde(default)]
    pub keep_on_teardown: bool,
    /// Deployment backend and its parameters.
    pub backend: BackendSpec,
    /// Per-node resource limits.
    #[serde(default)]
    pub resources: NodeResources,
    /// Bootstrap retry policy.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    /// Membership (add/remove) parameters.
    #[serde(default)]
    pub membership: MembershipConfig,
    /// Default poll cadence.
    #[serde(default)]
    pub poll: PollConfig,
    /// Fault injection parameters.
    #[serde(default)]
    pub faults: FaultConfig,
}

/// Deployment backend selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendSpec {
    /// One container per node via the Docker API.
    Docker(DockerSpec),
    /// One virtual machine per node via a hypervisor API and SSH.
    Vm(VmSpec),
    /// In-memory nodes for harness self-tests.
    Simulated(SimSpec),
}

impl BackendSpec {
    /// Port the cluster member listens on.
    pub fn member_port(&self) -> u16 {
        match self {
            BackendSpec::Docker(d) => d.member_port,
            BackendSpec::Vm(v) => v.member_port,
            BackendSpec::Simulated(s) => s.member_port,
        }
    }
}

/// Container backend parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerSpec {
    /// Image running the cluster member.
    pub image: String,
    /// Port the member listens on inside the container.
    #[serde(default = "default_member_port")]
    pub member_port: u16,
    /// Command override (image default if empty).
    #[serde(default)]
    pub command: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// /24 subnet of the per-fixture bridge network; node `i` gets host `.10+i`.
    #[serde(default = "default_subnet")]
    pub subnet: String,
}

/// Virtual machine backend parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct VmSpec {
    /// Hypervisor API connection.
    pub hypervisor: HypervisorConfig,
    /// One entry per node, in node order.
    pub vms: Vec<VmEntry>,
    /// Member process control commands.
    #[serde(default)]
    pub process: ProcessConfig,
    /// Port the member listens on.
    #[serde(default = "default_member_port")]
    pub member_port: u16,
    /// SSH connect timeout in seconds.
    #[serde(default = "default_ssh_timeout_secs")]
    pub ssh_timeout_secs: u64,
    /// How long to wait for SSH after powering a VM on, in seconds.
    #[serde(default = "default_boot_timeout_secs")]
    pub boot_timeout_secs: u64,
}

/// Hypervisor REST API connection.
#[derive(Debug, Clone, Deserialize)]
pub struct HypervisorConfig {
    /// Base URL, e.g. `https://vcenter.lab:443`.
    pub url: String,
    /// API user.
    pub username: String,
    /// Environment variable holding the API password.
    #[serde(default = "default_password_env")]
    pub password_env: String,
    /// Accept self-signed certificates (lab hypervisors).
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// A VM hosting one cluster member.
#[derive(Debug, Clone, Deserialize)]
pub struct VmEntry {
    /// Hypervisor identifier of the VM.
    pub name: String,
    /// Address the member is reachable at (also used for SSH).
    pub host: String,
    /// SSH user.
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

/// Shell commands controlling the member process inside a VM.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    /// Start the member process (must return once started).
    #[serde(default = "default_start_cmd")]
    pub start: String,
    /// Ask the member process to exit gracefully.
    #[serde(default = "default_stop_cmd")]
    pub stop: String,
    /// Terminate the member process immediately.
    #[serde(default = "default_kill_cmd")]
    pub kill: String,
    /// Exit 0 while the member process is running.
    #[serde(default = "default_status_cmd")]
    pub status: String,
    /// `pkill -f` pattern matching the member process.
    #[serde(default = "default_pattern")]
    pub pattern: String,
}

/// Simulated backend parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct SimSpec {
    /// Expose hypervisor power control on simulated nodes.
    #[serde(default)]
    pub power_control: bool,
    /// Port assigned to simulated endpoints.
    #[serde(default = "default_member_port")]
    pub member_port: u16,
}

/// Per-node resource limits.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeResources {
    /// Memory limit in MiB.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// CPU limit (fractional cores).
    #[serde(default = "default_cpus")]
    pub cpus: f64,
}

/// Bootstrap retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    /// Attempts before giving up (default: 5).
    #[serde(default = "default_bootstrap_retries")]
    pub retries: u32,
    /// Fixed delay between attempts in milliseconds (default: 1000).
    #[serde(default = "default_bootstrap_backoff_ms")]
    pub backoff_ms: u64,
}

/// Parameters passed to the management API's add/remove calls.
#[derive(Debug, Clone, Deserialize)]
pub struct MembershipConfig {
    /// Retries performed by the management call (default: 3).
    #[serde(default = "default_membership_retries")]
    pub retries: u32,
    /// Overall timeout in seconds (default: 300).
    #[serde(default = "default_membership_timeout_secs")]
    pub timeout_secs: u64,
    /// Poll period in milliseconds (default: 1000).
    #[serde(default = "default_poll_period_ms")]
    pub poll_period_ms: u64,
}

/// Default cadence for condition polling.
#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    /// Interval between snapshots in milliseconds (default: 1000).
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// Wait deadline in seconds (default: 60).
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,
}

/// Fault injection parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct FaultConfig {
    /// Grace period for `stop` in seconds (default: 10).
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// Per-call timeout for parallel batches in seconds (default: 30).
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

// Default value functions
fn default_name() -> String {
    "faultline".to_string()
}

fn default_member_port() -> u16 {
    9000
}

fn default_subnet() -> String {
    "172.29.0.0/24".to_string()
}

fn default_ssh_timeout_secs() -> u64 {
    30
}

fn default_boot_timeout_secs() -> u64 {
    300
}

fn default_password_env() -> String {
    "FAULTLINE_HYPERVISOR_PASSWORD".to_string()
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_start_cmd() -> String {
    "sudo systemctl start cluster-member".to_string()
}

fn default_stop_cmd() -> String {
    "sudo systemctl stop --no-block cluster-member".to_string()
}

fn default_kill_cmd() -> String {
    "sudo systemctl kill --signal=SIGKILL cluster-member".to_string()
}

fn default_status_cmd() -> String {
    "systemctl is-active --quiet cluster-member".to_string()
}

fn default_pattern() -> String {
    "cluster-member".to_string()
}

fn default_memory_mb() -> u64 {
    1024
}

fn default_cpus() -> f64 {
    1.0
}

fn default_bootstrap_retries() -> u32 {
    5
}

fn default_bootstrap_backoff_ms() -> u64 {
    1000
}

fn default_membership_retries() -> u32 {
    3
}

fn default_membership_timeout_secs() -> u64 {
    300
}

fn default_poll_period_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_poll_timeout_secs() -> u64 {
    60
}

fn default_stop_grace_secs() -> u64 {
    10
}

fn default_call_timeout_secs() -> u64 {
    30
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            start: default_start_cmd(),
            stop: default_stop_cmd(),
            kill: default_kill_cmd(),
            status: default_status_cmd(),
            pattern: default_pattern(),
        }
    }
}

impl Default for NodeResources {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            cpus: default_cpus(),
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            retries: default_bootstrap_retries(),
            backoff_ms: default_bootstrap_backoff_ms(),
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            retries: default_membership_retries(),
            timeout_secs: default_membership_timeout_secs(),
            poll_period_ms: default_poll_period_ms(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            stop_grace_secs: default_stop_grace_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl BootstrapConfig {
    /// Delay between attempts.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl MembershipConfig {
    /// Overall timeout of one add/remove call.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Poll period of one add/remove call.
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }
}

impl PollConfig {
    /// Interval between snapshots.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Wait deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl NodeResources {
    /// Memory limit in bytes, or `None` if it does not fit the container API.
    pub fn memory_bytes(&self) -> Option<i64> {
        self.memory_mb
            .checked_mul(1024 * 1024)
            .and_then(|bytes| i64::try_from(bytes).ok())
    }

    /// CPU limit in billionths of a core, or `None` if out of range.
    pub fn nano_cpus(&self) -> Option<i64> {
        let nanos = self.cpus * 1e9;
        (nanos.is_finite() && nanos > 0.0 && nanos < i64::MAX as f64).then(|| nanos as i64)
    }
}

impl FaultConfig {
    /// Grace period for `stop`.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Per-call timeout for parallel batches.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl FixtureSpec {
    /// A fixture for `node_count` simulated nodes with default policies.
    pub fn simulated(node_count: usize) -> Self {
        Self {
            name: default_name(),
            node_count,
            keep_on_teardown: false,
            backend: BackendSpec::Simulated(SimSpec {
                power_control: false,
                member_port: default_member_port(),
            }),
            resources: NodeResources::default(),
            bootstrap: BootstrapConfig::default(),
            membership: MembershipConfig::default(),
            poll: PollConfig::default(),
            faults: FaultConfig::default(),
        }
    }

    /// Load a fixture from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// [`validate`](Self::validate).
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let spec: FixtureSpec = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        spec.validate()?;
        Ok(spec)
    }

    /// Parse and validate a fixture from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let spec: FixtureSpec = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            source: e,
        })?;
        spec.validate()?;
        Ok(spec)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_count == 0 {
            return Err(ConfigError::Invalid("node_count must be at least 1".into()));
        }
        if self.poll.timeout_secs == 0 {
            return Err(ConfigError::Invalid("poll.timeout_secs must be non-zero".into()));
        }
        if self.bootstrap.retries == 0 {
            return Err(ConfigError::Invalid("bootstrap.retries must be non-zero".into()));
        }
        if self.resources.memory_bytes().is_none() {
            return Err(ConfigError::Invalid(format!(
                "resources.memory_mb {} is out of range",
                self.resources.memory_mb
            )));
        }
        if self.resources.nano_cpus().is_none() {
            return Err(ConfigError::Invalid(format!(
                "resources.cpus {} is out of range",
                self.resources.cpus
            )));
        }
        if let BackendSpec::Vm(vm) = &self.backend {
            if vm.vms.len() != self.node_count {
                return Err(ConfigError::Invalid(format!(
                    "vm backend lists {} VMs for {} nodes",
                    vm.vms.len(),
                    self.node_count
                )));
            }
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the fixture file.
    #[error("failed to read fixture {path}: {source}")]
    ReadError {
        /// Path to the fixture file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse the fixture file.
    #[error("failed to parse fixture {path}: {source}")]
    ParseError {
        /// Path to the fixture file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Fixture parsed but is not usable.
    #[error("invalid fixture: {0}")]
    Invalid(String),
}
