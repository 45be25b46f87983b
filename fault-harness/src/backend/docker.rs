//! Container backend on the Docker API (bollard).
//!
//! Each fixture gets its own bridge network named after a unique project
//! (`faultline-<uuid>`), and node `i` runs in container `<project>-node-<i>`
//! with a fixed address inside that network so its endpoint never changes
//! across restarts. Link failures are iptables rules executed inside the
//! container, which needs `NET_ADMIN`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    NetworkingConfig, RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{
    ContainerStateStatusEnum, EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig,
};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use fault_types::{NodeId, NodeStatus};
use futures_util::StreamExt;

use super::DeploymentBackend;
use crate::config::{BackendSpec, ConfigError, DockerSpec, FixtureSpec};
use crate::error::{HarnessError, Result};
use crate::iptables;
use crate::node::{CommandedState, NodeHandle, NodeKind};

/// Label marking every resource created for one fixture.
pub const PROJECT_LABEL: &str = "faultline.project";

/// Result of executing a command inside a container.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code (0 = success).
    pub exit_code: i64,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Container state as reported by `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerState {
    Running,
    Paused,
    NotRunning,
}

/// Docker-backed [`DeploymentBackend`].
pub struct DockerBackend {
    docker: Docker,
    project: String,
    network_created: Mutex<bool>,
}

impl DockerBackend {
    /// Connect to the local Docker daemon with a fresh project name.
    pub fn connect(fixture_name: &str) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| HarnessError::backend("fleet", "connect", e))?;
        Ok(Self {
            docker,
            project: project_name(fixture_name),
            network_created: Mutex::new(false),
        })
    }

    /// Unique project name.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Name of the per-project bridge network.
    pub fn network_name(&self) -> String {
        format!("{}-net", self.project)
    }

    /// Container name for node `index`.
    pub fn container_name(&self, index: usize) -> String {
        format!("{}-node-{}", self.project, index)
    }

    fn docker_spec(fixture: &FixtureSpec) -> Result<&DockerSpec> {
        match &fixture.backend {
            BackendSpec::Docker(spec) => Ok(spec),
            _ => Err(ConfigError::Invalid("docker backend needs a docker fixture".into()).into()),
        }
    }
}

/// Unique project name for one fixture deployment.
pub fn project_name(fixture_name: &str) -> String {
    format!(
        "faultline-{}-{}",
        fixture_name,
        &uuid::Uuid::new_v4().as_simple().to_string()[..12]
    )
}

/// Address of node `index` inside a `/24` subnet (`.10 + index`).
pub fn node_address(subnet: &str, index: usize) -> Result<String> {
    let invalid = || ConfigError::Invalid(format!("subnet {:?} is not an IPv4 /24", subnet));
    let (base, mask) = subnet.split_once('/').ok_or_else(invalid)?;
    if mask != "24" {
        return Err(invalid().into());
    }
    let octets: Vec<&str> = base.split('.').collect();
    if octets.len() != 4 || octets.iter().any(|o| o.parse::<u8>().is_err()) {
        return Err(invalid().into());
    }
    let host = 10 + index;
    if host > 254 {
        return Err(ConfigError::Invalid(format!("too many nodes for subnet {}", subnet)).into());
    }
    Ok(format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], host))
}

fn gateway_address(subnet: &str) -> Option<String> {
    let (base, _) = subnet.split_once('/')?;
    let (prefix, _) = base.rsplit_once('.')?;
    Some(format!("{}.1", prefix))
}

#[async_trait]
impl DeploymentBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn prepare(&self, fixture: &FixtureSpec) -> Result<()> {
        let spec = Self::docker_spec(fixture)?;
        let network = self.network_name();

        let options = CreateNetworkOptions {
            name: network.clone(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(spec.subnet.clone()),
                    gateway: gateway_address(&spec.subnet),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            labels: HashMap::from([(PROJECT_LABEL.to_string(), self.project.clone())]),
            ..Default::default()
        };

        self.docker
            .create_network(options)
            .await
            .map_err(|e| HarnessError::backend("fleet", "create network", e))?;
        *self.network_created.lock().unwrap_or_else(|e| e.into_inner()) = true;

        tracing::info!(project = %self.project, %network, "created cluster network");
        Ok(())
    }

    async fn provision(&self, index: usize, fixture: &FixtureSpec) -> Result<Arc<dyn NodeHandle>> {
        let spec = Self::docker_spec(fixture)?;
        let name = self.container_name(index);
        let network = self.network_name();
        let ip = node_address(&spec.subnet, index)?;
        let id = NodeId::from_parts(&ip, spec.member_port);

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .chain([
                format!("FAULTLINE_ENDPOINT={}", id),
                format!("FAULTLINE_NODE_INDEX={}", index),
            ])
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(format!("node-{}", index)),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: Some(env),
            labels: Some(HashMap::from([(
                PROJECT_LABEL.to_string(),
                self.project.clone(),
            )])),
            host_config: Some(HostConfig {
                cap_add: Some(vec!["NET_ADMIN".to_string()]),
                memory: fixture.resources.memory_bytes(),
                nano_cpus: fixture.resources.nano_cpus(),
                network_mode: Some(network.clone()),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: HashMap::from([(
                    network.clone(),
                    EndpointSettings {
                        ipam_config: Some(EndpointIpamConfig {
                            ipv4_address: Some(ip.clone()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                )]),
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| HarnessError::backend(&id, "create container", e))?;

        let node = DockerNode::new(self.docker.clone(), name, id, NodeStatus::Stopped)
            .with_restart_grace(fixture.faults.stop_grace());
        node.start().await?;

        tracing::info!(node = %node.id(), container = %node.container, "provisioned container node");
        Ok(Arc::new(node))
    }

    async fn release(&self) -> Result<()> {
        let created = *self.network_created.lock().unwrap_or_else(|e| e.into_inner());
        if !created {
            return Ok(());
        }
        self.docker
            .remove_network(&self.network_name())
            .await
            .map_err(|e| HarnessError::backend("fleet", "remove network", e))?;
        tracing::info!(project = %self.project, "removed cluster network");
        Ok(())
    }
}

/// Restart options waiting `grace` before the daemon kills the member.
fn restart_options(grace: Duration) -> RestartContainerOptions {
    RestartContainerOptions {
        t: isize::try_from(grace.as_secs()).unwrap_or(isize::MAX),
    }
}

/// A cluster member running in a Docker container.
pub struct DockerNode {
    docker: Docker,
    container: String,
    id: NodeId,
    state: CommandedState,
    restart_grace: Duration,
}

impl DockerNode {
    /// Wrap an existing container.
    pub fn new(docker: Docker, container: String, id: NodeId, status: NodeStatus) -> Self {
        Self {
            docker,
            container,
            id,
            state: CommandedState::new(status),
            restart_grace: crate::node::DEFAULT_STOP_GRACE,
        }
    }

    /// Grace period the daemon gives the member before killing it on restart.
    pub fn with_restart_grace(mut self, grace: Duration) -> Self {
        self.restart_grace = grace;
        self
    }

    /// Container name.
    pub fn container(&self) -> &str {
        &self.container
    }

    fn err(&self, operation: &'static str) -> impl Fn(bollard::errors::Error) -> HarnessError + '_ {
        move |e| HarnessError::backend(&self.id, operation, e)
    }

    async fn inspect_state(&self, operation: &'static str) -> Result<ContainerState> {
        let info = self
            .docker
            .inspect_container(&self.container, None::<InspectContainerOptions>)
            .await
            .map_err(self.err(operation))?;

        let state = info.state.unwrap_or_default();
        Ok(match state.status {
            Some(ContainerStateStatusEnum::PAUSED) => ContainerState::Paused,
            Some(ContainerStateStatusEnum::RUNNING) | Some(ContainerStateStatusEnum::RESTARTING) => {
                ContainerState::Running
            }
            _ => ContainerState::NotRunning,
        })
    }

    /// Execute a command inside the container and return the result.
    pub async fn exec(&self, cmd: Vec<&str>, operation: &'static str) -> Result<ExecResult> {
        let exec_options = CreateExecOptions {
            cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&self.container, exec_options)
            .await
            .map_err(self.err(operation))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(self.err(operation))?
        {
            while let Some(Ok(msg)) = output.next().await {
                match msg {
                    LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(self.err(operation))?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        Ok(ExecResult {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn exec_script(&self, script: &str, operation: &'static str) -> Result<()> {
        let result = self.exec(vec!["sh", "-c", script], operation).await?;
        if !result.success() {
            return Err(HarnessError::backend(
                &self.id,
                operation,
                format!("exit={}, stderr={}", result.exit_code, result.stderr.trim()),
            ));
        }
        Ok(())
    }

    async fn unpause_if_paused(&self, operation: &'static str) -> Result<ContainerState> {
        let state = self.inspect_state(operation).await?;
        if state == ContainerState::Paused {
            self.docker
                .unpause_container(&self.container)
                .await
                .map_err(self.err(operation))?;
            return Ok(ContainerState::Running);
        }
        Ok(state)
    }
}

#[async_trait]
impl NodeHandle for DockerNode {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Container
    }

    fn commanded_status(&self) -> NodeStatus {
        self.state.status()
    }

    fn disconnected_peers(&self) -> BTreeSet<NodeId> {
        self.state.peers()
    }

    async fn start(&self) -> Result<()> {
        match self.unpause_if_paused("start").await? {
            ContainerState::Running => {}
            _ => {
                self.docker
                    .start_container(&self.container, None::<StartContainerOptions<String>>)
                    .await
                    .map_err(self.err("start"))?;
                // Fresh network namespace: previous firewall rules are gone.
                self.state.clear_peers();
            }
        }
        self.state.set_status(NodeStatus::Running);
        tracing::info!(node = %self.id, "started");
        Ok(())
    }

    async fn stop(&self, grace: Duration) -> Result<()> {
        if self.unpause_if_paused("stop").await? == ContainerState::NotRunning {
            if self.state.status().is_live() || self.state.status() == NodeStatus::Paused {
                self.state.set_status(NodeStatus::Stopped);
            }
            return Ok(());
        }
        self.docker
            .stop_container(
                &self.container,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
            .map_err(self.err("stop"))?;
        self.state.set_status(NodeStatus::Stopped);
        tracing::info!(node = %self.id, ?grace, "stopped");
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        if self.unpause_if_paused("kill").await? == ContainerState::NotRunning {
            self.state.set_status(NodeStatus::Killed);
            return Ok(());
        }
        self.docker
            .kill_container(
                &self.container,
                Some(KillContainerOptions { signal: "SIGKILL" }),
            )
            .await
            .map_err(self.err("kill"))?;
        self.state.set_status(NodeStatus::Killed);
        tracing::info!(node = %self.id, "killed");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        match self.inspect_state("pause").await? {
            ContainerState::Paused => {}
            ContainerState::Running => {
                self.docker
                    .pause_container(&self.container)
                    .await
                    .map_err(self.err("pause"))?;
                tracing::info!(node = %self.id, "paused");
            }
            ContainerState::NotRunning => {
                return Err(HarnessError::InvalidState {
                    expected: "running container".into(),
                    actual: self.state.status().to_string(),
                });
            }
        }
        self.state.set_status(NodeStatus::Paused);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        if self.inspect_state("resume").await? == ContainerState::Paused {
            self.docker
                .unpause_container(&self.container)
                .await
                .map_err(self.err("resume"))?;
            tracing::info!(node = %self.id, "resumed");
        }
        if self.state.status() == NodeStatus::Paused {
            self.state.set_status(NodeStatus::Running);
        }
        Ok(())
    }

    async fn disconnect(&self, peers: &[NodeId]) -> Result<()> {
        for peer in self.state.not_blocked(peers) {
            if peer == self.id {
                continue;
            }
            self.exec_script(&iptables::block_peer_script(peer.host(), false), "disconnect")
                .await?;
            tracing::info!(node = %self.id, %peer, "blocked peer");
            self.state.add_peer(peer);
        }
        Ok(())
    }

    async fn reconnect(&self, peers: &[NodeId]) -> Result<()> {
        let blocked = self.state.peers();
        for peer in peers.iter().filter(|p| blocked.contains(p)) {
            self.exec_script(&iptables::unblock_peer_script(peer.host(), false), "reconnect")
                .await?;
            tracing::info!(node = %self.id, %peer, "unblocked peer");
            self.state.remove_peer(peer);
        }
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.unpause_if_paused("restart").await?;
        self.docker
            .restart_container(&self.container, Some(restart_options(self.restart_grace)))
            .await
            .map_err(self.err("restart"))?;
        self.state.clear_peers();
        self.state.set_status(NodeStatus::Running);
        tracing::info!(node = %self.id, "restarted");
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.docker
            .remove_container(
                &self.container,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(self.err("destroy"))?;
        self.state.set_status(NodeStatus::Stopped);
        tracing::info!(node = %self.id, container = %self.container, "removed container");
        Ok(())
    }
}
