//! Cluster session lifecycle: setup on enter, log collection on exit.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use tokio::sync::OnceCell;

use crate::command::{Script, ShellCommand};
use crate::config::ClusterConfig;
use crate::discovery::{create_manifest_source, HostDiscovery, ManifestSource};
use crate::error::{ClusterError, ClusterResult};
use crate::layout::{base_name, parent_dir, remote_join, ProjectLayout};
use crate::process::ProcessRunner;
use crate::remote::{ExecutionStrategy, OnFailure, RemoteExecutor};
use crate::topology::{HostRecord, HostSet};

/// Subtrees left out when pushing the working tree
pub const SYNC_EXCLUDES: &[&str] = &["logs/*", "docs/*"];

/// Remote utility needed for pinning on multi-socket machines
pub const NUMA_TOOL: &str = "numactl";

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Hosts discovered and checked, nothing touched remotely
    Constructed,
    /// Code deployed and log directories prepared
    Entered,
    /// Logs collected, session finished
    Exited,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Constructed => write!(f, "Constructed"),
            SessionState::Entered => write!(f, "Entered"),
            SessionState::Exited => write!(f, "Exited"),
        }
    }
}

/// Describes one run of the caller's workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDescriptor {
    log_subdir: String,
}

impl ClusterDescriptor {
    /// Run whose logs live in `log_subdir`, relative to the remote working
    /// directory (normally `logs/<run>`)
    pub fn new(log_subdir: impl Into<String>) -> Self {
        ClusterDescriptor {
            log_subdir: log_subdir.into(),
        }
    }

    /// Run logging to `logs/<YYYYMMDDHHMMSS>`
    pub fn timestamped(now: DateTime<Local>) -> Self {
        Self::new(format!("logs/{}", now.format("%Y%m%d%H%M%S")))
    }

    /// Log subdirectory for this run
    pub fn log_subdir(&self) -> &str {
        &self.log_subdir
    }
}

/// How stale processes are killed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillPolicy {
    /// Number of pkill rounds; every round runs, failures are ignored
    pub attempts: u32,
    /// Run pkill through sudo
    pub sudo: bool,
}

impl KillPolicy {
    /// Policy for a session: repeated sudo kills under DPDK, a single plain
    /// kill otherwise
    pub fn for_config(config: &ClusterConfig) -> Self {
        if config.dpdk {
            KillPolicy {
                attempts: config.dpdk_kill_attempts,
                sudo: true,
            }
        } else {
            KillPolicy {
                attempts: 1,
                sudo: false,
            }
        }
    }
}

/// A deployment session on an Emulab experiment
pub struct EmulabCluster {
    config: ClusterConfig,
    hosts: HostSet,
    server_hosts: Vec<HostRecord>,
    other_hosts: Vec<HostRecord>,
    build_flags: String,
    make_args: Vec<String>,
    executor: RemoteExecutor,
    layout: ProjectLayout,
    remote_wd: OnceCell<String>,
    state: SessionState,
    descriptor: Option<ClusterDescriptor>,
}

impl EmulabCluster {
    /// Construct a session reading the manifest from the testbed agent, or
    /// from `manifest_file` when given
    pub async fn from_config(
        config: ClusterConfig,
        runner: Arc<dyn ProcessRunner>,
        manifest_file: Option<PathBuf>,
    ) -> ClusterResult<Self> {
        let source = create_manifest_source(&config, runner.clone(), manifest_file);
        Self::connect(config, runner, source).await
    }

    /// Construct a session: discover hosts, verify DPDK preconditions,
    /// pick an execution strategy and probe optional tools. Nothing is
    /// changed on any host.
    pub async fn connect(
        config: ClusterConfig,
        runner: Arc<dyn ProcessRunner>,
        source: Arc<dyn ManifestSource>,
    ) -> ClusterResult<Self> {
        let config = config.build()?;
        info!(
            "NOTICE: running with dpdk={}, alwaysclean={}, makeflags={}",
            config.dpdk, config.always_clean, config.make_flags
        );

        let hosts = HostDiscovery::new(source).host_set().await?;
        if hosts.is_empty() {
            return Err(ClusterError::ConfigurationError(
                "manifest does not list any hosts".to_string(),
            ));
        }
        let server_hosts = hosts.servers();
        let other_hosts = hosts.others();
        let build_flags = config.build_flags();
        let make_args = config.make_args()?;

        let strategy = RemoteExecutor::detect_strategy(runner.as_ref(), &config.hosts_file);
        let executor = RemoteExecutor::new(runner.clone(), hosts.hosts().to_vec(), strategy);

        if config.dpdk {
            check_hugepages(&executor, &config).await?;
        }

        for host in &hosts {
            if !executor.remote_command_exists(&host.name, NUMA_TOOL).await {
                warn!(
                    "WARNING: {} not installed on {}. install {} and provide --numactl flag for multisocket machines",
                    NUMA_TOOL, host.name, NUMA_TOOL
                );
            }
        }

        match executor.strategy() {
            ExecutionStrategy::Serial => {
                info!("NOTICE: Remote commands could be faster if you install and configure pdsh");
            }
            ExecutionStrategy::Parallel { .. } => executor.prepare().await?,
        }

        let layout = ProjectLayout::discover(runner.as_ref(), config.project_root.clone()).await;

        Ok(EmulabCluster {
            config,
            hosts,
            server_hosts,
            other_hosts,
            build_flags,
            make_args,
            executor,
            layout,
            remote_wd: OnceCell::new(),
            state: SessionState::Constructed,
            descriptor: None,
        })
    }

    /// Session configuration
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Every host in manifest order
    pub fn hosts(&self) -> &HostSet {
        &self.hosts
    }

    /// Hosts named `server*`
    pub fn server_hosts(&self) -> &[HostRecord] {
        &self.server_hosts
    }

    /// Hosts named `client*`
    pub fn other_hosts(&self) -> &[HostRecord] {
        &self.other_hosts
    }

    /// Flags passed to make
    pub fn build_flags(&self) -> &str {
        &self.build_flags
    }

    /// Serial or parallel fan-out
    pub fn strategy(&self) -> &ExecutionStrategy {
        self.executor.strategy()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Descriptor of the current run, once entered
    pub fn descriptor(&self) -> Option<&ClusterDescriptor> {
        self.descriptor.as_ref()
    }

    /// Local project layout
    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    /// Kill behaviour for this session
    pub fn kill_policy(&self) -> KillPolicy {
        KillPolicy::for_config(&self.config)
    }

    /// `-f <disk>` server argument
    pub fn default_disk1(&self) -> String {
        self.config.default_disk1()
    }

    /// `-f <disk>,<disk>` server argument
    pub fn default_disk2(&self) -> String {
        self.config.default_disk2()
    }

    fn first_host(&self) -> ClusterResult<&HostRecord> {
        self.hosts.first().ok_or_else(|| {
            ClusterError::ConfigurationError("manifest does not list any hosts".to_string())
        })
    }

    /// Remote working directory. Looked up with `pwd` on the first host the
    /// first time it is needed, then cached for the rest of the session.
    pub async fn remote_wd(&self) -> ClusterResult<String> {
        let wd = self
            .remote_wd
            .get_or_try_init(|| async {
                let host = self.first_host()?;
                let script = Script::new(ShellCommand::new("pwd"));
                let output = self.executor.capture(&host.name, &script).await?;
                if !output.succeeded() {
                    return Err(ClusterError::CommandFailed {
                        command: format!("ssh {} pwd", host.name),
                        status: output.status,
                    });
                }
                let home = output.trimmed_stdout().trim();
                let wd = remote_join(home, &self.config.remote_project_dir);
                debug!("remote working directory is {}", wd);
                Ok::<String, ClusterError>(wd)
            })
            .await?;
        Ok(wd.clone())
    }

    /// `<remote wd>/scripts`
    pub async fn remote_scripts_path(&self) -> ClusterResult<String> {
        Ok(remote_join(&self.remote_wd().await?, "scripts"))
    }

    /// `<remote wd>/<obj dir>`
    pub async fn remote_obj_path(&self) -> ClusterResult<String> {
        Ok(remote_join(&self.remote_wd().await?, self.layout.obj_dir()))
    }

    /// Kill stale processes on every host. Failures are ignored; under DPDK
    /// every configured round runs.
    pub async fn kill_procs(&self) -> ClusterResult<()> {
        info!("Killing existing processes");
        let policy = self.kill_policy();
        let pkill = if policy.sudo {
            ShellCommand::new("sudo").arg("pkill")
        } else {
            ShellCommand::new("pkill")
        };
        let script = Script::new(pkill.arg("-f").arg(self.config.process_pattern.as_str()));

        for attempt in 1..=policy.attempts {
            if policy.attempts > 1 {
                info!(
                    "Killing DPDK {} processes. Try:{}",
                    self.config.process_pattern, attempt
                );
            }
            self.executor.run_all(&script, OnFailure::Ignore).await?;
        }
        Ok(())
    }

    /// Mirror the local tree to every host's working directory
    pub async fn send_code(&self) -> ClusterResult<()> {
        let wd = self.remote_wd().await?;
        let local = format!("{}/", self.config.project_root.display());
        for host in &self.hosts {
            info!("Sending code to {}", host.name);
            self.executor.push(&host.name, &local, &wd, SYNC_EXCLUDES).await?;
        }
        Ok(())
    }

    /// Build on every host, output going to `<remote wd>/build.log`
    pub async fn compile_code(&self, clean: bool) -> ClusterResult<()> {
        info!("Compiling code");
        let wd = self.remote_wd().await?;
        let mut script = Script::new(ShellCommand::new("cd").arg(wd.as_str()));
        if clean {
            script = script.and(ShellCommand::new("make").arg("clean"));
        }
        let make = ShellCommand::new("make")
            .args(self.make_args.iter().cloned())
            .redirect_all(remote_join(&wd, "build.log"));
        self.executor.run_all(&script.and(make), OnFailure::Propagate).await
    }

    /// Create the run's log directory and point `logs/latest` at it
    pub async fn create_log_dir(&self, descriptor: &ClusterDescriptor) -> ClusterResult<()> {
        info!("creating log directories");
        let wd = self.remote_wd().await?;
        let subdir = descriptor.log_subdir();
        let script = Script::new(ShellCommand::new("cd").arg(wd.as_str()))
            .and(ShellCommand::new("mkdir").arg("-p").arg(remote_join(&parent_dir(subdir), "shm")))
            .and(ShellCommand::new("mkdir").arg("-p").arg(subdir))
            .and(ShellCommand::new("rm").args(["-f", "logs/latest"]))
            .and(ShellCommand::new("ln").arg("-sf").arg(base_name(subdir)).arg("logs/latest"));
        self.executor.run_all(&script, OnFailure::Propagate).await
    }

    /// Make the storage devices world-writable
    pub async fn fix_disk_permissions(&self) -> ClusterResult<()> {
        info!("Fixing disk permissions");
        let mut disks = self.config.disks.iter();
        let chmod = |disk: &String| ShellCommand::new("sudo").args(["chmod", "777"]).arg(disk.as_str());
        let first = disks.next().ok_or_else(|| {
            ClusterError::ConfigurationError("At least one disk device is required".to_string())
        })?;
        let script = disks.fold(Script::new(chmod(first)), |script, disk| script.then(chmod(disk)));
        self.executor.run_all(&script, OnFailure::Propagate).await
    }

    /// Prepare every host for a run: kill, push, build, set up logs, fix
    /// disk permissions. Stops at the first failure. Calling it again while
    /// entered re-runs every step.
    pub async fn cluster_enter(&mut self, descriptor: ClusterDescriptor) -> ClusterResult<()> {
        if self.state == SessionState::Exited {
            return Err(ClusterError::InvalidState(
                "cannot enter a session that has already exited".to_string(),
            ));
        }
        self.descriptor = Some(descriptor.clone());

        info!("== Connecting to Emulab via {} ==", self.first_host()?.name);
        self.kill_procs().await?;
        self.send_code().await?;
        self.compile_code(self.config.always_clean).await?;
        self.create_log_dir(&descriptor).await?;
        self.fix_disk_permissions().await?;
        self.state = SessionState::Entered;

        info!("== Emulab Cluster Configured ==");
        info!("If you are running clusterperf, it might take a while!");
        Ok(())
    }

    /// Pull every host's `logs/` into the local `logs/`
    pub async fn collect_logs(&self) -> ClusterResult<()> {
        info!("Collecting logs");
        let remote_logs = format!("{}/", remote_join(&self.remote_wd().await?, "logs"));
        let local_logs = format!("{}/", self.config.project_root.join("logs").display());
        for host in &self.hosts {
            self.executor.pull(&host.name, &remote_logs, &local_logs).await?;
        }
        Ok(())
    }

    /// Finish the session by collecting logs. Remote state is left as is.
    pub async fn cluster_exit(&mut self) -> ClusterResult<()> {
        if self.state != SessionState::Entered {
            return Err(ClusterError::InvalidState(format!(
                "cannot exit a session in state {}",
                self.state
            )));
        }
        info!("== Emulab Cluster Tearing Down ==");
        self.collect_logs().await?;
        self.state = SessionState::Exited;
        info!("== Emulab Cluster Torn Down ==");
        Ok(())
    }
}

/// Refuse DPDK sessions on hosts without enough 1GB hugepages reserved and
/// mounted
async fn check_hugepages(executor: &RemoteExecutor, config: &ClusterConfig) -> ClusterResult<()> {
    let nr_path = format!("/sys/kernel/mm/hugepages/{}/nr_hugepages", config.hugepage_size);
    let read_count = Script::new(ShellCommand::new("cat").arg(nr_path.as_str()));
    let list_mounts = Script::new(ShellCommand::new("mount"));

    for host in executor.hosts() {
        let pages = match executor.capture(&host.name, &read_count).await {
            Ok(output) if output.succeeded() => output.stdout.trim().parse::<u32>().unwrap_or(0),
            Ok(_) => 0,
            Err(e) => {
                debug!("could not read hugepages on {}: {}", host.name, e);
                0
            }
        };
        if pages < config.min_hugepages {
            return Err(ClusterError::PreconditionFailed {
                host: host.name.clone(),
                reason: format!(
                    "At least {} 1GB hugepages required for DPDK. Didn't find enough on {}",
                    config.min_hugepages, host.name
                ),
            });
        }

        let mounted = match executor.capture(&host.name, &list_mounts).await {
            Ok(output) if output.succeeded() => output.stdout.lines().any(|line| {
                line.contains(&config.hugepage_mount_option) && line.contains("hugetlbfs")
            }),
            _ => false,
        };
        if !mounted {
            return Err(ClusterError::PreconditionFailed {
                host: host.name.clone(),
                reason: format!(
                    "DPDK requires 1GB hugepages mounted. Couldn't find any on {}",
                    host.name
                ),
            });
        }
    }
    Ok(())
}
