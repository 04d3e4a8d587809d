//! Remote execution over ssh, pdsh and rsync.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, info};

use crate::command::{Script, ShellCommand};
use crate::error::{ClusterError, ClusterResult};
use crate::process::{CommandOutput, Invocation, ProcessRunner};
use crate::topology::HostRecord;

/// Fan-out tool used for parallel execution
pub const PARALLEL_TOOL: &str = "pdsh";

/// What to do when a remote command fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailure {
    /// Return the failure to the caller
    Propagate,
    /// Log it and carry on
    Ignore,
}

/// How a command reaches every host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// One ssh per host, in discovery order
    Serial,
    /// A single pdsh call reading hosts from this file
    Parallel {
        /// Host list file, one name per line
        hosts_file: PathBuf,
    },
}

/// Runs commands on the hosts of one session
pub struct RemoteExecutor {
    runner: Arc<dyn ProcessRunner>,
    hosts: Vec<HostRecord>,
    strategy: ExecutionStrategy,
}

impl RemoteExecutor {
    /// Executor over `hosts` using `strategy`. Call
    /// [`RemoteExecutor::prepare`] before the first fan-out.
    pub fn new(runner: Arc<dyn ProcessRunner>, hosts: Vec<HostRecord>, strategy: ExecutionStrategy) -> Self {
        RemoteExecutor {
            runner,
            hosts,
            strategy,
        }
    }

    /// Pick parallel execution when pdsh is installed locally
    pub fn detect_strategy(runner: &dyn ProcessRunner, hosts_file: &Path) -> ExecutionStrategy {
        if runner.program_exists(PARALLEL_TOOL) {
            ExecutionStrategy::Parallel {
                hosts_file: hosts_file.to_path_buf(),
            }
        } else {
            ExecutionStrategy::Serial
        }
    }

    /// Write the host list file when running in parallel. The file is
    /// overwritten, never appended.
    pub async fn prepare(&self) -> ClusterResult<()> {
        if let ExecutionStrategy::Parallel { hosts_file } = &self.strategy {
            let mut contents = String::new();
            for host in &self.hosts {
                contents.push_str(&host.name);
                contents.push('\n');
            }
            tokio::fs::write(hosts_file, contents).await?;
            debug!("wrote {} hosts to {}", self.hosts.len(), hosts_file.display());
        }
        Ok(())
    }

    /// Selected strategy
    pub fn strategy(&self) -> &ExecutionStrategy {
        &self.strategy
    }

    /// Hosts this executor targets
    pub fn hosts(&self) -> &[HostRecord] {
        &self.hosts
    }

    /// Run `script` on one host, returning its exit status
    pub async fn ssh(&self, host: &str, script: &Script, on_failure: OnFailure) -> ClusterResult<i32> {
        let invocation = ssh_invocation(host, script);
        let result = self.runner.run(&invocation).await.and_then(|status| {
            if status == 0 {
                Ok(status)
            } else {
                Err(ClusterError::CommandFailed {
                    command: invocation.to_string(),
                    status,
                })
            }
        });
        settle(result, on_failure)
    }

    /// Run `script` on one host and capture its output. A non-zero exit is
    /// returned as output, not as an error.
    pub async fn capture(&self, host: &str, script: &Script) -> ClusterResult<CommandOutput> {
        self.runner.capture(&ssh_invocation(host, script)).await
    }

    /// Run `script` on every host with the selected strategy
    pub async fn run_all(&self, script: &Script, on_failure: OnFailure) -> ClusterResult<()> {
        match &self.strategy {
            ExecutionStrategy::Serial => self.serial(script, on_failure).await,
            ExecutionStrategy::Parallel { hosts_file } => {
                self.parallel(hosts_file, script, on_failure).await
            }
        }
    }

    async fn serial(&self, script: &Script, on_failure: OnFailure) -> ClusterResult<()> {
        for host in &self.hosts {
            info!("Running on {}", host.name);
            self.ssh(&host.name, script, on_failure).await?;
        }
        Ok(())
    }

    async fn parallel(&self, hosts_file: &Path, script: &Script, on_failure: OnFailure) -> ClusterResult<()> {
        info!("Running parallely on all hosts");
        let invocation = Invocation::new(PARALLEL_TOOL)
            .arg("-w")
            .arg(format!("^{}", hosts_file.display()))
            .arg(script.render());
        let result = self.runner.run(&invocation).await.and_then(|status| {
            if status == 0 {
                Ok(status)
            } else {
                Err(ClusterError::CommandFailed {
                    command: invocation.to_string(),
                    status,
                })
            }
        });
        settle(result, on_failure).map(|_| ())
    }

    /// Whether `program` is available on `host`
    pub async fn remote_command_exists(&self, host: &str, program: &str) -> bool {
        let probe = Script::new(ShellCommand::new("type").arg(program).redirect_all("/dev/null"));
        matches!(self.ssh(host, &probe, OnFailure::Ignore).await, Ok(0))
    }

    /// Mirror the local directory `local` to `host:remote/`
    pub async fn push(&self, host: &str, local: &str, remote: &str, excludes: &[&str]) -> ClusterResult<()> {
        let mut invocation = Invocation::new("rsync").args(["-ave", "ssh"]);
        for pattern in excludes {
            invocation = invocation.arg("--exclude").arg(*pattern);
        }
        let invocation = invocation
            .arg(local)
            .arg(format!("{}:{}/", host, remote))
            .quiet();
        self.checked(&invocation).await
    }

    /// Mirror `host:remote` into the local directory `local`
    pub async fn pull(&self, host: &str, remote: &str, local: &str) -> ClusterResult<()> {
        let invocation = Invocation::new("rsync")
            .args(["-ave", "ssh"])
            .arg(format!("{}:{}", host, remote))
            .arg(local)
            .quiet();
        self.checked(&invocation).await
    }

    async fn checked(&self, invocation: &Invocation) -> ClusterResult<()> {
        let status = self.runner.run(invocation).await?;
        if status == 0 {
            Ok(())
        } else {
            Err(ClusterError::CommandFailed {
                command: invocation.to_string(),
                status,
            })
        }
    }
}

fn ssh_invocation(host: &str, script: &Script) -> Invocation {
    Invocation::new("ssh").arg(host).arg(script.render())
}

fn settle(result: ClusterResult<i32>, on_failure: OnFailure) -> ClusterResult<i32> {
    match (result, on_failure) {
        (Ok(status), _) => Ok(status),
        (Err(e), OnFailure::Propagate) => Err(e),
        (Err(ClusterError::CommandFailed { status, .. }), OnFailure::Ignore) => {
            debug!("ignoring exit status {}", status);
            Ok(status)
        }
        (Err(e), OnFailure::Ignore) => {
            debug!("ignoring failure: {}", e);
            Ok(-1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fail, RecordingRunner, Reply};

    fn hosts() -> Vec<HostRecord> {
        vec![
            HostRecord::new("server-1", "10.0.0.1", 0),
            HostRecord::new("client-1", "10.0.0.2", 1),
        ]
    }

    fn script() -> Script {
        Script::new(ShellCommand::new("pkill").args(["-f", "RAMCloud"]))
    }

    #[tokio::test]
    async fn test_serial_runs_once_per_host_in_order() {
        let runner = RecordingRunner::new();
        let executor = RemoteExecutor::new(Arc::new(runner.clone()), hosts(), ExecutionStrategy::Serial);

        executor.run_all(&script(), OnFailure::Propagate).await.unwrap();
        assert_eq!(
            runner.rendered_calls(),
            vec![
                "ssh server-1 pkill -f RAMCloud".to_string(),
                "ssh client-1 pkill -f RAMCloud".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_parallel_writes_hosts_file_and_fans_out_once() {
        let dir = tempfile::tempdir().unwrap();
        let hosts_file = dir.path().join(".emulab-hosts");
        std::fs::write(&hosts_file, "stale\nstale\nstale\n").unwrap();

        let runner = RecordingRunner::new().with_program("pdsh");
        let strategy = RemoteExecutor::detect_strategy(&runner, &hosts_file);
        let executor = RemoteExecutor::new(Arc::new(runner.clone()), hosts(), strategy);
        executor.prepare().await.unwrap();

        assert_eq!(std::fs::read_to_string(&hosts_file).unwrap(), "server-1\nclient-1\n");

        executor.run_all(&script(), OnFailure::Propagate).await.unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "pdsh");
        assert_eq!(
            calls[0].args,
            vec![
                "-w".to_string(),
                format!("^{}", hosts_file.display()),
                "pkill -f RAMCloud".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_serial_without_pdsh() {
        let runner = RecordingRunner::new();
        let strategy = RemoteExecutor::detect_strategy(&runner, Path::new("./.emulab-hosts"));
        assert_eq!(strategy, ExecutionStrategy::Serial);
    }

    #[tokio::test]
    async fn test_checked_failure_stops_serial_loop() {
        let runner = RecordingRunner::new();
        runner.respond("ssh server-1", fail(255));
        let executor = RemoteExecutor::new(Arc::new(runner.clone()), hosts(), ExecutionStrategy::Serial);

        let result = executor.run_all(&script(), OnFailure::Propagate).await;
        assert!(matches!(result, Err(ClusterError::CommandFailed { status: 255, .. })));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unchecked_returns_status() {
        let runner = RecordingRunner::new();
        runner.respond("ssh server-1", fail(1));
        let executor = RemoteExecutor::new(Arc::new(runner.clone()), hosts(), ExecutionStrategy::Serial);

        let status = executor.ssh("server-1", &script(), OnFailure::Ignore).await.unwrap();
        assert_eq!(status, 1);

        executor.run_all(&script(), OnFailure::Ignore).await.unwrap();
        assert_eq!(runner.count("pkill"), 3);
    }

    #[tokio::test]
    async fn test_spawn_failure_follows_policy() {
        let runner = RecordingRunner::new();
        runner.respond("ssh server-1", Reply::Missing);
        let executor = RemoteExecutor::new(Arc::new(runner.clone()), hosts(), ExecutionStrategy::Serial);

        let status = executor.ssh("server-1", &script(), OnFailure::Ignore).await.unwrap();
        assert_eq!(status, -1);

        let result = executor.ssh("server-1", &script(), OnFailure::Propagate).await;
        assert!(matches!(result, Err(ClusterError::SpawnError { .. })));
    }

    #[tokio::test]
    async fn test_parallel_failure_follows_policy() {
        let runner = RecordingRunner::new();
        runner.respond("pdsh", fail(1));
        let strategy = ExecutionStrategy::Parallel {
            hosts_file: PathBuf::from("./.emulab-hosts"),
        };
        let executor = RemoteExecutor::new(Arc::new(runner.clone()), hosts(), strategy);

        executor.run_all(&script(), OnFailure::Ignore).await.unwrap();
        let result = executor.run_all(&script(), OnFailure::Propagate).await;
        assert!(matches!(result, Err(ClusterError::CommandFailed { status: 1, .. })));
        assert_eq!(runner.count("pdsh"), 2);
    }

    #[tokio::test]
    async fn test_remote_command_probe() {
        let runner = RecordingRunner::new();
        runner.respond("ssh client-1 type numactl", fail(1));
        let executor = RemoteExecutor::new(Arc::new(runner.clone()), hosts(), ExecutionStrategy::Serial);

        assert!(executor.remote_command_exists("server-1", "numactl").await);
        assert!(!executor.remote_command_exists("client-1", "numactl").await);
        assert_eq!(
            runner.rendered_calls()[0],
            "ssh server-1 type numactl > /dev/null 2>&1"
        );
    }

    #[tokio::test]
    async fn test_push_and_pull_arguments() {
        let runner = RecordingRunner::new();
        let executor = RemoteExecutor::new(Arc::new(runner.clone()), hosts(), ExecutionStrategy::Serial);

        executor
            .push("server-1", "./", "/users/me/RAMCloud", &["logs/*", "docs/*"])
            .await
            .unwrap();
        executor
            .pull("server-1", "/users/me/RAMCloud/logs/", "logs/")
            .await
            .unwrap();

        assert_eq!(
            runner.rendered_calls(),
            vec![
                "rsync -ave ssh --exclude logs/* --exclude docs/* ./ server-1:/users/me/RAMCloud/".to_string(),
                "rsync -ave ssh server-1:/users/me/RAMCloud/logs/ logs/".to_string(),
            ]
        );
        assert!(runner.calls().iter().all(|c| c.stdout == crate::process::StdoutMode::Null));
    }
}
