use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use log::{error, info};

use emulab_cluster::discovery::create_manifest_source;
use emulab_cluster::prelude::*;
use emulab_cluster::Invocation;

#[derive(Parser, Debug)]
#[command(name = "emulab-cluster", version, about = "Deploy and drive a test cluster on an Emulab experiment")]
struct Cli {
    #[command(flatten)]
    session: SessionArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// Build and run with DPDK (requires 1GB hugepages on every host)
    #[arg(long, global = true)]
    dpdk: bool,

    /// Run `make clean` before building
    #[arg(long, global = true)]
    always_clean: bool,

    /// Extra flags passed to make
    #[arg(long, global = true, default_value = "", allow_hyphen_values = true)]
    make_flags: String,

    /// Host holding the manifest when it is not available locally
    #[arg(long, global = true, env = "EMULAB_HOST")]
    control_host: Option<String>,

    /// Host list file for pdsh
    #[arg(long, global = true, default_value = "./.emulab-hosts")]
    hosts_file: PathBuf,

    /// Read the manifest from this file instead of asking the testbed
    #[arg(long, global = true)]
    manifest_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the hosts listed in the manifest
    Hosts {
        /// Only hosts named server*
        #[arg(long)]
        servers_only: bool,
        /// Only hosts named client*
        #[arg(long)]
        others_only: bool,
        /// Print JSON instead of `name ipv4 ordinal` lines
        #[arg(long)]
        json: bool,
    },
    /// Fail unless the manifest lists this host
    CheckHost {
        /// Host name
        name: String,
    },
    /// Deploy, build and prepare log directories on every host
    Enter {
        /// Log subdirectory for this run, relative to the remote tree
        #[arg(long)]
        log_subdir: Option<String>,
    },
    /// Pull logs from every host
    Collect,
    /// Enter, run a local workload, then collect logs
    Run {
        /// Log subdirectory for this run, relative to the remote tree
        #[arg(long)]
        log_subdir: Option<String>,
        /// Workload command and arguments
        #[arg(required = true, last = true)]
        workload: Vec<String>,
    },
}

impl SessionArgs {
    fn config(&self) -> ClusterConfig {
        let mut config = ClusterConfig::from_env()
            .dpdk(self.dpdk)
            .always_clean(self.always_clean)
            .make_flags(self.make_flags.clone())
            .hosts_file(self.hosts_file.clone());
        if let Some(host) = &self.control_host {
            config = config.control_host(host.clone());
        }
        config
    }
}

fn init_logging(hostname: String) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(move |buf, record| writeln!(buf, "[{}] {}", hostname, record.args()))
        .init();
}

fn descriptor(log_subdir: Option<String>) -> ClusterDescriptor {
    match log_subdir {
        Some(dir) => ClusterDescriptor::new(dir),
        None => ClusterDescriptor::timestamped(chrono::Local::now()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.session.config();
    init_logging(config.local_hostname.clone());

    let runner: Arc<dyn ProcessRunner> = Arc::new(LocalProcessRunner::new());
    let manifest_file = cli.session.manifest_file.clone();

    let result = dispatch(cli.command, config, runner, manifest_file).await;
    if let Err(e) = &result {
        if e.downcast_ref::<ClusterError>().map_or(false, ClusterError::is_transport_failure) {
            error!("Remote command failed, check ssh access to every host in the experiment");
        }
    }
    result
}

async fn dispatch(
    command: Command,
    config: ClusterConfig,
    runner: Arc<dyn ProcessRunner>,
    manifest_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    match command {
        Command::Hosts { servers_only, others_only, json } => {
            let filter = RoleFilter::from_flags(servers_only, others_only)?;
            let source = create_manifest_source(&config, runner, manifest_file);
            let hosts = HostDiscovery::new(source).get_hosts_filtered(filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hosts)?);
            } else {
                for host in &hosts {
                    println!("{}", host);
                }
            }
        }
        Command::CheckHost { name } => {
            let source = create_manifest_source(&config, runner, manifest_file);
            HostDiscovery::new(source).check_host(&name).await?;
            info!("{} is part of the experiment", name);
        }
        Command::Enter { log_subdir } => {
            let mut cluster = EmulabCluster::from_config(config, runner, manifest_file).await?;
            cluster.cluster_enter(descriptor(log_subdir)).await?;
        }
        Command::Collect => {
            let cluster = EmulabCluster::from_config(config, runner, manifest_file).await?;
            cluster.collect_logs().await?;
        }
        Command::Run { log_subdir, workload } => {
            let mut cluster = EmulabCluster::from_config(config, runner.clone(), manifest_file).await?;
            cluster.cluster_enter(descriptor(log_subdir)).await?;

            let invocation = Invocation::from_argv(&workload)?;
            info!("Running workload `{}`", invocation);
            let outcome = runner.run(&invocation).await;

            cluster.cluster_exit().await?;

            let status = outcome.with_context(|| format!("workload `{}` did not start", invocation))?;
            if status != 0 {
                error!("workload exited with status {}", status);
                anyhow::bail!("workload `{}` failed with exit status {}", invocation, status);
            }
        }
    }

    Ok(())
}
