//! Manifest retrieval and host discovery.

use std::path::PathBuf;
use std::sync::Arc;
use async_trait::async_trait;
use log::{info, warn};

use crate::config::{ClusterConfig, CONTROL_HOST_ENV};
use crate::error::{ClusterError, ClusterResult};
use crate::process::{Invocation, ProcessRunner};
use crate::topology::{HostRecord, HostSet, RoleFilter};

/// Something that can produce the experiment manifest
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetch the raw manifest XML
    async fn fetch_manifest(&self) -> ClusterResult<String>;
}

/// Asks the testbed agent for the manifest, locally first and then over
/// ssh on the control host
pub struct GeniManifestFetcher {
    runner: Arc<dyn ProcessRunner>,
    command: Vec<String>,
    control_host: Option<String>,
}

impl GeniManifestFetcher {
    /// Create a fetcher from the session configuration
    pub fn new(config: &ClusterConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        GeniManifestFetcher {
            runner,
            command: config.manifest_command.clone(),
            control_host: config.control_host.clone(),
        }
    }

    async fn fetch_local(&self) -> ClusterResult<String> {
        let invocation = Invocation::from_argv(&self.command)?;
        let output = self.runner.capture(&invocation).await?.check(&invocation)?;
        Ok(output.trimmed_stdout().to_string())
    }

    async fn fetch_remote(&self, host: &str) -> ClusterResult<String> {
        let invocation = Invocation::new("ssh").arg(host).args(self.command.iter().cloned());
        let output = self.runner.capture(&invocation).await?.check(&invocation)?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl ManifestSource for GeniManifestFetcher {
    async fn fetch_manifest(&self) -> ClusterResult<String> {
        info!("trying to get manifest locally");
        match self.fetch_local().await {
            Ok(manifest) => return Ok(manifest),
            Err(e) => log::debug!("local manifest unavailable: {}", e),
        }

        info!("trying {} to get manifest", CONTROL_HOST_ENV);
        let host = match &self.control_host {
            Some(host) => host,
            None => {
                warn!("'{}' not exported", CONTROL_HOST_ENV);
                return Err(ClusterError::ConfigurationError(format!(
                    "manifest not available locally and {} is not set",
                    CONTROL_HOST_ENV
                )));
            }
        };
        self.fetch_remote(host).await
    }
}

/// Manifest read from a local file
pub struct FileManifest {
    path: PathBuf,
}

impl FileManifest {
    /// Read the manifest from `path` on every fetch
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileManifest { path: path.into() }
    }
}

#[async_trait]
impl ManifestSource for FileManifest {
    async fn fetch_manifest(&self) -> ClusterResult<String> {
        info!("reading manifest from {}", self.path.display());
        Ok(tokio::fs::read_to_string(&self.path).await?)
    }
}

/// Manifest held in memory
pub struct StaticManifest {
    xml: String,
}

impl StaticManifest {
    /// Serve `xml` on every fetch
    pub fn new(xml: impl Into<String>) -> Self {
        StaticManifest { xml: xml.into() }
    }
}

#[async_trait]
impl ManifestSource for StaticManifest {
    async fn fetch_manifest(&self) -> ClusterResult<String> {
        Ok(self.xml.clone())
    }
}

/// Discovers hosts from a manifest source
pub struct HostDiscovery {
    source: Arc<dyn ManifestSource>,
}

impl HostDiscovery {
    /// Create a discovery service over `source`
    pub fn new(source: Arc<dyn ManifestSource>) -> Self {
        HostDiscovery { source }
    }

    /// Fetch and parse the full host set
    pub async fn host_set(&self) -> ClusterResult<HostSet> {
        let manifest = self.source.fetch_manifest().await?;
        HostSet::from_manifest(&manifest)
    }

    /// Hosts from the manifest, optionally restricted to one role.
    /// Conflicting switches are rejected before anything is fetched.
    pub async fn get_hosts(&self, servers_only: bool, others_only: bool) -> ClusterResult<Vec<HostRecord>> {
        let filter = RoleFilter::from_flags(servers_only, others_only)?;
        self.get_hosts_filtered(filter).await
    }

    /// Hosts passing `filter`
    pub async fn get_hosts_filtered(&self, filter: RoleFilter) -> ClusterResult<Vec<HostRecord>> {
        Ok(self.host_set().await?.filtered(filter))
    }

    /// Re-fetch the manifest and confirm `name` is one of its hosts
    pub async fn check_host(&self, name: &str) -> ClusterResult<bool> {
        if self.host_set().await?.contains(name) {
            Ok(true)
        } else {
            Err(ClusterError::HostNotFound(name.to_string()))
        }
    }
}

/// Pick the manifest source for a session: a local file when given,
/// otherwise the testbed agent
pub fn create_manifest_source(
    config: &ClusterConfig,
    runner: Arc<dyn ProcessRunner>,
    manifest_file: Option<PathBuf>,
) -> Arc<dyn ManifestSource> {
    match manifest_file {
        Some(path) => Arc::new(FileManifest::new(path)),
        None => Arc::new(GeniManifestFetcher::new(config, runner)),
    }
}
