//! Emulab Cluster Deployment Hooks
//!
//! This crate discovers the hosts of an Emulab/CloudLab experiment from its
//! manifest and drives a test cluster through its lifecycle: killing stale
//! processes, pushing and building code on every host, preparing log
//! directories, and collecting logs afterwards.

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]
#![warn(missing_docs)]

pub mod command;
pub mod config;
pub mod discovery;
pub mod error;
pub mod layout;
pub mod lifecycle;
pub mod process;
pub mod remote;
pub mod topology;

// Recording process runner shared by unit and integration tests
#[doc(hidden)]
pub mod testing;

pub use command::{Script, ShellCommand};
pub use config::ClusterConfig;
pub use discovery::{FileManifest, GeniManifestFetcher, HostDiscovery, ManifestSource, StaticManifest};
pub use error::{ClusterError, ClusterResult};
pub use layout::ProjectLayout;
pub use lifecycle::{ClusterDescriptor, EmulabCluster, KillPolicy, SessionState};
pub use process::{CommandOutput, Invocation, LocalProcessRunner, ProcessRunner};
pub use remote::{ExecutionStrategy, OnFailure, RemoteExecutor};
pub use topology::{HostRecord, HostSet, RoleFilter};

/// Commonly used types
pub mod prelude {
    pub use crate::{
        ClusterConfig, ClusterDescriptor, ClusterError, ClusterResult, EmulabCluster, HostDiscovery,
        HostRecord, HostSet, LocalProcessRunner, ProcessRunner, RoleFilter, SessionState,
    };
}
