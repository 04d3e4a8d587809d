//! Configuration module for Emulab cluster sessions.

use std::path::PathBuf;
use crate::error::{ClusterError, ClusterResult};

/// Environment variable naming the control host used when the manifest
/// is not available locally
pub const CONTROL_HOST_ENV: &str = "EMULAB_HOST";

/// Testbed agent command that prints the experiment manifest
pub const DEFAULT_MANIFEST_COMMAND: &[&str] = &["/usr/bin/geni-get", "manifest"];

/// Host list consumed by pdsh's `-w ^file` syntax
pub const DEFAULT_HOSTS_FILE: &str = "./.emulab-hosts";

/// Directory under the remote home that receives the working tree
pub const DEFAULT_REMOTE_PROJECT_DIR: &str = "RAMCloud";

/// Pattern passed to `pkill -f` when clearing stale processes
pub const DEFAULT_PROCESS_PATTERN: &str = "RAMCloud";

/// DPDK checkout referenced by the build flags in DPDK mode
pub const DEFAULT_DPDK_DIR: &str = "/local/RAMCloud/deps/dpdk-16.07";

/// Disks used for segment replicas
pub const DEFAULT_DISKS: &[&str] = &["/dev/sda4", "/dev/sdb"];

/// Minimum number of reserved 1GB hugepages for DPDK
pub const DEFAULT_MIN_HUGEPAGES: u32 = 2;

/// sysfs directory name for 1GB hugepages
pub const DEFAULT_HUGEPAGE_SIZE: &str = "hugepages-1048576kB";

/// Mount option identifying a 1GB hugetlbfs mount
pub const DEFAULT_HUGEPAGE_MOUNT_OPTION: &str = "pagesize=1G";

/// DPDK processes tend to survive the first pkill
pub const DEFAULT_DPDK_KILL_ATTEMPTS: u32 = 3;

/// Session configuration builder
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Build and run against DPDK instead of the kernel network stack
    pub dpdk: bool,

    /// Run `make clean` before every build
    pub always_clean: bool,

    /// Extra flags handed to make
    pub make_flags: String,

    /// DPDK dependency directory
    pub dpdk_dir: String,

    /// Host to ssh into when the manifest is not available locally
    pub control_host: Option<String>,

    /// Hostname of the machine running the tool, used as log prefix
    pub local_hostname: String,

    /// Program and arguments printing the manifest
    pub manifest_command: Vec<String>,

    /// Host list file for the fan-out tool
    pub hosts_file: PathBuf,

    /// Local working tree that is pushed to every host
    pub project_root: PathBuf,

    /// Directory name of the working tree under the remote home
    pub remote_project_dir: String,

    /// Pattern for killing stale processes
    pub process_pattern: String,

    /// Disk devices made world-writable on every host
    pub disks: Vec<String>,

    /// Minimum reserved hugepages in DPDK mode
    pub min_hugepages: u32,

    /// sysfs hugepage size directory
    pub hugepage_size: String,

    /// Mount option that must appear on a hugetlbfs mount
    pub hugepage_mount_option: String,

    /// Kill attempts in DPDK mode
    pub dpdk_kill_attempts: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            dpdk: false,
            always_clean: false,
            make_flags: String::new(),
            dpdk_dir: DEFAULT_DPDK_DIR.to_string(),
            control_host: None,
            local_hostname: "localhost".to_string(),
            manifest_command: DEFAULT_MANIFEST_COMMAND.iter().map(|s| s.to_string()).collect(),
            hosts_file: PathBuf::from(DEFAULT_HOSTS_FILE),
            project_root: PathBuf::from("."),
            remote_project_dir: DEFAULT_REMOTE_PROJECT_DIR.to_string(),
            process_pattern: DEFAULT_PROCESS_PATTERN.to_string(),
            disks: DEFAULT_DISKS.iter().map(|s| s.to_string()).collect(),
            min_hugepages: DEFAULT_MIN_HUGEPAGES,
            hugepage_size: DEFAULT_HUGEPAGE_SIZE.to_string(),
            hugepage_mount_option: DEFAULT_HUGEPAGE_MOUNT_OPTION.to_string(),
            dpdk_kill_attempts: DEFAULT_DPDK_KILL_ATTEMPTS,
        }
    }
}

impl ClusterConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Default configuration with the control host and hostname taken from
    /// the process environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.control_host = std::env::var(CONTROL_HOST_ENV).ok().filter(|h| !h.is_empty());
        config.local_hostname = gethostname::gethostname().to_string_lossy().into_owned();
        config
    }

    /// Enable or disable DPDK mode
    pub fn dpdk(mut self, dpdk: bool) -> Self {
        self.dpdk = dpdk;
        self
    }

    /// Clean before every build
    pub fn always_clean(mut self, clean: bool) -> Self {
        self.always_clean = clean;
        self
    }

    /// Set make flags
    pub fn make_flags(mut self, flags: impl Into<String>) -> Self {
        self.make_flags = flags.into();
        self
    }

    /// Set the DPDK dependency directory
    pub fn dpdk_dir(mut self, dir: impl Into<String>) -> Self {
        self.dpdk_dir = dir.into();
        self
    }

    /// Set the control host
    pub fn control_host(mut self, host: impl Into<String>) -> Self {
        self.control_host = Some(host.into());
        self
    }

    /// Set the local hostname
    pub fn local_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.local_hostname = hostname.into();
        self
    }

    /// Set the manifest command
    pub fn manifest_command(mut self, command: Vec<String>) -> Self {
        self.manifest_command = command;
        self
    }

    /// Set the host list file
    pub fn hosts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.hosts_file = path.into();
        self
    }

    /// Set the local working tree
    pub fn project_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_root = path.into();
        self
    }

    /// Set the remote project directory name
    pub fn remote_project_dir(mut self, dir: impl Into<String>) -> Self {
        self.remote_project_dir = dir.into();
        self
    }

    /// Set the kill pattern
    pub fn process_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.process_pattern = pattern.into();
        self
    }

    /// Set the disk devices
    pub fn disks(mut self, disks: Vec<String>) -> Self {
        self.disks = disks;
        self
    }

    /// Set the minimum hugepage reservation
    pub fn min_hugepages(mut self, pages: u32) -> Self {
        self.min_hugepages = pages;
        self
    }

    /// Set the number of kill attempts in DPDK mode
    pub fn dpdk_kill_attempts(mut self, attempts: u32) -> Self {
        self.dpdk_kill_attempts = attempts;
        self
    }

    /// Flags passed to make, with the DPDK prefix in DPDK mode
    pub fn build_flags(&self) -> String {
        if self.dpdk {
            format!("DPDK=yes DPDK_DIR={} {}", self.dpdk_dir, self.make_flags)
                .trim_end()
                .to_string()
        } else {
            self.make_flags.clone()
        }
    }

    /// Arguments passed to make, split the way a shell would split
    /// [`build_flags`](Self::build_flags)
    pub fn make_args(&self) -> ClusterResult<Vec<String>> {
        let mut args = Vec::new();
        if self.dpdk {
            args.push("DPDK=yes".to_string());
            args.push(format!("DPDK_DIR={}", self.dpdk_dir));
        }
        let flags = shell_words::split(&self.make_flags).map_err(|e| {
            ClusterError::ConfigurationError(format!("Invalid make flags `{}`: {}", self.make_flags, e))
        })?;
        args.extend(flags);
        Ok(args)
    }

    /// `-f <disk>` argument for servers using a single disk
    pub fn default_disk1(&self) -> String {
        match self.disks.first() {
            Some(disk) => format!("-f {}", disk),
            None => String::new(),
        }
    }

    /// `-f <disk>,<disk>` argument for servers using two disks
    pub fn default_disk2(&self) -> String {
        let disks: Vec<&str> = self.disks.iter().take(2).map(String::as_str).collect();
        if disks.is_empty() {
            String::new()
        } else {
            format!("-f {}", disks.join(","))
        }
    }

    /// Validate and build the configuration
    pub fn build(self) -> ClusterResult<Self> {
        if self.manifest_command.is_empty() {
            return Err(ClusterError::ConfigurationError(
                "Manifest command must not be empty".to_string(),
            ));
        }

        if self.remote_project_dir.is_empty() {
            return Err(ClusterError::ConfigurationError(
                "Remote project directory must not be empty".to_string(),
            ));
        }

        if self.disks.is_empty() {
            return Err(ClusterError::ConfigurationError(
                "At least one disk device is required".to_string(),
            ));
        }

        if self.dpdk && self.dpdk_kill_attempts == 0 {
            return Err(ClusterError::ConfigurationError(
                "DPDK mode requires at least one kill attempt".to_string(),
            ));
        }

        self.make_args()?;

        if self.process_pattern.is_empty() {
            return Err(ClusterError::ConfigurationError(
                "Process pattern must not be empty".to_string(),
            ));
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert!(!config.dpdk);
        assert!(!config.always_clean);
        assert_eq!(config.hosts_file, PathBuf::from(DEFAULT_HOSTS_FILE));
        assert_eq!(config.manifest_command, vec!["/usr/bin/geni-get", "manifest"]);
        assert_eq!(config.min_hugepages, 2);
    }

    #[test]
    fn test_make_args_keep_quoted_values_together() {
        let config = ClusterConfig::new().make_flags("-j4 EXTRACXXFLAGS='-O2 -g'");
        assert_eq!(
            config.make_args().unwrap(),
            vec!["-j4".to_string(), "EXTRACXXFLAGS=-O2 -g".to_string()]
        );

        let config = config.dpdk(true);
        assert_eq!(
            config.make_args().unwrap(),
            vec![
                "DPDK=yes".to_string(),
                "DPDK_DIR=/local/RAMCloud/deps/dpdk-16.07".to_string(),
                "-j4".to_string(),
                "EXTRACXXFLAGS=-O2 -g".to_string(),
            ]
        );
    }

    #[test]
    fn test_unbalanced_make_flags_rejected() {
        let result = ClusterConfig::new().make_flags("CXXFLAGS='-O2").build();
        assert!(matches!(result, Err(ClusterError::ConfigurationError(_))));
    }

    #[test]
    fn test_build_flags_plain() {
        let config = ClusterConfig::new().make_flags("-j12 DEBUG=no");
        assert_eq!(config.build_flags(), "-j12 DEBUG=no");
    }

    #[test]
    fn test_build_flags_dpdk() {
        let config = ClusterConfig::new().dpdk(true).make_flags("-j12");
        assert_eq!(
            config.build_flags(),
            "DPDK=yes DPDK_DIR=/local/RAMCloud/deps/dpdk-16.07 -j12"
        );

        let config = ClusterConfig::new().dpdk(true);
        assert_eq!(config.build_flags(), "DPDK=yes DPDK_DIR=/local/RAMCloud/deps/dpdk-16.07");
    }

    #[test]
    fn test_default_disk_arguments() {
        let config = ClusterConfig::default();
        assert_eq!(config.default_disk1(), "-f /dev/sda4");
        assert_eq!(config.default_disk2(), "-f /dev/sda4,/dev/sdb");
    }

    #[test]
    fn test_empty_disks_rejected() {
        let result = ClusterConfig::new().disks(Vec::new()).build();
        match result {
            Err(ClusterError::ConfigurationError(msg)) => assert!(msg.contains("disk")),
            other => panic!("Expected ConfigurationError, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_kill_attempts_only_matters_for_dpdk() {
        assert!(ClusterConfig::new().dpdk_kill_attempts(0).build().is_ok());
        assert!(ClusterConfig::new().dpdk(true).dpdk_kill_attempts(0).build().is_err());
    }

    #[test]
    fn test_empty_manifest_command_rejected() {
        assert!(ClusterConfig::new().manifest_command(Vec::new()).build().is_err());
    }
}
