//! Host records and manifest parsing.

use std::fmt;
use serde::Serialize;

use crate::error::{ClusterError, ClusterResult};

/// Name prefix of hosts running servers
pub const SERVER_PREFIX: &str = "server";

/// Name prefix of every other host in mixed profiles
pub const CLIENT_PREFIX: &str = "client";

/// A host discovered from the manifest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HostRecord {
    /// Hostname used for ssh
    pub name: String,
    /// Experiment network address
    pub ipv4: String,
    /// Zero-based position in manifest order
    pub ordinal: usize,
}

impl HostRecord {
    /// Create a new host record
    pub fn new(name: impl Into<String>, ipv4: impl Into<String>, ordinal: usize) -> Self {
        HostRecord {
            name: name.into(),
            ipv4: ipv4.into(),
            ordinal,
        }
    }

    /// Whether this host runs servers
    pub fn is_server(&self) -> bool {
        self.name.starts_with(SERVER_PREFIX)
    }

    /// Whether this host is a client in a mixed profile
    pub fn is_client(&self) -> bool {
        self.name.starts_with(CLIENT_PREFIX)
    }
}

impl fmt::Display for HostRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.ipv4, self.ordinal)
    }
}

/// Which hosts to keep after discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoleFilter {
    /// Every host
    #[default]
    All,
    /// Hosts named `server*`
    ServersOnly,
    /// Hosts named `client*`
    OthersOnly,
}

impl RoleFilter {
    /// Build a filter from the two boolean switches. Asking for both is a
    /// usage error.
    pub fn from_flags(servers_only: bool, others_only: bool) -> ClusterResult<Self> {
        match (servers_only, others_only) {
            (true, true) => Err(ClusterError::UsageError(
                "Can't use serversOnly and othersOnly together".to_string(),
            )),
            (true, false) => Ok(RoleFilter::ServersOnly),
            (false, true) => Ok(RoleFilter::OthersOnly),
            (false, false) => Ok(RoleFilter::All),
        }
    }

    /// Whether `host` passes this filter
    pub fn matches(&self, host: &HostRecord) -> bool {
        match self {
            RoleFilter::All => true,
            RoleFilter::ServersOnly => host.is_server(),
            RoleFilter::OthersOnly => host.is_client(),
        }
    }

    /// Keep matching hosts, preserving order and ordinals
    pub fn apply(&self, hosts: &[HostRecord]) -> Vec<HostRecord> {
        hosts.iter().filter(|h| self.matches(h)).cloned().collect()
    }
}

/// Ordered hosts of one experiment
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostSet {
    hosts: Vec<HostRecord>,
}

impl HostSet {
    /// Wrap hosts in discovery order
    pub fn new(hosts: Vec<HostRecord>) -> Self {
        HostSet { hosts }
    }

    /// Parse a manifest into a host set
    pub fn from_manifest(xml: &str) -> ClusterResult<Self> {
        parse_manifest(xml).map(HostSet::new)
    }

    /// All hosts
    pub fn hosts(&self) -> &[HostRecord] {
        &self.hosts
    }

    /// Hosts passing `filter`
    pub fn filtered(&self, filter: RoleFilter) -> Vec<HostRecord> {
        filter.apply(&self.hosts)
    }

    /// Server hosts
    pub fn servers(&self) -> Vec<HostRecord> {
        self.filtered(RoleFilter::ServersOnly)
    }

    /// Client hosts
    pub fn others(&self) -> Vec<HostRecord> {
        self.filtered(RoleFilter::OthersOnly)
    }

    /// Host names in order
    pub fn names(&self) -> Vec<&str> {
        self.hosts.iter().map(|h| h.name.as_str()).collect()
    }

    /// Look a host up by name
    pub fn get(&self, name: &str) -> Option<&HostRecord> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Whether a host with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// First host in discovery order
    pub fn first(&self) -> Option<&HostRecord> {
        self.hosts.first()
    }

    /// Number of hosts
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether no hosts were discovered
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl<'a> IntoIterator for &'a HostSet {
    type Item = &'a HostRecord;
    type IntoIter = std::slice::Iter<'a, HostRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.hosts.iter()
    }
}

/// Extract host records from a manifest.
///
/// Looks at the root's children whose tag ends in `node` and, inside each,
/// at children whose tag ends in `host`. Each such element must carry
/// `name` and `ipv4`. Ordinals count up in document order.
pub fn parse_manifest(xml: &str) -> ClusterResult<Vec<HostRecord>> {
    let doc = roxmltree::Document::parse(xml)?;
    let mut hosts = Vec::new();

    for node in doc.root_element().children().filter(|n| n.is_element()) {
        if !node.tag_name().name().ends_with("node") {
            continue;
        }
        for host in node.children().filter(|n| n.is_element()) {
            if !host.tag_name().name().ends_with("host") {
                continue;
            }
            let ordinal = hosts.len();
            let name = required_attribute(&host, "name", ordinal)?;
            let ipv4 = required_attribute(&host, "ipv4", ordinal)?;
            hosts.push(HostRecord::new(name, ipv4, ordinal));
        }
    }

    Ok(hosts)
}

fn required_attribute<'a>(
    element: &roxmltree::Node<'a, '_>,
    attr: &str,
    ordinal: usize,
) -> ClusterResult<&'a str> {
    element.attribute(attr).ok_or_else(|| {
        ClusterError::ManifestError(format!(
            "<{}> element #{} has no `{}` attribute",
            element.tag_name().name(),
            ordinal,
            attr
        ))
    })
}
