use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use emulab_cluster::discovery::{GeniManifestFetcher, HostDiscovery, ManifestSource, StaticManifest};
use emulab_cluster::error::{ClusterError, ClusterResult};
use emulab_cluster::testing::{fail, ok, RecordingRunner, Reply};
use emulab_cluster::topology::{HostRecord, RoleFilter};
use emulab_cluster::ClusterConfig;

// Mixed profile with servers, clients and an unrelated node
fn mixed_manifest() -> String {
    let mut xml = String::from(
        r#"<rspec xmlns="http://www.geni.net/resources/rspec/3" xmlns:emulab="http://www.protogeni.net/resources/rspec/ext/emulab/1" type="manifest">"#,
    );
    let names = ["server-0", "client-0", "server-1", "storage-0", "client-1", "server-2"];
    for (i, name) in names.iter().enumerate() {
        xml.push_str(&format!(
            r#"<node client_id="{name}"><emulab:vnode name="pc{i}"/><host name="{name}" ipv4="10.10.1.{ip}"/></node>"#,
            name = name,
            i = i,
            ip = i + 1
        ));
    }
    xml.push_str(r#"<link client_id="lan"/></rspec>"#);
    xml
}

// Serves a fixed manifest and counts how often it was asked for
struct CountingManifest {
    xml: String,
    fetches: AtomicUsize,
}

#[async_trait]
impl ManifestSource for CountingManifest {
    async fn fetch_manifest(&self) -> ClusterResult<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.xml.clone())
    }
}

fn discovery(xml: String) -> HostDiscovery {
    HostDiscovery::new(Arc::new(StaticManifest::new(xml)))
}

#[tokio::test]
async fn test_ordinals_cover_every_host() {
    let hosts = discovery(mixed_manifest()).get_hosts(false, false).await.unwrap();
    assert_eq!(hosts.len(), 6);
    let ordinals: Vec<usize> = hosts.iter().map(|h| h.ordinal).collect();
    assert_eq!(ordinals, (0..6).collect::<Vec<_>>());
    assert_eq!(hosts[3], HostRecord::new("storage-0", "10.10.1.4", 3));
}

#[tokio::test]
async fn test_role_filters_are_disjoint() {
    let discovery = discovery(mixed_manifest());
    let servers = discovery.get_hosts(true, false).await.unwrap();
    let others = discovery.get_hosts(false, true).await.unwrap();

    let server_names: HashSet<_> = servers.iter().map(|h| h.name.clone()).collect();
    let other_names: HashSet<_> = others.iter().map(|h| h.name.clone()).collect();
    assert!(server_names.is_disjoint(&other_names));

    assert_eq!(
        servers.iter().map(|h| h.ordinal).collect::<Vec<_>>(),
        vec![0, 2, 5]
    );
    assert_eq!(
        others.iter().map(|h| h.ordinal).collect::<Vec<_>>(),
        vec![1, 4]
    );
    assert_eq!(
        discovery.get_hosts_filtered(RoleFilter::All).await.unwrap().len(),
        6
    );
}

#[tokio::test]
async fn test_check_host_never_returns_false() {
    let discovery = discovery(mixed_manifest());
    assert!(discovery.check_host("storage-0").await.unwrap());
    assert!(matches!(
        discovery.check_host("server-9").await,
        Err(ClusterError::HostNotFound(_))
    ));
}

#[tokio::test]
async fn test_every_check_host_call_fetches_again() {
    let source = Arc::new(CountingManifest {
        xml: mixed_manifest(),
        fetches: AtomicUsize::new(0),
    });
    let discovery = HostDiscovery::new(source.clone());

    assert!(discovery.check_host("server-0").await.unwrap());
    assert!(discovery.check_host("server-0").await.unwrap());
    assert!(discovery.check_host("missing").await.is_err());
    assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_check_host_refetches_manifest() {
    let runner = RecordingRunner::new();
    runner.respond("geni-get manifest", ok(&mixed_manifest()));
    let discovery = HostDiscovery::new(Arc::new(GeniManifestFetcher::new(
        &ClusterConfig::default(),
        Arc::new(runner.clone()),
    )));

    discovery.check_host("server-0").await.unwrap();
    discovery.check_host("client-1").await.unwrap();
    assert_eq!(runner.count("geni-get"), 2);
}

#[tokio::test]
async fn test_control_host_fallback_after_missing_agent() {
    let runner = RecordingRunner::new();
    runner.respond_when(|inv| inv.program == "/usr/bin/geni-get", Reply::Missing);
    runner.respond("ssh node-0.exp.emulab.net", ok(&mixed_manifest()));

    let config = ClusterConfig::default().control_host("node-0.exp.emulab.net");
    let discovery = HostDiscovery::new(Arc::new(GeniManifestFetcher::new(
        &config,
        Arc::new(runner.clone()),
    )));
    let hosts = discovery.get_hosts(true, false).await.unwrap();
    assert_eq!(hosts.len(), 3);
}

#[tokio::test]
async fn test_both_paths_failing_propagates() {
    let runner = RecordingRunner::new();
    runner.respond("geni-get", fail(255));

    let config = ClusterConfig::default().control_host("ctl");
    let discovery = HostDiscovery::new(Arc::new(GeniManifestFetcher::new(
        &config,
        Arc::new(runner.clone()),
    )));
    let err = discovery.get_hosts(false, false).await.unwrap_err();
    assert!(err.is_transport_failure());
}
