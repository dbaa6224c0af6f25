//! Host and node port allocation.
//!
//! Ports are claimed cluster-wide: every namespace's pods and services are
//! inspected, not just the environment's own. There is no lock; a concurrent
//! allocation can race us, in which case the deploy fails loudly and the next
//! run picks again.

use std::collections::HashSet;
use std::fmt;

use anyhow::{bail, Context, Result};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams};
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, info};

use super::cluster::ClusterHandle;
use super::settings::{FixedPorts, PortSettings};

/// Inclusive port range
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Ports an environment's node-local daemons and registry service listen on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedPorts {
    pub ws_daemon: u16,
    pub registry_facade: u16,
    pub registry_node_port: u16,
}

impl From<FixedPorts> for ReservedPorts {
    fn from(ports: FixedPorts) -> Self {
        Self {
            ws_daemon: ports.ws_daemon,
            registry_facade: ports.registry_facade,
            registry_node_port: ports.registry_node_port,
        }
    }
}

/// Every host port declared by a container of the given pods
pub fn host_ports(pods: &[Pod]) -> HashSet<u16> {
    pods.iter()
        .filter_map(|pod| pod.spec.as_ref())
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|container| container.ports.iter().flatten())
        .filter_map(|port| port.host_port)
        .filter_map(|port| u16::try_from(port).ok())
        .filter(|port| *port != 0)
        .collect()
}

/// Every node port claimed by the given services
pub fn node_ports(services: &[Service]) -> HashSet<u16> {
    services
        .iter()
        .filter_map(|svc| svc.spec.as_ref())
        .flat_map(|spec| spec.ports.iter().flatten())
        .filter_map(|port| port.node_port)
        .filter_map(|port| u16::try_from(port).ok())
        .filter(|port| *port != 0)
        .collect()
}

/// Draw one free port per range, uniformly at random.
///
/// Each pick is added to `reserved` before the next draw, so ranges that
/// overlap still yield distinct ports. Fails when a range has nothing left.
pub fn pick_free<R: Rng>(
    ranges: &[PortRange],
    reserved: &mut HashSet<u16>,
    rng: &mut R,
) -> Result<Vec<u16>> {
    let mut picked = Vec::with_capacity(ranges.len());

    for range in ranges {
        if range.is_empty() {
            bail!("port range {} is empty", range);
        }
        let taken = reserved.iter().filter(|p| range.contains(**p)).count();
        if taken >= range.len() {
            bail!("all {} ports in range {} are in use", range.len(), range);
        }

        let port = loop {
            let candidate = rng.gen_range(range.start..=range.end);
            if !reserved.contains(&candidate) {
                break candidate;
            }
        };
        reserved.insert(port);
        picked.push(port);
    }

    Ok(picked)
}

/// Snapshot of host and node ports in use across all namespaces.
/// The two listings run concurrently.
pub async fn ports_in_use(cluster: &ClusterHandle) -> Result<HashSet<u16>> {
    let pods: Api<Pod> = Api::all(cluster.client());
    let services: Api<Service> = Api::all(cluster.client());
    let lp = ListParams::default();

    let (pods, services) = tokio::join!(pods.list(&lp), services.list(&lp));
    let pods = pods.with_context(|| format!("Failed to list pods on {}", cluster))?;
    let services = services.with_context(|| format!("Failed to list services on {}", cluster))?;

    let mut reserved = host_ports(&pods.items);
    reserved.extend(node_ports(&services.items));
    debug!(cluster = %cluster, count = reserved.len(), "Collected ports in use");
    Ok(reserved)
}

/// Pick one free port per range on the cluster
pub async fn allocate(cluster: &ClusterHandle, ranges: &[PortRange]) -> Result<Vec<u16>> {
    let mut reserved = ports_in_use(cluster).await?;
    pick_free(ranges, &mut reserved, &mut rand::thread_rng())
}

/// Ports for an environment on the shared cluster.
///
/// Reuses what the live DaemonSets and Service in `namespace` already
/// declare, so redeploying a branch keeps its ports. Falls back to a fresh
/// allocation when any of them is missing.
pub async fn allocate_for_environment(
    cluster: &ClusterHandle,
    namespace: &str,
    settings: &PortSettings,
) -> Result<ReservedPorts> {
    if let Some(ports) = existing_ports(cluster, namespace, settings).await? {
        info!(namespace = %namespace, ?ports, "Reusing ports of the previous deployment");
        return Ok(ports);
    }

    let picked = allocate(
        cluster,
        &[
            settings.ws_daemon_range,
            settings.registry_facade_range,
            settings.registry_node_port_range,
        ],
    )
    .await?;

    let ports = ReservedPorts {
        ws_daemon: picked[0],
        registry_facade: picked[1],
        registry_node_port: picked[2],
    };
    info!(namespace = %namespace, ?ports, "Allocated new ports");
    Ok(ports)
}

async fn existing_ports(
    cluster: &ClusterHandle,
    namespace: &str,
    settings: &PortSettings,
) -> Result<Option<ReservedPorts>> {
    let daemonsets: Api<DaemonSet> = Api::namespaced(cluster.client(), namespace);
    let services: Api<Service> = Api::namespaced(cluster.client(), namespace);

    let ws_daemon = daemonsets
        .get_opt(&settings.ws_daemon_daemonset)
        .await?
        .as_ref()
        .and_then(daemonset_host_port);
    let registry_facade = daemonsets
        .get_opt(&settings.registry_facade_daemonset)
        .await?
        .as_ref()
        .and_then(daemonset_host_port);
    let registry_node_port = services
        .get_opt(&settings.registry_facade_service)
        .await?
        .as_ref()
        .and_then(service_node_port);

    Ok(match (ws_daemon, registry_facade, registry_node_port) {
        (Some(ws_daemon), Some(registry_facade), Some(registry_node_port)) => {
            Some(ReservedPorts {
                ws_daemon,
                registry_facade,
                registry_node_port,
            })
        }
        _ => None,
    })
}

/// Host port of the first port of the first container
fn daemonset_host_port(ds: &DaemonSet) -> Option<u16> {
    ds.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .ports
        .as_ref()?
        .first()?
        .host_port
        .and_then(|p| u16::try_from(p).ok())
}

fn service_node_port(svc: &Service) -> Option<u16> {
    svc.spec
        .as_ref()?
        .ports
        .as_ref()?
        .first()?
        .node_port
        .and_then(|p| u16::try_from(p).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DaemonSetSpec;
    use k8s_openapi::api::core::v1::{
        Container, ContainerPort, PodSpec, PodTemplateSpec, ServicePort, ServiceSpec,
    };
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pod_with_host_ports(ports: &[i32]) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "c".to_string(),
                    ports: Some(
                        ports
                            .iter()
                            .map(|p| ContainerPort {
                                container_port: 8080,
                                host_port: Some(*p),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn service_with_node_port(port: i32) -> Service {
        Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: 443,
                    node_port: Some(port),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_collects_host_and_node_ports() {
        let pods = vec![pod_with_host_ports(&[10001, 10002]), Pod::default()];
        let services = vec![service_with_node_port(30005), Service::default()];

        let hosts = host_ports(&pods);
        assert_eq!(hosts, HashSet::from([10001, 10002]));
        assert_eq!(node_ports(&services), HashSet::from([30005]));
    }

    #[test]
    fn test_pick_avoids_reserved() {
        let mut rng = StdRng::seed_from_u64(7);
        let range = PortRange::new(100, 104);
        let mut reserved = HashSet::from([100, 101, 102, 104]);

        let picked = pick_free(&[range], &mut reserved, &mut rng).unwrap();
        assert_eq!(picked, vec![103]);
        assert!(reserved.contains(&103));
    }

    #[test]
    fn test_exhausted_range_fails() {
        let mut rng = StdRng::seed_from_u64(7);
        let range = PortRange::new(100, 102);
        let mut reserved = HashSet::from([100, 101, 102]);

        let err = pick_free(&[range], &mut reserved, &mut rng).unwrap_err();
        assert!(err.to_string().contains("100-102"));
    }

    #[test]
    fn test_overlapping_ranges_get_distinct_ports() {
        let mut rng = StdRng::seed_from_u64(1);
        let range = PortRange::new(500, 501);
        let mut reserved = HashSet::new();

        let picked = pick_free(&[range, range], &mut reserved, &mut rng).unwrap();
        assert_eq!(picked.len(), 2);
        assert_ne!(picked[0], picked[1]);
    }

    #[test]
    fn test_sequential_environments_never_share_ports() {
        // Each allocation sees the previous ones as live pods/services, the
        // way the cluster would after each deploy.
        let mut rng = StdRng::seed_from_u64(42);
        let ranges = [
            PortRange::new(10000, 10019),
            PortRange::new(20000, 20019),
            PortRange::new(30000, 30019),
        ];
        let mut pods = Vec::new();
        let mut services = Vec::new();
        let mut seen = HashSet::new();

        for _ in 0..20 {
            let mut reserved = host_ports(&pods);
            reserved.extend(node_ports(&services));

            let picked = pick_free(&ranges, &mut reserved, &mut rng).unwrap();
            for (port, range) in picked.iter().zip(ranges.iter()) {
                assert!(range.contains(*port));
                assert!(seen.insert(*port), "port {} handed out twice", port);
            }

            pods.push(pod_with_host_ports(&[picked[0] as i32, picked[1] as i32]));
            services.push(service_with_node_port(picked[2] as i32));
        }

        let mut reserved = host_ports(&pods);
        reserved.extend(node_ports(&services));
        assert!(pick_free(&ranges, &mut reserved, &mut rng).is_err());
    }

    #[test]
    fn test_range_helpers() {
        let a = PortRange::new(10, 20);
        assert_eq!(a.len(), 11);
        assert!(a.overlaps(&PortRange::new(20, 30)));
        assert!(!a.overlaps(&PortRange::new(21, 30)));
        assert!(PortRange::new(5, 4).is_empty());
        assert_eq!(PortRange::new(5, 4).len(), 0);
    }

    #[test]
    fn test_reads_ports_from_live_objects() {
        let ds = DaemonSet {
            spec: Some(DaemonSetSpec {
                template: PodTemplateSpec {
                    spec: pod_with_host_ports(&[10042]).spec,
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(daemonset_host_port(&ds), Some(10042));
        assert_eq!(daemonset_host_port(&DaemonSet::default()), None);
        assert_eq!(service_node_port(&service_with_node_port(30042)), Some(30042));
    }
}
