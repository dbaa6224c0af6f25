//! Readiness gates for a cluster's API server and a namespace's pods.

use std::future::Future;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use tracing::{info, warn};

use super::cluster::ClusterHandle;
use super::poll::{poll_until, Poll, PollConfig};

/// Pods with this label are user workloads with their own lifecycle
pub const WORKLOAD_EXCLUSION_SELECTOR: &str = "component!=workspace";

/// Wait until the API server's `/readyz` reports healthy
pub async fn wait_for_api(cluster: &ClusterHandle, config: &PollConfig) -> Result<()> {
    info!(cluster = %cluster, "Waiting for API server to become ready");
    let client = cluster.client();

    poll_until(config, &format!("API readiness of {}", cluster), || {
        let client = client.clone();
        async move {
            let request = http::Request::get("/readyz?verbose")
                .body(Vec::new())
                .context("Failed to build readiness request")?;
            Ok(match client.request_text(request).await {
                Ok(_) => Poll::Ready(()),
                Err(e) => Poll::Pending(e.to_string()),
            })
        }
    })
    .await?;

    info!(cluster = %cluster, "API server is ready");
    Ok(())
}

/// Summary of one pod for the readiness decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodState {
    pub name: String,
    pub owner_kind: Option<String>,
    pub phase: String,
}

impl PodState {
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            owner_kind: pod
                .metadata
                .owner_references
                .as_ref()
                .and_then(|refs| refs.first())
                .map(|r| r.kind.clone()),
            phase: pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
        }
    }

    /// Job pods are done when they succeeded; everything else must be running
    pub fn is_healthy(&self) -> bool {
        match self.owner_kind.as_deref() {
            Some("Job") => self.phase == "Succeeded",
            _ => self.phase == "Running",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodReadiness {
    /// Nothing listed yet; the namespace may still be initializing
    Empty,
    Ready,
    /// Pods that are not healthy yet, as `name:phase`
    Unready(Vec<String>),
}

pub fn classify_pods(pods: &[Pod]) -> PodReadiness {
    if pods.is_empty() {
        return PodReadiness::Empty;
    }
    let unready: Vec<String> = pods
        .iter()
        .map(PodState::from_pod)
        .filter(|state| !state.is_healthy())
        .map(|state| format!("{}:{}", state.name, state.phase))
        .collect();
    if unready.is_empty() {
        PodReadiness::Ready
    } else {
        PodReadiness::Unready(unready)
    }
}

/// Wait until every non-workload pod in `namespace` is healthy.
///
/// An empty listing and a failing list call both count as "not yet". On
/// timeout the error carries a description of every pod.
pub async fn wait_for_pods(
    cluster: &ClusterHandle,
    namespace: &str,
    config: &PollConfig,
) -> Result<()> {
    info!(namespace = %namespace, cluster = %cluster, "Waiting until all pods are Running/Succeeded");
    let api: Api<Pod> = Api::namespaced(cluster.client(), namespace);
    let lp = ListParams::default().labels(WORKLOAD_EXCLUSION_SELECTOR);

    pod_gate(namespace, config, || {
        let api = api.clone();
        let lp = lp.clone();
        async move { Ok(api.list(&lp).await?.items) }
    })
    .await
}

/// Poll `list` until every pod it returns is healthy
pub async fn pod_gate<F, Fut>(namespace: &str, config: &PollConfig, list: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Vec<Pod>>>,
{
    let operation = format!("pod readiness in {}", namespace);

    let result = poll_until(config, &operation, || {
        let listing = list();
        async move {
            let pods = match listing.await {
                Ok(pods) => pods,
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "Failed to list pods, retrying");
                    return Ok(Poll::Pending(format!("listing pods failed: {}", e)));
                }
            };

            Ok(match classify_pods(&pods) {
                PodReadiness::Ready => Poll::Ready(()),
                PodReadiness::Empty => {
                    info!(namespace = %namespace, "The namespace is empty or does not exist");
                    Poll::Pending("no pods".to_string())
                }
                PodReadiness::Unready(unready) => {
                    let list = unready.join(", ");
                    info!(namespace = %namespace, "Unready pods: {}", list);
                    Poll::Pending(list)
                }
            })
        }
    })
    .await;

    if let Err(error) = result {
        let description = match list().await {
            Ok(pods) => describe_pods(&pods),
            Err(e) => format!("unable to describe pods: {}", e),
        };
        warn!(namespace = %namespace, "Pods at timeout:\n{}", description);
        return Err(error.context(format!(
            "Not all pods in namespace {} became Running or Succeeded. Pods:\n{}",
            namespace, description
        )));
    }

    info!(namespace = %namespace, "All pods are Running/Succeeded");
    Ok(())
}

/// Human-readable dump of pod state: phase, conditions, container reasons
pub fn describe_pods(pods: &[Pod]) -> String {
    if pods.is_empty() {
        return "(no pods)".to_string();
    }

    let mut out = String::new();
    for pod in pods {
        let state = PodState::from_pod(pod);
        out.push_str(&format!(
            "{} owner={} phase={}\n",
            state.name,
            state.owner_kind.as_deref().unwrap_or("-"),
            state.phase
        ));

        let Some(status) = pod.status.as_ref() else {
            continue;
        };
        for condition in status.conditions.iter().flatten() {
            out.push_str(&format!(
                "  condition {}={}{}\n",
                condition.type_,
                condition.status,
                condition
                    .reason
                    .as_ref()
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default()
            ));
        }
        for container in status.container_statuses.iter().flatten() {
            let detail = container.state.as_ref().and_then(|s| {
                s.waiting
                    .as_ref()
                    .map(|w| format!("waiting: {}", w.reason.as_deref().unwrap_or("unknown")))
                    .or_else(|| {
                        s.terminated.as_ref().map(|t| {
                            format!(
                                "terminated: {} (exit {})",
                                t.reason.as_deref().unwrap_or("unknown"),
                                t.exit_code
                            )
                        })
                    })
            });
            out.push_str(&format!(
                "  container {} ready={} restarts={}{}\n",
                container.name,
                container.ready,
                container.restart_count,
                detail.map(|d| format!(" {}", d)).unwrap_or_default()
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::preview::error::PreviewError;

    fn fast(max_attempts: u32) -> PollConfig {
        PollConfig::new(Duration::from_millis(1), max_attempts)
    }

    /// Hands out one listing per call; the last one repeats
    fn listings(seq: Vec<Vec<Pod>>) -> (Arc<Mutex<VecDeque<Vec<Pod>>>>, Arc<Mutex<u32>>) {
        (Arc::new(Mutex::new(seq.into())), Arc::new(Mutex::new(0)))
    }

    async fn next_listing(
        queue: &Mutex<VecDeque<Vec<Pod>>>,
        calls: &Mutex<u32>,
    ) -> Result<Vec<Pod>> {
        *calls.lock().unwrap() += 1;
        let mut queue = queue.lock().unwrap();
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap_or_default())
        } else {
            Ok(queue.front().cloned().unwrap_or_default())
        }
    }

    fn pod(name: &str, owner: Option<&str>, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                owner_references: owner.map(|kind| {
                    vec![OwnerReference {
                        kind: kind.to_string(),
                        name: "owner".to_string(),
                        api_version: "v1".to_string(),
                        uid: "uid".to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_listing_is_not_ready() {
        assert_eq!(classify_pods(&[]), PodReadiness::Empty);
    }

    #[test]
    fn test_running_pods_and_succeeded_job_are_ready() {
        let pods = vec![
            pod("server-0", Some("StatefulSet"), "Running"),
            pod("proxy-abc", Some("ReplicaSet"), "Running"),
            pod("migrations-xyz", Some("Job"), "Succeeded"),
        ];
        assert_eq!(classify_pods(&pods), PodReadiness::Ready);
    }

    #[test]
    fn test_pending_pod_blocks_readiness() {
        let pods = vec![
            pod("server-0", Some("StatefulSet"), "Running"),
            pod("proxy-abc", Some("ReplicaSet"), "Pending"),
        ];
        assert_eq!(
            classify_pods(&pods),
            PodReadiness::Unready(vec!["proxy-abc:Pending".to_string()])
        );
    }

    #[test]
    fn test_running_job_pod_is_not_ready() {
        let pods = vec![pod("migrations-xyz", Some("Job"), "Running")];
        assert_eq!(
            classify_pods(&pods),
            PodReadiness::Unready(vec!["migrations-xyz:Running".to_string()])
        );
    }

    #[test]
    fn test_succeeded_non_job_pod_is_not_ready() {
        let pods = vec![pod("one-off", None, "Succeeded")];
        assert!(matches!(classify_pods(&pods), PodReadiness::Unready(_)));
    }

    #[test]
    fn test_pod_without_status_is_unknown() {
        let mut p = pod("fresh", None, "Running");
        p.status = None;
        assert_eq!(
            classify_pods(&[p]),
            PodReadiness::Unready(vec!["fresh:Unknown".to_string()])
        );
    }

    #[tokio::test]
    async fn test_gate_retries_empty_listing() {
        let (queue, calls) = listings(vec![
            vec![],
            vec![],
            vec![pod("server-0", Some("StatefulSet"), "Running")],
        ]);
        pod_gate("staging-x", &fast(5), || {
            let (queue, calls) = (queue.clone(), calls.clone());
            async move { next_listing(&queue, &calls).await }
        })
        .await
        .unwrap();
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_gate_never_passes_on_empty_namespace() {
        let (queue, calls) = listings(vec![vec![]]);
        let err = pod_gate("staging-x", &fast(3), || {
            let (queue, calls) = (queue.clone(), calls.clone());
            async move { next_listing(&queue, &calls).await }
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PreviewError>(),
            Some(PreviewError::Timeout { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_gate_times_out_on_pending_pod_with_description() {
        let (queue, calls) = listings(vec![vec![
            pod("server-0", Some("StatefulSet"), "Running"),
            pod("proxy-abc", Some("ReplicaSet"), "Pending"),
        ]]);
        let err = pod_gate("staging-x", &fast(4), || {
            let (queue, calls) = (queue.clone(), calls.clone());
            async move { next_listing(&queue, &calls).await }
        })
        .await
        .unwrap_err();

        match err.downcast_ref::<PreviewError>() {
            Some(PreviewError::Timeout { last_observed, .. }) => {
                assert_eq!(last_observed, "proxy-abc:Pending")
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(format!("{:#}", err).contains("proxy-abc owner=ReplicaSet phase=Pending"));
        // Every attempt plus the final description
        assert_eq!(*calls.lock().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_gate_tolerates_failing_list_call() {
        let failed = Arc::new(Mutex::new(false));
        pod_gate("staging-x", &fast(3), || {
            let failed = failed.clone();
            async move {
                let mut failed = failed.lock().unwrap();
                if !*failed {
                    *failed = true;
                    anyhow::bail!("connection refused");
                }
                Ok(vec![pod("migrations-xyz", Some("Job"), "Succeeded")])
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_describe_pods_includes_container_reasons() {
        let mut p = pod("proxy-abc", Some("ReplicaSet"), "Pending");
        if let Some(status) = p.status.as_mut() {
            status.container_statuses = Some(vec![ContainerStatus {
                name: "proxy".to_string(),
                ready: false,
                restart_count: 2,
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("ImagePullBackOff".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }

        let description = describe_pods(&[p]);
        assert!(description.contains("proxy-abc owner=ReplicaSet phase=Pending"));
        assert!(description.contains("container proxy ready=false restarts=2 waiting: ImagePullBackOff"));
        assert_eq!(describe_pods(&[]), "(no pods)");
    }
}
