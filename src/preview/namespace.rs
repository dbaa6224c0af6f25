//! Namespace lifecycle: create, wipe, recreate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use serde_json::json;
use tracing::{debug, info, warn};

use super::cluster::ClusterHandle;
use super::error::{is_not_found, PreviewError};
use super::poll::{poll_until, Poll, PollConfig};
use super::settings::WipeSettings;
use super::shell::{run_checked, CommandRunner, CommandSpec};

/// Label every preview namespace carries. The sweep finds environments by it.
pub const LABEL_PREVIEW: &str = "preview";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "preview-ctl";

/// Cluster-scoped kinds that can be created on behalf of a namespace
const CLUSTER_SCOPED_KINDS: [(&str, &str, &str); 3] = [
    ("rbac.authorization.k8s.io", "v1", "ClusterRole"),
    ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding"),
    ("policy", "v1beta1", "PodSecurityPolicy"),
];

/// Label selector matching preview namespaces
pub fn discovery_selector() -> String {
    format!("{}=true", LABEL_PREVIEW)
}

fn preview_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_PREVIEW.to_string(), "true".to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
    ])
}

/// Namespace object as this controller creates it
pub fn namespace_object(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(preview_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Whether an existing namespace lacks the discovery label
pub fn needs_label_patch(ns: &Namespace) -> bool {
    ns.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_PREVIEW))
        .map(|v| v != "true")
        .unwrap_or(true)
}

/// Objects named `<namespace>-ns-...` belong to that namespace
pub fn owned_by_namespace<'a>(
    names: impl IntoIterator<Item = &'a str>,
    namespace: &str,
) -> Vec<String> {
    let prefix = format!("{}-ns-", namespace);
    names
        .into_iter()
        .filter(|name| name.starts_with(&prefix))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceOutcome {
    Created,
    AlreadyExisted,
}

/// How the previous deployment in a namespace has to be removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UninstallMethod {
    /// Installer deployment; holds the manifests it applied
    Installer(String),
    /// Installer deployment without recorded manifests
    InstallerWithoutManifests,
    /// Nothing from the installer, so assume a Helm release
    Legacy,
}

pub fn uninstall_method(configmap: Option<&ConfigMap>, manifest_key: &str) -> UninstallMethod {
    match configmap {
        None => UninstallMethod::Legacy,
        Some(cm) => match cm.data.as_ref().and_then(|d| d.get(manifest_key)) {
            Some(manifests) if !manifests.trim().is_empty() => {
                UninstallMethod::Installer(manifests.clone())
            }
            _ => UninstallMethod::InstallerWithoutManifests,
        },
    }
}

/// Preview namespaces on a cluster, found through the discovery label
pub async fn list_preview_namespaces(cluster: &ClusterHandle) -> Result<Vec<Namespace>> {
    let api: Api<Namespace> = Api::all(cluster.client());
    let namespaces = api
        .list(&ListParams::default().labels(&discovery_selector()))
        .await
        .with_context(|| format!("Failed to list preview namespaces on {}", cluster))?;
    Ok(namespaces.items)
}

/// Phase of a namespace (`Active`, `Terminating`), or `None` if it does not exist
pub async fn namespace_phase(cluster: &ClusterHandle, name: &str) -> Result<Option<String>> {
    let api: Api<Namespace> = Api::all(cluster.client());
    Ok(api
        .get_opt(name)
        .await?
        .map(|ns| ns.status.and_then(|s| s.phase).unwrap_or_default()))
}

pub struct NamespaceReconciler {
    cluster: ClusterHandle,
    runner: Arc<dyn CommandRunner>,
    settings: WipeSettings,
    kubectl: String,
}

impl NamespaceReconciler {
    pub fn new(
        cluster: ClusterHandle,
        runner: Arc<dyn CommandRunner>,
        settings: WipeSettings,
        kubectl: String,
    ) -> Self {
        Self {
            cluster,
            runner,
            settings,
            kubectl,
        }
    }

    pub fn cluster(&self) -> &ClusterHandle {
        &self.cluster
    }

    /// Create the namespace with the discovery label. No-op if it exists,
    /// apart from adding the label when it is missing.
    pub async fn create(&self, name: &str) -> Result<NamespaceOutcome> {
        let api: Api<Namespace> = Api::all(self.cluster.client());

        if let Some(existing) = api.get_opt(name).await? {
            if needs_label_patch(&existing) {
                info!(namespace = %name, "Adding discovery label to existing namespace");
                let patch = json!({ "metadata": { "labels": preview_labels() } });
                api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .with_context(|| format!("Failed to label namespace {}", name))?;
            }
            debug!(namespace = %name, cluster = %self.cluster, "Namespace already exists");
            return Ok(NamespaceOutcome::AlreadyExisted);
        }

        match api.create(&PostParams::default(), &namespace_object(name)).await {
            Ok(_) => {
                info!(namespace = %name, cluster = %self.cluster, "Created namespace");
                Ok(NamespaceOutcome::Created)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(namespace = %name, "Namespace was created concurrently");
                Ok(NamespaceOutcome::AlreadyExisted)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to create namespace {}", name)),
        }
    }

    /// Remove everything a deployment left behind, including the namespace.
    ///
    /// Ordered: uninstall, workload pods, cluster-scoped objects, namespace.
    pub async fn wipe(&self, name: &str) -> Result<()> {
        info!(namespace = %name, cluster = %self.cluster, "Wiping namespace");

        self.uninstall(name)
            .await
            .with_context(|| format!("Failed to uninstall deployment in {}", name))?;

        let pods = self
            .delete_workload_pods(name)
            .await
            .with_context(|| format!("Failed to delete workload pods in {}", name))?;
        info!(namespace = %name, count = pods, "Deleted workload pods");

        let objects = self
            .delete_cluster_scoped_objects(name)
            .await
            .with_context(|| format!("Failed to delete cluster-scoped objects of {}", name))?;
        info!(namespace = %name, count = objects, "Deleted cluster-scoped objects");

        self.delete_and_wait(name).await
    }

    pub async fn recreate(&self, name: &str) -> Result<()> {
        self.wipe(name).await?;
        self.create(name).await?;
        Ok(())
    }

    /// Delete the namespace and wait until the API no longer returns it
    pub async fn delete_and_wait(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.cluster.client());

        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => info!(namespace = %name, cluster = %self.cluster, "Deleting namespace"),
            Err(e) if is_not_found(&e) => {
                debug!(namespace = %name, "Namespace already gone");
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to delete namespace {}", name))
            }
        }

        let operation = format!("deletion of namespace {} on {}", name, self.cluster);
        poll_until(
            &self.settings.namespace_deletion_poll.config(),
            &operation,
            || async {
                Ok(match api.get_opt(name).await? {
                    None => Poll::Ready(()),
                    Some(ns) => Poll::Pending(format!(
                        "namespace {} is {}",
                        name,
                        ns.status
                            .and_then(|s| s.phase)
                            .unwrap_or_else(|| "present".to_string())
                    )),
                })
            },
        )
        .await?;

        info!(namespace = %name, "Namespace deleted");
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> Result<()> {
        let configmaps: Api<ConfigMap> = Api::namespaced(self.cluster.client(), name);
        let configmap = configmaps.get_opt(&self.settings.installer_configmap).await?;

        match uninstall_method(configmap.as_ref(), &self.settings.manifest_key) {
            UninstallMethod::Installer(manifests) => {
                info!(namespace = %name, "Removing objects of installer deployment");
                let spec = CommandSpec::new(&self.kubectl)
                    .args(self.cluster.kubeconfig_args())
                    .args(["delete", "--ignore-not-found=true", "-f", "-"])
                    .stdin(manifests);
                run_checked(self.runner.as_ref(), &spec).await?;
            }
            UninstallMethod::InstallerWithoutManifests => {
                warn!(
                    namespace = %name,
                    configmap = %self.settings.installer_configmap,
                    "Installer config map has no manifests, relying on namespace deletion"
                );
            }
            UninstallMethod::Legacy => {
                let release = self.settings.helm_release.replace("{namespace}", name);
                info!(namespace = %name, release = %release, "Uninstalling legacy release");
                let spec = CommandSpec::new(&self.settings.helm)
                    .args(self.cluster.kubeconfig_args())
                    .args(["uninstall", release.as_str(), "--namespace", name]);
                let output = self.runner.run(&spec).await?;
                if !output.success() {
                    if output.stderr.contains("not found") {
                        debug!(release = %release, "No legacy release to uninstall");
                    } else {
                        return Err(PreviewError::Command {
                            program: spec.to_string(),
                            status: output.status_description(),
                            stderr: output.stderr.trim().to_string(),
                        }
                        .into());
                    }
                }
            }
        }
        Ok(())
    }

    async fn delete_workload_pods(&self, name: &str) -> Result<usize> {
        let api: Api<Pod> = Api::namespaced(self.cluster.client(), name);
        let pods = api
            .list(&ListParams::default().labels(&self.settings.workload_selector))
            .await?;

        let names: Vec<String> = pods
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect();

        let client = KubePods(api);
        let wait = PollConfig::new(
            Duration::from_secs(1),
            self.settings.pod_delete_timeout_secs.max(1) as u32,
        );
        for pod in &names {
            delete_workload_pod(&client, pod, &wait).await?;
        }
        Ok(names.len())
    }

    async fn delete_cluster_scoped_objects(&self, namespace: &str) -> Result<usize> {
        let mut deletions = Vec::new();

        for (group, version, kind) in CLUSTER_SCOPED_KINDS {
            let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
            let api: Api<DynamicObject> = Api::all_with(self.cluster.client(), &resource);

            let objects = match api.list(&ListParams::default()).await {
                Ok(list) => list.items,
                Err(e) if is_not_found(&e) => {
                    debug!(kind = %kind, "Kind not served by this cluster, skipping");
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to list {} objects", kind))
                }
            };

            let names = objects.iter().filter_map(|o| o.metadata.name.as_deref());
            for name in owned_by_namespace(names, namespace) {
                let api = api.clone();
                deletions.push(async move {
                    info!(kind = %kind, name = %name, "Deleting cluster-scoped object");
                    match api.delete(&name, &DeleteParams::default()).await {
                        Ok(_) => Ok(()),
                        Err(e) if is_not_found(&e) => Ok(()),
                        Err(e) => Err(anyhow::Error::from(e)
                            .context(format!("Failed to delete {} {}", kind, name))),
                    }
                });
            }
        }

        let count = deletions.len();
        try_join_all(deletions).await?;
        Ok(count)
    }
}

/// The pod calls workload cleanup makes
#[async_trait]
pub trait PodClient: Send + Sync {
    /// Drop all finalizers. `Ok(false)` when the pod does not exist.
    async fn strip_finalizers(&self, name: &str) -> Result<bool>;
    /// Delete with the pod's grace period, or immediately when `force`.
    /// `Ok(false)` when the pod does not exist.
    async fn delete(&self, name: &str, force: bool) -> Result<bool>;
    async fn exists(&self, name: &str) -> Result<bool>;
}

struct KubePods(Api<Pod>);

#[async_trait]
impl PodClient for KubePods {
    async fn strip_finalizers(&self, name: &str) -> Result<bool> {
        let patch = json!({ "metadata": { "finalizers": null } });
        match self
            .0
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str, force: bool) -> Result<bool> {
        let params = if force {
            DeleteParams::default().grace_period(0)
        } else {
            DeleteParams::default()
        };
        match self.0.delete(name, &params).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.0.get_opt(name).await?.is_some())
    }
}

/// Strip finalizers, delete, and force-delete if the pod outlives `wait`.
/// A failure is tolerated only if the pod is gone afterwards.
pub async fn delete_workload_pod(pods: &dyn PodClient, name: &str, wait: &PollConfig) -> Result<()> {
    let attempt = async {
        if !pods.strip_finalizers(name).await? || !pods.delete(name, false).await? {
            return Ok(());
        }

        let gone = poll_until(wait, &format!("deletion of pod {}", name), || async move {
            Ok(if pods.exists(name).await? {
                Poll::Pending(format!("pod {} still present", name))
            } else {
                Poll::Ready(())
            })
        })
        .await;

        match gone {
            Err(e) if is_timeout(&e) => {
                warn!(pod = %name, "Pod did not terminate in time, force deleting");
                pods.delete(name, true).await.map(|_| ())
            }
            other => other,
        }
    };

    let Err(error) = attempt.await else {
        return Ok(());
    };

    match pods.exists(name).await {
        Ok(false) => {
            warn!(pod = %name, error = %format!("{:#}", error), "Pod deletion reported an error but the pod is gone");
            Ok(())
        }
        Ok(true) => Err(error.context(format!("unable to delete pod {}, it is still present", name))),
        Err(check) => Err(error.context(format!(
            "unable to delete pod {} and unable to check whether it is gone: {}",
            name, check
        ))),
    }
}

fn is_timeout(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<PreviewError>()
        .map(PreviewError::is_timeout)
        .unwrap_or(false)
}
