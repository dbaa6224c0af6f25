use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, DeleteParams, ListParams};
use tracing::{debug, info, warn};

use super::activity::{self, Activity};
use super::branches::GitBranches;
use crate::preview::certificate::CertificateCoordinator;
use crate::preview::cluster::ClusterHandle;
use crate::preview::dns::DnsBinder;
use crate::preview::error::is_not_found;
use crate::preview::namespace::{list_preview_namespaces, namespace_phase, NamespaceReconciler};
use crate::preview::naming::{Backing, BackingKind, NamingScheme, PreviewEnvironment};
use crate::preview::poll::PollConfig;
use crate::preview::settings::Settings;
use crate::preview::vm::{dedicated_backing, VmProvisioner};

/// Label on per-VM load balancer objects naming the environment they serve
pub const LOAD_BALANCER_LABEL: &str = "preview/lb-name";

/// Everything the sweep reads from or does to the outside world
#[async_trait]
pub trait SweepBackend: Send + Sync {
    /// Environments found on the shared and VM host clusters
    async fn live_environments(&self) -> Result<Vec<PreviewEnvironment>>;

    async fn branches(&self) -> Result<Vec<String>>;

    async fn has_commits_since(&self, branch: &str, since: NaiveDate) -> Result<bool>;

    /// Never fails; an environment that cannot be probed counts as inactive
    async fn activity(&self, env: &PreviewEnvironment) -> Activity;

    async fn delete_environment(&self, env: &PreviewEnvironment) -> Result<()>;

    /// Name and `preview/owner` of every issued certificate
    async fn certificate_owners(&self) -> Result<Vec<(String, Option<String>)>>;

    async fn delete_certificate(&self, name: &str) -> Result<()>;

    /// Environment names that have a load balancer
    async fn load_balancers(&self) -> Result<Vec<String>>;

    async fn delete_load_balancer(&self, name: &str) -> Result<()>;
}

/// Environments behind a list of namespace names of one backing kind
pub fn environments_from_namespaces<'a>(
    scheme: &NamingScheme,
    kind: BackingKind,
    namespaces: impl IntoIterator<Item = &'a str>,
    backing: impl Fn(&str) -> Backing,
) -> Vec<PreviewEnvironment> {
    namespaces
        .into_iter()
        .filter_map(|ns| scheme.name_from_namespace(kind, ns))
        .map(|name| PreviewEnvironment::from_name(scheme, name, backing(name)))
        .collect()
}

pub struct KubeSweepBackend {
    shared: ClusterHandle,
    settings: Arc<Settings>,
    namespaces: NamespaceReconciler,
    vm: Option<VmProvisioner>,
    certificates: CertificateCoordinator,
    dns: DnsBinder,
    git: GitBranches,
}

impl KubeSweepBackend {
    pub fn new(
        shared: ClusterHandle,
        settings: Arc<Settings>,
        namespaces: NamespaceReconciler,
        vm: Option<VmProvisioner>,
        certificates: CertificateCoordinator,
        dns: DnsBinder,
        git: GitBranches,
    ) -> Self {
        Self {
            shared,
            settings,
            namespaces,
            vm,
            certificates,
            dns,
            git,
        }
    }

    async fn probe(&self, env: &PreviewEnvironment) -> Result<Activity> {
        let (host, cluster) = match env.backing {
            Backing::SharedCluster => (self.shared.clone(), self.shared.clone()),
            Backing::DedicatedVm { ref vm_name, .. } => {
                let Some(vm) = self.vm.as_ref() else {
                    return Ok(Activity::inactive("no VM host cluster configured"));
                };
                // A VM that does not answer quickly is not being used
                let quick = PollConfig::new(Duration::from_secs(2), 5);
                (vm.host().clone(), vm.connect(vm_name, &quick).await?)
            }
        };

        let phase = namespace_phase(&host, &env.namespace).await?;
        if let Some(activity) = activity::from_namespace_phase(phase.as_deref()) {
            return Ok(activity);
        }

        let gc = &self.settings.gc;
        let output = activity::exec_in_pod(
            &cluster,
            env.deployment_namespace(),
            &gc.activity_pod,
            gc.activity_container.as_deref(),
            &gc.activity_query,
        )
        .await?;
        Ok(activity::from_query_output(&output, gc.activity_window_hours))
    }

    fn load_balancer_api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.shared.client(), &self.settings.gc.load_balancer_namespace)
    }
}

#[async_trait]
impl SweepBackend for KubeSweepBackend {
    async fn live_environments(&self) -> Result<Vec<PreviewEnvironment>> {
        let scheme = self.settings.naming_scheme();

        let shared = list_preview_namespaces(&self.shared).await?;
        let mut environments = environments_from_namespaces(
            &scheme,
            BackingKind::SharedCluster,
            shared.iter().filter_map(|ns| ns.metadata.name.as_deref()),
            |_| Backing::SharedCluster,
        );

        if let Some(vm) = self.vm.as_ref() {
            let hosted = list_preview_namespaces(vm.host()).await?;
            environments.extend(environments_from_namespaces(
                &scheme,
                BackingKind::DedicatedVm,
                hosted.iter().filter_map(|ns| ns.metadata.name.as_deref()),
                |name| dedicated_backing(&scheme, &self.settings.vm, name),
            ));
        }

        Ok(environments)
    }

    async fn branches(&self) -> Result<Vec<String>> {
        self.git.list().await
    }

    async fn has_commits_since(&self, branch: &str, since: NaiveDate) -> Result<bool> {
        self.git.has_commits_since(branch, since).await
    }

    async fn activity(&self, env: &PreviewEnvironment) -> Activity {
        match self.probe(env).await {
            Ok(activity) => activity,
            Err(e) => {
                warn!(environment = %env, error = %format!("{:#}", e), "Activity probe failed");
                Activity::inactive(format!("probe failed: {}", e))
            }
        }
    }

    async fn delete_environment(&self, env: &PreviewEnvironment) -> Result<()> {
        info!(environment = %env, "Deleting preview environment");
        self.dns
            .unbind_environment(env)
            .await
            .with_context(|| format!("Failed to remove DNS records of {}", env.name))?;

        match env.backing {
            Backing::SharedCluster => self.namespaces.wipe(&env.namespace).await,
            Backing::DedicatedVm { ref vm_name, .. } => match self.vm.as_ref() {
                Some(vm) => vm.delete(vm_name).await,
                None => anyhow::bail!("No VM host cluster configured to delete {}", vm_name),
            },
        }
    }

    async fn certificate_owners(&self) -> Result<Vec<(String, Option<String>)>> {
        self.certificates.list_owners().await
    }

    async fn delete_certificate(&self, name: &str) -> Result<()> {
        self.certificates.delete(name).await
    }

    async fn load_balancers(&self) -> Result<Vec<String>> {
        let deployments: Api<Deployment> = self.load_balancer_api();
        let list = deployments
            .list(&ListParams::default().labels(LOAD_BALANCER_LABEL))
            .await
            .context("Failed to list load balancers")?;
        Ok(list
            .items
            .iter()
            .filter_map(|d| d.metadata.labels.as_ref()?.get(LOAD_BALANCER_LABEL).cloned())
            .collect())
    }

    async fn delete_load_balancer(&self, name: &str) -> Result<()> {
        let object = format!("lb-{}", name);
        let deployments: Api<Deployment> = self.load_balancer_api();
        let services: Api<Service> = self.load_balancer_api();

        for result in [
            deployments.delete(&object, &DeleteParams::default()).await.map(|_| ()),
            services.delete(&object, &DeleteParams::default()).await.map(|_| ()),
        ] {
            match result {
                Ok(()) => {}
                Err(e) if is_not_found(&e) => debug!(object = %object, "Already gone"),
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to delete load balancer {}", object))
                }
            }
        }
        info!(load_balancer = %object, "Deleted load balancer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::settings::testing::settings;

    #[test]
    fn test_environments_from_namespaces() {
        let s = settings();
        let scheme = s.naming_scheme();

        let shared = environments_from_namespaces(
            &scheme,
            BackingKind::SharedCluster,
            ["staging-feature-x", "staging-", "kube-system"],
            |_| Backing::SharedCluster,
        );
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].name, "feature-x");
        assert_eq!(shared[0].domain, "feature-x.staging.example.dev");

        let vms = environments_from_namespaces(
            &scheme,
            BackingKind::DedicatedVm,
            ["preview-feature-y"],
            |name| dedicated_backing(&scheme, &s.vm, name),
        );
        assert_eq!(vms[0].namespace, "preview-feature-y");
        assert_eq!(vms[0].deployment_namespace(), "default");
    }
}
