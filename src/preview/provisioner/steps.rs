use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::info;

use super::deploy::{Deployer, InstallerValues};
use super::job::JobConfig;
use crate::preview::certificate::{CertificateCoordinator, CertificateRequest};
use crate::preview::cluster::ClusterHandle;
use crate::preview::dns::DnsBinder;
use crate::preview::namespace::NamespaceReconciler;
use crate::preview::naming::{Backing, PreviewEnvironment};
use crate::preview::ports::{self, ReservedPorts};
use crate::preview::readiness;
use crate::preview::settings::Settings;
use crate::preview::shell::CommandRunner;
use crate::preview::vm::VmProvisioner;

/// Which certificate of an environment is being installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateTarget {
    /// Served by the product's proxy inside the deployment namespace
    Workload,
    /// Terminated by the load balancer in front of a VM
    VmIngress,
}

/// Outcome published at the end of every run
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionOutcome {
    pub url: String,
    pub succeeded: bool,
    pub message: String,
}

/// The individual actions of a provisioning run
#[async_trait]
pub trait ProvisionSteps: Send + Sync {
    /// Ports the deployment is rendered with
    async fn allocate_ports(&self, env: &PreviewEnvironment) -> Result<ReservedPorts>;

    /// Get the deployment namespace into place (and the VM behind it)
    async fn prepare_namespace(&self, env: &PreviewEnvironment, job: &JobConfig) -> Result<()>;

    async fn issue_certificate(&self, req: &CertificateRequest) -> Result<()>;

    async fn install_certificate(
        &self,
        req: &CertificateRequest,
        env: &PreviewEnvironment,
        target: CertificateTarget,
    ) -> Result<()>;

    async fn deploy(
        &self,
        env: &PreviewEnvironment,
        job: &JobConfig,
        ports: &ReservedPorts,
    ) -> Result<()>;

    async fn wait_for_pods(&self, env: &PreviewEnvironment) -> Result<()>;

    async fn bind_dns(&self, env: &PreviewEnvironment) -> Result<()>;

    async fn publish_result(&self, env: &PreviewEnvironment, outcome: &ProvisionOutcome)
        -> Result<()>;
}

/// Sub-cluster handles by VM name.
///
/// Reconnecting to a VM replaces its handle; a lookup never falls back to
/// another VM's cluster.
#[derive(Default)]
pub struct SubClusters(Mutex<HashMap<String, ClusterHandle>>);

impl SubClusters {
    pub fn remember(&self, vm_name: &str, cluster: ClusterHandle) {
        let mut clusters = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if clusters.insert(vm_name.to_string(), cluster).is_some() {
            info!(vm = %vm_name, "Replaced sub-cluster handle after reconnecting");
        }
    }

    pub fn get(&self, vm_name: &str) -> Result<ClusterHandle> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(vm_name)
            .cloned()
            .ok_or_else(|| anyhow!("Not connected to the sub-cluster of VM {} yet", vm_name))
    }
}

/// Steps acting on real clusters
pub struct KubeSteps {
    shared: ClusterHandle,
    settings: Arc<Settings>,
    namespaces: NamespaceReconciler,
    certificates: CertificateCoordinator,
    dns: DnsBinder,
    deployer: Deployer,
    vm: Option<VmProvisioner>,
    runner: Arc<dyn CommandRunner>,
    /// VM sub-clusters the namespace step connected to
    sub_clusters: SubClusters,
}

impl KubeSteps {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shared: ClusterHandle,
        settings: Arc<Settings>,
        namespaces: NamespaceReconciler,
        certificates: CertificateCoordinator,
        dns: DnsBinder,
        deployer: Deployer,
        vm: Option<VmProvisioner>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            shared,
            settings,
            namespaces,
            certificates,
            dns,
            deployer,
            vm,
            runner,
            sub_clusters: SubClusters::default(),
        }
    }

    fn vm(&self) -> Result<&VmProvisioner> {
        self.vm
            .as_ref()
            .ok_or_else(|| anyhow!("No VM host cluster configured"))
    }

    /// Cluster the product of `env` runs in
    fn deployment_cluster(&self, env: &PreviewEnvironment) -> Result<ClusterHandle> {
        match env.backing {
            Backing::SharedCluster => Ok(self.shared.clone()),
            Backing::DedicatedVm { ref vm_name, .. } => self.sub_clusters.get(vm_name),
        }
    }
}

#[async_trait]
impl ProvisionSteps for KubeSteps {
    async fn allocate_ports(&self, env: &PreviewEnvironment) -> Result<ReservedPorts> {
        match env.backing {
            Backing::SharedCluster => {
                ports::allocate_for_environment(&self.shared, &env.namespace, &self.settings.ports)
                    .await
            }
            // A VM runs its own cluster; nothing to collide with
            Backing::DedicatedVm { .. } => Ok(ReservedPorts::from(self.settings.vm.ports)),
        }
    }

    async fn prepare_namespace(&self, env: &PreviewEnvironment, job: &JobConfig) -> Result<()> {
        match env.backing {
            Backing::SharedCluster => {
                if job.clean_slate {
                    self.namespaces.recreate(&env.namespace).await
                } else {
                    self.namespaces.create(&env.namespace).await.map(|_| ())
                }
            }
            Backing::DedicatedVm {
                ref vm_name,
                ref deployment_namespace,
                ..
            } => {
                let vm = self.vm()?;
                vm.ensure_namespace(vm_name, job.clean_slate).await?;
                vm.provision(vm_name, job.vm_size(&self.settings)).await?;
                let cluster = vm
                    .connect(vm_name, &self.settings.readiness.api.config())
                    .await?;
                self.sub_clusters.remember(vm_name, cluster.clone());

                NamespaceReconciler::new(
                    cluster,
                    self.runner.clone(),
                    self.settings.wipe.clone(),
                    self.settings.installer.kubectl.clone(),
                )
                .create(deployment_namespace)
                .await?;
                Ok(())
            }
        }
    }

    async fn issue_certificate(&self, req: &CertificateRequest) -> Result<()> {
        self.certificates.issue(req).await
    }

    async fn install_certificate(
        &self,
        req: &CertificateRequest,
        env: &PreviewEnvironment,
        target: CertificateTarget,
    ) -> Result<()> {
        match target {
            CertificateTarget::Workload => {
                let destination = self.deployment_cluster(env)?;
                self.certificates
                    .install(
                        req,
                        &destination,
                        env.deployment_namespace(),
                        &self.settings.certificates.destination_secret,
                    )
                    .await
            }
            CertificateTarget::VmIngress => {
                let namespace = &self.settings.certificates.vm_destination_namespace;
                self.namespaces.create(namespace).await?;
                self.certificates
                    .install(req, &self.shared, namespace, &req.cert_name)
                    .await
            }
        }
    }

    async fn deploy(
        &self,
        env: &PreviewEnvironment,
        job: &JobConfig,
        ports: &ReservedPorts,
    ) -> Result<()> {
        let cluster = self.deployment_cluster(env)?;
        let values = InstallerValues::new(
            env,
            job,
            ports,
            &self.settings.certificates.destination_secret,
        );
        self.deployer.deploy(&cluster, env, &values).await
    }

    async fn wait_for_pods(&self, env: &PreviewEnvironment) -> Result<()> {
        let cluster = self.deployment_cluster(env)?;
        readiness::wait_for_pods(
            &cluster,
            env.deployment_namespace(),
            &self.settings.readiness.pods.config(),
        )
        .await
    }

    async fn bind_dns(&self, env: &PreviewEnvironment) -> Result<()> {
        let cluster = self.deployment_cluster(env)?;
        self.dns.bind_environment(&cluster, env).await
    }

    async fn publish_result(
        &self,
        env: &PreviewEnvironment,
        outcome: &ProvisionOutcome,
    ) -> Result<()> {
        if outcome.succeeded {
            info!(environment = %env, url = %outcome.url, "Preview environment is up");
        } else {
            tracing::error!(
                environment = %env,
                url = %outcome.url,
                error = %outcome.message,
                "Preview environment failed"
            );
        }
        println!("{}", outcome.url);
        Ok(())
    }
}
