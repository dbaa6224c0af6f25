pub mod check;
pub mod delete;
pub mod provision;
pub mod sweep;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use crate::preview::certificate::CertificateCoordinator;
use crate::preview::cluster::ClusterHandle;
use crate::preview::dns::{CommandDnsProvider, DnsBinder};
use crate::preview::gc::branches::GitBranches;
use crate::preview::gc::KubeSweepBackend;
use crate::preview::namespace::NamespaceReconciler;
use crate::preview::provisioner::deploy::Deployer;
use crate::preview::provisioner::KubeSteps;
use crate::preview::settings::Settings;
use crate::preview::shell::{CommandRunner, ProcessRunner};
use crate::preview::vm::VmProvisioner;

/// Settings plus the cluster handles every command works against
pub struct Context {
    pub settings: Arc<Settings>,
    pub shared: ClusterHandle,
    pub vm_host: Option<ClusterHandle>,
    pub runner: Arc<dyn CommandRunner>,
}

impl Context {
    pub async fn connect(settings: Settings) -> Result<Self> {
        // Required for kube-rs HTTPS connections
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();

        let shared = ClusterHandle::connect("shared", &settings.clusters.shared)
            .await
            .context("Failed to connect to the shared cluster")?;
        let vm_host = match settings.clusters.vm_host {
            Some(ref connection) => Some(
                ClusterHandle::connect("vm-host", connection)
                    .await
                    .context("Failed to connect to the VM host cluster")?,
            ),
            None => None,
        };

        Ok(Self {
            settings: Arc::new(settings),
            shared,
            vm_host,
            runner: Arc::new(ProcessRunner),
        })
    }

    pub fn namespaces(&self, cluster: &ClusterHandle) -> NamespaceReconciler {
        NamespaceReconciler::new(
            cluster.clone(),
            self.runner.clone(),
            self.settings.wipe.clone(),
            self.settings.installer.kubectl.clone(),
        )
    }

    pub fn vm(&self) -> Option<VmProvisioner> {
        self.vm_host.as_ref().map(|host| {
            VmProvisioner::new(
                self.namespaces(host),
                self.runner.clone(),
                self.settings.vm.clone(),
            )
        })
    }

    pub fn certificates(&self) -> CertificateCoordinator {
        CertificateCoordinator::new(
            self.shared.clone(),
            self.runner.clone(),
            self.settings.certificates.clone(),
        )
    }

    pub fn dns(&self) -> DnsBinder {
        let provider = CommandDnsProvider::new(self.runner.clone(), &self.settings.dns);
        DnsBinder::new(
            Arc::new(provider),
            self.settings.dns.clone(),
            self.settings.domain.clone(),
        )
    }

    pub fn provision_steps(&self, work_dir: PathBuf) -> KubeSteps {
        KubeSteps::new(
            self.shared.clone(),
            self.settings.clone(),
            self.namespaces(&self.shared),
            self.certificates(),
            self.dns(),
            Deployer::new(
                self.runner.clone(),
                self.settings.installer.clone(),
                work_dir,
            ),
            self.vm(),
            self.runner.clone(),
        )
    }

    pub fn sweep_backend(&self) -> KubeSweepBackend {
        KubeSweepBackend::new(
            self.shared.clone(),
            self.settings.clone(),
            self.namespaces(&self.shared),
            self.vm(),
            self.certificates(),
            self.dns(),
            GitBranches::new(self.runner.clone(), &self.settings.gc),
        )
    }
}
