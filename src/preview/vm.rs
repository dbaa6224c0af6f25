//! Dedicated VMs running their own sub-cluster.
//!
//! A VM lives in a namespace of the VM host cluster. The provisioning script
//! creates (or updates) it; a second script writes a kubeconfig for the
//! sub-cluster inside it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use super::cluster::ClusterHandle;
use super::naming::{Backing, NamingScheme, BackingKind};
use super::namespace::NamespaceReconciler;
use super::poll::PollConfig;
use super::readiness;
use super::settings::{VmSettings, VmSize};
use super::shell::{run_checked, CommandRunner};

/// Where the sub-cluster kubeconfig of `vm_name` is written
pub fn kubeconfig_path(settings: &VmSettings, vm_name: &str) -> PathBuf {
    Path::new(&settings.kubeconfig_dir).join(format!("{}.yaml", vm_name))
}

/// Backing of the dedicated-VM environment called `name`.
/// The VM is named after its namespace on the host cluster.
pub fn dedicated_backing(scheme: &NamingScheme, settings: &VmSettings, name: &str) -> Backing {
    let vm_name = scheme.namespace(BackingKind::DedicatedVm, name);
    Backing::DedicatedVm {
        kubeconfig_path: kubeconfig_path(settings, &vm_name),
        deployment_namespace: settings.deployment_namespace.clone(),
        vm_name,
    }
}

pub struct VmProvisioner {
    namespaces: NamespaceReconciler,
    runner: Arc<dyn CommandRunner>,
    settings: VmSettings,
}

impl VmProvisioner {
    /// `namespaces` has to act on the VM host cluster
    pub fn new(
        namespaces: NamespaceReconciler,
        runner: Arc<dyn CommandRunner>,
        settings: VmSettings,
    ) -> Self {
        Self {
            namespaces,
            runner,
            settings,
        }
    }

    pub fn host(&self) -> &ClusterHandle {
        self.namespaces.cluster()
    }

    /// Make sure the VM's namespace exists on the host, recreating it when a
    /// clean slate is requested
    pub async fn ensure_namespace(&self, vm_name: &str, clean_slate: bool) -> Result<()> {
        if clean_slate {
            info!(vm = %vm_name, "Recreating VM namespace for a clean slate");
            self.namespaces.recreate(vm_name).await
        } else {
            self.namespaces.create(vm_name).await.map(|_| ())
        }
    }

    /// Create or update the VM
    pub async fn provision(&self, vm_name: &str, size: VmSize) -> Result<()> {
        let cpu = size.cpu.to_string();
        let memory = size.memory.to_string();
        let spec = self.settings.provision_command.render(&[
            ("name", vm_name),
            ("cpu", &cpu),
            ("memory", &memory),
        ]);
        info!(vm = %vm_name, cpu = size.cpu, memory_gib = size.memory, "Provisioning VM");
        run_checked(self.runner.as_ref(), &spec.args(self.host().kubeconfig_args()))
            .await
            .with_context(|| format!("Failed to provision VM {}", vm_name))?;
        Ok(())
    }

    /// Write the sub-cluster kubeconfig and return its path
    pub async fn fetch_kubeconfig(&self, vm_name: &str) -> Result<PathBuf> {
        let path = kubeconfig_path(&self.settings, vm_name);
        tokio::fs::create_dir_all(&self.settings.kubeconfig_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.settings.kubeconfig_dir))?;

        let path_arg = path.to_string_lossy().into_owned();
        let spec = self
            .settings
            .kubeconfig_command
            .render(&[("name", vm_name), ("path", &path_arg)]);
        run_checked(self.runner.as_ref(), &spec)
            .await
            .with_context(|| format!("Failed to fetch kubeconfig of VM {}", vm_name))?;
        Ok(path)
    }

    /// Connect to the VM's sub-cluster once its API server reports ready
    pub async fn connect(&self, vm_name: &str, api_poll: &PollConfig) -> Result<ClusterHandle> {
        let path = self.fetch_kubeconfig(vm_name).await?;
        let cluster = ClusterHandle::from_kubeconfig_file(vm_name, &path).await?;
        readiness::wait_for_api(&cluster, api_poll)
            .await
            .with_context(|| format!("The API server of VM {} never became ready", vm_name))?;
        Ok(cluster)
    }

    /// Tear the VM down together with its namespace
    pub async fn delete(&self, vm_name: &str) -> Result<()> {
        info!(vm = %vm_name, host = %self.host(), "Deleting VM");
        self.namespaces.delete_and_wait(vm_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::cluster::testing::offline;
    use crate::preview::settings::testing::settings;
    use crate::preview::shell::testing::RecordingRunner;

    fn provisioner(runner: Arc<RecordingRunner>, kubeconfig_dir: &str) -> VmProvisioner {
        let s = settings();
        let mut vm = s.vm.clone();
        vm.kubeconfig_dir = kubeconfig_dir.to_string();
        let namespaces =
            NamespaceReconciler::new(offline("vm-host"), runner.clone(), s.wipe, "kubectl".into());
        VmProvisioner::new(namespaces, runner, vm)
    }

    #[test]
    fn test_dedicated_backing() {
        let s = settings();
        let backing = dedicated_backing(&s.naming_scheme(), &s.vm, "feature-x");
        assert_eq!(
            backing,
            Backing::DedicatedVm {
                vm_name: "preview-feature-x".to_string(),
                deployment_namespace: "default".to_string(),
                kubeconfig_path: PathBuf::from("/tmp/preview-kubeconfigs/preview-feature-x.yaml"),
            }
        );
    }

    #[tokio::test]
    async fn test_provision_renders_size() {
        let runner = Arc::new(RecordingRunner::new());
        let vm = provisioner(runner.clone(), "/tmp");
        vm.provision("preview-feature-x", VmSize { cpu: 12, memory: 24 })
            .await
            .unwrap();
        assert_eq!(
            runner.command_lines(),
            vec![
                "dev/preview/start-vm.sh --name preview-feature-x --cpu 12 --memory 24 \
                 --kubeconfig /tmp/vm-host.yaml"
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_kubeconfig_creates_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let kubeconfigs = dir.path().join("kubeconfigs");
        let runner = Arc::new(RecordingRunner::new());
        let vm = provisioner(runner.clone(), kubeconfigs.to_str().unwrap());

        let path = vm.fetch_kubeconfig("preview-feature-x").await.unwrap();

        assert!(kubeconfigs.is_dir());
        assert_eq!(path, kubeconfigs.join("preview-feature-x.yaml"));
        let calls = runner.calls();
        assert_eq!(calls[0].args[3], path.to_string_lossy());
    }
}
