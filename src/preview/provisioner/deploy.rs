//! Rendering and applying the product manifests.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, DeleteParams};
use serde::Serialize;
use tracing::{debug, info};

use super::job::{Analytics, JobConfig, ResourceClass, StorageBackend};
use crate::preview::cluster::ClusterHandle;
use crate::preview::error::is_not_found;
use crate::preview::naming::PreviewEnvironment;
use crate::preview::ports::ReservedPorts;
use crate::preview::settings::InstallerSettings;
use crate::preview::shell::{run_checked, CommandRunner, CommandSpec};

/// Overlay handed to the installer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallerValues {
    pub domain: String,
    pub namespace: String,
    pub version: String,
    pub preview: PreviewValues,
    pub certificate: CertificateValues,
    pub ports: ReservedPortValues,
    pub object_storage: ObjectStorageValues,
    pub analytics: AnalyticsValues,
    pub workspace: WorkspaceValues,
    pub license: LicenseValues,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewValues {
    pub name: String,
    pub backing: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CertificateValues {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservedPortValues {
    pub ws_daemon: u16,
    pub registry_facade: u16,
    pub registry_node_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectStorageValues {
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsValues {
    /// Empty disables analytics
    pub writer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceValues {
    pub resource_class: ResourceClass,
    pub default_feature_flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LicenseValues {
    pub enterprise: bool,
}

impl InstallerValues {
    pub fn new(
        env: &PreviewEnvironment,
        job: &JobConfig,
        ports: &ReservedPorts,
        certificate_secret: &str,
    ) -> Self {
        let analytics = match &job.analytics {
            Analytics::None => AnalyticsValues {
                writer: String::new(),
                segment_key: None,
            },
            Analytics::Segment { token } => AnalyticsValues {
                writer: "segment".to_string(),
                segment_key: Some(token.clone()),
            },
        };

        Self {
            domain: env.domain.clone(),
            namespace: env.deployment_namespace().to_string(),
            version: job.version.clone(),
            preview: PreviewValues {
                name: env.name.clone(),
                backing: env.kind().to_string(),
            },
            certificate: CertificateValues {
                kind: "secret".to_string(),
                name: certificate_secret.to_string(),
            },
            ports: ReservedPortValues {
                ws_daemon: ports.ws_daemon,
                registry_facade: ports.registry_facade,
                registry_node_port: ports.registry_node_port,
            },
            object_storage: ObjectStorageValues {
                backend: job.storage,
            },
            analytics,
            workspace: WorkspaceValues {
                resource_class: job.resource_class,
                default_feature_flags: job.workspace_feature_flags.clone(),
            },
            license: LicenseValues {
                enterprise: job.with_ee_license,
            },
        }
    }
}

pub struct Deployer {
    runner: Arc<dyn CommandRunner>,
    settings: InstallerSettings,
    work_dir: PathBuf,
}

impl Deployer {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: InstallerSettings, work_dir: PathBuf) -> Self {
        Self {
            runner,
            settings,
            work_dir,
        }
    }

    fn values_path(&self, env: &PreviewEnvironment) -> PathBuf {
        self.work_dir.join(format!("{}-values.yaml", env.namespace))
    }

    pub fn render_command(&self, env: &PreviewEnvironment, values: &std::path::Path) -> CommandSpec {
        CommandSpec::new(&self.settings.program)
            .args(["render", "--namespace", env.deployment_namespace(), "--config"])
            .arg(values.to_string_lossy())
    }

    pub fn apply_command(&self, cluster: &ClusterHandle, manifests: String) -> CommandSpec {
        CommandSpec::new(&self.settings.kubectl)
            .args(cluster.kubeconfig_args())
            .args(["apply", "-f", "-"])
            .stdin(manifests)
    }

    /// Render manifests for `values` and apply them to `cluster`
    pub async fn deploy(
        &self,
        cluster: &ClusterHandle,
        env: &PreviewEnvironment,
        values: &InstallerValues,
    ) -> Result<()> {
        self.delete_migrations_job(cluster, env.deployment_namespace())
            .await?;

        let path = self.values_path(env);
        let yaml = serde_yaml::to_string(values).context("Failed to serialize installer values")?;
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.work_dir.display()))?;
        tokio::fs::write(&path, yaml)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(path = %path.display(), "Wrote installer values");

        info!(environment = %env, version = %values.version, "Rendering manifests");
        let rendered = run_checked(self.runner.as_ref(), &self.render_command(env, &path))
            .await
            .context("Failed to render manifests")?;

        info!(environment = %env, cluster = %cluster, "Applying manifests");
        run_checked(self.runner.as_ref(), &self.apply_command(cluster, rendered.stdout))
            .await
            .context("Failed to apply manifests")?;
        Ok(())
    }

    /// The migrations Job is immutable; it has to go before it can run again
    async fn delete_migrations_job(&self, cluster: &ClusterHandle, namespace: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(cluster.client(), namespace);
        match api
            .delete(&self.settings.migrations_job, &DeleteParams::background())
            .await
        {
            Ok(_) => {
                info!(namespace = %namespace, job = %self.settings.migrations_job, "Deleted previous migrations job");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!(
                    "Failed to delete job {} in {}",
                    self.settings.migrations_job, namespace
                )
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::cluster::testing::offline;
    use crate::preview::naming::Backing;
    use crate::preview::provisioner::job::JobInput;
    use crate::preview::settings::testing::settings;
    use crate::preview::shell::testing::RecordingRunner;

    fn job(analytics: &str) -> JobConfig {
        JobConfig::from_input(
            JobInput {
                branch: "feature-x".to_string(),
                version: Some("main.1234".to_string()),
                analytics: analytics.to_string(),
                workspace_feature_flags: vec!["full_workspace_backup".to_string()],
                with_ee_license: true,
                ..Default::default()
            },
            &settings(),
        )
        .unwrap()
    }

    fn ports() -> ReservedPorts {
        ReservedPorts {
            ws_daemon: 10123,
            registry_facade: 20456,
            registry_node_port: 30789,
        }
    }

    #[test]
    fn test_values_overlay() {
        let job = job("segment|tok");
        let env = job.environment(&settings()).unwrap();
        let values = InstallerValues::new(&env, &job, &ports(), "proxy-config-certificates");

        let yaml: serde_yaml::Value =
            serde_yaml::from_str(&serde_yaml::to_string(&values).unwrap()).unwrap();
        assert_eq!(yaml["domain"].as_str(), Some("feature-x.staging.example.dev"));
        assert_eq!(yaml["namespace"].as_str(), Some("staging-feature-x"));
        assert_eq!(yaml["preview"]["backing"].as_str(), Some("shared-cluster"));
        assert_eq!(yaml["ports"]["wsDaemon"].as_u64(), Some(10123));
        assert_eq!(yaml["ports"]["registryNodePort"].as_u64(), Some(30789));
        assert_eq!(yaml["objectStorage"]["backend"].as_str(), Some("minio"));
        assert_eq!(yaml["analytics"]["writer"].as_str(), Some("segment"));
        assert_eq!(yaml["analytics"]["segmentKey"].as_str(), Some("tok"));
        assert_eq!(yaml["workspace"]["resourceClass"].as_str(), Some("default"));
        assert_eq!(yaml["license"]["enterprise"].as_bool(), Some(true));
    }

    #[test]
    fn test_analytics_disabled() {
        let job = job("");
        let env = job.environment(&settings()).unwrap();
        let values = InstallerValues::new(&env, &job, &ports(), "certs");
        assert_eq!(values.analytics.writer, "");
        let yaml = serde_yaml::to_string(&values).unwrap();
        assert!(!yaml.contains("segmentKey"));
    }

    #[tokio::test]
    async fn test_commands() {
        let deployer = Deployer::new(
            Arc::new(RecordingRunner::new()),
            settings().installer,
            PathBuf::from("/tmp/work"),
        );
        let env = PreviewEnvironment::from_name(
            &settings().naming_scheme(),
            "feature-x",
            Backing::SharedCluster,
        );

        let path = deployer.values_path(&env);
        assert_eq!(path, PathBuf::from("/tmp/work/staging-feature-x-values.yaml"));
        assert_eq!(
            deployer.render_command(&env, &path).to_string(),
            "installer render --namespace staging-feature-x --config /tmp/work/staging-feature-x-values.yaml"
        );

        let apply = deployer.apply_command(&offline("vm"), "kind: List\n".to_string());
        assert_eq!(apply.to_string(), "kubectl --kubeconfig /tmp/vm.yaml apply -f -");
        assert_eq!(apply.stdin.as_deref(), Some("kind: List\n"));
    }
}
