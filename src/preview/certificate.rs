//! TLS certificates for preview domains.
//!
//! Certificates are issued on the shared cluster by a Terraform module that
//! creates a cert-manager `Certificate` in a fixed namespace. Once cert-manager
//! reports it `Ready`, the backing Secret is copied by value into whichever
//! cluster and namespace the environment runs in.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use serde_json::json;
use tracing::{debug, info, warn};

use super::cluster::ClusterHandle;
use super::error::{is_not_found, PreviewError};
use super::naming::PreviewEnvironment;
use super::namespace::MANAGED_BY;
use super::poll::{poll_until, Poll};
use super::settings::{CertificateSettings, Settings};
use super::shell::{run_checked, CommandRunner, CommandSpec};

/// Annotation naming the environment a certificate was issued for
pub const OWNER_ANNOTATION: &str = "preview/owner";

/// Longest name usable as a certificate's common name
const MAX_COMMON_NAME: usize = 64;

pub fn certificate_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("cert-manager.io", "v1", "Certificate"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct CertificateRequest {
    pub cert_name: String,
    pub cert_namespace: String,
    pub domain: String,
    /// Prepended to `domain`, e.g. `""`, `"*."`, `"*.ws-dev."`
    pub subdomains: Vec<String>,
    /// Address the DNS-01 solver and the records point at
    pub ip: String,
    pub dns_zone: String,
    /// Environment name recorded on the Certificate
    pub owner: String,
}

impl CertificateRequest {
    /// The certificate served by the environment's own proxy
    pub fn workload(env: &PreviewEnvironment, settings: &Settings) -> Result<Self> {
        Ok(Self {
            cert_name: env.namespace.clone(),
            cert_namespace: settings.certificates.namespace.clone(),
            domain: env.domain.clone(),
            subdomains: settings.certificates.subdomains.clone(),
            ip: ingress_ip(env, settings)?,
            dns_zone: settings.dns.zone.clone(),
            owner: env.name.clone(),
        })
    }

    /// The certificate terminated by the load balancer in front of a VM
    pub fn vm_ingress(env: &PreviewEnvironment, settings: &Settings) -> Result<Self> {
        Ok(Self {
            cert_name: format!("{}-ingress", env.namespace),
            cert_namespace: settings.certificates.namespace.clone(),
            domain: env.domain.clone(),
            subdomains: settings.certificates.vm_subdomains.clone(),
            ip: ingress_ip(env, settings)?,
            dns_zone: settings.dns.zone.clone(),
            owner: env.name.clone(),
        })
    }

    pub fn sans(&self) -> Vec<String> {
        self.subdomains
            .iter()
            .map(|sub| format!("{}{}", sub, self.domain))
            .collect()
    }

    /// At least one SAN has to fit into the common name
    pub fn check_common_name(&self) -> Result<()> {
        let sans = self.sans();
        if sans.iter().any(|san| san.len() <= MAX_COMMON_NAME) {
            return Ok(());
        }
        Err(PreviewError::config(format!(
            "certificate {} has no SAN short enough to be a common name (max {} chars): {}",
            self.cert_name,
            MAX_COMMON_NAME,
            sans.join(", ")
        ))
        .into())
    }

    /// Subdomains as an HCL list literal
    pub fn hcl_subdomains(&self) -> String {
        let items: Vec<String> = self
            .subdomains
            .iter()
            .map(|sub| format!("\"{}\"", sub))
            .collect();
        format!("[{}]", items.join(", "))
    }
}

fn ingress_ip(env: &PreviewEnvironment, settings: &Settings) -> Result<String> {
    use super::naming::Backing;

    match env.backing {
        Backing::SharedCluster => Ok(settings.domain.ingress_ip.clone()),
        Backing::DedicatedVm { .. } => settings.domain.vm_ingress_ip.clone().ok_or_else(|| {
            PreviewError::config("domain.vm_ingress_ip is required for dedicated-VM environments")
                .into()
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateState {
    /// Carries the reason cert-manager reports, if any
    Pending(String),
    Ready,
}

/// State of a cert-manager Certificate from its `Ready` condition
pub fn certificate_state(certificate: &DynamicObject) -> CertificateState {
    let conditions = certificate.data["status"]["conditions"].as_array();
    let ready = conditions.and_then(|conditions| {
        conditions
            .iter()
            .find(|c| c["type"].as_str() == Some("Ready"))
    });

    match ready {
        Some(c) if c["status"].as_str() == Some("True") => CertificateState::Ready,
        Some(c) => CertificateState::Pending(
            c["message"]
                .as_str()
                .or_else(|| c["reason"].as_str())
                .unwrap_or("not ready")
                .to_string(),
        ),
        None => CertificateState::Pending("no Ready condition yet".to_string()),
    }
}

pub fn owner_of(certificate: &DynamicObject) -> Option<&str> {
    certificate
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(OWNER_ANNOTATION))
        .map(String::as_str)
}

/// A copy of `source` under a new name and namespace, without any
/// server-assigned metadata
pub fn copy_secret(source: &Secret, name: &str, namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: source.metadata.labels.clone(),
            ..Default::default()
        },
        data: source.data.clone(),
        type_: source.type_.clone(),
        ..Default::default()
    }
}

pub struct CertificateCoordinator {
    /// Cluster running cert-manager and holding the issued certificates
    cluster: ClusterHandle,
    runner: Arc<dyn CommandRunner>,
    settings: CertificateSettings,
}

impl CertificateCoordinator {
    pub fn new(
        cluster: ClusterHandle,
        runner: Arc<dyn CommandRunner>,
        settings: CertificateSettings,
    ) -> Self {
        Self {
            cluster,
            runner,
            settings,
        }
    }

    fn api(&self) -> Api<DynamicObject> {
        Api::namespaced_with(
            self.cluster.client(),
            &self.settings.namespace,
            &certificate_resource(),
        )
    }

    /// `terraform init` and `terraform apply` for a request.
    ///
    /// Each certificate gets its own data dir and state file so that
    /// concurrent issues do not share a lock.
    pub fn terraform_commands(&self, req: &CertificateRequest) -> Vec<CommandSpec> {
        let data_dir = format!(".terraform-{}", req.cert_name);
        let base = CommandSpec::new(&self.settings.terraform)
            .current_dir(&self.settings.terraform_dir)
            .env("TF_DATA_DIR", data_dir)
            .env("TF_IN_AUTOMATION", "1");

        let init = base.clone().args(["init", "-input=false"]);
        let apply = base
            .args(["apply", "-auto-approve", "-input=false"])
            .arg(format!("-state={}.tfstate", req.cert_name))
            .arg("-var")
            .arg(format!("namespace={}", req.cert_namespace))
            .arg("-var")
            .arg(format!("cert_name={}", req.cert_name))
            .arg("-var")
            .arg(format!("dns_zone_domain={}", req.dns_zone))
            .arg("-var")
            .arg(format!("domain={}", req.domain))
            .arg("-var")
            .arg(format!("public_ip={}", req.ip))
            .arg("-var")
            .arg(format!("subdomains={}", req.hcl_subdomains()));
        vec![init, apply]
    }

    /// Issue a certificate and wait until cert-manager reports it ready.
    ///
    /// Issuing the same request again converges on the same Certificate.
    pub async fn issue(&self, req: &CertificateRequest) -> Result<()> {
        req.check_common_name()?;
        info!(certificate = %req.cert_name, domain = %req.domain, "Issuing certificate");

        for spec in self.terraform_commands(req) {
            run_checked(self.runner.as_ref(), &spec)
                .await
                .with_context(|| format!("Failed to issue certificate {}", req.cert_name))?;
        }

        if let Err(error) = self.wait_until_ready(&req.cert_name).await {
            if error
                .downcast_ref::<PreviewError>()
                .map(PreviewError::is_timeout)
                .unwrap_or(false)
            {
                self.log_diagnostics(&req.cert_name).await;
            }
            return Err(error);
        }

        self.annotate_owner(&req.cert_name, &req.owner).await?;
        info!(certificate = %req.cert_name, "Certificate is ready");
        Ok(())
    }

    async fn wait_until_ready(&self, name: &str) -> Result<()> {
        let api = self.api();
        let operation = format!("readiness of certificate {}", name);

        poll_until(&self.settings.poll.config(), &operation, || {
            let api = api.clone();
            let name = name.to_string();
            async move {
                Ok(match api.get_opt(&name).await? {
                    None => Poll::Pending(format!("certificate {} does not exist yet", name)),
                    Some(certificate) => match certificate_state(&certificate) {
                        CertificateState::Ready => Poll::Ready(()),
                        CertificateState::Pending(reason) => Poll::Pending(reason),
                    },
                })
            }
        })
        .await
    }

    async fn log_diagnostics(&self, name: &str) {
        match self.api().get_opt(name).await {
            Ok(Some(certificate)) => match serde_yaml::to_string(&certificate) {
                Ok(yaml) => warn!(certificate = %name, "Certificate at timeout:\n{}", yaml),
                Err(e) => warn!(certificate = %name, error = %e, "Failed to render certificate"),
            },
            Ok(None) => warn!(certificate = %name, "Certificate does not exist"),
            Err(e) => warn!(certificate = %name, error = %e, "Failed to fetch certificate"),
        }

        let spec = self
            .settings
            .diagnostic_command
            .render(&[("name", name), ("namespace", &self.settings.namespace)]);
        match self.runner.run(&spec).await {
            Ok(output) => warn!(
                certificate = %name,
                "{} ({}):\n{}{}",
                spec,
                output.status_description(),
                output.stdout,
                output.stderr
            ),
            Err(e) => warn!(certificate = %name, error = %e, "Failed to run {}", spec),
        }
    }

    async fn annotate_owner(&self, name: &str, owner: &str) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": { OWNER_ANNOTATION: owner } } });
        self.api()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("Failed to annotate certificate {}", name))?;
        Ok(())
    }

    /// Copy the issued certificate's Secret into `destination`.
    ///
    /// The destination namespace has to exist already.
    pub async fn install(
        &self,
        req: &CertificateRequest,
        destination: &ClusterHandle,
        destination_namespace: &str,
        destination_secret: &str,
    ) -> Result<()> {
        let source: Api<Secret> = Api::namespaced(self.cluster.client(), &req.cert_namespace);
        let Some(secret) = source
            .get_opt(&req.cert_name)
            .await
            .with_context(|| format!("Failed to read secret {}", req.cert_name))?
        else {
            bail!(
                "Secret {} not found in {} on {}",
                req.cert_name,
                req.cert_namespace,
                self.cluster
            );
        };

        let copy = copy_secret(&secret, destination_secret, destination_namespace);
        let target: Api<Secret> = Api::namespaced(destination.client(), destination_namespace);
        target
            .patch(
                destination_secret,
                &PatchParams::apply(MANAGED_BY).force(),
                &Patch::Apply(&copy),
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to install certificate into {}/{} on {}",
                    destination_namespace, destination_secret, destination
                )
            })?;

        info!(
            certificate = %req.cert_name,
            destination = %destination,
            namespace = %destination_namespace,
            secret = %destination_secret,
            "Installed certificate"
        );
        Ok(())
    }

    /// Names and owners of every certificate in the certificate namespace
    pub async fn list_owners(&self) -> Result<Vec<(String, Option<String>)>> {
        let certificates = self
            .api()
            .list(&ListParams::default())
            .await
            .context("Failed to list certificates")?;
        Ok(certificates
            .items
            .iter()
            .filter_map(|c| {
                let name = c.metadata.name.clone()?;
                Some((name, owner_of(c).map(str::to_string)))
            })
            .collect())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        match self.api().delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(certificate = %name, "Deleted certificate");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(certificate = %name, "Certificate already gone");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to delete certificate {}", name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::cluster::testing::offline;
    use crate::preview::naming::{Backing, PreviewEnvironment};
    use crate::preview::settings::testing::settings;
    use crate::preview::shell::testing::RecordingRunner;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn certificate(status: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "Certificate",
            "metadata": { "name": "staging-feature-x", "namespace": "certs" },
            "spec": {},
            "status": status,
        }))
        .unwrap()
    }

    fn shared_env() -> PreviewEnvironment {
        PreviewEnvironment::for_branch(
            &settings().naming_scheme(),
            "feature-x",
            Backing::SharedCluster,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_ready_condition() {
        let ready = certificate(json!({
            "conditions": [
                { "type": "Issuing", "status": "False" },
                { "type": "Ready", "status": "True" },
            ]
        }));
        assert_eq!(certificate_state(&ready), CertificateState::Ready);

        let pending = certificate(json!({
            "conditions": [{ "type": "Ready", "status": "False", "message": "Waiting on DNS-01" }]
        }));
        assert_eq!(
            certificate_state(&pending),
            CertificateState::Pending("Waiting on DNS-01".to_string())
        );

        let fresh = certificate(json!({}));
        assert_eq!(
            certificate_state(&fresh),
            CertificateState::Pending("no Ready condition yet".to_string())
        );
    }

    #[test]
    fn test_workload_request() {
        let req = CertificateRequest::workload(&shared_env(), &settings()).unwrap();
        assert_eq!(req.cert_name, "staging-feature-x");
        assert_eq!(req.cert_namespace, "certs");
        assert_eq!(req.ip, "10.0.0.1");
        assert_eq!(req.owner, "feature-x");
        assert_eq!(
            req.sans(),
            vec![
                "feature-x.staging.example.dev",
                "*.feature-x.staging.example.dev",
                "*.ws-dev.feature-x.staging.example.dev",
            ]
        );
        assert_eq!(req.hcl_subdomains(), r#"["", "*.", "*.ws-dev."]"#);
    }

    #[test]
    fn test_vm_ingress_request_needs_vm_ip() {
        let mut s = settings();
        let env = PreviewEnvironment::for_branch(
            &s.naming_scheme(),
            "feature-x",
            Backing::DedicatedVm {
                vm_name: "preview-feature-x".to_string(),
                deployment_namespace: "default".to_string(),
                kubeconfig_path: PathBuf::from("/tmp/preview-feature-x.yaml"),
            },
            None,
        )
        .unwrap();

        let req = CertificateRequest::vm_ingress(&env, &s).unwrap();
        assert_eq!(req.cert_name, "preview-feature-x-ingress");
        assert_eq!(req.ip, "10.0.0.2");
        assert!(req.sans().contains(&"*.ws.feature-x.preview.example.dev".to_string()));

        s.domain.vm_ingress_ip = None;
        assert!(CertificateRequest::vm_ingress(&env, &s).is_err());
    }

    #[test]
    fn test_common_name_length() {
        let mut req = CertificateRequest::workload(&shared_env(), &settings()).unwrap();
        assert!(req.check_common_name().is_ok());

        req.domain = format!("{}.example.dev", "a".repeat(60));
        let err = req.check_common_name().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PreviewError>(),
            Some(PreviewError::Config(_))
        ));
    }

    #[test]
    fn test_copy_secret_strips_server_metadata() {
        let source = Secret {
            metadata: ObjectMeta {
                name: Some("staging-feature-x".to_string()),
                namespace: Some("certs".to_string()),
                uid: Some("abc".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(BTreeMap::new()),
            ..Default::default()
        };

        let copy = copy_secret(&source, "proxy-config-certificates", "staging-feature-x");
        assert_eq!(copy.metadata.name.as_deref(), Some("proxy-config-certificates"));
        assert_eq!(copy.metadata.namespace.as_deref(), Some("staging-feature-x"));
        assert!(copy.metadata.uid.is_none());
        assert!(copy.metadata.resource_version.is_none());
        assert_eq!(copy.type_.as_deref(), Some("kubernetes.io/tls"));
    }

    #[test]
    fn test_owner_annotation() {
        let mut cert = certificate(json!({}));
        assert_eq!(owner_of(&cert), None);
        cert.metadata.annotations = Some(BTreeMap::from([(
            OWNER_ANNOTATION.to_string(),
            "feature-x".to_string(),
        )]));
        assert_eq!(owner_of(&cert), Some("feature-x"));
    }

    #[tokio::test]
    async fn test_terraform_commands() {
        let coordinator = CertificateCoordinator::new(
            offline("shared"),
            Arc::new(RecordingRunner::new()),
            settings().certificates,
        );
        let req = CertificateRequest::workload(&shared_env(), &settings()).unwrap();
        let commands = coordinator.terraform_commands(&req);

        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].to_string(), "terraform init -input=false");
        assert_eq!(
            commands[1].current_dir,
            Some(PathBuf::from("infra/certificate"))
        );
        assert!(commands[1].args.contains(&"cert_name=staging-feature-x".to_string()));
        assert!(commands[1]
            .args
            .contains(&r#"subdomains=["", "*.", "*.ws-dev."]"#.to_string()));
        assert_eq!(
            commands[1].env.get("TF_DATA_DIR").map(String::as_str),
            Some(".terraform-staging-feature-x")
        );
    }

    #[tokio::test]
    async fn test_terraform_failure_stops_issue() {
        let runner = Arc::new(RecordingRunner::new().respond(|spec| {
            spec.args
                .first()
                .filter(|a| *a == "init")
                .map(|_| crate::preview::shell::testing::failed(1, "backend unreachable"))
        }));
        let coordinator =
            CertificateCoordinator::new(offline("shared"), runner.clone(), settings().certificates);
        let req = CertificateRequest::workload(&shared_env(), &settings()).unwrap();

        let err = coordinator.issue(&req).await.unwrap_err();
        assert!(format!("{:#}", err).contains("backend unreachable"));
        assert_eq!(runner.calls().len(), 1);
    }
}
