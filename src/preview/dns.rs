//! DNS records for preview domains.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use tracing::{debug, info};

use super::cluster::ClusterHandle;
use super::error::PreviewError;
use super::naming::{Backing, PreviewEnvironment};
use super::poll::{poll_until, Poll, PollConfig};
use super::settings::{DnsSettings, DomainSettings};
use super::shell::{run_checked, CommandRunner, CommandTemplate};

#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn upsert_a_record(&self, name: &str, ip: &str) -> Result<()>;
    async fn delete_record(&self, name: &str) -> Result<()>;
}

/// Manages records by running configured commands
pub struct CommandDnsProvider {
    runner: Arc<dyn CommandRunner>,
    zone: String,
    upsert: CommandTemplate,
    delete: CommandTemplate,
}

impl CommandDnsProvider {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: &DnsSettings) -> Self {
        Self {
            runner,
            zone: settings.zone.clone(),
            upsert: settings.upsert_command.clone(),
            delete: settings.delete_command.clone(),
        }
    }
}

#[async_trait]
impl DnsProvider for CommandDnsProvider {
    async fn upsert_a_record(&self, name: &str, ip: &str) -> Result<()> {
        let spec = self
            .upsert
            .render(&[("zone", &self.zone), ("name", name), ("ip", ip)]);
        run_checked(self.runner.as_ref(), &spec)
            .await
            .with_context(|| format!("Failed to create DNS record {} -> {}", name, ip))?;
        debug!(record = %name, ip = %ip, "Upserted A record");
        Ok(())
    }

    async fn delete_record(&self, name: &str) -> Result<()> {
        let spec = self.delete.render(&[("zone", &self.zone), ("name", name)]);
        run_checked(self.runner.as_ref(), &spec)
            .await
            .with_context(|| format!("Failed to delete DNS record {}", name))?;
        debug!(record = %name, "Deleted record");
        Ok(())
    }
}

/// Records for `domain`: the apex, `*.domain`, and `<sub>.domain` per extra
pub fn record_names(domain: &str, extra: &[String]) -> Vec<String> {
    let mut names = vec![domain.to_string(), format!("*.{}", domain)];
    names.extend(extra.iter().map(|sub| format!("{}.{}", sub, domain)));
    names
}

/// Point every record of `domain` at `ip`; all upserts run concurrently
pub async fn bind(
    provider: &dyn DnsProvider,
    domain: &str,
    ip: &str,
    extra: &[String],
) -> Result<()> {
    let names = record_names(domain, extra);
    try_join_all(names.iter().map(|name| provider.upsert_a_record(name, ip))).await?;
    info!(domain = %domain, ip = %ip, records = names.len(), "Bound DNS records");
    Ok(())
}

/// Remove the records [`bind`] creates
pub async fn unbind(provider: &dyn DnsProvider, domain: &str, extra: &[String]) -> Result<()> {
    let names = record_names(domain, extra);
    try_join_all(names.iter().map(|name| provider.delete_record(name))).await?;
    info!(domain = %domain, records = names.len(), "Removed DNS records");
    Ok(())
}

/// External address of a LoadBalancer service, if it has one yet
pub fn load_balancer_address(service: &Service) -> Option<String> {
    let ingress = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;
    ingress.ip.clone().or_else(|| ingress.hostname.clone())
}

pub async fn wait_for_load_balancer_ip(
    cluster: &ClusterHandle,
    namespace: &str,
    service: &str,
    config: &PollConfig,
) -> Result<String> {
    let api: Api<Service> = Api::namespaced(cluster.client(), namespace);
    let operation = format!("load balancer address of {}/{}", namespace, service);

    poll_until(config, &operation, || {
        let api = api.clone();
        let service = service.to_string();
        async move {
            Ok(match api.get_opt(&service).await? {
                None => Poll::Pending(format!("service {} does not exist", service)),
                Some(svc) => match load_balancer_address(&svc) {
                    Some(address) => Poll::Ready(address),
                    None => Poll::Pending(format!("service {} has no ingress yet", service)),
                },
            })
        }
    })
    .await
}

/// A set of records pointing at one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSet {
    pub domain: String,
    pub ip: String,
    pub extra: Vec<String>,
}

/// Binds the records an environment needs once it is up
pub struct DnsBinder {
    provider: Arc<dyn DnsProvider>,
    settings: DnsSettings,
    domain: DomainSettings,
}

impl DnsBinder {
    pub fn new(provider: Arc<dyn DnsProvider>, settings: DnsSettings, domain: DomainSettings) -> Self {
        Self {
            provider,
            settings,
            domain,
        }
    }

    /// Records for an environment. `proxy_ip` is the workspace proxy's
    /// load balancer and only matters on the shared cluster.
    pub fn record_sets(
        &self,
        env: &PreviewEnvironment,
        proxy_ip: Option<&str>,
    ) -> Result<Vec<RecordSet>> {
        match env.backing {
            Backing::SharedCluster => {
                let mut sets = vec![RecordSet {
                    domain: env.domain.clone(),
                    ip: self.domain.ingress_ip.clone(),
                    extra: self.settings.subdomains.clone(),
                }];
                if let Some(ip) = proxy_ip {
                    sets.extend(self.settings.proxy_subdomains.iter().map(|sub| RecordSet {
                        domain: format!("{}.{}", sub, env.domain),
                        ip: ip.to_string(),
                        extra: Vec::new(),
                    }));
                }
                Ok(sets)
            }
            Backing::DedicatedVm { .. } => {
                let ip = self.domain.vm_ingress_ip.clone().ok_or_else(|| {
                    PreviewError::config(
                        "domain.vm_ingress_ip is required for dedicated-VM environments",
                    )
                })?;
                let mut extra = self.settings.subdomains.clone();
                extra.extend(self.settings.proxy_subdomains.iter().cloned());
                Ok(vec![RecordSet {
                    domain: env.domain.clone(),
                    ip,
                    extra,
                }])
            }
        }
    }

    /// Bind every record of `env`. On the shared cluster this first waits
    /// for the proxy's load balancer address.
    pub async fn bind_environment(&self, cluster: &ClusterHandle, env: &PreviewEnvironment) -> Result<()> {
        let proxy_ip = match env.backing {
            Backing::SharedCluster => Some(
                wait_for_load_balancer_ip(
                    cluster,
                    &env.namespace,
                    &self.settings.proxy_service,
                    &self.settings.load_balancer_poll.config(),
                )
                .await
                .context("The proxy load balancer never got an address")?,
            ),
            Backing::DedicatedVm { .. } => None,
        };

        for set in self.record_sets(env, proxy_ip.as_deref())? {
            self.bind_set(&set).await?;
        }
        Ok(())
    }

    async fn bind_set(&self, set: &RecordSet) -> Result<()> {
        if set.extra.is_empty() && set.domain.starts_with("*.") {
            // A wildcard set is one record; `bind` would add `*.*.`.
            return self.provider.upsert_a_record(&set.domain, &set.ip).await;
        }
        bind(self.provider.as_ref(), &set.domain, &set.ip, &set.extra).await
    }

    /// Delete every record `bind_environment` may have created
    pub async fn unbind_environment(&self, env: &PreviewEnvironment) -> Result<()> {
        let mut extra = self.settings.subdomains.clone();
        extra.extend(self.settings.proxy_subdomains.iter().cloned());
        unbind(self.provider.as_ref(), &env.domain, &extra).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory zone
    #[derive(Default)]
    pub struct FakeDns {
        pub records: Mutex<BTreeMap<String, String>>,
        pub fail_on: Option<String>,
    }

    #[async_trait]
    impl DnsProvider for FakeDns {
        async fn upsert_a_record(&self, name: &str, ip: &str) -> Result<()> {
            if self.fail_on.as_deref() == Some(name) {
                anyhow::bail!("quota exceeded for {}", name);
            }
            self.records
                .lock()
                .unwrap()
                .insert(name.to_string(), ip.to_string());
            Ok(())
        }

        async fn delete_record(&self, name: &str) -> Result<()> {
            self.records.lock().unwrap().remove(name);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeDns;
    use super::*;
    use crate::preview::settings::testing::settings;
    use crate::preview::shell::testing::RecordingRunner;
    use std::path::PathBuf;

    fn binder(provider: Arc<FakeDns>) -> DnsBinder {
        let s = settings();
        DnsBinder::new(provider, s.dns, s.domain)
    }

    fn env(backing: Backing) -> PreviewEnvironment {
        PreviewEnvironment::for_branch(&settings().naming_scheme(), "feature-x", backing, None)
            .unwrap()
    }

    fn vm() -> Backing {
        Backing::DedicatedVm {
            vm_name: "preview-feature-x".to_string(),
            deployment_namespace: "default".to_string(),
            kubeconfig_path: PathBuf::from("/tmp/preview-feature-x.yaml"),
        }
    }

    #[test]
    fn test_record_names() {
        assert_eq!(
            record_names("a.example.dev", &["*.ws-dev".to_string()]),
            vec!["a.example.dev", "*.a.example.dev", "*.ws-dev.a.example.dev"]
        );
    }

    #[tokio::test]
    async fn test_bind_and_unbind() {
        let fake = Arc::new(FakeDns::default());
        bind(fake.as_ref(), "a.example.dev", "10.0.0.1", &["*.ws-dev".to_string()])
            .await
            .unwrap();
        assert_eq!(fake.records.lock().unwrap().len(), 3);

        unbind(fake.as_ref(), "a.example.dev", &["*.ws-dev".to_string()])
            .await
            .unwrap();
        assert!(fake.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure_propagates() {
        let fake = Arc::new(FakeDns {
            fail_on: Some("*.a.example.dev".to_string()),
            ..Default::default()
        });
        let err = bind(fake.as_ref(), "a.example.dev", "10.0.0.1", &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn test_shared_cluster_record_sets() {
        let binder = binder(Arc::new(FakeDns::default()));
        let sets = binder
            .record_sets(&env(Backing::SharedCluster), Some("34.1.2.3"))
            .unwrap();
        assert_eq!(
            sets,
            vec![
                RecordSet {
                    domain: "feature-x.staging.example.dev".to_string(),
                    ip: "10.0.0.1".to_string(),
                    extra: vec!["*.ws-dev".to_string()],
                },
                RecordSet {
                    domain: "*.ws.feature-x.staging.example.dev".to_string(),
                    ip: "34.1.2.3".to_string(),
                    extra: vec![],
                },
            ]
        );
    }

    #[test]
    fn test_vm_records_all_point_at_vm_ingress() {
        let binder = binder(Arc::new(FakeDns::default()));
        let sets = binder.record_sets(&env(vm()), None).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].ip, "10.0.0.2");
        assert_eq!(sets[0].extra, vec!["*.ws-dev", "*.ws"]);
    }

    #[tokio::test]
    async fn test_vm_environment_binds_without_cluster() {
        let fake = Arc::new(FakeDns::default());
        let binder = binder(fake.clone());
        let cluster = crate::preview::cluster::testing::offline("vm");
        binder.bind_environment(&cluster, &env(vm())).await.unwrap();

        let records = fake.records.lock().unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.values().all(|ip| ip == "10.0.0.2"));
        assert!(records.contains_key("*.ws.feature-x.preview.example.dev"));
    }

    #[tokio::test]
    async fn test_wildcard_set_is_a_single_record() {
        let fake = Arc::new(FakeDns::default());
        let binder = binder(fake.clone());
        binder
            .bind_set(&RecordSet {
                domain: "*.ws.a.example.dev".to_string(),
                ip: "34.1.2.3".to_string(),
                extra: vec![],
            })
            .await
            .unwrap();
        let records = fake.records.lock().unwrap();
        assert_eq!(records.keys().collect::<Vec<_>>(), vec!["*.ws.a.example.dev"]);
    }

    #[tokio::test]
    async fn test_command_provider_renders_templates() {
        let runner = Arc::new(RecordingRunner::new());
        let provider = CommandDnsProvider::new(runner.clone(), &settings().dns);
        provider
            .upsert_a_record("*.a.example.dev", "10.0.0.1")
            .await
            .unwrap();
        provider.delete_record("a.example.dev").await.unwrap();
        assert_eq!(
            runner.command_lines(),
            vec![
                "dns.sh upsert example-dev *.a.example.dev 10.0.0.1",
                "dns.sh delete example-dev a.example.dev",
            ]
        );
    }
}
