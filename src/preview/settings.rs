use config::{Config, ConfigError};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;

use super::naming::NamingScheme;
use super::poll::PollSettings;
use super::ports::PortRange;
use super::shell::CommandTemplate;

lazy_static! {
    static ref ENV_VAR_PATTERN: Regex = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub clusters: ClusterSettings,
    #[serde(default)]
    pub naming: NamingSettings,
    pub domain: DomainSettings,
    #[serde(default)]
    pub certificates: CertificateSettings,
    #[serde(default)]
    pub ports: PortSettings,
    #[serde(default)]
    pub readiness: ReadinessSettings,
    pub dns: DnsSettings,
    #[serde(default)]
    pub installer: InstallerSettings,
    #[serde(default)]
    pub wipe: WipeSettings,
    #[serde(default)]
    pub vm: VmSettings,
    #[serde(default)]
    pub gc: GcSettings,
}

/// How to reach one cluster
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClusterConnection {
    /// Kubeconfig path. Falls back to in-cluster or ~/.kube/config when unset.
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClusterSettings {
    /// The shared development cluster. Also holds the certificate namespace.
    #[serde(default)]
    pub shared: ClusterConnection,
    /// The cluster hosting preview VMs. Only needed for dedicated-VM environments.
    #[serde(default)]
    pub vm_host: Option<ClusterConnection>,
}

fn default_shared_prefix() -> String {
    "staging".to_string()
}

fn default_vm_prefix() -> String {
    "preview".to_string()
}

fn default_trunk_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct NamingSettings {
    /// Namespace prefix for shared-cluster environments (default: "staging")
    #[serde(default = "default_shared_prefix")]
    pub shared_prefix: String,
    /// Namespace prefix for dedicated-VM environments (default: "preview")
    #[serde(default = "default_vm_prefix")]
    pub vm_prefix: String,
    /// Branch whose environment is never swept (default: "main")
    #[serde(default = "default_trunk_branch")]
    pub trunk_branch: String,
}

impl Default for NamingSettings {
    fn default() -> Self {
        Self {
            shared_prefix: default_shared_prefix(),
            vm_prefix: default_vm_prefix(),
            trunk_branch: default_trunk_branch(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DomainSettings {
    /// Environments on the shared cluster live at `<name>.<base_domain>`
    pub base_domain: String,
    /// Base domain for dedicated-VM environments (defaults to `base_domain`)
    #[serde(default)]
    pub vm_base_domain: Option<String>,
    /// Static ingress IP of the shared cluster
    pub ingress_ip: String,
    /// Static ingress IP in front of the VM host cluster
    #[serde(default)]
    pub vm_ingress_ip: Option<String>,
}

fn default_cert_namespace() -> String {
    "certs".to_string()
}

fn default_cert_terraform_dir() -> String {
    "infra/certificate".to_string()
}

fn default_cert_subdomains() -> Vec<String> {
    vec!["".to_string(), "*.".to_string(), "*.ws-dev.".to_string()]
}

fn default_vm_cert_subdomains() -> Vec<String> {
    vec!["".to_string(), "*.".to_string(), "*.ws.".to_string()]
}

fn default_destination_secret() -> String {
    "proxy-config-certificates".to_string()
}

fn default_cert_poll() -> PollSettings {
    PollSettings::new(5, 120)
}

fn default_cert_diagnostic() -> CommandTemplate {
    CommandTemplate::new(
        "cmctl",
        &["status", "certificate", "{name}", "-n", "{namespace}"],
    )
}

fn default_vm_cert_destination_namespace() -> String {
    "loadbalancers".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertificateSettings {
    /// Namespace on the shared cluster holding every issued certificate (default: "certs")
    #[serde(default = "default_cert_namespace")]
    pub namespace: String,
    /// Terraform module that issues a certificate
    #[serde(default = "default_cert_terraform_dir")]
    pub terraform_dir: String,
    #[serde(default = "default_terraform")]
    pub terraform: String,
    /// Prefixes prepended to the domain to form the certificate's SANs
    #[serde(default = "default_cert_subdomains")]
    pub subdomains: Vec<String>,
    /// Secret name the deployment expects the certificate under
    #[serde(default = "default_destination_secret")]
    pub destination_secret: String,
    #[serde(default = "default_cert_poll")]
    pub poll: PollSettings,
    /// Run on timeout and logged. Placeholders: {name}, {namespace}
    #[serde(default = "default_cert_diagnostic")]
    pub diagnostic_command: CommandTemplate,
    /// SAN prefixes for the ingress certificate of a dedicated VM
    #[serde(default = "default_vm_cert_subdomains")]
    pub vm_subdomains: Vec<String>,
    /// Namespace on the shared cluster that receives the VM ingress certificate
    #[serde(default = "default_vm_cert_destination_namespace")]
    pub vm_destination_namespace: String,
}

fn default_terraform() -> String {
    "terraform".to_string()
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            namespace: default_cert_namespace(),
            terraform_dir: default_cert_terraform_dir(),
            terraform: default_terraform(),
            subdomains: default_cert_subdomains(),
            destination_secret: default_destination_secret(),
            poll: default_cert_poll(),
            diagnostic_command: default_cert_diagnostic(),
            vm_subdomains: default_vm_cert_subdomains(),
            vm_destination_namespace: default_vm_cert_destination_namespace(),
        }
    }
}

fn default_ws_daemon_range() -> PortRange {
    PortRange::new(10000, 10999)
}

fn default_registry_facade_range() -> PortRange {
    PortRange::new(20000, 20999)
}

fn default_node_port_range() -> PortRange {
    PortRange::new(30000, 30999)
}

fn default_ws_daemon_name() -> String {
    "ws-daemon".to_string()
}

fn default_registry_facade_name() -> String {
    "registry-facade".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortSettings {
    #[serde(default = "default_ws_daemon_range")]
    pub ws_daemon_range: PortRange,
    #[serde(default = "default_registry_facade_range")]
    pub registry_facade_range: PortRange,
    #[serde(default = "default_node_port_range")]
    pub registry_node_port_range: PortRange,
    /// DaemonSet whose first container's host port is reused on redeploy
    #[serde(default = "default_ws_daemon_name")]
    pub ws_daemon_daemonset: String,
    #[serde(default = "default_registry_facade_name")]
    pub registry_facade_daemonset: String,
    /// Service whose node port is reused on redeploy
    #[serde(default = "default_registry_facade_name")]
    pub registry_facade_service: String,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            ws_daemon_range: default_ws_daemon_range(),
            registry_facade_range: default_registry_facade_range(),
            registry_node_port_range: default_node_port_range(),
            ws_daemon_daemonset: default_ws_daemon_name(),
            registry_facade_daemonset: default_registry_facade_name(),
            registry_facade_service: default_registry_facade_name(),
        }
    }
}

fn default_api_poll() -> PollSettings {
    PollSettings::new(2, 300)
}

fn default_pod_poll() -> PollSettings {
    PollSettings::new(3, 200)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReadinessSettings {
    /// API server health (default: every 2s, 300 attempts)
    #[serde(default = "default_api_poll")]
    pub api: PollSettings,
    /// Pod readiness (default: every 3s, 200 attempts)
    #[serde(default = "default_pod_poll")]
    pub pods: PollSettings,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            api: default_api_poll(),
            pods: default_pod_poll(),
        }
    }
}

fn default_dns_subdomains() -> Vec<String> {
    vec!["*.ws-dev".to_string()]
}

fn default_proxy_service() -> String {
    "proxy".to_string()
}

fn default_proxy_subdomains() -> Vec<String> {
    vec!["*.ws".to_string()]
}

fn default_lb_poll() -> PollSettings {
    PollSettings::new(1, 60)
}

#[derive(Debug, Deserialize, Clone)]
pub struct DnsSettings {
    /// Managed zone the records are created in
    pub zone: String,
    /// Creates or updates an A record. Placeholders: {zone}, {name}, {ip}
    pub upsert_command: CommandTemplate,
    /// Removes an A record. Placeholders: {zone}, {name}
    pub delete_command: CommandTemplate,
    /// Extra subdomains bound to the ingress IP besides the apex and `*.`
    #[serde(default = "default_dns_subdomains")]
    pub subdomains: Vec<String>,
    /// LoadBalancer service of the workspace proxy in shared-cluster environments
    #[serde(default = "default_proxy_service")]
    pub proxy_service: String,
    /// Subdomains bound to the proxy load balancer's IP
    #[serde(default = "default_proxy_subdomains")]
    pub proxy_subdomains: Vec<String>,
    /// Waiting for the proxy load balancer (default: every 1s, 60 attempts)
    #[serde(default = "default_lb_poll")]
    pub load_balancer_poll: PollSettings,
}

fn default_installer() -> String {
    "installer".to_string()
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_migrations_job() -> String {
    "migrations".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstallerSettings {
    /// Renders manifests to stdout from a values file
    #[serde(default = "default_installer")]
    pub program: String,
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    /// One-shot Job removed before every deploy so it runs again
    #[serde(default = "default_migrations_job")]
    pub migrations_job: String,
    /// Default image version when the job does not name one
    #[serde(default)]
    pub default_version: Option<String>,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            program: default_installer(),
            kubectl: default_kubectl(),
            migrations_job: default_migrations_job(),
            default_version: None,
        }
    }
}

fn default_installer_configmap() -> String {
    "installer-app".to_string()
}

fn default_manifest_key() -> String {
    "app.yaml".to_string()
}

fn default_helm() -> String {
    "helm".to_string()
}

fn default_helm_release() -> String {
    "{namespace}".to_string()
}

fn default_workload_selector() -> String {
    "component=workspace".to_string()
}

fn default_pod_delete_timeout() -> u64 {
    10
}

fn default_namespace_deletion_poll() -> PollSettings {
    PollSettings::new(2, 150)
}

#[derive(Debug, Deserialize, Clone)]
pub struct WipeSettings {
    /// ConfigMap an installer deployment leaves behind, holding the applied manifests
    #[serde(default = "default_installer_configmap")]
    pub installer_configmap: String,
    #[serde(default = "default_manifest_key")]
    pub manifest_key: String,
    #[serde(default = "default_helm")]
    pub helm: String,
    /// Release name of legacy deployments. Placeholder: {namespace}
    #[serde(default = "default_helm_release")]
    pub helm_release: String,
    /// Label selector of user workload pods
    #[serde(default = "default_workload_selector")]
    pub workload_selector: String,
    /// Seconds a workload pod gets to go away before it is force-deleted
    #[serde(default = "default_pod_delete_timeout")]
    pub pod_delete_timeout_secs: u64,
    /// Waiting for namespace deletion (default: every 2s, 150 attempts)
    #[serde(default = "default_namespace_deletion_poll")]
    pub namespace_deletion_poll: PollSettings,
}

impl Default for WipeSettings {
    fn default() -> Self {
        Self {
            installer_configmap: default_installer_configmap(),
            manifest_key: default_manifest_key(),
            helm: default_helm(),
            helm_release: default_helm_release(),
            workload_selector: default_workload_selector(),
            pod_delete_timeout_secs: default_pod_delete_timeout(),
            namespace_deletion_poll: default_namespace_deletion_poll(),
        }
    }
}

fn default_vm_provision_command() -> CommandTemplate {
    CommandTemplate::new(
        "dev/preview/start-vm.sh",
        &["--name", "{name}", "--cpu", "{cpu}", "--memory", "{memory}"],
    )
}

fn default_vm_kubeconfig_command() -> CommandTemplate {
    CommandTemplate::new(
        "dev/preview/get-kubeconfig.sh",
        &["--name", "{name}", "--output", "{path}"],
    )
}

fn default_kubeconfig_dir() -> String {
    "/tmp/preview-kubeconfigs".to_string()
}

fn default_deployment_namespace() -> String {
    "default".to_string()
}

fn default_vm_ports() -> FixedPorts {
    FixedPorts {
        ws_daemon: 10000,
        registry_facade: 20000,
        registry_node_port: 31750,
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct FixedPorts {
    pub ws_daemon: u16,
    pub registry_facade: u16,
    pub registry_node_port: u16,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct VmSize {
    pub cpu: u32,
    /// GiB
    pub memory: u32,
}

fn default_vm_size() -> VmSize {
    VmSize { cpu: 6, memory: 12 }
}

fn default_large_vm_size() -> VmSize {
    VmSize {
        cpu: 12,
        memory: 24,
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VmSettings {
    /// Creates or updates the VM. Placeholders: {name}, {cpu}, {memory}
    #[serde(default = "default_vm_provision_command")]
    pub provision_command: CommandTemplate,
    /// Writes the VM sub-cluster kubeconfig to a file. Placeholders: {name}, {path}
    #[serde(default = "default_vm_kubeconfig_command")]
    pub kubeconfig_command: CommandTemplate,
    #[serde(default = "default_kubeconfig_dir")]
    pub kubeconfig_dir: String,
    /// Namespace inside the sub-cluster the product is deployed to
    #[serde(default = "default_deployment_namespace")]
    pub deployment_namespace: String,
    /// Every VM runs its own cluster, so ports never collide there
    #[serde(default = "default_vm_ports")]
    pub ports: FixedPorts,
    #[serde(default = "default_vm_size")]
    pub default_size: VmSize,
    #[serde(default = "default_large_vm_size")]
    pub large_size: VmSize,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            provision_command: default_vm_provision_command(),
            kubeconfig_command: default_vm_kubeconfig_command(),
            kubeconfig_dir: default_kubeconfig_dir(),
            deployment_namespace: default_deployment_namespace(),
            ports: default_vm_ports(),
            default_size: default_vm_size(),
            large_size: default_large_vm_size(),
        }
    }
}

fn default_freshness_days() -> i64 {
    2
}

fn default_activity_window_hours() -> i64 {
    48
}

fn default_match_legacy_names() -> bool {
    true
}

fn default_repo_path() -> String {
    ".".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_git() -> String {
    "git".to_string()
}

fn default_db_pod() -> String {
    "mysql-0".to_string()
}

fn default_activity_query() -> Vec<String> {
    vec![
        "mysql".to_string(),
        "--user=root".to_string(),
        "--password=test".to_string(),
        "--database=gitpod".to_string(),
        "-s".to_string(),
        "-N".to_string(),
        "-e".to_string(),
        "SELECT TIMESTAMPDIFF(HOUR, MAX(creationTime), NOW()) FROM d_b_workspace_instance"
            .to_string(),
    ]
}

fn default_load_balancer_namespace() -> String {
    "loadbalancers".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct GcSettings {
    /// A branch with no commits in this many days is stale (default: 2)
    #[serde(default = "default_freshness_days")]
    pub freshness_days: i64,
    /// An environment with no database activity in this many hours is inactive (default: 48)
    #[serde(default = "default_activity_window_hours")]
    pub activity_window_hours: i64,
    /// Also treat namespaces named under the pre-hashing scheme as expected.
    /// Transitional; drop once no such namespaces remain.
    #[serde(default = "default_match_legacy_names")]
    pub match_legacy_names: bool,
    /// Log deletions instead of performing them
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_git")]
    pub git: String,
    /// Checkout used to list branches
    #[serde(default = "default_repo_path")]
    pub repo_path: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Pod in the deployment namespace that answers the activity query
    #[serde(default = "default_db_pod")]
    pub activity_pod: String,
    #[serde(default)]
    pub activity_container: Option<String>,
    /// Prints the hours since the last workspace activity, or NULL
    #[serde(default = "default_activity_query")]
    pub activity_query: Vec<String>,
    /// Delete certificates whose owning environment is gone
    #[serde(default = "default_true")]
    pub clean_orphan_certificates: bool,
    /// Namespace on the shared cluster holding per-VM load balancers
    #[serde(default = "default_load_balancer_namespace")]
    pub load_balancer_namespace: String,
    #[serde(default = "default_true")]
    pub clean_orphan_load_balancers: bool,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            freshness_days: default_freshness_days(),
            activity_window_hours: default_activity_window_hours(),
            match_legacy_names: default_match_legacy_names(),
            dry_run: false,
            git: default_git(),
            repo_path: default_repo_path(),
            remote: default_remote(),
            activity_pod: default_db_pod(),
            activity_container: None,
            activity_query: default_activity_query(),
            clean_orphan_certificates: true,
            load_balancer_namespace: default_load_balancer_namespace(),
            clean_orphan_load_balancers: true,
        }
    }
}

impl Settings {
    /// Substitute environment variables in a string value
    /// Replaces ${VAR_NAME} or ${VAR_NAME:-default} with environment variable values
    fn substitute_env_vars_in_string(s: &str) -> String {
        ENV_VAR_PATTERN
            .replace_all(s, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str());

                match env::var(var_name) {
                    Ok(val) => val,
                    Err(_) => default_value.unwrap_or("").to_string(),
                }
            })
            .to_string()
    }

    /// Convert a config::Value to a serde_json::Value, performing environment variable substitution
    fn config_value_to_json(value: &config::Value) -> serde_json::Value {
        use config::ValueKind;

        match &value.kind {
            ValueKind::Nil => serde_json::Value::Null,
            ValueKind::Boolean(b) => serde_json::Value::Bool(*b),
            ValueKind::I64(i) => serde_json::Value::Number((*i).into()),
            ValueKind::I128(i) => serde_json::Value::Number((*i as i64).into()),
            ValueKind::U64(u) => serde_json::Value::Number((*u).into()),
            ValueKind::U128(u) => serde_json::Value::Number((*u as u64).into()),
            ValueKind::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueKind::String(s) => {
                serde_json::Value::String(Self::substitute_env_vars_in_string(s))
            }
            ValueKind::Table(table) => {
                let mut map = serde_json::Map::new();
                for (k, v) in table.iter() {
                    map.insert(k.clone(), Self::config_value_to_json(v));
                }
                serde_json::Value::Object(map)
            }
            ValueKind::Array(arr) => {
                let vec: Vec<serde_json::Value> =
                    arr.iter().map(Self::config_value_to_json).collect();
                serde_json::Value::Array(vec)
            }
        }
    }

    /// Try to add a config file with multiple extension attempts (.toml, .yaml, .yml)
    /// Returns Ok(true) if a file was loaded, Ok(false) if no file found (when not required)
    fn try_add_config_file(
        builder: &mut config::ConfigBuilder<config::builder::DefaultState>,
        config_dir: &str,
        name: &str,
        required: bool,
    ) -> Result<bool, ConfigError> {
        let extensions = ["toml", "yaml", "yml"];

        for ext in extensions {
            let path = format!("{}/{}.{}", config_dir, name, ext);
            if std::path::Path::new(&path).exists() {
                tracing::info!("Loading config file: {}", path);
                *builder = builder
                    .clone()
                    .add_source(config::File::with_name(&format!("{}/{}", config_dir, name)));
                return Ok(true);
            }
        }

        if required {
            Err(ConfigError::Message(format!(
                "Required config file not found: {}/{}.{{toml,yaml,yml}}",
                config_dir, name
            )))
        } else {
            tracing::debug!(
                "Optional config file not found: {}/{}.{{toml,yaml,yml}}",
                config_dir,
                name
            );
            Ok(false)
        }
    }

    /// Load settings from `PREVIEW_CONFIG_DIR` (default `config`).
    ///
    /// Files are layered `default` → `$PREVIEW_CONFIG_RUN_MODE` → `local`;
    /// later files override earlier ones.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("PREVIEW_CONFIG_RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = env::var("PREVIEW_CONFIG_DIR").unwrap_or_else(|_| "config".into());
        Self::load(&config_dir, &run_mode)
    }

    pub fn load(config_dir: &str, run_mode: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        Self::try_add_config_file(&mut builder, config_dir, "default", true)?;
        Self::try_add_config_file(&mut builder, config_dir, run_mode, false)?;
        Self::try_add_config_file(&mut builder, config_dir, "local", false)?;

        let config = builder.build()?;

        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        let mut json_map = serde_json::Map::new();
        for (k, v) in root_value.iter() {
            json_map.insert(k.clone(), Self::config_value_to_json(v));
        }
        let json_value = serde_json::Value::Object(json_map);

        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field in preview config: {}", field);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Cross-field checks that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::validate_format_string(
            &self.dns.upsert_command,
            "dns.upsert_command",
            &["name", "ip"],
        )?;
        Self::validate_format_string(&self.dns.delete_command, "dns.delete_command", &["name"])?;
        Self::validate_format_string(&self.vm.provision_command, "vm.provision_command", &["name"])?;
        Self::validate_format_string(
            &self.vm.kubeconfig_command,
            "vm.kubeconfig_command",
            &["name", "path"],
        )?;
        if !self.wipe.helm_release.contains("{namespace}") {
            return Err(ConfigError::Message(format!(
                "wipe.helm_release must contain '{{namespace}}'. Got: '{}'",
                self.wipe.helm_release
            )));
        }

        if self.naming.shared_prefix == self.naming.vm_prefix {
            return Err(ConfigError::Message(format!(
                "naming.shared_prefix and naming.vm_prefix must differ (both are '{}')",
                self.naming.shared_prefix
            )));
        }

        let ranges = [
            ("ports.ws_daemon_range", &self.ports.ws_daemon_range),
            ("ports.registry_facade_range", &self.ports.registry_facade_range),
            (
                "ports.registry_node_port_range",
                &self.ports.registry_node_port_range,
            ),
        ];
        for (field, range) in ranges {
            if range.is_empty() {
                return Err(ConfigError::Message(format!(
                    "{} is empty ({}-{})",
                    field, range.start, range.end
                )));
            }
        }
        for (i, (field_a, a)) in ranges.iter().enumerate() {
            for (field_b, b) in ranges.iter().skip(i + 1) {
                if a.overlaps(b) {
                    return Err(ConfigError::Message(format!(
                        "{} and {} overlap",
                        field_a, field_b
                    )));
                }
            }
        }

        let polls = [
            ("certificates.poll", &self.certificates.poll),
            ("readiness.api", &self.readiness.api),
            ("readiness.pods", &self.readiness.pods),
            ("dns.load_balancer_poll", &self.dns.load_balancer_poll),
            ("wipe.namespace_deletion_poll", &self.wipe.namespace_deletion_poll),
        ];
        for (field, poll) in polls {
            if poll.max_attempts == 0 || poll.interval_secs == 0 {
                return Err(ConfigError::Message(format!(
                    "{} needs a non-zero interval_secs and max_attempts",
                    field
                )));
            }
        }

        if self.gc.freshness_days <= 0 || self.gc.activity_window_hours <= 0 {
            return Err(ConfigError::Message(
                "gc.freshness_days and gc.activity_window_hours must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate that a command template contains the required placeholders
    fn validate_format_string(
        template: &CommandTemplate,
        field_name: &str,
        required_placeholders: &[&str],
    ) -> Result<(), ConfigError> {
        for placeholder in required_placeholders {
            if !template.mentions(placeholder) {
                return Err(ConfigError::Message(format!(
                    "Configuration error: '{}' must contain '{{{}}}' placeholder. Got: '{} {}'",
                    field_name,
                    placeholder,
                    template.program,
                    template.args.join(" ")
                )));
            }
        }
        Ok(())
    }

    pub fn naming_scheme(&self) -> NamingScheme {
        NamingScheme {
            shared_prefix: self.naming.shared_prefix.clone(),
            vm_prefix: self.naming.vm_prefix.clone(),
            shared_base_domain: self.domain.base_domain.clone(),
            vm_base_domain: self
                .domain
                .vm_base_domain
                .clone()
                .unwrap_or_else(|| self.domain.base_domain.clone()),
        }
    }
}
