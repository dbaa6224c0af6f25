//! Inputs of a provisioning run, validated once up front.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::Serialize;

use crate::preview::error::PreviewError;
use crate::preview::naming::{environment_name, Backing, PreviewEnvironment};
use crate::preview::settings::{Settings, VmSize};
use crate::preview::vm::dedicated_backing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    #[default]
    Default,
    Large,
}

impl FromStr for ResourceClass {
    type Err = PreviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "default" => Ok(Self::Default),
            "large" => Ok(Self::Large),
            other => Err(PreviewError::config(format!(
                "unknown resource class '{}' (expected 'default' or 'large')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Minio,
    Gcp,
}

impl FromStr for StorageBackend {
    type Err = PreviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "minio" => Ok(Self::Minio),
            "gcp" => Ok(Self::Gcp),
            other => Err(PreviewError::config(format!(
                "unknown storage backend '{}' (expected 'minio' or 'gcp')",
                other
            ))),
        }
    }
}

/// Where product analytics go
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Analytics {
    #[default]
    None,
    Segment { token: String },
}

impl FromStr for Analytics {
    type Err = PreviewError;

    /// `""` or `segment|<token>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::None);
        }
        match s.split_once('|') {
            Some(("segment", token)) if !token.is_empty() => Ok(Self::Segment {
                token: token.to_string(),
            }),
            _ => Err(PreviewError::config(format!(
                "analytics must be 'segment|<token>', got '{}'",
                s
            ))),
        }
    }
}

impl fmt::Display for Analytics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Analytics::None => write!(f, "none"),
            Analytics::Segment { .. } => write!(f, "segment"),
        }
    }
}

/// Raw inputs as they arrive from the command line
#[derive(Debug, Clone, Default)]
pub struct JobInput {
    pub branch: String,
    pub version: Option<String>,
    pub domain: Option<String>,
    pub clean_slate: bool,
    pub workspace_feature_flags: Vec<String>,
    pub resource_class: String,
    pub storage: String,
    pub analytics: String,
    pub with_ee_license: bool,
    pub with_vm: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    pub branch: String,
    pub version: String,
    pub domain_override: Option<String>,
    pub clean_slate: bool,
    pub workspace_feature_flags: Vec<String>,
    pub resource_class: ResourceClass,
    pub storage: StorageBackend,
    pub analytics: Analytics,
    pub with_ee_license: bool,
    pub with_vm: bool,
}

impl JobConfig {
    /// Validate raw inputs. Nothing here touches a cluster.
    pub fn from_input(input: JobInput, settings: &Settings) -> Result<Self> {
        environment_name(&input.branch)?;

        let version = input
            .version
            .filter(|v| !v.trim().is_empty())
            .or_else(|| settings.installer.default_version.clone())
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                PreviewError::config("no version given and installer.default_version is unset")
            })?;

        let domain_override = match input.domain.filter(|d| !d.trim().is_empty()) {
            Some(domain) => {
                validate_domain(&domain)?;
                Some(domain)
            }
            None => None,
        };

        for flag in &input.workspace_feature_flags {
            if flag.trim().is_empty() || flag.contains('"') {
                return Err(PreviewError::config(format!(
                    "invalid workspace feature flag '{}'",
                    flag
                ))
                .into());
            }
        }

        if input.with_vm && settings.clusters.vm_host.is_none() {
            return Err(
                PreviewError::config("dedicated VMs need clusters.vm_host to be configured").into(),
            );
        }
        if input.with_vm && settings.domain.vm_ingress_ip.is_none() {
            return Err(
                PreviewError::config("dedicated VMs need domain.vm_ingress_ip to be configured")
                    .into(),
            );
        }

        Ok(Self {
            branch: input.branch,
            version,
            domain_override,
            clean_slate: input.clean_slate,
            workspace_feature_flags: input.workspace_feature_flags,
            resource_class: input.resource_class.parse()?,
            storage: input.storage.parse()?,
            analytics: input.analytics.parse()?,
            with_ee_license: input.with_ee_license,
            with_vm: input.with_vm,
        })
    }

    /// The environment this job provisions
    pub fn environment(&self, settings: &Settings) -> Result<PreviewEnvironment> {
        let scheme = settings.naming_scheme();
        let backing = if self.with_vm {
            dedicated_backing(&scheme, &settings.vm, &environment_name(&self.branch)?)
        } else {
            Backing::SharedCluster
        };
        PreviewEnvironment::for_branch(
            &scheme,
            &self.branch,
            backing,
            self.domain_override.as_deref(),
        )
    }

    pub fn vm_size(&self, settings: &Settings) -> VmSize {
        match self.resource_class {
            ResourceClass::Default => settings.vm.default_size,
            ResourceClass::Large => settings.vm.large_size,
        }
    }
}

fn validate_domain(domain: &str) -> Result<()> {
    let valid = domain.len() <= 253
        && domain.split('.').count() >= 2
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        });
    if !valid {
        return Err(PreviewError::config(format!("'{}' is not a valid domain", domain)).into());
    }
    Ok(())
}
