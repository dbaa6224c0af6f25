//! Preview environment identity: branch → name → namespace/domain.

use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::error::PreviewError;

/// Longest environment name that is used verbatim
pub const MAX_NAME_LEN: usize = 20;

const HASHED_PREFIX_LEN: usize = 10;
const HASH_LEN: usize = MAX_NAME_LEN - HASHED_PREFIX_LEN;

lazy_static! {
    static ref INVALID_NAME_CHARS: Regex = Regex::new(r"[^-a-z0-9]").unwrap();
}

/// Lowercase the branch, drop `refs/heads/`, and replace anything outside `[-a-z0-9]` with `-`
pub fn sanitize_branch(branch: &str) -> String {
    let branch = branch.trim();
    let branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);
    INVALID_NAME_CHARS
        .replace_all(&branch.to_lowercase(), "-")
        .into_owned()
}

/// Derive the environment name for a branch.
///
/// Short branches map to themselves. Longer ones keep a readable prefix and
/// append a slice of the SHA-256 of the sanitized branch, so two long
/// branches sharing a prefix still get distinct names.
pub fn environment_name(branch: &str) -> Result<String> {
    let sanitized = validated(branch)?;
    if sanitized.len() <= MAX_NAME_LEN {
        return Ok(sanitized);
    }

    let digest = Sha256::digest(sanitized.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!(
        "{}{}",
        &sanitized[..HASHED_PREFIX_LEN],
        &hex[..HASH_LEN]
    ))
}

/// Name under the previous scheme (plain truncation).
///
/// Only the sweep uses this, to recognise environments created before the
/// hashing scheme so their branch still counts as existing.
pub fn legacy_environment_name(branch: &str) -> Result<String> {
    let sanitized = validated(branch)?;
    Ok(sanitized.chars().take(MAX_NAME_LEN).collect())
}

/// Check a name given verbatim, such as `delete --name`, against the shape
/// [`environment_name`] produces
pub fn validate_environment_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN
        || INVALID_NAME_CHARS.is_match(name)
        || name.trim_matches('-').is_empty()
    {
        return Err(PreviewError::config(format!(
            "'{}' is not an environment name (1 to {} characters of [-a-z0-9])",
            name, MAX_NAME_LEN
        ))
        .into());
    }
    Ok(())
}

fn validated(branch: &str) -> Result<String> {
    let sanitized = sanitize_branch(branch);
    if sanitized.trim_matches('-').is_empty() {
        return Err(PreviewError::config(format!(
            "branch '{}' does not yield a usable environment name",
            branch
        ))
        .into());
    }
    Ok(sanitized)
}

/// What an environment runs on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// A namespace on the shared development cluster
    SharedCluster,
    /// A namespace on the VM host cluster holding a VM that runs its own
    /// sub-cluster. The product is deployed into `deployment_namespace` inside
    /// that sub-cluster, reached through `kubeconfig_path`.
    DedicatedVm {
        vm_name: String,
        deployment_namespace: String,
        kubeconfig_path: PathBuf,
    },
}

impl Backing {
    pub fn kind(&self) -> BackingKind {
        match self {
            Backing::SharedCluster => BackingKind::SharedCluster,
            Backing::DedicatedVm { .. } => BackingKind::DedicatedVm,
        }
    }
}

/// [`Backing`] without its payload, for places that only need to branch on the kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackingKind {
    SharedCluster,
    DedicatedVm,
}

impl fmt::Display for BackingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackingKind::SharedCluster => write!(f, "shared-cluster"),
            BackingKind::DedicatedVm => write!(f, "dedicated-vm"),
        }
    }
}

/// Namespace prefixes and base domains per backing kind
#[derive(Debug, Clone)]
pub struct NamingScheme {
    pub shared_prefix: String,
    pub vm_prefix: String,
    pub shared_base_domain: String,
    pub vm_base_domain: String,
}

impl NamingScheme {
    pub fn prefix(&self, kind: BackingKind) -> &str {
        match kind {
            BackingKind::SharedCluster => &self.shared_prefix,
            BackingKind::DedicatedVm => &self.vm_prefix,
        }
    }

    pub fn namespace(&self, kind: BackingKind, name: &str) -> String {
        format!("{}-{}", self.prefix(kind), name)
    }

    pub fn domain(&self, kind: BackingKind, name: &str) -> String {
        match kind {
            BackingKind::SharedCluster => format!("{}.{}", name, self.shared_base_domain),
            BackingKind::DedicatedVm => format!("{}.{}", name, self.vm_base_domain),
        }
    }

    /// Recover the environment name from a namespace of the given kind
    pub fn name_from_namespace<'a>(&self, kind: BackingKind, namespace: &'a str) -> Option<&'a str> {
        namespace
            .strip_prefix(self.prefix(kind))
            .and_then(|rest| rest.strip_prefix('-'))
            .filter(|name| !name.is_empty())
    }
}

/// A single preview environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewEnvironment {
    pub name: String,
    /// Branch the environment was derived from. Unknown for environments
    /// discovered from the cluster.
    pub branch: Option<String>,
    pub namespace: String,
    pub domain: String,
    pub backing: Backing,
}

impl PreviewEnvironment {
    /// Build the environment a branch maps to. `domain_override` replaces the
    /// derived domain (the namespace is still derived from the branch).
    pub fn for_branch(
        scheme: &NamingScheme,
        branch: &str,
        backing: Backing,
        domain_override: Option<&str>,
    ) -> Result<Self> {
        let name = environment_name(branch)?;
        let kind = backing.kind();
        Ok(Self {
            namespace: scheme.namespace(kind, &name),
            domain: domain_override
                .map(str::to_string)
                .unwrap_or_else(|| scheme.domain(kind, &name)),
            branch: Some(branch.to_string()),
            name,
            backing,
        })
    }

    /// Environment known only by its name (explicit deletions, sweep results)
    pub fn from_name(scheme: &NamingScheme, name: &str, backing: Backing) -> Self {
        let kind = backing.kind();
        Self {
            name: name.to_string(),
            branch: None,
            namespace: scheme.namespace(kind, name),
            domain: scheme.domain(kind, name),
            backing,
        }
    }

    pub fn kind(&self) -> BackingKind {
        self.backing.kind()
    }

    /// Namespace the product itself is deployed into
    pub fn deployment_namespace(&self) -> &str {
        match &self.backing {
            Backing::SharedCluster => &self.namespace,
            Backing::DedicatedVm {
                deployment_namespace,
                ..
            } => deployment_namespace,
        }
    }

    pub fn url(&self) -> String {
        format!("https://{}/workspaces", self.domain)
    }
}

impl fmt::Display for PreviewEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.kind(), self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> NamingScheme {
        NamingScheme {
            shared_prefix: "staging".to_string(),
            vm_prefix: "preview".to_string(),
            shared_base_domain: "staging.example.dev".to_string(),
            vm_base_domain: "preview.example.dev".to_string(),
        }
    }

    #[test]
    fn test_sanitize_branch() {
        assert_eq!(sanitize_branch("refs/heads/Feature/ABC_1"), "feature-abc-1");
        assert_eq!(sanitize_branch("me/fix.dots"), "me-fix-dots");
        assert_eq!(sanitize_branch("  main "), "main");
    }

    #[test]
    fn test_short_branch_is_used_verbatim() {
        assert_eq!(environment_name("feature-x").unwrap(), "feature-x");
        assert_eq!(environment_name("refs/heads/Fix/Bug").unwrap(), "fix-bug");

        let twenty = "abcdefghij0123456789";
        assert_eq!(environment_name(twenty).unwrap(), twenty);
    }

    #[test]
    fn test_long_branch_is_hashed_deterministically() {
        let branch = "someone/a-very-long-branch-name-for-testing";
        let first = environment_name(branch).unwrap();
        let second = environment_name(branch).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), MAX_NAME_LEN);
        assert!(first.starts_with("someone-a-"));
        assert!(first[HASHED_PREFIX_LEN..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_long_branches_with_shared_prefix_differ() {
        let a = environment_name("someone/a-very-long-branch-one").unwrap();
        let b = environment_name("someone/a-very-long-branch-two").unwrap();
        assert_ne!(a, b);
        assert_eq!(&a[..HASHED_PREFIX_LEN], &b[..HASHED_PREFIX_LEN]);
    }

    #[test]
    fn test_twenty_one_chars_is_hashed() {
        let name = environment_name("abcdefghij0123456789x").unwrap();
        assert_eq!(name.len(), MAX_NAME_LEN);
        assert_ne!(name, "abcdefghij0123456789");
    }

    #[test]
    fn test_legacy_name_truncates() {
        assert_eq!(
            legacy_environment_name("someone/a-very-long-branch-name").unwrap(),
            "someone-a-very-long-"
        );
        assert_eq!(legacy_environment_name("short").unwrap(), "short");
    }

    #[test]
    fn test_unusable_branch_is_a_config_error() {
        for branch in ["", "refs/heads/", "///", "  "] {
            let err = environment_name(branch).unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<PreviewError>(),
                    Some(PreviewError::Config(_))
                ),
                "branch {:?} should be rejected",
                branch
            );
        }
    }

    #[test]
    fn test_verbatim_names_are_validated() {
        let hashed = environment_name("some/very/long/branch/name").unwrap();
        for name in ["feature-x", "a", "feature-3e5a1f09c2", hashed.as_str()] {
            assert!(validate_environment_name(name).is_ok(), "{:?} should be accepted", name);
        }
        for name in ["", "---", "Feature-X", "feature/x", "feature x", "a-name-longer-than-twenty"] {
            let err = validate_environment_name(name).unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<PreviewError>(),
                    Some(PreviewError::Config(_))
                ),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_environment_for_branch() {
        let env =
            PreviewEnvironment::for_branch(&scheme(), "feature-x", Backing::SharedCluster, None)
                .unwrap();
        assert_eq!(env.name, "feature-x");
        assert_eq!(env.namespace, "staging-feature-x");
        assert_eq!(env.domain, "feature-x.staging.example.dev");
        assert_eq!(env.deployment_namespace(), "staging-feature-x");
        assert_eq!(env.url(), "https://feature-x.staging.example.dev/workspaces");
    }

    #[test]
    fn test_environment_on_vm() {
        let backing = Backing::DedicatedVm {
            vm_name: "feature-x".to_string(),
            deployment_namespace: "default".to_string(),
            kubeconfig_path: PathBuf::from("/tmp/feature-x.yaml"),
        };
        let env =
            PreviewEnvironment::for_branch(&scheme(), "feature-x", backing, Some("custom.dev"))
                .unwrap();
        assert_eq!(env.namespace, "preview-feature-x");
        assert_eq!(env.domain, "custom.dev");
        assert_eq!(env.deployment_namespace(), "default");
        assert_eq!(env.kind(), BackingKind::DedicatedVm);
    }

    #[test]
    fn test_name_from_namespace() {
        let scheme = scheme();
        assert_eq!(
            scheme.name_from_namespace(BackingKind::SharedCluster, "staging-feature-x"),
            Some("feature-x")
        );
        assert_eq!(
            scheme.name_from_namespace(BackingKind::DedicatedVm, "staging-feature-x"),
            None
        );
        assert_eq!(
            scheme.name_from_namespace(BackingKind::SharedCluster, "staging-"),
            None
        );
        assert_eq!(
            scheme.name_from_namespace(BackingKind::SharedCluster, "stagingfoo"),
            None
        );
    }
}
