//! Periodic sweep of stale preview environments.
//!
//! An environment is deleted when no remote branch maps to its namespace, or
//! when its branch has gone quiet and nobody has used the environment
//! recently. Both clusters are swept in one pass; deletions fan out as one
//! task per environment and a failure in one never stops the others.
//! Certificates and VM load balancers left without an environment are
//! removed afterwards.

pub mod activity;
pub mod backend;
pub mod branches;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub use activity::Activity;
pub use backend::{KubeSweepBackend, SweepBackend};
use crate::preview::error::PreviewError;
use crate::preview::naming::{
    environment_name, legacy_environment_name, BackingKind, NamingScheme, PreviewEnvironment,
};
use crate::preview::settings::Settings;

/// Namespaces a branch may own across both backings: the current-scheme
/// ones first, then the legacy ones (empty unless `match_legacy`).
pub fn namespaces_for_branch(
    branch: &str,
    scheme: &NamingScheme,
    match_legacy: bool,
) -> Result<(Vec<String>, Vec<String>)> {
    let current = environment_name(branch)?;
    let legacy = if match_legacy {
        Some(legacy_environment_name(branch)?).filter(|legacy| *legacy != current)
    } else {
        None
    };

    let on_both = |name: &str| -> Vec<String> {
        [BackingKind::SharedCluster, BackingKind::DedicatedVm]
            .into_iter()
            .map(|kind| scheme.namespace(kind, name))
            .collect()
    };
    Ok((
        on_both(&current),
        legacy.as_deref().map(on_both).unwrap_or_default(),
    ))
}

/// Branches mapping to one namespace.
///
/// Two branches can meet on a namespace when the legacy truncation of one
/// equals the current name of the other. The current-scheme owners then
/// shadow the legacy ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Owners {
    current: BTreeSet<String>,
    legacy: BTreeSet<String>,
}

impl Owners {
    pub fn branches(&self) -> &BTreeSet<String> {
        if self.current.is_empty() {
            &self.legacy
        } else {
            &self.current
        }
    }

    /// Stale only when every owning branch is
    pub fn all_stale(&self, stale: &BTreeSet<String>) -> bool {
        let branches = self.branches();
        !branches.is_empty() && branches.iter().all(|b| stale.contains(b))
    }

    fn label(&self) -> String {
        self.branches()
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Namespace → owning branches for every branch that yields a usable name
pub fn expected_namespaces(
    branches: &[String],
    scheme: &NamingScheme,
    match_legacy: bool,
) -> BTreeMap<String, Owners> {
    let mut expected: BTreeMap<String, Owners> = BTreeMap::new();
    for branch in branches {
        match namespaces_for_branch(branch, scheme, match_legacy) {
            Ok((current, legacy)) => {
                for ns in current {
                    expected.entry(ns).or_default().current.insert(branch.clone());
                }
                for ns in legacy {
                    expected.entry(ns).or_default().legacy.insert(branch.clone());
                }
            }
            Err(e) => warn!(branch = %branch, error = %e, "Skipping branch"),
        }
    }
    expected
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Delete(String),
    Keep(String),
}

impl Decision {
    pub fn is_delete(&self) -> bool {
        matches!(self, Decision::Delete(_))
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Delete(reason) => write!(f, "delete: {}", reason),
            Decision::Keep(reason) => write!(f, "keep: {}", reason),
        }
    }
}

/// Decide the fate of one live environment.
///
/// `activity` is only consulted for environments whose branch exists but is
/// stale; the probe is skipped for everything else.
pub fn classify(branch: Option<&str>, branch_is_stale: bool, activity: Option<&Activity>) -> Decision {
    let Some(branch) = branch else {
        return Decision::Delete("no remote branch maps to this namespace".to_string());
    };
    if !branch_is_stale {
        return Decision::Keep(format!("branch {} has recent commits", branch));
    }
    match activity {
        Some(activity) if activity.is_active() => Decision::Keep(format!(
            "branch {} is stale but the environment is {}",
            branch, activity
        )),
        Some(activity) => Decision::Delete(format!(
            "branch {} is stale and the environment is {}",
            branch, activity
        )),
        None => Decision::Keep(format!("branch {} is stale, activity unknown", branch)),
    }
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub dry_run: bool,
    pub decisions: Vec<(PreviewEnvironment, Decision)>,
    pub deleted: Vec<String>,
    pub orphan_certificates: Vec<String>,
    pub orphan_load_balancers: Vec<String>,
    pub failed: Vec<String>,
}

impl SweepReport {
    pub fn to_delete(&self) -> impl Iterator<Item = &PreviewEnvironment> {
        self.decisions
            .iter()
            .filter(|(_, d)| d.is_delete())
            .map(|(env, _)| env)
    }
}

pub struct Sweeper {
    backend: Arc<dyn SweepBackend>,
    settings: Arc<Settings>,
}

impl Sweeper {
    pub fn new(backend: Arc<dyn SweepBackend>, settings: Arc<Settings>) -> Self {
        Self { backend, settings }
    }

    pub async fn run(&self) -> Result<SweepReport> {
        self.run_at(Utc::now()).await
    }

    /// Sweep as of `now`. Fails with [`PreviewError::Sweep`] when any
    /// deletion failed; the report is logged either way.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let gc = &self.settings.gc;
        let scheme = self.settings.naming_scheme();
        let trunk = &self.settings.naming.trunk_branch;
        let trunk_name = environment_name(trunk)?;

        let (live, branches) = tokio::join!(self.backend.live_environments(), self.backend.branches());
        let live = live.context("Failed to list live preview environments")?;
        let branches: Vec<String> = branches
            .context("Failed to list remote branches")?
            .into_iter()
            .filter(|b| b != trunk)
            .collect();
        if branches.is_empty() {
            // An empty listing would condemn every environment
            return Err(PreviewError::config("no remote branches found besides the trunk").into());
        }
        info!(environments = live.len(), branches = branches.len(), "Sweeping preview environments");

        let expected = expected_namespaces(&branches, &scheme, gc.match_legacy_names);
        let candidates: Vec<&PreviewEnvironment> =
            live.iter().filter(|env| env.name != trunk_name).collect();

        let stale = self.stale_branches(&candidates, &expected, now).await;

        let probes = candidates.iter().filter(|env| {
            expected
                .get(&env.namespace)
                .is_some_and(|owners| owners.all_stale(&stale))
        });
        let probed: BTreeMap<String, Activity> = join_all(probes.map(|env| async move {
            (env.namespace.clone(), self.backend.activity(env).await)
        }))
        .await
        .into_iter()
        .collect();

        let mut report = SweepReport {
            dry_run: gc.dry_run,
            ..Default::default()
        };
        for env in candidates {
            let owners = expected.get(&env.namespace);
            let label = owners.map(Owners::label);
            let decision = classify(
                label.as_deref(),
                owners.is_some_and(|o| o.all_stale(&stale)),
                probed.get(&env.namespace),
            );
            info!(environment = %env, decision = %decision, "Classified");
            report.decisions.push((env.clone(), decision));
        }

        let gone = self.delete_environments(&mut report).await;

        let remaining: Vec<&PreviewEnvironment> =
            live.iter().filter(|env| !gone.contains(&env.namespace)).collect();
        if gc.clean_orphan_load_balancers {
            self.clean_load_balancers(&remaining, &mut report).await;
        }
        if gc.clean_orphan_certificates {
            self.clean_certificates(&remaining, &mut report).await;
        }

        info!(
            dry_run = report.dry_run,
            deleted = report.deleted.len(),
            orphan_certificates = report.orphan_certificates.len(),
            orphan_load_balancers = report.orphan_load_balancers.len(),
            failed = report.failed.len(),
            "Sweep finished"
        );
        if !report.failed.is_empty() {
            return Err(PreviewError::Sweep {
                failed: report.failed.clone(),
            }
            .into());
        }
        Ok(report)
    }

    /// Branches of live environments with no commits in the freshness window.
    /// A branch whose history cannot be read counts as fresh.
    async fn stale_branches(
        &self,
        candidates: &[&PreviewEnvironment],
        expected: &BTreeMap<String, Owners>,
        now: DateTime<Utc>,
    ) -> BTreeSet<String> {
        let since = branches::freshness_cutoff(now, self.settings.gc.freshness_days);
        let owning: BTreeSet<&String> = candidates
            .iter()
            .filter_map(|env| expected.get(&env.namespace))
            .flat_map(Owners::branches)
            .collect();

        let checks = owning.into_iter().map(|branch| async move {
            match self.backend.has_commits_since(branch, since).await {
                Ok(recent) => (branch, !recent),
                Err(e) => {
                    warn!(branch = %branch, error = %format!("{:#}", e), "Could not read branch history, treating it as fresh");
                    (branch, false)
                }
            }
        });
        join_all(checks)
            .await
            .into_iter()
            .filter(|(_, stale)| *stale)
            .map(|(branch, _)| branch.clone())
            .collect()
    }

    /// Delete every condemned environment, one task each. Returns the
    /// namespaces that no longer count as live.
    async fn delete_environments(&self, report: &mut SweepReport) -> BTreeSet<String> {
        let doomed: Vec<PreviewEnvironment> = report.to_delete().cloned().collect();
        if report.dry_run {
            for env in &doomed {
                info!(environment = %env, "Dry run, would delete");
            }
            return doomed.into_iter().map(|env| env.namespace).collect();
        }

        let mut tasks = JoinSet::new();
        for env in doomed {
            let backend = self.backend.clone();
            tasks.spawn(async move {
                let result = backend.delete_environment(&env).await;
                (env, result)
            });
        }

        let mut gone = BTreeSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((env, Ok(()))) => {
                    info!(environment = %env, "Deleted");
                    report.deleted.push(env.name.clone());
                    gone.insert(env.namespace);
                }
                Ok((env, Err(e))) => {
                    warn!(environment = %env, error = %format!("{:#}", e), "Deletion failed");
                    report.failed.push(env.name);
                }
                Err(e) => {
                    warn!(error = %e, "Deletion task did not finish");
                    report.failed.push(format!("deletion task ({})", e));
                }
            }
        }
        report.deleted.sort();
        report.failed.sort();
        gone
    }

    async fn clean_load_balancers(&self, remaining: &[&PreviewEnvironment], report: &mut SweepReport) {
        let vm_names: BTreeSet<&str> = remaining
            .iter()
            .filter(|env| env.kind() == BackingKind::DedicatedVm)
            .map(|env| env.name.as_str())
            .collect();

        let load_balancers = match self.backend.load_balancers().await {
            Ok(lbs) => lbs,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Failed to list load balancers");
                report.failed.push("load balancer listing".to_string());
                return;
            }
        };

        for name in load_balancers {
            if vm_names.contains(name.as_str()) {
                continue;
            }
            if report.dry_run {
                info!(load_balancer = %name, "Dry run, would delete orphaned load balancer");
                report.orphan_load_balancers.push(name);
                continue;
            }
            match self.backend.delete_load_balancer(&name).await {
                Ok(()) => report.orphan_load_balancers.push(name),
                Err(e) => {
                    warn!(load_balancer = %name, error = %format!("{:#}", e), "Failed to delete load balancer");
                    report.failed.push(format!("load balancer {}", name));
                }
            }
        }
    }

    async fn clean_certificates(&self, remaining: &[&PreviewEnvironment], report: &mut SweepReport) {
        let names: BTreeSet<&str> = remaining.iter().map(|env| env.name.as_str()).collect();

        let owners = match self.backend.certificate_owners().await {
            Ok(owners) => owners,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Failed to list certificates");
                report.failed.push("certificate listing".to_string());
                return;
            }
        };

        // Certificates without an owner annotation were not issued for a preview
        let orphans = owners
            .into_iter()
            .filter_map(|(cert, owner)| owner.filter(|o| !names.contains(o.as_str())).map(|_| cert));

        for cert in orphans {
            if report.dry_run {
                info!(certificate = %cert, "Dry run, would delete orphaned certificate");
                report.orphan_certificates.push(cert);
                continue;
            }
            match self.backend.delete_certificate(&cert).await {
                Ok(()) => report.orphan_certificates.push(cert),
                Err(e) => {
                    warn!(certificate = %cert, error = %format!("{:#}", e), "Failed to delete certificate");
                    report.failed.push(format!("certificate {}", cert));
                }
            }
        }
    }
}
