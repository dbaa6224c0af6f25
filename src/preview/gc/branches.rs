//! Remote branches and their commit recency, read from a git checkout.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::preview::settings::GcSettings;
use crate::preview::shell::{run_checked, CommandRunner, CommandSpec};

/// Branch names from `git branch -r` output, without the remote prefix.
/// Symbolic refs (`origin/HEAD -> origin/main`) are skipped.
pub fn parse_remote_branches(output: &str, remote: &str) -> Vec<String> {
    let prefix = format!("{}/", remote);
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains("->"))
        .filter_map(|line| line.strip_prefix(&prefix))
        .map(str::to_string)
        .collect()
}

/// First day that still counts as recent
pub fn freshness_cutoff(now: DateTime<Utc>, freshness_days: i64) -> NaiveDate {
    (now - Duration::days(freshness_days)).date_naive()
}

pub struct GitBranches {
    runner: Arc<dyn CommandRunner>,
    git: String,
    repo_path: String,
    remote: String,
}

impl GitBranches {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: &GcSettings) -> Self {
        Self {
            runner,
            git: settings.git.clone(),
            repo_path: settings.repo_path.clone(),
            remote: settings.remote.clone(),
        }
    }

    fn git(&self) -> CommandSpec {
        CommandSpec::new(&self.git).args(["-C", self.repo_path.as_str()])
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let output = run_checked(
            self.runner.as_ref(),
            &self.git().args(["branch", "-r", "--no-color"]),
        )
        .await
        .context("Failed to list remote branches")?;
        Ok(parse_remote_branches(&output.stdout, &self.remote))
    }

    /// Whether `branch` has any commit since the start of `since`
    pub async fn has_commits_since(&self, branch: &str, since: NaiveDate) -> Result<bool> {
        let spec = self
            .git()
            .args(["log", "--oneline", "--no-color"])
            .arg(format!("{}/{}", self.remote, branch))
            .arg(format!("--since={}", since.format("%Y-%m-%d")));
        let output = run_checked(self.runner.as_ref(), &spec)
            .await
            .with_context(|| format!("Failed to read history of {}", branch))?;
        Ok(!output.stdout.trim().is_empty())
    }
}
