use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use super::Context;
use crate::preview::provisioner::{JobConfig, JobInput, Provisioner};
use crate::preview::settings::Settings;

#[derive(Debug, Clone, clap::Args)]
pub struct ProvisionArgs {
    /// Branch the environment is built from
    #[arg(long, short)]
    pub branch: String,
    /// Image version to deploy (defaults to installer.default_version)
    #[arg(long)]
    pub version: Option<String>,
    /// Serve the environment under this domain instead of the derived one
    #[arg(long)]
    pub domain: Option<String>,
    /// Wipe and recreate the namespace before deploying
    #[arg(long)]
    pub clean_slate: bool,
    /// Workspace feature flag (repeatable)
    #[arg(long = "ws-feature-flag")]
    pub workspace_feature_flags: Vec<String>,
    /// Resource class: default or large
    #[arg(long, default_value = "default")]
    pub resource_class: String,
    /// Object storage backend: minio or gcp
    #[arg(long, default_value = "minio")]
    pub storage: String,
    /// Analytics sink, e.g. "segment|<token>"
    #[arg(long, default_value = "")]
    pub analytics: String,
    /// Deploy with the enterprise license
    #[arg(long)]
    pub with_ee_license: bool,
    /// Run the environment in a dedicated VM
    #[arg(long)]
    pub with_vm: bool,
    /// Directory for rendered installer values
    #[arg(long, default_value = "/tmp/preview-ctl")]
    pub work_dir: PathBuf,
}

impl From<ProvisionArgs> for JobInput {
    fn from(args: ProvisionArgs) -> Self {
        JobInput {
            branch: args.branch,
            version: args.version,
            domain: args.domain,
            clean_slate: args.clean_slate,
            workspace_feature_flags: args.workspace_feature_flags,
            resource_class: args.resource_class,
            storage: args.storage,
            analytics: args.analytics,
            with_ee_license: args.with_ee_license,
            with_vm: args.with_vm,
        }
    }
}

pub async fn provision(args: ProvisionArgs) -> Result<()> {
    let settings = Settings::new()?;
    let work_dir = args.work_dir.clone();
    // Reject bad input before connecting anywhere
    let job = JobConfig::from_input(args.into(), &settings)?;

    let ctx = Context::connect(settings).await?;
    let steps = Arc::new(ctx.provision_steps(work_dir));
    let report = Provisioner::new(steps, ctx.settings.clone()).run(job).await?;

    tracing::info!(
        environment = %report.environment,
        phases = ?report.phases,
        "Provisioning finished"
    );
    Ok(())
}
