use anyhow::{bail, Result};
use tracing::{info, warn};

use super::Context;
use crate::preview::certificate::CertificateRequest;
use crate::preview::gc::SweepBackend;
use crate::preview::naming::{
    environment_name, validate_environment_name, Backing, PreviewEnvironment,
};
use crate::preview::settings::Settings;
use crate::preview::vm::dedicated_backing;

#[derive(Debug, Clone, clap::Args)]
pub struct DeleteArgs {
    /// Environment name
    #[arg(long, conflicts_with = "branch", required_unless_present = "branch")]
    pub name: Option<String>,
    /// Branch whose environment is deleted
    #[arg(long)]
    pub branch: Option<String>,
    /// The environment runs in a dedicated VM
    #[arg(long)]
    pub vm: bool,
}

/// Tear down one environment the same way the sweep does, then drop its certificates
pub async fn delete(args: DeleteArgs) -> Result<()> {
    let settings = Settings::new()?;
    let name = match (args.name, args.branch) {
        (Some(name), _) => {
            validate_environment_name(&name)?;
            name
        }
        (None, Some(branch)) => environment_name(&branch)?,
        (None, None) => bail!("either --name or --branch is required"),
    };

    let scheme = settings.naming_scheme();
    let backing = if args.vm {
        dedicated_backing(&scheme, &settings.vm, &name)
    } else {
        Backing::SharedCluster
    };
    let env = PreviewEnvironment::from_name(&scheme, &name, backing);

    let ctx = Context::connect(settings).await?;
    let backend = ctx.sweep_backend();
    backend.delete_environment(&env).await?;

    let mut certificates = vec![CertificateRequest::workload(&env, &ctx.settings)?.cert_name];
    if args.vm {
        certificates.push(CertificateRequest::vm_ingress(&env, &ctx.settings)?.cert_name);
    }
    for cert in certificates {
        if let Err(e) = backend.delete_certificate(&cert).await {
            warn!(certificate = %cert, error = %format!("{:#}", e), "Failed to delete certificate");
        }
    }

    info!(environment = %env, "Deleted preview environment");
    Ok(())
}
