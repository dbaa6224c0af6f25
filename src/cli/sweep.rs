use std::sync::Arc;

use anyhow::Result;

use super::Context;
use crate::preview::gc::Sweeper;
use crate::preview::settings::Settings;

pub async fn sweep(dry_run: bool) -> Result<()> {
    let mut settings = Settings::new()?;
    settings.gc.dry_run |= dry_run;

    let ctx = Context::connect(settings).await?;
    let backend = Arc::new(ctx.sweep_backend());
    let report = Sweeper::new(backend, ctx.settings.clone()).run().await?;

    for (env, decision) in &report.decisions {
        println!("{:<24} {:<14} {}", env.name, env.kind(), decision);
    }
    for cert in &report.orphan_certificates {
        println!("{:<24} {:<14} orphaned", cert, "certificate");
    }
    for lb in &report.orphan_load_balancers {
        println!("{:<24} {:<14} orphaned", lb, "load-balancer");
    }
    Ok(())
}
