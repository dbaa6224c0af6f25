use anyhow::Result;

use crate::preview::naming::{environment_name, BackingKind};
use crate::preview::settings::Settings;

/// Load and validate the configuration without touching a cluster
pub fn check_config() -> Result<()> {
    println!("Checking preview configuration...");
    match Settings::new() {
        Ok(settings) => {
            println!("✓ Configuration is valid");
            if settings.clusters.vm_host.is_none() {
                println!("  (no VM host cluster configured; --vm jobs will be rejected)");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Print where a branch's environment would live
pub fn show_name(branch: &str) -> Result<()> {
    let name = environment_name(branch)?;
    println!("name: {}", name);

    // Namespaces and domains need the naming settings; the name alone does not
    if let Ok(settings) = Settings::new() {
        let scheme = settings.naming_scheme();
        for kind in [BackingKind::SharedCluster, BackingKind::DedicatedVm] {
            println!(
                "{}: namespace {}, domain {}",
                kind,
                scheme.namespace(kind, &name),
                scheme.domain(kind, &name)
            );
        }
    }
    Ok(())
}
