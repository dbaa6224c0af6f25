//! Provisioning one preview environment end to end.
//!
//! The namespace and certificate branches run concurrently. The certificate
//! branch is a spawned task that issues first and then waits for a one-shot
//! signal from the namespace branch before installing. Deploy, pod readiness
//! and DNS binding follow strictly in that order.

pub mod deploy;
pub mod job;
pub mod phase;
pub mod steps;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::preview::certificate::CertificateRequest;
use crate::preview::naming::{Backing, PreviewEnvironment};
use crate::preview::settings::Settings;
pub use job::{JobConfig, JobInput};
pub use phase::Phase;
use phase::PhaseTracker;
pub use steps::{CertificateTarget, KubeSteps, ProvisionOutcome, ProvisionSteps};

/// Summary of a successful run
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionReport {
    pub environment: PreviewEnvironment,
    pub url: String,
    pub phases: Vec<Phase>,
}

pub struct Provisioner {
    steps: Arc<dyn ProvisionSteps>,
    settings: Arc<Settings>,
}

impl Provisioner {
    pub fn new(steps: Arc<dyn ProvisionSteps>, settings: Arc<Settings>) -> Self {
        Self { steps, settings }
    }

    pub async fn run(&self, job: JobConfig) -> Result<ProvisionReport> {
        let env = job.environment(&self.settings)?;
        let url = env.url();
        info!(environment = %env, branch = %job.branch, version = %job.version, "Provisioning preview environment");

        let mut tracker = PhaseTracker::default();
        let result = self.run_phases(&env, &job, &mut tracker).await;

        let outcome = match &result {
            Ok(()) => ProvisionOutcome {
                url: url.clone(),
                succeeded: true,
                message: "ready".to_string(),
            },
            Err(e) => {
                let failed = tracker.fail();
                error!(environment = %env, phase = %failed, error = %format!("{:#}", e), "Provisioning failed");
                ProvisionOutcome {
                    url: url.clone(),
                    succeeded: false,
                    message: format!("failed while {}: {:#}", failed, e),
                }
            }
        };

        if let Err(e) = self.steps.publish_result(&env, &outcome).await {
            error!(environment = %env, error = %e, "Failed to publish result");
        }

        result.with_context(|| format!("Provisioning {} failed", env.name))?;
        Ok(ProvisionReport {
            environment: env,
            url,
            phases: tracker.history().to_vec(),
        })
    }

    async fn run_phases(
        &self,
        env: &PreviewEnvironment,
        job: &JobConfig,
        tracker: &mut PhaseTracker,
    ) -> Result<()> {
        let ports = self.steps.allocate_ports(env).await?;

        tracker.advance(Phase::Reconciling)?;
        self.reconcile(env, job).await?;

        tracker.advance(Phase::Deploying)?;
        self.steps.deploy(env, job, &ports).await?;

        tracker.advance(Phase::AwaitingReadiness)?;
        self.steps.wait_for_pods(env).await?;

        tracker.advance(Phase::BindingDns)?;
        self.steps.bind_dns(env).await?;

        tracker.advance(Phase::Done)?;
        Ok(())
    }

    /// Namespace and certificates, concurrently
    async fn reconcile(&self, env: &PreviewEnvironment, job: &JobConfig) -> Result<()> {
        let (namespace_ready, namespace_signal) = oneshot::channel::<()>();

        let workload = CertificateRequest::workload(env, &self.settings)?;
        let workload_task = self.spawn_certificate(
            workload,
            env.clone(),
            CertificateTarget::Workload,
            Some(namespace_signal),
        );

        let ingress_task = match env.backing {
            Backing::DedicatedVm { .. } => {
                let ingress = CertificateRequest::vm_ingress(env, &self.settings)?;
                Some(self.spawn_certificate(
                    ingress,
                    env.clone(),
                    CertificateTarget::VmIngress,
                    None,
                ))
            }
            Backing::SharedCluster => None,
        };

        let namespace = self.steps.prepare_namespace(env, job).await;
        if namespace.is_ok() {
            // The receiver is gone only if the task already failed; that
            // error surfaces when the task is joined.
            let _ = namespace_ready.send(());
        } else {
            drop(namespace_ready);
        }

        let workload = join_certificate(workload_task, "workload").await;
        let ingress = match ingress_task {
            Some(task) => join_certificate(task, "VM ingress").await,
            None => Ok(()),
        };

        namespace.context("Failed to prepare the namespace")?;
        workload?;
        ingress?;
        Ok(())
    }

    fn spawn_certificate(
        &self,
        req: CertificateRequest,
        env: PreviewEnvironment,
        target: CertificateTarget,
        namespace_signal: Option<oneshot::Receiver<()>>,
    ) -> JoinHandle<Result<()>> {
        let steps = self.steps.clone();
        tokio::spawn(async move {
            steps.issue_certificate(&req).await?;
            if let Some(signal) = namespace_signal {
                signal.await.map_err(|_| {
                    anyhow!(
                        "Namespace of {} was never ready, not installing certificate {}",
                        env.name,
                        req.cert_name
                    )
                })?;
            }
            steps.install_certificate(&req, &env, target).await
        })
    }
}

async fn join_certificate(task: JoinHandle<Result<()>>, which: &str) -> Result<()> {
    task.await
        .with_context(|| format!("The {} certificate task panicked", which))?
        .with_context(|| format!("Failed to provide the {} certificate", which))
}
