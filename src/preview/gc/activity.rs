//! Usage of an environment, judged by the last workspace activity recorded in
//! its database.

use std::fmt;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use tokio::io::AsyncReadExt;

use crate::preview::cluster::ClusterHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    Active { hours_since: i64 },
    Inactive { reason: String },
}

impl Activity {
    pub fn is_active(&self) -> bool {
        matches!(self, Activity::Active { .. })
    }

    pub fn inactive(reason: impl Into<String>) -> Self {
        Activity::Inactive {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activity::Active { hours_since } => {
                write!(f, "active {} hour(s) ago", hours_since)
            }
            Activity::Inactive { reason } => write!(f, "inactive ({})", reason),
        }
    }
}

/// Interpret the query output (hours since the last activity, or NULL)
pub fn from_query_output(output: &str, window_hours: i64) -> Activity {
    let value = output.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("null") {
        return Activity::inactive("no recorded activity");
    }
    match value.parse::<i64>() {
        Ok(hours) if hours < window_hours => Activity::Active { hours_since: hours },
        Ok(hours) => Activity::inactive(format!(
            "last activity {} hour(s) ago, window is {}",
            hours, window_hours
        )),
        Err(_) => Activity::inactive(format!("unexpected query output '{}'", value)),
    }
}

/// Namespaces that are not `Active` are on their way out
pub fn from_namespace_phase(phase: Option<&str>) -> Option<Activity> {
    match phase {
        Some("Active") => None,
        Some(other) => Some(Activity::inactive(format!("namespace is {}", other))),
        None => Some(Activity::inactive("namespace does not exist")),
    }
}

/// Run `command` in a pod and return its stdout
pub async fn exec_in_pod(
    cluster: &ClusterHandle,
    namespace: &str,
    pod: &str,
    container: Option<&str>,
    command: &[String],
) -> Result<String> {
    let pods: Api<Pod> = Api::namespaced(cluster.client(), namespace);
    let mut params = AttachParams::default().stdin(false).stdout(true).stderr(true);
    if let Some(container) = container {
        params = params.container(container);
    }

    let mut attached = pods
        .exec(pod, command.iter().map(String::as_str), &params)
        .await
        .with_context(|| format!("Failed to exec in {}/{}", namespace, pod))?;

    let mut stdout = attached
        .stdout()
        .ok_or_else(|| anyhow!("stdout is not available"))?;
    let mut output = String::new();
    stdout
        .read_to_string(&mut output)
        .await
        .context("Failed to read command output")?;

    if let Some(status) = attached.take_status() {
        if let Some(status) = status.await {
            if status.status.as_deref() == Some("Failure") {
                return Err(anyhow!(
                    "command failed in {}/{}: {}",
                    namespace,
                    pod,
                    status.message.unwrap_or_default()
                ));
            }
        }
    }
    attached.join().await.ok();

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_output() {
        assert_eq!(
            from_query_output("3\n", 48),
            Activity::Active { hours_since: 3 }
        );
        assert!(!from_query_output("48", 48).is_active());
        assert!(!from_query_output("120", 48).is_active());
        assert!(!from_query_output("NULL\n", 48).is_active());
        assert!(!from_query_output("", 48).is_active());
        assert!(!from_query_output("ERROR 2002", 48).is_active());
    }

    #[test]
    fn test_namespace_phase() {
        assert_eq!(from_namespace_phase(Some("Active")), None);
        assert_eq!(
            from_namespace_phase(Some("Terminating")),
            Some(Activity::inactive("namespace is Terminating"))
        );
        assert!(from_namespace_phase(None).is_some());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Activity::Active { hours_since: 5 }.to_string(),
            "active 5 hour(s) ago"
        );
        assert_eq!(
            Activity::inactive("no recorded activity").to_string(),
            "inactive (no recorded activity)"
        );
    }
}
