use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tracing::info;

use super::settings::ClusterConnection;

/// A client bound to one specific cluster.
///
/// The shared cluster, the VM host cluster and a VM's sub-cluster can all
/// contain a namespace of the same name, so every operation takes the handle
/// it acts on explicitly. The kubeconfig path travels along for external tools
/// that need to reach the same cluster.
#[derive(Clone)]
pub struct ClusterHandle {
    name: String,
    client: Client,
    kubeconfig: Option<PathBuf>,
}

impl ClusterHandle {
    pub fn new(name: impl Into<String>, client: Client, kubeconfig: Option<PathBuf>) -> Self {
        Self {
            name: name.into(),
            client,
            kubeconfig,
        }
    }

    /// Connect using an explicit kubeconfig, or infer (in-cluster, then
    /// ~/.kube/config) when none is configured
    pub async fn connect(name: &str, connection: &ClusterConnection) -> Result<Self> {
        let kubeconfig = connection
            .kubeconfig
            .as_deref()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        let options = KubeConfigOptions {
            context: connection.context.clone().filter(|c| !c.is_empty()),
            cluster: None,
            user: None,
        };

        let config = match kubeconfig {
            Some(ref path) => {
                let raw = Kubeconfig::read_from(path)
                    .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
                kube::Config::from_custom_kubeconfig(raw, &options).await?
            }
            None if options.context.is_some() => {
                kube::Config::from_kubeconfig(&options).await?
            }
            None => kube::Config::infer().await?,
        };

        info!(cluster = %name, server = %config.cluster_url, "Connecting to cluster");
        let client = Client::try_from(config)
            .with_context(|| format!("Failed to create client for cluster {}", name))?;
        Ok(Self::new(name, client, kubeconfig))
    }

    /// Connect through a kubeconfig file written by an external tool
    pub async fn from_kubeconfig_file(name: &str, path: &Path) -> Result<Self> {
        Self::connect(
            name,
            &ClusterConnection {
                kubeconfig: Some(path.to_string_lossy().into_owned()),
                context: None,
            },
        )
        .await
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn kubeconfig(&self) -> Option<&Path> {
        self.kubeconfig.as_deref()
    }

    /// `--kubeconfig <path>` for kubectl/helm, or nothing when the ambient config applies
    pub fn kubeconfig_args(&self) -> Vec<String> {
        match self.kubeconfig {
            Some(ref path) => vec![
                "--kubeconfig".to_string(),
                path.to_string_lossy().into_owned(),
            ],
            None => Vec::new(),
        }
    }
}

impl fmt::Display for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("name", &self.name)
            .field("kubeconfig", &self.kubeconfig)
            .finish()
    }
}
