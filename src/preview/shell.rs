//! External command execution.
//!
//! Terraform, the installer, kubectl/helm for rendered manifests, DNS and VM
//! scripts, and git are all invoked through [`CommandRunner`], so tests can
//! substitute a recording fake.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::error::PreviewError;

/// A fully resolved command line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
    /// Written to the child's stdin, which is then closed
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn status_description(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "a signal".to_string(),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output.
    ///
    /// A non-zero exit is not an error here; see [`run_checked`].
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Run a command and turn a non-zero exit into [`PreviewError::Command`]
pub async fn run_checked(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<CommandOutput> {
    let output = runner.run(spec).await?;
    if !output.success() {
        return Err(PreviewError::Command {
            program: spec.to_string(),
            status: output.status_description(),
            stderr: output.stderr.trim().to_string(),
        }
        .into());
    }
    Ok(output)
}

/// Runs commands as child processes of this one
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(ref dir) = spec.current_dir {
            cmd.current_dir(dir);
        }

        debug!("Executing command: {}", spec);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute {}", spec.program))?;

        // Feed stdin from its own task so a chatty child cannot fill its
        // stdout pipe while we are still writing.
        let writer = match (spec.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut stdin)) => Some(tokio::spawn(async move {
                stdin.write_all(input.as_bytes()).await
            })),
            _ => None,
        };

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for {}", spec.program))?;

        if let Some(writer) = writer {
            writer
                .await
                .context("stdin writer task panicked")?
                .with_context(|| format!("Failed to write stdin of {}", spec.program))?;
        }

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// A configurable command line with `{placeholder}` substitution
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new<S: Into<String>>(program: S, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Whether `{placeholder}` appears anywhere in the template
    pub fn mentions(&self, placeholder: &str) -> bool {
        let needle = format!("{{{}}}", placeholder);
        self.program.contains(&needle) || self.args.iter().any(|a| a.contains(&needle))
    }

    pub fn render(&self, values: &[(&str, &str)]) -> CommandSpec {
        let substitute = |s: &str| {
            values.iter().fold(s.to_string(), |acc, (key, value)| {
                acc.replace(&format!("{{{}}}", key), value)
            })
        };
        CommandSpec::new(substitute(&self.program))
            .args(self.args.iter().map(|a| substitute(a)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording fake shared by the component tests

    use super::*;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&CommandSpec) -> Option<CommandOutput> + Send + Sync>;

    /// Records every command and answers from registered responders.
    /// Commands nobody answers succeed with empty output.
    #[derive(Default)]
    pub struct RecordingRunner {
        pub calls: Mutex<Vec<CommandSpec>>,
        responders: Mutex<Vec<Responder>>,
    }

    impl RecordingRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond<F>(self, responder: F) -> Self
        where
            F: Fn(&CommandSpec) -> Option<CommandOutput> + Send + Sync + 'static,
        {
            self.responders.lock().unwrap().push(Box::new(responder));
            self
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        pub fn command_lines(&self) -> Vec<String> {
            self.calls().iter().map(|c| c.to_string()).collect()
        }
    }

    pub fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            let responders = self.responders.lock().unwrap();
            Ok(responders
                .iter()
                .find_map(|r| r(spec))
                .unwrap_or_else(|| ok("")))
        }
    }
}
