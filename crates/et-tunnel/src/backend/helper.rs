//! External helper processes
//!
//! Builds the helper's command line, launches it, and exposes the handful of
//! process operations the process backend needs.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

use et_core::config::{HelperKind, ProcessBackendConfig};
use et_core::{InstanceRef, TunnelError};

/// Readable half of a helper's output pipe
pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

/// A fully formed helper invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
    /// Executable to run
    pub program: String,
    /// Arguments, in order
    pub args: Vec<String>,
    /// Local port the helper will listen on
    pub local_port: u16,
}

/// Where the helper should connect
#[derive(Debug, Clone, Copy)]
pub enum HelperDestination<'a> {
    /// A resolved address
    Address(&'a str),
    /// An instance the helper looks up itself
    Instance(&'a InstanceRef),
}

/// Port forwarding parameters shared by every helper flavour
#[derive(Debug, Clone, Copy)]
pub struct ForwardSpec<'a> {
    pub local_port: u16,
    pub remote_host: &'a str,
    pub remote_port: u16,
    pub ssh_port: u16,
    pub key_file: Option<&'a Path>,
}

impl ForwardSpec<'_> {
    fn forward_rule(&self) -> String {
        format!(
            "127.0.0.1:{}:{}:{}",
            self.local_port, self.remote_host, self.remote_port
        )
    }

    /// OpenSSH options every flavour passes through
    fn ssh_options(&self) -> Vec<String> {
        [
            "-N",
            "-v",
            "-o",
            "ExitOnForwardFailure=yes",
            "-o",
            "BatchMode=yes",
            "-L",
        ]
        .into_iter()
        .map(str::to_string)
        .chain(std::iter::once(self.forward_rule()))
        .collect()
    }
}

impl HelperCommand {
    /// Build the invocation for `settings.helper`
    pub fn build(
        settings: &ProcessBackendConfig,
        destination: HelperDestination<'_>,
        forward: ForwardSpec<'_>,
    ) -> Result<Self, TunnelError> {
        let program = settings
            .program
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| settings.helper.default_program().to_string());

        let args = match (settings.helper, destination) {
            (HelperKind::Ssh, HelperDestination::Address(host)) => {
                Self::openssh_args(settings, host, &forward)
            }
            (HelperKind::Gcloud, HelperDestination::Instance(instance)) => {
                Self::gcloud_args(settings, instance, &forward)
            }
            (HelperKind::Ssh, HelperDestination::Instance(instance)) => {
                return Err(TunnelError::Config(format!(
                    "ssh helper needs a resolved address for instance {}",
                    instance
                )))
            }
            (HelperKind::Gcloud, HelperDestination::Address(host)) => {
                return Err(TunnelError::Config(format!(
                    "gcloud helper cannot connect to bare host {}",
                    host
                )))
            }
        };

        Ok(Self {
            program,
            args,
            local_port: forward.local_port,
        })
    }

    fn openssh_args(
        settings: &ProcessBackendConfig,
        host: &str,
        forward: &ForwardSpec<'_>,
    ) -> Vec<String> {
        let mut args = forward.ssh_options();
        args.extend([
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-p".to_string(),
            forward.ssh_port.to_string(),
        ]);
        if let Some(key_file) = forward.key_file {
            args.extend([
                "-i".to_string(),
                key_file.display().to_string(),
                "-o".to_string(),
                "IdentitiesOnly=yes".to_string(),
            ]);
        }
        args.extend(settings.extra_args.iter().cloned());
        args.push(match &settings.ssh_user {
            Some(user) => format!("{}@{}", user, host),
            None => host.to_string(),
        });
        args
    }

    fn gcloud_args(
        settings: &ProcessBackendConfig,
        instance: &InstanceRef,
        forward: &ForwardSpec<'_>,
    ) -> Vec<String> {
        let mut args = vec!["compute".to_string(), "ssh".to_string()];
        args.push(match &settings.ssh_user {
            Some(user) => format!("{}@{}", user, instance.name),
            None => instance.name.clone(),
        });
        if let Some(zone) = &instance.zone {
            args.push(format!("--zone={}", zone));
        }
        if let Some(project) = &instance.project {
            args.push(format!("--project={}", project));
        }
        if let Some(key_file) = forward.key_file {
            args.push(format!("--ssh-key-file={}", key_file.display()));
        }
        args.push("--quiet".to_string());
        args.extend(settings.extra_args.iter().cloned());
        args.push("--".to_string());
        args.extend(forward.ssh_options());
        args
    }
}

/// A running helper
#[async_trait]
pub trait HelperProcess: Send {
    /// Take the output pipes (stdout and stderr); empty after the first call
    fn take_output(&mut self) -> Vec<OutputReader>;

    /// Close the helper's stdin, asking it to exit
    fn close_stdin(&mut self);

    /// Wait for exit and return the exit code, if there is one
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Forcibly terminate the helper
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// Spawns helper processes
pub trait ProcessLauncher: Send + Sync {
    /// Start `command`
    fn launch(&self, command: &HelperCommand) -> Result<Box<dyn HelperProcess>, TunnelError>;
}

/// Launches helpers as real child processes
#[derive(Debug, Clone, Default)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, command: &HelperCommand) -> Result<Box<dyn HelperProcess>, TunnelError> {
        tracing::debug!("Spawning {} {}", command.program, command.args.join(" "));

        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TunnelError::BackendClosed(format!("Failed to start {}: {}", command.program, e))
            })?;

        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl HelperProcess for ChildProcess {
    fn take_output(&mut self) -> Vec<OutputReader> {
        let mut readers: Vec<OutputReader> = Vec::with_capacity(2);
        if let Some(stdout) = self.child.stdout.take() {
            readers.push(Box::new(stdout));
        }
        if let Some(stderr) = self.child.stderr.take() {
            readers.push(Box::new(stderr));
        }
        readers
    }

    fn close_stdin(&mut self) {
        drop(self.child.stdin.take());
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

/// Ask the OS for a currently free loopback port
pub fn pick_ephemeral_port() -> Result<u16, TunnelError> {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .map_err(|e| TunnelError::Listen {
            port: 0,
            reason: format!("Failed to find a free port: {}", e),
        })
}
