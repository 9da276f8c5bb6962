//! Command-line arguments and how they override the config file

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, ValueEnum};

use et_core::config::{self, serde_utils, BackendConfig, HelperKind, ProcessBackendConfig, TunnelConfig};
use et_core::{ConfigError, InstanceRef, TunnelTarget};

#[derive(Parser, Debug)]
#[command(name = "ephemeral-tunnel")]
#[command(author, version, about = "Forward a local port through SSH using a short-lived key")]
pub struct Cli {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Port on the remote side to forward to
    #[arg(short = 'r', long)]
    pub remote_port: Option<u16>,

    /// Host the remote side connects to
    #[arg(long)]
    pub remote_host: Option<String>,

    /// Local port to listen on (default: any free port)
    #[arg(short = 'l', long)]
    pub local_port: Option<u16>,

    /// SSH port on the target
    #[arg(long)]
    pub ssh_port: Option<u16>,

    /// Transport strategy
    #[arg(short, long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Helper program for the process backend (implies --backend process)
    #[arg(long, value_enum)]
    pub helper: Option<HelperArg>,

    /// Login user for the ssh helper
    #[arg(long)]
    pub ssh_user: Option<String>,

    /// Private key file for the helper process
    #[arg(short = 'i', long)]
    pub key_file: Option<PathBuf>,

    /// OAuth access token for the directory and compute APIs
    #[arg(long, env = "ET_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Service account JSON key used to mint access tokens
    #[arg(long, env = "GOOGLE_APPLICATION_CREDENTIALS")]
    pub service_account_file: Option<PathBuf>,

    /// Account to register the key under (default: the service account, or owner of the token)
    #[arg(long)]
    pub account: Option<String>,

    /// Deadline for authentication, e.g. 30, 45s or 2m
    #[arg(long, value_parser = parse_duration)]
    pub auth_timeout: Option<Duration>,

    /// Remove the key from the directory as soon as the connection is up
    #[arg(long)]
    pub revoke_after_connect: bool,

    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. debug or et_tunnel=trace (overrides -v and RUST_LOG)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Host name or address to tunnel to
    #[arg(long, conflicts_with = "instance")]
    pub host: Option<String>,

    /// Compute instance to tunnel to
    #[arg(long)]
    pub instance: Option<String>,

    /// Zone of the instance
    #[arg(short, long)]
    pub zone: Option<String>,

    /// Project of the instance
    #[arg(short, long)]
    pub project: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Speak SSH directly with a key registered for this session
    Protocol,
    /// Run an external helper (ssh or gcloud)
    Process,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelperArg {
    Ssh,
    Gcloud,
}

impl From<HelperArg> for HelperKind {
    fn from(helper: HelperArg) -> Self {
        match helper {
            HelperArg::Ssh => HelperKind::Ssh,
            HelperArg::Gcloud => HelperKind::Gcloud,
        }
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    serde_utils::duration::parse(value)
        .ok_or_else(|| format!("invalid duration '{}', expected e.g. 30, 45s or 2m", value))
}

impl Cli {
    /// Log filter derived from `--log-level`, `-q` and `-v`
    pub fn log_filter(&self) -> String {
        if let Some(filter) = &self.log_level {
            return filter.clone();
        }
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "warn",
            (false, 1) => "info",
            (false, 2) => "debug",
            (false, _) => "trace",
        }
        .to_string()
    }

    /// Load the config file and apply command-line overrides.
    ///
    /// An explicit `--config` must exist; the default file is optional.
    pub fn tunnel_config(&self) -> Result<TunnelConfig> {
        let base = match &self.config {
            Some(path) => config::load_config(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?,
            None => match config::load_config(&config::default_config_path()) {
                Ok(tunnel) => tunnel,
                Err(ConfigError::NotFound(_)) => TunnelConfig::default(),
                Err(e) => return Err(e).context("Failed to load default config"),
            },
        };
        self.merge(base)
    }

    /// Apply command-line overrides to `tunnel` and check it names a destination
    pub fn merge(&self, mut tunnel: TunnelConfig) -> Result<TunnelConfig> {
        self.apply(&mut tunnel);

        if tunnel.target.is_none() {
            bail!("No target given: pass --host or --instance, or set one in the config file");
        }
        if tunnel.remote_port == 0 {
            bail!("No remote port given: pass --remote-port");
        }
        Ok(tunnel)
    }

    fn apply(&self, tunnel: &mut TunnelConfig) {
        if let Some(host) = &self.target.host {
            tunnel.target = Some(TunnelTarget::Host(host.clone()));
        }
        if let Some(name) = &self.target.instance {
            tunnel.target = Some(TunnelTarget::Instance(InstanceRef::new(name.clone())));
        }
        if let Some(zone) = &self.target.zone {
            tunnel.zone = Some(zone.clone());
        }
        if let Some(project) = &self.target.project {
            tunnel.project = Some(project.clone());
        }

        if let Some(port) = self.remote_port {
            tunnel.remote_port = port;
        }
        if let Some(host) = &self.remote_host {
            tunnel.remote_host = host.clone();
        }
        if let Some(port) = self.local_port {
            tunnel.local_port = Some(port);
        }
        if let Some(port) = self.ssh_port {
            tunnel.ssh_port = port;
        }

        if let Some(token) = &self.access_token {
            tunnel.credentials.access_token = Some(token.clone());
        }
        if let Some(path) = &self.service_account_file {
            tunnel.credentials.service_account_file = Some(path.clone());
        }
        if let Some(path) = &self.key_file {
            tunnel.credentials.key_file = Some(path.clone());
        }
        if let Some(account) = &self.account {
            tunnel.account = Some(account.clone());
        }
        if let Some(timeout) = self.auth_timeout {
            tunnel.auth_timeout = timeout;
        }
        if self.revoke_after_connect {
            tunnel.revoke_after_connect = true;
        }

        self.apply_backend(tunnel);
    }

    fn apply_backend(&self, tunnel: &mut TunnelConfig) {
        let wants_process = match self.backend {
            Some(BackendKind::Process) => true,
            Some(BackendKind::Protocol) => false,
            None => self.helper.is_some() || matches!(tunnel.backend, BackendConfig::Process(_)),
        };

        if !wants_process {
            if self.backend.is_some() {
                tunnel.backend = BackendConfig::default();
            }
            return;
        }

        let mut process = match &tunnel.backend {
            BackendConfig::Process(process) => process.clone(),
            BackendConfig::Protocol(_) => ProcessBackendConfig::default(),
        };
        if let Some(helper) = self.helper {
            process.helper = helper.into();
        }
        if let Some(user) = &self.ssh_user {
            process.ssh_user = Some(user.clone());
        }
        tunnel.backend = BackendConfig::Process(process);
    }
}
