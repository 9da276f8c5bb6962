//! Helper-process backend
//!
//! Runs `ssh` or `gcloud compute ssh` with a local forward and infers
//! readiness from its output. A local port conflict reported before the
//! helper becomes ready is retried on a fresh port, unless the caller pinned
//! the port.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{select_all, SelectAll};
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use et_core::config::{HelperKind, ProcessBackendConfig, TunnelConfig};
use et_core::traits::AddressResolver;
use et_core::{TunnelError, TunnelTarget};

use super::helper::{
    pick_ephemeral_port, ForwardSpec, HelperCommand, HelperDestination, HelperProcess,
    OutputReader, ProcessLauncher,
};
use super::monitor::{HelperLineCodec, HelperMonitor, HelperState, Sentinels};
use super::{resolve_address, scoped_target, Readiness, TransportBackend};
use crate::transport::ForwardStream;

/// How long to wait for a helper that closed its output to exit
const EXIT_WAIT: Duration = Duration::from_secs(2);

type HelperOutput = SelectAll<FramedRead<OutputReader, HelperLineCodec>>;
type ShutdownRequest = oneshot::Sender<()>;

/// Outcome of one helper launch
enum Attempt {
    Ready {
        process: Box<dyn HelperProcess>,
        output: HelperOutput,
    },
    AddressInUse,
}

/// Backend that delegates the transport to an external helper
pub struct ProcessBackend {
    settings: ProcessBackendConfig,
    target: TunnelTarget,
    remote_host: String,
    remote_port: u16,
    ssh_port: u16,
    key_file: Option<PathBuf>,
    pinned_port: Option<u16>,
    launcher: Arc<dyn ProcessLauncher>,
    resolver: Option<Arc<dyn AddressResolver>>,
    sentinels: Arc<Sentinels>,
    /// Address handed to the ssh helper, resolved once
    address: OnceCell<String>,
    closed: CancellationToken,
    /// Channel to the supervisor of a ready helper
    supervisor: Mutex<Option<mpsc::Sender<ShutdownRequest>>>,
}

impl ProcessBackend {
    /// Create a backend for `config` using helper `settings`
    pub fn new(
        config: &TunnelConfig,
        settings: ProcessBackendConfig,
        launcher: Arc<dyn ProcessLauncher>,
        resolver: Option<Arc<dyn AddressResolver>>,
    ) -> Result<Self, TunnelError> {
        let target = scoped_target(config)?;
        if settings.helper == HelperKind::Ssh
            && matches!(target, TunnelTarget::Instance(_))
            && resolver.is_none()
        {
            return Err(TunnelError::Config(
                "the ssh helper needs an address resolver for instance targets".to_string(),
            ));
        }

        Ok(Self {
            sentinels: Arc::new(Sentinels::from_config(&settings)),
            settings,
            target,
            remote_host: config.remote_host.clone(),
            remote_port: config.remote_port,
            ssh_port: config.ssh_port,
            key_file: config.credentials.key_file().map(PathBuf::from),
            pinned_port: config.pinned_local_port(),
            launcher,
            resolver,
            address: OnceCell::new(),
            closed: CancellationToken::new(),
            supervisor: Mutex::new(None),
        })
    }

    fn command(&self, address: Option<&str>, local_port: u16) -> Result<HelperCommand, TunnelError> {
        let destination = match (self.settings.helper, &self.target, address) {
            (HelperKind::Gcloud, TunnelTarget::Instance(instance), _) => {
                HelperDestination::Instance(instance)
            }
            (_, _, Some(address)) => HelperDestination::Address(address),
            (_, TunnelTarget::Instance(instance), None) => HelperDestination::Instance(instance),
            (_, TunnelTarget::Host(host), None) => HelperDestination::Address(host),
        };
        let forward = ForwardSpec {
            local_port,
            remote_host: &self.remote_host,
            remote_port: self.remote_port,
            ssh_port: self.ssh_port,
            key_file: self.key_file.as_deref(),
        };
        HelperCommand::build(&self.settings, destination, forward)
    }

    /// Address for the ssh helper; gcloud looks instances up itself
    async fn helper_address(&self) -> Result<Option<String>, TunnelError> {
        if self.settings.helper == HelperKind::Gcloud {
            return Ok(None);
        }
        self.address
            .get_or_try_init(|| resolve_address(&self.target, self.resolver.as_ref()))
            .await
            .map(|address| Some(address.clone()))
    }

    /// Launch the helper once and watch it until it is ready or gives up
    async fn spawn(&self, command: &HelperCommand) -> Result<Attempt, TunnelError> {
        let mut process = self.launcher.launch(command)?;
        let codec = HelperLineCodec::new(Arc::clone(&self.sentinels));
        let mut output = select_all(
            process
                .take_output()
                .into_iter()
                .map(|reader| FramedRead::new(reader, codec.clone())),
        );
        let mut monitor = HelperMonitor::new();

        while let Some(line) = output.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::debug!("Helper output unreadable: {}", e);
                    break;
                }
            };
            tracing::trace!("helper: {}", line.text);

            match monitor.observe(&line) {
                Some(HelperState::Ready) => return Ok(Attempt::Ready { process, output }),
                Some(HelperState::Failed) => {
                    if let Err(e) = process.kill().await {
                        tracing::debug!("Failed to kill helper: {}", e);
                    }
                    return Ok(Attempt::AddressInUse);
                }
                _ => {}
            }
        }

        let exit = match tokio::time::timeout(EXIT_WAIT, process.wait()).await {
            Ok(Ok(Some(code))) => format!("exit code {}", code),
            Ok(Ok(None)) => "terminated by signal".to_string(),
            Ok(Err(e)) => format!("wait failed: {}", e),
            Err(_) => {
                let _ = process.kill().await;
                "output closed".to_string()
            }
        };
        Err(TunnelError::BackendClosed(format!(
            "{} stopped before the tunnel was ready ({}): {}",
            command.program,
            exit,
            monitor.tail()
        )))
    }

    /// Hand a ready helper to a detached supervisor task
    async fn detach(&self, process: Box<dyn HelperProcess>, output: HelperOutput) {
        let (tx, rx) = mpsc::channel(1);
        *self.supervisor.lock().await = Some(tx);
        tokio::spawn(supervise(
            process,
            output,
            rx,
            self.closed.clone(),
            self.settings.shutdown_grace,
        ));
    }
}

#[async_trait]
impl TransportBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn authenticate(&self) -> Result<Readiness, TunnelError> {
        let address = self.helper_address().await?;
        let mut port = match self.pinned_port {
            Some(port) => port,
            None => pick_ephemeral_port()?,
        };
        let mut retries = 0;

        loop {
            let command = self.command(address.as_deref(), port)?;
            match self.spawn(&command).await? {
                Attempt::Ready { process, output } => {
                    tracing::info!("Helper {} forwarding on port {}", command.program, port);
                    self.detach(process, output).await;
                    return Ok(Readiness::Delegated { local_port: port });
                }
                Attempt::AddressInUse if self.pinned_port.is_some() => {
                    return Err(TunnelError::Listen {
                        port,
                        reason: "Address already in use".to_string(),
                    });
                }
                Attempt::AddressInUse if retries >= self.settings.max_port_retries => {
                    return Err(TunnelError::Listen {
                        port,
                        reason: format!("Still in use after {} retries", retries),
                    });
                }
                Attempt::AddressInUse => {
                    retries += 1;
                    let next = pick_ephemeral_port()?;
                    tracing::warn!("Port {} in use, retrying on {}", port, next);
                    port = next;
                }
            }
        }
    }

    async fn open_forward_channel(
        &self,
        _remote_host: &str,
        _remote_port: u16,
    ) -> Result<ForwardStream, TunnelError> {
        Err(TunnelError::Channel(
            "the helper process owns the local listener".to_string(),
        ))
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn shutdown(&self) -> Result<(), TunnelError> {
        let Some(supervisor) = self.supervisor.lock().await.take() else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if supervisor.send(ack_tx).await.is_err() {
            // Helper already exited
            return Ok(());
        }
        ack_rx
            .await
            .map_err(|_| TunnelError::BackendClosed("Helper supervisor went away".to_string()))
    }
}

/// Own a ready helper until it exits or shutdown is requested
async fn supervise(
    mut process: Box<dyn HelperProcess>,
    mut output: HelperOutput,
    mut requests: mpsc::Receiver<ShutdownRequest>,
    closed: CancellationToken,
    grace: Duration,
) {
    let mut draining = true;

    loop {
        tokio::select! {
            line = output.next(), if draining => match line {
                Some(Ok(line)) => tracing::trace!("helper: {}", line.text),
                Some(Err(_)) | None => draining = false,
            },
            status = process.wait() => {
                match status {
                    Ok(code) => tracing::warn!("Helper exited ({:?})", code),
                    Err(e) => tracing::warn!("Lost track of helper: {}", e),
                }
                closed.cancel();
                return;
            }
            request = requests.recv() => {
                stop(process.as_mut(), grace).await;
                closed.cancel();
                if let Some(ack) = request {
                    let _ = ack.send(());
                }
                return;
            }
        }
    }
}

/// Ask the helper to exit by closing its stdin, then kill it after `grace`
async fn stop(process: &mut dyn HelperProcess, grace: Duration) {
    process.close_stdin();
    match tokio::time::timeout(grace, process.wait()).await {
        Ok(_) => tracing::debug!("Helper exited"),
        Err(_) => {
            tracing::debug!("Helper still running after {:?}, killing it", grace);
            if let Err(e) = process.kill().await {
                tracing::warn!("Failed to kill helper: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::watch;

    /// Helper whose output is fixed and which runs until stdin closes or it is killed
    struct ScriptedProcess {
        output: Option<Vec<u8>>,
        running: watch::Sender<bool>,
        exit_on_stdin_close: bool,
    }

    #[async_trait]
    impl HelperProcess for ScriptedProcess {
        fn take_output(&mut self) -> Vec<OutputReader> {
            self.output
                .take()
                .map(|bytes| vec![Box::new(Cursor::new(bytes)) as OutputReader])
                .unwrap_or_default()
        }

        fn close_stdin(&mut self) {
            if self.exit_on_stdin_close {
                self.running.send_replace(false);
            }
        }

        async fn wait(&mut self) -> std::io::Result<Option<i32>> {
            let mut rx = self.running.subscribe();
            let _ = rx.wait_for(|running| !running).await;
            Ok(Some(0))
        }

        async fn kill(&mut self) -> std::io::Result<()> {
            self.running.send_replace(false);
            Ok(())
        }
    }

    /// Launcher replaying one output script per launch
    struct ScriptedLauncher {
        scripts: StdMutex<VecDeque<&'static str>>,
        launched: StdMutex<Vec<u16>>,
    }

    impl ScriptedLauncher {
        fn new(scripts: &[&'static str]) -> Self {
            Self {
                scripts: StdMutex::new(scripts.iter().copied().collect()),
                launched: StdMutex::new(Vec::new()),
            }
        }
    }

    impl ProcessLauncher for ScriptedLauncher {
        fn launch(&self, command: &HelperCommand) -> Result<Box<dyn HelperProcess>, TunnelError> {
            self.launched.lock().unwrap().push(command.local_port);
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or("");
            Ok(Box::new(ScriptedProcess {
                output: Some(script.as_bytes().to_vec()),
                running: watch::channel(true).0,
                exit_on_stdin_close: true,
            }))
        }
    }

    const IN_USE: &str = "debug1: Local connections to LOCALHOST forwarded\nbind [127.0.0.1]: Address already in use\n";
    const READY: &str = "debug1: Authentication succeeded (publickey).\ndebug1: Entering interactive session.\n";

    fn config(local_port: Option<u16>) -> TunnelConfig {
        let mut config = TunnelConfig::new(TunnelTarget::Host("203.0.113.7".to_string()), 5432);
        config.local_port = local_port;
        config
    }

    fn backend(config: &TunnelConfig, launcher: Arc<ScriptedLauncher>) -> ProcessBackend {
        ProcessBackend::new(config, ProcessBackendConfig::default(), launcher, None).unwrap()
    }

    #[tokio::test]
    async fn test_ready_on_first_attempt() {
        let launcher = Arc::new(ScriptedLauncher::new(&[READY]));
        let backend = backend(&config(None), Arc::clone(&launcher));

        let readiness = backend.authenticate().await.unwrap();
        let launched = launcher.launched.lock().unwrap().clone();
        assert_eq!(readiness, Readiness::Delegated { local_port: launched[0] });
        assert!(!backend.closed().is_cancelled());

        backend.shutdown().await.unwrap();
        assert!(backend.closed().is_cancelled());
    }

    #[tokio::test]
    async fn test_retries_on_port_conflict() {
        let launcher = Arc::new(ScriptedLauncher::new(&[IN_USE, READY]));
        let backend = backend(&config(None), Arc::clone(&launcher));

        let readiness = backend.authenticate().await.unwrap();
        let launched = launcher.launched.lock().unwrap().clone();
        assert_eq!(launched.len(), 2);
        assert_eq!(readiness, Readiness::Delegated { local_port: launched[1] });
        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pinned_port_conflict_fails_immediately() {
        let launcher = Arc::new(ScriptedLauncher::new(&[IN_USE, READY]));
        let backend = backend(&config(Some(15432)), Arc::clone(&launcher));

        let err = backend.authenticate().await.unwrap_err();
        assert!(err.is_listen());
        assert_eq!(launcher.launched.lock().unwrap().as_slice(), &[15432]);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let launcher = Arc::new(ScriptedLauncher::new(&[IN_USE; 10]));
        let settings = ProcessBackendConfig {
            max_port_retries: 2,
            ..ProcessBackendConfig::default()
        };
        let backend =
            ProcessBackend::new(&config(None), settings, Arc::clone(&launcher) as _, None).unwrap();

        let err = backend.authenticate().await.unwrap_err();
        assert!(err.is_listen());
        assert_eq!(launcher.launched.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_exit_before_ready_reports_output() {
        let launcher = Arc::new(ScriptedLauncher::new(&["Permission denied (publickey).\n"]));
        let backend = backend(&config(None), launcher);

        match backend.authenticate().await {
            Err(TunnelError::BackendClosed(message)) => {
                assert!(message.contains("Permission denied"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_instance_target_needs_resolver_for_ssh() {
        let config = TunnelConfig::new(
            TunnelTarget::Instance(et_core::InstanceRef::new("db-1")),
            5432,
        );
        let launcher: Arc<dyn ProcessLauncher> = Arc::new(ScriptedLauncher::new(&[]));
        let result = ProcessBackend::new(&config, ProcessBackendConfig::default(), launcher, None);
        assert!(matches!(result, Err(TunnelError::Config(_))));
    }
}
