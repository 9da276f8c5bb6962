//! In-process stand-ins for the directory, transport and helper process
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use et_core::traits::DirectoryService;
use et_core::types::same_public_key;
use et_core::{DirectoryError, IdentityRef, LoginProfile, PosixAccount, SshPublicKey, TunnelError};
use et_tunnel::backend::{HelperCommand, HelperProcess, OutputReader, ProcessLauncher};
use et_tunnel::transport::{ConnectRequest, ForwardStream, Transport, TransportConnector};

pub const READY: &str =
    "debug1: Authentication succeeded (publickey).\ndebug1: Entering interactive session.\n";
pub const IN_USE: &str =
    "bind [127.0.0.1]: Address already in use\nchannel_setup_fwd_listener_tcpip: cannot listen to port\n";

/// Echo server standing in for the remote service
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportBehaviour {
    Succeed,
    Hang,
    Fail,
}

/// Directory keeping keys in memory and recording write concurrency
pub struct StubDirectory {
    identity: String,
    delay: Duration,
    behaviour: ImportBehaviour,
    keys: Mutex<HashMap<String, (String, String)>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: Mutex<HashMap<String, usize>>,
    total_in_flight: AtomicUsize,
    max_total_in_flight: AtomicUsize,
    pub imports: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl StubDirectory {
    pub fn new() -> Self {
        Self {
            identity: "svc@example.com".to_string(),
            delay: Duration::ZERO,
            behaviour: ImportBehaviour::Succeed,
            keys: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight: Mutex::new(HashMap::new()),
            total_in_flight: AtomicUsize::new(0),
            max_total_in_flight: AtomicUsize::new(0),
            imports: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_behaviour(mut self, behaviour: ImportBehaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    pub fn imports(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Registered keys left behind
    pub fn registered(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    /// Highest number of concurrent writes seen for `identity`
    pub fn max_in_flight(&self, identity: &str) -> usize {
        self.max_in_flight
            .lock()
            .unwrap()
            .get(identity)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of concurrent writes seen across identities
    pub fn max_total_in_flight(&self) -> usize {
        self.max_total_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, identity: &IdentityRef) -> WriteGuard<'_> {
        let mut in_flight = self.in_flight.lock().unwrap();
        let count = in_flight.entry(identity.to_string()).or_insert(0);
        *count += 1;
        let mut max = self.max_in_flight.lock().unwrap();
        let peak = max.entry(identity.to_string()).or_insert(0);
        *peak = (*peak).max(*count);

        let total = self.total_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_total_in_flight.fetch_max(total, Ordering::SeqCst);

        WriteGuard {
            directory: self,
            identity: identity.to_string(),
        }
    }

    fn profile(&self, identity: &IdentityRef) -> LoginProfile {
        let ssh_public_keys = self
            .keys
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, (owner, _))| owner == identity.as_str())
            .map(|(fingerprint, (_, key))| {
                (
                    fingerprint.clone(),
                    SshPublicKey {
                        key: key.clone(),
                        fingerprint: Some(fingerprint.clone()),
                        expiration_time_usec: None,
                    },
                )
            })
            .collect();

        LoginProfile {
            name: identity.to_string(),
            posix_accounts: vec![PosixAccount {
                username: identity.as_str().replace(['@', '.'], "_"),
                primary: true,
                uid: Some("1001".to_string()),
            }],
            ssh_public_keys,
        }
    }
}

struct WriteGuard<'a> {
    directory: &'a StubDirectory,
    identity: String,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.directory.in_flight.lock().unwrap().get_mut(&self.identity) {
            *count -= 1;
        }
        self.directory.total_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DirectoryService for StubDirectory {
    async fn current_identity(&self) -> Result<IdentityRef, DirectoryError> {
        Ok(IdentityRef::new(self.identity.clone()))
    }

    async fn import_key(
        &self,
        identity: &IdentityRef,
        public_key: &str,
    ) -> Result<LoginProfile, DirectoryError> {
        let _guard = self.enter(identity);
        let serial = self.imports.fetch_add(1, Ordering::SeqCst) + 1;

        match self.behaviour {
            ImportBehaviour::Hang => std::future::pending::<()>().await,
            ImportBehaviour::Fail => {
                return Err(DirectoryError::Status {
                    status: 403,
                    body: "permission denied".to_string(),
                })
            }
            ImportBehaviour::Succeed => {}
        }
        tokio::time::sleep(self.delay).await;

        let fingerprint = format!("fp-{}", serial);
        self.keys.lock().unwrap().insert(
            fingerprint,
            (identity.to_string(), public_key.to_string()),
        );
        Ok(self.profile(identity))
    }

    async fn delete_key(
        &self,
        identity: &IdentityRef,
        fingerprint: &str,
    ) -> Result<(), DirectoryError> {
        let _guard = self.enter(identity);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.keys.lock().unwrap().remove(fingerprint);
        Ok(())
    }
}

/// Whether `directory` holds `public_key` for anyone
pub fn holds_key(directory: &StubDirectory, public_key: &str) -> bool {
    directory
        .keys
        .lock()
        .unwrap()
        .values()
        .any(|(_, key)| same_public_key(key, public_key))
}

/// Connector whose channels are TCP connections to per-port stand-ins
pub struct StubConnector {
    routes: HashMap<u16, SocketAddr>,
    reject: bool,
    connections: Mutex<Vec<CancellationToken>>,
    pub connects: AtomicUsize,
    pub disconnects: Arc<AtomicUsize>,
}

impl StubConnector {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            reject: false,
            connections: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            disconnects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Send channels for `remote_port` to `addr`
    pub fn route(mut self, remote_port: u16, addr: SocketAddr) -> Self {
        self.routes.insert(remote_port, addr);
        self
    }

    /// Reject every connection
    pub fn rejecting(mut self) -> Self {
        self.reject = true;
        self
    }

    /// Simulate the server dropping the most recent connection
    pub fn drop_connection(&self) {
        if let Some(closed) = self.connections.lock().unwrap().last() {
            closed.cancel();
        }
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for StubConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn Transport>, TunnelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.reject {
            return Err(TunnelError::Authentication(format!(
                "key rejected for {}",
                request.username
            )));
        }
        self.connections.lock().unwrap().push(request.closed.clone());
        Ok(Arc::new(StubTransport {
            routes: self.routes.clone(),
            closed: request.closed,
            disconnects: Arc::clone(&self.disconnects),
        }))
    }
}

struct StubTransport {
    routes: HashMap<u16, SocketAddr>,
    closed: CancellationToken,
    disconnects: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for StubTransport {
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<ForwardStream, TunnelError> {
        let addr = self
            .routes
            .get(&port)
            .ok_or_else(|| TunnelError::Channel(format!("connect to {}:{} refused", host, port)))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TunnelError::Channel(e.to_string()))?;
        Ok(Box::pin(stream))
    }

    async fn disconnect(&self) -> Result<(), TunnelError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }
}

/// Helper whose output is scripted; runs until stdin closes or it is killed
pub struct ScriptedProcess {
    output: Option<&'static str>,
    running: Arc<watch::Sender<bool>>,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl HelperProcess for ScriptedProcess {
    fn take_output(&mut self) -> Vec<OutputReader> {
        match self.output.take() {
            Some(script) => vec![Box::new(Cursor::new(script.as_bytes())) as OutputReader],
            None => vec![],
        }
    }

    fn close_stdin(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.send_replace(false);
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|running| !running).await;
        Ok(Some(255))
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.running.send_replace(false);
        Ok(())
    }
}

/// Launcher replaying one script per launch and recording the ports used
pub struct ScriptedLauncher {
    scripts: Mutex<VecDeque<&'static str>>,
    ports: Mutex<Vec<u16>>,
    running: Mutex<Vec<Arc<watch::Sender<bool>>>>,
    pub stops: Arc<AtomicUsize>,
}

impl ScriptedLauncher {
    pub fn new(scripts: &[&'static str]) -> Self {
        Self {
            scripts: Mutex::new(scripts.iter().copied().collect()),
            ports: Mutex::new(Vec::new()),
            running: Mutex::new(Vec::new()),
            stops: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every launched helper exit on its own
    pub fn exit_all(&self) {
        for running in self.running.lock().unwrap().iter() {
            running.send_replace(false);
        }
    }

    pub fn ports(&self) -> Vec<u16> {
        self.ports.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn launch(&self, command: &HelperCommand) -> Result<Box<dyn HelperProcess>, TunnelError> {
        self.ports.lock().unwrap().push(command.local_port);
        let output = self.scripts.lock().unwrap().pop_front().unwrap_or(READY);
        let running = Arc::new(watch::channel(true).0);
        self.running.lock().unwrap().push(Arc::clone(&running));
        Ok(Box::new(ScriptedProcess {
            output: Some(output),
            running,
            stops: Arc::clone(&self.stops),
        }))
    }
}
