//! Session lifecycle tests
//!
//! Runs full sessions over the protocol backend against in-process stand-ins
//! for the resolver, the directory service and the SSH transport.

mod common;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use et_core::config::TunnelConfig;
use et_core::traits::{AddressResolver, StaticResolver};
use et_core::{InstanceRef, SessionState, TunnelError, TunnelTarget};
use et_tunnel::{CloseReason, Collaborators, KeyLocks, TunnelHandle, TunnelSession};

use common::{echo_server, ImportBehaviour, StubConnector, StubDirectory};

async fn within<T>(future: impl Future<Output = T>) -> T {
    timeout(Duration::from_secs(10), future)
        .await
        .expect("Timed out waiting for the session")
}

fn instance_config() -> TunnelConfig {
    TunnelConfig::new(TunnelTarget::Instance(InstanceRef::new("web-1")), 80)
}

fn collaborators(
    directory: &Arc<StubDirectory>,
    connector: &Arc<StubConnector>,
    locks: &Arc<KeyLocks>,
) -> Collaborators {
    let resolver: Arc<dyn AddressResolver> =
        Arc::new(StaticResolver::new().with("web-1", "198.51.100.4"));
    Collaborators::new()
        .with_resolver(resolver)
        .with_directory(directory.clone())
        .with_connector(connector.clone())
        .with_key_locks(Arc::clone(locks))
}

fn start(
    config: TunnelConfig,
    directory: &Arc<StubDirectory>,
    connector: &Arc<StubConnector>,
) -> TunnelHandle {
    let locks = Arc::new(KeyLocks::new());
    TunnelSession::start(config, collaborators(directory, connector, &locks))
}

async fn assert_echo(port: u16, payload: &[u8]) {
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(payload).await.unwrap();
    let mut reply = vec![0u8; payload.len()];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, payload);
}

#[tokio::test]
async fn test_end_to_end_round_trip() {
    let directory = Arc::new(StubDirectory::new());
    let connector = Arc::new(StubConnector::new().route(80, echo_server().await));
    let handle = start(instance_config(), &directory, &connector);

    let port = within(handle.local_port()).await.unwrap();
    assert_ne!(port, 0);
    assert_eq!(handle.state(), SessionState::Active);
    assert_eq!(directory.registered(), 1);

    assert_echo(port, b"GET / HTTP/1.0\r\n\r\n").await;
    assert_echo(port, &[0u8, 255, 13, 10, 0, 7]).await;
    assert_eq!(handle.stats().accepted, 2);

    within(handle.close()).await;
    assert_eq!(handle.state(), SessionState::Closed);
    assert_eq!(handle.closed().await, CloseReason::Requested);
    assert_eq!(directory.deletes(), 1);
    assert_eq!(directory.registered(), 0);
    assert_eq!(connector.disconnects(), 1);
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let directory = Arc::new(StubDirectory::new());
    let connector = Arc::new(StubConnector::new().route(80, echo_server().await));
    let handle = start(instance_config(), &directory, &connector);
    within(handle.local_port()).await.unwrap();

    let closer = handle.closer();
    within(async { tokio::join!(handle.close(), closer.close(), closer.close()) }).await;
    within(handle.close()).await;

    assert_eq!(handle.state(), SessionState::Closed);
    assert_eq!(directory.deletes(), 1);
    assert_eq!(connector.disconnects(), 1);
}

#[tokio::test]
async fn test_same_identity_writes_are_serialized() {
    let directory = Arc::new(StubDirectory::new().with_delay(Duration::from_millis(20)));
    let connector = Arc::new(StubConnector::new().route(80, echo_server().await));
    let locks = Arc::new(KeyLocks::new());

    let handles: Vec<TunnelHandle> = (0..4)
        .map(|_| {
            TunnelSession::start(
                instance_config(),
                collaborators(&directory, &connector, &locks),
            )
        })
        .collect();

    for handle in &handles {
        within(handle.local_port()).await.unwrap();
    }
    for handle in &handles {
        within(handle.close()).await;
    }

    assert_eq!(directory.imports(), 4);
    assert_eq!(directory.deletes(), 4);
    assert_eq!(directory.max_in_flight("svc@example.com"), 1);
}

#[tokio::test]
async fn test_distinct_identities_are_not_serialized() {
    let directory = Arc::new(StubDirectory::new().with_delay(Duration::from_millis(200)));
    let connector = Arc::new(StubConnector::new().route(80, echo_server().await));
    let locks = Arc::new(KeyLocks::new());

    let handles: Vec<TunnelHandle> = ["alice@example.com", "bob@example.com"]
        .into_iter()
        .map(|account| {
            let mut config = instance_config();
            config.account = Some(account.to_string());
            TunnelSession::start(config, collaborators(&directory, &connector, &locks))
        })
        .collect();

    for handle in &handles {
        within(handle.local_port()).await.unwrap();
    }
    assert_eq!(directory.max_total_in_flight(), 2);
    assert_eq!(directory.max_in_flight("alice@example.com"), 1);

    for handle in &handles {
        within(handle.close()).await;
    }
}

#[tokio::test]
async fn test_ephemeral_ports_differ() {
    let directory = Arc::new(StubDirectory::new());
    let connector = Arc::new(StubConnector::new().route(80, echo_server().await));

    let first = start(instance_config(), &directory, &connector);
    let first_port = within(first.local_port()).await.unwrap();
    let second = start(instance_config(), &directory, &connector);
    let second_port = within(second.local_port()).await.unwrap();

    assert_ne!(first_port, 0);
    assert_ne!(second_port, 0);
    assert_ne!(first_port, second_port);

    within(first.close()).await;
    within(second.close()).await;
}

#[tokio::test]
async fn test_fixed_local_port() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let directory = Arc::new(StubDirectory::new());
    let connector = Arc::new(StubConnector::new().route(80, echo_server().await));
    let handle = start(instance_config().with_local_port(port), &directory, &connector);

    assert_eq!(within(handle.local_port()).await.unwrap(), port);
    assert_echo(port, b"pinned").await;
    within(handle.close()).await;
}

#[tokio::test]
async fn test_close_before_setup_aborts() {
    let directory = Arc::new(StubDirectory::new().with_behaviour(ImportBehaviour::Hang));
    let connector = Arc::new(StubConnector::new());
    let handle = start(instance_config(), &directory, &connector);

    within(handle.close()).await;

    assert_eq!(within(handle.local_port()).await, Err(TunnelError::Aborted));
    assert_eq!(handle.state(), SessionState::Closed);
    assert_eq!(connector.connects.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(directory.registered(), 0);
    assert_eq!(handle.stats().accepted, 0);
}

#[tokio::test]
async fn test_authentication_deadline() {
    let directory = Arc::new(StubDirectory::new().with_behaviour(ImportBehaviour::Hang));
    let connector = Arc::new(StubConnector::new());
    let mut config = instance_config();
    config.auth_timeout = Duration::from_millis(100);
    let handle = start(config, &directory, &connector);

    assert_eq!(
        within(handle.local_port()).await,
        Err(TunnelError::AuthenticationTimeout(Duration::from_millis(100)))
    );
    within(handle.close()).await;
    assert_eq!(handle.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_rejected_key_fails_without_listening() {
    let directory = Arc::new(StubDirectory::new());
    let connector = Arc::new(StubConnector::new().rejecting());
    let handle = start(instance_config(), &directory, &connector);

    let result = within(handle.local_port()).await;
    assert!(matches!(result, Err(TunnelError::Authentication(_))));

    within(handle.close()).await;
    assert_eq!(handle.state(), SessionState::Failed);
    assert!(matches!(handle.closed().await, CloseReason::Failed(_)));
    // The key was registered before the rejection and is cleaned up
    assert_eq!(directory.deletes(), 1);
    assert_eq!(directory.registered(), 0);
}

#[tokio::test]
async fn test_directory_failure_fails_setup() {
    let directory = Arc::new(StubDirectory::new().with_behaviour(ImportBehaviour::Fail));
    let connector = Arc::new(StubConnector::new());
    let handle = start(instance_config(), &directory, &connector);

    let result = within(handle.local_port()).await;
    assert!(matches!(result, Err(TunnelError::Authentication(_))));
    within(handle.close()).await;
    assert_eq!(directory.deletes(), 0);
}

#[tokio::test]
async fn test_backend_close_is_notified_not_rejected() {
    let directory = Arc::new(StubDirectory::new());
    let connector = Arc::new(StubConnector::new().route(80, echo_server().await));
    let handle = start(instance_config(), &directory, &connector);
    let port = within(handle.local_port()).await.unwrap();

    connector.drop_connection();

    let reason = within(handle.closed()).await;
    assert!(matches!(reason, CloseReason::BackendClosed(_)));
    assert_eq!(within(handle.local_port()).await, Ok(port));

    within(handle.close()).await;
    assert_eq!(handle.state(), SessionState::Closed);
    assert_eq!(directory.deletes(), 1);
}

#[tokio::test]
async fn test_close_racing_backend_close_deregisters_once() {
    let directory = Arc::new(StubDirectory::new().with_delay(Duration::from_millis(10)));
    let connector = Arc::new(StubConnector::new().route(80, echo_server().await));
    let handle = start(instance_config(), &directory, &connector);
    within(handle.local_port()).await.unwrap();

    let closer = handle.closer();
    within(async {
        tokio::join!(closer.close(), async { connector.drop_connection() }, handle.close())
    })
    .await;

    assert_eq!(directory.deletes(), 1);
    assert_eq!(directory.registered(), 0);
    assert!(handle.state().is_terminal());
}

#[tokio::test]
async fn test_revoke_after_connect() {
    let directory = Arc::new(StubDirectory::new());
    let connector = Arc::new(StubConnector::new().route(80, echo_server().await));
    let mut config = instance_config();
    config.revoke_after_connect = true;
    let handle = start(config, &directory, &connector);

    let port = within(handle.local_port()).await.unwrap();
    assert_eq!(directory.deletes(), 1);
    assert_eq!(directory.registered(), 0);
    assert_echo(port, b"still forwarding").await;

    within(handle.close()).await;
    assert_eq!(directory.deletes(), 1);
}

#[tokio::test]
async fn test_invalid_config_fails_immediately() {
    let directory = Arc::new(StubDirectory::new());
    let connector = Arc::new(StubConnector::new());
    let mut config = instance_config();
    config.remote_port = 0;
    let handle = start(config, &directory, &connector);

    assert_eq!(handle.state(), SessionState::Failed);
    assert!(matches!(
        within(handle.local_port()).await,
        Err(TunnelError::Config(_))
    ));
    assert_eq!(directory.imports(), 0);
}

#[tokio::test]
async fn test_protocol_backend_needs_directory() {
    let handle = TunnelSession::start(instance_config(), Collaborators::new());
    assert!(matches!(
        within(handle.local_port()).await,
        Err(TunnelError::Config(_))
    ));
}
