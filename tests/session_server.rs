//! End-to-end tests of the accept loop over real TCP sockets

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use secure_channel::protocol::magic::LOG_OUT;
use secure_channel::{
    handler, tcp, Accounts, Connection, KdfParams, NetworkConfig, ProtocolError, Server, User,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Harness {
    config: NetworkConfig,
    server: Arc<Server>,
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<secure_channel::Result<()>>,
}

async fn echo(connection: Arc<Connection>) -> secure_channel::Result<()> {
    loop {
        let text = connection.read_string().await?;
        connection.write_string(&text).await?;
    }
}

async fn start(accounts: Accounts, tweak: impl FnOnce(&mut NetworkConfig)) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let mut config = NetworkConfig::default_with_overrides(|c| {
        c.server.address = address.clone();
        c.client.address = address;
        c.transport.kdf = KdfParams::insecure_fast();
        c.server.accept_poll_interval = Duration::from_millis(20);
        c.server.eviction_timeout = Duration::from_millis(500);
    });
    tweak(&mut config);

    let server = Arc::new(Server::new(config.clone(), Arc::new(accounts)));
    let (shutdown, rx) = mpsc::channel(1);
    let running = Arc::clone(&server);
    let task = tokio::spawn(async move { running.run(listener, rx, handler(echo)).await });

    Harness {
        config,
        server,
        shutdown,
        task,
    }
}

fn accounts_with(users: &[(&str, &str)]) -> Accounts {
    let accounts = Accounts::with_registration_password("shared");
    for (name, password) in users {
        accounts.create(name, password).unwrap();
    }
    accounts
}

#[tokio::test]
async fn test_login_and_echo() {
    let h = start(accounts_with(&[("ann", "pw")]), |_| {}).await;

    let conn = tcp::connect(&h.config, Arc::new(User::new("ann", "pw")))
        .await
        .unwrap();
    for text in ["hello", "", "ünïcødé ✓"] {
        conn.write_string(text).await.unwrap();
        assert_eq!(conn.read_string().await.unwrap(), text);
    }
    conn.close().await.unwrap();
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_second_login_evicts_first() {
    let h = start(accounts_with(&[("ann", "pw")]), |_| {}).await;
    let ann = || Arc::new(User::new("ann", "pw"));

    let first = tcp::connect(&h.config, ann()).await.unwrap();
    first.write_string("one").await.unwrap();
    assert_eq!(first.read_string().await.unwrap(), "one");

    let second = tcp::connect(&h.config, ann()).await.unwrap();

    // The stale session is told to log out, then its stream ends.
    assert_eq!(first.read_int().await.unwrap(), LOG_OUT);
    assert!(first.read_int().await.is_err());

    second.write_string("two").await.unwrap();
    assert_eq!(second.read_string().await.unwrap(), "two");
    assert_eq!(h.server.sessions().len().await, 1);
}

#[tokio::test]
async fn test_logout_surfaces_on_expecting_read() {
    let h = start(accounts_with(&[("ann", "pw")]), |_| {}).await;
    let ann = || Arc::new(User::new("ann", "pw"));

    let first = tcp::connect(&h.config, ann()).await.unwrap();
    let _second = tcp::connect(&h.config, ann()).await.unwrap();

    assert!(matches!(
        first.read_int_expect(42).await,
        Err(ProtocolError::LoggedOut)
    ));
}

#[tokio::test]
async fn test_failed_handshake_does_not_stop_server() {
    let h = start(accounts_with(&[("ann", "pw")]), |_| {}).await;

    let err = tcp::connect(&h.config, Arc::new(User::new("bob", "pw")))
        .await
        .unwrap_err();
    assert!(err.is_authentication());

    let err = tcp::connect(&h.config, Arc::new(User::new("ann", "nope")))
        .await
        .unwrap_err();
    assert!(err.is_authentication());

    let conn = tcp::connect(&h.config, Arc::new(User::new("ann", "pw")))
        .await
        .unwrap();
    conn.write_string("still here").await.unwrap();
    assert_eq!(conn.read_string().await.unwrap(), "still here");
}

#[tokio::test]
async fn test_register_then_login() {
    let h = start(accounts_with(&[]), |_| {}).await;

    let conn = tcp::register(&h.config, "shared", "erin", "hunter2")
        .await
        .unwrap();
    conn.write_string("hi").await.unwrap();
    assert_eq!(conn.read_string().await.unwrap(), "hi");
    conn.close().await.unwrap();

    assert!(h.server.accounts().get("erin").is_some());
    let again = tcp::connect(&h.config, Arc::new(User::new("erin", "hunter2")))
        .await
        .unwrap();
    again.write_string("back").await.unwrap();
    assert_eq!(again.read_string().await.unwrap(), "back");
}

#[tokio::test]
async fn test_concurrent_duplicate_registration_over_tcp() {
    let h = start(accounts_with(&[]), |_| {}).await;

    let (a, b) = tokio::join!(
        tcp::register(&h.config, "shared", "frank", "one"),
        tcp::register(&h.config, "shared", "frank", "two"),
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(ProtocolError::DuplicateName(name)) if name == "frank")));
    assert_eq!(h.server.accounts().len(), 1);
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let h = start(accounts_with(&[("ann", "pw")]), |_| {}).await;

    let conn = tcp::connect(&h.config, Arc::new(User::new("ann", "pw")))
        .await
        .unwrap();
    conn.write_string("ping").await.unwrap();
    assert_eq!(conn.read_string().await.unwrap(), "ping");

    h.shutdown.send(()).await.unwrap();
    let result = h.task.await.unwrap();
    assert!(matches!(result, Err(ProtocolError::Interrupted)));

    assert!(conn.read_string().await.is_err());
    assert!(h.server.sessions().is_empty().await);
}

#[tokio::test]
async fn test_dropped_shutdown_sender_interrupts() {
    let h = start(accounts_with(&[]), |_| {}).await;
    drop(h.shutdown);
    let result = tokio::time::timeout(Duration::from_secs(5), h.task)
        .await
        .expect("server stops")
        .unwrap();
    assert!(matches!(result, Err(ProtocolError::Interrupted)));
}

#[tokio::test]
async fn test_connection_limit_drops_excess_sockets() {
    let h = start(accounts_with(&[("ann", "pw"), ("bob", "pw")]), |c| {
        c.server.max_connections = 1;
    })
    .await;

    let ann = tcp::connect(&h.config, Arc::new(User::new("ann", "pw")))
        .await
        .unwrap();
    ann.write_string("busy").await.unwrap();
    assert_eq!(ann.read_string().await.unwrap(), "busy");

    let mut excess = TcpStream::connect(&h.config.client.address).await.unwrap();
    let mut buf = [0u8; 4];
    let read = tokio::time::timeout(Duration::from_secs(5), excess.read(&mut buf))
        .await
        .expect("socket is closed promptly");
    assert!(matches!(read, Ok(0) | Err(_)));
}
