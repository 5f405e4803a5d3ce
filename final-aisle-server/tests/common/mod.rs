//! Shared harness: a live server on an ephemeral port.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use final_aisle::core::crypto::SymmetricKey;
use final_aisle::network::auth::AuthConfig;
use final_aisle::network::client::RelayClient;
use final_aisle::network::mail::MemoryMailer;
use final_aisle::network::protocol::{ClientRequest, Password, ServerMessage};
use final_aisle::{AccountDirectory, RelayServer, ServerConfig};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// RSA size for test clients; small keeps key generation fast.
pub const CLIENT_BITS: usize = 1024;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub server: Arc<RelayServer>,
    pub addr: SocketAddr,
    pub mailer: Arc<MemoryMailer>,
    running: Option<JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(ServerConfig::default()).await
    }

    pub async fn start_with(config: ServerConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let accounts = AccountDirectory::open_with_key(dir.path(), SymmetricKey::generate()).unwrap();
        let mailer = Arc::new(MemoryMailer::new());
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            stats_interval: None,
            shutdown_grace: Duration::from_secs(1),
            ..config
        };

        let server = Arc::new(RelayServer::new(config, AuthConfig::default(), accounts, mailer.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = tokio::spawn({
            let server = server.clone();
            async move {
                server.serve(listener).await.unwrap();
            }
        });

        Self {
            server,
            addr,
            mailer,
            running: Some(running),
            _dir: dir,
        }
    }

    pub async fn connect(&self) -> RelayClient {
        tokio::time::timeout(TIMEOUT, RelayClient::connect_with_bits(self.addr, CLIENT_BITS))
            .await
            .expect("handshake timed out")
            .unwrap()
    }

    /// Create an account directly in the directory.
    pub async fn create_account(&self, email: &str, username: &str, password: &str) {
        self.server
            .sessions()
            .registry()
            .await
            .accounts
            .create(email, username, password)
            .unwrap();
    }

    /// Connect and log in.
    pub async fn login(&self, identifier: &str, password: &str) -> RelayClient {
        let mut client = self.connect().await;
        client.send(&login(identifier, password)).await.unwrap();
        assert_eq!(recv(&mut client).await, ServerMessage::LoginSuccess);
        client
    }

    /// Wait for the verification email sent to `email` and return its code.
    pub async fn verification_code(&self, email: &str) -> String {
        let sent = wait_for(|| {
            self.mailer
                .sent()
                .into_iter()
                .rev()
                .find(|m| m.to == email)
        })
        .await;
        let end = sent.html_body.find("</h1>").expect("code heading");
        sent.html_body[end - 6..end].to_owned()
    }

    pub async fn shutdown(mut self) {
        self.server.shutdown();
        if let Some(running) = self.running.take() {
            tokio::time::timeout(TIMEOUT, running).await.unwrap().unwrap();
        }
    }
}

pub async fn recv(client: &mut RelayClient) -> ServerMessage {
    tokio::time::timeout(TIMEOUT, client.recv())
        .await
        .expect("no message within timeout")
        .unwrap()
}

pub async fn wait_for<T>(mut poll: impl FnMut() -> Option<T>) -> T {
    for _ in 0..500 {
        if let Some(value) = poll() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

pub fn login(identifier: &str, password: &str) -> ClientRequest {
    ClientRequest::Login {
        identifier: identifier.into(),
        password: Password::new(password),
    }
}

pub fn new_account(email: &str, username: &str, password: &str) -> ClientRequest {
    ClientRequest::NewAccount {
        email: email.into(),
        username: username.into(),
        password: Password::new(password),
    }
}

pub fn verify(code: &str) -> ClientRequest {
    ClientRequest::VerifyEmail { code: code.into() }
}
