//! Shared helpers for integration tests: a real server on an ephemeral
//! port plus a typed client pointed at it.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rexd::api::{AppState, RouterConfig};
use rexd::client::RemoteRuntime;
use rexd::server;
use rexd::session::{SessionRegistry, SessionTunables};

pub const TOKEN: &str = "integration-test-token";

/// Recovery windows shrunk so timeout tests stay fast.
pub fn quick_tunables() -> SessionTunables {
    SessionTunables {
        default_timeout: Duration::from_secs(20),
        startup_timeout: Duration::from_secs(5),
        interrupt_grace: Duration::from_millis(400),
        resync_timeout: Duration::from_secs(1),
        close_grace: Duration::from_secs(1),
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        let state = AppState {
            sessions: SessionRegistry::new(quick_tunables()),
            shutdown: CancellationToken::new(),
        };
        let shutdown = state.shutdown.clone();
        let handle = tokio::spawn(server::serve(
            listener,
            state,
            RouterConfig {
                token: Some(TOKEN.to_string()),
            },
        ));
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    pub fn client(&self) -> RemoteRuntime {
        RemoteRuntime::new(self.addr.to_string(), TOKEN)
    }

    pub fn client_with_token(&self, token: &str) -> RemoteRuntime {
        RemoteRuntime::new(self.addr.to_string(), token)
    }

    /// Cancel the shutdown token and wait for the server task to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(10), self.handle).await;
    }
}

/// True when `python3` exists on this machine; some scenarios need it.
pub fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}
