//! remote - the runtime server binary.
//!
//! Binds the HTTP API, keeps the session registry for the lifetime of the
//! process, and tears everything down on SIGINT/SIGTERM or `POST /close`.
//! All session state is in-memory; a restart starts from nothing.

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rexd::api::{AppState, RouterConfig};
use rexd::server;
use rexd::session::SessionRegistry;

const EXIT_BIND_FAILURE: i32 = 1;
const EXIT_AUTH_MISCONFIGURED: i32 = 2;

/// Remote execution runtime server.
///
/// Hosts long-lived interactive bash sessions, one-shot command execution,
/// and file transfer behind a bearer-token HTTP API.
#[derive(Parser, Debug)]
#[command(name = "remote", version, about, long_about = None)]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Bearer token clients must present; generated when omitted
    #[arg(long, env = "REMOTE_AUTH_TOKEN")]
    auth_token: Option<String>,
}

fn resolve_token(args: &Args) -> Result<String, ()> {
    match &args.auth_token {
        Some(token) if token.trim().is_empty() => Err(()),
        Some(token) => Ok(token.clone()),
        None => {
            let token = uuid::Uuid::new_v4().to_string();
            eprintln!("remote: generated auth token: {token}");
            Ok(token)
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "rexd=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Ok(token) = resolve_token(&args) else {
        eprintln!("remote: --auth-token must not be empty");
        std::process::exit(EXIT_AUTH_MISCONFIGURED);
    };

    println!("Starting runtime");

    let listener = match TcpListener::bind((args.host.as_str(), args.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(host = %args.host, port = args.port, error = %e, "failed to bind");
            std::process::exit(EXIT_BIND_FAILURE);
        }
    };
    tracing::info!(host = %args.host, port = args.port, "listening");

    let state = AppState {
        sessions: SessionRegistry::default(),
        shutdown: CancellationToken::new(),
    };
    server::watch_signals(state.shutdown.clone());

    if let Err(e) = server::serve(listener, state, RouterConfig { token: Some(token) }).await {
        tracing::error!(error = %e, "server failed");
        std::process::exit(EXIT_BIND_FAILURE);
    }
}
