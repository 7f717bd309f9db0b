//! rexd - a remote execution runtime.
//!
//! A client program drives long-lived interactive bash sessions on this
//! machine, runs one-off sub-processes, and moves whole files, all through
//! a small authenticated HTTP API. The interesting part is the session
//! runtime: each session is a bash shell on a PTY whose idle/busy boundary
//! is detected with an in-band prompt sentinel and an exit-status echo,
//! with interrupt-based recovery when a command overruns its deadline.
//!
//! Module map:
//! - [`pty`]: the shell child and its byte pump
//! - [`sentinel`]: command framing and stream scanning
//! - [`session`]: the per-session state machine and the registry
//! - [`execute`]: one-shot sub-process runs (no PTY)
//! - [`fsio`]: whole-file read/write
//! - [`protocol`]: wire shapes and the error-kind contract
//! - [`api`]: axum router, auth, error translation
//! - [`server`]: supervisor (serve, signals, drain)
//! - [`client`]: typed client that re-raises server error kinds

pub mod api;
pub mod client;
pub mod execute;
pub mod fsio;
pub mod protocol;
pub mod pty;
pub mod sentinel;
pub mod server;
pub mod session;
