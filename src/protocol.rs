//! Wire protocol for the runtime API.
//!
//! Every request and response that crosses the HTTP boundary is defined here
//! as a serde struct with explicit defaults, so the shapes are validated once
//! at the edge and the rest of the crate works with plain typed values.
//! Application errors travel as an [`ExceptionTransfer`] body carrying a
//! machine-readable [`ErrorKind`], which clients use to reconstruct the
//! original error on their side.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Exit code reported when the real code could not be determined.
pub const EXIT_CODE_UNKNOWN: i64 = -1;

fn default_session() -> String {
    "default".to_string()
}

fn bash_session_type() -> String {
    "bash".to_string()
}

fn exit_code_unknown() -> i64 {
    EXIT_CODE_UNKNOWN
}

/// Machine-readable error kinds. The serialized names are a wire contract:
/// clients match on them to re-raise the corresponding error locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    SessionNotFound,
    SessionExists,
    SessionBusy,
    SessionClosed,
    SpawnFailed,
    CommandTimeout,
    CommandTimeoutUnrecoverable,
    CommandFailed,
    ChannelClosed,
    FileNotFound,
    IsDirectory,
    NotADirectory,
    PermissionDenied,
    DecodeError,
    AuthFailed,
    BadRequest,
    InternalError,
}

/// Body of an application-error response (HTTP 511).
///
/// 511 is deliberately distinct from ordinary transport errors so that a
/// client can tell "the runtime rejected this operation" apart from "the
/// request never reached a healthy runtime".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionTransfer {
    pub error_kind: ErrorKind,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsAliveResponse {
    pub is_alive: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default = "default_session")]
    pub session: String,
    /// Files to `source` before the first prompt sync. These often overwrite
    /// the prompt variables, which are re-exported afterwards.
    #[serde(default)]
    pub startup_source: Vec<String>,
    /// Deadline in seconds for the startup commands.
    #[serde(default)]
    pub startup_timeout: Option<f64>,
    #[serde(default = "bash_session_type")]
    pub session_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    #[serde(default)]
    pub output: String,
    #[serde(default = "bash_session_type")]
    pub session_type: String,
}

/// Whether to verify the exit code of a session command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMode {
    /// Report the exit code but never fail the request because of it.
    #[default]
    Silent,
    /// Fail the request with `COMMAND_FAILED` on a non-zero exit code.
    Raise,
    /// Compatibility alias for `silent`: the exit code travels in-band with
    /// the command frame, so it is reported either way.
    Ignore,
}

impl<'de> Deserialize<'de> for CheckMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Accepts both the tri-state string form and a plain bool, where
        // `true` means "raise".
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Flag(bool),
            Name(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Flag(true) => Ok(CheckMode::Raise),
            Repr::Flag(false) => Ok(CheckMode::Silent),
            Repr::Name(s) => match s.as_str() {
                "silent" => Ok(CheckMode::Silent),
                "raise" => Ok(CheckMode::Raise),
                "ignore" => Ok(CheckMode::Ignore),
                other => Err(serde::de::Error::custom(format!(
                    "unknown check mode: {other:?} (expected silent, raise, or ignore)"
                ))),
            },
        }
    }
}

/// A command to run inside a named session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BashAction {
    #[serde(default = "default_session")]
    pub session: String,
    /// The text exactly as it would be typed at the shell.
    pub command: String,
    /// Deadline in seconds. Absent or non-positive means the runtime default.
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Set for a non-exiting command addressed to an interactive program
    /// (e.g. a REPL). The command is sent verbatim and no exit code is read.
    #[serde(default)]
    pub is_interactive_command: bool,
    /// Set for the command that quits an interactive program and should land
    /// back at the shell prompt.
    #[serde(default)]
    pub is_interactive_quit: bool,
    #[serde(default)]
    pub check: CheckMode,
    /// Prepended to the `COMMAND_FAILED` message when `check` is `raise`.
    #[serde(default)]
    pub error_msg: String,
    /// Additional regexes that terminate the read, e.g. a sub-REPL prompt.
    #[serde(default)]
    pub expect: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BashObservation {
    #[serde(default)]
    pub output: String,
    #[serde(default = "exit_code_unknown")]
    pub exit_code: i64,
    #[serde(default)]
    pub failure_reason: String,
    /// Which expect string terminated the read. Empty on timeout.
    #[serde(default)]
    pub expect_string: String,
    #[serde(default = "bash_session_type")]
    pub session_type: String,
}

impl BashObservation {
    pub fn new(output: String, exit_code: i64, expect_string: String) -> Self {
        Self {
            output,
            exit_code,
            failure_reason: String::new(),
            expect_string,
            session_type: bash_session_type(),
        }
    }

    pub fn failed(output: String, failure_reason: impl Into<String>) -> Self {
        Self {
            output,
            exit_code: EXIT_CODE_UNKNOWN,
            failure_reason: failure_reason.into(),
            expect_string: String::new(),
            session_type: bash_session_type(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptRequest {
    #[serde(default = "default_session")]
    pub session: String,
    /// Deadline in seconds for each attempt to regain the prompt.
    #[serde(default = "InterruptRequest::default_timeout")]
    pub timeout: f64,
    #[serde(default = "InterruptRequest::default_retries")]
    pub n_retry: u32,
    #[serde(default)]
    pub expect: Vec<String>,
}

impl InterruptRequest {
    fn default_timeout() -> f64 {
        0.2
    }

    fn default_retries() -> u32 {
        3
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    #[serde(default = "default_session")]
    pub session: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    #[serde(default = "bash_session_type")]
    pub session_type: String,
}

impl Default for CloseSessionResponse {
    fn default() -> Self {
        Self {
            session_type: bash_session_type(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<String>,
}

/// Argument vector or single command line for a one-shot execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawCommand {
    Argv(Vec<String>),
    Line(String),
}

impl RawCommand {
    /// Render the command for log and error messages.
    pub fn display(&self) -> String {
        match self {
            RawCommand::Argv(argv) => argv.join(" "),
            RawCommand::Line(line) => line.clone(),
        }
    }
}

/// A one-shot sub-process execution, not associated with any session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command: RawCommand,
    /// When set, the command line is passed to `/bin/sh -c`.
    #[serde(default)]
    pub shell: bool,
    /// Deadline in seconds. Absent means no timeout.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub check: bool,
    #[serde(default)]
    pub error_msg: String,
    /// Environment overlay, merged key-by-key over the inherited environment
    /// unless `replace_env` is set.
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub replace_env: bool,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default = "exit_code_unknown")]
    pub exit_code: i64,
    #[serde(default)]
    pub failure_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileRequest {
    pub path: String,
    /// Text encoding; only UTF-8 family encodings are supported.
    #[serde(default)]
    pub encoding: Option<String>,
    /// Decode error policy: `strict`, `replace`, or `ignore`.
    #[serde(default)]
    pub errors: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileResponse {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
    #[serde(default = "WriteFileRequest::default_create_parents")]
    pub create_parents: bool,
}

impl WriteFileRequest {
    fn default_create_parents() -> bool {
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyResponse {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bash_action_minimal() {
        let action: BashAction = serde_json::from_str(r#"{"command": "echo hi"}"#).unwrap();
        assert_eq!(action.session, "default");
        assert_eq!(action.command, "echo hi");
        assert_eq!(action.timeout, None);
        assert_eq!(action.check, CheckMode::Silent);
        assert!(action.expect.is_empty());
        assert!(!action.is_interactive_command);
    }

    #[test]
    fn check_mode_accepts_bool_and_string() {
        let raise: BashAction =
            serde_json::from_str(r#"{"command": "x", "check": true}"#).unwrap();
        assert_eq!(raise.check, CheckMode::Raise);

        let silent: BashAction =
            serde_json::from_str(r#"{"command": "x", "check": false}"#).unwrap();
        assert_eq!(silent.check, CheckMode::Silent);

        let ignore: BashAction =
            serde_json::from_str(r#"{"command": "x", "check": "ignore"}"#).unwrap();
        assert_eq!(ignore.check, CheckMode::Ignore);

        let err = serde_json::from_str::<BashAction>(r#"{"command": "x", "check": "loud"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn raw_command_accepts_argv_and_line() {
        let argv: Command =
            serde_json::from_str(r#"{"command": ["echo", "Hello, world!"]}"#).unwrap();
        assert!(matches!(argv.command, RawCommand::Argv(ref v) if v.len() == 2));

        let line: Command =
            serde_json::from_str(r#"{"command": "echo hi | wc -l", "shell": true}"#).unwrap();
        assert!(matches!(line.command, RawCommand::Line(_)));
        assert!(line.shell);
    }

    #[test]
    fn error_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::SessionNotFound).unwrap(),
            "\"SESSION_NOT_FOUND\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::NotADirectory).unwrap(),
            "\"NOT_A_DIRECTORY\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::CommandTimeoutUnrecoverable).unwrap(),
            "\"COMMAND_TIMEOUT_UNRECOVERABLE\""
        );
        let kind: ErrorKind = serde_json::from_str("\"AUTH_FAILED\"").unwrap();
        assert_eq!(kind, ErrorKind::AuthFailed);
    }

    #[test]
    fn exception_transfer_omits_empty_traceback() {
        let transfer = ExceptionTransfer {
            error_kind: ErrorKind::SessionBusy,
            message: "session busy".into(),
            traceback: None,
        };
        let json = serde_json::to_value(&transfer).unwrap();
        assert_eq!(json["error_kind"], "SESSION_BUSY");
        assert!(json.get("traceback").is_none());
    }

    #[test]
    fn create_session_defaults() {
        let req: CreateSessionRequest = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(req.session, "default");
        assert_eq!(req.session_type, "bash");
        assert!(req.startup_source.is_empty());
        assert!(req.startup_timeout.is_none());
    }

    #[test]
    fn write_file_creates_parents_by_default() {
        let req: WriteFileRequest =
            serde_json::from_str(r#"{"path": "/tmp/a/b", "content": "x"}"#).unwrap();
        assert!(req.create_parents);
    }

    #[test]
    fn observation_round_trip() {
        let obs = BashObservation::new("hi".into(), 0, "PROMPT".into());
        let json = serde_json::to_string(&obs).unwrap();
        let back: BashObservation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.output, "hi");
        assert_eq!(back.exit_code, 0);
        assert_eq!(back.session_type, "bash");
        assert!(back.failure_reason.is_empty());
    }
}
