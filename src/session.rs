//! Long-lived bash sessions and the registry that owns them.
//!
//! A `BashSession` drives one shell on a PTY through the sentinel protocol:
//! commands go in framed with an exit-status echo, output is read until the
//! exit tag and the session's unique prompt come back. The session is a
//! small state machine (idle / running / recovering / closed) and the
//! busy-rejection check is what serializes concurrent callers; nothing above
//! this layer holds a lock across a command.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use regex::bytes::Regex as BytesRegex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::protocol::{
    BashAction, BashObservation, CheckMode, CreateSessionRequest, CreateSessionResponse,
    InterruptRequest, EXIT_CODE_UNKNOWN,
};
use crate::pty::{PtyChannel, PtyError};
use crate::sentinel::{self, ExpectHit, MatchSource, SentinelScanner};

/// Timing knobs for session startup, command deadlines, and recovery.
///
/// The recovery windows are deliberately configurable: how long a wedged
/// shell needs to answer an interrupt varies wildly with load.
#[derive(Debug, Clone, Copy)]
pub struct SessionTunables {
    /// Ceiling and fallback for per-command deadlines.
    pub default_timeout: Duration,
    /// Deadline for the initial prompt sync (and `startup_source` files).
    pub startup_timeout: Duration,
    /// How long to wait for the prompt after each SIGINT during recovery.
    pub interrupt_grace: Duration,
    /// Bounded deadline for the final resync attempt.
    pub resync_timeout: Duration,
    /// SIGHUP-to-SIGKILL escalation window when closing.
    pub close_grace: Duration,
}

impl Default for SessionTunables {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(2),
            interrupt_grace: Duration::from_secs(1),
            resync_timeout: Duration::from_secs(5),
            close_grace: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Recovering,
    Closed,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session {0:?} does not exist")]
    NotFound(String),

    #[error("session {0:?} already exists")]
    Exists(String),

    #[error("session {0:?} is already running a command")]
    Busy(String),

    #[error("failed to spawn session shell: {0}")]
    Spawn(#[source] PtyError),

    #[error("session {0:?} did not reach its prompt within the startup deadline")]
    StartupTimeout(String),

    #[error("command timed out and could not recover")]
    TimeoutUnrecoverable,

    #[error("failed to interrupt session {0:?}")]
    InterruptFailed(String),

    #[error("{0}")]
    CommandFailed(String),

    #[error("invalid expect pattern: {0}")]
    BadExpect(#[from] regex::Error),

    #[error(transparent)]
    Channel(#[from] PtyError),
}

/// Mutable half of a session: the output stream and its scanner.
struct SessionIo {
    output_rx: mpsc::Receiver<Bytes>,
    scanner: SentinelScanner,
    eof: bool,
}

impl SessionIo {
    /// Throw away everything buffered or already in flight.
    fn discard_pending(&mut self) {
        self.scanner.clear();
        while let Ok(chunk) = self.output_rx.try_recv() {
            drop(chunk);
        }
    }
}

/// One interactive shell, addressable by name.
pub struct BashSession {
    name: String,
    prompt: String,
    tunables: SessionTunables,
    state: Mutex<SessionState>,
    io: tokio::sync::Mutex<SessionIo>,
    pty: PtyChannel,
    created_at: Instant,
    last_activity: Mutex<Instant>,
}

impl std::fmt::Debug for BashSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BashSession")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("pid", &self.pty.child_pid())
            .finish_non_exhaustive()
    }
}

/// What terminated a bounded read.
enum ReadEvent {
    Hit(ExpectHit),
    Eof,
    Deadline,
}

impl BashSession {
    /// Spawn the shell, pin the prompt variables, source any startup files,
    /// and sync to the first prompt.
    pub async fn open(
        name: String,
        request: &CreateSessionRequest,
        tunables: SessionTunables,
    ) -> Result<(Arc<Self>, String), SessionError> {
        let prompt = sentinel::fresh_prompt();
        let (pty, output_rx) = PtyChannel::spawn_bash(&[
            ("PS1", prompt.as_str()),
            ("PS2", ""),
            ("PS0", ""),
            ("PROMPT_COMMAND", ""),
        ])
        .map_err(SessionError::Spawn)?;

        let scanner = SentinelScanner::new(&prompt);
        let session = Arc::new(Self {
            name: name.clone(),
            prompt,
            tunables,
            state: Mutex::new(SessionState::Running),
            io: tokio::sync::Mutex::new(SessionIo {
                output_rx,
                scanner,
                eof: false,
            }),
            pty,
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
        });

        let startup_timeout = request
            .startup_timeout
            .filter(|t| *t > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(tunables.startup_timeout);

        let mut setup: Vec<String> = request
            .startup_source
            .iter()
            .map(|path| format!("source {path}"))
            .collect();
        setup.extend(sentinel::prompt_setup(&session.prompt));
        let setup_line = format!("{}\n", setup.join(" ; "));

        let output = {
            let mut io = session.io.lock().await;
            if let Err(e) = session.pty.write(setup_line.as_bytes()) {
                drop(io);
                session.close().await;
                return Err(SessionError::Channel(e));
            }
            // Warm-up newline: guarantees at least one more prompt even if
            // the setup produced no output of its own.
            let _ = session.pty.write(b"\n");

            match session.read_event(&mut io, &[], startup_timeout).await {
                ReadEvent::Hit(_) => {}
                ReadEvent::Eof | ReadEvent::Deadline => {
                    drop(io);
                    session.close().await;
                    return Err(SessionError::StartupTimeout(name));
                }
            }
            // Let the echoed setup line and trailing prompts land, then
            // start from a clean buffer.
            session.drain_for(&mut io, Duration::from_millis(200)).await;
            let output =
                sentinel::normalize_output(io.scanner.buffer(), &session.prompt, None);
            io.discard_pending();
            output
        };

        *session.state.lock() = SessionState::Idle;
        tracing::info!(session = %session.name, pid = ?session.pty.child_pid(), "session started");
        Ok((session, output))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Clamp a requested per-command deadline to the configured ceiling.
    fn effective_timeout(&self, requested: Option<f64>) -> Duration {
        match requested {
            Some(t) if t > 0.0 => Duration::from_secs_f64(t).min(self.tunables.default_timeout),
            _ => self.tunables.default_timeout,
        }
    }

    /// Run one command to its sentinel (or expect match), with recovery on
    /// deadline expiry.
    pub async fn run(&self, action: &BashAction) -> Result<BashObservation, SessionError> {
        let expects = sentinel::compile_expects(&action.expect)?;

        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Idle => *state = SessionState::Running,
                SessionState::Running | SessionState::Recovering => {
                    return Err(SessionError::Busy(self.name.clone()));
                }
                SessionState::Closed => return Err(SessionError::NotFound(self.name.clone())),
            }
        }

        self.touch();
        let result = self.run_locked(action, &expects).await;
        self.touch();

        match &result {
            Ok(obs) if obs.failure_reason.is_empty() => {
                if action.check == CheckMode::Raise && obs.exit_code != 0 {
                    let mut msg = format!(
                        "Command {:?} failed with exit code {}. Here is the output:\n{}",
                        action.command, obs.exit_code, obs.output
                    );
                    if !action.error_msg.is_empty() {
                        msg = format!("{}: {}", action.error_msg, msg);
                    }
                    return Err(SessionError::CommandFailed(msg));
                }
            }
            _ => {}
        }
        result
    }

    /// Body of `run`; the caller has already moved the state to RUNNING and
    /// is responsible for surfacing `check` failures.
    async fn run_locked(
        &self,
        action: &BashAction,
        expects: &[BytesRegex],
    ) -> Result<BashObservation, SessionError> {
        let mut io = self.io.lock().await;
        io.discard_pending();

        let interactive = action.is_interactive_command || action.is_interactive_quit;
        let payload = if interactive {
            format!("{}\n", action.command.trim_end_matches('\n'))
        } else {
            sentinel::frame_command(&action.command)
        };

        if self.pty.write(payload.as_bytes()).is_err() {
            drop(io);
            self.close().await;
            return Ok(BashObservation::failed(String::new(), "session exited"));
        }

        // Each payload line yields one prompt; the exit tag rides on the
        // last one. Interactive commands are unframed and never counted.
        let frame_lines = if interactive {
            0
        } else {
            payload.lines().count().max(1)
        };

        let timeout = self.effective_timeout(action.timeout);
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(obs) = self.try_finish(&mut io, action, expects, interactive, frame_lines) {
                *self.state.lock() = SessionState::Idle;
                return Ok(obs);
            }
            if io.eof {
                let output =
                    sentinel::normalize_output(io.scanner.buffer(), &self.prompt, Some(&action.command));
                drop(io);
                self.close().await;
                return Ok(BashObservation::failed(output, "session exited"));
            }

            match tokio::time::timeout_at(deadline, io.output_rx.recv()).await {
                Ok(Some(chunk)) => io.scanner.push(&chunk),
                Ok(None) => io.eof = true,
                Err(_) => return self.recover(&mut io, action).await,
            }
        }
    }

    /// Check the accumulated buffer for a terminating match.
    fn try_finish(
        &self,
        io: &mut SessionIo,
        action: &BashAction,
        expects: &[BytesRegex],
        interactive: bool,
        frame_lines: usize,
    ) -> Option<BashObservation> {
        if interactive {
            let hit = io.scanner.find_first(expects)?;
            let raw = io.scanner.buffer()[..hit.start].to_vec();
            let output = sentinel::normalize_output(&raw, &self.prompt, Some(&action.command));
            let (exit_code, expect_string) = match hit.source {
                MatchSource::Expect(i) => (0, action.expect[i].clone()),
                // Back at the shell prompt: a quit landed as intended; a
                // non-exiting interactive command ending here has no
                // recoverable status.
                MatchSource::Prompt if action.is_interactive_quit => (0, self.prompt.clone()),
                MatchSource::Prompt => (EXIT_CODE_UNKNOWN, self.prompt.clone()),
            };
            io.scanner.consume(hit.end);
            return Some(BashObservation::new(output, exit_code, expect_string));
        }

        // Framed command: the exit tag plus the next prompt wins, but a
        // custom expect (e.g. a sub-REPL prompt) may terminate the read
        // first — the frame's echo then resolves on a later command.
        let completion = io.scanner.find_completion();
        if !expects.is_empty() {
            if let Some(hit) = io.scanner.find_first(expects) {
                if let MatchSource::Expect(i) = hit.source {
                    let earlier = completion.map_or(true, |c| hit.start < c.output_end);
                    if earlier {
                        let raw = io.scanner.buffer()[..hit.start].to_vec();
                        let output =
                            sentinel::normalize_output(&raw, &self.prompt, Some(&action.command));
                        io.scanner.consume(hit.end);
                        return Some(BashObservation::new(output, 0, action.expect[i].clone()));
                    }
                }
            }
        }

        if let Some(completion) = completion {
            let raw = io.scanner.buffer()[..completion.output_end].to_vec();
            let output = sentinel::normalize_output(&raw, &self.prompt, Some(&action.command));
            io.scanner.consume(completion.consumed);
            return Some(BashObservation::new(
                output,
                completion.exit_code,
                self.prompt.clone(),
            ));
        }

        // The shell printed a prompt for every payload line yet no exit tag
        // ever appeared: the list was aborted mid-flight, which is what an
        // interactive shell does when its foreground job dies to SIGINT.
        // The exit status is unknowable at that point.
        if let Some(range) = io.scanner.find_nth_prompt(frame_lines) {
            let raw = io.scanner.buffer()[..range.start].to_vec();
            let output = sentinel::normalize_output(&raw, &self.prompt, Some(&action.command));
            io.scanner.consume(range.end);
            return Some(BashObservation::new(
                output,
                EXIT_CODE_UNKNOWN,
                self.prompt.clone(),
            ));
        }
        None
    }

    /// The deadline expired: interrupt, resync, and only tear the session
    /// down when the shell cannot be brought back to a prompt.
    async fn recover(
        &self,
        io: &mut SessionIo,
        action: &BashAction,
    ) -> Result<BashObservation, SessionError> {
        *self.state.lock() = SessionState::Recovering;
        tracing::debug!(session = %self.name, command = %action.command, "command deadline expired, interrupting");

        for _ in 0..2 {
            self.pty.interrupt_foreground();
            if let Some(obs) = self.resync(io, action, self.tunables.interrupt_grace).await {
                return Ok(obs);
            }
            if io.eof {
                break;
            }
        }

        if !io.eof {
            // The process group is not listening; push a literal ETX through
            // the terminal and give the shell one bounded chance to resync.
            let _ = self.pty.write(b"\x03");
            let _ = self.pty.write(b"\n");
            if let Some(obs) = self.resync(io, action, self.tunables.resync_timeout).await {
                return Ok(obs);
            }
        }

        tracing::warn!(session = %self.name, "shell did not return to prompt, closing session");
        self.close().await;
        Err(SessionError::TimeoutUnrecoverable)
    }

    /// Wait up to `limit` for the prompt; on success the session is idle
    /// again and the timed-out command's partial output is returned.
    async fn resync(
        &self,
        io: &mut SessionIo,
        action: &BashAction,
        limit: Duration,
    ) -> Option<BashObservation> {
        match self.read_event(io, &[], limit).await {
            ReadEvent::Hit(hit) => {
                let raw = io.scanner.buffer()[..hit.start].to_vec();
                let output = sentinel::normalize_output(&raw, &self.prompt, Some(&action.command));
                io.scanner.consume(hit.end);
                self.drain_for(io, Duration::from_millis(100)).await;
                *self.state.lock() = SessionState::Idle;
                Some(BashObservation::failed(output, "command timed out"))
            }
            ReadEvent::Eof | ReadEvent::Deadline => None,
        }
    }

    /// Read until one of `expects` or the prompt matches, end-of-stream, or
    /// the deadline.
    async fn read_event(
        &self,
        io: &mut SessionIo,
        expects: &[BytesRegex],
        limit: Duration,
    ) -> ReadEvent {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(hit) = io.scanner.find_first(expects) {
                return ReadEvent::Hit(hit);
            }
            if io.eof {
                return ReadEvent::Eof;
            }
            match tokio::time::timeout_at(deadline, io.output_rx.recv()).await {
                Ok(Some(chunk)) => io.scanner.push(&chunk),
                Ok(None) => io.eof = true,
                Err(_) => return ReadEvent::Deadline,
            }
        }
    }

    /// Collect whatever arrives within `window` without looking for matches.
    async fn drain_for(&self, io: &mut SessionIo, window: Duration) {
        let deadline = Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, io.output_rx.recv()).await {
                Ok(Some(chunk)) => io.scanner.push(&chunk),
                Ok(None) => {
                    io.eof = true;
                    return;
                }
                Err(_) => return,
            }
        }
    }

    /// Deliver SIGINT to the session's foreground process group.
    ///
    /// While a command is in flight this fires and returns immediately; the
    /// in-flight `run` observes the interrupted command's own exit. On an
    /// idle session the interrupt is retried until the prompt (or one of the
    /// caller's expect patterns) comes back.
    pub async fn interrupt(&self, request: &InterruptRequest) -> Result<BashObservation, SessionError> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Closed => return Err(SessionError::NotFound(self.name.clone())),
                SessionState::Running | SessionState::Recovering => {
                    drop(state);
                    self.pty.interrupt_foreground();
                    return Ok(BashObservation::new(String::new(), 0, String::new()));
                }
                SessionState::Idle => *state = SessionState::Running,
            }
        }

        let result = self.interrupt_idle(request).await;
        if !matches!(result, Err(SessionError::NotFound(_))) {
            *self.state.lock() = SessionState::Idle;
        }
        result
    }

    /// Interrupt dance for an idle session hosting a stuck foreground
    /// program (typically a REPL started with an interactive command).
    async fn interrupt_idle(
        &self,
        request: &InterruptRequest,
    ) -> Result<BashObservation, SessionError> {
        let expects = sentinel::compile_expects(&request.expect)?;
        let per_try = Duration::from_secs_f64(request.timeout.max(0.05));
        let mut io = self.io.lock().await;

        for _ in 0..request.n_retry.max(1) {
            self.pty.interrupt_foreground();
            if let ReadEvent::Hit(hit) = self.read_event(&mut io, &expects, per_try).await {
                return Ok(self.finish_interrupt(&mut io, request, hit).await);
            }
            if io.eof {
                drop(io);
                self.close().await;
                return Err(SessionError::NotFound(self.name.clone()));
            }
        }

        // Last resort: suspend the job and kill it from the shell.
        let _ = self.pty.write(b"\x1a");
        if let ReadEvent::Hit(_) = self.read_event(&mut io, &expects, per_try).await {
            let _ = self.pty.write(b"kill -9 %1\n");
            if let ReadEvent::Hit(hit) = self
                .read_event(&mut io, &expects, self.tunables.interrupt_grace)
                .await
            {
                return Ok(self.finish_interrupt(&mut io, request, hit).await);
            }
        }

        Err(SessionError::InterruptFailed(self.name.clone()))
    }

    async fn finish_interrupt(
        &self,
        io: &mut SessionIo,
        request: &InterruptRequest,
        hit: ExpectHit,
    ) -> BashObservation {
        let expect_string = match hit.source {
            MatchSource::Expect(i) => request.expect[i].clone(),
            MatchSource::Prompt => self.prompt.clone(),
        };
        io.scanner.consume(hit.end);
        self.drain_for(io, Duration::from_millis(200)).await;
        let output = sentinel::normalize_output(io.scanner.buffer(), &self.prompt, None);
        io.scanner.clear();
        BashObservation::new(output, 0, expect_string)
    }

    /// Terminate the shell and release the PTY. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.pty.close(self.tunables.close_grace).await;
        tracing::info!(session = %self.name, "session closed");
    }
}

/// Thread-safe map of live sessions.
///
/// `create` is the only writer of new entries and failures leave the map
/// unchanged; `close` tears the session down before removing the entry, so
/// a concurrent `get` sees either a live session or nothing.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<BashSession>>>>,
    tunables: SessionTunables,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionTunables::default())
    }
}

impl SessionRegistry {
    pub fn new(tunables: SessionTunables) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            tunables,
        }
    }

    pub fn tunables(&self) -> SessionTunables {
        self.tunables
    }

    /// Spawn and register a new session.
    pub async fn create(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, SessionError> {
        let name = request.session.clone();
        if self.inner.read().contains_key(&name) {
            return Err(SessionError::Exists(name));
        }

        let (session, output) =
            BashSession::open(name.clone(), request, self.tunables).await?;

        let lost_race = {
            let mut map = self.inner.write();
            if map.contains_key(&name) {
                true
            } else {
                map.insert(name.clone(), Arc::clone(&session));
                false
            }
        };
        if lost_race {
            session.close().await;
            return Err(SessionError::Exists(name));
        }

        Ok(CreateSessionResponse {
            output,
            session_type: "bash".to_string(),
        })
    }

    pub fn get(&self, name: &str) -> Result<Arc<BashSession>, SessionError> {
        self.inner
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(name.to_string()))
    }

    /// Close and remove a session. Closing an unknown name succeeds, so
    /// callers can retry close freely.
    pub async fn close(&self, name: &str) {
        let session = self.inner.read().get(name).cloned();
        if let Some(session) = session {
            session.close().await;
            self.inner.write().remove(name);
        }
    }

    /// Close every session, bounded by `deadline` overall.
    pub async fn close_all(&self, deadline: Duration) {
        let sessions: Vec<Arc<BashSession>> = {
            let mut map = self.inner.write();
            map.drain().map(|(_, s)| s).collect()
        };
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "closing all sessions");
        let mut tasks = tokio::task::JoinSet::new();
        for session in sessions {
            tasks.spawn(async move { session.close().await });
        }
        let _ = tokio::time::timeout(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
