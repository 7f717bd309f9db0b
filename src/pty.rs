//! PTY channel: a child shell attached to a pseudo-terminal pair.
//!
//! The channel owns the master side of the PTY and the child process handle.
//! Bytes coming out of the master are pumped on a blocking task into an mpsc
//! channel with a single consumer, so every byte is observed exactly once;
//! the session layer is responsible for draining. When the child exits the
//! pump sees end-of-stream and the channel closes.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Read chunk size for the output pump.
const READ_CHUNK: usize = 4096;

/// Buffered chunks between the blocking reader and the session.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("channel closed")]
    ChannelClosed,

    #[error("pty write failed: {0}")]
    Write(#[from] std::io::Error),
}

/// A bash child on a PTY, with a single-consumer output stream.
pub struct PtyChannel {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<Option<Box<dyn portable_pty::Child + Send + Sync>>>,
    pid: Option<u32>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PtyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyChannel")
            .field("pid", &self.pid)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PtyChannel {
    /// Spawn `/bin/bash` on a fresh PTY with the given environment overrides.
    ///
    /// Rc files and history are disabled so the prompt stays deterministic;
    /// the caller presets `PS1` (and friends) through `env`. The child
    /// inherits the server's environment otherwise.
    pub fn spawn_bash(env: &[(&str, &str)]) -> Result<(Self, mpsc::Receiver<Bytes>), PtyError> {
        let mut cmd = CommandBuilder::new("/bin/bash");
        cmd.arg("--norc");
        cmd.arg("--noprofile");
        // TERM=dumb keeps bash from emitting bracketed-paste and title
        // escape sequences into the byte stream.
        cmd.env("TERM", "dumb");
        for (key, value) in env {
            cmd.env(key, value);
        }
        Self::spawn_with_cmd(cmd)
    }

    /// Spawn a pre-built command on a fresh PTY.
    pub fn spawn_with_cmd(cmd: CommandBuilder) -> Result<(Self, mpsc::Receiver<Bytes>), PtyError> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system.openpty(size).map_err(PtyError::OpenPty)?;
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(PtyError::SpawnCommand)?;
        let pid = child.process_id();

        // The slave side must not stay open in this process: the reader only
        // sees end-of-stream once every slave fd is gone.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(PtyError::CloneReader)?;
        let writer = pair.master.take_writer().map_err(PtyError::TakeWriter)?;

        let (output_tx, output_rx) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx
                            .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(?e, "pty reader finished");
                        break;
                    }
                }
            }
        });

        let channel = Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(Some(child)),
            pid,
            closed: AtomicBool::new(false),
        };
        Ok((channel, output_rx))
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write raw bytes to the child's terminal input.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if self.is_closed() {
            return Err(PtyError::ChannelClosed);
        }
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(PtyError::ChannelClosed)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Send SIGINT to the PTY's foreground process group.
    ///
    /// Falls back to signalling the child directly when the foreground group
    /// cannot be determined (e.g. the child just exec'd).
    pub fn interrupt_foreground(&self) {
        #[cfg(unix)]
        {
            if let Some(pgid) = self.master.lock().process_group_leader() {
                if pgid > 0 {
                    unsafe {
                        libc::killpg(pgid, libc::SIGINT);
                    }
                    return;
                }
            }
        }
        self.signal_child(libc::SIGINT);
    }

    /// Send a signal to the child process itself.
    pub fn signal_child(&self, signal: i32) {
        if let Some(pid) = self.pid {
            if pid > i32::MAX as u32 {
                tracing::warn!(pid, "PID exceeds i32::MAX, cannot send signal");
                return;
            }
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, signal);
            }
        }
    }

    /// True while the child process has not been reaped.
    pub fn child_alive(&self) -> bool {
        let mut guard = self.child.lock();
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Terminate the child and release the PTY. Idempotent.
    ///
    /// Sends SIGHUP first and escalates to SIGKILL when the child is still
    /// alive after `grace`.
    pub async fn close(&self, grace: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.writer.lock().take();

        self.signal_child(libc::SIGHUP);
        let deadline = tokio::time::Instant::now() + grace;
        while self.child_alive() {
            if tokio::time::Instant::now() >= deadline {
                tracing::debug!(pid = ?self.pid, "child ignored SIGHUP, escalating to SIGKILL");
                self.signal_child(libc::SIGKILL);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // Reap so the child does not linger as a zombie.
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            let _ = tokio::task::spawn_blocking(move || child.wait()).await;
        }
    }
}
