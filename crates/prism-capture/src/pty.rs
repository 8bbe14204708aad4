//! CLI child process on a pseudo-terminal.
//!
//! Reads happen on a blocking thread and are forwarded as [`PtyEvent::Data`]
//! chunks; a second blocking thread waits for the child and reports
//! [`PtyEvent::Exit`]. No restart is attempted after the child exits.

use std::io::{Read, Write};

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::{CaptureError, Result};

/// Smallest accepted terminal width.
pub const MIN_COLS: u16 = 20;
/// Largest accepted terminal width.
pub const MAX_COLS: u16 = 500;
/// Smallest accepted terminal height.
pub const MIN_ROWS: u16 = 5;
/// Largest accepted terminal height.
pub const MAX_ROWS: u16 = 200;

const READ_BUFFER_SIZE: usize = 4096;

/// Checks a terminal size against the accepted range.
pub fn validate_size(cols: u16, rows: u16) -> Result<()> {
    if cols < MIN_COLS || cols > MAX_COLS || rows < MIN_ROWS || rows > MAX_ROWS {
        return Err(CaptureError::InvalidSize { cols, rows });
    }
    Ok(())
}

/// How to launch the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyOptions {
    /// Executable to run.
    pub program: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Initial width in columns.
    pub cols: u16,
    /// Initial height in rows.
    pub rows: u16,
    /// Extra environment variables on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl PtyOptions {
    /// Options for `program` with no arguments and an 80x24 terminal.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cols: 80,
            rows: 24,
            env: Vec::new(),
        }
    }

    /// Sets the arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the initial size.
    #[must_use]
    pub const fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }
}

/// Output of a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Raw bytes written by the child.
    Data(Vec<u8>),
    /// The child exited with this code (-1 when unknown).
    Exit(i32),
}

/// A spawned CLI attached to a pseudo-terminal.
///
/// Dropping the session kills the child.
pub struct PtySession {
    program: String,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

impl PtySession {
    /// Spawns the CLI and starts forwarding its output.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(options: &PtyOptions) -> Result<(Self, mpsc::UnboundedReceiver<PtyEvent>)> {
        validate_size(options.cols, options.rows)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(CaptureError::pty)?;

        let mut cmd = CommandBuilder::new(&options.program);
        cmd.args(&options.args);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        // CommandBuilder starts with an empty environment
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| CaptureError::spawn(&options.program, e.to_string()))?;
        // The child holds its own handle; ours would keep the terminal open
        drop(pair.slave);

        let killer = child.clone_killer();
        let writer = pair.master.take_writer().map_err(CaptureError::pty)?;
        let mut reader = pair.master.try_clone_reader().map_err(CaptureError::pty)?;

        info!(
            program = %options.program,
            pid = child.process_id().unwrap_or(0),
            cols = options.cols,
            rows = options.rows,
            "PTY spawned"
        );

        let (tx, rx) = mpsc::unbounded_channel();

        let data_tx = tx.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if data_tx.send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "PTY read ended");
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let code = tokio::task::spawn_blocking(move || child.wait())
                .await
                .ok()
                .and_then(std::result::Result::ok)
                .map_or(-1, |status| i32::try_from(status.exit_code()).unwrap_or(-1));
            info!(exit_code = code, "PTY child exited");
            let _ = tx.send(PtyEvent::Exit(code));
        });

        Ok((
            Self {
                program: options.program.clone(),
                master: Mutex::new(pair.master),
                writer: Mutex::new(writer),
                killer: Mutex::new(killer),
            },
            rx,
        ))
    }

    /// Forwards input to the child verbatim.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).map_err(|_| CaptureError::Closed)?;
        writer.flush().map_err(|_| CaptureError::Closed)?;
        Ok(())
    }

    /// Resizes the terminal. Out-of-range sizes are rejected and the
    /// terminal keeps its current size.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if let Err(e) = validate_size(cols, rows) {
            warn!(cols, rows, "Rejected terminal resize");
            return Err(e);
        }
        self.master
            .lock()
            .await
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(CaptureError::pty)?;
        debug!(cols, rows, "Terminal resized");
        Ok(())
    }

    /// Kills the child. Killing an already exited child is not an error.
    pub async fn kill(&self) {
        if let Err(e) = self.killer.lock().await.kill() {
            debug!(error = %e, "Kill after exit");
        } else {
            info!(program = %self.program, "PTY session killed");
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if let Err(e) = self.killer.get_mut().kill() {
            // Usually the child has already exited
            debug!(error = %e, "Kill on drop failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_validate_size_bounds() {
        assert!(validate_size(20, 5).is_ok());
        assert!(validate_size(500, 200).is_ok());
        assert!(validate_size(160, 40).is_ok());
        assert!(matches!(
            validate_size(19, 40),
            Err(CaptureError::InvalidSize { cols: 19, rows: 40 })
        ));
        assert!(validate_size(501, 40).is_err());
        assert!(validate_size(80, 4).is_err());
        assert!(validate_size(80, 201).is_err());
    }

    #[test]
    fn test_options_builder() {
        let options = PtyOptions::new("redis-cli")
            .with_args(["-n", "3"])
            .with_size(120, 30);
        assert_eq!(options.args, vec!["-n", "3"]);
        assert_eq!((options.cols, options.rows), (120, 30));
    }

    #[tokio::test]
    async fn test_spawn_rejects_bad_size() {
        let options = PtyOptions::new("cat").with_size(10, 10);
        assert!(matches!(
            PtySession::spawn(&options),
            Err(CaptureError::InvalidSize { .. })
        ));
    }

    #[tokio::test]
    #[ignore = "requires a pseudo-terminal"]
    async fn test_echo_through_pty() {
        let options = PtyOptions::new("cat");
        let (session, mut events) = PtySession::spawn(&options).unwrap();
        session.write(b"hello\n").await.unwrap();

        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !String::from_utf8_lossy(&seen).contains("hello") {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .unwrap()
                .unwrap();
            if let PtyEvent::Data(bytes) = event {
                seen.extend(bytes);
            }
        }

        assert!(session.resize(10, 10).await.is_err());
        session.resize(100, 30).await.unwrap();
        session.kill().await;
    }
}
