use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub const MIN_DIMENSION: u16 = 1;
pub const MAX_DIMENSION: u16 = 500;

/// Output chunks buffered between the PTY reader thread and the session pump.
/// The reader blocks when this fills, pushing backpressure into the kernel
/// PTY buffer rather than dropping output.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Pending input chunks waiting for the PTY writer thread.
const INPUT_CHANNEL_CAPACITY: usize = 256;

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

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("process has exited")]
    Exited,

    #[error("input backlog full, dropped {0} bytes")]
    InputBacklog(usize),
}

/// Clamp a requested terminal dimension into `[MIN_DIMENSION, MAX_DIMENSION]`.
///
/// Fractions are floored; NaN, infinities and anything below the minimum
/// become the minimum.
pub fn clamp_dimension(value: f64) -> u16 {
    let value = value.floor();
    if !value.is_finite() || value < f64::from(MIN_DIMENSION) {
        return MIN_DIMENSION;
    }
    if value > f64::from(MAX_DIMENSION) {
        return MAX_DIMENSION;
    }
    value as u16
}

/// Everything needed to start a shell on a fresh pseudo-terminal.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub shell: String,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    /// Extra environment on top of the inherited one.
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: u32,
}

/// A running child process attached to a terminal.
pub trait Process: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Queue raw input for the process. Never blocks.
    fn write(&self, data: Bytes) -> Result<(), PtyError>;

    /// Resize the terminal window. Dimensions are clamped before use.
    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;

    /// Request termination. Safe to call any number of times.
    fn kill(&self);
}

/// A freshly spawned process and the two streams it reports on.
///
/// `output` has exactly one consumer and yields chunks in emission order.
/// `exit` resolves once, when the process terminates.
pub struct Spawned {
    pub process: Box<dyn Process>,
    pub output: mpsc::Receiver<Bytes>,
    pub exit: oneshot::Receiver<ExitStatus>,
}

pub trait Spawner: Send + Sync {
    fn spawn(&self, opts: &SpawnOptions) -> Result<Spawned, PtyError>;
}

/// Spawns real shells on the host's native PTY implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl Spawner for PtySpawner {
    fn spawn(&self, opts: &SpawnOptions) -> Result<Spawned, PtyError> {
        Pty::spawn(opts)
    }
}

pub struct Pty {
    master: Mutex<Box<dyn MasterPty + Send>>,
    input_tx: mpsc::Sender<Bytes>,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl Pty {
    pub fn build_command(opts: &SpawnOptions) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&opts.shell);
        if let Some(ref dir) = opts.cwd {
            cmd.cwd(dir);
        }
        if !opts.env.contains_key("TERM") {
            cmd.env(
                "TERM",
                std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()),
            );
        }
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }
        cmd
    }

    /// Open a PTY, start the shell on it, and wire up the reader, writer and
    /// exit-monitor threads.
    pub fn spawn(opts: &SpawnOptions) -> Result<Spawned, PtyError> {
        let size = PtySize {
            rows: clamp_dimension(f64::from(opts.rows)),
            cols: clamp_dimension(f64::from(opts.cols)),
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = native_pty_system().openpty(size).map_err(PtyError::OpenPty)?;

        let mut child = pair
            .slave
            .spawn_command(Self::build_command(opts))
            .map_err(PtyError::SpawnCommand)?;
        // The slave end lives on in the child; holding it here would keep the
        // reader from ever seeing EOF.
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(PtyError::CloneReader)?;
        let writer = pair.master.take_writer().map_err(PtyError::TakeWriter)?;
        let pid = child.process_id();
        let killer = child.clone_killer();
        let exited = Arc::new(AtomicBool::new(false));

        let (output_tx, output_rx) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel::<ExitStatus>();

        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut reader = reader;
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            if output_tx.blocking_send(data).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            }));
            if let Err(e) = result {
                tracing::error!("PTY reader task panicked: {:?}", e);
            }
        });

        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut writer = writer;
                let mut rx = input_rx;
                while let Some(data) = rx.blocking_recv() {
                    if let Err(e) = writer.write_all(&data) {
                        tracing::warn!(?e, "PTY write failed");
                        break;
                    }
                    let _ = writer.flush();
                }
            }));
            if let Err(e) = result {
                tracing::error!("PTY writer task panicked: {:?}", e);
            }
        });

        let exited_flag = exited.clone();
        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                match child.wait() {
                    Ok(status) => status.exit_code(),
                    Err(e) => {
                        tracing::error!(?e, "error waiting for child");
                        1
                    }
                }
            }));
            let code = result.unwrap_or_else(|e| {
                tracing::error!("child exit monitor panicked: {:?}", e);
                1
            });
            exited_flag.store(true, Ordering::Release);
            let _ = exit_tx.send(ExitStatus { code });
        });

        let pty = Pty {
            master: Mutex::new(pair.master),
            input_tx,
            killer: Mutex::new(Some(killer)),
            exited,
            pid,
        };

        Ok(Spawned {
            process: Box::new(pty),
            output: output_rx,
            exit: exit_rx,
        })
    }
}

impl Process for Pty {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&self, data: Bytes) -> Result<(), PtyError> {
        if self.exited.load(Ordering::Acquire) {
            return Err(PtyError::Exited);
        }
        let len = data.len();
        self.input_tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PtyError::InputBacklog(len),
            mpsc::error::TrySendError::Closed(_) => PtyError::Exited,
        })
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .lock()
            .resize(PtySize {
                rows: clamp_dimension(f64::from(rows)),
                cols: clamp_dimension(f64::from(cols)),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }

    fn kill(&self) {
        let Some(mut killer) = self.killer.lock().take() else {
            return;
        };
        if self.exited.load(Ordering::Acquire) {
            tracing::debug!(pid = ?self.pid, "child already exited, skipping kill");
            return;
        }
        if let Err(e) = killer.kill() {
            tracing::debug!(?e, pid = ?self.pid, "kill failed (child likely gone)");
        }
    }
}
