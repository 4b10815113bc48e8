use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, Notify};

use super::error::AgentMuxError;
use super::tool::{SpawnOptions, ToolKind};

const MAX_WRITE_CHUNK: usize = 4096;
const WRITE_CHUNK_PAUSE: Duration = Duration::from_millis(10);
const SPAWN_WATCHDOG: Duration = Duration::from_secs(30);
const GRACEFUL_STOP_GRACE: Duration = Duration::from_secs(5);

/// Decodes UTF-8 across arbitrary read boundaries by holding back trailing
/// bytes that don't yet form a complete code point.
struct Utf8Decoder {
    incomplete: Vec<u8>,
}

impl Utf8Decoder {
    fn new() -> Self {
        Self {
            incomplete: Vec::new(),
        }
    }

    fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.incomplete);
        buf.extend_from_slice(bytes);

        match std::str::from_utf8(&buf) {
            Ok(s) => s.to_string(),
            Err(e) => {
                let valid_len = e.valid_up_to();
                let (valid, rest) = buf.split_at(valid_len);
                let text = String::from_utf8_lossy(valid).into_owned();
                // Only hold back the tail if it could still become valid
                // with more bytes (at most a 4-byte UTF-8 sequence).
                if rest.len() <= 4 && e.error_len().is_none() {
                    self.incomplete = rest.to_vec();
                    text
                } else {
                    // A genuinely invalid sequence: don't stall forever on
                    // it, emit it lossily and move on.
                    text + &String::from_utf8_lossy(rest)
                }
            }
        }
    }
}

/// Events flowing out of a spawned PTY toward the registry's per-session
/// output loop.
pub enum PtyEvent {
    Output(String),
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },
    Error(AgentMuxError),
}

/// A running child process bridged to a PTY. Input is serialized through a
/// dedicated writer thread that owns the master's writer exclusively, so no
/// two callers can interleave writes to the child's stdin.
pub struct PtyHandle {
    input_tx: std::sync::mpsc::Sender<Vec<u8>>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    child_pid: i32,
    #[cfg(unix)]
    pgid: i32,
    shutdown: Arc<Notify>,
}

impl PtyHandle {
    /// Queues `data` for write to the child's stdin. Failures after the
    /// child has exited are logged and discarded rather than surfaced,
    /// matching how a real terminal swallows writes to a dead shell.
    pub fn write_stdin(&self, data: &[u8]) {
        if self.input_tx.send(data.to_vec()).is_err() {
            log::debug!("pty {} write after writer thread exited", self.child_pid);
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        if let Ok(master) = self.master.lock() {
            if let Err(e) = master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            }) {
                log::debug!("pty {} resize failed: {e}", self.child_pid);
            }
        }
    }

    pub fn pid(&self) -> i32 {
        self.child_pid
    }

    /// SIGTERMs the process group, waits up to 5s, then SIGKILLs. On
    /// Windows there is no polite signal to send so `taskkill /T` is used
    /// directly, matching what a user's own terminal would do.
    pub async fn stop(&self) {
        #[cfg(unix)]
        {
            let pgid = self.pgid;
            unsafe {
                libc::kill(-pgid, libc::SIGTERM);
            }
            let pid = self.child_pid;
            let exited = tokio::time::timeout(GRACEFUL_STOP_GRACE, async move {
                loop {
                    let alive = unsafe { libc::kill(pid, 0) } == 0;
                    if !alive {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            })
            .await;
            if exited.is_err() {
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
            }
        }
        #[cfg(windows)]
        {
            let pid = self.child_pid;
            let _ = tokio::task::spawn_blocking(move || {
                std::process::Command::new("taskkill")
                    .args(["/PID", &pid.to_string(), "/T", "/F"])
                    .output()
            })
            .await;
        }
        self.shutdown.notify_waiters();
    }
}

/// Opens a PTY, spawns `tool`'s binary in it, and wires up reader/writer
/// threads. Returns immediately; events arrive on the returned channel.
pub fn spawn(
    tool: ToolKind,
    binary: PathBuf,
    opts: SpawnOptions,
) -> Result<(PtyHandle, mpsc::UnboundedReceiver<PtyEvent>), AgentMuxError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: opts.rows,
            cols: opts.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| AgentMuxError::Validation(format!("failed to open pty: {e}")))?;

    let mut cmd = CommandBuilder::new(&binary);
    for arg in tool.build_args(&opts) {
        cmd.arg(arg);
    }
    cmd.cwd(&opts.working_dir);
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    cmd.env("FORCE_COLOR", "1");

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| AgentMuxError::ToolUnavailable(format!("failed to spawn {}: {e}", tool.as_str())))?;
    drop(pair.slave);

    let child_pid = child
        .process_id()
        .ok_or_else(|| AgentMuxError::ToolUnavailable("could not obtain child pid".into()))? as i32;

    #[cfg(unix)]
    let pgid = pair.master.process_group_leader().unwrap_or(child_pid);

    let writer = pair
        .master
        .take_writer()
        .map_err(|e| AgentMuxError::ToolUnavailable(format!("failed to take pty writer: {e}")))?;
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| AgentMuxError::ToolUnavailable(format!("failed to clone pty reader: {e}")))?;

    let shutdown = Arc::new(Notify::new());
    let master: Arc<Mutex<Box<dyn MasterPty + Send>>> = Arc::new(Mutex::new(pair.master));

    let (event_tx, event_rx) = mpsc::unbounded_channel::<PtyEvent>();
    let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<u8>>(256);
    let (input_tx, input_rx) = std::sync::mpsc::channel::<Vec<u8>>();

    std::thread::Builder::new()
        .name(format!("pty-reader-{child_pid}"))
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if raw_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("pty {child_pid} reader error: {e}");
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn pty reader thread");

    std::thread::Builder::new()
        .name(format!("pty-writer-{child_pid}"))
        .spawn(move || {
            let mut writer = writer;
            while let Ok(data) = input_rx.recv() {
                let pieces: Vec<&[u8]> = data.chunks(MAX_WRITE_CHUNK).collect();
                for (i, piece) in pieces.iter().enumerate() {
                    if writer.write_all(piece).is_err() {
                        return;
                    }
                    if writer.flush().is_err() {
                        return;
                    }
                    if i + 1 < pieces.len() {
                        std::thread::sleep(WRITE_CHUNK_PAUSE);
                    }
                }
            }
        })
        .expect("failed to spawn pty writer thread");

    let saw_activity = Arc::new(AtomicBool::new(false));
    let saw_activity_decoder = saw_activity.clone();
    let mut child_for_wait = child;
    let event_tx_decoder = event_tx.clone();

    tokio::spawn(async move {
        let mut decoder = Utf8Decoder::new();
        loop {
            match raw_rx.recv().await {
                Some(bytes) => {
                    saw_activity_decoder.store(true, Ordering::Relaxed);
                    let text = decoder.decode(&bytes);
                    if !text.is_empty() && event_tx_decoder.send(PtyEvent::Output(text)).is_err() {
                        break;
                    }
                }
                None => {
                    saw_activity_decoder.store(true, Ordering::Relaxed);
                    let status = tokio::task::spawn_blocking(move || child_for_wait.wait())
                        .await
                        .ok()
                        .and_then(|r| r.ok());
                    let code = status.map(|s| s.exit_code() as i32);
                    let _ = event_tx_decoder.send(PtyEvent::Exit { code, signal: None });
                    break;
                }
            }
        }
    });

    #[cfg(unix)]
    {
        let watchdog_activity = saw_activity.clone();
        let watchdog_shutdown = shutdown.clone();
        let event_tx_watchdog = event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SPAWN_WATCHDOG).await;
            if !watchdog_activity.load(Ordering::Relaxed) {
                log::warn!("pty {child_pid} spawn watchdog expired, killing process group");
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
                watchdog_shutdown.notify_waiters();
                let _ = event_tx_watchdog.send(PtyEvent::Error(AgentMuxError::SpawnHang));
            }
        });
    }

    #[cfg(windows)]
    {
        let watchdog_activity = saw_activity.clone();
        let watchdog_shutdown = shutdown.clone();
        let event_tx_watchdog = event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SPAWN_WATCHDOG).await;
            if !watchdog_activity.load(Ordering::Relaxed) {
                log::warn!("pty {child_pid} spawn watchdog expired, killing process tree");
                let _ = tokio::task::spawn_blocking(move || {
                    std::process::Command::new("taskkill")
                        .args(["/PID", &child_pid.to_string(), "/T", "/F"])
                        .output()
                })
                .await;
                watchdog_shutdown.notify_waiters();
                let _ = event_tx_watchdog.send(PtyEvent::Error(AgentMuxError::SpawnHang));
            }
        });
    }

    let handle = PtyHandle {
        input_tx,
        master,
        child_pid,
        #[cfg(unix)]
        pgid,
        shutdown,
    };

    Ok((handle, event_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_buffers_split_multibyte_sequence() {
        let mut decoder = Utf8Decoder::new();
        let bytes = "héllo".as_bytes().to_vec();
        let (first, second) = bytes.split_at(2); // splits inside the 'é' sequence
        let mut out = decoder.decode(first);
        out.push_str(&decoder.decode(second));
        assert_eq!(out, "héllo");
    }

    #[test]
    fn decoder_passes_through_ascii_unbuffered() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"hello"), "hello");
        assert!(decoder.incomplete.is_empty());
    }
}
