use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;

use agentmux_proto::{SupervisorMessage, CRASH_THRESHOLD, CRASH_WINDOW, RESTART_BACKOFF, RESTART_EXIT_CODE};

/// Parent process that respawns `agentmux-server` and trips a circuit
/// breaker if it keeps crashing, instead of respawning forever and
/// hammering whatever is making it crash.
#[derive(Debug, Parser)]
#[command(name = "agentmux-supervisor", version, about)]
struct Cli {
    /// Path to the agentmux-server binary to supervise.
    #[arg(long, default_value = "agentmux-server")]
    server_bin: PathBuf,

    /// Arguments forwarded verbatim to the server on every spawn.
    #[arg(trailing_var_arg = true)]
    server_args: Vec<String>,
}

const CRASH_BACKOFF: Duration = Duration::from_secs(3);
const HARD_KILL_TIMEOUT: Duration = Duration::from_secs(10);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut crash_times: VecDeque<Instant> = VecDeque::new();

    install_shutdown_signal_forwarder();

    loop {
        log::info!("starting {}", cli.server_bin.display());
        let mut child = match spawn_server(&cli.server_bin, &cli.server_args) {
            Ok(child) => child,
            Err(e) => {
                log::error!("failed to spawn server: {e}");
                std::process::exit(1);
            }
        };

        let status = wait_for_exit_or_shutdown(&mut child);
        let code = status.code();

        match code {
            Some(RESTART_EXIT_CODE) => {
                log::info!("server asked to restart, respawning after backoff");
                std::thread::sleep(RESTART_BACKOFF);
                continue;
            }
            Some(0) => {
                log::info!("server exited cleanly, supervisor exiting");
                return;
            }
            other => {
                log::warn!("server exited with {:?}, treating as a crash", other);
                let now = Instant::now();
                crash_times.push_back(now);
                while let Some(front) = crash_times.front() {
                    if now.duration_since(*front) > CRASH_WINDOW {
                        crash_times.pop_front();
                    } else {
                        break;
                    }
                }
                if crash_times.len() >= CRASH_THRESHOLD {
                    log::error!(
                        "server crashed {} times within {:?}, circuit breaker tripped: giving up",
                        crash_times.len(),
                        CRASH_WINDOW
                    );
                    std::process::exit(1);
                }
                std::thread::sleep(CRASH_BACKOFF);
            }
        }
    }
}

fn spawn_server(bin: &PathBuf, args: &[String]) -> std::io::Result<Child> {
    Command::new(bin)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
}

/// Waits for the child to exit on its own, or for a SIGTERM/SIGINT
/// delivered to the supervisor to trigger a graceful shutdown request
/// relayed over the child's stdin instead.
fn wait_for_exit_or_shutdown(child: &mut Child) -> ExitStatus {
    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return status;
        }
        if SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst) {
            request_shutdown(child, SupervisorMessage::Shutdown);
            return child.wait().expect("failed to wait on server child after shutdown request");
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn request_shutdown(child: &mut Child, message: SupervisorMessage) {
    if let Some(stdin) = child.stdin.as_mut() {
        if let Ok(line) = serde_json::to_string(&message) {
            let _ = writeln!(stdin, "{line}");
        }
    }

    let deadline = Instant::now() + HARD_KILL_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {
                if Instant::now() >= deadline {
                    log::warn!("server did not exit within {:?} of a graceful shutdown request, killing", HARD_KILL_TIMEOUT);
                    let _ = child.kill();
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                log::error!("error waiting on server child: {e}");
                return;
            }
        }
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn handle_shutdown_signal(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_shutdown_signal_forwarder() {
    unsafe {
        libc::signal(libc::SIGTERM, handle_shutdown_signal as usize);
        libc::signal(libc::SIGINT, handle_shutdown_signal as usize);
    }
}

#[cfg(not(unix))]
fn install_shutdown_signal_forwarder() {}
