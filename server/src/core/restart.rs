use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sysinfo::{Pid, System};

use super::registry::Registry;

const PROBE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const GC_HINT_THRESHOLD_BYTES: u64 = 1024 * 1024 * 1024;
const WARN_THRESHOLD_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const WARN_COOLDOWN: Duration = Duration::from_secs(30 * 60);
const RESTART_COOLDOWN: Duration = Duration::from_secs(5 * 60);
const RESTART_NOTICE_DELAY: Duration = Duration::from_millis(500);

/// Periodically samples this process's own resident memory and, past a
/// threshold, asks the registry to broadcast a warning and eventually
/// requests a supervised restart. There is no portable way to force a GC in
/// a native binary, so the "GC hint" threshold only logs and yields to let
/// any pending I/O drain; see DESIGN.md for why that's the right substitute
/// here.
pub struct RestartManager {
    registry: Arc<Registry>,
    last_warn: Mutex<Option<Instant>>,
    last_restart: Mutex<Option<Instant>>,
}

impl RestartManager {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            last_warn: Mutex::new(None),
            last_restart: Mutex::new(None),
        })
    }

    pub fn spawn_probe_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROBE_INTERVAL);
            loop {
                ticker.tick().await;
                this.probe_once().await;
            }
        });
    }

    async fn probe_once(&self) {
        let resident = tokio::task::spawn_blocking(Self::sample_resident_bytes).await.unwrap_or(None);
        let Some(resident) = resident else { return };

        if resident > WARN_THRESHOLD_BYTES {
            let should_warn = {
                let mut last = self.last_warn.lock().unwrap();
                let ready = last.map(|t| t.elapsed() > WARN_COOLDOWN).unwrap_or(true);
                if ready {
                    *last = Some(Instant::now());
                }
                ready
            };
            if should_warn {
                self.registry.broadcast_memory_warning(resident).await;
            }
        }

        if resident > GC_HINT_THRESHOLD_BYTES {
            log::info!("resident memory {resident} bytes past the GC-hint threshold; yielding");
            tokio::task::yield_now().await;
        }
    }

    fn sample_resident_bytes() -> Option<u64> {
        let mut sys = System::new();
        let pid = Pid::from_u32(std::process::id());
        sys.refresh_process(pid);
        sys.process(pid).map(|p| p.memory())
    }

    /// Broadcasts `server_restarting`, waits briefly so it has a chance to
    /// reach clients, persists session state, then exits with the
    /// supervisor's distinguished restart code. Rate-limited so a flapping
    /// trigger can't spin the process.
    pub async fn initiate_restart(&self, reason: &str) -> bool {
        {
            let mut last = self.last_restart.lock().unwrap();
            let allowed = last.map(|t| t.elapsed() > RESTART_COOLDOWN).unwrap_or(true);
            if !allowed {
                return false;
            }
            *last = Some(Instant::now());
        }

        log::warn!("initiating restart: {reason}");
        self.registry.broadcast_server_restarting(reason).await;
        tokio::time::sleep(RESTART_NOTICE_DELAY).await;
        self.registry.persist();
        std::process::exit(agentmux_proto::RESTART_EXIT_CODE);
    }

    /// Graceful shutdown requested by the supervisor (not a restart): exit
    /// 0 after giving clients and persistence a chance to settle.
    pub async fn shutdown_gracefully(&self) -> ! {
        self.registry.broadcast_server_restarting("server is shutting down").await;
        tokio::time::sleep(RESTART_NOTICE_DELAY).await;
        self.registry.persist();
        std::process::exit(0);
    }
}
