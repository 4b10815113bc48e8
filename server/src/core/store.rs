use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::registry::{Priority, SessionId};
use super::tool::ToolKind;

/// Durable shape of a session. Only the fields that survive a restart are
/// here — connections, the PTY handle, and scheduler state are transient
/// and rebuilt (or simply absent) when the process comes back up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub name: String,
    pub working_dir: PathBuf,
    pub created: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// The tool that was last running in this session, kept only so a
    /// client can offer "restart claude here" — never implies an active
    /// PTY on load.
    pub agent: Option<ToolKind>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub output_tail: Vec<String>,
}

/// Loads and atomically persists the session table to a JSON file under the
/// platform config directory.
pub struct SessionStore {
    path: PathBuf,
    dirty: AtomicBool,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            dirty: AtomicBool::new(false),
        }
    }

    /// `$XDG_CONFIG_HOME`-style directory via `directories`, falling back to
    /// `$HOME/.agentmux` for headless environments where `ProjectDirs`
    /// cannot determine a home directory at all.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("dev", "agentmux", "agentmux")
            .map(|dirs| dirs.config_dir().join("sessions.json"))
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").expect("HOME must be set in a headless environment");
                PathBuf::from(home).join(".agentmux").join("sessions.json")
            })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn load(&self) -> HashMap<SessionId, SessionRecord> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str::<Vec<SessionRecord>>(&contents) {
                Ok(records) => records.into_iter().map(|r| (r.id, r)).collect(),
                Err(e) => {
                    log::warn!("sessions file at {} is corrupt, starting empty: {e}", self.path.display());
                    HashMap::new()
                }
            },
            Err(e) => {
                log::info!("no existing sessions file ({e}), starting empty");
                HashMap::new()
            }
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Writes via a temp file + rename so a crash mid-write never leaves a
    /// truncated `sessions.json` behind. No-op if nothing is dirty.
    pub fn save(&self, records: &[SessionRecord]) -> std::io::Result<()> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        self.write_now(records)
    }

    fn write_now(&self, records: &[SessionRecord]) -> std::io::Result<()> {
        Self::write_to(&self.path, records)
    }

    fn write_to(path: &std::path::Path, records: &[SessionRecord]) -> std::io::Result<()> {
        let json = Self::serialize_for_save(records)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn serialize_for_save(records: &[SessionRecord]) -> std::io::Result<String> {
        serde_json::to_string_pretty(records).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    /// Best-effort synchronous write for the panic hook — ignores the dirty
    /// flag and any I/O error since there's nothing left to do about either
    /// by the time this runs.
    pub fn save_crash_copy(&self, records: &[SessionRecord]) {
        let mut crash_path = self.path.clone().into_os_string();
        crash_path.push(".crash");
        if let Err(e) = Self::write_to(std::path::Path::new(&crash_path), records) {
            log::error!("crash-path session save failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_is_a_noop_until_marked_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json"));
        store.save(&[]).unwrap();
        assert!(!dir.path().join("sessions.json").exists());

        store.mark_dirty();
        store.save(&[]).unwrap();
        assert!(dir.path().join("sessions.json").exists());
    }

    #[test]
    fn round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json"));
        let record = SessionRecord {
            id: SessionId::new_v4(),
            name: "alpha".into(),
            working_dir: PathBuf::from("/tmp"),
            created: Utc::now(),
            last_activity: Utc::now(),
            agent: Some(ToolKind::Claude),
            priority: Priority::Foreground,
            output_tail: vec!["hello".into()],
        };
        store.mark_dirty();
        store.save(&[record.clone()]).unwrap();

        let loaded = store.load();
        let got = loaded.get(&record.id).unwrap();
        assert_eq!(got.name, "alpha");
        assert_eq!(got.output_tail, vec!["hello".to_string()]);
    }
}
