use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::tool::ToolKind;

const CACHE_TTL: Duration = Duration::from_secs(60);

struct CacheEntry {
    resolved: Option<PathBuf>,
    at: Instant,
}

/// Caches which binary on PATH backs each [`ToolKind`] so `/api/tools` and
/// session creation don't re-walk PATH on every call. Entries expire after
/// [`CACHE_TTL`] so a tool installed mid-session becomes visible without a
/// restart.
pub struct ToolResolver {
    cache: Mutex<HashMap<ToolKind, CacheEntry>>,
}

impl Default for ToolResolver {
    fn default() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl ToolResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, tool: ToolKind) -> Option<PathBuf> {
        if tool == ToolKind::Terminal {
            return std::env::var_os("SHELL")
                .map(PathBuf::from)
                .or_else(|| Some(PathBuf::from("/bin/sh")));
        }

        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&tool) {
                if entry.at.elapsed() < CACHE_TTL {
                    return entry.resolved.clone();
                }
            }
        }

        let resolved = Self::search(tool);
        self.cache.lock().unwrap().insert(
            tool,
            CacheEntry {
                resolved: resolved.clone(),
                at: Instant::now(),
            },
        );
        resolved
    }

    /// Forces the next `resolve` call for `tool` to re-walk PATH instead of
    /// answering from cache, used by the manual recheck endpoint.
    pub fn invalidate(&self, tool: ToolKind) {
        self.cache.lock().unwrap().remove(&tool);
    }

    pub fn is_available(&self, tool: ToolKind) -> bool {
        self.resolve(tool).is_some()
    }

    fn search(tool: ToolKind) -> Option<PathBuf> {
        let path_var = std::env::var_os("PATH")?;
        for dir in std::env::split_paths(&path_var) {
            for name in tool.binary_names() {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }
}
