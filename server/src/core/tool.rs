use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The interactive CLI programs the multiplexer knows how to launch, plus a
/// plain login shell for when no AI agent is wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Claude,
    Codex,
    Copilot,
    Gemini,
    Terminal,
}

impl ToolKind {
    pub fn all() -> [ToolKind; 5] {
        [
            Self::Claude,
            Self::Codex,
            Self::Copilot,
            Self::Gemini,
            Self::Terminal,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Copilot => "copilot",
            Self::Gemini => "gemini",
            Self::Terminal => "terminal",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "copilot" => Some(Self::Copilot),
            "gemini" => Some(Self::Gemini),
            "terminal" => Some(Self::Terminal),
            _ => None,
        }
    }

    /// Candidate binary names searched on PATH, in order. Empty for
    /// `Terminal`, which resolves to the user's login shell instead.
    pub fn binary_names(self) -> &'static [&'static str] {
        match self {
            Self::Claude => &["claude"],
            Self::Codex => &["codex"],
            Self::Copilot => &["copilot", "github-copilot-cli"],
            Self::Gemini => &["gemini"],
            Self::Terminal => &[],
        }
    }

    /// Extra argv entries for a spawn, derived from the requested options.
    pub fn build_args(self, opts: &SpawnOptions) -> Vec<String> {
        let mut args = Vec::new();
        if opts.dangerously_skip_permissions {
            match self {
                Self::Claude => args.push("--dangerously-skip-permissions".to_string()),
                Self::Codex => args.push("--yolo".to_string()),
                Self::Copilot => args.push("--allow-all-tools".to_string()),
                Self::Gemini => args.push("--yolo".to_string()),
                Self::Terminal => {}
            }
        }
        args
    }

    /// Looks at a rolling tail of raw PTY output for a tool-specific
    /// first-run trust prompt. Returns the bytes to write back through the
    /// ordinary input path if one is recognized; the caller decides whether
    /// to act on it automatically.
    pub fn trust_prompt(self, tail: &str) -> Option<&'static str> {
        match self {
            Self::Claude if tail.contains("Do you trust the files in this folder?") => {
                Some("1\r")
            }
            Self::Codex if tail.contains("trust this directory") => Some("y\r"),
            Self::Gemini if tail.contains("Do you trust this folder") => Some("1\r"),
            _ => None,
        }
    }
}

/// Per-spawn parameters that are independent of which tool is being
/// started.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub working_dir: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub dangerously_skip_permissions: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for tool in ToolKind::all() {
            assert_eq!(ToolKind::from_str_opt(tool.as_str()), Some(tool));
        }
    }

    #[test]
    fn terminal_has_no_skip_permissions_flag() {
        let opts = SpawnOptions {
            working_dir: PathBuf::from("/tmp"),
            cols: 80,
            rows: 24,
            dangerously_skip_permissions: true,
        };
        assert!(ToolKind::Terminal.build_args(&opts).is_empty());
        assert!(!ToolKind::Claude.build_args(&opts).is_empty());
    }
}
