use std::path::PathBuf;

use clap::Parser;

use crate::config::{Config, HttpsConfig};

/// Browser-accessible multiplexer for interactive CLI coding agents.
#[derive(Debug, Parser)]
#[command(name = "agentmux-server", version, about)]
pub struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 8420)]
    pub port: u16,

    /// Directory sessions are confined to; defaults to the current
    /// directory.
    #[arg(long = "root")]
    pub root_dir: Option<PathBuf>,

    /// Bearer token required on the WebSocket upgrade and REST API. If
    /// omitted and `--disable-auth` isn't set, a random token is generated
    /// and printed once at startup.
    #[arg(long)]
    pub auth: Option<String>,

    /// Serve without any authentication token. Only meant for trusted
    /// local development.
    #[arg(long)]
    pub disable_auth: bool,

    /// Serve HTTPS using `--cert`/`--key` instead of plain HTTP.
    #[arg(long)]
    pub https: bool,

    #[arg(long)]
    pub cert: Option<PathBuf>,

    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Verbose logging and relaxed timeouts for local development.
    #[arg(long)]
    pub dev: bool,

    /// Expose the server through a tunnel provider. Not implemented; kept
    /// as a recognized flag so scripts that pass it don't fail to parse.
    #[arg(long)]
    pub tunnel: bool,

    #[arg(long)]
    pub tunnel_allow_anonymous: bool,
}

impl Cli {
    pub fn into_config(self) -> Result<Config, String> {
        if self.https && (self.cert.is_none() || self.key.is_none()) {
            return Err("--https requires both --cert and --key".to_string());
        }
        if self.tunnel {
            log::warn!("--tunnel was requested but tunneling is not implemented in this build");
        }

        let root_dir = match self.root_dir {
            Some(p) => p,
            None => std::env::current_dir().map_err(|e| e.to_string())?,
        };
        let root_dir = std::fs::canonicalize(&root_dir).map_err(|e| format!("invalid --root '{}': {e}", root_dir.display()))?;

        let auth_token = if self.disable_auth {
            None
        } else if let Some(token) = self.auth {
            Some(token)
        } else {
            let generated = generate_token();
            eprintln!("no --auth token provided; generated one for this run: {generated}");
            Some(generated)
        };

        let https = if self.https {
            Some(HttpsConfig {
                cert_path: self.cert.unwrap(),
                key_path: self.key.unwrap(),
            })
        } else {
            None
        };

        Ok(Config {
            port: self.port,
            root_dir,
            auth_token,
            https,
            dev: self.dev,
        })
    }
}

/// Two concatenated v4 UUIDs, for 256 bits drawn from the OS RNG. `uuid`'s
/// `v4` feature is already on the dependency tree for session IDs, so this
/// avoids pulling in a dedicated CSPRNG crate just for a once-per-run token.
fn generate_token() -> String {
    format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple())
}
