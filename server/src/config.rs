use std::path::PathBuf;

/// Resolved runtime configuration, built once at startup from CLI flags and
/// environment. Passed around as `Arc<Config>`; nothing in this crate reads
/// environment variables or CLI state directly outside of [`crate::cli`].
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub root_dir: PathBuf,
    pub auth_token: Option<String>,
    pub https: Option<HttpsConfig>,
    pub dev: bool,
}

#[derive(Debug, Clone)]
pub struct HttpsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}
