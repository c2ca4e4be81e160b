use crate::client::HttpTransport;
use crate::session::SessionConfig;
use std::path::PathBuf;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Resolved settings for one client run.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub session: SessionConfig,
}

impl ClientConfig {
    pub fn transport(&self) -> HttpTransport {
        HttpTransport::new(&self.base_url, self.token.clone())
    }
}

/// An explicit token wins; otherwise the token file is consulted.
pub fn resolve_token(explicit: Option<String>) -> Option<String> {
    if let Some(token) = explicit.filter(|token| !token.trim().is_empty()) {
        return Some(token.trim().to_string());
    }
    match read_token_file() {
        Ok(token) if !token.is_empty() => Some(token),
        Ok(_) => None,
        Err(err) => {
            debug!(path = %token_path().display(), "no token file: {err}");
            None
        }
    }
}

fn read_token_file() -> std::io::Result<String> {
    let token = std::fs::read_to_string(token_path())?;
    Ok(token.trim().to_string())
}

pub fn token_path() -> PathBuf {
    config_dir().join("token")
}

pub fn default_log_path() -> PathBuf {
    config_dir().join("askql.log")
}

fn config_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        return PathBuf::from(home).join(".askql");
    }

    PathBuf::from(".askql")
}
