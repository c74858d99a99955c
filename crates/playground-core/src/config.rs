use std::{path::PathBuf, time::Duration};

pub const ENV_HOME: &str = "PLAYGROUND_HOME";
pub const ENV_BIN_DIR: &str = "PLAYGROUND_BIN_DIR";
pub const ENV_STOP_GRACE_MS: &str = "PLAYGROUND_STOP_GRACE_MS";
pub const ENV_DAEMON_BIN: &str = "PLAYGROUND_DAEMON_BIN";

const DEFAULT_STOP_GRACE_MS: u64 = 10_000;

pub fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Parent directory holding one data dir per tag.
pub fn base_data_dir() -> PathBuf {
    if let Some(home) = env_path(ENV_HOME) {
        return home.join("data");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".playground")
        .join("data")
}

pub fn component_bin_dir() -> PathBuf {
    env_path(ENV_BIN_DIR).unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".playground")
            .join("bin")
    })
}

/// SIGTERM to SIGKILL escalation window for supervised services.
pub fn stop_grace() -> Duration {
    Duration::from_millis(
        env_u64(ENV_STOP_GRACE_MS)
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(DEFAULT_STOP_GRACE_MS),
    )
}

/// Renders an error and its causes on one line.
///
/// Causes already contained in the previous segment are skipped so that a
/// message wrapped by several layers is printed once.
pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last().is_some_and(|last| last.ends_with(&s)) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
