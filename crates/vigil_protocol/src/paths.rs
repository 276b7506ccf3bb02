use std::path::PathBuf;

/// Resolve the Vigil home directory.
///
/// Priority:
/// 1) VIGIL_HOME
/// 2) ~/.vigil
/// 3) ./.vigil
pub fn vigil_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("VIGIL_HOME") {
        return PathBuf::from(override_path);
    }
    match dirs::home_dir() {
        Some(home) => home.join(".vigil"),
        None => PathBuf::from(".").join(".vigil"),
    }
}

/// Durable store file inside a state directory.
pub fn store_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("vigil.sqlite3")
}

/// Rotated log files inside a state directory.
pub fn logs_dir(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("logs")
}

/// Latest watchdog snapshot inside a state directory.
pub fn health_file(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("health.json")
}

/// Scratch space for knowledge-base downloads. Must live on the same
/// filesystem as the model directory for the final rename to be atomic.
pub fn kb_staging_dir(model_dir: &std::path::Path) -> PathBuf {
    model_dir.join(".staging")
}
