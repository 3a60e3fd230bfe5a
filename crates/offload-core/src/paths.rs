//! Worker binary discovery.

use std::path::PathBuf;

/// Environment variable overriding the worker binary location.
pub const WORKER_PATH_ENV: &str = "OFFLOAD_WORKER_PATH";

/// File name of the generic worker binary.
pub const WORKER_BINARY: &str = if cfg!(windows) {
    "offload-worker.exe"
} else {
    "offload-worker"
};

/// Find the offload-worker binary.
///
/// Looks in the following order:
/// 1. `OFFLOAD_WORKER_PATH` environment variable
/// 2. Same directory as the current executable
/// 3. System PATH
/// 4. `target/debug` or `target/release` of the workspace (development)
pub fn find_worker_binary() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        // Test binaries live one level down, in target/<profile>/deps.
        for dir in [Some(exe_dir), exe_dir.parent()].into_iter().flatten() {
            let candidate = dir.join(WORKER_BINARY);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_BINARY) {
        return Some(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(WORKER_BINARY);
            if path.exists() {
                return Some(path.canonicalize().unwrap_or(path));
            }
        }
    }

    None
}

/// The worker binary to spawn when none is configured.
///
/// Falls back to the bare binary name, so a missing worker surfaces as a
/// spawn error naming it.
pub fn default_worker_binary() -> PathBuf {
    find_worker_binary().unwrap_or_else(|| {
        tracing::debug!("{} not found, relying on PATH lookup at spawn", WORKER_BINARY);
        PathBuf::from(WORKER_BINARY)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_never_empty() {
        let path = default_worker_binary();
        assert!(path.ends_with(WORKER_BINARY));
    }
}
