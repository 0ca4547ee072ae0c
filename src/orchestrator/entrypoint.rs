//! Locating the worker binary.

use std::path::{Path, PathBuf};

use crate::error::OrchestratorError;

pub const WORKER_BIN: &str = "foreman-worker";

fn bin_name() -> String {
    format!("{WORKER_BIN}{}", std::env::consts::EXE_SUFFIX)
}

/// Places the worker binary is expected, in search order: next to the
/// running executable, one directory up (test binaries run from
/// `target/<profile>/deps`), then the cargo build outputs under `cwd`.
pub fn candidate_paths(exe_dir: Option<&Path>, cwd: &Path) -> Vec<PathBuf> {
    let name = bin_name();
    let mut paths = Vec::new();
    if let Some(dir) = exe_dir {
        paths.push(dir.join(&name));
        if let Some(parent) = dir.parent() {
            paths.push(parent.join(&name));
        }
    }
    paths.push(cwd.join("target").join("release").join(&name));
    paths.push(cwd.join("target").join("debug").join(&name));
    paths
}

/// Resolve the worker entrypoint. An explicit path must exist; otherwise
/// the candidates are searched, then `PATH`.
pub fn resolve(explicit: Option<&Path>) -> Result<PathBuf, OrchestratorError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(OrchestratorError::EntrypointNotFound {
            searched: vec![path.to_path_buf()],
        });
    }

    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let candidates = candidate_paths(exe_dir.as_deref(), &cwd);

    if let Some(found) = candidates.iter().find(|p| p.is_file()) {
        tracing::debug!(path = %found.display(), "Resolved worker entrypoint");
        return Ok(found.clone());
    }
    if let Ok(found) = which::which(WORKER_BIN) {
        return Ok(found);
    }
    Err(OrchestratorError::EntrypointNotFound {
        searched: candidates,
    })
}
