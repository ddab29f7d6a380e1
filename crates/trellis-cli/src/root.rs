use std::path::{Path, PathBuf};

/// Resolve the project root directory.
///
/// Priority:
/// 1. `--root` flag / `TRELLIS_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.trellis/`
/// 3. Walk upward from `cwd` looking for `.git/`
/// 4. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    walk_up(&cwd, trellis_core::paths::TRELLIS_DIR)
        .or_else(|| walk_up(&cwd, ".git"))
        .unwrap_or(cwd)
}

/// First directory from `start` upward that contains `marker`.
fn walk_up(start: &Path, marker: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(marker).exists())
        .map(Path::to_path_buf)
}
