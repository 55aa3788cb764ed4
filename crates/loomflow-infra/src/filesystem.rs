//! Data directory layout for Loomflow.
//!
//! Everything the engine persists lives under one data directory:
//! `config.toml`, the `pipelines/` definitions and the `loomflow.db` database.

use std::path::{Path, PathBuf};

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `LOOMFLOW_DATA_DIR` environment variable
/// 2. `~/.loomflow`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LOOMFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".loomflow");
    }

    PathBuf::from(".loomflow")
}

/// `{data_dir}/loomflow.db`.
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("loomflow.db")
}

/// `{data_dir}/pipelines/`, scanned for `*.yaml` definitions.
pub fn pipelines_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("pipelines")
}

/// `{data_dir}/config.toml`.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Create the data directory and its `pipelines/` subdirectory if missing.
pub async fn ensure_layout(data_dir: &Path) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(pipelines_dir(data_dir)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let data_dir = PathBuf::from("/srv/loomflow");
        assert_eq!(db_path(&data_dir), PathBuf::from("/srv/loomflow/loomflow.db"));
        assert_eq!(
            pipelines_dir(&data_dir),
            PathBuf::from("/srv/loomflow/pipelines")
        );
        assert_eq!(
            config_path(&data_dir),
            PathBuf::from("/srv/loomflow/config.toml")
        );
    }

    #[tokio::test]
    async fn test_ensure_layout_creates_pipelines_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested").join("data");

        ensure_layout(&data_dir).await.unwrap();
        assert!(pipelines_dir(&data_dir).is_dir());

        // Idempotent.
        ensure_layout(&data_dir).await.unwrap();
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: No other test in this crate reads or writes LOOMFLOW_DATA_DIR.
        unsafe {
            std::env::set_var("LOOMFLOW_DATA_DIR", "/tmp/test-loomflow");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-loomflow"));
        unsafe {
            std::env::remove_var("LOOMFLOW_DATA_DIR");
        }
    }
}
