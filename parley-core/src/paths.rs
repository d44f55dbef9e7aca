// ABOUTME: XDG Base Directory paths for configuration and the watermark database
// ABOUTME: Falls back to local directories when no home directory can be resolved

use directories::ProjectDirs;
use std::path::PathBuf;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "parley";
const APPLICATION: &str = "parley";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// Data directory (e.g., ~/.local/share/parley/), or ./data
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Config directory (e.g., ~/.config/parley/), or the current directory
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// e.g., ~/.config/parley/config.toml
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
