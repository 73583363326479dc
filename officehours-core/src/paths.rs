// ABOUTME: Standardized paths for config and data storage
// ABOUTME: Uses ~/.config/officehours for config and ~/.local/share/officehours for data

use directories::BaseDirs;
use std::path::PathBuf;

fn home_dir() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// ~/.config/officehours/
pub fn config_dir() -> PathBuf {
    home_dir().join(".config").join("officehours")
}

/// ~/.config/officehours/config.toml
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// ~/.local/share/officehours/, or ./data without a home directory
pub fn data_dir() -> PathBuf {
    let home = home_dir();
    if home == PathBuf::from(".") {
        PathBuf::from("./data")
    } else {
        home.join(".local").join("share").join("officehours")
    }
}

/// Default SQLite database location
pub fn database_file() -> PathBuf {
    data_dir().join("officehours.db")
}
