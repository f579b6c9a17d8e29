//! Configuration Directory Resolution
//!
//! Server key material and the client trust store both live under one
//! configuration directory:
//!
//! ```text
//! <config>/
//!   cert.pem         server certificate
//!   key.pem          server private key (0600)
//!   trusted/         one pinned certificate per server identity
//! ```

use std::path::{Path, PathBuf};

/// Directory name used under the platform config root
pub const APP_DIR_NAME: &str = "pinshare";

/// Resolved filesystem locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub trust_dir: PathBuf,
}

impl Paths {
    /// Resolve paths, preferring an explicit directory when given
    pub fn resolve(explicit: Option<PathBuf>) -> Self {
        let config_dir = explicit.unwrap_or_else(default_config_dir);
        Self::from_dir(config_dir)
    }

    /// Derive every path from a configuration directory
    pub fn from_dir(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        Self {
            cert_path: config_dir.join("cert.pem"),
            key_path: config_dir.join("key.pem"),
            trust_dir: config_dir.join("trusted"),
            config_dir,
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

/// `$XDG_CONFIG_HOME/pinshare`, then `~/.config/pinshare`, then `./.pinshare`
pub fn default_config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join(APP_DIR_NAME);
    }
    match dirs::home_dir() {
        Some(home) => home.join(".config").join(APP_DIR_NAME),
        None => PathBuf::from(format!(".{}", APP_DIR_NAME)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_from_dir() {
        let paths = Paths::from_dir("/tmp/pinshare-test");
        assert_eq!(paths.cert_path, PathBuf::from("/tmp/pinshare-test/cert.pem"));
        assert_eq!(paths.key_path, PathBuf::from("/tmp/pinshare-test/key.pem"));
        assert_eq!(paths.trust_dir, PathBuf::from("/tmp/pinshare-test/trusted"));
        assert_eq!(paths.config_dir(), Path::new("/tmp/pinshare-test"));
    }

    #[test]
    fn test_explicit_dir_wins() {
        let paths = Paths::resolve(Some(PathBuf::from("custom")));
        assert_eq!(paths.config_dir, PathBuf::from("custom"));
    }

    #[test]
    fn test_default_dir_ends_with_app_name() {
        let dir = default_config_dir();
        let name = dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(name == APP_DIR_NAME || name == ".pinshare");
    }
}
