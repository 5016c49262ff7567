//! Per-checkout configuration, read from a file at a known relative path
//! inside the state directory.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use weft_castore::ObjectId;

pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid snapshot id {0:?}")]
    InvalidSnapshotId(String),
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
    Git,
    Hg,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct BindMountConfig {
    /// Path inside the checkout.
    pub client_path: String,
    /// Host path the bind mount points at.
    pub mount_path: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct CheckoutConfig {
    /// The current head snapshot hash, lowercase hex.
    pub snapshot_id: String,
    /// Where the overlay lives. Path-typed: environment interpolation
    /// applies.
    pub overlay_path: String,
    pub repo_type: RepoType,
    /// Path to the repository the checkout was cloned from.
    pub repo_source: String,
    #[serde(default)]
    pub hooks_path: Option<String>,
    #[serde(default)]
    pub bind_mounts: Vec<BindMountConfig>,
    /// Marker file written once the initial clone finished.
    #[serde(default)]
    pub clone_success_path: Option<String>,
}

impl CheckoutConfig {
    /// Loads and interpolates the config from `<state_dir>/config.json`.
    pub fn load(state_dir: &Path) -> Result<Self, ConfigError> {
        let path = state_dir.join(CONFIG_FILE_NAME);
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let mut config: CheckoutConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })?;

        // Only path-typed options are interpolated.
        config.overlay_path = interpolate_env(&config.overlay_path);
        config.repo_source = interpolate_env(&config.repo_source);
        config.hooks_path = config.hooks_path.as_deref().map(interpolate_env);
        config.clone_success_path = config.clone_success_path.as_deref().map(interpolate_env);
        for bind_mount in &mut config.bind_mounts {
            bind_mount.client_path = interpolate_env(&bind_mount.client_path);
            bind_mount.mount_path = interpolate_env(&bind_mount.mount_path);
        }
        Ok(config)
    }

    pub fn snapshot(&self) -> Result<ObjectId, ConfigError> {
        ObjectId::from_hex(&self.snapshot_id)
            .map_err(|_| ConfigError::InvalidSnapshotId(self.snapshot_id.clone()))
    }

    pub fn overlay_path(&self) -> PathBuf {
        PathBuf::from(&self.overlay_path)
    }
}

/// Replaces `${HOME}`, `${USER}` and `${USER_ID}`. Unknown `${…}`
/// sequences are left verbatim.
fn interpolate_env(value: &str) -> String {
    let mut out = value.to_string();
    if let Ok(home) = std::env::var("HOME") {
        out = out.replace("${HOME}", &home);
    }
    if let Ok(user) = std::env::var("USER") {
        out = out.replace("${USER}", &user);
    }
    let uid = unsafe { libc::getuid() };
    out = out.replace("${USER_ID}", &uid.to_string());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, contents: &str) {
        std::fs::write(dir.join(CONFIG_FILE_NAME), contents).unwrap();
    }

    #[test]
    fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"{
                "snapshot-id": "f572d396fae9206628714fb2ce00f72e94f2258f",
                "overlay-path": "/var/lib/weft/overlay",
                "repo-type": "hg",
                "repo-source": "/data/repos/big",
                "hooks-path": "/etc/weft/hooks",
                "bind-mounts": [
                    {"client-path": "buck-out", "mount-path": "/tmp/buck-out"}
                ],
                "clone-success-path": "/var/lib/weft/clone-ok"
            }"#,
        );

        let config = CheckoutConfig::load(dir.path()).unwrap();
        assert_eq!(RepoType::Hg, config.repo_type);
        assert_eq!(
            ObjectId::sha1_of(b"hello\n"),
            config.snapshot().unwrap()
        );
        assert_eq!(1, config.bind_mounts.len());
        assert_eq!("buck-out", config.bind_mounts[0].client_path);
    }

    #[test]
    fn interpolates_env_in_path_options() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("HOME", "/home/testuser");
        write_config(
            dir.path(),
            r#"{
                "snapshot-id": "f572d396fae9206628714fb2ce00f72e94f2258f",
                "overlay-path": "${HOME}/.weft/overlay",
                "repo-type": "git",
                "repo-source": "${HOME}/repo"
            }"#,
        );

        let config = CheckoutConfig::load(dir.path()).unwrap();
        assert_eq!("/home/testuser/.weft/overlay", config.overlay_path);
        assert_eq!("/home/testuser/repo", config.repo_source);
    }

    #[test]
    fn unknown_placeholders_stay_verbatim() {
        assert_eq!("${SOMETHING}/x", interpolate_env("${SOMETHING}/x"));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CheckoutConfig::load(dir.path()),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"{
                "snapshot-id": "f572d396fae9206628714fb2ce00f72e94f2258f",
                "overlay-path": "/o",
                "repo-type": "git",
                "repo-source": "/r",
                "surprise": true
            }"#,
        );
        assert!(matches!(
            CheckoutConfig::load(dir.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
