//! Catalog entries describing how to launch a plugin.

use std::collections::BTreeMap;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use lockbox_logical::PluginType;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use snafu::ResultExt;

use crate::error::BinaryNotFoundSnafu;
use crate::error::PluginError;

/// A registered plugin executable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRunner {
    pub name: String,
    pub plugin_type: PluginType,
    /// Semantic version; empty for unversioned plugins.
    #[serde(default)]
    pub version: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra `KEY=VALUE` environment for the child.
    #[serde(default)]
    pub env: Vec<String>,
    /// Hex sha256 of the executable. Empty skips verification.
    #[serde(default)]
    pub sha256: String,
}

/// Identity of a plugin process. Runners with equal keys may share a
/// multiplexed process; anything that changes how the process is launched
/// is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunnerKey {
    pub name: String,
    pub plugin_type: PluginType,
    pub version: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub sha256: String,
    pub metadata_mode: bool,
}

impl PluginRunner {
    pub fn new(name: impl Into<String>, plugin_type: PluginType, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugin_type,
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env<I, S>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env = env.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = sha256.into();
        self
    }

    pub fn key(&self, metadata_mode: bool) -> RunnerKey {
        RunnerKey {
            name: self.name.clone(),
            plugin_type: self.plugin_type,
            version: self.version.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            sha256: self.sha256.to_ascii_lowercase(),
            metadata_mode,
        }
    }

    /// `env` split into pairs. Entries without `=` are skipped.
    pub fn env_pairs(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
            .collect()
    }

    /// Absolute path of the executable.
    ///
    /// Relative commands resolve inside `plugin_dir` and may not leave it.
    /// Absolute commands must lie inside `plugin_dir` when one is configured.
    pub fn resolve_command(&self, plugin_dir: Option<&Path>) -> Result<PathBuf, PluginError> {
        let command = Path::new(&self.command);
        let outside = || PluginError::CommandOutsideDirectory {
            command: self.command.clone(),
        };

        if command.is_absolute() {
            if command.components().any(|c| c == Component::ParentDir) {
                return Err(outside());
            }
            return match plugin_dir {
                Some(dir) if !command.starts_with(dir) => Err(outside()),
                _ => Ok(command.to_path_buf()),
            };
        }

        let Some(dir) = plugin_dir else {
            return Err(PluginError::NoPluginDirectory {
                command: self.command.clone(),
            });
        };
        if !command.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
            return Err(outside());
        }
        Ok(dir.join(command))
    }

    /// Compare the executable at `path` against the registered digest.
    pub async fn verify_checksum(&self, path: &Path) -> Result<(), PluginError> {
        if self.sha256.is_empty() {
            return Ok(());
        }
        let actual = file_sha256(path).await?;
        if !actual.eq_ignore_ascii_case(&self.sha256) {
            return Err(PluginError::ChecksumMismatch {
                name: self.name.clone(),
                expected: self.sha256.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Hex sha256 of the file at `path`.
pub async fn file_sha256(path: &Path) -> Result<String, PluginError> {
    let bytes = tokio::fs::read(path).await.context(BinaryNotFoundSnafu { path })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_command_resolves_in_directory() {
        let runner = PluginRunner::new("kv", PluginType::Secrets, "kv-plugin");
        let path = runner.resolve_command(Some(Path::new("/plugins"))).unwrap();
        assert_eq!(path, PathBuf::from("/plugins/kv-plugin"));
    }

    #[test]
    fn test_escaping_commands_rejected() {
        for command in ["../kv", "sub/../../kv", "/plugins/../bin/sh", "/usr/bin/kv"] {
            let runner = PluginRunner::new("kv", PluginType::Secrets, command);
            let err = runner.resolve_command(Some(Path::new("/plugins"))).unwrap_err();
            assert!(matches!(err, PluginError::CommandOutsideDirectory { .. }), "{command}");
        }
    }

    #[test]
    fn test_relative_command_needs_directory() {
        let runner = PluginRunner::new("kv", PluginType::Secrets, "kv");
        assert!(matches!(runner.resolve_command(None), Err(PluginError::NoPluginDirectory { .. })));
        let absolute = PluginRunner::new("kv", PluginType::Secrets, "/opt/kv");
        assert_eq!(absolute.resolve_command(None).unwrap(), PathBuf::from("/opt/kv"));
    }

    #[test]
    fn test_key_separates_launch_settings() {
        let base = PluginRunner::new("kv", PluginType::Secrets, "kv");
        assert_eq!(base.key(false), base.clone().key(false));
        assert_ne!(base.key(false), base.key(true));
        assert_ne!(base.key(false), base.clone().with_version("v1.0.0").key(false));
        assert_ne!(base.key(false), base.clone().with_args(["-x"]).key(false));
        assert_ne!(base.key(false), base.clone().with_env(["A=1"]).key(false));
        let mut other_type = base.clone();
        other_type.plugin_type = PluginType::Credential;
        assert_ne!(base.key(false), other_type.key(false));
    }

    #[test]
    fn test_env_pairs() {
        let runner = PluginRunner::new("kv", PluginType::Secrets, "kv").with_env(["A=1", "B=x=y", "junk"]);
        let pairs = runner.env_pairs();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs["B"], "x=y");
    }

    #[tokio::test]
    async fn test_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin");
        tokio::fs::write(&path, b"binary").await.unwrap();
        let digest = file_sha256(&path).await.unwrap();

        let runner = PluginRunner::new("kv", PluginType::Secrets, "plugin").with_sha256(digest.to_uppercase());
        runner.verify_checksum(&path).await.unwrap();

        let wrong = runner.with_sha256("00".repeat(32));
        assert!(matches!(wrong.verify_checksum(&path).await, Err(PluginError::ChecksumMismatch { .. })));
    }
}
