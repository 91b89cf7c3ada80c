//! Engine Configuration (C8, §3.1, §6.3): global paths, prefix, flags and
//! the PGP key, loaded from an engine config TOML layered with environment
//! overrides the way the teacher layers its own sources through `figment`.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(rename = "confdir")]
    pub conf_dir: PathBuf,
    #[serde(default)]
    pub prefix: String,
    #[serde(default, rename = "interval")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub noop: bool,
    #[serde(default, rename = "sync-only")]
    pub sync_only: bool,
    #[serde(default, rename = "keep-stage-file")]
    pub keep_stage_file: bool,
    #[serde(default, rename = "pgp-private-key")]
    pub pgp_private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub ignored: Vec<String>,
    #[serde(default, rename = "log-level")]
    pub log_level: Option<String>,
    #[serde(default)]
    pub watch: bool,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl EngineConfig {
    /// Loads `path` as TOML, then layers `TMPLD_*` environment overrides on
    /// top (e.g. `TMPLD_NOOP=1`), the same precedence order the teacher's
    /// `figment` sources use.
    pub fn load(path: &Path) -> Result<Self> {
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let mut config: EngineConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TMPLD_"))
            .extract()?;

        config.conf_dir = resolve_relative(base_dir, &config.conf_dir);
        if let Some(file) = &config.file {
            config.file = Some(resolve_relative(base_dir, file));
        }
        if let Some(key) = &config.pgp_private_key_path {
            config.pgp_private_key_path = Some(resolve_relative(base_dir, key));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.conf_dir.is_absolute() {
            return Err(Error::ConfigInvalid(format!(
                "confdir {:?} must be an absolute path",
                self.conf_dir
            )));
        }
        if !self.conf_dir.is_dir() {
            return Err(Error::ConfDirMissing(self.conf_dir.clone()));
        }
        Ok(())
    }

    pub fn normalized_prefix(&self) -> String {
        normalize_prefix(&self.prefix)
    }

    pub fn pgp_private_key(&self) -> Result<Option<Vec<u8>>> {
        match &self.pgp_private_key_path {
            Some(path) => Ok(Some(std::fs::read(path)?)),
            None => Ok(None),
        }
    }
}

fn resolve_relative(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        base_dir.join(path)
    }
}

/// Ensures a prefix begins with `/`; an empty prefix stays empty.
fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.starts_with('/') {
        prefix.to_owned()
    } else {
        format!("/{prefix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_prefix_adds_leading_slash() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/already"), "/already");
        assert_eq!(normalize_prefix("missing"), "/missing");
    }

    #[test]
    fn load_resolves_relative_confdir_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("conf.d")).unwrap();
        let config_path = dir.path().join("tmpld.toml");
        std::fs::write(&config_path, "confdir = \"conf.d\"\nprefix = \"app\"\n").unwrap();

        let config = EngineConfig::load(&config_path).unwrap();
        assert_eq!(config.conf_dir, dir.path().join("conf.d"));
        assert_eq!(config.normalized_prefix(), "/app");
    }

    #[test]
    fn load_rejects_missing_confdir() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("tmpld.toml");
        std::fs::write(&config_path, "confdir = \"does-not-exist\"\n").unwrap();

        let err = EngineConfig::load(&config_path).unwrap_err();
        assert!(matches!(err, Error::ConfDirMissing(_)));
    }
}
