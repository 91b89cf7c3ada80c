//! TOML-file backend: treats a single TOML document as a flat key-value
//! map, the direct counterpart of `original_source/backends_toml.go`'s
//! `TomlBackend`. Unlike the Go original (which never watches), this
//! backend is push-capable: it reuses the `notify`-driven watch idiom from
//! the teacher's `datasource::File` to wake `watch_prefix` when the backing
//! file changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::{Cancel, Client, WaitIndex};
use crate::error::{Error, Result};

pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_owned(),
        }
    }

    /// Parses the TOML document, keeping only keys that already look like
    /// store paths (begin with `/`) — malformed entries are silently
    /// skipped, matching the Go backend's `strings.HasPrefix(k, "/")` filter.
    fn load(&self) -> Result<BTreeMap<String, String>> {
        let contents = std::fs::read_to_string(&self.path)?;
        let raw: BTreeMap<String, String> = toml::from_str(&contents)?;
        Ok(raw.into_iter().filter(|(k, _)| k.starts_with('/')).collect())
    }
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend").field("path", &self.path).finish()
    }
}

#[async_trait]
impl Client for FileBackend {
    fn watch_enabled(&self) -> bool {
        true
    }

    async fn get_values(&self, keys: &[String]) -> Result<BTreeMap<String, String>> {
        let all = self.load()?;
        Ok(all
            .into_iter()
            .filter(|(k, _)| keys.iter().any(|prefix| k.starts_with(prefix.as_str())))
            .collect())
    }

    async fn watch_prefix(
        &self,
        _prefix: &str,
        _keys: &[String],
        last_index: WaitIndex,
        mut cancel: Cancel,
    ) -> Result<WaitIndex> {
        if last_index == 0 {
            return Ok(1);
        }

        let (tx, mut rx) = mpsc::channel(1);
        let path = self.path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |evt: std::result::Result<notify::Event, notify::Error>| {
                if let Ok(e) = evt {
                    if e.kind.is_modify() || e.kind.is_create() || e.kind.is_remove() {
                        let _ = tx.blocking_send(());
                    }
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::BackendFailure(e.to_string()))?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| Error::BackendFailure(e.to_string()))?;

        tokio::select! {
            _ = rx.recv() => Ok(last_index + 1),
            _ = cancel.changed() => Ok(last_index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn loads_only_slash_prefixed_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "\"/app/name\" = \"widget\"\nignored = \"nope\"").unwrap();

        let backend = FileBackend::new(file.path());
        let values = backend.get_values(&["/app".to_owned()]).await.unwrap();
        assert_eq!(values.get("/app/name").map(String::as_str), Some("widget"));
        assert!(!values.contains_key("ignored"));
    }

    #[tokio::test]
    async fn bootstrap_watch_fires_immediately() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "\"/app/name\" = \"widget\"").unwrap();
        let backend = FileBackend::new(file.path());

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let index = backend
            .watch_prefix("/app", &["/app".to_owned()], 0, rx)
            .await
            .unwrap();
        assert_eq!(index, 1);
    }
}
