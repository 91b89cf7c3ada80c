//! Process-environment backend. Never pushes; `watch_prefix` just blocks
//! until cancelled. Key transform mirrors
//! `original_source/backends/env/env_client.go` exactly: a requested key
//! `/myapp/db/host` is transformed to the env-var prefix `MYAPP_DB_HOST`,
//! and any environment variable whose name starts with that prefix is
//! folded back into a `/`-separated key.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{Cancel, Client, WaitIndex};
use crate::error::Result;

#[derive(Debug, Default)]
pub struct EnvBackend;

impl EnvBackend {
    pub fn new() -> Self {
        Self
    }
}

/// `/myapp/db` -> `MYAPP_DB`.
fn transform(key: &str) -> String {
    key.trim_start_matches('/').replace('/', "_").to_uppercase()
}

/// `MYAPP_DB_HOST` -> `/myapp/db/host`.
fn clean(env_key: &str) -> String {
    format!("/{}", env_key.to_lowercase()).replace('_', "/")
}

#[async_trait]
impl Client for EnvBackend {
    fn watch_enabled(&self) -> bool {
        false
    }

    async fn get_values(&self, keys: &[String]) -> Result<BTreeMap<String, String>> {
        let env_vars: Vec<(String, String)> = std::env::vars().collect();

        let mut vars = BTreeMap::new();
        for key in keys {
            let prefix = transform(key);
            for (env_key, env_value) in &env_vars {
                if env_key.starts_with(&prefix) {
                    vars.insert(clean(env_key), env_value.clone());
                }
            }
        }

        log::debug!("env backend resolved {} key(s)", vars.len());
        Ok(vars)
    }

    async fn watch_prefix(
        &self,
        _prefix: &str,
        _keys: &[String],
        _last_index: WaitIndex,
        mut cancel: Cancel,
    ) -> Result<WaitIndex> {
        let _ = cancel.changed().await;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_strips_leading_slash_and_uppercases() {
        assert_eq!(transform("/myapp/db/host"), "MYAPP_DB_HOST");
        assert_eq!(transform("myapp/db"), "MYAPP_DB");
    }

    #[test]
    fn clean_lowercases_and_splits_on_underscore() {
        assert_eq!(clean("MYAPP_DB_HOST"), "/myapp/db/host");
    }

    #[tokio::test]
    async fn fetches_prefixed_env_vars() {
        std::env::set_var("TMPLD_TEST_VALUE", "42");
        let backend = EnvBackend::new();
        let values = backend
            .get_values(&["/tmpld/test".to_owned()])
            .await
            .unwrap();
        assert_eq!(values.get("/tmpld/test/value").map(String::as_str), Some("42"));
        std::env::remove_var("TMPLD_TEST_VALUE");
    }
}
