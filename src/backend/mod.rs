//! Backend `Client` contract (C3, §4.3): the capability interface every
//! pluggable key-value collaborator implements, plus the two reference
//! backends (`env`, `file`) shipped in-tree.

mod env;
mod file;

pub use env::EnvBackend;
pub use file::FileBackend;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;

/// An opaque cursor returned by `watch_prefix`. Backends that don't support
/// push notification always return `0`; backends that do use it as a
/// last-seen generation counter.
pub type WaitIndex = u64;

/// Fired to ask a blocked `watch_prefix` call to return early. Cloned into
/// every backend task; backends observe it via `changed()`/`borrow()`.
pub type Cancel = watch::Receiver<bool>;

#[async_trait]
pub trait Client: std::fmt::Debug + Send + Sync {
    /// Whether this backend can push change notifications. Selects the
    /// engine's default driver mode when none is explicitly requested
    /// (§4.5.1): `true` favors watch mode, `false` favors interval mode.
    fn watch_enabled(&self) -> bool;

    /// Returns every key under any prefix in `keys`, mapped to its string
    /// value.
    async fn get_values(&self, keys: &[String]) -> Result<BTreeMap<String, String>>;

    /// Blocks until a key under one of `keys` changes or `cancel` fires.
    /// `last_index == 0` means "fire immediately" (bootstrap). Returns the
    /// new cursor.
    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        last_index: WaitIndex,
        cancel: Cancel,
    ) -> Result<WaitIndex>;

    /// Idempotent teardown; called once when the engine shuts down.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_object_safe(_: &dyn Client) {}

    #[test]
    fn client_trait_is_object_safe() {
        let backend = EnvBackend::new();
        assert_object_safe(&backend);
    }
}
