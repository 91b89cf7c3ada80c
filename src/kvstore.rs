//! In-memory hierarchical key-value store backing the template function set.
//!
//! Listing semantics (`ls`/`lsdir`) follow `original_source/kvstore.go`'s
//! `pathToTerms`/`samePrefixTerms` algorithm exactly: paths are split on `/`
//! after cleaning, and a "directory" relationship is a term-wise prefix
//! match, not a string-prefix match, so `/foo` never matches `/foobar`.

use std::collections::BTreeMap;
use std::sync::RwLock;

use globset::Glob;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVPair {
    pub key: String,
    pub value: String,
}

impl KVPair {
    pub fn new<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A reader-writer-locked in-memory map keyed by path-like strings.
///
/// Readers (`get`, `gets`, `ls`, ...) take a shared lock; writers (`set`,
/// `del`, `purge`) take an exclusive lock. `BTreeMap` already keeps keys in
/// byte-wise sorted order, so most listing operations fall out of ordered
/// iteration rather than a final sort pass.
#[derive(Debug, Default)]
pub struct KVStore {
    inner: RwLock<BTreeMap<String, String>>,
}

impl KVStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn set<K: Into<String>, V: Into<String>>(&self, key: K, value: V) {
        self.inner.write().unwrap().insert(key.into(), value.into());
    }

    pub fn del(&self, key: &str) {
        self.inner.write().unwrap().remove(key);
    }

    pub fn purge(&self) {
        self.inner.write().unwrap().clear();
    }

    pub fn exists(&self, key: &str) -> bool {
        self.inner.read().unwrap().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Result<KVPair> {
        self.inner
            .read()
            .unwrap()
            .get(key)
            .map(|v| KVPair::new(key, v.clone()))
            .ok_or_else(|| Error::NotExist(key.to_owned()))
    }

    pub fn getv(&self, key: &str, default: Option<&str>) -> Result<String> {
        match self.get(key) {
            Ok(pair) => Ok(pair.value),
            Err(e) => match default {
                Some(d) => Ok(d.to_owned()),
                None => Err(e),
            },
        }
    }

    /// All pairs whose key matches `pattern`, sorted ascending by key.
    pub fn gets(&self, pattern: &str) -> Result<Vec<KVPair>> {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::BadPattern(pattern.to_owned(), e))?
            .compile_matcher();

        let guard = self.inner.read().unwrap();
        let pairs: Vec<KVPair> = guard
            .iter()
            .filter(|(k, _)| glob.is_match(k.as_str()))
            .map(|(k, v)| KVPair::new(k.clone(), v.clone()))
            .collect();
        Ok(pairs)
    }

    /// Values of `gets(pattern)`, sorted ascending by value.
    pub fn getvs(&self, pattern: &str) -> Result<Vec<String>> {
        let mut values: Vec<String> = self.gets(pattern)?.into_iter().map(|p| p.value).collect();
        values.sort();
        Ok(values)
    }

    /// Immediate child names under `path`, sorted ascending.
    pub fn ls(&self, path: &str) -> Vec<String> {
        let path = clean_path(path);
        let prefix = path_to_terms(&path);

        let guard = self.inner.read().unwrap();
        let mut names: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();

        for key in guard.keys() {
            if key == &path {
                if let Some(base) = basename(key) {
                    names.insert(base.to_owned());
                }
                continue;
            }

            let dir = dirname(key);
            let target = path_to_terms(&dir);
            if same_prefix_terms(&prefix, &target) {
                let stripped = strip_key(key, &path);
                if let Some(first) = stripped.split('/').next() {
                    if !first.is_empty() {
                        names.insert(first.to_owned());
                    }
                }
            }
        }

        names.into_iter().collect()
    }

    /// Like `ls`, but only names that themselves have further children.
    pub fn lsdir(&self, path: &str) -> Vec<String> {
        let path = clean_path(path);
        let prefix = path_to_terms(&path);

        let guard = self.inner.read().unwrap();
        let mut names: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();

        for key in guard.keys() {
            if !key.starts_with(&path) {
                continue;
            }
            let dir = dirname(key);
            let terms = path_to_terms(&dir);
            if same_prefix_terms(&prefix, &terms) && terms.len() > prefix.len() {
                names.insert(terms[prefix.len()].clone());
            }
        }

        names.into_iter().collect()
    }
}

fn clean_path(path: &str) -> String {
    if path.len() > 1 && path.ends_with('/') {
        path.trim_end_matches('/').to_owned()
    } else {
        path.to_owned()
    }
}

fn path_to_terms(path: &str) -> Vec<String> {
    clean_path(path)
        .split('/')
        .map(|s| s.to_owned())
        .collect()
}

fn same_prefix_terms(prefix: &[String], test: &[String]) -> bool {
    if test.len() < prefix.len() {
        return false;
    }
    prefix.iter().zip(test.iter()).all(|(a, b)| a == b)
}

fn dirname(key: &str) -> String {
    match key.rfind('/') {
        Some(0) => "/".to_owned(),
        Some(idx) => key[..idx].to_owned(),
        None => ".".to_owned(),
    }
}

fn basename(key: &str) -> Option<&str> {
    key.rsplit('/').next().filter(|s| !s.is_empty())
}

fn strip_key(key: &str, prefix: &str) -> String {
    key.strip_prefix(prefix)
        .unwrap_or(key)
        .trim_start_matches('/')
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> KVStore {
        let store = KVStore::new();
        store.set("/deis/services/srv1/node1", "a");
        store.set("/deis/services/srv1/node2", "b");
        store.set("/deis/services/key", "v");
        store
    }

    #[test]
    fn set_get_del_roundtrip() {
        let store = KVStore::new();
        store.set("/a/b/c", "hello");
        assert_eq!(store.get("/a/b/c").unwrap().value, "hello");
        assert!(store.exists("/a/b/c"));

        store.del("/a/b/c");
        assert!(!store.exists("/a/b/c"));
        assert!(matches!(store.get("/a/b/c"), Err(Error::NotExist(_))));
    }

    #[test]
    fn getv_with_default() {
        let store = KVStore::new();
        assert_eq!(store.getv("/missing", Some("fallback")).unwrap(), "fallback");
        assert!(store.getv("/missing", None).is_err());
    }

    #[test]
    fn s1_store_listing() {
        let store = populated();
        assert_eq!(store.ls("/deis/services"), vec!["key", "srv1"]);
        assert_eq!(store.ls("/deis/services/"), vec!["key", "srv1"]);
        assert_eq!(store.lsdir("/deis/services"), vec!["srv1"]);
    }

    #[test]
    fn ls_on_leaf_key_returns_basename() {
        let store = populated();
        assert_eq!(store.ls("/deis/services/key"), vec!["key"]);
    }

    #[test]
    fn ls_on_missing_path_is_empty() {
        let store = populated();
        assert!(store.ls("/does/not/exist").is_empty());
        assert!(store.lsdir("/does/not/exist").is_empty());
    }

    #[test]
    fn s2_glob() {
        let store = populated();
        let pairs = store.gets("/deis/services/srv1/*").unwrap();
        assert_eq!(
            pairs,
            vec![
                KVPair::new("/deis/services/srv1/node1", "a"),
                KVPair::new("/deis/services/srv1/node2", "b"),
            ]
        );
    }

    #[test]
    fn gets_and_getvs_are_sorted() {
        let store = KVStore::new();
        store.set("/x/b", "2");
        store.set("/x/a", "3");
        store.set("/x/c", "1");

        let pairs = store.gets("/x/*").unwrap();
        let keys: Vec<_> = pairs.iter().map(|p| p.key.clone()).collect();
        assert_eq!(keys, vec!["/x/a", "/x/b", "/x/c"]);

        let values = store.getvs("/x/*").unwrap();
        assert_eq!(values, vec!["1", "2", "3"]);
    }

    #[test]
    fn bad_pattern_is_reported() {
        let store = KVStore::new();
        assert!(matches!(store.gets("[unclosed"), Err(Error::BadPattern(_, _))));
    }

    #[test]
    fn purge_clears_everything() {
        let store = populated();
        store.purge();
        assert!(store.ls("/deis/services").is_empty());
    }
}
