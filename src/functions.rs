//! Template function set (C2): binds the key-value store, DNS lookups and
//! a handful of string/arithmetic helpers as minijinja globals.
//!
//! Catalogue and behavior are taken from `original_source/template_funcs.go`'s
//! `NewFuncMap`. Four additional `cget*` functions are bound only when a PGP
//! private key is configured.

use std::sync::Arc;

use chrono::Local;
use minijinja::value::{Rest, Value};
use minijinja::{Environment, Error, ErrorKind};

use crate::kvstore::{KVPair, KVStore};
use crate::pgp::PgpKey;

pub fn register(env: &mut Environment, store: Arc<KVStore>, pgp: Option<Arc<PgpKey>>) {
    register_store_functions(env, store.clone(), "", None);

    if let Some(pgp) = pgp {
        register_store_functions(env, store, "c", Some(pgp.clone()));
        env.add_function("cdecrypt", move |data: String| -> Result<String, Error> {
            pgp.decrypt(&data)
                .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
        });
    }

    env.add_function("base", |path: String| {
        std::path::Path::new(&path)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or(path)
    });
    env.add_function("dir", |path: String| {
        std::path::Path::new(&path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_owned())
    });
    env.add_function("split", |s: String, sep: String| -> Vec<String> {
        s.split(sep.as_str()).map(|p| p.to_owned()).collect()
    });
    env.add_function("join", |parts: Vec<String>, sep: String| parts.join(&sep));
    env.add_function("toUpper", |s: String| s.to_uppercase());
    env.add_function("toLower", |s: String| s.to_lowercase());
    env.add_function("contains", |haystack: String, needle: String| {
        haystack.contains(needle.as_str())
    });
    env.add_function("replace", |s: String, from: String, to: String, n: i64| {
        if n < 0 {
            s.replace(from.as_str(), &to)
        } else {
            s.replacen(from.as_str(), &to, n as usize)
        }
    });
    env.add_function("trimSuffix", |s: String, suffix: String| {
        s.strip_suffix(suffix.as_str()).unwrap_or(&s).to_owned()
    });

    env.add_function("json", json_object);
    env.add_function("jsonArray", json_array);
    env.add_function("map", create_map);

    env.add_function("getenv", |key: String, default: Option<String>| {
        std::env::var(&key)
            .ok()
            .filter(|v| !v.is_empty())
            .or(default)
            .unwrap_or_default()
    });
    env.add_function("datetime", || Local::now().to_rfc3339());

    env.add_function("lookupIP", lookup_ip);
    env.add_function("lookupSRV", lookup_srv);

    env.add_function("fileExists", |path: String| {
        std::path::Path::new(&path).exists()
    });

    env.add_function("base64Encode", base64_encode);
    env.add_function("base64Decode", base64_decode);

    env.add_function("parseBool", |s: String| -> Result<bool, Error> {
        s.parse::<bool>()
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
    });
    env.add_function("atoi", |s: String| -> Result<i64, Error> {
        s.parse::<i64>()
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
    });

    env.add_function("reverse", reverse);
    env.add_function("sortByLength", |mut values: Vec<String>| {
        values.sort_by_key(|v| v.len());
        values
    });
    env.add_function("sortKVByLength", sort_kv_by_length);

    env.add_function("add", |a: i64, b: i64| a + b);
    env.add_function("sub", |a: i64, b: i64| a - b);
    env.add_function("mul", |a: i64, b: i64| a * b);
    env.add_function("div", |a: i64, b: i64| a / b);
    env.add_function("mod", |a: i64, b: i64| a % b);

    env.add_function("seq", |first: i64, last: i64| -> Vec<i64> {
        if last < first {
            Vec::new()
        } else {
            (first..=last).collect()
        }
    });
}

/// Binds `exists ls lsdir get gets getv getvs`, optionally under a `c`
/// prefix (`cget`, `cgets`, `cgetv`, `cgetvs`) for the PGP-decrypting
/// variants, which base64-decode-then-decrypt every returned value.
fn register_store_functions(
    env: &mut Environment,
    store: Arc<KVStore>,
    prefix: &str,
    pgp: Option<Arc<PgpKey>>,
) {
    if pgp.is_none() {
        let s = store.clone();
        env.add_function("exists", move |key: String| s.exists(&key));
        let s = store.clone();
        env.add_function("ls", move |path: String| s.ls(&path));
        let s = store.clone();
        env.add_function("lsdir", move |path: String| s.lsdir(&path));
    }

    let decrypt_one = {
        let pgp = pgp.clone();
        move |value: String| -> Result<String, Error> {
            match &pgp {
                Some(key) => key
                    .decrypt(&value)
                    .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string())),
                None => Ok(value),
            }
        }
    };

    let s = store.clone();
    let decrypt = decrypt_one.clone();
    env.add_function(format!("{prefix}get"), move |key: String| -> Result<Value, Error> {
        let pair = s
            .get(&key)
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
        Ok(Value::from(KVPairValue {
            key: pair.key,
            value: decrypt(pair.value)?,
        }))
    });

    let s = store.clone();
    let decrypt = decrypt_one.clone();
    env.add_function(format!("{prefix}gets"), move |pattern: String| -> Result<Vec<Value>, Error> {
        s.gets(&pattern)
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?
            .into_iter()
            .map(|pair| {
                Ok(Value::from(KVPairValue {
                    key: pair.key,
                    value: decrypt(pair.value)?,
                }))
            })
            .collect()
    });

    let s = store.clone();
    let decrypt = decrypt_one.clone();
    env.add_function(
        format!("{prefix}getv"),
        move |key: String, default: Option<String>| -> Result<String, Error> {
            let value = s
                .getv(&key, default.as_deref())
                .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
            decrypt(value)
        },
    );

    let decrypt = decrypt_one;
    env.add_function(format!("{prefix}getvs"), move |pattern: String| -> Result<Vec<String>, Error> {
        store
            .getvs(&pattern)
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?
            .into_iter()
            .map(&decrypt)
            .collect()
    });
}

/// `KVPair` exposed to templates as an object with `.key`/`.value`.
#[derive(Debug, Clone, serde::Serialize)]
struct KVPairValue {
    key: String,
    value: String,
}

impl From<KVPair> for KVPairValue {
    fn from(pair: KVPair) -> Self {
        Self {
            key: pair.key,
            value: pair.value,
        }
    }
}

impl From<KVPairValue> for Value {
    fn from(pair: KVPairValue) -> Self {
        Value::from_serializable(&pair)
    }
}

fn json_object(data: String) -> Result<Value, Error> {
    let value: serde_json::Value = serde_json::from_str(&data)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
    Ok(Value::from_serializable(&value))
}

fn json_array(data: String) -> Result<Value, Error> {
    let value: Vec<serde_json::Value> = serde_json::from_str(&data)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
    Ok(Value::from_serializable(&value))
}

/// Builds a mapping from an even-length `(k1, v1, k2, v2, ...)` sequence.
fn create_map(args: Rest<Value>) -> Result<Value, Error> {
    if args.len() % 2 != 0 {
        return Err(Error::new(ErrorKind::InvalidOperation, "invalid map call"));
    }

    let mut map = std::collections::BTreeMap::new();
    for pair in args.chunks(2) {
        let key = pair[0].as_str().ok_or_else(|| {
            Error::new(ErrorKind::InvalidOperation, "map keys must be strings")
        })?;
        map.insert(key.to_owned(), pair[1].clone());
    }

    Ok(Value::from_serializable(&map))
}

fn base64_encode(data: String) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(data.as_bytes())
}

fn base64_decode(data: String) -> Result<String, Error> {
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

fn lookup_ip(host: String) -> Vec<String> {
    use hickory_resolver::config::{ResolverConfig, ResolverOpts};
    use hickory_resolver::Resolver;

    let Ok(resolver) = Resolver::new(ResolverConfig::default(), ResolverOpts::default()) else {
        return Vec::new();
    };
    let Ok(response) = resolver.lookup_ip(host.as_str()) else {
        return Vec::new();
    };

    let mut ips: Vec<String> = response.iter().map(|ip| ip.to_string()).collect();
    ips.sort();
    ips
}

fn lookup_srv(service: String, proto: String, name: String) -> Vec<Value> {
    use hickory_resolver::config::{ResolverConfig, ResolverOpts};
    use hickory_resolver::Resolver;

    let Ok(resolver) = Resolver::new(ResolverConfig::default(), ResolverOpts::default()) else {
        return Vec::new();
    };
    let query = format!("_{service}._{proto}.{name}");
    let Ok(response) = resolver.srv_lookup(query.as_str()) else {
        return Vec::new();
    };

    let mut records: Vec<(String, u16, u16, u16)> = response
        .iter()
        .map(|srv| {
            (
                srv.target().to_string(),
                srv.port(),
                srv.priority(),
                srv.weight(),
            )
        })
        .collect();
    records.sort_by_key(|(target, port, priority, weight)| {
        format!("{target}{port}{priority}{weight}")
    });

    records
        .into_iter()
        .map(|(target, port, priority, weight)| {
            let mut map = std::collections::BTreeMap::new();
            map.insert("target".to_owned(), Value::from(target));
            map.insert("port".to_owned(), Value::from(port));
            map.insert("priority".to_owned(), Value::from(priority));
            map.insert("weight".to_owned(), Value::from(weight));
            Value::from_serializable(&map)
        })
        .collect()
}

/// Reverses a sequence of strings or KV pairs in place; anything else
/// passes through unchanged, mirroring `tmplFunc_reverse`'s type switch.
fn reverse(values: Value) -> Value {
    let Some(seq) = values.as_seq() else {
        return values;
    };
    let items: Vec<Value> = seq.iter().rev().collect();
    Value::from(items)
}

/// Sorts a sequence of `{key, value}` objects (as produced by `gets`) by
/// ascending key length.
fn sort_kv_by_length(values: Vec<Value>) -> Result<Vec<Value>, Error> {
    let mut keyed: Vec<(usize, Value)> = values
        .into_iter()
        .map(|v| {
            let key = v.get_attr("key")?;
            let len = key
                .as_str()
                .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "expected a KV pair"))?
                .len();
            Ok((len, v))
        })
        .collect::<Result<_, Error>>()?;
    keyed.sort_by_key(|(len, _)| *len);
    Ok(keyed.into_iter().map(|(_, v)| v).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    fn env_with_store() -> (Environment<'static>, Arc<KVStore>) {
        let store = Arc::new(KVStore::new());
        let mut env = Environment::new();
        register(&mut env, store.clone(), None);
        (env, store)
    }

    #[test]
    fn s3_seq() {
        let (env, _store) = env_with_store();
        let rendered = env
            .render_str("{{ seq(3, 5) }}", context! {})
            .unwrap();
        assert_eq!(rendered, "[3, 4, 5]");
        let rendered = env
            .render_str("{{ seq(5, 3) }}", context! {})
            .unwrap();
        assert_eq!(rendered, "[]");
    }

    #[test]
    fn store_functions_round_trip() {
        let (env, store) = env_with_store();
        store.set("/app/name", "widget");
        let rendered = env.render_str("{{ getv('/app/name') }}", context! {}).unwrap();
        assert_eq!(rendered, "widget");
    }

    #[test]
    fn arithmetic_helpers() {
        let (env, _store) = env_with_store();
        assert_eq!(env.render_str("{{ add(2, 3) }}", context! {}).unwrap(), "5");
        assert_eq!(env.render_str("{{ sub(5, 3) }}", context! {}).unwrap(), "2");
        assert_eq!(env.render_str("{{ mul(2, 3) }}", context! {}).unwrap(), "6");
        assert_eq!(env.render_str("{{ div(6, 3) }}", context! {}).unwrap(), "2");
        assert_eq!(env.render_str("{{ mod(7, 3) }}", context! {}).unwrap(), "1");
    }

    #[test]
    fn base64_round_trip() {
        let (env, _store) = env_with_store();
        let encoded = env
            .render_str("{{ base64Encode('hello') }}", context! {})
            .unwrap();
        let decoded = env
            .render_str(&format!("{{{{ base64Decode('{encoded}') }}}}"), context! {})
            .unwrap();
        assert_eq!(decoded, "hello");
    }

    #[test]
    fn sort_by_length_is_stable_ascending() {
        let (env, _store) = env_with_store();
        let rendered = env
            .render_str("{{ sortByLength(['ccc', 'a', 'bb']) }}", context! {})
            .unwrap();
        assert_eq!(rendered, "[a, bb, ccc]");
    }

    #[test]
    fn no_cget_functions_without_pgp_key() {
        let store = Arc::new(KVStore::new());
        let mut env = Environment::new();
        register(&mut env, store, None);
        assert!(env.render_str("{{ cget('/x') }}", context! {}).is_err());
    }
}
