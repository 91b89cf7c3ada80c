//! Resource Descriptor (C4, §3.2): the parsed `[template]` section of one
//! `conf.d/*.toml` file, plus enumeration of descriptors under `conf.d/`.
//!
//! Directly modeled on `original_source/resource.go`'s `TemplateResource`;
//! `-1` remains the "inherit the effective uid/gid" sentinel rather than
//! `Option<u32>`, to keep the TOML shape identical to the original.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceDescriptor {
    pub src: String,
    pub dest: String,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_id")]
    pub uid: i64,
    #[serde(default = "default_id")]
    pub gid: i64,
    #[serde(default, rename = "check_cmd")]
    pub check_cmd: String,
    #[serde(default, rename = "reload_cmd")]
    pub reload_cmd: String,
}

fn default_id() -> i64 {
    -1
}

#[derive(Debug, Deserialize, Serialize)]
struct ResourceDescriptorFile {
    template: ResourceDescriptor,
}

impl ResourceDescriptor {
    pub fn from_str(data: &str) -> Result<Self> {
        let raw: toml::Value = data.parse()?;
        warn_on_undecoded_keys(&raw);

        let wrapped: ResourceDescriptorFile = toml::from_str(data)?;
        Ok(wrapped.template)
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::DescriptorLoad(path.to_owned(), e.to_string())
        })?;
        let descriptor =
            Self::from_str(&data).map_err(|e| Error::DescriptorLoad(path.to_owned(), e.to_string()))?;

        if descriptor.src.is_empty() {
            return Err(Error::EmptySrc(path.to_owned()));
        }

        Ok(descriptor)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        let wrapped = ResourceDescriptorFile {
            template: self.clone(),
        };
        Ok(toml::to_string_pretty(&wrapped)?)
    }

    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}

/// Logs (rather than rejects) any `[template]` key this struct doesn't
/// understand, matching `md.Undecoded()`'s warning-only behavior.
fn warn_on_undecoded_keys(raw: &toml::Value) {
    const KNOWN: &[&str] = &[
        "src", "dest", "keys", "mode", "prefix", "uid", "gid", "check_cmd", "reload_cmd",
    ];

    let Some(template) = raw.get("template").and_then(toml::Value::as_table) else {
        return;
    };

    let unknown: Vec<&str> = template
        .keys()
        .map(String::as_str)
        .filter(|k| !KNOWN.contains(k))
        .collect();

    if !unknown.is_empty() {
        log::warn!("descriptor has undecoded keys: {unknown:?}");
    }
}

/// Scans `<conf_dir>/conf.d/` recursively for `*.toml` files, sorted by
/// path, loading each and skipping any whose basename is in `ignored`.
/// Missing `conf_dir` is fatal (§4.4.4); an empty result only warns.
///
/// A per-descriptor load failure is logged and the descriptor skipped
/// rather than aborting enumeration, but per §7 the last such error is
/// still surfaced to the caller alongside the descriptors that did load.
pub fn make_all(
    conf_dir: &Path,
    ignored: &[String],
) -> Result<(Vec<(PathBuf, ResourceDescriptor)>, Option<Error>)> {
    let conf_d = conf_dir.join("conf.d");
    if !conf_dir.is_dir() {
        return Err(Error::ConfDirMissing(conf_dir.to_owned()));
    }

    let mut paths = find_toml_files(&conf_d)?;
    paths.sort();

    let mut descriptors = Vec::new();
    let mut last_error = None;
    for path in paths {
        let basename = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if ignored.iter().any(|i| i == &basename) {
            continue;
        }
        match ResourceDescriptor::load_file(&path) {
            Ok(descriptor) => descriptors.push((path.clone(), descriptor)),
            Err(e) => {
                log::error!("skipping descriptor {}: {e}", path.display());
                last_error = Some(e);
            }
        }
    }

    if descriptors.is_empty() {
        log::warn!("no resource descriptors found under {}", conf_d.display());
    }

    Ok((descriptors, last_error))
}

fn find_toml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if !dir.is_dir() {
        return Ok(found);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            found.extend(find_toml_files(&path)?);
        } else if path.extension().is_some_and(|e| e == "toml") {
            found.push(path);
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[template]
src = "nginx.conf.tmpl"
dest = "/etc/nginx/nginx.conf"
keys = ["/nginx/worker_processes"]
mode = "0644"
check_cmd = "nginx -t -c {{.src}}"
reload_cmd = "service nginx reload"
"#;

    #[test]
    fn parses_descriptor_with_defaults() {
        let descriptor = ResourceDescriptor::from_str(SAMPLE).unwrap();
        assert_eq!(descriptor.src, "nginx.conf.tmpl");
        assert_eq!(descriptor.uid, -1);
        assert_eq!(descriptor.gid, -1);
        assert_eq!(descriptor.keys, vec!["/nginx/worker_processes"]);
    }

    #[test]
    fn round_trips_through_toml_string() {
        let descriptor = ResourceDescriptor::from_str(SAMPLE).unwrap();
        let rendered = descriptor.to_toml_string().unwrap();
        let reparsed = ResourceDescriptor::from_str(&rendered).unwrap();
        assert_eq!(reparsed.dest, descriptor.dest);
    }

    #[test]
    fn empty_src_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty-src.toml");
        std::fs::write(&path, "[template]\nsrc = \"\"\ndest = \"/etc/out\"\n").unwrap();

        let err = ResourceDescriptor::load_file(&path).unwrap_err();
        assert!(matches!(err, Error::EmptySrc(_)));
    }

    #[test]
    fn make_all_is_fatal_on_missing_conf_dir() {
        let err = make_all(Path::new("/does/not/exist"), &[]).unwrap_err();
        assert!(matches!(err, Error::ConfDirMissing(_)));
    }

    #[test]
    fn make_all_skips_unparseable_descriptors_without_failing_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("conf.d")).unwrap();
        std::fs::write(dir.path().join("conf.d/good.toml"), SAMPLE).unwrap();
        std::fs::write(dir.path().join("conf.d/bad.toml"), "not valid toml [[[").unwrap();

        let (descriptors, last_error) = make_all(dir.path(), &[]).unwrap();
        assert_eq!(descriptors.len(), 1);
        assert!(last_error.is_some());
    }

    #[test]
    fn make_all_scans_recursively_sorted_and_honors_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("conf.d/nested")).unwrap();
        std::fs::write(dir.path().join("conf.d/b.toml"), SAMPLE).unwrap();
        std::fs::write(dir.path().join("conf.d/nested/a.toml"), SAMPLE).unwrap();
        std::fs::write(dir.path().join("conf.d/skip.toml"), SAMPLE).unwrap();

        let (descriptors, last_error) = make_all(dir.path(), &["skip.toml".to_owned()]).unwrap();
        assert_eq!(descriptors.len(), 2);
        assert!(descriptors[0].0 < descriptors[1].0);
        assert!(last_error.is_none());
    }
}
