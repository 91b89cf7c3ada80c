//! Resource Processor (C5, §4.4): the render → compare → stage → check →
//! swap → reload pipeline for one resource descriptor.
//!
//! Grounded on `original_source/resource_processor.go`'s
//! `TemplateResourceProcessor` (`SetVars`/`CreateStageFile`/`Sync`/`Check`/
//! `Reload`/`SetFileMode`) combined with the teacher's `plan.rs` atomic
//! stage-file-in-destination-directory idiom.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use colored::Colorize;
use minijinja::Environment;
use nix::unistd::{chown, Gid, Uid};
use similar::TextDiff;

use crate::backend::Client;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::kvstore::KVStore;
use crate::options::Options;
use crate::resource::ResourceDescriptor;

/// Default mode for a destination that does not yet exist (§4.4.2).
const DEFAULT_MODE: u32 = 0o644;

pub struct ResourceProcessor {
    name: String,
    descriptor: ResourceDescriptor,
    template_dir: PathBuf,
    prefix: String,
    uid: u32,
    gid: u32,
    keep_stage_file: bool,
    noop: bool,
    sync_only: bool,
    store: Arc<KVStore>,
    stage_path: Option<PathBuf>,
}

impl ResourceProcessor {
    /// Builds one processor from a loaded descriptor, resolving the
    /// per-resource prefix (inheriting the engine prefix when empty) and
    /// the `-1` uid/gid sentinel to the process's effective ids.
    pub fn new(
        name: String,
        descriptor: ResourceDescriptor,
        config: &EngineConfig,
        store: Arc<KVStore>,
    ) -> Self {
        let prefix = if descriptor.prefix.is_empty() {
            config.normalized_prefix()
        } else if descriptor.prefix.starts_with('/') {
            descriptor.prefix.clone()
        } else {
            format!("/{}", descriptor.prefix)
        };

        let uid = if descriptor.uid == -1 {
            Uid::effective().as_raw()
        } else {
            descriptor.uid as u32
        };
        let gid = if descriptor.gid == -1 {
            Gid::effective().as_raw()
        } else {
            descriptor.gid as u32
        };

        Self {
            name,
            descriptor,
            template_dir: config.conf_dir.join("templates"),
            prefix,
            uid,
            gid,
            keep_stage_file: config.keep_stage_file,
            noop: config.noop,
            sync_only: config.sync_only,
            store,
            stage_path: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dest(&self) -> PathBuf {
        resolve_dest(&self.descriptor.dest, &self.template_dir)
    }

    pub fn keys(&self) -> Vec<String> {
        self.descriptor
            .keys
            .iter()
            .map(|k| format!("{}{}", self.prefix, k))
            .collect()
    }

    /// Builds a minijinja environment bound to this resource's private
    /// store, with engine-wide extra functions and the optional PGP key
    /// layered on top (§4.2). `options`' `func_map_updater`s run against the
    /// merged extra-function map before it is bound, last write wins.
    pub fn environment(
        &self,
        options: &Options,
        pgp: Option<Arc<crate::pgp::PgpKey>>,
    ) -> Environment<'static> {
        let mut env = Environment::new();
        crate::functions::register(&mut env, self.store.clone(), pgp);
        crate::filters::register(&mut env);

        let mut extra = options.extra_functions().clone();
        for updater in options.func_map_updaters() {
            updater(&mut extra);
        }
        for (name, value) in extra {
            env.add_function(name, move || value.clone());
        }
        env
    }

    /// Runs the full pipeline for this resource: fetch, render, compare,
    /// swap, check/reload (§4.4.1).
    pub async fn process(
        &mut self,
        client: &dyn Client,
        env: &Environment<'_>,
        options: &Options,
    ) -> Result<bool> {
        self.set_vars(client).await?;
        self.create_stage_file(env).await?;
        self.sync(options).await
    }

    /// Fetches this resource's keys from the backend and repopulates the
    /// private `KVStore` with the prefix stripped back off (§4.4.1 step 2).
    pub async fn set_vars(&self, client: &dyn Client) -> Result<()> {
        log::debug!("{}: retrieving keys from store", self.name);
        let values = client.get_values(&self.keys()).await?;

        self.store.purge();
        for (key, value) in values {
            let stripped = key.strip_prefix(&self.prefix).unwrap_or(&key);
            let cleaned = if stripped.starts_with('/') {
                stripped.to_owned()
            } else {
                format!("/{stripped}")
            };
            self.store.set(cleaned, value);
        }
        Ok(())
    }

    /// Resolves `file_mode` per §4.4.2.
    fn resolve_file_mode(&self, dest: &Path) -> Result<u32> {
        if self.descriptor.mode.is_empty() {
            match std::fs::metadata(dest) {
                Ok(meta) => Ok(meta.permissions().mode() & 0o7777),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DEFAULT_MODE),
                Err(e) => Err(e.into()),
            }
        } else {
            u32::from_str_radix(self.descriptor.mode.trim_start_matches("0o"), 8)
                .map_err(|e| Error::ConfigInvalid(format!("invalid mode {:?}: {e}", self.descriptor.mode)))
        }
    }

    /// Renders the template into a stage file created in `dest`'s own
    /// directory (so the later rename is atomic on the same filesystem),
    /// then chmods/chowns it to the resolved owner (§4.4.1 step 3).
    pub async fn create_stage_file(&mut self, env: &Environment<'_>) -> Result<()> {
        let src = self.template_dir.join(&self.descriptor.src);
        if !src.is_file() {
            return Err(Error::DescriptorLoad(
                src.clone(),
                "missing template".to_owned(),
            ));
        }

        let dest = self.dest();
        let dest_dir = dest.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dest_dir)?;

        let template_name = src.to_string_lossy().into_owned();
        let source = std::fs::read_to_string(&src)?;
        let mut owned_env = env.clone();
        owned_env.add_template_owned(template_name.clone(), source)?;
        let rendered = owned_env.get_template(&template_name)?.render(())?;

        let stage_path = stage_path_for(dest_dir, &dest);
        std::fs::write(&stage_path, rendered)?;
        let guard = StageGuard::new(&stage_path);

        let mode = self.resolve_file_mode(&dest)?;
        std::fs::set_permissions(&stage_path, std::fs::Permissions::from_mode(mode))?;
        chown(&stage_path, Some(Uid::from_raw(self.uid)), Some(Gid::from_raw(self.gid)))
            .map_err(Error::NixError)?;

        guard.disarm();
        self.stage_path = Some(stage_path);
        Ok(())
    }

    /// Compares staged and destination files and swaps them in if they
    /// differ, running check/reload commands around the swap (§4.4.1 step
    /// 4). The stage file is always removed afterwards unless
    /// `keep_stage_file` is set.
    pub async fn sync(&mut self, options: &Options) -> Result<bool> {
        let Some(stage_path) = self.stage_path.take() else {
            return Err(Error::ConfigInvalid("sync called before staging".to_owned()));
        };

        let result = self.sync_inner(&stage_path, options).await;

        if self.keep_stage_file {
            log::info!("{}: keeping staged file {:?}", self.name, stage_path);
        } else if stage_path.exists() {
            let _ = std::fs::remove_file(&stage_path);
        }

        result
    }

    async fn sync_inner(&self, stage_path: &Path, options: &Options) -> Result<bool> {
        let dest = self.dest();
        let mode = self.resolve_file_mode(&dest)?;
        let same = same_config(stage_path, &dest, mode, self.uid, self.gid)?;

        if self.noop {
            if !same {
                log_diff(&self.name, stage_path, &dest);
            }
            log::warn!("{}: noop mode enabled, {:?} will not be modified", self.name, dest);
            return Ok(false);
        }

        if same {
            log::debug!("{}: {:?} already in sync", self.name, dest);
            return Ok(false);
        }

        log::info!("{}: {:?} out of sync", self.name, dest);

        if !self.sync_only && !self.descriptor.check_cmd.is_empty() {
            self.run_check(stage_path, options).await?;
        }

        self.swap(stage_path, &dest, mode).await?;

        if !self.sync_only && !self.descriptor.reload_cmd.is_empty() {
            self.run_reload(options).await?;
        }

        log::info!("{}: {:?} has been updated", self.name, dest);
        Ok(true)
    }

    async fn swap(&self, stage_path: &Path, dest: &Path, mode: u32) -> Result<()> {
        match std::fs::rename(stage_path, dest) {
            Ok(()) => Ok(()),
            Err(e) if is_device_or_resource_busy(&e) => {
                log::debug!("{}: rename failed, target is likely a mount; writing instead", self.name);
                let contents = std::fs::read(stage_path)?;
                std::fs::write(dest, contents)?;
                std::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode))?;
                chown(dest, Some(Uid::from_raw(self.uid)), Some(Gid::from_raw(self.gid)))
                    .map_err(Error::NixError)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run_check(&self, stage_path: &Path, options: &Options) -> Result<()> {
        let mut ctx = BTreeMap::new();
        ctx.insert("src".to_owned(), stage_path.to_string_lossy().into_owned());
        let rendered = render_mini_template(&self.descriptor.check_cmd, &ctx)?;

        Options::run_hook(options.before_check_cmd_hook(), &self.name, &rendered, None);
        let outcome = run_command(&rendered).await;
        Options::run_hook(options.after_check_cmd_hook(), &self.name, &rendered, outcome.as_ref().err());

        outcome.map_err(|(status, output)| Error::CheckFailed(self.dest(), status, output))
    }

    async fn run_reload(&self, options: &Options) -> Result<()> {
        let cmd = self.descriptor.reload_cmd.clone();
        Options::run_hook(options.before_reload_cmd_hook(), &self.name, &cmd, None);
        let outcome = run_command(&cmd).await;
        Options::run_hook(options.after_reload_cmd_hook(), &self.name, &cmd, outcome.as_ref().err());

        outcome.map_err(|(status, output)| Error::ReloadFailed(self.dest(), status, output))
    }
}

fn resolve_dest(dest: &str, template_dir: &Path) -> PathBuf {
    let path = Path::new(dest);
    if path.is_absolute() {
        path.to_owned()
    } else {
        template_dir
            .parent()
            .unwrap_or(template_dir)
            .join("templates_output")
            .join(path)
    }
}

/// Guarantees the staged file is unlinked if anything between its creation
/// and `create_stage_file`'s successful return fails (§4.4.1 step 5, §9
/// "guaranteed release on every exit path"). `disarm` is called once
/// staging has fully succeeded, handing ownership of cleanup to `sync`.
struct StageGuard {
    path: PathBuf,
    armed: bool,
}

impl StageGuard {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_owned(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn stage_path_for(dest_dir: &Path, dest: &Path) -> PathBuf {
    let basename = dest
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stage".to_owned());
    let unique = std::process::id();
    dest_dir.join(format!(".{basename}.stage-{unique}"))
}

/// Two files are the same iff their contents, owner uid, owner gid and
/// mode all match. Contents are compared directly rather than by MD5
/// digest (a strictly stronger form of the same check).
fn same_config(staged: &Path, dest: &Path, expected_mode: u32, uid: u32, gid: u32) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let Ok(dest_meta) = std::fs::metadata(dest) else {
        return Ok(false);
    };

    if dest_meta.uid() != uid || dest_meta.gid() != gid {
        return Ok(false);
    }
    if dest_meta.permissions().mode() & 0o7777 != expected_mode {
        return Ok(false);
    }

    let staged_contents = std::fs::read(staged)?;
    let dest_contents = std::fs::read(dest)?;
    Ok(staged_contents == dest_contents)
}

fn is_device_or_resource_busy(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::EBUSY as i32)
}

/// Prints a unified diff of the pending change to stderr for `--noop` runs
/// (§4.4.1, §A.5). Missing destinations (first-run case) diff against an
/// empty string. Colorized when stderr is a terminal, matching the
/// teacher's `plan.rs::colorize_diff`.
fn log_diff(name: &str, staged: &Path, dest: &Path) {
    let old = std::fs::read_to_string(dest).unwrap_or_default();
    let new = match std::fs::read_to_string(staged) {
        Ok(new) => new,
        Err(e) => {
            log::warn!("{name}: could not read staged file for diff: {e}");
            return;
        }
    };

    let label = dest.to_string_lossy();
    let mut diff = TextDiff::from_lines(&old, &new)
        .unified_diff()
        .header(&label, &label)
        .to_string();

    if atty::is(atty::Stream::Stderr) {
        colorize_diff(&mut diff);
    }
    eprint!("{diff}");
}

fn colorize_diff(diff: &mut String) {
    let mut out = String::with_capacity(diff.len());
    for line in diff.lines() {
        let line = match line.chars().next() {
            Some('+') => line.green(),
            Some('-') => line.red(),
            Some('@') => line.yellow(),
            _ => line.clear(),
        };
        out.push_str(&format!("{line}\n"));
    }
    *diff = out;
}

/// Renders `{{.src}}`-style references in check commands. Shells out to the
/// full template engine would be overkill for single-variable substitution,
/// so this is a direct string replace, matching the narrow contract in §4.4.1.
fn render_mini_template(cmd: &str, ctx: &BTreeMap<String, String>) -> Result<String> {
    let mut rendered = cmd.to_owned();
    for (key, value) in ctx {
        rendered = rendered.replace(&format!("{{{{.{key}}}}}"), value);
    }
    Ok(rendered)
}

/// Runs `cmd` through the platform shell, capturing combined stdout+stderr.
/// `Ok(())` on exit 0; otherwise `Err((status, output))` (§4.4.3).
async fn run_command(cmd: &str) -> std::result::Result<(), (std::process::ExitStatus, String)> {
    let output = if cfg!(target_os = "windows") {
        tokio::process::Command::new("cmd").arg("/C").arg(cmd).output().await
    } else {
        tokio::process::Command::new("/bin/sh").arg("-c").arg(cmd).output().await
    };

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            log::error!("failed to spawn command {cmd:?}: {e}");
            return Err((std::process::ExitStatus::default(), e.to_string()));
        }
    };

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    log::debug!("command {cmd:?} output: {combined}");

    if output.status.success() {
        Ok(())
    } else {
        Err((output.status, combined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_dest_keeps_absolute_paths() {
        let template_dir = Path::new("/etc/tmpld/templates");
        assert_eq!(resolve_dest("/etc/nginx/nginx.conf", template_dir), Path::new("/etc/nginx/nginx.conf"));
    }

    #[test]
    fn resolve_dest_joins_relative_under_templates_output() {
        let template_dir = Path::new("/etc/tmpld/templates");
        assert_eq!(
            resolve_dest("nginx.conf", template_dir),
            Path::new("/etc/tmpld/templates_output/nginx.conf")
        );
    }

    #[test]
    fn render_mini_template_substitutes_src() {
        let mut ctx = BTreeMap::new();
        ctx.insert("src".to_owned(), "/tmp/staged".to_owned());
        let rendered = render_mini_template("nginx -t -c {{.src}}", &ctx).unwrap();
        assert_eq!(rendered, "nginx -t -c /tmp/staged");
    }

    #[test]
    fn same_config_false_when_dest_missing() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staged");
        std::fs::write(&staged, b"hello").unwrap();
        let dest = dir.path().join("missing");
        assert!(!same_config(&staged, &dest, 0o644, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn run_command_reports_failure_status() {
        let result = run_command("exit 7").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_command_succeeds_on_zero_exit() {
        let result = run_command("true").await;
        assert!(result.is_ok());
    }
}
