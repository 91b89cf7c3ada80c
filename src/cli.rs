//! Command-line dispatcher (out of scope per §1, built as ambient glue).
//!
//! A hand-built `clap::Command` in the teacher's style — `Arg::new` chains
//! and `indoc!` long-help blocks rather than the derive macros — translating
//! flags into the engine's own types (`EngineConfig`, `Options`, the chosen
//! `Client` backend) rather than parsing directly into them.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{value_parser, Arg, ArgAction, Command, ValueHint};
use clap_complete::{generate, Generator, Shell};
use indoc::indoc;

use crate::backend::{Client, EnvBackend, FileBackend};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::options::Options;

pub struct Cli {
    matches: clap::ArgMatches,
}

impl Cli {
    pub fn new() -> Result<Self> {
        let matches = command().try_get_matches_from(std::env::args_os())?;
        Ok(Self { matches })
    }

    #[cfg(test)]
    pub(crate) fn new_from<I, T>(itr: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = command().try_get_matches_from(itr)?;
        Ok(Self { matches })
    }

    /// Generates shell completions and exits, if `--print-shell-completions`
    /// was given. Must be checked before any other flag is acted on.
    pub fn generate_shell_completions(&self) {
        if let Some(generator) = self
            .matches
            .get_one::<Shell>("print-shell-completions")
            .copied()
        {
            let mut cmd = command();
            log::info!("generating completions for {generator}");
            print_completions(generator, &mut cmd);
            std::process::exit(0);
        }
    }

    /// `-v`/`-q` counters, folded into a single `log::LevelFilter`, same
    /// scheme the teacher uses: each `-v` climbs one level past `Info`,
    /// each `-q` drops one level below it.
    pub fn verbosity(&self) -> log::LevelFilter {
        let verbose = self.matches.get_count("verbose") as i16;
        let quiet = self.matches.get_count("quiet") as i16;

        match verbose - quiet {
            i if i <= -2 => log::LevelFilter::Off,
            -1 => log::LevelFilter::Error,
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }

    /// Resolves the Engine Configuration (C8, §3.1/§6.3): `--config` loads
    /// and layers a TOML file through [`EngineConfig::load`], then any
    /// explicitly-given flag overrides the loaded (or default) value.
    /// Without `--config`, `--confdir` is required and the rest of the
    /// config is built up from flags alone.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match self.matches.get_one::<PathBuf>("config") {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig {
                conf_dir: PathBuf::new(),
                prefix: String::new(),
                interval_seconds: 0,
                noop: false,
                sync_only: false,
                keep_stage_file: false,
                pgp_private_key_path: None,
                ignored: Vec::new(),
                log_level: None,
                watch: false,
                file: None,
            },
        };

        if let Some(confdir) = self.matches.get_one::<PathBuf>("confdir") {
            config.conf_dir = confdir.clone();
        }
        if !config.conf_dir.is_absolute() {
            let cwd = std::env::current_dir()?;
            config.conf_dir = cwd.join(&config.conf_dir);
        }

        if let Some(prefix) = self.matches.get_one::<String>("prefix") {
            config.prefix = prefix.clone();
        }
        if let Some(interval) = self.matches.get_one::<u64>("interval") {
            config.interval_seconds = *interval;
        }
        if self.matches.get_flag("noop") {
            config.noop = true;
        }
        if self.matches.get_flag("sync-only") {
            config.sync_only = true;
        }
        if self.matches.get_flag("keep-stage-file") {
            config.keep_stage_file = true;
        }
        if let Some(key) = self.matches.get_one::<PathBuf>("pgp-private-key") {
            config.pgp_private_key_path = Some(key.clone());
        }
        if self.matches.get_flag("watch") {
            config.watch = true;
        }
        if let Some(ignored) = self.matches.get_many::<String>("ignore") {
            config.ignored = ignored.cloned().collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Translates mode/interval flags into a driver [`Options`] (§4.6),
    /// folding in the engine config file's own `watch`/`interval` fields
    /// (§6.3) as fallbacks so a config-file-only setup (no CLI flags)
    /// still picks watch mode and a non-default interval correctly.
    /// `--onetime` and `--watch` are not mutually exclusive on the command
    /// line — §4.5.1's precedence order, already implemented by
    /// `Options::mode`, decides the winner if both are given.
    pub fn options(&self, config: &EngineConfig) -> Options {
        let mut options = Options::new();

        if self.matches.get_flag("onetime") {
            options = options.onetime_mode();
        }
        if self.matches.get_flag("watch") || config.watch {
            options = options.watch_mode();
        }

        if let Some(interval) = self.matches.get_one::<u64>("interval") {
            options = options.interval(std::time::Duration::from_secs(*interval));
        } else if config.interval_seconds > 0 {
            options = options.interval(std::time::Duration::from_secs(config.interval_seconds));
        }

        options
    }

    /// Instantiates the backend selected with `--backend` (§4.3, §A.9).
    /// `--backend-file` is required by clap whenever `--backend=file` is
    /// given, so `file` can assume the path is present.
    pub fn backend(&self) -> Result<Arc<dyn Client>> {
        match self
            .matches
            .get_one::<String>("backend")
            .map(String::as_str)
            .unwrap_or("env")
        {
            "file" => {
                let path = self
                    .matches
                    .get_one::<PathBuf>("backend-file")
                    .expect("clap requires --backend-file when --backend=file");
                Ok(Arc::new(FileBackend::new(path)))
            }
            _ => Ok(Arc::new(EnvBackend::new())),
        }
    }
}

fn print_completions<G: Generator>(gen: G, cmd: &mut Command) {
    generate(gen, cmd, cmd.get_name().to_string(), &mut std::io::stdout());
}

fn command() -> Command {
    Command::new("tmpld")
        .about("A configuration template supervisor: keeps config files in sync with a key-value store")
        .author("tmpld contributors")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("PATH")
                .value_hint(ValueHint::FilePath)
                .value_parser(value_parser!(PathBuf))
                .help("Engine configuration file (TOML)")
                .long_help(indoc! {
                    "Load engine configuration from PATH (§6.3).

                    Relative `confdir`/`file`/`pgp-private-key` entries in the config file are
                    resolved against the directory containing PATH. Any of the flags below,
                    when given explicitly, override the corresponding value loaded from PATH."
                }),
        )
        .arg(
            Arg::new("confdir")
                .long("confdir")
                .value_name("PATH")
                .value_hint(ValueHint::DirPath)
                .value_parser(value_parser!(PathBuf))
                .required_unless_present("config")
                .help("Root directory containing conf.d/ and templates/"),
        )
        .arg(
            Arg::new("prefix")
                .long("prefix")
                .value_name("PREFIX")
                .help("Prefix prepended to every relative key before querying the backend"),
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .value_name("SECONDS")
                .value_parser(value_parser!(u64))
                .help("Polling interval used in interval mode (default 600s)"),
        )
        .arg(
            Arg::new("onetime")
                .long("onetime")
                .action(ArgAction::SetTrue)
                .help("Process every resource once, then exit"),
        )
        .arg(
            Arg::new("watch")
                .long("watch")
                .short('w')
                .action(ArgAction::SetTrue)
                .help("Re-render resources as soon as the backend reports a change")
                .long_help(indoc! {
                    "Re-render resources as soon as the backend reports a change (§4.5.4).

                    Without --onetime or --watch, the mode is chosen from the backend's own
                    watch_enabled() capability: watch if it supports push notification,
                    interval otherwise (§4.5.1)."
                }),
        )
        .arg(
            Arg::new("noop")
                .long("noop")
                .visible_alias("dry-run")
                .action(ArgAction::SetTrue)
                .help("Render and compare but never swap the destination file in"),
        )
        .arg(
            Arg::new("sync-only")
                .long("sync-only")
                .action(ArgAction::SetTrue)
                .help("Skip check_cmd/reload_cmd even when a resource defines them"),
        )
        .arg(
            Arg::new("keep-stage-file")
                .long("keep-stage-file")
                .action(ArgAction::SetTrue)
                .help("Keep the staged candidate file instead of deleting it after each pass"),
        )
        .arg(
            Arg::new("ignore")
                .long("ignore")
                .value_name("BASENAME")
                .action(ArgAction::Append)
                .help("Descriptor basename to skip; can be given multiple times"),
        )
        .arg(
            Arg::new("pgp-private-key")
                .long("pgp-private-key")
                .value_name("PATH")
                .value_hint(ValueHint::FilePath)
                .value_parser(value_parser!(PathBuf))
                .help("PGP private key enabling cget/cgets/cgetv/cgetvs template functions"),
        )
        .arg(
            Arg::new("backend")
                .long("backend")
                .value_name("NAME")
                .value_parser(["env", "file"])
                .default_value("env")
                .help("Backend Client implementation to drive the engine with"),
        )
        .arg(
            Arg::new("backend-file")
                .long("backend-file")
                .value_name("PATH")
                .value_hint(ValueHint::FilePath)
                .value_parser(value_parser!(PathBuf))
                .required_if_eq("backend", "file")
                .help("TOML file backing the `file` backend"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Overrides the -v/-q derived log level (e.g. debug, warn)"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("Increase verbosity. Can be specified multiple times.")
                .conflicts_with("quiet"),
        )
        .arg(
            Arg::new("quiet")
                .long("quiet")
                .short('q')
                .action(ArgAction::Count)
                .help("Suppress verbose output. Can be specified multiple times.")
                .conflicts_with("verbose"),
        )
        .arg(
            Arg::new("print-shell-completions")
                .long("print-shell-completions")
                .action(ArgAction::Set)
                .value_name("SHELL")
                .exclusive(true)
                .value_parser(value_parser!(Shell))
                .help("Print shell completions and exit"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confdir_is_required_without_config() {
        assert!(Cli::new_from(vec!["tmpld"]).is_err());
    }

    #[test]
    fn confdir_flag_is_sufficient() {
        let cli = Cli::new_from(vec!["tmpld", "--confdir", "/tmp/confdir"]).unwrap();
        assert!(cli.matches.contains_id("confdir"));
    }

    #[test]
    fn verbosity_scheme() {
        let cli = Cli::new_from(vec!["tmpld", "--confdir", "/tmp/x"]).unwrap();
        assert_eq!(cli.verbosity(), log::LevelFilter::Info);

        let cli = Cli::new_from(vec!["tmpld", "--confdir", "/tmp/x", "-v"]).unwrap();
        assert_eq!(cli.verbosity(), log::LevelFilter::Debug);

        let cli = Cli::new_from(vec!["tmpld", "--confdir", "/tmp/x", "-vv"]).unwrap();
        assert_eq!(cli.verbosity(), log::LevelFilter::Trace);

        let cli = Cli::new_from(vec!["tmpld", "--confdir", "/tmp/x", "-q"]).unwrap();
        assert_eq!(cli.verbosity(), log::LevelFilter::Error);

        let cli = Cli::new_from(vec!["tmpld", "--confdir", "/tmp/x", "-qq"]).unwrap();
        assert_eq!(cli.verbosity(), log::LevelFilter::Off);
    }

    fn bare_config(conf_dir: PathBuf) -> EngineConfig {
        EngineConfig {
            conf_dir,
            prefix: String::new(),
            interval_seconds: 0,
            noop: false,
            sync_only: false,
            keep_stage_file: false,
            pgp_private_key_path: None,
            ignored: Vec::new(),
            log_level: None,
            watch: false,
            file: None,
        }
    }

    #[test]
    fn mode_flags_translate_to_options() {
        let config = bare_config(PathBuf::from("/tmp/x"));

        let cli = Cli::new_from(vec!["tmpld", "--confdir", "/tmp/x", "--onetime"]).unwrap();
        assert_eq!(cli.options(&config).mode(), crate::options::Mode::Onetime);

        let cli = Cli::new_from(vec!["tmpld", "--confdir", "/tmp/x", "--watch"]).unwrap();
        assert_eq!(cli.options(&config).mode(), crate::options::Mode::Watch);

        let cli = Cli::new_from(vec!["tmpld", "--confdir", "/tmp/x"]).unwrap();
        assert_eq!(cli.options(&config).mode(), crate::options::Mode::Unset);
    }

    #[test]
    fn config_file_watch_flag_selects_watch_mode_without_cli_flag() {
        let mut config = bare_config(PathBuf::from("/tmp/x"));
        config.watch = true;

        let cli = Cli::new_from(vec!["tmpld", "--confdir", "/tmp/x"]).unwrap();
        assert_eq!(cli.options(&config).mode(), crate::options::Mode::Watch);
    }

    #[test]
    fn config_file_interval_is_used_when_no_cli_interval_given() {
        let mut config = bare_config(PathBuf::from("/tmp/x"));
        config.interval_seconds = 30;

        let cli = Cli::new_from(vec!["tmpld", "--confdir", "/tmp/x"]).unwrap();
        assert_eq!(
            cli.options(&config).resolved_interval(),
            std::time::Duration::from_secs(30)
        );
    }

    #[test]
    fn backend_file_requires_backend_file_path() {
        assert!(Cli::new_from(vec!["tmpld", "--confdir", "/tmp/x", "--backend", "file"]).is_err());
        assert!(Cli::new_from(vec![
            "tmpld",
            "--confdir",
            "/tmp/x",
            "--backend",
            "file",
            "--backend-file",
            "/tmp/x/data.toml"
        ])
        .is_ok());
    }

    #[test]
    fn backend_defaults_to_env() {
        let cli = Cli::new_from(vec!["tmpld", "--confdir", "/tmp/x"]).unwrap();
        let backend = cli.backend().unwrap();
        assert!(!backend.watch_enabled());
    }

    #[test]
    fn engine_config_requires_existing_confdir() {
        let cli = Cli::new_from(vec!["tmpld", "--confdir", "/does/not/exist"]).unwrap();
        assert!(cli.engine_config().is_err());
    }

    #[test]
    fn engine_config_applies_flag_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("conf.d")).unwrap();
        let confdir = dir.path().to_str().unwrap();

        let cli = Cli::new_from(vec![
            "tmpld",
            "--confdir",
            confdir,
            "--prefix",
            "app",
            "--noop",
            "--sync-only",
        ])
        .unwrap();

        let config = cli.engine_config().unwrap();
        assert_eq!(config.normalized_prefix(), "/app");
        assert!(config.noop);
        assert!(config.sync_only);
    }
}
