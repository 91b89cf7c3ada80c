use std::path::PathBuf;

use thiserror::Error;

#[allow(clippy::enum_variant_names)]
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O Error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Config error: {0}")]
    ConfigInvalid(String),

    #[error("Figment error: {0}")]
    FigmentError(#[from] figment::Error),

    #[error("Argument error: {0}")]
    ClapError(#[from] clap::error::Error),

    #[error("TOML decode error: {0}")]
    TomlDecode(#[from] toml::de::Error),

    #[error("TOML encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("Templating error: {0:#}")]
    TemplateError(#[from] minijinja::Error),

    #[error("System error: {0}")]
    NixError(#[from] nix::errno::Errno),

    #[error("confdir {0:?} does not exist")]
    ConfDirMissing(PathBuf),

    #[error("descriptor {0:?} has an empty src")]
    EmptySrc(PathBuf),

    #[error("descriptor {0:?} could not be loaded: {1}")]
    DescriptorLoad(PathBuf, String),

    #[error("malformed glob pattern {0:?}: {1}")]
    BadPattern(String, globset::Error),

    #[error("key {0:?} does not exist")]
    NotExist(String),

    #[error("no keys match pattern {0:?}")]
    NoMatch(String),

    #[error("check command for {0:?} failed with status {1}: {2}")]
    CheckFailed(PathBuf, std::process::ExitStatus, String),

    #[error("reload command for {0:?} failed with status {1}: {2}")]
    ReloadFailed(PathBuf, std::process::ExitStatus, String),

    #[error("backend error: {0}")]
    BackendFailure(String),

    #[error("PGP decryption failed: {0}")]
    PgpDecrypt(String),

    #[error("the driver is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;
