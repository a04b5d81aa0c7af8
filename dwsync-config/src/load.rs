use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use rust_cli_config::builder::{ConfigBuilder, DefaultState};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory holding the configuration layers, relative to the working directory.
const CONFIGURATION_DIR: &str = "configuration";

const EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Prefix of override variables, e.g. `APP_REPLICATION__MODE`.
const ENV_PREFIX: &str = "APP";

const ENV_PREFIX_SEPARATOR: &str = "_";

const ENV_NESTING_SEPARATOR: &str = "__";

const ENV_LIST_SEPARATOR: &str = ",";

/// Implemented by top-level configuration structures.
pub trait Config {
    /// Keys whose override variables hold comma-separated lists, e.g. `replication.tables`.
    const LIST_PARSE_KEYS: &'static [&'static str];
}

/// A file layer of the configuration.
#[derive(Debug, Clone, Copy)]
enum Layer {
    Base,
    Environment(Environment),
}

impl Layer {
    fn file_stem(&self) -> &'static str {
        match self {
            Layer::Base => "base",
            Layer::Environment(environment) => environment.as_str(),
        }
    }

    /// Path of the first existing file of this layer in `directory`.
    fn locate(self, directory: &Path) -> Result<PathBuf, LoadConfigError> {
        let candidates: Vec<PathBuf> = EXTENSIONS
            .iter()
            .map(|extension| directory.join(format!("{}.{extension}", self.file_stem())))
            .collect();

        if let Some(path) = candidates.iter().find(|path| path.is_file()) {
            return Ok(path.clone());
        }

        Err(LoadConfigError::LayerMissing {
            layer: self.to_string(),
            directory: directory.to_path_buf(),
            attempted: candidates
                .iter()
                .map(|path| format!("`{}`", path.display()))
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Base => f.write_str("base configuration"),
            Layer::Environment(environment) => write!(f, "{environment} configuration"),
        }
    }
}

/// Errors raised while loading the configuration.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the working directory: {0}")]
    WorkingDirectory(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    DirectoryMissing(PathBuf),

    #[error("no {layer} found in `{directory}`, tried {attempted}")]
    LayerMissing {
        layer: String,
        directory: PathBuf,
        attempted: String,
    },

    #[error("{layer} at `{path}` is invalid: {source}")]
    LayerInvalid {
        layer: String,
        path: PathBuf,
        source: rust_cli_config::ConfigError,
    },

    #[error("failed to apply environment overrides: {0}")]
    Overrides(#[source] rust_cli_config::ConfigError),

    #[error("configuration does not match the expected structure: {0}")]
    Deserialization(#[source] rust_cli_config::ConfigError),

    #[error("failed to determine the runtime environment: {0}")]
    Environment(#[from] io::Error),
}

/// Loads configuration from `./configuration` for the environment in `APP_ENVIRONMENT`.
///
/// Layers, later ones winning: `base.(yaml|yml|json)`, `{environment}.(yaml|yml|json)` and
/// `APP_`-prefixed variables with `__` between nested keys (`APP_SOURCE__HOST`).
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let working_directory = std::env::current_dir().map_err(LoadConfigError::WorkingDirectory)?;
    let environment = Environment::load()?;

    load_config_from(&working_directory.join(CONFIGURATION_DIR), environment)
}

/// Loads configuration from an explicit directory and environment.
pub fn load_config_from<T>(directory: &Path, environment: Environment) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    if !directory.is_dir() {
        return Err(LoadConfigError::DirectoryMissing(directory.to_path_buf()));
    }

    let mut builder = rust_cli_config::Config::builder();
    for layer in [Layer::Base, Layer::Environment(environment)] {
        let path = layer.locate(directory)?;
        builder = builder.add_source(rust_cli_config::File::from(path.as_path()));
        check_layer(&builder, layer, &path)?;
    }

    builder
        .add_source(environment_overrides::<T>())
        .build()
        .map_err(LoadConfigError::Overrides)?
        .try_deserialize::<T>()
        .map_err(LoadConfigError::Deserialization)
}

fn environment_overrides<T: Config>() -> rust_cli_config::Environment {
    let overrides = rust_cli_config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_NESTING_SEPARATOR);

    if T::LIST_PARSE_KEYS.is_empty() {
        return overrides;
    }

    T::LIST_PARSE_KEYS.iter().fold(
        overrides
            .try_parsing(true)
            .list_separator(ENV_LIST_SEPARATOR),
        |overrides, key| overrides.with_list_parse_key(key),
    )
}

/// Builds the layers added so far so a broken file is reported with its own path.
fn check_layer(
    builder: &ConfigBuilder<DefaultState>,
    layer: Layer,
    path: &Path,
) -> Result<(), LoadConfigError> {
    match builder.clone().build() {
        Ok(_) => Ok(()),
        Err(source) => Err(LoadConfigError::LayerInvalid {
            layer: layer.to_string(),
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;

    use super::*;

    static DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Deserialize)]
    struct Sample {
        name: String,
        workers: u16,
    }

    impl Config for Sample {
        const LIST_PARSE_KEYS: &'static [&'static str] = &[];
    }

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "dwsync-config-{}-{}",
            std::process::id(),
            DIR_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn environment_layer_overrides_base() {
        let dir = scratch_dir();
        fs::write(dir.join("base.yaml"), "name: base\nworkers: 2\n").unwrap();
        fs::write(dir.join("prod.yaml"), "workers: 16\n").unwrap();

        let sample: Sample = load_config_from(&dir, Environment::Prod).unwrap();

        assert_eq!(sample.name, "base");
        assert_eq!(sample.workers, 16);
    }

    #[test]
    fn missing_environment_layer_lists_attempted_paths() {
        let dir = scratch_dir();
        fs::write(dir.join("base.json"), r#"{"name": "x", "workers": 1}"#).unwrap();

        let err = load_config_from::<Sample>(&dir, Environment::Dev).unwrap_err();

        match err {
            LoadConfigError::LayerMissing { attempted, .. } => {
                assert!(attempted.contains("dev.yaml"));
                assert!(attempted.contains("dev.json"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn broken_layer_is_reported_with_its_path() {
        let dir = scratch_dir();
        fs::write(dir.join("base.yaml"), "name: [unterminated\n").unwrap();
        fs::write(dir.join("dev.yaml"), "workers: 1\n").unwrap();

        let err = load_config_from::<Sample>(&dir, Environment::Dev).unwrap_err();

        match err {
            LoadConfigError::LayerInvalid { path, .. } => assert!(path.ends_with("base.yaml")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = std::env::temp_dir().join("dwsync-config-does-not-exist");
        let err = load_config_from::<Sample>(&dir, Environment::Dev).unwrap_err();
        assert!(matches!(err, LoadConfigError::DirectoryMissing(_)));
    }
}
