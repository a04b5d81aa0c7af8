use clap::Parser;
use dwsync_config::load_config;
use dwsync_config::shared::{ReplicationMode, ReplicatorConfig};

use crate::error::{ReplicatorError, ReplicatorResult};

/// Replicates TiDB tables into a cloud data warehouse through object storage.
#[derive(Debug, Parser)]
#[command(name = "dwsync-replicator", version, about)]
pub struct Args {
    /// Replication mode, overrides `replication.mode`.
    #[arg(long, value_parser = clap::value_parser!(ReplicationMode))]
    pub mode: Option<ReplicationMode>,

    /// Source table as `database.table`, overrides `replication.tables`. Repeatable.
    #[arg(long = "table", value_name = "DATABASE.TABLE")]
    pub tables: Vec<String>,
}

impl Args {
    /// Applies the command line overrides to `config`.
    pub fn apply(self, config: &mut ReplicatorConfig) {
        if let Some(mode) = self.mode {
            config.replication.mode = mode;
        }
        if !self.tables.is_empty() {
            config.replication.tables = self.tables;
        }
    }
}

/// Loads the configuration, applies the command line overrides and validates the result.
pub fn load_replicator_config(args: Args) -> ReplicatorResult<ReplicatorConfig> {
    let mut config = load_config::<ReplicatorConfig>().map_err(ReplicatorError::config)?;
    args.apply(&mut config);
    config.validate().map_err(ReplicatorError::config)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use dwsync_config::shared::WarehouseConfig;
    use dwsync_config::{Environment, LoadConfigError, load_config_from};

    use super::*;

    fn shipped_configuration() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("configuration")
    }

    #[test]
    fn parses_mode_and_repeated_tables() {
        let args = Args::try_parse_from([
            "dwsync-replicator",
            "--mode",
            "incremental-only",
            "--table",
            "db1.orders",
            "--table",
            "db1.customers",
        ])
        .unwrap();

        assert_eq!(args.mode, Some(ReplicationMode::IncrementalOnly));
        assert_eq!(args.tables, vec!["db1.orders", "db1.customers"]);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Args::try_parse_from(["dwsync-replicator", "--mode", "snapshot"]).is_err());
    }

    #[test]
    fn dev_configuration_selects_the_memory_warehouse() {
        let config =
            load_config_from::<ReplicatorConfig>(&shipped_configuration(), Environment::Dev)
                .unwrap();
        assert!(matches!(config.warehouse, WarehouseConfig::Memory));
    }

    #[test]
    fn prod_configuration_requires_an_explicit_warehouse() {
        let err = load_config_from::<ReplicatorConfig>(&shipped_configuration(), Environment::Prod)
            .unwrap_err();

        match err {
            LoadConfigError::Deserialization(source) => {
                assert!(source.to_string().contains("warehouse"), "{source}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
