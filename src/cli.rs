use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

#[derive(Parser, Debug)]
#[command(name = "pattern-store")]
#[command(version)]
#[command(about = "Inspect, migrate and prune a code-review pattern store")]
pub struct Args {
    /// TOML configuration file naming the backend and retention settings
    #[arg(long, short, conflicts_with_all = ["db", "redis"])]
    pub config: Option<PathBuf>,

    /// SQLite database file (shortcut for a sqlite config)
    #[arg(long, conflicts_with = "redis")]
    pub db: Option<PathBuf>,

    /// Redis URL (shortcut for a redis config)
    #[arg(long)]
    pub redis: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Report whether the configured backend is reachable
    Health,

    /// Print patterns, trends, fix rates and recommendations for a repository
    Insights {
        #[arg(long)]
        repo: String,
    },

    /// Write a repository snapshot as JSON (stdout when --out is absent)
    Export {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Replay the patterns of an export file into a repository
    Import {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        file: PathBuf,
    },

    /// Delete history older than --days and decay stale issue trends
    Cleanup {
        #[arg(long, default_value = "30")]
        days: u64,
    },
}

/// The default database file when no backend is given.
pub const DEFAULT_DB_PATH: &str = "pattern_store.db";

impl Args {
    /// Resolve the backend settings from `--config`, `--db` or `--redis`.
    pub fn store_config(&self) -> StoreResult<StoreConfig> {
        if let Some(path) = &self.config {
            return StoreConfig::load(path);
        }
        let config = match (&self.db, &self.redis) {
            (_, Some(url)) => StoreConfig::redis(url.clone()),
            (Some(path), None) => StoreConfig::sqlite(path.clone()),
            (None, None) => StoreConfig::sqlite(DEFAULT_DB_PATH),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Exit status for a failed command: 2 for caller mistakes, 1 otherwise.
pub fn exit_code(err: &StoreError) -> i32 {
    if err.is_validation() || matches!(err, StoreError::Config(_)) {
        2
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    #[test]
    fn test_defaults_to_local_sqlite() {
        let args = Args::try_parse_from(["pattern-store", "health"]).unwrap();
        let config = args.store_config().unwrap();
        match config.backend {
            BackendConfig::Sqlite(s) => assert_eq!(s.path, PathBuf::from(DEFAULT_DB_PATH)),
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_redis_flag_selects_redis() {
        let args =
            Args::try_parse_from(["pattern-store", "--redis", "redis://h:6379", "health"]).unwrap();
        assert_eq!(args.store_config().unwrap().backend.kind(), "redis");
    }

    #[test]
    fn test_db_and_redis_conflict() {
        let parsed = Args::try_parse_from([
            "pattern-store",
            "--db",
            "a.db",
            "--redis",
            "redis://h",
            "health",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_export_subcommand() {
        let args = Args::try_parse_from([
            "pattern-store",
            "export",
            "--repo",
            "/r",
            "--out",
            "snap.json",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            Command::Export { repo: "/r".into(), out: Some(PathBuf::from("snap.json")) }
        );
    }

    #[test]
    fn test_cleanup_default_days() {
        let args = Args::try_parse_from(["pattern-store", "cleanup"]).unwrap();
        assert_eq!(args.command, Command::Cleanup { days: 30 });
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&StoreError::invalid("x")), 2);
        assert_eq!(exit_code(&StoreError::Redis("down".into())), 1);
    }
}
