use clap::Parser;
use serde::Serialize;
use tracing::error;
use tracing_subscriber::EnvFilter;

use pattern_store::cli::{exit_code, Args, Command};
use pattern_store::{PatternStore, StoreResult};

fn print_json<T: Serialize>(value: &T) -> StoreResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(args: Args) -> StoreResult<bool> {
    let config = args.store_config()?;
    let store = PatternStore::open(&config)?;
    match args.command {
        Command::Health => {
            let status = store.health_check();
            print_json(&status)?;
            Ok(status.healthy)
        }
        Command::Insights { repo } => {
            print_json(&store.get_comprehensive_insights(&repo))?;
            Ok(true)
        }
        Command::Export { repo, out } => {
            let document = store.export_patterns(&repo, out.as_deref())?;
            if out.is_none() {
                print_json(&document)?;
            }
            Ok(true)
        }
        Command::Import { repo, file } => {
            let imported = store.import_patterns(&repo, &file)?;
            print_json(&serde_json::json!({ "repo_path": repo, "imported": imported }))?;
            Ok(true)
        }
        Command::Cleanup { days } => {
            print_json(&store.cleanup_old_data(days)?)?;
            Ok(true)
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!(error = %e, "command failed");
            std::process::exit(exit_code(&e));
        }
    }
}
