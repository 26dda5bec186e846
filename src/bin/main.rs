//! reportage CLI - inspect and maintain the report cache
//!
//! Usage:
//!   reportage cache list [--json]
//!   reportage cache kill <report> [instance]
//!   reportage cache purge
//!   reportage config
//!
//! Examples:
//!   reportage cache kill revenue_report
//!   RUST_LOG=reportage=debug reportage cache purge

use clap::{Parser, Subcommand};
use reportage::cache::{LocalCache, ReportCache};
use reportage::config::Settings;
use reportage::logging;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "reportage")]
#[command(about = "reportage - merge row sources into cached, paged reports")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or clear the local report cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Print the effective settings as TOML
    Config,
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached report instances
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Remove a report's cached instances
    Kill {
        /// Report code name
        report: String,

        /// Instance id (removes every instance of the report if omitted)
        instance: Option<String>,
    },

    /// Remove expired instances
    Purge,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.logging.filter);

    match cli.command {
        Commands::Cache { action } => cmd_cache(&settings, action),
        Commands::Config => cmd_config(&settings),
    }
}

fn cmd_cache(settings: &Settings, action: CacheAction) -> ExitCode {
    let cache = match settings.cache.open_local() {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("Error opening cache: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match action {
        CacheAction::List { json } => list_instances(&cache, json),
        CacheAction::Kill { report, instance } => match instance {
            Some(instance) => cache.kill_instance_cache(&report, &instance),
            None => cache.kill_report_cache(&report),
        },
        CacheAction::Purge => cache.purge_expired().map(|count| {
            println!("Purged {} expired instance(s)", count);
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Cache error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn list_instances(cache: &LocalCache, json: bool) -> reportage::cache::CacheResult<()> {
    let instances = cache.list_instances()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!("No cached instances.");
        return Ok(());
    }

    println!(
        "{:<32} {:<40} {:>8} {:<9} EXPIRES",
        "REPORT", "INSTANCE", "ROWS", "STATE"
    );
    for info in instances {
        let state = if info.finished { "finished" } else { "running" };
        println!(
            "{:<32} {:<40} {:>8} {:<9} {}",
            info.report_id,
            info.instance_id,
            info.row_count,
            state,
            info.expires.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn cmd_config(settings: &Settings) -> ExitCode {
    match toml::to_string_pretty(settings) {
        Ok(text) => {
            print!("{}", text);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error serializing settings: {}", e);
            ExitCode::FAILURE
        }
    }
}
