//! Lake demos
//!
//! Replays the lakehouse walkthroughs against an embedded catalog: atomic
//! rollback, time travel, schema evolution, small-write inlining and
//! catalog portability.

mod display;
mod portability;
mod rollback;
mod schema_evolution;
mod small_files;
mod time_travel;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use lake_core::LakeConfig;
use tracing_subscriber::{filter::EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "lake-demos", version, about = "Lakehouse catalog walkthroughs")]
struct Cli {
    /// TOML config applied to every demo lake
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// A failing multi-table transaction leaves every table unchanged
    Rollback,
    /// Query and restore earlier versions
    TimeTravel,
    /// Versioned DDL racing a background writer
    SchemaEvolution,
    /// Many tiny inserts, few physical files
    SmallFiles,
    /// The same workload on an in-memory and a file catalog
    Portability,
    /// Run every demo in order
    All,
}

fn get_env_filter() -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else if cfg!(debug_assertions) {
        EnvFilter::new("lake_core=debug,lake_demos=debug")
    } else {
        EnvFilter::new("lake_core=info,lake_demos=info")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(get_env_filter()).with_target(false).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => LakeConfig::load_from_path(path)?,
        None => LakeConfig::default(),
    };

    print_banner();

    let demos: &[Command] = match cli.command {
        Command::All => &[
            Command::Rollback,
            Command::TimeTravel,
            Command::SchemaEvolution,
            Command::SmallFiles,
            Command::Portability,
        ],
        _ => std::slice::from_ref(&cli.command),
    };

    for demo in demos {
        let result = match demo {
            Command::Rollback => rollback::run(&config),
            Command::TimeTravel => time_travel::run(&config),
            Command::SchemaEvolution => schema_evolution::run(&config).await,
            Command::SmallFiles => small_files::run(&config),
            Command::Portability => portability::run(&config),
            Command::All => unreachable!(),
        };
        if let Err(e) = result {
            eprintln!("{} {}", "Demo failed:".bright_red(), e);
            return Err(e);
        }
    }

    println!("\n{}", "All done".bright_green());
    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
    _          _
   | |    __ _| | _____
   | |   / _` | |/ / _ \
   | |__| (_| |   <  __/
   |_____\__,_|_|\_\___|
"#
        .bright_cyan()
    );
    println!("{}", "  Lakehouse catalog demos".bright_white());
}
