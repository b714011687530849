//! slidepipe CLI
//!
//! Headless front end for the watch folder slide converter.

mod commands;
mod config;
mod error;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use config::SettingsArgs;

#[derive(Parser)]
#[command(name = "slidepipe")]
#[command(version, about = "Convert whole-slide images dropped into a folder into tiled pyramids", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch a folder and convert every stable slide that appears
    Watch {
        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Convert the given slides and exit
    Convert {
        /// Slide files to convert
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,

        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Write a settings file with default values
    InitConfig {
        /// Target file (defaults to the per-user config directory)
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(error::report(&e)),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Watch { settings } => {
            logging::init_logging(settings.log_dir.as_deref())?;
            commands::watch(&settings).await
        }
        Command::Convert { files, settings } => {
            logging::init_logging(settings.log_dir.as_deref())?;
            commands::convert(&files, &settings).await
        }
        Command::InitConfig { path } => {
            let written = commands::init_config(path)?;
            println!("Wrote default settings to {}", written.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_convert_with_overrides() {
        let cli = Cli::try_parse_from([
            "slidepipe",
            "convert",
            "a.svs",
            "b.ndpi",
            "--max-concurrency",
            "4",
            "--json-events",
        ])
        .unwrap();

        match cli.command {
            Command::Convert { files, settings } => {
                assert_eq!(files, vec![PathBuf::from("a.svs"), PathBuf::from("b.ndpi")]);
                assert_eq!(settings.max_concurrency, Some(4));
                assert!(settings.json_events);
            }
            _ => panic!("expected convert"),
        }
    }

    #[test]
    fn test_convert_requires_files() {
        assert!(Cli::try_parse_from(["slidepipe", "convert"]).is_err());
    }
}
