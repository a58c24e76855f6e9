//! taskdeck CLI - inspect and edit resolved settings.

use std::process;

use clap::Parser;
use taskdeck::cli::{Cli, Commands};
use taskdeck::commands::{self, Output};
use taskdeck::config::{self, ConfigPaths, SettingsProvider};
use taskdeck::logging;

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;

    logging::init_logging(cli.verbose);

    let provider = SettingsProvider::new(ConfigPaths::discover(cli.config_dir.as_deref()));
    let result =
        config::install(provider).and_then(|provider| run_command(cli.command, provider, human));

    if let Err(e) = result {
        if human {
            eprintln!("Error: {}", e);
        } else {
            eprintln!("{}", serde_json::json!({ "error": e.to_string() }));
        }
        process::exit(1);
    }
}

fn run_command(
    command: Commands,
    provider: &SettingsProvider,
    human: bool,
) -> Result<(), taskdeck::Error> {
    match command {
        Commands::Show { section } => output(&commands::show(provider, section)?, human),
        Commands::Get { key } => output(&commands::get(provider, &key)?, human),
        Commands::Set { key, value } => output(&commands::set(provider, &key, &value)?, human),
        Commands::Path => output(&commands::path(provider)?, human),
        Commands::Env => output(&commands::env(provider)?, human),
    }
    Ok(())
}

fn output<T: Output>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}
