use anyhow::Result;
use clap::{CommandFactory, Parser};
use voxcompose::app::{RefineOptions, run_refine_command};
use voxcompose::cli::{Cli, Commands, ConfigAction};
use voxcompose::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    voxcompose::logging::init(cli.verbose, cli.quiet);
    tracing::debug!(version = %voxcompose::version_string(), "voxcompose starting");

    match cli.command {
        None => {
            let mut config = load_config(cli.config.as_deref())?;
            cli.apply_overrides(&mut config)?;
            run_refine_command(
                config,
                RefineOptions {
                    input: cli.input,
                    out: cli.out,
                    sidecar: cli.sidecar,
                    run_timeout: cli.run_timeout,
                },
            )
            .await?;
        }
        Some(Commands::Config { action }) => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "voxcompose",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/voxcompose/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&std::path::Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        // Load from custom path
        Config::load(path)?
    } else {
        // Try default path, fall back to defaults
        Config::load_or_default(&Config::default_path())?
    };

    // Apply environment variable overrides
    Ok(config.with_env_overrides())
}

/// Handle configuration commands.
fn handle_config_command(
    action: ConfigAction,
    custom_path: Option<&std::path::Path>,
) -> Result<()> {
    let config_path = custom_path
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Config::default_path);

    match action {
        ConfigAction::Get { key } => {
            let config = Config::load_or_default(&config_path)?.with_env_overrides();
            match config.get_value_by_path(&key) {
                Ok(value) => println!("{}", value),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        ConfigAction::Set { key, value } => {
            Config::set_value_by_path(&config_path, &key, &value)?;
            println!("Set {} = {}", key, value);
        }
        ConfigAction::List { key } => {
            let config = Config::load_or_default(&config_path)?.with_env_overrides();
            match key.as_deref() {
                // Show a specific config section
                Some(section) => match config.display_section(section) {
                    Ok(toml) => println!("{}", toml),
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        std::process::exit(1);
                    }
                },
                // Show full config
                None => print!("{}", config.to_display_toml()?),
            }
        }
        ConfigAction::Dump => {
            print!("{}", Config::dump_template());
        }
        ConfigAction::Path => {
            println!("{}", config_path.display());
        }
    }
    Ok(())
}
