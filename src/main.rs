use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Arg, ArgAction, Command};

use homeworq::{Config, Engine, Settings, TaskRegistry};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const EXAMPLE_CONFIG: &str = r#"# Homeworq configuration.
#
# `hq run` reconciles the jobs below on every startup: equal {task, params}
# map onto the same job row, so editing a schedule updates the job in place.

[settings]
api_on = true
api_host = "localhost"
api_port = 8000
# api_auth = true  # credentials from HQ_ADMIN_USERNAME / HQ_ADMIN_PASSWORD
debug = false
db_uri = "sqlite://homeworq.db"

[[jobs]]
task = "ping"
schedule = { interval = 1, unit = "days", at = "08:00" }

[jobs.params]
url = "https://example.com"

[jobs.options]
timeout = 30
max_retries = 3
"#;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let matches = Command::new("hq")
        .version(VERSION)
        .about("Homeworq: a periodic job scheduler with an HTTP control plane")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("run")
                .about("Start the scheduler")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("PATH")
                        .help("Path to the configuration file")
                        .default_value("homeworq.toml"),
                )
                .arg(
                    Arg::new("serve")
                        .short('s')
                        .long("serve")
                        .action(ArgAction::SetTrue)
                        .help("Enable the HTTP API regardless of the config file"),
                ),
        )
        .subcommand(
            Command::new("init")
                .about("Write an example configuration file")
                .arg(
                    Arg::new("path")
                        .short('p')
                        .long("path")
                        .value_name("DIR")
                        .help("Directory to initialize")
                        .default_value("."),
                ),
        )
        .get_matches();

    let result = match matches.subcommand() {
        Some(("run", sub)) => run(sub).await,
        Some(("init", sub)) => init(sub),
        _ => unreachable!("subcommand is required"),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let config_path = PathBuf::from(
        matches
            .get_one::<String>("config")
            .expect("config has a default"),
    );
    let config = Config::load(&config_path)?;

    let mut settings = config.settings;
    if matches.get_flag("serve") {
        settings.api_on = true;
    }

    init_tracing(&settings)?;
    tracing::info!(
        "starting homeworq (config: {}, api: {}, jobs: {})",
        config_path.display(),
        if settings.api_on { "on" } else { "off" },
        config.jobs.len()
    );

    let mut registry = TaskRegistry::new();
    homeworq::tasks::register_builtin(&mut registry)?;

    let engine = Arc::new(Engine::new(settings, registry, config.jobs)?);
    engine.run().await?;
    Ok(())
}

fn init(matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let dir = PathBuf::from(matches.get_one::<String>("path").expect("path has a default"));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let config_path = dir.join("homeworq.toml");
    if config_path.exists() {
        anyhow::bail!(
            "configuration file already exists: {}",
            config_path.display()
        );
    }
    std::fs::write(&config_path, EXAMPLE_CONFIG)
        .with_context(|| format!("failed to write {}", config_path.display()))?;

    println!("Created {}", config_path.display());
    println!("Edit it, then start the scheduler with: hq run --serve");
    Ok(())
}

fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
    let level = if settings.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    match &settings.log_path {
        Some(path) => {
            let file = open_log_file(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

fn open_log_file(path: &Path) -> anyhow::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}
