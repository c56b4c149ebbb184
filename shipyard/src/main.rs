//! Shipyard - Entry Point
//!
//! Runs the deployment daemon, or talks to a running one when given a client
//! action (`--deploy`, `--list`, `--status`, `--logs`, `--undeploy`).

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;
use std::time::Duration;

use colored::Colorize;
use tracing::{error, info};

use shipyard::app::options::AppOptions;
use shipyard::app::run::run;
use shipyard::deploy::bundle::DeployMode;
use shipyard::errors::ShipyardError;
use shipyard::filesys::file::File;
use shipyard::http::client::ShipyardClient;
use shipyard::logs::{init_logging, LogLevel, LogOptions};
use shipyard::storage::layout::StorageLayout;
use shipyard::storage::settings::Settings;
use shipyard::utils::version_info;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(900);

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let mut cli_args: HashMap<String, String> = HashMap::new();
    for arg in env::args().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{json}"),
            Err(_) => println!("{}", version.version),
        }
        return ExitCode::SUCCESS;
    }

    let is_client = ["deploy", "list", "status", "logs", "undeploy"]
        .iter()
        .any(|action| cli_args.contains_key(*action));
    if is_client {
        return match run_client(&cli_args).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{} {}", "error:".red().bold(), e);
                ExitCode::FAILURE
            }
        };
    }

    // Run the daemon starting here

    let layout = StorageLayout::from_env();
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(path),
        None => layout.settings_file(),
    };
    let mut settings = match Settings::load(&settings_file).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to load settings: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = cli_args.get("port") {
        match port.parse() {
            Ok(port) => settings.api.port = port,
            Err(_) => {
                eprintln!("Invalid --port value: {port}");
                return ExitCode::FAILURE;
            }
        }
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: Some(layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = AppOptions::from_settings(&settings, layout);
    info!("Running shipyard with options: {:?}", options);
    match run(version.version, options, await_shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to run shipyard: {e}");
            ExitCode::FAILURE
        }
    }
}

// ================================== CLIENT ======================================= //

async fn run_client(cli_args: &HashMap<String, String>) -> Result<(), ShipyardError> {
    let log_options = LogOptions {
        log_level: LogLevel::Warn,
        ..Default::default()
    };
    let _ = init_logging(log_options);

    let server = cli_args
        .get("server")
        .cloned()
        .unwrap_or_else(|| "http://127.0.0.1:8001".to_string());
    let client = ShipyardClient::new(&server, CLIENT_TIMEOUT)?;

    if let Some(path) = cli_args.get("deploy") {
        let mode = cli_args
            .get("mode")
            .map(|m| m.parse::<DeployMode>())
            .transpose()
            .map_err(ShipyardError::ConfigError)?;
        let archive = tokio::fs::read(path).await?;
        println!("{} {} ...", "Deploying".cyan(), path);

        let deployed = client.deploy_zip(archive, mode).await?;
        println!("{} {}", "Deployed".green().bold(), deployed.id);
        println!("  url:    {}", deployed.public_url.underline());
        println!("  port:   {}", deployed.port);
        println!("  status: {}", deployed.status.to_string().green());
    } else if cli_args.contains_key("list") {
        let list = client.list().await?;
        if list.deployments.is_empty() {
            println!("No deployments");
        }
        for record in list.deployments {
            println!(
                "{}  {:<12} {:<10} {:>5}  {}",
                record.id,
                record.status.to_string().bold(),
                record.mode.to_string(),
                record.port,
                record.public_url.unwrap_or_else(|| "-".to_string())
            );
        }
    } else if let Some(id) = cli_args.get("status") {
        let record = client.status(id).await?;
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else if let Some(id) = cli_args.get("logs") {
        let tail = cli_args
            .get("tail")
            .and_then(|t| t.parse().ok())
            .unwrap_or(100);
        print!("{}", client.logs(id, tail).await?.logs);
    } else if let Some(id) = cli_args.get("undeploy") {
        let stopped = client.undeploy(id).await?;
        println!("{} {}", "Stopped".yellow().bold(), stopped.id);
    }
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            _ => {
                error!("Unable to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
        }
        info!("Ctrl+C received, shutting down...");
    }
}
