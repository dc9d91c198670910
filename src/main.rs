use ai_buddy::{
    chat,
    config::{AppConfig, ServiceSettings},
    constants::{DEFAULT_APP_FILE, DEFAULT_HOST, DEFAULT_PORT},
    serving::ServingClient,
    services::Services,
    web_server,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "AI Buddy vehicle assistant chat server", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve the chat UI and API.
    Run {
        /// App file describing the chatbot
        #[arg(default_value = DEFAULT_APP_FILE)]
        app_file: PathBuf,
        #[arg(long, env = "HOST", default_value = DEFAULT_HOST, help = "Address to listen on.")]
        host: String,
        #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT, help = "Port for the web server.")]
        port: u16,
        #[arg(
            long,
            env = "AI_BUDDY_ASSETS",
            default_value = ".",
            help = "Directory holding templates/ and static/."
        )]
        assets: PathBuf,
    },
    /// Send one message to the model endpoint and print the answer.
    Ask {
        #[arg(long, help = "App file whose chatbot name prefixes the answer.")]
        app: Option<PathBuf>,
        message: String,
    },
    /// Validate an app file and report which backends are configured.
    Check {
        #[arg(default_value = DEFAULT_APP_FILE)]
        app_file: PathBuf,
    },
}

fn load_app(path: &Path) -> Result<AppConfig> {
    AppConfig::load(path).with_context(|| format!("Failed to load app file {}", path.display()))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Ctrl-C received, shutting down...");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            app_file,
            host,
            port,
            assets,
        } => {
            let app = load_app(&app_file)?;
            let settings = ServiceSettings::from_env();
            settings.log_summary();

            let services = Services::connect(app, &settings)
                .await
                .context("Failed to initialize backends")?;
            info!("Starting {} on {}:{}...", services.app.name, host, port);

            web_server::start_web_server(
                &host,
                port,
                Arc::new(services),
                &assets,
                shutdown_signal(),
            )
            .await?;
        }
        Commands::Ask { app, message } => {
            let name = match app {
                Some(path) => Some(load_app(&path)?.name),
                None => None,
            };
            let serving = ServiceSettings::from_env().serving.context(
                "Model serving is not configured: set DATABRICKS_HOST, DATABRICKS_TOKEN and SERVING_ENDPOINT_NAME",
            )?;
            let answer = chat::ask_once(&ServingClient::new(serving), &message)
                .await
                .context("Model endpoint request failed")?;
            match name {
                Some(name) => println!("{}: {}", name, answer),
                None => println!("{}", answer),
            }
        }
        Commands::Check { app_file } => {
            let app = load_app(&app_file)?;
            println!("App file {} is valid", app_file.display());
            println!("  chatbot: {}", app.name);
            println!("  language: {}", app.language);
            if !app.languages.is_empty() {
                println!("  languages: {}", app.languages.join(", "));
            }
            println!("  speech locales: {}", app.speech_locales.join(", "));

            let settings = ServiceSettings::from_env();
            for (backend, enabled) in settings.summary() {
                let state = if enabled { "enabled" } else { "disabled" };
                println!("  {}: {}", backend, state);
            }
            if settings.serving.is_none() {
                anyhow::bail!("Model serving is required to run the chatbot");
            }
        }
    }

    Ok(())
}
