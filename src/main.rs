//! epub2pdf entry point.

use clap::Parser;
use epub2pdf::{
    config::{Cli, Command, Config},
    convert::{Converter, FileSnapshot, SnapshotSink},
    server,
};
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };

    // Handle command
    match cli.command {
        Some(Command::Init { force }) => cmd_init(force),
        Some(Command::Convert {
            input,
            output,
            snapshot,
        }) => cmd_convert(&config, &input, output, snapshot).await,
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        None => {
            // Default: start server
            cmd_serve(config, None).await
        }
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "epub2pdf=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Write a default config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());
    println!("\nEdit config.toml to configure the converter.");
    println!("Then run: epub2pdf serve");

    Ok(())
}

/// Convert one file from the command line.
async fn cmd_convert(
    config: &Config,
    input: &Path,
    output: Option<PathBuf>,
    snapshot: Option<PathBuf>,
) -> anyhow::Result<()> {
    init_logging();

    let output = output.unwrap_or_else(|| input.with_extension("pdf"));
    let epub = tokio::fs::read(input).await?;

    let converter = Converter::new(&config.convert);
    let sink = snapshot.map(FileSnapshot::new);

    let pdf = tokio::task::spawn_blocking(move || {
        converter.convert(&epub, sink.as_ref().map(|s| s as &dyn SnapshotSink))
    })
    .await??;

    tokio::fs::write(&output, &pdf).await?;
    println!(
        "Converted {} -> {} ({} bytes)",
        input.display(),
        output.display(),
        pdf.len()
    );

    Ok(())
}

/// Run the HTTP server.
async fn cmd_serve(mut config: Config, bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    // Override bind address if specified
    if let Some(addr) = bind {
        config.server.bind = addr;
    }

    init_logging();

    tracing::info!(
        bind = %config.server.bind,
        max_size_mb = config.upload.max_size_mb,
        snapshot = config.debug.snapshot,
        "Starting epub2pdf server"
    );

    let bind = config.server.bind;
    let state = server::AppState::new(config);
    let app = server::create_router(state);

    let listener = TcpListener::bind(bind).await?;
    tracing::info!("Listening on http://{}", bind);

    axum::serve(listener, app).await?;

    Ok(())
}
