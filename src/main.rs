mod api;
mod cli;
mod config;
mod protocol;
mod terminal;
mod transfer;

use anyhow::{bail, Context, Result};
use api::ApiClient;
use cli::{Cli, Commands, TransferFlags};
use config::{Config, Credentials};
use std::io::IsTerminal;
use std::path::PathBuf;
use terminal::resize::platform_resize_events;
use terminal::{Session, SessionOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use transfer::path::RemotePath;
use transfer::progress::format_bytes;
use transfer::{TransferOptions, TransferResult};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    let mut config = Config::resolve(cli.config.as_deref())?;
    if let Some(url) = &cli.api_url {
        config.api_url = url.clone();
    }
    debug!(api_url = %config.api_url, "configuration loaded");

    let cancel = CancellationToken::new();
    if let Some(timeout) = cli.timeout {
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!(timeout = %humantime::format_duration(timeout), "operation timed out");
            token.cancel();
        });
    }

    match cli.command {
        Commands::Ssh { device } => run_ssh(&config, &device, cli.quiet, &cancel).await,
        Commands::Get {
            source,
            destination,
            flags,
        } => run_get(&config, &source, destination.as_deref(), &flags, cli.quiet, &cancel).await,
        Commands::Put {
            sources,
            destination,
            flags,
        } => run_put(&config, &sources, &destination, &flags, cli.quiet, &cancel).await,
    }
}

/// Logs go to stderr so they never mix with terminal or transfer output
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn api_client(config: &Config) -> Result<ApiClient> {
    let credentials = Credentials::resolve()?;
    Ok(ApiClient::new(
        &config.api_url,
        credentials,
        config.request_timeout(),
    )?)
}

/// Cancel in-flight transfers on Ctrl-C so partial files are flushed
fn cancel_on_interrupt(cancel: &CancellationToken) {
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

async fn run_ssh(
    config: &Config,
    device: &str,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let client = api_client(config)?;

    if !quiet {
        eprintln!("Connecting to {device}...");
    }
    let info = client
        .create_terminal_session(device)
        .await
        .context("failed to create session")?;
    debug!(session_id = %info.session_id, device, "terminal session created");

    let options = SessionOptions {
        verify_payload_digest: config.verify_payload_digest,
        ..SessionOptions::default()
    };
    let connected = Session::connect(
        client.base_url(),
        &info.session_id,
        client.credentials(),
        options,
        cancel,
    )
    .await;

    let outcome = match connected {
        Ok(session) => {
            debug!(session_id = session.session_id(), "terminal transport connected");
            if !quiet {
                eprintln!("Connected. Press Ctrl+D to exit.\n");
            }
            let finished = session
                .run(platform_resize_events())
                .await
                .context("session error");
            debug!(state = ?session.state(), "terminal session finished");
            finished
        }
        Err(e) => Err(anyhow::Error::new(e).context("failed to connect")),
    };

    // The API session is removed whether or not the connection worked
    if let Err(e) = client.close_terminal_session(&info.session_id).await {
        debug!(error = %e, session_id = %info.session_id, "failed to delete terminal session");
    }
    outcome?;

    if !quiet {
        eprintln!("\nConnection closed.");
    }
    Ok(())
}

async fn run_get(
    config: &Config,
    source: &RemotePath,
    destination: Option<&str>,
    flags: &TransferFlags,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let options = flags.options(quiet, std::io::stdout().is_terminal());
    let client = api_client(config)?;
    cancel_on_interrupt(cancel);

    if !quiet && !options.dry_run {
        println!("Downloading from {}...", source.device_id);
    }

    let result = transfer::download(
        &client,
        cancel,
        &source.device_id,
        &source.path,
        destination.unwrap_or(""),
        &options,
    )
    .await
    .context("download failed")?;

    report(&result, "Downloaded", &options);
    Ok(())
}

async fn run_put(
    config: &Config,
    sources: &[PathBuf],
    destination: &RemotePath,
    flags: &TransferFlags,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    for path in sources {
        tokio::fs::metadata(path)
            .await
            .with_context(|| format!("local path {} not found", path.display()))?;
    }
    if sources.len() > 1 && !destination.is_directory() {
        bail!("when uploading multiple files, destination must end with / (directory)");
    }

    let options = flags.options(quiet, std::io::stdout().is_terminal());
    let client = api_client(config)?;
    cancel_on_interrupt(cancel);

    if !quiet && !options.dry_run {
        println!("Uploading to {}...", destination.device_id);
    }

    let result = transfer::upload(
        &client,
        cancel,
        sources,
        &destination.device_id,
        &destination.path,
        &options,
    )
    .await
    .context("upload failed")?;

    report(&result, "Uploaded", &options);
    Ok(())
}

fn report(result: &TransferResult, verb: &str, options: &TransferOptions) {
    if !options.quiet {
        if options.dry_run {
            println!(
                "\nDry run complete. Would transfer {} file(s).",
                result.files_transferred
            );
        } else {
            println!(
                "\n{verb} {} file(s), {} total",
                result.files_transferred,
                format_bytes(result.bytes_transferred)
            );
        }
    }

    if !result.errors.is_empty() {
        eprintln!("\nWarnings ({}):", result.errors.len());
        for e in &result.errors {
            eprintln!("  - {e}");
        }
    }
}
