use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tstore::metadata::{FileRecord, FileState};
use tstore::{App, Config};

#[derive(Parser)]
#[command(
    name = "tstore",
    version,
    about = "Chunked file store backed by a messaging remote"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "TSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file and move it into the sync folder
    Upload { path: PathBuf },

    /// Fetch a file back into the sync folder
    Download { name: String },

    /// Remove the local copy, keeping the remote chunks
    Offload { name: String },

    /// Forget a file (remote chunks are kept)
    Delete { name: String },

    /// Set a file's description
    Describe { name: String, text: String },

    /// List tracked files
    List,

    /// Replace the local index with the pinned remote backup
    Restore,

    /// Watch the sync folder and upload new files until interrupted
    #[cfg(feature = "watch")]
    Watch,
}

fn init_logging(cli: &Cli) {
    let default = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn progress_bar(label: &str) -> Result<ProgressBar> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos:>3}%")?
            .progress_chars("=> "),
    );
    bar.set_message(label.to_string());
    Ok(bar)
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping at the next chunk");
            child.cancel();
        }
    });
    token
}

fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn print_records(records: &[FileRecord]) {
    if records.is_empty() {
        println!("No files tracked");
        return;
    }
    for record in records {
        let state = match record.state {
            FileState::Local => record.state.as_str().green(),
            FileState::Cloud => record.state.as_str().cyan(),
        };
        println!(
            "{:<6} {:>10}  {}  {}",
            state,
            format_bytes(record.size),
            record.uploaded_at.format("%Y-%m-%d %H:%M"),
            record.name.bold()
        );
        if !record.description.is_empty() {
            println!("       {}", record.description.dimmed());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::default_path()?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let app = App::open(config).await.context("failed to open store")?;

    match cli.command {
        Commands::Upload { path } => {
            let cancel = cancel_on_interrupt();
            let bar = progress_bar("upload")?;
            let record = app
                .engine()
                .upload(&path, |p| bar.set_position(p as u64), &cancel)
                .await
                .with_context(|| format!("upload {}", path.display()))?;
            bar.finish_and_clear();
            println!(
                "{} {} ({}, {} chunks)",
                "uploaded".green(),
                record.name,
                format_bytes(record.size),
                record.chunk_ids.len()
            );
        }
        Commands::Download { name } => {
            let cancel = cancel_on_interrupt();
            let bar = progress_bar("download")?;
            let record = app
                .engine()
                .download(&name, |p| bar.set_position(p as u64), &cancel)
                .await
                .with_context(|| format!("download {name}"))?;
            bar.finish_and_clear();
            println!(
                "{} {} -> {}",
                "downloaded".green(),
                record.name,
                app.engine().local_path(&record.name)?.display()
            );
        }
        Commands::Offload { name } => {
            app.engine()
                .offload(&name)
                .await
                .with_context(|| format!("offload {name}"))?;
            println!("{} {}", "offloaded".cyan(), name);
        }
        Commands::Delete { name } => {
            app.engine()
                .delete(&name)
                .await
                .with_context(|| format!("delete {name}"))?;
            println!("{} {}", "deleted".red(), name);
        }
        Commands::Describe { name, text } => {
            app.update_description(&name, &text)
                .await
                .with_context(|| format!("describe {name}"))?;
        }
        Commands::List => {
            let records = app.engine().list().await?;
            print_records(&records);
        }
        Commands::Restore => {
            app.bootstrap().await.context("restore from remote")?;
            app.engine()
                .store()
                .persist()
                .await
                .context("save restored index")?;
            let records = app.engine().list().await?;
            print_records(&records);
        }
        #[cfg(feature = "watch")]
        Commands::Watch => {
            app.bootstrap().await.context("restore from remote")?;
            let cancel = CancellationToken::new();
            let task = app.watch(cancel.clone())?;
            println!(
                "Watching {} (Ctrl-C to stop)",
                app.config().sync_folder.display()
            );
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            cancel.cancel();
            if let Err(e) = task.await {
                tracing::error!("Watcher task failed: {}", e);
            }
        }
    }

    app.shutdown().await.context("flush metadata backup")?;
    Ok(())
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
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
