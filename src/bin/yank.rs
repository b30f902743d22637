#![forbid(unsafe_code)]

//! `yank`: archive videos from the command line or from a line-oriented
//! request stream on stdin.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use yank_archiver::config::{SettingsOverrides, resolve_settings};
use yank_archiver::logging::{LogFormat, init_logging};
use yank_archiver::queue::{JobError, JobQueue};
use yank_archiver::{AcquireRequest, Acquirer, Acquisition, Notice, Notifier};

#[derive(Debug, Parser)]
#[command(name = "yank", version, about = "Archive videos by URL")]
struct Cli {
    /// Where records and index.json live.
    #[arg(long, global = true)]
    archive_root: Option<PathBuf>,
    /// Parent directory for per-job scratch space.
    #[arg(long, global = true)]
    scratch_root: Option<PathBuf>,
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    /// TOML settings file (defaults to yank.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download, normalize and archive one URL.
    Acquire {
        url: String,
        #[arg(long, default_value = "local")]
        user: String,
    },
    /// Remove an archived URL and its record directory.
    Delete { url: String },
    /// Show a user's records, newest first.
    List {
        #[arg(long, default_value = "local")]
        user: String,
    },
    /// Read `<user> <url>` lines from stdin and process them one at a time.
    Serve,
    /// Verify that yt-dlp, ffmpeg and ffprobe can be executed.
    Check,
}

struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, url: &str, notice: &Notice) {
        match notice {
            Notice::HeavyCompression {
                size_mb,
                ceiling_mb,
            } => println!(
                "{url}: {size_mb:.1} MB is over the {ceiling_mb:.0} MB limit, compressing harder..."
            ),
            Notice::RetryingAfterUpdate { reason } => {
                println!("{url}: {reason}; updating yt-dlp and trying again...")
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogFormat::from_flag(cli.json_logs))?;

    let settings = resolve_settings(SettingsOverrides {
        archive_root: cli.archive_root,
        scratch_root: cli.scratch_root,
        env_path: cli.env_file,
        config_path: cli.config,
        ..SettingsOverrides::default()
    })?;
    let acquirer = Arc::new(Acquirer::new(settings).context("opening the archive")?);

    match cli.command {
        Command::Acquire { url, user } => acquire_one(acquirer, AcquireRequest::new(url, user)).await,
        Command::Delete { url } => {
            if acquirer.delete(&url)? {
                println!("Deleted {url}");
            } else {
                println!("{url} is not archived");
            }
            Ok(())
        }
        Command::List { user } => {
            let records = acquirer.list(&user)?;
            if records.is_empty() {
                println!("No archives for {user}.");
            }
            for record in records {
                println!(
                    "{}  {}  {}",
                    record.metadata.archived_at,
                    record.metadata.title,
                    record.metadata.source_url
                );
            }
            Ok(())
        }
        Command::Serve => serve(acquirer).await,
        Command::Check => {
            acquirer.toolchain().check()?;
            println!("yt-dlp, ffmpeg and ffprobe are available.");
            Ok(())
        }
    }
}

async fn acquire_one(acquirer: Arc<Acquirer>, request: AcquireRequest) -> Result<()> {
    let outcome =
        tokio::task::spawn_blocking(move || acquirer.acquire(&request, &ConsoleNotifier)).await?;
    match outcome {
        Ok(acquisition) => {
            print_acquisition(&acquisition);
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "acquisition failed");
            bail!("{}", err.user_message())
        }
    }
}

fn print_acquisition(acquisition: &Acquisition) {
    let source = if acquisition.cached {
        " (already archived)"
    } else if acquisition.degraded {
        " (original file, compression failed)"
    } else {
        ""
    };
    println!("{} [{}]{source}", acquisition.title, acquisition.service);
    println!("  video: {}", acquisition.record.video.display());
    if let Some(subtitle) = &acquisition.record.subtitle {
        println!("  subtitle: {}", subtitle.display());
    }
}

/// Queue-backed loop: stdin EOF drains the queue, Ctrl+C abandons whatever
/// has not started yet.
async fn serve(acquirer: Arc<Acquirer>) -> Result<()> {
    let (queue, worker) = JobQueue::start(acquirer, Arc::new(ConsoleNotifier));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut waiting = Vec::new();
    let mut interrupted = false;
    info!("reading `<user> <url>` requests from stdin");

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, no longer accepting jobs");
                interrupted = true;
                break;
            }
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else {
            break;
        };
        let Some(request) = parse_request(&line) else {
            if !line.trim().is_empty() {
                eprintln!("expected `<user> <url>`, got {line:?}");
            }
            continue;
        };

        let ticket = queue.submit(request)?;
        println!("{} queued", ticket.id);
        waiting.push(tokio::spawn(async move {
            let id = ticket.id.clone();
            match ticket.wait().await {
                Ok(acquisition) => {
                    println!("{id} done");
                    print_acquisition(&acquisition);
                }
                Err(JobError::Acquire(err)) => println!("{id} failed: {}", err.user_message()),
                Err(err) => println!("{id} failed: {err}"),
            }
        }));
    }

    if !interrupted {
        for handle in waiting.drain(..) {
            let _ = handle.await;
        }
    }
    queue.shutdown();
    worker.await?;
    for handle in waiting {
        let _ = handle.await;
    }
    Ok(())
}

fn parse_request(line: &str) -> Option<AcquireRequest> {
    let mut parts = line.split_whitespace();
    let user = parts.next()?;
    let url = parts.next()?;
    Some(AcquireRequest::new(url, user))
}
