//! CLI entry point for the resumable downloader.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::future::join_all;
use resumable_downloader::{DownloadRequest, Downloader, DownloaderConfig, ProgressNotifyStrategy};
use tracing::{debug, error, info, warn};

mod app_config;
mod cli;
mod progress;

use app_config::Settings;
use cli::Args;
use progress::ProgressBoard;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let file_config = app_config::load_default_file_config()?;
    let settings = Settings::resolve(&args, &file_config);
    debug!(?settings, "effective settings");

    let config = DownloaderConfig::builder(&settings.output_dir)
        .parallelism(settings.parallelism)
        .prefer_breakpoint(settings.prefer_breakpoint)
        .progress_notify_strategy(ProgressNotifyStrategy::when_increased_by(
            settings.progress_step,
        ))
        .build()
        .context("Invalid downloader configuration")?;
    let downloader = Downloader::new(config).context("Failed to start downloader")?;

    if args.clean_temp {
        let deleted = downloader.dir(args.subdir.as_str()).delete_temp_files();
        info!(deleted, "Removed leftover temp files");
    }

    if args.urls.is_empty() {
        if !args.clean_temp {
            info!("No URLs given. Example: resumable-dl https://example.com/file.zip");
        }
        return Ok(ExitCode::SUCCESS);
    }

    info!(
        urls = args.urls.len(),
        dir = %settings.output_dir.display(),
        "Downloader starting"
    );

    let board = ProgressBoard::new(!args.quiet);
    let downloads = args.urls.iter().map(|url| {
        let request = DownloadRequest::builder()
            .connect_timeout(settings.connect_timeout)
            .dirname(args.subdir.as_str())
            .build(url.as_str());
        downloader.download_observed(request, board.track(url))
    });
    let all = join_all(downloads);
    tokio::pin!(all);

    let results = tokio::select! {
        results = &mut all => results,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling downloads");
            for url in &args.urls {
                downloader.cancel_task(url);
            }
            all.await
        }
    };

    let mut failed = 0usize;
    for (url, result) in args.urls.iter().zip(results) {
        match result {
            Ok(file) => println!("{}", file.display()),
            Err(e) => {
                failed += 1;
                error!(url = %url, error = %e, "Download failed");
            }
        }
    }

    info!(
        completed = args.urls.len() - failed,
        failed,
        "Download complete"
    );
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
